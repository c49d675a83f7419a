use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with operator-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another letterbox process appears to be using the database. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamps are stored as UTC unix milliseconds so that range predicates
/// compare numerically.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Renders a stored timestamp as RFC 3339 with millisecond precision.
pub fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Background Jobs
// ============================================================================

/// Kind of background job. Each kind is served by its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Verify,
    Dispatch,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Verify => "verify",
            JobKind::Dispatch => "dispatch",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify" => Ok(JobKind::Verify),
            "dispatch" => Ok(JobKind::Dispatch),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a job row. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A job claimed by `dequeue_and_lock`, now in `running` state.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub kind: JobKind,
    pub parameters: String,
}

/// Full job row, used for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub start_at: i64,
    pub parameters: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub start_at: i64,
    pub parameters: String,
}

impl JobRow {
    pub(crate) fn into_job(self) -> Result<Job, String> {
        Ok(Job {
            id: self.id,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            start_at: self.start_at,
            parameters: self.parameters,
        })
    }
}

/// Parameters of a `dispatch` job, stored as JSON in `background_jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchParams {
    #[serde(rename = "feedId")]
    pub feed_id: i64,
    #[serde(rename = "feedEntryId")]
    pub feed_entry_id: i64,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: i64,
}

// ============================================================================
// Feeds, Entries, Enclosures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub public_id: String,
    pub title: String,
    pub icon: Option<String>,
    pub email_icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedEntry {
    pub id: i64,
    pub public_id: String,
    pub feed_id: i64,
    pub created_at: i64,
    pub author: Option<String>,
    pub title: String,
    pub content: String,
}

impl FeedEntry {
    /// Bytes this entry counts against the per-feed storage cap.
    pub fn stored_size(&self) -> usize {
        self.title.len() + self.content.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Enclosure {
    pub id: i64,
    pub public_id: String,
    pub content_type: String,
    pub length: i64,
    pub name: String,
}

/// An entry together with the enclosures linked to it.
#[derive(Debug, Clone)]
pub struct EntryDocument {
    pub entry: FeedEntry,
    pub enclosures: Vec<Enclosure>,
}

/// Entry fields supplied by the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub author: String,
    pub title: String,
    pub content: String,
}

/// An attachment to persist alongside a new entry.
#[derive(Debug, Clone)]
pub struct NewEnclosure {
    pub content_type: String,
    /// Already sanitized to a filesystem-safe name
    pub name: String,
    pub content: Vec<u8>,
}

/// Result of a committed ingestion transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub entry_id: i64,
    pub entry_public_id: String,
    pub enclosures: usize,
    /// Entries deleted by trimming
    pub evicted: usize,
    /// Dispatch jobs enqueued for active subscribers
    pub dispatched: usize,
}

// ============================================================================
// WebSub Subscriptions
// ============================================================================

/// WebSub subscription. `created_at` doubles as the lease start.
///
/// The optional secret is held as a [`SecretString`] so it never appears in
/// Debug output or logs.
#[derive(Debug)]
pub struct Subscription {
    pub id: i64,
    pub feed_id: i64,
    pub callback: String,
    pub secret: Option<SecretString>,
    pub created_at: i64,
}

#[derive(sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: i64,
    pub feed_id: i64,
    pub callback: String,
    pub secret: Option<String>,
    pub created_at: i64,
}

impl SubscriptionRow {
    pub(crate) fn into_subscription(self) -> Subscription {
        Subscription {
            id: self.id,
            feed_id: self.feed_id,
            callback: self.callback,
            secret: self.secret.map(SecretString::from),
            created_at: self.created_at,
        }
    }
}

// ============================================================================
// Cleanup
// ============================================================================

/// Enclosure with no remaining entry link.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrphanEnclosure {
    pub id: i64,
    pub public_id: String,
}
