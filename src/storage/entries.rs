use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use super::blobs::BlobStore;
use super::jobs::enqueue_on;
use super::schema::Database;
use super::types::{to_millis, DispatchParams, IngestOutcome, JobKind, NewEnclosure, NewEntry};
use crate::util::{random_id, PUBLIC_ID_LEN};

/// Upper bound on Σ(len(title) + len(content)) over one feed's entries.
pub const MAX_FEED_BYTES: usize = 512 * 1024;

/// How long a subscription stays active after its last (re)verification.
pub const SUBSCRIPTION_LEASE_SECS: i64 = 86_400;

/// Index (newest first) of the first entry to evict, if any.
///
/// Entries at `cutoff` and beyond (older) are deleted. The newest entry is
/// never part of the eviction, even when it alone exceeds `cap`.
pub fn trim_cutoff(sizes_newest_first: &[usize], cap: usize) -> Option<usize> {
    let mut total = 0usize;
    for (i, size) in sizes_newest_first.iter().enumerate() {
        total = total.saturating_add(*size);
        if total > cap && i > 0 {
            return Some(i);
        }
    }
    None
}

impl Database {
    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Store one received message as a new entry of `feed_id`.
    ///
    /// Records the sender's icon, persists attachments, inserts and links the
    /// entry, trims the feed back under [`MAX_FEED_BYTES`] and enqueues one
    /// dispatch job per active subscription. Everything commits together.
    ///
    /// If anything fails, the transaction rolls back and blob directories
    /// written so far are removed.
    pub async fn ingest_entry(
        &self,
        feed_id: i64,
        email_icon: Option<&str>,
        entry: &NewEntry,
        enclosures: &[NewEnclosure],
        blobs: &BlobStore,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let mut written: Vec<String> = Vec::with_capacity(enclosures.len());
        let mut tx = self.pool.begin().await?;

        let result = ingest_on(
            &mut *tx,
            feed_id,
            email_icon,
            entry,
            enclosures,
            blobs,
            now,
            &mut written,
        )
        .await;

        let result = match result {
            Ok(outcome) => tx
                .commit()
                .await
                .map(|()| outcome)
                .context("Failed to commit ingestion"),
            Err(e) => {
                drop(tx);
                Err(e)
            }
        };

        if result.is_err() {
            for public_id in &written {
                if let Err(e) = blobs.remove(public_id).await {
                    tracing::warn!(enclosure = %public_id, error = %e, "Failed to remove blob after rollback");
                }
            }
        }

        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_on(
    conn: &mut SqliteConnection,
    feed_id: i64,
    email_icon: Option<&str>,
    entry: &NewEntry,
    enclosures: &[NewEnclosure],
    blobs: &BlobStore,
    now: DateTime<Utc>,
    written: &mut Vec<String>,
) -> Result<IngestOutcome> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE id = ?")
        .bind(feed_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(anyhow!("feed {feed_id} not found"));
    }

    if let Some(icon) = email_icon {
        sqlx::query("UPDATE feeds SET email_icon = ? WHERE id = ?")
            .bind(icon)
            .bind(feed_id)
            .execute(&mut *conn)
            .await?;
    }

    // Enclosures first so a failed blob write aborts before the entry exists
    let mut enclosure_ids = Vec::with_capacity(enclosures.len());
    for enclosure in enclosures {
        let public_id = random_id(PUBLIC_ID_LEN);
        let result = sqlx::query(
            "INSERT INTO feed_enclosures (public_id, content_type, length, name) VALUES (?, ?, ?, ?)",
        )
        .bind(&public_id)
        .bind(&enclosure.content_type)
        .bind(enclosure.content.len() as i64)
        .bind(&enclosure.name)
        .execute(&mut *conn)
        .await?;
        enclosure_ids.push(result.last_insert_rowid());

        written.push(public_id.clone());
        blobs
            .write(&public_id, &enclosure.name, &enclosure.content)
            .await?;
    }

    let entry_public_id = random_id(PUBLIC_ID_LEN);
    let result = sqlx::query(
        r#"
            INSERT INTO feed_entries (public_id, feed_id, created_at, author, title, content)
            VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry_public_id)
    .bind(feed_id)
    .bind(to_millis(now))
    .bind(&entry.author)
    .bind(&entry.title)
    .bind(&entry.content)
    .execute(&mut *conn)
    .await?;
    let entry_id = result.last_insert_rowid();

    for enclosure_id in &enclosure_ids {
        sqlx::query("INSERT INTO feed_enclosure_links (entry_id, enclosure_id) VALUES (?, ?)")
            .bind(entry_id)
            .bind(enclosure_id)
            .execute(&mut *conn)
            .await?;
    }

    let evicted = trim_feed(conn, feed_id).await?;

    let subscription_ids: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM websub_subscriptions WHERE feed_id = ? AND created_at >= ? ORDER BY id",
    )
    .bind(feed_id)
    .bind(to_millis(now - Duration::seconds(SUBSCRIPTION_LEASE_SECS)))
    .fetch_all(&mut *conn)
    .await?;

    for (subscription_id,) in &subscription_ids {
        let params = serde_json::to_string(&DispatchParams {
            feed_id,
            feed_entry_id: entry_id,
            subscription_id: *subscription_id,
        })?;
        enqueue_on(&mut *conn, JobKind::Dispatch, now, &params).await?;
    }

    Ok(IngestOutcome {
        entry_id,
        entry_public_id,
        enclosures: enclosure_ids.len(),
        evicted,
        dispatched: subscription_ids.len(),
    })
}

/// Delete the oldest entries of a feed until it fits [`MAX_FEED_BYTES`].
/// Returns the number of entries deleted.
async fn trim_feed(conn: &mut SqliteConnection, feed_id: i64) -> Result<usize> {
    // Byte lengths, not character counts
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
            SELECT id, LENGTH(CAST(title AS BLOB)) + LENGTH(CAST(content AS BLOB))
            FROM feed_entries
            WHERE feed_id = ?
            ORDER BY id DESC
        "#,
    )
    .bind(feed_id)
    .fetch_all(&mut *conn)
    .await?;

    let sizes: Vec<usize> = rows
        .iter()
        .map(|(_, size)| usize::try_from(*size).unwrap_or(0))
        .collect();

    let Some(cutoff) = trim_cutoff(&sizes, MAX_FEED_BYTES) else {
        return Ok(0);
    };

    let (cutoff_id, _) = rows[cutoff];
    let result = sqlx::query("DELETE FROM feed_entries WHERE feed_id = ? AND id <= ?")
        .bind(feed_id)
        .bind(cutoff_id)
        .execute(&mut *conn)
        .await?;

    tracing::debug!(feed_id, evicted = result.rows_affected(), "Trimmed feed");
    Ok(result.rows_affected() as usize)
}
