use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Shared storage handle.
///
/// The pool holds exactly one connection. Every statement, and therefore
/// every transaction, is serialized through it, which is what makes
/// `dequeue_and_lock` safe under concurrent worker pools without row locks.
/// A multi-writer backend would need `SELECT ... FOR UPDATE` instead.
///
/// Code holding a transaction must issue all of its statements on that
/// transaction; touching `self.pool` while a transaction is open waits for
/// the only connection and never returns.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: wait up to 5 seconds for a competing process
        // before SQLITE_BUSY. foreign_keys drives the feed delete cascade.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        if path != ":memory:" {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Single logical writer. The connection must never be recycled:
        // an in-memory database disappears with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. If any step fails the whole migration rolls back.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                public_id TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                icon TEXT,
                email_icon TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_entries (
                id INTEGER PRIMARY KEY,
                public_id TEXT UNIQUE NOT NULL,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                author TEXT,
                title TEXT NOT NULL,
                content TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_enclosures (
                id INTEGER PRIMARY KEY,
                public_id TEXT UNIQUE NOT NULL,
                content_type TEXT NOT NULL,
                length INTEGER NOT NULL,
                name TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_enclosure_links (
                id INTEGER PRIMARY KEY,
                entry_id INTEGER NOT NULL REFERENCES feed_entries(id) ON DELETE CASCADE,
                enclosure_id INTEGER NOT NULL REFERENCES feed_enclosures(id) ON DELETE CASCADE,
                UNIQUE(entry_id, enclosure_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_visualizations (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS websub_subscriptions (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                callback TEXT NOT NULL,
                secret TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(feed_id, callback)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Append-only job history: rows are never deleted
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS background_jobs (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                start_at INTEGER NOT NULL,
                parameters TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feed_entries_feed ON feed_entries(feed_id, id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_enclosure_links_enclosure ON feed_enclosure_links(enclosure_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_visualizations_feed ON feed_visualizations(feed_id, created_at)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_subscriptions_created ON websub_subscriptions(created_at)",
        )
        .execute(&mut *tx)
        .await?;

        // Covers the dequeue predicate: kind + status, FIFO by id
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON background_jobs(kind, status, id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
