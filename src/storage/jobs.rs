use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{to_millis, ClaimedJob, Job, JobKind, JobRow, JobStatus};

impl Database {
    // ========================================================================
    // Job Queue Operations
    // ========================================================================

    /// Insert a pending job that becomes eligible at `start_at`.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        start_at: DateTime<Utc>,
        parameters: &str,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        enqueue_on(&mut *conn, kind, start_at, parameters).await
    }

    /// Claim the oldest eligible pending job of `kind`.
    ///
    /// The select and the status flip run in one transaction. Because the
    /// pool has a single connection, no other caller can interleave between
    /// them, so each pending job is handed out at most once.
    pub async fn dequeue_and_lock(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(i64, String)> = sqlx::query_as(
            r#"
                SELECT id, parameters
                FROM background_jobs
                WHERE kind = ? AND status = 'pending' AND start_at <= ?
                ORDER BY id
                LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(to_millis(now))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, parameters)) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE background_jobs SET status = 'running' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(job_id = id, kind = %kind, "Claimed job");
        Ok(Some(ClaimedJob {
            id,
            kind,
            parameters,
        }))
    }

    /// Move a job to its terminal state.
    pub async fn finish(&self, id: i64, success: bool) -> Result<()> {
        let status = if success {
            JobStatus::Done
        } else {
            JobStatus::Failed
        };

        let result = sqlx::query("UPDATE background_jobs SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job {id} not found"));
        }

        tracing::debug!(job_id = id, status = status.as_str(), "Finished job");
        Ok(())
    }

    /// Look up a job by id.
    pub async fn job(&self, id: i64) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, kind, status, start_at, parameters FROM background_jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_job().map_err(|e| anyhow!(e)))
            .transpose()
    }

    /// Count jobs of `kind` in `status`.
    pub async fn count_jobs(&self, kind: JobKind, status: JobStatus) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM background_jobs WHERE kind = ? AND status = ?")
                .bind(kind.as_str())
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Insert a pending job on an existing connection or open transaction.
pub(crate) async fn enqueue_on(
    conn: &mut SqliteConnection,
    kind: JobKind,
    start_at: DateTime<Utc>,
    parameters: &str,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO background_jobs (kind, status, start_at, parameters) VALUES (?, 'pending', ?, ?)",
    )
    .bind(kind.as_str())
    .bind(to_millis(start_at))
    .bind(parameters)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}
