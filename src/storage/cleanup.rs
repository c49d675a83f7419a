use anyhow::Result;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{to_millis, OrphanEnclosure};

impl Database {
    // ========================================================================
    // Retention
    // ========================================================================

    /// Returns the number of visualization rows removed.
    pub async fn delete_visualizations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM feed_visualizations WHERE created_at < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Expire subscriptions whose lease started before `cutoff`.
    pub async fn delete_subscriptions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM websub_subscriptions WHERE created_at < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Enclosures no entry links to anymore.
    pub async fn orphan_enclosures(&self) -> Result<Vec<OrphanEnclosure>> {
        let orphans = sqlx::query_as(
            r#"
                SELECT e.id, e.public_id
                FROM feed_enclosures e
                WHERE NOT EXISTS (
                    SELECT 1 FROM feed_enclosure_links l WHERE l.enclosure_id = e.id
                )
                ORDER BY e.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(orphans)
    }

    pub async fn delete_enclosure(&self, enclosure_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feed_enclosures WHERE id = ?")
            .bind(enclosure_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
