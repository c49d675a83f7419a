use anyhow::Result;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use super::schema::Database;
use super::types::{to_millis, Subscription, SubscriptionRow};

impl Database {
    // ========================================================================
    // WebSub Subscription Operations
    // ========================================================================

    /// Create the `(feed, callback)` subscription or renew its lease.
    ///
    /// A renewal replaces the secret and resets `created_at` to `now`.
    pub async fn upsert_subscription(
        &self,
        feed_id: i64,
        callback: &str,
        secret: Option<&SecretString>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
                INSERT INTO websub_subscriptions (feed_id, callback, secret, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(feed_id, callback) DO UPDATE SET
                    secret = excluded.secret,
                    created_at = excluded.created_at
            "#,
        )
        .bind(feed_id)
        .bind(callback)
        .bind(secret.map(|s| s.expose_secret()))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_subscription(&self, subscription_id: i64) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, feed_id, callback, secret, created_at FROM websub_subscriptions WHERE id = ?",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRow::into_subscription))
    }

    /// Subscriptions of a feed whose lease started at or after `since`.
    pub async fn recent_subscriptions(
        &self,
        feed_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
                SELECT id, feed_id, callback, secret, created_at
                FROM websub_subscriptions
                WHERE feed_id = ? AND created_at >= ?
                ORDER BY id
            "#,
        )
        .bind(feed_id)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect())
    }

    pub async fn delete_subscription(&self, subscription_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM websub_subscriptions WHERE id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove the `(feed, callback)` subscription regardless of its age.
    /// Returns false when there was nothing to remove.
    pub async fn delete_subscription_by_callback(
        &self,
        feed_id: i64,
        callback: &str,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM websub_subscriptions WHERE feed_id = ? AND callback = ?")
                .bind(feed_id)
                .bind(callback)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use chrono::{Duration, Utc};
    use secrecy::{ExposeSecret, SecretString};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_then_renews() {
        let db = test_db().await;
        let feed = db.create_feed("Subscribed").await.unwrap();
        let then = Utc::now() - Duration::hours(30);
        let now = Utc::now();

        db.upsert_subscription(feed.id, "https://cb.example.org/", None, then)
            .await
            .unwrap();
        assert!(db
            .recent_subscriptions(feed.id, now - Duration::hours(24))
            .await
            .unwrap()
            .is_empty());

        let secret = SecretString::from("s3cret".to_string());
        db.upsert_subscription(feed.id, "https://cb.example.org/", Some(&secret), now)
            .await
            .unwrap();

        let subs = db
            .recent_subscriptions(feed.id, now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].callback, "https://cb.example.org/");
        assert_eq!(
            subs[0].secret.as_ref().map(|s| s.expose_secret()),
            Some("s3cret")
        );
    }

    #[tokio::test]
    async fn test_delete_by_callback_ignores_age() {
        let db = test_db().await;
        let feed = db.create_feed("Old subscriber").await.unwrap();
        db.upsert_subscription(
            feed.id,
            "https://cb.example.org/",
            None,
            Utc::now() - Duration::days(3),
        )
        .await
        .unwrap();

        assert!(db
            .delete_subscription_by_callback(feed.id, "https://cb.example.org/")
            .await
            .unwrap());
        assert!(!db
            .delete_subscription_by_callback(feed.id, "https://cb.example.org/")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_get_and_delete_by_id() {
        let db = test_db().await;
        let feed = db.create_feed("By id").await.unwrap();
        db.upsert_subscription(feed.id, "https://cb.example.org/", None, Utc::now())
            .await
            .unwrap();
        let id = db
            .recent_subscriptions(feed.id, Utc::now() - Duration::hours(1))
            .await
            .unwrap()[0]
            .id;

        assert!(db.get_subscription(id).await.unwrap().is_some());
        assert!(db.delete_subscription(id).await.unwrap());
        assert!(db.get_subscription(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_delete_cascades_to_subscriptions() {
        let db = test_db().await;
        let feed = db.create_feed("Cascade").await.unwrap();
        db.upsert_subscription(feed.id, "https://cb.example.org/", None, Utc::now())
            .await
            .unwrap();

        db.delete_feed(feed.id).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM websub_subscriptions")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
