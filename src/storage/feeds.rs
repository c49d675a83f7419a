use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::schema::Database;
use super::types::{to_millis, Enclosure, EntryDocument, Feed, FeedEntry};
use crate::util::{random_id, PUBLIC_ID_LEN};

/// Row type for an enclosure joined with the entry it is linked to
type LinkedEnclosureRow = (i64, i64, String, String, i64, String);

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Create an empty feed with a fresh public id.
    pub async fn create_feed(&self, title: &str) -> Result<Feed> {
        let public_id = random_id(PUBLIC_ID_LEN);
        let result = sqlx::query("INSERT INTO feeds (public_id, title) VALUES (?, ?)")
            .bind(&public_id)
            .bind(title)
            .execute(&self.pool)
            .await?;

        Ok(Feed {
            id: result.last_insert_rowid(),
            public_id,
            title: title.to_string(),
            icon: None,
            email_icon: None,
        })
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let feed = sqlx::query_as(
            "SELECT id, public_id, title, icon, email_icon FROM feeds WHERE id = ?",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_public_id(&self, public_id: &str) -> Result<Option<Feed>> {
        let feed = sqlx::query_as(
            "SELECT id, public_id, title, icon, email_icon FROM feeds WHERE public_id = ?",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Update the admin-controlled fields. Returns false if the feed is gone.
    pub async fn update_feed(&self, feed_id: i64, title: &str, icon: Option<&str>) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET title = ?, icon = ? WHERE id = ?")
            .bind(title)
            .bind(icon)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a feed. Entries, links, subscriptions and visualizations go
    /// with it through `ON DELETE CASCADE`; enclosures are left for the
    /// cleanup sweep.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Entry Reads
    // ========================================================================

    /// All entries of a feed with their enclosures, newest first.
    pub async fn entries_with_enclosures(&self, feed_id: i64) -> Result<Vec<EntryDocument>> {
        let entries: Vec<FeedEntry> = sqlx::query_as(
            r#"
                SELECT id, public_id, feed_id, created_at, author, title, content
                FROM feed_entries
                WHERE feed_id = ?
                ORDER BY id DESC
            "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        let rows: Vec<LinkedEnclosureRow> = sqlx::query_as(
            r#"
                SELECT l.entry_id, e.id, e.public_id, e.content_type, e.length, e.name
                FROM feed_enclosure_links l
                JOIN feed_enclosures e ON e.id = l.enclosure_id
                JOIN feed_entries fe ON fe.id = l.entry_id
                WHERE fe.feed_id = ?
                ORDER BY e.id
            "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_entry: HashMap<i64, Vec<Enclosure>> = HashMap::new();
        for (entry_id, id, public_id, content_type, length, name) in rows {
            by_entry.entry(entry_id).or_default().push(Enclosure {
                id,
                public_id,
                content_type,
                length,
                name,
            });
        }

        Ok(entries
            .into_iter()
            .map(|entry| EntryDocument {
                enclosures: by_entry.remove(&entry.id).unwrap_or_default(),
                entry,
            })
            .collect())
    }

    /// A single entry with its enclosures.
    pub async fn entry_document(&self, entry_id: i64) -> Result<Option<EntryDocument>> {
        let entry: Option<FeedEntry> = sqlx::query_as(
            r#"
                SELECT id, public_id, feed_id, created_at, author, title, content
                FROM feed_entries
                WHERE id = ?
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        let enclosures: Vec<Enclosure> = sqlx::query_as(
            r#"
                SELECT e.id, e.public_id, e.content_type, e.length, e.name
                FROM feed_enclosure_links l
                JOIN feed_enclosures e ON e.id = l.enclosure_id
                WHERE l.entry_id = ?
                ORDER BY e.id
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(EntryDocument { entry, enclosures }))
    }

    /// Entry lookup scoped to its feed, so entry ids cannot be probed across feeds.
    pub async fn entry_by_public_id(
        &self,
        feed_id: i64,
        public_id: &str,
    ) -> Result<Option<FeedEntry>> {
        let entry = sqlx::query_as(
            r#"
                SELECT id, public_id, feed_id, created_at, author, title, content
                FROM feed_entries
                WHERE feed_id = ? AND public_id = ?
            "#,
        )
        .bind(feed_id)
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn enclosure_by_public_id(&self, public_id: &str) -> Result<Option<Enclosure>> {
        let enclosure = sqlx::query_as(
            "SELECT id, public_id, content_type, length, name FROM feed_enclosures WHERE public_id = ?",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enclosure)
    }

    // ========================================================================
    // Visualizations
    // ========================================================================

    /// Feed XML reads recorded at or after `since`.
    pub async fn count_recent_visualizations(
        &self,
        feed_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM feed_visualizations WHERE feed_id = ? AND created_at >= ?",
        )
        .bind(feed_id)
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn record_visualization(&self, feed_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO feed_visualizations (feed_id, created_at) VALUES (?, ?)")
            .bind(feed_id)
            .bind(to_millis(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
