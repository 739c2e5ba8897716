use anyhow::Result;

use super::schema::Database;
use super::types::FeedRecord;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Look up a feed by its canonical URL.
    pub async fn feed_by_url(&self, url: &str) -> Result<Option<FeedRecord>> {
        let feed = sqlx::query_as::<_, FeedRecord>(
            r#"
            SELECT id, url, title, subtitle, link, last_fetched, error, error_count, next_retry
            FROM feeds
            WHERE url = ?
        "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Look up a feed by id.
    pub async fn feed_by_id(&self, feed_id: i64) -> Result<Option<FeedRecord>> {
        let feed = sqlx::query_as::<_, FeedRecord>(
            r#"
            SELECT id, url, title, subtitle, link, last_fetched, error, error_count, next_retry
            FROM feeds
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Feeds the scheduler should poll now: at least one subscription, and
    /// any fetch backoff expired.
    pub async fn polling_feeds(&self, now: i64) -> Result<Vec<FeedRecord>> {
        let feeds = sqlx::query_as::<_, FeedRecord>(
            r#"
            SELECT DISTINCT f.id, f.url, f.title, f.subtitle, f.link,
                   f.last_fetched, f.error, f.error_count, f.next_retry
            FROM feeds f
            JOIN subscriptions s ON s.feed_id = f.id
            WHERE f.next_retry <= ?
            ORDER BY f.id
        "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    /// All feeds regardless of subscriber or backoff state.
    pub async fn all_feeds(&self) -> Result<Vec<FeedRecord>> {
        let feeds = sqlx::query_as::<_, FeedRecord>(
            r#"
            SELECT id, url, title, subtitle, link, last_fetched, error, error_count, next_retry
            FROM feeds
            ORDER BY id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    /// Record a fetch failure: store the error and bump the consecutive
    /// failure count. Returns the new count.
    pub async fn increment_feed_failures(&self, feed_id: i64, error: &str) -> Result<i64> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE feeds SET error = ?, error_count = error_count + 1
             WHERE id = ? RETURNING error_count",
        )
        .bind(error)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Set the earliest time the scheduler may poll this feed again.
    pub async fn set_feed_next_retry(&self, feed_id: i64, next_retry: i64) -> Result<()> {
        sqlx::query("UPDATE feeds SET next_retry = ? WHERE id = ?")
            .bind(next_retry)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a feed row. Subscriptions and seen entries cascade.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
