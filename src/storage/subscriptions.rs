use anyhow::Result;
use sqlx::sqlite::SqliteConnection;

use super::cursor::insert_seen;
use super::schema::Database;
use super::types::{NewFeed, SubscriptionListing, SubscriptionRecord};

impl Database {
    // ========================================================================
    // Subscription Operations
    // ========================================================================

    /// Create a feed row, its baseline cursor, and the first subscription in
    /// one transaction.
    ///
    /// Seeding the cursor with every entry the feed currently serves is what
    /// makes the first scheduled poll deliver nothing: the subscriber's
    /// baseline is "now", not the feed's whole history.
    ///
    /// Returns the new feed id. If the URL gained a feed row concurrently,
    /// the existing row is reused and the subscription attached to it.
    pub async fn subscribe_new_feed(
        &self,
        feed: &NewFeed,
        destination: &str,
        baseline_ids: &[String],
        now: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            r#"
            INSERT INTO feeds (url, title, subtitle, link)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
        "#,
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.subtitle)
        .bind(&feed.link)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let (feed_id,): (i64,) = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
            .bind(&feed.url)
            .fetch_one(&mut *tx)
            .await?;

        // A pre-existing row already has a cursor; only a fresh one gets
        // the baseline.
        if created {
            insert_seen(&mut tx, feed_id, baseline_ids, now).await?;
        }

        upsert_subscription(&mut tx, feed_id, destination).await?;

        tx.commit().await?;
        Ok(feed_id)
    }

    /// Attach a destination to an existing feed. Idempotent: re-subscribing
    /// keeps the existing configuration untouched.
    pub async fn add_subscription(&self, feed_id: i64, destination: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_subscription(&mut tx, feed_id, destination).await?;
        tx.commit().await?;
        Ok(())
    }

    /// One subscription, if present.
    pub async fn subscription(
        &self,
        feed_id: i64,
        destination: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        let sub = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT feed_id, destination, send_notice, template, filter
            FROM subscriptions
            WHERE feed_id = ? AND destination = ?
        "#,
        )
        .bind(feed_id)
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// Every subscription of one feed, in stable destination order.
    pub async fn subscriptions_for_feed(&self, feed_id: i64) -> Result<Vec<SubscriptionRecord>> {
        let subs = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT feed_id, destination, send_notice, template, filter
            FROM subscriptions
            WHERE feed_id = ?
            ORDER BY destination
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// A destination's subscriptions joined with their feeds.
    pub async fn subscriptions_for_destination(
        &self,
        destination: &str,
    ) -> Result<Vec<SubscriptionListing>> {
        let listings = sqlx::query_as::<_, SubscriptionListing>(
            r#"
            SELECT s.feed_id, f.url, f.title, s.send_notice, s.filter
            FROM subscriptions s
            JOIN feeds f ON f.id = s.feed_id
            WHERE s.destination = ?
            ORDER BY s.feed_id
        "#,
        )
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;

        Ok(listings)
    }

    /// Remove a subscription. Returns false when it did not exist.
    pub async fn remove_subscription(&self, feed_id: i64, destination: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE feed_id = ? AND destination = ?")
            .bind(feed_id)
            .bind(destination)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remaining subscriptions on a feed.
    pub async fn subscriber_count(&self, feed_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Set the notice-mode flag. Returns false when the subscription does
    /// not exist.
    pub async fn set_send_notice(
        &self,
        feed_id: i64,
        destination: &str,
        send_notice: bool,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE subscriptions SET send_notice = ? WHERE feed_id = ? AND destination = ?")
                .bind(send_notice)
                .bind(feed_id)
                .bind(destination)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set or clear (NULL = default) the notification template. Returns
    /// false when the subscription does not exist.
    pub async fn set_template(
        &self,
        feed_id: i64,
        destination: &str,
        template: Option<&str>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE subscriptions SET template = ? WHERE feed_id = ? AND destination = ?")
                .bind(template)
                .bind(feed_id)
                .bind(destination)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set or clear (NULL = match-all) the title filter pattern. The caller
    /// must have compiled the pattern already; this layer stores it blindly.
    /// Returns false when the subscription does not exist.
    pub async fn set_filter(
        &self,
        feed_id: i64,
        destination: &str,
        filter: Option<&str>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE subscriptions SET filter = ? WHERE feed_id = ? AND destination = ?")
                .bind(filter)
                .bind(feed_id)
                .bind(destination)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-point every subscription of `old` to `new` (destination renames,
    /// e.g. a room upgrade). Collisions keep `new`'s existing subscription;
    /// the displaced `old` rows are dropped. Returns the number of moved
    /// subscriptions.
    pub async fn update_destination(&self, old: &str, new: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query("UPDATE OR IGNORE subscriptions SET destination = ? WHERE destination = ?")
            .bind(new)
            .bind(old)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Rows that collided with an existing (feed, new) subscription
        sqlx::query("DELETE FROM subscriptions WHERE destination = ?")
            .bind(old)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(moved)
    }
}

async fn upsert_subscription(
    conn: &mut SqliteConnection,
    feed_id: i64,
    destination: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (feed_id, destination)
        VALUES (?, ?)
        ON CONFLICT(feed_id, destination) DO NOTHING
    "#,
    )
    .bind(feed_id)
    .bind(destination)
    .execute(conn)
    .await?;
    Ok(())
}
