use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;

/// Batch size for seen-entry inserts, kept under SQLite's bind limit.
const INSERT_CHUNK: usize = 300;

impl Database {
    // ========================================================================
    // Cursor Operations
    // ========================================================================

    /// Every seen entry identifier for a feed.
    pub async fn cursor_ids(&self, feed_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT entry_id FROM seen_entries WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Number of cursor rows for a feed.
    pub async fn cursor_len(&self, feed_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Complete a successful scheduled poll in one transaction: clear the
    /// feed's error state, stamp `last_fetched`, absorb this fetch's entry
    /// identifiers into the cursor, and prune it to `retain` rows.
    ///
    /// Identifiers already present get their `seen_at` refreshed, so
    /// entries the feed still serves are never the ones pruned. Apart from
    /// the subscribe-time baseline this is the only place a cursor grows,
    /// and it runs before delivery, which is what makes delivery
    /// at-most-once per entry per subscription.
    pub async fn complete_feed_poll(
        &self,
        feed_id: i64,
        entry_ids: &[String],
        now: i64,
        retain: usize,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE feeds SET last_fetched = ?, error = NULL, error_count = 0, next_retry = 0
             WHERE id = ?",
        )
        .bind(now)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        insert_seen(&mut tx, feed_id, entry_ids, now).await?;

        sqlx::query(
            r#"
            DELETE FROM seen_entries
            WHERE feed_id = ? AND rowid NOT IN (
                SELECT rowid FROM seen_entries
                WHERE feed_id = ?
                ORDER BY seen_at DESC, rowid DESC
                LIMIT ?
            )
        "#,
        )
        .bind(feed_id)
        .bind(feed_id)
        .bind(retain as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Upsert seen identifiers for a feed, refreshing `seen_at` on conflict.
/// Shared by the baseline seed at subscribe time and by scheduled polls.
pub(crate) async fn insert_seen(
    conn: &mut SqliteConnection,
    feed_id: i64,
    entry_ids: &[String],
    now: i64,
) -> Result<()> {
    for chunk in entry_ids.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO seen_entries (feed_id, entry_id, seen_at) ");

        builder.push_values(chunk, |mut b, entry_id| {
            b.push_bind(feed_id).push_bind(entry_id).push_bind(now);
        });

        builder.push(" ON CONFLICT(feed_id, entry_id) DO UPDATE SET seen_at = excluded.seen_at");

        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}
