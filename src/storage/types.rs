use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the engine has locked the database
    #[error("Another instance of herald appears to be running. Please close it and try again.")]
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

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
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
// Data Structures
// ============================================================================

/// A feed row: one per distinct subscribed URL.
///
/// `title`, `subtitle`, and `link` are captured from the feed document at
/// subscribe time. `error`, `error_count`, and `next_retry` track fetch
/// health; a success clears all three.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedRecord {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub subtitle: String,
    pub link: String,
    /// Unix seconds of the last successful scheduled poll.
    pub last_fetched: Option<i64>,
    /// Last fetch failure, NULL after a success.
    pub error: Option<String>,
    /// Consecutive fetch failures.
    pub error_count: i64,
    /// Unix seconds before which the scheduler skips this feed. 0 = no backoff.
    pub next_retry: i64,
}

/// Metadata for a feed row about to be created.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    pub title: String,
    pub subtitle: String,
    pub link: String,
}

/// A subscription row: one (feed, destination) binding with its delivery
/// configuration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub feed_id: i64,
    pub destination: String,
    pub send_notice: bool,
    /// NULL = the system default template.
    pub template: Option<String>,
    /// NULL = match-all. Always compiled successfully when it was stored.
    pub filter: Option<String>,
}

/// One row of a destination's subscription list (joined with the feed).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionListing {
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub send_notice: bool,
    pub filter: Option<String>,
}
