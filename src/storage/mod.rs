//! SQLite persistence: feeds, subscriptions, and seen-entry cursors.
//!
//! The schema survives process restarts; the registry reloads from here
//! before the scheduler's first cycle. Split by concern: [`schema`] owns
//! the pool and migrations, the sibling modules each own one table's
//! operations.

mod cursor;
mod feeds;
mod schema;
mod subscriptions;
mod types;

pub use schema::Database;
pub use types::{DatabaseError, FeedRecord, NewFeed, SubscriptionListing, SubscriptionRecord};
