//! Serialized access to per-feed subscription state.
//!
//! Subscribe/unsubscribe/config updates arrive from the command layer while
//! the scheduler reads subscriber sets and advances cursors. Everything
//! touching one feed goes through that feed's async mutex, so a concurrent
//! unsubscribe cannot race a mid-cycle delivery and a cursor write cannot
//! race a new subscription's baseline. Unrelated feeds never contend.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::storage::Database;

pub struct Registry {
    db: Database,
    /// One mutex per feed id, created on first use, dropped with the feed.
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    /// Serializes creation of new feed rows (no feed id to lock yet).
    create_lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Acquire the per-feed lock. Holders get exclusive access to the
    /// feed's subscriber set and cursor until the guard drops.
    pub async fn lock_feed(&self, feed_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(feed_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Serialize the check-then-create of a feed row for a URL nobody has
    /// subscribed to yet.
    pub async fn lock_feed_creation(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.create_lock).lock_owned().await
    }

    /// Drop the lock entry of a deleted feed. Safe while a guard is held —
    /// the Arc keeps the mutex alive until the guard drops.
    pub async fn forget_feed(&self, feed_id: i64) {
        self.locks.lock().await.remove(&feed_id);
    }
}
