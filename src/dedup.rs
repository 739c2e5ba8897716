//! Seen-entry cursor and new-entry selection.
//!
//! The cursor is the per-feed set of entry identifiers that have already
//! been considered. An entry is new iff its identifier is absent from the
//! cursor; feed-native order is irrelevant. Everything here is pure — the
//! storage layer persists cursors, the engine decides when to absorb.
use std::collections::HashSet;

use crate::feed::FetchedEntry;

/// The set of entry identifiers already seen for one feed.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    ids: HashSet<String>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Select the entries of a fetch that are new relative to `cursor`, in
/// chronological ascending order (oldest first) so downstream delivery
/// preserves reading order.
///
/// Undated entries sort after dated ones and keep their fetch order among
/// themselves. Duplicate identifiers within one fetch are reported once.
pub fn select_new(cursor: &Cursor, fetched: &[FetchedEntry]) -> Vec<FetchedEntry> {
    let mut picked: HashSet<&str> = HashSet::new();
    let mut fresh: Vec<(usize, &FetchedEntry)> = fetched
        .iter()
        .enumerate()
        .filter(|(_, entry)| !cursor.contains(&entry.id) && picked.insert(entry.id.as_str()))
        .collect();

    fresh.sort_by_key(|(idx, entry)| (entry.published.unwrap_or(i64::MAX), *idx));
    fresh.into_iter().map(|(_, entry)| entry.clone()).collect()
}

/// The identifiers to keep after absorbing one fetch into a cursor of at
/// most `retention` entries.
///
/// Everything in the current fetch is always kept (the next cycle must be
/// able to recognize every entry the feed still serves); any remaining
/// room holds older identifiers, which the storage layer prunes
/// oldest-first.
pub fn retention_bound(retention: usize, fetch_len: usize) -> usize {
    retention.max(fetch_len)
}
