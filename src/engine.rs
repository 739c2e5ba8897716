//! The engine: command surface and the per-feed poll pipeline.
//!
//! Commands arrive already parsed (the chat command layer is external) and
//! operate on the registry synchronously. The scheduler calls
//! [`Engine::poll_once`] each cycle; within a cycle every distinct feed
//! with at least one subscription is fetched exactly once, deduplicated
//! once, and its new entries fanned out to each subscription's filter,
//! template, and destination in turn.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::config::Config;
use crate::dedup::{self, Cursor};
use crate::dispatch::Dispatcher;
use crate::feed::{fetch_feed, FetchError, FetchOptions, FetchedEntry};
use crate::filter::{self, EntryFilter, FilterError};
use crate::registry::Registry;
use crate::storage::{Database, FeedRecord, NewFeed, SubscriptionListing, SubscriptionRecord};
use crate::template::{self, Bindings};

/// Consecutive fetch failures tolerated before backoff starts delaying a
/// feed past the next cycle.
const BACKOFF_THRESHOLD: i64 = 3;
/// Upper bound on fetch backoff.
const MAX_BACKOFF_SECS: i64 = 86_400;

// ============================================================================
// Error Types
// ============================================================================

/// Synchronous, user-visible rejections from the command surface.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The referenced feed or subscription does not exist for this destination.
    #[error("No such feed or subscription for this destination")]
    NotFound,
    /// A supplied filter pattern failed to compile; nothing was stored.
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),
    /// The subscribe URL is not something we would ever fetch.
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    /// The feed could not be fetched or parsed (surfaced from subscribe
    /// and backfill, which fetch synchronously).
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

// ============================================================================
// Results
// ============================================================================

/// Result of a subscribe operation.
#[derive(Debug, Clone)]
pub struct SubscribedFeed {
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    /// True when this subscription was the first for the URL and created
    /// the feed record.
    pub created_feed: bool,
}

/// Counters from one poll cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleSummary {
    /// Feeds that entered the cycle.
    pub feeds: usize,
    /// Successful deliveries across all feeds and subscriptions.
    pub delivered: usize,
    /// Feeds whose pipeline failed (fetch or database).
    pub failed_feeds: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct FeedOutcome {
    delivered: usize,
    fetch_failed: bool,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    registry: Registry,
    client: reqwest::Client,
    dispatcher: Arc<dyn Dispatcher>,
    config: Config,
}

impl Engine {
    pub fn new(
        db: Database,
        dispatcher: Arc<dyn Dispatcher>,
        config: Config,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            registry: Registry::new(db),
            client,
            dispatcher,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        self.registry.database()
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(self.config.fetch_timeout_secs),
        }
    }

    // ========================================================================
    // Command Surface
    // ========================================================================

    /// Subscribe a destination to a feed URL.
    ///
    /// The first subscription to a URL fetches it synchronously — an
    /// unreachable or unparsable feed is rejected here, not discovered
    /// later — and seeds the cursor with everything the feed currently
    /// serves, so history is never dumped into the room. Re-subscribing is
    /// idempotent and keeps the existing configuration.
    pub async fn subscribe(
        &self,
        destination: &str,
        url: &str,
    ) -> Result<SubscribedFeed, CommandError> {
        let parsed = url::Url::parse(url).map_err(|e| CommandError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CommandError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let db = self.registry.database();
        if let Some(feed) = db.feed_by_url(url).await? {
            let _guard = self.registry.lock_feed(feed.id).await;
            db.add_subscription(feed.id, destination).await?;
            tracing::info!(feed = %feed.url, feed_id = feed.id, destination = %destination, "Subscribed");
            return Ok(SubscribedFeed {
                feed_id: feed.id,
                url: feed.url,
                title: feed.title,
                created_feed: false,
            });
        }

        // First subscriber to this URL: prove the feed fetches and parses
        let fetched = fetch_feed(&self.client, url, self.fetch_options()).await?;
        let baseline: Vec<String> = fetched.entries.iter().map(|e| e.id.clone()).collect();
        let record = NewFeed {
            url: url.to_string(),
            title: fetched.title.unwrap_or_else(|| url.to_string()),
            subtitle: fetched.subtitle.unwrap_or_default(),
            link: fetched.link.unwrap_or_default(),
        };

        let _guard = self.registry.lock_feed_creation().await;
        let feed_id = db
            .subscribe_new_feed(&record, destination, &baseline, Utc::now().timestamp())
            .await?;
        tracing::info!(
            feed = %record.url,
            feed_id,
            destination = %destination,
            baseline = baseline.len(),
            "Subscribed (new feed)"
        );
        Ok(SubscribedFeed {
            feed_id,
            url: record.url,
            title: record.title,
            created_feed: true,
        })
    }

    /// Remove a destination's subscription. Removing the last subscription
    /// removes the feed record too — subsequent cycles will not fetch it.
    pub async fn unsubscribe(
        &self,
        destination: &str,
        feed_id: i64,
    ) -> Result<FeedRecord, CommandError> {
        let _guard = self.registry.lock_feed(feed_id).await;
        let db = self.registry.database();
        let feed = db.feed_by_id(feed_id).await?.ok_or(CommandError::NotFound)?;
        if !db.remove_subscription(feed_id, destination).await? {
            return Err(CommandError::NotFound);
        }
        if db.subscriber_count(feed_id).await? == 0 {
            db.delete_feed(feed_id).await?;
            self.registry.forget_feed(feed_id).await;
            tracing::info!(feed = %feed.url, feed_id, "Last subscriber left, feed removed");
        }
        Ok(feed)
    }

    /// A destination's subscriptions with their feed and configuration.
    pub async fn list_subscriptions(
        &self,
        destination: &str,
    ) -> Result<Vec<SubscriptionListing>, CommandError> {
        Ok(self
            .registry
            .database()
            .subscriptions_for_destination(destination)
            .await?)
    }

    /// Toggle whether deliveries to this subscription are sent as notices.
    pub async fn set_notice(
        &self,
        destination: &str,
        feed_id: i64,
        send_notice: bool,
    ) -> Result<(), CommandError> {
        let _guard = self.registry.lock_feed(feed_id).await;
        let updated = self
            .registry
            .database()
            .set_send_notice(feed_id, destination, send_notice)
            .await?;
        if !updated {
            return Err(CommandError::NotFound);
        }
        Ok(())
    }

    /// Set the notification template, or query it by passing `None`.
    /// Returns the template now in effect (stored or system default).
    pub async fn set_template(
        &self,
        destination: &str,
        feed_id: i64,
        template: Option<&str>,
    ) -> Result<String, CommandError> {
        let _guard = self.registry.lock_feed(feed_id).await;
        let db = self.registry.database();
        match template {
            None => {
                let sub = db
                    .subscription(feed_id, destination)
                    .await?
                    .ok_or(CommandError::NotFound)?;
                Ok(sub
                    .template
                    .unwrap_or_else(|| self.config.default_template.clone()))
            }
            Some(new) => {
                if !db.set_template(feed_id, destination, Some(new)).await? {
                    return Err(CommandError::NotFound);
                }
                Ok(new.to_string())
            }
        }
    }

    /// Set the title filter, or clear it by passing `None`. An invalid
    /// pattern is rejected before anything is stored; the previous filter
    /// (or its absence) stays in effect.
    pub async fn set_filter(
        &self,
        destination: &str,
        feed_id: i64,
        pattern: Option<&str>,
    ) -> Result<(), CommandError> {
        let compiled = match pattern {
            Some(p) => Some(EntryFilter::compile(p)?),
            None => None,
        };
        let _guard = self.registry.lock_feed(feed_id).await;
        let stored = self
            .registry
            .database()
            .set_filter(feed_id, destination, compiled.as_ref().map(|f| f.pattern()))
            .await?;
        if !stored {
            return Err(CommandError::NotFound);
        }
        Ok(())
    }

    /// Backfill: deliver everything the feed currently serves to one
    /// subscription, oldest first, bypassing the cursor without touching
    /// it. Other subscribers and the next scheduled cycle are unaffected.
    /// The subscription's own filter and template still apply.
    pub async fn post_all(&self, destination: &str, feed_id: i64) -> Result<usize, CommandError> {
        let db = self.registry.database();
        let feed = db.feed_by_id(feed_id).await?.ok_or(CommandError::NotFound)?;
        let sub = db
            .subscription(feed_id, destination)
            .await?
            .ok_or(CommandError::NotFound)?;

        let fetched = fetch_feed(&self.client, &feed.url, self.fetch_options()).await?;
        // An empty cursor marks every entry as new and sorts them oldest-first
        let entries = dedup::select_new(&Cursor::new(), &fetched.entries);
        let compiled = match sub.filter.as_deref() {
            Some(p) => Some(EntryFilter::compile(p)?),
            None => None,
        };

        let mut delivered = 0;
        for entry in &entries {
            if self.deliver_entry(&feed, &sub, compiled.as_ref(), entry).await {
                delivered += 1;
            }
            self.dispatch_pause().await;
        }
        tracing::info!(feed = %feed.url, destination = %destination, delivered, "Backfill complete");
        Ok(delivered)
    }

    /// Re-point every subscription of a destination to a new identifier
    /// (e.g. a room upgrade). Returns the number of moved subscriptions.
    pub async fn update_destination(&self, old: &str, new: &str) -> Result<u64, CommandError> {
        let moved = self.registry.database().update_destination(old, new).await?;
        tracing::info!(old = %old, new = %new, moved, "Destination updated");
        Ok(moved)
    }

    // ========================================================================
    // Poll Cycle
    // ========================================================================

    /// Run one poll cycle: every feed with at least one subscription and no
    /// active backoff is fetched once and its new entries delivered. Feed
    /// pipelines run concurrently under a bounded pool; one feed's failure
    /// never aborts the others.
    pub async fn poll_once(&self) -> CycleSummary {
        let now = Utc::now().timestamp();
        let feeds = match self.registry.database().polling_feeds(now).await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::warn!(error = %e, "Could not enumerate feeds, skipping cycle");
                return CycleSummary::default();
            }
        };
        if feeds.is_empty() {
            return CycleSummary::default();
        }
        tracing::debug!(feeds = feeds.len(), "Poll cycle started");

        let results: Vec<(String, anyhow::Result<FeedOutcome>)> = stream::iter(feeds)
            .map(|feed| {
                let url = feed.url.clone();
                async move { (url, self.poll_feed(feed).await) }
            })
            .buffer_unordered(self.config.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut summary = CycleSummary {
            feeds: results.len(),
            ..Default::default()
        };
        for (url, outcome) in results {
            match outcome {
                Ok(o) => {
                    summary.delivered += o.delivered;
                    if o.fetch_failed {
                        summary.failed_feeds += 1;
                    }
                }
                Err(e) => {
                    summary.failed_feeds += 1;
                    tracing::warn!(feed = %url, error = %e, "Feed pipeline failed");
                }
            }
        }
        tracing::debug!(
            feeds = summary.feeds,
            delivered = summary.delivered,
            failed = summary.failed_feeds,
            "Poll cycle finished"
        );
        summary
    }

    /// One feed's pipeline: fetch once, deduplicate once, deliver to every
    /// subscription sequentially. Holds the feed's lock throughout so
    /// subscribe/unsubscribe/cursor state cannot shift mid-pipeline.
    async fn poll_feed(&self, feed: FeedRecord) -> anyhow::Result<FeedOutcome> {
        let _guard = self.registry.lock_feed(feed.id).await;
        let db = self.registry.database();

        // The subscriber set may have changed while we waited for the lock
        let subs = db.subscriptions_for_feed(feed.id).await?;
        if subs.is_empty() {
            return Ok(FeedOutcome::default());
        }

        let fetched = match fetch_feed(&self.client, &feed.url, self.fetch_options()).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(feed = %feed.url, error = %err, "Feed fetch failed, skipping delivery this cycle");
                let failures = db.increment_feed_failures(feed.id, &err.to_string()).await?;
                if failures >= BACKOFF_THRESHOLD {
                    let delay = backoff_secs(self.config.poll_interval_secs, failures);
                    db.set_feed_next_retry(feed.id, Utc::now().timestamp() + delay)
                        .await?;
                    tracing::info!(feed = %feed.url, failures, delay_secs = delay, "Fetch backoff engaged");
                }
                return Ok(FeedOutcome {
                    delivered: 0,
                    fetch_failed: true,
                });
            }
        };

        let cursor = Cursor::from_ids(db.cursor_ids(feed.id).await?);
        let fresh = dedup::select_new(&cursor, &fetched.entries);

        // The cursor advances before delivery: a dispatch failure must not
        // cause re-delivery next cycle (at-most-once per entry per
        // subscription).
        let ids: Vec<String> = fetched.entries.iter().map(|e| e.id.clone()).collect();
        let retain = dedup::retention_bound(self.config.cursor_retention, ids.len());
        db.complete_feed_poll(feed.id, &ids, Utc::now().timestamp(), retain)
            .await?;

        if fresh.is_empty() {
            return Ok(FeedOutcome::default());
        }
        tracing::info!(
            feed = %feed.url,
            new = fresh.len(),
            subscribers = subs.len(),
            "Delivering new entries"
        );

        let subs = compiled_subscriptions(subs, &feed.url);
        let mut delivered = 0;
        for entry in &fresh {
            for (sub, compiled) in &subs {
                if self.deliver_entry(&feed, sub, compiled.as_ref(), entry).await {
                    delivered += 1;
                }
                self.dispatch_pause().await;
            }
        }
        Ok(FeedOutcome {
            delivered,
            fetch_failed: false,
        })
    }

    /// Filter, render, and dispatch one entry to one subscription. Returns
    /// whether a delivery was made. Dispatch failures are logged and
    /// swallowed — the entry is gone for this subscription.
    async fn deliver_entry(
        &self,
        feed: &FeedRecord,
        sub: &SubscriptionRecord,
        compiled: Option<&EntryFilter>,
        entry: &FetchedEntry,
    ) -> bool {
        if !filter::includes(compiled, &entry.title) {
            return false;
        }
        let bindings =
            Bindings::for_entry(&feed.url, &feed.title, &feed.subtitle, &feed.link, entry);
        let tpl = sub
            .template
            .as_deref()
            .unwrap_or(&self.config.default_template);
        let text = template::render(tpl, &bindings);
        match self
            .dispatcher
            .deliver(&sub.destination, &text, sub.send_notice)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    destination = %sub.destination,
                    feed = %feed.url,
                    entry = %entry.id,
                    error = %err,
                    "Dispatch failed; entry will not be re-delivered"
                );
                false
            }
        }
    }

    async fn dispatch_pause(&self) {
        if self.config.dispatch_spacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.dispatch_spacing_ms)).await;
        }
    }
}

/// Compile each subscription's stored filter once per batch. A stored
/// pattern that no longer compiles fails closed: the subscription is
/// skipped for this batch with a warning rather than spammed.
fn compiled_subscriptions(
    subs: Vec<SubscriptionRecord>,
    feed_url: &str,
) -> Vec<(SubscriptionRecord, Option<EntryFilter>)> {
    subs.into_iter()
        .filter_map(|sub| match sub.filter.as_deref() {
            None => Some((sub, None)),
            Some(pattern) => match EntryFilter::compile(pattern) {
                Ok(compiled) => Some((sub, Some(compiled))),
                Err(e) => {
                    tracing::warn!(
                        destination = %sub.destination,
                        feed = %feed_url,
                        error = %e,
                        "Stored filter no longer compiles, skipping subscription"
                    );
                    None
                }
            },
        })
        .collect()
}

fn backoff_secs(interval_secs: u64, failures: i64) -> i64 {
    let exp = (failures - (BACKOFF_THRESHOLD - 1)).clamp(1, 16) as u32;
    (interval_secs as i64)
        .saturating_mul(1i64 << exp)
        .min(MAX_BACKOFF_SECS)
}
