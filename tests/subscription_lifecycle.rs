//! Integration tests for the command surface: subscribe, unsubscribe,
//! configuration updates, and persistence across restarts.
//!
//! Each test gets its own database and mock feed server. The dispatcher
//! records deliveries instead of sending them anywhere.

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use herald::dispatch::{DispatchError, Dispatcher};
use herald::engine::CommandError;
use herald::storage::Database;
use herald::{Config, Engine};

// ============================================================================
// Helpers
// ============================================================================

/// Records every delivery instead of sending it anywhere.
#[derive(Default)]
struct RecordingDispatcher {
    deliveries: Mutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn deliver(
        &self,
        destination: &str,
        text: &str,
        as_notice: bool,
    ) -> Result<(), DispatchError> {
        self.deliveries
            .lock()
            .await
            .push((destination.to_string(), text.to_string(), as_notice));
        Ok(())
    }
}

fn rss_feed(title: &str, entry_ids: &[&str]) -> String {
    let items: String = entry_ids
        .iter()
        .map(|id| {
            format!(
                "<item><guid>{id}</guid><title>Post {id}</title>\
                 <link>https://example.com/{id}</link></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>{title}</title>
    <description>A test feed</description>
    <link>https://example.com/</link>
    {items}
</channel></rss>"#
    )
}

fn test_config() -> Config {
    Config {
        poll_interval_secs: 0,
        max_concurrent_fetches: 4,
        dispatch_spacing_ms: 0,
        fetch_timeout_secs: 5,
        ..Config::default()
    }
}

async fn test_engine() -> (Engine, Arc<RecordingDispatcher>) {
    let db = Database::open(":memory:").await.unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let engine = Engine::new(db, dispatcher.clone(), test_config()).unwrap();
    (engine, dispatcher)
}

async fn mount_feed(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route.to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/xml"),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_creates_feed_and_listing() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("My Blog", &["e1", "e2"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();
    assert!(subscribed.created_feed);
    assert_eq!(subscribed.title, "My Blog");

    let listings = engine.list_subscriptions("!room-a").await.unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].feed_id, subscribed.feed_id);
    assert_eq!(listings[0].title, "My Blog");
    assert!(listings[0].send_notice);
    assert!(listings[0].filter.is_none());
}

#[tokio::test]
async fn test_second_room_reuses_feed_record() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Shared", &["e1"])).await;
    let (engine, _) = test_engine().await;
    let url = format!("{}/blog", server.uri());

    let first = engine.subscribe("!room-a", &url).await.unwrap();
    let second = engine.subscribe("!room-b", &url).await.unwrap();
    assert!(first.created_feed);
    assert!(!second.created_feed);
    assert_eq!(first.feed_id, second.feed_id);
}

#[tokio::test]
async fn test_resubscribe_is_idempotent_and_keeps_config() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;
    let url = format!("{}/blog", server.uri());

    let subscribed = engine.subscribe("!room-a", &url).await.unwrap();
    engine
        .set_filter("!room-a", subscribed.feed_id, Some("(?i)rust"))
        .await
        .unwrap();

    // Subscribing again must not reset the filter
    let again = engine.subscribe("!room-a", &url).await.unwrap();
    assert_eq!(again.feed_id, subscribed.feed_id);

    let listings = engine.list_subscriptions("!room-a").await.unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].filter.as_deref(), Some("(?i)rust"));
}

#[tokio::test]
async fn test_subscribe_rejects_unfetchable_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let (engine, _) = test_engine().await;

    let result = engine
        .subscribe("!room-a", &format!("{}/missing", server.uri()))
        .await;
    assert!(matches!(result.unwrap_err(), CommandError::Fetch(_)));
    assert!(engine.list_subscriptions("!room-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_subscribe_rejects_non_feed_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a feed</html>"))
        .mount(&server)
        .await;
    let (engine, _) = test_engine().await;

    let result = engine
        .subscribe("!room-a", &format!("{}/page", server.uri()))
        .await;
    assert!(matches!(result.unwrap_err(), CommandError::Fetch(_)));
}

#[tokio::test]
async fn test_subscribe_rejects_bad_scheme() {
    let (engine, _) = test_engine().await;

    let result = engine.subscribe("!room-a", "ftp://example.com/feed").await;
    assert!(matches!(result.unwrap_err(), CommandError::InvalidUrl(_)));

    let result = engine.subscribe("!room-a", "not a url").await;
    assert!(matches!(result.unwrap_err(), CommandError::InvalidUrl(_)));
}

// ============================================================================
// Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_unknown_feed_is_not_found() {
    let (engine, _) = test_engine().await;
    let result = engine.unsubscribe("!room-a", 42).await;
    assert!(matches!(result.unwrap_err(), CommandError::NotFound));
}

#[tokio::test]
async fn test_unsubscribe_wrong_room_is_not_found() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();
    let result = engine.unsubscribe("!room-b", subscribed.feed_id).await;
    assert!(matches!(result.unwrap_err(), CommandError::NotFound));
}

#[tokio::test]
async fn test_unsubscribe_last_room_removes_feed() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();
    let removed = engine.unsubscribe("!room-a", subscribed.feed_id).await.unwrap();
    assert_eq!(removed.id, subscribed.feed_id);

    assert!(engine.database().all_feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_keeps_feed_for_remaining_rooms() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;
    let url = format!("{}/blog", server.uri());

    let subscribed = engine.subscribe("!room-a", &url).await.unwrap();
    engine.subscribe("!room-b", &url).await.unwrap();

    engine.unsubscribe("!room-a", subscribed.feed_id).await.unwrap();

    let feeds = engine.database().all_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    let listings = engine.list_subscriptions("!room-b").await.unwrap();
    assert_eq!(listings.len(), 1);
}

// ============================================================================
// Configuration updates
// ============================================================================

#[tokio::test]
async fn test_set_notice_round_trip() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();

    engine.set_notice("!room-a", subscribed.feed_id, false).await.unwrap();
    let listings = engine.list_subscriptions("!room-a").await.unwrap();
    assert!(!listings[0].send_notice);

    let result = engine.set_notice("!room-b", subscribed.feed_id, false).await;
    assert!(matches!(result.unwrap_err(), CommandError::NotFound));
}

#[tokio::test]
async fn test_template_query_returns_default_until_set() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();

    let current = engine
        .set_template("!room-a", subscribed.feed_id, None)
        .await
        .unwrap();
    assert_eq!(current, "New post in $feed_title: [$title]($link)");

    let updated = engine
        .set_template("!room-a", subscribed.feed_id, Some("$title ($date)"))
        .await
        .unwrap();
    assert_eq!(updated, "$title ($date)");

    let queried = engine
        .set_template("!room-a", subscribed.feed_id, None)
        .await
        .unwrap();
    assert_eq!(queried, "$title ($date)");
}

#[tokio::test]
async fn test_invalid_filter_rejected_and_state_unchanged() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();
    engine
        .set_filter("!room-a", subscribed.feed_id, Some("good"))
        .await
        .unwrap();

    // Unbalanced paren must be rejected without touching the stored filter
    let result = engine
        .set_filter("!room-a", subscribed.feed_id, Some("("))
        .await;
    assert!(matches!(result.unwrap_err(), CommandError::InvalidFilter(_)));

    let listings = engine.list_subscriptions("!room-a").await.unwrap();
    assert_eq!(listings[0].filter.as_deref(), Some("good"));
}

#[tokio::test]
async fn test_clear_filter() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Blog", &["e1"])).await;
    let (engine, _) = test_engine().await;

    let subscribed = engine
        .subscribe("!room-a", &format!("{}/blog", server.uri()))
        .await
        .unwrap();
    engine
        .set_filter("!room-a", subscribed.feed_id, Some("only this"))
        .await
        .unwrap();
    engine.set_filter("!room-a", subscribed.feed_id, None).await.unwrap();

    let listings = engine.list_subscriptions("!room-a").await.unwrap();
    assert!(listings[0].filter.is_none());
}

#[tokio::test]
async fn test_set_filter_on_unknown_subscription_is_not_found() {
    let (engine, _) = test_engine().await;
    let result = engine.set_filter("!room-a", 7, Some("x")).await;
    assert!(matches!(result.unwrap_err(), CommandError::NotFound));
}

// ============================================================================
// Destination updates
// ============================================================================

#[tokio::test]
async fn test_update_destination_moves_subscriptions() {
    let server = MockServer::start().await;
    mount_feed(&server, "/one", rss_feed("One", &["a"])).await;
    mount_feed(&server, "/two", rss_feed("Two", &["b"])).await;
    let (engine, _) = test_engine().await;

    engine
        .subscribe("!old-room", &format!("{}/one", server.uri()))
        .await
        .unwrap();
    engine
        .subscribe("!old-room", &format!("{}/two", server.uri()))
        .await
        .unwrap();

    let moved = engine.update_destination("!old-room", "!new-room").await.unwrap();
    assert_eq!(moved, 2);
    assert!(engine.list_subscriptions("!old-room").await.unwrap().is_empty());
    assert_eq!(engine.list_subscriptions("!new-room").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_update_destination_collision_keeps_existing() {
    let server = MockServer::start().await;
    mount_feed(&server, "/one", rss_feed("One", &["a"])).await;
    let (engine, _) = test_engine().await;
    let url = format!("{}/one", server.uri());

    let subscribed = engine.subscribe("!old-room", &url).await.unwrap();
    engine.subscribe("!new-room", &url).await.unwrap();
    engine
        .set_filter("!new-room", subscribed.feed_id, Some("keep-me"))
        .await
        .unwrap();

    engine.update_destination("!old-room", "!new-room").await.unwrap();

    let listings = engine.list_subscriptions("!new-room").await.unwrap();
    assert_eq!(listings.len(), 1);
    // The pre-existing subscription's configuration survived the collision
    assert_eq!(listings[0].filter.as_deref(), Some("keep-me"));
    assert!(engine.list_subscriptions("!old-room").await.unwrap().is_empty());
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let server = MockServer::start().await;
    mount_feed(&server, "/blog", rss_feed("Durable", &["e1", "e2"])).await;

    let db_path = std::env::temp_dir().join(format!(
        "herald_test_reopen_{}.db",
        std::process::id()
    ));
    let db_path_str = db_path.to_str().unwrap().to_string();
    std::fs::remove_file(&db_path).ok();

    let feed_id = {
        let db = Database::open(&db_path_str).await.unwrap();
        let engine = Engine::new(db, Arc::new(RecordingDispatcher::default()), test_config()).unwrap();
        let subscribed = engine
            .subscribe("!room-a", &format!("{}/blog", server.uri()))
            .await
            .unwrap();
        engine
            .set_filter("!room-a", subscribed.feed_id, Some("(?i)keep"))
            .await
            .unwrap();
        subscribed.feed_id
    };

    // A fresh process: reopen the same file and find everything in place
    let db = Database::open(&db_path_str).await.unwrap();
    let engine = Engine::new(db, Arc::new(RecordingDispatcher::default()), test_config()).unwrap();

    let listings = engine.list_subscriptions("!room-a").await.unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].feed_id, feed_id);
    assert_eq!(listings[0].filter.as_deref(), Some("(?i)keep"));

    // The baseline cursor survived too: nothing is re-delivered
    assert_eq!(engine.database().cursor_len(feed_id).await.unwrap(), 2);

    std::fs::remove_file(&db_path).ok();
}
