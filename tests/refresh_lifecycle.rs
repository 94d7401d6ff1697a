//! End-to-end refresh tests: relays are wiremock servers, state lives in a
//! memory or JSON file store, and everything goes through `FeedEngine`.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relayfeed::config::RelayConfig;
use relayfeed::engine::{EngineSettings, FeedEngine, FeedError};
use relayfeed::feed::{InvalidFeed, RelayChain, RelayFormat};
use relayfeed::storage::{JsonFileStore, KeyValueStore, MemoryStore, ReaderState};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "rss_reader_data";
const BLOG: &str = "https://blog.example.com/rss";
const NEWS: &str = "https://news.example.com/atom";
const DOWN: &str = "https://down.example.com/rss";

fn rss_with(count: usize, prefix: &str) -> String {
    let items: String = (0..count)
        .map(|i| {
            format!(
                "<item><title>{prefix} {i}</title><link>https://{prefix}.example.com/{i}</link>\
                 <description>&lt;p&gt;Body {i}&lt;/p&gt;</description>\
                 <pubDate>Mon, 01 Jan 2024 00:{:02}:00 GMT</pubDate></item>",
                i % 60
            )
        })
        .collect();
    format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{prefix}</title>{items}</channel></rss>"#)
}

fn atom_with(count: usize) -> String {
    let entries: String = (0..count)
        .map(|i| {
            format!(
                r#"<entry><title>Atom {i}</title><id>urn:{i}</id><link href="https://news.example.com/{i}"/><updated>2024-02-01T00:00:00Z</updated><summary>S {i}</summary></entry>"#
            )
        })
        .collect();
    format!(r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>News</title><id>urn:news</id><updated>2024-02-01T00:00:00Z</updated>{entries}</feed>"#)
}

fn relay_config(server: &MockServer, name: &str, format: RelayFormat) -> RelayConfig {
    RelayConfig {
        name: name.to_string(),
        endpoint: Some(format!("{}/{name}?url=", server.uri())),
        format,
    }
}

fn engine_with(relays: &[RelayConfig], store: Arc<dyn KeyValueStore>) -> FeedEngine {
    let chain = RelayChain::from_config(relays, &reqwest::Client::new(), Duration::from_secs(5));
    FeedEngine::open(chain, store, KEY, EngineSettings::default()).unwrap()
}

async fn serve(server: &MockServer, relay: &str, feed_url: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!("/{relay}")))
        .and(query_param("url", feed_url))
        .respond_with(response)
        .mount(server)
        .await;
}

// ============================================================================
// Dedupe & eviction
// ============================================================================

#[tokio::test]
async fn test_unchanged_feed_adds_nothing_on_second_refresh() {
    let server = MockServer::start().await;
    serve(
        &server,
        "raw",
        BLOG,
        ResponseTemplate::new(200).set_body_string(rss_with(5, "blog")),
    )
    .await;
    let engine = engine_with(
        &[relay_config(&server, "raw", RelayFormat::Raw)],
        Arc::new(MemoryStore::new()),
    );

    let report = engine.add_feed(BLOG, "Blog", "").await.unwrap();
    assert_eq!(report.initial_refresh.unwrap(), 5);

    let feed_id = report.feed.id;
    assert_eq!(engine.refresh_feed(&feed_id).await.unwrap(), 0);

    let items = engine.items_for_category("all").await;
    assert_eq!(items.len(), 5);
    assert!(items.iter().all(|i| i.summary.starts_with("Body")));
    let feed = engine.feeds().await.remove(0);
    assert!(feed.last_fetched_at.is_some());
}

#[tokio::test]
async fn test_refresh_keeps_read_flags() {
    let server = MockServer::start().await;
    serve(
        &server,
        "raw",
        BLOG,
        ResponseTemplate::new(200).set_body_string(rss_with(3, "blog")),
    )
    .await;
    let engine = engine_with(
        &[relay_config(&server, "raw", RelayFormat::Raw)],
        Arc::new(MemoryStore::new()),
    );
    let feed_id = engine.add_feed(BLOG, "Blog", "").await.unwrap().feed.id;

    let first = engine.items_for_category("all").await.remove(0);
    assert!(engine.mark_item_read(&first.id).await);

    engine.refresh_feed(&feed_id).await.unwrap();
    let again = engine.item(&first.id).await.unwrap();
    assert!(again.read);
    assert_eq!(engine.unread_count().await, 2);
}

#[tokio::test]
async fn test_oversized_feed_is_capped_oldest_first() {
    let server = MockServer::start().await;
    serve(
        &server,
        "raw",
        BLOG,
        ResponseTemplate::new(200).set_body_string(rss_with(105, "blog")),
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(&[relay_config(&server, "raw", RelayFormat::Raw)], store.clone());

    engine.add_feed(BLOG, "Blog", "").await.unwrap();

    let state = ReaderState::load(store.as_ref(), KEY).unwrap();
    assert_eq!(state.items.len(), 100);
    // Entries are inserted in document order, so the first five are the
    // oldest inserted and the ones evicted.
    for i in 0..5 {
        let link = format!("https://blog.example.com/{i}");
        assert!(state.items.iter().all(|item| item.link != link), "{link} kept");
    }
    assert!(state
        .items
        .iter()
        .any(|item| item.link == "https://blog.example.com/104"));
}

// ============================================================================
// Relay fallback
// ============================================================================

#[tokio::test]
async fn test_batch_falls_back_across_relays() {
    let server = MockServer::start().await;
    serve(&server, "first", BLOG, ResponseTemplate::new(500)).await;
    serve(
        &server,
        "second",
        BLOG,
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" })),
    )
    .await;
    serve(
        &server,
        "third",
        BLOG,
        ResponseTemplate::new(200).set_body_string(rss_with(2, "blog")),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/fourth"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_with(9, "other")))
        .expect(0)
        .mount(&server)
        .await;

    let engine = engine_with(
        &[
            relay_config(&server, "first", RelayFormat::Envelope),
            relay_config(&server, "second", RelayFormat::Envelope),
            relay_config(&server, "third", RelayFormat::Raw),
            relay_config(&server, "fourth", RelayFormat::Raw),
        ],
        Arc::new(MemoryStore::new()),
    );

    let report = engine.add_feed(BLOG, "Blog", "").await.unwrap();
    assert_eq!(report.initial_refresh.unwrap(), 2);
}

#[tokio::test]
async fn test_one_dead_feed_does_not_stop_the_batch() {
    let server = MockServer::start().await;
    for relay in ["a", "b"] {
        serve(&server, relay, DOWN, ResponseTemplate::new(503)).await;
    }
    serve(
        &server,
        "a",
        BLOG,
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "contents": rss_with(3, "blog") })),
    )
    .await;
    serve(
        &server,
        "a",
        NEWS,
        ResponseTemplate::new(200).set_body_string(atom_with(4)),
    )
    .await;

    let engine = engine_with(
        &[
            relay_config(&server, "a", RelayFormat::Auto),
            relay_config(&server, "b", RelayFormat::Auto),
        ],
        Arc::new(MemoryStore::new()),
    );
    engine.add_feed(BLOG, "Blog", "Tech").await.unwrap();
    let down = engine.add_feed(DOWN, "Down", "Tech").await.unwrap();
    assert!(down.initial_refresh.is_err());
    engine.add_feed(NEWS, "News", "World").await.unwrap();

    let report = engine.refresh_all().await.unwrap();
    let names: Vec<&str> = report.outcomes.iter().map(|o| o.feed_name.as_str()).collect();
    assert_eq!(names, vec!["Blog", "Down", "News"]);
    assert!(report.outcomes[0].is_success());
    assert!(report.outcomes[2].is_success());
    match &report.outcomes[1].error {
        Some(FeedError::FetchExhausted(e)) => {
            assert_eq!(e.attempts, 2);
            assert!(e.to_string().contains("503"));
        }
        other => panic!("expected FetchExhausted, got {other:?}"),
    }
    assert_eq!(
        report.summary().as_deref(),
        Some("Refreshed 2 feeds successfully (1 failed)")
    );
    assert!(report.storage_error.is_none());

    assert_eq!(
        engine.feed_categories().await,
        vec!["all".to_string(), "Tech".to_string(), "World".to_string()]
    );
    assert_eq!(engine.items_for_category("World").await.len(), 4);
    assert_eq!(engine.items_for_category("Tech").await.len(), 3);
}

#[tokio::test]
async fn test_non_feed_document_is_invalid_format() {
    let server = MockServer::start().await;
    serve(
        &server,
        "raw",
        BLOG,
        ResponseTemplate::new(200)
            .set_body_string(r#"<?xml version="1.0"?><catalog><item>x</item></catalog>"#),
    )
    .await;
    let engine = engine_with(
        &[relay_config(&server, "raw", RelayFormat::Raw)],
        Arc::new(MemoryStore::new()),
    );

    let report = engine.add_feed(BLOG, "Blog", "").await.unwrap();
    assert!(matches!(
        report.initial_refresh,
        Err(FeedError::InvalidFeedFormat(InvalidFeed::MissingRoot))
    ));
    // The feed is kept despite the failed first fetch
    assert_eq!(engine.feeds().await.len(), 1);
    assert_eq!(engine.feeds().await[0].last_fetched_at, None);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_state_survives_reopen_from_disk() {
    let dir = std::env::temp_dir().join(format!("relayfeed_lifecycle_{}", uuid::Uuid::new_v4()));
    let server = MockServer::start().await;
    serve(
        &server,
        "raw",
        BLOG,
        ResponseTemplate::new(200).set_body_string(rss_with(4, "blog")),
    )
    .await;
    let relays = [relay_config(&server, "raw", RelayFormat::Raw)];

    let read_id = {
        let store = Arc::new(JsonFileStore::open(&dir).unwrap());
        let engine = engine_with(&relays, store);
        engine.add_feed(BLOG, "Blog", "Reading").await.unwrap();
        let item = engine.items_for_category("Reading").await.remove(0);
        engine.mark_item_read(&item.id).await;
        item.id
    };

    assert!(dir.join(format!("{KEY}.json")).exists());

    let engine = engine_with(&relays, Arc::new(JsonFileStore::open(&dir).unwrap()));
    assert_eq!(engine.feeds().await.len(), 1);
    assert_eq!(engine.items_for_category("all").await.len(), 4);
    assert!(engine.item(&read_id).await.unwrap().read);
    assert_eq!(engine.unread_count().await, 3);

    std::fs::remove_dir_all(&dir).ok();
}
