//! The feed refresh engine: owns the reader state, drives
//! `relay → validate → parse → merge → persist`, and answers the queries a
//! front end needs.
//!
//! State lives behind a `tokio::sync::RwLock` that is never held across a
//! network call, so listing and marking items read keep working while a
//! batch refresh is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::feed::{
    parse_feed_payload, validate_feed_payload, InvalidFeed, OpmlFeed, RelayChain, RelayExhausted,
};
use crate::storage::{
    Feed, FeedInputError, Item, KeyValueStore, ReaderState, StorageError, DISPLAY_LIMIT,
    MAX_ITEMS_PER_FEED, SUMMARY_MAX_CHARS,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum FeedError {
    /// Every relay failed; carries the attempt count and the last error
    #[error(transparent)]
    FetchExhausted(#[from] RelayExhausted),

    /// A relay answered, but not with a usable feed document
    #[error("Invalid feed: {0}")]
    InvalidFeedFormat(#[from] InvalidFeed),

    #[error("No items found in feed")]
    EmptyFeed,

    #[error("Failed to save reader state: {0}")]
    StorageWrite(#[from] StorageError),

    /// User input rejected before the feed was added
    #[error("Invalid feed input: {0}")]
    InvalidFeed(#[from] FeedInputError),

    #[error("Feed already exists: {0}")]
    DuplicateFeed(String),

    #[error("No feed with id {0}")]
    UnknownFeed(String),
}

// ============================================================================
// Reports
// ============================================================================

/// Result of refreshing one feed inside a batch.
#[derive(Debug)]
pub struct FeedOutcome {
    pub feed_id: String,
    pub feed_name: String,
    pub items_added: usize,
    pub error: Option<FeedError>,
}

impl FeedOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a completed batch refresh.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One entry per feed, in feed-list order
    pub outcomes: Vec<FeedOutcome>,
    /// Set when the final save failed; the in-memory state is still current
    pub storage_error: Option<StorageError>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn items_added(&self) -> usize {
        self.outcomes.iter().map(|o| o.items_added).sum()
    }

    /// One-line summary for a status bar, `None` when nothing was refreshed.
    pub fn summary(&self) -> Option<String> {
        let (ok, failed) = (self.succeeded(), self.failed());
        if ok > 0 {
            let mut msg = format!("Refreshed {ok} feed{} successfully", plural(ok));
            if failed > 0 {
                msg.push_str(&format!(" ({failed} failed)"));
            }
            Some(msg)
        } else if failed > 0 {
            Some(format!("Failed to refresh {failed} feed{}", plural(failed)))
        } else {
            None
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Result of [`FeedEngine::add_feed`]: the feed is added even when its
/// first fetch fails.
#[derive(Debug)]
pub struct AddFeedReport {
    pub feed: Feed,
    pub initial_refresh: Result<usize, FeedError>,
}

/// Result of [`FeedEngine::import_feeds`].
#[derive(Debug, Default)]
pub struct ImportReport {
    pub added: Vec<Feed>,
    /// Duplicates and entries rejected by [`Feed::new`]
    pub skipped: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Limits applied while merging and listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_items_per_feed: usize,
    pub display_limit: usize,
    pub summary_max_chars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_items_per_feed: MAX_ITEMS_PER_FEED,
            display_limit: DISPLAY_LIMIT,
            summary_max_chars: SUMMARY_MAX_CHARS,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_items_per_feed: config.max_items_per_feed,
            display_limit: config.display_limit,
            summary_max_chars: config.summary_max_chars,
        }
    }
}

pub struct FeedEngine {
    state: RwLock<ReaderState>,
    relays: RelayChain,
    store: Arc<dyn KeyValueStore>,
    store_key: String,
    settings: EngineSettings,
    refreshing: AtomicBool,
    // Orders store writes so an older snapshot never lands after a newer one
    writing: Mutex<()>,
}

/// Holds the refreshing flag; clears it on drop, including on panic or
/// when the refresh future is dropped mid-flight.
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FeedEngine {
    /// Loads the state stored under `store_key`.
    ///
    /// A corrupt document is logged and replaced by an empty state; any
    /// other storage failure is returned.
    pub fn open(
        relays: RelayChain,
        store: Arc<dyn KeyValueStore>,
        store_key: impl Into<String>,
        settings: EngineSettings,
    ) -> Result<Self, StorageError> {
        let store_key = store_key.into();
        let state = match ReaderState::load(store.as_ref(), &store_key) {
            Ok(state) => state,
            Err(e @ StorageError::Corrupt { .. }) => {
                tracing::warn!(error = %e, "Discarding unreadable reader state");
                ReaderState::default()
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            feeds = state.feeds.len(),
            items = state.items.len(),
            relays = ?relays.names(),
            "Feed engine ready"
        );

        Ok(Self {
            state: RwLock::new(state),
            relays,
            store,
            store_key,
            settings,
            refreshing: AtomicBool::new(false),
            writing: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Fetches, validates, parses and merges one feed, then persists.
    ///
    /// Returns the number of newly stored items. A failed save is logged,
    /// not returned; the merge already happened in memory.
    pub async fn refresh_feed(&self, feed_id: &str) -> Result<usize, FeedError> {
        let url = self
            .state
            .read()
            .await
            .feed(feed_id)
            .map(|f| f.url.clone())
            .ok_or_else(|| FeedError::UnknownFeed(feed_id.to_string()))?;

        let added = self.fetch_and_merge(feed_id, &url).await?;
        self.persist_logged().await;
        Ok(added)
    }

    /// Refreshes every feed in list order, one at a time.
    ///
    /// Returns `None` without doing anything if a batch is already running.
    pub async fn refresh_all(&self) -> Option<BatchReport> {
        let _guard = RefreshGuard::acquire(&self.refreshing)?;
        let targets = self.state.read().await.feeds.clone();
        Some(self.run_batch(targets).await)
    }

    /// Like [`refresh_all`](Self::refresh_all), restricted to feeds never
    /// fetched or last fetched more than `max_age` ago.
    pub async fn refresh_stale(&self, max_age: Duration) -> Option<BatchReport> {
        let _guard = RefreshGuard::acquire(&self.refreshing)?;
        let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let targets: Vec<Feed> = {
            let state = self.state.read().await;
            state
                .stale_feed_ids(Utc::now().timestamp(), max_age_secs)
                .iter()
                .filter_map(|id| state.feed(id).cloned())
                .collect()
        };
        Some(self.run_batch(targets).await)
    }

    async fn run_batch(&self, targets: Vec<Feed>) -> BatchReport {
        if targets.is_empty() {
            tracing::debug!("No feeds to refresh");
            return BatchReport::default();
        }

        tracing::info!(feeds = targets.len(), "Refreshing feeds");
        let mut outcomes = Vec::with_capacity(targets.len());

        for feed in targets {
            let result = self.fetch_and_merge(&feed.id, &feed.url).await;
            let (items_added, error) = match result {
                Ok(added) => (added, None),
                Err(e) => {
                    tracing::warn!(feed = %feed.url, name = %feed.name, error = %e, "Feed refresh failed");
                    (0, Some(e))
                }
            };
            outcomes.push(FeedOutcome {
                feed_id: feed.id,
                feed_name: feed.name,
                items_added,
                error,
            });
        }

        let storage_error = self.persist_inner().await.err();
        if let Some(e) = &storage_error {
            tracing::warn!(error = %e, "Failed to save reader state after refresh");
        }

        let report = BatchReport {
            outcomes,
            storage_error,
        };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            new_items = report.items_added(),
            "Refresh complete"
        );
        report
    }

    async fn fetch_and_merge(&self, feed_id: &str, url: &str) -> Result<usize, FeedError> {
        let body = self.relays.fetch_remote_content(url).await?;
        let shape = validate_feed_payload(&body)?;
        let entries = parse_feed_payload(&body, self.settings.summary_max_chars)?;
        if entries.is_empty() {
            return Err(FeedError::EmptyFeed);
        }

        let mut state = self.state.write().await;
        // The feed may have been deleted while its content was in flight
        if !state.touch_feed(feed_id, Utc::now().timestamp()) {
            return Err(FeedError::UnknownFeed(feed_id.to_string()));
        }
        let added = state.merge_items(feed_id, entries, self.settings.max_items_per_feed);

        tracing::debug!(feed = %url, kind = ?shape.kind, new_items = added, "Feed merged");
        Ok(added)
    }

    // ========================================================================
    // Feed management
    // ========================================================================

    /// Validates and adds a feed, persists it, then fetches it once.
    ///
    /// Invalid input and duplicate URLs are rejected before anything is
    /// stored. The feed stays added when the first fetch fails; that failure
    /// is reported in [`AddFeedReport::initial_refresh`].
    pub async fn add_feed(
        &self,
        url: &str,
        name: &str,
        category: &str,
    ) -> Result<AddFeedReport, FeedError> {
        let feed = Feed::new(url, name, category)?;
        {
            let mut state = self.state.write().await;
            if state.has_feed_url(&feed.url) {
                return Err(FeedError::DuplicateFeed(feed.url));
            }
            state.insert_feed(feed.clone());
        }
        tracing::info!(feed = %feed.url, name = %feed.name, category = %feed.category, "Feed added");
        self.persist_logged().await;

        let initial_refresh = self.refresh_feed(&feed.id).await;
        if let Err(e) = &initial_refresh {
            tracing::warn!(feed = %feed.url, error = %e, "Initial fetch of new feed failed");
        }

        Ok(AddFeedReport {
            feed,
            initial_refresh,
        })
    }

    /// Removes a feed and all of its items.
    pub async fn delete_feed(&self, feed_id: &str) -> Option<Feed> {
        let removed = self.state.write().await.remove_feed(feed_id)?;
        tracing::info!(feed = %removed.url, name = %removed.name, "Feed deleted");
        self.persist_logged().await;
        Some(removed)
    }

    /// Adds subscriptions read from OPML without fetching them.
    pub async fn import_feeds(&self, imported: Vec<OpmlFeed>) -> ImportReport {
        let mut report = ImportReport::default();
        {
            let mut state = self.state.write().await;
            for entry in imported {
                let category = entry.category.as_deref().unwrap_or_default();
                let feed = match Feed::new(&entry.url, &entry.name, category) {
                    Ok(feed) => feed,
                    Err(e) => {
                        tracing::warn!(url = %entry.url, error = %e, "Skipping imported feed");
                        report.skipped += 1;
                        continue;
                    }
                };
                if state.has_feed_url(&feed.url) {
                    report.skipped += 1;
                    continue;
                }
                state.insert_feed(feed.clone());
                report.added.push(feed);
            }
        }

        if !report.added.is_empty() {
            self.persist_logged().await;
        }
        tracing::info!(
            added = report.added.len(),
            skipped = report.skipped,
            "OPML import finished"
        );
        report
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn feeds(&self) -> Vec<Feed> {
        self.state.read().await.feeds.clone()
    }

    pub async fn feed_categories(&self) -> Vec<String> {
        self.state.read().await.categories()
    }

    /// Newest-first items for a category (or `"all"`), capped to the display
    /// limit.
    pub async fn items_for_category(&self, category: &str) -> Vec<Item> {
        self.state
            .read()
            .await
            .items_for_category(category, self.settings.display_limit)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn item(&self, item_id: &str) -> Option<Item> {
        self.state.read().await.item(item_id).cloned()
    }

    pub async fn unread_count(&self) -> usize {
        self.state.read().await.unread_count()
    }

    // ========================================================================
    // Read state
    // ========================================================================

    /// Returns `false` when no item has this id.
    pub async fn mark_item_read(&self, item_id: &str) -> bool {
        let found = self.state.write().await.mark_item_read(item_id);
        if found {
            self.persist_logged().await;
        }
        found
    }

    /// Flips the read flag, returning the new value.
    pub async fn toggle_item_read(&self, item_id: &str) -> Option<bool> {
        let read = self.state.write().await.toggle_item_read(item_id)?;
        self.persist_logged().await;
        Some(read)
    }

    /// Marks every item read; returns how many changed.
    pub async fn mark_all_read(&self) -> usize {
        let changed = self.state.write().await.mark_all_read();
        if changed > 0 {
            self.persist_logged().await;
        }
        changed
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Writes the current state to the store.
    pub async fn persist(&self) -> Result<(), FeedError> {
        self.persist_inner().await.map_err(FeedError::from)
    }

    /// Snapshots the state under the read lock, then writes it on the
    /// blocking pool with the lock released.
    async fn persist_inner(&self) -> Result<(), StorageError> {
        let _writing = self.writing.lock().await;
        let document = self.state.read().await.to_document()?;

        let store = Arc::clone(&self.store);
        let key = self.store_key.clone();
        tokio::task::spawn_blocking(move || store.save(&key, &document))
            .await
            .map_err(|e| StorageError::Io {
                key: self.store_key.clone(),
                source: std::io::Error::other(e),
            })?
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist_inner().await {
            tracing::warn!(key = %self.store_key, error = %e, "Failed to save reader state");
        }
    }
}
