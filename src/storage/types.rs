use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::util::{validate_url, UrlValidationError};

/// Category assigned to feeds added without one.
pub const DEFAULT_CATEGORY: &str = "General";

/// Pseudo-category selecting every feed.
pub const ALL_CATEGORIES: &str = "all";

/// Per-feed cap on stored items.
pub const MAX_ITEMS_PER_FEED: usize = 100;

/// Maximum number of items returned for display.
pub const DISPLAY_LIMIT: usize = 50;

/// Maximum summary length in characters.
pub const SUMMARY_MAX_CHARS: usize = 200;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by a [`KeyValueStore`](super::KeyValueStore) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    #[error("Storage I/O failed for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The reader state could not be encoded as JSON
    #[error("Failed to serialize reader state: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The stored document exists but is not a valid reader state
    #[error("Stored document under '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    /// The write would exceed the store's size quota
    #[error("Storage quota exceeded: {size} bytes requested, limit is {limit} bytes")]
    QuotaExceeded { size: usize, limit: usize },

    /// Storage keys double as file names and are restricted accordingly
    #[error("Invalid storage key '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidKey(String),
}

/// Rejections from [`Feed::new`].
#[derive(Debug, Error)]
pub enum FeedInputError {
    #[error("Feed name must not be empty")]
    EmptyName,

    #[error("Feed URL must not be empty")]
    EmptyUrl,

    #[error(transparent)]
    Url(#[from] UrlValidationError),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A configured RSS/Atom source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: String,
    pub url: String,
    pub name: String,
    pub category: String,
    /// Unix seconds of the last successful content retrieval
    #[serde(default)]
    pub last_fetched_at: Option<i64>,
}

impl Feed {
    /// Builds a new feed from user input.
    ///
    /// Inputs are trimmed. The URL must pass [`validate_url`], the name must
    /// be non-empty, and an empty category becomes [`DEFAULT_CATEGORY`].
    pub fn new(url: &str, name: &str, category: &str) -> Result<Self, FeedInputError> {
        let url = url.trim();
        let name = name.trim();
        let category = category.trim();

        if url.is_empty() {
            return Err(FeedInputError::EmptyUrl);
        }
        if name.is_empty() {
            return Err(FeedInputError::EmptyName);
        }
        validate_url(url)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            name: name.to_string(),
            category: if category.is_empty() {
                DEFAULT_CATEGORY.to_string()
            } else {
                category.to_string()
            },
            last_fetched_at: None,
        })
    }

    /// True when the feed was never fetched or its last fetch is older than
    /// `max_age_secs` relative to `now`.
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        match self.last_fetched_at {
            None => true,
            Some(at) => now.saturating_sub(at) > max_age_secs,
        }
    }
}

/// A single stored entry belonging to a [`Feed`].
///
/// Only `read` is mutated after creation; a re-fetch never overwrites an
/// existing item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub summary: String,
    /// Dedupe key together with `feed_id`
    pub link: String,
    /// Unix seconds
    pub published_at: i64,
    #[serde(default)]
    pub read: bool,
}

/// A normalized entry produced by the parser, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub title: String,
    pub summary: String,
    pub link: String,
    pub published_at: i64,
}

/// The persisted document: every feed and every stored item.
///
/// `items` is ordered newest-inserted first. That order is what eviction
/// relies on, so it is maintained by insertion position and never sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderState {
    #[serde(default)]
    pub feeds: Vec<Feed>,
    #[serde(default)]
    pub items: VecDeque<Item>,
}
