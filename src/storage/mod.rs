//! Persistent reader state: feeds, items, and the key-value stores that
//! hold them as a single JSON document.

mod feeds;
mod items;
mod store;
mod types;

pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use types::{
    Feed, FeedInputError, Item, ParsedEntry, ReaderState, StorageError, ALL_CATEGORIES,
    DEFAULT_CATEGORY, DISPLAY_LIMIT, MAX_ITEMS_PER_FEED, SUMMARY_MAX_CHARS,
};
