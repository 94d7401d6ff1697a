//! relayfeed: a feed refresh engine.
//!
//! Feeds are fetched through an ordered chain of fallback relays, validated,
//! parsed as RSS/Atom, merged into a de-duplicated per-feed capped item
//! store, and persisted as a single JSON document.
//!
//! [`engine::FeedEngine`] is the entry point; the `relayfeed` binary is a
//! thin command-line front end over it.

pub mod config;
pub mod engine;
pub mod feed;
pub mod storage;
pub mod util;

pub use engine::{AddFeedReport, BatchReport, EngineSettings, FeedEngine, FeedError, FeedOutcome};
