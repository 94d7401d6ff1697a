//! Getting feed content from the network into normalized entries.
//!
//! - [`relay`]: ordered fallback relays behind the [`FetchStrategy`] trait
//! - [`validate`]: cheap structural checks on a relay payload
//! - [`parser`]: RSS/Atom parsing via `feed-rs`
//! - [`opml`]: subscription list import/export
//!
//! A refresh runs `relay → validate → parse` here and hands the entries to
//! the storage layer for merging.

mod opml;
mod parser;
mod relay;
mod validate;

pub use opml::{export_opml, export_to_file, parse_opml, parse_opml_content, OpmlError, OpmlFeed};
pub use parser::parse_feed_payload;
pub use relay::{
    build_client, FetchStrategy, HttpRelay, RelayChain, RelayExhausted, RelayFormat, TransportError,
    DEFAULT_RELAY_TIMEOUT,
};
pub use validate::{validate_feed_payload, FeedKind, FeedShape, InvalidFeed};
