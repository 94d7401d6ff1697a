//! Utility functions shared by the engine and the CLI.
//!
//! - **URL validation**: feed sources must be public HTTP(S) hosts; item
//!   links must be HTTP(S) before they are opened
//! - **Text processing**: markup stripping for summaries, char-safe
//!   truncation, relative dates, terminal control stripping
//!
//! # Examples
//!
//! ```
//! use relayfeed::util::{clean_summary, validate_url};
//!
//! let url = validate_url("https://example.com/feed.xml").unwrap();
//! assert_eq!(url.host_str(), Some("example.com"));
//!
//! assert_eq!(clean_summary("<p>Hi there</p>", 2), "Hi");
//! ```

mod text;
mod url_validator;

pub use text::{
    clean_summary, fit_width, format_relative, strip_control_chars, strip_markup, truncate_chars,
};
pub use url_validator::{validate_link, validate_url, UrlValidationError};
