use feed_rs::model::{Entry, FeedType};
use feed_rs::parser;

use super::validate::InvalidFeed;
use crate::storage::ParsedEntry;
use crate::util::clean_summary;

/// Parses a validated RSS/Atom payload into normalized entries.
///
/// - entries without a title are dropped
/// - summary comes from RSS `description` then `content`, or Atom `content`
///   then `summary`; markup is stripped and the text capped at
///   `summary_max_chars` characters
/// - link is the first link's href (RSS `<link>` text or Atom `href`)
/// - publication time is `published`, else `updated`, else `now`
///
/// The returned entries are meant to be consumed once by the merge step.
pub fn parse_feed_payload(
    payload: &str,
    summary_max_chars: usize,
) -> Result<Vec<ParsedEntry>, InvalidFeed> {
    let feed = parser::parse(payload.as_bytes())
        .map_err(|e| InvalidFeed::Unparseable(e.to_string()))?;

    let now = chrono::Utc::now().timestamp();
    let total = feed.entries.len();
    let is_atom = matches!(feed.feed_type, FeedType::Atom);

    let entries: Vec<ParsedEntry> = feed
        .entries
        .into_iter()
        .filter_map(|entry| normalize_entry(entry, is_atom, now, summary_max_chars))
        .collect();

    if entries.len() < total {
        tracing::debug!(
            dropped = total - entries.len(),
            "Entries without a title skipped"
        );
    }

    Ok(entries)
}

fn normalize_entry(
    entry: Entry,
    is_atom: bool,
    now: i64,
    summary_max_chars: usize,
) -> Option<ParsedEntry> {
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())?;

    let summary_text = entry.summary.map(|s| s.content);
    let content_body = entry.content.and_then(|c| c.body);
    let raw_summary = if is_atom {
        non_blank(content_body).or_else(|| non_blank(summary_text))
    } else {
        non_blank(summary_text).or_else(|| non_blank(content_body))
    };

    let link = entry
        .links
        .into_iter()
        .next()
        .map(|l| l.href.trim().to_string())
        .unwrap_or_default();

    let published_at = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp())
        .unwrap_or(now);

    Some(ParsedEntry {
        title,
        summary: raw_summary
            .map(|s| clean_summary(&s, summary_max_chars))
            .unwrap_or_default(),
        link,
        published_at,
    })
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}
