use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Why a relay payload was rejected as a feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidFeed {
    #[error("Feed content is empty")]
    Empty,
    #[error("Not a valid RSS/Atom feed")]
    NotAFeed,
    #[error("XML parsing error: {0}")]
    Malformed(String),
    #[error("Missing RSS or Atom root element")]
    MissingRoot,
    #[error("Feed contains no items")]
    NoEntries,
    #[error("Unable to read feed entries: {0}")]
    Unparseable(String),
}

/// Feed dialect, identified by the document root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Rss,
    /// RSS 1.0 (`rdf:RDF`)
    Rdf,
    Atom,
}

/// What a successful validation learned about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedShape {
    pub kind: FeedKind,
    /// Number of `item`/`entry` elements anywhere in the document
    pub entries: usize,
}

const PROLOGUES: [&str; 3] = ["<?xml", "<rss", "<feed"];

/// Checks that a relay payload is a usable RSS/Atom document.
///
/// Checks run in order and the first failure wins:
/// 1. the payload is not blank
/// 2. it starts with an XML declaration, `<rss` or `<feed`
/// 3. it is well-formed XML (one root, every element closed, entities valid)
/// 4. the root is `rss`, `RDF` or `feed` (namespace prefixes ignored)
/// 5. at least one `item` or `entry` element exists
pub fn validate_feed_payload(payload: &str) -> Result<FeedShape, InvalidFeed> {
    let trimmed = payload.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(InvalidFeed::Empty);
    }
    if !PROLOGUES.iter().any(|p| trimmed.starts_with(p)) {
        return Err(InvalidFeed::NotAFeed);
    }

    let scan = scan_document(trimmed).map_err(InvalidFeed::Malformed)?;

    let kind = match scan.root.as_deref() {
        Some(b"rss") => FeedKind::Rss,
        Some(b"RDF") => FeedKind::Rdf,
        Some(b"feed") => FeedKind::Atom,
        _ => return Err(InvalidFeed::MissingRoot),
    };

    if scan.entries == 0 {
        return Err(InvalidFeed::NoEntries);
    }

    Ok(FeedShape {
        kind,
        entries: scan.entries,
    })
}

struct DocumentScan {
    root: Option<Vec<u8>>,
    entries: usize,
}

/// Single streaming pass: well-formedness, root name, entry count.
fn scan_document(xml: &str) -> Result<DocumentScan, String> {
    // SEC-002: quick-xml never expands <!ENTITY> declarations, so a DOCTYPE
    // cannot pull in external entities; unknown entities fail unescaping.
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<Vec<u8>> = None;
    let mut depth: usize = 0;
    let mut entries = 0;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("{} at position {}", e, reader.error_position()))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = e.local_name();
                if depth == 0 {
                    if root.is_some() {
                        return Err("multiple root elements".to_string());
                    }
                    root = Some(local.as_ref().to_vec());
                }
                if matches!(local.as_ref(), b"item" | b"entry") {
                    entries += 1;
                }
                for attr in e.attributes() {
                    attr.map_err(|e| e.to_string())?;
                }
                if !is_empty {
                    depth += 1;
                }
            }
            Event::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unexpected closing tag".to_string())?;
            }
            Event::Text(ref t) => {
                if depth == 0 {
                    return Err("text outside the root element".to_string());
                }
                t.unescape().map_err(|e| e.to_string())?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(format!("document ended with {depth} unclosed element(s)"));
    }

    Ok(DocumentScan { root, entries })
}
