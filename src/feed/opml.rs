use std::collections::BTreeMap;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::storage::Feed;
use crate::util::validate_url;

/// SEC-003: Maximum nesting depth for `<outline>` elements.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to write OPML: {0}")]
    Write(String),

    #[error("OPML file I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A subscription read from an OPML `<outline xmlUrl=...>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// `title`, else `text`, else the feed URL.
    pub name: String,
    pub url: String,
    /// Title of the nearest enclosing folder outline, if any.
    pub category: Option<String>,
}

/// Reads and parses an OPML file.
pub async fn parse_opml(path: &Path) -> Result<Vec<OpmlFeed>, OpmlError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| OpmlError::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse_opml_content(&content)
}

/// Extracts subscriptions from OPML text.
///
/// Folder outlines (no `xmlUrl`) contribute their title as the category of
/// the feeds nested inside them. Feeds whose URL fails
/// [`validate_url`] are skipped with a warning.
pub fn parse_opml_content(content: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    // SEC-002: quick-xml only resolves the five predefined entities, so
    // DOCTYPE-declared entities fail to unescape instead of expanding.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    // One slot per open <outline>; folders carry their title.
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?;

        match event {
            Event::Start(ref e) if e.local_name().as_ref() == b"outline" => {
                if folders.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(e, &reader)?;
                if outline.xml_url.is_some() {
                    push_feed(&mut feeds, outline, &folders);
                    folders.push(None);
                } else {
                    folders.push(outline.label);
                }
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"outline" => {
                let outline = read_outline(e, &reader)?;
                if outline.xml_url.is_some() {
                    push_feed(&mut feeds, outline, &folders);
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"outline" => {
                folders.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(feeds)
}

struct Outline {
    xml_url: Option<String>,
    label: Option<String>,
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || {
            attr.decode_and_unescape_value(reader.decoder())
                .map(|v| v.trim().to_string())
                .map_err(|err| OpmlError::XmlParse(err.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value()?),
            b"title" => title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    let label = title.filter(|t| !t.is_empty()).or(text.filter(|t| !t.is_empty()));
    Ok(Outline {
        xml_url: xml_url.filter(|u| !u.is_empty()),
        label,
    })
}

fn push_feed(feeds: &mut Vec<OpmlFeed>, outline: Outline, folders: &[Option<String>]) {
    let Some(url) = outline.xml_url else {
        return;
    };
    if let Err(e) = validate_url(&url) {
        tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL in OPML");
        return;
    }
    let category = folders.iter().rev().flatten().next().cloned();
    feeds.push(OpmlFeed {
        name: outline.label.unwrap_or_else(|| url.clone()),
        url,
        category,
    });
}

/// Renders feeds as an OPML 2.0 document, one folder outline per category.
pub fn export_opml(feeds: &[Feed]) -> Result<String, OpmlError> {
    let mut by_category: BTreeMap<&str, Vec<&Feed>> = BTreeMap::new();
    for feed in feeds {
        by_category.entry(feed.category.as_str()).or_default().push(feed);
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    let mut emit = |event: Event<'_>| {
        writer
            .write_event(event)
            .map_err(|e| OpmlError::Write(e.to_string()))
    };

    emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    emit(Event::Start(opml))?;

    emit(Event::Start(BytesStart::new("head")))?;
    emit(Event::Start(BytesStart::new("title")))?;
    emit(Event::Text(BytesText::new("relayfeed subscriptions")))?;
    emit(Event::End(BytesEnd::new("title")))?;
    emit(Event::End(BytesEnd::new("head")))?;

    emit(Event::Start(BytesStart::new("body")))?;
    for (category, feeds) in by_category {
        let mut folder = BytesStart::new("outline");
        folder.push_attribute(("text", category));
        folder.push_attribute(("title", category));
        emit(Event::Start(folder))?;

        for feed in feeds {
            let mut outline = BytesStart::new("outline");
            outline.push_attribute(("type", "rss"));
            outline.push_attribute(("text", feed.name.as_str()));
            outline.push_attribute(("title", feed.name.as_str()));
            outline.push_attribute(("xmlUrl", feed.url.as_str()));
            emit(Event::Empty(outline))?;
        }

        emit(Event::End(BytesEnd::new("outline")))?;
    }
    emit(Event::End(BytesEnd::new("body")))?;
    emit(Event::End(BytesEnd::new("opml")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| OpmlError::Write(e.to_string()))
}

/// Writes [`export_opml`] output to `path`, replacing it atomically.
pub fn export_to_file(feeds: &[Feed], path: &Path) -> Result<(), OpmlError> {
    let content = export_opml(feeds)?;
    let io_err = |source: std::io::Error| OpmlError::Io {
        path: path.display().to_string(),
        source,
    };

    // SEC-009: unpredictable temp name, created exclusively
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let result = (|| {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(url: &str, name: &str, category: &str) -> Feed {
        Feed::new(url, name, category).unwrap()
    }

    #[test]
    fn test_nested_outlines_become_categories() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Subs</title></head>
  <body>
    <outline text="Tech" title="Tech">
      <outline type="rss" text="Example Blog" xmlUrl="https://example.com/feed.xml"/>
      <outline text="Deep">
        <outline type="rss" title="Nested" xmlUrl="https://nested.example.com/rss"/>
      </outline>
    </outline>
    <outline type="rss" xmlUrl="https://top.example.com/atom"/>
  </body>
</opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(
            feeds,
            vec![
                OpmlFeed {
                    name: "Example Blog".into(),
                    url: "https://example.com/feed.xml".into(),
                    category: Some("Tech".into()),
                },
                OpmlFeed {
                    name: "Nested".into(),
                    url: "https://nested.example.com/rss".into(),
                    category: Some("Deep".into()),
                },
                OpmlFeed {
                    name: "https://top.example.com/atom".into(),
                    url: "https://top.example.com/atom".into(),
                    category: None,
                },
            ]
        );
    }

    #[test]
    fn test_feed_outline_with_children_does_not_leak_category() {
        let content = r#"<opml version="2.0"><body>
  <outline text="News">
    <outline text="Paper" xmlUrl="https://paper.example.com/rss"></outline>
    <outline text="Wire" xmlUrl="https://wire.example.com/rss"/>
  </outline>
</body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 2);
        assert!(feeds.iter().all(|f| f.category.as_deref() == Some("News")));
    }

    #[test]
    fn test_invalid_urls_skipped() {
        let content = r#"<opml version="2.0"><body>
    <outline xmlUrl="https://valid.com/feed"/>
    <outline xmlUrl="http://192.168.1.1/feed"/>
    <outline xmlUrl="http://localhost/feed"/>
    <outline xmlUrl="file:///etc/passwd"/>
    <outline xmlUrl=""/>
</body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].url, "https://valid.com/feed");
    }

    #[test]
    fn test_malformed_xml_error() {
        assert!(matches!(
            parse_opml_content("<opml><body><outline></body>"),
            Err(OpmlError::XmlParse(_))
        ));
    }

    #[test]
    fn test_entities_not_expanded() {
        let malicious = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml version="2.0"><body>
  <outline text="&xxe;" xmlUrl="https://example.com/feed.xml"/>
</body></opml>"#;

        match parse_opml_content(malicious) {
            Ok(feeds) => assert!(feeds.iter().all(|f| !f.name.contains("root:"))),
            Err(e) => assert!(matches!(e, OpmlError::XmlParse(_))),
        }
    }

    #[test]
    fn test_depth_limit() {
        let nested = |levels: usize| {
            let mut opml = String::from(r#"<opml version="2.0"><body>"#);
            for _ in 0..levels {
                opml.push_str(r#"<outline text="level">"#);
            }
            opml.push_str(r#"<outline text="Deep" xmlUrl="https://deep.example.com/feed"/>"#);
            for _ in 0..levels {
                opml.push_str("</outline>");
            }
            opml.push_str("</body></opml>");
            opml
        };

        let feeds = parse_opml_content(&nested(MAX_OPML_DEPTH)).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].category.as_deref(), Some("level"));

        let err = parse_opml_content(&nested(MAX_OPML_DEPTH + 1)).unwrap_err();
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_export_groups_by_category() {
        let feeds = vec![
            feed("https://b.example.com/rss", "B", "Tech"),
            feed("https://a.example.com/rss", "A <&> \"quoted\"", "General"),
            feed("https://c.example.com/rss?x=1&y=2", "C", "Tech"),
        ];

        let exported = export_opml(&feeds).unwrap();
        assert!(exported.starts_with("<?xml"));

        let parsed = parse_opml_content(&exported).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].name, "A <&> \"quoted\"");
        assert_eq!(parsed[0].category.as_deref(), Some("General"));
        assert_eq!(parsed[1].url, "https://b.example.com/rss");
        assert_eq!(parsed[2].url, "https://c.example.com/rss?x=1&y=2");
        assert_eq!(parsed[2].category.as_deref(), Some("Tech"));
    }

    #[test]
    fn test_export_empty() {
        let exported = export_opml(&[]).unwrap();
        assert!(exported.contains("<body"));
        assert!(parse_opml_content(&exported).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_to_file_and_parse_back() {
        let path = std::env::temp_dir().join(format!("relayfeed-{}.opml", uuid::Uuid::new_v4()));
        let feeds = vec![feed("https://example.com/feed.xml", "File Export", "Reading")];

        export_to_file(&feeds, &path).unwrap();
        let parsed = parse_opml(&path).await.unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "File Export");
        assert_eq!(parsed[0].category.as_deref(), Some("Reading"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_parse_missing_file() {
        let err = parse_opml(Path::new("/nonexistent/relayfeed.opml"))
            .await
            .unwrap_err();
        assert!(matches!(err, OpmlError::Io { .. }));
    }
}
