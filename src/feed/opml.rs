//! OPML subscription-list import.

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use url::Url;

use crate::util::validate_feed_url;

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// One feed outline (`<outline xmlUrl="...">`) from an OPML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlEntry {
    /// `title`, falling back to `text`, then to the URL itself.
    pub title: String,
    pub url: Url,
}

/// Reads an OPML file and returns every feed outline with a usable URL.
///
/// Outlines whose `xmlUrl` fails validation are skipped with a warning;
/// folder outlines are traversed but not returned.
pub async fn read_opml(path: &std::path::Path, allow_private: bool) -> Result<Vec<OpmlEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml(&content, allow_private)
}

pub fn parse_opml(content: &str, allow_private: bool) -> Result<Vec<OpmlEntry>> {
    // SEC-002: quick-xml 0.37 never expands <!ENTITY> declarations; custom
    // entities fail in decode_and_unescape_value() instead.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                entries.extend(read_outline(&e, &reader, allow_private)?);
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"outline" => {
                entries.extend(read_outline(&e, &reader, allow_private)?);
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
    }

    Ok(entries)
}

fn read_outline(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    allow_private: bool,
) -> Result<Option<OpmlEntry>> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || attr.decode_and_unescape_value(reader.decoder());
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value()?.trim().to_string()),
            b"title" => title = Some(value()?.to_string()),
            b"text" => text = Some(value()?.to_string()),
            _ => {}
        }
    }

    let Some(raw) = xml_url.filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    match validate_feed_url(&raw, allow_private) {
        Ok(url) => Ok(Some(OpmlEntry {
            title: title.or(text).unwrap_or_else(|| raw.clone()),
            url,
        })),
        Err(e) => {
            tracing::warn!(url = %raw, error = %e, "Skipping invalid feed URL");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NESTED: &str = r#"<?xml version="1.0"?>
<opml version="2.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Tech">
      <outline type="rss" text="Example" xmlUrl="https://example.com/feed.xml"/>
      <outline type="rss" title="Titled" text="ignored" xmlUrl=" https://other.example/atom "/>
    </outline>
    <outline type="rss" xmlUrl="https://untitled.example/rss"/>
    <outline type="rss" text="Local" xmlUrl="http://127.0.0.1/feed"/>
    <outline type="rss" text="Bad" xmlUrl="file:///etc/passwd"/>
  </body>
</opml>"#;

    #[test]
    fn test_parse_nested_outlines() {
        let entries = parse_opml(NESTED, false).unwrap();
        let pairs: Vec<_> = entries
            .iter()
            .map(|e| (e.title.as_str(), e.url.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Example", "https://example.com/feed.xml"),
                ("Titled", "https://other.example/atom"),
                ("https://untitled.example/rss", "https://untitled.example/rss"),
            ]
        );
    }

    #[test]
    fn test_private_hosts_when_allowed() {
        let entries = parse_opml(NESTED, true).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].url.as_str(), "http://127.0.0.1/feed");
    }

    #[test]
    fn test_excessive_depth_rejected() {
        let mut opml = String::from("<opml><body>");
        for _ in 0..=MAX_OPML_DEPTH {
            opml.push_str("<outline text=\"x\">");
        }
        let err = parse_opml(&opml, false).unwrap_err();
        assert!(err.to_string().contains("nesting depth"));
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(parse_opml("<opml><body><outline", false).is_err());
    }

    #[tokio::test]
    async fn test_read_opml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.opml");
        std::fs::write(&path, NESTED).unwrap();
        let entries = read_opml(&path, false).await.unwrap();
        assert_eq!(entries.len(), 3);
    }
}
