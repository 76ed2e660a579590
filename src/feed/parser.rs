use chrono::Weekday;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use std::borrow::Cow;
use thiserror::Error;

use super::document::{
    Channel, FeedDocument, FeedFormat, Guid, Item, Link, Version, ATOM_NS, RDF_NS,
};

/// Maximum element nesting accepted before the document is rejected as malformed.
const MAX_XML_DEPTH: usize = 50;

/// How far into the document to look for an `<?xml ... encoding="..."?>` prolog.
const PROLOG_SCAN_LIMIT: usize = 1024;

/// Maps a charset label (from the HTTP header or the XML prolog) to an encoding.
///
/// Returning `None` rejects the document as malformed.
pub type CharsetFn = dyn Fn(&str) -> Option<&'static Encoding> + Send + Sync;

/// Errors returned by [`parse`] and [`parse_with`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not well-formed XML, or bytes that do not match the declared charset.
    #[error("Malformed document: {0}")]
    Malformed(String),
    /// A recognised format newer than the parser understands.
    #[error("Unsupported feed: {format} version {version}")]
    UnsupportedVersion { format: FeedFormat, version: Version },
    /// Neither RSS, RDF-RSS nor Atom.
    #[error("Unsupported feed: unknown format")]
    UnknownFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    Malformed,
    UnsupportedVersion,
}

impl ParseError {
    /// Unknown formats are reported as an unsupported version of nothing.
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            ParseError::Malformed(_) => ParseErrorKind::Malformed,
            ParseError::UnsupportedVersion { .. } | ParseError::UnknownFormat => {
                ParseErrorKind::UnsupportedVersion
            }
        }
    }
}

/// Character-set handling for one document.
#[derive(Clone, Copy, Default)]
pub struct Decoding<'a> {
    /// `charset` parameter of the HTTP `Content-Type` header. Takes precedence
    /// over the XML prolog.
    pub charset: Option<&'a str>,
    /// Label resolver. Without one, labels are resolved strictly per the
    /// WHATWG Encoding Standard and unknown labels are rejected.
    pub select: Option<&'a CharsetFn>,
}

/// Resolves known labels and falls back to windows-1252 for anything else.
pub fn lenient_charset(label: &str) -> Option<&'static Encoding> {
    Some(Encoding::for_label(label.trim().as_bytes()).unwrap_or(WINDOWS_1252))
}

/// Parses a feed with strict UTF-8 / declared-encoding handling.
pub fn parse(bytes: &[u8]) -> Result<FeedDocument, ParseError> {
    parse_with(bytes, Decoding::default())
}

/// Parses a feed document from raw bytes.
///
/// Detection order: an Atom `feed` element anywhere in the document, then an
/// `rss` root with a `version` attribute, then an RDF `RDF` root (treated as
/// RSS 1.1). Versions newer than RSS 2.0 / Atom 1.0 are rejected rather than
/// parsed on a best-effort basis.
pub fn parse_with(bytes: &[u8], decoding: Decoding<'_>) -> Result<FeedDocument, ParseError> {
    let text = decode(bytes, &decoding)?;
    let root = build_tree(&text)?;
    let detected = detect(&root)?;

    if detected.version > detected.format.max_supported() {
        return Err(ParseError::UnsupportedVersion {
            format: detected.format,
            version: detected.version,
        });
    }

    let channels = match detected.format {
        FeedFormat::Atom => vec![read_atom(detected.element)],
        FeedFormat::Rss | FeedFormat::RdfRss => read_rss(detected.element, detected.format),
    };

    Ok(FeedDocument {
        format: detected.format,
        version: detected.version,
        channels,
    })
}

// ============================================================================
// Character Decoding
// ============================================================================

fn decode<'b>(bytes: &'b [u8], decoding: &Decoding<'_>) -> Result<Cow<'b, str>, ParseError> {
    let (encoding, body) = match Encoding::for_bom(bytes) {
        Some((encoding, bom_len)) => (encoding, &bytes[bom_len..]),
        None => {
            let label = decoding
                .charset
                .map(str::to_owned)
                .or_else(|| declared_encoding(bytes));
            let encoding = match label {
                Some(label) => select_encoding(&label, decoding)?,
                None => UTF_8,
            };
            (encoding, bytes)
        }
    };

    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or_else(|| ParseError::Malformed(format!("invalid {} byte sequence", encoding.name())))
}

fn select_encoding(label: &str, decoding: &Decoding<'_>) -> Result<&'static Encoding, ParseError> {
    let selected = match decoding.select {
        Some(select) => select(label),
        None => Encoding::for_label(label.trim().as_bytes()),
    };
    selected.ok_or_else(|| ParseError::Malformed(format!("unsupported charset: {}", label)))
}

/// Reads the `encoding` pseudo-attribute of the XML declaration, if any.
fn declared_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(PROLOG_SCAN_LIMIT)];
    let head = String::from_utf8_lossy(head);
    let prolog = head.strip_prefix("<?xml")?;
    let prolog = &prolog[..prolog.find("?>")?];

    let rest = &prolog[prolog.find("encoding")? + "encoding".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    let end = value.find(quote)?;
    Some(value[..end].to_string())
}

// ============================================================================
// Element Tree
// ============================================================================

#[derive(Debug, Default)]
struct Element {
    namespace: Option<String>,
    name: String,
    /// Attributes keyed by local name; namespace declarations are dropped.
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    /// Text directly inside this element; descendants keep their own.
    text: String,
    /// Length of the parent's own text when this element closed, so mixed
    /// content can be reassembled in document order.
    offset: usize,
}

impl Element {
    fn open(namespace: Option<String>, start: &BytesStart<'_>) -> Self {
        let mut attributes = Vec::new();
        for attr_result in start.attributes() {
            let attr = match attr_result {
                Ok(attr) => attr,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed feed attribute");
                    continue;
                }
            };
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            attributes.push((key, value));
        }

        Self {
            namespace,
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            children: Vec::new(),
            text: String::new(),
            offset: 0,
        }
    }

    fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Depth-first search including `self`.
    fn find(&self, namespace: &str, name: &str) -> Option<&Element> {
        if self.is(namespace, name) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(namespace, name))
    }

    /// Text of this element and all descendants, in document order.
    fn text_content(&self) -> String {
        if self.children.is_empty() {
            return self.text.clone();
        }
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        let mut from = 0;
        for child in &self.children {
            out.push_str(&self.text[from..child.offset]);
            from = child.offset;
            child.collect_text(out);
        }
        out.push_str(&self.text[from..]);
    }

    fn trimmed_text(&self) -> Option<String> {
        let text = self.text_content();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

fn build_tree(xml: &str) -> Result<Element, ParseError> {
    // SEC-002: quick-xml 0.37 never expands <!ENTITY> declarations, so a
    // hostile DOCTYPE cannot pull in external content.
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        let namespace = match resolved {
            ResolveResult::Bound(Namespace(ns)) => Some(String::from_utf8_lossy(ns).into_owned()),
            _ => None,
        };

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_XML_DEPTH {
                    return Err(ParseError::Malformed(format!(
                        "nesting depth exceeds {} levels",
                        MAX_XML_DEPTH
                    )));
                }
                stack.push(Element::open(namespace, &e));
            }
            Event::Empty(e) => attach(&mut stack, &mut root, Element::open(namespace, &e))?,
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParseError::Malformed("unexpected closing tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(e) => {
                let text = match e.unescape() {
                    Ok(text) => text.into_owned(),
                    // Undeclared entities such as &nbsp; are kept verbatim
                    Err(_) => String::from_utf8_lossy(&e).into_owned(),
                };
                push_text(&mut stack, &text);
            }
            Event::CData(e) => push_text(&mut stack, &String::from_utf8_lossy(&e)),
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ParseError::Malformed("unexpected end of document".into()));
    }
    root.ok_or_else(|| ParseError::Malformed("document has no root element".into()))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    mut element: Element,
) -> Result<(), ParseError> {
    if let Some(parent) = stack.last_mut() {
        element.offset = parent.text.len();
        parent.children.push(element);
        Ok(())
    } else if root.is_none() {
        *root = Some(element);
        Ok(())
    } else {
        Err(ParseError::Malformed("multiple root elements".into()))
    }
}

/// Text outside the root element is whitespace or junk and is dropped.
fn push_text(stack: &mut [Element], text: &str) {
    if let Some(element) = stack.last_mut() {
        element.text.push_str(text);
    }
}

// ============================================================================
// Format Detection
// ============================================================================

struct Detected<'a> {
    format: FeedFormat,
    version: Version,
    element: &'a Element,
}

fn detect(root: &Element) -> Result<Detected<'_>, ParseError> {
    if let Some(feed) = root.find(ATOM_NS, "feed") {
        return Ok(Detected {
            format: FeedFormat::Atom,
            version: Version::new(1, 0),
            element: feed,
        });
    }

    if root.name == "rss" && root.namespace.is_none() {
        if let Some(raw) = root.attr("version") {
            let version = Version::parse(raw).ok_or(ParseError::UnknownFormat)?;
            return Ok(Detected {
                format: FeedFormat::Rss,
                version,
                element: root,
            });
        }
    }

    if root.is(RDF_NS, "RDF") {
        return Ok(Detected {
            format: FeedFormat::RdfRss,
            version: Version::new(1, 1),
            element: root,
        });
    }

    Err(ParseError::UnknownFormat)
}

// ============================================================================
// RSS / RDF
// ============================================================================

/// Children by local name, skipping anything in the Atom namespace (`atom:link`
/// is handled separately by [`rss_links`]).
fn rss_children<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
    parent
        .children
        .iter()
        .filter(move |c| c.name == name && c.namespace.as_deref() != Some(ATOM_NS))
}

fn rss_text(parent: &Element, name: &str) -> Option<String> {
    rss_children(parent, name).find_map(Element::trimmed_text)
}

fn rss_links(parent: &Element) -> Vec<Link> {
    parent
        .children
        .iter()
        .filter(|c| c.name == "link")
        .filter_map(|c| {
            if c.namespace.as_deref() == Some(ATOM_NS) {
                c.attr("href").map(|href| Link {
                    href: href.trim().to_string(),
                    rel: c.attr("rel").unwrap_or("alternate").to_string(),
                })
            } else {
                c.trimmed_text().map(|href| Link {
                    href,
                    rel: "alternate".to_string(),
                })
            }
        })
        .collect()
}

fn read_rss(root: &Element, format: FeedFormat) -> Vec<Channel> {
    rss_children(root, "channel")
        .map(|element| {
            let mut channel = read_rss_channel(element);
            // RDF documents keep their items beside the channel, not inside it
            if channel.items.is_empty() && format == FeedFormat::RdfRss {
                channel.items = rss_children(root, "item").map(read_rss_item).collect();
            }
            channel
        })
        .collect()
}

fn read_rss_channel(element: &Element) -> Channel {
    let skip_hours = rss_children(element, "skipHours")
        .flat_map(|skip| rss_children(skip, "hour"))
        .filter_map(|hour| hour.trimmed_text()?.parse::<u32>().ok())
        .filter_map(|hour| match hour {
            24 => Some(0),
            h if h < 24 => Some(h),
            _ => None,
        })
        .collect();

    let skip_days = rss_children(element, "skipDays")
        .flat_map(|skip| rss_children(skip, "day"))
        .filter_map(|day| day.trimmed_text()?.parse::<Weekday>().ok())
        .collect();

    Channel {
        title: rss_text(element, "title").unwrap_or_default(),
        description: rss_text(element, "description").unwrap_or_default(),
        links: rss_links(element),
        ttl_minutes: rss_text(element, "ttl").and_then(|ttl| ttl.parse().ok()),
        skip_hours,
        skip_days,
        items: rss_children(element, "item").map(read_rss_item).collect(),
    }
}

fn read_rss_item(element: &Element) -> Item {
    let guid = rss_children(element, "guid").next().and_then(|g| {
        g.trimmed_text().map(|value| Guid {
            value,
            is_permalink: !g
                .attr("isPermaLink")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("false")),
        })
    });

    Item {
        title: rss_text(element, "title").unwrap_or_default(),
        links: rss_links(element),
        description: rss_text(element, "description").unwrap_or_default(),
        content: rss_text(element, "encoded"),
        author: rss_text(element, "author").or_else(|| rss_text(element, "creator")),
        guid,
        id: None,
        pub_date: rss_text(element, "pubDate").or_else(|| rss_text(element, "date")),
        updated: None,
        published: None,
    }
}

// ============================================================================
// Atom
// ============================================================================

fn atom_children<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
    parent.children.iter().filter(move |c| c.is(ATOM_NS, name))
}

fn atom_text(parent: &Element, name: &str) -> Option<String> {
    atom_children(parent, name).find_map(Element::trimmed_text)
}

fn atom_links(parent: &Element) -> Vec<Link> {
    atom_children(parent, "link")
        .filter_map(|l| {
            l.attr("href").map(|href| Link {
                href: href.trim().to_string(),
                rel: l.attr("rel").unwrap_or("alternate").to_string(),
            })
        })
        .collect()
}

fn read_atom(feed: &Element) -> Channel {
    Channel {
        title: atom_text(feed, "title").unwrap_or_default(),
        description: atom_text(feed, "subtitle").unwrap_or_default(),
        links: atom_links(feed),
        ttl_minutes: None,
        skip_hours: Vec::new(),
        skip_days: Vec::new(),
        items: atom_children(feed, "entry").map(read_atom_entry).collect(),
    }
}

fn read_atom_entry(entry: &Element) -> Item {
    let author = atom_children(entry, "author")
        .next()
        .and_then(|a| atom_text(a, "name"));

    Item {
        title: atom_text(entry, "title").unwrap_or_default(),
        links: atom_links(entry),
        description: atom_text(entry, "summary").unwrap_or_default(),
        content: atom_text(entry, "content"),
        author,
        guid: None,
        id: atom_text(entry, "id"),
        pub_date: None,
        updated: atom_text(entry, "updated"),
        published: atom_text(entry, "published"),
    }
}
