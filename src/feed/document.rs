//! Format-independent document tree produced by the parser.
//!
//! The structure is a hybrid of the RSS and Atom vocabularies: every reader
//! fills in the fields its format knows about and leaves the rest empty.

use chrono::Weekday;
use sha2::{Digest, Sha256};
use std::fmt;

/// Namespace of Atom 1.0 documents.
pub const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
/// Namespace of the RDF root element used by RSS 0.90/1.0 documents.
pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";

/// The syndication vocabulary a document was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedFormat {
    Rss,
    Atom,
    /// RSS wrapped in an `rdf:RDF` root.
    RdfRss,
}

impl FeedFormat {
    /// RSS and RDF-wrapped RSS share refresh hints (`ttl`, `skipHours`, `skipDays`).
    pub fn is_rss_family(self) -> bool {
        matches!(self, FeedFormat::Rss | FeedFormat::RdfRss)
    }

    /// Newest version of this format the parser accepts.
    pub fn max_supported(self) -> Version {
        match self {
            FeedFormat::Rss | FeedFormat::RdfRss => Version::new(2, 0),
            FeedFormat::Atom => Version::new(1, 0),
        }
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedFormat::Rss => write!(f, "rss"),
            FeedFormat::Atom => write!(f, "atom"),
            FeedFormat::RdfRss => write!(f, "rdf-rss"),
        }
    }
}

/// A `major.minor` format version. Ordering is lexicographic, so `0.91 < 2.0 < 2.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses an RSS `version` attribute such as `"2.0"`, `"0.91"` or `"2"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (major, minor) = match raw.split_once('.') {
            Some((major, rest)) => {
                // "2.0.1" keeps only the first two components
                let minor = rest.split('.').next().unwrap_or("0");
                (major, minor)
            }
            None => (raw, "0"),
        };
        Some(Self::new(major.parse().ok()?, minor.parse().ok()?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A parsed feed document. Exactly one supported format per document.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedDocument {
    pub format: FeedFormat,
    pub version: Version,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub href: String,
    pub rel: String,
}

impl Link {
    pub fn is_self(&self) -> bool {
        self.rel.eq_ignore_ascii_case("self")
    }

    pub fn is_alternate(&self) -> bool {
        self.rel.is_empty() || self.rel.eq_ignore_ascii_case("alternate")
    }
}

/// RSS `<guid>`. `isPermaLink` defaults to true when the attribute is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guid {
    pub value: String,
    pub is_permalink: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub title: String,
    pub description: String,
    pub links: Vec<Link>,
    /// Minutes until the next refresh, RSS only.
    pub ttl_minutes: Option<u32>,
    /// UTC hours (0-23) during which the feed asks not to be polled.
    pub skip_hours: Vec<u32>,
    pub skip_days: Vec<Weekday>,
    pub items: Vec<Item>,
}

impl Channel {
    /// The link the feed declares for itself (`rel="self"`).
    pub fn self_link(&self) -> Option<&Link> {
        self.links.iter().find(|l| l.is_self())
    }

    /// The first link that is not the feed's own URL: the human-facing website.
    pub fn website_link(&self) -> Option<&Link> {
        self.links.iter().find(|l| !l.is_self())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Item {
    pub title: String,
    pub links: Vec<Link>,
    pub description: String,
    pub content: Option<String>,
    pub author: Option<String>,
    /// RSS `<guid>`.
    pub guid: Option<Guid>,
    /// Atom `<id>`.
    pub id: Option<String>,
    /// RSS `<pubDate>` or Dublin Core `<dc:date>`, unparsed.
    pub pub_date: Option<String>,
    /// Atom `<updated>`, unparsed.
    pub updated: Option<String>,
    /// Atom `<published>`, unparsed.
    pub published: Option<String>,
}

impl Item {
    /// Stable identity used to recognise the same logical item across fetches.
    ///
    /// Prefers the GUID (or Atom id), then the first link as published, and
    /// finally a SHA-256 of the title, date and body. Only source fields are
    /// used so the key never depends on the URL the feed was fetched from.
    pub fn key(&self) -> String {
        let guid = self.guid.as_ref().map(|g| g.value.as_str());
        if let Some(existing) = guid.or(self.id.as_deref()) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        if let Some(link) = self.links.first() {
            let trimmed = link.href.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        let date = self
            .pub_date
            .as_deref()
            .or(self.updated.as_deref())
            .or(self.published.as_deref())
            .unwrap_or("");
        let body = self.content.as_deref().unwrap_or(&self.description);
        let input = format!("{}|{}|{}", self.title.trim(), date.trim(), body);
        format!("{:x}", Sha256::digest(input.as_bytes()))
    }

    /// True when there is nothing to identify or display.
    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty()
            && self.links.iter().all(|l| l.href.trim().is_empty())
            && self.guid.as_ref().map_or(true, |g| g.value.trim().is_empty())
            && self.id.as_deref().map_or(true, |id| id.trim().is_empty())
            && self.description.trim().is_empty()
            && self.content.as_deref().map_or(true, |c| c.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item_with_link(href: &str) -> Item {
        Item {
            title: "Title".into(),
            links: vec![Link {
                href: href.into(),
                rel: "alternate".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("2.0"), Some(Version::new(2, 0)));
        assert_eq!(Version::parse("0.91"), Some(Version::new(0, 91)));
        assert_eq!(Version::parse("2"), Some(Version::new(2, 0)));
        assert_eq!(Version::parse(" 2.0.1 "), Some(Version::new(2, 0)));
        assert_eq!(Version::parse("two"), None);
        assert_eq!(Version::parse(""), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(0, 91) < Version::new(2, 0));
        assert!(Version::new(2, 1) > FeedFormat::Rss.max_supported());
        assert!(Version::new(1, 1) <= FeedFormat::RdfRss.max_supported());
    }

    #[test]
    fn test_key_prefers_guid() {
        let mut item = item_with_link("https://example.com/a");
        item.guid = Some(Guid {
            value: " guid-1 ".into(),
            is_permalink: false,
        });
        assert_eq!(item.key(), "guid-1");
    }

    #[test]
    fn test_key_uses_atom_id() {
        let mut item = item_with_link("https://example.com/a");
        item.id = Some("tag:example.com,2003:1".into());
        assert_eq!(item.key(), "tag:example.com,2003:1");
    }

    #[test]
    fn test_key_falls_back_to_link() {
        let item = item_with_link("https://example.com/a");
        assert_eq!(item.key(), "https://example.com/a");
    }

    #[test]
    fn test_key_blank_guid_is_ignored() {
        let mut item = item_with_link("/relative");
        item.guid = Some(Guid {
            value: "   ".into(),
            is_permalink: true,
        });
        assert_eq!(item.key(), "/relative");
    }

    #[test]
    fn test_key_hashes_content_without_identity() {
        let item = Item {
            title: "Only a title".into(),
            description: "Body".into(),
            ..Default::default()
        };
        let key = item.key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

        let other = Item {
            title: "Another title".into(),
            description: "Body".into(),
            ..Default::default()
        };
        assert_ne!(key, other.key());
    }

    #[test]
    fn test_blank_item() {
        assert!(Item::default().is_blank());
        assert!(!item_with_link("https://example.com").is_blank());
    }

    #[test]
    fn test_channel_links() {
        let channel = Channel {
            links: vec![
                Link {
                    href: "https://example.com/feed.xml".into(),
                    rel: "self".into(),
                },
                Link {
                    href: "https://example.com/".into(),
                    rel: "alternate".into(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            channel.self_link().map(|l| l.href.as_str()),
            Some("https://example.com/feed.xml")
        );
        assert_eq!(
            channel.website_link().map(|l| l.href.as_str()),
            Some("https://example.com/")
        );
    }

    proptest! {
        #[test]
        fn prop_key_is_deterministic(
            title in ".{0,40}",
            guid in proptest::option::of("[a-z0-9:/.-]{0,30}"),
            link in proptest::option::of("[a-z0-9:/.-]{0,30}"),
            body in ".{0,80}",
        ) {
            let build = || Item {
                title: title.clone(),
                guid: guid.clone().map(|value| Guid { value, is_permalink: false }),
                links: link
                    .clone()
                    .map(|href| vec![Link { href, rel: String::new() }])
                    .unwrap_or_default(),
                description: body.clone(),
                ..Default::default()
            };
            prop_assert_eq!(build().key(), build().key());
        }
    }
}
