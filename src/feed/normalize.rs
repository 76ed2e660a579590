//! Maps parsed items onto the canonical record persisted by storage.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use url::Url;

use super::document::{FeedFormat, Item};
use crate::storage::PersistedItem;

/// Title used when an item carries none.
pub const UNTITLED: &str = "Untitled";

/// Naive layouts seen in the wild, interpreted as UTC.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
];

/// An item in canonical form: absolute links, a concrete timestamp, and the
/// dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub key: String,
    pub title: String,
    pub link: String,
    pub permalink: String,
    pub published_at: DateTime<Utc>,
    pub body: Option<String>,
}

/// Source fields picked for one format.
struct Selected<'a> {
    link: &'a str,
    permalink: Option<&'a str>,
    date: Option<&'a str>,
}

fn select(item: &Item, format: FeedFormat) -> Selected<'_> {
    let link = item
        .links
        .iter()
        .find(|l| l.is_alternate())
        .or_else(|| item.links.first())
        .map(|l| l.href.as_str())
        .unwrap_or("");

    match format {
        FeedFormat::Atom => Selected {
            link,
            permalink: None,
            date: item.updated.as_deref().or(item.published.as_deref()),
        },
        FeedFormat::Rss | FeedFormat::RdfRss => Selected {
            link,
            permalink: item
                .guid
                .as_ref()
                .filter(|g| g.is_permalink && is_absolute_http(&g.value))
                .map(|g| g.value.as_str()),
            date: item.pub_date.as_deref(),
        },
    }
}

fn is_absolute_http(raw: &str) -> bool {
    Url::parse(raw.trim()).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Canonicalises one item against the URL it was fetched from.
///
/// Links are resolved against `base`; an item without any link resolves to
/// the feed URL itself. A missing or unparseable date becomes `fetched_at`.
/// Returns `None` for items that cannot be identified or whose link cannot
/// be resolved, so one bad entry never aborts the rest of the document.
pub fn normalize(
    item: &Item,
    format: FeedFormat,
    base: &Url,
    fetched_at: DateTime<Utc>,
) -> Option<NormalizedItem> {
    if item.is_blank() {
        return None;
    }

    let selected = select(item, format);
    let link = match base.join(selected.link.trim()) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(feed = %base, link = selected.link, error = %e, "Dropping item with unresolvable link");
            return None;
        }
    };
    let permalink = match selected.permalink {
        Some(raw) => base.join(raw.trim()).ok()?,
        None => link.clone(),
    };

    let title = item.title.trim();
    let body = item
        .content
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .or_else(|| Some(item.description.as_str()).filter(|d| !d.trim().is_empty()))
        .map(str::to_string);

    Some(NormalizedItem {
        key: item.key(),
        title: if title.is_empty() { UNTITLED.to_string() } else { title.to_string() },
        link: link.to_string(),
        permalink: permalink.to_string(),
        published_at: selected.date.and_then(parse_date).unwrap_or(fetched_at),
        body,
    })
}

impl From<NormalizedItem> for PersistedItem {
    fn from(item: NormalizedItem) -> Self {
        PersistedItem {
            key: item.key,
            title: item.title,
            link: item.link,
            permalink: item.permalink,
            published_at: item.published_at,
        }
    }
}

/// Parses RFC 3339, RFC 2822 and a handful of common zone-less layouts.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
