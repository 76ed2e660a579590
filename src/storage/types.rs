use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening the database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another instance of canopy appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) as reported by sqlx.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub url: String,
    pub website_url: Option<String>,
    pub title: String,
    pub updated_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub feed_url: String,
    pub key: String,
    pub title: String,
    pub link: String,
    pub permalink: String,
    pub published_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FetchDbRow {
    pub fetched_at: i64,
    pub status: Option<i64>,
    pub error: Option<String>,
}

impl FetchDbRow {
    pub(crate) fn into_record(self) -> FetchRecord {
        FetchRecord {
            fetched_at: from_unix(self.fetched_at),
            status: self.status.and_then(|s| u16::try_from(s).ok()),
            error: self.error,
        }
    }
}

impl FeedDbRow {
    pub(crate) fn into_feed(self, items: Vec<PersistedItem>) -> PersistedFeed {
        PersistedFeed {
            url: self.url,
            website_url: self.website_url,
            title: self.title,
            updated_at: from_unix(self.updated_at),
            items,
        }
    }
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> PersistedItem {
        PersistedItem {
            key: self.key,
            title: self.title,
            link: self.link,
            permalink: self.permalink,
            published_at: from_unix(self.published_at),
        }
    }
}

/// Unix seconds to UTC; out-of-range values collapse to the epoch.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ============================================================================
// Data Structures
// ============================================================================

/// A feed as stored: metadata plus the capped window of recent items,
/// newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedFeed {
    pub url: String,
    pub website_url: Option<String>,
    pub title: String,
    /// Publish date of the newest stored item (last content change, not last fetch).
    pub updated_at: DateTime<Utc>,
    pub items: Vec<PersistedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedItem {
    pub key: String,
    pub title: String,
    pub link: String,
    pub permalink: String,
    pub published_at: DateTime<Utc>,
}

/// Result of [`Database::upsert_feed`](super::Database::upsert_feed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Metadata and items were replaced.
    Written,
    /// The incoming top item matched the stored one; only the attempt time moved.
    Unchanged,
    /// The URL is no longer in the subscription set; nothing was written.
    NotSubscribed,
}

/// One logged fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRecord {
    pub fetched_at: DateTime<Utc>,
    /// HTTP status of the final response; `None` when no response arrived.
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Orders items newest first, ties broken by key, and drops repeated keys
/// (the first, newest occurrence wins).
pub(crate) fn sort_and_dedup(items: &mut Vec<PersistedItem>) {
    items.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.key.clone()));
}
