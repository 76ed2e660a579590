//! One feed's polling task.
//!
//! A [`Poller`] owns all per-feed scheduling state (last attempt, ETag,
//! effective URL, refresh hints) privately; nothing here is shared with other
//! pollers. The registry runs one poller per subscribed URL.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::fetcher::{FetchError, FetchResponse, Fetcher};
use super::normalize::normalize;
use super::parser::{lenient_charset, parse_with, CharsetFn, Decoding, ParseErrorKind};
use super::schedule::Schedule;
use crate::storage::{Database, PersistedFeed, PersistedItem, UpsertOutcome};

/// Knobs shared by every poller, derived from the configuration file.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Operator refresh interval; feed TTLs can only lengthen it.
    pub refresh: Duration,
    /// Consecutive unsupported-format cycles before the feed retires itself.
    /// Zero keeps such feeds subscribed forever.
    pub retire_unsupported_after: u32,
    /// Decode unknown charset labels as windows-1252 instead of failing.
    pub lenient_charset: bool,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            refresh: Duration::from_secs(15 * 60),
            retire_unsupported_after: 0,
            lenient_charset: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Waiting for the next eligible fetch time.
    Idle,
    Fetching,
    /// Parsing, normalising and persisting a response.
    Processing,
    Stopped,
}

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// New content was written; the number of items in the document.
    Updated(usize),
    /// The newest item was already stored.
    Unchanged,
    /// HTTP 304.
    NotModified,
    /// The document had no usable items.
    Empty,
    /// The URL left the subscription set mid-cycle; nothing was written.
    Unsubscribed,
}

/// Notifications a poller sends to whoever supervises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerEvent {
    /// A permanent redirect re-keyed the feed in storage.
    Redirected { from: String, to: String },
    /// The feed kept serving an unsupported format and stopped itself.
    Retired { url: String },
    /// The poller found its URL no longer subscribed and stopped.
    Unsubscribed { url: String },
}

pub struct Poller {
    /// Identity in storage and in the registry.
    key_url: String,
    /// Where requests go; diverges from `key_url` only when a move could not
    /// be recorded in storage.
    fetch_url: Url,
    db: Database,
    fetcher: Fetcher,
    schedule: Schedule,
    last_fetch: Option<DateTime<Utc>>,
    etag: Option<String>,
    unsupported_streak: u32,
    settings: PollerSettings,
    events: Option<mpsc::UnboundedSender<PollerEvent>>,
    state: PollerState,
}

impl Poller {
    /// `last_fetch` seeds the schedule; `None` makes the feed eligible at once.
    pub fn new(
        url: Url,
        db: Database,
        fetcher: Fetcher,
        settings: PollerSettings,
        last_fetch: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key_url: url.to_string(),
            fetch_url: url,
            db,
            fetcher,
            schedule: Schedule::new(settings.refresh),
            last_fetch,
            etag: None,
            unsupported_streak: 0,
            settings,
            events: None,
            state: PollerState::Idle,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PollerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn key_url(&self) -> &str {
        &self.key_url
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Polls until `token` is cancelled or the feed retires itself, and
    /// returns the URL the feed is stored under at that point.
    ///
    /// Cancellation is observed while idle and while a request is in flight;
    /// an abandoned request drops its connection. Once a response has
    /// arrived it is always processed to completion, so storage never sees a
    /// half-written cycle.
    pub async fn run(mut self, token: CancellationToken) -> String {
        tracing::debug!(feed = %self.key_url, "Poller started");

        loop {
            self.state = PollerState::Idle;
            let delay = self.schedule.delay(self.last_fetch, Utc::now());
            if !delay.is_zero() {
                tracing::debug!(feed = %self.key_url, delay_secs = delay.as_secs(), "Waiting for next fetch");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                // Re-check the gates: a blackout may have begun while asleep
                continue;
            }

            match self.db.is_subscribed(&self.key_url).await {
                Ok(true) => {}
                Ok(false) => {
                    self.notify(PollerEvent::Unsubscribed {
                        url: self.key_url.clone(),
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(feed = %self.key_url, error = %e, "Failed to check subscription");
                }
            }

            self.state = PollerState::Fetching;
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = self.fetcher.fetch(&self.fetch_url, self.last_fetch, self.etag.as_deref()) => fetched,
            };

            let result = self.complete_cycle(fetched).await;
            if matches!(result, Ok(CycleOutcome::Unsubscribed)) {
                tracing::info!(feed = %self.key_url, "Feed unsubscribed during fetch; stopping");
                self.notify(PollerEvent::Unsubscribed {
                    url: self.key_url.clone(),
                });
                break;
            }
            if self.should_retire(&result) {
                tracing::warn!(
                    feed = %self.key_url,
                    cycles = self.unsupported_streak,
                    "Retiring feed after repeated unsupported documents"
                );
                self.notify(PollerEvent::Retired {
                    url: self.key_url.clone(),
                });
                break;
            }
        }

        self.state = PollerState::Stopped;
        tracing::debug!(feed = %self.key_url, "Poller stopped");
        self.key_url
    }

    /// Runs one fetch-parse-persist cycle immediately, ignoring the schedule.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, FetchError> {
        self.state = PollerState::Fetching;
        let fetched = self
            .fetcher
            .fetch(&self.fetch_url, self.last_fetch, self.etag.as_deref())
            .await;
        let result = self.complete_cycle(fetched).await;
        self.state = PollerState::Idle;
        result
    }

    async fn complete_cycle(
        &mut self,
        fetched: Result<FetchResponse, FetchError>,
    ) -> Result<CycleOutcome, FetchError> {
        let now = Utc::now();
        // Stamped whatever the outcome so failing feeds back off normally
        self.last_fetch = Some(now);
        self.state = PollerState::Processing;

        let status = fetched.as_ref().ok().map(|response| response.status);
        let result = self.process(fetched, now).await;

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .db
            .record_fetch(&self.key_url, now, status, error.as_deref())
            .await
        {
            tracing::warn!(feed = %self.key_url, error = %e, "Failed to log fetch");
        }

        match &result {
            Ok(CycleOutcome::Updated(items)) => {
                tracing::info!(feed = %self.key_url, items = items, "Feed updated");
            }
            Ok(outcome) => {
                tracing::debug!(feed = %self.key_url, outcome = ?outcome, "Feed checked");
            }
            Err(e) => {
                tracing::warn!(feed = %self.key_url, error = %e, "Feed cycle failed");
            }
        }

        match &result {
            Err(FetchError::Parse(e)) if e.kind() == ParseErrorKind::UnsupportedVersion => {
                self.unsupported_streak += 1;
            }
            Err(_) => {}
            Ok(_) => self.unsupported_streak = 0,
        }

        result
    }

    fn should_retire(&self, result: &Result<CycleOutcome, FetchError>) -> bool {
        let limit = self.settings.retire_unsupported_after;
        result.is_err() && limit > 0 && self.unsupported_streak >= limit
    }

    async fn process(
        &mut self,
        fetched: Result<FetchResponse, FetchError>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, FetchError> {
        let response = match fetched {
            Ok(response) => response,
            Err(e) => {
                self.record_attempt(now).await;
                return Err(e);
            }
        };

        self.follow_move(&response.resolved).await;

        if response.is_not_modified() {
            self.record_attempt(now).await;
            return Ok(CycleOutcome::NotModified);
        }
        if !response.is_ok() {
            self.record_attempt(now).await;
            return Err(FetchError::HttpStatus(response.status));
        }
        let FetchResponse {
            status,
            body,
            etag,
            charset,
            ..
        } = response;
        let Some(body) = body else {
            self.record_attempt(now).await;
            return Err(FetchError::HttpStatus(status));
        };
        self.etag = etag;

        let select: Option<&CharsetFn> = if self.settings.lenient_charset {
            Some(&lenient_charset)
        } else {
            None
        };
        let decoding = Decoding {
            charset: charset.as_deref(),
            select,
        };
        let document = match parse_with(&body, decoding) {
            Ok(document) => document,
            Err(e) => {
                self.record_attempt(now).await;
                return Err(e.into());
            }
        };
        self.schedule.update_from(&document);
        if let Some(ttl) = self.schedule.ttl() {
            tracing::debug!(feed = %self.key_url, ttl_secs = ttl.as_secs(), "Feed declares a TTL");
        }

        let mut outcome = CycleOutcome::Empty;
        for channel in &document.channels {
            let items: Vec<PersistedItem> = channel
                .items
                .iter()
                .filter_map(|item| normalize(item, document.format, &self.fetch_url, now))
                .map(PersistedItem::from)
                .collect();
            if items.is_empty() {
                continue;
            }

            if let Some(link) = channel.self_link() {
                tracing::trace!(feed = %self.key_url, self_link = %link.href, "Feed declares its own URL");
            }
            let website_url = channel
                .website_link()
                .and_then(|link| self.fetch_url.join(link.href.trim()).ok())
                .map(|url| url.to_string());
            let title = match channel.title.trim() {
                "" => self.key_url.clone(),
                title => title.to_string(),
            };
            let count = items.len();
            let feed = PersistedFeed {
                url: self.key_url.clone(),
                website_url,
                title,
                updated_at: items.iter().map(|i| i.published_at).max().unwrap_or(now),
                items,
            };

            let written = self
                .db
                .upsert_feed(&feed, now)
                .await
                .map_err(|e| FetchError::Database(e.to_string()))?;
            outcome = match (outcome, written) {
                (_, UpsertOutcome::NotSubscribed) => return Ok(CycleOutcome::Unsubscribed),
                (CycleOutcome::Updated(n), UpsertOutcome::Written) => CycleOutcome::Updated(n + count),
                (_, UpsertOutcome::Written) => CycleOutcome::Updated(count),
                (CycleOutcome::Updated(n), UpsertOutcome::Unchanged) => CycleOutcome::Updated(n),
                (_, UpsertOutcome::Unchanged) => CycleOutcome::Unchanged,
            };
        }

        if outcome == CycleOutcome::Empty {
            self.record_attempt(now).await;
        }
        Ok(outcome)
    }

    /// Applies a permanent redirect reported by the fetcher.
    async fn follow_move(&mut self, resolved: &Url) {
        if *resolved == self.fetch_url {
            return;
        }

        tracing::info!(feed = %self.key_url, to = %resolved, "Feed moved permanently");
        self.fetch_url = resolved.clone();
        let to = self.fetch_url.to_string();

        match self.db.move_feed(&self.key_url, &to).await {
            Ok(true) => {
                let from = std::mem::replace(&mut self.key_url, to.clone());
                self.notify(PollerEvent::Redirected { from, to });
            }
            Ok(false) => {
                tracing::warn!(
                    feed = %self.key_url,
                    to = %to,
                    "Redirect target is already subscribed; keeping the original entry"
                );
            }
            Err(e) => {
                tracing::warn!(feed = %self.key_url, error = %e, "Failed to record feed move");
            }
        }
    }

    async fn record_attempt(&self, at: DateTime<Utc>) {
        if let Err(e) = self.db.record_attempt(&self.key_url, at).await {
            tracing::warn!(feed = %self.key_url, error = %e, "Failed to record fetch attempt");
        }
    }

    fn notify(&self, event: PollerEvent) {
        if let Some(events) = &self.events {
            // Receiver gone means the registry is shutting down
            let _ = events.send(event);
        }
    }
}
