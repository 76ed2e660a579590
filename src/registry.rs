//! Supervisor for the per-feed pollers.
//!
//! The registry is a single-owner actor: one task holds the URL → poller
//! table and serialises every subscribe and unsubscribe through its command
//! queue, storage writes included, so at most one poller per URL can ever be
//! live and the table always agrees with the stored subscription set.
//! Callers talk to it through a cloneable [`RegistryHandle`].

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::feed::{Fetcher, Poller, PollerEvent, PollerSettings};
use crate::storage::{Database, PersistedFeed};
use crate::util::{validate_feed_url, UrlValidationError};

const COMMAND_BUFFER: usize = 32;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The URL was rejected before any subscription was recorded.
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The registry task has shut down.
    #[error("Registry is closed")]
    Closed,
}

impl RegistryError {
    fn storage(err: anyhow::Error) -> Self {
        RegistryError::Storage(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A new poller was started.
    Subscribed,
    /// A poller for this URL is already running; nothing changed.
    AlreadySubscribed,
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub poller: PollerSettings,
    /// Accept localhost and private-network feed URLs.
    pub allow_private: bool,
}

// ============================================================================
// Actor
// ============================================================================

struct PollerHandle {
    token: CancellationToken,
    /// Resolves to the URL the feed is stored under when the poller stops.
    task: JoinHandle<String>,
}

impl PollerHandle {
    /// Cancels the poller and waits for it to unwind.
    async fn stop(self, url: &str) -> String {
        self.token.cancel();
        match self.task.await {
            Ok(final_url) => final_url,
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Poller task ended abnormally");
                url.to_string()
            }
        }
    }
}

enum Command {
    Subscribe {
        url: Url,
        reply: oneshot::Sender<Result<bool, RegistryError>>,
    },
    Unsubscribe {
        url: String,
        reply: oneshot::Sender<Result<bool, RegistryError>>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct Registry {
    db: Database,
    fetcher: Fetcher,
    settings: RegistrySettings,
    root: CancellationToken,
    pollers: HashMap<String, PollerHandle>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<PollerEvent>,
    events_rx: mpsc::UnboundedReceiver<PollerEvent>,
}

impl Registry {
    /// Starts a poller for every stored subscription and spawns the registry
    /// task.
    ///
    /// # Errors
    ///
    /// Fails only if the subscription set cannot be read; per-feed problems
    /// are logged and never stop the registry.
    pub async fn start(
        db: Database,
        fetcher: Fetcher,
        settings: RegistrySettings,
    ) -> Result<RegistryHandle, RegistryError> {
        let stored = db
            .list_subscriptions()
            .await
            .map_err(RegistryError::storage)?;

        let allow_private = settings.allow_private;
        let (mut registry, commands) = Registry::new(db.clone(), fetcher, settings);

        for raw in stored {
            match Url::parse(&raw) {
                Ok(url) => {
                    registry.spawn_poller(url).await;
                }
                Err(e) => {
                    tracing::warn!(feed = %raw, error = %e, "Skipping stored subscription with unparseable URL");
                }
            }
        }
        tracing::info!(feeds = registry.pollers.len(), "Registry started");

        tokio::spawn(registry.run());

        Ok(RegistryHandle {
            commands,
            db,
            allow_private,
        })
    }

    fn new(
        db: Database,
        fetcher: Fetcher,
        settings: RegistrySettings,
    ) -> (Self, mpsc::Sender<Command>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Registry {
            db,
            fetcher,
            settings,
            root: CancellationToken::new(),
            pollers: HashMap::new(),
            commands,
            events_tx,
            events_rx,
        };
        (registry, commands_tx)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            return;
                        }
                    }
                    // Every handle dropped
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
            }
        }
        self.stop_all().await;
    }

    /// Returns `false` once the registry has shut down.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe { url, reply } => {
                let _ = reply.send(self.subscribe(url).await);
            }
            Command::Unsubscribe { url, reply } => {
                let _ = reply.send(self.unsubscribe(&url).await);
            }
            Command::List { reply } => {
                let mut urls: Vec<String> = self.pollers.keys().cloned().collect();
                urls.sort();
                let _ = reply.send(urls);
            }
            Command::Shutdown { reply } => {
                self.stop_all().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Records the subscription, then starts its poller. Returns `false` when
    /// a poller already owns this URL.
    async fn subscribe(&mut self, url: Url) -> Result<bool, RegistryError> {
        self.db
            .subscribe(url.as_str())
            .await
            .map_err(RegistryError::storage)?;
        Ok(self.spawn_poller(url).await)
    }

    /// Stops the poller first so it cannot write after the rows are gone,
    /// then removes the subscription under both its requested and its final
    /// URL.
    async fn unsubscribe(&mut self, key: &str) -> Result<bool, RegistryError> {
        let mut removed = false;
        if let Some(handle) = self.pollers.remove(key) {
            removed = true;
            let final_url = handle.stop(key).await;
            if final_url != key {
                removed |= self
                    .db
                    .unsubscribe(&final_url)
                    .await
                    .map_err(RegistryError::storage)?;
            }
        }
        removed |= self
            .db
            .unsubscribe(key)
            .await
            .map_err(RegistryError::storage)?;
        Ok(removed)
    }

    /// Returns `false` when a poller already owns this URL.
    async fn spawn_poller(&mut self, url: Url) -> bool {
        let key = url.to_string();
        if self.pollers.contains_key(&key) {
            return false;
        }

        let last_fetch = match self.db.last_update_time(&key).await {
            Ok(last) => last,
            Err(e) => {
                tracing::warn!(feed = %key, error = %e, "Failed to read last fetch time, polling now");
                None
            }
        };

        let poller = Poller::new(
            url,
            self.db.clone(),
            self.fetcher.clone(),
            self.settings.poller.clone(),
            last_fetch,
        )
        .with_events(self.events_tx.clone());
        let token = self.root.child_token();
        let task = tokio::spawn(poller.run(token.clone()));

        tracing::debug!(feed = %key, "Poller spawned");
        self.pollers.insert(key, PollerHandle { token, task });
        true
    }

    async fn on_event(&mut self, event: PollerEvent) {
        match event {
            PollerEvent::Redirected { from, to } => {
                let Some(handle) = self.pollers.remove(&from) else {
                    return;
                };
                if self.pollers.contains_key(&to) {
                    // Both pollers now fetch the same feed; keep the one already keyed there
                    tracing::warn!(
                        feed = %from,
                        to = %to,
                        "Redirect target already has a poller; stopping the redirected one"
                    );
                    handle.stop(&from).await;
                    return;
                }
                tracing::info!(feed = %from, to = %to, "Feed re-keyed after permanent redirect");
                self.pollers.insert(to, handle);
            }
            PollerEvent::Retired { url } => {
                self.pollers.remove(&url);
                match self.db.unsubscribe(&url).await {
                    Ok(_) => tracing::info!(feed = %url, "Retired feed unsubscribed"),
                    Err(e) => {
                        tracing::warn!(feed = %url, error = %e, "Failed to remove retired feed");
                    }
                }
            }
            PollerEvent::Unsubscribed { url } => {
                // The subscription was removed behind the registry's back
                if let Some(handle) = self.pollers.remove(&url) {
                    handle.stop(&url).await;
                }
                match self.db.is_subscribed(&url).await {
                    Ok(false) => tracing::info!(feed = %url, "Poller stopped for removed subscription"),
                    Ok(true) => {
                        // Subscribed again before the event arrived
                        if let Ok(parsed) = Url::parse(&url) {
                            self.spawn_poller(parsed).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(feed = %url, error = %e, "Failed to check subscription");
                    }
                }
            }
        }
    }

    async fn stop_all(&mut self) {
        self.root.cancel();
        for (url, handle) in self.pollers.drain() {
            handle.stop(&url).await;
        }
        tracing::info!("Registry stopped");
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front end to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<Command>,
    db: Database,
    allow_private: bool,
}

impl RegistryHandle {
    /// Validates `url`, records the subscription, and starts its poller.
    ///
    /// The poller is seeded with the stored last fetch time, so a feed that
    /// was fetched recently waits out its interval first.
    pub async fn subscribe(&self, url: &str) -> Result<SubscribeOutcome, RegistryError> {
        let url = validate_feed_url(url, self.allow_private)?;

        let key = url.to_string();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { url, reply }).await?;
        let started = rx.await.map_err(|_| RegistryError::Closed)??;

        if started {
            tracing::info!(feed = %key, "Subscribed");
            Ok(SubscribeOutcome::Subscribed)
        } else {
            tracing::info!(feed = %key, "Already subscribed");
            Ok(SubscribeOutcome::AlreadySubscribed)
        }
    }

    /// Stops the feed's poller and removes its subscription, feed row and
    /// items. Returns `false` if the URL was not subscribed.
    ///
    /// Waits for the poller to unwind; an in-flight request is abandoned,
    /// never awaited.
    pub async fn unsubscribe(&self, url: &str) -> Result<bool, RegistryError> {
        // Stored keys are in `Url` serialisation form
        let key = Url::parse(url.trim())
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.trim().to_string());

        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            url: key.clone(),
            reply,
        })
        .await?;
        let removed = rx.await.map_err(|_| RegistryError::Closed)??;

        if removed {
            tracing::info!(feed = %key, "Unsubscribed");
        }
        Ok(removed)
    }

    /// URLs with a live poller, sorted.
    pub async fn subscriptions(&self) -> Result<Vec<String>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Every stored feed, most recently changed first; equal timestamps are
    /// ordered by URL.
    pub async fn snapshot(&self) -> Result<Vec<PersistedFeed>, RegistryError> {
        let mut feeds = self.db.read_all().await.map_err(RegistryError::storage)?;
        sort_snapshot(&mut feeds);
        Ok(feeds)
    }

    /// Cancels every poller and waits for all of them to stop.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), RegistryError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RegistryError::Closed)
    }
}

/// Most recently changed first; equal timestamps are ordered by URL.
pub fn sort_snapshot(feeds: &mut [PersistedFeed]) {
    feeds.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.url.cmp(&b.url))
    });
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PersistedItem;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn settings() -> RegistrySettings {
        RegistrySettings {
            poller: PollerSettings {
                refresh: Duration::from_secs(3600),
                ..Default::default()
            },
            allow_private: true,
        }
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(Duration::from_secs(5), true).unwrap()
    }

    async fn gone_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        server
    }

    fn feed(url: &str, updated_secs: i64) -> PersistedFeed {
        let at = Utc.timestamp_opt(updated_secs, 0).unwrap();
        PersistedFeed {
            url: url.to_string(),
            website_url: None,
            title: url.to_string(),
            updated_at: at,
            items: vec![PersistedItem {
                key: format!("{url}#1"),
                title: "t".to_string(),
                link: url.to_string(),
                permalink: url.to_string(),
                published_at: at,
            }],
        }
    }

    #[tokio::test]
    async fn test_subscribe_twice_keeps_one_poller() {
        let server = gone_server().await;
        let registry = Registry::start(test_db().await, fetcher(), settings())
            .await
            .unwrap();
        let url = format!("{}/feed.xml", server.uri());

        assert_eq!(
            registry.subscribe(&url).await.unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            registry.subscribe(&url).await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(registry.subscriptions().await.unwrap(), vec![url]);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_url() {
        let db = test_db().await;
        let registry = Registry::start(db.clone(), fetcher(), RegistrySettings::default())
            .await
            .unwrap();

        let result = registry.subscribe("ftp://example.com/feed").await;
        assert!(matches!(result, Err(RegistryError::InvalidUrl(_))));

        // Private hosts are refused unless explicitly allowed
        let result = registry.subscribe("http://127.0.0.1/feed").await;
        assert!(matches!(result, Err(RegistryError::InvalidUrl(_))));

        assert!(db.list_subscriptions().await.unwrap().is_empty());
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_resumes_stored_subscriptions() {
        let server = gone_server().await;
        let db = test_db().await;
        let a = format!("{}/a.xml", server.uri());
        let b = format!("{}/b.xml", server.uri());
        db.subscribe(&a).await.unwrap();
        db.subscribe(&b).await.unwrap();

        let registry = Registry::start(db, fetcher(), settings()).await.unwrap();
        let mut expected = vec![a.clone(), b];
        expected.sort();
        assert_eq!(registry.subscriptions().await.unwrap(), expected);

        // A resumed feed counts as already subscribed
        assert_eq!(
            registry.subscribe(&a).await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_poller_and_rows() {
        let server = gone_server().await;
        let db = test_db().await;
        let registry = Registry::start(db.clone(), fetcher(), settings())
            .await
            .unwrap();
        let url = format!("{}/feed.xml", server.uri());

        registry.subscribe(&url).await.unwrap();
        db.upsert_feed(&feed(&url, 1_700_000_000), Utc::now())
            .await
            .unwrap();

        assert!(registry.unsubscribe(&url).await.unwrap());
        assert!(registry.subscriptions().await.unwrap().is_empty());
        assert!(db.list_subscriptions().await.unwrap().is_empty());
        assert!(registry.snapshot().await.unwrap().is_empty());

        // Absent URL is a no-op
        assert!(!registry.unsubscribe(&url).await.unwrap());
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_orders_by_update_then_url() {
        let db = test_db().await;
        for (url, at) in [
            ("https://b.example.com/feed", 100),
            ("https://c.example.com/feed", 300),
            ("https://a.example.com/feed", 100),
        ] {
            db.subscribe(url).await.unwrap();
            db.upsert_feed(&feed(url, at), Utc::now()).await.unwrap();
        }

        let registry = Registry::start(db, fetcher(), settings()).await.unwrap();
        let urls: Vec<String> = registry
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.url)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://c.example.com/feed",
                "https://a.example.com/feed",
                "https://b.example.com/feed",
            ]
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribe_and_unsubscribe_stay_consistent() {
        let server = gone_server().await;
        let db = test_db().await;
        let registry = Registry::start(db.clone(), fetcher(), settings())
            .await
            .unwrap();
        let url = format!("{}/feed.xml", server.uri());

        for _ in 0..20 {
            registry.subscribe(&url).await.unwrap();
            let (a, b) = (registry.clone(), registry.clone());
            let (u, s) = (url.clone(), url.clone());
            let unsubscribe = tokio::spawn(async move { a.unsubscribe(&u).await });
            let subscribe = tokio::spawn(async move { b.subscribe(&s).await });
            let (unsubscribed, subscribed) = tokio::join!(unsubscribe, subscribe);
            unsubscribed.unwrap().unwrap();
            subscribed.unwrap().unwrap();

            assert_eq!(
                registry.subscriptions().await.unwrap(),
                db.list_subscriptions().await.unwrap()
            );
        }
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_redirect_onto_live_poller_keeps_existing() {
        let server = gone_server().await;
        let db = test_db().await;
        let (mut registry, _commands) = Registry::new(db, fetcher(), settings());
        let old = format!("{}/old.xml", server.uri());
        let new = format!("{}/new.xml", server.uri());

        assert!(registry.subscribe(Url::parse(&old).unwrap()).await.unwrap());
        assert!(registry.subscribe(Url::parse(&new).unwrap()).await.unwrap());
        let old_token = registry.pollers[&old].token.clone();
        let new_token = registry.pollers[&new].token.clone();

        registry
            .on_event(PollerEvent::Redirected {
                from: old.clone(),
                to: new.clone(),
            })
            .await;

        assert_eq!(registry.pollers.keys().cloned().collect::<Vec<_>>(), vec![new]);
        assert!(old_token.is_cancelled());
        assert!(!new_token.is_cancelled());
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_event_drops_poller() {
        let server = gone_server().await;
        let db = test_db().await;
        let (mut registry, _commands) = Registry::new(db.clone(), fetcher(), settings());
        let url = format!("{}/feed.xml", server.uri());
        registry.subscribe(Url::parse(&url).unwrap()).await.unwrap();

        // Removed from storage directly, as the CLI does
        db.unsubscribe(&url).await.unwrap();
        registry
            .on_event(PollerEvent::Unsubscribed { url: url.clone() })
            .await;
        assert!(registry.pollers.is_empty());

        // A stale event for a URL that is subscribed again restarts polling
        db.subscribe(&url).await.unwrap();
        registry
            .on_event(PollerEvent::Unsubscribed { url: url.clone() })
            .await;
        assert!(registry.pollers.contains_key(&url));
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_reports_closed() {
        let registry = Registry::start(test_db().await, fetcher(), settings())
            .await
            .unwrap();
        registry.shutdown().await.unwrap();

        assert!(matches!(
            registry.subscriptions().await,
            Err(RegistryError::Closed)
        ));
    }
}
