use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use std::collections::HashMap;

use super::schema::Database;
use super::types::{
    from_unix, sort_and_dedup, FeedDbRow, FetchDbRow, FetchRecord, ItemDbRow, PersistedFeed,
    PersistedItem, UpsertOutcome,
};

const ITEM_COLUMNS: &str = "feed_url, key, title, link, permalink, published_at";

/// Fetch log entries kept per feed.
const FETCH_LOG_LIMIT: usize = 50;

impl Database {
    // ========================================================================
    // Feed Reads
    // ========================================================================

    /// All stored feeds with their item windows, in no particular order.
    ///
    /// Runs in one read transaction so a concurrent write is seen either
    /// completely or not at all.
    pub async fn read_all(&self) -> Result<Vec<PersistedFeed>> {
        let mut tx = self.pool.begin().await?;

        let feeds: Vec<FeedDbRow> =
            sqlx::query_as("SELECT url, website_url, title, updated_at FROM feeds")
                .fetch_all(&mut *tx)
                .await?;
        let items: Vec<ItemDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feed_items ORDER BY feed_url, published_at DESC, key ASC",
            ITEM_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut by_feed: HashMap<String, Vec<PersistedItem>> = HashMap::new();
        for row in items {
            by_feed
                .entry(row.feed_url.clone())
                .or_default()
                .push(row.into_item());
        }

        Ok(feeds
            .into_iter()
            .map(|row| {
                let items = by_feed.remove(&row.url).unwrap_or_default();
                row.into_feed(items)
            })
            .collect())
    }

    pub async fn read_feed(&self, url: &str) -> Result<Option<PersistedFeed>> {
        let mut tx = self.pool.begin().await?;

        let feed: Option<FeedDbRow> =
            sqlx::query_as("SELECT url, website_url, title, updated_at FROM feeds WHERE url = ?")
                .bind(url)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(feed) = feed else {
            return Ok(None);
        };

        let items: Vec<ItemDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feed_items WHERE feed_url = ? ORDER BY published_at DESC, key ASC",
            ITEM_COLUMNS
        ))
        .bind(url)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(feed.into_feed(
            items.into_iter().map(ItemDbRow::into_item).collect(),
        )))
    }

    // ========================================================================
    // Feed Writes
    // ========================================================================

    /// Writes one fetch result for a feed atomically.
    ///
    /// Incoming items are sorted newest first, de-duplicated by key and cut
    /// to the item window. When the newest incoming key equals the newest
    /// stored key nothing but the attempt time changes. Otherwise the
    /// metadata and the whole item window are replaced, and the feed's
    /// `updated_at` becomes the newest incoming publish date; the caller's
    /// `updated_at` is not used.
    ///
    /// A URL that is no longer subscribed is left untouched and reported as
    /// [`UpsertOutcome::NotSubscribed`].
    pub async fn upsert_feed(
        &self,
        feed: &PersistedFeed,
        fetched_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut items = feed.items.clone();
        sort_and_dedup(&mut items);
        items.truncate(self.item_window);

        let mut tx = self.pool.begin().await?;

        let stamped = sqlx::query("UPDATE subscriptions SET last_fetched_at = ? WHERE url = ?")
            .bind(fetched_at.timestamp())
            .bind(&feed.url)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if stamped == 0 {
            return Ok(UpsertOutcome::NotSubscribed);
        }

        let Some(top) = items.first() else {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged);
        };

        let stored_top: Option<(String,)> = sqlx::query_as(
            "SELECT key FROM feed_items WHERE feed_url = ? ORDER BY published_at DESC, key ASC LIMIT 1",
        )
        .bind(&feed.url)
        .fetch_optional(&mut *tx)
        .await?;

        if stored_top.is_some_and(|(key,)| key == top.key) {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged);
        }

        sqlx::query(
            r#"
            INSERT INTO feeds (url, website_url, title, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET website_url = excluded.website_url,
                title = excluded.title, updated_at = excluded.updated_at
        "#,
        )
        .bind(&feed.url)
        .bind(&feed.website_url)
        .bind(&feed.title)
        .bind(top.published_at.timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM feed_items WHERE feed_url = ?")
            .bind(&feed.url)
            .execute(&mut *tx)
            .await?;

        const BATCH_SIZE: usize = 100;
        for chunk in items.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("INSERT INTO feed_items ({}) ", ITEM_COLUMNS));
            builder.push_values(chunk, |mut b, item| {
                b.push_bind(&feed.url)
                    .push_bind(&item.key)
                    .push_bind(&item.title)
                    .push_bind(&item.link)
                    .push_bind(&item.permalink)
                    .push_bind(item.published_at.timestamp());
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(UpsertOutcome::Written)
    }

    // ========================================================================
    // Fetch Attempts
    // ========================================================================

    /// Time of the last fetch attempt for a subscribed feed; `None` if it was
    /// never fetched or is not subscribed.
    pub async fn last_update_time(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT last_fetched_at FROM subscriptions WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(at,)| at).map(from_unix))
    }

    /// Stamps a fetch attempt that produced no content change.
    ///
    /// Returns `false` when the URL is not subscribed.
    pub async fn record_attempt(&self, url: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE subscriptions SET last_fetched_at = ? WHERE url = ?")
            .bind(at.timestamp())
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Appends one entry to a subscribed feed's fetch log and drops entries
    /// beyond [`FETCH_LOG_LIMIT`]. Unsubscribed URLs are ignored.
    pub async fn record_fetch(
        &self,
        url: &str,
        at: DateTime<Utc>,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO feed_fetches (feed_url, fetched_at, status, error)
            SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM subscriptions WHERE url = ?)
        "#,
        )
        .bind(url)
        .bind(at.timestamp())
        .bind(status.map(i64::from))
        .bind(error)
        .bind(url)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM feed_fetches WHERE feed_url = ? AND id NOT IN (
                SELECT id FROM feed_fetches WHERE feed_url = ? ORDER BY id DESC LIMIT ?
            )
        "#,
        )
        .bind(url)
        .bind(url)
        .bind(FETCH_LOG_LIMIT as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Logged fetch attempts for a feed, newest first.
    pub async fn recent_fetches(&self, url: &str, limit: usize) -> Result<Vec<FetchRecord>> {
        let rows: Vec<FetchDbRow> = sqlx::query_as(
            "SELECT fetched_at, status, error FROM feed_fetches WHERE feed_url = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(url)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FetchDbRow::into_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::FETCH_LOG_LIMIT;
    use crate::storage::{Database, FetchRecord, PersistedFeed, PersistedItem, UpsertOutcome};
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const FEED_URL: &str = "https://example.com/feed.xml";

    async fn test_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.subscribe(FEED_URL).await.unwrap();
        db
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn test_item(key: &str, day: u32) -> PersistedItem {
        PersistedItem {
            key: key.to_string(),
            title: format!("Item {}", key),
            link: format!("https://example.com/{}", key),
            permalink: format!("https://example.com/{}", key),
            published_at: at(day),
        }
    }

    fn test_feed(items: Vec<PersistedItem>) -> PersistedFeed {
        PersistedFeed {
            url: FEED_URL.to_string(),
            website_url: Some("https://example.com/".to_string()),
            title: "Example".to_string(),
            updated_at: DateTime::<Utc>::default(),
            items,
        }
    }

    fn keys(feed: &PersistedFeed) -> Vec<&str> {
        feed.items.iter().map(|i| i.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_upsert_new_feed() {
        let db = test_db().await;
        let outcome = db
            .upsert_feed(&test_feed(vec![test_item("a", 1), test_item("b", 3)]), at(10))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Written);

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(keys(&stored), vec!["b", "a"]);
        assert_eq!(stored.updated_at, at(3));
        assert_eq!(stored.title, "Example");
        assert_eq!(stored.website_url.as_deref(), Some("https://example.com/"));
        assert_eq!(db.last_update_time(FEED_URL).await.unwrap(), Some(at(10)));
    }

    #[tokio::test]
    async fn test_upsert_same_top_key_is_unchanged() {
        let db = test_db().await;
        db.upsert_feed(&test_feed(vec![test_item("a", 1)]), at(10))
            .await
            .unwrap();

        let mut renamed = test_feed(vec![test_item("a", 1)]);
        renamed.title = "Renamed".to_string();
        let outcome = db.upsert_feed(&renamed, at(11)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(stored.title, "Example");
        assert_eq!(db.last_update_time(FEED_URL).await.unwrap(), Some(at(11)));
    }

    #[tokio::test]
    async fn test_upsert_replaces_window() {
        let db = test_db().await;
        let first: Vec<_> = (1..=5).map(|d| test_item(&format!("k{}", d), d)).collect();
        db.upsert_feed(&test_feed(first), at(20)).await.unwrap();

        let second: Vec<_> = (6..=9).map(|d| test_item(&format!("k{}", d), d)).collect();
        db.upsert_feed(&test_feed(second), at(21)).await.unwrap();

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(keys(&stored), vec!["k9", "k8", "k7", "k6"]);
        assert_eq!(stored.updated_at, at(9));
    }

    #[tokio::test]
    async fn test_upsert_drops_items_missing_from_new_document() {
        let db = test_db().await;
        db.upsert_feed(&test_feed(vec![test_item("a", 5), test_item("b", 4)]), at(10))
            .await
            .unwrap();
        db.upsert_feed(&test_feed(vec![test_item("c", 6)]), at(11))
            .await
            .unwrap();

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(keys(&stored), vec!["c"]);
        assert_eq!(stored.updated_at, at(6));
    }

    #[tokio::test]
    async fn test_upsert_incoming_set_is_cut_to_window() {
        let db = test_db().await;
        let items: Vec<_> = (1..=10).map(|d| test_item(&format!("k{}", d), d)).collect();
        db.upsert_feed(&test_feed(items), at(20)).await.unwrap();

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(
            keys(&stored),
            vec!["k10", "k9", "k8", "k7", "k6", "k5", "k4"]
        );
    }

    #[tokio::test]
    async fn test_custom_window() {
        let db = test_db().await.with_item_window(2);
        let items: Vec<_> = (1..=4).map(|d| test_item(&format!("k{}", d), d)).collect();
        db.upsert_feed(&test_feed(items), at(20)).await.unwrap();

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(keys(&stored), vec!["k4", "k3"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_item_fields() {
        let db = test_db().await;
        db.upsert_feed(&test_feed(vec![test_item("a", 1)]), at(10))
            .await
            .unwrap();

        let mut edited = test_item("a", 1);
        edited.title = "Edited".to_string();
        db.upsert_feed(&test_feed(vec![test_item("b", 2), edited]), at(11))
            .await
            .unwrap();

        let stored = db.read_feed(FEED_URL).await.unwrap().unwrap();
        assert_eq!(keys(&stored), vec!["b", "a"]);
        assert_eq!(stored.items[1].title, "Edited");
    }

    #[tokio::test]
    async fn test_empty_upsert_only_stamps_attempt() {
        let db = test_db().await;
        let outcome = db.upsert_feed(&test_feed(Vec::new()), at(5)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert!(db.read_feed(FEED_URL).await.unwrap().is_none());
        assert_eq!(db.last_update_time(FEED_URL).await.unwrap(), Some(at(5)));
    }

    #[tokio::test]
    async fn test_read_all_groups_items() {
        let db = test_db().await;
        db.upsert_feed(&test_feed(vec![test_item("a", 1)]), at(10))
            .await
            .unwrap();

        let mut other = test_feed(vec![test_item("x", 2), test_item("y", 4)]);
        other.url = "https://other.example/rss".to_string();
        db.subscribe(&other.url).await.unwrap();
        db.upsert_feed(&other, at(10)).await.unwrap();

        let mut all = db.read_all().await.unwrap();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        assert_eq!(all.len(), 2);
        assert_eq!(keys(&all[0]), vec!["a"]);
        assert_eq!(keys(&all[1]), vec!["y", "x"]);
    }

    #[tokio::test]
    async fn test_upsert_unsubscribed_feed_writes_nothing() {
        let db = test_db().await;
        db.upsert_feed(&test_feed(vec![test_item("a", 1)]), at(10))
            .await
            .unwrap();
        db.unsubscribe(FEED_URL).await.unwrap();

        let outcome = db
            .upsert_feed(&test_feed(vec![test_item("b", 2)]), at(11))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::NotSubscribed);
        assert!(db.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_update_time_and_record_attempt() {
        let db = test_db().await;
        assert_eq!(db.last_update_time(FEED_URL).await.unwrap(), None);
        assert_eq!(
            db.last_update_time("https://unknown.example/").await.unwrap(),
            None
        );

        assert!(db.record_attempt(FEED_URL, at(3)).await.unwrap());
        assert_eq!(db.last_update_time(FEED_URL).await.unwrap(), Some(at(3)));
        assert!(!db
            .record_attempt("https://unknown.example/", at(3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_record_fetch_newest_first() {
        let db = test_db().await;
        db.record_fetch(FEED_URL, at(1), Some(200), None).await.unwrap();
        db.record_fetch(FEED_URL, at(2), None, Some("connection refused"))
            .await
            .unwrap();
        db.record_fetch(FEED_URL, at(3), Some(404), Some("HTTP error: 404"))
            .await
            .unwrap();

        let log = db.recent_fetches(FEED_URL, 10).await.unwrap();
        assert_eq!(
            log,
            vec![
                FetchRecord {
                    fetched_at: at(3),
                    status: Some(404),
                    error: Some("HTTP error: 404".to_string()),
                },
                FetchRecord {
                    fetched_at: at(2),
                    status: None,
                    error: Some("connection refused".to_string()),
                },
                FetchRecord {
                    fetched_at: at(1),
                    status: Some(200),
                    error: None,
                },
            ]
        );
        assert_eq!(db.recent_fetches(FEED_URL, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_fetch_caps_log() {
        let db = test_db().await;
        for _ in 0..FETCH_LOG_LIMIT + 5 {
            db.record_fetch(FEED_URL, at(1), Some(304), None).await.unwrap();
        }
        let log = db.recent_fetches(FEED_URL, 1000).await.unwrap();
        assert_eq!(log.len(), FETCH_LOG_LIMIT);
    }

    #[tokio::test]
    async fn test_record_fetch_ignores_unsubscribed() {
        let db = test_db().await;
        let other = "https://unknown.example/";
        db.record_fetch(other, at(1), Some(200), None).await.unwrap();
        assert!(db.recent_fetches(other, 10).await.unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_window_is_capped_and_sorted(
            batches in proptest::collection::vec(
                proptest::collection::vec((0u8..20, 1u32..28), 0..12),
                1..4,
            )
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let db = test_db().await;
                for batch in &batches {
                    let items = batch
                        .iter()
                        .map(|(k, day)| test_item(&format!("k{}", k), *day))
                        .collect();
                    db.upsert_feed(&test_feed(items), at(28)).await.unwrap();
                }

                if let Some(stored) = db.read_feed(FEED_URL).await.unwrap() {
                    assert!(stored.items.len() <= db.item_window());
                    assert!(stored
                        .items
                        .windows(2)
                        .all(|w| w[0].published_at >= w[1].published_at));
                    assert_eq!(Some(stored.updated_at), stored.items.first().map(|i| i.published_at));
                }
            });
        }
    }
}
