use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;

impl Database {
    // ========================================================================
    // Subscription Set
    // ========================================================================

    /// Adds a URL to the subscription set. Returns `false` if it was already there.
    pub async fn subscribe(&self, url: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO subscriptions (url, subscribed_at) VALUES (?, ?) ON CONFLICT(url) DO NOTHING",
        )
        .bind(url)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bulk subscribe (OPML import). Returns how many URLs were new.
    /// PERF-001: Batch INSERT in chunks of 100
    pub async fn subscribe_many(&self, urls: &[String]) -> Result<usize> {
        if urls.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 100;
        let now = chrono::Utc::now().timestamp();
        let mut added = 0;
        let mut tx = self.pool.begin().await?;

        for chunk in urls.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO subscriptions (url, subscribed_at) ");
            builder.push_values(chunk, |mut b, url| {
                b.push_bind(url).push_bind(now);
            });
            builder.push(" ON CONFLICT(url) DO NOTHING");
            added += builder.build().execute(&mut *tx).await?.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(added)
    }

    /// Removes a subscription together with its stored feed and items.
    /// Returns `false` if the URL was not subscribed.
    pub async fn unsubscribe(&self, url: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM feed_fetches WHERE feed_url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feed_items WHERE feed_url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM subscriptions WHERE url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Subscribed URLs, oldest subscription first.
    pub async fn list_subscriptions(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT url FROM subscriptions ORDER BY subscribed_at, url")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    pub async fn is_subscribed(&self, url: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM subscriptions WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Re-keys a feed after a permanent redirect: subscription, feed row,
    /// items and fetch log move to `to` in one transaction.
    ///
    /// Returns `false` without changing anything when `to` is already
    /// subscribed, since another poller owns that URL.
    pub async fn move_feed(&self, from: &str, to: &str) -> Result<bool> {
        if from == to {
            return Ok(true);
        }

        let mut tx = self.pool.begin().await?;

        let taken: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM subscriptions WHERE url = ?")
            .bind(to)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Ok(false);
        }

        // Leftovers of an earlier feed at the target URL
        sqlx::query("DELETE FROM feed_fetches WHERE feed_url = ?")
            .bind(to)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feed_items WHERE feed_url = ?")
            .bind(to)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(to)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE subscriptions SET url = ? WHERE url = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE feeds SET url = ? WHERE url = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE feed_items SET feed_url = ? WHERE feed_url = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE feed_fetches SET feed_url = ? WHERE feed_url = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
