use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_message, DatabaseError};

/// Items kept per feed unless configured otherwise.
pub const DEFAULT_ITEM_WINDOW: usize = 7;

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed implementation of the storage contract.
///
/// Cloning is cheap and shares the pool. Every write touches a single feed
/// and runs in its own transaction.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) item_window: usize,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Create the file owner-only before SQLite does
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "SEC-010: Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: pollers writing concurrently wait for the single
        // writer lock instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self {
            pool,
            item_window: DEFAULT_ITEM_WINDOW,
        };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Sets the per-feed item cap. Values below 1 are raised to 1.
    pub fn with_item_window(mut self, window: usize) -> Self {
        self.item_window = window.max(1);
        self
    }

    pub fn item_window(&self) -> usize {
        self.item_window
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                url TEXT PRIMARY KEY NOT NULL,
                subscribed_at INTEGER NOT NULL,
                last_fetched_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY NOT NULL,
                website_url TEXT,
                title TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_items (
                feed_url TEXT NOT NULL,
                key TEXT NOT NULL,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                permalink TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                PRIMARY KEY (feed_url, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // One row per fetch attempt; `status` is NULL when no response arrived
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_fetches (
                id INTEGER PRIMARY KEY,
                feed_url TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                status INTEGER,
                error TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feed_fetches_feed ON feed_fetches(feed_url, id DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Window queries filter by feed and sort newest first
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feed_items_recent ON feed_items(feed_url, published_at DESC, key)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
