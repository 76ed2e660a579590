//! SQLite implementation of the storage contract.
//!
//! [`Database`] persists the subscription set, feed metadata and a capped
//! window of recent items per feed. `impl Database` is split by concern:
//! schema and connection setup, feed reads/writes, and subscriptions.

mod feeds;
mod schema;
mod subscriptions;
mod types;

pub use schema::{Database, DEFAULT_ITEM_WINDOW};
pub use types::{DatabaseError, FetchRecord, PersistedFeed, PersistedItem, UpsertOutcome};
