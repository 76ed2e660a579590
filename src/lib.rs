//! canopy keeps a window of recent items for a set of subscribed RSS, RDF and
//! Atom feeds. One poller per feed fetches conditionally, parses, normalises
//! and writes into SQLite; the [`registry`] supervises the pollers.

pub mod config;
pub mod feed;
pub mod registry;
pub mod storage;
pub mod util;
