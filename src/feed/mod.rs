//! Feed retrieval and interpretation.
//!
//! The pieces compose into one polling cycle:
//!
//! - [`fetcher`] - conditional HTTP GET with redirect tracking and body limits
//! - [`parser`] - charset decoding, format detection and the RSS/RDF/Atom readers
//! - [`normalize`] - maps parsed items onto the persisted record
//! - [`schedule`] - refresh interval, TTL and blackout policy
//! - [`poller`] - the per-feed task that drives the cycle
//! - [`opml`] - subscription list import
//!
//! # Example
//!
//! ```ignore
//! use canopy::feed::{Fetcher, Poller, PollerSettings};
//!
//! let fetcher = Fetcher::new(Duration::from_secs(60), false)?;
//! let poller = Poller::new(url, db, fetcher, PollerSettings::default(), None);
//! let final_url = poller.run(token).await;
//! ```

pub mod document;
pub mod fetcher;
pub mod normalize;
pub mod opml;
pub mod parser;
pub mod poller;
pub mod schedule;

pub use document::{Channel, FeedDocument, FeedFormat, Item, Version};
pub use fetcher::{FetchError, FetchResponse, Fetcher, USER_AGENT};
pub use normalize::{normalize, NormalizedItem};
pub use opml::{parse_opml, read_opml, OpmlEntry};
pub use parser::{lenient_charset, parse, parse_with, Decoding, ParseError, ParseErrorKind};
pub use poller::{CycleOutcome, Poller, PollerEvent, PollerSettings, PollerState};
pub use schedule::{Deferral, Schedule};
