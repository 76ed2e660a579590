//! Utility functions shared by the registry and the fetcher.
//!
//! - **URL validation**: scheme checks plus SSRF protection for feed URLs
//!
//! # Examples
//!
//! ```
//! use canopy::util::validate_feed_url;
//!
//! let url = validate_feed_url("https://example.com/feed.xml", false).unwrap();
//! assert_eq!(url.scheme(), "https");
//! ```

mod url_validator;

pub use url_validator::{validate_feed_url, UrlValidationError};
