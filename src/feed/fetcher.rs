use crate::feed::parser::ParseError;
use crate::util::validate_feed_url;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LOCATION};
use reqwest::{redirect::Policy, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Identifying user agent sent with every request.
pub const USER_AGENT: &str = concat!("canopy/", env!("CARGO_PKG_VERSION"), " (feed fetcher)");

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 10;

/// RFC 1123 layout required by `If-Modified-Since`.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Errors that can occur during one poll cycle.
///
/// Fetch-level variants are produced here; the poller adds parse and
/// storage failures so a cycle has a single error type.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured fetch timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with a status other than 200 or 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Feed document could not be parsed or has an unsupported version
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// Storage operation failed while persisting the cycle's result
    #[error("Database error: {0}")]
    Database(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Redirect chain longer than 10 hops
    #[error("Too many redirects (max 10)")]
    TooManyRedirects,
    /// Redirect without a usable `Location`, or to a disallowed target
    #[error("Invalid redirect: {0}")]
    InvalidRedirect(String),
}

/// Raw outcome of one conditional GET.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Present only for 200 responses.
    pub body: Option<Vec<u8>>,
    /// `ETag` of a 200 response, if the server sent one.
    pub etag: Option<String>,
    /// The URL after following permanent redirects only. Equal to the
    /// requested URL when no permanent redirect was seen.
    pub resolved: Url,
    /// `charset` parameter of the `Content-Type` header.
    pub charset: Option<String>,
}

impl FetchResponse {
    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// Conditional HTTP fetcher shared by all pollers.
///
/// Redirects are followed by hand so permanent moves can be told apart from
/// temporary ones. Cloning is cheap; the connection pool is shared.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    allow_private: bool,
    max_body: usize,
}

impl Fetcher {
    pub fn new(timeout: Duration, allow_private: bool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::none())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            timeout,
            allow_private,
            max_body: MAX_FEED_SIZE,
        })
    }

    /// Overrides the response size cap.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.max_body = limit;
        self
    }

    /// Performs one conditional GET.
    ///
    /// `If-Modified-Since` is sent when `last_fetch` is set and `If-None-Match`
    /// when `etag` is non-empty. Every HTTP status is returned as a
    /// [`FetchResponse`]; only transport failures, oversized bodies and broken
    /// redirect chains are errors. The whole exchange, redirects included, is
    /// bounded by the configured timeout.
    pub async fn fetch(
        &self,
        url: &Url,
        last_fetch: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<FetchResponse, FetchError> {
        tokio::time::timeout(self.timeout, self.fetch_following(url, last_fetch, etag))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_following(
        &self,
        url: &Url,
        last_fetch: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<FetchResponse, FetchError> {
        let mut target = url.clone();
        let mut resolved = url.clone();
        let mut permanent_chain = true;

        for hop in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(target.clone());
            if let Some(last) = last_fetch {
                request = request.header(IF_MODIFIED_SINCE, last.format(HTTP_DATE_FORMAT).to_string());
            }
            if let Some(tag) = etag.filter(|t| !t.is_empty()) {
                request = request.header(IF_NONE_MATCH, tag);
            }

            let response = request.send().await.map_err(classify)?;
            let status = response.status();

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                if hop == MAX_REDIRECTS {
                    break;
                }
                let next = self.redirect_target(&target, &response)?;
                let permanent = matches!(
                    status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
                );
                // A permanent hop behind a temporary one is not a move of the feed
                permanent_chain &= permanent;
                if permanent_chain {
                    resolved = next.clone();
                }
                tracing::debug!(
                    from = %target,
                    to = %next,
                    status = status.as_u16(),
                    hop = hop + 1,
                    "Following redirect"
                );
                target = next;
                continue;
            }

            if status != StatusCode::OK {
                return Ok(FetchResponse {
                    status: status.as_u16(),
                    body: None,
                    etag: None,
                    resolved,
                    charset: None,
                });
            }

            let etag = header_str(&response, ETAG).map(str::to_string);
            let charset = header_str(&response, CONTENT_TYPE).and_then(charset_param);
            let body = read_limited_bytes(response, self.max_body).await?;

            return Ok(FetchResponse {
                status: status.as_u16(),
                body: Some(body),
                etag,
                resolved,
                charset,
            });
        }

        Err(FetchError::TooManyRedirects)
    }

    fn redirect_target(&self, from: &Url, response: &reqwest::Response) -> Result<Url, FetchError> {
        let location = header_str(response, LOCATION)
            .ok_or_else(|| FetchError::InvalidRedirect("missing Location header".into()))?;
        let next = from
            .join(location.trim())
            .map_err(|e| FetchError::InvalidRedirect(format!("{}: {}", location, e)))?;
        validate_feed_url(next.as_str(), self.allow_private)
            .map_err(|e| FetchError::InvalidRedirect(format!("{}: {}", next, e)))
    }
}

fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(error)
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Extracts `charset` from a `Content-Type` value such as
/// `application/rss+xml; charset="ISO-8859-1"`.
fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // EDGE-005: a truncated body would parse as malformed XML at best
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
