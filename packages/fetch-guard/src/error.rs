//! Typed errors for guarded fetching.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can
//! classify failures as transient or permanent without string matching.

use thiserror::Error;

/// Errors raised while validating a destination, before any request is sent.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// URL scheme not allowed (e.g., file://, ftp://)
    #[error("disallowed URL scheme: {0}")]
    DisallowedScheme(String),

    /// URL carries `user:pass@` credentials
    #[error("URL must not embed credentials")]
    EmbeddedCredentials,

    /// Host is blocked by name (e.g., localhost, metadata endpoints)
    #[error("blocked host: {0}")]
    BlockedHost(String),

    /// IP in blocked CIDR range (e.g., 10.0.0.0/8)
    #[error("blocked IP range: {0}")]
    BlockedCidr(String),

    /// URL has no host
    #[error("URL has no host")]
    NoHost,

    /// DNS resolution failed
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    /// DNS answered, but with no addresses
    #[error("host {0} did not resolve to any address")]
    NoAddresses(String),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Errors that can occur while fetching.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Destination failed validation
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Request did not complete within the configured timeout
    #[error("timeout fetching: {url}")]
    Timeout { url: String },

    /// TCP/TLS connection could not be established
    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    /// Any other transport failure
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response carried an unsuccessful status
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// Redirect chain exceeded the configured cap
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: usize },

    /// Redirect response without a usable Location header
    #[error("invalid redirect from {url}")]
    InvalidRedirect { url: String },

    /// The rate limiter was shut down while waiting for a slot
    #[error("rate limiter closed")]
    RateLimiterClosed,
}

impl FetchError {
    /// Whether retrying the same request later can reasonably succeed.
    ///
    /// Timeouts, connection failures, 429 and 5xx are transient. Blocked
    /// destinations, malformed URLs, redirect loops and other 4xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Connect { .. } | FetchError::Http(_) => true,
            FetchError::Status { status, .. } => is_transient_status(*status),
            FetchError::Security(SecurityError::DnsResolution(_)) => true,
            FetchError::Security(_)
            | FetchError::TooManyRedirects { .. }
            | FetchError::InvalidRedirect { .. }
            | FetchError::RateLimiterClosed => false,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the request was refused by address validation.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            FetchError::Security(
                SecurityError::BlockedHost(_)
                    | SecurityError::BlockedCidr(_)
                    | SecurityError::DisallowedScheme(_)
                    | SecurityError::EmbeddedCredentials
            )
        )
    }
}

/// 429 and 5xx are worth retrying; everything else is final.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for security operations.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;
