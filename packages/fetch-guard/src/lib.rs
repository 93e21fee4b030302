//! Guarded outbound HTTP.
//!
//! Outbound requests made on behalf of untrusted input (crawled pages,
//! caller-supplied callback URLs) must never reach internal addresses and
//! must not overwhelm the sites they target. This crate provides both
//! guarantees:
//!
//! - [`UrlValidator`] rejects non-HTTP schemes, embedded credentials and
//!   loopback/private/link-local/unique-local destinations, after DNS.
//! - [`SafeFetcher`] validates every hop, including redirect targets, pins
//!   the connection to the validated address and caps redirects.
//! - [`RateLimiter`] bounds global concurrency and paces requests per host,
//!   with presets per [`ServiceTier`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fetch_guard::{FetchConfig, RateLimiter, SafeFetcher, ServiceTier};
//!
//! let limiter = Arc::new(RateLimiter::for_tier(ServiceTier::Pro));
//! let fetcher = SafeFetcher::new(FetchConfig::default()).with_rate_limiter(limiter);
//!
//! let page = fetcher.fetch("https://example.com/").await?.error_for_status()?;
//! println!("{} bytes from {}", page.body.len(), page.remote_addr);
//! ```

pub mod error;
pub mod fetcher;
pub mod rate_limit;
pub mod resolver;
pub mod testing;
pub mod transport;
pub mod validator;

pub use error::{is_transient_status, FetchError, FetchResult, SecurityError, SecurityResult};
pub use fetcher::{FetchConfig, FetchedResponse, SafeFetcher};
pub use rate_limit::{ParseTierError, RateLimitConfig, RateLimiter, RatePermit, ServiceTier};
pub use resolver::{Resolver, SystemResolver};
pub use transport::{OutboundRequest, RawResponse, ReqwestTransport, Transport};
pub use validator::{ResolvedTarget, UrlValidator};
