//! SSRF-safe fetcher.
//!
//! Every hop (the initial URL and each redirect target) is validated and
//! resolved before any bytes are sent, and the request is pinned to the
//! address that passed validation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, LOCATION};
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{FetchError, FetchResult};
use crate::rate_limit::RateLimiter;
use crate::resolver::{Resolver, SystemResolver};
use crate::transport::{OutboundRequest, ReqwestTransport, Transport};
use crate::validator::{ResolvedTarget, UrlValidator};

/// Fetcher settings.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-hop request timeout
    pub timeout: Duration,
    /// Redirects followed before giving up
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
            user_agent: "AuditBot/1.0".to_string(),
        }
    }
}

impl FetchConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Final response of a (possibly redirected) fetch.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// URL of the hop that produced this response
    pub final_url: Url,
    /// Address the final hop connected to
    pub remote_addr: SocketAddr,
    /// Redirects followed to get here
    pub redirects: usize,
}

impl FetchedResponse {
    /// Turn a non-2xx response into [`FetchError::Status`].
    pub fn error_for_status(self) -> FetchResult<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::Status {
                status: self.status.as_u16(),
                url: self.final_url.to_string(),
            })
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Outbound HTTP with address validation, redirect re-validation, pinning
/// and optional rate limiting.
pub struct SafeFetcher {
    validator: UrlValidator,
    resolver: Arc<dyn Resolver>,
    transport: Arc<dyn Transport>,
    limiter: Option<Arc<RateLimiter>>,
    config: FetchConfig,
}

impl SafeFetcher {
    /// A fetcher using system DNS and reqwest.
    pub fn new(config: FetchConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(config.user_agent.clone()));
        Self::with_parts(UrlValidator::new(), Arc::new(SystemResolver), transport, config)
    }

    pub fn with_parts(
        validator: UrlValidator,
        resolver: Arc<dyn Resolver>,
        transport: Arc<dyn Transport>,
        config: FetchConfig,
    ) -> Self {
        Self {
            validator,
            resolver,
            transport,
            limiter: None,
            config,
        }
    }

    /// Gate every hop through `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn validator(&self) -> &UrlValidator {
        &self.validator
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Validate and resolve a URL without sending anything.
    pub async fn check_url(&self, url: &str) -> FetchResult<ResolvedTarget> {
        let parsed = self.validator.validate(url)?;
        Ok(self
            .validator
            .resolve_and_check(&parsed, self.resolver.as_ref())
            .await?)
    }

    /// GET `url`, following validated redirects.
    pub async fn fetch(&self, url: &str) -> FetchResult<FetchedResponse> {
        let parsed = self.validator.validate(url)?;
        self.send(OutboundRequest::get(parsed)).await
    }

    /// Send an arbitrary request.
    pub async fn send(&self, request: OutboundRequest) -> FetchResult<FetchedResponse> {
        let mut request = request;
        let mut redirects = 0usize;

        loop {
            let target = self
                .validator
                .resolve_and_check(&request.url, self.resolver.as_ref())
                .await?;
            let remote = target.primary_addr();

            let raw = {
                let _permit = match &self.limiter {
                    Some(limiter) => Some(limiter.acquire(&target.host).await?),
                    None => None,
                };
                self.transport
                    .send(&request, remote, self.config.timeout)
                    .await?
            };

            if request.follow_redirects && is_redirect(raw.status) {
                if redirects >= self.config.max_redirects {
                    warn!(url = %request.url, limit = self.config.max_redirects, "redirect limit reached");
                    return Err(FetchError::TooManyRedirects {
                        limit: self.config.max_redirects,
                    });
                }

                let location = raw
                    .headers
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| request.url.join(loc).ok())
                    .ok_or_else(|| FetchError::InvalidRedirect {
                        url: request.url.to_string(),
                    })?;

                debug!(from = %request.url, to = %location, status = raw.status.as_u16(), "following redirect");
                request = request.redirected(location, raw.status);
                redirects += 1;
                continue;
            }

            info!(
                url = %request.url,
                remote = %remote,
                status = raw.status.as_u16(),
                redirects,
                "fetch completed"
            );

            return Ok(FetchedResponse {
                status: raw.status,
                headers: raw.headers,
                body: raw.body,
                final_url: request.url,
                remote_addr: remote,
                redirects,
            });
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}
