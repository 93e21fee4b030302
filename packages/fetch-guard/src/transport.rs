//! Single-hop HTTP transport.
//!
//! A transport performs exactly one request to an address that has already
//! been validated. It never follows redirects; the fetcher does that after
//! re-validating each target.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::{FetchError, FetchResult};

/// An outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Follow (re-validated) redirects. On by default for GET.
    pub follow_redirects: bool,
}

impl OutboundRequest {
    /// A GET request that follows redirects.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
            follow_redirects: true,
        }
    }

    /// A POST request with a body. Redirects are not followed.
    pub fn post(url: Url, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: Vec::new(),
            body: Some(body),
            follow_redirects: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request to issue after a redirect with `status` to `location`.
    ///
    /// 303 always becomes a bodiless GET; 301/302 do too unless the original
    /// method was GET or HEAD. 307/308 preserve method and body.
    pub(crate) fn redirected(mut self, location: Url, status: StatusCode) -> Self {
        let switch_to_get = match status.as_u16() {
            303 => self.method != Method::HEAD,
            301 | 302 => self.method != Method::GET && self.method != Method::HEAD,
            _ => false,
        };
        if switch_to_get {
            self.method = Method::GET;
            self.body = None;
            self.headers
                .retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
        }
        self.url = location;
        self
    }
}

/// A response as received from a single hop.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Performs one request against a pinned address.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &OutboundRequest,
        remote: SocketAddr,
        timeout: Duration,
    ) -> FetchResult<RawResponse>;
}

/// Reqwest-backed transport.
///
/// Builds a client per request so the connection is pinned to the address
/// that passed validation, closing the window for DNS rebinding between the
/// check and the connect.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new("fetch-guard/0.1")
    }
}

impl ReqwestTransport {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &OutboundRequest,
        remote: SocketAddr,
        timeout: Duration,
    ) -> FetchResult<RawResponse> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(self.user_agent.as_str());

        if let Some(domain) = request.url.domain() {
            builder = builder.resolve(domain, remote);
        }

        let client = builder.build().map_err(|e| FetchError::Http(Box::new(e)))?;

        let mut outbound = client.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            outbound = outbound.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            outbound = outbound.body(body.clone());
        }

        debug!(url = %request.url, remote = %remote, method = %request.method, "HTTP request starting");

        let response = outbound
            .send()
            .await
            .map_err(|e| classify_reqwest(e, &request.url))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest(e, &request.url))?
            .to_vec();

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest(error: reqwest::Error, url: &Url) -> FetchError {
    if error.is_timeout() {
        warn!(url = %url, "HTTP request timed out");
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else if error.is_connect() {
        warn!(url = %url, error = %error, "HTTP connect failed");
        FetchError::Connect {
            url: url.to_string(),
            reason: error.to_string(),
        }
    } else {
        warn!(url = %url, error = %error, "HTTP request failed");
        FetchError::Http(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_see_other_turns_post_into_get() {
        let req = OutboundRequest::post(url("https://example.com/a"), b"{}".to_vec())
            .with_header("Content-Type", "application/json");
        let next = req.redirected(url("https://example.com/b"), StatusCode::SEE_OTHER);
        assert_eq!(next.method, Method::GET);
        assert!(next.body.is_none());
        assert!(next.header("content-type").is_none());
    }

    #[test]
    fn test_temporary_redirect_keeps_method() {
        let req = OutboundRequest::post(url("https://example.com/a"), b"{}".to_vec());
        let next = req.redirected(url("https://example.com/b"), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(next.method, Method::POST);
        assert_eq!(next.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(next.url.path(), "/b");
    }
}
