//! Testing utilities including mock implementations.
//!
//! Useful for exercising code built on the fetcher without DNS or network.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, LOCATION};
use reqwest::Method;

use crate::error::{FetchError, FetchResult, SecurityError, SecurityResult};
use crate::resolver::Resolver;
use crate::transport::{OutboundRequest, RawResponse, Transport};

/// Resolver answering from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address for `host`.
    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts
            .entry(host.into().to_ascii_lowercase())
            .or_default()
            .push(ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup(&self, host: &str, port: u16) -> SecurityResult<Vec<SocketAddr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| SecurityError::DnsResolution(format!("{}: no such host", host)))
    }
}

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(RawResponse),
    Timeout,
    ConnectionRefused,
}

/// Record of a request made to the mock transport.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: Method,
    pub url: String,
    pub remote: SocketAddr,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub at: tokio::time::Instant,
}

/// Transport returning scripted replies per URL.
///
/// Replies for a URL are consumed in order; the last one repeats. URLs
/// without a script answer 404.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    replies: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `url`.
    pub fn with_reply(self, url: impl Into<String>, reply: MockReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.into())
            .or_default()
            .push_back(reply);
        self
    }

    /// Queue a status-only response for `url`.
    pub fn with_status(self, url: impl Into<String>, status: u16) -> Self {
        self.with_reply(url, MockReply::Response(RawResponse::new(status)))
    }

    /// Queue a response with a body for `url`.
    pub fn with_body(self, url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.with_reply(
            url,
            MockReply::Response(RawResponse::new(status).with_body(body)),
        )
    }

    /// Queue a redirect from `url` to `location`.
    pub fn with_redirect(self, url: impl Into<String>, status: u16, location: &str) -> Self {
        let mut response = RawResponse::new(status);
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers.insert(LOCATION, value);
        }
        self.with_reply(url, MockReply::Response(response))
    }

    /// Queue a status sequence for `url`.
    pub fn with_statuses(self, url: &str, statuses: &[u16]) -> Self {
        statuses
            .iter()
            .fold(self, |mock, status| mock.with_status(url, *status))
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether any request was sent to `ip`.
    pub fn contacted(&self, ip: IpAddr) -> bool {
        self.calls().iter().any(|c| c.remote.ip() == ip)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &OutboundRequest,
        remote: SocketAddr,
        _timeout: Duration,
    ) -> FetchResult<RawResponse> {
        let url = request.url.to_string();

        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall {
                method: request.method.clone(),
                url: url.clone(),
                remote,
                headers: request.headers.clone(),
                body: request.body.clone(),
                at: tokio::time::Instant::now(),
            });

        let reply = {
            let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
            match replies.get_mut(&url) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::Timeout) => Err(FetchError::Timeout { url }),
            Some(MockReply::ConnectionRefused) => Err(FetchError::Connect {
                url,
                reason: "connection refused".to_string(),
            }),
            None => Ok(RawResponse::new(404)),
        }
    }
}
