//! DNS resolution seam.
//!
//! Validation resolves hostnames itself so the address that was checked is
//! the address the request is pinned to.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{SecurityError, SecurityResult};

/// Resolves a hostname to socket addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> SecurityResult<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> SecurityResult<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SecurityError::DnsResolution(format!("{}: {}", host, e)))?;

        Ok(addrs.collect())
    }
}
