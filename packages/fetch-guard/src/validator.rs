//! URL and address validation for SSRF protection.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::debug;
use url::{Host, Url};

use crate::error::{SecurityError, SecurityResult};
use crate::resolver::Resolver;

/// Ranges no outbound request may reach.
const BLOCKED_CIDRS: &[&str] = &[
    "0.0.0.0/8",          // "This" network
    "10.0.0.0/8",         // Private
    "100.64.0.0/10",      // Carrier-grade NAT
    "127.0.0.0/8",        // Loopback
    "169.254.0.0/16",     // Link-local / cloud metadata
    "172.16.0.0/12",      // Private
    "192.168.0.0/16",     // Private
    "224.0.0.0/4",        // Multicast
    "255.255.255.255/32", // Broadcast
    "::/128",             // IPv6 unspecified
    "::1/128",            // IPv6 loopback
    "fc00::/7",           // IPv6 unique-local
    "fe80::/10",          // IPv6 link-local
    "ff00::/8",           // IPv6 multicast
];

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "metadata.google.internal",
    "metadata.gke.internal",
    "instance-data",
];

/// A destination that passed validation, with the addresses it resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub url: Url,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
}

impl ResolvedTarget {
    /// The address the request will be pinned to.
    pub fn primary_addr(&self) -> SocketAddr {
        self.addrs[0]
    }
}

/// URL validator for SSRF protection.
///
/// Validates URLs before fetching to prevent:
/// - Access to internal services (localhost, 127.0.0.1, ::1)
/// - Access to private ranges (10.x, 172.16.x, 192.168.x, fc00::/7)
/// - Access to cloud metadata services (169.254.x)
/// - Non-HTTP(S) schemes (file://, ftp://)
/// - Credentials smuggled in the authority (`user:pass@host`)
#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<ipnet::IpNet>,
    /// Hosts that skip the address checks (still resolved)
    allowed_hosts: HashSet<String>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlValidator {
    /// Create a new URL validator with default security rules.
    pub fn new() -> Self {
        Self {
            allowed_schemes: ["http", "https"].into_iter().map(String::from).collect(),
            blocked_hosts: BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
            blocked_cidrs: BLOCKED_CIDRS
                .iter()
                .filter_map(|cidr| cidr.parse().ok())
                .collect(),
            allowed_hosts: HashSet::new(),
        }
    }

    /// Add an allowed host (bypasses address checks).
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    /// Block an additional host.
    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    /// Block an additional CIDR range.
    pub fn block_cidr(mut self, cidr: ipnet::IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    /// Parse and statically validate a URL (no DNS).
    pub fn validate(&self, url: &str) -> SecurityResult<Url> {
        let parsed = Url::parse(url)?;
        self.validate_url(&parsed)?;
        Ok(parsed)
    }

    /// Statically validate an already parsed URL (no DNS).
    pub fn validate_url(&self, url: &Url) -> SecurityResult<()> {
        if !self.allowed_schemes.contains(url.scheme()) {
            return Err(SecurityError::DisallowedScheme(url.scheme().to_string()));
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(SecurityError::EmbeddedCredentials);
        }

        let host = url.host().ok_or(SecurityError::NoHost)?;
        let host_key = host_key(&host);

        if self.allowed_hosts.contains(&host_key) {
            return Ok(());
        }

        if self.blocked_hosts.contains(&host_key) || host_key.ends_with(".localhost") {
            return Err(SecurityError::BlockedHost(host_key));
        }

        match host {
            Host::Ipv4(ip) => self.check_ip(IpAddr::V4(ip)),
            Host::Ipv6(ip) => self.check_ip(IpAddr::V6(ip)),
            Host::Domain(_) => Ok(()),
        }
    }

    /// Reject an address in any blocked range.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are checked as IPv4.
    pub fn check_ip(&self, ip: IpAddr) -> SecurityResult<()> {
        let candidates = match ip {
            IpAddr::V6(v6) => match embedded_ipv4(v6) {
                Some(v4) => vec![ip, IpAddr::V4(v4)],
                None => vec![ip],
            },
            IpAddr::V4(_) => vec![ip],
        };

        for candidate in candidates {
            if self.blocked_cidrs.iter().any(|cidr| cidr.contains(&candidate)) {
                return Err(SecurityError::BlockedCidr(ip.to_string()));
            }
        }

        Ok(())
    }

    /// Validate a URL and resolve DNS to check every address it maps to.
    ///
    /// This catches hostnames that resolve to internal addresses. A host is
    /// rejected if *any* of its addresses is blocked.
    pub async fn resolve_and_check(
        &self,
        url: &Url,
        resolver: &dyn Resolver,
    ) -> SecurityResult<ResolvedTarget> {
        self.validate_url(url)?;

        let host = url.host().ok_or(SecurityError::NoHost)?;
        let host_key = host_key(&host);
        let port = url.port_or_known_default().unwrap_or(80);

        let addrs = match host {
            Host::Ipv4(ip) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
            Host::Ipv6(ip) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
            Host::Domain(domain) => resolver.lookup(domain, port).await?,
        };

        if addrs.is_empty() {
            return Err(SecurityError::NoAddresses(host_key));
        }

        if !self.allowed_hosts.contains(&host_key) {
            for addr in &addrs {
                if self.check_ip(addr.ip()).is_err() {
                    return Err(SecurityError::BlockedCidr(format!(
                        "DNS for {} resolved to blocked IP {}",
                        host_key,
                        addr.ip()
                    )));
                }
            }
        }

        debug!(host = %host_key, addrs = ?addrs, "destination validated");

        Ok(ResolvedTarget {
            url: url.clone(),
            host: host_key,
            addrs,
        })
    }
}

fn host_key(host: &Host<&str>) -> String {
    match host {
        Host::Domain(domain) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}

/// The IPv4 address an IPv6 address carries, if any.
///
/// Covers mapped and compatible forms (`::ffff:a.b.c.d`, `::a.b.c.d`), the
/// NAT64 prefix `64:ff9b::/96` and 6to4 `2002::/16`.
fn embedded_ipv4(v6: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = v6.to_ipv4() {
        return Some(v4);
    }
    let o = v6.octets();
    match v6.segments() {
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(Ipv4Addr::new(o[12], o[13], o[14], o[15])),
        [0x2002, ..] => Some(Ipv4Addr::new(o[2], o[3], o[4], o[5])),
        _ => None,
    }
}
