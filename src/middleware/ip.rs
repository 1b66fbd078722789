//! Client IP resolution for rate limiting and logging.
//!
//! The resolved IP feeds the per-caller rate-limit key and the forwarding
//! headers added to proxied requests, so it must not be trivially
//! spoofable.
//!
//! # Trust Model
//!
//! `X-Forwarded-For` and `X-Real-IP` are client-controlled bytes. They are
//! honored only when the connection's peer address falls inside a
//! configured trusted-proxy CIDR range; otherwise the socket peer address
//! wins. With no ranges configured the headers are trusted as-is, which is
//! only safe when an edge proxy overwrites them:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! # The "unknown" Fallback
//!
//! Requests with neither usable headers nor peer information (possible in
//! tests or behind unusual transports) all share the [`UNKNOWN_IP`] key,
//! so they are collectively rate-limited rather than unlimited.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback key when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix: u8,
}

impl CidrRange {
    /// Parse CIDR notation (`"10.0.0.0/8"`, `"::1/128"`) or a bare IP,
    /// which gets an implicit host prefix.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip_part, prefix_part) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = ip_part.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix = match prefix_part {
            Some(p) => p.parse().ok()?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return None;
        }

        Some(Self { network, prefix })
    }

    /// Whether `ip` falls inside this range. Mixed IPv4/IPv6 never matches.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Which peers are allowed to speak for the client via forwarding headers.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let mut ranges = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            match CidrRange::parse(cidr) {
                Some(range) => ranges.push(range),
                None => warn!(cidr = %cidr, "Unparseable TRUSTED_PROXIES entry skipped"),
            }
        }

        Self { ranges }
    }

    /// Whether peer validation is active (any ranges configured).
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `peer` may inject forwarding headers.
    pub fn is_trusted_peer(&self, peer: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(peer))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// IP candidate found in forwarding headers, borrowed from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardedIp<'a> {
    /// First entry of `X-Forwarded-For` (the chain lists the client first).
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

#[inline]
fn forwarded_ip<B>(req: &Request<B>) -> ForwardedIp<'_> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next()
        && !first_ip.trim().is_empty()
    {
        return ForwardedIp::FromXff(first_ip.trim());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ForwardedIp::FromRealIp(value.trim());
    }

    ForwardedIp::NotFound
}

/// Peer address of the underlying connection, if the server recorded it.
#[inline]
fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Resolve the client IP for this request.
///
/// Forwarding headers are consulted only when allowed by the trust model
/// (see module docs); the connection peer address is the authoritative
/// fallback.
///
/// Returns `Cow<'static, str>`: borrowed for the [`UNKNOWN_IP`] case, owned
/// otherwise. Use `.into_owned()` where the key must outlive the request.
pub fn client_ip<B>(req: &Request<B>, trusted: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = peer_addr(req);

    let headers_allowed = if trusted.is_enabled() {
        match peer {
            Some(ip) => trusted.is_trusted_peer(&ip),
            // No peer info: cannot prove the sender is a proxy
            None => false,
        }
    } else {
        true
    };

    if headers_allowed {
        match forwarded_ip(req) {
            ForwardedIp::FromXff(ip) | ForwardedIp::FromRealIp(ip) => {
                return Cow::Owned(ip.to_string());
            }
            ForwardedIp::NotFound => {}
        }
    } else if !matches!(forwarded_ip(req), ForwardedIp::NotFound) {
        debug!(
            peer = ?peer,
            "Forwarding headers from untrusted peer ignored"
        );
    }

    match peer {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}
