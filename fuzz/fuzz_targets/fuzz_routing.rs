//! Fuzz testing for request routing and proxy trust parsing.
//!
//! This fuzz target feeds arbitrary input to the code paths that handle
//! untrusted request data before any upstream work happens. It ensures
//! they:
//!
//! - Never panic on any input
//! - Always produce a deterministic match or a clean miss
//! - Handle edge cases like empty paths, non-ASCII bytes, and embedded NULs
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the routing fuzz target
//! cargo +nightly fuzz run fuzz_routing
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_routing -- -max_total_time=60
//!
//! # View coverage
//! cargo +nightly fuzz coverage fuzz_routing
//! ```
//!
//! # What This Tests
//!
//! - `RouteTable::resolve`: Method and path matching over arbitrary paths
//! - `Route::upstream_path`: Path rewriting for matched routes
//! - `TrustedProxyConfig::new`: CIDR range parsing from arbitrary strings
//! - `TrustedProxyConfig::is_trusted_peer`: Membership checks for arbitrary addresses

#![no_main]

use std::net::IpAddr;
use std::sync::LazyLock;

use axum::http::Method;
use libfuzzer_sys::fuzz_target;
use lilfox_gateway::RouteTable;
use lilfox_gateway::middleware::TrustedProxyConfig;

static TABLE: LazyLock<RouteTable> = LazyLock::new(RouteTable::new);

fuzz_target!(|data: &[u8]| {
    // Try to interpret the bytes as a UTF-8 string for path matching
    if let Ok(s) = std::str::from_utf8(data) {
        for method in [Method::GET, Method::POST, Method::PUT, Method::DELETE] {
            // Resolution must not panic and a match must rewrite cleanly
            if let Some(route) = TABLE.resolve(&method, s) {
                let _ = route.upstream_path(s);
                let _ = route.tier(false);
                let _ = route.tier(true);
            }
        }

        // CIDR parsing must reject garbage without panicking
        let trusted = TrustedProxyConfig::new(&[s.to_string()]);
        let _ = trusted.is_enabled();

        // Membership checks against both address families
        if data.len() >= 4 {
            let v4 = IpAddr::from([data[0], data[1], data[2], data[3]]);
            let _ = trusted.is_trusted_peer(&v4);
        }
        if data.len() >= 16 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let v6 = IpAddr::from(octets);
            let _ = trusted.is_trusted_peer(&v6);
        }
    }
});
