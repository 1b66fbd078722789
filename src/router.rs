//! Static route table and request-to-route resolution.
//!
//! The table is built once at startup and never mutated; resolution is a
//! pure lookup. Matching is exact-method plus longest-prefix-or-exact-path,
//! with ties broken by declaration order (first match wins).

use std::fmt;

use axum::http::Method;

/// Identity of a backing service the gateway forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamId {
    AuthService,
    ModelService,
}

impl UpstreamId {
    /// All upstreams the gateway knows about, in display order.
    pub const ALL: [UpstreamId; 2] = [UpstreamId::AuthService, UpstreamId::ModelService];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamId::AuthService => "auth-service",
            UpstreamId::ModelService => "model-service",
        }
    }
}

impl fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rate-limit tier applied to a request.
///
/// Exactly one tier applies per request, chosen from the route's
/// `requires_auth` flag and whether the caller presented a verified
/// identity (see [`Route::tier`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Callers without a verified identity, keyed by client IP. Strictest.
    Unauthenticated,
    /// Callers with a verified identity, keyed by user id.
    Authenticated,
    /// Routes the gateway answers itself (health, status).
    Default,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Unauthenticated => "unauthenticated",
            Tier::Authenticated => "authenticated",
            Tier::Default => "default",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a route's pattern is compared against the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Pattern must equal the path exactly.
    Exact,
    /// Pattern must be a segment-aligned prefix of the path.
    Prefix,
}

/// One entry of the static route table.
#[derive(Debug, Clone)]
pub struct Route {
    /// HTTP method this route answers. Method matching is always exact.
    pub method: Method,
    /// Gateway-facing path pattern.
    pub pattern: &'static str,
    pub kind: MatchKind,
    /// Backing service, or `None` for routes the gateway answers itself.
    pub upstream: Option<UpstreamId>,
    /// Upstream-facing path the pattern maps to. For `Prefix` routes the
    /// unmatched suffix is appended.
    pub rewrite: Option<&'static str>,
    /// Bearer credential required; enforced before forwarding.
    pub requires_auth: bool,
    /// Response is relayed chunk-by-chunk instead of buffered.
    pub streaming: bool,
    /// Safe to re-send after a connection failure or timeout. Set per route
    /// at declaration time, never derived from the method at runtime: some
    /// POST routes are replayable (chat, template) while others are not
    /// (register).
    pub retry_safe: bool,
}

impl Route {
    /// A route forwarded to an upstream service.
    fn proxy(
        method: Method,
        pattern: &'static str,
        upstream: UpstreamId,
        rewrite: &'static str,
    ) -> Self {
        Self {
            method,
            pattern,
            kind: MatchKind::Exact,
            upstream: Some(upstream),
            rewrite: Some(rewrite),
            requires_auth: false,
            streaming: false,
            retry_safe: false,
        }
    }

    /// A route the gateway answers itself.
    fn local(method: Method, pattern: &'static str) -> Self {
        Self {
            method,
            pattern,
            kind: MatchKind::Exact,
            upstream: None,
            rewrite: None,
            requires_auth: false,
            streaming: false,
            retry_safe: true,
        }
    }

    fn authenticated(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    fn retry_safe(mut self) -> Self {
        self.retry_safe = true;
        self
    }

    /// Whether this route answers the given method and path.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if self.method != *method {
            return false;
        }
        match self.kind {
            MatchKind::Exact => self.pattern == path,
            MatchKind::Prefix => match path.strip_prefix(self.pattern) {
                // Segment-aligned: "/api/v1/llm" must not capture "/api/v1/llmx"
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }

    /// Upstream-facing path for a request that matched this route.
    ///
    /// Returns `None` for routes without an upstream.
    pub fn upstream_path(&self, request_path: &str) -> Option<String> {
        let rewrite = self.rewrite?;
        match self.kind {
            MatchKind::Exact => Some(rewrite.to_string()),
            MatchKind::Prefix => {
                let rest = request_path.strip_prefix(self.pattern).unwrap_or_default();
                Some(format!("{rewrite}{rest}"))
            }
        }
    }

    /// Rate-limit tier for a request on this route.
    ///
    /// `authenticated` is whether the caller presented a verified identity.
    /// Routes requiring auth land in the authenticated tier once identity is
    /// verified and the strictest tier until then; open proxy routes are
    /// always unauthenticated-tier regardless of any token sent along;
    /// gateway-local routes use the default tier.
    pub fn tier(&self, authenticated: bool) -> Tier {
        if self.requires_auth {
            if authenticated {
                Tier::Authenticated
            } else {
                Tier::Unauthenticated
            }
        } else if self.upstream.is_none() {
            Tier::Default
        } else {
            Tier::Unauthenticated
        }
    }
}

/// A request's resolved route, stashed as an extension so later middleware
/// and the proxy handler resolve exactly once.
#[derive(Clone)]
pub struct ResolvedRoute(pub Route);

/// Immutable route table, built once at startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// The gateway's route table.
    ///
    /// Declaration order matters: on equal-length pattern matches the first
    /// declared route wins.
    pub fn new() -> Self {
        let routes = vec![
            // Account lifecycle, open to anonymous callers
            Route::proxy(
                Method::POST,
                "/api/v1/auth/register",
                UpstreamId::AuthService,
                "/api/auth/register",
            ),
            Route::proxy(
                Method::POST,
                "/api/v1/auth/login",
                UpstreamId::AuthService,
                "/api/auth/login",
            ),
            // Profile management, bearer credential required
            Route::proxy(
                Method::GET,
                "/api/v1/users/me",
                UpstreamId::AuthService,
                "/api/auth/me",
            )
            .authenticated()
            .retry_safe(),
            Route::proxy(
                Method::PUT,
                "/api/v1/users/me",
                UpstreamId::AuthService,
                "/api/auth/me",
            )
            .authenticated(),
            Route::proxy(
                Method::POST,
                "/api/v1/users/me/change-password",
                UpstreamId::AuthService,
                "/api/auth/change-password",
            )
            .authenticated(),
            Route::proxy(
                Method::DELETE,
                "/api/v1/users/me",
                UpstreamId::AuthService,
                "/api/auth/me",
            )
            .authenticated(),
            // Generation endpoints; unary ones are replayable because the
            // upstream produces no side effects before responding
            Route::proxy(
                Method::POST,
                "/api/v1/llm/chat",
                UpstreamId::ModelService,
                "/api/v1/chat",
            )
            .authenticated()
            .retry_safe(),
            Route::proxy(
                Method::POST,
                "/api/v1/llm/template",
                UpstreamId::ModelService,
                "/api/v1/chat/template",
            )
            .authenticated()
            .retry_safe(),
            Route::proxy(
                Method::POST,
                "/api/v1/llm/chat/stream",
                UpstreamId::ModelService,
                "/api/v1/chat/stream",
            )
            .authenticated()
            .streaming(),
            // Answered by the gateway itself
            Route::local(Method::GET, "/health"),
            Route::local(Method::GET, "/services"),
        ];

        Self { routes }
    }

    /// Build a table from explicit routes. Used by tests.
    pub fn from_routes(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Resolve a request to a route, or `None` for a 404.
    ///
    /// Longest matching pattern wins; among equal lengths the first declared
    /// route wins. Pure lookup over immutable data.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if !route.matches(method, path) {
                continue;
            }
            let better = match best {
                None => true,
                // Strictly greater keeps the earlier declaration on ties
                Some(current) => route.pattern.len() > current.pattern.len(),
            };
            if better {
                best = Some(route);
            }
        }
        best
    }

    /// All routes in declaration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_exact_route() {
        let table = RouteTable::new();
        let route = table.resolve(&Method::POST, "/api/v1/auth/login").unwrap();

        assert_eq!(route.upstream, Some(UpstreamId::AuthService));
        assert_eq!(route.rewrite, Some("/api/auth/login"));
        assert!(!route.requires_auth);
    }

    #[test]
    fn test_method_must_match() {
        let table = RouteTable::new();
        assert!(table.resolve(&Method::GET, "/api/v1/auth/login").is_none());
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let table = RouteTable::new();
        assert!(table.resolve(&Method::GET, "/api/v1/nope").is_none());
        assert!(table.resolve(&Method::GET, "/").is_none());
    }

    #[test]
    fn test_stream_route_beats_chat_route() {
        let table = RouteTable::new();
        let route = table
            .resolve(&Method::POST, "/api/v1/llm/chat/stream")
            .unwrap();

        assert!(route.streaming);
        assert!(!route.retry_safe);
        assert_eq!(route.rewrite, Some("/api/v1/chat/stream"));
    }

    #[test]
    fn test_chat_route_is_retry_safe() {
        let table = RouteTable::new();
        let route = table.resolve(&Method::POST, "/api/v1/llm/chat").unwrap();

        assert!(route.retry_safe);
        assert!(!route.streaming);
        assert_eq!(route.upstream, Some(UpstreamId::ModelService));
    }

    #[test]
    fn test_profile_routes_require_auth() {
        let table = RouteTable::new();

        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let route = table.resolve(&method, "/api/v1/users/me").unwrap();
            assert!(route.requires_auth, "{method} /api/v1/users/me");
            assert_eq!(route.rewrite, Some("/api/auth/me"));
        }

        let change = table
            .resolve(&Method::POST, "/api/v1/users/me/change-password")
            .unwrap();
        assert!(change.requires_auth);
        assert!(!change.retry_safe);
    }

    #[test]
    fn test_health_has_no_upstream() {
        let table = RouteTable::new();
        let route = table.resolve(&Method::GET, "/health").unwrap();

        assert!(route.upstream.is_none());
        assert!(route.upstream_path("/health").is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut narrow = Route::proxy(
            Method::GET,
            "/api/v1/llm",
            UpstreamId::ModelService,
            "/api/v1",
        );
        narrow.kind = MatchKind::Prefix;
        let mut wide = Route::proxy(Method::GET, "/api", UpstreamId::AuthService, "/api");
        wide.kind = MatchKind::Prefix;

        // Declared shortest-first to prove length beats order
        let table = RouteTable::from_routes(vec![wide, narrow]);
        let route = table.resolve(&Method::GET, "/api/v1/llm/models").unwrap();

        assert_eq!(route.upstream, Some(UpstreamId::ModelService));
        assert_eq!(
            route.upstream_path("/api/v1/llm/models").unwrap(),
            "/api/v1/models"
        );
    }

    #[test]
    fn test_equal_length_tie_goes_to_first_declared() {
        let first = Route::proxy(Method::GET, "/same", UpstreamId::AuthService, "/a");
        let second = Route::proxy(Method::GET, "/same", UpstreamId::ModelService, "/b");

        let table = RouteTable::from_routes(vec![first, second]);
        let route = table.resolve(&Method::GET, "/same").unwrap();

        assert_eq!(route.upstream, Some(UpstreamId::AuthService));
    }

    #[test]
    fn test_prefix_match_is_segment_aligned() {
        let mut route = Route::proxy(
            Method::GET,
            "/api/v1/llm",
            UpstreamId::ModelService,
            "/api/v1",
        );
        route.kind = MatchKind::Prefix;
        let table = RouteTable::from_routes(vec![route]);

        assert!(table.resolve(&Method::GET, "/api/v1/llm").is_some());
        assert!(table.resolve(&Method::GET, "/api/v1/llm/x").is_some());
        assert!(table.resolve(&Method::GET, "/api/v1/llmx").is_none());
    }

    #[test]
    fn test_tier_follows_auth_flag_and_identity() {
        let table = RouteTable::new();

        let profile = table.resolve(&Method::GET, "/api/v1/users/me").unwrap();
        assert_eq!(profile.tier(true), Tier::Authenticated);
        assert_eq!(profile.tier(false), Tier::Unauthenticated);

        // Open proxy routes stay in the strictest tier even with a token
        let login = table.resolve(&Method::POST, "/api/v1/auth/login").unwrap();
        assert_eq!(login.tier(true), Tier::Unauthenticated);
        assert_eq!(login.tier(false), Tier::Unauthenticated);

        let health = table.resolve(&Method::GET, "/health").unwrap();
        assert_eq!(health.tier(false), Tier::Default);
        assert_eq!(health.tier(true), Tier::Default);
    }

    #[test]
    fn test_upstream_ids_display_as_service_names() {
        assert_eq!(UpstreamId::AuthService.to_string(), "auth-service");
        assert_eq!(UpstreamId::ModelService.to_string(), "model-service");
        assert_eq!(Tier::Unauthenticated.to_string(), "unauthenticated");
    }
}
