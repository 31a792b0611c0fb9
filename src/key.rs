//! Mapping requests to rate-limit keys.
//!
//! A key names the population that shares one set of buckets. Resolution is
//! total: every request gets a key, falling back to a shared default key when
//! nothing identifies the caller.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

/// Default header carrying an API client identity.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-client-id";
/// Default header carrying the proxy chain.
pub const DEFAULT_FORWARDED_HEADER: &str = "x-forwarded-for";
/// Key shared by requests nothing else identifies.
pub const DEFAULT_KEY: &str = "public";

/// Tenant id resolved by an earlier layer (e.g. authentication).
///
/// Insert it as a request extension; it takes precedence over any header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantId(pub String);

/// Socket address of the connected peer, as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// The parts of a request that key resolution looks at.
pub trait RequestContext {
    /// Tenant id already established for this request.
    fn tenant_id(&self) -> Option<&str>;
    /// Header value by (case-insensitive) name, if present and valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;
    /// Address of the directly connected peer.
    fn peer_addr(&self) -> Option<IpAddr>;
    /// Request path.
    fn path(&self) -> &str;
}

impl<B> RequestContext for http::Request<B> {
    fn tenant_id(&self) -> Option<&str> {
        self.extensions().get::<TenantId>().map(|t| t.0.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn peer_addr(&self) -> Option<IpAddr> {
        self.extensions().get::<ClientAddr>().map(|a| a.0.ip())
    }

    fn path(&self) -> &str {
        self.uri().path()
    }
}

/// Which sources a [`KeyResolver`] consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Tenant id, then identity header, then client address, then default.
    #[default]
    Tenant,
    /// Client address, then default. For routes without tenant identity.
    ClientAddress,
}

/// Resolves a request to its rate-limit key.
///
/// Keys are namespaced by source (`tenant:`, `client:`, `ip:`) so a client id
/// can never alias a tenant id. The default key is returned as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResolver {
    strategy: KeyStrategy,
    identity_header: Option<String>,
    forwarded_header: Option<String>,
    default_key: String,
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(KeyStrategy::Tenant)
    }
}

impl KeyResolver {
    /// Resolver with the default headers and default key.
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            strategy,
            identity_header: Some(DEFAULT_IDENTITY_HEADER.to_string()),
            forwarded_header: Some(DEFAULT_FORWARDED_HEADER.to_string()),
            default_key: DEFAULT_KEY.to_string(),
        }
    }

    /// Header to read client identities from; `None` disables it.
    pub fn identity_header(mut self, name: Option<impl Into<String>>) -> Self {
        self.identity_header = name.map(|n| n.into().to_ascii_lowercase());
        self
    }

    /// Header to read the proxy chain from; `None` trusts only the peer address.
    pub fn forwarded_header(mut self, name: Option<impl Into<String>>) -> Self {
        self.forwarded_header = name.map(|n| n.into().to_ascii_lowercase());
        self
    }

    /// Key used when nothing identifies the caller.
    pub fn default_key(mut self, key: impl Into<String>) -> Self {
        self.default_key = key.into();
        self
    }

    /// The configured strategy.
    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Resolve `req` to a key. Never fails.
    pub fn resolve<R: RequestContext + ?Sized>(&self, req: &R) -> String {
        if self.strategy == KeyStrategy::Tenant {
            if let Some(tenant) = non_blank(req.tenant_id()) {
                return format!("tenant:{}", tenant);
            }
            if let Some(client) = self.identity_header.as_deref().and_then(|h| non_blank(req.header(h))) {
                return format!("client:{}", client);
            }
        }
        match self.client_ip(req) {
            Some(ip) => format!("ip:{}", ip),
            None => self.default_key.clone(),
        }
    }

    fn client_ip<R: RequestContext + ?Sized>(&self, req: &R) -> Option<IpAddr> {
        let forwarded = self
            .forwarded_header
            .as_deref()
            .and_then(|h| req.header(h))
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .and_then(|hop| hop.parse::<IpAddr>().ok());
        forwarded.or_else(|| req.peer_addr())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::request::Builder {
        http::Request::builder().uri("/v1/items")
    }

    #[test]
    fn tenant_beats_header() {
        let mut req = request().header("x-client-id", "abc").body(()).unwrap();
        req.extensions_mut().insert(TenantId("acme".into()));
        assert_eq!(KeyResolver::default().resolve(&req), "tenant:acme");
    }

    #[test]
    fn header_beats_address() {
        let req = request()
            .header("X-Client-Id", "abc")
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        assert_eq!(KeyResolver::default().resolve(&req), "client:abc");
    }

    #[test]
    fn first_forwarded_hop_wins_over_peer() {
        let mut req = request()
            .header("x-forwarded-for", " 203.0.113.42 , 10.0.0.1")
            .body(())
            .unwrap();
        req.extensions_mut().insert(ClientAddr("10.0.0.9:5000".parse().unwrap()));
        assert_eq!(KeyResolver::default().resolve(&req), "ip:203.0.113.42");
    }

    #[test]
    fn unparseable_forwarded_falls_back_to_peer() {
        let mut req = request().header("x-forwarded-for", "unknown").body(()).unwrap();
        req.extensions_mut().insert(ClientAddr("[::1]:443".parse().unwrap()));
        assert_eq!(KeyResolver::default().resolve(&req), "ip:::1");
    }

    #[test]
    fn blank_values_are_skipped() {
        let mut req = request().header("x-client-id", "  ").header("x-forwarded-for", "").body(()).unwrap();
        req.extensions_mut().insert(TenantId(String::new()));
        assert_eq!(KeyResolver::default().resolve(&req), "public");
    }

    #[test]
    fn client_address_strategy_ignores_identity() {
        let mut req = request().header("x-client-id", "abc").body(()).unwrap();
        req.extensions_mut().insert(TenantId("acme".into()));
        req.extensions_mut().insert(ClientAddr("192.0.2.1:80".parse().unwrap()));
        let resolver = KeyResolver::new(KeyStrategy::ClientAddress);
        assert_eq!(resolver.resolve(&req), "ip:192.0.2.1");
    }

    #[test]
    fn custom_headers_and_default_key() {
        let req = request().header("x-api-key", "k1").body(()).unwrap();
        let resolver = KeyResolver::default()
            .identity_header(Some("X-Api-Key"))
            .forwarded_header(None::<String>)
            .default_key("anon");
        assert_eq!(resolver.resolve(&req), "client:k1");
        assert_eq!(resolver.resolve(&request().body(()).unwrap()), "anon");
    }
}
