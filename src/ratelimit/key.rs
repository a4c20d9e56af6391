//! Rate key generation and handling.

use std::fmt;
use std::sync::Arc;

use axum::http::Method;

/// Client identifier used when a request carries neither a user id nor a
/// resolvable address.
pub const FALLBACK_CLIENT: &str = "0.0.0.0";

/// A key that uniquely identifies one rate limited bucket.
///
/// The key is composed of the logical route being protected and the client
/// the request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    /// The logical route (rule scope) this key belongs to
    pub route: String,
    /// The client identifier (IP address or `user:<id>`)
    pub client: String,
}

impl RateKey {
    /// Create a new rate key from a client identifier and a route key.
    ///
    /// An empty client identifier is replaced with [`FALLBACK_CLIENT`].
    pub fn new(client: &str, route: &str) -> Self {
        let client = client.trim();
        let client = if client.is_empty() { FALLBACK_CLIENT } else { client };

        Self {
            route: route.to_string(),
            client: client.to_string(),
        }
    }

    /// Convert the rate key to its storage representation.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.route, self.client)
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// What the limiter knows about a request when deriving its key.
#[derive(Debug, Clone, Copy)]
pub struct RequestIdentity<'a> {
    /// Client identifier, already defaulted
    pub client: &'a str,
    /// Logical route resolved from the rule table
    pub route: &'a str,
    /// Request method
    pub method: &'a Method,
    /// Raw request path
    pub path: &'a str,
}

impl RequestIdentity<'_> {
    /// The key used when no generator override is installed.
    pub fn default_key(&self) -> RateKey {
        RateKey::new(self.client, self.route)
    }
}

/// Override for deriving the bucket key from request context.
pub type KeyGenerator = Arc<dyn Fn(&RequestIdentity<'_>) -> RateKey + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_key_creation() {
        let key = RateKey::new("10.1.2.3", "/api/auth");

        assert_eq!(key.route, "/api/auth");
        assert_eq!(key.client, "10.1.2.3");
        assert_eq!(key.to_string_key(), "/api/auth:10.1.2.3");
    }

    #[test]
    fn test_empty_client_uses_fallback() {
        let key = RateKey::new("", "default");
        assert_eq!(key.client, FALLBACK_CLIENT);

        let key = RateKey::new("   ", "default");
        assert_eq!(key.client, FALLBACK_CLIENT);
    }

    #[test]
    fn test_rate_key_equality() {
        let key1 = RateKey::new("user:42", "/api/search");
        let key2 = RateKey::new("user:42", "/api/search");
        let key3 = RateKey::new("user:42", "default");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_identity_default_key() {
        let method = Method::GET;
        let identity = RequestIdentity {
            client: "192.168.0.7",
            route: "default",
            method: &method,
            path: "/api/posts/12",
        };

        assert_eq!(identity.default_key(), RateKey::new("192.168.0.7", "default"));
    }
}
