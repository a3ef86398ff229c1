//! Identifier resolution and store key generation.

use std::net::IpAddr;

/// Identifier used when a request carries neither a token nor a usable
/// network address.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// The subject being throttled: an API token or a textual network address.
///
/// Every identifier owns exactly two keys in the counter store, a block flag
/// and a window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Create an identifier from a raw string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Resolve the identifier for a request.
    ///
    /// A non-blank token takes priority over the client address. Requests
    /// with neither share the `unknown` identifier.
    pub fn resolve(token: Option<&str>, addr: Option<IpAddr>) -> Self {
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            return Self::new(token);
        }

        match addr {
            Some(addr) => Self::new(addr.to_string()),
            None => Self::new(UNKNOWN_IDENTIFIER),
        }
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of the block flag.
    pub fn block_key(&self) -> String {
        format!("block:{}", self.0)
    }

    /// Store key of the window counter.
    pub fn counter_key(&self) -> String {
        format!("rate:{}", self.0)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_token_wins_over_address() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let id = Identifier::resolve(Some("abc123"), Some(addr));
        assert_eq!(id.as_str(), "abc123");
    }

    #[test]
    fn test_blank_token_falls_back_to_address() {
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(Identifier::resolve(Some("   "), Some(addr)).as_str(), "127.0.0.1");
        assert_eq!(Identifier::resolve(None, Some(addr)).as_str(), "127.0.0.1");
    }

    #[test]
    fn test_token_is_trimmed() {
        let id = Identifier::resolve(Some(" abc123 \t"), None);
        assert_eq!(id.as_str(), "abc123");
    }

    #[test]
    fn test_ipv6_address() {
        let id = Identifier::resolve(None, Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(id.as_str(), "::1");
    }

    #[test]
    fn test_unknown_when_nothing_available() {
        assert_eq!(Identifier::resolve(None, None).as_str(), UNKNOWN_IDENTIFIER);
    }

    #[test]
    fn test_store_keys() {
        let id = Identifier::new("127.0.0.1");
        assert_eq!(id.block_key(), "block:127.0.0.1");
        assert_eq!(id.counter_key(), "rate:127.0.0.1");
        assert_eq!(id.to_string(), "127.0.0.1");
    }
}
