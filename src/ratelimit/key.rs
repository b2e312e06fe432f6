//! Rate limit key construction.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// A composite rate limit key.
///
/// The key is made of ordered `name=value` entries and rendered as a single
/// string, which is what counters receive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Key-value pairs, in insertion order
    pub entries: Vec<(String, String)>,
}

impl LimitKey {
    /// Create an empty key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.entries.push((name.to_string(), value.to_string()));
        self
    }

    /// Append the client address, canonicalised with [`ip_key`].
    pub fn with_ip(self, addr: IpAddr) -> Self {
        self.with("ip", &ip_key(addr))
    }

    /// Convert the key to its string representation.
    pub fn to_string_key(&self) -> String {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        entries.join(",")
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Key for a client address.
///
/// IPv6 clients usually control a whole /64, so addresses are reduced to
/// their /64 prefix. IPv4-mapped IPv6 addresses are treated as IPv4.
pub fn ip_key(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => {
                let prefix = u128::from(v6) & (!0u128 << 64);
                format!("{}/64", Ipv6Addr::from(prefix))
            }
        },
    }
}
