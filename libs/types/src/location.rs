//! Server addressing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypeError;

/// Network address of a cache server or locator.
///
/// Equality and hashing use host and port only, so two locations parsed from
/// `"server-a:40404"` compare equal regardless of where they came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerLocation {
    host: String,
    port: u16,
}

impl ServerLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form accepted by socket address resolution
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerLocation {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| TypeError::InvalidLocation(s.to_string()))?;
        if host.is_empty() {
            return Err(TypeError::InvalidLocation(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TypeError::InvalidLocation(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let location: ServerLocation = "cache-1.internal:40404".parse().unwrap();
        assert_eq!(location.host(), "cache-1.internal");
        assert_eq!(location.port(), 40404);
        assert_eq!(location.to_string(), "cache-1.internal:40404");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("no-port".parse::<ServerLocation>().is_err());
        assert!(":40404".parse::<ServerLocation>().is_err());
        assert!("host:notaport".parse::<ServerLocation>().is_err());
        assert!("host:70000".parse::<ServerLocation>().is_err());
    }

    #[test]
    fn equality_ignores_origin() {
        let parsed: ServerLocation = " host:1 ".parse().unwrap();
        assert_eq!(parsed, ServerLocation::new("host", 1));
    }
}
