//! Textual network addresses
//!
//! The bridge is handed its endpoints as `host:port` strings by the
//! recording proxy. `NetAddr` keeps them in parsed form so the in-memory
//! pipe can report proper local/remote addresses and the dialer can
//! connect without re-validating.

use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// A `host:port` network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub host: String,
    pub port: u16,
}

impl NetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for NetAddr {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::BadParameter(format!("missing port in address {s:?}")))?;
        // Bracketed IPv6 form: [::1]:22
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(RelayError::BadParameter(format!(
                "missing host in address {s:?}"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RelayError::BadParameter(format!("invalid port in address {s:?}")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr: NetAddr = "node.example.com:3022".parse().unwrap();
        assert_eq!(addr.host, "node.example.com");
        assert_eq!(addr.port, 3022);
        assert_eq!(addr.to_string(), "node.example.com:3022");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr: NetAddr = "[::1]:22".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 22);
        assert_eq!(addr.to_string(), "[::1]:22");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("just-a-host".parse::<NetAddr>().is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!("host:notaport".parse::<NetAddr>().is_err());
        assert!("host:99999".parse::<NetAddr>().is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(":22".parse::<NetAddr>().is_err());
    }
}
