//! Path-aware endpoint addresses.
//!
//! Addresses are carried around the engine as strings of the form
//! `ISD-AS,[host]:port`, e.g. `19-ffaa:1:c3f,[141.44.25.148]:43000`. This
//! module parses them just enough to swap ports and to compare hosts; full
//! address resolution lives in the transport layer.

use std::fmt;

use crate::error::*;

/// A parsed path-aware endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScionAddr {
    /// The ISD-AS identifier, e.g. `19-ffaa:1:c3f`.
    pub ia: String,
    /// The host without brackets, e.g. `141.44.25.148`.
    pub host: String,
    /// The UDP port.
    pub port: u16,
}

impl ScionAddr {
    pub fn new(
        ia: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            ia: ia.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses an `ISD-AS,[host]:port` string.
    pub fn parse(s: &str) -> Result<Self> {
        let err = || Error::Config(format!("invalid scion address {:?}", s));

        let (ia, rest) = s.split_at(s.find(",[").ok_or_else(err)?);
        let rest = &rest[2..];
        let (host, rest) = rest.split_at(rest.find("]:").ok_or_else(err)?);
        let port = rest[2..].parse().map_err(|_| err())?;

        if ia.is_empty() || host.is_empty() {
            return Err(err());
        }

        Ok(Self::new(ia, host, port))
    }

    /// Returns the same endpoint with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            ia: self.ia.clone(),
            host: self.host.clone(),
            port,
        }
    }

    /// Returns true if the other endpoint is the same host in the same AS,
    /// regardless of port.
    pub fn same_host(&self, other: &ScionAddr) -> bool {
        self.ia == other.ia && self.host == other.host
    }
}

impl fmt::Display for ScionAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},[{}]:{}", self.ia, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let s = "19-ffaa:1:c3f,[141.44.25.148]:43000";
        let addr = ScionAddr::parse(s).unwrap();
        assert_eq!(addr.ia, "19-ffaa:1:c3f");
        assert_eq!(addr.host, "141.44.25.148");
        assert_eq!(addr.port, 43000);
        assert_eq!(addr.to_string(), s);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ScionAddr::parse("").is_err());
        assert!(ScionAddr::parse("141.44.25.148:43000").is_err());
        assert!(ScionAddr::parse("19-ffaa:1:c3f,[]:43000").is_err());
        assert!(ScionAddr::parse("19-ffaa:1:c3f,[1.2.3.4]:x").is_err());
    }

    #[test]
    fn test_with_port() {
        let addr =
            ScionAddr::parse("19-ffaa:1:c3f,[141.44.25.148]:43000").unwrap();
        let moved = addr.with_port(7000);
        assert_eq!(moved.port, 7000);
        assert!(addr.same_host(&moved));
    }
}
