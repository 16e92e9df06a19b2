//! Network address of a partition server

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a storage host: `hostname:port`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionServerAddress {
    pub hostname: String,
    pub port: u16,
}

impl PartitionServerAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        s.parse()
    }
}

impl FromStr for PartitionServerAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (hostname, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::InvalidConfig(format!("invalid host address: {}", s)))?;
        if hostname.is_empty() {
            return Err(crate::Error::InvalidConfig(format!(
                "invalid host address: {}",
                s
            )));
        }
        let port = port
            .parse()
            .map_err(|_| crate::Error::InvalidConfig(format!("invalid port in address: {}", s)))?;
        Ok(Self::new(hostname, port))
    }
}

impl fmt::Display for PartitionServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        let addr = PartitionServerAddress::parse("server-7:12345").unwrap();
        assert_eq!(addr.hostname, "server-7");
        assert_eq!(addr.port, 12345);
        assert_eq!(addr.to_string(), "server-7:12345");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(PartitionServerAddress::parse("no-port").is_err());
        assert!(PartitionServerAddress::parse(":1").is_err());
        assert!(PartitionServerAddress::parse("host:notaport").is_err());
        assert!(PartitionServerAddress::parse("host:70000").is_err());
    }

    #[test]
    fn test_ordering() {
        let mut addrs = vec![
            PartitionServerAddress::new("b", 1),
            PartitionServerAddress::new("a", 2),
            PartitionServerAddress::new("a", 1),
        ];
        addrs.sort();
        assert_eq!(addrs[0].to_string(), "a:1");
        assert_eq!(addrs[2].to_string(), "b:1");
    }
}
