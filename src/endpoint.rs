//! Endpoints and source identities.
//!
//! An [`Address`] is a reachable `host:port` pair; an [`Endpoint`] adds the
//! logical database index. The endpoint's `Display` form, `host:port:db`,
//! is the stable identity under which every persisted artifact (snapshot,
//! checkpoint, lock) is namespaced.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error parsing an address or node specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    /// Not of the form `host:port`.
    #[error("invalid address {0:?}, expected host:port")]
    InvalidAddress(String),

    /// Not of the form `node_<i>#host:port`.
    #[error("invalid node spec {0:?}, expected node_<i>#host:port")]
    InvalidNodeSpec(String),
}

/// A `host:port` pair identifying one store instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Hostname or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Create an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Bind this address to a database index.
    pub fn endpoint(&self, db: u32) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            db,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplit so IPv6-ish hosts with colons still take the last segment
        // as the port.
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrParseError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddrParseError::InvalidAddress(s.to_string()))?;
        Ok(Address::new(host, port))
    }
}

/// One store instance plus database index. The unit every other component
/// addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Logical database index (`SELECT`ed after connect).
    pub db: u32,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16, db: u32) -> Self {
        Self {
            host: host.into(),
            port,
            db,
        }
    }

    /// The address part without the database index.
    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    /// Stable identity string, `host:port:db`. Used to namespace snapshot,
    /// checkpoint, and lock records so multiple sources never collide.
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.db)
    }
}

/// Parse a sharded-target node spec of the form `node_<i>#host:port`,
/// returning the 1-based node number and address.
pub fn parse_node_spec(s: &str) -> Result<(u32, Address), AddrParseError> {
    let (name, addr) = s
        .split_once('#')
        .ok_or_else(|| AddrParseError::InvalidNodeSpec(s.to_string()))?;
    let number = name
        .strip_prefix("node_")
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|&n| n >= 1)
        .ok_or_else(|| AddrParseError::InvalidNodeSpec(s.to_string()))?;
    let addr = addr
        .parse::<Address>()
        .map_err(|_| AddrParseError::InvalidNodeSpec(s.to_string()))?;
    Ok((number, addr))
}
