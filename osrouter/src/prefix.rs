//! Address prefixes as handed to `ifconfig` and `route`.
//!
//! A [`Prefix`] is an address plus a mask length. The address family is
//! derived from the address itself. Two prefixes are equal only when both
//! the address and the length match, so `10.0.0.1/24` and `10.0.0.0/24`
//! are different prefixes even though they describe the same network.

use ipnetwork::{IpNetwork, IpNetworkError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while building or parsing a prefix.
#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("invalid prefix `{input}`: {source}")]
    Parse {
        input: String,
        #[source]
        source: IpNetworkError,
    },

    #[error("invalid mask length {bits} for {addr}")]
    Length { addr: IpAddr, bits: u8 },
}

/// Address family of a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Keyword `ifconfig` expects before an address.
    pub fn ifconfig_keyword(self) -> &'static str {
        match self {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        }
    }

    /// Flag `route` expects to select the family.
    pub fn route_flag(self) -> &'static str {
        match self {
            Family::V4 => "-inet",
            Family::V6 => "-inet6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ifconfig_keyword())
    }
}

/// An (address, mask length) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prefix(IpNetwork);

impl Prefix {
    pub fn new(addr: IpAddr, bits: u8) -> Result<Self, PrefixError> {
        IpNetwork::new(addr, bits)
            .map(Prefix)
            .map_err(|_| PrefixError::Length { addr, bits })
    }

    pub fn addr(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn bits(&self) -> u8 {
        self.0.prefix()
    }

    pub fn family(&self) -> Family {
        match self.0 {
            IpNetwork::V4(_) => Family::V4,
            IpNetwork::V6(_) => Family::V6,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.family() == Family::V4
    }

    pub fn is_ipv6(&self) -> bool {
        self.family() == Family::V6
    }

    /// Same address with a different mask length.
    pub fn with_bits(&self, bits: u8) -> Result<Self, PrefixError> {
        Self::new(self.addr(), bits)
    }

    /// The network this prefix belongs to, host bits cleared.
    pub fn masked(&self) -> Self {
        // The length was already validated for this family.
        Prefix(IpNetwork::new(self.0.network(), self.bits()).unwrap_or(self.0))
    }
}

impl From<IpNetwork> for Prefix {
    fn from(net: IpNetwork) -> Self {
        Prefix(net)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.bits())
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::from_str(s.trim())
            .map(Prefix)
            .map_err(|source| PrefixError::Parse {
                input: s.to_string(),
                source,
            })
    }
}

impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr()
            .cmp(&other.addr())
            .then_with(|| self.bits().cmp(&other.bits()))
    }
}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
