//! Interface address and route reconciliation.
//!
//! The [`Router`] owns the state applied to one tun interface and converges
//! the host towards each [`DesiredConfig`] it is given. Addresses are handled
//! before routes because route commands name the local address as their
//! next hop. Every planned command is attempted even when an earlier one
//! fails; the first failure is what the caller gets back.

use crate::command::CommandError;
use crate::prefix::{Family, Prefix};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

pub mod address;
pub mod driver;
pub mod readiness;
pub mod routes;

pub use driver::{cleanup, Router, RouterPhase};
pub use readiness::{wait_until_up, RetryPolicy};

/// IPv6 addresses are always assigned with this mask length so the whole
/// tunnel range is on-link without per-destination routes.
pub const IPV6_LOCAL_BITS: u8 = 48;

/// Errors surfaced by a reconciliation call.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The desired configuration cannot be applied at all.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An external command failed. Only the first failure is kept.
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type RouterResult<T> = Result<T, RouterError>;

/// Keeps the first error and drops the rest.
#[derive(Debug, Default)]
pub(crate) struct FirstError(Option<RouterError>);

impl FirstError {
    pub(crate) fn record<E: Into<RouterError>>(&mut self, err: E) {
        self.0.get_or_insert(err.into());
    }

    pub(crate) fn check<T, E: Into<RouterError>>(&mut self, result: Result<T, E>) {
        if let Err(err) = result {
            self.record(err);
        }
    }

    pub(crate) fn into_option(self) -> Option<RouterError> {
        self.0
    }

    pub(crate) fn into_result(self) -> RouterResult<()> {
        match self.0 {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Names of the host tools used to change interface and routing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tools {
    pub ifconfig: String,
    pub route: String,
    pub sysctl: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ifconfig: "ifconfig".into(),
            route: "route".into(),
            sysctl: "sysctl".into(),
        }
    }
}

/// At most one local address per family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddrs {
    pub v4: Option<Prefix>,
    pub v6: Option<Prefix>,
}

impl LocalAddrs {
    /// Picks the local addresses out of `candidates`.
    ///
    /// More than one address of a family is rejected. An IPv6 address is
    /// rewritten to its /[`IPV6_LOCAL_BITS`] network, whatever mask it came with.
    pub fn from_candidates(candidates: &[Prefix]) -> RouterResult<Self> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for prefix in candidates {
            match prefix.family() {
                Family::V4 => v4.push(*prefix),
                Family::V6 => v6.push(*prefix),
            }
        }
        if v4.len() > 1 || v6.len() > 1 {
            return Err(RouterError::Configuration(format!(
                "multiple local addresses per family are not supported ({} IPv4, {} IPv6)",
                v4.len(),
                v6.len()
            )));
        }

        let v6 = match v6.first() {
            Some(p) => Some(
                p.with_bits(IPV6_LOCAL_BITS)
                    .map_err(|e| {
                        RouterError::Configuration(format!("cannot normalize {p}: {e}"))
                    })?
                    .masked(),
            ),
            None => None,
        };

        Ok(Self {
            v4: v4.first().copied(),
            v6,
        })
    }

    pub fn get(&self, family: Family) -> Option<Prefix> {
        match family {
            Family::V4 => self.v4,
            Family::V6 => self.v6,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// What the host is believed to carry for this interface.
///
/// This is the last *attempted* state: a command that failed still counts
/// as applied, so the next reconcile does not retry it on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    #[serde(default)]
    pub local_v4: Option<Prefix>,
    #[serde(default)]
    pub local_v6: Option<Prefix>,
    #[serde(default)]
    pub routes: BTreeSet<Prefix>,
}

impl AppliedState {
    pub fn local_addrs(&self) -> LocalAddrs {
        LocalAddrs {
            v4: self.local_v4,
            v6: self.local_v6,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local_v4.is_none() && self.local_v6.is_none() && self.routes.is_empty()
    }
}

/// The configuration a caller wants on the interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredConfig {
    /// Local addresses, at most one per family.
    #[serde(default)]
    pub local_addrs: Vec<Prefix>,
    /// Destinations that should be reached through the interface.
    #[serde(default)]
    pub routes: BTreeSet<Prefix>,
}

impl DesiredConfig {
    pub fn new<A, R>(local_addrs: A, routes: R) -> Self
    where
        A: IntoIterator<Item = Prefix>,
        R: IntoIterator<Item = Prefix>,
    {
        Self {
            local_addrs: local_addrs.into_iter().collect(),
            routes: routes.into_iter().collect(),
        }
    }

    /// Parses a desired-state file:
    ///
    /// ```toml
    /// local_addrs = ["100.64.0.7/32", "fd7a:115c:a1e0::7/48"]
    /// routes = ["10.0.0.0/24"]
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn candidates_split_by_family() {
        let addrs = LocalAddrs::from_candidates(&[p("100.64.1.2/32"), p("fd7a::5/128")]).unwrap();
        assert_eq!(addrs.v4, Some(p("100.64.1.2/32")));
        assert_eq!(addrs.v6, Some(p("fd7a::/48")));
        assert_eq!(addrs.get(Family::V6), addrs.v6);
    }

    #[test]
    fn ipv6_is_normalized_to_48() {
        let addrs = LocalAddrs::from_candidates(&[p("2001:db8::1/64")]).unwrap();
        assert_eq!(addrs.v6.unwrap().to_string(), "2001:db8::/48");
        assert!(addrs.v4.is_none());
    }

    #[test]
    fn two_of_a_family_is_rejected() {
        let err = LocalAddrs::from_candidates(&[p("10.0.0.1/32"), p("10.0.0.2/32")]).unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));

        let err = LocalAddrs::from_candidates(&[p("fd00::1/64"), p("fd00::2/64")]).unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
    }

    #[test]
    fn first_error_wins() {
        let mut errs = FirstError::default();
        errs.check(Ok::<(), RouterError>(()));
        errs.record(RouterError::Configuration("first".into()));
        errs.record(RouterError::Configuration("second".into()));
        match errs.into_result() {
            Err(RouterError::Configuration(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn desired_config_from_toml() {
        let cfg = DesiredConfig::from_toml(
            r#"
            local_addrs = ["100.64.0.7/32", "fd7a:115c:a1e0::7/128"]
            routes = ["10.0.0.0/24", "fd7a:115c:a1e0::/48"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.local_addrs.len(), 2);
        assert!(cfg.routes.contains(&p("10.0.0.0/24")));
        assert_eq!(DesiredConfig::from_toml("").unwrap(), DesiredConfig::default());
    }
}
