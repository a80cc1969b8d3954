//! Routes pointing at the tun interface.

use super::{FirstError, LocalAddrs, RouterError, Tools};
use crate::command::{argv, run_logged, CommandRunner};
use crate::prefix::Prefix;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Whether a route is being installed or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

impl RouteOp {
    fn verb(self) -> &'static str {
        match self {
            RouteOp::Add => "add",
            RouteOp::Delete => "delete",
        }
    }
}

/// `route -q -n add|delete -inet|-inet6 <network>/<bits> -iface <next_hop>`
///
/// The destination is always the masked network so the routing table
/// entry does not depend on how the caller spelled the prefix.
pub fn route_command(tools: &Tools, op: RouteOp, dest: &Prefix, next_hop: &str) -> Vec<String> {
    let network = dest.masked().to_string();
    argv(&[
        tools.route.as_str(),
        "-q",
        "-n",
        op.verb(),
        dest.family().route_flag(),
        network.as_str(),
        "-iface",
        next_hop,
    ])
}

/// Routes that must be removed and added to go from `prev` to `desired`.
pub fn diff(
    prev: &BTreeSet<Prefix>,
    desired: &BTreeSet<Prefix>,
) -> (Vec<Prefix>, Vec<Prefix>) {
    let to_remove = prev.difference(desired).copied().collect();
    let to_add = desired.difference(prev).copied().collect();
    (to_remove, to_add)
}

fn next_hop(iface: &str, candidates: &[Option<Prefix>]) -> String {
    candidates
        .iter()
        .flatten()
        .next()
        .map(|p| p.addr().to_string())
        .unwrap_or_else(|| iface.to_string())
}

/// Applies the symmetric difference between `prev` and `desired`.
///
/// Each route is bound to the local address of its own family: the one in
/// `local` for additions, and for removals the one in `local` or, failing
/// that, the one in `prev_local` the route was installed against. With no
/// address of that family at all, the interface name is used. Returns
/// `desired` along with the first error hit, if any.
pub async fn apply_routes<R>(
    runner: &R,
    tools: &Tools,
    iface: &str,
    prev: &BTreeSet<Prefix>,
    desired: &BTreeSet<Prefix>,
    prev_local: &LocalAddrs,
    local: &LocalAddrs,
) -> (BTreeSet<Prefix>, Option<RouterError>)
where
    R: CommandRunner + ?Sized,
{
    let mut errs = FirstError::default();
    let (to_remove, to_add) = diff(prev, desired);
    debug!(
        iface,
        remove = to_remove.len(),
        add = to_add.len(),
        "route changes"
    );

    for route in &to_remove {
        let family = route.family();
        let hop = next_hop(iface, &[local.get(family), prev_local.get(family)]);
        info!(iface, %route, via = %hop, "removing route");
        let cmd = route_command(tools, RouteOp::Delete, route, &hop);
        errs.check(run_logged(runner, "route del", &cmd).await);
    }

    for route in &to_add {
        let hop = next_hop(iface, &[local.get(route.family())]);
        info!(iface, %route, via = %hop, "adding route");
        let cmd = route_command(tools, RouteOp::Add, route, &hop);
        errs.check(run_logged(runner, "route add", &cmd).await);
    }

    (desired.clone(), errs.into_option())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingRunner;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<Prefix> {
        items.iter().map(|s| p(s)).collect()
    }

    fn local() -> LocalAddrs {
        LocalAddrs {
            v4: Some(p("100.64.0.7/32")),
            v6: Some(p("fd7a:115c:a1e0::/48")),
        }
    }

    #[test]
    fn diff_is_symmetric_difference() {
        let (remove, add) = diff(
            &set(&["10.0.0.0/24", "10.1.0.0/24"]),
            &set(&["10.1.0.0/24", "10.2.0.0/24"]),
        );
        assert_eq!(remove, vec![p("10.0.0.0/24")]);
        assert_eq!(add, vec![p("10.2.0.0/24")]);
    }

    #[test]
    fn destination_is_masked() {
        let cmd = route_command(&Tools::default(), RouteOp::Add, &p("10.1.2.3/16"), "100.64.0.7");
        assert_eq!(
            cmd,
            argv(&["route", "-q", "-n", "add", "-inet", "10.1.0.0/16", "-iface", "100.64.0.7"])
        );
    }

    #[tokio::test]
    async fn routes_bind_to_matching_family() {
        let runner = RecordingRunner::new();
        let desired = set(&["10.0.0.0/8", "fd00:1::/64"]);
        let (new, err) = apply_routes(
            &runner,
            &Tools::default(),
            "tun0",
            &BTreeSet::new(),
            &desired,
            &LocalAddrs::default(),
            &local(),
        )
        .await;
        assert!(err.is_none());
        assert_eq!(new, desired);
        assert_eq!(
            runner.calls(),
            vec![
                argv(&["route", "-q", "-n", "add", "-inet", "10.0.0.0/8", "-iface", "100.64.0.7"]),
                argv(&["route", "-q", "-n", "add", "-inet6", "fd00:1::/64", "-iface", "fd7a:115c:a1e0::"]),
            ]
        );
    }

    #[tokio::test]
    async fn removal_falls_back_to_previous_local_address() {
        let runner = RecordingRunner::new();
        let (new, _) = apply_routes(
            &runner,
            &Tools::default(),
            "tun0",
            &set(&["10.0.0.0/8"]),
            &BTreeSet::new(),
            &local(),
            &LocalAddrs::default(),
        )
        .await;
        assert!(new.is_empty());
        assert_eq!(
            runner.calls(),
            vec![argv(&["route", "-q", "-n", "delete", "-inet", "10.0.0.0/8", "-iface", "100.64.0.7"])]
        );
    }

    #[tokio::test]
    async fn no_local_address_binds_to_interface_name() {
        let runner = RecordingRunner::new();
        apply_routes(
            &runner,
            &Tools::default(),
            "tun0",
            &BTreeSet::new(),
            &set(&["10.0.0.0/8"]),
            &LocalAddrs::default(),
            &LocalAddrs::default(),
        )
        .await;
        assert_eq!(runner.calls()[0].last().map(String::as_str), Some("tun0"));
    }

    #[tokio::test]
    async fn failures_accumulate_and_result_is_desired() {
        let runner = RecordingRunner::new().fail_when(|a| a[3] == "delete");
        let prev = set(&["10.0.0.0/24", "10.3.0.0/24"]);
        let desired = set(&["10.2.0.0/24"]);
        let (new, err) = apply_routes(
            &runner,
            &Tools::default(),
            "tun0",
            &prev,
            &desired,
            &local(),
            &local(),
        )
        .await;
        assert_eq!(new, desired);
        let err = err.expect("delete failures should surface");
        assert!(err.to_string().contains("10.0.0.0/24"), "first error kept: {err}");
        assert_eq!(runner.calls().len(), 3);
    }
}
