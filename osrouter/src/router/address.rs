//! Local address changes.
//!
//! The tun interface is point-to-point, so an IPv4 alias only becomes
//! reachable with a host route for the address itself bound to the
//! interface. IPv6 uses a /48 that covers the tunnel range and needs no
//! companion route.

use super::{FirstError, LocalAddrs, RouterError, Tools};
use crate::command::{argv, run_logged, CommandRunner};
use crate::prefix::Prefix;
use tracing::{debug, info};

/// `ifconfig <iface> inet|inet6 <prefix> alias|-alias`
pub fn alias_command(tools: &Tools, iface: &str, prefix: &Prefix, add: bool) -> Vec<String> {
    let prefix_str = prefix.to_string();
    argv(&[
        tools.ifconfig.as_str(),
        iface,
        prefix.family().ifconfig_keyword(),
        prefix_str.as_str(),
        if add { "alias" } else { "-alias" },
    ])
}

/// `route -q -n add|delete -inet <prefix> -iface <addr>` for the address itself.
pub fn host_route_command(tools: &Tools, prefix: &Prefix, add: bool) -> Vec<String> {
    let dest = prefix.to_string();
    let addr = prefix.addr().to_string();
    argv(&[
        tools.route.as_str(),
        "-q",
        "-n",
        if add { "add" } else { "delete" },
        prefix.family().route_flag(),
        dest.as_str(),
        "-iface",
        addr.as_str(),
    ])
}

/// Moves the interface from `prev` to `desired` addresses.
///
/// All four possible operations (IPv4 delete and add, IPv6 delete and add)
/// are attempted regardless of earlier failures. Returns `desired` along
/// with the first error hit, if any.
pub async fn apply_addresses<R>(
    runner: &R,
    tools: &Tools,
    iface: &str,
    prev: &LocalAddrs,
    desired: &LocalAddrs,
) -> (LocalAddrs, Option<RouterError>)
where
    R: CommandRunner + ?Sized,
{
    let mut errs = FirstError::default();

    if desired.v4 != prev.v4 {
        if let Some(old) = &prev.v4 {
            info!(iface, addr = %old, "removing IPv4 address");
            errs.check(
                run_logged(runner, "addr del", &alias_command(tools, iface, old, false)).await,
            );
            errs.check(
                run_logged(runner, "route del", &host_route_command(tools, old, false)).await,
            );
        }
        if let Some(new) = &desired.v4 {
            info!(iface, addr = %new, "adding IPv4 address");
            errs.check(
                run_logged(runner, "addr add", &alias_command(tools, iface, new, true)).await,
            );
            errs.check(
                run_logged(runner, "route add", &host_route_command(tools, new, true)).await,
            );
        }
    } else {
        debug!(iface, addr = ?desired.v4, "IPv4 address unchanged");
    }

    if desired.v6 != prev.v6 {
        if let Some(old) = &prev.v6 {
            info!(iface, addr = %old, "removing IPv6 address");
            errs.check(
                run_logged(runner, "addr del", &alias_command(tools, iface, old, false)).await,
            );
        }
        if let Some(new) = &desired.v6 {
            info!(iface, addr = %new, "adding IPv6 address");
            errs.check(
                run_logged(runner, "addr add", &alias_command(tools, iface, new, true)).await,
            );
        }
    } else {
        debug!(iface, addr = ?desired.v6, "IPv6 address unchanged");
    }

    (*desired, errs.into_option())
}
