//! Keeps a BSD tun interface's addresses and routes in line with a desired
//! configuration, using `ifconfig(8)` and `route(8)`.

#[cfg(not(unix))]
compile_error!("osrouter is only supported on Unix-like systems");

pub mod command;
pub mod install;
pub mod persistence;
pub mod prefix;
pub mod router;
pub mod session;

pub use command::{CommandError, CommandRunner, RecordingRunner, SystemRunner};
pub use prefix::{Family, Prefix};
pub use router::{AppliedState, DesiredConfig, Router, RouterError};
