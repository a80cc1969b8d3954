//! Shared utilities for osrouter components.
//!
//! This crate provides the configuration file format and logging setup
//! used by the `osrouterd` daemon and its command line.

pub mod config;
pub mod logging;

pub use config::{Config, ConfigManager};
