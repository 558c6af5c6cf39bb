//! The _meshca_ library crate.
//!
//! Certificate authority management for a service mesh control plane:
//! pluggable CA providers, the leader-owned CA manager with rotation and
//! cross-signing, secondary datacenter federation, and the background
//! renewal and pruning tasks.

pub mod api;
pub mod cluster;
pub mod commons;
pub mod config;
pub mod constants;
pub mod provider;
pub mod server;
pub mod store;
