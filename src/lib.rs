//! otala-runc - a rootless, single-shot Linux container runtime
//!
//! One binary, two roles: invoked normally it is the Supervisor that stages
//! a container and watches it; re-executed with the "child" sentinel it is
//! the Payload that lives inside the fresh namespace set and becomes the
//! workload.

/// Lockdown config template shipped with the executable
pub const CONFIG_TEMPLATE: &[u8] = include_bytes!("../assets/config.json");

/// Base image tarball shipped with the executable
pub const ROOTFS_ARCHIVE: &[u8] = include_bytes!("../assets/alpine-minirootfs.tar.gz");

pub(crate) mod capabilities;
pub(crate) mod cleanup;
pub(crate) mod idmap;
pub(crate) mod layout;
pub(crate) mod limits;
pub(crate) mod message;
pub(crate) mod mount;
pub(crate) mod network;
pub(crate) mod reexec;
pub(crate) mod rootfs;
pub(crate) mod scope;
pub(crate) mod seccomp;
pub(crate) mod workload;

pub mod cli;
pub mod config;
pub mod identity;
pub mod payload;
pub mod policy;
pub mod supervisor;

pub use cli::{Cli, Commands};
pub use config::RunConfig;
