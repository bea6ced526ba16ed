//! Backends for the shared resources of a session.
//!
//! - System V IPC (shared memory, semaphore, message queue) on Linux.
//! - A stub reporting the lack of support everywhere else.
//! - An in-process backend whose participants are threads, used by simulations and tests.

#[cfg(target_os = "linux")]
mod ipc_sysv;

#[cfg(target_os = "linux")]
pub use ipc_sysv::*;

#[cfg(not(target_os = "linux"))]
mod ipc_stub;

#[cfg(not(target_os = "linux"))]
pub use ipc_stub::*;

mod ipc_local;

pub use ipc_local::LocalResources;

/// Offsets from the configured key base.
pub(crate) const REGION_KEY_OFFSET: i32 = 1;
pub(crate) const CHANNEL_KEY_OFFSET: i32 = 2;
pub(crate) const LOCK_KEY_OFFSET: i32 = 3;
