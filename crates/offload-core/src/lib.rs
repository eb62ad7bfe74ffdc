//! # Offload Core
//!
//! Core traits and types for offloading kernels to an accelerator that shares
//! memory with the host.
//!
//! ## Core Abstractions
//!
//! - [`OffloadRuntime`] - Backend-agnostic allocate / launch / synchronize
//! - [`SharedBuffer`] - Unified-memory buffer owned by exactly one side at a time
//! - [`Kernel`] - Computation dispatched to the device, one call per device thread
//! - [`LaunchConfig`] / [`LaunchPolicy`] - Grid and block sizing
//! - [`PendingLaunch`] - Handle to a kernel resident on the device
//!
//! ## Host/device contract
//!
//! ```text
//!   host                               device
//!   ────                               ──────
//!   alloc_shared()  ──► X, Y
//!   fill X, Y
//!   launch_kernel(K{X, Y}) ──────────► runs K on every device thread
//!   (X, Y unreachable here)                 │
//!   synchronize() ◄──────────────────── completion
//!   reclaim() ──► X, Y
//!   drop(X, Y)  ──► memory released
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod kernel;
pub mod launch;
pub mod memory;
pub mod runtime;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::kernel::*;
    pub use crate::launch::*;
    pub use crate::memory::{DeviceCopy, DevicePtr, MemoryTracker, SharedBuffer, UnifiedAllocation};
    pub use crate::runtime::*;
}

// Re-exports for convenience
pub use error::{OffloadError, Result};
pub use kernel::{Kernel, ThreadContext};
pub use launch::{LaunchConfig, LaunchPolicy};
pub use memory::{DeviceCopy, MemoryTracker, SharedBuffer, UnifiedAllocation};
pub use runtime::{
    Backend, DeviceInfo, LaunchCompletion, LaunchId, LaunchTicket, OffloadRuntime,
    OffloadRuntimeExt, PendingLaunch, RuntimeMetrics,
};
