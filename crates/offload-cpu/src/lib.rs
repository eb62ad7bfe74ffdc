//! # Offload CPU Backend
//!
//! CPU device for offload. Always available; used for testing, for hosts
//! without an accelerator, and as the fallback of `Backend::Auto`.
//!
//! Device threads are scheduled on a rayon pool that is separate from the
//! host's async runtime, so a launch returns before the kernel runs and
//! `synchronize` is a real wait.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod runtime;

pub use runtime::{CpuRuntime, CpuRuntimeBuilder};

/// Whether the CPU backend can be used. Always true.
pub fn is_cpu_available() -> bool {
    true
}
