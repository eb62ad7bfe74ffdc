//! Kernel trait and per-thread execution context.
//!
//! A kernel is the unit of computation dispatched to the device. The device
//! calls [`Kernel::thread`] once for every logical thread of the launch grid;
//! the kernel decides which elements that thread owns, usually with a
//! grid-stride loop:
//!
//! ```ignore
//! let mut i = ctx.global_id();
//! while i < n {
//!     // work on element i
//!     i += ctx.grid_stride();
//! }
//! ```
//!
//! With a `<<<1, 1>>>` launch the single thread walks every element serially.

use crate::error::Result;
use crate::launch::LaunchConfig;

/// Identity of one logical device thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    /// Block index within the grid.
    pub block_idx: u32,
    /// Thread index within the block.
    pub thread_idx: u32,
    /// Threads per block.
    pub block_dim: u32,
    /// Blocks in the grid.
    pub grid_dim: u32,
}

impl ThreadContext {
    /// Context for the thread with linear index `linear` in `config`.
    #[inline]
    pub fn from_linear(linear: u64, config: &LaunchConfig) -> Self {
        let block_dim = config.block_dim as u64;
        Self {
            block_idx: (linear / block_dim) as u32,
            thread_idx: (linear % block_dim) as u32,
            block_dim: config.block_dim,
            grid_dim: config.grid_dim,
        }
    }

    /// Global thread index across all blocks.
    #[inline]
    pub fn global_id(&self) -> usize {
        self.block_idx as usize * self.block_dim as usize + self.thread_idx as usize
    }

    /// Distance between consecutive elements owned by one thread.
    #[inline]
    pub fn grid_stride(&self) -> usize {
        self.block_dim as usize * self.grid_dim as usize
    }
}

/// Computation dispatched to a device.
///
/// Kernels own their arguments, including the [`SharedBuffer`]s they work on,
/// for as long as they are resident on the device.
///
/// [`SharedBuffer`]: crate::memory::SharedBuffer
pub trait Kernel: Send + Sync + 'static {
    /// Kernel name for logs and metrics.
    fn name(&self) -> &str;

    /// Reject launch configurations this kernel cannot run with.
    fn validate(&self, _config: &LaunchConfig) -> Result<()> {
        Ok(())
    }

    /// Body of one logical device thread.
    ///
    /// Threads of the same launch run concurrently and must touch disjoint
    /// elements.
    fn thread(&self, ctx: &ThreadContext);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_linear() {
        let config = LaunchConfig::new(4, 256);
        let ctx = ThreadContext::from_linear(513, &config);
        assert_eq!(ctx.block_idx, 2);
        assert_eq!(ctx.thread_idx, 1);
        assert_eq!(ctx.global_id(), 513);
        assert_eq!(ctx.grid_stride(), 1024);
    }

    #[test]
    fn test_single_thread_context() {
        let ctx = ThreadContext::from_linear(0, &LaunchConfig::single_thread());
        assert_eq!(ctx.global_id(), 0);
        assert_eq!(ctx.grid_stride(), 1);
    }

    #[test]
    fn test_grid_stride_covers_index_space() {
        let config = LaunchConfig::new(2, 3);
        let n = 20;
        let mut hits = vec![0u32; n];

        for linear in 0..config.total_threads() {
            let ctx = ThreadContext::from_linear(linear, &config);
            let mut i = ctx.global_id();
            while i < n {
                hits[i] += 1;
                i += ctx.grid_stride();
            }
        }

        assert!(hits.iter().all(|h| *h == 1));
    }
}
