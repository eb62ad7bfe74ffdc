//! Device kernel for the vector add.

use offload_core::error::{OffloadError, Result};
use offload_core::kernel::{Kernel, ThreadContext};
use offload_core::memory::SharedBuffer;

/// Element-wise `Y[i] = X[i] + Y[i]` over two unified buffers.
///
/// Owns both buffers while resident on the device; [`VectorAdd::into_buffers`]
/// hands them back to the host.
#[derive(Debug)]
pub struct VectorAdd {
    x: SharedBuffer<f32>,
    y: SharedBuffer<f32>,
}

impl VectorAdd {
    /// Create the kernel; both buffers must have the same length.
    pub fn new(x: SharedBuffer<f32>, y: SharedBuffer<f32>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(OffloadError::InvalidArgument(format!(
                "vector lengths differ: x has {} elements, y has {}",
                x.len(),
                y.len()
            )));
        }
        Ok(Self { x, y })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// Always false; shared buffers are never empty.
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Return `(x, y)` to the host.
    pub fn into_buffers(self) -> (SharedBuffer<f32>, SharedBuffer<f32>) {
        (self.x, self.y)
    }
}

impl Kernel for VectorAdd {
    fn name(&self) -> &str {
        "vector_add"
    }

    fn thread(&self, ctx: &ThreadContext) {
        let x = self.x.device_ptr();
        let y = self.y.device_ptr();
        let n = y.len();

        let mut i = ctx.global_id();
        while i < n {
            // SAFETY: i < n, and the grid-stride loop gives each index to exactly one thread.
            unsafe { y.write(i, x.read(i) + y.read(i)) };
            i += ctx.grid_stride();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_core::launch::LaunchConfig;
    use offload_core::memory::{MemoryTracker, UnifiedAllocation};
    use std::sync::Arc;

    fn buffer(tracker: &Arc<MemoryTracker>, len: usize, value: f32) -> SharedBuffer<f32> {
        let alloc = UnifiedAllocation::new(Arc::clone(tracker), len * 4, 4).unwrap();
        let mut buffer = SharedBuffer::from_allocation(alloc, len).unwrap();
        buffer.fill(value);
        buffer
    }

    fn run_grid(kernel: &VectorAdd, config: &LaunchConfig) {
        for linear in 0..config.total_threads() {
            kernel.thread(&ThreadContext::from_linear(linear, config));
        }
    }

    #[test]
    fn test_single_element() {
        let tracker = Arc::new(MemoryTracker::new(None));
        let kernel = VectorAdd::new(buffer(&tracker, 1, 1.0), buffer(&tracker, 1, 2.0)).unwrap();

        run_grid(&kernel, &LaunchConfig::single_thread());

        let (x, y) = kernel.into_buffers();
        assert_eq!(x.as_slice(), &[1.0]);
        assert_eq!(y.as_slice(), &[3.0]);
    }

    #[test]
    fn test_single_thread_walks_everything() {
        let tracker = Arc::new(MemoryTracker::new(None));
        let kernel =
            VectorAdd::new(buffer(&tracker, 1024, 1.0), buffer(&tracker, 1024, 2.0)).unwrap();

        run_grid(&kernel, &LaunchConfig::single_thread());

        let (_, y) = kernel.into_buffers();
        assert!(y.as_slice().iter().all(|v| *v == 3.0));
    }

    #[test]
    fn test_grid_smaller_than_data() {
        let tracker = Arc::new(MemoryTracker::new(None));
        let kernel =
            VectorAdd::new(buffer(&tracker, 1000, 0.5), buffer(&tracker, 1000, 0.25)).unwrap();

        run_grid(&kernel, &LaunchConfig::new(3, 7));

        let (_, y) = kernel.into_buffers();
        assert!(y.as_slice().iter().all(|v| *v == 0.75));
    }

    #[test]
    fn test_grid_larger_than_data() {
        let tracker = Arc::new(MemoryTracker::new(None));
        let kernel = VectorAdd::new(buffer(&tracker, 5, 1.0), buffer(&tracker, 5, 2.0)).unwrap();

        run_grid(&kernel, &LaunchConfig::new(4, 32));

        let (_, y) = kernel.into_buffers();
        assert_eq!(y.as_slice(), &[3.0; 5]);
    }

    #[test]
    fn test_length_mismatch() {
        let tracker = Arc::new(MemoryTracker::new(None));
        let result = VectorAdd::new(buffer(&tracker, 4, 1.0), buffer(&tracker, 5, 2.0));
        assert!(matches!(result, Err(OffloadError::InvalidArgument(_))));
        assert_eq!(tracker.live_allocations(), 0);
    }
}
