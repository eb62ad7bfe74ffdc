//! Integration tests for the CPU backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use offload::prelude::*;
use offload::vector_add::VectorAdd;

/// Doubles every element in place.
struct Scale {
    data: SharedBuffer<u64>,
}

impl Kernel for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn thread(&self, ctx: &ThreadContext) {
        let data = self.data.device_ptr();
        let mut i = ctx.global_id();
        while i < data.len() {
            unsafe { data.write(i, data.read(i) * 2) };
            i += ctx.grid_stride();
        }
    }
}

/// Counts threads and refuses oversized blocks.
struct Census {
    threads: Arc<AtomicUsize>,
}

impl Kernel for Census {
    fn name(&self) -> &str {
        "census"
    }

    fn validate(&self, config: &LaunchConfig) -> Result<()> {
        if config.block_dim > 64 {
            return Err(OffloadError::LaunchFailed(format!(
                "census supports at most 64 threads per block, got {}",
                config.block_dim
            )));
        }
        Ok(())
    }

    fn thread(&self, _ctx: &ThreadContext) {
        self.threads.fetch_add(1, Ordering::Relaxed);
    }
}

/// Test basic runtime creation with CPU backend.
#[tokio::test]
async fn test_cpu_runtime_creation() {
    let runtime = Offload::builder()
        .backend(Backend::Cpu)
        .build()
        .await
        .expect("Failed to create CPU runtime");

    assert_eq!(runtime.backend(), Backend::Cpu);
    assert!(runtime.device_info().execution_units >= 1);
    assert_eq!(runtime.device_info().total_memory, None);
}

/// Auto falls back to the CPU device.
#[tokio::test]
async fn test_auto_selects_cpu() {
    let runtime = Offload::with_backend(Backend::Auto)
        .await
        .expect("Failed to create runtime");

    assert_eq!(runtime.backend(), Backend::Cpu);
}

/// Test kernel launch, synchronize and reclaim.
#[tokio::test]
async fn test_kernel_lifecycle() {
    let runtime = Offload::new().await.expect("Failed to create runtime");

    let mut data = runtime
        .alloc_shared::<u64>(1000)
        .expect("Failed to allocate");
    for (i, v) in data.as_mut_slice().iter_mut().enumerate() {
        *v = i as u64;
    }

    let config = LaunchConfig::for_elements(1000, 128).expect("Bad launch config");
    let pending = runtime
        .launch_kernel(Scale { data }, config)
        .expect("Failed to launch kernel");

    runtime.synchronize().await.expect("Failed to synchronize");

    let kernel = pending.reclaim().expect("Kernel still resident");
    assert!(kernel
        .data
        .as_slice()
        .iter()
        .enumerate()
        .all(|(i, v)| *v == 2 * i as u64));

    drop(kernel);
    assert_eq!(runtime.memory_in_use(), 0);

    runtime.shutdown().await.expect("Failed to shutdown");
}

/// Several launches complete behind one barrier.
#[tokio::test]
async fn test_multiple_launches() {
    let runtime = Offload::new().await.expect("Failed to create runtime");
    let threads = Arc::new(AtomicUsize::new(0));

    let pending: Vec<_> = (0..4)
        .map(|_| {
            runtime
                .launch_kernel(
                    Census {
                        threads: Arc::clone(&threads),
                    },
                    LaunchConfig::new(2, 32),
                )
                .expect("Failed to launch kernel")
        })
        .collect();

    runtime
        .synchronize_timeout(Duration::from_secs(10))
        .await
        .expect("Failed to synchronize");

    assert_eq!(threads.load(Ordering::Relaxed), 4 * 64);
    assert!(pending.iter().all(|p| p.is_complete()));
    assert_eq!(runtime.metrics().kernels_completed, 4);
}

/// A kernel can refuse a launch configuration.
#[tokio::test]
async fn test_kernel_validation() {
    let runtime = Offload::new().await.expect("Failed to create runtime");
    let threads = Arc::new(AtomicUsize::new(0));

    let result = runtime.launch_kernel(
        Census {
            threads: Arc::clone(&threads),
        },
        LaunchConfig::new(1, 128),
    );
    assert!(matches!(result, Err(OffloadError::LaunchFailed(_))));
    assert_eq!(runtime.metrics().kernels_launched, 0);
}

/// Launch failure returns the buffers' memory through the dropped kernel.
#[tokio::test]
async fn test_failed_launch_releases_buffers() {
    let runtime = Offload::new().await.expect("Failed to create runtime");

    let x = runtime.alloc_shared::<f32>(32).expect("Failed to allocate");
    let y = runtime.alloc_shared::<f32>(32).expect("Failed to allocate");
    let kernel = VectorAdd::new(x, y).expect("Failed to build kernel");

    let result = runtime.launch_kernel(kernel, LaunchConfig::new(0, 32));
    assert!(matches!(result, Err(OffloadError::LaunchFailed(_))));
    assert_eq!(runtime.memory_in_use(), 0);
}

/// Waiting on a single launch returns its kernel.
#[tokio::test]
async fn test_wait_single_launch() {
    let runtime = Offload::new().await.expect("Failed to create runtime");

    let mut x = runtime.alloc_shared::<f32>(8).expect("Failed to allocate");
    let mut y = runtime.alloc_shared::<f32>(8).expect("Failed to allocate");
    x.fill(0.5);
    y.fill(1.5);

    let pending = runtime
        .launch_kernel(
            VectorAdd::new(x, y).expect("Failed to build kernel"),
            LaunchConfig::single_thread(),
        )
        .expect("Failed to launch kernel");

    let (_, y) = pending
        .wait(Some(Duration::from_secs(5)))
        .await
        .expect("Launch failed")
        .into_buffers();
    assert_eq!(y.as_slice(), &[2.0; 8]);
}

/// Shutdown drains the device and refuses new work.
#[tokio::test]
async fn test_shutdown_refuses_work() {
    let runtime = Offload::new().await.expect("Failed to create runtime");

    runtime.shutdown().await.expect("Failed to shutdown");

    let result = runtime.alloc_shared::<f32>(4);
    assert!(matches!(result, Err(OffloadError::BackendError(_))));
}
