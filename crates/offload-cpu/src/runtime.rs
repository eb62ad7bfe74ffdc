//! CPU runtime implementation.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use offload_core::error::{OffloadError, Result};
use offload_core::kernel::{Kernel, ThreadContext};
use offload_core::launch::LaunchConfig;
use offload_core::memory::{MemoryTracker, UnifiedAllocation};
use offload_core::runtime::{
    Backend, DeviceInfo, LaunchId, LaunchTicket, OffloadRuntime, RuntimeMetrics,
};

/// CPU-based implementation of OffloadRuntime.
///
/// Device threads run on a dedicated rayon pool, so kernel execution is
/// asynchronous with respect to the host exactly as on a GPU. Unified memory
/// is ordinary host memory charged against an optional capacity.
pub struct CpuRuntime {
    /// Device execution units.
    pool: rayon::ThreadPool,
    /// Number of execution units in the pool.
    execution_units: usize,
    /// Unified memory accounting.
    tracker: Arc<MemoryTracker>,
    /// Completion state shared with running launches.
    state: Arc<DeviceState>,
    /// Next launch ID.
    next_launch: AtomicU64,
    /// Total kernels launched.
    total_launched: AtomicU64,
    /// Delay before each launch starts executing.
    execution_delay: Option<Duration>,
    /// Shutdown flag.
    shutdown: RwLock<bool>,
}

/// State the host shares with in-flight launches.
struct DeviceState {
    /// Launches queued or running.
    in_flight: watch::Sender<usize>,
    /// Faults not yet reported by a synchronize.
    faults: Mutex<Vec<RecordedFault>>,
    /// Launches that ran to completion.
    completed: AtomicU64,
    /// Launches that faulted.
    faulted: AtomicU64,
}

/// A kernel fault and whether its launch ticket has already delivered it.
struct RecordedFault {
    id: LaunchId,
    message: String,
    observed: Arc<AtomicBool>,
}

impl DeviceState {
    fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            in_flight,
            faults: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            faulted: AtomicU64::new(0),
        }
    }

    fn begin(&self) {
        self.in_flight.send_modify(|n| *n += 1);
    }

    fn finish(&self, id: LaunchId, fault: Option<&str>, observed: Arc<AtomicBool>) {
        match fault {
            None => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(launch = %id, "launch complete");
            }
            Some(message) => {
                self.faulted.fetch_add(1, Ordering::Relaxed);
                warn!(launch = %id, "launch faulted: {}", message);
                self.faults.lock().push(RecordedFault {
                    id,
                    message: message.to_string(),
                    observed,
                });
            }
        }
        self.in_flight.send_modify(|n| *n -= 1);
    }

    /// First fault since the last call that no ticket has delivered yet.
    /// Every recorded fault is cleared.
    fn take_fault(&self) -> Option<String> {
        let mut faults = self.faults.lock();
        let first = faults
            .drain(..)
            .find(|fault| !fault.observed.swap(true, Ordering::AcqRel));
        if let Some(fault) = &first {
            debug!(launch = %fault.id, "reporting fault at synchronize");
        }
        first.map(|fault| fault.message)
    }
}

impl CpuRuntime {
    /// Create a new CPU runtime with default settings.
    pub async fn new() -> Result<Self> {
        Self::builder().build().await
    }

    /// Create a runtime builder.
    pub fn builder() -> CpuRuntimeBuilder {
        CpuRuntimeBuilder::default()
    }

    /// Get number of execution units.
    pub fn execution_units(&self) -> usize {
        self.execution_units
    }

    /// Get the memory tracker.
    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Check if runtime is shut down.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.read()
    }

    /// Number of launches queued or running.
    pub fn in_flight(&self) -> usize {
        *self.state.in_flight.borrow()
    }
}

#[async_trait]
impl OffloadRuntime for CpuRuntime {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn is_backend_available(&self, backend: Backend) -> bool {
        matches!(backend, Backend::Cpu | Backend::Auto)
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("cpu ({} execution units)", self.execution_units),
            backend: Backend::Cpu,
            execution_units: self.execution_units,
            total_memory: self.tracker.capacity(),
        }
    }

    fn allocate_shared(&self, size: usize, align: usize) -> Result<UnifiedAllocation> {
        if self.is_shutdown() {
            return Err(OffloadError::BackendError(
                "Runtime is shut down".to_string(),
            ));
        }

        let alloc = UnifiedAllocation::new(Arc::clone(&self.tracker), size, align)?;
        debug!(
            "Allocated {} bytes of unified memory ({} in use)",
            size,
            self.tracker.in_use()
        );
        Ok(alloc)
    }

    fn launch(&self, kernel: Arc<dyn Kernel>, config: LaunchConfig) -> Result<LaunchTicket> {
        // Held until the launch is counted in flight, so shutdown drains it.
        let shutdown = self.shutdown.read();
        if *shutdown {
            return Err(OffloadError::BackendError(
                "Runtime is shut down".to_string(),
            ));
        }

        config.validate()?;
        kernel.validate(&config)?;

        let id = LaunchId::new(self.next_launch.fetch_add(1, Ordering::Relaxed));
        let (ticket, done) = LaunchTicket::channel(id);

        debug!(
            "Launching CPU kernel '{}' as {} (grid={}, block={})",
            kernel.name(),
            id,
            config.grid_dim,
            config.block_dim
        );

        self.state.begin();
        self.total_launched.fetch_add(1, Ordering::Relaxed);
        drop(shutdown);

        let state = Arc::clone(&self.state);
        let delay = self.execution_delay;
        self.pool.spawn(move || {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }

            let name = kernel.name().to_string();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                execute_grid(kernel.as_ref(), &config)
            }));
            // Release the kernel and its buffers before reporting completion.
            drop(kernel);

            let result = outcome.map_err(|payload| {
                OffloadError::KernelFault(format!(
                    "kernel '{}' panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                ))
            });
            let fault = match &result {
                Err(OffloadError::KernelFault(message)) => Some(message.as_str()),
                _ => None,
            };
            state.finish(id, fault, done.observed());
            done.complete(result);
        });

        Ok(ticket)
    }

    async fn synchronize(&self) -> Result<()> {
        let mut idle = self.state.in_flight.subscribe();
        let drained = idle.wait_for(|n| *n == 0).await.is_ok();
        if !drained {
            return Err(OffloadError::BackendError(
                "device state dropped while waiting".to_string(),
            ));
        }

        match self.state.take_fault() {
            Some(message) => Err(OffloadError::KernelFault(message)),
            None => Ok(()),
        }
    }

    fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            kernels_launched: self.total_launched.load(Ordering::Relaxed),
            kernels_completed: self.state.completed.load(Ordering::Relaxed),
            kernel_faults: self.state.faulted.load(Ordering::Relaxed),
            memory_in_use: self.tracker.in_use(),
            peak_memory: self.tracker.peak(),
            live_allocations: self.tracker.live_allocations(),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down CPU runtime");

        *self.shutdown.write() = true;
        let result = self.synchronize().await;

        info!(
            "CPU runtime shut down complete ({} bytes still allocated)",
            self.tracker.in_use()
        );
        result
    }
}

/// Run every logical thread of `config`.
fn execute_grid(kernel: &dyn Kernel, config: &LaunchConfig) {
    let total = config.total_threads();
    if total == 1 {
        kernel.thread(&ThreadContext::from_linear(0, config));
        return;
    }

    (0..total)
        .into_par_iter()
        .for_each(|linear| kernel.thread(&ThreadContext::from_linear(linear, config)));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builder for [`CpuRuntime`].
#[derive(Debug, Clone, Default)]
pub struct CpuRuntimeBuilder {
    execution_units: Option<usize>,
    memory_limit: Option<usize>,
    execution_delay: Option<Duration>,
}

impl CpuRuntimeBuilder {
    /// Number of execution units; defaults to the host's available parallelism.
    pub fn execution_units(mut self, units: usize) -> Self {
        self.execution_units = Some(units);
        self
    }

    /// Simulated device memory capacity in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Hold every launch for `delay` before it starts executing.
    pub fn execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = Some(delay);
        self
    }

    /// Build the runtime.
    pub async fn build(self) -> Result<CpuRuntime> {
        let execution_units = match self.execution_units {
            Some(0) => {
                return Err(OffloadError::InvalidConfig(
                    "execution units must be at least 1".to_string(),
                ))
            }
            Some(units) => units,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        info!(
            "Initializing CPU runtime ({} execution units, memory limit {:?})",
            execution_units, self.memory_limit
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(execution_units)
            .thread_name(|i| format!("offload-cpu-{}", i))
            .build()
            .map_err(|e| OffloadError::BackendError(format!("Failed to start device pool: {}", e)))?;

        Ok(CpuRuntime {
            pool,
            execution_units,
            tracker: Arc::new(MemoryTracker::new(self.memory_limit)),
            state: Arc::new(DeviceState::new()),
            next_launch: AtomicU64::new(1),
            total_launched: AtomicU64::new(0),
            execution_delay: self.execution_delay,
            shutdown: RwLock::new(false),
        })
    }
}
