//! Backend-agnostic device runtime.
//!
//! A runtime provides the three primitives an offload program needs:
//! unified allocation, asynchronous kernel launch, and device synchronize.
//! Launch returns as soon as the work is queued; [`OffloadRuntime::synchronize`]
//! is the only point where the host waits for the device, and device writes
//! are visible to the host once it returns.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{OffloadError, Result};
use crate::kernel::Kernel;
use crate::launch::LaunchConfig;
use crate::memory::{DeviceCopy, SharedBuffer, UnifiedAllocation};

/// Device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Pick the best backend compiled into this build.
    #[default]
    Auto,
    /// Host threads standing in for the device.
    Cpu,
    /// NVIDIA GPUs.
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

impl FromStr for Backend {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "cpu" => Ok(Backend::Cpu),
            "cuda" => Ok(Backend::Cuda),
            other => Err(OffloadError::InvalidConfig(format!(
                "unknown backend '{other}' (expected auto, cpu or cuda)"
            ))),
        }
    }
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Backend the device belongs to.
    pub backend: Backend,
    /// Execution units that run device threads concurrently.
    pub execution_units: usize,
    /// Device memory capacity in bytes, `None` if unbounded.
    pub total_memory: Option<usize>,
}

/// Runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeMetrics {
    /// Kernels accepted by `launch`.
    pub kernels_launched: u64,
    /// Kernels that ran to completion.
    pub kernels_completed: u64,
    /// Kernels that faulted.
    pub kernel_faults: u64,
    /// Bytes of unified memory currently charged.
    pub memory_in_use: usize,
    /// High-water mark of `memory_in_use`.
    pub peak_memory: usize,
    /// Unified allocations not yet released.
    pub live_allocations: usize,
}

/// Identifier of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaunchId(u64);

impl LaunchId {
    /// Create a launch ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "launch-{}", self.0)
    }
}

/// Completion channel for a single launch, returned by backends.
#[derive(Debug)]
pub struct LaunchTicket {
    id: LaunchId,
    done: oneshot::Receiver<Result<()>>,
    observed: Arc<AtomicBool>,
}

impl LaunchTicket {
    /// Create a ticket and the completion the backend finishes it with.
    ///
    /// The backend must drop every reference it holds to the kernel before
    /// completing.
    pub fn channel(id: LaunchId) -> (Self, LaunchCompletion) {
        let (tx, done) = oneshot::channel();
        let observed = Arc::new(AtomicBool::new(false));
        (
            Self {
                id,
                done,
                observed: Arc::clone(&observed),
            },
            LaunchCompletion { done: tx, observed },
        )
    }

    /// Launch ID.
    pub fn id(&self) -> LaunchId {
        self.id
    }
}

/// Backend side of a [`LaunchTicket`].
#[derive(Debug)]
pub struct LaunchCompletion {
    done: oneshot::Sender<Result<()>>,
    observed: Arc<AtomicBool>,
}

impl LaunchCompletion {
    /// Flag raised once the host has received the launch result through its
    /// ticket. A fault already received there is not reported again by
    /// [`OffloadRuntime::synchronize`].
    pub fn observed(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.observed)
    }

    /// Deliver the launch result. A dropped ticket is not an error.
    pub fn complete(self, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

/// Device runtime.
#[async_trait]
pub trait OffloadRuntime: Send + Sync {
    /// Backend this runtime drives.
    fn backend(&self) -> Backend;

    /// Whether `backend` can be served by this runtime.
    fn is_backend_available(&self, backend: Backend) -> bool;

    /// Device description.
    fn device_info(&self) -> DeviceInfo;

    /// Allocate `size` bytes of unified memory aligned to `align`.
    fn allocate_shared(&self, size: usize, align: usize) -> Result<UnifiedAllocation>;

    /// Queue `kernel` on the device and return immediately.
    fn launch(&self, kernel: Arc<dyn Kernel>, config: LaunchConfig) -> Result<LaunchTicket>;

    /// Block until every launched kernel has finished.
    ///
    /// Returns the first kernel fault recorded since the previous
    /// synchronize, if any, skipping faults already received through
    /// [`PendingLaunch::wait`]. There is no bound on the wait.
    async fn synchronize(&self) -> Result<()>;

    /// [`synchronize`](Self::synchronize) bounded by `timeout`.
    async fn synchronize_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.synchronize()).await {
            Ok(result) => result,
            Err(_) => Err(OffloadError::Timeout(timeout)),
        }
    }

    /// Runtime counters.
    fn metrics(&self) -> RuntimeMetrics;

    /// Bytes of unified memory currently allocated.
    fn memory_in_use(&self) -> usize {
        self.metrics().memory_in_use
    }

    /// Drain outstanding work and refuse further launches.
    async fn shutdown(&self) -> Result<()>;
}

/// Typed helpers available on every runtime, including `dyn OffloadRuntime`.
pub trait OffloadRuntimeExt: OffloadRuntime {
    /// Allocate a unified buffer of `len` elements.
    fn alloc_shared<T: DeviceCopy>(&self, len: usize) -> Result<SharedBuffer<T>> {
        if len == 0 {
            return Err(OffloadError::InvalidArgument(
                "buffer length must be at least 1".to_string(),
            ));
        }
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(OffloadError::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            })?;
        let alloc = self.allocate_shared(size, std::mem::align_of::<T>())?;
        SharedBuffer::from_allocation(alloc, len)
    }

    /// Launch `kernel`, moving it (and the buffers it owns) to the device.
    fn launch_kernel<K: Kernel>(&self, kernel: K, config: LaunchConfig) -> Result<PendingLaunch<K>> {
        let kernel = Arc::new(kernel);
        let ticket = self.launch(Arc::clone(&kernel) as Arc<dyn Kernel>, config)?;
        Ok(PendingLaunch { ticket, kernel })
    }
}

impl<R: OffloadRuntime + ?Sized> OffloadRuntimeExt for R {}

/// A kernel resident on the device.
///
/// The host cannot reach the kernel or its buffers until the device has
/// released them. Dropping the handle early is safe: the device keeps the
/// kernel alive until it finishes and then frees it.
pub struct PendingLaunch<K: Kernel> {
    ticket: LaunchTicket,
    kernel: Arc<K>,
}

impl<K: Kernel> PendingLaunch<K> {
    /// Launch ID.
    pub fn id(&self) -> LaunchId {
        self.ticket.id
    }

    /// Whether the device has released the kernel.
    pub fn is_complete(&self) -> bool {
        Arc::strong_count(&self.kernel) == 1
    }

    /// Wait for this launch alone and take the kernel back.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<K> {
        let PendingLaunch {
            ticket: LaunchTicket { id, done, observed },
            kernel,
        } = self;

        let outcome = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, done)
                .await
                .map_err(|_| OffloadError::Timeout(timeout))?,
            None => done.await,
        };
        let result = outcome
            .map_err(|_| OffloadError::BackendError(format!("{id} dropped without completing")))?;
        observed.store(true, Ordering::Release);
        result?;

        Self::unwrap_kernel(id, kernel)
    }

    /// Take the kernel back after a device-wide synchronize.
    pub fn reclaim(self) -> Result<K> {
        Self::unwrap_kernel(self.ticket.id, self.kernel)
    }

    fn unwrap_kernel(id: LaunchId, kernel: Arc<K>) -> Result<K> {
        Arc::try_unwrap(kernel).map_err(|_| {
            OffloadError::InvalidState(format!("{id} is still resident on the device"))
        })
    }
}

impl<K: Kernel> fmt::Debug for PendingLaunch<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLaunch")
            .field("id", &self.ticket.id)
            .field("kernel", &self.kernel.name())
            .finish()
    }
}
