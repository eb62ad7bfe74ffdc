//! # Offload
//!
//! Unified-memory kernel offload for Rust.
//!
//! Allocate buffers both host and device can address, fill them on the host,
//! hand them to a kernel on the device, wait at a single barrier and take them
//! back. Ownership enforces the handoff: once a buffer is launched the host
//! cannot touch it until the device has released it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use offload::prelude::*;
//! use offload::vector_add::{self, VectorAddOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let runtime = Offload::builder().backend(Backend::Auto).build().await?;
//!
//!     let report = vector_add::run(&runtime, &VectorAddOptions::default()).await?;
//!     println!("time taken: {:.6}s", report.elapsed_secs());
//!
//!     runtime.shutdown().await
//! }
//! ```
//!
//! ## Backends
//!
//! - **CPU** - Host threads standing in for the device (always available)
//! - **CUDA** - Not part of this build; requesting it yields
//!   [`OffloadError::BackendUnavailable`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use offload_core::*;
pub use offload_cpu::CpuRuntime;

pub mod config;
pub mod vector_add;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::OffloadConfig;
    pub use crate::Offload;
    pub use offload_core::prelude::*;
}

/// Main runtime facade.
///
/// Wraps whichever backend the builder selected behind the
/// [`OffloadRuntime`] trait.
pub struct Offload {
    inner: Box<dyn OffloadRuntime>,
}

impl Offload {
    /// Create a new runtime builder.
    pub fn builder() -> OffloadBuilder {
        OffloadBuilder::new()
    }

    /// Create a new runtime with default settings.
    pub async fn new() -> Result<Self> {
        Self::builder().build().await
    }

    /// Create with a specific backend.
    pub async fn with_backend(backend: Backend) -> Result<Self> {
        Self::builder().backend(backend).build().await
    }
}

#[async_trait]
impl OffloadRuntime for Offload {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    fn is_backend_available(&self, backend: Backend) -> bool {
        self.inner.is_backend_available(backend)
    }

    fn device_info(&self) -> DeviceInfo {
        self.inner.device_info()
    }

    fn allocate_shared(&self, size: usize, align: usize) -> Result<UnifiedAllocation> {
        self.inner.allocate_shared(size, align)
    }

    fn launch(&self, kernel: Arc<dyn Kernel>, config: LaunchConfig) -> Result<LaunchTicket> {
        self.inner.launch(kernel, config)
    }

    async fn synchronize(&self) -> Result<()> {
        self.inner.synchronize().await
    }

    async fn synchronize_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.synchronize_timeout(timeout).await
    }

    fn metrics(&self) -> RuntimeMetrics {
        self.inner.metrics()
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

/// Builder for the [`Offload`] runtime.
#[derive(Debug, Clone, Default)]
pub struct OffloadBuilder {
    backend: Backend,
    execution_units: Option<usize>,
    memory_limit: Option<usize>,
    execution_delay: Option<Duration>,
}

impl OffloadBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Number of device execution units.
    pub fn execution_units(mut self, units: usize) -> Self {
        self.execution_units = Some(units);
        self
    }

    /// Device memory capacity in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Hold every launch for `delay` before it runs. Only honoured by the
    /// CPU device.
    pub fn execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = Some(delay);
        self
    }

    /// Build the runtime.
    pub async fn build(self) -> Result<Offload> {
        let inner: Box<dyn OffloadRuntime> = match self.backend {
            Backend::Auto => {
                // No accelerator backend is compiled in, so Auto lands on the CPU.
                tracing::info!("Auto-selected CPU backend (no GPU backend available)");
                Box::new(self.build_cpu().await?)
            }
            Backend::Cpu => Box::new(self.build_cpu().await?),
            Backend::Cuda => {
                return Err(OffloadError::BackendUnavailable(
                    "CUDA backend not compiled into this build".to_string(),
                ))
            }
        };

        Ok(Offload { inner })
    }

    async fn build_cpu(&self) -> Result<CpuRuntime> {
        let mut builder = CpuRuntime::builder();
        if let Some(units) = self.execution_units {
            builder = builder.execution_units(units);
        }
        if let Some(bytes) = self.memory_limit {
            builder = builder.memory_limit(bytes);
        }
        if let Some(delay) = self.execution_delay {
            builder = builder.execution_delay(delay);
        }
        builder.build().await
    }
}

/// Check availability of backends at runtime.
pub mod availability {
    use super::Backend;

    /// Check if the CPU device is available.
    pub fn cpu() -> bool {
        offload_cpu::is_cpu_available()
    }

    /// Check if CUDA is available.
    pub fn cuda() -> bool {
        false
    }

    /// Get list of available backends.
    pub fn available_backends() -> Vec<Backend> {
        let mut backends = Vec::new();

        if cpu() {
            backends.push(Backend::Cpu);
        }
        if cuda() {
            backends.push(Backend::Cuda);
        }

        backends
    }
}
