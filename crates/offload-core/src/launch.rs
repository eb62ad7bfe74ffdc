//! Launch configuration and launch policy selection.

use std::fmt;
use std::str::FromStr;

use crate::error::{OffloadError, Result};

/// Default threads per block for parallel launches.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Largest grid dimension accepted by a launch.
pub const MAX_GRID_DIM: u32 = (1 << 31) - 1;

/// Largest block dimension accepted by a launch.
pub const MAX_BLOCK_DIM: u32 = 1024;

/// One-dimensional launch configuration (`<<<grid_dim, block_dim>>>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of blocks in the grid.
    pub grid_dim: u32,
    /// Number of threads per block.
    pub block_dim: u32,
}

impl LaunchConfig {
    /// Creates a configuration with explicit dimensions.
    #[must_use]
    pub fn new(grid_dim: u32, block_dim: u32) -> Self {
        Self {
            grid_dim,
            block_dim,
        }
    }

    /// A single device thread that runs the whole index space serially.
    #[must_use]
    pub fn single_thread() -> Self {
        Self::new(1, 1)
    }

    /// Enough blocks of `block_size` threads to give every element its own
    /// thread, capped at [`MAX_GRID_DIM`] blocks.
    pub fn for_elements(element_count: usize, block_size: u32) -> Result<Self> {
        if block_size == 0 || block_size > MAX_BLOCK_DIM {
            return Err(OffloadError::InvalidConfig(format!(
                "block size must be in 1..={MAX_BLOCK_DIM}, got {block_size}"
            )));
        }
        if element_count == 0 {
            return Err(OffloadError::InvalidArgument(
                "cannot size a launch for zero elements".to_string(),
            ));
        }

        let blocks = element_count.div_ceil(block_size as usize);
        let grid_dim = u32::try_from(blocks).unwrap_or(MAX_GRID_DIM).min(MAX_GRID_DIM);
        Ok(Self::new(grid_dim, block_size))
    }

    /// Total logical device threads.
    #[must_use]
    pub fn total_threads(&self) -> u64 {
        self.grid_dim as u64 * self.block_dim as u64
    }

    /// Check the dimensions are launchable.
    pub fn validate(&self) -> Result<()> {
        if self.grid_dim == 0 || self.block_dim == 0 {
            return Err(OffloadError::LaunchFailed(format!(
                "empty launch configuration {self}"
            )));
        }
        if self.grid_dim > MAX_GRID_DIM || self.block_dim > MAX_BLOCK_DIM {
            return Err(OffloadError::LaunchFailed(format!(
                "launch configuration {self} exceeds device limits"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<<<{}, {}>>>", self.grid_dim, self.block_dim)
    }
}

/// How a kernel's index space is spread across device threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPolicy {
    /// One device thread walks every element.
    #[default]
    SingleThread,
    /// One device thread per element, in blocks of `block_size`.
    Parallel {
        /// Threads per block.
        block_size: u32,
    },
}

impl LaunchPolicy {
    /// Parallel policy with the default block size.
    #[must_use]
    pub fn parallel() -> Self {
        LaunchPolicy::Parallel {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Launch configuration for `element_count` elements.
    pub fn config_for(&self, element_count: usize) -> Result<LaunchConfig> {
        match *self {
            LaunchPolicy::SingleThread => {
                if element_count == 0 {
                    return Err(OffloadError::InvalidArgument(
                        "cannot size a launch for zero elements".to_string(),
                    ));
                }
                Ok(LaunchConfig::single_thread())
            }
            LaunchPolicy::Parallel { block_size } => {
                LaunchConfig::for_elements(element_count, block_size)
            }
        }
    }

    /// Replace the block size; no effect on the single-thread policy.
    #[must_use]
    pub fn with_block_size(self, block_size: u32) -> Self {
        match self {
            LaunchPolicy::SingleThread => self,
            LaunchPolicy::Parallel { .. } => LaunchPolicy::Parallel { block_size },
        }
    }
}

impl fmt::Display for LaunchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchPolicy::SingleThread => write!(f, "single-thread"),
            LaunchPolicy::Parallel { .. } => write!(f, "parallel"),
        }
    }
}

impl FromStr for LaunchPolicy {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single-thread" | "single" | "serial" => Ok(LaunchPolicy::SingleThread),
            "parallel" => Ok(LaunchPolicy::parallel()),
            other => Err(OffloadError::InvalidConfig(format!(
                "unknown launch policy '{other}' (expected single-thread or parallel)"
            ))),
        }
    }
}
