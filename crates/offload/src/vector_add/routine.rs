//! The timed host sequence around one vector-add launch.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use offload_core::error::{OffloadError, Result};
use offload_core::launch::{LaunchConfig, LaunchPolicy};
use offload_core::runtime::{OffloadRuntime, OffloadRuntimeExt};

use super::kernel::VectorAdd;

/// Default vector length (2^20 elements).
pub const DEFAULT_LEN: usize = 1 << 20;

/// Host initial value of every X element.
pub const X_INIT: f32 = 1.0;

/// Host initial value of every Y element.
pub const Y_INIT: f32 = 2.0;

/// Value every Y element holds after the kernel.
pub const EXPECTED_VALUE: f32 = X_INIT + Y_INIT;

/// Default bound on the synchronize wait.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Routine options.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorAddOptions {
    /// Vector length.
    pub len: usize,
    /// How the index space is spread over device threads.
    pub policy: LaunchPolicy,
    /// Bound on the synchronize wait; `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// Check the result on the host before freeing it.
    pub verify: bool,
}

impl Default for VectorAddOptions {
    fn default() -> Self {
        Self {
            len: DEFAULT_LEN,
            policy: LaunchPolicy::SingleThread,
            sync_timeout: Some(DEFAULT_SYNC_TIMEOUT),
            verify: true,
        }
    }
}

impl VectorAddOptions {
    /// Default options for `len` elements.
    pub fn with_len(len: usize) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }

    /// Set the launch policy.
    pub fn policy(mut self, policy: LaunchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the synchronize bound.
    pub fn sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

/// Host-side check of the output vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// Elements checked.
    pub checked: usize,
    /// Elements that differ from the expected value.
    pub mismatches: usize,
    /// First differing element as `(index, value)`.
    pub first_mismatch: Option<(usize, f32)>,
}

impl Verification {
    /// Compare every element of `values` with `expected`.
    pub fn check(values: &[f32], expected: f32) -> Self {
        let mut mismatches = 0;
        let mut first_mismatch = None;
        for (i, value) in values.iter().enumerate() {
            if *value != expected {
                mismatches += 1;
                first_mismatch.get_or_insert((i, *value));
            }
        }
        Self {
            checked: values.len(),
            mismatches,
            first_mismatch,
        }
    }

    /// Whether every element matched.
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }
}

/// Outcome of one routine run.
#[derive(Debug, Clone)]
pub struct VectorAddReport {
    /// Vector length.
    pub len: usize,
    /// Launch configuration the kernel ran with.
    pub launch: LaunchConfig,
    /// Host time from before allocation until both buffers were freed.
    pub elapsed: Duration,
    /// Wall-clock time the run finished.
    pub finished_at: SystemTime,
    /// Result check, when requested.
    pub verification: Option<Verification>,
}

impl VectorAddReport {
    /// Elapsed time in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// End timestamp as seconds since the Unix epoch.
    pub fn finished_at_secs(&self) -> f64 {
        self.finished_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// `Some(true)` if verified and correct, `None` if not verified.
    pub fn is_correct(&self) -> Option<bool> {
        self.verification.as_ref().map(Verification::passed)
    }
}

impl fmt::Display for VectorAddReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vector_add n={} launch={} elapsed={:.6}s",
            self.len,
            self.launch,
            self.elapsed_secs()
        )
    }
}

/// Run the vector-add routine on `runtime`.
///
/// Allocates X and Y, fills them with [`X_INIT`] and [`Y_INIT`], launches
/// [`VectorAdd`], waits at the device barrier and frees both buffers. The
/// measured time covers all of it.
///
/// Fails with `InvalidArgument` for a zero length before anything is
/// allocated, and with `OutOfMemory` before anything is launched. On
/// `Timeout` the buffers stay with the device and are freed when the
/// kernel finishes.
pub async fn run<R>(runtime: &R, options: &VectorAddOptions) -> Result<VectorAddReport>
where
    R: OffloadRuntime + ?Sized,
{
    execute(runtime, options, false).await.map(|(report, _)| report)
}

/// Like [`run`], but also returns a host copy of Y taken before it is freed.
pub async fn run_and_collect<R>(
    runtime: &R,
    options: &VectorAddOptions,
) -> Result<(VectorAddReport, Vec<f32>)>
where
    R: OffloadRuntime + ?Sized,
{
    let (report, output) = execute(runtime, options, true).await?;
    Ok((report, output.unwrap_or_default()))
}

async fn execute<R>(
    runtime: &R,
    options: &VectorAddOptions,
    collect: bool,
) -> Result<(VectorAddReport, Option<Vec<f32>>)>
where
    R: OffloadRuntime + ?Sized,
{
    if options.len == 0 {
        return Err(OffloadError::InvalidArgument(
            "vector length must be at least 1".to_string(),
        ));
    }
    let launch = options.policy.config_for(options.len)?;

    let start = Instant::now();

    let mut x = runtime.alloc_shared::<f32>(options.len)?;
    let mut y = runtime.alloc_shared::<f32>(options.len)?;
    debug!("Allocated 2 x {} bytes of unified memory", x.size_bytes());

    x.fill(X_INIT);
    y.fill(Y_INIT);

    let pending = runtime.launch_kernel(VectorAdd::new(x, y)?, launch)?;
    debug!("Launched {} with {} ({} policy)", pending.id(), launch, options.policy);

    let synced = match options.sync_timeout {
        Some(timeout) => runtime.synchronize_timeout(timeout).await,
        None => runtime.synchronize().await,
    };
    if let Err(e) = synced {
        if e.is_timeout() {
            warn!("{} still running on the device: {}", pending.id(), e);
        }
        return Err(e);
    }

    let (x, y) = pending.reclaim()?.into_buffers();

    let verification = options
        .verify
        .then(|| Verification::check(y.as_slice(), EXPECTED_VALUE));
    let output = collect.then(|| y.as_slice().to_vec());

    drop(x);
    drop(y);

    let elapsed = start.elapsed();
    let report = VectorAddReport {
        len: options.len,
        launch,
        elapsed,
        finished_at: SystemTime::now(),
        verification,
    };

    match report.is_correct() {
        Some(false) => warn!("{}: verification failed", report),
        _ => info!("{}", report),
    }

    Ok((report, output))
}
