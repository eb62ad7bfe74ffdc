//! vector-add - time a vector addition offloaded to a device.
//!
//! Allocates two unified-memory vectors, fills them on the host, adds them on
//! the device, waits for the device, frees them and prints how long it took.
//!
//! # Examples
//!
//! ```bash
//! # Baseline: 2^20 elements on a single device thread
//! vector-add
//!
//! # One device thread per element, bounded wait of 5 seconds
//! vector-add --launch parallel --block-size 256 --timeout-ms 5000
//!
//! # Settings from a file, overridden by OFFLOAD__* variables and flags
//! OFFLOAD__ROUTINE__LEN=4096 vector-add --config offload.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use offload::config::OffloadConfig;
use offload::vector_add::{self, VectorAddReport};
use offload::OffloadRuntime;

mod error;

use error::{CliError, CliResult};

/// Time a unified-memory vector addition offloaded to a device
#[derive(Parser, Debug)]
#[command(name = "vector-add")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vector length
    #[arg(short = 'n', long)]
    len: Option<usize>,

    /// Launch policy (single-thread, parallel)
    #[arg(short, long)]
    launch: Option<String>,

    /// Threads per block for the parallel policy
    #[arg(long)]
    block_size: Option<u32>,

    /// Bound on the synchronize wait in milliseconds (0 waits forever)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Device backend (auto, cpu, cuda)
    #[arg(short, long)]
    backend: Option<String>,

    /// Device execution units
    #[arg(long)]
    units: Option<usize>,

    /// Device memory capacity in bytes
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Skip checking the result on the host
    #[arg(long)]
    no_verify: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors and the timing
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Load file and environment settings, then apply flags on top.
    fn resolve_config(&self) -> CliResult<OffloadConfig> {
        let mut config = match &self.config {
            Some(path) => OffloadConfig::load(path)?,
            None => OffloadConfig::from_env()?,
        };

        if let Some(len) = self.len {
            config.routine.len = len;
        }
        if let Some(launch) = &self.launch {
            config.routine.launch = launch.clone();
        }
        if let Some(block_size) = self.block_size {
            config.routine.block_size = block_size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.routine.sync_timeout_ms = timeout_ms;
        }
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        if let Some(units) = self.units {
            config.device.execution_units = Some(units);
        }
        if let Some(bytes) = self.memory_limit {
            config.device.memory_limit_bytes = Some(bytes);
        }
        if self.no_verify {
            config.routine.verify = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn setup_logging(verbose: bool, quiet: bool, level: &str) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn execute(config: &OffloadConfig, quiet: bool) -> CliResult<()> {
    let runtime = config.build_runtime().await?;
    let options = config.routine_options()?;

    let info = runtime.device_info();
    tracing::info!("Running on {} ({} backend)", info.name, info.backend);

    // On failure the device may still be running; exit without draining it.
    let report = vector_add::run(&runtime, &options).await?;
    runtime.shutdown().await?;

    print_report(&report, quiet);

    match &report.verification {
        Some(v) if !v.passed() => Err(CliError::VerificationFailed {
            mismatches: v.mismatches,
            checked: v.checked,
        }),
        _ => Ok(()),
    }
}

fn print_report(report: &VectorAddReport, quiet: bool) {
    println!("time taken");
    println!("{:.6}", report.finished_at_secs());
    println!("{:.6}", report.elapsed_secs());

    if quiet {
        return;
    }

    println!(
        "  {} {} elements, launch {}",
        "vector_add:".bright_white(),
        report.len,
        report.launch.to_string().bright_cyan()
    );
    match &report.verification {
        Some(v) if v.passed() => println!(
            "  {} all {} elements equal {}",
            "✓".green(),
            v.checked,
            vector_add::EXPECTED_VALUE
        ),
        Some(v) => {
            let (index, value) = v.first_mismatch.unwrap_or_default();
            println!(
                "  {} {} of {} elements wrong (first at {}: {})",
                "✗".red(),
                v.mismatches,
                v.checked,
                index,
                value
            );
        }
        None => println!("  {} verification skipped", "-".dimmed()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    match execute(&config, cli.quiet).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "vector-add",
            "-n",
            "1024",
            "--launch",
            "parallel",
            "--block-size",
            "64",
            "--timeout-ms",
            "0",
            "--backend",
            "cpu",
            "--units",
            "2",
            "--no-verify",
        ])
        .unwrap();

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.routine.len, 1024);
        assert_eq!(config.routine.launch, "parallel");
        assert_eq!(config.routine.block_size, 64);
        assert_eq!(config.sync_timeout(), None);
        assert_eq!(config.backend, "cpu");
        assert_eq!(config.device.execution_units, Some(2));
        assert!(!config.routine.verify);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let cli = Cli::try_parse_from(["vector-add", "-n", "0"]).unwrap();
        assert!(matches!(cli.resolve_config(), Err(CliError::Offload(_))));

        let cli = Cli::try_parse_from(["vector-add", "--launch", "warp"]).unwrap();
        assert!(cli.resolve_config().is_err());
    }

    #[tokio::test]
    async fn test_execute_small_run() {
        let cli = Cli::try_parse_from(["vector-add", "-n", "256", "--backend", "cpu", "-q"])
            .unwrap();
        let config = cli.resolve_config().unwrap();
        assert!(execute(&config, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_out_of_memory() {
        let cli = Cli::try_parse_from([
            "vector-add",
            "-n",
            "4096",
            "--backend",
            "cpu",
            "--memory-limit",
            "1024",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();

        match execute(&config, true).await {
            Err(CliError::Offload(e)) => assert!(e.is_out_of_memory()),
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_cuda_unavailable() {
        let cli = Cli::try_parse_from(["vector-add", "--backend", "cuda"]).unwrap();
        let config = cli.resolve_config().unwrap();
        assert!(execute(&config, true).await.is_err());
    }
}
