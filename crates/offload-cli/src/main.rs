//! offload - run numeric kernels on an accelerator and check them on the host
//!
//! Resolves a compute device, loads each program from the on-disk binary
//! cache (compiling and storing it on a miss), dispatches it, prints device
//! timings and verifies the output against a host reference.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{debug, info, warn};
use offload_accelerate::harness::{
    self, GemmDims, RunReport, DEFAULT_FINDMAX_LEN, DEFAULT_INVERSION_SIZE, DEFAULT_MATVEC_SIZE,
};
use offload_accelerate::{
    open_platform, resolver, AccelerateProviderPreference, AcceleratorSession, ProgramCache,
};
use offload_api::{ComputePlatform, OffloadError, QueueProperties};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
use config::{ConfigLoader, LogLevel, OffloadConfig, VerifyMode};

#[derive(Parser)]
#[command(
    name = "offload",
    version = env!("CARGO_PKG_VERSION"),
    about = "Run numeric kernels on an accelerator and verify them on the host",
    after_help = r#"
Environment Variables:
  OFFLOAD_PROVIDER=<name>        Provider (auto, wgpu, in-process)
  OFFLOAD_CACHE_DIR=<path>       Program binary cache directory
  OFFLOAD_KERNEL_DIR=<path>      Read kernel sources from here on a cache miss
  OFFLOAD_LOG_LEVEL=debug        Log level (error, warn, info, debug, trace)
  OFFLOAD_LOG=debug              Alias of OFFLOAD_LOG_LEVEL
  OFFLOAD_DEBUG=1                Enable debug logging
  OFFLOAD_CONFIG=<path>          Configuration file
  OFFLOAD_SEED=<n>               Seed for generated inputs
  OFFLOAD_POWER_PREFERENCE=low   WGPU power preference (auto, high, low)
  OFFLOAD_FALLBACK_ADAPTER=1     Only consider WGPU fallback (CPU) adapters

Examples:
  offload findmax                 # maximum of 1024 random values
  offload gemm                    # 1024x1024x1024, 10 timed launches
  offload gemm 512 512 512        # C(MxN) = A(MxK) * B(KxN)
  offload gemm 64 32 16 64        # widthA heightA widthB heightB
  offload inversion 5             # Gauss-Jordan inverse of a 5x5 matrix
  offload matvec 4 4              # matrix-vector product
  offload devices                 # list platforms and devices
"#
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, env = "OFFLOAD_DEBUG", value_parser = parse_bool_env)]
    debug: bool,

    /// Set log level
    #[arg(long, value_enum, env = "OFFLOAD_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Compute provider
    #[arg(long, value_enum, env = "OFFLOAD_PROVIDER")]
    provider: Option<ProviderArg>,

    /// Program binary cache directory
    #[arg(long, env = "OFFLOAD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory of `<program>.wgsl` sources compiled on a cache miss
    #[arg(long, env = "OFFLOAD_KERNEL_DIR")]
    kernel_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, env = "OFFLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Timed launches for gemm
    #[arg(long)]
    iterations: Option<u32>,

    /// Seed for generated inputs
    #[arg(long)]
    seed: Option<u64>,

    /// Result comparison policy
    #[arg(long, value_enum)]
    verify: Option<VerifyMode>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    /// Maximum of N random values via a work-group reduction
    Findmax {
        #[arg(default_value_t = DEFAULT_FINDMAX_LEN)]
        len: u32,
    },
    /// Blocked 4x4 matrix multiply: `M K N` or `widthA heightA widthB heightB`
    ///
    /// Every dimension, M included, is rounded up to a multiple of 4 since
    /// each work-item writes a whole 4x4 block. Defaults to 1024 each.
    Gemm {
        #[arg(num_args = 0..=4)]
        dims: Vec<u32>,
    },
    /// Gauss-Jordan inversion of an N x N matrix, one launch per row
    Inversion {
        #[arg(default_value_t = DEFAULT_INVERSION_SIZE)]
        size: u32,
    },
    /// Matrix-vector product
    Matvec {
        #[arg(default_value_t = DEFAULT_MATVEC_SIZE)]
        rows: u32,
        #[arg(default_value_t = DEFAULT_MATVEC_SIZE)]
        cols: u32,
    },
    /// List platforms and devices, and the device a run would use
    Devices,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProviderArg {
    Auto,
    Wgpu,
    InProcess,
}

impl From<ProviderArg> for AccelerateProviderPreference {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Auto => AccelerateProviderPreference::Auto,
            ProviderArg::Wgpu => AccelerateProviderPreference::Wgpu,
            ProviderArg::InProcess => AccelerateProviderPreference::InProcess,
        }
    }
}

fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        "" => Ok(false),
        _ => Err(format!(
            "Invalid boolean value '{s}'. Expected: 1/0, true/false, yes/no, on/off"
        )),
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Exit status for a fatal error: the library error's own code when one is
/// in the chain, else 1.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OffloadError>())
        .map_or(1, OffloadError::exit_code)
}

fn run(cli: Cli) -> Result<ExitCode> {
    if cli.generate_config {
        println!("{}", ConfigLoader::generate_sample_config());
        return Ok(ExitCode::SUCCESS);
    }
    let Some(command) = cli.command.clone() else {
        Cli::command().print_help()?;
        return Ok(ExitCode::SUCCESS);
    };

    let mut config = load_configuration(&cli)?;
    apply_cli_overrides(&mut config, &cli);

    let log_level = if config.logging.debug {
        log::LevelFilter::Debug
    } else {
        config.logging.level.to_filter()
    };
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .filter_level(log_level)
        .format(format_log_record)
        .init();

    info!("offload v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Configuration loaded: {config:?}");

    let platform = open_platform(&config.accelerate)
        .context("Failed to open a compute platform")?;

    let report = match command {
        Commands::Devices => {
            list_devices(platform.as_ref())?;
            return Ok(ExitCode::SUCCESS);
        }
        command => run_program(platform.as_ref(), &config, command)?,
    };
    print_report(&report);
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_configuration(cli: &Cli) -> Result<OffloadConfig> {
    let config_from_env = std::env::var("OFFLOAD_CONFIG").ok().map(PathBuf::from);

    if let Some(config_file) = &cli.config {
        let is_from_env = config_from_env.as_ref() == Some(config_file);
        if config_file.is_file() {
            return ConfigLoader::load_with_file(config_file);
        }
        if !is_from_env {
            bail!(
                "Specified config file does not exist: {}",
                config_file.display()
            );
        }
        // Logging is not up yet; a stale OFFLOAD_CONFIG only warns.
        eprintln!(
            "Warning: OFFLOAD_CONFIG points to a missing file, ignoring: {}",
            config_file.display()
        );
    }
    ConfigLoader::load()
}

fn apply_cli_overrides(config: &mut OffloadConfig, cli: &Cli) {
    if let Some(provider) = cli.provider {
        config.accelerate.provider = provider.into();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache.dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.kernel_dir {
        config.cache.kernel_dir = Some(dir.clone());
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.debug {
        config.logging.debug = true;
    }
    if let Some(iterations) = cli.iterations {
        config.run.iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.run.seed = Some(seed);
    }
    if let Some(verify) = cli.verify {
        config.run.verify = verify;
    }
}

fn run_program(
    platform: &dyn ComputePlatform,
    config: &OffloadConfig,
    command: Commands,
) -> Result<RunReport> {
    let session = AcceleratorSession::open(platform, QueueProperties { profiling: true })
        .context("Failed to open a device session")?;
    let device = session.device();
    info!(
        "Using device '{}' ({}, driver {}) via {}",
        device.name, device.vendor, device.driver, device.backend
    );
    let mut cache = ProgramCache::new(config.cache.resolve_dir());
    debug!("Program cache: {}", cache.dir().display());
    if let Some(dir) = &config.cache.kernel_dir {
        debug!("Kernel sources: {}", dir.display());
        cache = cache.with_source_dir(dir);
    }
    let options = config.run.to_run_options();

    let report = match command {
        Commands::Findmax { len } => harness::run_findmax(&session, &cache, len, &options),
        Commands::Gemm { dims } => {
            let (dims, warning) = GemmDims::from_args(&dims)?;
            if let Some(warning) = warning {
                warn!("gemm: {warning}");
                println!("{warning}");
            }
            harness::run_gemm(&session, &cache, dims, &options)
        }
        Commands::Inversion { size } => harness::run_inversion(&session, &cache, size, &options),
        Commands::Matvec { rows, cols } => {
            harness::run_matvec(&session, &cache, rows, cols, &options)
        }
        Commands::Devices => bail!("devices is not a program"),
    };
    let report = report.with_context(|| format!("Failed to run on '{}'", session.device().name))?;
    debug!("{}: {}", report.program, report.origin);
    Ok(report)
}

fn print_report(report: &RunReport) {
    for line in &report.lines {
        println!("{line}");
    }
    println!("{}", report.verdict());
}

fn list_devices(platform: &dyn ComputePlatform) -> Result<()> {
    println!("Provider: {}", platform.backend_name());
    for (info, devices) in resolver::describe_platforms(platform)? {
        println!(
            "Platform {}: {} ({}, {})",
            info.id.0, info.name, info.vendor, info.version
        );
        if devices.is_empty() {
            println!("  (no devices)");
        }
        for device in devices {
            println!(
                "  [{}] {} | {} | vendor: {} | driver: {} | max work-group: {}",
                device.index,
                device.name,
                device.class,
                device.vendor,
                device.driver,
                device.max_work_group_size
            );
        }
    }
    match resolver::resolve(platform) {
        Ok(device) => println!("Selected: {} ({})", device.name, device.class),
        Err(e) => println!("Selected: none ({e})"),
    }
    Ok(())
}

fn format_log_record(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    let timestamp = buf.timestamp_nanos();
    writeln!(
        buf,
        "[{} {:>5} {}] {}",
        timestamp,
        record.level(),
        record.target(),
        record.args()
    )
}
