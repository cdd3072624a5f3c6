//! Configuration for the offload runner
//!
//! Sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (`OFFLOAD_CONFIG`, `.offload.toml` and friends)
//! 4. Built-in defaults

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use log::{debug, info};
use offload_accelerate::harness::{RunOptions, DEFAULT_ITERATIONS};
use offload_accelerate::{
    AccelPowerPreference, AccelerateInitOptions, AccelerateProviderPreference, ProgramCache,
    VerifyPolicy,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffloadConfig {
    #[serde(default)]
    pub accelerate: AccelerateInitOptions,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Program cache directory; the platform cache directory when unset
    pub dir: Option<PathBuf>,
    /// Directory holding `<program>.wgsl` sources read on a cache miss;
    /// the sources built into the binary when unset
    pub kernel_dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(ProgramCache::default_dir)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Harness run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Timed launches for gemm
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Seed for generated inputs
    pub seed: Option<u64>,
    #[serde(default)]
    pub verify: VerifyMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            seed: None,
            verify: VerifyMode::Auto,
        }
    }
}

impl RunConfig {
    pub fn to_run_options(&self) -> RunOptions {
        RunOptions {
            iterations: self.iterations,
            seed: self.seed,
            verify_policy: match self.verify {
                VerifyMode::Auto => VerifyPolicy::Auto,
                VerifyMode::EarlyExit => VerifyPolicy::EarlyExit,
                VerifyMode::Exhaustive => VerifyPolicy::Exhaustive,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    #[default]
    Auto,
    EarlyExit,
    Exhaustive,
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    const ALL: [ConfigFormat; 3] = [ConfigFormat::Toml, ConfigFormat::Yaml, ConfigFormat::Json];

    fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Some(ConfigFormat::Toml),
            Some("yaml" | "yml") => Some(ConfigFormat::Yaml),
            Some("json") => Some(ConfigFormat::Json),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Yaml => "YAML",
            ConfigFormat::Json => "JSON",
        }
    }

    fn parse(self, content: &str) -> Result<OffloadConfig> {
        Ok(match self {
            ConfigFormat::Toml => toml::from_str(content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Json => serde_json::from_str(content)?,
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the first file found, then apply environment overrides
    pub fn load() -> Result<OffloadConfig> {
        let mut config = Self::load_from_files()?;
        Self::apply_environment_variables(&mut config)?;
        Ok(config)
    }

    /// Load an explicit file, then apply environment overrides
    pub fn load_with_file(path: &Path) -> Result<OffloadConfig> {
        let mut config = Self::load_from_file(path)?;
        Self::apply_environment_variables(&mut config)?;
        Ok(config)
    }

    fn load_from_files() -> Result<OffloadConfig> {
        for path in Self::find_config_files() {
            if path.is_dir() {
                info!(
                    "Ignoring config directory path (expected file): {}",
                    path.display()
                );
                continue;
            }
            if path.exists() {
                info!("Loading configuration from: {}", path.display());
                return Self::load_from_file(&path);
            }
        }
        debug!("No configuration file found, using defaults");
        Ok(OffloadConfig::default())
    }

    fn find_config_files() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(config_path) = env::var("OFFLOAD_CONFIG") {
            if !config_path.is_empty() {
                paths.push(PathBuf::from(config_path));
            }
        }

        let names = [
            ".offload.toml",
            ".offload.yaml",
            ".offload.yml",
            ".offload.json",
        ];
        if let Ok(current_dir) = env::current_dir() {
            for name in &names {
                paths.push(current_dir.join(name));
            }
        }
        if let Some(home_dir) = dirs::home_dir() {
            for name in &names {
                paths.push(home_dir.join(name));
            }
            paths.push(home_dir.join(".config/offload/config.toml"));
        }

        paths
    }

    /// Parse one file. The extension picks the format; otherwise TOML, YAML
    /// and JSON are tried in turn.
    pub fn load_from_file(path: &Path) -> Result<OffloadConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        match ConfigFormat::from_path(path) {
            Some(format) => format.parse(&content).with_context(|| {
                format!("Failed to parse {} config: {}", format.name(), path.display())
            }),
            None => ConfigFormat::ALL
                .iter()
                .find_map(|format| format.parse(&content).ok())
                .ok_or_else(|| {
                    anyhow!(
                        "Could not parse config file {} (tried TOML, YAML, JSON)",
                        path.display()
                    )
                }),
        }
    }

    fn apply_environment_variables(config: &mut OffloadConfig) -> Result<()> {
        if let Ok(value) = env::var("OFFLOAD_PROVIDER") {
            if let Some(provider) = parse_provider_preference(&value) {
                config.accelerate.provider = provider;
            }
        }
        if let Ok(value) = env::var("OFFLOAD_POWER_PREFERENCE") {
            if let Some(power) = parse_power_preference(&value) {
                config.accelerate.wgpu_power_preference = power;
            }
        }
        if let Some(flag) = env::var("OFFLOAD_FALLBACK_ADAPTER")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            config.accelerate.wgpu_force_fallback_adapter = flag;
        }
        if let Ok(dir) = env::var("OFFLOAD_CACHE_DIR") {
            if !dir.is_empty() {
                config.cache.dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(dir) = env::var("OFFLOAD_KERNEL_DIR") {
            if !dir.is_empty() {
                config.cache.kernel_dir = Some(PathBuf::from(dir));
            }
        }
        let level = env::var("OFFLOAD_LOG_LEVEL").or_else(|_| env::var("OFFLOAD_LOG"));
        if let Some(level) = level.ok().and_then(|v| LogLevel::parse(&v)) {
            config.logging.level = level;
        }
        if let Some(flag) = env::var("OFFLOAD_DEBUG").ok().and_then(|v| parse_bool(&v)) {
            config.logging.debug = flag;
        }
        if let Ok(seed) = env::var("OFFLOAD_SEED") {
            let seed = seed
                .parse()
                .with_context(|| format!("OFFLOAD_SEED is not an integer: '{seed}'"))?;
            config.run.seed = Some(seed);
        }
        Ok(())
    }

    /// Sample configuration in TOML
    pub fn generate_sample_config() -> String {
        toml::to_string_pretty(&OffloadConfig::default())
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

pub fn parse_provider_preference(value: &str) -> Option<AccelerateProviderPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(AccelerateProviderPreference::Auto),
        "wgpu" | "gpu" => Some(AccelerateProviderPreference::Wgpu),
        "in-process" | "inprocess" | "cpu" | "host" => {
            Some(AccelerateProviderPreference::InProcess)
        }
        _ => None,
    }
}

fn parse_power_preference(value: &str) -> Option<AccelPowerPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(AccelPowerPreference::Auto),
        "high" | "high-performance" | "performance" => Some(AccelPowerPreference::HighPerformance),
        "low" | "low-power" | "battery" => Some(AccelPowerPreference::LowPower),
        _ => None,
    }
}
