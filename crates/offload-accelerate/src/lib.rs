//! Offload accelerate: runs numeric kernels on one compute device.
//!
//! A run resolves a device ([`resolver`]), opens an [`AcceleratorSession`],
//! obtains the program binary from the [`ProgramCache`], binds buffers
//! ([`binder`]), dispatches with one of the [`dispatch`] protocols, times the
//! launches ([`profiler`]) and checks the results ([`verifier`]).

pub mod backend;
pub mod binder;
pub mod dispatch;
pub mod harness;
pub mod kernels;
mod native_kernels;
pub mod profiler;
pub mod program_cache;
pub mod reference;
pub mod resolver;
pub mod session;
pub mod shader;
pub mod simple_provider;
pub mod verifier;

use offload_api::{ComputePlatform, OffloadError, Result};
use serde::{Deserialize, Serialize};

pub use binder::{BufferBinder, ComputeBuffer, KernelLaunch, RowOverride};
pub use dispatch::{DispatchState, DispatchTrace, KernelDispatcher};
pub use profiler::{ProfileSummary, Profiler, ProfilingSample};
pub use program_cache::{CacheMiss, CompiledProgram, ProgramCache, ProgramOrigin};
pub use session::{AcceleratorSession, Completion, Kernel, Program};
pub use simple_provider::InProcessPlatform;
pub use verifier::{verify, Tolerance, VerificationResult, VerifyPolicy};

/// Preferred backend to use for acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccelerateProviderPreference {
    #[default]
    Auto,
    Wgpu,
    InProcess,
}

/// Power preference used when initializing a WGPU backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccelPowerPreference {
    #[default]
    Auto,
    HighPerformance,
    LowPower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerateInitOptions {
    pub provider: AccelerateProviderPreference,
    pub allow_inprocess_fallback: bool,
    pub wgpu_power_preference: AccelPowerPreference,
    pub wgpu_force_fallback_adapter: bool,
}

impl Default for AccelerateInitOptions {
    fn default() -> Self {
        Self {
            provider: AccelerateProviderPreference::Auto,
            allow_inprocess_fallback: true,
            wgpu_power_preference: AccelPowerPreference::Auto,
            wgpu_force_fallback_adapter: false,
        }
    }
}

/// Opens the compute platform selected by `options`.
///
/// `Auto` and `Wgpu` probe the wgpu backends first. When no adapter is found
/// the in-process platform is used if fallback is allowed (always for
/// `Auto`), otherwise `NoPlatformFound` is returned.
pub fn open_platform(options: &AccelerateInitOptions) -> Result<Box<dyn ComputePlatform>> {
    if options.provider == AccelerateProviderPreference::InProcess {
        log::info!("Offload Accelerate: using in-process provider");
        return Ok(Box::new(InProcessPlatform::new()));
    }

    #[cfg(feature = "wgpu")]
    {
        let wgpu_options = backend::wgpu::WgpuProviderOptions {
            power_preference: match options.wgpu_power_preference {
                AccelPowerPreference::Auto => ::wgpu::PowerPreference::HighPerformance,
                AccelPowerPreference::HighPerformance => ::wgpu::PowerPreference::HighPerformance,
                AccelPowerPreference::LowPower => ::wgpu::PowerPreference::LowPower,
            },
            force_fallback_adapter: options.wgpu_force_fallback_adapter,
        };
        let platform = backend::wgpu::WgpuPlatform::new(&wgpu_options);
        if !platform.is_empty() {
            log::info!("Offload Accelerate: using WGPU provider");
            return Ok(Box::new(platform));
        }
        log::warn!("Offload Accelerate: no WGPU adapters found");
    }
    #[cfg(not(feature = "wgpu"))]
    if options.provider == AccelerateProviderPreference::Wgpu {
        log::warn!("Offload Accelerate: WGPU provider requested but crate built without 'wgpu' feature");
    }

    if options.allow_inprocess_fallback || options.provider == AccelerateProviderPreference::Auto {
        log::info!("Offload Accelerate: falling back to in-process provider");
        Ok(Box::new(InProcessPlatform::new()))
    } else {
        Err(OffloadError::NoPlatformFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_preference_skips_probing() {
        let options = AccelerateInitOptions {
            provider: AccelerateProviderPreference::InProcess,
            allow_inprocess_fallback: false,
            ..Default::default()
        };
        let platform = open_platform(&options).unwrap();
        assert_eq!(platform.backend_name(), "in-process");
    }

    #[test]
    fn preferences_use_kebab_case() {
        let json = serde_json::to_string(&AccelerateProviderPreference::InProcess).unwrap();
        assert_eq!(json, "\"in-process\"");
        let parsed: AccelerateInitOptions =
            serde_json::from_str(r#"{"provider":"wgpu","wgpu_power_preference":"low-power"}"#)
                .unwrap();
        assert_eq!(parsed.provider, AccelerateProviderPreference::Wgpu);
        assert_eq!(parsed.wgpu_power_preference, AccelPowerPreference::LowPower);
        assert!(parsed.allow_inprocess_fallback);
    }
}
