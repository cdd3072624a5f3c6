//! End-to-end runs of the bundled programs: resolve, load, bind, dispatch,
//! time, read back and verify.

pub mod findmax;
pub mod gemm;
pub mod inversion;
pub mod matvec;

use log::info;
use offload_api::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::kernels::ProgramSpec;
use crate::profiler::ProfileSummary;
use crate::program_cache::{ProgramCache, ProgramOrigin};
use crate::session::{AcceleratorSession, Kernel, Program};
use crate::verifier::{VerificationResult, VerifyPolicy};
use offload_api::KernelSignature;

pub use findmax::{findmax_on_device, run_findmax, FindmaxOutcome};
pub use gemm::{gemm_on_device, run_gemm, GemmDims, GemmOutcome};
pub use inversion::{invert_on_device, run_inversion, InversionOutcome};
pub use matvec::{matvec_on_device, run_matvec, MatvecOutcome};

pub const DEFAULT_FINDMAX_LEN: u32 = 1024;
pub const DEFAULT_GEMM_SIZE: u32 = 1024;
pub const DEFAULT_INVERSION_SIZE: u32 = 5;
pub const DEFAULT_MATVEC_SIZE: u32 = 4;
pub const DEFAULT_ITERATIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Timed launches for the tiled protocol.
    pub iterations: u32,
    /// Fixed seed for generated inputs; entropy when absent.
    pub seed: Option<u64>,
    pub verify_policy: VerifyPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            seed: None,
            verify_policy: VerifyPolicy::Auto,
        }
    }
}

impl RunOptions {
    pub(crate) fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Outcome of one harness program.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub program: &'static str,
    pub device: String,
    pub origin: ProgramOrigin,
    /// Console output of the run, one entry per line.
    pub lines: Vec<String>,
    pub timings: ProfileSummary,
    pub verification: VerificationResult,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verification.passed
    }

    /// Verdict line printed after the run.
    pub fn verdict(&self) -> &'static str {
        if self.passed() {
            "Passed!"
        } else {
            "Failed!"
        }
    }

    fn new(
        spec: &ProgramSpec,
        session: &AcceleratorSession,
        origin: ProgramOrigin,
        lines: Vec<String>,
        timings: ProfileSummary,
        verification: VerificationResult,
    ) -> Self {
        info!(
            "{}: {} on '{}' ({})",
            spec.name,
            if verification.passed { "passed" } else { "failed" },
            session.device().name,
            verification.summary()
        );
        Self {
            program: spec.name,
            device: session.device().name.clone(),
            origin,
            lines,
            timings,
            verification,
        }
    }
}

/// A loaded program and one kernel created from it.
pub(crate) struct LoadedKernel {
    pub kernel: Kernel,
    pub origin: ProgramOrigin,
    // Declared after `kernel` so the kernel is released first.
    _program: Program,
}

pub(crate) fn load_kernel(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    spec: &ProgramSpec,
    signature: &KernelSignature,
) -> Result<LoadedKernel> {
    let compiled = cache.get_program(session, spec)?;
    let kernel = session.create_kernel(&compiled.program, signature)?;
    Ok(LoadedKernel {
        kernel,
        origin: compiled.origin,
        _program: compiled.program,
    })
}
