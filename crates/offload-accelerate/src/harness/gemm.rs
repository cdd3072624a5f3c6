use log::warn;
use offload_api::{AccessMode, OffloadError, Result, ScalarValue};
use rand::Rng;

use super::{load_kernel, RunOptions, RunReport, DEFAULT_GEMM_SIZE};
use crate::binder::KernelLaunch;
use crate::dispatch::common::pad_to;
use crate::dispatch::{run_tiled, KernelDispatcher, TilePlan, TiledOutcome};
use crate::kernels::{self, GEMM_TILE};
use crate::program_cache::{ProgramCache, ProgramOrigin};
use crate::reference;
use crate::session::AcceleratorSession;
use crate::verifier::{verify, Tolerance};

/// Seed used for generated inputs when none is configured.
pub const GEMM_DEFAULT_SEED: u64 = 123;

/// `C (m x n) = A (m x k) * B (k x n)`, every dimension a multiple of the tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub m: u32,
    pub k: u32,
    pub n: u32,
}

impl Default for GemmDims {
    fn default() -> Self {
        Self::padded(DEFAULT_GEMM_SIZE, DEFAULT_GEMM_SIZE, DEFAULT_GEMM_SIZE)
    }
}

impl GemmDims {
    pub fn padded(m: u32, k: u32, n: u32) -> Self {
        Self {
            m: pad_to(m, GEMM_TILE),
            k: pad_to(k, GEMM_TILE),
            n: pad_to(n, GEMM_TILE),
        }
    }

    /// Accepts `[]`, `[m, k, n]` or `[width_a, height_a, width_b, height_b]`.
    /// Returns the dimensions and a warning when `width_a != height_b`, in
    /// which case the width of `A` wins.
    pub fn from_args(args: &[u32]) -> Result<(Self, Option<String>)> {
        match *args {
            [] => Ok((Self::default(), None)),
            [m, k, n] => Ok((Self::padded(m, k, n), None)),
            [width_a, height_a, width_b, height_b] => {
                let warning = (width_a != height_b).then(|| {
                    "wrong input parameter(width of A should be equal with height of B), reset height of B"
                        .to_string()
                });
                Ok((Self::padded(height_a, width_a, width_b), warning))
            }
            _ => Err(OffloadError::InvalidState(format!(
                "gemm takes 0, 3 or 4 dimensions, got {}",
                args.len()
            ))),
        }
    }

    pub fn banner(&self) -> String {
        format!(
            "Run gemm with inputA(w:{}, h:{}) inputB(w:{}, h:{}) or M:{} K:{} N:{}.",
            self.k, self.m, self.n, self.k, self.m, self.k, self.n
        )
    }

    fn usize3(&self) -> (usize, usize, usize) {
        (self.m as usize, self.k as usize, self.n as usize)
    }
}

#[derive(Debug, Clone)]
pub struct GemmOutcome {
    pub c: Vec<f32>,
    pub tiled: TiledOutcome,
    pub origin: ProgramOrigin,
}

pub fn gemm_on_device(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    a: &[f32],
    b: &[f32],
    dims: GemmDims,
    iterations: u32,
) -> Result<GemmOutcome> {
    let (m, k, n) = dims.usize3();
    if dims.m == 0 || dims.k == 0 || dims.n == 0 {
        return Err(OffloadError::Dispatch(format!("empty gemm {m}x{k}x{n}")));
    }
    for (buf, expected) in [(a, m * k), (b, k * n)] {
        if buf.len() != expected {
            return Err(OffloadError::LengthMismatch {
                expected,
                found: buf.len(),
            });
        }
    }
    let loaded = load_kernel(session, cache, &kernels::GEMM, &kernels::GEMM_SIG)?;
    let mut dispatcher = KernelDispatcher::new(session);
    let a_buf = dispatcher.binder().upload(a, AccessMode::ReadOnly)?;
    let b_buf = dispatcher.binder().upload(b, AccessMode::ReadOnly)?;
    let mut c = vec![0.0f32; m * n];
    let mut c_buf = dispatcher.binder().bind_host(&mut c, AccessMode::WriteOnly)?;

    let plan = TilePlan::new(dims.n, dims.m);
    let launch = KernelLaunch::new(&loaded.kernel, plan.global())
        .buffer(&a_buf)
        .buffer(&b_buf)
        .buffer(&c_buf)
        .scalar(ScalarValue::I32(dims.m as i32))
        .scalar(ScalarValue::I32(dims.k as i32))
        .scalar(ScalarValue::I32(dims.n as i32))
        .local(plan.local());
    let tiled = run_tiled(&mut dispatcher, &launch, iterations)?;
    c_buf.read_back()?;
    drop(c_buf);
    Ok(GemmOutcome {
        c,
        tiled,
        origin: loaded.origin,
    })
}

/// Blocked multiply of random matrices with entries in `[0, 255)`.
pub fn run_gemm(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    dims: GemmDims,
    options: &RunOptions,
) -> Result<RunReport> {
    let mut rng = match options.seed {
        Some(_) => options.rng(),
        None => RunOptions {
            seed: Some(GEMM_DEFAULT_SEED),
            ..options.clone()
        }
        .rng(),
    };
    let (m, k, n) = dims.usize3();
    let a: Vec<f32> = (0..m * k).map(|_| rng.gen_range(0.0f32..255.0)).collect();
    let b: Vec<f32> = (0..k * n).map(|_| rng.gen_range(0.0f32..255.0)).collect();

    let mut lines = vec![
        dims.banner(),
        format!(
            "kernel calculates as block 4x4. input size:{} x {}.",
            dims.n, dims.m
        ),
    ];
    let device = gemm_on_device(session, cache, &a, &b, dims, options.iterations)?;
    lines.push(format!(
        "gemm kernel execution time:{:.6} ms.",
        device.tiled.mean_ms()
    ));

    let golden = reference::gemm(&a, &b, m, k, n)?;
    let verification = verify(
        &device.c,
        &golden,
        Tolerance::new(1.0, 1e-4),
        options.verify_policy,
    )?;
    if let Some(miss) = verification.first_mismatch {
        lines.push(format!(
            "failed=id:{}, gpu:{:.6}, cpu:{:.6}.",
            miss.index, miss.observed, miss.expected
        ));
        warn!("gemm: {}", verification.summary());
    }
    Ok(RunReport::new(
        &kernels::GEMM,
        session,
        device.origin,
        lines,
        device.tiled.summary,
        verification,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TilePlan;

    #[test]
    fn three_dimensions_pad_to_tiles() {
        let (dims, warning) = GemmDims::from_args(&[5, 6, 7]).unwrap();
        assert_eq!(dims, GemmDims { m: 8, k: 8, n: 8 });
        assert!(warning.is_none());
    }

    #[test]
    fn row_count_pads_so_blocks_stay_inside_c() {
        // Each work-item stores four full rows of C.
        let unpadded = TilePlan::new(8, 5);
        assert!(unpadded.blocks().any(|(row, _)| row + GEMM_TILE > 5));

        let (dims, _) = GemmDims::from_args(&[5, 8, 8]).unwrap();
        assert_eq!(dims.m, 8);
        let plan = TilePlan::new(dims.n, dims.m);
        assert!(plan
            .blocks()
            .all(|(row, col)| (row + GEMM_TILE) * dims.n <= dims.m * dims.n && col < dims.n));
    }

    #[test]
    fn default_is_a_square_1024() {
        let dims = GemmDims::default();
        assert_eq!((dims.m, dims.k, dims.n), (1024, 1024, 1024));
    }

    #[test]
    fn four_dimensions_use_width_of_a() {
        let (dims, warning) = GemmDims::from_args(&[16, 8, 4, 12]).unwrap();
        assert_eq!(dims, GemmDims { m: 8, k: 16, n: 4 });
        assert!(warning.unwrap().contains("reset height of B"));
        assert!(GemmDims::from_args(&[16, 8, 4, 16]).unwrap().1.is_none());
    }

    #[test]
    fn other_arities_are_rejected() {
        assert!(GemmDims::from_args(&[1, 2]).is_err());
        assert_eq!(GemmDims::from_args(&[]).unwrap().0, GemmDims::default());
    }
}
