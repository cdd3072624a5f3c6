use offload_api::{AccessMode, OffloadError, Result, ScalarValue, WorkExtent};
use rand::Rng;

use super::{load_kernel, RunOptions, RunReport};
use crate::binder::KernelLaunch;
use crate::dispatch::{run_sequential, DispatchTrace, KernelDispatcher};
use crate::kernels::{self, INVERSION_ROW_ARG, ROW_WORKGROUP};
use crate::profiler::{ProfileSummary, ProfilingSample};
use crate::program_cache::{ProgramCache, ProgramOrigin};
use crate::reference;
use crate::session::AcceleratorSession;
use crate::verifier::{verify, Tolerance};

#[derive(Debug, Clone)]
pub struct InversionOutcome {
    /// The input matrix after elimination; the identity on success.
    pub matrix: Vec<f32>,
    pub inverse: Vec<f32>,
    pub samples: Vec<ProfilingSample>,
    pub summary: ProfileSummary,
    pub trace: DispatchTrace,
    pub origin: ProgramOrigin,
}

/// Gauss-Jordan elimination on the device, one launch per pivot row.
/// `matrix` is row-major `n x n`.
pub fn invert_on_device(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    matrix: &[f32],
    n: u32,
) -> Result<InversionOutcome> {
    let size = n as usize;
    if size == 0 {
        return Err(OffloadError::Dispatch("cannot invert an empty matrix".to_string()));
    }
    if matrix.len() != size * size {
        return Err(OffloadError::LengthMismatch {
            expected: size * size,
            found: matrix.len(),
        });
    }
    let loaded = load_kernel(session, cache, &kernels::INVERSION, &kernels::INVERSION_SIG)?;
    let mut dispatcher = KernelDispatcher::new(session);
    let mut mat = matrix.to_vec();
    let mut inv = reference::identity(size);
    let mut mat_buf = dispatcher.binder().bind_host(&mut mat, AccessMode::ReadWrite)?;
    let mut inv_buf = dispatcher.binder().bind_host(&mut inv, AccessMode::ReadWrite)?;

    let launch = KernelLaunch::new(&loaded.kernel, WorkExtent::D1(n))
        .buffer(&mat_buf)
        .buffer(&inv_buf)
        .scalar(ScalarValue::U32(n))
        .scalar(ScalarValue::U32(0))
        .row_override(INVERSION_ROW_ARG)
        .local(WorkExtent::D1(ROW_WORKGROUP));
    let outcome = run_sequential(&mut dispatcher, &launch, n)?;
    mat_buf.read_back()?;
    inv_buf.read_back()?;
    drop(mat_buf);
    drop(inv_buf);
    Ok(InversionOutcome {
        matrix: mat,
        inverse: inv,
        samples: outcome.samples,
        summary: outcome.summary,
        trace: dispatcher.trace().clone(),
        origin: loaded.origin,
    })
}

/// Random diagonally dominant `n x n` matrix: entries in `[0, 1)` plus `n`
/// on the diagonal, so elimination never meets a zero pivot.
pub fn random_matrix(n: usize, options: &RunOptions) -> Vec<f32> {
    let mut rng = options.rng();
    let mut m: Vec<f32> = (0..n * n).map(|_| rng.gen::<f32>()).collect();
    for i in 0..n {
        m[i * n + i] += n as f32;
    }
    m
}

pub fn run_inversion(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    n: u32,
    options: &RunOptions,
) -> Result<RunReport> {
    let size = n as usize;
    let input = random_matrix(size, options);
    let device = invert_on_device(session, cache, &input, n)?;
    let mut lines = vec![
        format!("Matrix dimension : {n} "),
        format!("Total execution time : {:.6} ms", device.summary.total_ms()),
    ];

    // Matrix buffer against the identity, companion buffer against the LU inverse.
    let mut observed = device.matrix.clone();
    observed.extend_from_slice(&device.inverse);
    let mut expected = reference::identity(size);
    expected.extend(reference::invert(&input, size)?);
    let verification = verify(
        &observed,
        &expected,
        Tolerance::new(1e-3, 1e-3),
        options.verify_policy,
    )?;
    if let Some(miss) = verification.first_mismatch {
        let (which, index) = if miss.index < size * size {
            ("matrix", miss.index)
        } else {
            ("inverse", miss.index - size * size)
        };
        lines.push(format!(
            "{which} mismatch at ({}, {}): {:.6} vs {:.6}",
            index / size,
            index % size,
            miss.observed,
            miss.expected
        ));
    }
    Ok(RunReport::new(
        &kernels::INVERSION,
        session,
        device.origin,
        lines,
        device.summary,
        verification,
    ))
}
