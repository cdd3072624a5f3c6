use offload_api::{AccessMode, OffloadError, Result, ScalarValue, WorkExtent};

use super::{load_kernel, RunOptions, RunReport};
use crate::binder::KernelLaunch;
use crate::dispatch::KernelDispatcher;
use crate::kernels::{self, ROW_WORKGROUP};
use crate::profiler::{ProfileSummary, ProfilingSample};
use crate::program_cache::{ProgramCache, ProgramOrigin};
use crate::reference;
use crate::session::AcceleratorSession;
use crate::verifier::{verify, Tolerance};

#[derive(Debug, Clone)]
pub struct MatvecOutcome {
    pub result: Vec<f32>,
    pub sample: Option<ProfilingSample>,
    pub origin: ProgramOrigin,
}

/// One work-item per row of the row-major `rows x cols` matrix.
pub fn matvec_on_device(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    matrix: &[f32],
    vector: &[f32],
    rows: u32,
    cols: u32,
) -> Result<MatvecOutcome> {
    let (r, c) = (rows as usize, cols as usize);
    if r == 0 || c == 0 {
        return Err(OffloadError::Dispatch(format!("empty {r}x{c} matrix")));
    }
    for (buf, expected) in [(matrix, r * c), (vector, c)] {
        if buf.len() != expected {
            return Err(OffloadError::LengthMismatch {
                expected,
                found: buf.len(),
            });
        }
    }
    let loaded = load_kernel(session, cache, &kernels::MATVEC, &kernels::MATVEC_SIG)?;
    let mut dispatcher = KernelDispatcher::new(session);
    let mat_buf = dispatcher.binder().upload(matrix, AccessMode::ReadOnly)?;
    let vec_buf = dispatcher.binder().upload(vector, AccessMode::ReadOnly)?;
    let mut result = vec![0.0f32; r];
    let mut res_buf = dispatcher.binder().bind_host(&mut result, AccessMode::WriteOnly)?;

    let launch = KernelLaunch::new(&loaded.kernel, WorkExtent::D1(rows))
        .buffer(&mat_buf)
        .buffer(&vec_buf)
        .buffer(&res_buf)
        .scalar(ScalarValue::U32(rows))
        .scalar(ScalarValue::U32(cols))
        .local(WorkExtent::D1(ROW_WORKGROUP));
    let completion = dispatcher.launch(&launch, None)?;
    let sample = dispatcher.complete(&completion)?;
    dispatcher.drain()?;
    res_buf.read_back()?;
    drop(res_buf);
    Ok(MatvecOutcome {
        result,
        sample,
        origin: loaded.origin,
    })
}

/// `mat[i] = 2i`, `vec[j] = 3j`.
pub fn sample_inputs(rows: usize, cols: usize) -> (Vec<f32>, Vec<f32>) {
    let matrix = (0..rows * cols).map(|i| i as f32 * 2.0).collect();
    let vector = (0..cols).map(|j| j as f32 * 3.0).collect();
    (matrix, vector)
}

pub fn run_matvec(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    rows: u32,
    cols: u32,
    options: &RunOptions,
) -> Result<RunReport> {
    let (matrix, vector) = sample_inputs(rows as usize, cols as usize);
    let correct = reference::matvec(&matrix, &vector, rows as usize, cols as usize)?;
    let device = matvec_on_device(session, cache, &matrix, &vector, rows, cols)?;
    let timings: ProfileSummary = device.sample.iter().collect();
    let mut lines = vec![
        format!("correct:{}", join_values(&correct)),
        format!("matvec kernel execution time:{:.6} ms.", timings.total_ms()),
    ];
    // Exact for small inputs; larger rows accumulate in a different order on the device.
    let verification = verify(
        &device.result,
        &correct,
        Tolerance::new(0.0, 1e-4),
        options.verify_policy,
    )?;
    lines.push(if verification.passed {
        "Matrix-vector multiplication successful.".to_string()
    } else {
        "Matrix-vector multiplication unsuccessful.".to_string()
    });
    Ok(RunReport::new(
        &kernels::MATVEC,
        session,
        device.origin,
        lines,
        timings,
        verification,
    ))
}

fn join_values(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| format!("{v:.6}"))
        .collect::<Vec<_>>()
        .join(" ")
}
