use offload_api::{AccessMode, OffloadError, Result};
use rand::Rng;
use std::time::Instant;

use super::{load_kernel, RunOptions, RunReport};
use crate::dispatch::{run_reduction, KernelDispatcher, ReductionPlan};
use crate::kernels::{self, FINDMAX_LOCAL_SIZE};
use crate::profiler::{ProfileSummary, ProfilingSample};
use crate::program_cache::{ProgramCache, ProgramOrigin};
use crate::reference;
use crate::session::AcceleratorSession;
use crate::verifier::{verify, Tolerance};

#[derive(Debug, Clone)]
pub struct FindmaxOutcome {
    pub value: f32,
    pub partials: Vec<f32>,
    pub sample: Option<ProfilingSample>,
    pub origin: ProgramOrigin,
}

pub fn findmax_on_device(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    data: &[f32],
) -> Result<FindmaxOutcome> {
    let len = u32::try_from(data.len())
        .map_err(|_| OffloadError::Dispatch(format!("{} elements exceed u32", data.len())))?;
    let plan = ReductionPlan::new(len, FINDMAX_LOCAL_SIZE)?;
    let loaded = load_kernel(session, cache, &kernels::FINDMAX, &kernels::FINDMAX_SIG)?;
    let mut dispatcher = KernelDispatcher::new(session);
    let input = dispatcher.binder().upload(data, AccessMode::ReadOnly)?;
    let outcome = run_reduction(&mut dispatcher, &loaded.kernel, &input, plan)?;
    Ok(FindmaxOutcome {
        value: outcome.value,
        partials: outcome.partials,
        sample: outcome.sample,
        origin: loaded.origin,
    })
}

/// Maximum of `len` random integers in `[0, len)`, on the device and on the host.
pub fn run_findmax(
    session: &AcceleratorSession,
    cache: &ProgramCache,
    len: u32,
    options: &RunOptions,
) -> Result<RunReport> {
    let mut rng = options.rng();
    let bound = len.max(1);
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(0..bound) as f32).collect();

    let device = findmax_on_device(session, cache, &data)?;
    let timings: ProfileSummary = device.sample.iter().collect();
    let mut lines = vec![
        format!("gpu result : {:.6} ", device.value),
        format!("gpu: {:.6} ms", timings.total_ms()),
    ];

    let started = Instant::now();
    let host = reference::max(&data).unwrap_or(f32::NEG_INFINITY);
    let host_ms = started.elapsed().as_secs_f64() * 1000.0;
    lines.push(format!("cpu result : {host:.6} "));
    lines.push(format!("cpu: {host_ms:.6} ms"));

    let verification = verify(&[device.value], &[host], Tolerance::EXACT, options.verify_policy)?;
    Ok(RunReport::new(
        &kernels::FINDMAX,
        session,
        device.origin,
        lines,
        timings,
        verification,
    ))
}
