//! Dependency-ordered dispatch: one launch per row, fully drained before the next.

use log::debug;
use offload_api::{OffloadError, Result};

use super::KernelDispatcher;
use crate::binder::KernelLaunch;
use crate::profiler::{ProfileSummary, ProfilingSample};

#[derive(Debug, Clone, PartialEq)]
pub struct SequentialOutcome {
    pub samples: Vec<ProfilingSample>,
    pub summary: ProfileSummary,
}

/// Launches `rows` times with rows `0..rows` written to the launch's row
/// override. Row `i + 1` observes every buffer write made by row `i`.
pub fn run_sequential(
    dispatcher: &mut KernelDispatcher<'_>,
    launch: &KernelLaunch<'_>,
    rows: u32,
) -> Result<SequentialOutcome> {
    if launch.row_override_slot().is_none() {
        return Err(OffloadError::InvalidState(format!(
            "sequential dispatch of '{}' needs a row override",
            launch.kernel().entry()
        )));
    }
    let mut samples = Vec::with_capacity(rows as usize);
    for row in 0..rows {
        let completion = dispatcher.launch(launch, Some(row))?;
        if let Some(sample) = dispatcher.complete(&completion)? {
            samples.push(sample);
        }
        dispatcher.drain()?;
    }
    let summary: ProfileSummary = samples.iter().collect();
    debug!(
        "sequential: {} rows of {}, {:.4} ms total",
        rows,
        launch.kernel().entry(),
        summary.total_ms()
    );
    Ok(SequentialOutcome { samples, summary })
}
