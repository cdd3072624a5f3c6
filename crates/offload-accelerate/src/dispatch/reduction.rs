//! Single-pass work-group reduction with a host-side second pass.

use log::debug;
use offload_api::{AccessMode, OffloadError, Result, ScalarValue, WorkExtent};

use super::common::dispatch_size;
use super::KernelDispatcher;
use crate::binder::{ComputeBuffer, KernelLaunch};
use crate::profiler::ProfilingSample;
use crate::session::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionPlan {
    pub len: u32,
    pub local_size: u32,
}

impl ReductionPlan {
    pub fn new(len: u32, local_size: u32) -> Result<Self> {
        if len == 0 {
            return Err(OffloadError::Dispatch("cannot reduce an empty array".to_string()));
        }
        if local_size == 0 {
            return Err(OffloadError::Dispatch("work-group size must be non-zero".to_string()));
        }
        Ok(Self { len, local_size })
    }

    /// Number of partial results, one per work-group.
    pub fn groups(&self) -> u32 {
        dispatch_size(self.len, self.local_size)
    }

    pub fn global(&self) -> WorkExtent {
        WorkExtent::D1(self.groups() * self.local_size)
    }

    pub fn local(&self) -> WorkExtent {
        WorkExtent::D1(self.local_size)
    }

    pub fn scratch_bytes(&self) -> u64 {
        self.local_size as u64 * std::mem::size_of::<f32>() as u64
    }

    /// Sequential second pass over the group partials.
    pub fn finish(&self, partials: &[f32]) -> Result<f32> {
        let groups = self.groups() as usize;
        if partials.len() < groups {
            return Err(OffloadError::LengthMismatch {
                expected: groups,
                found: partials.len(),
            });
        }
        Ok(partials[..groups]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReductionOutcome {
    pub value: f32,
    pub partials: Vec<f32>,
    pub sample: Option<ProfilingSample>,
}

/// Launches `findmax`-shaped kernels: `(input, scratch, partials, len)`.
pub fn run_reduction(
    dispatcher: &mut KernelDispatcher<'_>,
    kernel: &Kernel,
    input: &ComputeBuffer<'_>,
    plan: ReductionPlan,
) -> Result<ReductionOutcome> {
    if input.len() < plan.len as usize {
        return Err(OffloadError::LengthMismatch {
            expected: plan.len as usize,
            found: input.len(),
        });
    }
    let partials = dispatcher
        .binder()
        .create_scratch(plan.groups() as usize, AccessMode::ReadWrite)?;
    let launch = KernelLaunch::new(kernel, plan.global())
        .buffer(input)
        .scratch(plan.scratch_bytes())
        .buffer(&partials)
        .scalar(ScalarValue::U32(plan.len))
        .local(plan.local());
    let completion = dispatcher.launch(&launch, None)?;
    let sample = dispatcher.complete(&completion)?;
    dispatcher.drain()?;
    let partials = partials.read_to_vec()?;
    let value = plan.finish(&partials)?;
    debug!(
        "reduction: {} elements in {} groups -> {value}",
        plan.len,
        plan.groups()
    );
    Ok(ReductionOutcome {
        value,
        partials,
        sample,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_round_up() {
        let plan = ReductionPlan::new(129, 128).unwrap();
        assert_eq!(plan.groups(), 2);
        assert_eq!(plan.global(), WorkExtent::D1(256));
        assert_eq!(plan.scratch_bytes(), 512);
    }

    #[test]
    fn finish_ignores_trailing_partials() {
        let plan = ReductionPlan::new(10, 4).unwrap();
        assert_eq!(plan.finish(&[1.0, 5.0, 2.0, 99.0]).unwrap(), 5.0);
        assert!(plan.finish(&[1.0]).is_err());
    }

    #[test]
    fn empty_plans_are_rejected() {
        assert!(ReductionPlan::new(0, 128).is_err());
        assert!(ReductionPlan::new(4, 0).is_err());
    }
}
