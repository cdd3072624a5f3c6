use log::{debug, warn};
use offload_api::{ClockDomain, DeviceContext, OffloadError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::session::Completion;

/// Start and end of one launch, in nanoseconds of the reported clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingSample {
    pub start_ns: u64,
    pub end_ns: u64,
    pub clock: ClockDomain,
}

impl ProfilingSample {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ns() as f64 / 1_000_000.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileSummary {
    pub count: u32,
    pub total_ns: u64,
}

impl ProfileSummary {
    pub fn add(&mut self, sample: &ProfilingSample) {
        self.count += 1;
        self.total_ns += sample.duration_ns();
    }

    pub fn total_ms(&self) -> f64 {
        self.total_ns as f64 / 1_000_000.0
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms() / self.count as f64
        }
    }
}

impl<'a> FromIterator<&'a ProfilingSample> for ProfileSummary {
    fn from_iter<I: IntoIterator<Item = &'a ProfilingSample>>(iter: I) -> Self {
        let mut summary = ProfileSummary::default();
        for sample in iter {
            summary.add(sample);
        }
        summary
    }
}

pub struct Profiler<'c> {
    ctx: &'c dyn DeviceContext,
    host_clock_noted: AtomicBool,
}

impl<'c> Profiler<'c> {
    pub fn new(ctx: &'c dyn DeviceContext) -> Self {
        Self {
            ctx,
            host_clock_noted: AtomicBool::new(false),
        }
    }

    pub fn available(&self) -> bool {
        self.ctx.profiling_enabled()
    }

    /// Waits for the launch and reads its start and end timestamps.
    pub fn time(&self, completion: &Completion) -> Result<ProfilingSample> {
        if !self.available() {
            return Err(OffloadError::ProfilingUnavailable(
                "queue was created without profiling".to_string(),
            ));
        }
        completion.wait()?;
        let ts = self.ctx.event_timestamps(completion.id())?;
        if ts.clock == ClockDomain::Host && !self.host_clock_noted.swap(true, Ordering::Relaxed) {
            warn!("profiler: device timestamps unavailable, samples use the host clock");
        }
        let sample = ProfilingSample {
            start_ns: ts.start_ns,
            end_ns: ts.end_ns,
            clock: ts.clock,
        };
        debug!("profiler: {} took {:.4} ms", completion.id(), sample.duration_ms());
        Ok(sample)
    }
}
