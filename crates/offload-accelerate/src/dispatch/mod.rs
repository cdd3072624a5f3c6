//! Kernel dispatch: the launch state machine plus the three launch protocols.

pub mod common;
pub mod reduction;
pub mod sequential;
pub mod tiled;

use log::debug;
use offload_api::{DeviceContext, OffloadError, Result};
use std::sync::Arc;

use crate::binder::{BufferBinder, KernelLaunch};
use crate::profiler::{Profiler, ProfilingSample};
use crate::session::{AcceleratorSession, Completion};

pub use reduction::{run_reduction, ReductionOutcome, ReductionPlan};
pub use sequential::{run_sequential, SequentialOutcome};
pub use tiled::{run_tiled, TilePlan, TiledOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
    Draining,
}

/// One enqueued launch as observed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub seq: u64,
    pub entry: &'static str,
    pub row: Option<u32>,
    pub warmup: bool,
    /// A full drain completed before the next launch.
    pub drained: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchTrace {
    records: Vec<DispatchRecord>,
}

impl DispatchTrace {
    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    /// Row overrides of every launch, in enqueue order.
    pub fn rows(&self) -> Vec<u32> {
        self.records.iter().filter_map(|r| r.row).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct KernelDispatcher<'s> {
    ctx: Arc<dyn DeviceContext>,
    binder: BufferBinder,
    profiler: Profiler<'s>,
    state: DispatchState,
    trace: DispatchTrace,
}

impl<'s> KernelDispatcher<'s> {
    pub fn new(session: &'s AcceleratorSession) -> Self {
        Self {
            ctx: Arc::clone(session.context()),
            binder: BufferBinder::new(session),
            profiler: Profiler::new(session.context().as_ref()),
            state: DispatchState::Idle,
            trace: DispatchTrace::default(),
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn trace(&self) -> &DispatchTrace {
        &self.trace
    }

    pub fn binder(&self) -> &BufferBinder {
        &self.binder
    }

    pub fn profiler(&self) -> &Profiler<'s> {
        &self.profiler
    }

    /// Binds the launch arguments (with `row` at the override slot) and enqueues it.
    pub fn launch(&mut self, launch: &KernelLaunch<'_>, row: Option<u32>) -> Result<Completion> {
        self.enqueue(launch, row, false)
    }

    /// Enqueues an untimed launch, recorded as warm-up in the trace.
    pub fn warm_up(&mut self, launch: &KernelLaunch<'_>) -> Result<Completion> {
        self.enqueue(launch, None, true)
    }

    fn enqueue(
        &mut self,
        launch: &KernelLaunch<'_>,
        row: Option<u32>,
        warmup: bool,
    ) -> Result<Completion> {
        if self.state == DispatchState::Draining {
            return Err(OffloadError::InvalidState(
                "cannot launch while the queue is draining".to_string(),
            ));
        }
        self.binder.bind_args(launch, row)?;
        let kernel = launch.kernel();
        let event = self
            .ctx
            .enqueue(kernel.id(), launch.global(), launch.local_extent())?;
        self.state = DispatchState::Dispatching;
        let seq = self.trace.records.len() as u64;
        debug!(
            "dispatch: #{seq} {} global={:?} row={row:?}{}",
            kernel.entry(),
            launch.global(),
            if warmup { " (warm-up)" } else { "" }
        );
        self.trace.records.push(DispatchRecord {
            seq,
            entry: kernel.entry(),
            row,
            warmup,
            drained: false,
        });
        Ok(Completion::new(Arc::clone(&self.ctx), event))
    }

    /// Waits for a launch and, when the queue is profiled, returns its timing.
    pub fn complete(&self, completion: &Completion) -> Result<Option<ProfilingSample>> {
        if self.profiler.available() {
            self.profiler.time(completion).map(Some)
        } else {
            completion.wait().map(|_| None)
        }
    }

    /// Blocks until everything enqueued has completed.
    pub fn drain(&mut self) -> Result<()> {
        if self.state != DispatchState::Dispatching {
            return Err(OffloadError::InvalidState(format!(
                "drain requested while {:?}",
                self.state
            )));
        }
        self.state = DispatchState::Draining;
        self.ctx.finish()?;
        if let Some(last) = self.trace.records.last_mut() {
            last.drained = true;
        }
        self.state = DispatchState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;
    use crate::program_cache::ProgramCache;
    use crate::simple_provider::InProcessPlatform;
    use offload_api::{AccessMode, QueueProperties, ScalarValue, WorkExtent};

    #[test]
    fn state_machine_cycles_through_drain() {
        let dir = tempfile::tempdir().unwrap();
        let session =
            AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties { profiling: true })
                .unwrap();
        let program = ProgramCache::new(dir.path())
            .get_program(&session, &kernels::MATVEC)
            .unwrap()
            .program;
        let kernel = session.create_kernel(&program, &kernels::MATVEC_SIG).unwrap();
        let mut dispatcher = KernelDispatcher::new(&session);
        assert!(matches!(
            dispatcher.drain(),
            Err(OffloadError::InvalidState(_))
        ));

        let m = dispatcher.binder().upload(&[1.0; 4], AccessMode::ReadOnly).unwrap();
        let v = dispatcher.binder().upload(&[1.0; 2], AccessMode::ReadOnly).unwrap();
        let r = dispatcher.binder().create_scratch(2, AccessMode::WriteOnly).unwrap();
        let launch = KernelLaunch::new(&kernel, WorkExtent::D1(2))
            .buffer(&m)
            .buffer(&v)
            .buffer(&r)
            .scalar(ScalarValue::U32(2))
            .scalar(ScalarValue::U32(2));
        let done = dispatcher.launch(&launch, None).unwrap();
        assert_eq!(dispatcher.state(), DispatchState::Dispatching);
        assert!(dispatcher.complete(&done).unwrap().is_some());
        dispatcher.drain().unwrap();
        assert_eq!(dispatcher.state(), DispatchState::Idle);
        assert!(dispatcher.trace().records()[0].drained);
        assert_eq!(r.read_to_vec().unwrap(), vec![2.0, 2.0]);
    }
}
