//! Scoped ownership of the device context and the handles created on it.
//!
//! Every handle is wrapped in a guard that releases it on drop, so each exit
//! path of a run, including early returns through `?`, tears down what it
//! acquired. The session itself drains the queue when dropped.

use log::{debug, info, warn};
use offload_api::{
    ComputePlatform, DeviceContext, DeviceDescriptor, EventId, KernelId, KernelSignature,
    ProgramId, QueueProperties, Result,
};
use std::sync::Arc;

use crate::resolver;

pub struct AcceleratorSession {
    device: DeviceDescriptor,
    ctx: Arc<dyn DeviceContext>,
}

impl AcceleratorSession {
    /// Resolves a device on `platform` and opens its context and queue.
    pub fn open(platform: &dyn ComputePlatform, queue: QueueProperties) -> Result<Self> {
        let device = resolver::resolve(platform)?;
        Self::with_device(platform, device, queue)
    }

    pub fn with_device(
        platform: &dyn ComputePlatform,
        device: DeviceDescriptor,
        queue: QueueProperties,
    ) -> Result<Self> {
        let ctx = platform.open(&device, queue)?;
        info!(
            "session: {} device '{}' ({}) via {}, profiling={}",
            device.class, device.name, device.vendor, device.backend, queue.profiling
        );
        Ok(Self { device, ctx })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn context(&self) -> &Arc<dyn DeviceContext> {
        &self.ctx
    }

    pub fn create_kernel(&self, program: &Program, signature: &KernelSignature) -> Result<Kernel> {
        let id = self.ctx.create_kernel(program.id(), signature)?;
        Ok(Kernel {
            ctx: Arc::clone(&self.ctx),
            id,
            signature: signature.clone(),
        })
    }
}

impl Drop for AcceleratorSession {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.finish() {
            warn!("session: final drain failed: {err}");
        }
        debug!("session: released '{}'", self.device.name);
    }
}

pub struct Program {
    ctx: Arc<dyn DeviceContext>,
    id: ProgramId,
    label: String,
}

impl Program {
    pub(crate) fn new(ctx: Arc<dyn DeviceContext>, id: ProgramId, label: &str) -> Self {
        Self {
            ctx,
            id,
            label: label.to_string(),
        }
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current binary image of the program.
    pub fn binary(&self) -> Result<Vec<u8>> {
        self.ctx.program_binary(self.id)
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        self.ctx.release_program(self.id);
    }
}

pub struct Kernel {
    ctx: Arc<dyn DeviceContext>,
    id: KernelId,
    signature: KernelSignature,
}

impl Kernel {
    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    pub fn entry(&self) -> &'static str {
        self.signature.entry
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.ctx.release_kernel(self.id);
    }
}

/// Completion handle for one enqueued launch.
pub struct Completion {
    ctx: Arc<dyn DeviceContext>,
    id: EventId,
}

impl Completion {
    pub(crate) fn new(ctx: Arc<dyn DeviceContext>, id: EventId) -> Self {
        Self { ctx, id }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn wait(&self) -> Result<()> {
        self.ctx.wait(self.id)
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.ctx.release_event(self.id);
    }
}
