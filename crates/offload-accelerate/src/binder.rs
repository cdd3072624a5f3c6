//! Device buffers mirroring host arrays, and positional argument binding.

use log::trace;
use offload_api::{
    AccessMode, ArgValue, BufferId, DeviceContext, OffloadError, Result, ScalarValue, WorkExtent,
};
use std::sync::Arc;

use crate::session::{AcceleratorSession, Kernel};

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// A device buffer, optionally paired with the host array it mirrors.
///
/// The host array is borrowed, not owned. Device contents reach it only
/// through [`ComputeBuffer::read_back`].
pub struct ComputeBuffer<'h> {
    ctx: Arc<dyn DeviceContext>,
    id: BufferId,
    size_bytes: u64,
    access: AccessMode,
    host: Option<&'h mut [f32]>,
}

impl<'h> ComputeBuffer<'h> {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        (self.size_bytes / F32_BYTES) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn host(&self) -> Option<&[f32]> {
        self.host.as_deref()
    }

    /// Blocking copy of the device contents into the paired host array.
    pub fn read_back(&mut self) -> Result<&[f32]> {
        let id = self.id;
        let host = self.host.as_deref_mut().ok_or_else(|| {
            OffloadError::Readback(format!("{id} has no host array to read into"))
        })?;
        self.ctx.read_buffer(id, bytemuck::cast_slice_mut(host))?;
        Ok(host)
    }

    /// Blocking copy of the whole device buffer into a fresh vector.
    pub fn read_to_vec(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.len()];
        self.ctx
            .read_buffer(self.id, bytemuck::cast_slice_mut(out.as_mut_slice()))?;
        Ok(out)
    }

    pub fn write(&self, data: &[f32]) -> Result<()> {
        let bytes = data.len() as u64 * F32_BYTES;
        if bytes > self.size_bytes {
            return Err(OffloadError::LengthMismatch {
                expected: self.len(),
                found: data.len(),
            });
        }
        self.ctx.write_buffer(self.id, bytemuck::cast_slice(data))
    }
}

impl Drop for ComputeBuffer<'_> {
    fn drop(&mut self) {
        self.ctx.release_buffer(self.id);
    }
}

/// Replaces the scalar at `arg_index` with the row number on each launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowOverride {
    pub arg_index: u32,
}

/// Everything needed to enqueue one kernel: its ordered arguments and extents.
pub struct KernelLaunch<'k> {
    kernel: &'k Kernel,
    args: Vec<ArgValue>,
    global: WorkExtent,
    local: Option<WorkExtent>,
    row_override: Option<RowOverride>,
}

impl<'k> KernelLaunch<'k> {
    pub fn new(kernel: &'k Kernel, global: WorkExtent) -> Self {
        Self {
            kernel,
            args: Vec::with_capacity(kernel.signature().params.len()),
            global,
            local: None,
            row_override: None,
        }
    }

    pub fn buffer(mut self, buffer: &ComputeBuffer<'_>) -> Self {
        self.args.push(ArgValue::Buffer(buffer.id()));
        self
    }

    /// Work-group scratch of `bytes`.
    pub fn scratch(mut self, bytes: u64) -> Self {
        self.args.push(ArgValue::Local(bytes));
        self
    }

    pub fn scalar(mut self, value: ScalarValue) -> Self {
        self.args.push(ArgValue::Scalar(value));
        self
    }

    pub fn local(mut self, extent: WorkExtent) -> Self {
        self.local = Some(extent);
        self
    }

    pub fn row_override(mut self, arg_index: u32) -> Self {
        self.row_override = Some(RowOverride { arg_index });
        self
    }

    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    pub fn global(&self) -> WorkExtent {
        self.global
    }

    pub fn local_extent(&self) -> Option<WorkExtent> {
        self.local
    }

    pub fn row_override_slot(&self) -> Option<RowOverride> {
        self.row_override
    }

    /// Arguments for one launch, with `row` substituted at the override slot.
    pub fn args_for(&self, row: Option<u32>) -> Result<Vec<ArgValue>> {
        let mut args = self.args.clone();
        match (row, self.row_override) {
            (None, _) => {}
            (Some(row), Some(RowOverride { arg_index })) => {
                let slot = args.get_mut(arg_index as usize).ok_or_else(|| {
                    OffloadError::ArgumentBind {
                        index: arg_index,
                        reason: format!("row override slot beyond {} arguments", self.args.len()),
                    }
                })?;
                *slot = ArgValue::Scalar(ScalarValue::U32(row));
            }
            (Some(_), None) => {
                return Err(OffloadError::InvalidState(format!(
                    "launch of '{}' has no row override",
                    self.kernel.entry()
                )))
            }
        }
        Ok(args)
    }
}

pub struct BufferBinder {
    ctx: Arc<dyn DeviceContext>,
}

impl BufferBinder {
    pub fn new(session: &AcceleratorSession) -> Self {
        Self {
            ctx: Arc::clone(session.context()),
        }
    }

    /// Creates a device buffer of `size_bytes`. A readable buffer starts with
    /// the contents of `host`; a write-only one is left uninitialised.
    pub fn create_buffer<'h>(
        &self,
        host: Option<&'h mut [f32]>,
        size_bytes: u64,
        access: AccessMode,
    ) -> Result<ComputeBuffer<'h>> {
        let init: Option<&[u8]> = match &host {
            Some(data) if access.readable() => Some(bytemuck::cast_slice(&**data)),
            _ => None,
        };
        if let Some(bytes) = init {
            if bytes.len() as u64 > size_bytes {
                return Err(OffloadError::Allocation {
                    size: size_bytes,
                    reason: format!("host array of {} bytes does not fit", bytes.len()),
                });
            }
        }
        let id = self.ctx.create_buffer(size_bytes, access, init)?;
        trace!("binder: {id} {size_bytes} bytes {access:?}");
        Ok(ComputeBuffer {
            ctx: Arc::clone(&self.ctx),
            id,
            size_bytes,
            access,
            host,
        })
    }

    /// Buffer sized to and mirroring `host`.
    pub fn bind_host<'h>(&self, host: &'h mut [f32], access: AccessMode) -> Result<ComputeBuffer<'h>> {
        let size = host.len() as u64 * F32_BYTES;
        self.create_buffer(Some(host), size, access)
    }

    /// Buffer initialised from `data` with no host array attached.
    pub fn upload(&self, data: &[f32], access: AccessMode) -> Result<ComputeBuffer<'static>> {
        let size_bytes = data.len() as u64 * F32_BYTES;
        let id = self
            .ctx
            .create_buffer(size_bytes, access, Some(bytemuck::cast_slice(data)))?;
        Ok(ComputeBuffer {
            ctx: Arc::clone(&self.ctx),
            id,
            size_bytes,
            access,
            host: None,
        })
    }

    pub fn create_scratch(&self, len: usize, access: AccessMode) -> Result<ComputeBuffer<'static>> {
        self.create_buffer(None, len as u64 * F32_BYTES, access)
    }

    /// Sets every argument of `launch` in order.
    pub fn bind_args(&self, launch: &KernelLaunch<'_>, row: Option<u32>) -> Result<()> {
        let kernel = launch.kernel();
        let expected = kernel.signature().params.len();
        let args = launch.args_for(row)?;
        if args.len() != expected {
            return Err(OffloadError::ArgumentBind {
                index: args.len().min(expected) as u32,
                reason: format!(
                    "'{}' takes {expected} arguments, launch supplies {}",
                    kernel.entry(),
                    args.len()
                ),
            });
        }
        for (index, arg) in args.iter().enumerate() {
            let index = index as u32;
            self.ctx
                .set_arg(kernel.id(), index, arg)
                .map_err(|err| match err {
                    OffloadError::ArgumentBind { .. } => err,
                    other => OffloadError::ArgumentBind {
                        index,
                        reason: other.to_string(),
                    },
                })?;
        }
        Ok(())
    }
}
