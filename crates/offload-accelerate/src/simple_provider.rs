//! In-process provider: a single general-purpose "device" backed by host
//! memory. Programs go through the same compile and binary-image path as the
//! GPU backend; kernels execute synchronously through native bodies.

use log::debug;
use offload_api::{
    AccessMode, ArgValue, BufferId, ClockDomain, ComputePlatform, DeviceClass, DeviceContext,
    DeviceDescriptor, EventId, EventTimestamps, KernelId, KernelParam, KernelSignature,
    OffloadError, PlatformId, PlatformInfo, ProgramId, QueueProperties, Result, ScalarValue,
    WorkExtent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::native_kernels::{self, NativeArgs, NativeKernelFn};
use crate::shader::{self, ShaderProgram};

pub const INPROCESS_PLATFORM_NAME: &str = "offload in-process";
pub const INPROCESS_VENDOR: &str = "offload";
const MAX_WORK_GROUP_SIZE: u32 = 1024;
const LOCAL_MEMORY_BYTES: u64 = 32 * 1024;

pub struct InProcessPlatform {
    device: DeviceDescriptor,
}

impl InProcessPlatform {
    pub fn new() -> Self {
        Self {
            device: DeviceDescriptor {
                platform: PlatformId(0),
                index: 0,
                class: DeviceClass::GeneralPurpose,
                name: "host".to_string(),
                vendor: INPROCESS_VENDOR.to_string(),
                driver: format!("offload-host {}", env!("CARGO_PKG_VERSION")),
                max_work_group_size: MAX_WORK_GROUP_SIZE,
                backend: "in-process".to_string(),
            },
        }
    }
}

impl Default for InProcessPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputePlatform for InProcessPlatform {
    fn backend_name(&self) -> &str {
        "in-process"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(vec![PlatformInfo {
            id: PlatformId(0),
            name: INPROCESS_PLATFORM_NAME.to_string(),
            vendor: INPROCESS_VENDOR.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }])
    }

    fn devices(&self, platform: PlatformId, class: DeviceClass) -> Result<Vec<DeviceDescriptor>> {
        if platform == self.device.platform && class == self.device.class {
            Ok(vec![self.device.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    /// Accepts any descriptor so callers can open the host device under an
    /// arbitrary identity.
    fn open(
        &self,
        device: &DeviceDescriptor,
        queue: QueueProperties,
    ) -> Result<Arc<dyn DeviceContext>> {
        Ok(Arc::new(InProcessContext::new(device.clone(), queue)))
    }
}

struct HostKernel {
    signature: KernelSignature,
    workgroup_size: [u32; 3],
    native: NativeKernelFn,
    args: Vec<Option<ArgValue>>,
}

struct HostBuffer {
    data: Vec<f32>,
    access: AccessMode,
}

pub struct InProcessContext {
    device: DeviceDescriptor,
    profiling: bool,
    epoch: Instant,
    programs: Mutex<HashMap<u64, ShaderProgram>>,
    kernels: Mutex<HashMap<u64, HostKernel>>,
    buffers: Mutex<HashMap<u64, HostBuffer>>,
    events: Mutex<HashMap<u64, EventTimestamps>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn words_for(size_bytes: u64) -> usize {
    ((size_bytes + 3) / 4) as usize
}

impl InProcessContext {
    pub fn new(device: DeviceDescriptor, queue: QueueProperties) -> Self {
        Self {
            device,
            profiling: queue.profiling,
            epoch: Instant::now(),
            programs: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn register_program(&self, program: ShaderProgram) -> ProgramId {
        let id = self.next();
        lock(&self.programs).insert(id, program);
        ProgramId(id)
    }

    fn execute(
        &self,
        native: NativeKernelFn,
        buffer_ids: &[BufferId],
        scalars: Vec<ScalarValue>,
        global: [u32; 3],
        local: [u32; 3],
    ) -> Result<()> {
        let mut store = lock(&self.buffers);
        let mut taken: Vec<(u64, HostBuffer)> = Vec::with_capacity(buffer_ids.len());
        for id in buffer_ids {
            match store.remove(&id.0) {
                Some(buf) => taken.push((id.0, buf)),
                None => {
                    for (key, buf) in taken {
                        store.insert(key, buf);
                    }
                    return Err(OffloadError::Dispatch(format!(
                        "{id} is released or bound twice"
                    )));
                }
            }
        }
        let result = {
            let mut args = NativeArgs {
                buffers: taken.iter_mut().map(|(_, b)| b.data.as_mut_slice()).collect(),
                scalars,
                global,
                local,
            };
            native(&mut args)
        };
        for (key, buf) in taken {
            store.insert(key, buf);
        }
        result
    }
}

impl DeviceContext for InProcessContext {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn profiling_enabled(&self) -> bool {
        self.profiling
    }

    fn compile(&self, label: &str, source: &str, entry_points: &[&str]) -> Result<ProgramId> {
        let program = shader::compile_wgsl(label, source, entry_points)?;
        debug!(
            "in-process: compiled '{}' ({} byte image)",
            label,
            program.image.len()
        );
        Ok(self.register_program(program))
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>> {
        lock(&self.programs)
            .get(&program.0)
            .map(|p| p.image.clone())
            .ok_or_else(|| OffloadError::Backend(format!("unknown {program}")))
    }

    fn load_binary(&self, label: &str, image: &[u8], entry_points: &[&str]) -> Result<ProgramId> {
        let program = shader::load_image(label, image, entry_points)?;
        Ok(self.register_program(program))
    }

    fn release_program(&self, program: ProgramId) {
        lock(&self.programs).remove(&program.0);
    }

    fn create_kernel(&self, program: ProgramId, signature: &KernelSignature) -> Result<KernelId> {
        let (label, workgroup_size) = {
            let programs = lock(&self.programs);
            let shader = programs
                .get(&program.0)
                .ok_or_else(|| OffloadError::Backend(format!("unknown {program}")))?;
            let entry = shader.entry_point(signature.entry).ok_or_else(|| {
                OffloadError::KernelUnavailable {
                    program: shader.label.clone(),
                    entry: signature.entry.to_string(),
                }
            })?;
            (shader.label.clone(), entry.workgroup_size)
        };
        let native =
            native_kernels::lookup(signature.entry).ok_or_else(|| OffloadError::KernelUnavailable {
                program: label,
                entry: signature.entry.to_string(),
            })?;
        let id = self.next();
        lock(&self.kernels).insert(
            id,
            HostKernel {
                signature: signature.clone(),
                workgroup_size,
                native,
                args: vec![None; signature.params.len()],
            },
        );
        Ok(KernelId(id))
    }

    fn release_kernel(&self, kernel: KernelId) {
        lock(&self.kernels).remove(&kernel.0);
    }

    fn create_buffer(
        &self,
        size_bytes: u64,
        access: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<BufferId> {
        if size_bytes == 0 {
            return Err(OffloadError::Allocation {
                size: 0,
                reason: "zero-sized buffer".to_string(),
            });
        }
        let mut data = vec![0.0f32; words_for(size_bytes)];
        if let Some(bytes) = init {
            let dst: &mut [u8] = bytemuck::cast_slice_mut(data.as_mut_slice());
            if bytes.len() > dst.len() {
                return Err(OffloadError::Allocation {
                    size: size_bytes,
                    reason: format!("{} initial bytes exceed buffer", bytes.len()),
                });
            }
            dst[..bytes.len()].copy_from_slice(bytes);
        }
        let id = self.next();
        lock(&self.buffers).insert(id, HostBuffer { data, access });
        Ok(BufferId(id))
    }

    fn write_buffer(&self, buffer: BufferId, bytes: &[u8]) -> Result<()> {
        let mut store = lock(&self.buffers);
        let entry = store
            .get_mut(&buffer.0)
            .ok_or_else(|| OffloadError::Backend(format!("unknown {buffer}")))?;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(entry.data.as_mut_slice());
        if bytes.len() > dst.len() {
            return Err(OffloadError::Backend(format!(
                "write of {} bytes overflows {buffer}",
                bytes.len()
            )));
        }
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let store = lock(&self.buffers);
        let entry = store
            .get(&buffer.0)
            .ok_or_else(|| OffloadError::Readback(format!("unknown {buffer}")))?;
        let src: &[u8] = bytemuck::cast_slice(entry.data.as_slice());
        if out.len() > src.len() {
            return Err(OffloadError::Readback(format!(
                "read of {} bytes exceeds {buffer}",
                out.len()
            )));
        }
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn buffer_access(&self, buffer: BufferId) -> Option<AccessMode> {
        lock(&self.buffers).get(&buffer.0).map(|b| b.access)
    }

    fn release_buffer(&self, buffer: BufferId) {
        lock(&self.buffers).remove(&buffer.0);
    }

    fn set_arg(&self, kernel: KernelId, index: u32, arg: &ArgValue) -> Result<()> {
        let access = match arg {
            ArgValue::Buffer(id) => self.buffer_access(*id),
            _ => None,
        };
        let mut kernels = lock(&self.kernels);
        let entry = kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| OffloadError::ArgumentBind {
                index,
                reason: format!("unknown {kernel}"),
            })?;
        if let KernelParam::Local = entry.signature.check(index, arg, access)? {
            if let ArgValue::Local(bytes) = arg {
                if *bytes > LOCAL_MEMORY_BYTES {
                    return Err(OffloadError::ArgumentBind {
                        index,
                        reason: format!("{bytes} bytes of local scratch exceeds {LOCAL_MEMORY_BYTES}"),
                    });
                }
            }
        }
        entry.args[index as usize] = Some(*arg);
        Ok(())
    }

    fn enqueue(
        &self,
        kernel: KernelId,
        global: WorkExtent,
        local: Option<WorkExtent>,
    ) -> Result<EventId> {
        let (native, workgroup_size, args) = {
            let kernels = lock(&self.kernels);
            let entry = kernels
                .get(&kernel.0)
                .ok_or_else(|| OffloadError::Dispatch(format!("unknown {kernel}")))?;
            let mut args = Vec::with_capacity(entry.args.len());
            for (index, slot) in entry.args.iter().enumerate() {
                let arg = slot.ok_or_else(|| OffloadError::ArgumentBind {
                    index: index as u32,
                    reason: format!("argument of '{}' not set", entry.signature.entry),
                })?;
                args.push(arg);
            }
            (entry.native, entry.workgroup_size, args)
        };
        if let Some(local) = local {
            if local.dims() != workgroup_size {
                return Err(OffloadError::Dispatch(format!(
                    "local extent {:?} does not match kernel work-group {:?}",
                    local.dims(),
                    workgroup_size
                )));
            }
        }
        if global.total() == 0 {
            return Err(OffloadError::Dispatch("empty global extent".to_string()));
        }
        let mut buffer_ids = Vec::new();
        let mut scalars = Vec::new();
        for arg in &args {
            match arg {
                ArgValue::Buffer(id) => buffer_ids.push(*id),
                ArgValue::Scalar(value) => scalars.push(*value),
                ArgValue::Local(_) => {}
            }
        }
        let start_ns = self.now_ns();
        self.execute(native, &buffer_ids, scalars, global.dims(), workgroup_size)?;
        let end_ns = self.now_ns().max(start_ns + 1);
        let id = self.next();
        lock(&self.events).insert(
            id,
            EventTimestamps {
                start_ns,
                end_ns,
                clock: ClockDomain::Device,
            },
        );
        Ok(EventId(id))
    }

    fn wait(&self, event: EventId) -> Result<()> {
        if lock(&self.events).contains_key(&event.0) {
            Ok(())
        } else {
            Err(OffloadError::Dispatch(format!("unknown {event}")))
        }
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn event_timestamps(&self, event: EventId) -> Result<EventTimestamps> {
        if !self.profiling {
            return Err(OffloadError::ProfilingUnavailable(
                "queue was created without profiling".to_string(),
            ));
        }
        lock(&self.events)
            .get(&event.0)
            .copied()
            .ok_or_else(|| OffloadError::ProfilingUnavailable(format!("unknown {event}")))
    }

    fn release_event(&self, event: EventId) {
        lock(&self.events).remove(&event.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    fn context(profiling: bool) -> InProcessContext {
        let platform = InProcessPlatform::new();
        InProcessContext::new(platform.device.clone(), QueueProperties { profiling })
    }

    #[test]
    fn single_general_purpose_device() {
        let platform = InProcessPlatform::new();
        let pid = platform.platforms().unwrap()[0].id;
        assert!(platform
            .devices(pid, DeviceClass::Accelerator)
            .unwrap()
            .is_empty());
        let devices = platform.devices(pid, DeviceClass::GeneralPurpose).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor, INPROCESS_VENDOR);
    }

    #[test]
    fn matvec_runs_end_to_end() {
        let ctx = context(true);
        let program = ctx
            .compile("matvec", kernels::MATVEC.embedded_source, &["matvec_mult"])
            .unwrap();
        let kernel = ctx.create_kernel(program, &kernels::MATVEC_SIG).unwrap();
        let mat: Vec<f32> = (0..4).map(|i| i as f32).collect();
        let vec2 = [1.0f32, 2.0];
        let m = ctx
            .create_buffer(16, AccessMode::ReadOnly, Some(bytemuck::cast_slice(&mat)))
            .unwrap();
        let v = ctx
            .create_buffer(8, AccessMode::ReadOnly, Some(bytemuck::cast_slice(&vec2)))
            .unwrap();
        let r = ctx.create_buffer(8, AccessMode::WriteOnly, None).unwrap();
        for (i, arg) in [
            ArgValue::Buffer(m),
            ArgValue::Buffer(v),
            ArgValue::Buffer(r),
            ArgValue::Scalar(ScalarValue::U32(2)),
            ArgValue::Scalar(ScalarValue::U32(2)),
        ]
        .iter()
        .enumerate()
        {
            ctx.set_arg(kernel, i as u32, arg).unwrap();
        }
        let event = ctx.enqueue(kernel, WorkExtent::D1(2), None).unwrap();
        ctx.wait(event).unwrap();
        let ts = ctx.event_timestamps(event).unwrap();
        assert!(ts.end_ns > ts.start_ns);
        let mut out = [0.0f32; 2];
        ctx.read_buffer(r, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [2.0, 8.0]);
    }

    #[test]
    fn unset_arguments_block_enqueue() {
        let ctx = context(false);
        let program = ctx
            .compile("matvec", kernels::MATVEC.embedded_source, &["matvec_mult"])
            .unwrap();
        let kernel = ctx.create_kernel(program, &kernels::MATVEC_SIG).unwrap();
        let err = ctx.enqueue(kernel, WorkExtent::D1(4), None).unwrap_err();
        assert!(matches!(err, OffloadError::ArgumentBind { index: 0, .. }));
    }

    #[test]
    fn timestamps_require_profiling_queue() {
        let ctx = context(false);
        let err = ctx.event_timestamps(EventId(1)).unwrap_err();
        assert!(matches!(err, OffloadError::ProfilingUnavailable(_)));
    }

    #[test]
    fn mismatched_local_extent_is_rejected() {
        let ctx = context(false);
        let program = ctx
            .compile("findmax", kernels::FINDMAX.embedded_source, &["findmax"])
            .unwrap();
        let kernel = ctx.create_kernel(program, &kernels::FINDMAX_SIG).unwrap();
        let data = ctx.create_buffer(512, AccessMode::ReadOnly, None).unwrap();
        let part = ctx.create_buffer(4, AccessMode::ReadWrite, None).unwrap();
        ctx.set_arg(kernel, 0, &ArgValue::Buffer(data)).unwrap();
        ctx.set_arg(kernel, 1, &ArgValue::Local(512)).unwrap();
        ctx.set_arg(kernel, 2, &ArgValue::Buffer(part)).unwrap();
        ctx.set_arg(kernel, 3, &ArgValue::Scalar(ScalarValue::U32(128)))
            .unwrap();
        let err = ctx
            .enqueue(kernel, WorkExtent::D1(128), Some(WorkExtent::D1(64)))
            .unwrap_err();
        assert!(matches!(err, OffloadError::Dispatch(_)));
    }
}
