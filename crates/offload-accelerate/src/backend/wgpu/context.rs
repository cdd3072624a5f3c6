use log::{debug, error};
use offload_api::{
    AccessMode, ArgValue, BufferId, ClockDomain, DeviceContext, DeviceDescriptor, EventId,
    EventTimestamps, KernelId, KernelParam, KernelSignature, OffloadError, ProgramId, Result,
    WorkExtent,
};
use pollster::block_on;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use wgpu::util::DeviceExt;

use super::bindings::{layout_entries, pack_uniform};
use super::readback::{map_readback_bytes_sync, staging_buffer};
use super::timestamps::{ticks_to_ns, TimestampQuery};
use crate::dispatch::common::{align_copy_size, dispatch_size};
use crate::shader::{self, ShaderProgram};

struct WgpuProgram {
    shader: ShaderProgram,
    module: wgpu::ShaderModule,
}

struct WgpuKernel {
    signature: KernelSignature,
    pipeline: Arc<wgpu::ComputePipeline>,
    layout: Arc<wgpu::BindGroupLayout>,
    workgroup_size: [u32; 3],
    args: Vec<Option<ArgValue>>,
}

struct BufferEntry {
    buffer: Arc<wgpu::Buffer>,
    size: u64,
    access: AccessMode,
}

enum EventTiming {
    Untimed,
    Device(TimestampQuery),
    Resolved(EventTimestamps),
}

pub struct WgpuContext {
    descriptor: DeviceDescriptor,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: wgpu::Limits,
    profiling: bool,
    timestamp_queries: bool,
    epoch: Instant,
    programs: Mutex<HashMap<u64, WgpuProgram>>,
    kernels: Mutex<HashMap<u64, WgpuKernel>>,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
    events: Mutex<HashMap<u64, EventTiming>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|error| {
        error!("wgpu uncaptured error: {:?}", error);
    }));
    device.set_device_lost_callback(|reason, message| {
        error!("wgpu device lost: reason={:?}, message={}", reason, message);
    });
}

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl WgpuContext {
    pub fn new(
        descriptor: DeviceDescriptor,
        device: wgpu::Device,
        queue: wgpu::Queue,
        limits: wgpu::Limits,
        profiling: bool,
        timestamp_queries: bool,
    ) -> Self {
        install_device_error_handlers(&device);
        Self {
            descriptor,
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
            profiling,
            timestamp_queries,
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

    /// Runs `f` inside an error scope and returns the captured error, if any.
    fn scoped<T>(&self, filter: wgpu::ErrorFilter, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = f();
        let err = block_on(self.device.pop_error_scope());
        (value, err)
    }

    fn register_program(
        &self,
        shader: ShaderProgram,
        on_error: impl FnOnce(String) -> OffloadError,
    ) -> Result<ProgramId> {
        let (module, err) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(shader.label.as_str()),
                    source: wgpu::ShaderSource::Naga(Cow::Owned(shader.module.clone())),
                })
        });
        if let Some(err) = err {
            return Err(on_error(err.to_string()));
        }
        let id = self.next();
        lock(&self.programs).insert(id, WgpuProgram { shader, module });
        Ok(ProgramId(id))
    }

    fn bind_group(&self, kernel: &WgpuKernel, args: &[ArgValue]) -> Result<wgpu::BindGroup> {
        let scalars: Vec<[u8; 4]> = args
            .iter()
            .filter_map(|a| match a {
                ArgValue::Scalar(v) => Some(v.to_le_bytes()),
                _ => None,
            })
            .collect();
        let uniform = if scalars.is_empty() {
            None
        } else {
            Some(
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("offload-scalars"),
                        contents: &pack_uniform(&scalars),
                        usage: wgpu::BufferUsages::UNIFORM,
                    }),
            )
        };
        let buffers = lock(&self.buffers);
        let mut entries = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            if let ArgValue::Buffer(id) = arg {
                let entry = buffers.get(&id.0).ok_or_else(|| OffloadError::ArgumentBind {
                    index: index as u32,
                    reason: format!("{id} was released"),
                })?;
                let slot = kernel.signature.slot_of(index as u32).unwrap_or(index);
                entries.push(wgpu::BindGroupEntry {
                    binding: slot as u32,
                    resource: entry.buffer.as_entire_binding(),
                });
            }
        }
        if let Some(uniform) = &uniform {
            entries.push(wgpu::BindGroupEntry {
                binding: kernel.signature.buffer_count() as u32,
                resource: uniform.as_entire_binding(),
            });
        }
        let (group, err) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.signature.entry),
                layout: &kernel.layout,
                entries: &entries,
            })
        });
        match err {
            Some(err) => Err(OffloadError::Dispatch(format!(
                "bind group for '{}': {err}",
                kernel.signature.entry
            ))),
            None => Ok(group),
        }
    }
}

impl DeviceContext for WgpuContext {
    fn device(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn profiling_enabled(&self) -> bool {
        self.profiling
    }

    fn compile(&self, label: &str, source: &str, entry_points: &[&str]) -> Result<ProgramId> {
        let shader = shader::compile_wgsl(label, source, entry_points)?;
        self.register_program(shader, |log| OffloadError::Compile {
            program: label.to_string(),
            log,
        })
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>> {
        lock(&self.programs)
            .get(&program.0)
            .map(|p| p.shader.image.clone())
            .ok_or_else(|| OffloadError::Backend(format!("unknown {program}")))
    }

    fn load_binary(&self, label: &str, image: &[u8], entry_points: &[&str]) -> Result<ProgramId> {
        let shader = shader::load_image(label, image, entry_points)?;
        self.register_program(shader, |reason| OffloadError::Link {
            program: label.to_string(),
            reason,
        })
    }

    fn release_program(&self, program: ProgramId) {
        lock(&self.programs).remove(&program.0);
    }

    fn create_kernel(&self, program: ProgramId, signature: &KernelSignature) -> Result<KernelId> {
        let programs = lock(&self.programs);
        let entry = programs
            .get(&program.0)
            .ok_or_else(|| OffloadError::Backend(format!("unknown {program}")))?;
        let workgroup_size = entry
            .shader
            .entry_point(signature.entry)
            .map(|ep| ep.workgroup_size)
            .ok_or_else(|| OffloadError::KernelUnavailable {
                program: entry.shader.label.clone(),
                entry: signature.entry.to_string(),
            })?;
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(signature.entry),
                entries: &layout_entries(signature),
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(signature.entry),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let (pipeline, err) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(signature.entry),
                    layout: Some(&pipeline_layout),
                    module: &entry.module,
                    entry_point: signature.entry,
                })
        });
        if let Some(err) = err {
            return Err(OffloadError::KernelUnavailable {
                program: entry.shader.label.clone(),
                entry: format!("{} ({err})", signature.entry),
            });
        }
        drop(programs);
        let id = self.next();
        debug!("wgpu: kernel '{}' ready as kernel#{id}", signature.entry);
        lock(&self.kernels).insert(
            id,
            WgpuKernel {
                signature: signature.clone(),
                pipeline: Arc::new(pipeline),
                layout: Arc::new(layout),
                workgroup_size,
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
        let padded = align_copy_size(size_bytes);
        let limit = (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size);
        if size_bytes == 0 || padded > limit {
            return Err(OffloadError::Allocation {
                size: size_bytes,
                reason: format!("size must be in 1..={limit} bytes"),
            });
        }
        if let Some(bytes) = init {
            if bytes.len() as u64 > size_bytes {
                return Err(OffloadError::Allocation {
                    size: size_bytes,
                    reason: format!("{} initial bytes exceed buffer", bytes.len()),
                });
            }
        }
        let (buffer, err) = self.scoped(wgpu::ErrorFilter::OutOfMemory, || match init {
            Some(bytes) => {
                let mut contents = bytes.to_vec();
                contents.resize(padded as usize, 0);
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("offload-buffer"),
                        contents: &contents,
                        usage: STORAGE_USAGE,
                    })
            }
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("offload-buffer"),
                size: padded,
                usage: STORAGE_USAGE,
                mapped_at_creation: false,
            }),
        });
        if let Some(err) = err {
            return Err(OffloadError::Allocation {
                size: size_bytes,
                reason: err.to_string(),
            });
        }
        let id = self.next();
        lock(&self.buffers).insert(
            id,
            BufferEntry {
                buffer: Arc::new(buffer),
                size: padded,
                access,
            },
        );
        Ok(BufferId(id))
    }

    fn write_buffer(&self, buffer: BufferId, bytes: &[u8]) -> Result<()> {
        let buffers = lock(&self.buffers);
        let entry = buffers
            .get(&buffer.0)
            .ok_or_else(|| OffloadError::Backend(format!("unknown {buffer}")))?;
        let mut padded = bytes.to_vec();
        padded.resize(align_copy_size(bytes.len() as u64) as usize, 0);
        if padded.len() as u64 > entry.size {
            return Err(OffloadError::Backend(format!(
                "write of {} bytes overflows {buffer}",
                bytes.len()
            )));
        }
        self.queue.write_buffer(&entry.buffer, 0, &padded);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let source = {
            let buffers = lock(&self.buffers);
            let entry = buffers
                .get(&buffer.0)
                .ok_or_else(|| OffloadError::Readback(format!("unknown {buffer}")))?;
            Arc::clone(&entry.buffer)
        };
        let copy_size = align_copy_size(out.len() as u64);
        if copy_size > source.size() {
            return Err(OffloadError::Readback(format!(
                "read of {} bytes exceeds {buffer}",
                out.len()
            )));
        }
        let staging = staging_buffer(&self.device, copy_size, "offload-readback");
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("offload-readback"),
            });
        encoder.copy_buffer_to_buffer(&source, 0, &staging, 0, copy_size);
        self.queue.submit(Some(encoder.finish()));
        let bytes = map_readback_bytes_sync(&self.device, &staging, copy_size, "read_buffer")?;
        out.copy_from_slice(&bytes[..out.len()]);
        Ok(())
    }

    fn buffer_access(&self, buffer: BufferId) -> Option<AccessMode> {
        lock(&self.buffers).get(&buffer.0).map(|b| b.access)
    }

    fn release_buffer(&self, buffer: BufferId) {
        if let Some(entry) = lock(&self.buffers).remove(&buffer.0) {
            entry.buffer.destroy();
        }
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
        if let (KernelParam::Local, ArgValue::Local(bytes)) = (entry.signature.check(index, arg, access)?, arg) {
            let limit = self.limits.max_compute_workgroup_storage_size as u64;
            if *bytes > limit {
                return Err(OffloadError::ArgumentBind {
                    index,
                    reason: format!("{bytes} bytes of local scratch exceeds device limit {limit}"),
                });
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
        let kernels = lock(&self.kernels);
        let entry = kernels
            .get(&kernel.0)
            .ok_or_else(|| OffloadError::Dispatch(format!("unknown {kernel}")))?;
        let mut args = Vec::with_capacity(entry.args.len());
        for (index, slot) in entry.args.iter().enumerate() {
            args.push(slot.ok_or_else(|| OffloadError::ArgumentBind {
                index: index as u32,
                reason: format!("argument of '{}' not set", entry.signature.entry),
            })?);
        }
        if let Some(local) = local {
            if local.dims() != entry.workgroup_size {
                return Err(OffloadError::Dispatch(format!(
                    "local extent {:?} does not match kernel work-group {:?}",
                    local.dims(),
                    entry.workgroup_size
                )));
            }
        }
        let global_dims = global.dims();
        let mut groups = [0u32; 3];
        for axis in 0..3 {
            groups[axis] = dispatch_size(global_dims[axis], entry.workgroup_size[axis]);
            if groups[axis] > self.limits.max_compute_workgroups_per_dimension {
                return Err(OffloadError::Dispatch(format!(
                    "{} work-groups on axis {axis} exceeds device limit",
                    groups[axis]
                )));
            }
        }
        if groups.contains(&0) {
            return Err(OffloadError::Dispatch("empty global extent".to_string()));
        }
        let bind_group = self.bind_group(entry, &args)?;
        let query = (self.profiling && self.timestamp_queries).then(|| TimestampQuery::new(&self.device));
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("offload-dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry.signature.entry),
                timestamp_writes: query.as_ref().map(|q| q.pass_writes()),
            });
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        if let Some(query) = &query {
            query.resolve(&mut encoder);
        }
        drop(kernels);

        let start_ns = self.now_ns();
        self.queue.submit(Some(encoder.finish()));
        let timing = match query {
            Some(query) => EventTiming::Device(query),
            None if self.profiling => {
                self.device.poll(wgpu::Maintain::Wait);
                EventTiming::Resolved(EventTimestamps {
                    start_ns,
                    end_ns: self.now_ns().max(start_ns + 1),
                    clock: ClockDomain::Host,
                })
            }
            None => EventTiming::Untimed,
        };
        let id = self.next();
        lock(&self.events).insert(id, timing);
        Ok(EventId(id))
    }

    fn wait(&self, event: EventId) -> Result<()> {
        if !lock(&self.events).contains_key(&event.0) {
            return Err(OffloadError::Dispatch(format!("unknown {event}")));
        }
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn event_timestamps(&self, event: EventId) -> Result<EventTimestamps> {
        if !self.profiling {
            return Err(OffloadError::ProfilingUnavailable(
                "queue was created without profiling".to_string(),
            ));
        }
        let mut events = lock(&self.events);
        let timing = events
            .get_mut(&event.0)
            .ok_or_else(|| OffloadError::ProfilingUnavailable(format!("unknown {event}")))?;
        let resolved = match timing {
            EventTiming::Resolved(ts) => return Ok(*ts),
            EventTiming::Untimed => {
                return Err(OffloadError::ProfilingUnavailable(format!(
                    "{event} was not recorded with timestamps"
                )))
            }
            EventTiming::Device(query) => {
                let (start, end) = query.read_ticks(&self.device)?;
                let period = self.queue.get_timestamp_period();
                let start_ns = ticks_to_ns(start, period);
                EventTimestamps {
                    start_ns,
                    end_ns: ticks_to_ns(end, period).max(start_ns),
                    clock: ClockDomain::Device,
                }
            }
        };
        *timing = EventTiming::Resolved(resolved);
        Ok(resolved)
    }

    fn release_event(&self, event: EventId) {
        lock(&self.events).remove(&event.0);
    }
}
