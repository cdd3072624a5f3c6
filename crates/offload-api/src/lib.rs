//! Offload API: backend-facing types for the accelerator execution harness.
//!
//! A backend exposes a [`ComputePlatform`] (discovery) and opens a
//! [`DeviceContext`] (programs, kernels, buffers, queue) for one device.
//! Resources are addressed by opaque numeric handles owned by the context;
//! higher layers wrap them in scoped guards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OffloadError>;

/// Failures surfaced by the harness and its backends.
///
/// Only [`OffloadError::Link`] is recoverable: a stale or foreign cached
/// binary falls back to a fresh compile.
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("no compute platform found")]
    NoPlatformFound,
    #[error("no compute device found on platform '{platform}'")]
    NoDeviceFound { platform: String },
    #[error("device allocation of {size} bytes failed: {reason}")]
    Allocation { size: u64, reason: String },
    #[error("failed to compile program '{program}':\n{log}")]
    Compile { program: String, log: String },
    #[error("failed to link program '{program}': {reason}")]
    Link { program: String, reason: String },
    #[error("failed to bind kernel argument {index}: {reason}")]
    ArgumentBind { index: u32, reason: String },
    #[error("kernel '{entry}' is not available in program '{program}'")]
    KernelUnavailable { program: String, entry: String },
    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),
    #[error("buffer read-back failed: {0}")]
    Readback(String),
    #[error("profiling unavailable: {0}")]
    ProfilingUnavailable(String),
    #[error("failed to read kernel source {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid dispatcher state: {0}")]
    InvalidState(String),
    #[error("length mismatch: expected {expected} elements, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("backend error: {0}")]
    Backend(String),
}

impl OffloadError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OffloadError::Link { .. })
    }

    /// Process exit status for a run that failed with this error.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

macro_rules! handle_id {
    ($name:ident, $tag:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "#{}"), self.0)
            }
        }
    };
}

handle_id!(ProgramId, "program");
handle_id!(KernelId, "kernel");
handle_id!(BufferId, "buffer");
handle_id!(EventId, "event");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformId(pub u32);

/// Device classes queried by the resolver, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    Accelerator,
    GeneralPurpose,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Accelerator => f.write_str("accelerator"),
            DeviceClass::GeneralPurpose => f.write_str("general-purpose"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// Identity triple used to decide whether a cached binary belongs to a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub name: String,
    pub vendor: String,
    pub driver: String,
}

impl Fingerprint {
    /// Builds a fingerprint, escaping line breaks so every field fits on one
    /// header line. Other bytes, surrounding whitespace included, are kept.
    pub fn new(name: &str, vendor: &str, driver: &str) -> Self {
        Self {
            name: single_line(name),
            vendor: single_line(vendor),
            driver: single_line(driver),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.name, self.vendor, self.driver)
    }
}

fn single_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub platform: PlatformId,
    pub index: u32,
    pub class: DeviceClass,
    pub name: String,
    pub vendor: String,
    pub driver: String,
    pub max_work_group_size: u32,
    pub backend: String,
}

impl DeviceDescriptor {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.name, &self.vendor, &self.driver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }

    /// True when a buffer created with `self` may back a parameter declared `param`.
    pub fn satisfies(self, param: AccessMode) -> bool {
        (!param.readable() || self.readable()) && (!param.writable() || self.writable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    U32,
    I32,
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    U32(u32),
    I32(i32),
    F32(f32),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::U32(_) => ScalarKind::U32,
            ScalarValue::I32(_) => ScalarKind::I32,
            ScalarValue::F32(_) => ScalarKind::F32,
        }
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        match self {
            ScalarValue::U32(v) => v.to_le_bytes(),
            ScalarValue::I32(v) => v.to_le_bytes(),
            ScalarValue::F32(v) => v.to_le_bytes(),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            ScalarValue::U32(v) => Some(v),
            ScalarValue::I32(v) => u32::try_from(v).ok(),
            ScalarValue::F32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            ScalarValue::I32(v) => Some(v),
            ScalarValue::U32(v) => i32::try_from(v).ok(),
            ScalarValue::F32(_) => None,
        }
    }
}

/// Declared shape of one positional kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelParam {
    Buffer(AccessMode),
    /// Work-group scratch; the bound value is a size hint in bytes.
    Local,
    Scalar(ScalarKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub entry: &'static str,
    pub params: &'static [KernelParam],
}

impl KernelSignature {
    pub fn buffer_count(&self) -> usize {
        self.params
            .iter()
            .filter(|p| matches!(p, KernelParam::Buffer(_)))
            .count()
    }

    pub fn scalar_count(&self) -> usize {
        self.params
            .iter()
            .filter(|p| matches!(p, KernelParam::Scalar(_)))
            .count()
    }

    /// Binding slot of the parameter at `index` among parameters of the same kind.
    pub fn slot_of(&self, index: u32) -> Option<usize> {
        let index = index as usize;
        let param = self.params.get(index)?;
        Some(
            self.params[..index]
                .iter()
                .filter(|p| std::mem::discriminant(*p) == std::mem::discriminant(param))
                .count(),
        )
    }

    /// Checks an argument against the declared parameter.
    ///
    /// `buffer_access` is the access mode the bound buffer was created with,
    /// when the argument is a buffer.
    pub fn check(
        &self,
        index: u32,
        arg: &ArgValue,
        buffer_access: Option<AccessMode>,
    ) -> Result<KernelParam> {
        let param = self
            .params
            .get(index as usize)
            .copied()
            .ok_or_else(|| OffloadError::ArgumentBind {
                index,
                reason: format!(
                    "kernel '{}' takes {} arguments",
                    self.entry,
                    self.params.len()
                ),
            })?;
        let mismatch = |reason: String| OffloadError::ArgumentBind { index, reason };
        match (param, arg) {
            (KernelParam::Buffer(expected), ArgValue::Buffer(id)) => {
                let actual = buffer_access
                    .ok_or_else(|| mismatch(format!("unknown {id}")))?;
                if !actual.satisfies(expected) {
                    return Err(mismatch(format!(
                        "{id} created {actual:?} cannot back a {expected:?} parameter"
                    )));
                }
            }
            (KernelParam::Local, ArgValue::Local(bytes)) => {
                if *bytes == 0 {
                    return Err(mismatch("local scratch size must be non-zero".into()));
                }
            }
            (KernelParam::Scalar(kind), ArgValue::Scalar(value)) => {
                if value.kind() != kind {
                    return Err(mismatch(format!(
                        "expected {kind:?} scalar, got {:?}",
                        value.kind()
                    )));
                }
            }
            (expected, other) => {
                return Err(mismatch(format!(
                    "expected {expected:?}, got {}",
                    other.kind_name()
                )));
            }
        }
        Ok(param)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    Buffer(BufferId),
    Local(u64),
    Scalar(ScalarValue),
}

impl ArgValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ArgValue::Buffer(_) => "buffer",
            ArgValue::Local(_) => "local scratch",
            ArgValue::Scalar(_) => "scalar",
        }
    }
}

/// One- or two-dimensional index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkExtent {
    D1(u32),
    D2(u32, u32),
}

impl WorkExtent {
    pub fn dims(&self) -> [u32; 3] {
        match *self {
            WorkExtent::D1(x) => [x, 1, 1],
            WorkExtent::D2(x, y) => [x, y, 1],
        }
    }

    pub fn total(&self) -> u64 {
        self.dims().iter().map(|&d| d as u64).product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProperties {
    pub profiling: bool,
}

/// Which clock produced an event's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockDomain {
    Device,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimestamps {
    pub start_ns: u64,
    pub end_ns: u64,
    pub clock: ClockDomain,
}

/// Discovery surface of a backend.
pub trait ComputePlatform: Send + Sync {
    fn backend_name(&self) -> &str;
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;
    fn devices(&self, platform: PlatformId, class: DeviceClass) -> Result<Vec<DeviceDescriptor>>;
    fn open(
        &self,
        device: &DeviceDescriptor,
        queue: QueueProperties,
    ) -> Result<Arc<dyn DeviceContext>>;
}

/// One opened device with a single in-order queue.
pub trait DeviceContext: Send + Sync {
    fn device(&self) -> &DeviceDescriptor;
    fn profiling_enabled(&self) -> bool;

    /// Compiles source text for this device. Errors carry the compiler log.
    fn compile(&self, label: &str, source: &str, entry_points: &[&str]) -> Result<ProgramId>;
    /// Device-loadable image of a compiled program.
    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>>;
    /// Loads a previously produced image. Failures are [`OffloadError::Link`].
    fn load_binary(&self, label: &str, image: &[u8], entry_points: &[&str]) -> Result<ProgramId>;
    fn release_program(&self, program: ProgramId);

    fn create_kernel(&self, program: ProgramId, signature: &KernelSignature) -> Result<KernelId>;
    fn release_kernel(&self, kernel: KernelId);

    fn create_buffer(
        &self,
        size_bytes: u64,
        access: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<BufferId>;
    fn write_buffer(&self, buffer: BufferId, bytes: &[u8]) -> Result<()>;
    /// Blocking copy of the device contents into `out`.
    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()>;
    fn buffer_access(&self, buffer: BufferId) -> Option<AccessMode>;
    fn release_buffer(&self, buffer: BufferId);

    fn set_arg(&self, kernel: KernelId, index: u32, arg: &ArgValue) -> Result<()>;
    fn enqueue(
        &self,
        kernel: KernelId,
        global: WorkExtent,
        local: Option<WorkExtent>,
    ) -> Result<EventId>;
    fn wait(&self, event: EventId) -> Result<()>;
    /// Blocks until everything queued so far has completed.
    fn finish(&self) -> Result<()>;
    fn event_timestamps(&self, event: EventId) -> Result<EventTimestamps>;
    fn release_event(&self, event: EventId);
}
