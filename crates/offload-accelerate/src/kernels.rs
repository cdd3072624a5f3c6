//! Bundled kernel programs and their positional argument signatures.

use offload_api::{AccessMode, KernelParam, KernelSignature, ScalarKind};

/// A program the cache knows how to build: cache key, source file name,
/// an embedded copy of the source, and the entry points it must export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: &'static str,
    pub source_file: &'static str,
    pub embedded_source: &'static str,
    pub entry_points: &'static [&'static str],
}

/// Work-group width baked into `findmax.wgsl`.
pub const FINDMAX_LOCAL_SIZE: u32 = 128;
/// Output block edge computed by one gemm invocation.
pub const GEMM_TILE: u32 = 4;
pub const GEMM_WORKGROUP: [u32; 2] = [8, 8];
pub const ROW_WORKGROUP: u32 = 64;

pub const FINDMAX: ProgramSpec = ProgramSpec {
    name: "findmax",
    source_file: "findmax.wgsl",
    embedded_source: include_str!("../kernels/findmax.wgsl"),
    entry_points: &["findmax"],
};

pub const GEMM: ProgramSpec = ProgramSpec {
    name: "gemm",
    source_file: "gemm.wgsl",
    embedded_source: include_str!("../kernels/gemm.wgsl"),
    entry_points: &["gemm_block4x4_F32"],
};

pub const INVERSION: ProgramSpec = ProgramSpec {
    name: "inversion",
    source_file: "inversion.wgsl",
    embedded_source: include_str!("../kernels/inversion.wgsl"),
    entry_points: &["inversion"],
};

pub const MATVEC: ProgramSpec = ProgramSpec {
    name: "matvec",
    source_file: "matvec.wgsl",
    embedded_source: include_str!("../kernels/matvec.wgsl"),
    entry_points: &["matvec_mult"],
};

pub const ALL_PROGRAMS: &[ProgramSpec] = &[FINDMAX, GEMM, INVERSION, MATVEC];

/// `findmax(data, scratch, partials, len)`
pub const FINDMAX_SIG: KernelSignature = KernelSignature {
    entry: "findmax",
    params: &[
        KernelParam::Buffer(AccessMode::ReadOnly),
        KernelParam::Local,
        KernelParam::Buffer(AccessMode::ReadWrite),
        KernelParam::Scalar(ScalarKind::U32),
    ],
};

/// `gemm_block4x4_F32(a, b, c, m, k, n)`
pub const GEMM_SIG: KernelSignature = KernelSignature {
    entry: "gemm_block4x4_F32",
    params: &[
        KernelParam::Buffer(AccessMode::ReadOnly),
        KernelParam::Buffer(AccessMode::ReadOnly),
        KernelParam::Buffer(AccessMode::WriteOnly),
        KernelParam::Scalar(ScalarKind::I32),
        KernelParam::Scalar(ScalarKind::I32),
        KernelParam::Scalar(ScalarKind::I32),
    ],
};

/// `inversion(mat, inv, n, row)`; `row` is overridden per launch.
pub const INVERSION_SIG: KernelSignature = KernelSignature {
    entry: "inversion",
    params: &[
        KernelParam::Buffer(AccessMode::ReadWrite),
        KernelParam::Buffer(AccessMode::ReadWrite),
        KernelParam::Scalar(ScalarKind::U32),
        KernelParam::Scalar(ScalarKind::U32),
    ],
};
pub const INVERSION_ROW_ARG: u32 = 3;

/// `matvec_mult(matrix, vector, result, rows, cols)`
pub const MATVEC_SIG: KernelSignature = KernelSignature {
    entry: "matvec_mult",
    params: &[
        KernelParam::Buffer(AccessMode::ReadOnly),
        KernelParam::Buffer(AccessMode::ReadOnly),
        KernelParam::Buffer(AccessMode::WriteOnly),
        KernelParam::Scalar(ScalarKind::U32),
        KernelParam::Scalar(ScalarKind::U32),
    ],
};
