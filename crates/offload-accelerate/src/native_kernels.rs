//! Host implementations of the bundled entry points, used by the in-process
//! provider. Each function walks the same padded index space the device
//! would launch and applies the same per-invocation bounds checks.

use offload_api::{OffloadError, Result, ScalarValue};

use crate::dispatch::common::dispatch_size;

const LOWEST: f32 = -3.402823e38;

pub(crate) struct NativeArgs<'a> {
    pub buffers: Vec<&'a mut [f32]>,
    pub scalars: Vec<ScalarValue>,
    pub global: [u32; 3],
    pub local: [u32; 3],
}

pub(crate) type NativeKernelFn = fn(&mut NativeArgs<'_>) -> Result<()>;

impl<'a> NativeArgs<'a> {
    fn u32(&self, slot: usize) -> Result<u32> {
        self.scalars
            .get(slot)
            .and_then(|s| s.as_u32())
            .ok_or_else(|| OffloadError::Dispatch(format!("scalar slot {slot} is not a u32")))
    }

    fn dim(&self, slot: usize) -> Result<usize> {
        let value = self
            .scalars
            .get(slot)
            .and_then(|s| s.as_i32())
            .ok_or_else(|| OffloadError::Dispatch(format!("scalar slot {slot} is not an i32")))?;
        usize::try_from(value)
            .map_err(|_| OffloadError::Dispatch(format!("negative dimension {value}")))
    }

    /// Invocations along `axis` once the global extent is rounded up to whole groups.
    fn span(&self, axis: usize) -> u32 {
        let local = self.local[axis].max(1);
        dispatch_size(self.global[axis], local) * local
    }

    fn buffers<const K: usize>(&mut self) -> Result<[&mut [f32]; K]> {
        let count = self.buffers.len();
        let views: Vec<&mut [f32]> = self.buffers.iter_mut().map(|b| &mut **b).collect();
        views
            .try_into()
            .map_err(|_| OffloadError::Dispatch(format!("expected {K} buffers, got {count}")))
    }
}

fn require(len: usize, needed: usize, what: &str) -> Result<()> {
    if len < needed {
        return Err(OffloadError::Dispatch(format!(
            "{what} holds {len} elements, kernel needs {needed}"
        )));
    }
    Ok(())
}

pub(crate) fn lookup(entry: &str) -> Option<NativeKernelFn> {
    match entry {
        "findmax" => Some(findmax),
        "gemm_block4x4_F32" => Some(gemm_block4x4),
        "inversion" => Some(inversion_step),
        "matvec_mult" => Some(matvec),
        _ => None,
    }
}

fn findmax(args: &mut NativeArgs<'_>) -> Result<()> {
    let len = args.u32(0)? as usize;
    let local = args.local[0].max(1) as usize;
    let groups = dispatch_size(args.global[0], local as u32) as usize;
    let [data, partials] = args.buffers::<2>()?;
    require(partials.len(), groups, "partials")?;
    require(data.len(), len.min(groups * local), "data")?;
    for (group, slot) in partials.iter_mut().take(groups).enumerate() {
        let start = (group * local).min(len);
        let end = ((group + 1) * local).min(len);
        *slot = data[start..end].iter().copied().fold(LOWEST, f32::max);
    }
    Ok(())
}

fn gemm_block4x4(args: &mut NativeArgs<'_>) -> Result<()> {
    let (m, k, n) = (args.dim(0)?, args.dim(1)?, args.dim(2)?);
    if m % 4 != 0 || n % 4 != 0 {
        return Err(OffloadError::Dispatch(format!(
            "gemm block kernel needs m and n in multiples of 4, got {m}x{n}"
        )));
    }
    let (span_x, span_y) = (args.span(0) as usize, args.span(1) as usize);
    let [a, b, c] = args.buffers::<3>()?;
    require(a.len(), m * k, "a")?;
    require(b.len(), k * n, "b")?;
    require(c.len(), m * n, "c")?;
    for gy in 0..span_y {
        for gx in 0..span_x {
            let (row, col) = (gy * 4, gx * 4);
            if col >= n || row >= m {
                continue;
            }
            let mut acc = [[0.0f32; 4]; 4];
            for p in 0..k {
                let brow = &b[p * n + col..p * n + col + 4];
                for (r, acc_row) in acc.iter_mut().enumerate() {
                    let av = a[(row + r) * k + p];
                    for (slot, bv) in acc_row.iter_mut().zip(brow) {
                        *slot += av * bv;
                    }
                }
            }
            for (r, acc_row) in acc.iter().enumerate() {
                let base = (row + r) * n + col;
                c[base..base + 4].copy_from_slice(acc_row);
            }
        }
    }
    Ok(())
}

fn normalize_row(mat: &mut [f32], inv: &mut [f32], r: usize, n: usize) {
    let pivot = mat[r * n + r];
    for c in 0..n {
        mat[r * n + c] /= pivot;
        inv[r * n + c] /= pivot;
    }
}

fn inversion_step(args: &mut NativeArgs<'_>) -> Result<()> {
    let n = args.u32(0)? as usize;
    let i = args.u32(1)? as usize;
    let span = args.span(0) as usize;
    let [mat, inv] = args.buffers::<2>()?;
    require(mat.len(), n * n, "mat")?;
    require(inv.len(), n * n, "inv")?;
    if n > 0 && i >= n {
        return Err(OffloadError::Dispatch(format!("pivot row {i} outside {n}x{n}")));
    }
    for j in 0..span.min(n) {
        if n == 1 {
            normalize_row(mat, inv, 0, n);
            continue;
        }
        if j == i {
            continue;
        }
        let mut f = mat[j * n + i];
        if i == 0 {
            f /= mat[0];
        }
        for c in 0..n {
            mat[j * n + c] -= f * mat[i * n + c];
            inv[j * n + c] -= f * inv[i * n + c];
        }
        if j == i + 1 || (i == 1 && j == 0) {
            normalize_row(mat, inv, j, n);
        }
    }
    Ok(())
}

fn matvec(args: &mut NativeArgs<'_>) -> Result<()> {
    let rows = args.u32(0)? as usize;
    let cols = args.u32(1)? as usize;
    let span = args.span(0) as usize;
    let [matrix, vector, result] = args.buffers::<3>()?;
    require(matrix.len(), rows * cols, "matrix")?;
    require(vector.len(), cols, "vector")?;
    require(result.len(), rows, "result")?;
    for r in 0..span.min(rows) {
        let row = &matrix[r * cols..(r + 1) * cols];
        result[r] = row.iter().zip(vector.iter()).map(|(m, v)| m * v).sum();
    }
    Ok(())
}
