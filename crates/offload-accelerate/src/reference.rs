//! Host reference implementations the verifier compares device output against.
//! Matrices are row-major.

use offload_api::{OffloadError, Result};

const EPS: f64 = 1.0e-12;

fn check_len(data: &[f32], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(OffloadError::LengthMismatch {
            expected,
            found: data.len(),
        });
    }
    Ok(())
}

pub fn max(data: &[f32]) -> Option<f32> {
    data.iter().copied().reduce(f32::max)
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn identity(n: usize) -> Vec<f32> {
    let mut out = vec![0.0; n * n];
    for i in 0..n {
        out[i * n + i] = 1.0;
    }
    out
}

/// `C = A * B` for `A` (m x k) and `B` (k x n), accumulated in f64.
pub fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
    check_len(a, m * k)?;
    check_len(b, k * n)?;
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        let arow = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let mut acc = 0.0f64;
            for (p, &av) in arow.iter().enumerate() {
                acc += av as f64 * b[p * n + j] as f64;
            }
            c[i * n + j] = acc as f32;
        }
    }
    Ok(c)
}

pub fn matvec(matrix: &[f32], vector: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>> {
    check_len(matrix, rows * cols)?;
    check_len(vector, cols)?;
    Ok(matrix
        .chunks_exact(cols.max(1))
        .take(rows)
        .map(|row| dot(row, vector))
        .collect())
}

/// Packed LU factors with row permutation: `P * A = L * U`.
#[derive(Debug, Clone)]
pub struct LuFactors {
    pub n: usize,
    pub combined: Vec<f64>,
    pub perm: Vec<usize>,
}

pub fn lu_factor(data: &[f32], n: usize) -> Result<LuFactors> {
    check_len(data, n * n)?;
    let mut m: Vec<f64> = data.iter().map(|&v| v as f64).collect();
    let mut perm: Vec<usize> = (0..n).collect();
    for k in 0..n {
        let mut pivot_row = k;
        let mut pivot_abs = 0.0;
        for r in k..n {
            let abs = m[r * n + k].abs();
            if abs > pivot_abs {
                pivot_abs = abs;
                pivot_row = r;
            }
        }
        if pivot_abs <= EPS {
            return Err(OffloadError::InvalidState(format!(
                "matrix is singular at column {k}"
            )));
        }
        if pivot_row != k {
            for c in 0..n {
                m.swap(k * n + c, pivot_row * n + c);
            }
            perm.swap(k, pivot_row);
        }
        let pivot = m[k * n + k];
        for r in (k + 1)..n {
            let factor = m[r * n + k] / pivot;
            m[r * n + k] = factor;
            for c in (k + 1)..n {
                m[r * n + c] -= factor * m[k * n + c];
            }
        }
    }
    Ok(LuFactors {
        n,
        combined: m,
        perm,
    })
}

impl LuFactors {
    /// Solves `A x = b`.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x: Vec<f64> = self.perm.iter().map(|&p| b[p]).collect();
        for i in 0..n {
            for j in 0..i {
                x[i] -= self.combined[i * n + j] * x[j];
            }
        }
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                x[i] -= self.combined[i * n + j] * x[j];
            }
            x[i] /= self.combined[i * n + i];
        }
        x
    }
}

/// Inverse through LU decomposition with partial pivoting.
pub fn invert(data: &[f32], n: usize) -> Result<Vec<f32>> {
    let lu = lu_factor(data, n)?;
    let mut inv = vec![0.0f32; n * n];
    let mut e = vec![0.0f64; n];
    for col in 0..n {
        e.iter_mut().for_each(|v| *v = 0.0);
        e[col] = 1.0;
        for (row, value) in lu.solve(&e).into_iter().enumerate() {
            inv[row * n + col] = value as f32;
        }
    }
    Ok(inv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_of_empty_is_none() {
        assert_eq!(max(&[]), None);
        assert_eq!(max(&[-3.0, -1.0, -2.0]), Some(-1.0));
    }

    #[test]
    fn gemm_small() {
        let c = gemm(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], 2, 2, 2).unwrap();
        assert_eq!(c, vec![19.0, 22.0, 43.0, 50.0]);
        assert!(gemm(&[1.0], &[1.0, 2.0], 1, 1, 1).is_err());
    }

    #[test]
    fn invert_two_by_two() {
        let inv = invert(&[4.0, 3.0, 6.0, 3.0], 2).unwrap();
        let expected = [-0.5, 0.5, 1.0, -2.0 / 3.0];
        for (got, want) in inv.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn invert_needs_pivoting() {
        let inv = invert(&[0.0, 1.0, 1.0, 0.0], 2).unwrap();
        assert_eq!(inv, vec![0.0, 1.0, 1.0, 0.0]);
        assert!(invert(&[1.0, 2.0, 2.0, 4.0], 2).is_err());
    }

    #[test]
    fn matvec_rows() {
        let r = matvec(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0], 2, 2).unwrap();
        assert_eq!(r, vec![3.0, 7.0]);
    }
}
