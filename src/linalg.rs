//! Dense symmetric-matrix helpers for Kronecker factors
//!
//! Factors live in `ndarray::Array2<f64>`; layer tensors arrive as candle
//! tensors and are converted on the way in and out.

use crate::error::KfacError;
use crate::model::ConvGeometry;
use crate::KfacResult;
use candle_core::{DType, Device, Tensor};
use ndarray::{Array1, Array2, ArrayView2};

// ═══════════════════════════════════════════════════════════════════════════
// TENSOR CONVERSION
// ═══════════════════════════════════════════════════════════════════════════

/// Copy a rank-2 tensor into an `f64` matrix
pub fn tensor_to_array2(tensor: &Tensor) -> KfacResult<Array2<f64>> {
    let (rows, cols) = tensor.dims2()?;
    let flat = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Array2::from_shape_vec((rows, cols), flat).map_err(|e| KfacError::Numerical(e.to_string()))
}

/// Flatten a tensor of any rank into row-major `f64` values
pub fn tensor_to_vec(tensor: &Tensor) -> KfacResult<Vec<f64>> {
    Ok(tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
}

/// Build a tensor shaped like `like` (same dtype and device) from row-major values
pub fn vec_to_tensor_like(values: Vec<f64>, like: &Tensor) -> KfacResult<Tensor> {
    let expected = like.elem_count();
    if values.len() != expected {
        return Err(KfacError::DimensionMismatch {
            expected,
            got: values.len(),
        });
    }
    let tensor = Tensor::from_vec(values, like.shape().clone(), like.device())?;
    Ok(tensor.to_dtype(like.dtype())?)
}

/// Convert a matrix into a rank-2 tensor
pub fn array2_to_tensor(matrix: &Array2<f64>, dtype: DType, device: &Device) -> KfacResult<Tensor> {
    let values: Vec<f64> = matrix.iter().copied().collect();
    let tensor = Tensor::from_vec(values, matrix.dim(), device)?;
    Ok(tensor.to_dtype(dtype)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// FACTORS
// ═══════════════════════════════════════════════════════════════════════════

fn square_dim(matrix: &Array2<f64>) -> KfacResult<usize> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(KfacError::DimensionMismatch {
            expected: rows,
            got: cols,
        });
    }
    Ok(rows)
}

/// `alpha * xᵀx` for a samples-by-features matrix, symmetrized
pub fn kronecker_factor(x: ArrayView2<f64>, alpha: f64) -> Array2<f64> {
    let mut factor = x.t().dot(&x);
    factor.mapv_inplace(|v| v * alpha);
    symmetrize(&mut factor);
    factor
}

/// Average `m` with its transpose to remove rounding asymmetry
pub fn symmetrize(m: &mut Array2<f64>) {
    let n = m.nrows().min(m.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (m[[i, j]] + m[[j, i]]);
            m[[i, j]] = v;
            m[[j, i]] = v;
        }
    }
}

pub fn trace(m: &Array2<f64>) -> f64 {
    m.diag().sum()
}

/// Trace-ratio balance between two Kronecker factors
///
/// `pi = sqrt((tr(A) / dim A) / (tr(G) / dim G))`
pub fn compute_pi(a: &Array2<f64>, g: &Array2<f64>) -> f64 {
    if a.nrows() == 0 || g.nrows() == 0 {
        return 1.0;
    }
    let ta = trace(a) / a.nrows() as f64;
    let tg = trace(g) / g.nrows() as f64;
    if ta <= 0.0 || tg <= 0.0 {
        return 1.0;
    }
    (ta / tg).sqrt()
}

pub fn add_to_diagonal(m: &mut Array2<f64>, damping: f64) {
    m.diag_mut().mapv_inplace(|d| d + damping);
}

/// Add `first` to the leading half of the diagonal and `second` to the rest
pub fn add_to_diagonal_split(m: &mut Array2<f64>, first: f64, second: f64) {
    let half = m.nrows() / 2;
    for (i, d) in m.diag_mut().iter_mut().enumerate() {
        *d += if i < half { first } else { second };
    }
}

/// `avg = decay * avg + (1 - decay) * fresh`
pub fn update_moving_average(avg: &mut Array2<f64>, fresh: &Array2<f64>, decay: f64) {
    avg.zip_mut_with(fresh, |a, f| *a = decay * *a + (1.0 - decay) * *f);
}

// ═══════════════════════════════════════════════════════════════════════════
// INVERSION
// ═══════════════════════════════════════════════════════════════════════════

/// Lower Cholesky factor `L` with `m = L Lᵀ`
pub fn cholesky(m: &Array2<f64>) -> KfacResult<Array2<f64>> {
    let n = square_dim(m)?;
    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut pivot = m[[j, j]];
        for k in 0..j {
            pivot -= l[[j, k]] * l[[j, k]];
        }
        if !(pivot > 0.0) || !pivot.is_finite() {
            return Err(KfacError::Numerical(format!(
                "matrix is not positive definite (pivot {} = {:e})",
                j, pivot
            )));
        }
        let d = pivot.sqrt();
        l[[j, j]] = d;
        for i in (j + 1)..n {
            let mut s = m[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / d;
        }
    }
    Ok(l)
}

fn lower_triangular_inverse(l: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        inv[[j, j]] = 1.0 / l[[j, j]];
        for i in (j + 1)..n {
            let mut s = 0.0;
            for k in j..i {
                s -= l[[i, k]] * inv[[k, j]];
            }
            inv[[i, j]] = s / l[[i, i]];
        }
    }
    inv
}

/// Inverse of a symmetric positive-definite matrix via Cholesky
pub fn spd_inverse(m: &Array2<f64>) -> KfacResult<Array2<f64>> {
    let l = cholesky(m)?;
    let l_inv = lower_triangular_inverse(&l);
    let mut inv = l_inv.t().dot(&l_inv);
    symmetrize(&mut inv);
    Ok(inv)
}

/// `(m + damping I)⁻¹`
pub fn damped_inverse(m: &Array2<f64>, damping: f64) -> KfacResult<Array2<f64>> {
    let mut damped = m.clone();
    add_to_diagonal(&mut damped, damping);
    spd_inverse(&damped)
}

const JACOBI_MAX_SWEEPS: usize = 64;

/// Eigenvalues and column eigenvectors of a symmetric matrix (cyclic Jacobi)
///
/// `m = V diag(λ) Vᵀ`; eigenvalues are returned unsorted.
pub fn symmetric_eigen(m: &Array2<f64>) -> KfacResult<(Array1<f64>, Array2<f64>)> {
    let n = square_dim(m)?;
    let mut a = m.clone();
    symmetrize(&mut a);
    let mut v = Array2::<f64>::eye(n);
    let norm = a.iter().map(|x| x * x).sum::<f64>();
    if !norm.is_finite() {
        return Err(KfacError::Numerical("matrix has non-finite entries".to_string()));
    }

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    off += a[[i, j]] * a[[i, j]];
                }
            }
        }
        if off <= f64::EPSILON * f64::EPSILON * norm {
            return Ok((a.diag().to_owned(), v));
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }
    Err(KfacError::Numerical(format!(
        "eigen decomposition did not converge in {} sweeps",
        JACOBI_MAX_SWEEPS
    )))
}

/// `(m + damping I)^(-1/2)` via the eigen decomposition of `m`
pub fn damped_inverse_sqrt(m: &Array2<f64>, damping: f64) -> KfacResult<Array2<f64>> {
    let (values, vectors) = symmetric_eigen(m)?;
    let mut scaled = vectors.clone();
    for (j, lambda) in values.iter().enumerate() {
        let d = lambda + damping;
        if !(d > 0.0) || !d.is_finite() {
            return Err(KfacError::Numerical(format!(
                "damped eigenvalue {} = {:e} is not positive",
                j, d
            )));
        }
        let r = 1.0 / d.sqrt();
        scaled.column_mut(j).mapv_inplace(|x| x * r);
    }
    let mut root = scaled.dot(&vectors.t());
    symmetrize(&mut root);
    Ok(root)
}

// ═══════════════════════════════════════════════════════════════════════════
// PACKING
// ═══════════════════════════════════════════════════════════════════════════

/// Number of entries in the lower triangle of an `n x n` matrix
pub fn lower_tri_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Write the lower triangle of a symmetric matrix, column by column
pub fn pack_lower_tri(m: &Array2<f64>, out: &mut [f64]) -> KfacResult<()> {
    let n = square_dim(m)?;
    if out.len() != lower_tri_len(n) {
        return Err(KfacError::DimensionMismatch {
            expected: lower_tri_len(n),
            got: out.len(),
        });
    }
    let mut idx = 0;
    for j in 0..n {
        for i in j..n {
            out[idx] = m[[i, j]];
            idx += 1;
        }
    }
    Ok(())
}

/// Rebuild a symmetric matrix from its packed lower triangle
pub fn unpack_lower_tri(packed: &[f64], n: usize) -> KfacResult<Array2<f64>> {
    if packed.len() != lower_tri_len(n) {
        return Err(KfacError::DimensionMismatch {
            expected: lower_tri_len(n),
            got: packed.len(),
        });
    }
    let mut m = Array2::<f64>::zeros((n, n));
    let mut idx = 0;
    for j in 0..n {
        for i in j..n {
            m[[i, j]] = packed[idx];
            m[[j, i]] = packed[idx];
            idx += 1;
        }
    }
    Ok(m)
}

// ═══════════════════════════════════════════════════════════════════════════
// CONVOLUTION UNFOLDING
// ═══════════════════════════════════════════════════════════════════════════

/// Unfold `(batch, C, H, W)` activations into `(batch * H_out * W_out, C * kh * kw)`
///
/// With `append_ones` a trailing column of ones accounts for the bias.
pub fn im2col(input: &[f64], batch: usize, geom: &ConvGeometry, append_ones: bool) -> KfacResult<Array2<f64>> {
    let (c, h, w) = (geom.in_channels, geom.height, geom.width);
    let expected = batch * c * h * w;
    if input.len() != expected {
        return Err(KfacError::DimensionMismatch {
            expected,
            got: input.len(),
        });
    }
    let (out_h, out_w) = geom.output_hw();
    let patch = c * geom.kernel_h * geom.kernel_w;
    let cols = patch + usize::from(append_ones);
    let mut out = Array2::<f64>::zeros((batch * out_h * out_w, cols));

    for n in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let row = (n * out_h + oy) * out_w + ox;
                for ch in 0..c {
                    for ky in 0..geom.kernel_h {
                        let iy = (oy * geom.stride_h + ky) as i64 - geom.pad_h as i64;
                        for kx in 0..geom.kernel_w {
                            let ix = (ox * geom.stride_w + kx) as i64 - geom.pad_w as i64;
                            if iy < 0 || ix < 0 || iy >= h as i64 || ix >= w as i64 {
                                continue;
                            }
                            let src = ((n * c + ch) * h + iy as usize) * w + ix as usize;
                            let col = (ch * geom.kernel_h + ky) * geom.kernel_w + kx;
                            out[[row, col]] = input[src];
                        }
                    }
                }
                if append_ones {
                    out[[row, patch]] = 1.0;
                }
            }
        }
    }
    Ok(out)
}

/// Reshape `(batch, C, S)` values into `(batch * S, C)` rows
pub fn channels_last(values: &[f64], batch: usize, channels: usize, spatial: usize) -> KfacResult<Array2<f64>> {
    let expected = batch * channels * spatial;
    if values.len() != expected {
        return Err(KfacError::DimensionMismatch {
            expected,
            got: values.len(),
        });
    }
    let mut out = Array2::<f64>::zeros((batch * spatial, channels));
    for n in 0..batch {
        for ch in 0..channels {
            for s in 0..spatial {
                out[[n * spatial + s, ch]] = values[(n * channels + ch) * spatial + s];
            }
        }
    }
    Ok(out)
}

// ═══════════════════════════════════════════════════════════════════════════
// DIAGNOSTICS
// ═══════════════════════════════════════════════════════════════════════════

/// One-line shape/trace/norm summary
pub fn matrix_summary(name: &str, m: &Array2<f64>) -> String {
    let fro = m.iter().map(|v| v * v).sum::<f64>().sqrt();
    let (min_d, max_d) = m
        .diag()
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));
    format!(
        "{} ({}x{}): trace={:.6e}, fro={:.6e}, diag=[{:.6e}, {:.6e}]",
        name,
        m.nrows(),
        m.ncols(),
        trace(m),
        fro,
        min_d,
        max_d
    )
}

/// Full matrix dump, one row per line
pub fn format_matrix(name: &str, m: &Array2<f64>) -> String {
    let mut out = format!("{} ({}x{}):\n", name, m.nrows(), m.ncols());
    for row in m.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{:.6e}", v)).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}
