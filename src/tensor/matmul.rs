//! Host matrix multiplication kernels
//!
//! All matrices are stored in row-major order. Weights follow the
//! `[out_features, in_features]` convention, so the linear kernel multiplies
//! by the transpose without materializing it.

use crate::error::{ForgeError, ForgeResult};

/// C = A * B
///
/// Arguments:
/// - a: matrix A (m×k)
/// - b: matrix B (k×n)
/// - m: number of rows in A and C
/// - n: number of columns in B and C
/// - k: number of columns in A and rows in B
pub fn cpu_matmul_f32(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for l in 0..k {
                sum += a[i * k + l] * b[l * n + j];
            }
            c[i * n + j] = sum;
        }
    }

    c
}

/// Y = X * Wᵀ + bias, with X (m×k), W (n×k), bias (n)
pub fn linear_f32(
    x: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    m: usize,
    n: usize,
    k: usize,
) -> ForgeResult<Vec<f32>> {
    if x.len() != m * k {
        return Err(ForgeError::ShapeMismatch(format!(
            "input has {} values, expected {}x{}",
            x.len(),
            m,
            k
        )));
    }
    if weight.len() != n * k {
        return Err(ForgeError::ShapeMismatch(format!(
            "weight has {} values, expected {}x{}",
            weight.len(),
            n,
            k
        )));
    }
    if let Some(b) = bias {
        if b.len() != n {
            return Err(ForgeError::ShapeMismatch(format!(
                "bias has {} values, expected {}",
                b.len(),
                n
            )));
        }
    }

    let mut y = vec![0.0f32; m * n];
    for i in 0..m {
        let row = &x[i * k..(i + 1) * k];
        for j in 0..n {
            let w = &weight[j * k..(j + 1) * k];
            let mut sum = bias.map(|b| b[j]).unwrap_or(0.0);
            for (xv, wv) in row.iter().zip(w) {
                sum += xv * wv;
            }
            y[i * n + j] = sum;
        }
    }
    Ok(y)
}
