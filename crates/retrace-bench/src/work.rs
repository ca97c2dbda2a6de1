// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic CPU load: a naive matrix multiplication sized by the
//! benchmarks table to approximate an API's `exec` target.

/// Dimensions for the matrix multiplication task: `(m x n) * (n x k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixConfig {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        MatrixConfig {
            m: 50,
            n: 50,
            k: 50,
        }
    }
}

/// Multiplies two matrices of ones and returns the checksum of the
/// product, so the work cannot be optimized away.
pub fn matrix_multiply(config: &MatrixConfig) -> f64 {
    let a = vec![1.0f64; config.m * config.n];
    let b = vec![1.0f64; config.n * config.k];
    let mut c = vec![0.0f64; config.m * config.k];

    for i in 0..config.m {
        for j in 0..config.k {
            let mut acc = 0.0;
            for l in 0..config.n {
                acc += a[i * config.n + l] * b[l * config.k + j];
            }
            c[i * config.k + j] = acc;
        }
    }

    c.iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_dimensions() {
        let config = MatrixConfig { m: 4, n: 3, k: 5 };
        // Each cell is n; there are m*k cells.
        assert_eq!(matrix_multiply(&config), (3 * 4 * 5) as f64);
    }

    #[test]
    fn default_dimensions_complete() {
        assert!(matrix_multiply(&MatrixConfig::default()).is_finite());
    }
}
