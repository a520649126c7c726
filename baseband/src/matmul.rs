//! Matrix-Multiply Backend Selection
//!
//! One matrix-vector-multiply interface with two interchangeable
//! implementations. The choice affects latency only, never observable
//! output.

use ndarray::{ArrayView1, ArrayView2};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Backend selector, chosen at startup from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatmulKind {
    /// Library call through ndarray
    #[default]
    Ndarray,
    /// Plain scalar loops
    Naive,
}

/// Complex single-precision matrix-vector multiply: `y = A * x` with `A`
/// row-major `rows x cols`.
pub trait GemmBackend: Send + Sync {
    /// Compute `y = A * x`
    fn gemv(&self, a: &[Complex32], rows: usize, cols: usize, x: &[Complex32], y: &mut [Complex32]);

    /// Backend name for startup logging
    fn name(&self) -> &'static str;
}

/// ndarray-backed implementation
pub struct NdarrayGemm;

impl GemmBackend for NdarrayGemm {
    fn gemv(&self, a: &[Complex32], rows: usize, cols: usize, x: &[Complex32], y: &mut [Complex32]) {
        debug_assert_eq!(a.len(), rows * cols);
        debug_assert_eq!(x.len(), cols);
        debug_assert_eq!(y.len(), rows);
        let a = ArrayView2::from_shape((rows, cols), a).expect("gemv dims fixed at startup");
        let x = ArrayView1::from(x);
        let out = a.dot(&x);
        y.copy_from_slice(out.as_slice().expect("dot output is contiguous"));
    }

    fn name(&self) -> &'static str {
        "ndarray"
    }
}

/// Scalar-loop implementation
pub struct NaiveGemm;

impl GemmBackend for NaiveGemm {
    fn gemv(&self, a: &[Complex32], rows: usize, cols: usize, x: &[Complex32], y: &mut [Complex32]) {
        debug_assert_eq!(a.len(), rows * cols);
        debug_assert_eq!(x.len(), cols);
        debug_assert_eq!(y.len(), rows);
        for r in 0..rows {
            let row = &a[r * cols..(r + 1) * cols];
            let mut acc = Complex32::new(0.0, 0.0);
            for (h, s) in row.iter().zip(x.iter()) {
                acc += h * s;
            }
            y[r] = acc;
        }
    }

    fn name(&self) -> &'static str {
        "naive"
    }
}

/// Select the configured backend.
pub fn select_backend(kind: MatmulKind) -> Arc<dyn GemmBackend> {
    let backend: Arc<dyn GemmBackend> = match kind {
        MatmulKind::Ndarray => Arc::new(NdarrayGemm),
        MatmulKind::Naive => Arc::new(NaiveGemm),
    };
    info!("Using {} matrix-multiply backend", backend.name());
    backend
}
