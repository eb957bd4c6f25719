//! Full 2-D cross-correlation of preprocessed images.
//!
//! The surface is the linear (zero-padded) correlation computed through FFT:
//! the reference is convolved with the target reversed along both axes, so
//! the output has `(Hr + Ht - 1) x (Wr + Wt - 1)` samples and the zero-shift
//! term sits at `(Ht - 1, Wt - 1)`.

use crate::error::{AlignError, Result};
use crate::image::ImageData;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Correlation surface and its coarse maximum
#[derive(Debug, Clone)]
pub struct CrossCorrelation {
    pub surface: ImageData,
    /// (row, col) of the first maximum in row-major order
    pub peak: (usize, usize),
}

/// Cross-correlate `target` against `reference` and locate the maximum.
pub fn correlate(reference: &ImageData, target: &ImageData) -> Result<CrossCorrelation> {
    for (name, image) in [("reference", reference), ("target", target)] {
        if image.is_empty() {
            return Err(AlignError::InvalidInput(format!("{name} image is empty")));
        }
        if image.data.iter().any(|v| !v.is_finite()) {
            return Err(AlignError::InvalidInput(format!(
                "{name} image contains non-finite samples"
            )));
        }
    }

    let height = reference.height + target.height - 1;
    let width = reference.width + target.width - 1;

    let mut planner = FftPlanner::<f64>::new();
    let plan = Plan2d {
        width,
        height,
        row_forward: planner.plan_fft_forward(width),
        col_forward: planner.plan_fft_forward(height),
        row_inverse: planner.plan_fft_inverse(width),
        col_inverse: planner.plan_fft_inverse(height),
    };

    let mut ref_spectrum = vec![Complex::new(0.0, 0.0); width * height];
    for y in 0..reference.height {
        for x in 0..reference.width {
            ref_spectrum[y * width + x] = Complex::new(reference.get(x, y), 0.0);
        }
    }

    // Reversing the target turns the convolution into a correlation
    let mut tar_spectrum = vec![Complex::new(0.0, 0.0); width * height];
    for y in 0..target.height {
        for x in 0..target.width {
            let (rx, ry) = (target.width - 1 - x, target.height - 1 - y);
            tar_spectrum[ry * width + rx] = Complex::new(target.get(x, y), 0.0);
        }
    }

    plan.forward(&mut ref_spectrum);
    plan.forward(&mut tar_spectrum);
    for (a, b) in ref_spectrum.iter_mut().zip(&tar_spectrum) {
        *a *= *b;
    }
    plan.inverse(&mut ref_spectrum);

    let norm = 1.0 / (width * height) as f64;
    let surface = ImageData {
        width,
        height,
        data: ref_spectrum.iter().map(|c| c.re * norm).collect(),
    };
    let peak = find_peak(&surface);
    tracing::debug!(
        "cross-correlation {}x{} peak at row {} col {}",
        width,
        height,
        peak.0,
        peak.1
    );

    Ok(CrossCorrelation { surface, peak })
}

/// First maximum in row-major scan order, as (row, col).
pub fn find_peak(surface: &ImageData) -> (usize, usize) {
    let mut best = 0;
    for (i, &v) in surface.data.iter().enumerate() {
        if v > surface.data[best] {
            best = i;
        }
    }
    (best / surface.width, best % surface.width)
}

/// Row-column decomposition of a 2-D FFT over a row-major buffer
struct Plan2d {
    width: usize,
    height: usize,
    row_forward: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl Plan2d {
    fn forward(&self, data: &mut [Complex<f64>]) {
        self.transform(data, &self.row_forward, &self.col_forward);
    }

    fn inverse(&self, data: &mut [Complex<f64>]) {
        self.transform(data, &self.row_inverse, &self.col_inverse);
    }

    fn transform(&self, data: &mut [Complex<f64>], rows: &Arc<dyn Fft<f64>>, cols: &Arc<dyn Fft<f64>>) {
        for row in data.chunks_exact_mut(self.width) {
            rows.process(row);
        }

        let mut column = vec![Complex::new(0.0, 0.0); self.height];
        for x in 0..self.width {
            for (y, c) in column.iter_mut().enumerate() {
                *c = data[y * self.width + x];
            }
            cols.process(&mut column);
            for (y, c) in column.iter().enumerate() {
                data[y * self.width + x] = *c;
            }
        }
    }
}
