//! Flux calibration of an exposure against its reference.
//!
//! Both images are cut into chunks; the chunk medians are related by
//! `reference = b1 * (b0 + exposure)` and the line is fitted by orthogonal
//! distance regression with the chunk MAD sigmas as per-axis errors.

use crate::error::{AlignError, Result};
use crate::image::ImageData;
use crate::lm::{LeastSquaresModel, LevenbergMarquardt};
use crate::stats;

/// Minimum number of usable chunks for a two-parameter fit
const MIN_CHUNKS: usize = 2;

/// Linear flux relation `reference = b1 * (b0 + exposure)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationRecord {
    pub b0: f64,
    pub b1: f64,
}

impl NormalizationRecord {
    pub const IDENTITY: Self = Self { b0: 0.0, b1: 1.0 };

    /// Multiplicative flux scale of the exposure
    pub fn scale(&self) -> f64 {
        self.b1
    }

    /// Bring an exposure onto the reference flux scale.
    pub fn apply(&self, image: &ImageData) -> ImageData {
        image.map(|v| self.b1 * (self.b0 + v))
    }
}

/// Fitted relation plus the chunk samples that went into it
#[derive(Debug, Clone)]
pub struct FluxFit {
    pub record: NormalizationRecord,
    /// Exposure chunk medians
    pub x: Vec<f64>,
    /// Reference chunk medians
    pub y: Vec<f64>,
    pub sx: Vec<f64>,
    pub sy: Vec<f64>,
}

/// ODR for a straight line reduced to the parameters only: the optimal
/// point on the line for each sample is eliminated analytically, leaving
/// `(y - b1 (x + b0)) / sqrt(sy^2 + b1^2 sx^2)` as residual.
struct OrthogonalLine<'a> {
    x: &'a [f64],
    y: &'a [f64],
    sx: &'a [f64],
    sy: &'a [f64],
}

impl LeastSquaresModel for OrthogonalLine<'_> {
    fn residual_count(&self) -> usize {
        self.x.len()
    }

    fn parameter_count(&self) -> usize {
        2
    }

    fn residual(&self, index: usize, params: &[f64]) -> f64 {
        let (b0, b1) = (params[0], params[1]);
        let misfit = self.y[index] - b1 * (self.x[index] + b0);
        let weight = self.sy[index].powi(2) + b1 * b1 * self.sx[index].powi(2);
        misfit / weight.sqrt()
    }

    fn gradient(&self, index: usize, params: &[f64], grad: &mut [f64]) {
        let (b0, b1) = (params[0], params[1]);
        let sx2 = self.sx[index].powi(2);
        let misfit = self.y[index] - b1 * (self.x[index] + b0);
        let weight = self.sy[index].powi(2) + b1 * b1 * sx2;
        let root = weight.sqrt();

        grad[0] = -b1 / root;
        grad[1] = -(self.x[index] + b0) / root - misfit * b1 * sx2 / (weight * root);
    }
}

/// Fit the flux relation between `exposure` and `reference` over
/// `chunk_size` tiles.
///
/// Only chunks whose median and scale are strictly positive in both images
/// are used. The fit starts at `b0 = 0` and `b1` equal to the median ratio
/// of reference to exposure chunk medians.
pub fn fit(exposure: &ImageData, reference: &ImageData, chunk_size: usize) -> Result<FluxFit> {
    let solver = LevenbergMarquardt::default().with_max_iterations(200);
    fit_with(exposure, reference, chunk_size, &solver)
}

/// [`fit`] with an explicit solver.
pub fn fit_with(
    exposure: &ImageData,
    reference: &ImageData,
    chunk_size: usize,
    solver: &LevenbergMarquardt,
) -> Result<FluxFit> {
    let chunks = stats::chunk_stats(&[exposure, reference], chunk_size)?;

    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut sx = Vec::new();
    let mut sy = Vec::new();
    for c in 0..chunks.chunk_count() {
        let (em, rm) = (chunks.medians[0][c], chunks.medians[1][c]);
        let (es, rs) = (chunks.scales[0][c], chunks.scales[1][c]);
        // NaN fails every comparison, so masked chunks drop out here too
        if em > 0.0 && rm > 0.0 && es > 0.0 && rs > 0.0 {
            x.push(em);
            y.push(rm);
            sx.push(es);
            sy.push(rs);
        }
    }

    if x.len() < MIN_CHUNKS {
        return Err(AlignError::InsufficientChunks {
            found: x.len(),
            required: MIN_CHUNKS,
        });
    }

    let ratios: Vec<f64> = x.iter().zip(&y).map(|(e, r)| r / e).collect();
    let slope_guess = stats::median(&ratios);
    tracing::debug!(
        "flux fit over {} of {} chunks, initial slope {:.5}",
        x.len(),
        chunks.chunk_count(),
        slope_guess
    );

    let model = OrthogonalLine {
        x: &x,
        y: &y,
        sx: &sx,
        sy: &sy,
    };
    let outcome = solver.fit(&model, &[0.0, slope_guess], None);
    if !outcome.converged || outcome.params.iter().any(|p| !p.is_finite()) {
        return Err(AlignError::SingularFit(format!(
            "regression stopped after {} iterations at b0={}, b1={}",
            outcome.iterations, outcome.params[0], outcome.params[1]
        )));
    }

    let record = NormalizationRecord {
        b0: outcome.params[0],
        b1: outcome.params[1],
    };
    Ok(FluxFit {
        record,
        x,
        y,
        sx,
        sy,
    })
}
