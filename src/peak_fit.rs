//! Sub-pixel refinement of a cross-correlation peak by 2-D Gaussian fitting.

use crate::error::{AlignError, Result};
use crate::image::ImageData;
use crate::lm::{Bounds, LeastSquaresModel, LevenbergMarquardt};
use nalgebra::Vector2;
use std::f64::consts::PI;

/// Rotated elliptical Gaussian without background.
/// Parameters: [amplitude, x_mean, y_mean, sigma_x, sigma_y, theta]
pub struct Gaussian2D;

impl Gaussian2D {
    pub fn value(x: f64, y: f64, params: &[f64]) -> f64 {
        let (xp, yp) = rotate(x - params[1], y - params[2], params[5]);
        let arg = -(xp * xp / (2.0 * params[3] * params[3]) + yp * yp / (2.0 * params[4] * params[4]));
        params[0] * arg.exp()
    }

    pub fn gradient(x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let sigma_x = params[3];
        let sigma_y = params[4];
        let (sin_t, cos_t) = params[5].sin_cos();
        let (xp, yp) = rotate(x - params[1], y - params[2], params[5]);

        let sx2 = sigma_x * sigma_x;
        let sy2 = sigma_y * sigma_y;
        let exp_arg = (-(xp * xp / (2.0 * sx2) + yp * yp / (2.0 * sy2))).exp();

        // d/dA
        grad[0] = exp_arg;
        // d/dx0
        grad[1] = a * exp_arg * (xp * cos_t / sx2 - yp * sin_t / sy2);
        // d/dy0
        grad[2] = a * exp_arg * (xp * sin_t / sx2 + yp * cos_t / sy2);
        // d/dsigma_x
        grad[3] = a * exp_arg * xp * xp / (sx2 * sigma_x);
        // d/dsigma_y
        grad[4] = a * exp_arg * yp * yp / (sy2 * sigma_y);
        // d/dtheta
        grad[5] = -a * exp_arg * xp * yp * (1.0 / sx2 - 1.0 / sy2);
    }
}

fn rotate(dx: f64, dy: f64, theta: f64) -> (f64, f64) {
    let (sin_t, cos_t) = theta.sin_cos();
    (dx * cos_t + dy * sin_t, -dx * sin_t + dy * cos_t)
}

/// Samples of the correlation window in unwrapped surface coordinates
struct PeakWindow {
    positions: Vec<(f64, f64)>,
    values: Vec<f64>,
}

impl LeastSquaresModel for PeakWindow {
    fn residual_count(&self) -> usize {
        self.values.len()
    }

    fn parameter_count(&self) -> usize {
        6
    }

    fn residual(&self, index: usize, params: &[f64]) -> f64 {
        let (x, y) = self.positions[index];
        self.values[index] - Gaussian2D::value(x, y, params)
    }

    fn gradient(&self, index: usize, params: &[f64], grad: &mut [f64]) {
        let (x, y) = self.positions[index];
        Gaussian2D::gradient(x, y, params, grad);
        for g in grad.iter_mut() {
            *g = -*g;
        }
    }
}

/// Fitted correlation peak
#[derive(Debug, Clone)]
pub struct PeakFit {
    /// Offset (x, y) of the fitted peak from the surface center, in pixels
    pub offset: Vector2<f64>,
    pub amplitude: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub theta: f64,
    pub iterations: usize,
}

/// Refine the coarse peak `(row, col)` of `surface` to sub-pixel precision.
///
/// A `(2r+1)^2` window around the peak is read with wraparound, shifted to
/// a zero baseline and scaled to unit maximum, then fitted with a Gaussian
/// started at the window maximum with `sigma_guess` widths and no rotation.
/// The returned offset is the fitted mean minus `size / 2` on each axis.
pub fn refine(
    surface: &ImageData,
    coarse_peak: (usize, usize),
    window_radius: usize,
    sigma_guess: f64,
) -> Result<PeakFit> {
    refine_with(
        surface,
        coarse_peak,
        window_radius,
        sigma_guess,
        &LevenbergMarquardt::default(),
    )
}

/// [`refine`] with an explicit solver.
pub fn refine_with(
    surface: &ImageData,
    coarse_peak: (usize, usize),
    window_radius: usize,
    sigma_guess: f64,
    solver: &LevenbergMarquardt,
) -> Result<PeakFit> {
    if surface.is_empty() {
        return Err(AlignError::InvalidInput("empty correlation surface".to_string()));
    }
    let height = surface.height as isize;
    let width = surface.width as isize;
    let (row, col) = (coarse_peak.0 as isize, coarse_peak.1 as isize);
    let r = window_radius as isize;

    let mut positions = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    let mut values = Vec::with_capacity(positions.capacity());
    for y in row - r..=row + r {
        for x in col - r..=col + r {
            let v = surface.get(x.rem_euclid(width) as usize, y.rem_euclid(height) as usize);
            positions.push((x as f64, y as f64));
            values.push(v);
        }
    }

    let floor = values.iter().copied().fold(f64::INFINITY, f64::min);
    for v in values.iter_mut() {
        *v -= floor;
    }
    let mut peak_index = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[peak_index] {
            peak_index = i;
        }
    }
    let peak = values[peak_index];
    if !(peak.is_finite() && peak > 0.0) {
        return Err(AlignError::InvalidInput(
            "correlation window is flat around the peak".to_string(),
        ));
    }
    for v in values.iter_mut() {
        *v /= peak;
    }

    let (x_start, y_start) = positions[peak_index];
    let initial = [1.0, x_start, y_start, sigma_guess, sigma_guess, 0.0];
    let bounds = Bounds {
        lower: vec![0.0, f64::NEG_INFINITY, f64::NEG_INFINITY, 0.05, 0.05, -PI],
        upper: vec![f64::INFINITY, f64::INFINITY, f64::INFINITY, f64::INFINITY, f64::INFINITY, PI],
    };

    let window = PeakWindow { positions, values };
    let outcome = solver.fit(&window, &initial, Some(&bounds));
    if !outcome.converged || outcome.params.iter().any(|p| !p.is_finite()) {
        return Err(AlignError::FitDidNotConverge {
            iterations: outcome.iterations,
        });
    }

    let params = outcome.params;
    let offset = Vector2::new(
        params[1] - (surface.width / 2) as f64,
        params[2] - (surface.height / 2) as f64,
    );
    tracing::debug!(
        "peak fit: offset=({:.4}, {:.4}) sigma=({:.3}, {:.3}) after {} iterations",
        offset.x,
        offset.y,
        params[3],
        params[4],
        outcome.iterations
    );

    Ok(PeakFit {
        offset,
        amplitude: params[0] * peak,
        sigma_x: params[3],
        sigma_y: params[4],
        theta: params[5],
        iterations: outcome.iterations,
    })
}
