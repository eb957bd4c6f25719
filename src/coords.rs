//! Pixel / arcsecond offset conversion through an image's linear WCS.
//!
//! Offsets are 2-vectors ordered (x, y), x running along image columns.
//! A conversion must always use the matrix of the image the offset was
//! measured on.

use crate::error::{AlignError, Result};
use crate::image::LinearWcs;
use nalgebra::{Matrix2, Vector2};

/// Convert a pixel offset to arcseconds: `M * v`.
pub fn pixel_to_arcsec(wcs: &LinearWcs, pixel: Vector2<f64>) -> Vector2<f64> {
    wcs.arcsec_matrix() * pixel
}

/// Convert an arcsecond offset to pixels: `M^-1 * v`.
pub fn arcsec_to_pixel(wcs: &LinearWcs, arcsec: Vector2<f64>) -> Result<Vector2<f64>> {
    Ok(invert_scale(&wcs.arcsec_matrix())? * arcsec)
}

fn invert_scale(matrix: &Matrix2<f64>) -> Result<Matrix2<f64>> {
    let determinant = matrix.determinant();
    let magnitude = matrix.amax();
    if !determinant.is_finite()
        || magnitude == 0.0
        || determinant.abs() <= f64::EPSILON * magnitude * magnitude
    {
        return Err(AlignError::SingularMatrix { determinant });
    }
    matrix
        .try_inverse()
        .ok_or(AlignError::SingularMatrix { determinant })
}
