use crate::error::{AlignError, Result};
use nalgebra::{Matrix2, Vector2};

/// Arcseconds per degree, the unit conversion applied to WCS scale matrices.
pub const ARCSEC_PER_DEGREE: f64 = 3600.0;

/// Row-major 2-D grid of samples
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl ImageData {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != width * height {
            return Err(AlignError::InvalidInput(format!(
                "data size mismatch: expected {} pixels, got {}",
                width * height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: usize, height: usize, value: f64) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// (height, width), the numpy-style shape
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Bilinear sample at a fractional position, `None` outside the grid.
    pub fn sample(&self, x: f64, y: f64) -> Option<f64> {
        let max_x = self.width.checked_sub(1)? as f64;
        let max_y = self.height.checked_sub(1)? as f64;
        if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
            return None;
        }

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let dx = x - x0 as f64;
        let dy = y - y0 as f64;

        let v00 = self.get(x0, y0);
        let v10 = self.get(x1, y0);
        let v01 = self.get(x0, y1);
        let v11 = self.get(x1, y1);
        Some(
            v00 * (1.0 - dx) * (1.0 - dy)
                + v10 * dx * (1.0 - dy)
                + v01 * (1.0 - dx) * dy
                + v11 * dx * dy,
        )
    }

    /// Same-size image whose pixel `p` holds this image at `p + offset`.
    /// Pixels that fall outside the source are NaN.
    pub fn translated(&self, offset: Vector2<f64>) -> Self {
        Self::from_fn(self.width, self.height, |x, y| {
            self.sample(x as f64 + offset.x, y as f64 + offset.y)
                .unwrap_or(f64::NAN)
        })
    }

    /// Drop `border` pixels on every edge.
    pub fn trimmed(&self, border: usize) -> Result<Self> {
        let width = self.width.saturating_sub(2 * border);
        let height = self.height.saturating_sub(2 * border);
        if width == 0 || height == 0 {
            return Err(AlignError::EmptyImage {
                width: self.width,
                height: self.height,
                border,
            });
        }

        let mut data = Vec::with_capacity(width * height);
        for y in border..border + height {
            let start = y * self.width + border;
            data.extend_from_slice(&self.data[start..start + width]);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

/// Linear world-coordinate mapping of an image.
///
/// `cd` maps a pixel offset from `crpix` to an angular offset in degrees,
/// rotation and axis flips included (the FITS `CD` matrix, or `PC * CDELT`).
#[derive(Debug, Clone, PartialEq)]
pub struct LinearWcs {
    /// Reference pixel (CRPIX1, CRPIX2)
    pub crpix: Vector2<f64>,
    /// Sky position of the reference pixel in degrees (CRVAL1, CRVAL2)
    pub crval: Vector2<f64>,
    /// Pixel-to-angle matrix in degrees per pixel
    pub cd: Matrix2<f64>,
}

impl LinearWcs {
    pub fn new(crpix: Vector2<f64>, crval: Vector2<f64>, cd: Matrix2<f64>) -> Self {
        Self { crpix, crval, cd }
    }

    /// Build from per-axis increments and a CROTA2-style rotation in degrees.
    pub fn from_cdelt(
        crpix: Vector2<f64>,
        crval: Vector2<f64>,
        cdelt: Vector2<f64>,
        rotation_deg: f64,
    ) -> Self {
        let (sin_r, cos_r) = rotation_deg.to_radians().sin_cos();
        let cd = Matrix2::new(
            cdelt.x * cos_r,
            -cdelt.y * sin_r,
            cdelt.x * sin_r,
            cdelt.y * cos_r,
        );
        Self { crpix, crval, cd }
    }

    /// Pixel-to-angle matrix in arcseconds per pixel.
    pub fn arcsec_matrix(&self) -> Matrix2<f64> {
        self.cd * ARCSEC_PER_DEGREE
    }

    /// Copy with the reference pixel translated by `delta`.
    pub fn with_crpix_offset(&self, delta: Vector2<f64>) -> Self {
        Self {
            crpix: self.crpix + delta,
            ..self.clone()
        }
    }
}

/// One observed image with its coordinate mapping and observation date.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub image: ImageData,
    pub wcs: LinearWcs,
    /// DATE-OBS as supplied by the caller, used only as a table key
    pub date_obs: String,
}

impl Exposure {
    pub fn new(image: ImageData, wcs: LinearWcs, date_obs: impl Into<String>) -> Self {
        Self {
            image,
            wcs,
            date_obs: date_obs.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(ImageData::new(3, 3, vec![0.0; 8]).is_err());
        assert!(ImageData::new(3, 3, vec![0.0; 9]).is_ok());
    }

    #[test]
    fn test_trimmed_keeps_interior() {
        let image = ImageData::from_fn(5, 4, |x, y| (y * 10 + x) as f64);
        let inner = image.trimmed(1).unwrap();
        assert_eq!(inner.shape(), (2, 3));
        assert_eq!(inner.data, vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_trimmed_to_nothing_is_empty_image() {
        let image = ImageData::filled(10, 10, 1.0);
        assert!(matches!(
            image.trimmed(5),
            Err(AlignError::EmptyImage { border: 5, .. })
        ));
    }

    #[test]
    fn test_translated_ramp_is_exact() {
        let ramp = ImageData::from_fn(6, 5, |x, y| 2.0 * x as f64 + 10.0 * y as f64);
        let moved = ramp.translated(Vector2::new(1.5, -0.25));
        assert!((moved.get(2, 3) - (2.0 * 3.5 + 10.0 * 2.75)).abs() < 1e-12);
        assert!((moved.get(0, 1) - (2.0 * 1.5 + 10.0 * 0.75)).abs() < 1e-12);
        // Reads past the last column or above the first row
        assert!(moved.get(5, 2).is_nan());
        assert!(moved.get(1, 0).is_nan());

        assert_eq!(ramp.translated(Vector2::zeros()), ramp);
        assert_eq!(ramp.sample(5.0, 4.0), Some(50.0));
        assert_eq!(ramp.sample(-0.1, 0.0), None);
    }

    #[test]
    fn test_from_cdelt_rotation() {
        let wcs = LinearWcs::from_cdelt(
            Vector2::new(10.0, 10.0),
            Vector2::new(150.0, 2.0),
            Vector2::new(-0.2 / 3600.0, 0.2 / 3600.0),
            90.0,
        );
        let m = wcs.arcsec_matrix();
        assert!(m[(0, 0)].abs() < 1e-12);
        assert!((m[(0, 1)] + 0.2).abs() < 1e-12);
        assert!((m[(1, 0)] + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_with_crpix_offset_leaves_source_untouched() {
        let wcs = LinearWcs::new(
            Vector2::new(5.0, 6.0),
            Vector2::zeros(),
            Matrix2::identity(),
        );
        let moved = wcs.with_crpix_offset(Vector2::new(-1.5, 2.0));
        assert_eq!(moved.crpix, Vector2::new(3.5, 8.0));
        assert_eq!(wcs.crpix, Vector2::new(5.0, 6.0));
    }
}
