//! Exposure loading from FITS primary HDUs.

use crate::error::{AlignError, Result};
use crate::image::{Exposure, ImageData, LinearWcs};
use fitrs::{Fits, FitsData, FitsDataArray, HeaderValue};
use nalgebra::{Matrix2, Vector2};
use std::path::Path;

/// Load the primary HDU of `path` as an exposure.
///
/// Pixel values are returned in physical units (BSCALE and BZERO applied),
/// blank integer pixels become NaN.
pub fn load_exposure(path: &Path) -> Result<Exposure> {
    let fits = Fits::open(path)?;
    let hdu = fits
        .get(0)
        .ok_or_else(|| AlignError::Fits(format!("no primary HDU in {}", path.display())))?;

    let header = |key: &str| hdu.value(key).and_then(header_number);

    let naxis = header("NAXIS").unwrap_or(0.0) as usize;
    if naxis < 2 {
        return Err(AlignError::Fits(format!(
            "{} has no 2D image data (NAXIS={})",
            path.display(),
            naxis
        )));
    }
    let width = header("NAXIS1")
        .ok_or_else(|| AlignError::Fits("missing NAXIS1 header".to_string()))? as usize;
    let height = header("NAXIS2")
        .ok_or_else(|| AlignError::Fits("missing NAXIS2 header".to_string()))? as usize;
    let bzero = header("BZERO").unwrap_or(0.0);
    let bscale = header("BSCALE").unwrap_or(1.0);

    let data: Vec<f64> = match hdu.read_data() {
        FitsData::Characters(_) => {
            return Err(AlignError::Fits(
                "FITS file contains character data, not image data".to_string(),
            ));
        }
        FitsData::IntegersI32(FitsDataArray { data, .. }) => data
            .into_iter()
            .map(|x| x.map_or(f64::NAN, |v| bzero + bscale * v as f64))
            .collect(),
        FitsData::IntegersU32(FitsDataArray { data, .. }) => data
            .into_iter()
            .map(|x| x.map_or(f64::NAN, |v| bzero + bscale * v as f64))
            .collect(),
        FitsData::FloatingPoint32(FitsDataArray { data, .. }) => data
            .into_iter()
            .map(|x| bzero + bscale * x as f64)
            .collect(),
        FitsData::FloatingPoint64(FitsDataArray { data, .. }) => {
            data.into_iter().map(|x| bzero + bscale * x).collect()
        }
    };

    // Extra axes of a cube are ignored, keep the first plane
    let plane = width * height;
    if data.len() < plane {
        return Err(AlignError::Fits(format!(
            "data size mismatch: expected {} pixels, got {}",
            plane,
            data.len()
        )));
    }
    let image = ImageData::new(width, height, data[..plane].to_vec())?;

    let wcs = wcs_from_header(header)?;
    let date_obs = match hdu.value("DATE-OBS") {
        Some(HeaderValue::CharacterString(s)) => s.trim().to_string(),
        _ => {
            tracing::warn!("{} has no DATE-OBS, table rows cannot be matched", path.display());
            String::new()
        }
    };

    tracing::debug!(
        "loaded {} ({}x{}, DATE-OBS {})",
        path.display(),
        width,
        height,
        date_obs
    );
    Ok(Exposure::new(image, wcs, date_obs))
}

fn header_number(value: &HeaderValue) -> Option<f64> {
    match value {
        HeaderValue::IntegerNumber(n) => Some(*n as f64),
        HeaderValue::RealFloatingNumber(f) => Some(*f),
        _ => None,
    }
}

/// Linear WCS from header keywords, preferring `CDi_j`, then `PCi_j` with
/// `CDELTi`, then `CDELTi` with `CROTA2`.
pub fn wcs_from_header(header: impl Fn(&str) -> Option<f64>) -> Result<LinearWcs> {
    let required = |key: &str| {
        header(key).ok_or_else(|| AlignError::Fits(format!("missing {key} header")))
    };
    let crpix = Vector2::new(required("CRPIX1")?, required("CRPIX2")?);
    let crval = Vector2::new(header("CRVAL1").unwrap_or(0.0), header("CRVAL2").unwrap_or(0.0));

    let cd_keys = ["CD1_1", "CD1_2", "CD2_1", "CD2_2"];
    if cd_keys.iter().any(|k| header(k).is_some()) {
        let cd = cd_keys.map(|k| header(k).unwrap_or(0.0));
        return Ok(LinearWcs::new(
            crpix,
            crval,
            Matrix2::new(cd[0], cd[1], cd[2], cd[3]),
        ));
    }

    let cdelt = Vector2::new(required("CDELT1")?, required("CDELT2")?);
    let pc_keys = ["PC1_1", "PC1_2", "PC2_1", "PC2_2"];
    if pc_keys.iter().any(|k| header(k).is_some()) {
        let identity = [1.0, 0.0, 0.0, 1.0];
        let pc: Vec<f64> = pc_keys
            .iter()
            .zip(identity)
            .map(|(k, default)| header(k).unwrap_or(default))
            .collect();
        let cd = Matrix2::new(
            pc[0] * cdelt.x,
            pc[1] * cdelt.x,
            pc[2] * cdelt.y,
            pc[3] * cdelt.y,
        );
        return Ok(LinearWcs::new(crpix, crval, cd));
    }

    Ok(LinearWcs::from_cdelt(
        crpix,
        crval,
        cdelt,
        header("CROTA2").unwrap_or(0.0),
    ))
}
