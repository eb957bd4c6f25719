//! Batch alignment: per-exposure measurement fanned out over a thread pool,
//! followed by sequential bookkeeping in the ledger.

use crate::config::AlignConfig;
use crate::correlate::correlate;
use crate::error::{AlignError, Result};
use crate::image::{Exposure, ImageData, LinearWcs};
use crate::ledger::{ExposureState, ExtraOffset, OffsetLedger};
use crate::normalize::NormalizationRecord;
use crate::peak_fit::refine;
use crate::preprocess::prepare;
use nalgebra::Vector2;
use rayon::prelude::*;

/// Outcome of a full alignment run
#[derive(Debug)]
pub struct AlignmentRun {
    pub ledger: OffsetLedger,
    /// Exposures that failed a step, with the error that stopped them
    pub failures: Vec<(usize, AlignError)>,
}

/// Offset of `exposure` relative to `reference` (same grid), in pixels.
pub fn measure_offset(
    exposure: &ImageData,
    reference: &ImageData,
    config: &AlignConfig,
) -> Result<Vector2<f64>> {
    let reference = prepare(
        reference,
        config.dynamic_range,
        config.median_window,
        config.border,
    )?;
    let target = prepare(
        exposure,
        config.dynamic_range,
        config.median_window,
        config.border,
    )?;
    let correlation = correlate(&reference, &target)?;
    let fit = refine(
        &correlation.surface,
        correlation.peak,
        config.subim_window,
        config.peak_sigma_guess,
    )?;
    Ok(fit.offset)
}

/// Measure every exposure against its reference in parallel. Results come
/// back in exposure order.
pub fn measure_offsets(
    exposures: &[Exposure],
    references: &[ImageData],
    config: &AlignConfig,
) -> Result<Vec<Result<Vector2<f64>>>> {
    check_pairs(exposures, references)?;
    Ok((0..exposures.len())
        .into_par_iter()
        .map(|i| measure_offset(&exposures[i].image, &references[i], config))
        .collect())
}

/// Supplies the reference of exposure `index` resampled onto the grid of
/// its shifted copy, as produced by [`OffsetLedger::shift`].
pub trait Reproject {
    fn reproject(&self, index: usize, shifted: &Exposure) -> Result<ImageData>;
}

/// References sampled on the unshifted exposure grids.
///
/// Shifting only moves the reference pixel, so pixel `p` of the shifted
/// copy sees the sky of pixel `p + t` on the original grid, where `t` is
/// how far the reference pixel moved back.
#[derive(Debug)]
pub struct OnExposureGrid<'a> {
    references: &'a [ImageData],
    grids: Vec<LinearWcs>,
}

impl<'a> OnExposureGrid<'a> {
    pub fn new(exposures: &[Exposure], references: &'a [ImageData]) -> Result<Self> {
        check_pairs(exposures, references)?;
        Ok(Self {
            references,
            grids: exposures.iter().map(|e| e.wcs.clone()).collect(),
        })
    }
}

impl Reproject for OnExposureGrid<'_> {
    fn reproject(&self, index: usize, shifted: &Exposure) -> Result<ImageData> {
        let (reference, grid) = self
            .references
            .get(index)
            .zip(self.grids.get(index))
            .ok_or(AlignError::IndexOutOfRange {
                index,
                count: self.references.len(),
            })?;
        if reference.shape() != shifted.image.shape() {
            return Err(AlignError::ShapeMismatch {
                expected: shifted.image.shape(),
                found: reference.shape(),
            });
        }
        Ok(reference.translated(grid.crpix - shifted.wcs.crpix))
    }
}

/// Measure, take the initial guess, add the configured extra offset and
/// normalize the flux of every exposure.
///
/// `references` are compared with the exposures as loaded; `reproject`
/// provides the references for the flux fit once each exposure is shifted.
/// An exposure whose offset cannot be measured stays `Uninitialized`, is
/// listed in `failures` and is skipped by every later step.
pub fn run(
    exposures: &[Exposure],
    references: &[ImageData],
    reproject: &dyn Reproject,
    config: &AlignConfig,
) -> Result<AlignmentRun> {
    config.validate()?;
    let mut ledger = OffsetLedger::new(exposures);
    let mut failures = Vec::new();

    tracing::info!("measuring offsets of {} exposures", exposures.len());
    for (i, result) in measure_offsets(exposures, references, config)?
        .into_iter()
        .enumerate()
    {
        match result {
            Ok(offset) => ledger.record_cross_correlation(i, offset)?,
            Err(e) => {
                tracing::error!("exposure {}: offset measurement failed: {}", i, e);
                failures.push((i, e));
            }
        }
    }
    if failures.len() == exposures.len() {
        return Ok(AlignmentRun { ledger, failures });
    }

    ledger.set_initial_guess(&config.first_guess)?;
    let extra = Vector2::new(config.extra_arcsec[0], config.extra_arcsec[1]);
    for i in 0..ledger.len() {
        if ledger.state(i)? >= ExposureState::InitialGuessSet {
            ledger.apply_extra_offset(i, ExtraOffset::Arcsec(extra))?;
        }
    }

    for (i, result) in normalize_all(&mut ledger, exposures, reproject, config)? {
        if let Err(e) = result {
            failures.push((i, e));
        }
    }

    Ok(AlignmentRun { ledger, failures })
}

/// Flux-normalize every exposure that has an initial guess against its
/// reference on the shifted grid. Results are keyed by exposure index.
pub fn normalize_all(
    ledger: &mut OffsetLedger,
    exposures: &[Exposure],
    reproject: &dyn Reproject,
    config: &AlignConfig,
) -> Result<Vec<(usize, Result<NormalizationRecord>)>> {
    if ledger.len() != exposures.len() {
        return Err(AlignError::InvalidInput(format!(
            "ledger holds {} exposures, {} given",
            ledger.len(),
            exposures.len()
        )));
    }

    let mut results = Vec::with_capacity(exposures.len());
    for (i, exposure) in exposures.iter().enumerate() {
        if ledger.state(i)? < ExposureState::InitialGuessSet {
            continue;
        }
        let result = ledger
            .shift(i, exposure)
            .and_then(|shifted| reproject.reproject(i, &shifted))
            .and_then(|reference| ledger.normalize(i, exposure, &reference, config))
            .inspect_err(|e| tracing::error!("exposure {}: normalization failed: {}", i, e));
        results.push((i, result));
    }
    Ok(results)
}

fn check_pairs(exposures: &[Exposure], references: &[ImageData]) -> Result<()> {
    if exposures.len() != references.len() {
        return Err(AlignError::InvalidInput(format!(
            "{} exposures but {} references",
            exposures.len(),
            references.len()
        )));
    }
    Ok(())
}
