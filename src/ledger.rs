//! Per-exposure bookkeeping of measured, supplied and total offsets.
//!
//! Every exposure walks through [`ExposureState`] in order. Offsets are kept
//! in pixels and arcseconds side by side; the arcsecond value is always
//! derived with the matrix of the exposure itself.

use crate::config::{AlignConfig, InitialGuessMode};
use crate::coords::{arcsec_to_pixel, pixel_to_arcsec};
use crate::error::{AlignError, Result};
use crate::image::{Exposure, ImageData, LinearWcs, ARCSEC_PER_DEGREE};
use crate::normalize::{self, NormalizationRecord};
use crate::preprocess;
use crate::table::{OffsetRow, OffsetTable};
use nalgebra::Vector2;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExposureState {
    Uninitialized,
    CrossCorrelated,
    InitialGuessSet,
    ShiftApplied,
    Normalized,
}

/// User offset added on top of the initial guess
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtraOffset {
    Pixel(Vector2<f64>),
    Arcsec(Vector2<f64>),
}

/// Offsets of one exposure, (x, y) ordered
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetRecord {
    pub cross_pixel: Vector2<f64>,
    pub extra_pixel: Vector2<f64>,
    pub init_pixel: Vector2<f64>,
    pub total_pixel: Vector2<f64>,
    pub cross_arcsec: Vector2<f64>,
    pub extra_arcsec: Vector2<f64>,
    pub init_arcsec: Vector2<f64>,
    pub total_arcsec: Vector2<f64>,
}

impl OffsetRecord {
    pub fn zeroed() -> Self {
        Self {
            cross_pixel: Vector2::zeros(),
            extra_pixel: Vector2::zeros(),
            init_pixel: Vector2::zeros(),
            total_pixel: Vector2::zeros(),
            cross_arcsec: Vector2::zeros(),
            extra_arcsec: Vector2::zeros(),
            init_arcsec: Vector2::zeros(),
            total_arcsec: Vector2::zeros(),
        }
    }

    pub fn with_cross(self, pixel: Vector2<f64>, wcs: &LinearWcs) -> Self {
        Self {
            cross_pixel: pixel,
            cross_arcsec: pixel_to_arcsec(wcs, pixel),
            ..self
        }
    }

    pub fn with_init_pixel(self, pixel: Vector2<f64>, wcs: &LinearWcs) -> Self {
        Self {
            init_pixel: pixel,
            init_arcsec: pixel_to_arcsec(wcs, pixel),
            ..self
        }
        .with_totals(wcs)
    }

    pub fn with_init_arcsec(self, arcsec: Vector2<f64>, wcs: &LinearWcs) -> Result<Self> {
        let pixel = arcsec_to_pixel(wcs, arcsec)?;
        Ok(Self {
            init_pixel: pixel,
            init_arcsec: arcsec,
            ..self
        }
        .with_totals(wcs))
    }

    pub fn with_extra_pixel(self, pixel: Vector2<f64>, wcs: &LinearWcs) -> Self {
        Self {
            extra_pixel: pixel,
            extra_arcsec: pixel_to_arcsec(wcs, pixel),
            ..self
        }
        .with_totals(wcs)
    }

    pub fn with_extra_arcsec(self, arcsec: Vector2<f64>, wcs: &LinearWcs) -> Result<Self> {
        let pixel = arcsec_to_pixel(wcs, arcsec)?;
        Ok(Self {
            extra_pixel: pixel,
            extra_arcsec: arcsec,
            ..self
        }
        .with_totals(wcs))
    }

    /// Totals are summed in pixels and converted once, so they never drift
    /// from the pixel sum.
    fn with_totals(self, wcs: &LinearWcs) -> Self {
        let total_pixel = self.init_pixel + self.extra_pixel;
        Self {
            total_pixel,
            total_arcsec: pixel_to_arcsec(wcs, total_pixel),
            ..self
        }
    }
}

/// Offsets, states and flux calibration of a batch of exposures
#[derive(Debug, Clone)]
pub struct OffsetLedger {
    wcs: Vec<LinearWcs>,
    date_obs: Vec<String>,
    records: Vec<OffsetRecord>,
    states: Vec<ExposureState>,
    normalization: Vec<Option<NormalizationRecord>>,
}

impl OffsetLedger {
    pub fn new(exposures: &[Exposure]) -> Self {
        let n = exposures.len();
        Self {
            wcs: exposures.iter().map(|e| e.wcs.clone()).collect(),
            date_obs: exposures.iter().map(|e| e.date_obs.clone()).collect(),
            records: vec![OffsetRecord::zeroed(); n],
            states: vec![ExposureState::Uninitialized; n],
            normalization: vec![None; n],
        }
    }

    /// Rebuild a ledger from a saved table, matching rows by DATE_OBS.
    ///
    /// The saved totals become the initial guesses and the saved flux
    /// relation is restored. Every exposure needs a row.
    pub fn from_table(exposures: &[Exposure], table: &OffsetTable) -> Result<Self> {
        let mut ledger = Self::new(exposures);
        for (i, exposure) in exposures.iter().enumerate() {
            let row = table.find(&exposure.date_obs).ok_or_else(|| {
                AlignError::TableSchemaError(format!(
                    "no row with DATE_OBS {} for exposure {}",
                    exposure.date_obs, i
                ))
            })?;

            let cross_pixel = arcsec_to_pixel(
                &exposure.wcs,
                degrees_to_arcsec(row.ra_cross_offset, row.dec_cross_offset),
            )?;
            ledger.records[i] = OffsetRecord::zeroed()
                .with_cross(cross_pixel, &exposure.wcs)
                .with_init_arcsec(degrees_to_arcsec(row.ra_offset, row.dec_offset), &exposure.wcs)?;
            ledger.normalization[i] = Some(NormalizationRecord {
                b0: row.flux_offset.unwrap_or(0.0),
                b1: row.flux_scale,
            });
            ledger.states[i] = ExposureState::InitialGuessSet;
        }
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, index: usize) -> Result<&OffsetRecord> {
        self.check_index(index)?;
        Ok(&self.records[index])
    }

    pub fn state(&self, index: usize) -> Result<ExposureState> {
        self.check_index(index)?;
        Ok(self.states[index])
    }

    pub fn normalization(&self, index: usize) -> Result<Option<NormalizationRecord>> {
        self.check_index(index)?;
        Ok(self.normalization[index])
    }

    /// Store the refined cross-correlation offset of exposure `index`.
    pub fn record_cross_correlation(&mut self, index: usize, offset: Vector2<f64>) -> Result<()> {
        self.check_index(index)?;
        self.records[index] = self.records[index].with_cross(offset, &self.wcs[index]);
        self.states[index] = self.states[index].max(ExposureState::CrossCorrelated);
        tracing::info!(
            "exposure {}: cross-correlation offset ({:.4}, {:.4}) px = ({:.4}, {:.4}) arcsec",
            index,
            offset.x,
            offset.y,
            self.records[index].cross_arcsec.x,
            self.records[index].cross_arcsec.y
        );
        Ok(())
    }

    /// Set the initial offset of every cross-correlated exposure and
    /// recompute its totals. Exposures still `Uninitialized` (no offset
    /// measured) are left untouched and stay out of the table.
    ///
    /// A missing or unreadable table, or an exposure without a matching row,
    /// falls back to a zero guess. A table lacking required columns is an
    /// error.
    pub fn set_initial_guess(&mut self, mode: &InitialGuessMode) -> Result<()> {
        let measured: Vec<usize> = (0..self.len())
            .filter(|&i| self.states[i] >= ExposureState::CrossCorrelated)
            .collect();
        if measured.is_empty() && !self.is_empty() {
            return Err(AlignError::LedgerState {
                index: 0,
                state: self.states[0],
                operation: "set an initial guess without any measured exposure",
            });
        }
        for index in (0..self.len()).filter(|i| !measured.contains(i)) {
            tracing::warn!("exposure {}: no measured offset, left out of the initial guess", index);
        }

        match mode {
            InitialGuessMode::CrossCorrelation => {
                for &index in &measured {
                    let cross = self.records[index].cross_pixel;
                    self.records[index] = self.records[index].with_init_pixel(cross, &self.wcs[index]);
                }
            }
            InitialGuessMode::FromTable(path) => {
                let table = match OffsetTable::load(path) {
                    Ok(table) => table,
                    Err(
                        e @ (AlignError::MissingTable(_)
                        | AlignError::UnreadableTable { .. }
                        | AlignError::Io(_)),
                    ) => {
                        tracing::warn!("{}; initial offsets set to zero", e);
                        OffsetTable::default()
                    }
                    Err(e) => return Err(e),
                };
                for &index in &measured {
                    let arcsec = match table.find(&self.date_obs[index]) {
                        Some(row) => degrees_to_arcsec(row.ra_offset, row.dec_offset),
                        None => {
                            if !table.rows.is_empty() {
                                tracing::warn!(
                                    "exposure {}: DATE_OBS {} not in {}, initial offset set to zero",
                                    index,
                                    self.date_obs[index],
                                    path.display()
                                );
                            }
                            Vector2::zeros()
                        }
                    };
                    self.records[index] =
                        self.records[index].with_init_arcsec(arcsec, &self.wcs[index])?;
                }
            }
        }

        // Flux fits made with the old offsets are stale
        for &index in &measured {
            self.states[index] = ExposureState::InitialGuessSet;
            self.normalization[index] = None;
        }
        Ok(())
    }

    /// Set the user offset of exposure `index` and move it to `ShiftApplied`.
    /// Applying the same offset twice leaves the record unchanged; changing
    /// it drops the flux fit made with the previous offset.
    pub fn apply_extra_offset(&mut self, index: usize, extra: ExtraOffset) -> Result<()> {
        self.require(index, ExposureState::InitialGuessSet, "apply an extra offset")?;
        let wcs = &self.wcs[index];
        let record = self.records[index];
        let updated = match extra {
            ExtraOffset::Pixel(pixel) => record.with_extra_pixel(pixel, wcs),
            ExtraOffset::Arcsec(arcsec) => record.with_extra_arcsec(arcsec, wcs)?,
        };
        if updated != record {
            self.normalization[index] = None;
            self.states[index] = ExposureState::ShiftApplied;
        } else {
            self.states[index] = self.states[index].max(ExposureState::ShiftApplied);
        }
        self.records[index] = updated;
        Ok(())
    }

    /// Copy of `exposure` with its reference pixel moved by the total offset.
    pub fn shift(&mut self, index: usize, exposure: &Exposure) -> Result<Exposure> {
        self.require(index, ExposureState::InitialGuessSet, "shift")?;
        let total = self.records[index].total_pixel;
        self.states[index] = self.states[index].max(ExposureState::ShiftApplied);
        Ok(Exposure {
            image: exposure.image.clone(),
            wcs: exposure.wcs.with_crpix_offset(-total),
            date_obs: exposure.date_obs.clone(),
        })
    }

    /// Fit the flux relation of the shifted exposure against `reference`,
    /// which must already be sampled on the shifted exposure grid.
    pub fn normalize(
        &mut self,
        index: usize,
        exposure: &Exposure,
        reference: &ImageData,
        config: &AlignConfig,
    ) -> Result<NormalizationRecord> {
        let shifted = self.shift(index, exposure)?;
        let exposure_filtered =
            preprocess::filter_median(&shifted.image, config.border, config.filter_size)?;
        let reference_filtered =
            preprocess::filter_median(reference, config.border, config.filter_size)?;
        let fit = normalize::fit(&exposure_filtered, &reference_filtered, config.chunk_size)?;

        tracing::info!(
            "exposure {}: flux scale {:.5}, offset {:.5} from {} chunks",
            index,
            fit.record.b1,
            fit.record.b0,
            fit.x.len()
        );
        self.normalization[index] = Some(fit.record);
        self.date_obs[index] = exposure.date_obs.clone();
        self.states[index] = ExposureState::Normalized;
        Ok(fit.record)
    }

    /// Rows for every exposure with an initial guess. Exposures whose
    /// offset was never measured are left out.
    pub fn to_table(&self) -> OffsetTable {
        let rows = (0..self.len())
            .filter(|&i| self.states[i] >= ExposureState::InitialGuessSet)
            .map(|i| {
                let record = &self.records[i];
                let normalization = self.normalization[i];
                OffsetRow {
                    ra_offset: record.total_arcsec.x / ARCSEC_PER_DEGREE,
                    dec_offset: record.total_arcsec.y / ARCSEC_PER_DEGREE,
                    ra_cross_offset: record.cross_arcsec.x / ARCSEC_PER_DEGREE,
                    dec_cross_offset: record.cross_arcsec.y / ARCSEC_PER_DEGREE,
                    flux_scale: normalization.map_or(1.0, |n| n.scale()),
                    date_obs: self.date_obs[i].clone(),
                    flux_offset: normalization.map(|n| n.b0),
                    ra_offset_orig: None,
                    dec_offset_orig: None,
                }
            })
            .collect();
        OffsetTable::new(rows)
    }

    /// Per-exposure totals, arcsec then pixels
    pub fn summary(&self) -> String {
        let mut out = String::from("Total in ARCSEC\n");
        for (i, record) in self.records.iter().enumerate() {
            if self.states[i] == ExposureState::Uninitialized {
                let _ = writeln!(out, "    Image {:02}: not measured", i);
            } else {
                let _ = writeln!(
                    out,
                    "    Image {:02}: {:8.4} {:8.4}",
                    i, record.total_arcsec.x, record.total_arcsec.y
                );
            }
        }
        out.push_str("Total in PIXEL\n");
        for (i, record) in self.records.iter().enumerate() {
            if self.states[i] == ExposureState::Uninitialized {
                let _ = writeln!(out, "    Image {:02}: not measured", i);
            } else {
                let _ = writeln!(
                    out,
                    "    Image {:02}: {:8.4} {:8.4}",
                    i, record.total_pixel.x, record.total_pixel.y
                );
            }
        }
        out
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.len() {
            return Err(AlignError::IndexOutOfRange {
                index,
                count: self.len(),
            });
        }
        Ok(())
    }

    fn require(&self, index: usize, minimum: ExposureState, operation: &'static str) -> Result<()> {
        self.check_index(index)?;
        let state = self.states[index];
        if state < minimum {
            return Err(AlignError::LedgerState {
                index,
                state,
                operation,
            });
        }
        Ok(())
    }
}

fn degrees_to_arcsec(ra: f64, dec: f64) -> Vector2<f64> {
    Vector2::new(ra, dec) * ARCSEC_PER_DEGREE
}
