//! End-to-end alignment of synthetic star fields with known offsets.

use crate::config::AlignConfig;
use crate::image::{Exposure, ImageData, LinearWcs};
use crate::ledger::{ExposureState, OffsetLedger};
use crate::pipeline::{measure_offset, run, OnExposureGrid};
use nalgebra::{Matrix2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) const FIELD_SIZE: usize = 96;

/// (x, y, amplitude) of the synthetic stars, well separated
const STARS: [(f64, f64, f64); 7] = [
    (20.3, 21.7, 2500.0),
    (55.1, 17.4, 1200.0),
    (80.6, 33.2, 3000.0),
    (24.8, 58.9, 900.0),
    (58.2, 52.5, 1800.0),
    (77.4, 75.1, 1400.0),
    (38.7, 80.3, 2200.0),
];
const STAR_SIGMA: f64 = 1.6;

/// Star field on a tilted background sampled at `p + shift`, so the field
/// built with `shift = d` is offset by `d` from the one built with zero.
pub(crate) fn star_field(shift: Vector2<f64>, seed: u64) -> ImageData {
    let mut rng = StdRng::seed_from_u64(seed);
    ImageData::from_fn(FIELD_SIZE, FIELD_SIZE, |x, y| {
        let px = x as f64 + shift.x;
        let py = y as f64 + shift.y;
        let stars: f64 = STARS
            .iter()
            .map(|&(sx, sy, amp)| {
                let r2 = (px - sx).powi(2) + (py - sy).powi(2);
                amp * (-r2 / (2.0 * STAR_SIGMA * STAR_SIGMA)).exp()
            })
            .sum();
        100.0 + 0.3 * px + 0.2 * py + stars + rng.gen_range(-1.0..1.0)
    })
}

pub(crate) fn test_config() -> AlignConfig {
    AlignConfig {
        border: 8,
        subim_window: 8,
        ..AlignConfig::default()
    }
}

/// 0.2 arcsec pixels, east to the left
pub(crate) fn test_exposure(image: ImageData, date_obs: &str) -> Exposure {
    let wcs = LinearWcs::new(
        Vector2::new(48.0, 48.0),
        Vector2::new(150.1, 2.2),
        Matrix2::new(-0.2, 0.0, 0.0, 0.2) / 3600.0,
    );
    Exposure::new(image, wcs, date_obs)
}

#[test]
fn test_recovers_fractional_shift() {
    let config = test_config();
    let reference = star_field(Vector2::zeros(), 1);
    for (shift, seed) in [(Vector2::new(3.0, -2.5), 2), (Vector2::new(-4.3, 1.7), 3)] {
        let exposure = star_field(shift, seed);
        let offset = measure_offset(&exposure, &reference, &config).unwrap();
        assert!(
            (offset - shift).norm() < 0.1,
            "expected {shift}, measured {offset}"
        );
    }
}

#[test]
fn test_identical_fields_have_zero_offset() {
    let config = test_config();
    let reference = star_field(Vector2::zeros(), 4);
    let offset = measure_offset(&reference, &reference, &config).unwrap();
    assert!(offset.norm() < 0.05, "{offset}");
}

#[test]
fn test_ledger_total_and_table_round_trip() {
    let config = test_config();
    let shift = Vector2::new(3.0, -2.5);
    let exposures = vec![test_exposure(star_field(shift, 5), "2023-03-01T02:00:00.000")];
    let references = vec![star_field(Vector2::zeros(), 6)];

    let grid = OnExposureGrid::new(&exposures, &references).unwrap();
    let run = run(&exposures, &references, &grid, &config).unwrap();
    assert!(run.failures.is_empty());
    let ledger = run.ledger;
    let record = ledger.record(0).unwrap();
    assert!((record.total_pixel - shift).norm() < 0.1, "{}", record.total_pixel);
    assert_eq!(record.total_pixel, record.cross_pixel);
    assert_eq!(ledger.state(0).unwrap(), ExposureState::Normalized);

    // Shifting moves the reference pixel against the offset
    let shifted = ledger.clone().shift(0, &exposures[0]).unwrap();
    assert!((shifted.wcs.crpix - Vector2::new(45.0, 50.5)).norm() < 0.1);

    // Same tilted background on both sides: unit scale
    let scale = ledger.normalization(0).unwrap().unwrap().scale();
    assert!((scale - 1.0).abs() < 0.05, "scale {scale}");

    let rebuilt = OffsetLedger::from_table(&exposures, &ledger.to_table()).unwrap();
    let restored = rebuilt.record(0).unwrap();
    assert!((restored.total_arcsec - record.total_arcsec).norm() < 1e-9);
    assert_eq!(rebuilt.normalization(0).unwrap(), ledger.normalization(0).unwrap());
}

#[test]
fn test_extra_offset_adds_to_measured_shift() {
    let config = AlignConfig {
        extra_arcsec: [0.2, 0.0],
        ..test_config()
    };
    let shift = Vector2::new(-2.0, 1.25);
    let exposures = vec![test_exposure(star_field(shift, 7), "2023-03-01T03:00:00.000")];
    let references = vec![star_field(Vector2::zeros(), 8)];

    let grid = OnExposureGrid::new(&exposures, &references).unwrap();
    let run = run(&exposures, &references, &grid, &config).unwrap();
    let record = run.ledger.record(0).unwrap();
    // 0.2 arcsec along a -0.2 arcsec/pixel axis is one pixel back
    assert!((record.extra_pixel - Vector2::new(-1.0, 0.0)).norm() < 1e-9);
    assert!((record.total_pixel - (shift + Vector2::new(-1.0, 0.0))).norm() < 0.1);
}

#[test]
fn test_normalize_against_rescaled_reference() {
    let config = test_config();
    let exposure = test_exposure(star_field(Vector2::new(1.0, 1.0), 9), "2023-03-01T04:00:00.000");
    let reference_on_grid = exposure.image.map(|v| 2.0 * (v + 5.0));

    let mut ledger = OffsetLedger::new(std::slice::from_ref(&exposure));
    ledger.record_cross_correlation(0, Vector2::new(1.0, 1.0)).unwrap();
    ledger
        .set_initial_guess(&crate::config::InitialGuessMode::CrossCorrelation)
        .unwrap();
    let record = ledger
        .normalize(0, &exposure, &reference_on_grid, &config)
        .unwrap();

    assert!((record.b1 - 2.0).abs() < 1e-6, "b1 {}", record.b1);
    assert!((record.b0 - 5.0).abs() < 1e-4, "b0 {}", record.b0);
    assert_eq!(ledger.state(0).unwrap(), ExposureState::Normalized);
}
