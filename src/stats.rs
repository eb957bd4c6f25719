//! Robust statistics and chunked per-tile estimators.

use crate::error::{AlignError, Result};
use crate::image::ImageData;
use bumpalo::Bump;

/// Constant to make MAD comparable to stddev under Gaussian noise
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of the finite values, averaging the two middle elements for
/// even counts. NaN when no finite value is present.
pub fn median(values: &[f64]) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    median_in_place(&mut finite)
}

/// Median of an already finite buffer; reorders the buffer.
fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// MAD-based robust sigma of the finite values.
pub fn mad_std(values: &[f64]) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    mad_std_in_place(&mut finite)
}

fn mad_std_in_place(values: &mut [f64]) -> f64 {
    let center = median_in_place(values);
    if center.is_nan() {
        return f64::NAN;
    }
    for v in values.iter_mut() {
        *v = (*v - center).abs();
    }
    median_in_place(values) * MAD_TO_SIGMA
}

/// Percentile (0-100) with linear interpolation between order statistics.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = pct.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Per-chunk medians and robust scales for a set of same-shape images.
///
/// `medians[k][c]` and `scales[k][c]` belong to image `k`, chunk `c`; chunks
/// are numbered row-major over the tile grid.
#[derive(Debug, Clone)]
pub struct ChunkStatistics {
    pub medians: Vec<Vec<f64>>,
    pub scales: Vec<Vec<f64>>,
    pub chunks_x: usize,
    pub chunks_y: usize,
}

impl ChunkStatistics {
    pub fn chunk_count(&self) -> usize {
        self.chunks_x * self.chunks_y
    }
}

/// Tile every image into `chunk_size` squares and compute median and MAD
/// sigma per tile. Trailing partial tiles are dropped.
pub fn chunk_stats(images: &[&ImageData], chunk_size: usize) -> Result<ChunkStatistics> {
    let first = images
        .first()
        .ok_or_else(|| AlignError::InvalidInput("no image given to chunk_stats".to_string()))?;
    if chunk_size == 0 {
        return Err(AlignError::InvalidInput("chunk size must be positive".to_string()));
    }
    for image in images.iter().skip(1) {
        if image.shape() != first.shape() {
            return Err(AlignError::ShapeMismatch {
                expected: first.shape(),
                found: image.shape(),
            });
        }
    }

    let chunks_x = first.width / chunk_size;
    let chunks_y = first.height / chunk_size;
    let nchunks = chunks_x * chunks_y;

    let mut medians = vec![Vec::with_capacity(nchunks); images.len()];
    let mut scales = vec![Vec::with_capacity(nchunks); images.len()];

    // Use arena for the per-tile scratch buffer
    let arena = Bump::new();
    let mut tile = bumpalo::collections::Vec::with_capacity_in(chunk_size * chunk_size, &arena);

    for cy in 0..chunks_y {
        for cx in 0..chunks_x {
            for (k, image) in images.iter().enumerate() {
                tile.clear();
                for y in cy * chunk_size..(cy + 1) * chunk_size {
                    let row = y * image.width;
                    tile.extend(
                        image.data[row + cx * chunk_size..row + (cx + 1) * chunk_size]
                            .iter()
                            .copied()
                            .filter(|v| v.is_finite()),
                    );
                }
                medians[k].push(median_in_place(&mut tile));
                scales[k].push(mad_std_in_place(&mut tile));
            }
        }
    }

    Ok(ChunkStatistics {
        medians,
        scales,
        chunks_x,
        chunks_y,
    })
}
