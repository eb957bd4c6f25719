//! Image cleaning ahead of cross-correlation and flux comparison.

use crate::error::{AlignError, Result};
use crate::image::ImageData;
use crate::stats;

/// Compress the dynamic range, trim the border and remove the smooth
/// background, leaving non-negative compact features for correlation.
pub fn prepare(
    image: &ImageData,
    dynamic_range: f64,
    median_window: usize,
    border: usize,
) -> Result<ImageData> {
    let center = stats::median(&image.data);
    if !center.is_finite() || center == 0.0 {
        return Err(AlignError::InvalidInput(format!(
            "cannot compress dynamic range around a median of {center}"
        )));
    }

    // Squish bright pixels down
    let compressed = image.map(|v| (v / center / dynamic_range).atan());
    let trimmed = compressed.trimmed(border)?;

    let background = median_filter(&trimmed, median_window);
    let data = trimmed
        .data
        .iter()
        .zip(&background.data)
        .map(|(&v, &b)| {
            let residual = v - b;
            if residual.is_finite() && residual > 0.0 {
                residual
            } else {
                0.0
            }
        })
        .collect();

    Ok(ImageData {
        width: trimmed.width,
        height: trimmed.height,
        data,
    })
}

/// Trim the border and apply a small sliding median, without any
/// dynamic-range compression.
pub fn filter_median(image: &ImageData, border: usize, filter_size: usize) -> Result<ImageData> {
    let trimmed = image.trimmed(border)?;
    Ok(median_filter(&trimmed, filter_size))
}

/// Low and high percentiles of the strictly positive pixels inside the border.
pub fn flux_range(
    image: &ImageData,
    border: usize,
    low_pct: f64,
    high_pct: f64,
) -> Result<(f64, f64)> {
    let trimmed = image.trimmed(border)?;
    let positive: Vec<f64> = trimmed
        .data
        .iter()
        .map(|&v| if v.is_finite() { v } else { 0.0 })
        .filter(|&v| v > 0.0)
        .collect();
    if positive.is_empty() {
        return Err(AlignError::NoPositivePixels);
    }
    Ok((
        stats::percentile(&positive, low_pct),
        stats::percentile(&positive, high_pct),
    ))
}

/// Sliding `size x size` median with mirrored edges.
///
/// The window spans `-size/2 .. size - size/2` around each pixel and the
/// element of rank `n/2` among its `n` finite samples is kept, so even
/// sizes pick the upper median. A window without finite samples gives NaN.
pub fn median_filter(image: &ImageData, size: usize) -> ImageData {
    if size <= 1 || image.is_empty() {
        return image.clone();
    }

    let before = (size / 2) as isize;
    let after = (size - size / 2) as isize;
    let mut window = Vec::with_capacity(size * size);
    let mut data = Vec::with_capacity(image.data.len());

    for y in 0..image.height as isize {
        for x in 0..image.width as isize {
            window.clear();
            for wy in y - before..y + after {
                let row = reflect(wy, image.height) * image.width;
                for wx in x - before..x + after {
                    let v = image.data[row + reflect(wx, image.width)];
                    if v.is_finite() {
                        window.push(v);
                    }
                }
            }

            if window.is_empty() {
                data.push(f64::NAN);
            } else {
                let rank = window.len() / 2;
                let (_, value, _) = window.select_nth_unstable_by(rank, |a, b| a.total_cmp(b));
                data.push(*value);
            }
        }
    }

    ImageData {
        width: image.width,
        height: image.height,
        data,
    }
}

/// Mirror an out-of-range index back into `0..len`, repeating the edge
/// sample (`d c b a | a b c d | d c b a`).
fn reflect(mut index: isize, len: usize) -> usize {
    let len = len as isize;
    loop {
        if index < 0 {
            index = -index - 1;
        } else if index >= len {
            index = 2 * len - index - 1;
        } else {
            return index as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflect_mirrors_edges() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(-9, 4), 0);
        assert_eq!(reflect(2, 4), 2);
    }

    #[test]
    fn test_median_filter_removes_isolated_spike() {
        let mut image = ImageData::filled(9, 9, 1.0);
        image.data[4 * 9 + 4] = 100.0;
        let filtered = median_filter(&image, 3);
        assert!(filtered.data.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_median_filter_preserves_constant_and_skips_nan() {
        let mut image = ImageData::filled(6, 5, 3.0);
        image.data[7] = f64::NAN;
        let filtered = median_filter(&image, 2);
        assert!(filtered.data.iter().all(|&v| v == 3.0));

        let blank = ImageData::filled(3, 3, f64::NAN);
        assert!(median_filter(&blank, 2).data.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_prepare_keeps_compact_source_and_drops_background() {
        let image = ImageData::from_fn(40, 40, |x, y| {
            let dx = x as f64 - 20.0;
            let dy = y as f64 - 20.0;
            100.0 + 0.5 * x as f64 + 5000.0 * (-(dx * dx + dy * dy) / 4.0).exp()
        });
        let cleaned = prepare(&image, 10.0, 10, 5).unwrap();
        assert_eq!(cleaned.shape(), (30, 30));
        assert!(cleaned.data.iter().all(|&v| v >= 0.0 && v.is_finite()));

        // Peak stays at the source position (20, 20) -> (15, 15) after trimming
        let (argmax, _) = cleaned
            .data
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert_eq!((argmax % 30, argmax / 30), (15, 15));

        // Far from the source the background is gone
        assert!(cleaned.get(2, 28) < 1e-3);
    }

    #[test]
    fn test_prepare_sanitizes_nan_and_rejects_empty() {
        let mut image = ImageData::filled(20, 20, 50.0);
        image.data[10 * 20 + 10] = f64::NAN;
        let cleaned = prepare(&image, 10.0, 4, 2).unwrap();
        assert!(cleaned.data.iter().all(|v| v.is_finite()));

        assert!(matches!(
            prepare(&image, 10.0, 4, 10),
            Err(AlignError::EmptyImage { .. })
        ));
        assert!(prepare(&ImageData::filled(10, 10, 0.0), 10.0, 4, 1).is_err());
    }

    #[test]
    fn test_filter_median_trims() {
        let image = ImageData::from_fn(12, 10, |x, y| (x * y) as f64);
        let filtered = filter_median(&image, 2, 2).unwrap();
        assert_eq!(filtered.shape(), (6, 8));
    }

    #[test]
    fn test_flux_range_on_positive_pixels() {
        let mut image = ImageData::from_fn(13, 13, |x, y| if y == 1 { (x + 1) as f64 } else { 0.0 });
        image.data[0] = f64::INFINITY;
        // border 1 leaves row 1 columns 1..12 -> values 2..=12
        let (low, high) = flux_range(&image, 1, 10.0, 90.0).unwrap();
        assert!((low - 3.0).abs() < 1e-12);
        assert!((high - 11.0).abs() < 1e-12);

        let dark = ImageData::filled(5, 5, -1.0);
        assert!(matches!(
            flux_range(&dark, 1, 10.0, 90.0),
            Err(AlignError::NoPositivePixels)
        ));
    }
}
