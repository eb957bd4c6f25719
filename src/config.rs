use crate::error::{AlignError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the initial offset of every exposure comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialGuessMode {
    /// Use the offsets measured by cross-correlation
    CrossCorrelation,
    /// Reload the total offsets of a previously saved table
    FromTable(PathBuf),
}

/// Alignment parameters, loadable from a JSON file.
///
/// Every field has a default so a config file only needs the keys it
/// changes; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignConfig {
    /// Sliding median size used to remove the background before correlating
    pub median_window: usize,
    /// Half-size of the correlation window fitted around the peak
    pub subim_window: usize,
    /// Arctan compression factor, in units of the image median
    pub dynamic_range: f64,
    /// Pixels trimmed from every edge
    pub border: usize,
    /// Tile size for the flux statistics
    pub chunk_size: usize,
    /// Median filter size applied before flux normalization
    pub filter_size: usize,
    /// Initial sigma of the Gaussian peak fit, in pixels
    pub peak_sigma_guess: f64,
    pub first_guess: InitialGuessMode,
    /// User offset (x, y) in arcsec added on top of the initial guess
    pub extra_arcsec: [f64; 2],
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            median_window: 10,
            subim_window: 10,
            dynamic_range: 10.0,
            border: 50,
            chunk_size: 15,
            filter_size: 2,
            peak_sigma_guess: 2.0,
            first_guess: InitialGuessMode::CrossCorrelation,
            extra_arcsec: [0.0, 0.0],
        }
    }
}

impl AlignConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            AlignError::InvalidInput(format!("config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("median_window", self.median_window),
            ("subim_window", self.subim_window),
            ("chunk_size", self.chunk_size),
            ("filter_size", self.filter_size),
        ];
        for (name, value) in windows {
            if value == 0 {
                return Err(AlignError::InvalidInput(format!("{name} must be positive")));
            }
        }
        if !(self.dynamic_range.is_finite() && self.dynamic_range > 0.0) {
            return Err(AlignError::InvalidInput(format!(
                "dynamic_range must be positive, got {}",
                self.dynamic_range
            )));
        }
        if !(self.peak_sigma_guess.is_finite() && self.peak_sigma_guess > 0.0) {
            return Err(AlignError::InvalidInput(format!(
                "peak_sigma_guess must be positive, got {}",
                self.peak_sigma_guess
            )));
        }
        if self.extra_arcsec.iter().any(|v| !v.is_finite()) {
            return Err(AlignError::InvalidInput("extra_arcsec must be finite".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AlignConfig::default();
        assert_eq!(config.median_window, 10);
        assert_eq!(config.border, 50);
        assert_eq!(config.chunk_size, 15);
        assert_eq!(config.first_guess, InitialGuessMode::CrossCorrelation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: AlignConfig = serde_json::from_str(
            r#"{"border": 20, "first_guess": {"from_table": "offsets.json"}}"#,
        )
        .unwrap();
        assert_eq!(config.border, 20);
        assert_eq!(config.median_window, 10);
        assert_eq!(
            config.first_guess,
            InitialGuessMode::FromTable(PathBuf::from("offsets.json"))
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let parsed: std::result::Result<AlignConfig, _> =
            serde_json::from_str(r#"{"border": 20, "median_windw": 4}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        let zero_chunk = AlignConfig {
            chunk_size: 0,
            ..AlignConfig::default()
        };
        assert!(zero_chunk.validate().is_err());

        let flat_range = AlignConfig {
            dynamic_range: 0.0,
            ..AlignConfig::default()
        };
        assert!(flat_range.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("skyalign_config_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"chunk_size": 12, "extra_arcsec": [0.5, -1.0]}"#).unwrap();
        let config = AlignConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.chunk_size, 12);
        assert_eq!(config.extra_arcsec, [0.5, -1.0]);

        assert!(matches!(
            AlignConfig::from_file(&path),
            Err(AlignError::Io(_))
        ));
    }
}
