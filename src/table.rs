//! Persisted offset table, one row per exposure keyed by observation date.
//!
//! Angular columns are stored in degrees. The file is a JSON array of row
//! objects using the historical upper-case column names.

use crate::error::{AlignError, Result};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRow {
    /// Total offset along the first axis, degrees
    #[serde(rename = "RA_OFFSET")]
    pub ra_offset: f64,
    /// Total offset along the second axis, degrees
    #[serde(rename = "DEC_OFFSET")]
    pub dec_offset: f64,
    #[serde(rename = "RA_CROSS_OFFSET")]
    pub ra_cross_offset: f64,
    #[serde(rename = "DEC_CROSS_OFFSET")]
    pub dec_cross_offset: f64,
    #[serde(rename = "FLUX_SCALE")]
    pub flux_scale: f64,
    #[serde(rename = "DATE_OBS")]
    pub date_obs: String,
    #[serde(rename = "FLUX_OFFSET", default, skip_serializing_if = "Option::is_none")]
    pub flux_offset: Option<f64>,
    /// First total offset ever saved for this row
    #[serde(rename = "RA_OFFSET_ORIG", default, skip_serializing_if = "Option::is_none")]
    pub ra_offset_orig: Option<f64>,
    #[serde(rename = "DEC_OFFSET_ORIG", default, skip_serializing_if = "Option::is_none")]
    pub dec_offset_orig: Option<f64>,
}

/// How `save` treats a table already present at the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    Overwrite,
    /// Union with the existing rows, keeping the first saved offsets as `*_ORIG`
    Merge,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetTable {
    pub rows: Vec<OffsetRow>,
}

impl OffsetTable {
    pub fn new(rows: Vec<OffsetRow>) -> Self {
        Self { rows }
    }

    pub fn find(&self, date_obs: &str) -> Option<&OffsetRow> {
        self.rows.iter().find(|row| row.date_obs == date_obs)
    }

    /// Merge `self` (new values) into `existing`.
    ///
    /// Rows of `existing` without a counterpart are kept as they are, matched
    /// rows are replaced in place and unmatched new rows are appended. A
    /// replaced row records the offset it overwrites under `*_ORIG`, unless
    /// the existing row already carries one.
    pub fn merged_into(&self, existing: &OffsetTable) -> OffsetTable {
        let mut rows = existing.rows.clone();
        for new_row in &self.rows {
            match rows.iter_mut().find(|row| row.date_obs == new_row.date_obs) {
                Some(old) => {
                    let (ra_orig, dec_orig) = match (old.ra_offset_orig, old.dec_offset_orig) {
                        (Some(ra), Some(dec)) => (ra, dec),
                        _ => (old.ra_offset, old.dec_offset),
                    };
                    *old = OffsetRow {
                        ra_offset_orig: Some(ra_orig),
                        dec_offset_orig: Some(dec_orig),
                        ..new_row.clone()
                    };
                }
                None => rows.push(new_row.clone()),
            }
        }
        OffsetTable { rows }
    }

    /// Read a table written by `save`.
    ///
    /// A file that is not valid JSON is `UnreadableTable`; valid JSON whose
    /// rows lack required columns is `TableSchemaError`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AlignError::MissingTable(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let rows: Vec<OffsetRow> = serde_json::from_str(&content).map_err(|e| match e.classify() {
            Category::Data => AlignError::TableSchemaError(format!("{}: {}", path.display(), e)),
            Category::Syntax | Category::Eof | Category::Io => AlignError::UnreadableTable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;
        Ok(Self { rows })
    }

    /// Write the table, returning the number of rows written.
    pub fn save(&self, path: &Path, policy: SavePolicy) -> Result<usize> {
        let table = match policy {
            SavePolicy::Merge if path.exists() => {
                let existing = Self::load(path)?;
                tracing::info!(
                    "merging {} rows into existing table {} ({} rows)",
                    self.rows.len(),
                    path.display(),
                    existing.rows.len()
                );
                self.merged_into(&existing)
            }
            _ => self.clone(),
        };

        let json = serde_json::to_string_pretty(&table.rows)
            .map_err(|e| AlignError::TableSchemaError(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::info!("saved offset table {}", path.display());
        Ok(table.rows.len())
    }
}

/// Insert `suffix` before the extension: `OFFSET_TABLE.json` + `_v2`
/// gives `OFFSET_TABLE_v2.json`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str, ra: f64, dec: f64) -> OffsetRow {
        OffsetRow {
            ra_offset: ra,
            dec_offset: dec,
            ra_cross_offset: ra,
            dec_cross_offset: dec,
            flux_scale: 1.0,
            date_obs: date.to_string(),
            flux_offset: None,
            ra_offset_orig: None,
            dec_offset_orig: None,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("skyalign_{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_merge_keeps_orig_only_once() {
        let first = OffsetTable::new(vec![row("A", 1.0, 2.0), row("B", 3.0, 4.0)]);
        let second = OffsetTable::new(vec![row("A", 1.5, 2.5), row("C", 9.0, 9.0)]);

        let merged = second.merged_into(&first);
        assert_eq!(merged.rows.len(), 3);
        let a = merged.find("A").unwrap();
        assert_eq!(a.ra_offset, 1.5);
        assert_eq!(a.ra_offset_orig, Some(1.0));
        assert_eq!(a.dec_offset_orig, Some(2.0));
        assert_eq!(merged.find("B").unwrap(), &row("B", 3.0, 4.0));
        assert_eq!(merged.find("C").unwrap().ra_offset_orig, None);

        // A third save must not move the original values
        let third = OffsetTable::new(vec![row("A", 7.0, 8.0)]);
        let merged = third.merged_into(&merged);
        let a = merged.find("A").unwrap();
        assert_eq!(a.ra_offset, 7.0);
        assert_eq!(a.ra_offset_orig, Some(1.0));
        assert_eq!(a.dec_offset_orig, Some(2.0));
    }

    #[test]
    fn test_save_merge_and_overwrite() {
        let path = temp_path("save");
        OffsetTable::new(vec![row("A", 1.0, 2.0)])
            .save(&path, SavePolicy::Overwrite)
            .unwrap();

        let written = OffsetTable::new(vec![row("B", 0.1, 0.2)])
            .save(&path, SavePolicy::Merge)
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(OffsetTable::load(&path).unwrap().rows.len(), 2);

        OffsetTable::new(vec![row("C", 0.0, 0.0)])
            .save(&path, SavePolicy::Overwrite)
            .unwrap();
        let reloaded = OffsetTable::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(reloaded.rows, vec![row("C", 0.0, 0.0)]);
    }

    #[test]
    fn test_load_errors() {
        let missing = temp_path("missing");
        assert!(matches!(
            OffsetTable::load(&missing),
            Err(AlignError::MissingTable(_))
        ));

        let path = temp_path("schema");
        std::fs::write(&path, r#"[{"RA_CROSS_OFFSET": 0.0, "DATE_OBS": "A"}]"#).unwrap();
        let result = OffsetTable::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(AlignError::TableSchemaError(_))));

        let path = temp_path("truncated");
        std::fs::write(&path, r#"[{"RA_OFFSET": 0.0, "DEC_OFF"#).unwrap();
        let result = OffsetTable::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(AlignError::UnreadableTable { .. })));

        let path = temp_path("garbage");
        std::fs::write(&path, "RA_OFFSET DEC_OFFSET\n0.1 0.2\n").unwrap();
        let result = OffsetTable::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(AlignError::UnreadableTable { .. })));
    }

    #[test]
    fn test_optional_columns_round_trip() {
        let mut full = row("2024-01-01T00:00:00", 1e-4, -2e-4);
        full.flux_offset = Some(3.5);
        let json = serde_json::to_string(&full).unwrap();
        assert!(json.contains("\"FLUX_OFFSET\":3.5"));
        assert!(!json.contains("RA_OFFSET_ORIG"));
        let back: OffsetRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, full);
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("out/OFFSET_TABLE.json"), "_v2"),
            PathBuf::from("out/OFFSET_TABLE_v2.json")
        );
        assert_eq!(
            with_suffix(Path::new("OFFSETS"), "_a"),
            PathBuf::from("OFFSETS_a")
        );
        assert_eq!(
            with_suffix(Path::new("t.json"), ""),
            PathBuf::from("t.json")
        );
    }
}
