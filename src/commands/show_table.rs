use anyhow::{Context, Result};
use skyalign::image::ARCSEC_PER_DEGREE;
use skyalign::table::OffsetTable;
use std::path::Path;

pub fn show_table(path: &str) -> Result<()> {
    let table = OffsetTable::load(Path::new(path))
        .with_context(|| format!("Failed to read offset table: {}", path))?;

    println!("Offsets recorded in {}", path);
    println!("Total in ARCSEC");
    for (i, row) in table.rows.iter().enumerate() {
        print!(
            "    Image {:02}: {:8.4} {:8.4}  scale {:.4}",
            i,
            row.ra_offset * ARCSEC_PER_DEGREE,
            row.dec_offset * ARCSEC_PER_DEGREE,
            row.flux_scale
        );
        if let (Some(ra), Some(dec)) = (row.ra_offset_orig, row.dec_offset_orig) {
            print!(
                "  (first saved {:.4} {:.4})",
                ra * ARCSEC_PER_DEGREE,
                dec * ARCSEC_PER_DEGREE
            );
        }
        println!("  {}", row.date_obs);
    }

    Ok(())
}
