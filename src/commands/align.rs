use crate::cli::AlignOptions;
use anyhow::{Context, Result};
use skyalign::fits::load_exposure;
use skyalign::image::ImageData;
use skyalign::pipeline::{self, OnExposureGrid};
use skyalign::table::{with_suffix, SavePolicy};
use std::path::Path;

pub fn align(options: &AlignOptions) -> Result<()> {
    if options.exposures.len() != options.references.len() {
        return Err(anyhow::anyhow!(
            "{} exposures given but {} references",
            options.exposures.len(),
            options.references.len()
        ));
    }
    let config = options.to_config()?;

    let exposures = options
        .exposures
        .iter()
        .map(|path| {
            load_exposure(Path::new(path))
                .with_context(|| format!("Failed to load exposure: {}", path))
        })
        .collect::<Result<Vec<_>>>()?;
    let references: Vec<ImageData> = options
        .references
        .iter()
        .map(|path| {
            load_exposure(Path::new(path))
                .map(|reference| reference.image)
                .with_context(|| format!("Failed to load reference: {}", path))
        })
        .collect::<Result<Vec<_>>>()?;

    // References are read on the exposure grids and resampled after each shift
    let grid = OnExposureGrid::new(&exposures, &references)?;
    let run = pipeline::run(&exposures, &references, &grid, &config)?;

    println!("#---- Offsets ----#");
    print!("{}", run.ledger.summary());
    println!("Flux scale");
    for i in 0..run.ledger.len() {
        match run.ledger.normalization(i)? {
            Some(record) => println!(
                "    Image {:02}: {:8.4} (offset {:.4})",
                i,
                record.scale(),
                record.b0
            ),
            None => println!("    Image {:02}: not normalized", i),
        }
    }

    if !run.failures.is_empty() {
        println!("\n{} step(s) failed:", run.failures.len());
        for (i, error) in &run.failures {
            println!("    Image {:02} ({}): {}", i, options.exposures[*i], error);
        }
    }

    let output = with_suffix(Path::new(&options.output_table), &options.suffix);
    let policy = if options.merge {
        SavePolicy::Merge
    } else {
        SavePolicy::Overwrite
    };
    let rows = run
        .ledger
        .to_table()
        .save(&output, policy)
        .with_context(|| format!("Failed to save offset table: {}", output.display()))?;
    println!("\nSaved {} rows to {}", rows, output.display());

    Ok(())
}
