use clap::{Args, Parser, Subcommand};
use skyalign::config::{AlignConfig, InitialGuessMode};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "skyalign")]
#[command(about = "Align exposures on a reference image and calibrate their flux", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Measure offsets and flux scales, then save the offset table
    Align {
        #[command(flatten)]
        options: AlignOptions,
    },

    /// Print the offsets stored in a saved table
    ShowTable {
        /// Offset table (JSON)
        path: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AlignOptions {
    /// Exposure FITS files
    #[arg(long, num_args = 1.., required = true)]
    pub exposures: Vec<String>,

    /// Reference FITS files, one per exposure, already on the exposure grid
    #[arg(long, num_args = 1.., required = true)]
    pub references: Vec<String>,

    /// JSON file with alignment parameters
    #[arg(short, long)]
    pub config: Option<String>,

    /// Take the initial offsets from this table instead of cross-correlation
    #[arg(long)]
    pub first_guess_table: Option<String>,

    /// Extra offset in arcsec added to every exposure
    #[arg(long, num_args = 2, value_names = ["X", "Y"], allow_negative_numbers = true)]
    pub extra_arcsec: Option<Vec<f64>>,

    /// Output offset table
    #[arg(short, long, default_value = "OFFSET_TABLE.json")]
    pub output_table: String,

    /// Suffix inserted before the extension of the output table
    #[arg(long, default_value = "")]
    pub suffix: String,

    /// Merge with an existing table instead of overwriting it
    #[arg(long)]
    pub merge: bool,
}

impl AlignOptions {
    /// Config file values with command-line flags applied on top
    pub fn to_config(&self) -> anyhow::Result<AlignConfig> {
        let mut config = match &self.config {
            Some(path) => AlignConfig::from_file(Path::new(path))?,
            None => AlignConfig::default(),
        };
        if let Some(table) = &self.first_guess_table {
            config.first_guess = InitialGuessMode::FromTable(PathBuf::from(table));
        }
        if let Some(extra) = &self.extra_arcsec {
            config.extra_arcsec = [extra[0], extra[1]];
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_flags_override_defaults() {
        let cli = Cli::parse_from([
            "skyalign",
            "align",
            "--exposures",
            "a.fits",
            "b.fits",
            "--references",
            "ra.fits",
            "rb.fits",
            "--extra-arcsec",
            "-0.5",
            "1.0",
            "--first-guess-table",
            "old.json",
            "--merge",
        ]);
        let Commands::Align { options } = cli.command else {
            panic!("expected align");
        };
        assert_eq!(options.exposures.len(), 2);
        assert!(options.merge);

        let config = options.to_config().unwrap();
        assert_eq!(config.extra_arcsec, [-0.5, 1.0]);
        assert_eq!(
            config.first_guess,
            InitialGuessMode::FromTable(PathBuf::from("old.json"))
        );
        assert_eq!(config.border, 50);
    }

    #[test]
    fn test_show_table_parses() {
        let cli = Cli::parse_from(["skyalign", "-v", "show-table", "OFFSET_TABLE.json"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::ShowTable { .. }));
    }
}
