pub mod config;
pub mod coords;
pub mod correlate;
pub mod error;
pub mod fits;
pub mod image;
pub mod ledger;
pub mod lm;
pub mod normalize;
pub mod peak_fit;
pub mod pipeline;
pub mod preprocess;
pub mod stats;
pub mod table;

#[cfg(test)]
mod test_alignment;

// Re-export commonly used items
pub use config::{AlignConfig, InitialGuessMode};
pub use error::{AlignError, Result};
pub use image::{Exposure, ImageData, LinearWcs};
pub use ledger::{ExposureState, ExtraOffset, OffsetLedger, OffsetRecord};
pub use table::{OffsetTable, SavePolicy};
