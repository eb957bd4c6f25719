use std::path::PathBuf;

/// Errors raised by the alignment engine.
///
/// Numerical failures (`SingularMatrix`, `SingularFit`, `FitDidNotConverge`,
/// `InsufficientChunks`) only concern the exposure being processed; the
/// pipeline reports them per exposure instead of aborting the batch.
#[derive(thiserror::Error, Debug)]
pub enum AlignError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("shape mismatch: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("image is empty after trimming a border of {border} pixels from {width}x{height}")]
    EmptyImage {
        width: usize,
        height: usize,
        border: usize,
    },
    #[error("no strictly positive pixel left after border trimming")]
    NoPositivePixels,
    #[error("pixel scale matrix is not invertible (determinant {determinant:e})")]
    SingularMatrix { determinant: f64 },
    #[error("flux regression failed: {0}")]
    SingularFit(String),
    #[error("gaussian peak fit did not converge after {iterations} iterations")]
    FitDidNotConverge { iterations: usize },
    #[error("only {found} valid chunks, at least {required} required")]
    InsufficientChunks { found: usize, required: usize },
    #[error("offset table not found: {}", .0.display())]
    MissingTable(PathBuf),
    #[error("offset table {} is unreadable: {reason}", .path.display())]
    UnreadableTable { path: PathBuf, reason: String },
    #[error("offset table schema error: {0}")]
    TableSchemaError(String),
    #[error("exposure index {index} outside 0..{count}")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("exposure {index} is {state:?}, cannot {operation}")]
    LedgerState {
        index: usize,
        state: crate::ledger::ExposureState,
        operation: &'static str,
    },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("FITS error: {0}")]
    Fits(String),
}

pub type Result<T> = std::result::Result<T, AlignError>;
