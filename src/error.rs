//! Error taxonomy (§7).
//!
//! Algorithmic routines never signal normal-data conditions as errors; they
//! return plain values. Only I/O, parsing, and validation signal. Errors are
//! propagated upward unmodified — no swallowing, no rewrapping into a vaguer
//! kind. `Init`, `Encode`, and `Decode` are the only user-visible surface;
//! they return the first error encountered.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Idx2Error {
    #[error("failed to open file {}", .path.display())]
    FileOpenFailed { path: PathBuf },

    #[error("failed to read file {}", .path.display())]
    FileReadFailed { path: PathBuf },

    #[error("failed to write file {}", .path.display())]
    FileWriteFailed { path: PathBuf },

    #[error("file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("failed to parse {what}")]
    ParseFailed { what: String },

    #[error("syntax error in {what}: {detail}")]
    SyntaxError { what: String, detail: String },

    #[error("too many dimensions: {0} (max 3)")]
    DimensionsTooMany(usize),

    #[error("repeated axis {0} in dimensions/template")]
    DimensionsRepeated(u8),

    #[error("invalid brick dimensions: {0:?} (must be power-of-two, <= 3 axes)")]
    InvalidBrickDimensions(Vec<i32>),

    #[error("truncated bit-stream: expected at least {expected} bytes, got {actual}")]
    TruncatedStream { expected: usize, actual: usize },

    #[error("checksum mismatch in {what}")]
    ChecksumMismatch { what: String },

    #[error("incompatible metadata: {0}")]
    IncompatibleMetadata(String),

    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Idx2Result<T> = Result<T, Idx2Error>;
