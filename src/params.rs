//! Encode/decode parameters (§6): the inputs a caller supplies per run,
//! distinct from the on-disk [`crate::metadata::Metadata`] descriptor.

use std::path::PathBuf;

use crate::grid::Grid;

/// Parameters for one encode pass.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub input_file: PathBuf,
    pub out_dir: PathBuf,
    pub name: String,
    pub field: String,
    /// When true, stop after the wavelet transform and skip block coding —
    /// useful for inspecting the decorrelated coefficients directly.
    pub wavelet_only: bool,
    /// Target L-infinity error (§4.5's accuracy-driven bit-plane cutoff).
    /// Smaller values keep more bit-planes and grow the artifact.
    pub accuracy: f64,
}

/// Parameters for one decode pass.
#[derive(Debug, Clone)]
pub struct DecodeParams {
    pub in_dir: PathBuf,
    pub name: String,
    pub field: String,
    pub decode_extent: Grid,
    pub level: i8,
    /// Absolute error tolerance driving the bit-plane cutoff (§4.5).
    pub accuracy: f64,
}
