//! # idx2 — progressive, random-access storage for scalar fields
//!
//! Format guarantees:
//! - A field is tiled into bricks, each independently addressable and
//!   independently decodable to a requested accuracy without touching
//!   sibling bricks
//! - Bricks are wavelet-decomposed (CDF 5/3 lifting) into a hierarchy of
//!   levels; every level but the coarsest is itself further decomposable,
//!   giving resolution-progressive as well as accuracy-progressive reads
//! - Within a brick, coefficients are block-coded (ZFP-style: shared
//!   exponent, decorrelating transform, embedded bit-plane coding) so a
//!   decoder can stop at any bit-plane and still get a valid, bounded-error
//!   reconstruction
//! - On disk, encoded bit-planes are grouped into channels keyed by
//!   `(level, sub-level, bit-plane)`, chunked, and written to files named
//!   by a 64-bit packed address — the same address space a decoder walks
//!   to resolve which files a query touches
//! - The metadata descriptor is a small hand-written text format, not a
//!   general serialization format — every field in it is named in
//!   `metadata.rs`'s grammar doc comment

pub mod address;
pub mod bitstream;
pub mod block_codec;
pub mod brick;
pub mod channel;
pub mod decode;
pub mod error;
pub mod file_io;
pub mod grid;
pub mod idx2_file;
pub mod metadata;
pub mod observer;
pub mod params;
pub mod subband;
pub mod wavelet;

pub use address::{file_address, FileKind, GroupingFlags};
pub use error::{Idx2Error, Idx2Result};
pub use grid::{Grid, V3};
pub use idx2_file::Idx2File;
pub use metadata::{DataType, Metadata};
pub use params::{DecodeParams, EncodeParams};
pub use wavelet::{flift_cdf53, ilift_cdf53, LiftOption};
