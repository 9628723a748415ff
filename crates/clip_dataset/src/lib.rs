//! Video clip datasets and Burn-compatible batching for temporal action detection.
//!
//! This crate provides:
//! - JSON clip manifests pointing at raw little-endian f32 clip files
//! - Segment validation and Gaussian boundary-score targets
//! - An in-memory dataset for tests and synthetic runs
//! - A prefetching, shuffling batch loader producing `ClipBatch` tensors

pub mod batch;
pub mod manifest;
pub mod scores;
pub mod types;

pub use batch::{collate, flip_horizontal, ClipBatch, ClipLoader, EpochIter, LoaderConfig};
pub use manifest::{
    read_clip_file, validate_segments, write_clip_file, ClipDataset, ClipEntry, ClipManifest,
    InMemoryDataset, ManifestDataset, SslEntry, MANIFEST_VERSION,
};
pub use scores::boundary_scores;
pub use types::*;
