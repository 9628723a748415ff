//! Burn modules for weakly/semi-supervised temporal action detection.
//!
//! This crate defines the networks driven by the `training` crate:
//! - `Detector`: student network with backbone, attention, detection-head and
//!   contrastive-embedding operations.
//! - `Cvae`: conditional VAE that reconstructs backbone features from attention.
//!
//! These are plain Burn modules with no knowledge of datasets, losses or checkpoints.
//!
//! ## Layout
//! Feature maps are channels-last, `[batch, frames, height, width, channels]`. The
//! `mixed_5c` stage runs at half the temporal resolution of `mixed_4f`; detection
//! priors sit on a quarter-resolution grid.

pub mod cvae;
pub mod detector;
pub mod features;

pub use cvae::{Cvae, CvaeConfig, CvaeForward, CvaeOp, CvaeOutput};
pub use detector::{
    Detections, Detector, DetectorConfig, DetectorOp, DetectorOutput, TripletFeatures,
    TRIPLET_SCALES,
};
pub use features::{AttentionMaps, FeatureMaps, Partition};

/// Temporal stride between the clip frames and the `mixed_5c` stage.
pub const STAGE_5C_STRIDE: usize = 2;
/// Temporal stride between the clip frames and the detection prior grid.
pub const PRIOR_STRIDE: usize = 4;
