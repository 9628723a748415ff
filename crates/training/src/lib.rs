#![recursion_limit = "256"]

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod intervals;
pub mod loss;
pub mod metrics;
pub mod rng;
pub mod runner;
pub mod util;

pub use aggregate::{BranchLosses, JointObjective, LossWeights};
pub use checkpoint::{load_weights, CheckpointStore, LoadedCheckpoint, TrainingStateBundle};
pub use config::TrainConfig;
pub use error::{ConfigError, TrainError, TrainResult};
pub use intervals::complement;
pub use metrics::{EpochSummary, RunMode, ScalarWriter, StepCounters};
pub use rng::{set_seed, RngSnapshot, RngStates};
pub use runner::{EpochRunner, TrainState};
pub use util::{evaluate_checkpoint, fit, run_train, TrainArgs, TrainReport};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
