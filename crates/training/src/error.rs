//! Error taxonomy for the training loop.

use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value `{key}`: {msg}")]
    Invalid { key: &'static str, msg: String },
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("checkpoint for epoch {epoch} not found at {path}")]
    CheckpointNotFound { epoch: usize, path: PathBuf },
    #[error("corrupt checkpoint {path}: {msg}")]
    CorruptCheckpoint { path: PathBuf, msg: String },
    #[error("numeric engine failure: {0}")]
    NumericEngine(String),
    #[error("invalid training state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Dataset(#[from] clip_dataset::DatasetError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, msg: impl std::fmt::Display) -> Self {
        TrainError::CorruptCheckpoint {
            path: path.into(),
            msg: msg.to_string(),
        }
    }
}
