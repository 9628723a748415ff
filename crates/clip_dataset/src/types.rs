//! Core types, error definitions, and data structures for clip_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("clip {id}: expected {expected} values, found {actual}")]
    Shape {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("segment validation failed for {id}: {msg}")]
    Validation { id: String, msg: String },
    #[error("{0}")]
    Other(String),
}

/// Annotated span in normalized clip coordinates. Label 0 is background.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f32,
    pub end: f32,
    pub label: usize,
}

impl Segment {
    pub fn new(start: f32, end: f32, label: usize) -> Self {
        Self { start, end, label }
    }

    pub fn span(&self) -> [f32; 2] {
        [self.start, self.end]
    }
}

/// Layout of one clip: `[channels, frames, height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipShape {
    pub channels: usize,
    pub frames: usize,
    pub height: usize,
    pub width: usize,
}

impl ClipShape {
    pub fn numel(&self) -> usize {
        self.channels * self.frames * self.height * self.width
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.channels, self.frames, self.height, self.width]
    }
}

/// Self-supervised companion clip and its segments.
#[derive(Debug, Clone)]
pub struct SslView {
    pub clip: Vec<f32>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
pub struct ClipSample {
    pub id: String,
    /// Raw values in `[channels, frames, height, width]` order.
    pub clip: Vec<f32>,
    pub shape: ClipShape,
    pub segments: Vec<Segment>,
    /// Start row then end row, `2 * frames` values.
    pub scores: Vec<f32>,
    pub ssl: Option<SslView>,
}
