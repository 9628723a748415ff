//! Clip manifests, raw clip files and dataset sources.

use crate::scores::boundary_scores;
use crate::types::{ClipSample, ClipShape, DatasetError, DatasetResult, Segment, SslView};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipManifest {
    pub version: u32,
    /// Class count including background (label 0).
    pub num_classes: usize,
    pub clip_shape: ClipShape,
    pub clips: Vec<ClipEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipEntry {
    pub id: String,
    /// Raw little-endian f32 file, relative to the manifest directory.
    pub path: String,
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslEntry {
    pub path: String,
    pub segments: Vec<Segment>,
}

impl ClipManifest {
    pub fn save(&self, path: &Path) -> DatasetResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| DatasetError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| DatasetError::Other(e.to_string()))?;
        fs::write(path, data).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read(path).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| DatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check the version and every segment list against `num_classes`.
    pub fn validate(&self) -> DatasetResult<()> {
        if self.version != MANIFEST_VERSION {
            return Err(DatasetError::Other(format!(
                "unsupported manifest version {} (expected {MANIFEST_VERSION})",
                self.version
            )));
        }
        for entry in &self.clips {
            validate_segments(&entry.id, &entry.segments, self.num_classes)?;
            if let Some(ssl) = &entry.ssl {
                validate_segments(&entry.id, &ssl.segments, self.num_classes)?;
            }
        }
        Ok(())
    }
}

/// Segments must be non-empty, inside [0, 1], sorted, non-overlapping, and labelled
/// with an action class (`1..num_classes`).
pub fn validate_segments(id: &str, segments: &[Segment], num_classes: usize) -> DatasetResult<()> {
    let fail = |msg: String| DatasetError::Validation {
        id: id.to_string(),
        msg,
    };
    if segments.is_empty() {
        return Err(fail("no segments".into()));
    }
    let mut prev_end = 0.0f32;
    for (i, seg) in segments.iter().enumerate() {
        if !(0.0..=1.0).contains(&seg.start) || !(0.0..=1.0).contains(&seg.end) {
            return Err(fail(format!("segment {i} outside [0, 1]")));
        }
        if seg.start >= seg.end {
            return Err(fail(format!("segment {i} has start >= end")));
        }
        if seg.start < prev_end {
            return Err(fail(format!("segment {i} overlaps or is out of order")));
        }
        if seg.label == 0 || seg.label >= num_classes {
            return Err(fail(format!(
                "segment {i} label {} not in 1..{num_classes}",
                seg.label
            )));
        }
        prev_end = seg.end;
    }
    Ok(())
}

pub fn write_clip_file(path: &Path, values: &[f32]) -> DatasetResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DatasetError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn read_clip_file(path: &Path, id: &str, shape: ClipShape) -> DatasetResult<Vec<f32>> {
    let raw = fs::read(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    if raw.len() != shape.numel() * 4 {
        return Err(DatasetError::Shape {
            id: id.to_string(),
            expected: shape.numel(),
            actual: raw.len() / 4,
        });
    }
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Random-access clip source shared with the loader workers.
pub trait ClipDataset: Send + Sync {
    fn len(&self) -> usize;
    fn shape(&self) -> ClipShape;
    fn num_classes(&self) -> usize;
    fn get(&self, index: usize) -> DatasetResult<ClipSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clips read lazily from disk as listed by a [`ClipManifest`].
pub struct ManifestDataset {
    root: PathBuf,
    manifest: ClipManifest,
}

impl ManifestDataset {
    pub fn open(manifest_path: &Path) -> DatasetResult<Self> {
        let manifest = ClipManifest::load(manifest_path)?;
        manifest.validate()?;
        let root = manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        tracing::info!(
            manifest = %manifest_path.display(),
            clips = manifest.clips.len(),
            "opened clip manifest"
        );
        Ok(Self { root, manifest })
    }
}

impl ClipDataset for ManifestDataset {
    fn len(&self) -> usize {
        self.manifest.clips.len()
    }

    fn shape(&self) -> ClipShape {
        self.manifest.clip_shape
    }

    fn num_classes(&self) -> usize {
        self.manifest.num_classes
    }

    fn get(&self, index: usize) -> DatasetResult<ClipSample> {
        let entry = self
            .manifest
            .clips
            .get(index)
            .ok_or_else(|| DatasetError::Other(format!("clip index {index} out of range")))?;
        let shape = self.manifest.clip_shape;
        let clip = read_clip_file(&self.root.join(&entry.path), &entry.id, shape)?;
        let ssl = match &entry.ssl {
            Some(ssl) => Some(SslView {
                clip: read_clip_file(&self.root.join(&ssl.path), &entry.id, shape)?,
                segments: ssl.segments.clone(),
            }),
            None => None,
        };
        Ok(ClipSample {
            id: entry.id.clone(),
            clip,
            shape,
            scores: boundary_scores(&entry.segments, shape.frames),
            segments: entry.segments.clone(),
            ssl,
        })
    }
}

/// Fully materialized clips, used by tests and synthetic tooling.
pub struct InMemoryDataset {
    shape: ClipShape,
    num_classes: usize,
    samples: Vec<ClipSample>,
}

impl InMemoryDataset {
    pub fn new(
        shape: ClipShape,
        num_classes: usize,
        samples: Vec<ClipSample>,
    ) -> DatasetResult<Self> {
        for sample in &samples {
            if sample.shape != shape || sample.clip.len() != shape.numel() {
                return Err(DatasetError::Shape {
                    id: sample.id.clone(),
                    expected: shape.numel(),
                    actual: sample.clip.len(),
                });
            }
            validate_segments(&sample.id, &sample.segments, num_classes)?;
        }
        Ok(Self {
            shape,
            num_classes,
            samples,
        })
    }

    /// Random clips with one or two action segments each; every other clip carries
    /// a self-supervised view.
    pub fn synthetic(count: usize, shape: ClipShape, num_classes: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let samples = (0..count)
            .map(|i| {
                let segments = random_segments(&mut rng, num_classes);
                let clip: Vec<f32> = (0..shape.numel()).map(|_| rng.random::<f32>()).collect();
                let ssl = (i % 2 == 0).then(|| SslView {
                    clip: (0..shape.numel()).map(|_| rng.random::<f32>()).collect(),
                    segments: random_segments(&mut rng, num_classes),
                });
                ClipSample {
                    id: format!("synthetic_{i:04}"),
                    clip,
                    shape,
                    scores: boundary_scores(&segments, shape.frames),
                    segments,
                    ssl,
                }
            })
            .collect();
        Self {
            shape,
            num_classes,
            samples,
        }
    }
}

fn random_segments(rng: &mut ChaCha8Rng, num_classes: usize) -> Vec<Segment> {
    let label = |rng: &mut ChaCha8Rng| rng.random_range(1..num_classes.max(2));
    if rng.random_bool(0.5) {
        let start = rng.random_range(0.0..0.4f32);
        let end = rng.random_range(start + 0.2..1.0f32);
        vec![Segment::new(start, end, label(rng))]
    } else {
        let a = rng.random_range(0.0..0.2f32);
        let b = rng.random_range(a + 0.1..0.45f32);
        let c = rng.random_range(0.55..0.7f32);
        let d = rng.random_range(c + 0.1..1.0f32);
        vec![Segment::new(a, b, label(rng)), Segment::new(c, d, label(rng))]
    }
}

impl ClipDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn shape(&self) -> ClipShape {
        self.shape
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get(&self, index: usize) -> DatasetResult<ClipSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| DatasetError::Other(format!("clip index {index} out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_and_background_label() {
        let overlap = [Segment::new(0.1, 0.5, 1), Segment::new(0.4, 0.6, 2)];
        assert!(matches!(
            validate_segments("a", &overlap, 3),
            Err(DatasetError::Validation { .. })
        ));
        let background = [Segment::new(0.1, 0.5, 0)];
        assert!(validate_segments("b", &background, 3).is_err());
        let ok = [Segment::new(0.0, 0.5, 1), Segment::new(0.5, 1.0, 2)];
        assert!(validate_segments("c", &ok, 3).is_ok());
    }

    #[test]
    fn synthetic_segments_validate() {
        let shape = ClipShape {
            channels: 3,
            frames: 8,
            height: 2,
            width: 2,
        };
        let ds = InMemoryDataset::synthetic(16, shape, 5, 7);
        for i in 0..ds.len() {
            let sample = ds.get(i).unwrap();
            validate_segments(&sample.id, &sample.segments, 5).unwrap();
            assert_eq!(sample.scores.len(), 16);
        }
    }
}
