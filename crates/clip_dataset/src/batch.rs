//! Epoch ordering, prefetching workers and Burn batch collation.

use crate::manifest::ClipDataset;
use crate::types::{ClipSample, ClipShape, DatasetError, DatasetResult, Segment};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Background loading threads; 0 loads on the caller's thread.
    pub num_workers: usize,
    /// Bounded queue depth between workers and the consumer.
    pub prefetch: usize,
    /// Worker `i` seeds its augmentation RNG with `seed + i`.
    pub seed: u64,
    pub flip_horizontal_prob: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: true,
            drop_last: true,
            num_workers: 4,
            prefetch: 8,
            seed: 1,
            flip_horizontal_prob: 0.0,
        }
    }
}

impl LoaderConfig {
    /// Same batching without shuffling or augmentation, keeping partial batches.
    pub fn for_eval(&self) -> Self {
        Self {
            shuffle: false,
            drop_last: false,
            flip_horizontal_prob: 0.0,
            ..self.clone()
        }
    }
}

pub struct ClipBatch<B: Backend> {
    /// `[batch, channels, frames, height, width]`.
    pub clips: Tensor<B, 5>,
    pub targets: Vec<Vec<Segment>>,
    /// `[batch, 2, frames]`: start row then end row.
    pub scores: Tensor<B, 3>,
    /// Per-clip self-supervised view, each `[1, channels, frames, height, width]`.
    pub ssl_clips: Vec<Option<Tensor<B, 5>>>,
    pub ssl_targets: Vec<Vec<Segment>>,
    pub ssl_flags: Vec<bool>,
}

impl<B: Backend> ClipBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Stack samples into a batch on `device`. All samples must share one shape.
pub fn collate<B: Backend>(
    samples: &[ClipSample],
    device: &B::Device,
) -> DatasetResult<ClipBatch<B>> {
    let first = samples
        .first()
        .ok_or_else(|| DatasetError::Other("cannot collate an empty batch".into()))?;
    let shape = first.shape;
    let [channels, frames, height, width] = shape.dims();
    let n = samples.len();

    let mut clips = Vec::with_capacity(n * shape.numel());
    let mut scores = Vec::with_capacity(n * 2 * frames);
    let mut targets = Vec::with_capacity(n);
    let mut ssl_clips = Vec::with_capacity(n);
    let mut ssl_targets = Vec::with_capacity(n);
    let mut ssl_flags = Vec::with_capacity(n);

    for sample in samples {
        if sample.shape != shape || sample.clip.len() != shape.numel() {
            return Err(DatasetError::Shape {
                id: sample.id.clone(),
                expected: shape.numel(),
                actual: sample.clip.len(),
            });
        }
        if sample.scores.len() != 2 * frames {
            return Err(DatasetError::Shape {
                id: sample.id.clone(),
                expected: 2 * frames,
                actual: sample.scores.len(),
            });
        }
        clips.extend_from_slice(&sample.clip);
        scores.extend_from_slice(&sample.scores);
        targets.push(sample.segments.clone());
        match &sample.ssl {
            Some(view) if view.clip.len() == shape.numel() => {
                ssl_clips.push(Some(Tensor::from_data(
                    TensorData::new(view.clip.clone(), [1, channels, frames, height, width]),
                    device,
                )));
                ssl_targets.push(view.segments.clone());
                ssl_flags.push(true);
            }
            Some(_) => {
                return Err(DatasetError::Shape {
                    id: sample.id.clone(),
                    expected: shape.numel(),
                    actual: sample.ssl.as_ref().map_or(0, |v| v.clip.len()),
                });
            }
            None => {
                ssl_clips.push(None);
                ssl_targets.push(Vec::new());
                ssl_flags.push(false);
            }
        }
    }

    Ok(ClipBatch {
        clips: Tensor::from_data(
            TensorData::new(clips, [n, channels, frames, height, width]),
            device,
        ),
        targets,
        scores: Tensor::from_data(TensorData::new(scores, [n, 2, frames]), device),
        ssl_clips,
        ssl_targets,
        ssl_flags,
    })
}

/// Mirror every frame along the width axis, in place.
pub fn flip_horizontal(clip: &mut [f32], shape: ClipShape) {
    let width = shape.width;
    if width < 2 {
        return;
    }
    for row in clip.chunks_exact_mut(width) {
        row.reverse();
    }
}

/// Shuffling batch loader over a shared [`ClipDataset`].
#[derive(Clone)]
pub struct ClipLoader {
    dataset: Arc<dyn ClipDataset>,
    cfg: LoaderConfig,
}

impl ClipLoader {
    pub fn new(dataset: Arc<dyn ClipDataset>, cfg: LoaderConfig) -> Self {
        Self { dataset, cfg }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Batches one epoch yields.
    pub fn steps_per_epoch(&self) -> usize {
        let bs = self.cfg.batch_size.max(1);
        if self.cfg.drop_last {
            self.len() / bs
        } else {
            self.len().div_ceil(bs)
        }
    }

    /// Start an epoch. `shuffle_seed` orders the samples when shuffling is enabled.
    pub fn epoch(&self, shuffle_seed: u64) -> EpochIter {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.cfg.shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(shuffle_seed));
        }
        let total = order.len();
        let source = if self.cfg.num_workers == 0 {
            Source::Inline {
                dataset: self.dataset.clone(),
                order,
                rng: ChaCha8Rng::seed_from_u64(self.cfg.seed),
            }
        } else {
            self.spawn_workers(Arc::new(order))
        };
        EpochIter {
            source,
            batch_size: self.cfg.batch_size.max(1),
            drop_last: self.cfg.drop_last,
            flip_prob: self.cfg.flip_horizontal_prob,
            next_pos: 0,
            total,
        }
    }

    /// Worker `i` loads positions `i, i + W, ...` in order into its own bounded
    /// queue, so at most `prefetch` samples per worker sit in memory.
    fn spawn_workers(&self, order: Arc<Vec<usize>>) -> Source {
        let workers = self.cfg.num_workers;
        let mut queues = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = bounded(self.cfg.prefetch.max(1));
            queues.push(rx);
            let dataset = self.dataset.clone();
            let order = order.clone();
            let flip_prob = self.cfg.flip_horizontal_prob;
            let mut rng = ChaCha8Rng::seed_from_u64(self.cfg.seed + worker as u64);
            thread::spawn(move || {
                for pos in (worker..order.len()).step_by(workers) {
                    let loaded = dataset
                        .get(order[pos])
                        .map(|sample| augment(sample, flip_prob, &mut rng));
                    let failed = loaded.is_err();
                    if tx.send(loaded).is_err() || failed {
                        break;
                    }
                }
            });
        }
        Source::Workers { queues }
    }
}

fn augment(mut sample: ClipSample, flip_prob: f32, rng: &mut ChaCha8Rng) -> ClipSample {
    if flip_prob > 0.0 && rng.random::<f32>() < flip_prob {
        flip_horizontal(&mut sample.clip, sample.shape);
        if let Some(view) = sample.ssl.as_mut() {
            flip_horizontal(&mut view.clip, sample.shape);
        }
    }
    sample
}

enum Source {
    Inline {
        dataset: Arc<dyn ClipDataset>,
        order: Vec<usize>,
        rng: ChaCha8Rng,
    },
    Workers {
        /// One queue per worker; position `p` comes from `queues[p % W]`.
        queues: Vec<Receiver<DatasetResult<ClipSample>>>,
    },
}

/// One pass over the dataset in epoch order.
pub struct EpochIter {
    source: Source,
    batch_size: usize,
    drop_last: bool,
    flip_prob: f32,
    next_pos: usize,
    total: usize,
}

impl EpochIter {
    pub fn remaining(&self) -> usize {
        self.total - self.next_pos
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<ClipBatch<B>>> {
        let want = self.batch_size.min(self.remaining());
        if want == 0 || (self.drop_last && want < self.batch_size) {
            return Ok(None);
        }
        let mut samples = Vec::with_capacity(want);
        for _ in 0..want {
            samples.push(self.next_sample()?);
        }
        collate(&samples, device).map(Some)
    }

    fn next_sample(&mut self) -> DatasetResult<ClipSample> {
        let pos = self.next_pos;
        let flip_prob = self.flip_prob;
        self.next_pos += 1;
        match &mut self.source {
            Source::Inline {
                dataset,
                order,
                rng,
            } => dataset
                .get(order[pos])
                .map(|sample| augment(sample, flip_prob, rng)),
            Source::Workers { queues } => {
                let queue = &queues[pos % queues.len()];
                queue.recv().unwrap_or_else(|_| {
                    Err(DatasetError::Other(format!(
                        "loader workers stopped before sample {pos}"
                    )))
                })
            }
        }
    }
}
