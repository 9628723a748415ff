//! Seeded random streams with capture/restore for exact resume.
//!
//! All four streams share one ChaCha key derived from the run seed and differ by
//! stream id, so draws from one never shift another. A snapshot records the seed
//! plus each stream's word position, which is enough to rebuild the generators.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Stream names in snapshot order.
pub const STREAM_NAMES: [&str; 4] = ["general", "numeric", "tensor_host", "tensor_device"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub name: String,
    pub stream: u64,
    /// 128-bit word position split into high/low halves.
    pub word_pos_hi: u64,
    pub word_pos_lo: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub version: u32,
    pub seed: u64,
    pub streams: Vec<StreamState>,
}

#[derive(Debug, Clone)]
pub struct RngStates {
    seed: u64,
    /// Epoch shuffling and other general-purpose draws.
    general: ChaCha8Rng,
    /// Host-side noise arrays (CVAE latent samples).
    numeric: ChaCha8Rng,
    tensor_host: ChaCha8Rng,
    tensor_device: ChaCha8Rng,
}

impl RngStates {
    pub fn from_seed(seed: u64) -> Self {
        let stream = |id: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(id);
            rng
        };
        Self {
            seed,
            general: stream(0),
            numeric: stream(1),
            tensor_host: stream(2),
            tensor_device: stream(3),
        }
    }

    fn streams(&self) -> [&ChaCha8Rng; 4] {
        [
            &self.general,
            &self.numeric,
            &self.tensor_host,
            &self.tensor_device,
        ]
    }

    pub fn capture(&self) -> RngSnapshot {
        let streams = self
            .streams()
            .iter()
            .zip(STREAM_NAMES)
            .map(|(rng, name)| {
                let pos = rng.get_word_pos();
                StreamState {
                    name: name.to_string(),
                    stream: rng.get_stream(),
                    word_pos_hi: (pos >> 64) as u64,
                    word_pos_lo: pos as u64,
                }
            })
            .collect();
        RngSnapshot {
            version: SNAPSHOT_VERSION,
            seed: self.seed,
            streams,
        }
    }

    /// Replace every stream with the captured state. Nothing changes on error.
    pub fn restore(&mut self, snapshot: &RngSnapshot) -> TrainResult<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(TrainError::InvalidState(format!(
                "unsupported rng snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.streams.len() != STREAM_NAMES.len() {
            return Err(TrainError::InvalidState(format!(
                "rng snapshot has {} streams, expected {}",
                snapshot.streams.len(),
                STREAM_NAMES.len()
            )));
        }
        let mut restored = Self::from_seed(snapshot.seed);
        let targets = [
            &mut restored.general,
            &mut restored.numeric,
            &mut restored.tensor_host,
            &mut restored.tensor_device,
        ];
        for (id, (rng, state)) in targets.into_iter().zip(&snapshot.streams).enumerate() {
            if state.name != STREAM_NAMES[id] || state.stream != id as u64 {
                return Err(TrainError::InvalidState(format!(
                    "rng stream {id} is `{}` (stream id {}), expected `{}`",
                    state.name, state.stream, STREAM_NAMES[id]
                )));
            }
            rng.set_word_pos(((state.word_pos_hi as u128) << 64) | state.word_pos_lo as u128);
        }
        *self = restored;
        Ok(())
    }

    /// Reseed the Burn backend from the tensor streams.
    pub fn seed_backend<B: burn::tensor::backend::Backend>(&mut self) {
        let host = self.tensor_host.next_u64();
        #[cfg(feature = "backend-wgpu")]
        let host = host ^ self.tensor_device.next_u64().rotate_left(32);
        B::seed(host);
    }

    /// Seed for the next epoch's sample order.
    pub fn next_shuffle_seed(&mut self) -> u64 {
        self.general.next_u64()
    }

    /// `n` standard-normal samples (Box-Muller) from the numeric stream.
    pub fn normal(&mut self, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n + 1);
        while out.len() < n {
            // (0, 1] keeps the log finite.
            let u1: f32 = 1.0 - self.numeric.random::<f32>();
            let u2: f32 = self.numeric.random::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = std::f32::consts::TAU * u2;
            out.push(r * theta.cos());
            out.push(r * theta.sin());
        }
        out.truncate(n);
        out
    }
}

/// Seed every stream and the backend. Call before any stochastic operation.
pub fn set_seed<B: burn::tensor::backend::Backend>(seed: u64) -> RngStates {
    let mut states = RngStates::from_seed(seed);
    states.seed_backend::<B>();
    tracing::debug!(seed, "seeded rng streams");
    states
}
