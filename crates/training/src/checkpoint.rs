//! Per-epoch checkpoint artifacts and resume.
//!
//! Layout under the checkpoint root:
//! - `checkpoint-{epoch}.bin`: detector weights
//! - `checkpoint-{epoch}_cvae.bin`: CVAE weights
//! - `training/checkpoint-{epoch}_state.json`: optimizer records, RNG snapshot, step counters
//!
//! Files are overwritten in place and never deleted.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};
use crate::metrics::StepCounters;
use crate::rng::RngSnapshot;
use models::{Cvae, Detector};

pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStateBundle {
    pub format_version: u32,
    pub epoch: usize,
    /// Burn binary optimizer records, base64 encoded.
    pub detector_optimizer: String,
    pub cvae_optimizer: String,
    pub rng: RngSnapshot,
    pub counters: StepCounters,
}

/// Everything restored from one epoch's checkpoint.
pub struct LoadedCheckpoint<B: AutodiffBackend, OD, OC> {
    pub detector: Detector<B>,
    pub cvae: Cvae<B>,
    pub detector_optim: OD,
    pub cvae_optim: OC,
    pub rng: RngSnapshot,
    pub counters: StepCounters,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights_path(&self, epoch: usize) -> PathBuf {
        self.root.join(format!("checkpoint-{epoch}.bin"))
    }

    pub fn cvae_path(&self, epoch: usize) -> PathBuf {
        self.root.join(format!("checkpoint-{epoch}_cvae.bin"))
    }

    pub fn state_path(&self, epoch: usize) -> PathBuf {
        self.root
            .join("training")
            .join(format!("checkpoint-{epoch}_state.json"))
    }

    pub fn exists(&self, epoch: usize) -> bool {
        self.missing_artifact(epoch).is_none()
    }

    fn missing_artifact(&self, epoch: usize) -> Option<PathBuf> {
        [
            self.weights_path(epoch),
            self.cvae_path(epoch),
            self.state_path(epoch),
        ]
        .into_iter()
        .find(|p| !p.is_file())
    }

    /// Epochs with a complete set of artifacts, ascending.
    pub fn epochs(&self) -> Vec<usize> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut epochs: Vec<usize> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_prefix("checkpoint-")?
                    .strip_suffix(".bin")?
                    .parse()
                    .ok()
            })
            .filter(|epoch| self.exists(*epoch))
            .collect();
        epochs.sort_unstable();
        epochs
    }

    #[allow(clippy::too_many_arguments)]
    pub fn save<B, OD, OC>(
        &self,
        epoch: usize,
        detector: &Detector<B>,
        cvae: &Cvae<B>,
        detector_optim: &OD,
        cvae_optim: &OC,
        rng: RngSnapshot,
        counters: StepCounters,
    ) -> TrainResult<()>
    where
        B: AutodiffBackend,
        OD: Optimizer<Detector<B>, B>,
        OC: Optimizer<Cvae<B>, B>,
    {
        let state_path = self.state_path(epoch);
        if let Some(dir) = state_path.parent() {
            fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        detector
            .clone()
            .save_file(self.weights_path(epoch), &recorder)
            .map_err(|e| {
                TrainError::io(
                    self.weights_path(epoch),
                    std::io::Error::other(e.to_string()),
                )
            })?;
        cvae.clone()
            .save_file(self.cvae_path(epoch), &recorder)
            .map_err(|e| {
                TrainError::io(self.cvae_path(epoch), std::io::Error::other(e.to_string()))
            })?;

        let bytes = BinBytesRecorder::<FullPrecisionSettings>::default();
        let encode = |record: Result<Vec<u8>, burn::record::RecorderError>| {
            record
                .map(|b| STANDARD.encode(b))
                .map_err(|e| TrainError::InvalidState(format!("optimizer record: {e}")))
        };
        let bundle = TrainingStateBundle {
            format_version: STATE_FORMAT_VERSION,
            epoch,
            detector_optimizer: encode(Recorder::<B>::record(
                &bytes,
                detector_optim.to_record(),
                (),
            ))?,
            cvae_optimizer: encode(Recorder::<B>::record(&bytes, cvae_optim.to_record(), ()))?,
            rng,
            counters,
        };
        let json = serde_json::to_vec_pretty(&bundle)
            .map_err(|e| TrainError::InvalidState(format!("state bundle: {e}")))?;
        fs::write(&state_path, json).map_err(|e| TrainError::io(&state_path, e))?;

        tracing::info!(epoch, root = %self.root.display(), "saved checkpoint");
        Ok(())
    }

    /// Restore weights, optimizer records, RNG snapshot and counters saved at `epoch`.
    pub fn load<B, OD, OC>(
        &self,
        epoch: usize,
        detector: Detector<B>,
        cvae: Cvae<B>,
        detector_optim: OD,
        cvae_optim: OC,
        device: &B::Device,
    ) -> TrainResult<LoadedCheckpoint<B, OD, OC>>
    where
        B: AutodiffBackend,
        OD: Optimizer<Detector<B>, B>,
        OC: Optimizer<Cvae<B>, B>,
    {
        if let Some(path) = self.missing_artifact(epoch) {
            return Err(TrainError::CheckpointNotFound { epoch, path });
        }

        let detector = load_weights(detector, &self.weights_path(epoch), device)?;
        let cvae = load_weights(cvae, &self.cvae_path(epoch), device)?;

        let state_path = self.state_path(epoch);
        let raw = fs::read(&state_path).map_err(|e| TrainError::io(&state_path, e))?;
        let bundle: TrainingStateBundle =
            serde_json::from_slice(&raw).map_err(|e| TrainError::corrupt(&state_path, e))?;
        if bundle.format_version != STATE_FORMAT_VERSION {
            return Err(TrainError::corrupt(
                &state_path,
                format!("unsupported state format {}", bundle.format_version),
            ));
        }
        if bundle.epoch != epoch {
            return Err(TrainError::corrupt(
                &state_path,
                format!("bundle records epoch {}, expected {epoch}", bundle.epoch),
            ));
        }

        let bytes = BinBytesRecorder::<FullPrecisionSettings>::default();
        let decode = |field: &str, encoded: &str| {
            STANDARD
                .decode(encoded)
                .map_err(|e| TrainError::corrupt(&state_path, format!("{field}: {e}")))
        };
        let det_record = Recorder::<B>::load(
            &bytes,
            decode("detector_optimizer", &bundle.detector_optimizer)?,
            device,
        )
        .map_err(|e| TrainError::corrupt(&state_path, format!("detector_optimizer: {e}")))?;
        let cvae_record = Recorder::<B>::load(
            &bytes,
            decode("cvae_optimizer", &bundle.cvae_optimizer)?,
            device,
        )
        .map_err(|e| TrainError::corrupt(&state_path, format!("cvae_optimizer: {e}")))?;

        tracing::info!(epoch, root = %self.root.display(), "loaded checkpoint");
        Ok(LoadedCheckpoint {
            detector,
            cvae,
            detector_optim: detector_optim.load_record(det_record),
            cvae_optim: cvae_optim.load_record(cvae_record),
            rng: bundle.rng,
            counters: bundle.counters,
        })
    }
}

/// Load a full-precision weight file into `module`, rejecting records whose
/// parameter set does not match the live module.
pub fn load_weights<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> TrainResult<M> {
    if !path.is_file() {
        return Err(TrainError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "weight file not found"),
        ));
    }
    let expected = module.num_params();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let loaded = module
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| TrainError::corrupt(path, e))?;
    if loaded.num_params() != expected {
        return Err(TrainError::corrupt(
            path,
            format!(
                "parameter count {} does not match model ({expected})",
                loaded.num_params()
            ),
        ));
    }
    Ok(loaded)
}
