//! TOML training configuration with THUMOS14 defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use clip_dataset::LoaderConfig;
use models::{CvaeConfig, DetectorConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub training: TrainingSection,
    pub dataset: DatasetSection,
    pub model: ModelSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingSection {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    pub max_epoch: usize,
    pub checkpoint_path: PathBuf,
    /// Full detector weights loaded before epoch 1 when not resuming.
    pub pretrained_path: Option<PathBuf>,
    pub pretrained_cvae_path: Option<PathBuf>,
    pub focal_loss: bool,
    pub random_seed: u64,
    /// Last completed epoch to resume from; 0 starts fresh.
    pub resume: usize,
    /// Localization loss weight.
    pub lw: f32,
    /// Classification loss weight.
    pub cw: f32,
    /// Positive IoU threshold for prior matching.
    pub piou: f32,
    /// Triplet loss weight; 0 disables the self-supervised pass.
    pub ssl: f32,
    pub background_scale: f32,
    pub recon_max_weight: f32,
    pub boundary_prop_weight: f32,
    pub betas: [f32; 2],
    pub cvae_learning_rate: f64,
    pub cvae_betas: [f32; 2],
    pub log_dir: PathBuf,
    /// Run a validation epoch after every training epoch when a validation manifest is set.
    pub validate: bool,
    pub num_workers: usize,
    pub prefetch: usize,
    /// Base seed for data-loading workers (`worker_seed + worker_id`).
    pub worker_seed: u64,
    pub flip_horizontal_prob: f32,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            batch_size: 1,
            learning_rate: 1e-5,
            weight_decay: 1e-3,
            max_epoch: 16,
            checkpoint_path: PathBuf::from("models/thumos14"),
            pretrained_path: None,
            pretrained_cvae_path: None,
            focal_loss: true,
            random_seed: 2020,
            resume: 0,
            lw: 10.0,
            cw: 1.0,
            piou: 0.5,
            ssl: 0.1,
            background_scale: 35.0,
            recon_max_weight: 0.5,
            boundary_prop_weight: 0.1,
            betas: [0.9, 0.999],
            cvae_learning_rate: 1e-3,
            cvae_betas: [0.8, 0.999],
            log_dir: PathBuf::from("logs/thumos14"),
            validate: false,
            num_workers: 4,
            prefetch: 8,
            worker_seed: 1,
            flip_horizontal_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetSection {
    /// Class count including background.
    pub num_classes: usize,
    pub training_manifest: PathBuf,
    pub validation_manifest: Option<PathBuf>,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            num_classes: 21,
            training_manifest: PathBuf::from("datasets/thumos14/train/manifest.json"),
            validation_manifest: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub in_channels: usize,
    pub feature_dim: usize,
    pub hidden: usize,
    pub embed_dim: usize,
    pub boundary_channels: usize,
    pub dropout: f64,
    pub latent_dim: usize,
    pub cvae_hidden: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        let det = DetectorConfig::default();
        let cvae = CvaeConfig::default();
        Self {
            in_channels: det.in_channels,
            feature_dim: det.feature_dim,
            hidden: det.hidden,
            embed_dim: det.embed_dim,
            boundary_channels: det.boundary_channels,
            dropout: det.dropout,
            latent_dim: cvae.latent_dim,
            cvae_hidden: cvae.hidden,
        }
    }
}

impl TrainConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: TrainConfig = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.training;
        let invalid = |key: &'static str, msg: &str| {
            Err(ConfigError::Invalid {
                key,
                msg: msg.to_string(),
            })
        };
        if t.batch_size == 0 {
            return invalid("training.batch_size", "must be at least 1");
        }
        if t.max_epoch == 0 {
            return invalid("training.max_epoch", "must be at least 1");
        }
        if t.resume >= t.max_epoch {
            return invalid("training.resume", "must be below max_epoch");
        }
        if !(t.learning_rate > 0.0) || !(t.cvae_learning_rate > 0.0) {
            return invalid("training.learning_rate", "learning rates must be positive");
        }
        if !(t.piou > 0.0 && t.piou <= 1.0) {
            return invalid("training.piou", "must be in (0, 1]");
        }
        if t.ssl < 0.0 || t.background_scale < 0.0 || t.recon_max_weight < 0.0 {
            return invalid("training", "loss weights must be non-negative");
        }
        if !(0.0..=1.0).contains(&t.flip_horizontal_prob) {
            return invalid("training.flip_horizontal_prob", "must be in [0, 1]");
        }
        if self.dataset.num_classes < 2 {
            return invalid("dataset.num_classes", "needs background plus one action class");
        }
        let m = &self.model;
        if m.feature_dim == 0 || m.hidden == 0 || m.latent_dim == 0 || m.boundary_channels == 0 {
            return invalid("model", "dimensions must be non-zero");
        }
        if !(0.0..1.0).contains(&m.dropout) {
            return invalid("model.dropout", "must be in [0, 1)");
        }
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            in_channels: self.model.in_channels,
            feature_dim: self.model.feature_dim,
            hidden: self.model.hidden,
            num_classes: self.dataset.num_classes,
            boundary_channels: self.model.boundary_channels,
            embed_dim: self.model.embed_dim,
            dropout: self.model.dropout,
        }
    }

    pub fn cvae_config(&self) -> CvaeConfig {
        CvaeConfig {
            feature_dim: self.model.feature_dim,
            latent_dim: self.model.latent_dim,
            hidden: self.model.cvae_hidden,
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        let t = &self.training;
        LoaderConfig {
            batch_size: t.batch_size,
            shuffle: true,
            drop_last: true,
            num_workers: t.num_workers,
            prefetch: t.prefetch,
            seed: t.worker_seed,
            flip_horizontal_prob: t.flip_horizontal_prob,
        }
    }
}
