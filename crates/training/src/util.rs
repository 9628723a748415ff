use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::backend::Autodiff;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Parser, ValueEnum};

use crate::checkpoint::{load_weights, CheckpointStore};
use crate::config::TrainConfig;
use crate::error::{ConfigError, TrainError, TrainResult};
use crate::metrics::{EpochSummary, ScalarWriter, StepCounters};
use crate::rng::{set_seed, RngStates};
use crate::runner::{EpochRunner, TrainState};
use crate::TrainBackend;
use clip_dataset::{ClipDataset, ClipLoader, ManifestDataset};
use models::{Cvae, Detector, PRIOR_STRIDE};

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the temporal action detector and its CVAE (resumable per epoch)"
)]
pub struct TrainArgs {
    /// TOML config file; command-line values override it.
    #[arg(long, default_value = "configs/thumos14.toml")]
    pub config: PathBuf,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub max_epoch: Option<usize>,
    /// Last completed epoch to resume from.
    #[arg(long)]
    pub resume: Option<usize>,
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    pub pretrained_path: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[arg(long)]
    pub random_seed: Option<u64>,
    /// Triplet loss weight; 0 disables the self-supervised pass.
    #[arg(long)]
    pub ssl: Option<f32>,
    #[arg(long)]
    pub num_workers: Option<usize>,
    /// Run a validation epoch after each training epoch.
    #[arg(long)]
    pub validate: bool,
    /// Hide the per-batch progress bar.
    #[arg(long)]
    pub no_progress: bool,
}

impl TrainArgs {
    /// Config file plus overrides, validated.
    pub fn resolve_config(&self) -> Result<TrainConfig, ConfigError> {
        let mut cfg = TrainConfig::from_path(&self.config)?;
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply(&self, cfg: &mut TrainConfig) {
        let t = &mut cfg.training;
        if let Some(v) = self.batch_size {
            t.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            t.learning_rate = v;
        }
        if let Some(v) = self.max_epoch {
            t.max_epoch = v;
        }
        if let Some(v) = self.resume {
            t.resume = v;
        }
        if let Some(v) = &self.checkpoint_path {
            t.checkpoint_path = v.clone();
        }
        if let Some(v) = &self.pretrained_path {
            t.pretrained_path = Some(v.clone());
        }
        if let Some(v) = &self.log_dir {
            t.log_dir = v.clone();
        }
        if let Some(v) = self.random_seed {
            t.random_seed = v;
        }
        if let Some(v) = self.ssl {
            t.ssl = v;
        }
        if let Some(v) = self.num_workers {
            t.num_workers = v;
        }
        t.validate |= self.validate;
    }
}

/// Summaries of every epoch a [`fit`] call ran.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub first_epoch: usize,
    pub train: Vec<EpochSummary>,
    pub val: Vec<EpochSummary>,
    pub counters: StepCounters,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve_config()?;
    tracing::info!(
        batch_size = cfg.training.batch_size,
        learning_rate = cfg.training.learning_rate,
        max_epoch = cfg.training.max_epoch,
        num_classes = cfg.dataset.num_classes,
        checkpoint_path = %cfg.training.checkpoint_path.display(),
        focal_loss = cfg.training.focal_loss,
        random_seed = cfg.training.random_seed,
        resume = cfg.training.resume,
        "training configuration"
    );

    let train_set = open_dataset(&cfg.dataset.training_manifest)?;
    let val_set = match &cfg.dataset.validation_manifest {
        Some(path) if cfg.training.validate => Some(open_dataset(path)?),
        _ => None,
    };

    let device = <TrainBackend as Backend>::Device::default();
    let report = fit::<Autodiff<TrainBackend>>(
        &cfg,
        train_set,
        val_set,
        &device,
        !args.no_progress,
    )?;
    tracing::info!(
        epochs = report.train.len(),
        main_steps = report.counters.main,
        cvae_steps = report.counters.cvae,
        "training finished"
    );
    Ok(())
}

pub fn open_dataset(manifest: &Path) -> TrainResult<Arc<dyn ClipDataset>> {
    let dataset = ManifestDataset::open(manifest)?;
    tracing::info!(
        manifest = %manifest.display(),
        clips = dataset.len(),
        "opened clip manifest"
    );
    Ok(Arc::new(dataset))
}

/// Reject datasets whose clip layout the configured networks cannot consume.
pub fn check_dataset(cfg: &TrainConfig, dataset: &dyn ClipDataset) -> Result<(), ConfigError> {
    let shape = dataset.shape();
    if shape.frames == 0 || shape.frames % PRIOR_STRIDE != 0 {
        return Err(ConfigError::Invalid {
            key: "clip_shape.frames",
            msg: format!("{} frames is not a positive multiple of {PRIOR_STRIDE}", shape.frames),
        });
    }
    if shape.channels != cfg.model.in_channels {
        return Err(ConfigError::Invalid {
            key: "model.in_channels",
            msg: format!("clips have {} channels", shape.channels),
        });
    }
    if dataset.num_classes() != cfg.dataset.num_classes {
        return Err(ConfigError::Invalid {
            key: "dataset.num_classes",
            msg: format!("manifest declares {} classes", dataset.num_classes()),
        });
    }
    Ok(())
}

/// Train from `cfg.training.resume + 1` through `max_epoch`, checkpointing every epoch.
pub fn fit<B: AutodiffBackend>(
    cfg: &TrainConfig,
    train_set: Arc<dyn ClipDataset>,
    val_set: Option<Arc<dyn ClipDataset>>,
    device: &B::Device,
    show_progress: bool,
) -> TrainResult<TrainReport> {
    let t = &cfg.training;
    check_dataset(cfg, train_set.as_ref())?;
    if let Some(val) = &val_set {
        check_dataset(cfg, val.as_ref())?;
    }

    let mut rng = set_seed::<B>(t.random_seed);
    let detector = Detector::<B>::new(cfg.detector_config(), device);
    let cvae = Cvae::<B>::new(cfg.cvae_config(), device);
    let detector_optim = AdamConfig::new()
        .with_beta_1(t.betas[0])
        .with_beta_2(t.betas[1])
        .with_weight_decay(Some(WeightDecayConfig::new(t.weight_decay)))
        .init::<B, Detector<B>>();
    let cvae_optim = AdamConfig::new()
        .with_beta_1(t.cvae_betas[0])
        .with_beta_2(t.cvae_betas[1])
        .init::<B, Cvae<B>>();

    let store = CheckpointStore::new(&t.checkpoint_path);
    let (mut state, counters) = if t.resume > 0 {
        let loaded = store.load(t.resume, detector, cvae, detector_optim, cvae_optim, device)?;
        rng.restore(&loaded.rng)?;
        tracing::info!(epoch = t.resume, "resuming training");
        let state = TrainState {
            detector: loaded.detector,
            cvae: loaded.cvae,
            detector_optim: loaded.detector_optim,
            cvae_optim: loaded.cvae_optim,
        };
        (state, loaded.counters)
    } else {
        let detector = match &t.pretrained_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading pretrained detector");
                load_weights(detector, path, device)?
            }
            None => detector,
        };
        let cvae = match &t.pretrained_cvae_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading pretrained cvae");
                load_weights(cvae, path, device)?
            }
            None => cvae,
        };
        let state = TrainState {
            detector,
            cvae,
            detector_optim,
            cvae_optim,
        };
        (state, StepCounters::default())
    };

    let scalars = ScalarWriter::open(&t.log_dir)?;
    let mut runner =
        EpochRunner::new(cfg, rng, counters, scalars, store).with_progress(show_progress);
    let loader_cfg = cfg.loader_config();
    let train_loader = ClipLoader::new(train_set, loader_cfg.clone());
    let val_loader = val_set
        .filter(|_| t.validate)
        .map(|set| ClipLoader::new(set, loader_cfg.for_eval()));
    if train_loader.steps_per_epoch() == 0 {
        tracing::warn!(
            clips = train_loader.len(),
            batch_size = t.batch_size,
            "training set is smaller than one batch"
        );
    }

    let mut report = TrainReport {
        first_epoch: t.resume + 1,
        ..Default::default()
    };
    for epoch in report.first_epoch..=t.max_epoch {
        report
            .train
            .push(runner.train_epoch(epoch, &mut state, &train_loader, device)?);
        if let Some(loader) = &val_loader {
            report.val.push(runner.validate_epoch(
                epoch,
                &state.detector,
                &state.cvae,
                loader,
                device,
            )?);
        }
        runner.checkpoint(epoch, &state)?;
    }
    report.counters = runner.counters();
    Ok(report)
}

/// Load the weights saved at `epoch` (latest when `None`) and run one validation pass.
pub fn evaluate_checkpoint<B: Backend>(
    cfg: &TrainConfig,
    epoch: Option<usize>,
    dataset: Arc<dyn ClipDataset>,
    device: &B::Device,
    show_progress: bool,
) -> TrainResult<EpochSummary> {
    check_dataset(cfg, dataset.as_ref())?;
    let store = CheckpointStore::new(&cfg.training.checkpoint_path);
    let epoch = match epoch.or_else(|| store.epochs().last().copied()) {
        Some(epoch) => epoch,
        None => {
            return Err(TrainError::CheckpointNotFound {
                epoch: 0,
                path: store.root().to_path_buf(),
            })
        }
    };
    if !store.exists(epoch) {
        return Err(TrainError::CheckpointNotFound {
            epoch,
            path: store.weights_path(epoch),
        });
    }

    let rng = RngStates::from_seed(cfg.training.random_seed);
    let detector = load_weights(
        Detector::<B>::new(cfg.detector_config(), device),
        &store.weights_path(epoch),
        device,
    )?;
    let cvae = load_weights(
        Cvae::<B>::new(cfg.cvae_config(), device),
        &store.cvae_path(epoch),
        device,
    )?;

    let scalars = ScalarWriter::open(&cfg.training.log_dir.join("eval"))?;
    let mut runner = EpochRunner::new(cfg, rng, StepCounters::default(), scalars, store)
        .with_progress(show_progress);
    let loader = ClipLoader::new(dataset, cfg.loader_config().for_eval());
    runner.evaluate(epoch, &detector, &cvae, &loader, device)
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!(
                "backend-wgpu feature not enabled; rebuild with --features backend-wgpu \
                 or choose ndarray backend"
            )
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!(
                "built with backend-wgpu; training will still use the WGPU backend \
                 despite --backend ndarray"
            );
        }
        _ => {}
    }
    Ok(())
}
