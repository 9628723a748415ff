use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use training::util::{evaluate_checkpoint, open_dataset, validate_backend_choice, BackendKind};
use training::{TrainBackend, TrainConfig};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Run one validation epoch of a saved detector/CVAE checkpoint"
)]
struct Args {
    /// TOML config the checkpoint was trained with.
    #[arg(long, default_value = "configs/thumos14.toml")]
    config: PathBuf,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Epoch to load; defaults to the latest complete checkpoint.
    #[arg(long)]
    epoch: Option<usize>,
    /// Manifest to evaluate; defaults to the configured validation manifest.
    #[arg(long)]
    manifest: Option<PathBuf>,
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let mut cfg = TrainConfig::from_path(&args.config)?;
    if let Some(path) = args.checkpoint_path {
        cfg.training.checkpoint_path = path;
    }
    let manifest = match args.manifest.or_else(|| cfg.dataset.validation_manifest.clone()) {
        Some(path) => path,
        None => anyhow::bail!(
            "no manifest given and {} has no dataset.validation_manifest",
            args.config.display()
        ),
    };

    let dataset = open_dataset(&manifest)?;
    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let summary =
        evaluate_checkpoint::<TrainBackend>(&cfg, args.epoch, dataset, &device, !args.no_progress)?;
    println!("{summary}");
    Ok(())
}
