use std::path::PathBuf;

use clap::Parser;
use training::{ConfigError, TrainArgs, TrainConfig};

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs/thumos14.toml")
}

#[test]
fn shipped_config_matches_defaults() {
    let cfg = TrainConfig::from_path(&shipped_config()).unwrap();
    let defaults = TrainConfig::default();
    assert_eq!(cfg.training.batch_size, defaults.training.batch_size);
    assert_eq!(cfg.training.max_epoch, 16);
    assert_eq!(cfg.training.random_seed, 2020);
    assert_eq!(cfg.training.background_scale, 35.0);
    assert_eq!(cfg.training.cvae_betas, [0.8, 0.999]);
    assert_eq!(cfg.dataset.num_classes, 21);
    assert!(cfg.dataset.validation_manifest.is_none());
}

#[test]
fn cli_overrides_file_values() {
    let config = shipped_config();
    let args = TrainArgs::parse_from([
        "train",
        "--config",
        config.to_str().unwrap(),
        "--batch-size",
        "4",
        "--resume",
        "3",
        "--ssl",
        "0",
        "--validate",
    ]);
    let cfg = args.resolve_config().unwrap();
    assert_eq!(cfg.training.batch_size, 4);
    assert_eq!(cfg.training.resume, 3);
    assert_eq!(cfg.training.ssl, 0.0);
    assert!(cfg.training.validate);
    assert_eq!(cfg.training.lw, 10.0);
}

#[test]
fn override_is_validated() {
    let config = shipped_config();
    let args = TrainArgs::parse_from([
        "train",
        "--config",
        config.to_str().unwrap(),
        "--resume",
        "16",
    ]);
    assert!(matches!(
        args.resolve_config(),
        Err(ConfigError::Invalid {
            key: "training.resume",
            ..
        })
    ));
}

#[test]
fn unreadable_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    assert!(matches!(
        TrainConfig::from_path(&missing),
        Err(ConfigError::Read { .. })
    ));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[training]\nbatch_size = \"two\"\n").unwrap();
    assert!(matches!(
        TrainConfig::from_path(&bad),
        Err(ConfigError::Parse { .. })
    ));
}
