use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::record::{AdaptorRecord, AdaptorRecordV1};
use burn::optim::{Adam, AdamConfig, Optimizer};
use burn::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use clip_dataset::{ClipLoader, ClipShape, InMemoryDataset};
use models::{Cvae, Detector};
use training::{
    CheckpointStore, EpochRunner, RngStates, ScalarWriter, StepCounters, TrainConfig, TrainError,
    TrainState,
};

type B = Autodiff<NdArray<f32>>;
type State = TrainState<
    B,
    OptimizerAdaptor<Adam, Detector<B>, B>,
    OptimizerAdaptor<Adam, Cvae<B>, B>,
>;

const SHAPE: ClipShape = ClipShape {
    channels: 3,
    frames: 8,
    height: 2,
    width: 2,
};

fn config(root: &Path) -> TrainConfig {
    let mut cfg = TrainConfig::default();
    cfg.training.batch_size = 2;
    cfg.training.num_workers = 0;
    cfg.training.checkpoint_path = root.join("ckpt");
    cfg.training.log_dir = root.join("logs");
    cfg.dataset.num_classes = 3;
    cfg.model.feature_dim = 8;
    cfg.model.hidden = 8;
    cfg.model.embed_dim = 4;
    cfg.model.boundary_channels = 2;
    cfg.model.dropout = 0.0;
    cfg.model.latent_dim = 4;
    cfg.model.cvae_hidden = 8;
    cfg
}

fn fresh_state(cfg: &TrainConfig) -> State {
    let device = Default::default();
    TrainState {
        detector: Detector::new(cfg.detector_config(), &device),
        cvae: Cvae::new(cfg.cvae_config(), &device),
        detector_optim: AdamConfig::new().init(),
        cvae_optim: AdamConfig::new().init(),
    }
}

fn attention_output(detector: &Detector<B>) -> Vec<f32> {
    let clip = Tensor::<B, 5>::from_data(
        TensorData::new(
            (0..SHAPE.numel()).map(|v| v as f32 / 10.0).collect::<Vec<_>>(),
            [1, SHAPE.channels, SHAPE.frames, SHAPE.height, SHAPE.width],
        ),
        &Default::default(),
    );
    let features = detector.backbone(clip);
    detector
        .attention(&features)
        .mixed_4f
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

/// Adam step count and first-moment sum per parameter id.
fn adam_moments<M: AutodiffModule<B>>(
    optim: &OptimizerAdaptor<Adam, M, B>,
) -> BTreeMap<u64, (usize, f32)> {
    macro_rules! moments {
        ($state:expr) => {
            (
                $state.momentum.time,
                $state.momentum.moment_1.sum().into_scalar(),
            )
        };
    }
    optim
        .to_record()
        .into_iter()
        .map(|(id, record)| {
            let AdaptorRecord::V1(record) = record;
            let entry = match record {
                AdaptorRecordV1::Rank0(s) => moments!(s),
                AdaptorRecordV1::Rank1(s) => moments!(s),
                AdaptorRecordV1::Rank2(s) => moments!(s),
                AdaptorRecordV1::Rank3(s) => moments!(s),
                AdaptorRecordV1::Rank4(s) => moments!(s),
                AdaptorRecordV1::Rank5(s) => moments!(s),
                AdaptorRecordV1::Rank6(s) => moments!(s),
                AdaptorRecordV1::Rank7(s) => moments!(s),
                AdaptorRecordV1::Rank8(s) => moments!(s),
            };
            (id.val(), entry)
        })
        .collect()
}

fn assert_same_moments(
    restored: BTreeMap<u64, (usize, f32)>,
    trained: BTreeMap<u64, (usize, f32)>,
) {
    assert!(!trained.is_empty());
    assert_eq!(
        restored.keys().collect::<Vec<_>>(),
        trained.keys().collect::<Vec<_>>()
    );
    for (id, (time, moment)) in &trained {
        // At most one step per batch, two batches per epoch.
        assert!((1..=2).contains(time), "param {id} has {time} steps");
        let (restored_time, restored_moment) = restored[id];
        assert_eq!(restored_time, *time, "param {id}");
        assert!((restored_moment - moment).abs() <= 1e-6 * moment.abs().max(1.0));
    }
}

/// Train one epoch and checkpoint it; returns the runner so its RNG can be inspected.
fn train_and_save(cfg: &TrainConfig, state: &mut State) -> EpochRunner {
    let store = CheckpointStore::new(&cfg.training.checkpoint_path);
    let scalars = ScalarWriter::open(&cfg.training.log_dir).unwrap();
    let mut runner = EpochRunner::new(
        cfg,
        RngStates::from_seed(3),
        StepCounters::default(),
        scalars,
        store,
    )
    .with_progress(false);
    let loader = ClipLoader::new(
        Arc::new(InMemoryDataset::synthetic(4, SHAPE, 3, 5)),
        cfg.loader_config(),
    );
    runner
        .train_epoch(1, state, &loader, &Default::default())
        .unwrap();
    runner.checkpoint(1, state).unwrap();
    runner
}

#[test]
fn checkpoint_restores_weights_counters_rng_and_optimizers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut state = fresh_state(&cfg);
    let runner = train_and_save(&cfg, &mut state);
    let expected_draw = runner.rng().clone().next_shuffle_seed();

    let store = CheckpointStore::new(&cfg.training.checkpoint_path);
    let fresh = fresh_state(&cfg);
    let loaded = store
        .load(
            1,
            fresh.detector,
            fresh.cvae,
            fresh.detector_optim,
            fresh.cvae_optim,
            &Default::default(),
        )
        .unwrap();

    assert_eq!(loaded.counters, StepCounters { main: 2, cvae: 2 });
    assert_eq!(attention_output(&loaded.detector), attention_output(&state.detector));

    let mut rng = RngStates::from_seed(0);
    rng.restore(&loaded.rng).unwrap();
    assert_eq!(rng.next_shuffle_seed(), expected_draw);

    assert_same_moments(
        adam_moments(&loaded.detector_optim),
        adam_moments(&state.detector_optim),
    );
    assert_same_moments(
        adam_moments(&loaded.cvae_optim),
        adam_moments(&state.cvae_optim),
    );
}

#[test]
fn missing_epoch_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let fresh = fresh_state(&cfg);
    let store = CheckpointStore::new(&cfg.training.checkpoint_path);
    let err = store
        .load(
            4,
            fresh.detector,
            fresh.cvae,
            fresh.detector_optim,
            fresh.cvae_optim,
            &Default::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::CheckpointNotFound { epoch: 4, .. }));
}

#[test]
fn mismatched_weights_are_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut state = fresh_state(&cfg);
    train_and_save(&cfg, &mut state);

    let store = CheckpointStore::new(&cfg.training.checkpoint_path);
    std::fs::copy(store.cvae_path(1), store.weights_path(1)).unwrap();
    let fresh = fresh_state(&cfg);
    let err = store
        .load(
            1,
            fresh.detector,
            fresh.cvae,
            fresh.detector_optim,
            fresh.cvae_optim,
            &Default::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::CorruptCheckpoint { .. }), "{err}");
}

#[test]
fn damaged_state_bundle_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut state = fresh_state(&cfg);
    train_and_save(&cfg, &mut state);

    let store = CheckpointStore::new(&cfg.training.checkpoint_path);
    std::fs::write(store.state_path(1), b"{ not json").unwrap();
    let fresh = fresh_state(&cfg);
    let err = store
        .load(
            1,
            fresh.detector,
            fresh.cvae,
            fresh.detector_optim,
            fresh.cvae_optim,
            &Default::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::CorruptCheckpoint { .. }));
}
