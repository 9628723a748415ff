//! End-to-end checks for manifest loading and epoch batching.

use burn_ndarray::NdArray;
use clip_dataset::{
    write_clip_file, ClipDataset, ClipEntry, ClipLoader, ClipManifest, ClipSample, ClipShape,
    DatasetError, DatasetResult, InMemoryDataset, LoaderConfig, ManifestDataset, Segment,
    SslEntry, MANIFEST_VERSION,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type B = NdArray<f32>;

const SHAPE: ClipShape = ClipShape {
    channels: 3,
    frames: 8,
    height: 2,
    width: 2,
};

/// Writes `count` clips whose values all equal their index, so batches reveal sample order.
fn write_manifest(root: &Path, count: usize) -> anyhow::Result<std::path::PathBuf> {
    let mut clips = Vec::new();
    for i in 0..count {
        let path = format!("clips/clip_{i:03}.f32");
        write_clip_file(&root.join(&path), &vec![i as f32; SHAPE.numel()])?;
        let ssl = if i % 2 == 0 {
            let ssl_path = format!("clips/clip_{i:03}_ssl.f32");
            write_clip_file(&root.join(&ssl_path), &vec![0.5; SHAPE.numel()])?;
            Some(SslEntry {
                path: ssl_path,
                segments: vec![Segment::new(0.2, 0.8, 1)],
            })
        } else {
            None
        };
        clips.push(ClipEntry {
            id: format!("clip_{i:03}"),
            path,
            segments: vec![Segment::new(0.1, 0.4, 1), Segment::new(0.6, 0.9, 2)],
            ssl,
        });
    }
    let manifest = ClipManifest {
        version: MANIFEST_VERSION,
        num_classes: 3,
        clip_shape: SHAPE,
        clips,
    };
    let manifest_path = root.join("manifest.json");
    manifest.save(&manifest_path)?;
    Ok(manifest_path)
}

fn first_values(loader: &ClipLoader, seed: u64) -> anyhow::Result<Vec<f32>> {
    let device = Default::default();
    let mut iter = loader.epoch(seed);
    let mut out = Vec::new();
    while let Some(batch) = iter.next_batch::<B>(&device)? {
        let [n, ..] = batch.clips.dims();
        let values = batch.clips.into_data().to_vec::<f32>().unwrap_or_default();
        let stride = values.len() / n;
        out.extend(values.chunks(stride).map(|c| c[0]));
    }
    Ok(out)
}

#[test]
fn manifest_dataset_batches_with_ssl_views() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = write_manifest(dir.path(), 5)?;
    let dataset = Arc::new(ManifestDataset::open(&manifest)?);
    assert_eq!(dataset.len(), 5);

    let loader = ClipLoader::new(
        dataset,
        LoaderConfig {
            batch_size: 2,
            shuffle: false,
            drop_last: true,
            num_workers: 2,
            prefetch: 2,
            ..Default::default()
        },
    );
    assert_eq!(loader.steps_per_epoch(), 2);

    let device = Default::default();
    let mut iter = loader.epoch(0);
    let batch = iter.next_batch::<B>(&device)?.expect("first batch");
    assert_eq!(batch.clips.dims(), [2, 3, 8, 2, 2]);
    assert_eq!(batch.scores.dims(), [2, 2, 8]);
    assert_eq!(batch.ssl_flags, vec![true, false]);
    assert!(batch.ssl_clips[0].is_some() && batch.ssl_clips[1].is_none());
    assert_eq!(batch.targets[0].len(), 2);

    assert!(iter.next_batch::<B>(&device)?.is_some());
    // Fifth sample is dropped.
    assert!(iter.next_batch::<B>(&device)?.is_none());
    Ok(())
}

#[test]
fn worker_order_matches_inline_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = write_manifest(dir.path(), 9)?;
    let dataset: Arc<dyn ClipDataset> = Arc::new(ManifestDataset::open(&manifest)?);
    let cfg = LoaderConfig {
        batch_size: 3,
        shuffle: true,
        drop_last: false,
        num_workers: 0,
        prefetch: 1,
        ..Default::default()
    };
    let inline = ClipLoader::new(dataset.clone(), cfg.clone());
    let threaded = ClipLoader::new(
        dataset,
        LoaderConfig {
            num_workers: 3,
            ..cfg
        },
    );

    let a = first_values(&inline, 11)?;
    let b = first_values(&threaded, 11)?;
    assert_eq!(a, b);
    assert_eq!(a.len(), 9);
    assert_ne!(a, first_values(&inline, 12)?);
    Ok(())
}

#[test]
fn truncated_clip_file_is_a_shape_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = write_manifest(dir.path(), 1)?;
    write_clip_file(&dir.path().join("clips/clip_000.f32"), &[1.0, 2.0])?;
    let dataset = ManifestDataset::open(&manifest)?;
    assert!(matches!(dataset.get(0), Err(DatasetError::Shape { .. })));
    Ok(())
}

#[test]
fn synthetic_dataset_feeds_loader() -> anyhow::Result<()> {
    let dataset = Arc::new(InMemoryDataset::synthetic(6, SHAPE, 4, 3));
    let loader = ClipLoader::new(
        dataset,
        LoaderConfig {
            batch_size: 4,
            num_workers: 1,
            flip_horizontal_prob: 0.5,
            ..Default::default()
        },
    );
    assert_eq!(loader.steps_per_epoch(), 1);
    let device = Default::default();
    let mut iter = loader.epoch(5);
    let batch = iter.next_batch::<B>(&device)?.expect("one full batch");
    assert_eq!(batch.len(), 4);
    assert!(iter.next_batch::<B>(&device)?.is_none());
    Ok(())
}

/// Counts finished loads; index 0 is slow so later positions race ahead of it.
struct SlowFirst {
    inner: InMemoryDataset,
    loaded: AtomicUsize,
}

impl ClipDataset for SlowFirst {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn shape(&self) -> ClipShape {
        self.inner.shape()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn get(&self, index: usize) -> DatasetResult<ClipSample> {
        if index == 0 {
            std::thread::sleep(Duration::from_millis(300));
        }
        let sample = self.inner.get(index);
        self.loaded.fetch_add(1, Ordering::SeqCst);
        sample
    }
}

#[test]
fn prefetch_bounds_samples_in_flight() -> anyhow::Result<()> {
    let shape = ClipShape {
        channels: 1,
        frames: 4,
        height: 1,
        width: 1,
    };
    let dataset = Arc::new(SlowFirst {
        inner: InMemoryDataset::synthetic(400, shape, 3, 1),
        loaded: AtomicUsize::new(0),
    });
    let (workers, prefetch) = (2, 2);
    let loader = ClipLoader::new(
        dataset.clone(),
        LoaderConfig {
            batch_size: 1,
            shuffle: false,
            num_workers: workers,
            prefetch,
            ..Default::default()
        },
    );
    let device = Default::default();
    let mut iter = loader.epoch(0);
    assert!(iter.next_batch::<B>(&device)?.is_some());

    // Per worker: its queue, one sample blocked on send and one just handed over.
    let loaded = dataset.loaded.load(Ordering::SeqCst);
    assert!(
        loaded <= workers * (prefetch + 2),
        "{loaded} samples loaded before the first batch"
    );
    Ok(())
}
