//! Per-batch training/validation state machine and the epoch loop around it.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use indicatif::{ProgressBar, ProgressStyle};

use crate::aggregate::{
    combine, mean_triplet, recon_weight, BranchLosses, JointObjective, LossWeights,
};
use crate::checkpoint::CheckpointStore;
use crate::config::TrainConfig;
use crate::error::{TrainError, TrainResult};
use crate::intervals::complement;
use crate::loss::{
    boundary_losses, cvae_loss, reconstruction_loss, scalar, triplet_loss, MultiSegmentLoss,
};
use crate::metrics::{
    tags, BatchLosses, EpochMeters, EpochSummary, RunMode, ScalarWriter, StepCounters,
};
use crate::rng::RngStates;
use clip_dataset::{ClipBatch, ClipLoader, Segment};
use models::{
    AttentionMaps, Cvae, CvaeForward, CvaeOp, CvaeOutput, Detections, Detector, DetectorOp,
    DetectorOutput, FeatureMaps, Partition, TripletFeatures,
};

/// Stages of one batch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FeatureExtraction,
    ForegroundPass,
    BackgroundPass,
    SelfSupervisedPass,
    ReconstructionPass,
    CvaeForwardPass,
    OptimizationStep,
    MetricsAccumulation,
    CheckpointOrSkip,
}

/// Networks and optimizers advanced by training epochs.
pub struct TrainState<B: AutodiffBackend, OD, OC> {
    pub detector: Detector<B>,
    pub cvae: Cvae<B>,
    pub detector_optim: OD,
    pub cvae_optim: OC,
}

struct BatchOutcome<B: Backend> {
    objective: JointObjective<B>,
    losses: BatchLosses,
}

/// Drives epochs over a loader; owns the RNG streams, step counters and sinks.
pub struct EpochRunner {
    weights: LossWeights,
    criterion: MultiSegmentLoss,
    learning_rate: f64,
    cvae_learning_rate: f64,
    rng: RngStates,
    counters: StepCounters,
    scalars: ScalarWriter,
    store: CheckpointStore,
    show_progress: bool,
}

impl EpochRunner {
    pub fn new(
        cfg: &TrainConfig,
        rng: RngStates,
        counters: StepCounters,
        scalars: ScalarWriter,
        store: CheckpointStore,
    ) -> Self {
        let t = &cfg.training;
        Self {
            weights: LossWeights::from(t),
            criterion: MultiSegmentLoss::new(cfg.dataset.num_classes, t.piou, t.focal_loss),
            learning_rate: t.learning_rate,
            cvae_learning_rate: t.cvae_learning_rate,
            rng,
            counters,
            scalars,
            store,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn rng(&self) -> &RngStates {
        &self.rng
    }

    pub fn counters(&self) -> StepCounters {
        self.counters
    }

    /// One optimization pass over `loader`. The checkpoint is written separately by
    /// [`EpochRunner::checkpoint`] so a validation pass can run in between.
    pub fn train_epoch<B, OD, OC>(
        &mut self,
        epoch: usize,
        state: &mut TrainState<B, OD, OC>,
        loader: &ClipLoader,
        device: &B::Device,
    ) -> TrainResult<EpochSummary>
    where
        B: AutodiffBackend,
        OD: Optimizer<Detector<B>, B>,
        OC: Optimizer<Cvae<B>, B>,
    {
        // Backend randomness (dropout) is re-derived per epoch so resume replays it.
        self.rng.seed_backend::<B>();
        let mut batches = loader.epoch(self.shuffle_seed(loader));
        let progress = self.progress_bar(loader.steps_per_epoch(), epoch, RunMode::Train);
        let mut meters = EpochMeters::new();

        while let Some(batch) = batches.next_batch::<B>(device)? {
            let outcome = self.forward_batch(epoch, &state.detector, &state.cvae, batch)?;

            trace_stage(Stage::OptimizationStep);
            let mut grads = outcome.objective.backward();
            let detector_grads = GradientsParams::from_module(&mut grads, &state.detector);
            let cvae_grads = GradientsParams::from_module(&mut grads, &state.cvae);
            state.detector = state.detector_optim.step(
                self.learning_rate,
                state.detector.clone(),
                detector_grads,
            );
            state.cvae =
                state
                    .cvae_optim
                    .step(self.cvae_learning_rate, state.cvae.clone(), cvae_grads);

            trace_stage(Stage::MetricsAccumulation);
            meters.add(&outcome.losses);
            progress.set_message(format!("{:.5}", outcome.losses.cost));
            progress.inc(1);
        }
        progress.finish_and_clear();
        self.finish(epoch, RunMode::Train, &meters)
    }

    /// Forward-only pass with both networks switched to their inference form.
    pub fn validate_epoch<B: AutodiffBackend>(
        &mut self,
        epoch: usize,
        detector: &Detector<B>,
        cvae: &Cvae<B>,
        loader: &ClipLoader,
        device: &B::Device,
    ) -> TrainResult<EpochSummary> {
        let detector = detector.valid();
        let cvae = cvae.valid();
        self.evaluate::<B::InnerBackend>(epoch, &detector, &cvae, loader, device)
    }

    /// Forward-only pass on a backend without gradient tracking.
    pub fn evaluate<B: Backend>(
        &mut self,
        epoch: usize,
        detector: &Detector<B>,
        cvae: &Cvae<B>,
        loader: &ClipLoader,
        device: &B::Device,
    ) -> TrainResult<EpochSummary> {
        let mut batches = loader.epoch(self.shuffle_seed(loader));
        let progress = self.progress_bar(loader.steps_per_epoch(), epoch, RunMode::Val);
        let mut meters = EpochMeters::new();

        while let Some(batch) = batches.next_batch::<B>(device)? {
            let outcome = self.forward_batch(epoch, detector, cvae, batch)?;
            trace_stage(Stage::MetricsAccumulation);
            meters.add(&outcome.losses);
            progress.set_message(format!("{:.5}", outcome.losses.cost));
            progress.inc(1);
        }
        progress.finish_and_clear();
        self.finish(epoch, RunMode::Val, &meters)
    }

    /// Persist weights, optimizer records, RNG streams and counters for `epoch`.
    pub fn checkpoint<B, OD, OC>(
        &self,
        epoch: usize,
        state: &TrainState<B, OD, OC>,
    ) -> TrainResult<()>
    where
        B: AutodiffBackend,
        OD: Optimizer<Detector<B>, B>,
        OC: Optimizer<Cvae<B>, B>,
    {
        trace_stage(Stage::CheckpointOrSkip);
        self.store.save(
            epoch,
            &state.detector,
            &state.cvae,
            &state.detector_optim,
            &state.cvae_optim,
            self.rng.capture(),
            self.counters,
        )
    }

    fn finish(
        &mut self,
        epoch: usize,
        mode: RunMode,
        meters: &EpochMeters,
    ) -> TrainResult<EpochSummary> {
        self.scalars.flush()?;
        let summary = meters.summary(epoch, mode);
        tracing::info!("{summary}");
        Ok(summary)
    }

    fn shuffle_seed(&mut self, loader: &ClipLoader) -> u64 {
        if loader.config().shuffle {
            self.rng.next_shuffle_seed()
        } else {
            0
        }
    }

    fn progress_bar(&self, steps: usize, epoch: usize, mode: RunMode) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(steps as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss:{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_prefix(format!("Epoch-{epoch} {}", mode.prefix()));
        progress
    }

    /// Standard-normal latent noise shaped like `attention` plus a latent axis.
    fn noise<B: Backend>(&mut self, attention: &Tensor<B, 2>, latent_dim: usize) -> Tensor<B, 3> {
        let [batch, frames] = attention.dims();
        let values = self.rng.normal(batch * frames * latent_dim);
        Tensor::from_data(
            TensorData::new(values, [batch, frames, latent_dim]),
            &attention.device(),
        )
    }

    fn forward_batch<B: Backend>(
        &mut self,
        epoch: usize,
        detector: &Detector<B>,
        cvae: &Cvae<B>,
        batch: ClipBatch<B>,
    ) -> TrainResult<BatchOutcome<B>> {
        let w = self.weights;
        let ClipBatch {
            clips,
            targets,
            scores,
            ssl_clips,
            ssl_targets,
            ssl_flags,
        } = batch;

        trace_stage(Stage::FeatureExtraction);
        let features = backbone(detector, clips)?;
        let attention = attend(detector, &features)?;

        trace_stage(Stage::ForegroundPass);
        let fg_det = classify(detector, features.partition(&attention, Partition::Foreground))?;
        let fg = BranchLosses::new(
            self.criterion.forward(&fg_det, &targets)?,
            boundary_losses(&fg_det, scores.clone()),
            w.boundary_prop_weight,
        )
        .weigh(&w);

        trace_stage(Stage::BackgroundPass);
        let bg_targets: Vec<Vec<Segment>> = targets.iter().map(|t| complement(t)).collect();
        let bg_det = classify(detector, features.partition(&attention, Partition::Background))?;
        let bg = BranchLosses::new(
            self.criterion.forward(&bg_det, &bg_targets)?,
            boundary_losses(&bg_det, scores),
            w.boundary_prop_weight,
        )
        .weigh(&w);

        let cost_fg = fg.foreground_total();
        let cost_bg = bg.background_total();
        let step = self.counters.advance_main();
        self.scalars.add_scalar(tags::LOSS_BG, scalar(&cost_bg)?, step)?;
        self.scalars.add_scalar(tags::LOSS_FG, scalar(&cost_fg)?, step)?;
        let mut cost = combine(cost_bg, cost_fg, w.background_scale);

        let mut triplet_value = 0.0;
        if w.ssl > 0.0 {
            trace_stage(Stage::SelfSupervisedPass);
            let mut terms = Vec::new();
            let flagged = ssl_clips.into_iter().zip(&ssl_targets).zip(&ssl_flags);
            for ((clip, segments), flag) in flagged {
                let (Some(clip), true) = (clip, *flag) else {
                    continue;
                };
                let spans: Vec<[f32; 2]> = segments.iter().map(Segment::span).collect();
                terms.push(triplet_loss(contrast(detector, clip, &spans)?));
            }
            if let Some(triplet) = mean_triplet(terms, w.ssl) {
                triplet_value = scalar(&triplet)?;
                cost = cost + triplet;
            }
        }

        trace_stage(Stage::ReconstructionPass);
        let latent = cvae.latent_dim();
        let noise_4f = self.noise(&attention.mixed_4f, latent);
        let noise_5c = self.noise(&attention.mixed_5c, latent);
        let recon_4f = reconstruct(cvae, attention.mixed_4f.clone(), noise_4f)?;
        let recon_5c = reconstruct(cvae, attention.mixed_5c.clone(), noise_5c)?;
        let l_recon = reconstruction_loss(recon_4f, features.mixed_4f.clone())
            + reconstruction_loss(recon_5c, features.mixed_5c.clone());
        self.scalars.add_scalar(tags::LOSS_RECON, scalar(&l_recon)?, step)?;
        cost = cost + l_recon.mul_scalar(recon_weight(epoch, w.max_epoch, w.recon_max_weight));
        self.scalars.add_scalar(tags::LOSS_COST, scalar(&cost)?, step)?;

        trace_stage(Stage::CvaeForwardPass);
        let cvae_step = self.counters.advance_cvae();
        let noise_4f = self.noise(&attention.mixed_4f, latent);
        let noise_5c = self.noise(&attention.mixed_5c, latent);
        let AttentionMaps {
            mixed_4f: att_4f,
            mixed_5c: att_5c,
        } = attention;
        let FeatureMaps {
            mixed_4f: feat_4f,
            mixed_5c: feat_5c,
        } = features;
        let out_4f = encode_decode(cvae, feat_4f.clone(), att_4f.clone(), noise_4f)?;
        let out_5c = encode_decode(cvae, feat_5c.clone(), att_5c.clone(), noise_5c)?;
        let l_cvae = cvae_loss(&out_4f, feat_4f, att_4f) + cvae_loss(&out_5c, feat_5c, att_5c);
        self.scalars
            .add_scalar(tags::LOSS_CVAE, scalar(&l_cvae)?, cvae_step)?;

        let cost = cost + l_cvae.clone();
        let total = scalar(&cost)?;
        self.scalars.add_scalar(tags::LOSS_TOTAL, total, step)?;
        if !total.is_finite() {
            return Err(TrainError::NumericEngine(format!(
                "non-finite cost {total} at epoch {epoch}, step {step}"
            )));
        }

        let mut losses = fg.to_host()?;
        losses.triplet = triplet_value;
        losses.cost = total;
        Ok(BatchOutcome {
            objective: JointObjective::new(cost, l_cvae),
            losses,
        })
    }
}

fn trace_stage(stage: Stage) {
    tracing::trace!(?stage, "batch stage");
}

fn wrong_output(op: &str) -> TrainError {
    TrainError::InvalidState(format!("network returned an unexpected output for `{op}`"))
}

fn backbone<B: Backend>(
    detector: &Detector<B>,
    clips: Tensor<B, 5>,
) -> TrainResult<FeatureMaps<B>> {
    match detector.forward(DetectorOp::Backbone(clips)) {
        DetectorOutput::Features(features) => Ok(features),
        _ => Err(wrong_output("backbone")),
    }
}

fn attend<B: Backend>(
    detector: &Detector<B>,
    features: &FeatureMaps<B>,
) -> TrainResult<AttentionMaps<B>> {
    match detector.forward(DetectorOp::Attention(features)) {
        DetectorOutput::Attention(attention) => Ok(attention),
        _ => Err(wrong_output("attention")),
    }
}

fn classify<B: Backend>(
    detector: &Detector<B>,
    features: FeatureMaps<B>,
) -> TrainResult<Detections<B>> {
    match detector.forward(DetectorOp::Classify(features)) {
        DetectorOutput::Detections(det) => Ok(*det),
        _ => Err(wrong_output("classify")),
    }
}

fn contrast<B: Backend>(
    detector: &Detector<B>,
    clip: Tensor<B, 5>,
    spans: &[[f32; 2]],
) -> TrainResult<TripletFeatures<B>> {
    match detector.forward(DetectorOp::Contrast { clip, spans }) {
        DetectorOutput::Triplet(features) => Ok(features),
        _ => Err(wrong_output("contrast")),
    }
}

fn reconstruct<B: Backend>(
    cvae: &Cvae<B>,
    attention: Tensor<B, 2>,
    noise: Tensor<B, 3>,
) -> TrainResult<Tensor<B, 5>> {
    match cvae.forward(CvaeOp::Inference { attention, noise }) {
        CvaeOutput::Reconstruction(recon) => Ok(recon),
        CvaeOutput::Forward(_) => Err(wrong_output("inference")),
    }
}

fn encode_decode<B: Backend>(
    cvae: &Cvae<B>,
    features: Tensor<B, 5>,
    attention: Tensor<B, 2>,
    noise: Tensor<B, 3>,
) -> TrainResult<CvaeForward<B>> {
    match cvae.forward(CvaeOp::Forward {
        features,
        attention,
        noise,
    }) {
        CvaeOutput::Forward(out) => Ok(out),
        CvaeOutput::Reconstruction(_) => Err(wrong_output("forward")),
    }
}
