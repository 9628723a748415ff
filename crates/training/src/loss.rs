//! Loss primitives: multi-segment detection loss, boundary BCE, triplet margin and CVAE ELBO.
//!
//! Prior matching runs on the host without gradients; the resulting targets and
//! masks are uploaded and the losses are built from differentiable tensor ops.

use burn::nn::loss::{HuberLossConfig, MseLoss, Reduction};
use burn::tensor::activation::{log_softmax, relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::error::{TrainError, TrainResult};
use clip_dataset::Segment;
use models::{CvaeForward, Detections, TripletFeatures, PRIOR_STRIDE};

/// Relative weights of the 4f, 5c and head triplet terms.
pub const TRIPLET_SCALE_WEIGHTS: [f32; 3] = [1.0, 0.1, 0.1];
pub const TRIPLET_MARGIN: f32 = 1.0;
const TRIPLET_EPS: f32 = 1e-6;
const FOCAL_ALPHA: f32 = 0.25;
const FOCAL_GAMMA: f32 = 2.0;
const PROB_EPS: f32 = 1e-6;

/// Copy a tensor's values to the host.
pub fn host_values<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> TrainResult<Vec<f32>> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::NumericEngine(format!("tensor readback failed: {e:?}")))
}

/// Single-element tensor as `f32`.
pub fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> TrainResult<f32> {
    host_values(tensor)?
        .first()
        .copied()
        .ok_or_else(|| TrainError::NumericEngine("empty scalar tensor".into()))
}

/// Unweighted detection-branch losses, each a one-element tensor.
#[derive(Debug, Clone)]
pub struct SegmentLosses<B: Backend> {
    pub loc: Tensor<B, 1>,
    pub conf: Tensor<B, 1>,
    pub prop_loc: Tensor<B, 1>,
    pub prop_conf: Tensor<B, 1>,
    pub center: Tensor<B, 1>,
}

/// Matches priors to segments and scores the main and proposal heads.
#[derive(Debug, Clone)]
pub struct MultiSegmentLoss {
    pub num_classes: usize,
    /// Minimum IoU between a prior's prediction and its target for the proposal branch.
    pub overlap_thresh: f32,
    pub use_focal_loss: bool,
}

/// Host-side matching result for a whole batch, `[b * P]` rows.
struct MatchTargets {
    conf: Vec<usize>,
    prop_conf: Vec<usize>,
    /// Targets for positive priors; placeholders elsewhere keep the IoU finite.
    loc: Vec<f32>,
    prop_loc: Vec<f32>,
    center: Vec<f32>,
    positives: usize,
    prop_positives: usize,
}

impl MultiSegmentLoss {
    pub fn new(num_classes: usize, overlap_thresh: f32, use_focal_loss: bool) -> Self {
        Self {
            num_classes,
            overlap_thresh,
            use_focal_loss,
        }
    }

    pub fn forward<B: Backend>(
        &self,
        det: &Detections<B>,
        targets: &[Vec<Segment>],
    ) -> TrainResult<SegmentLosses<B>> {
        let [batch, num_priors, _] = det.loc.dims();
        if targets.len() != batch {
            return Err(TrainError::InvalidState(format!(
                "{} target lists for a batch of {batch}",
                targets.len()
            )));
        }
        let device = det.loc.device();
        let m = self.match_priors(det, targets)?;

        let rows = batch * num_priors;
        let pos: Vec<f32> = m.conf.iter().map(|c| (*c > 0) as u8 as f32).collect();
        let prop_pos: Vec<f32> = m.prop_conf.iter().map(|c| (*c > 0) as u8 as f32).collect();
        let upload = |values: Vec<f32>, last: usize| {
            Tensor::<B, 3>::from_data(TensorData::new(values, [batch, num_priors, last]), &device)
        };
        let pos_mask = upload(pos, 1);
        let prop_pos_mask = upload(prop_pos, 1);
        let n = m.positives.max(1) as f32;
        let pn = m.prop_positives.max(1) as f32;

        let loc = (giou_loss(det.loc.clone(), upload(m.loc, 2)) * pos_mask.clone())
            .sum()
            .div_scalar(n);

        let prop_loc = (smooth_l1(det.prop_loc.clone(), upload(m.prop_loc, 2)) * prop_pos_mask)
            .sum()
            .div_scalar(pn);

        let center = (bce_with_logits(det.center.clone(), upload(m.center, 1)) * pos_mask)
            .sum()
            .div_scalar(n);

        let conf = self
            .classification(det.conf.clone(), &m.conf, rows)
            .div_scalar(n);
        let prop_conf = self
            .classification(det.prop_conf.clone(), &m.prop_conf, rows)
            .div_scalar(pn);

        Ok(SegmentLosses {
            loc,
            conf,
            prop_loc,
            prop_conf,
            center,
        })
    }

    fn match_priors<B: Backend>(
        &self,
        det: &Detections<B>,
        targets: &[Vec<Segment>],
    ) -> TrainResult<MatchTargets> {
        let [batch, num_priors, _] = det.loc.dims();
        let priors = host_values(&det.priors)?;
        let pre_loc = host_values(&det.loc)?;
        let prop_pred = host_values(&det.prop_loc)?;
        // Normalized coordinates: a width of 2 can never be reached by a containing segment.
        let max_area = 2.0f32;

        let rows = batch * num_priors;
        let mut out = MatchTargets {
            conf: vec![0; rows],
            prop_conf: vec![0; rows],
            loc: vec![0.5; rows * 2],
            prop_loc: vec![0.0; rows * 2],
            center: vec![0.0; rows],
            positives: 0,
            prop_positives: 0,
        };

        for (b, truths) in targets.iter().enumerate() {
            for k in 0..num_priors {
                let row = b * num_priors + k;
                let c = priors[k];
                let best = truths
                    .iter()
                    .map(|t| {
                        let (left, right) = (c - t.start, t.end - c);
                        let area = if left < 0.0 || right < 0.0 {
                            max_area
                        } else {
                            left + right
                        };
                        (area, t)
                    })
                    .fold(None, |acc: Option<(f32, &Segment)>, (area, t)| match acc {
                        Some((a, _)) if a <= area => acc,
                        _ => Some((area, t)),
                    });
                let Some((area, truth)) = best else {
                    continue;
                };
                if area >= max_area || truth.label == 0 {
                    continue;
                }
                let label = truth.label.min(self.num_classes.saturating_sub(1));
                let target = [c - truth.start, truth.end - c];
                let pred = [pre_loc[row * 2], pre_loc[row * 2 + 1]];

                out.conf[row] = label;
                out.positives += 1;
                out.loc[row * 2] = target[0];
                out.loc[row * 2 + 1] = target[1];

                let width = (pred[0] + pred[1]).max(PROB_EPS);
                let prop = [prop_pred[row * 2], prop_pred[row * 2 + 1]];
                let refined = [
                    0.5 * width * prop[0] + pred[0],
                    0.5 * width * prop[1] + pred[1],
                ];
                out.center[row] = segment_iou(refined, target).max(0.0);

                if segment_iou(pred, target) >= self.overlap_thresh {
                    out.prop_conf[row] = label;
                    out.prop_positives += 1;
                    out.prop_loc[row * 2] = (target[0] - pred[0]) / (0.5 * width);
                    out.prop_loc[row * 2 + 1] = (target[1] - pred[1]) / (0.5 * width);
                }
            }
        }
        Ok(out)
    }

    /// Summed focal (or cross-entropy) loss over all priors.
    fn classification<B: Backend>(
        &self,
        logits: Tensor<B, 3>,
        labels: &[usize],
        rows: usize,
    ) -> Tensor<B, 1> {
        let device = logits.device();
        let k = self.num_classes;
        let logits = logits.reshape([rows, k]);
        let mut one_hot = vec![0.0f32; rows * k];
        for (row, label) in labels.iter().enumerate() {
            one_hot[row * k + (*label).min(k - 1)] = 1.0;
        }
        let one_hot = Tensor::<B, 2>::from_data(TensorData::new(one_hot, [rows, k]), &device);
        let log_pt = (log_softmax(logits, 1) * one_hot).sum_dim(1);

        if !self.use_focal_loss {
            return log_pt.neg().sum();
        }
        let alpha: Vec<f32> = labels
            .iter()
            .map(|l| {
                if *l == 0 {
                    FOCAL_ALPHA
                } else {
                    1.0 - FOCAL_ALPHA
                }
            })
            .collect();
        let alpha = Tensor::<B, 2>::from_data(TensorData::new(alpha, [rows, 1]), &device);
        let modulator = log_pt
            .clone()
            .exp()
            .neg()
            .add_scalar(1.0)
            .powf_scalar(FOCAL_GAMMA);
        (alpha * modulator * log_pt).neg().sum()
    }
}

/// IoU of two segments given as distances `(left, right)` from a shared center.
pub fn segment_iou(pred: [f32; 2], target: [f32; 2]) -> f32 {
    let inter = pred[0].min(target[0]) + pred[1].min(target[1]);
    let union = pred[0] + pred[1] + target[0] + target[1] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Per-prior `1 - GIoU` for `(left, right)` distance pairs `[b, P, 2]` -> `[b, P, 1]`.
pub fn giou_loss<B: Backend>(pred: Tensor<B, 3>, target: Tensor<B, 3>) -> Tensor<B, 3> {
    let [b, p, _] = pred.dims();
    let left = |t: &Tensor<B, 3>| t.clone().slice([0..b, 0..p, 0..1]);
    let right = |t: &Tensor<B, 3>| t.clone().slice([0..b, 0..p, 1..2]);
    let (pl, pr, tl, tr) = (left(&pred), right(&pred), left(&target), right(&target));

    let inter = pl.clone().min_pair(tl.clone()) + pr.clone().min_pair(tr.clone());
    let union = pl.clone() + pr.clone() + tl.clone() + tr.clone() - inter.clone();
    let enclose = pl.max_pair(tl) + pr.max_pair(tr);
    let iou = inter / union.clone();
    let giou = iou - (enclose.clone() - union) / enclose;
    giou.neg().add_scalar(1.0)
}

/// Smooth-L1 (Huber with delta 1), summed over the last axis.
pub fn smooth_l1<B: Backend>(pred: Tensor<B, 3>, target: Tensor<B, 3>) -> Tensor<B, 3> {
    HuberLossConfig::new(1.0)
        .init()
        .forward_no_reduction(pred, target)
        .sum_dim(2)
}

/// Binary cross-entropy on logits against soft targets.
///
/// `burn::nn::loss::BinaryCrossEntropyLoss` only takes integer labels; the center
/// and boundary targets here are continuous.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    relu(logits.clone()) - logits.clone() * target + logits.abs().neg().exp().log1p()
}

/// Mean binary cross-entropy between probabilities and soft targets in [0, 1].
pub fn bce_mean<B: Backend, const D: usize>(
    prob: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, 1> {
    let prob = prob.clamp(PROB_EPS, 1.0 - PROB_EPS);
    let pos = target.clone() * prob.clone().log();
    let neg = target.neg().add_scalar(1.0) * prob.neg().add_scalar(1.0).log();
    (pos + neg).neg().mean()
}

/// Boundary BCE terms, unblended.
#[derive(Debug, Clone)]
pub struct BoundaryLosses<B: Backend> {
    pub start: Tensor<B, 1>,
    pub end: Tensor<B, 1>,
    pub start_loc_prop: Tensor<B, 1>,
    pub end_loc_prop: Tensor<B, 1>,
    pub start_conf_prop: Tensor<B, 1>,
    pub end_conf_prop: Tensor<B, 1>,
}

/// Nearest-neighbour temporal downsampling of `[b, 2, frames]` scores by `factor`.
pub fn downsample_scores<B: Backend>(scores: Tensor<B, 3>, factor: usize) -> Tensor<B, 3> {
    let [b, rows, frames] = scores.dims();
    let out = frames / factor;
    scores
        .slice([0..b, 0..rows, 0..out * factor])
        .reshape([b, rows, out, factor])
        .slice([0..b, 0..rows, 0..out, 0..1])
        .reshape([b, rows, out])
}

/// BCE of channel-averaged boundary probabilities against the start/end score rows.
fn boundary_pair<B: Backend>(
    start: Tensor<B, 3>,
    end: Tensor<B, 3>,
    scores: Tensor<B, 3>,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let [b, _, frames] = scores.dims();
    let prob = |logits: Tensor<B, 3>| {
        let [bb, t, _] = logits.dims();
        sigmoid(logits).mean_dim(2).reshape([bb, t])
    };
    let start_t = scores.clone().slice([0..b, 0..1, 0..frames]).reshape([b, frames]);
    let end_t = scores.slice([0..b, 1..2, 0..frames]).reshape([b, frames]);
    (bce_mean(prob(start), start_t), bce_mean(prob(end), end_t))
}

pub fn boundary_losses<B: Backend>(det: &Detections<B>, scores: Tensor<B, 3>) -> BoundaryLosses<B> {
    let coarse = downsample_scores(scores.clone(), PRIOR_STRIDE);
    let (start, end) = boundary_pair(det.start.clone(), det.end.clone(), scores);
    let (start_loc_prop, end_loc_prop) = boundary_pair(
        det.start_loc_prop.clone(),
        det.end_loc_prop.clone(),
        coarse.clone(),
    );
    let (start_conf_prop, end_conf_prop) =
        boundary_pair(det.start_conf_prop.clone(), det.end_conf_prop.clone(), coarse);
    BoundaryLosses {
        start,
        end,
        start_loc_prop,
        end_loc_prop,
        start_conf_prop,
        end_conf_prop,
    }
}

/// `mean(max(d(a, p) - d(a, n) + margin, 0))` with `d(x, y) = ||x - y + eps||_2`.
pub fn triplet_margin_loss<B: Backend>(
    anchor: Tensor<B, 2>,
    positive: Tensor<B, 2>,
    negative: Tensor<B, 2>,
    margin: f32,
) -> Tensor<B, 1> {
    let dist = |x: Tensor<B, 2>, y: Tensor<B, 2>| {
        (x - y)
            .add_scalar(TRIPLET_EPS)
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
    };
    let d_ap = dist(anchor.clone(), positive);
    let d_an = dist(anchor, negative);
    relu((d_ap - d_an).add_scalar(margin)).mean()
}

/// Weighted sum of the per-scale triplet losses.
pub fn triplet_loss<B: Backend>(features: TripletFeatures<B>) -> Tensor<B, 1> {
    let TripletFeatures {
        anchor,
        positive,
        negative,
    } = features;
    anchor
        .into_iter()
        .zip(positive)
        .zip(negative)
        .zip(TRIPLET_SCALE_WEIGHTS)
        .map(|(((a, p), n), w)| triplet_margin_loss(a, p, n, TRIPLET_MARGIN).mul_scalar(w))
        .reduce(|acc, t| acc + t)
        .unwrap_or_else(|| Tensor::zeros([1], &Default::default()))
}

/// Mean squared error of a `[b, t, 1, 1, c]` reconstruction against `[b, t, h, w, c]` features.
pub fn reconstruction_loss<B: Backend>(
    recon: Tensor<B, 5>,
    features: Tensor<B, 5>,
) -> Tensor<B, 1> {
    let recon = recon.expand(features.dims());
    MseLoss::new().forward(recon, features, Reduction::Mean)
}

/// ELBO: reconstruction MSE plus the per-frame KL divergence weighted by attention.
pub fn cvae_loss<B: Backend>(
    out: &CvaeForward<B>,
    features: Tensor<B, 5>,
    attention: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let recon = reconstruction_loss(out.recon.clone(), features);
    let [b, t, _] = out.mean.dims();
    let kl = (out.log_var.clone().add_scalar(1.0)
        - out.mean.clone().powf_scalar(2.0)
        - out.log_var.clone().exp())
    .sum_dim(2)
    .reshape([b, t])
    .mul_scalar(-0.5);
    recon + (kl * attention).sum().div_scalar((b * t).max(1) as f32)
}
