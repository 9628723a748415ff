use burn::module::Module;
use burn::nn;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::features::{
    spatial_pool, temporal_pool, temporal_pool_map, AttentionMaps, FeatureMaps,
};
use crate::{PRIOR_STRIDE, STAGE_5C_STRIDE};

/// Number of embedding scales returned by the contrastive operation.
pub const TRIPLET_SCALES: usize = 3;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub in_channels: usize,
    pub feature_dim: usize,
    pub hidden: usize,
    /// Class count including background (label 0).
    pub num_classes: usize,
    /// Channels per boundary head before averaging into a probability.
    pub boundary_channels: usize,
    pub embed_dim: usize,
    pub dropout: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            feature_dim: 64,
            hidden: 128,
            num_classes: 21,
            boundary_channels: 4,
            embed_dim: 32,
            dropout: 0.1,
        }
    }
}

#[derive(Debug, Module)]
pub struct Detector<B: Backend> {
    stem_4f: nn::Linear<B>,
    stem_5c: nn::Linear<B>,
    att_4f: nn::Linear<B>,
    att_5c: nn::Linear<B>,
    norm_4f: nn::LayerNorm<B>,
    norm_5c: nn::LayerNorm<B>,
    boundary: nn::Linear<B>,
    trunk: nn::Linear<B>,
    loc_head: nn::Linear<B>,
    conf_head: nn::Linear<B>,
    center_head: nn::Linear<B>,
    prop_trunk: nn::Linear<B>,
    prop_loc_head: nn::Linear<B>,
    prop_conf_head: nn::Linear<B>,
    prop_boundary_loc: nn::Linear<B>,
    prop_boundary_conf: nn::Linear<B>,
    embed_4f: nn::Linear<B>,
    embed_5c: nn::Linear<B>,
    embed_head: nn::Linear<B>,
    dropout: nn::Dropout,
    boundary_channels: usize,
}

/// Detection-head outputs on the prior grid (`P = frames / 4`).
#[derive(Debug, Clone)]
pub struct Detections<B: Backend> {
    /// Distances from each prior center to the segment start/end, `[b, P, 2]`, in (0, 1).
    pub loc: Tensor<B, 3>,
    /// Class logits `[b, P, num_classes]`.
    pub conf: Tensor<B, 3>,
    pub prop_loc: Tensor<B, 3>,
    pub prop_conf: Tensor<B, 3>,
    /// Segment-quality logits `[b, P, 1]`.
    pub center: Tensor<B, 3>,
    /// Normalized prior centers `[P, 1]`.
    pub priors: Tensor<B, 2>,
    /// Start/end boundary logits at frame resolution, `[b, frames, k]`.
    pub start: Tensor<B, 3>,
    pub end: Tensor<B, 3>,
    /// Boundary logits at prior resolution, `[b, P, k]`.
    pub start_loc_prop: Tensor<B, 3>,
    pub end_loc_prop: Tensor<B, 3>,
    pub start_conf_prop: Tensor<B, 3>,
    pub end_conf_prop: Tensor<B, 3>,
}

/// Anchor/positive/negative embeddings at three scales, each `[1, embed_dim]`.
#[derive(Debug, Clone)]
pub struct TripletFeatures<B: Backend> {
    pub anchor: [Tensor<B, 2>; TRIPLET_SCALES],
    pub positive: [Tensor<B, 2>; TRIPLET_SCALES],
    pub negative: [Tensor<B, 2>; TRIPLET_SCALES],
}

/// Operations the detector exposes, one variant per input contract.
pub enum DetectorOp<'a, B: Backend> {
    /// Clips `[b, channels, frames, height, width]` -> raw feature maps.
    Backbone(Tensor<B, 5>),
    /// Feature maps -> per-stage attention.
    Attention(&'a FeatureMaps<B>),
    /// (Weighted) feature maps -> detection heads.
    Classify(FeatureMaps<B>),
    /// One clip `[1, ...]` plus its action spans -> triplet embeddings.
    Contrast {
        clip: Tensor<B, 5>,
        spans: &'a [[f32; 2]],
    },
}

pub enum DetectorOutput<B: Backend> {
    Features(FeatureMaps<B>),
    Attention(AttentionMaps<B>),
    Detections(Box<Detections<B>>),
    Triplet(TripletFeatures<B>),
}

impl<B: Backend> Detector<B> {
    pub fn new(cfg: DetectorConfig, device: &B::Device) -> Self {
        let c = cfg.feature_dim;
        let h = cfg.hidden;
        let k = cfg.boundary_channels.max(1);
        let linear =
            |i: usize, o: usize| -> nn::Linear<B> { nn::LinearConfig::new(i, o).init(device) };
        Self {
            stem_4f: linear(cfg.in_channels, c),
            stem_5c: linear(c, c),
            att_4f: linear(c, 1),
            att_5c: linear(c, 1),
            norm_4f: nn::LayerNormConfig::new(c).init(device),
            norm_5c: nn::LayerNormConfig::new(c).init(device),
            boundary: linear(c, 2 * k),
            trunk: linear(c, h),
            loc_head: linear(h, 2),
            conf_head: linear(h, cfg.num_classes),
            center_head: linear(h, 1),
            prop_trunk: linear(c, h),
            prop_loc_head: linear(h, 2),
            prop_conf_head: linear(h, cfg.num_classes),
            prop_boundary_loc: linear(h, 2 * k),
            prop_boundary_conf: linear(h, 2 * k),
            embed_4f: linear(c, cfg.embed_dim),
            embed_5c: linear(c, cfg.embed_dim),
            embed_head: linear(h, cfg.embed_dim),
            dropout: nn::DropoutConfig::new(cfg.dropout).init(),
            boundary_channels: k,
        }
    }

    pub fn forward(&self, op: DetectorOp<'_, B>) -> DetectorOutput<B> {
        match op {
            DetectorOp::Backbone(clips) => DetectorOutput::Features(self.backbone(clips)),
            DetectorOp::Attention(features) => DetectorOutput::Attention(self.attention(features)),
            DetectorOp::Classify(features) => {
                DetectorOutput::Detections(Box::new(self.classify(features)))
            }
            DetectorOp::Contrast { clip, spans } => {
                DetectorOutput::Triplet(self.contrast(clip, spans))
            }
        }
    }

    pub fn backbone(&self, clips: Tensor<B, 5>) -> FeatureMaps<B> {
        // [b, c, t, h, w] -> [b, t, h, w, c]
        let x = clips.permute([0, 2, 3, 4, 1]);
        let mixed_4f = relu(self.stem_4f.forward(x));
        let mixed_5c = relu(
            self.stem_5c
                .forward(temporal_pool_map(mixed_4f.clone(), STAGE_5C_STRIDE)),
        );
        FeatureMaps { mixed_4f, mixed_5c }
    }

    pub fn attention(&self, features: &FeatureMaps<B>) -> AttentionMaps<B> {
        let score = |head: &nn::Linear<B>, feature: Tensor<B, 5>| {
            let tokens = spatial_pool(feature);
            let [batch, frames, _] = tokens.dims();
            sigmoid(head.forward(tokens)).reshape([batch, frames])
        };
        AttentionMaps {
            mixed_4f: score(&self.att_4f, features.mixed_4f.clone()),
            mixed_5c: score(&self.att_5c, features.mixed_5c.clone()),
        }
    }

    pub fn classify(&self, features: FeatureMaps<B>) -> Detections<B> {
        let tokens_4f = self.norm_4f.forward(spatial_pool(features.mixed_4f));
        let tokens_5c = self.norm_5c.forward(spatial_pool(features.mixed_5c));
        let device = tokens_4f.device();

        let (start, end) = self.split_boundary(self.boundary.forward(tokens_4f.clone()));

        let pooled_5c = temporal_pool(tokens_5c, PRIOR_STRIDE / STAGE_5C_STRIDE);
        let pooled_4f = temporal_pool(tokens_4f, PRIOR_STRIDE);
        let hidden = self.dropout.forward(relu(self.trunk.forward(pooled_5c)));
        let prop_hidden = self.dropout.forward(relu(self.prop_trunk.forward(pooled_4f)));

        let loc = sigmoid(self.loc_head.forward(hidden.clone()));
        let conf = self.conf_head.forward(hidden.clone());
        let center = self.center_head.forward(hidden.clone());
        let prop_loc = sigmoid(self.prop_loc_head.forward(prop_hidden.clone()));
        let prop_conf = self.prop_conf_head.forward(prop_hidden.clone());
        let (start_loc_prop, end_loc_prop) =
            self.split_boundary(self.prop_boundary_loc.forward(prop_hidden));
        let (start_conf_prop, end_conf_prop) =
            self.split_boundary(self.prop_boundary_conf.forward(hidden));

        let num_priors = loc.dims()[1];
        Detections {
            loc,
            conf,
            prop_loc,
            prop_conf,
            center,
            priors: prior_centers(num_priors, &device),
            start,
            end,
            start_loc_prop,
            end_loc_prop,
            start_conf_prop,
            end_conf_prop,
        }
    }

    /// Embed the first and second half of each action span as anchor/positive and
    /// everything outside the spans as negative, at the 4f, 5c and head scales.
    ///
    /// A mask with no support (very short spans, spans covering the whole clip)
    /// falls back to a uniform average so the triplet stays defined.
    pub fn contrast(&self, clip: Tensor<B, 5>, spans: &[[f32; 2]]) -> TripletFeatures<B> {
        let features = self.backbone(clip);
        let tokens_4f = self.norm_4f.forward(spatial_pool(features.mixed_4f));
        let tokens_5c = self.norm_5c.forward(spatial_pool(features.mixed_5c));
        let hidden = relu(self.trunk.forward(temporal_pool(
            tokens_5c.clone(),
            PRIOR_STRIDE / STAGE_5C_STRIDE,
        )));

        let scales: [(Tensor<B, 3>, &nn::Linear<B>); TRIPLET_SCALES] = [
            (tokens_4f, &self.embed_4f),
            (tokens_5c, &self.embed_5c),
            (hidden, &self.embed_head),
        ];

        let [s4f, s5c, head] = scales.map(|(tokens, head)| {
            let masks = span_masks(tokens.dims()[1], spans);
            (
                head.forward(masked_mean(tokens.clone(), &masks.anchor)),
                head.forward(masked_mean(tokens.clone(), &masks.positive)),
                head.forward(masked_mean(tokens, &masks.negative)),
            )
        });

        TripletFeatures {
            anchor: [s4f.0, s5c.0, head.0],
            positive: [s4f.1, s5c.1, head.1],
            negative: [s4f.2, s5c.2, head.2],
        }
    }

    pub fn boundary_channels(&self) -> usize {
        self.boundary_channels
    }

    fn split_boundary(&self, logits: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, frames, _] = logits.dims();
        let k = self.boundary_channels;
        let start = logits.clone().slice([0..batch, 0..frames, 0..k]);
        let end = logits.slice([0..batch, 0..frames, k..2 * k]);
        (start, end)
    }
}

fn prior_centers<B: Backend>(num_priors: usize, device: &B::Device) -> Tensor<B, 2> {
    let centers: Vec<f32> = (0..num_priors)
        .map(|i| (i as f32 + 0.5) / num_priors as f32)
        .collect();
    Tensor::from_data(TensorData::new(centers, [num_priors, 1]), device)
}

struct SpanMasks {
    anchor: Vec<f32>,
    positive: Vec<f32>,
    negative: Vec<f32>,
}

fn span_masks(frames: usize, spans: &[[f32; 2]]) -> SpanMasks {
    let mut anchor = vec![0.0f32; frames];
    let mut positive = vec![0.0f32; frames];
    let mut negative = vec![1.0f32; frames];
    for i in 0..frames {
        let x = (i as f32 + 0.5) / frames as f32;
        for &[start, end] in spans {
            if x < start || x > end {
                continue;
            }
            negative[i] = 0.0;
            if x < 0.5 * (start + end) {
                anchor[i] = 1.0;
            } else {
                positive[i] = 1.0;
            }
        }
    }
    let inside: Vec<f32> = negative.iter().map(|v| 1.0 - v).collect();
    let empty = |mask: &[f32]| mask.iter().all(|v| *v == 0.0);
    if empty(&anchor) || empty(&positive) {
        anchor = inside.clone();
        positive = inside;
    }
    SpanMasks {
        anchor,
        positive,
        negative,
    }
}

/// Weighted mean over frames of `[1, t, c]` tokens -> `[1, c]`; empty masks average uniformly.
fn masked_mean<B: Backend>(tokens: Tensor<B, 3>, mask: &[f32]) -> Tensor<B, 2> {
    let [batch, frames, channels] = tokens.dims();
    let total: f32 = mask.iter().sum();
    let weights = if total > 0.0 {
        mask.iter().map(|v| v / total).collect::<Vec<_>>()
    } else {
        vec![1.0 / frames as f32; frames]
    };
    let weights = Tensor::<B, 3>::from_data(
        TensorData::new(weights, [1, frames, 1]),
        &tokens.device(),
    );
    (tokens * weights).sum_dim(1).reshape([batch, channels])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_masks_split_halves_and_outside() {
        let masks = span_masks(8, &[[0.25, 0.75]]);
        assert_eq!(masks.anchor, vec![0., 0., 1., 1., 0., 0., 0., 0.]);
        assert_eq!(masks.positive, vec![0., 0., 0., 0., 1., 1., 0., 0.]);
        assert_eq!(masks.negative, vec![1., 1., 0., 0., 0., 0., 1., 1.]);
    }

    #[test]
    fn span_masks_fall_back_for_short_spans() {
        let masks = span_masks(4, &[[0.3, 0.45]]);
        assert_eq!(masks.anchor, masks.positive);
        assert_eq!(masks.anchor, vec![0., 1., 0., 0.]);
    }
}
