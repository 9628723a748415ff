//! Backbone feature maps, attention maps and the foreground/background split.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Two-stage backbone output, channels-last `[batch, frames, height, width, channels]`.
#[derive(Debug, Clone)]
pub struct FeatureMaps<B: Backend> {
    pub mixed_4f: Tensor<B, 5>,
    /// Half the temporal length of `mixed_4f`.
    pub mixed_5c: Tensor<B, 5>,
}

/// Per-frame attention in [0, 1], one map per feature stage (`[batch, frames]`).
#[derive(Debug, Clone)]
pub struct AttentionMaps<B: Backend> {
    pub mixed_4f: Tensor<B, 2>,
    pub mixed_5c: Tensor<B, 2>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Weighted by `att`.
    Foreground,
    /// Weighted by `1 - att`.
    Background,
}

impl<B: Backend> FeatureMaps<B> {
    /// Build a new attention-weighted copy of both stages.
    ///
    /// Each partition is divided by the sum of its own weights over the whole
    /// attention tensor, so foreground and background are independent weighted
    /// means rather than a split of the feature mass.
    pub fn partition(&self, attention: &AttentionMaps<B>, partition: Partition) -> Self {
        Self {
            mixed_4f: weight_by_attention(
                self.mixed_4f.clone(),
                attention.mixed_4f.clone(),
                partition,
            ),
            mixed_5c: weight_by_attention(
                self.mixed_5c.clone(),
                attention.mixed_5c.clone(),
                partition,
            ),
        }
    }
}

/// `feature * w / sum(w)` with `w = att` (foreground) or `w = 1 - att` (background).
pub fn weight_by_attention<B: Backend>(
    feature: Tensor<B, 5>,
    attention: Tensor<B, 2>,
    partition: Partition,
) -> Tensor<B, 5> {
    let [batch, frames] = attention.dims();
    let att = attention.reshape([batch, frames, 1, 1, 1]);
    let weights = match partition {
        Partition::Foreground => att,
        Partition::Background => att.neg().add_scalar(1.0),
    };
    let norm = weights.clone().sum().reshape([1, 1, 1, 1, 1]);
    feature * weights / norm
}

/// Mean over the spatial axes: `[b, t, h, w, c]` -> `[b, t, c]`.
pub fn spatial_pool<B: Backend>(feature: Tensor<B, 5>) -> Tensor<B, 3> {
    let [batch, frames, height, width, channels] = feature.dims();
    feature
        .reshape([batch, frames, height * width, channels])
        .mean_dim(2)
        .reshape([batch, frames, channels])
}

/// Average non-overlapping temporal windows of `factor` frames on a `[b, t, c]` sequence.
pub fn temporal_pool<B: Backend>(tokens: Tensor<B, 3>, factor: usize) -> Tensor<B, 3> {
    let [batch, frames, channels] = tokens.dims();
    let out = frames / factor.max(1);
    tokens
        .reshape([batch, out, factor.max(1), channels])
        .mean_dim(2)
        .reshape([batch, out, channels])
}

/// Same as [`temporal_pool`] for channels-last 5-D feature maps.
pub fn temporal_pool_map<B: Backend>(feature: Tensor<B, 5>, factor: usize) -> Tensor<B, 5> {
    let [batch, frames, height, width, channels] = feature.dims();
    let factor = factor.max(1);
    let out = frames / factor;
    feature
        .reshape([batch, out, factor, height * width * channels])
        .mean_dim(2)
        .reshape([batch, out, height, width, channels])
}
