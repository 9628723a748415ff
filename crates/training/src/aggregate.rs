//! Combines per-branch losses into the scalar training objective.

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use crate::config::TrainingSection;
use crate::error::TrainResult;
use crate::loss::{scalar, BoundaryLosses, SegmentLosses};
use crate::metrics::BatchLosses;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub lw: f32,
    pub cw: f32,
    pub boundary_prop_weight: f32,
    pub background_scale: f32,
    pub ssl: f32,
    pub recon_max_weight: f32,
    pub max_epoch: usize,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self::from(&TrainingSection::default())
    }
}

impl From<&TrainingSection> for LossWeights {
    fn from(t: &TrainingSection) -> Self {
        Self {
            lw: t.lw,
            cw: t.cw,
            boundary_prop_weight: t.boundary_prop_weight,
            background_scale: t.background_scale,
            ssl: t.ssl,
            recon_max_weight: t.recon_max_weight,
            max_epoch: t.max_epoch,
        }
    }
}

/// The seven detection-branch terms of one pass.
#[derive(Debug, Clone)]
pub struct BranchLosses<B: Backend> {
    pub loc: Tensor<B, 1>,
    pub conf: Tensor<B, 1>,
    pub prop_loc: Tensor<B, 1>,
    pub prop_conf: Tensor<B, 1>,
    pub center: Tensor<B, 1>,
    pub start: Tensor<B, 1>,
    pub end: Tensor<B, 1>,
}

impl<B: Backend> BranchLosses<B> {
    /// Unweighted branch set with the boundary terms blended.
    pub fn new(segment: SegmentLosses<B>, boundary: BoundaryLosses<B>, prop_weight: f32) -> Self {
        let (start, end) = blend_boundary(boundary, prop_weight);
        Self {
            loc: segment.loc,
            conf: segment.conf,
            prop_loc: segment.prop_loc,
            prop_conf: segment.prop_conf,
            center: segment.center,
            start,
            end,
        }
    }

    /// Scale localization terms by `lw` and classification/center terms by `cw`.
    pub fn weigh(self, weights: &LossWeights) -> Self {
        Self {
            loc: self.loc.mul_scalar(weights.lw),
            conf: self.conf.mul_scalar(weights.cw),
            prop_loc: self.prop_loc.mul_scalar(weights.lw),
            prop_conf: self.prop_conf.mul_scalar(weights.cw),
            center: self.center.mul_scalar(weights.cw),
            start: self.start,
            end: self.end,
        }
    }

    pub fn foreground_total(&self) -> Tensor<B, 1> {
        self.loc.clone()
            + self.conf.clone()
            + self.prop_loc.clone()
            + self.prop_conf.clone()
            + self.center.clone()
            + self.start.clone()
            + self.end.clone()
    }

    /// The background pass is supervised by its location and class terms only.
    pub fn background_total(&self) -> Tensor<B, 1> {
        self.loc.clone() + self.conf.clone()
    }

    /// Host copy of the branch terms; triplet and cost are left at zero.
    pub fn to_host(&self) -> TrainResult<BatchLosses> {
        Ok(BatchLosses {
            loc: scalar(&self.loc)?,
            conf: scalar(&self.conf)?,
            prop_loc: scalar(&self.prop_loc)?,
            prop_conf: scalar(&self.prop_conf)?,
            center: scalar(&self.center)?,
            start: scalar(&self.start)?,
            end: scalar(&self.end)?,
            ..Default::default()
        })
    }
}

/// `start + w * (start_loc_prop + start_conf_prop)`, likewise for end.
pub fn blend_boundary<B: Backend>(
    boundary: BoundaryLosses<B>,
    prop_weight: f32,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let start = boundary.start
        + (boundary.start_loc_prop + boundary.start_conf_prop).mul_scalar(prop_weight);
    let end =
        boundary.end + (boundary.end_loc_prop + boundary.end_conf_prop).mul_scalar(prop_weight);
    (start, end)
}

/// `cost_bg * background_scale + cost_fg`.
pub fn combine<B: Backend>(
    cost_bg: Tensor<B, 1>,
    cost_fg: Tensor<B, 1>,
    background_scale: f32,
) -> Tensor<B, 1> {
    cost_bg.mul_scalar(background_scale) + cost_fg
}

/// Mean of `ssl * triplet_i` over eligible samples; `None` when nothing contributes.
pub fn mean_triplet<B: Backend>(terms: Vec<Tensor<B, 1>>, ssl: f32) -> Option<Tensor<B, 1>> {
    if ssl <= 0.0 || terms.is_empty() {
        return None;
    }
    let count = terms.len() as f32;
    terms
        .into_iter()
        .reduce(|acc, t| acc + t)
        .map(|sum| sum.mul_scalar(ssl / count))
}

/// Linear warm-up of the reconstruction term, saturating at `max_epoch`.
pub fn recon_weight(epoch: usize, max_epoch: usize, recon_max_weight: f32) -> f32 {
    if max_epoch == 0 {
        return recon_max_weight;
    }
    epoch.min(max_epoch) as f32 / max_epoch as f32 * recon_max_weight
}

/// Detector cost (already including the CVAE term) and the CVAE loss, released by one backward.
///
/// Backpropagating `cost` and then `cvae` over a retained graph accumulates the
/// gradient of `cost + cvae`, which is what [`JointObjective::backward`] computes.
pub struct JointObjective<B: Backend> {
    cost: Tensor<B, 1>,
    cvae: Tensor<B, 1>,
}

impl<B: Backend> JointObjective<B> {
    pub fn new(cost: Tensor<B, 1>, cvae: Tensor<B, 1>) -> Self {
        Self { cost, cvae }
    }

    pub fn cost(&self) -> &Tensor<B, 1> {
        &self.cost
    }

    pub fn cvae(&self) -> &Tensor<B, 1> {
        &self.cvae
    }
}

impl<B: AutodiffBackend> JointObjective<B> {
    pub fn backward(self) -> B::Gradients {
        (self.cost + self.cvae).backward()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TB = NdArray<f32>;

    fn s(v: f32) -> Tensor<TB, 1> {
        Tensor::from_data(TensorData::new(vec![v], [1]), &Default::default())
    }

    fn v(t: Tensor<TB, 1>) -> f32 {
        scalar(&t).unwrap()
    }

    fn branches(base: f32) -> BranchLosses<TB> {
        BranchLosses {
            loc: s(base),
            conf: s(base + 1.0),
            prop_loc: s(base + 2.0),
            prop_conf: s(base + 3.0),
            center: s(base + 4.0),
            start: s(base + 5.0),
            end: s(base + 6.0),
        }
    }

    #[test]
    fn weights_apply_per_branch() {
        let w = LossWeights {
            lw: 10.0,
            cw: 2.0,
            ..Default::default()
        };
        let weighted = branches(1.0).weigh(&w).to_host().unwrap();
        assert_eq!(weighted.loc, 10.0);
        assert_eq!(weighted.conf, 4.0);
        assert_eq!(weighted.prop_loc, 30.0);
        assert_eq!(weighted.prop_conf, 8.0);
        assert_eq!(weighted.center, 10.0);
        assert_eq!(weighted.start, 6.0);
        assert_eq!(weighted.end, 7.0);
    }

    #[test]
    fn cost_is_scaled_background_plus_foreground() {
        let w = LossWeights {
            lw: 1.0,
            cw: 1.0,
            ..Default::default()
        };
        let fg = branches(0.5).weigh(&w);
        let bg = branches(0.5).weigh(&w);
        let cost = v(combine(bg.background_total(), fg.foreground_total(), 35.0));
        let fg_total = 0.5 * 7.0 + 21.0;
        let bg_total = 0.5 + 1.5;
        assert!((cost - (bg_total * 35.0 + fg_total)).abs() < 1e-4);
    }

    #[test]
    fn boundary_blend() {
        let boundary = BoundaryLosses {
            start: s(1.0),
            end: s(2.0),
            start_loc_prop: s(3.0),
            end_loc_prop: s(4.0),
            start_conf_prop: s(5.0),
            end_conf_prop: s(6.0),
        };
        let (start, end) = blend_boundary(boundary, 0.1);
        assert!((v(start) - 1.8).abs() < 1e-6);
        assert!((v(end) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn triplet_mean_requires_weight_and_samples() {
        assert!(mean_triplet::<TB>(vec![s(1.0)], 0.0).is_none());
        assert!(mean_triplet::<TB>(Vec::new(), 0.1).is_none());
        let mean = mean_triplet(vec![s(1.0), s(3.0)], 0.1).unwrap();
        assert!((v(mean) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn recon_weight_schedule() {
        assert_eq!(recon_weight(0, 16, 0.5), 0.0);
        assert!((recon_weight(8, 16, 0.5) - 0.25).abs() < 1e-6);
        assert_eq!(recon_weight(16, 16, 0.5), 0.5);
        assert_eq!(recon_weight(40, 16, 0.5), 0.5);
    }

    #[test]
    fn joint_backward_matches_two_pass_gradient() {
        type AD = Autodiff<TB>;
        let device = Default::default();
        let x = Tensor::<AD, 1>::from_data(TensorData::new(vec![1.5f32], [1]), &device)
            .require_grad();
        let cvae = x.clone().mul_scalar(3.0);
        let cost = x.clone().mul_scalar(2.0) + cvae.clone();

        let grads = JointObjective::new(cost, cvae).backward();
        let grad = x.grad(&grads).unwrap();
        let g = grad.into_data().to_vec::<f32>().unwrap()[0];
        // d(cost)/dx = 5, d(cvae)/dx = 3.
        assert!((g - 8.0).abs() < 1e-6);
    }
}
