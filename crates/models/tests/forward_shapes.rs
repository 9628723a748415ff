use burn::backend::Autodiff;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{
    Cvae, CvaeConfig, CvaeOp, CvaeOutput, Detector, DetectorConfig, DetectorOp, DetectorOutput,
    Partition,
};

// CPU backend keeps the shape checks independent of any GPU feature.
type ADBackend = Autodiff<NdArray<f32>>;

fn small_config() -> DetectorConfig {
    DetectorConfig {
        feature_dim: 8,
        hidden: 16,
        num_classes: 5,
        embed_dim: 4,
        ..Default::default()
    }
}

#[test]
fn detector_stages_have_expected_shapes() {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let cfg = small_config();
    let model = Detector::<ADBackend>::new(cfg.clone(), &device);

    let (batch, frames) = (2, 16);
    let clips = Tensor::<ADBackend, 5>::zeros([batch, 3, frames, 4, 4], &device);

    let DetectorOutput::Features(features) = model.forward(DetectorOp::Backbone(clips)) else {
        panic!("backbone should return features");
    };
    assert_eq!(features.mixed_4f.dims(), [batch, frames, 4, 4, 8]);
    assert_eq!(features.mixed_5c.dims(), [batch, frames / 2, 4, 4, 8]);

    let DetectorOutput::Attention(attention) = model.forward(DetectorOp::Attention(&features))
    else {
        panic!("attention should return maps");
    };
    assert_eq!(attention.mixed_4f.dims(), [batch, frames]);
    assert_eq!(attention.mixed_5c.dims(), [batch, frames / 2]);

    let fg = features.partition(&attention, Partition::Foreground);
    let DetectorOutput::Detections(det) = model.forward(DetectorOp::Classify(fg)) else {
        panic!("classify should return detections");
    };
    let priors = frames / 4;
    let k = model.boundary_channels();
    assert_eq!(det.loc.dims(), [batch, priors, 2]);
    assert_eq!(det.conf.dims(), [batch, priors, cfg.num_classes]);
    assert_eq!(det.prop_conf.dims(), [batch, priors, cfg.num_classes]);
    assert_eq!(det.center.dims(), [batch, priors, 1]);
    assert_eq!(det.priors.dims(), [priors, 1]);
    assert_eq!(det.start.dims(), [batch, frames, k]);
    assert_eq!(det.end_conf_prop.dims(), [batch, priors, k]);

    let loc_min: f32 = det.loc.min().into_data().to_vec::<f32>().unwrap_or_default()[0];
    assert!(loc_min >= 0.0);
}

#[test]
fn contrast_returns_three_scales() {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let model = Detector::<ADBackend>::new(small_config(), &device);
    let clip = Tensor::<ADBackend, 5>::ones([1, 3, 16, 2, 2], &device);

    let DetectorOutput::Triplet(triplet) = model.forward(DetectorOp::Contrast {
        clip,
        spans: &[[0.2, 0.6]],
    }) else {
        panic!("contrast should return a triplet");
    };
    for scale in triplet.anchor.iter().chain(&triplet.negative) {
        assert_eq!(scale.dims(), [1, 4]);
    }
}

#[test]
fn cvae_ops_match_feature_layout() {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let cvae = Cvae::<ADBackend>::new(
        CvaeConfig {
            feature_dim: 8,
            latent_dim: 3,
            hidden: 6,
        },
        &device,
    );
    let attention = Tensor::<ADBackend, 2>::ones([2, 8], &device);
    let noise = Tensor::<ADBackend, 3>::zeros([2, 8, cvae.latent_dim()], &device);

    let CvaeOutput::Reconstruction(recon) = cvae.forward(CvaeOp::Inference {
        attention: attention.clone(),
        noise: noise.clone(),
    }) else {
        panic!("inference should reconstruct");
    };
    assert_eq!(recon.dims(), [2, 8, 1, 1, 8]);

    let features = Tensor::<ADBackend, 5>::ones([2, 8, 3, 3, 8], &device);
    let CvaeOutput::Forward(out) = cvae.forward(CvaeOp::Forward {
        features,
        attention,
        noise,
    }) else {
        panic!("forward should encode");
    };
    assert_eq!(out.mean.dims(), [2, 8, 3]);
    assert_eq!(out.log_var.dims(), [2, 8, 3]);
    assert_eq!(out.recon.dims(), [2, 8, 1, 1, 8]);
}
