//! Conditional VAE over per-frame backbone features, conditioned on attention.

use burn::module::Module;
use burn::nn;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::features::spatial_pool;

#[derive(Debug, Clone)]
pub struct CvaeConfig {
    /// Channel count of the feature stage being modelled.
    pub feature_dim: usize,
    pub latent_dim: usize,
    pub hidden: usize,
}

impl Default for CvaeConfig {
    fn default() -> Self {
        Self {
            feature_dim: 64,
            latent_dim: 16,
            hidden: 64,
        }
    }
}

#[derive(Debug, Module)]
pub struct Cvae<B: Backend> {
    enc_hidden: nn::Linear<B>,
    enc_mean: nn::Linear<B>,
    enc_log_var: nn::Linear<B>,
    dec_hidden: nn::Linear<B>,
    dec_out: nn::Linear<B>,
    latent_dim: usize,
}

pub enum CvaeOp<B: Backend> {
    /// Decode caller-provided noise `[b, t, latent]` under attention `[b, t]`.
    Inference {
        attention: Tensor<B, 2>,
        noise: Tensor<B, 3>,
    },
    /// Encode features `[b, t, h, w, c]` with attention, reparameterize with `noise`, decode.
    Forward {
        features: Tensor<B, 5>,
        attention: Tensor<B, 2>,
        noise: Tensor<B, 3>,
    },
}

#[derive(Debug, Clone)]
pub struct CvaeForward<B: Backend> {
    pub mean: Tensor<B, 3>,
    pub log_var: Tensor<B, 3>,
    pub z: Tensor<B, 3>,
    /// `[b, t, 1, 1, c]`, broadcastable against the feature map.
    pub recon: Tensor<B, 5>,
}

pub enum CvaeOutput<B: Backend> {
    Reconstruction(Tensor<B, 5>),
    Forward(CvaeForward<B>),
}

impl<B: Backend> Cvae<B> {
    pub fn new(cfg: CvaeConfig, device: &B::Device) -> Self {
        let linear =
            |i: usize, o: usize| -> nn::Linear<B> { nn::LinearConfig::new(i, o).init(device) };
        Self {
            enc_hidden: linear(cfg.feature_dim + 1, cfg.hidden),
            enc_mean: linear(cfg.hidden, cfg.latent_dim),
            enc_log_var: linear(cfg.hidden, cfg.latent_dim),
            dec_hidden: linear(cfg.latent_dim + 1, cfg.hidden),
            dec_out: linear(cfg.hidden, cfg.feature_dim),
            latent_dim: cfg.latent_dim,
        }
    }

    pub fn forward(&self, op: CvaeOp<B>) -> CvaeOutput<B> {
        match op {
            CvaeOp::Inference { attention, noise } => {
                CvaeOutput::Reconstruction(self.decode(noise, attention))
            }
            CvaeOp::Forward {
                features,
                attention,
                noise,
            } => CvaeOutput::Forward(self.encode_decode(features, attention, noise)),
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn encode_decode(
        &self,
        features: Tensor<B, 5>,
        attention: Tensor<B, 2>,
        noise: Tensor<B, 3>,
    ) -> CvaeForward<B> {
        let tokens = spatial_pool(features);
        let hidden = relu(
            self.enc_hidden
                .forward(with_attention(tokens, attention.clone())),
        );
        let mean = self.enc_mean.forward(hidden.clone());
        let log_var = self.enc_log_var.forward(hidden);
        let z = mean.clone() + log_var.clone().mul_scalar(0.5).exp() * noise;
        let recon = self.decode(z.clone(), attention);
        CvaeForward {
            mean,
            log_var,
            z,
            recon,
        }
    }

    fn decode(&self, z: Tensor<B, 3>, attention: Tensor<B, 2>) -> Tensor<B, 5> {
        let hidden = relu(self.dec_hidden.forward(with_attention(z, attention)));
        let out = self.dec_out.forward(hidden);
        let [batch, frames, channels] = out.dims();
        out.reshape([batch, frames, 1, 1, channels])
    }
}

/// Append attention as one extra channel: `[b, t, c]` + `[b, t]` -> `[b, t, c + 1]`.
fn with_attention<B: Backend>(tokens: Tensor<B, 3>, attention: Tensor<B, 2>) -> Tensor<B, 3> {
    let [batch, frames] = attention.dims();
    Tensor::cat(vec![tokens, attention.reshape([batch, frames, 1])], 2)
}
