//! Timestep and conditioning embeddings.
use crate::{Error, Result};
use tch::{nn, nn::Module, Kind, Tensor};

/// Sinusoidal projection of integer timesteps.
#[derive(Debug)]
pub struct Timesteps {
    num_channels: i64,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
}

impl Timesteps {
    pub fn new(num_channels: i64, flip_sin_to_cos: bool, downscale_freq_shift: f64) -> Self {
        Self { num_channels, flip_sin_to_cos, downscale_freq_shift }
    }
}

impl Module for Timesteps {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let half_dim = self.num_channels / 2;
        let exponent = Tensor::arange(half_dim, (Kind::Float, xs.device())) * -f64::ln(10000.);
        let exponent = exponent / (half_dim as f64 - self.downscale_freq_shift);
        let emb = exponent.exp();
        // emb = timesteps[:, None].float() * emb[None, :]
        let emb = xs.to_kind(Kind::Float).unsqueeze(-1) * emb.unsqueeze(0);
        let emb = if self.flip_sin_to_cos {
            Tensor::cat(&[emb.cos(), emb.sin()], -1)
        } else {
            Tensor::cat(&[emb.sin(), emb.cos()], -1)
        };
        if self.num_channels % 2 == 1 {
            emb.pad([0, 1, 0, 0], "constant", None)
        } else {
            emb
        }
    }
}

#[derive(Debug)]
pub struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimestepEmbedding {
    // act_fn: "silu"
    pub fn new(vs: nn::Path, channel: i64, time_embed_dim: i64) -> Self {
        let linear_cfg = Default::default();
        let linear_1 = nn::linear(&vs / "linear_1", channel, time_embed_dim, linear_cfg);
        let linear_2 = nn::linear(&vs / "linear_2", time_embed_dim, time_embed_dim, linear_cfg);
        Self { linear_1, linear_2 }
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.linear_1).silu().apply(&self.linear_2)
    }
}

/// Class label embedding whose last row is the null label used when the
/// conditioning is dropped.
#[derive(Debug)]
pub struct LabelEmbedding {
    embedding: nn::Embedding,
    num_classes: i64,
}

impl LabelEmbedding {
    pub fn new(vs: nn::Path, num_classes: i64, embed_dim: i64) -> Self {
        let embedding =
            nn::embedding(&vs / "embedding", num_classes + 1, embed_dim, Default::default());
        Self { embedding, num_classes }
    }

    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Labels must be in `0..num_classes`, the last row being reserved for the
    /// null label.
    pub fn check_labels(&self, labels: &Tensor) -> Result<()> {
        if labels.numel() == 0 {
            return Ok(());
        }
        let (min, max) = (labels.min().int64_value(&[]), labels.max().int64_value(&[]));
        if min < 0 || max >= self.num_classes {
            let bad = if min < 0 { min } else { max };
            return Err(Error::InvalidConfig(format!(
                "label {bad} is outside of 0..{}",
                self.num_classes
            )));
        }
        Ok(())
    }

    pub fn forward(&self, labels: &Tensor, uncond_mask: Option<&Tensor>) -> Tensor {
        let labels = match uncond_mask {
            Some(mask) => labels.masked_fill(mask, self.num_classes),
            None => labels.shallow_clone(),
        };
        labels.apply(&self.embedding)
    }
}

/// Encodes a clean image into `num_components` latent vectors, one per
/// factor the denoiser composes.
#[derive(Debug)]
pub struct LatentEncoder {
    conv_1: nn::Conv2D,
    conv_2: nn::Conv2D,
    conv_3: nn::Conv2D,
    proj: nn::Linear,
    // Latent standing in for a dropped component.
    null_latent: Tensor,
    num_components: i64,
    emb_dim: i64,
}

impl LatentEncoder {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        channels: i64,
        num_components: i64,
        emb_dim: i64,
    ) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let conv_1 = nn::conv2d(&vs / "conv_1", in_channels, channels, 3, conv_cfg);
        let conv_2 = nn::conv2d(&vs / "conv_2", channels, channels * 2, 3, conv_cfg);
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_3 = nn::conv2d(&vs / "conv_3", channels * 2, channels * 2, 3, conv_cfg);
        let proj =
            nn::linear(&vs / "proj", channels * 2, num_components * emb_dim, Default::default());
        let null_latent =
            vs.var("null_latent", &[emb_dim], nn::Init::Randn { mean: 0., stdev: 1. });
        Self { conv_1, conv_2, conv_3, proj, null_latent, num_components, emb_dim }
    }

    /// Returns latents of shape `[batch, num_components, emb_dim]`.
    pub fn encode(&self, xs: &Tensor) -> Tensor {
        let xs = xs.apply(&self.conv_1).silu().apply(&self.conv_2).silu().apply(&self.conv_3);
        xs.mean_dim(Some([2i64, 3].as_slice()), false, Kind::Float).apply(&self.proj).reshape([
            -1,
            self.num_components,
            self.emb_dim,
        ])
    }

    /// Latents of a batch where every component is dropped.
    pub fn null_latents(&self, bsize: i64) -> Tensor {
        self.null_latent.expand([bsize, self.num_components, self.emb_dim], false)
    }

    /// Replaces the latents of masked examples by the null latent.
    pub fn drop_latents(&self, latents: &Tensor, uncond_mask: &Tensor) -> Tensor {
        let mask = uncond_mask.reshape([-1, 1, 1]);
        self.null_latent.expand_as(latents).where_self(&mask, latents)
    }
}
