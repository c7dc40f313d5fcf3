use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct ResnetBlockConfig {
    pub out_channels: Option<i64>,
    pub temb_channels: i64,
    pub groups: i64,
    pub eps: f64,
    // non_linearity: silu
    pub output_scale_factor: f64,
}

impl Default for ResnetBlockConfig {
    fn default() -> Self {
        Self { out_channels: None, temb_channels: 256, groups: 8, eps: 1e-6, output_scale_factor: 1. }
    }
}

/// Residual block whose activations are shifted by the timestep (and
/// conditioning) embedding.
#[derive(Debug)]
pub struct ResnetBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    emb_proj: nn::Linear,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    conv_shortcut: Option<nn::Conv2D>,
    config: ResnetBlockConfig,
}

impl ResnetBlock {
    pub fn new(vs: nn::Path, in_channels: i64, config: ResnetBlockConfig) -> Self {
        let out_channels = config.out_channels.unwrap_or(in_channels);
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let group_cfg = nn::GroupNormConfig { eps: config.eps, affine: true, ..Default::default() };
        let norm1 = nn::group_norm(&vs / "norm1", config.groups, in_channels, group_cfg);
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let emb_proj =
            nn::linear(&vs / "emb_proj", config.temb_channels, out_channels, Default::default());
        let norm2 = nn::group_norm(&vs / "norm2", config.groups, out_channels, group_cfg);
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let conv_shortcut = if in_channels != out_channels {
            let conv_cfg = nn::ConvConfig { stride: 1, padding: 0, ..Default::default() };
            Some(nn::conv2d(&vs / "conv_shortcut", in_channels, out_channels, 1, conv_cfg))
        } else {
            None
        };
        Self { norm1, conv1, emb_proj, norm2, conv2, conv_shortcut, config }
    }

    pub fn forward(&self, xs: &Tensor, emb: &Tensor) -> Tensor {
        let shortcut_xs = match &self.conv_shortcut {
            Some(conv_shortcut) => xs.apply(conv_shortcut),
            None => xs.shallow_clone(),
        };
        let xs = xs.apply(&self.norm1).silu().apply(&self.conv1);
        let xs = emb.silu().apply(&self.emb_proj).unsqueeze(-1).unsqueeze(-1) + xs;
        let xs = xs.apply(&self.norm2).silu().apply(&self.conv2);
        (shortcut_xs + xs) / self.config.output_scale_factor
    }
}
