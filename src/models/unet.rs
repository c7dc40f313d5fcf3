//! UNet denoiser with decomposed, class or no conditioning.
//!
//! The network takes a noisy sample and its diffusion timestep and predicts
//! either the noise or the clean sample. With [`ModelKind::Decomp`] the clean
//! image is first encoded into `num_components` latents; the UNet is run once
//! per latent and the per-component predictions are averaged.
use super::embeddings::{LabelEmbedding, LatentEncoder, TimestepEmbedding, Timesteps};
use super::resnet::{ResnetBlock, ResnetBlockConfig};
use super::Denoiser;
use crate::config::{ModelConfig, ModelKind};
use crate::Result;
use tch::{nn, nn::Module, Kind, Tensor};

#[derive(Debug)]
struct Downsample2D {
    conv: nn::Conv2D,
}

impl Downsample2D {
    fn new(vs: nn::Path, channels: i64) -> Self {
        let config = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", channels, channels, 3, config);
        Self { conv }
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

// Nearest neighbour upsampling followed by a convolution.
#[derive(Debug)]
struct Upsample2D {
    conv: nn::Conv2D,
}

impl Upsample2D {
    fn new(vs: nn::Path, channels: i64) -> Self {
        let config = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", channels, channels, 3, config);
        Self { conv }
    }
}

impl Module for Upsample2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (h, w) = (size[2], size[3]);
        xs.upsample_nearest2d([2 * h, 2 * w], Some(2.), Some(2.)).apply(&self.conv)
    }
}

#[derive(Debug)]
enum DownLayer {
    Resnet(ResnetBlock),
    Downsample(Downsample2D),
}

#[derive(Debug)]
enum UpLayer {
    // Consumes one skip connection.
    Resnet(ResnetBlock),
    Upsample(Upsample2D),
}

#[derive(Debug)]
enum Conditioning {
    None,
    Labels(LabelEmbedding),
    Latents { encoder: LatentEncoder, proj: nn::Linear },
}

#[derive(Debug)]
pub struct DecompUNet {
    conv_in: nn::Conv2D,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    conditioning: Conditioning,
    down_layers: Vec<DownLayer>,
    mid_block: (ResnetBlock, ResnetBlock),
    up_layers: Vec<UpLayer>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
}

impl DecompUNet {
    pub fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        let b_channels = config.num_channels;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", config.in_channels, b_channels, 3, conv_cfg);

        let time_proj = Timesteps::new(b_channels, true, 0.);
        let time_embedding =
            TimestepEmbedding::new(&vs / "time_embedding", b_channels, time_embed_dim);

        let conditioning = match config.kind {
            ModelKind::Unconditional => Conditioning::None,
            ModelKind::ClassConditional => Conditioning::Labels(LabelEmbedding::new(
                &vs / "label_embedding",
                config.num_classes,
                time_embed_dim,
            )),
            ModelKind::Decomp => {
                let encoder = LatentEncoder::new(
                    &vs / "encoder",
                    config.in_channels,
                    b_channels,
                    config.num_components,
                    config.emb_dim,
                );
                let proj = nn::linear(
                    &vs / "latent_proj",
                    config.emb_dim,
                    time_embed_dim,
                    Default::default(),
                );
                Conditioning::Latents { encoder, proj }
            }
        };

        let resnet_cfg = |out_channels| ResnetBlockConfig {
            out_channels: Some(out_channels),
            temb_channels: time_embed_dim,
            groups: config.norm_num_groups,
            ..Default::default()
        };

        let n_levels = config.channel_mult.len();
        let vs_down = &vs / "down_layers";
        let mut down_layers = vec![];
        let mut skip_channels = vec![b_channels];
        let mut channels = b_channels;
        for (level, mult) in config.channel_mult.iter().enumerate() {
            let out_channels = b_channels * mult;
            for _ in 0..config.num_res_blocks {
                let block =
                    ResnetBlock::new(&vs_down / down_layers.len(), channels, resnet_cfg(out_channels));
                down_layers.push(DownLayer::Resnet(block));
                channels = out_channels;
                skip_channels.push(channels);
            }
            if level + 1 < n_levels {
                let down = Downsample2D::new(&vs_down / down_layers.len(), channels);
                down_layers.push(DownLayer::Downsample(down));
                skip_channels.push(channels);
            }
        }

        let vs_mid = &vs / "mid_block";
        let mid_block = (
            ResnetBlock::new(&vs_mid / 0, channels, resnet_cfg(channels)),
            ResnetBlock::new(&vs_mid / 1, channels, resnet_cfg(channels)),
        );

        let vs_up = &vs / "up_layers";
        let mut up_layers = vec![];
        for (level, mult) in config.channel_mult.iter().enumerate().rev() {
            let out_channels = b_channels * mult;
            for _ in 0..=config.num_res_blocks {
                let skip = skip_channels.pop().unwrap_or(0);
                let block = ResnetBlock::new(
                    &vs_up / up_layers.len(),
                    channels + skip,
                    resnet_cfg(out_channels),
                );
                up_layers.push(UpLayer::Resnet(block));
                channels = out_channels;
            }
            if level > 0 {
                let up = Upsample2D::new(&vs_up / up_layers.len(), channels);
                up_layers.push(UpLayer::Upsample(up));
            }
        }

        let group_cfg = nn::GroupNormConfig { eps: 1e-6, ..Default::default() };
        let conv_norm_out =
            nn::group_norm(&vs / "conv_norm_out", config.norm_num_groups, channels, group_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", channels, config.in_channels, 3, conv_cfg);
        Self {
            conv_in,
            time_proj,
            time_embedding,
            conditioning,
            down_layers,
            mid_block,
            up_layers,
            conv_norm_out,
            conv_out,
        }
    }

    fn unet(&self, xs: &Tensor, emb: &Tensor) -> Tensor {
        let xs = xs.apply(&self.conv_in);
        let mut skips = vec![xs.shallow_clone()];
        let mut xs = xs;
        for layer in self.down_layers.iter() {
            xs = match layer {
                DownLayer::Resnet(block) => block.forward(&xs, emb),
                DownLayer::Downsample(down) => xs.apply(down),
            };
            skips.push(xs.shallow_clone());
        }
        let xs = self.mid_block.0.forward(&xs, emb);
        let mut xs = self.mid_block.1.forward(&xs, emb);
        for layer in self.up_layers.iter() {
            xs = match layer {
                UpLayer::Resnet(block) => {
                    let skip = skips.pop().expect("one skip connection per up block");
                    block.forward(&Tensor::cat(&[xs, skip], 1), emb)
                }
                UpLayer::Upsample(up) => xs.apply(up),
            };
        }
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}

impl Denoiser for DecompUNet {
    fn condition(&self, x_start: &Tensor, labels: Option<&Tensor>) -> Result<Option<Tensor>> {
        match &self.conditioning {
            Conditioning::None => Ok(None),
            Conditioning::Labels(embedding) => match labels {
                Some(labels) => {
                    embedding.check_labels(labels)?;
                    Ok(Some(labels.shallow_clone()))
                }
                None => Ok(None),
            },
            Conditioning::Latents { encoder, .. } => Ok(Some(encoder.encode(x_start))),
        }
    }

    fn forward_t(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        cond: Option<&Tensor>,
        uncond_mask: Option<&Tensor>,
    ) -> Tensor {
        let size = xs.size();
        let bsize = size[0];
        let device = xs.device();
        let emb = timesteps.apply(&self.time_proj).apply(&self.time_embedding);
        match &self.conditioning {
            Conditioning::None => self.unet(xs, &emb),
            Conditioning::Labels(embedding) => {
                let labels = match cond {
                    Some(labels) => labels.shallow_clone(),
                    None => Tensor::zeros([bsize], (Kind::Int64, device)),
                };
                // Missing labels are always replaced by the null label.
                let all = Tensor::ones([bsize], (Kind::Bool, device));
                let mask = match (cond, uncond_mask) {
                    (None, _) => Some(&all),
                    (Some(_), mask) => mask,
                };
                let emb = emb + embedding.forward(&labels, mask);
                self.unet(xs, &emb)
            }
            Conditioning::Latents { encoder, proj } => {
                let latents = match (cond, uncond_mask) {
                    (None, _) => encoder.null_latents(bsize),
                    (Some(latents), Some(mask)) => encoder.drop_latents(latents, mask),
                    (Some(latents), None) => latents.shallow_clone(),
                };
                let num_components = latents.size()[1];
                let emb = (emb.unsqueeze(1) + latents.apply(proj)).reshape([bsize * num_components, -1]);
                let mut expanded = vec![bsize, num_components];
                expanded.extend_from_slice(&size[1..]);
                let mut flat = vec![bsize * num_components];
                flat.extend_from_slice(&size[1..]);
                let xs = xs.unsqueeze(1).expand(expanded.as_slice(), false).reshape(flat.as_slice());
                self.unet(&xs, &emb)
                    .reshape(expanded.as_slice())
                    .mean_dim(Some([1i64].as_slice()), false, xs.kind())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn tiny(kind: ModelKind) -> ModelConfig {
        ModelConfig {
            kind,
            image_size: 8,
            in_channels: 3,
            num_channels: 8,
            channel_mult: vec![1, 2],
            num_res_blocks: 1,
            norm_num_groups: 4,
            emb_dim: 6,
            num_components: 3,
            num_classes: 5,
        }
    }

    #[test]
    fn outputs_have_the_input_shape() {
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[3i64, 700]);
        let labels = Tensor::from_slice(&[1i64, 4]);
        let mask = Tensor::from_slice(&[true, false]);
        for kind in [ModelKind::Decomp, ModelKind::ClassConditional, ModelKind::Unconditional] {
            let vs = nn::VarStore::new(Device::Cpu);
            let model = DecompUNet::new(vs.root(), &tiny(kind));
            let cond = model.condition(&xs, Some(&labels)).unwrap();
            assert_eq!(cond.is_some(), kind.is_conditional());
            for mask in [None, Some(&mask)] {
                let out = model.forward_t(&xs, &t, cond.as_ref(), mask);
                assert_eq!(out.size(), [2, 3, 8, 8], "{kind:?}");
            }
            let out = model.forward_t(&xs, &t, None, None);
            assert_eq!(out.size(), [2, 3, 8, 8], "{kind:?}");
        }
    }

    #[test]
    fn decomp_latents_have_one_row_per_component() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DecompUNet::new(vs.root(), &tiny(ModelKind::Decomp));
        let xs = Tensor::randn([4, 3, 8, 8], (Kind::Float, Device::Cpu));
        let latents = model.condition(&xs, None).unwrap().unwrap();
        assert_eq!(latents.size(), [4, 3, 6]);
    }

    #[test]
    fn dropping_all_conditioning_matches_no_conditioning() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DecompUNet::new(vs.root(), &tiny(ModelKind::ClassConditional));
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[10i64, 20]);
        let labels = Tensor::from_slice(&[0i64, 2]);
        let all = Tensor::from_slice(&[true, true]);
        let dropped = model.forward_t(&xs, &t, Some(&labels), Some(&all));
        let missing = model.forward_t(&xs, &t, None, None);
        assert!(dropped.allclose(&missing, 1e-5, 1e-6, false));
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = ModelConfig { num_classes: 2, ..tiny(ModelKind::ClassConditional) };
        let model = DecompUNet::new(vs.root(), &config);
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        // Label 2 would otherwise select the null embedding.
        let err = model.condition(&xs, Some(&Tensor::from_slice(&[0i64, 2]))).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfig(_)), "{err}");
        assert!(model.condition(&xs, Some(&Tensor::from_slice(&[0i64, 1]))).unwrap().is_some());
    }
}
