//! Typed run configuration.
//!
//! A run is described by three sections, one per collaborator: the denoising
//! model, the diffusion process and the training loop. [`RunConfigBuilder`]
//! checks the combinations that only make sense together before anything is
//! built, and the resolved values are recorded as `arguments.json` in the
//! run's log folder.
use crate::schedulers::gaussian_diffusion::{
    GaussianDiffusion, GaussianDiffusionConfig, LossWeighting,
};
use crate::schedulers::resample::ScheduleSamplerKind;
use crate::schedulers::{BetaSchedule, NoiseSchedule, PredictionType, VarianceType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which conditioning the denoiser receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Conditioned on `num_components` latents encoded from the clean image;
    /// predictions of the components are composed by averaging.
    #[serde(rename = "model")]
    Decomp,
    /// Conditioned on a class label.
    #[serde(rename = "unet_model_cls")]
    ClassConditional,
    #[serde(rename = "unet_model")]
    Unconditional,
}

impl ModelKind {
    pub fn desc(&self) -> &'static str {
        match self {
            Self::Decomp => "model",
            Self::ClassConditional => "unet_model_cls",
            Self::Unconditional => "unet_model",
        }
    }

    pub fn is_conditional(&self) -> bool {
        !matches!(self, Self::Unconditional)
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "model" => Ok(Self::Decomp),
            "unet_model_cls" => Ok(Self::ClassConditional),
            "unet_model" => Ok(Self::Unconditional),
            other => Err(Error::InvalidConfig(format!("unknown model {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ModelKind,
    /// Side of the square training images.
    pub image_size: i64,
    pub in_channels: i64,
    /// Base channel count of the UNet.
    pub num_channels: i64,
    /// Channel multiplier of every resolution level, one level per entry.
    pub channel_mult: Vec<i64>,
    pub num_res_blocks: usize,
    pub norm_num_groups: i64,
    /// Width of every latent component.
    pub emb_dim: i64,
    pub num_components: i64,
    pub num_classes: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Decomp,
            image_size: 64,
            in_channels: 3,
            num_channels: 64,
            channel_mult: vec![1, 2, 2],
            num_res_blocks: 2,
            norm_num_groups: 32,
            emb_dim: 64,
            num_components: 4,
            num_classes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub diffusion_steps: usize,
    pub noise_schedule: BetaSchedule,
    /// Train the model to predict `x_0` rather than the noise.
    pub predict_xstart: bool,
    pub variance_type: VarianceType,
    /// Down-weight low noise timesteps with min-SNR weighting.
    pub downweight: bool,
    pub snr_gamma: f64,
    pub clip_denoised: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            diffusion_steps: 1000,
            noise_schedule: BetaSchedule::Linear,
            predict_xstart: false,
            variance_type: VarianceType::FixedSmall,
            downweight: false,
            snr_gamma: 5.,
            clip_denoised: true,
        }
    }
}

impl DiffusionConfig {
    pub fn prediction_type(&self) -> PredictionType {
        PredictionType::from_predict_xstart(self.predict_xstart)
    }

    pub fn gaussian_diffusion_config(&self) -> GaussianDiffusionConfig {
        let loss_weighting = if self.downweight {
            LossWeighting::MinSnr { gamma: self.snr_gamma }
        } else {
            LossWeighting::Uniform
        };
        GaussianDiffusionConfig {
            prediction_type: self.prediction_type(),
            variance_type: self.variance_type,
            loss_weighting,
            clip_denoised: self.clip_denoised,
        }
    }

    pub fn build(&self) -> Result<GaussianDiffusion> {
        let schedule = NoiseSchedule::new(self.noise_schedule, self.diffusion_steps)?;
        Ok(GaussianDiffusion::new(schedule, self.gaussian_diffusion_config()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub dataset: String,
    pub data_dir: PathBuf,
    /// Only use the first images of the dataset.
    pub num_images: Option<usize>,
    pub batch_size: i64,
    /// Split batches in chunks of this size and accumulate their gradients.
    pub microbatch: Option<i64>,
    pub lr: f64,
    pub weight_decay: f64,
    /// Linearly anneal the learning rate to zero over that many steps, 0 disables.
    pub lr_anneal_steps: u64,
    pub ema_rates: Vec<f64>,
    pub log_interval: u64,
    pub save_interval: u64,
    pub resume_checkpoint: Option<PathBuf>,
    /// The run lasts `epoch_block` blocks of `num_its` steps.
    pub epoch_block: u64,
    pub num_its: u64,
    /// Probability of dropping the conditioning of a training example.
    pub p_uncond: f64,
    /// Penalize non-orthogonal latent components.
    pub latent_orthog: bool,
    /// Image whose decomposition is sampled at every checkpoint.
    pub default_image: Option<PathBuf>,
    pub schedule_sampler: ScheduleSamplerKind,
    pub use_dist: bool,
    pub world_size: usize,
    pub sync_timeout_secs: u64,
    /// Abort after that many consecutive non-finite losses.
    pub max_divergent_steps: Option<usize>,
    pub log_folder: Option<PathBuf>,
    pub extra_desc: String,
    pub num_run: u32,
    pub seed: i64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: "clevr".to_string(),
            data_dir: PathBuf::new(),
            num_images: None,
            batch_size: 1,
            microbatch: None,
            lr: 1e-4,
            weight_decay: 0.,
            lr_anneal_steps: 0,
            ema_rates: vec![0.9999],
            log_interval: 10,
            save_interval: 10000,
            resume_checkpoint: None,
            epoch_block: 10000,
            num_its: 200,
            p_uncond: 0.,
            latent_orthog: false,
            default_image: None,
            schedule_sampler: ScheduleSamplerKind::Uniform,
            use_dist: false,
            world_size: 1,
            sync_timeout_secs: 600,
            max_divergent_steps: None,
            log_folder: None,
            extra_desc: String::new(),
            num_run: 0,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Number of optimizer steps a single invocation runs for.
    pub fn total_steps(&self) -> u64 {
        self.epoch_block.saturating_mul(self.num_its)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Parses a comma separated list of EMA decay rates such as `"0.999,0.9999"`.
    /// The reference image of the known datasets, relative to the working
    /// directory.
    pub fn dataset_default_image(dataset: &str) -> Option<PathBuf> {
        let path = match dataset {
            "clevr" => "sample_images/clevr_im_10.png",
            "mnist" => "sample_images/mnist_digit_4.png",
            "clevr_toy" => "im_8_clevr_toy.png",
            "celebahq" | "faces" => "im_19_celebahq.jpg",
            "falcor3d" => "im_10_falcor3d.png",
            "kitti" | "comb_kitti" => "im_41_kitti.png",
            "vkitti" => "im_12_vkitti.jpg",
            "tetris" => "im_6_tetris.png",
            "anime" => "im_8_anime.jpg",
            _ => return None,
        };
        Some(PathBuf::from(path))
    }

    pub fn parse_ema_rates(rates: &str) -> Result<Vec<f64>> {
        rates
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| {
                r.parse::<f64>()
                    .map_err(|_| Error::InvalidConfig(format!("invalid EMA rate {r:?}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub diffusion: DiffusionConfig,
    pub train: TrainConfig,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Name of the run, encoding model, dataset and the main hyperparameters.
    pub fn save_desc(&self) -> String {
        let num_images = match self.train.num_images {
            Some(n) => n.to_string(),
            None => "None".to_string(),
        };
        let mut desc = format!(
            "{}_{}_{}_{}_emb_{}_n{}_v{}",
            self.model.kind.desc(),
            self.train.dataset,
            num_images,
            self.diffusion.prediction_type().desc(),
            self.model.emb_dim,
            self.model.num_components,
            self.train.num_run,
        );
        if self.train.p_uncond > 0. {
            desc.push_str("_free");
        }
        if !self.train.extra_desc.is_empty() {
            desc.push('_');
            desc.push_str(&self.train.extra_desc);
        }
        desc
    }

    /// Directory receiving logs, `arguments.json` and checkpoints.
    pub fn log_folder(&self) -> PathBuf {
        match &self.train.log_folder {
            Some(folder) => folder.clone(),
            None => PathBuf::from(format!("logs_{}", self.save_desc())),
        }
    }

    /// Records the resolved configuration as `arguments.json` in `dir`.
    pub fn write_arguments<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let path = dir.as_ref().join("arguments.json");
        // Going through a `Value` sorts the keys.
        let value = serde_json::to_value(self)?;
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser)?;
        std::fs::write(&path, buf)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    model: ModelConfig,
    diffusion: DiffusionConfig,
    train: TrainConfig,
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::InvalidConfig(msg()))
    }
}

impl RunConfigBuilder {
    pub fn model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn diffusion(mut self, diffusion: DiffusionConfig) -> Self {
        self.diffusion = diffusion;
        self
    }

    pub fn train(mut self, train: TrainConfig) -> Self {
        self.train = train;
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        let Self { model, diffusion, train } = self;

        ensure(model.in_channels > 0, || "in_channels must be positive".into())?;
        ensure(model.num_channels > 0 && model.norm_num_groups > 0, || {
            "num_channels and norm_num_groups must be positive".into()
        })?;
        ensure(!model.channel_mult.is_empty(), || "channel_mult cannot be empty".into())?;
        for mult in model.channel_mult.iter() {
            let channels = model.num_channels * mult;
            ensure(*mult > 0 && channels % model.norm_num_groups == 0, || {
                format!(
                    "{channels} channels cannot be split in {} groups",
                    model.norm_num_groups
                )
            })?;
        }
        ensure(model.num_res_blocks > 0, || "num_res_blocks must be positive".into())?;
        let downsampling = 1i64 << (model.channel_mult.len() - 1);
        ensure(model.image_size > 0 && model.image_size % downsampling == 0, || {
            format!("image_size {} is not a multiple of {downsampling}", model.image_size)
        })?;
        match model.kind {
            ModelKind::Decomp => {
                ensure(model.num_components >= 1 && model.emb_dim >= 1, || {
                    "the decomposed model needs num_components >= 1 and emb_dim >= 1".into()
                })?;
                ensure(model.image_size >= 4, || "image_size is too small to encode".into())?;
            }
            ModelKind::ClassConditional => {
                ensure(model.num_classes >= 1, || {
                    "the class conditional model needs num_classes >= 1".into()
                })?;
            }
            ModelKind::Unconditional => {
                ensure(train.p_uncond == 0., || {
                    "p_uncond requires a conditional model".into()
                })?;
            }
        }
        ensure(model.kind == ModelKind::Decomp || !train.latent_orthog, || {
            "latent_orthog requires the decomposed model".into()
        })?;
        ensure(model.kind == ModelKind::Decomp || train.default_image.is_none(), || {
            "default_image requires the decomposed model".into()
        })?;

        NoiseSchedule::new(diffusion.noise_schedule, diffusion.diffusion_steps)?;
        ensure(diffusion.snr_gamma > 0., || "snr_gamma must be positive".into())?;

        ensure(train.batch_size > 0, || "batch_size must be positive".into())?;
        if let Some(microbatch) = train.microbatch {
            ensure(microbatch > 0 && microbatch <= train.batch_size, || {
                format!("microbatch {microbatch} must be in 1..={}", train.batch_size)
            })?;
        }
        ensure(train.lr > 0. && train.weight_decay >= 0., || {
            "lr must be positive and weight_decay non-negative".into()
        })?;
        for rate in train.ema_rates.iter() {
            ensure((0. ..=1.).contains(rate), || format!("EMA rate {rate} is not in [0, 1]"))?;
        }
        ensure((0. ..1.).contains(&train.p_uncond), || {
            format!("p_uncond {} is not in [0, 1)", train.p_uncond)
        })?;
        ensure(train.log_interval > 0 && train.save_interval > 0, || {
            "log_interval and save_interval must be positive".into()
        })?;
        ensure(train.world_size >= 1, || "world_size must be at least 1".into())?;
        ensure(train.use_dist || train.world_size == 1, || {
            "world_size > 1 requires use_dist".into()
        })?;
        ensure(train.sync_timeout_secs > 0, || "sync_timeout_secs must be positive".into())?;
        ensure(train.max_divergent_steps != Some(0), || {
            "max_divergent_steps must be positive when set".into()
        })?;

        Ok(RunConfig { model, diffusion, train })
    }
}
