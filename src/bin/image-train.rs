// Trains a diffusion model on a directory of images.
//
// The images are either directly in --data-dir, or in one sub-directory per
// class when training the class conditional model:
//
//   cargo run --release --features clap,ctrlc --bin image-train -- \
//     --data-dir data/clevr --image-size 64 --batch-size 16 --save-interval 5000
//
// Logs, arguments.json and checkpoints land in logs_<run description>/ unless
// --log-folder is given. Resume a run with --resume-checkpoint path/model_<epoch>.pt.
// Ctrl-C stops every replica at the end of the current step.
use anyhow::Context;
use clap::Parser;
use decomp_diffusion::config::{DiffusionConfig, ModelConfig, ModelKind, RunConfig, TrainConfig};
use decomp_diffusion::data::{self, DataLoader, ImageDataset};
use decomp_diffusion::models::DecompUNet;
use decomp_diffusion::schedulers::{resample::ScheduleSamplerKind, BetaSchedule, VarianceType};
use decomp_diffusion::train::{LocalGroup, ProcessGroup, SingleProcess, StopHandle, TrainLoop};
use decomp_diffusion::utils::DeviceSetup;
use std::path::PathBuf;
use std::sync::Arc;
use tch::{nn, Device};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// Name of the dataset, only used to name the run.
    #[arg(long, default_value = "clevr")]
    dataset: String,

    #[arg(long, value_name = "DIR")]
    data_dir: PathBuf,

    /// Only train on the first images of the dataset.
    #[arg(long)]
    num_images: Option<usize>,

    /// One of model (decomposed), unet_model_cls or unet_model.
    #[arg(long, default_value = "model")]
    model: String,

    #[arg(long, default_value_t = 64)]
    image_size: i64,

    #[arg(long, default_value_t = 64)]
    num_channels: i64,

    /// Comma separated channel multipliers, one per resolution.
    #[arg(long, default_value = "1,2,2")]
    channel_mult: String,

    #[arg(long, default_value_t = 2)]
    num_res_blocks: usize,

    #[arg(long, default_value_t = 32)]
    norm_num_groups: i64,

    #[arg(long, default_value_t = 64)]
    emb_dim: i64,

    /// Number of latent components of the decomposed model.
    #[arg(long, default_value_t = 4)]
    num_components: i64,

    /// Number of classes, taken from the dataset when 0.
    #[arg(long, default_value_t = 0)]
    num_classes: i64,

    #[arg(long, default_value_t = 1000)]
    diffusion_steps: usize,

    /// linear or cosine.
    #[arg(long, default_value = "linear")]
    noise_schedule: String,

    #[arg(long)]
    predict_xstart: bool,

    /// small or large.
    #[arg(long, default_value = "small")]
    variance_type: String,

    /// Weight the losses with min-SNR weighting.
    #[arg(long)]
    downweight: bool,

    #[arg(long, default_value_t = 5.0)]
    snr_gamma: f64,

    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,

    #[arg(long, default_value_t = 0)]
    lr_anneal_steps: u64,

    #[arg(long, default_value_t = 1)]
    batch_size: i64,

    /// Microbatch size, -1 disables microbatching.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    microbatch: i64,

    /// Comma separated EMA rates.
    #[arg(long, default_value = "0.9999")]
    ema_rate: String,

    #[arg(long, default_value_t = 10)]
    log_interval: u64,

    #[arg(long, default_value_t = 10000)]
    save_interval: u64,

    #[arg(long, value_name = "FILE")]
    resume_checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 10000)]
    epoch_block: u64,

    #[arg(long, default_value_t = 200)]
    num_its: u64,

    /// Probability of dropping the conditioning of a training example.
    #[arg(long, default_value_t = 0.0)]
    p_uncond: f64,

    /// Penalize non-orthogonal latent components (decomposed model only).
    #[arg(long)]
    latent_orthog: bool,

    /// Image decomposed and sampled at every checkpoint, defaults to the
    /// reference image of the dataset when it exists.
    #[arg(long, value_name = "FILE")]
    default_image: Option<PathBuf>,

    /// uniform or loss-second-moment.
    #[arg(long, default_value = "uniform")]
    schedule_sampler: String,

    /// Train data-parallel replicas, one thread per rank.
    #[arg(long)]
    use_dist: bool,

    #[arg(long, default_value_t = 1)]
    world_size: usize,

    /// Seconds a replica waits for its peers before giving up.
    #[arg(long, default_value_t = 600)]
    sync_timeout_secs: u64,

    /// Abort after that many consecutive steps with a non-finite loss.
    #[arg(long)]
    max_divergent_steps: Option<usize>,

    #[arg(long, value_name = "DIR")]
    log_folder: Option<PathBuf>,

    #[arg(long, default_value = "")]
    extra_desc: String,

    #[arg(long, default_value_t = 0)]
    num_run: u32,

    #[arg(long, default_value_t = 0)]
    seed: i64,
}

impl Args {
    fn run_config(self) -> anyhow::Result<(RunConfig, bool)> {
        let channel_mult = self
            .channel_mult
            .split(',')
            .map(|m| m.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid channel multipliers {:?}", self.channel_mult))?;
        let variance_type = match self.variance_type.as_str() {
            "small" => VarianceType::FixedSmall,
            "large" => VarianceType::FixedLarge,
            other => anyhow::bail!("unknown variance type {other:?}"),
        };
        let model = ModelConfig {
            kind: self.model.parse::<ModelKind>()?,
            image_size: self.image_size,
            in_channels: 3,
            num_channels: self.num_channels,
            channel_mult,
            num_res_blocks: self.num_res_blocks,
            norm_num_groups: self.norm_num_groups,
            emb_dim: self.emb_dim,
            num_components: self.num_components,
            num_classes: self.num_classes,
        };
        let diffusion = DiffusionConfig {
            diffusion_steps: self.diffusion_steps,
            noise_schedule: self.noise_schedule.parse::<BetaSchedule>()?,
            predict_xstart: self.predict_xstart,
            variance_type,
            downweight: self.downweight,
            snr_gamma: self.snr_gamma,
            ..Default::default()
        };
        let default_image = match (model.kind, self.default_image) {
            (ModelKind::Decomp, None) => {
                TrainConfig::dataset_default_image(&self.dataset).filter(|p| p.is_file())
            }
            (_, default_image) => default_image,
        };
        let train = TrainConfig {
            dataset: self.dataset,
            data_dir: self.data_dir,
            num_images: self.num_images,
            batch_size: self.batch_size,
            microbatch: (self.microbatch > 0).then_some(self.microbatch),
            lr: self.lr,
            weight_decay: self.weight_decay,
            lr_anneal_steps: self.lr_anneal_steps,
            ema_rates: TrainConfig::parse_ema_rates(&self.ema_rate)?,
            log_interval: self.log_interval,
            save_interval: self.save_interval,
            resume_checkpoint: self.resume_checkpoint,
            epoch_block: self.epoch_block,
            num_its: self.num_its,
            p_uncond: self.p_uncond,
            latent_orthog: self.latent_orthog,
            default_image,
            schedule_sampler: self.schedule_sampler.parse::<ScheduleSamplerKind>()?,
            use_dist: self.use_dist,
            world_size: self.world_size,
            sync_timeout_secs: self.sync_timeout_secs,
            max_divergent_steps: self.max_divergent_steps,
            log_folder: self.log_folder,
            extra_desc: self.extra_desc,
            num_run: self.num_run,
            seed: self.seed,
        };
        Ok((RunConfig { model, diffusion, train }, self.cpu))
    }
}

fn init_logging(log_folder: &std::path::Path) -> anyhow::Result<()> {
    let log_file = std::fs::File::create(log_folder.join("log.txt"))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(log_file)))
        .init();
    Ok(())
}

fn train_replica<G: ProcessGroup + 'static>(
    config: &RunConfig,
    dataset: ImageDataset,
    device: Device,
    group: G,
    stop: StopHandle,
) -> anyhow::Result<()> {
    let (rank, world_size) = (group.rank(), group.world_size());
    let vs = nn::VarStore::new(device);
    let model = DecompUNet::new(vs.root(), &config.model);
    let diffusion = config.diffusion.build()?;
    let mut train_loop = TrainLoop::new(model, vs, diffusion, config.train.clone(), Box::new(group))?
        .with_stop_handle(stop);
    if let Some(path) = config.train.default_image.as_ref().filter(|_| rank == 0) {
        let image = data::load_image(path, config.model.image_size)
            .with_context(|| format!("error loading default image {path:?}"))?;
        train_loop = train_loop.with_default_image(image);
    }
    if let Some(checkpoint) = &config.train.resume_checkpoint {
        train_loop.resume(checkpoint)?;
    }
    let batches = DataLoader::new(dataset, config.train.batch_size, device, rank, world_size)?;
    train_loop.run(batches)?;
    tracing::info!(rank, "training done at epoch {}", train_loop.epoch());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let (config, cpu) = Args::parse().run_config()?;
    let RunConfig { mut model, diffusion, mut train } = config;
    let log_folder = match &train.log_folder {
        Some(folder) => folder.clone(),
        None => RunConfig { model: model.clone(), diffusion: diffusion.clone(), train: train.clone() }
            .log_folder(),
    };
    std::fs::create_dir_all(&log_folder)
        .with_context(|| format!("error creating log folder {log_folder:?}"))?;
    init_logging(&log_folder)?;
    tracing::info!("logging to {log_folder:?}, cuda available: {}", tch::Cuda::is_available());

    tch::manual_seed(train.seed);
    let dataset = ImageDataset::load_dir(&train.data_dir, model.image_size, train.num_images)?;
    if model.kind == ModelKind::ClassConditional {
        if model.num_classes == 0 {
            model.num_classes = dataset.num_classes();
        }
        dataset.check_num_classes(model.num_classes)?;
    }
    train.log_folder = Some(log_folder.clone());
    let config = RunConfig::builder().model(model).diffusion(diffusion).train(train).build()?;
    config.write_arguments(&log_folder)?;
    tracing::info!("run {}", config.save_desc());

    let stop = StopHandle::default();
    let on_interrupt = stop.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupted, stopping at the end of the current step");
        on_interrupt.stop();
    })?;

    let devices = DeviceSetup::new(cpu);
    if config.train.world_size == 1 {
        return train_replica(&config, dataset, devices.get(0), SingleProcess, stop);
    }
    let config = Arc::new(config);
    let handles: Vec<_> = LocalGroup::new(config.train.world_size, config.train.sync_timeout())
        .into_iter()
        .map(|group| {
            let config = config.clone();
            let dataset = dataset.shallow_clone();
            let device = devices.get(group.rank());
            let stop = stop.clone();
            std::thread::spawn(move || train_replica(&config, dataset, device, group, stop))
        })
        .collect();
    for (rank, handle) in handles.into_iter().enumerate() {
        handle.join().map_err(|_| anyhow::anyhow!("rank {rank} panicked"))??;
    }
    Ok(())
}
