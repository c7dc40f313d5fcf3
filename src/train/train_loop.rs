use super::checkpoint::{self, CheckpointName};
use super::dist::ProcessGroup;
use super::ema::EmaShadow;
use crate::config::TrainConfig;
use crate::data::Batch;
use crate::models::Denoiser;
use crate::schedulers::gaussian_diffusion::GaussianDiffusion;
use crate::schedulers::resample::{create_schedule_sampler, ScheduleSampler};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    Initializing,
    Resuming,
    Running,
    Checkpointing,
    Terminated,
}

/// Requests the training loop to stop at the end of the current step.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A step whose loss was not finite; its update was skipped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceWarning {
    pub epoch: u64,
    pub loss: f64,
    pub consecutive: usize,
}

impl std::fmt::Display for DivergenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "non-finite loss {} at epoch {} ({} consecutive), skipping the update",
            self.loss, self.epoch, self.consecutive
        )
    }
}

// Losses accumulated between two log lines.
#[derive(Debug, Default)]
struct LossLog {
    loss: f64,
    mse: f64,
    count: usize,
    quartiles: [(f64, usize); 4],
}

impl LossLog {
    fn record(&mut self, timesteps: &[i64], losses: &[f64], mses: &[f64], num_timesteps: usize) {
        for ((t, loss), mse) in timesteps.iter().zip(losses).zip(mses) {
            self.loss += loss;
            self.mse += mse;
            self.count += 1;
            let quartile = (4 * *t as usize / num_timesteps).min(3);
            self.quartiles[quartile].0 += loss;
            self.quartiles[quartile].1 += 1;
        }
    }

    fn flush(&mut self, epoch: u64, lr: f64) {
        let count = self.count.max(1) as f64;
        let q = |i: usize| {
            let (sum, n) = self.quartiles[i];
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        };
        info!(
            epoch,
            lr,
            loss = self.loss / count,
            mse = self.mse / count,
            loss_q0 = q(0),
            loss_q1 = q(1),
            loss_q2 = q(2),
            loss_q3 = q(3),
            "train"
        );
        *self = Self::default();
    }
}

fn to_vec(xs: &Tensor) -> Result<Vec<f64>> {
    Ok(Vec::<f64>::try_from(&xs.detach().to_device(Device::Cpu).to_kind(Kind::Double))?)
}

fn flat_values(xs: &Tensor) -> Result<Vec<f32>> {
    let xs = xs.detach().to_device(Device::Cpu).to_kind(Kind::Float).flatten(0, -1);
    Ok(Vec::<f32>::try_from(&xs)?)
}

// Overwrites `dst` with `values`, reshaped and converted to `dst`.
fn copy_values(dst: &Tensor, values: &[f32]) {
    let src = Tensor::from_slice(values).view(dst.size().as_slice()).to_kind(dst.kind());
    tch::no_grad(|| {
        let mut dst = dst.shallow_clone();
        dst.copy_(&src);
    })
}

/// Drives the optimization of a [`Denoiser`].
///
/// One epoch is one optimizer step: checkpoints named after epoch `n` hold
/// the parameters obtained after `n` updates.
pub struct TrainLoop<M: Denoiser> {
    model: M,
    vs: nn::VarStore,
    diffusion: GaussianDiffusion,
    config: TrainConfig,
    group: Box<dyn ProcessGroup>,
    opt: nn::Optimizer,
    sampler: Box<dyn ScheduleSampler>,
    // Trainable parameters sorted by name, identical on every rank.
    params: Vec<(String, Tensor)>,
    ema: Vec<EmaShadow>,
    checkpoint_dir: PathBuf,
    state: TrainState,
    epoch: u64,
    stop: StopHandle,
    stop_agreed: bool,
    divergent_steps: usize,
    last_divergence: Option<DivergenceWarning>,
    losses: LossLog,
    // `[1, C, H, W]`, decomposed and sampled at every checkpoint.
    default_image: Option<Tensor>,
}

impl<M: Denoiser> TrainLoop<M> {
    pub fn new(
        model: M,
        vs: nn::VarStore,
        diffusion: GaussianDiffusion,
        config: TrainConfig,
        group: Box<dyn ProcessGroup>,
    ) -> Result<Self> {
        let adamw =
            nn::AdamW { beta1: 0.9, beta2: 0.999, wd: config.weight_decay, eps: 1e-8, amsgrad: false };
        let opt = adamw.build(&vs, config.lr)?;
        let sampler = create_schedule_sampler(config.schedule_sampler, diffusion.num_timesteps());
        let mut params: Vec<(String, Tensor)> =
            vs.variables().into_iter().filter(|(_, v)| v.requires_grad()).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let checkpoint_dir = config.log_folder.clone().unwrap_or_else(|| PathBuf::from("."));

        let mut train_loop = Self {
            model,
            vs,
            diffusion,
            group,
            opt,
            sampler,
            params,
            ema: vec![],
            checkpoint_dir,
            state: TrainState::Initializing,
            epoch: 0,
            stop: StopHandle::default(),
            stop_agreed: false,
            divergent_steps: 0,
            last_divergence: None,
            losses: LossLog::default(),
            default_image: None,
            config,
        };
        train_loop.sync_params()?;
        train_loop.ema =
            train_loop.config.ema_rates.iter().map(|&rate| EmaShadow::new(rate, &train_loop.params)).collect();
        info!(
            rank = train_loop.group.rank(),
            world_size = train_loop.group.world_size(),
            num_params = train_loop.params.iter().map(|(_, p)| p.numel()).sum::<usize>(),
            "initialized training loop"
        );
        Ok(train_loop)
    }

    // Replicas start from the parameters of rank 0.
    fn sync_params(&mut self) -> Result<()> {
        if self.group.world_size() == 1 {
            return Ok(());
        }
        for (_, param) in self.params.iter() {
            let mut values = flat_values(param)?;
            self.group.broadcast(&mut values, 0)?;
            copy_values(param, &values);
        }
        Ok(())
    }

    /// Shares `stop` with the loop, e.g. to stop on an interrupt signal.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Writes `sample_{epoch}.png` next to every checkpoint: the image, the
    /// sample of each of its latent components, then their composition.
    pub fn with_default_image(mut self, image: Tensor) -> Self {
        self.default_image = Some(image);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn ema(&self) -> &[EmaShadow] {
        &self.ema
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn last_divergence(&self) -> Option<DivergenceWarning> {
        self.last_divergence
    }

    /// Current importance weights of the timestep sampler.
    pub fn sampler_weights(&self) -> Vec<f64> {
        self.sampler.weights()
    }

    pub fn learning_rate(&self) -> f64 {
        let anneal_steps = self.config.lr_anneal_steps;
        if anneal_steps == 0 {
            return self.config.lr;
        }
        let frac_done = self.epoch as f64 / anneal_steps as f64;
        self.config.lr * (1. - frac_done).max(0.)
    }

    /// Restores the parameters saved in `path` and the EMA shadows saved next
    /// to it, and continues counting epochs from the one in the file name.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.state = TrainState::Resuming;
        let epoch = checkpoint::parse_epoch(path)?;
        info!("resuming from {path:?} at epoch {epoch}");
        checkpoint::restore(&self.vs.variables(), path)?;
        for ema in self.ema.iter_mut() {
            let ema_path = path.with_file_name(CheckpointName::ema(ema.rate(), epoch).file_name());
            if ema_path.is_file() {
                ema.load(&ema_path)?;
            } else {
                warn!("no EMA checkpoint {ema_path:?}, restarting the shadow from the parameters");
                ema.reset();
            }
        }
        self.epoch = epoch;
        Ok(())
    }

    /// Runs steps until `epoch_block * num_its` steps were taken, the learning
    /// rate is fully annealed, `batches` is exhausted or a stop is requested.
    pub fn run<I: Iterator<Item = Batch>>(&mut self, mut batches: I) -> Result<()> {
        self.state = TrainState::Running;
        let total_steps = self.config.total_steps();
        info!("training for {total_steps} steps from epoch {}", self.epoch);
        let mut steps = 0;
        while steps < total_steps {
            let anneal_steps = self.config.lr_anneal_steps;
            if anneal_steps > 0 && self.epoch >= anneal_steps {
                info!("learning rate annealed after {} epochs", self.epoch);
                break;
            }
            let Some(batch) = batches.next() else {
                info!("data exhausted at epoch {}", self.epoch);
                break;
            };
            self.run_step(&batch)?;
            steps += 1;
            if self.stop_agreed {
                info!("stop requested, terminating at epoch {}", self.epoch);
                break;
            }
        }
        self.state = TrainState::Terminated;
        Ok(())
    }

    /// Forward and backward passes on `batch`, split in microbatches, followed
    /// by one synchronized optimizer step.
    pub fn run_step(&mut self, batch: &Batch) -> Result<()> {
        self.state = TrainState::Running;
        let device = self.vs.device();
        let bsize = batch.size();
        let microbatch = self.config.microbatch.unwrap_or(bsize).clamp(1, bsize.max(1));
        let (timesteps, weights) = self.sampler.sample(bsize, device);

        self.opt.zero_grad();
        let mut local_loss = 0.;
        let (mut step_t, mut step_losses, mut step_mses) = (vec![], vec![], vec![]);
        let mut start = 0;
        while start < bsize {
            let len = microbatch.min(bsize - start);
            let micro = batch.narrow(start, len);
            let t = timesteps.narrow(0, start, len);
            let terms = self.diffusion.training_losses(
                &self.model,
                &micro.images.to_device(device),
                &t,
                micro.labels.map(|l| l.to_device(device)).as_ref(),
                self.config.p_uncond,
                self.config.latent_orthog,
            )?;
            let loss = (&terms.loss * weights.narrow(0, start, len)).mean(Kind::Float)
                * (len as f64 / bsize as f64);
            loss.backward();
            local_loss += loss.double_value(&[]);

            step_t.extend(Vec::<i64>::try_from(&t.to_device(Device::Cpu))?);
            step_losses.extend(to_vec(&terms.loss)?);
            step_mses.extend(to_vec(&terms.mse)?);
            start += len;
        }

        let loss = self.sync_grads(local_loss)?;
        if !loss.is_finite() {
            self.opt.zero_grad();
            self.divergent_steps += 1;
            let warning =
                DivergenceWarning { epoch: self.epoch, loss, consecutive: self.divergent_steps };
            warn!("{warning}");
            self.last_divergence = Some(warning);
            return match self.config.max_divergent_steps {
                Some(max) if self.divergent_steps >= max => Err(Error::Divergence {
                    steps: self.divergent_steps,
                    epoch: self.epoch,
                    loss,
                }),
                _ => Ok(()),
            };
        }
        self.divergent_steps = 0;
        self.losses.record(&step_t, &step_losses, &step_mses, self.diffusion.num_timesteps());
        self.update_sampler(&step_t, &step_losses)?;

        let lr = self.learning_rate();
        self.opt.set_lr(lr);
        self.opt.step();
        for ema in self.ema.iter_mut() {
            ema.update();
        }
        self.epoch += 1;

        if self.epoch % self.config.log_interval == 0 {
            self.losses.flush(self.epoch, lr);
        }
        if self.epoch % self.config.save_interval == 0 {
            self.save()?;
        }
        Ok(())
    }

    // Every rank feeds the losses of the whole global batch to its sampler, so
    // that the sampler histories stay identical across replicas.
    fn update_sampler(&mut self, timesteps: &[i64], losses: &[f64]) -> Result<()> {
        let pairs: Vec<f32> =
            timesteps.iter().zip(losses).flat_map(|(&t, &l)| [t as f32, l as f32]).collect();
        let pairs = self.group.all_gather(&pairs)?;
        let (timesteps, losses): (Vec<i64>, Vec<f64>) =
            pairs.chunks_exact(2).map(|p| (p[0] as i64, p[1] as f64)).unzip();
        self.sampler.update_with_losses(&timesteps, &losses);
        Ok(())
    }

    // Averages gradients over the replicas. The loss and the stop requests
    // travel in the same buffer so that every rank takes the same decisions.
    // Returns the mean loss.
    fn sync_grads(&mut self, local_loss: f64) -> Result<f64> {
        let stop = if self.stop.is_stopped() { 1f32 } else { 0. };
        if self.group.world_size() == 1 {
            self.stop_agreed = stop > 0.;
            return Ok(local_loss);
        }
        let grads: Vec<Tensor> = self.params.iter().map(|(_, p)| p.grad()).collect();
        let mut buffer = vec![];
        for grad in grads.iter() {
            if grad.defined() {
                buffer.extend(flat_values(grad)?);
            }
        }
        let num_grad_values = buffer.len();
        buffer.extend(grads.iter().map(|g| if g.defined() { 1f32 } else { 0. }));
        buffer.push(local_loss as f32);
        buffer.push(stop);
        self.group.all_reduce_mean(&mut buffer)?;

        // A gradient defined on some ranks only would make the replicas drift.
        let defined = &buffer[num_grad_values..num_grad_values + grads.len()];
        if let Some(idx) = defined.iter().position(|f| *f != 0. && *f != 1.) {
            return Err(Error::InvalidConfig(format!(
                "gradient of {} is not defined on every rank",
                self.params[idx].0
            )));
        }
        let mut offset = 0;
        for grad in grads.iter().filter(|g| g.defined()) {
            let numel = grad.numel();
            copy_values(grad, &buffer[offset..offset + numel]);
            offset += numel;
        }
        self.stop_agreed = buffer[buffer.len() - 1] > 0.;
        Ok(buffer[buffer.len() - 2] as f64)
    }

    /// Writes `model_{epoch}.pt` and one `ema_{rate}_{epoch}.pt` per EMA rate
    /// from rank 0, then waits for every rank.
    pub fn save(&mut self) -> Result<()> {
        let previous = self.state;
        self.state = TrainState::Checkpointing;
        if self.group.rank() == 0 {
            std::fs::create_dir_all(&self.checkpoint_dir)?;
            let mut named: Vec<(String, Tensor)> = self.vs.variables().into_iter().collect();
            named.sort_by(|a, b| a.0.cmp(&b.0));
            let path = self.checkpoint_dir.join(CheckpointName::model(self.epoch).file_name());
            checkpoint::save_named(&named, &path)?;
            for ema in self.ema.iter() {
                let name = CheckpointName::ema(ema.rate(), self.epoch);
                let ema_path = self.checkpoint_dir.join(name.file_name());
                checkpoint::save_named(&ema.named_tensors(), &ema_path)?;
                debug!("saved EMA shadow {ema_path:?}");
            }
            info!("saved checkpoint {path:?}");
            if let Some(image) = &self.default_image {
                self.save_samples(image)?;
            }
        }
        self.group.barrier()?;
        self.state = previous;
        Ok(())
    }

    fn save_samples(&self, image: &Tensor) -> Result<()> {
        let image = image.to_device(self.vs.device());
        let samples = self.diffusion.sample_decomposition(&self.model, &image, 1.)?;
        let grid = Tensor::cat(&[image, samples], 0).clamp(-1., 1.);
        // [N, C, H, W] in [-1, 1] to a [C, H, N * W] row of images.
        let grid = Tensor::cat(&grid.unbind(0), 2);
        let grid = ((grid + 1.) * 127.5).to_kind(Kind::Uint8).to_device(Device::Cpu);
        let path = self.checkpoint_dir.join(format!("sample_{}.png", self.epoch));
        tch::vision::image::save(&grid, &path)?;
        info!("saved samples {path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiffusionConfig, ModelConfig};
    use crate::models::DecompUNet;
    use crate::schedulers::resample::ScheduleSamplerKind;
    use crate::train::SingleProcess;

    fn tiny_loop() -> TrainLoop<DecompUNet> {
        let config = ModelConfig {
            image_size: 8,
            num_channels: 8,
            channel_mult: vec![1, 2],
            num_res_blocks: 1,
            norm_num_groups: 4,
            emb_dim: 6,
            num_components: 2,
            ..Default::default()
        };
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DecompUNet::new(vs.root(), &config);
        let diffusion = DiffusionConfig { diffusion_steps: 20, ..Default::default() };
        let train = TrainConfig {
            batch_size: 2,
            ema_rates: vec![],
            schedule_sampler: ScheduleSamplerKind::LossSecondMoment,
            ..Default::default()
        };
        TrainLoop::new(model, vs, diffusion.build().unwrap(), train, Box::new(SingleProcess)).unwrap()
    }

    fn batch(value: f64) -> Batch {
        Batch { images: Tensor::full([2, 3, 8, 8], value, (Kind::Float, Device::Cpu)), labels: None }
    }

    #[test]
    fn divergent_steps_leave_the_loss_log_untouched() {
        let mut train_loop = tiny_loop();
        train_loop.run_step(&batch(f64::NAN)).unwrap();
        assert_eq!(train_loop.epoch(), 0);
        assert_eq!(train_loop.losses.count, 0);
        assert_eq!(train_loop.losses.loss, 0.);

        train_loop.run_step(&batch(0.5)).unwrap();
        assert_eq!(train_loop.epoch(), 1);
        assert_eq!(train_loop.losses.count, 2);
        assert!(train_loop.losses.loss.is_finite() && train_loop.losses.mse.is_finite());
        assert!(train_loop.losses.quartiles.iter().all(|(sum, _)| sum.is_finite()));
        assert!(train_loop.sampler_weights().iter().all(|w| w.is_finite()));
    }
}
