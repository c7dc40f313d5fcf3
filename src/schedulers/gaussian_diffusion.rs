//! # Gaussian diffusion
//!
//! Forward noising `q(x_t | x_0)`, the reverse step `p(x_{t-1} | x_t)` and the
//! training objective of Denoising Diffusion Probabilistic Models.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::{NoiseSchedule, PredictionType, VarianceType};
use crate::models::Denoiser;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

/// How the per-example squared error is weighted across timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossWeighting {
    #[default]
    Uniform,
    /// Min-SNR weighting, Efficient Diffusion Training via Min-SNR Weighting
    /// Strategy, T. Hang et al, 2023. Down-weights the low noise timesteps.
    MinSnr { gamma: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct GaussianDiffusionConfig {
    pub prediction_type: PredictionType,
    pub variance_type: VarianceType,
    pub loss_weighting: LossWeighting,
    /// Clamp the predicted `x_0` to [-1, 1] before computing the posterior.
    pub clip_denoised: bool,
}

impl Default for GaussianDiffusionConfig {
    fn default() -> Self {
        Self {
            prediction_type: PredictionType::Epsilon,
            variance_type: VarianceType::FixedSmall,
            loss_weighting: LossWeighting::Uniform,
            clip_denoised: true,
        }
    }
}

/// Mean and variance of `p(x_{t-1} | x_t)` as predicted from a model output.
#[derive(Debug)]
pub struct Posterior {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

#[derive(Debug)]
pub struct DenoiseStep {
    pub prev_sample: Tensor,
    pub pred_xstart: Tensor,
}

/// Per-example training losses, all of shape `[batch]`.
#[derive(Debug)]
pub struct LossTerms {
    /// Unweighted mean squared error against the training target.
    pub mse: Tensor,
    /// `mse` multiplied by the timestep weighting, plus `orthog` when present.
    pub loss: Tensor,
    /// Orthogonality penalty on the inferred latent components.
    pub orthog: Option<Tensor>,
}

/// Mean squared cosine similarity between the distinct components of
/// `latents`, `[batch, components, dim]`. Returns one value per example, 0
/// when the components are pairwise orthogonal.
pub fn latent_orthogonality(latents: &Tensor) -> Tensor {
    let components = latents.size()[1];
    let norm = latents
        .square()
        .sum_dim_intlist(Some([2i64].as_slice()), true, latents.kind())
        .sqrt()
        .clamp_min(1e-8);
    let normed = latents / norm;
    let gram = normed.matmul(&normed.transpose(1, 2));
    let eye = Tensor::eye(components, (gram.kind(), gram.device()));
    let off_diagonal = eye.ones_like() - eye;
    let pairs = (components * (components - 1)).max(1) as f64;
    (gram * off_diagonal).square().sum_dim_intlist(Some([1i64, 2].as_slice()), false, Kind::Float)
        / pairs
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    alphas_cumprod_prev: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    large_variance: Vec<f64>,
    large_log_variance: Vec<f64>,
    loss_weights: Vec<f64>,
    pub config: GaussianDiffusionConfig,
}

// Gathers `values[t]` for every example and shapes the result so that it
// broadcasts against `like`.
fn extract(values: &[f64], t: &Tensor, like: &Tensor) -> Tensor {
    let mut shape = vec![-1i64];
    shape.resize(like.dim(), 1);
    Tensor::from_slice(values)
        .to_device(like.device())
        .index_select(0, &t.to_device(like.device()))
        .to_kind(like.kind())
        .reshape(shape.as_slice())
}

impl GaussianDiffusion {
    pub fn new(schedule: NoiseSchedule, config: GaussianDiffusionConfig) -> Self {
        let betas = schedule.betas();
        let abar = schedule.alphas_cumprod();
        let n = betas.len();

        let mut alphas_cumprod_prev = Vec::with_capacity(n);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&abar[..n - 1]);

        let sqrt_alphas_cumprod = abar.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod = abar.iter().map(|a| (1. - a).sqrt()).collect();
        let sqrt_recip_alphas_cumprod = abar.iter().map(|a| (1. / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = abar.iter().map(|a| (1. / a - 1.).sqrt()).collect();

        let mut posterior_variance = Vec::with_capacity(n);
        let mut posterior_mean_coef1 = Vec::with_capacity(n);
        let mut posterior_mean_coef2 = Vec::with_capacity(n);
        for t in 0..n {
            let (beta, abar_t, abar_prev) = (betas[t], abar[t], alphas_cumprod_prev[t]);
            posterior_variance.push(beta * (1. - abar_prev) / (1. - abar_t));
            posterior_mean_coef1.push(beta * abar_prev.sqrt() / (1. - abar_t));
            posterior_mean_coef2.push((1. - abar_prev) * (1. - beta).sqrt() / (1. - abar_t));
        }
        // The posterior variance is 0 at the start of the chain, the log is
        // clipped by reusing the next value.
        let posterior_log_variance_clipped = std::iter::once(posterior_variance[1])
            .chain(posterior_variance[1..].iter().copied())
            .map(f64::ln)
            .collect();
        let large_variance: Vec<f64> = std::iter::once(posterior_variance[1])
            .chain(betas[1..].iter().copied())
            .collect();
        let large_log_variance = large_variance.iter().map(|v| v.ln()).collect();

        let loss_weights = (0..n)
            .map(|t| match config.loss_weighting {
                LossWeighting::Uniform => 1.0,
                LossWeighting::MinSnr { gamma } => {
                    let snr = schedule.snr(t);
                    match config.prediction_type {
                        PredictionType::Epsilon => snr.min(gamma) / snr,
                        PredictionType::Sample => snr.min(gamma),
                    }
                }
            })
            .collect();

        Self {
            schedule,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
            large_variance,
            large_log_variance,
            loss_weights,
            config,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    /// Diffuses `x_start` to timestep `t` (one entry per example) with the given noise:
    /// `x_t = sqrt(alpha_bar_t) * x_0 + sqrt(1 - alpha_bar_t) * noise`.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: &Tensor) -> Tensor {
        extract(&self.sqrt_alphas_cumprod, t, x_start) * x_start
            + extract(&self.sqrt_one_minus_alphas_cumprod, t, x_start) * noise
    }

    /// Same as [`Self::q_sample`] with freshly drawn standard normal noise, which is
    /// returned alongside the noised sample.
    pub fn noise(&self, x_start: &Tensor, t: &Tensor) -> (Tensor, Tensor) {
        let noise = x_start.randn_like();
        (self.q_sample(x_start, t, &noise), noise)
    }

    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &Tensor, eps: &Tensor) -> Tensor {
        extract(&self.sqrt_recip_alphas_cumprod, t, x_t) * x_t
            - extract(&self.sqrt_recipm1_alphas_cumprod, t, x_t) * eps
    }

    pub fn predict_eps_from_xstart(&self, x_t: &Tensor, t: &Tensor, pred_xstart: &Tensor) -> Tensor {
        (extract(&self.sqrt_recip_alphas_cumprod, t, x_t) * x_t - pred_xstart)
            / extract(&self.sqrt_recipm1_alphas_cumprod, t, x_t)
    }

    /// Mean, variance and clipped log variance of `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior_mean_variance(
        &self,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
    ) -> (Tensor, Tensor, Tensor) {
        let mean = extract(&self.posterior_mean_coef1, t, x_t) * x_start
            + extract(&self.posterior_mean_coef2, t, x_t) * x_t;
        let variance = extract(&self.posterior_variance, t, x_t);
        let log_variance = extract(&self.posterior_log_variance_clipped, t, x_t);
        (mean, variance, log_variance)
    }

    /// Interprets a model output as either noise or clean sample and returns the
    /// resulting reverse process posterior.
    pub fn p_mean_variance(&self, model_output: &Tensor, x_t: &Tensor, t: &Tensor) -> Posterior {
        let pred_xstart = match self.config.prediction_type {
            PredictionType::Epsilon => self.predict_xstart_from_eps(x_t, t, model_output),
            PredictionType::Sample => model_output.shallow_clone(),
        };
        let pred_xstart =
            if self.config.clip_denoised { pred_xstart.clamp(-1., 1.) } else { pred_xstart };
        let (mean, posterior_variance, posterior_log_variance) =
            self.q_posterior_mean_variance(&pred_xstart, x_t, t);
        let (variance, log_variance) = match self.config.variance_type {
            VarianceType::FixedSmall => (posterior_variance, posterior_log_variance),
            VarianceType::FixedLarge => (
                extract(&self.large_variance, t, x_t),
                extract(&self.large_log_variance, t, x_t),
            ),
        };
        Posterior { mean, variance, log_variance, pred_xstart }
    }

    /// Performs a reverse step from `x_t` to `x_{t-1}`, the whole batch being at
    /// the same `timestep`. No noise is added at the last step.
    pub fn denoise_step(&self, x_t: &Tensor, timestep: usize, model_output: &Tensor) -> DenoiseStep {
        if timestep == 0 {
            self.denoise_step_with_noise(x_t, timestep, model_output, &x_t.zeros_like())
        } else {
            self.denoise_step_with_noise(x_t, timestep, model_output, &x_t.randn_like())
        }
    }

    /// Deterministic version of [`Self::denoise_step`] using the provided noise.
    pub fn denoise_step_with_noise(
        &self,
        x_t: &Tensor,
        timestep: usize,
        model_output: &Tensor,
        noise: &Tensor,
    ) -> DenoiseStep {
        let t = timesteps_like(x_t, timestep);
        let posterior = self.p_mean_variance(model_output, x_t, &t);
        let prev_sample = if timestep == 0 {
            posterior.mean
        } else {
            &posterior.mean + (&posterior.log_variance * 0.5).exp() * noise
        };
        DenoiseStep { prev_sample, pred_xstart: posterior.pred_xstart }
    }

    /// The value the model regresses: the injected noise or the clean sample.
    pub fn training_target(&self, x_start: &Tensor, noise: &Tensor) -> Tensor {
        match self.config.prediction_type {
            PredictionType::Epsilon => noise.shallow_clone(),
            PredictionType::Sample => x_start.shallow_clone(),
        }
    }

    pub fn loss_weight(&self, timestep: usize) -> f64 {
        self.loss_weights[timestep]
    }

    pub fn losses_from_output(
        &self,
        x_start: &Tensor,
        noise: &Tensor,
        t: &Tensor,
        model_output: &Tensor,
    ) -> LossTerms {
        let target = self.training_target(x_start, noise);
        let mse = (model_output - target)
            .square()
            .flatten(1, -1)
            .mean_dim(Some([1i64].as_slice()), false, Kind::Float);
        let loss = match self.config.loss_weighting {
            LossWeighting::Uniform => mse.shallow_clone(),
            LossWeighting::MinSnr { .. } => extract(&self.loss_weights, t, &mse) * &mse,
        };
        LossTerms { mse, loss, orthog: None }
    }

    /// Noises `x_start` at the timesteps `t`, runs the model and returns the
    /// per-example losses.
    ///
    /// With a conditional model, every example independently has its
    /// conditioning replaced by the model's null token with probability
    /// `p_uncond`, so that the model also learns the unconditional prediction
    /// used by classifier-free guidance.
    ///
    /// With `latent_orthog`, a model whose conditioning is a set of latent
    /// components `[batch, components, dim]` also pays
    /// [`latent_orthogonality`] on them.
    pub fn training_losses<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        x_start: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
        p_uncond: f64,
        latent_orthog: bool,
    ) -> Result<LossTerms> {
        let (x_t, noise) = self.noise(x_start, t);
        let cond = model.condition(x_start, labels)?;
        let uncond_mask = match &cond {
            Some(_) if p_uncond > 0. => {
                let bsize = x_start.size()[0];
                Some(Tensor::rand([bsize], (Kind::Float, x_start.device())).lt(p_uncond))
            }
            _ => None,
        };
        let model_output = model.forward_t(&x_t, t, cond.as_ref(), uncond_mask.as_ref());
        let mut terms = self.losses_from_output(x_start, &noise, t, &model_output);
        if let Some(latents) = cond.as_ref().filter(|c| latent_orthog && c.dim() == 3) {
            let orthog = latent_orthogonality(latents);
            terms.loss = &terms.loss + &orthog;
            terms.orthog = Some(orthog);
        }
        Ok(terms)
    }

    /// Runs the model once, or twice when classifier-free guidance applies, and
    /// combines the predictions as `uncond + guidance_scale * (cond - uncond)`.
    pub fn guided_output<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        x_t: &Tensor,
        t: &Tensor,
        cond: Option<&Tensor>,
        guidance_scale: f64,
    ) -> Tensor {
        let cond_output = model.forward_t(x_t, t, cond, None);
        match cond {
            Some(_) if guidance_scale != 1. => {
                let bsize = x_t.size()[0];
                let all = Tensor::ones([bsize], (Kind::Bool, x_t.device()));
                let uncond_output = model.forward_t(x_t, t, cond, Some(&all));
                &uncond_output + (cond_output - &uncond_output) * guidance_scale
            }
            _ => cond_output,
        }
    }

    /// Ancestral sampling from pure noise down to `x_0`.
    pub fn sample_loop<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        shape: &[i64],
        cond: Option<&Tensor>,
        guidance_scale: f64,
        device: Device,
    ) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let mut xs = Tensor::randn(shape, (Kind::Float, device));
        for timestep in (0..self.num_timesteps()).rev() {
            let t = timesteps_like(&xs, timestep);
            let model_output = self.guided_output(model, &xs, &t, cond, guidance_scale);
            xs = self.denoise_step(&xs, timestep, &model_output).prev_sample;
        }
        xs
    }

    /// Infers the latent components of a single `image` `[1, C, H, W]` and
    /// samples each of them on its own, then all of them together. Returns
    /// `[components + 1, C, H, W]`, the composition coming last.
    pub fn sample_decomposition<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        image: &Tensor,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let _no_grad = tch::no_grad_guard();
        let latents = match model.condition(image, None)? {
            Some(latents) if latents.dim() == 3 => latents.narrow(0, 0, 1),
            _ => {
                return Err(Error::InvalidConfig(
                    "decomposition samples need a model conditioned on latent components".into(),
                ))
            }
        };
        let mut shape = image.size();
        shape[0] = 1;
        let device = image.device();
        let mut samples: Vec<Tensor> = (0..latents.size()[1])
            .map(|k| {
                let component = latents.narrow(1, k, 1);
                self.sample_loop(model, &shape, Some(&component), guidance_scale, device)
            })
            .collect();
        samples.push(self.sample_loop(model, &shape, Some(&latents), guidance_scale, device));
        Ok(Tensor::cat(&samples, 0))
    }
}

/// An Int64 tensor holding `timestep` once per example of `xs`.
pub fn timesteps_like(xs: &Tensor, timestep: usize) -> Tensor {
    Tensor::full([xs.size()[0]], timestep as i64, (Kind::Int64, xs.device()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::BetaSchedule;
    use std::cell::RefCell;

    fn diffusion(prediction_type: PredictionType) -> GaussianDiffusion {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 1000).unwrap();
        let config = GaussianDiffusionConfig { prediction_type, ..Default::default() };
        GaussianDiffusion::new(schedule, config)
    }

    fn x_start() -> Tensor {
        tch::manual_seed(42);
        Tensor::rand([4, 3, 8, 8], (Kind::Double, Device::Cpu)) * 1.8 - 0.9
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn forward_noising_at_zero_keeps_the_input() {
        let diffusion = diffusion(PredictionType::Epsilon);
        let x0 = x_start();
        let t = timesteps_like(&x0, 0);
        let xt = diffusion.q_sample(&x0, &t, &x0.zeros_like());
        assert!(max_abs_diff(&xt, &x0) < 1e-4);
        let (xt, _noise) = diffusion.noise(&x0, &t);
        assert!(max_abs_diff(&xt, &x0) < 0.1);
    }

    #[test]
    fn forward_noising_is_deterministic_given_noise() {
        let diffusion = diffusion(PredictionType::Epsilon);
        let x0 = x_start();
        let noise = x0.randn_like();
        let t = Tensor::from_slice(&[0i64, 10, 500, 999]);
        let a = diffusion.q_sample(&x0, &t, &noise);
        let b = diffusion.q_sample(&x0, &t, &noise);
        assert_eq!(max_abs_diff(&a, &b), 0.);
        let abar = diffusion.schedule().alphas_cumprod()[999];
        let expected = abar.sqrt() * x0.get(3) + (1. - abar).sqrt() * noise.get(3);
        assert!(max_abs_diff(&a.get(3), &expected) < 1e-10);
    }

    #[test]
    fn exact_noise_prediction_recovers_the_input() {
        let diffusion = diffusion(PredictionType::Epsilon);
        let x0 = x_start();
        let noise = x0.randn_like();
        for timestep in [0usize, 1, 10, 500, 999] {
            let t = timesteps_like(&x0, timestep);
            let xt = diffusion.q_sample(&x0, &t, &noise);
            let pred = diffusion.predict_xstart_from_eps(&xt, &t, &noise);
            assert!(max_abs_diff(&pred, &x0) < 1e-6, "timestep {timestep}");
            let eps = diffusion.predict_eps_from_xstart(&xt, &t, &x0);
            assert!(max_abs_diff(&eps, &noise) < 1e-6, "timestep {timestep}");
            let step = diffusion.denoise_step(&xt, timestep, &noise);
            assert!(max_abs_diff(&step.pred_xstart, &x0) < 1e-6);
        }
        let t = timesteps_like(&x0, 0);
        let xt = diffusion.q_sample(&x0, &t, &noise);
        let step = diffusion.denoise_step(&xt, 0, &noise);
        assert!(max_abs_diff(&step.prev_sample, &x0) < 1e-6);
    }

    #[test]
    fn exact_sample_prediction_gives_the_true_posterior() {
        let diffusion = diffusion(PredictionType::Sample);
        let x0 = x_start();
        let noise = x0.randn_like();
        let t = timesteps_like(&x0, 300);
        let xt = diffusion.q_sample(&x0, &t, &noise);
        let step = diffusion.denoise_step_with_noise(&xt, 300, &x0, &x0.zeros_like());
        let (mean, _, _) = diffusion.q_posterior_mean_variance(&x0, &xt, &t);
        assert!(max_abs_diff(&step.prev_sample, &mean) < 1e-10);
    }

    #[test]
    fn final_step_does_not_resample() {
        let diffusion = diffusion(PredictionType::Epsilon);
        let x0 = x_start();
        let output = x0.randn_like();
        let a = diffusion.denoise_step(&x0, 0, &output).prev_sample;
        let b = diffusion.denoise_step(&x0, 0, &output).prev_sample;
        assert_eq!(max_abs_diff(&a, &b), 0.);
        let c = diffusion.denoise_step(&x0, 5, &output).prev_sample;
        let d = diffusion.denoise_step(&x0, 5, &output).prev_sample;
        assert!(max_abs_diff(&c, &d) > 0.);
    }

    #[test]
    fn losses_follow_the_prediction_target() {
        let x0 = x_start();
        let noise = x0.randn_like();
        let t = Tensor::from_slice(&[1i64, 2, 3, 4]);
        let eps = diffusion(PredictionType::Epsilon);
        let terms = eps.losses_from_output(&x0, &noise, &t, &noise);
        assert_eq!(terms.loss.size(), [4]);
        assert!(terms.loss.abs().max().double_value(&[]) < 1e-12);
        let xstart = diffusion(PredictionType::Sample);
        let terms = xstart.losses_from_output(&x0, &noise, &t, &x0);
        assert!(terms.loss.abs().max().double_value(&[]) < 1e-12);
        let terms = xstart.losses_from_output(&x0, &noise, &t, &(&x0 + 2.));
        assert!((terms.mse.mean(Kind::Float).double_value(&[]) - 4.).abs() < 1e-6);
    }

    #[test]
    fn min_snr_weights_downweight_low_noise() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 1000).unwrap();
        let config = GaussianDiffusionConfig {
            loss_weighting: LossWeighting::MinSnr { gamma: 5. },
            ..Default::default()
        };
        let diffusion = GaussianDiffusion::new(schedule, config);
        assert!(diffusion.loss_weight(0) < 1e-3);
        assert!((diffusion.loss_weight(999) - 1.).abs() < 1e-12);
        let x0 = x_start();
        let noise = x0.randn_like();
        let t = Tensor::from_slice(&[0i64, 0, 999, 999]);
        let terms = diffusion.losses_from_output(&x0, &noise, &t, &x0.zeros_like());
        let loss = Vec::<f64>::try_from(&terms.loss).unwrap();
        let mse = Vec::<f64>::try_from(&terms.mse).unwrap();
        assert!(loss[0] < mse[0] * 1e-3);
        assert!((loss[3] - mse[3]).abs() < 1e-9);
    }

    // Records the unconditional mask it is called with and predicts zeros.
    struct Recorder {
        masks: RefCell<Vec<Option<Vec<bool>>>>,
    }

    impl Denoiser for Recorder {
        fn condition(&self, x_start: &Tensor, _labels: Option<&Tensor>) -> Result<Option<Tensor>> {
            Ok(Some(x_start.zeros_like()))
        }

        fn forward_t(
            &self,
            xs: &Tensor,
            _timesteps: &Tensor,
            _cond: Option<&Tensor>,
            uncond_mask: Option<&Tensor>,
        ) -> Tensor {
            let mask = uncond_mask.map(|m| Vec::<bool>::try_from(m).unwrap());
            self.masks.borrow_mut().push(mask);
            xs.zeros_like()
        }
    }

    #[test]
    fn p_uncond_drops_conditioning_per_example() {
        let diffusion = diffusion(PredictionType::Epsilon);
        let model = Recorder { masks: RefCell::new(vec![]) };
        let x0 = x_start();
        let t = timesteps_like(&x0, 10);
        diffusion.training_losses(&model, &x0, &t, None, 0., false).unwrap();
        diffusion.training_losses(&model, &x0, &t, None, 1., false).unwrap();
        let masks = model.masks.borrow();
        assert_eq!(masks[0], None);
        assert_eq!(masks[1], Some(vec![true; 4]));
    }

    #[test]
    fn p_uncond_draws_an_independent_mask_per_example() {
        let diffusion = diffusion(PredictionType::Epsilon);
        let model = Recorder { masks: RefCell::new(vec![]) };
        tch::manual_seed(7);
        let x0 = Tensor::zeros([256, 1, 2, 2], (Kind::Float, Device::Cpu));
        let t = timesteps_like(&x0, 10);
        diffusion.training_losses(&model, &x0, &t, None, 0.5, false).unwrap();
        let masks = model.masks.borrow();
        let mask = masks[0].as_ref().unwrap();
        assert_eq!(mask.len(), 256);
        let dropped = mask.iter().filter(|&&m| m).count();
        // A single batch-wide draw would give 0 or 256.
        assert!((90..=166).contains(&dropped), "{dropped} of 256 dropped");
    }

    #[test]
    fn orthogonal_latents_pay_no_penalty() {
        let orthogonal = Tensor::eye(3, (Kind::Float, Device::Cpu)).unsqueeze(0) * 2.5;
        let penalty = latent_orthogonality(&orthogonal);
        assert_eq!(penalty.size(), [1]);
        assert!(penalty.double_value(&[0]).abs() < 1e-6);
        let parallel = Tensor::ones([2, 3, 4], (Kind::Float, Device::Cpu));
        let penalty = Vec::<f64>::try_from(&latent_orthogonality(&parallel)).unwrap();
        assert!(penalty.iter().all(|p| (p - 1.).abs() < 1e-5), "{penalty:?}");
    }

    #[test]
    fn latent_orthog_adds_the_penalty_to_the_loss() {
        // Conditioning shaped like latent components, all parallel.
        struct Parallel;
        impl Denoiser for Parallel {
            fn condition(&self, x: &Tensor, _labels: Option<&Tensor>) -> Result<Option<Tensor>> {
                Ok(Some(Tensor::ones([x.size()[0], 2, 3], (Kind::Double, x.device()))))
            }
            fn forward_t(
                &self,
                xs: &Tensor,
                _timesteps: &Tensor,
                _cond: Option<&Tensor>,
                _uncond_mask: Option<&Tensor>,
            ) -> Tensor {
                xs.zeros_like()
            }
        }
        let diffusion = diffusion(PredictionType::Epsilon);
        let x0 = x_start();
        let t = timesteps_like(&x0, 10);
        let plain = diffusion.training_losses(&Parallel, &x0, &t, None, 0., false).unwrap();
        assert!(plain.orthog.is_none());
        let terms = diffusion.training_losses(&Parallel, &x0, &t, None, 0., true).unwrap();
        let orthog = terms.orthog.as_ref().unwrap();
        let expected = &terms.mse + orthog;
        assert!(max_abs_diff(&terms.loss, &expected) < 1e-6);
        assert!(orthog.min().double_value(&[]) > 0.99);
    }

    #[test]
    fn decomposition_samples_every_component_then_the_composition() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 5).unwrap();
        let diffusion = GaussianDiffusion::new(schedule, Default::default());
        let model = Recorder { masks: RefCell::new(vec![]) };
        let image = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        // The recorder's conditioning is not made of latent components.
        assert!(diffusion.sample_decomposition(&model, &image, 1.).is_err());

        struct Components(RefCell<Vec<i64>>);
        impl Denoiser for Components {
            fn condition(&self, x: &Tensor, _labels: Option<&Tensor>) -> Result<Option<Tensor>> {
                Ok(Some(Tensor::ones([x.size()[0], 3, 2], (Kind::Float, x.device()))))
            }
            fn forward_t(
                &self,
                xs: &Tensor,
                _timesteps: &Tensor,
                cond: Option<&Tensor>,
                _uncond_mask: Option<&Tensor>,
            ) -> Tensor {
                self.0.borrow_mut().extend(cond.map(|c| c.size()[1]));
                xs.zeros_like()
            }
        }
        let model = Components(RefCell::new(vec![]));
        let samples = diffusion.sample_decomposition(&model, &image, 1.).unwrap();
        assert_eq!(samples.size(), [4, 3, 4, 4]);
        let calls = model.0.borrow();
        assert_eq!(calls.len(), 20);
        assert!(calls[..15].iter().all(|&k| k == 1));
        assert!(calls[15..].iter().all(|&k| k == 3));
    }

    #[test]
    fn sampling_produces_finite_samples() {
        let schedule = NoiseSchedule::new(BetaSchedule::SquaredcosCapV2, 20).unwrap();
        let diffusion = GaussianDiffusion::new(schedule, Default::default());
        let model = Recorder { masks: RefCell::new(vec![]) };
        let cond = Tensor::zeros([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let xs = diffusion.sample_loop(&model, &[2, 3, 4, 4], Some(&cond), 3., Device::Cpu);
        assert_eq!(xs.size(), [2, 3, 4, 4]);
        assert_eq!(xs.isfinite().all().int64_value(&[]), 1);
        // Guided sampling evaluates the model twice per step.
        assert_eq!(model.masks.borrow().len(), 40);
    }
}
