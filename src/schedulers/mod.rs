//! # Noise schedules and the Gaussian diffusion process
//!
//! A [`NoiseSchedule`] fixes how much noise is added at every diffusion step,
//! [`gaussian_diffusion::GaussianDiffusion`] implements the forward noising,
//! the reverse denoising step and the training losses on top of it, and
//! [`resample`] decides which timesteps a training batch looks at.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tch::{Device, Kind, Tensor};

pub mod gaussian_diffusion;
pub mod resample;

/// Largest beta a schedule may produce, so that no step destroys the whole signal.
const MAX_BETA: f64 = 0.999;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation, rescaled so that every step count spans the same
    /// amount of noise as the reference 1000 step schedule.
    Linear,
    /// Glide cosine schedule
    #[serde(alias = "cosine")]
    SquaredcosCapV2,
}

impl FromStr for BetaSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "cosine" | "squaredcos_cap_v2" => Ok(Self::SquaredcosCapV2),
            other => Err(Error::InvalidSchedule(format!("unknown schedule kind {other:?}"))),
        }
    }
}

/// What the denoising model is trained to regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The noise that was injected by the forward process.
    Epsilon,
    /// The clean sample `x_0`, a.k.a. `predict_xstart`.
    Sample,
}

impl PredictionType {
    pub fn from_predict_xstart(predict_xstart: bool) -> Self {
        if predict_xstart {
            Self::Sample
        } else {
            Self::Epsilon
        }
    }

    /// Short tag used in run names.
    pub fn desc(&self) -> &'static str {
        match self {
            Self::Epsilon => "eps",
            Self::Sample => "xstart",
        }
    }
}

/// Fixed variance used for the reverse process. Learned variances are not
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceType {
    /// The true posterior variance `beta_tilde_t`.
    #[default]
    FixedSmall,
    /// `beta_t`, with `beta_tilde_1` at the first step so that the log stays finite.
    FixedLarge,
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// Contains a function `alpha_bar` that takes an argument `t` and transforms it to the cumulative product of `(1-beta)`
/// up to that part of the diffusion process.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    let n = num_diffusion_timesteps as f64;
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// The variances `beta_t` of a diffusion process together with their
/// cumulative products `alpha_bar_t = prod_{s <= t} (1 - beta_s)`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    kind: BetaSchedule,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(kind: BetaSchedule, num_timesteps: usize) -> Result<Self> {
        if num_timesteps < 2 {
            return Err(Error::InvalidSchedule(format!(
                "a schedule needs at least 2 timesteps, got {num_timesteps}"
            )));
        }
        let betas = match kind {
            BetaSchedule::Linear => {
                let scale = 1000. / num_timesteps as f64;
                let betas = Tensor::linspace(
                    scale * 0.0001,
                    scale * 0.02,
                    num_timesteps as i64,
                    (Kind::Double, Device::Cpu),
                )
                .clamp_max(MAX_BETA);
                Vec::<f64>::try_from(betas)?
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(num_timesteps, MAX_BETA),
        };
        Self::from_betas(kind, betas)
    }

    /// Parses the schedule kind by name, e.g. `"linear"` or `"cosine"`.
    pub fn from_name(name: &str, num_timesteps: usize) -> Result<Self> {
        Self::new(name.parse()?, num_timesteps)
    }

    fn from_betas(kind: BetaSchedule, betas: Vec<f64>) -> Result<Self> {
        if let Some(beta) = betas.iter().find(|b| !(**b > 0. && **b < 1.)) {
            return Err(Error::InvalidSchedule(format!("beta {beta} is outside of (0, 1)")));
        }
        let alphas: Tensor = 1. - Tensor::from_slice(&betas);
        let alphas_cumprod = Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double))?;
        Ok(Self { kind, betas, alphas_cumprod })
    }

    pub fn kind(&self) -> BetaSchedule {
        self.kind
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Signal-to-noise ratio `alpha_bar_t / (1 - alpha_bar_t)`.
    pub fn snr(&self, timestep: usize) -> f64 {
        let alpha_bar = self.alphas_cumprod[timestep];
        alpha_bar / (1. - alpha_bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_boundaries(schedule: &NoiseSchedule, eps: f64) {
        let abar = schedule.alphas_cumprod();
        assert_eq!(abar.len(), schedule.num_timesteps());
        assert!(abar.windows(2).all(|w| w[1] < w[0]), "{:?} is not decreasing", schedule.kind());
        assert!(abar.iter().all(|a| *a > 0. && *a < 1.));
        assert!(1. - abar[0] < eps, "start {} for {:?}", abar[0], schedule.kind());
        assert!(abar[abar.len() - 1] < eps, "end {} for {:?}", abar[abar.len() - 1], schedule.kind());
    }

    #[test]
    fn cumulative_products_decrease_from_one_to_zero() {
        for kind in [BetaSchedule::Linear, BetaSchedule::SquaredcosCapV2] {
            for steps in [10, 50, 100, 250, 1000, 4000] {
                let schedule = NoiseSchedule::new(kind, steps).unwrap();
                check_boundaries(&schedule, 0.05);
            }
        }
    }

    #[test]
    fn linear_thousand_steps() {
        let schedule = NoiseSchedule::from_name("linear", 1000).unwrap();
        let abar = schedule.alphas_cumprod();
        assert_eq!(abar.len(), 1000);
        assert!(abar[0] > 0.999);
        assert!(abar[999] < 0.001);
        assert!((schedule.betas()[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas()[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn cosine_thousand_steps() {
        let schedule = NoiseSchedule::from_name("cosine", 1000).unwrap();
        let abar = schedule.alphas_cumprod();
        assert!(abar[0] > 0.999);
        assert!(abar[999] < 0.001);
        assert!(schedule.snr(0) > schedule.snr(500));
        assert!(schedule.snr(500) > schedule.snr(999));
    }

    #[test]
    fn rejects_bad_step_counts_and_kinds() {
        for steps in [0, 1] {
            let err = NoiseSchedule::new(BetaSchedule::Linear, steps).unwrap_err();
            assert!(matches!(err, Error::InvalidSchedule(_)));
        }
        let err = NoiseSchedule::from_name("sigmoid", 1000).unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
    }
}
