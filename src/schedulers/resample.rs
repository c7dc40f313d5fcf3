//! Timestep samplers used to pick the diffusion step of every training example.
//!
//! Sampling timesteps non-uniformly changes the expectation of the loss, so
//! every sampler also returns the importance weights `1 / (T * p_t)` that
//! restore an unbiased objective.
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleSamplerKind {
    #[default]
    Uniform,
    LossSecondMoment,
}

impl FromStr for ScheduleSamplerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "loss-second-moment" => Ok(Self::LossSecondMoment),
            other => Err(Error::InvalidConfig(format!("unknown schedule sampler {other:?}"))),
        }
    }
}

pub trait ScheduleSampler: Send {
    /// Unnormalized sampling weight of every timestep.
    fn weights(&self) -> Vec<f64>;

    /// Records the losses observed at the given timesteps.
    fn update_with_losses(&mut self, _timesteps: &[i64], _losses: &[f64]) {}

    /// Draws `batch_size` timesteps and returns them with their importance weights.
    fn sample(&self, batch_size: i64, device: Device) -> (Tensor, Tensor) {
        let weights = self.weights();
        let total: f64 = weights.iter().sum();
        let probs: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let num_timesteps = probs.len() as f64;
        let importance: Vec<f64> = probs.iter().map(|p| 1. / (num_timesteps * p)).collect();
        let timesteps = Tensor::from_slice(&probs).multinomial(batch_size, true);
        let importance = Tensor::from_slice(&importance).index_select(0, &timesteps);
        (timesteps.to_device(device), importance.to_kind(Kind::Float).to_device(device))
    }
}

#[derive(Debug, Clone)]
pub struct UniformSampler {
    num_timesteps: usize,
}

impl UniformSampler {
    pub fn new(num_timesteps: usize) -> Self {
        Self { num_timesteps }
    }
}

impl ScheduleSampler for UniformSampler {
    fn weights(&self) -> Vec<f64> {
        vec![1.; self.num_timesteps]
    }
}

/// Samples timesteps proportionally to the root mean square of their recent
/// losses, falling back to uniform sampling until every timestep has a full
/// loss history.
#[derive(Debug, Clone)]
pub struct LossSecondMomentResampler {
    history: Vec<Vec<f64>>,
    // Next slot to overwrite in every history ring.
    cursors: Vec<usize>,
    history_per_term: usize,
    uniform_prob: f64,
}

impl LossSecondMomentResampler {
    pub fn new(num_timesteps: usize) -> Self {
        Self::with_params(num_timesteps, 10, 0.001)
    }

    pub fn with_params(num_timesteps: usize, history_per_term: usize, uniform_prob: f64) -> Self {
        Self {
            history: vec![Vec::with_capacity(history_per_term); num_timesteps],
            cursors: vec![0; num_timesteps],
            history_per_term,
            uniform_prob,
        }
    }

    pub fn warmed_up(&self) -> bool {
        self.history.iter().all(|h| h.len() == self.history_per_term)
    }
}

impl ScheduleSampler for LossSecondMomentResampler {
    fn weights(&self) -> Vec<f64> {
        let num_timesteps = self.history.len();
        if !self.warmed_up() {
            return vec![1.; num_timesteps];
        }
        let rms: Vec<f64> = self
            .history
            .iter()
            .map(|h| (h.iter().map(|l| l * l).sum::<f64>() / h.len() as f64).sqrt())
            .collect();
        let total: f64 = rms.iter().sum();
        let uniform = self.uniform_prob / num_timesteps as f64;
        rms.iter().map(|w| w / total * (1. - self.uniform_prob) + uniform).collect()
    }

    fn update_with_losses(&mut self, timesteps: &[i64], losses: &[f64]) {
        for (&t, &loss) in timesteps.iter().zip(losses) {
            let t = t as usize;
            if !loss.is_finite() || t >= self.history.len() {
                continue;
            }
            let history = &mut self.history[t];
            if history.len() < self.history_per_term {
                history.push(loss);
            } else {
                history[self.cursors[t]] = loss;
                self.cursors[t] = (self.cursors[t] + 1) % self.history_per_term;
            }
        }
    }
}

pub fn create_schedule_sampler(
    kind: ScheduleSamplerKind,
    num_timesteps: usize,
) -> Box<dyn ScheduleSampler> {
    match kind {
        ScheduleSamplerKind::Uniform => Box::new(UniformSampler::new(num_timesteps)),
        ScheduleSamplerKind::LossSecondMoment => {
            Box::new(LossSecondMomentResampler::new(num_timesteps))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sampling_has_unit_weights() {
        let sampler = UniformSampler::new(100);
        let (t, w) = sampler.sample(64, Device::Cpu);
        assert_eq!(t.size(), [64]);
        assert_eq!(t.kind(), Kind::Int64);
        let t = Vec::<i64>::try_from(&t).unwrap();
        assert!(t.iter().all(|t| (0..100).contains(t)));
        let w = Vec::<f32>::try_from(&w).unwrap();
        assert!(w.iter().all(|w| (w - 1.).abs() < 1e-5));
    }

    #[test]
    fn second_moment_resampler_warms_up() {
        let mut sampler = LossSecondMomentResampler::with_params(4, 2, 0.);
        assert!(!sampler.warmed_up());
        assert_eq!(sampler.weights(), vec![1.; 4]);
        for _ in 0..3 {
            sampler.update_with_losses(&[0, 1, 2, 3], &[1., 1., 1., 3.]);
        }
        sampler.update_with_losses(&[0], &[f64::NAN]);
        assert!(sampler.warmed_up());
        let weights = sampler.weights();
        assert!((weights[3] - 0.5).abs() < 1e-12);
        assert!((weights.iter().sum::<f64>() - 1.).abs() < 1e-12);

        // Every timestep drawn from the skewed distribution is re-weighted so
        // that the expected weight is one.
        let (t, w) = sampler.sample(16, Device::Cpu);
        let t = Vec::<i64>::try_from(&t).unwrap();
        let w = Vec::<f32>::try_from(&w).unwrap();
        for (t, w) in t.iter().zip(w.iter()) {
            let expected = if *t == 3 { 0.5 } else { 1.5 };
            assert!((*w as f64 - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn sampler_kinds_parse() {
        assert_eq!("uniform".parse::<ScheduleSamplerKind>().unwrap(), ScheduleSamplerKind::Uniform);
        assert_eq!(
            "loss-second-moment".parse::<ScheduleSamplerKind>().unwrap(),
            ScheduleSamplerKind::LossSecondMoment
        );
        assert!("importance".parse::<ScheduleSamplerKind>().is_err());
    }
}
