use super::checkpoint;
use crate::Result;
use std::collections::HashMap;
use std::path::Path;
use tch::Tensor;

/// Exponential moving average of the trainable parameters.
#[derive(Debug)]
pub struct EmaShadow {
    rate: f64,
    // (name, parameter, shadow), sorted by name.
    entries: Vec<(String, Tensor, Tensor)>,
}

impl EmaShadow {
    /// Starts a shadow equal to the current parameters.
    pub fn new(rate: f64, params: &[(String, Tensor)]) -> Self {
        let entries = params
            .iter()
            .map(|(name, param)| (name.clone(), param.shallow_clone(), param.detach().copy()))
            .collect();
        Self { rate, entries }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// `shadow <- rate * shadow + (1 - rate) * param`
    pub fn update(&mut self) {
        let rate = self.rate;
        tch::no_grad(|| {
            for (_, param, shadow) in self.entries.iter_mut() {
                *shadow *= rate;
                *shadow += param.detach() * (1. - rate);
            }
        })
    }

    /// Copies the parameters into the shadow.
    pub fn reset(&mut self) {
        tch::no_grad(|| {
            for (_, param, shadow) in self.entries.iter_mut() {
                shadow.copy_(param);
            }
        })
    }

    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        self.entries.iter().map(|(name, _, shadow)| (name.clone(), shadow.shallow_clone())).collect()
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let targets: HashMap<String, Tensor> = self.named_tensors().into_iter().collect();
        checkpoint::restore(&targets, path)
    }
}
