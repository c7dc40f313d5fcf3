//! # Models
//!
//! Denoising networks trained by the diffusion loop.

pub mod embeddings;
pub mod resnet;
pub mod unet;

pub use unet::DecompUNet;

use crate::Result;
use tch::Tensor;

/// A network predicting the noise (or the clean sample) of a noisy batch.
pub trait Denoiser {
    /// Computes the conditioning for a batch of clean samples, `None` for
    /// unconditional models. Fails on labels the model has no embedding for.
    fn condition(&self, x_start: &Tensor, labels: Option<&Tensor>) -> Result<Option<Tensor>>;

    /// Runs the network on `xs` at the given per-example timesteps. Examples
    /// selected by `uncond_mask` have their conditioning replaced by the null
    /// conditioning, a missing `cond` drops it for the whole batch.
    fn forward_t(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        cond: Option<&Tensor>,
        uncond_mask: Option<&Tensor>,
    ) -> Tensor;
}
