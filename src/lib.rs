//! # Gaussian diffusion training
//!
//! Trains image diffusion models using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - Linear and cosine noise schedules, and a Gaussian diffusion process with
//!   forward noising, reverse denoising steps and the training losses.
//! - A small UNet denoiser that can be conditioned on decomposed latents
//!   encoded from the clean image, on class labels, or on nothing.
//! - A training loop with EMA shadows, atomic checkpoints, resume support and
//!   synchronous data-parallel replicas.

pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod schedulers;
pub mod train;
pub mod utils;

pub use error::{Error, Result};
