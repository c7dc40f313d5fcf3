//! # Training
//!
//! The training loop and what it persists and synchronizes: EMA shadows,
//! checkpoints and the collectives between data-parallel replicas.

pub mod checkpoint;
pub mod dist;
pub mod ema;
mod train_loop;

pub use checkpoint::{parse_epoch, CheckpointKind, CheckpointName};
pub use dist::{LocalGroup, ProcessGroup, SingleProcess};
pub use ema::EmaShadow;
pub use train_loop::{DivergenceWarning, StopHandle, TrainLoop, TrainState};
