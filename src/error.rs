use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by schedules, checkpoints, collectives and the training loop.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad step count or unknown schedule kind.
    #[error("invalid noise schedule: {0}")]
    InvalidSchedule(String),

    /// Unparseable checkpoint file name, or parameters that do not fit the model.
    #[error("invalid checkpoint {path:?}: {reason}")]
    CheckpointFormat { path: PathBuf, reason: String },

    /// A peer did not reach a collective within the watchdog timeout.
    #[error("rank {rank} timed out after {timeout:?} waiting for peers in {collective}")]
    DistributedSyncTimeout { rank: usize, collective: &'static str, timeout: Duration },

    /// The configured divergence policy gave up on non-finite losses.
    #[error("loss was non-finite for {steps} consecutive steps (epoch {epoch}, last loss {loss})")]
    Divergence { steps: usize, epoch: u64, loss: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn checkpoint<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::CheckpointFormat { path: path.into(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
