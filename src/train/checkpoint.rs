//! Checkpoint naming and (de)serialization.
//!
//! Checkpoints are named `<stem>_<epoch>.pt` where the epoch is the run of
//! ASCII digits between the last `_` and the `.pt` extension. The stem is
//! `model` for the trained parameters and `ema_<rate>` for an EMA shadow,
//! e.g. `model_250.pt` or `ema_0.9999_4000.pt`.
use crate::utils::persist_atomic;
use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tch::Tensor;

fn checkpoint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<stem>.+)_(?P<epoch>[0-9]+)\.pt$").expect("invalid checkpoint regex")
    })
}

fn split_name(path: &Path) -> Result<(&str, u64)> {
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| Error::checkpoint(path, "missing file name"))?;
    let captures = checkpoint_re()
        .captures(file_name)
        .ok_or_else(|| Error::checkpoint(path, "expected a file name like <name>_<epoch>.pt"))?;
    let epoch = captures["epoch"]
        .parse::<u64>()
        .map_err(|e| Error::checkpoint(path, format!("invalid epoch: {e}")))?;
    let stem = captures.name("stem").map_or("", |m| m.as_str());
    Ok((stem, epoch))
}

/// Returns the epoch encoded in a checkpoint file name.
pub fn parse_epoch<P: AsRef<Path>>(path: P) -> Result<u64> {
    split_name(path.as_ref()).map(|(_, epoch)| epoch)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckpointKind {
    Model,
    Ema(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointName {
    pub kind: CheckpointKind,
    pub epoch: u64,
}

impl CheckpointName {
    pub fn model(epoch: u64) -> Self {
        Self { kind: CheckpointKind::Model, epoch }
    }

    pub fn ema(rate: f64, epoch: u64) -> Self {
        Self { kind: CheckpointKind::Ema(rate), epoch }
    }

    pub fn file_name(&self) -> String {
        match self.kind {
            CheckpointKind::Model => format!("model_{}.pt", self.epoch),
            CheckpointKind::Ema(rate) => format!("ema_{rate}_{}.pt", self.epoch),
        }
    }

    /// Parses a file name produced by [`CheckpointName::file_name`].
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (stem, epoch) = split_name(path)?;
        let kind = match stem.strip_prefix("ema_") {
            None if stem == "model" => CheckpointKind::Model,
            None => return Err(Error::checkpoint(path, format!("unknown checkpoint kind {stem:?}"))),
            Some(rate) => {
                let rate = rate
                    .parse::<f64>()
                    .map_err(|_| Error::checkpoint(path, format!("invalid EMA rate {rate:?}")))?;
                CheckpointKind::Ema(rate)
            }
        };
        Ok(Self { kind, epoch })
    }
}

/// Atomically writes named tensors to `path`.
pub fn save_named<P: AsRef<Path>>(named: &[(String, Tensor)], path: P) -> Result<()> {
    persist_atomic(path, |tmp| Ok(Tensor::save_multi(named, tmp)?))
}

pub fn load_named<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::checkpoint(path, "no such file"));
    }
    Tensor::load_multi(path).map_err(|e| Error::checkpoint(path, e.to_string()))
}

/// Loads the checkpoint at `path` into `targets`, in place.
///
/// Every target must be present in the checkpoint with the same shape, and the
/// checkpoint cannot hold unknown tensors.
pub fn restore<P: AsRef<Path>>(targets: &HashMap<String, Tensor>, path: P) -> Result<()> {
    let path = path.as_ref();
    let named: HashMap<String, Tensor> = load_named(path)?.into_iter().collect();
    if let Some(unknown) = named.keys().find(|name| !targets.contains_key(*name)) {
        return Err(Error::checkpoint(path, format!("unexpected tensor {unknown}")));
    }
    for (name, target) in targets.iter() {
        let value = named
            .get(name)
            .ok_or_else(|| Error::checkpoint(path, format!("missing tensor {name}")))?;
        if value.size() != target.size() {
            return Err(Error::checkpoint(
                path,
                format!("shape mismatch for {name}: {:?} <> {:?}", value.size(), target.size()),
            ));
        }
    }
    tch::no_grad(|| {
        for (name, target) in targets.iter() {
            let mut target = target.shallow_clone();
            target.copy_(&named[name]);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn epochs_are_parsed_from_file_names() {
        assert_eq!(parse_epoch("model_250.pt").unwrap(), 250);
        assert_eq!(parse_epoch("ema_0.9999_4000.pt").unwrap(), 4000);
        assert_eq!(parse_epoch("/logs/run_v0/model_0.pt").unwrap(), 0);
        for bad in ["model_250", "model.pt", "model_.pt", "model_25a.pt", "_250.pt", "logs/"] {
            assert!(
                matches!(parse_epoch(bad), Err(Error::CheckpointFormat { .. })),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn names_round_trip() {
        for name in [CheckpointName::model(10), CheckpointName::ema(0.9999, 4000)] {
            assert_eq!(CheckpointName::parse(name.file_name()).unwrap(), name);
        }
        assert_eq!(CheckpointName::ema(0.999, 20).file_name(), "ema_0.999_20.pt");
        assert!(CheckpointName::parse("opt_10.pt").is_err());
        assert!(CheckpointName::parse("ema_fast_10.pt").is_err());
    }

    #[test]
    fn restore_checks_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_3.pt");
        let weight = Tensor::randn([2, 3], (Kind::Float, Device::Cpu));
        save_named(&[("w".to_string(), weight.shallow_clone())], &path).unwrap();

        let target = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        let targets = HashMap::from([("w".to_string(), target.shallow_clone())]);
        restore(&targets, &path).unwrap();
        assert!(target.allclose(&weight, 0., 0., false));

        let wrong = HashMap::from([("w".to_string(), Tensor::zeros([3, 2], (Kind::Float, Device::Cpu)))]);
        assert!(matches!(restore(&wrong, &path), Err(Error::CheckpointFormat { .. })));
        let missing = HashMap::from([
            ("w".to_string(), target.shallow_clone()),
            ("b".to_string(), Tensor::zeros([3], (Kind::Float, Device::Cpu))),
        ]);
        assert!(matches!(restore(&missing, &path), Err(Error::CheckpointFormat { .. })));
        assert!(matches!(
            restore(&targets, dir.path().join("model_4.pt")),
            Err(Error::CheckpointFormat { .. })
        ));
    }
}
