use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tch::Device;

/// Picks the device of every data-parallel replica.
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: bool,
}

impl DeviceSetup {
    pub fn new(cpu: bool) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    /// Ranks are spread over the available CUDA devices, round robin.
    pub fn get(&self, rank: usize) -> Device {
        if self.cpu {
            return Device::Cpu;
        }
        match self.accelerator_device {
            Device::Cuda(_) => Device::Cuda(rank % tch::Cuda::device_count().max(1) as usize),
            device => device,
        }
    }
}

// Temporary sibling of `path`, hidden so that it is never mistaken for a
// checkpoint.
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Writes a file through `write` at a temporary location then renames it over
/// `path`, so readers never see a partially written file.
pub(crate) fn persist_atomic<P, F>(path: P, write: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&Path) -> Result<()>,
{
    let path = path.as_ref();
    let tmp = temp_path(path);
    if let Err(err) = write(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Io(std::io::Error::new(e.kind(), format!("error renaming {tmp:?} to {path:?}: {e}")))
    })
}
