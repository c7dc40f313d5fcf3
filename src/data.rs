//! Image datasets and the infinite batch iterator feeding the training loop.
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A batch of images in [-1, 1], with their class labels when the dataset has some.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Option<Tensor>,
}

impl Batch {
    pub fn size(&self) -> i64 {
        self.images.size()[0]
    }

    /// Rows `start..start + len` of the batch.
    pub fn narrow(&self, start: i64, len: i64) -> Batch {
        Batch {
            images: self.images.narrow(0, start, len),
            labels: self.labels.as_ref().map(|l| l.narrow(0, start, len)),
        }
    }
}

#[derive(Debug)]
pub struct ImageDataset {
    // [N, C, H, W], float, kept on the cpu.
    images: Tensor,
    labels: Option<Tensor>,
    num_classes: i64,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| {
            std::io::Error::new(e.kind(), format!("error reading directory {dir:?}: {e}"))
        })?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Loads a single image resized to `image_size`, as a `[1, C, H, W]` batch in [-1, 1].
pub fn load_image<P: AsRef<Path>>(path: P, image_size: i64) -> Result<Tensor> {
    let image = tch::vision::image::load_and_resize(path, image_size, image_size)?;
    Ok((image.to_kind(Kind::Float) / 255. * 2. - 1.).unsqueeze(0))
}

impl ImageDataset {
    /// Loads the images of `dir`. When `dir` contains sub-directories, each of
    /// them is a class and its images are labelled with its index in sorted
    /// order; otherwise the images of `dir` itself are loaded, unlabelled.
    pub fn load_dir<P: AsRef<Path>>(
        dir: P,
        image_size: i64,
        num_images: Option<usize>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = sorted_entries(dir)?;
        let class_dirs: Vec<&PathBuf> = entries.iter().filter(|p| p.is_dir()).collect();
        let mut files: Vec<(PathBuf, Option<i64>)> = if class_dirs.is_empty() {
            entries.iter().filter(|p| is_image(p)).map(|p| (p.clone(), None)).collect()
        } else {
            let mut files = vec![];
            for (label, class_dir) in class_dirs.iter().enumerate() {
                for path in sorted_entries(class_dir)?.into_iter().filter(|p| is_image(p)) {
                    files.push((path, Some(label as i64)));
                }
            }
            files
        };
        if let Some(num_images) = num_images {
            files.truncate(num_images);
        }
        if files.is_empty() {
            return Err(Error::InvalidConfig(format!("no image found in {dir:?}")));
        }

        let images = files
            .iter()
            .map(|(path, _)| load_image(path, image_size))
            .collect::<Result<Vec<_>>>()?;
        let images = Tensor::cat(&images, 0);
        let labels: Option<Vec<i64>> = files.iter().map(|(_, label)| *label).collect();
        let num_classes = class_dirs.len() as i64;
        tracing::info!(
            "loaded {} images of size {image_size} from {dir:?} ({num_classes} classes)",
            files.len(),
        );
        Ok(Self { images, labels: labels.map(|l| Tensor::from_slice(&l)), num_classes })
    }

    /// Wraps in-memory images of shape `[N, C, H, W]` in [-1, 1].
    pub fn from_tensors(images: Tensor, labels: Option<Tensor>) -> Result<Self> {
        let size = images.size();
        if size.len() != 4 || size[0] == 0 {
            return Err(Error::InvalidConfig(format!("expected a non-empty [N, C, H, W] batch, got {size:?}")));
        }
        let num_classes = match &labels {
            None => 0,
            Some(labels) => {
                if labels.size() != [size[0]] {
                    return Err(Error::InvalidConfig(format!(
                        "expected {} labels, got {:?}",
                        size[0],
                        labels.size()
                    )));
                }
                if labels.min().int64_value(&[]) < 0 {
                    return Err(Error::InvalidConfig("labels cannot be negative".into()));
                }
                labels.max().int64_value(&[]) + 1
            }
        };
        let images = images.to_kind(Kind::Float).to_device(Device::Cpu);
        let labels = labels.map(|l| l.to_kind(Kind::Int64).to_device(Device::Cpu));
        Ok(Self { images, labels, num_classes })
    }

    pub fn len(&self) -> usize {
        self.images.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Fails when the dataset has labels a model with `num_classes` classes
    /// cannot embed.
    pub fn check_num_classes(&self, num_classes: i64) -> Result<()> {
        if self.num_classes > num_classes {
            return Err(Error::InvalidConfig(format!(
                "the dataset has {} classes but the model only {num_classes}",
                self.num_classes
            )));
        }
        Ok(())
    }

    pub fn image_size(&self) -> i64 {
        self.images.size()[3]
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            images: self.images.shallow_clone(),
            labels: self.labels.as_ref().map(|l| l.shallow_clone()),
            num_classes: self.num_classes,
        }
    }

    fn select(&self, indexes: &[i64], device: Device) -> Batch {
        let indexes = Tensor::from_slice(indexes);
        Batch {
            images: self.images.index_select(0, &indexes).to_device(device),
            labels: self.labels.as_ref().map(|l| l.index_select(0, &indexes).to_device(device)),
        }
    }
}

/// Infinite iterator over shuffled batches of the shard owned by one rank.
///
/// Example `i` belongs to the rank `i % world_size`. The shard is reshuffled
/// at every pass and batches are always full, wrapping around passes.
#[derive(Debug)]
pub struct DataLoader {
    dataset: ImageDataset,
    shard: Vec<i64>,
    order: Vec<i64>,
    position: usize,
    batch_size: i64,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: ImageDataset,
        batch_size: i64,
        device: Device,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if batch_size <= 0 {
            return Err(Error::InvalidConfig(format!("invalid batch size {batch_size}")));
        }
        let shard: Vec<i64> =
            (rank..dataset.len()).step_by(world_size.max(1)).map(|i| i as i64).collect();
        if shard.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{} images cannot be sharded over {world_size} ranks",
                dataset.len()
            )));
        }
        Ok(Self { dataset, shard, order: vec![], position: 0, batch_size, device })
    }

    fn reshuffle(&mut self) -> Result<()> {
        let perm = Tensor::randperm(self.shard.len() as i64, (Kind::Int64, Device::Cpu));
        let perm = Vec::<i64>::try_from(&perm)?;
        self.order = perm.into_iter().map(|i| self.shard[i as usize]).collect();
        self.position = 0;
        Ok(())
    }

    /// The next full batch, reshuffling the shard whenever a pass ends.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let mut indexes = Vec::with_capacity(self.batch_size as usize);
        while indexes.len() < self.batch_size as usize {
            if self.position >= self.order.len() {
                self.reshuffle()?;
            }
            indexes.push(self.order[self.position]);
            self.position += 1;
        }
        Ok(self.dataset.select(&indexes, self.device))
    }
}

/// Ends the iteration on the first error, which is logged.
impl Iterator for DataLoader {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        match self.next_batch() {
            Ok(batch) => Some(batch),
            Err(err) => {
                tracing::error!("cannot draw a batch: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: i64) -> ImageDataset {
        // Every image is filled with its own index.
        let images = Tensor::arange(n, (Kind::Float, Device::Cpu))
            .view([n, 1, 1, 1])
            .expand([n, 3, 4, 4], false)
            .contiguous();
        let labels = Tensor::arange(n, (Kind::Int64, Device::Cpu)).remainder(2);
        ImageDataset::from_tensors(images, Some(labels)).unwrap()
    }

    fn image_ids(batch: &Batch) -> Vec<i64> {
        let ids = batch.images.mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float);
        Vec::<f32>::try_from(&ids).unwrap().into_iter().map(|v| v as i64).collect()
    }

    #[test]
    fn every_pass_visits_the_whole_shard() {
        let mut loader = DataLoader::new(dataset(6), 3, Device::Cpu, 0, 1).unwrap();
        let first = loader.next().unwrap();
        assert_eq!(first.images.size(), [3, 3, 4, 4]);
        let labels = Vec::<i64>::try_from(first.labels.as_ref().unwrap()).unwrap();
        let mut seen = image_ids(&first);
        assert_eq!(labels, seen.iter().map(|i| i % 2).collect::<Vec<_>>());
        seen.extend(image_ids(&loader.next().unwrap()));
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn ranks_see_disjoint_shards() {
        let mut rank0 = DataLoader::new(dataset(6), 2, Device::Cpu, 0, 2).unwrap();
        let mut rank1 = DataLoader::new(dataset(6), 2, Device::Cpu, 1, 2).unwrap();
        for _ in 0..4 {
            assert!(image_ids(&rank0.next().unwrap()).iter().all(|i| i % 2 == 0));
            assert!(image_ids(&rank1.next().unwrap()).iter().all(|i| i % 2 == 1));
        }
    }

    #[test]
    fn batches_larger_than_the_dataset_wrap_around() {
        let mut loader = DataLoader::new(dataset(2), 5, Device::Cpu, 0, 1).unwrap();
        assert_eq!(loader.next().unwrap().size(), 5);
        assert!(DataLoader::new(dataset(2), 1, Device::Cpu, 2, 3).is_err());
    }

    #[test]
    fn next_batch_reshuffles_between_passes() {
        let mut loader = DataLoader::new(dataset(3), 2, Device::Cpu, 0, 1).unwrap();
        let mut seen = vec![];
        for _ in 0..3 {
            seen.extend(image_ids(&loader.next_batch().unwrap()));
        }
        // Two full passes over the three images.
        seen.sort();
        assert_eq!(seen, [0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn label_ranges_are_checked() {
        let dataset = dataset(4);
        assert_eq!(dataset.num_classes(), 2);
        assert!(dataset.check_num_classes(2).is_ok());
        assert!(matches!(dataset.check_num_classes(1), Err(Error::InvalidConfig(_))));
        let images = Tensor::zeros([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, -1]);
        assert!(ImageDataset::from_tensors(images, Some(labels)).is_err());
    }

    #[test]
    fn loads_class_directories() {
        let dir = tempfile::tempdir().unwrap();
        for (class, count) in [("cube", 2), ("sphere", 1)] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir(&class_dir).unwrap();
            for i in 0..count {
                let image = Tensor::full([3, 10, 12], 255i64, (Kind::Uint8, Device::Cpu));
                tch::vision::image::save(&image, class_dir.join(format!("{i}.png"))).unwrap();
            }
            std::fs::write(class_dir.join("notes.txt"), "not an image").unwrap();
        }
        let dataset = ImageDataset::load_dir(dir.path(), 8, None).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.num_classes(), 2);
        assert_eq!(dataset.image_size(), 8);
        assert_eq!(Vec::<i64>::try_from(dataset.labels.as_ref().unwrap()).unwrap(), [0, 0, 1]);
        assert!((dataset.images.max().double_value(&[]) - 1.).abs() < 1e-6);

        let image = load_image(dir.path().join("sphere/0.png"), 4).unwrap();
        assert_eq!(image.size(), [1, 3, 4, 4]);

        let truncated = ImageDataset::load_dir(dir.path(), 8, Some(1)).unwrap();
        assert_eq!(truncated.len(), 1);
        assert!(ImageDataset::load_dir(dir.path().join("cube/0.png"), 8, None).is_err());
    }
}
