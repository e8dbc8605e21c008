//! Batch sources feeding the training loop.
//!
//! Sources hand out images in [0, 1]; rescaling to [-1, 1] is the training
//! loop's job. Every source loops forever, reshuffling after each pass.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::thread_rng;
use tch::{kind, Kind, Tensor};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct RawBatch {
    /// `[n, C, H, W]`, values in [0, 1].
    pub images: Tensor,
    /// `[n]` class indices, zeros when the dataset has none.
    pub labels: Tensor,
    /// Paired source images, same layout as `images`.
    pub sources: Option<Tensor>,
}

pub trait BatchSource {
    fn num_examples(&self) -> i64;

    fn next_batch(&mut self, size: i64) -> Result<RawBatch>;
}

/// Splits `size` draws over a shuffled order of `len` items, reshuffling
/// whenever the order runs out.
fn draw<T: Clone>(order: &mut Vec<T>, cursor: &mut usize, size: usize, mut reshuffle: impl FnMut(&mut Vec<T>)) -> Vec<T> {
    let mut picked = Vec::with_capacity(size);
    while picked.len() < size {
        if *cursor == order.len() {
            reshuffle(order);
            *cursor = 0;
        }
        let take = (size - picked.len()).min(order.len() - *cursor);
        picked.extend_from_slice(&order[*cursor..*cursor + take]);
        *cursor += take;
    }
    picked
}

/// An in-memory dataset, e.g. MNIST.
pub struct TensorSource {
    images: Tensor,
    labels: Tensor,
    order: Vec<i64>,
    cursor: usize,
}

impl TensorSource {
    pub fn new(images: Tensor, labels: Tensor) -> Result<TensorSource> {
        let n = images.size()[0];
        if n == 0 || labels.size() != [n] {
            return Err(Error::shape("dataset", format!("{:?} images with {:?} labels", images.size(), labels.size())));
        }
        let mut order: Vec<i64> = (0..n).collect();
        order.shuffle(&mut thread_rng());
        Ok(TensorSource { images, labels, order, cursor: 0 })
    }

    /// Reads the MNIST IDX files (`train-images-idx3-ubyte`, ...) from `dir`.
    /// Fashion-MNIST uses the same layout.
    pub fn mnist(dir: impl AsRef<Path>) -> Result<TensorSource> {
        let dir = dir.as_ref();
        let data = tch::vision::mnist::load_dir(dir).map_err(|e| Error::resource(dir, e))?;
        let images = data.train_images.view([-1, 1, 28, 28]);
        info!("Loaded {} training images from {}", images.size()[0], dir.display());
        TensorSource::new(images, data.train_labels)
    }
}

impl BatchSource for TensorSource {
    fn num_examples(&self) -> i64 {
        self.order.len() as i64
    }

    fn next_batch(&mut self, size: i64) -> Result<RawBatch> {
        let picked = draw(&mut self.order, &mut self.cursor, size.max(0) as usize, |o| o.shuffle(&mut thread_rng()));
        let index = Tensor::from_slice(&picked).to_kind(Kind::Int64);
        Ok(RawBatch {
            images: self.images.index_select(0, &index).to_kind(Kind::Float),
            labels: self.labels.index_select(0, &index),
            sources: None,
        })
    }
}

/// Pairs `<dir>/inputs/<name>` with `<dir>/targets/<name>`, loaded lazily and
/// resized to `resolution x resolution`.
pub struct PairedImageSource {
    pairs: Vec<(PathBuf, PathBuf)>,
    order: Vec<usize>,
    cursor: usize,
    resolution: i64,
}

impl PairedImageSource {
    pub fn open(dir: impl AsRef<Path>, resolution: i64) -> Result<PairedImageSource> {
        let dir = dir.as_ref();
        let (inputs, targets) = (dir.join("inputs"), dir.join("targets"));
        let mut names = std::fs::read_dir(&targets)
            .map_err(|e| Error::resource(&targets, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name())
            .collect::<Vec<_>>();
        names.sort();

        let mut pairs = Vec::with_capacity(names.len());
        for name in names {
            let source = inputs.join(&name);
            if !source.is_file() {
                let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no matching input image");
                return Err(Error::resource(source, missing));
            }
            pairs.push((source, targets.join(&name)));
        }
        if pairs.is_empty() {
            let empty = std::io::Error::new(std::io::ErrorKind::NotFound, "no image pairs");
            return Err(Error::resource(dir, empty));
        }
        info!("Found {} image pairs in {}", pairs.len(), dir.display());

        let mut order: Vec<usize> = (0..pairs.len()).collect();
        order.shuffle(&mut thread_rng());
        Ok(PairedImageSource { pairs, order, cursor: 0, resolution })
    }

    fn load(&self, path: &Path) -> Result<Tensor> {
        let image = tch::vision::image::load_and_resize(path, self.resolution, self.resolution)
            .map_err(|e| Error::resource(path, e))?;
        Ok(image.to_kind(Kind::Float) / 255.0)
    }
}

impl BatchSource for PairedImageSource {
    fn num_examples(&self) -> i64 {
        self.pairs.len() as i64
    }

    fn next_batch(&mut self, size: i64) -> Result<RawBatch> {
        let picked = draw(&mut self.order, &mut self.cursor, size.max(0) as usize, |o| o.shuffle(&mut thread_rng()));
        let mut sources = Vec::with_capacity(picked.len());
        let mut targets = Vec::with_capacity(picked.len());
        for i in picked {
            let (source, target) = &self.pairs[i];
            sources.push(self.load(source)?);
            targets.push(self.load(target)?);
        }
        Ok(RawBatch {
            images: Tensor::stack(&targets, 0),
            labels: Tensor::zeros([targets.len() as i64], kind::INT64_CPU),
            sources: Some(Tensor::stack(&sources, 0)),
        })
    }
}
