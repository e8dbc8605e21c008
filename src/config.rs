//! Training-job records read from `params.json`.
//!
//! The file holds a JSON array; each record names a model, an epoch count and
//! a dataset variant, plus optional overrides of the model's defaults:
//!
//! ```json
//! [
//!   { "model-name": "dcgan", "epochs": 30, "mnist-type": "fashion" },
//!   { "model-name": "wgan", "epochs": "20", "mnist-type": "digits", "train-ratio": 5 }
//! ]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobSpec {
    pub model_name: String,
    #[serde(deserialize_with = "number_or_string")]
    pub epochs: usize,
    #[serde(alias = "dataset-type")]
    pub mnist_type: String,
    #[serde(flatten)]
    pub overrides: Overrides,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<usize, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(usize),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Overrides {
    pub batch_size: Option<i64>,
    pub learning_rate: Option<f64>,
    pub z_dim: Option<i64>,
    pub base_filters: Option<i64>,
    pub train_ratio: Option<u64>,
    pub print_every: Option<u64>,
    pub save_every: Option<usize>,
    pub checkpoint_every: Option<usize>,
    pub grid_size: Option<i64>,
    pub animate: Option<bool>,
    pub l1_weight: Option<f64>,
    pub vgg_weights: Option<PathBuf>,
    pub seed: Option<i64>,
}

/// Fully resolved settings of one job: model defaults with the record's
/// overrides applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hyperparams {
    pub batch_size: i64,
    pub learning_rate: f64,
    pub z_dim: i64,
    pub base_filters: i64,
    /// Discriminator steps per generator step.
    pub train_ratio: u64,
    pub print_every: u64,
    pub save_every: usize,
    pub checkpoint_every: usize,
    /// Evaluation grids are `grid_size x grid_size` samples.
    pub grid_size: i64,
    pub animate: bool,
    pub l1_weight: f64,
    pub vgg_weights: PathBuf,
    pub seed: Option<i64>,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Hyperparams {
            batch_size: 128,
            learning_rate: 0.0002,
            z_dim: 100,
            base_filters: 64,
            train_ratio: 1,
            print_every: 30,
            save_every: 1,
            checkpoint_every: 5,
            grid_size: 10,
            animate: false,
            l1_weight: 0.0,
            vgg_weights: PathBuf::from("helpers/vgg16.npz"),
            seed: None,
        }
    }
}

impl Hyperparams {
    pub fn with_overrides(self, o: &Overrides) -> Hyperparams {
        Hyperparams {
            batch_size: o.batch_size.unwrap_or(self.batch_size),
            learning_rate: o.learning_rate.unwrap_or(self.learning_rate),
            z_dim: o.z_dim.unwrap_or(self.z_dim),
            base_filters: o.base_filters.unwrap_or(self.base_filters),
            train_ratio: o.train_ratio.unwrap_or(self.train_ratio),
            print_every: o.print_every.unwrap_or(self.print_every),
            save_every: o.save_every.unwrap_or(self.save_every),
            checkpoint_every: o.checkpoint_every.unwrap_or(self.checkpoint_every),
            grid_size: o.grid_size.unwrap_or(self.grid_size),
            animate: o.animate.unwrap_or(self.animate),
            l1_weight: o.l1_weight.unwrap_or(self.l1_weight),
            vgg_weights: o.vgg_weights.clone().unwrap_or(self.vgg_weights),
            seed: o.seed.or(self.seed),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch-size", self.batch_size),
            ("z-dim", self.z_dim),
            ("base-filters", self.base_filters),
            ("grid-size", self.grid_size),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(Error::config(format!("{name} must be > 0, got {value}")));
            }
        }
        if self.train_ratio == 0 || self.print_every == 0 || self.save_every == 0 || self.checkpoint_every == 0 {
            return Err(Error::config("train-ratio, print-every, save-every and checkpoint-every must be > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::config(format!("learning-rate must be > 0, got {}", self.learning_rate)));
        }
        if self.l1_weight < 0.0 {
            return Err(Error::config("l1-weight must not be negative"));
        }
        Ok(())
    }
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(Error::config("record without a model-name"));
        }
        if self.epochs == 0 {
            return Err(Error::config(format!("{}: epochs must be > 0", self.model_name)));
        }
        if self.mnist_type.trim().is_empty() {
            return Err(Error::config(format!("{}: empty dataset type", self.model_name)));
        }
        Ok(())
    }
}

pub fn parse_jobs(json: &str) -> Result<Vec<JobSpec>> {
    let jobs: Vec<JobSpec> =
        serde_json::from_str(json).map_err(|e| Error::config(format!("malformed training-job records: {e}")))?;
    if jobs.is_empty() {
        return Err(Error::config("no training jobs given"));
    }
    for job in &jobs {
        job.validate()?;
    }
    Ok(jobs)
}

pub fn load_jobs(path: impl AsRef<Path>) -> Result<Vec<JobSpec>> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    parse_jobs(&content)
}

/// Where datasets are read from and artifacts are written to.
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            data_dir: PathBuf::from("./data_set"),
            assets_dir: PathBuf::from("./assets"),
            checkpoint_dir: PathBuf::from("./checkpoints"),
        }
    }
}

impl Paths {
    pub fn dataset(&self, job: &JobSpec) -> PathBuf {
        self.data_dir.join(&job.mnist_type)
    }

    pub fn assets(&self, model: &str) -> PathBuf {
        self.assets_dir.join(model)
    }

    pub fn checkpoints(&self, model: &str) -> PathBuf {
        self.checkpoint_dir.join(model)
    }
}

/// `create_dir_all`, reporting failures as resource errors.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::resource(path, e))
}
