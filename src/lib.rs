//! Generative adversarial networks on `tch`: a vanilla GAN, DCGAN and its
//! class-conditional variant, WGAN with weight clipping, and pix2pix with a
//! patch or a perceptual (VGG16) discriminator.
//!
//! Jobs are read from a JSON file, resolved against the model [`registry`],
//! and trained one after another, each in its own [`session::Session`].

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod layers;
pub mod loss;
pub mod model;
pub mod perceptual;
pub mod registry;
pub mod session;
pub mod trainer;
pub mod unet;
pub mod visual;

pub use config::{load_jobs, Hyperparams, JobSpec, Paths};
pub use error::{Error, Result};
pub use registry::{DatasetKind, ModelEntry, Registry};
pub use session::Session;
pub use trainer::{TrainOptions, TrainSummary, Trainer};
