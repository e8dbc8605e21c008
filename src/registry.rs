//! Model identifiers and the constructors behind them.

use std::collections::BTreeMap;

use tch::Device;
use tracing::info;

use crate::config::{Hyperparams, JobSpec};
use crate::discriminator::{DcDiscriminator, DcDiscriminatorConfig, MlpDiscriminator, PatchDiscriminator};
use crate::error::{Error, Result};
use crate::generator::{DcGenerator, DcGeneratorConfig, MlpGenerator};
use crate::loss::{AdversarialLoss, Policy};
use crate::model::{DcGan, Networks, PairCritic, Pix2Pix, VanillaGan};
use crate::perceptual::{PerceptualDiscriminator, PretrainedWeights};
use crate::session::Session;
use crate::unet::{UNetConfig, UNetGenerator};

pub const MNIST_SHAPE: [i64; 3] = [1, 28, 28];
pub const MNIST_CLASSES: i64 = 10;
const MLP_HIDDEN: i64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    /// Directories of source/target image pairs.
    Paired,
}

pub type Constructor = fn(&Hyperparams, Device) -> Result<Session>;

#[derive(Clone, Copy)]
pub struct ModelEntry {
    pub id: &'static str,
    pub dataset: DatasetKind,
    pub defaults: fn() -> Hyperparams,
    pub build: Constructor,
}

impl ModelEntry {
    pub fn hyperparams(&self, job: &JobSpec) -> Result<Hyperparams> {
        let params = (self.defaults)().with_overrides(&job.overrides);
        params.validate()?;
        Ok(params)
    }

    /// Builds a fresh session; seeds libtorch first when the job asks for it.
    pub fn instantiate(&self, params: &Hyperparams, device: Device) -> Result<Session> {
        if let Some(seed) = params.seed {
            tch::manual_seed(seed);
        }
        let session = (self.build)(params, device)?;
        info!(
            "Built {} on {:?}: {} generator / {} discriminator parameters",
            self.id,
            device,
            count(session.generator_vs()),
            count(session.discriminator_vs())
        );
        Ok(session)
    }
}

fn count(vs: &tch::nn::VarStore) -> i64 {
    vs.trainable_variables().iter().map(|t| t.numel() as i64).sum()
}

pub struct Registry {
    entries: BTreeMap<&'static str, ModelEntry>,
}

impl Registry {
    pub fn empty() -> Registry {
        Registry { entries: BTreeMap::new() }
    }

    pub fn builtin() -> Registry {
        let mut registry = Registry::empty();
        registry.register(ModelEntry { id: "gan", dataset: DatasetKind::Mnist, defaults: gan_defaults, build: build_gan });
        registry.register(ModelEntry { id: "dcgan", dataset: DatasetKind::Mnist, defaults: dcgan_defaults, build: build_dcgan });
        registry.register(ModelEntry { id: "cdcgan", dataset: DatasetKind::Mnist, defaults: dcgan_defaults, build: build_cdcgan });
        registry.register(ModelEntry { id: "wgan", dataset: DatasetKind::Mnist, defaults: wgan_defaults, build: build_wgan });
        registry.register(ModelEntry { id: "pix2pix", dataset: DatasetKind::Paired, defaults: pix2pix_defaults, build: build_pix2pix });
        registry.register(ModelEntry {
            id: "pix2pix-vgg",
            dataset: DatasetKind::Paired,
            defaults: pix2pix_defaults,
            build: build_pix2pix_vgg,
        });
        registry
    }

    pub fn register(&mut self, entry: ModelEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Result<&ModelEntry> {
        self.entries.get(name).ok_or_else(|| Error::UnknownModel {
            name: name.to_string(),
            known: self.names().join(", "),
        })
    }

    /// Checks every job against the registry before any training starts.
    pub fn validate(&self, jobs: &[JobSpec]) -> Result<()> {
        for job in jobs {
            job.validate()?;
            self.get(&job.model_name)?.hyperparams(job)?;
        }
        Ok(())
    }
}

fn gan_defaults() -> Hyperparams {
    Hyperparams { learning_rate: 0.002, grid_size: 5, animate: true, ..Hyperparams::default() }
}

fn dcgan_defaults() -> Hyperparams {
    Hyperparams::default()
}

fn wgan_defaults() -> Hyperparams {
    Hyperparams { train_ratio: 5, ..Hyperparams::default() }
}

fn pix2pix_defaults() -> Hyperparams {
    Hyperparams { batch_size: 4, grid_size: 2, l1_weight: 100.0, print_every: 10, ..Hyperparams::default() }
}

fn build_gan(params: &Hyperparams, device: Device) -> Result<Session> {
    let policy = Policy { loss: AdversarialLoss::CrossEntropyOnProbabilities, ..Policy::cross_entropy(params.learning_rate) };
    let z = params.z_dim;
    Session::build(device, policy, |g, d| {
        let dim_image = MNIST_SHAPE.iter().product();
        Ok(Box::new(VanillaGan {
            generator: MlpGenerator::new(g, z, MLP_HIDDEN, MNIST_SHAPE),
            discriminator: MlpDiscriminator::new(d, dim_image, MLP_HIDDEN),
            dim_latent: z,
        }) as Box<dyn Networks>)
    })
}

fn dc_networks(params: &Hyperparams, classes: i64, label: &'static str) -> impl FnOnce(tch::nn::Path, tch::nn::Path) -> Result<Box<dyn Networks>> {
    let generator = DcGeneratorConfig {
        dim_latent: params.z_dim,
        dim_condition: classes,
        filters: params.base_filters * 8,
        channels: MNIST_SHAPE[0],
    };
    let discriminator = DcDiscriminatorConfig {
        channels: MNIST_SHAPE[0],
        image_size: MNIST_SHAPE[1],
        dim_condition: classes,
        filters: params.base_filters,
    };
    move |g, d| {
        Ok(Box::new(DcGan {
            generator: DcGenerator::new(g, generator),
            discriminator: DcDiscriminator::new(d, discriminator),
            label,
        }) as Box<dyn Networks>)
    }
}

fn build_dcgan(params: &Hyperparams, device: Device) -> Result<Session> {
    Session::build(device, Policy::cross_entropy(params.learning_rate), dc_networks(params, 0, "dcgan"))
}

fn build_cdcgan(params: &Hyperparams, device: Device) -> Result<Session> {
    Session::build(device, Policy::cross_entropy(params.learning_rate), dc_networks(params, MNIST_CLASSES, "cdcgan"))
}

fn build_wgan(params: &Hyperparams, device: Device) -> Result<Session> {
    let policy = Policy::wasserstein(params.learning_rate, params.train_ratio);
    Session::build(device, policy, dc_networks(params, 0, "wgan"))
}

fn pix2pix_policy(params: &Hyperparams) -> Result<Policy> {
    // Batch norm at the 1x1 bottleneck needs more than one value per channel.
    if params.batch_size < 2 {
        return Err(Error::config("pix2pix models need batch-size >= 2"));
    }
    Ok(Policy { reconstruction: params.l1_weight, ..Policy::cross_entropy(params.learning_rate) })
}

fn unet_config(params: &Hyperparams) -> UNetConfig {
    UNetConfig { filters: params.base_filters, ..UNetConfig::default() }
}

fn build_pix2pix(params: &Hyperparams, device: Device) -> Result<Session> {
    let policy = pix2pix_policy(params)?;
    let config = unet_config(params);
    let filters = params.base_filters;
    Session::build(device, policy, |g, d| {
        Ok(Box::new(Pix2Pix {
            generator: UNetGenerator::new(g, config)?,
            discriminator: PairCritic::Patch(PatchDiscriminator::new(d, config.output_channels, filters)),
        }) as Box<dyn Networks>)
    })
}

fn build_pix2pix_vgg(params: &Hyperparams, device: Device) -> Result<Session> {
    let policy = pix2pix_policy(params)?;
    let config = unet_config(params);
    let weights = PretrainedWeights::load(&params.vgg_weights, device)?;
    Session::build(device, policy, |g, d| {
        Ok(Box::new(Pix2Pix {
            generator: UNetGenerator::new(g, config)?,
            discriminator: PairCritic::Perceptual(PerceptualDiscriminator::new(d, &weights)?),
        }) as Box<dyn Networks>)
    })
}
