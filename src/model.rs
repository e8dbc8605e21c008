//! Generator/discriminator pairings for each model variant.

use tch::{Kind, Tensor};

use crate::discriminator::{DcDiscriminator, MlpDiscriminator, PatchDiscriminator};
use crate::error::{Error, Result};
use crate::generator::{DcGenerator, MlpGenerator};
use crate::perceptual::PerceptualDiscriminator;
use crate::unet::UNetGenerator;

/// What travels alongside the real samples of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditioning {
    None,
    /// One-hot class labels.
    Labels { classes: i64 },
    /// A source image the generator translates into the target domain.
    Paired,
}

/// One batch prepared for the networks: values in [-1, 1], NCHW.
#[derive(Debug)]
pub struct Batch {
    pub real: Tensor,
    pub condition: Option<Tensor>,
}

impl Batch {
    pub fn size(&self) -> i64 {
        self.real.size()[0]
    }

    /// Rescales dataset images from [0, 1] to [-1, 1] and builds the
    /// condition the networks expect.
    pub fn prepare(images: &Tensor, labels: &Tensor, paired: Option<&Tensor>, conditioning: Conditioning) -> Result<Batch> {
        let real = images.to_kind(Kind::Float) * 2.0 - 1.0;
        let condition = match conditioning {
            Conditioning::None => None,
            Conditioning::Labels { classes } => Some(labels.to_kind(Kind::Int64).one_hot(classes).to_kind(Kind::Float)),
            Conditioning::Paired => {
                let source = paired.ok_or_else(|| Error::shape("batch", "paired model needs source images"))?;
                Some(source.to_kind(Kind::Float) * 2.0 - 1.0)
            }
        };
        Ok(Batch { real, condition })
    }

    pub fn to_device(&self, device: tch::Device) -> Batch {
        Batch {
            real: self.real.to_device(device),
            condition: self.condition.as_ref().map(|c| c.to_device(device)),
        }
    }
}

/// A generator and the discriminator that judges it.
///
/// Implementations own only the layers; parameters live in the two
/// `VarStore`s of the `Session` that built them.
pub trait Networks {
    fn name(&self) -> &'static str;

    fn conditioning(&self) -> Conditioning;

    /// Shape of the noise fed to the generator for a batch of `batch` samples,
    /// `None` when the generator is driven by its condition alone.
    fn latent_shape(&self, batch: i64) -> Option<Vec<i64>>;

    fn generate(&self, latent: Option<&Tensor>, condition: Option<&Tensor>, train: bool) -> Result<Tensor>;

    fn score(&self, sample: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<Tensor>;
}

fn require<'a>(what: &str, t: Option<&'a Tensor>) -> Result<&'a Tensor> {
    t.ok_or_else(|| Error::shape(what.to_string(), "missing input"))
}

pub struct VanillaGan {
    pub generator: MlpGenerator,
    pub discriminator: MlpDiscriminator,
    pub dim_latent: i64,
}

impl Networks for VanillaGan {
    fn name(&self) -> &'static str {
        "gan"
    }

    fn conditioning(&self) -> Conditioning {
        Conditioning::None
    }

    fn latent_shape(&self, batch: i64) -> Option<Vec<i64>> {
        Some(vec![batch, self.dim_latent])
    }

    fn generate(&self, latent: Option<&Tensor>, _condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        Ok(require("generator latent", latent)?.apply_t(&self.generator, train))
    }

    fn score(&self, sample: &Tensor, _condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        Ok(sample.apply_t(&self.discriminator, train))
    }
}

/// Deep convolutional pair used by DCGAN, conditional DCGAN and WGAN.
pub struct DcGan {
    pub generator: DcGenerator,
    pub discriminator: DcDiscriminator,
    pub label: &'static str,
}

impl Networks for DcGan {
    fn name(&self) -> &'static str {
        self.label
    }

    fn conditioning(&self) -> Conditioning {
        match self.generator.config().dim_condition {
            0 => Conditioning::None,
            classes => Conditioning::Labels { classes },
        }
    }

    fn latent_shape(&self, batch: i64) -> Option<Vec<i64>> {
        Some(vec![batch, self.generator.config().dim_latent])
    }

    fn generate(&self, latent: Option<&Tensor>, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        self.generator.generate(require("generator latent", latent)?, condition, train)
    }

    fn score(&self, sample: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        self.discriminator.score(sample, condition, train)
    }
}

pub enum PairCritic {
    Patch(PatchDiscriminator),
    Perceptual(PerceptualDiscriminator),
}

/// Paired image translation: the condition is the source image, the sample
/// is the translated (or real target) image. The generator sees the source
/// concatenated with a noise image.
pub struct Pix2Pix {
    pub generator: UNetGenerator,
    pub discriminator: PairCritic,
}

impl Networks for Pix2Pix {
    fn name(&self) -> &'static str {
        match self.discriminator {
            PairCritic::Patch(_) => "pix2pix",
            PairCritic::Perceptual(_) => "pix2pix-vgg",
        }
    }

    fn conditioning(&self) -> Conditioning {
        Conditioning::Paired
    }

    /// A noise image stacked onto the source, absent when the generator
    /// takes the source alone.
    fn latent_shape(&self, batch: i64) -> Option<Vec<i64>> {
        let config = self.generator.config();
        (config.condition_channels > 0)
            .then(|| vec![batch, config.condition_channels, config.resolution, config.resolution])
    }

    fn generate(&self, latent: Option<&Tensor>, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let source = require("generator source image", condition)?;
        self.generator.generate(source, latent, train)
    }

    fn score(&self, sample: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let source = require("discriminator source image", condition)?;
        match &self.discriminator {
            PairCritic::Patch(d) => d.score(source, sample, train),
            PairCritic::Perceptual(d) => d.score(source, sample, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn prepare_rescales_and_encodes_labels() {
        let images = Tensor::from_slice(&[0.0f32, 0.5, 1.0, 1.0]).view([1, 1, 2, 2]);
        let labels = Tensor::from_slice(&[3i64]);
        let batch = Batch::prepare(&images, &labels, None, Conditioning::Labels { classes: 10 }).unwrap();
        let values: Vec<f32> = Vec::<f32>::try_from(batch.real.flatten(0, -1)).unwrap();
        assert_eq!(values, vec![-1.0, 0.0, 1.0, 1.0]);
        let condition = batch.condition.unwrap();
        assert_eq!(condition.size(), [1, 10]);
        assert_eq!(condition.double_value(&[0, 3]), 1.0);
        assert_eq!(condition.sum(Kind::Float).double_value(&[]), 1.0);
    }

    #[test]
    fn paired_batches_need_sources() {
        let images = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros([1], (Kind::Int64, Device::Cpu));
        assert!(Batch::prepare(&images, &labels, None, Conditioning::Paired).is_err());
        let batch = Batch::prepare(&images, &labels, Some(&images), Conditioning::Paired).unwrap();
        assert_eq!(batch.condition.unwrap().min().double_value(&[]), -1.0);
    }
}
