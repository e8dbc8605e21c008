//! Adversarial objectives and the update policy between the two networks.

use serde::{Deserialize, Serialize};
use tch::{nn, nn::OptimizerConfig, Kind, Reduction, Tensor};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdversarialLoss {
    /// Binary cross-entropy on raw logits.
    CrossEntropy,
    /// Binary cross-entropy on scores that already went through a sigmoid.
    CrossEntropyOnProbabilities,
    /// Critic loss of the Wasserstein GAN.
    Wasserstein,
}

impl AdversarialLoss {
    fn bce(&self, scores: &Tensor, label: f64) -> Tensor {
        let targets = Tensor::full_like(scores, label);
        match self {
            AdversarialLoss::CrossEntropyOnProbabilities => {
                scores.binary_cross_entropy::<Tensor>(&targets, None, Reduction::Mean)
            }
            _ => scores.binary_cross_entropy_with_logits::<Tensor>(&targets, None, None, Reduction::Mean),
        }
    }

    pub fn discriminator_loss(&self, real: &Tensor, fake: &Tensor) -> Tensor {
        match self {
            AdversarialLoss::Wasserstein => fake.mean(Kind::Float) - real.mean(Kind::Float),
            _ => self.bce(real, 1.0) + self.bce(fake, 0.0),
        }
    }

    /// Non-saturating generator objective: generated samples labelled real.
    pub fn generator_loss(&self, fake: &Tensor) -> Tensor {
        match self {
            AdversarialLoss::Wasserstein => -fake.mean(Kind::Float),
            _ => self.bce(fake, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    Adam { beta1: f64, beta2: f64 },
    RmsProp { alpha: f64 },
}

impl OptimizerKind {
    pub fn adam_gan() -> OptimizerKind {
        OptimizerKind::Adam { beta1: 0.5, beta2: 0.999 }
    }

    pub fn build(&self, vs: &nn::VarStore, lr: f64) -> Result<nn::Optimizer> {
        let opt = match *self {
            OptimizerKind::Adam { beta1, beta2 } => nn::adam(beta1, beta2, 0.).build(vs, lr)?,
            OptimizerKind::RmsProp { alpha } => nn::RmsProp { alpha, eps: 1e-10, wd: 0., momentum: 0., centered: false }
                .build(vs, lr)?,
        };
        Ok(opt)
    }
}

/// The generator is updated on zero-based step `s` when `(s + 1) % every == 0`,
/// i.e. `floor(M / every)` times over `M` steps. The discriminator is updated
/// on every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSchedule {
    pub generator_every: u64,
}

impl UpdateSchedule {
    pub fn every_step() -> UpdateSchedule {
        UpdateSchedule { generator_every: 1 }
    }

    pub fn generator_due(&self, step: u64) -> bool {
        (step + 1) % self.generator_every.max(1) == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub loss: AdversarialLoss,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub schedule: UpdateSchedule,
    /// Symmetric bound applied to every discriminator parameter after each update.
    pub clip: Option<f64>,
    /// Weight of the L1 distance between generated and target images.
    pub reconstruction: f64,
}

impl Policy {
    pub fn cross_entropy(learning_rate: f64) -> Policy {
        Policy {
            loss: AdversarialLoss::CrossEntropy,
            optimizer: OptimizerKind::adam_gan(),
            learning_rate,
            schedule: UpdateSchedule::every_step(),
            clip: None,
            reconstruction: 0.0,
        }
    }

    pub fn wasserstein(learning_rate: f64, critic_steps: u64) -> Policy {
        Policy {
            loss: AdversarialLoss::Wasserstein,
            optimizer: OptimizerKind::RmsProp { alpha: 0.9 },
            learning_rate,
            schedule: UpdateSchedule { generator_every: critic_steps },
            clip: Some(0.01),
            reconstruction: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn scalar(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    #[test]
    fn cross_entropy_rewards_a_confident_discriminator() {
        let real = Tensor::full([4, 1], 10.0, (Kind::Float, Device::Cpu));
        let fake = Tensor::full([4, 1], -10.0, (Kind::Float, Device::Cpu));
        let loss = AdversarialLoss::CrossEntropy;
        assert!(scalar(&loss.discriminator_loss(&real, &fake)) < 0.01);
        assert!(scalar(&loss.generator_loss(&fake)) > 5.0);
    }

    #[test]
    fn probability_and_logit_forms_agree() {
        let logits = Tensor::from_slice(&[0.3f32, -1.2, 2.0]).view([3, 1]);
        let a = AdversarialLoss::CrossEntropy.generator_loss(&logits);
        let b = AdversarialLoss::CrossEntropyOnProbabilities.generator_loss(&logits.sigmoid());
        assert!((scalar(&a) - scalar(&b)).abs() < 1e-5);
    }

    #[test]
    fn wasserstein_is_a_mean_difference() {
        let real = Tensor::from_slice(&[1.0f32, 3.0]);
        let fake = Tensor::from_slice(&[0.5f32, 0.5]);
        let loss = AdversarialLoss::Wasserstein;
        assert!((scalar(&loss.discriminator_loss(&real, &fake)) - (0.5 - 2.0)).abs() < 1e-6);
        assert!((scalar(&loss.generator_loss(&fake)) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn patch_grids_are_averaged() {
        let grid = Tensor::zeros([2, 1, 5, 5], (Kind::Float, Device::Cpu));
        let loss = AdversarialLoss::CrossEntropy.generator_loss(&grid);
        assert!((scalar(&loss) - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn schedule_counts_generator_updates() {
        let schedule = UpdateSchedule { generator_every: 5 };
        let updates = (0..20).filter(|&s| schedule.generator_due(s)).count();
        assert_eq!(updates, 4);
        assert!(!schedule.generator_due(0));
        assert!(schedule.generator_due(4));
        assert_eq!((0..7).filter(|&s| UpdateSchedule::every_step().generator_due(s)).count(), 7);
    }
}
