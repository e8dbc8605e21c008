//! Per-job training context.
//!
//! A `Session` owns everything one model instance needs: a `VarStore` per
//! network, the optimizer bound to each store, the networks themselves and
//! the step counters. Nothing is shared between sessions.

use tch::{nn, Device, Kind, Tensor};
use tracing::debug;

use crate::error::Result;
use crate::loss::Policy;
use crate::model::{Batch, Networks};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub discriminator_loss: f64,
    pub generator_loss: Option<f64>,
}

pub struct Session {
    device: Device,
    generator_vs: nn::VarStore,
    discriminator_vs: nn::VarStore,
    networks: Box<dyn Networks>,
    policy: Policy,
    generator_opt: nn::Optimizer,
    discriminator_opt: nn::Optimizer,
    step: u64,
    generator_updates: u64,
    discriminator_updates: u64,
}

impl Session {
    /// Creates both variable stores, lets `build` register the networks under
    /// them, then binds one optimizer to each store.
    pub fn build<F>(device: Device, policy: Policy, build: F) -> Result<Session>
    where
        F: FnOnce(nn::Path, nn::Path) -> Result<Box<dyn Networks>>,
    {
        let generator_vs = nn::VarStore::new(device);
        let discriminator_vs = nn::VarStore::new(device);
        let networks = build(generator_vs.root() / "generator", discriminator_vs.root() / "discriminator")?;

        let generator_opt = policy.optimizer.build(&generator_vs, policy.learning_rate)?;
        let discriminator_opt = policy.optimizer.build(&discriminator_vs, policy.learning_rate)?;
        debug!(
            "{}: {} generator / {} discriminator tensors",
            networks.name(),
            generator_vs.trainable_variables().len(),
            discriminator_vs.trainable_variables().len()
        );

        Ok(Session {
            device,
            generator_vs,
            discriminator_vs,
            networks,
            policy,
            generator_opt,
            discriminator_opt,
            step: 0,
            generator_updates: 0,
            discriminator_updates: 0,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn networks(&self) -> &dyn Networks {
        self.networks.as_ref()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn generator_vs(&self) -> &nn::VarStore {
        &self.generator_vs
    }

    pub fn discriminator_vs(&self) -> &nn::VarStore {
        &self.discriminator_vs
    }

    pub fn generator_vs_mut(&mut self) -> &mut nn::VarStore {
        &mut self.generator_vs
    }

    pub fn discriminator_vs_mut(&mut self) -> &mut nn::VarStore {
        &mut self.discriminator_vs
    }

    /// Number of completed batch steps.
    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn generator_updates(&self) -> u64 {
        self.generator_updates
    }

    pub fn discriminator_updates(&self) -> u64 {
        self.discriminator_updates
    }

    /// Uniform noise in [-1, 1) for `batch` samples.
    pub fn sample_latent(&self, batch: i64) -> Option<Tensor> {
        self.networks
            .latent_shape(batch)
            .map(|shape| Tensor::rand(shape.as_slice(), (Kind::Float, self.device)) * 2.0 - 1.0)
    }

    /// One discriminator update on a real batch and a freshly generated one.
    /// The generator store stays frozen throughout.
    pub fn discriminator_step(&mut self, batch: &Batch) -> Result<f64> {
        self.generator_vs.freeze();
        self.discriminator_vs.unfreeze();
        let result = self.discriminator_loss(batch);
        self.generator_vs.unfreeze();
        let loss = result?;

        self.discriminator_opt.backward_step(&loss);
        if let Some(bound) = self.policy.clip {
            self.clip_discriminator(bound);
        }
        self.discriminator_updates += 1;
        Ok(loss.double_value(&[]))
    }

    fn discriminator_loss(&self, batch: &Batch) -> Result<Tensor> {
        let condition = batch.condition.as_ref();
        let latent = self.sample_latent(batch.size());
        let fake = self.networks.generate(latent.as_ref(), condition, true)?.detach();
        let real_score = self.networks.score(&batch.real, condition, true)?;
        let fake_score = self.networks.score(&fake, condition, true)?;
        Ok(self.policy.loss.discriminator_loss(&real_score, &fake_score))
    }

    /// One generator update through the frozen discriminator.
    pub fn generator_step(&mut self, batch: &Batch) -> Result<f64> {
        self.discriminator_vs.freeze();
        self.generator_vs.unfreeze();
        let result = self.generator_loss(batch, true);
        self.discriminator_vs.unfreeze();
        let loss = result?;

        self.generator_opt.backward_step(&loss);
        self.generator_updates += 1;
        Ok(loss.double_value(&[]))
    }

    fn generator_loss(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let condition = batch.condition.as_ref();
        let latent = self.sample_latent(batch.size());
        let fake = self.networks.generate(latent.as_ref(), condition, train)?;
        let score = self.networks.score(&fake, condition, train)?;
        let loss = self.policy.loss.generator_loss(&score);
        if self.policy.reconstruction > 0.0 {
            let l1 = (&fake - &batch.real).abs().mean(Kind::Float);
            Ok(loss + l1 * self.policy.reconstruction)
        } else {
            Ok(loss)
        }
    }

    fn clip_discriminator(&mut self, bound: f64) {
        tch::no_grad(|| {
            for mut var in self.discriminator_vs.trainable_variables() {
                let _ = var.clamp_(-bound, bound);
            }
        });
    }

    /// Discriminator update, then a generator update when the schedule says so.
    pub fn step(&mut self, batch: &Batch) -> Result<StepReport> {
        let step = self.step;
        let discriminator_loss = self.discriminator_step(batch)?;
        let generator_loss = if self.policy.schedule.generator_due(step) {
            Some(self.generator_step(batch)?)
        } else {
            None
        };
        self.step += 1;
        Ok(StepReport { step, discriminator_loss, generator_loss })
    }

    /// Both losses on `batch` with the current parameters, without updating anything.
    pub fn evaluate_losses(&self, batch: &Batch) -> Result<(f64, f64)> {
        tch::no_grad(|| {
            let condition = batch.condition.as_ref();
            let latent = self.sample_latent(batch.size());
            let fake = self.networks.generate(latent.as_ref(), condition, false)?;
            let real_score = self.networks.score(&batch.real, condition, false)?;
            let fake_score = self.networks.score(&fake, condition, false)?;
            let d = self.policy.loss.discriminator_loss(&real_score, &fake_score);
            let g = self.generator_loss(batch, false)?;
            Ok((d.double_value(&[]), g.double_value(&[])))
        })
    }

    /// Generator output in evaluation mode.
    pub fn sample(&self, latent: Option<&Tensor>, condition: Option<&Tensor>) -> Result<Tensor> {
        tch::no_grad(|| self.networks.generate(latent, condition, false))
    }
}
