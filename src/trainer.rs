//! The epoch loop around a `Session`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tch::{Kind, Tensor};
use tqdm::tqdm;
use tracing::{debug, info};

use crate::checkpoint;
use crate::config::{ensure_dir, Hyperparams, JobSpec, Paths};
use crate::dataset::BatchSource;
use crate::error::{Error, Result};
use crate::model::{Batch, Conditioning};
use crate::session::Session;
use crate::visual::{save_grid, save_loss_curve, write_gif};

/// Delay between animation frames, in 1/100 s.
const FRAME_DELAY: u16 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossSample {
    pub step: u64,
    pub epoch: usize,
    pub discriminator: f64,
    pub generator: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LossHistory {
    samples: Vec<LossSample>,
}

impl LossHistory {
    pub fn push(&mut self, sample: LossSample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[LossSample] {
        &self.samples
    }

    pub fn discriminator(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.discriminator).collect()
    }

    pub fn generator(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.generator).collect()
    }

    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut out = String::from("step,epoch,discriminator,generator\n");
        for s in &self.samples {
            out.push_str(&format!("{},{},{},{}\n", s.step, s.epoch, s.discriminator, s.generator));
        }
        fs::write(path, out).map_err(|e| Error::resource(path, e))
    }
}

/// Inputs held fixed across epochs so the saved grids are comparable.
pub struct EvalInputs {
    pub latent: Option<Tensor>,
    pub condition: Option<Tensor>,
}

impl EvalInputs {
    /// `count` samples worth of noise plus the matching condition: labels
    /// cycling through the classes, or the first `count` source images of
    /// `source` for paired models.
    pub fn fix(session: &Session, source: Option<&mut (dyn BatchSource + '_)>, count: i64) -> Result<EvalInputs> {
        let device = session.device();
        let latent = session.sample_latent(count);
        let condition = match session.networks().conditioning() {
            Conditioning::None => None,
            Conditioning::Labels { classes } => {
                let labels = Tensor::arange(count, (Kind::Int64, device)).remainder(classes);
                Some(labels.one_hot(classes).to_kind(Kind::Float))
            }
            Conditioning::Paired => {
                let source = source.ok_or_else(|| Error::config("paired models need source images to sample from"))?;
                let raw = source.next_batch(count)?;
                let batch = Batch::prepare(&raw.images, &raw.labels, raw.sources.as_ref(), Conditioning::Paired)?;
                batch.condition.map(|c| c.to_device(device))
            }
        };
        Ok(EvalInputs { latent, condition })
    }
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: usize,
    /// Prefix of the artifact file names.
    pub dataset: String,
    pub params: Hyperparams,
    pub assets_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl TrainOptions {
    pub fn new(job: &JobSpec, params: Hyperparams, paths: &Paths) -> TrainOptions {
        TrainOptions {
            epochs: job.epochs,
            dataset: job.mnist_type.clone(),
            params,
            assets_dir: paths.assets(&job.model_name),
            checkpoint_dir: paths.checkpoints(&job.model_name),
        }
    }

    fn artifact(&self, suffix: &str) -> PathBuf {
        self.assets_dir.join(format!("{}-{suffix}", self.dataset))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub epochs: usize,
    pub steps: u64,
    pub generator_updates: u64,
    pub discriminator_updates: u64,
    pub checkpoint: Option<PathBuf>,
}

pub struct Trainer {
    options: TrainOptions,
    history: LossHistory,
    frames: Vec<Tensor>,
}

impl Trainer {
    pub fn new(options: TrainOptions) -> Trainer {
        Trainer { options, history: LossHistory::default(), frames: Vec::new() }
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// Runs every epoch of the job, then writes the loss curve, the raw loss
    /// samples and, when asked for, the grid animation.
    pub fn run(&mut self, session: &mut Session, source: &mut dyn BatchSource) -> Result<TrainSummary> {
        ensure_dir(&self.options.assets_dir)?;
        ensure_dir(&self.options.checkpoint_dir)?;

        let params = self.options.params.clone();
        let eval = EvalInputs::fix(session, Some(&mut *source), params.grid_size * params.grid_size)?;
        let conditioning = session.networks().conditioning();
        let steps_per_epoch = (source.num_examples() / params.batch_size).max(1);
        info!(
            "Training {} on {} for {} epochs ({} steps each, batch {})",
            session.networks().name(),
            self.options.dataset,
            self.options.epochs,
            steps_per_epoch,
            params.batch_size
        );

        let mut last_checkpoint = None;
        for epoch in 0..self.options.epochs {
            for _ in tqdm(0..steps_per_epoch).desc(Some(format!("epoch {}", epoch + 1))) {
                let raw = source.next_batch(params.batch_size)?;
                let batch = Batch::prepare(&raw.images, &raw.labels, raw.sources.as_ref(), conditioning)?
                    .to_device(session.device());
                let report = session.step(&batch)?;
                if (report.step + 1) % params.print_every == 0 {
                    let (discriminator, generator) = session.evaluate_losses(&batch)?;
                    info!("epoch {} step {}: d_loss {:.4} g_loss {:.4}", epoch + 1, report.step + 1, discriminator, generator);
                    self.history.push(LossSample { step: report.step + 1, epoch: epoch + 1, discriminator, generator });
                }
            }

            let completed = epoch + 1;
            if epoch == 0 || completed % params.save_every == 0 {
                let samples = session.sample(eval.latent.as_ref(), eval.condition.as_ref())?;
                let path = self.options.artifact(&format!("val-e{completed:03}.png"));
                let grid = save_grid(&samples, params.grid_size, &path)?;
                debug!("Saved {}", path.display());
                if params.animate {
                    self.frames.push(grid);
                }
            }
            if completed % params.checkpoint_every == 0 || completed == self.options.epochs {
                last_checkpoint = Some(checkpoint::save(session, &self.options.checkpoint_dir, completed)?);
            }
        }

        save_loss_curve(&self.history.discriminator(), &self.history.generator(), self.options.artifact("losses.png"))?;
        self.history.save_csv(&self.options.artifact("losses.csv"))?;
        if params.animate {
            write_gif(&self.frames, FRAME_DELAY, self.options.artifact("by-epochs.gif"))?;
        }

        let summary = TrainSummary {
            epochs: self.options.epochs,
            steps: session.steps(),
            generator_updates: session.generator_updates(),
            discriminator_updates: session.discriminator_updates(),
            checkpoint: last_checkpoint,
        };
        info!(
            "Finished {}: {} steps, {} generator / {} discriminator updates",
            session.networks().name(),
            summary.steps,
            summary.generator_updates,
            summary.discriminator_updates
        );
        Ok(summary)
    }
}
