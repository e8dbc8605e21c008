use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tch::Device;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use gans_rs::checkpoint;
use gans_rs::dataset::{BatchSource, PairedImageSource, TensorSource};
use gans_rs::model::Conditioning;
use gans_rs::trainer::EvalInputs;
use gans_rs::unet::UNetConfig;
use gans_rs::visual::{image_grid, interpolate, save_grid, write_gif};
use gans_rs::{load_jobs, DatasetKind, Hyperparams, Paths, Registry, Session, TrainOptions, Trainer};

#[derive(Parser, Debug)]
#[command(version, about = "GANs via Rust.", long_about = None)]
struct Cli {
    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// auto, cpu, cuda or cuda:N
    #[arg(long, global = true, default_value = "auto")]
    device: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Dirs {
    #[arg(long, default_value = "./data_set")]
    data_dir: PathBuf,
    #[arg(long, default_value = "./assets")]
    assets_dir: PathBuf,
    #[arg(long, default_value = "./checkpoints")]
    checkpoint_dir: PathBuf,
}

impl From<Dirs> for Paths {
    fn from(dirs: Dirs) -> Paths {
        Paths { data_dir: dirs.data_dir, assets_dir: dirs.assets_dir, checkpoint_dir: dirs.checkpoint_dir }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train every job listed in a params file, in order.
    Train {
        #[arg(short, long, default_value = "params.json")]
        params: PathBuf,
        #[command(flatten)]
        dirs: Dirs,
    },
    /// Write sample grids from the latest checkpoint of a model.
    Generate {
        model: String,
        /// Params file to take the model's hyperparameters from.
        #[arg(short, long)]
        params: Option<PathBuf>,
        /// Dataset holding the source images of paired models.
        #[arg(long)]
        dataset: Option<String>,
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        #[command(flatten)]
        dirs: Dirs,
    },
    /// Animate a walk between two latent batches of a model.
    Morph {
        model: String,
        #[arg(short, long)]
        params: Option<PathBuf>,
        #[arg(long, default_value_t = 100)]
        frames: usize,
        #[command(flatten)]
        dirs: Dirs,
    },
    /// Print the licenses of the libraries this tool is built on.
    Licenses,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => bail!("Invalid log level: {other}"),
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = parse_device(&cli.device)?;
    info!("Use Device: {device:?}");

    let registry = Registry::builtin();
    match cli.command {
        Commands::Train { params, dirs } => train(&registry, &params, dirs.into(), device),
        Commands::Generate { model, params, dataset, count, dirs } => {
            let paths = Paths::from(dirs);
            let (session, params, dataset_name) = restore(&registry, &model, params.as_deref(), &paths, device)?;
            let kind = registry.get(&model)?.dataset;
            let dataset_name = dataset.unwrap_or(dataset_name);
            let mut source = match kind {
                DatasetKind::Paired => Some(open_source(kind, &paths.data_dir.join(&dataset_name))?),
                DatasetKind::Mnist => None,
            };
            let assets = paths.assets(&model);
            gans_rs::config::ensure_dir(&assets)?;
            for i in 0..count {
                let eval = EvalInputs::fix(&session, source.as_deref_mut(), params.grid_size * params.grid_size)?;
                let samples = session.sample(eval.latent.as_ref(), eval.condition.as_ref())?;
                let path = assets.join(format!("generate-{}.png", i + 1));
                save_grid(&samples, params.grid_size, &path)?;
                info!("Generated {}", path.display());
            }
            Ok(())
        }
        Commands::Morph { model, params, frames, dirs } => {
            let paths = Paths::from(dirs);
            let (session, params, _) = restore(&registry, &model, params.as_deref(), &paths, device)?;
            if session.networks().conditioning() == Conditioning::Paired {
                bail!("{model} translates images and has no latent space to morph through");
            }
            let count = params.grid_size * params.grid_size;
            let start = EvalInputs::fix(&session, None, count)?;
            let (Some(from), Some(to)) = (start.latent.as_ref(), session.sample_latent(count)) else {
                bail!("{model} takes no latent input");
            };
            let images = interpolate(from, &to, frames)
                .iter()
                .map(|z| image_grid(&session.sample(Some(z), start.condition.as_ref())?, params.grid_size))
                .collect::<gans_rs::Result<Vec<_>>>()?;
            let assets = paths.assets(&model);
            gans_rs::config::ensure_dir(&assets)?;
            let path = assets.join("morphing.gif");
            write_gif(&images, 5, &path)?;
            info!("Generated {}", path.display());
            Ok(())
        }
        Commands::Licenses => {
            print_oss_license();
            Ok(())
        }
    }
}

fn train(registry: &Registry, params: &Path, paths: Paths, device: Device) -> Result<()> {
    let jobs = load_jobs(params)?;
    // Every record must resolve before the first job starts.
    registry.validate(&jobs)?;
    info!("Loaded {} training jobs from {}", jobs.len(), params.display());

    for (i, job) in jobs.iter().enumerate() {
        let entry = registry.get(&job.model_name)?;
        let hyperparams = entry.hyperparams(job)?;
        info!("Job {}/{}: {} on {} for {} epochs", i + 1, jobs.len(), job.model_name, job.mnist_type, job.epochs);

        let mut source = open_source(entry.dataset, &paths.dataset(job))?;
        let mut session = entry.instantiate(&hyperparams, device)?;
        let summary = Trainer::new(TrainOptions::new(job, hyperparams, &paths))
            .run(&mut session, source.as_mut())
            .with_context(|| format!("training {} failed", job.model_name))?;
        if let Some(checkpoint) = &summary.checkpoint {
            info!("{} saved to {}", job.model_name, checkpoint.display());
        }
    }
    Ok(())
}

fn open_source(kind: DatasetKind, dir: &Path) -> Result<Box<dyn BatchSource>> {
    Ok(match kind {
        DatasetKind::Mnist => Box::new(TensorSource::mnist(dir)?),
        DatasetKind::Paired => Box::new(PairedImageSource::open(dir, UNetConfig::default().resolution)?),
    })
}

/// Rebuilds `model` with the hyperparameters it was trained with and loads
/// its latest checkpoint.
fn restore(
    registry: &Registry,
    model: &str,
    params: Option<&Path>,
    paths: &Paths,
    device: Device,
) -> Result<(Session, Hyperparams, String)> {
    let entry = registry.get(model)?;
    let (hyperparams, dataset) = match params {
        Some(file) => {
            let jobs = load_jobs(file)?;
            let Some(job) = jobs.iter().find(|job| job.model_name == model) else {
                bail!("{} has no job for {model}", file.display());
            };
            (entry.hyperparams(job)?, job.mnist_type.clone())
        }
        None => ((entry.defaults)(), "digits".to_string()),
    };

    let dir = paths.checkpoints(model);
    let Some(latest) = checkpoint::latest(&dir) else {
        bail!("No checkpoint of {model} in {}. Train it first.", dir.display());
    };
    let mut session = entry.instantiate(&hyperparams, device)?;
    checkpoint::restore(&mut session, &latest)?;
    Ok((session, hyperparams, dataset))
}

fn parse_device(name: &str) -> Result<Device> {
    Ok(match name {
        "auto" => Device::cuda_if_available(),
        "cpu" => Device::Cpu,
        "cuda" => Device::Cuda(0),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(index)) => Device::Cuda(index),
            _ => bail!("Invalid device: {other}"),
        },
    })
}

fn print_oss_license() {
    let libraries = [
        ("PyTorch", "https://github.com/pytorch/pytorch", "3-Clause BSD License"),
        ("tch-rs", "https://github.com/LaurentMazare/tch-rs", "MIT License"),
        ("anyhow", "https://github.com/dtolnay/anyhow", "MIT OR Apache-2.0"),
        ("thiserror", "https://github.com/dtolnay/thiserror", "MIT OR Apache-2.0"),
        ("serde", "https://github.com/serde-rs/serde", "MIT OR Apache-2.0"),
        ("serde_json", "https://github.com/serde-rs/json", "MIT OR Apache-2.0"),
        ("tracing", "https://github.com/tokio-rs/tracing", "MIT License"),
        ("rand", "https://github.com/rust-random/rand", "MIT OR Apache-2.0"),
        ("gif", "https://github.com/image-rs/image-gif", "MIT OR Apache-2.0"),
        ("tqdm", "https://github.com/mrlazy1708/tqdm", "MIT OR Apache-2.0"),
        ("clap", "https://github.com/clap-rs/clap", "MIT OR Apache-2.0"),
    ];
    for (name, url, license) in libraries {
        println!("OSS Library: {name}");
        println!("URL: {url}");
        println!("License: {license}");
        println!();
    }
}
