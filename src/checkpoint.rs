//! Atomic parameter snapshots.
//!
//! A checkpoint is the directory `<dir>/epoch-NNNN` holding both variable
//! stores and a JSON summary. It is assembled under `epoch-NNNN.partial` and
//! renamed into place once complete, so a reader either finds a whole
//! checkpoint or none.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ensure_dir;
use crate::error::{Error, Result};
use crate::loss::AdversarialLoss;
use crate::session::Session;

const GENERATOR_FILE: &str = "generator.ot";
const DISCRIMINATOR_FILE: &str = "discriminator.ot";
const META_FILE: &str = "meta.json";
const PREFIX: &str = "epoch-";
const PARTIAL: &str = ".partial";
const REPLACED: &str = ".old";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model: String,
    pub epoch: usize,
    pub step: u64,
    pub generator_updates: u64,
    pub discriminator_updates: u64,
    pub loss: AdversarialLoss,
}

pub fn save(session: &Session, dir: &Path, epoch: usize) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let name = format!("{PREFIX}{epoch:04}");
    let target = dir.join(&name);
    let partial = dir.join(format!("{name}{PARTIAL}"));
    let replaced = dir.join(format!("{name}{REPLACED}"));
    for stale in [&partial, &replaced] {
        if stale.exists() {
            fs::remove_dir_all(stale)?;
        }
    }
    ensure_dir(&partial)?;

    session.generator_vs().save(partial.join(GENERATOR_FILE))?;
    session.discriminator_vs().save(partial.join(DISCRIMINATOR_FILE))?;
    let meta = CheckpointMeta {
        model: session.networks().name().to_string(),
        epoch,
        step: session.steps(),
        generator_updates: session.generator_updates(),
        discriminator_updates: session.discriminator_updates(),
        loss: session.policy().loss,
    };
    fs::write(partial.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;

    // The previous snapshot of this epoch is only dropped once the new one is in place.
    let previous = target.exists();
    if previous {
        fs::rename(&target, &replaced)?;
    }
    fs::rename(&partial, &target)?;
    if previous {
        fs::remove_dir_all(&replaced)?;
    }
    info!("Saved checkpoint {}", target.display());
    Ok(target)
}

/// The completed checkpoint with the highest epoch in `dir`, if any.
pub fn latest(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let epoch: usize = name.strip_prefix(PREFIX)?.parse().ok()?;
            Some((epoch, entry.path()))
        })
        .max_by_key(|(epoch, _)| *epoch)
        .map(|(_, path)| path)
}

pub fn load_meta(checkpoint: &Path) -> Result<CheckpointMeta> {
    let path = checkpoint.join(META_FILE);
    let content = fs::read_to_string(&path).map_err(|e| Error::resource(&path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Loads both parameter sets of `checkpoint` into `session`.
pub fn restore(session: &mut Session, checkpoint: &Path) -> Result<CheckpointMeta> {
    let meta = load_meta(checkpoint)?;
    let model = session.networks().name();
    if meta.model != model {
        return Err(Error::config(format!("checkpoint {} belongs to {}, not {model}", checkpoint.display(), meta.model)));
    }
    session.generator_vs_mut().load(checkpoint.join(GENERATOR_FILE))?;
    session.discriminator_vs_mut().load(checkpoint.join(DISCRIMINATOR_FILE))?;
    info!("Restored {} from {} (epoch {})", model, checkpoint.display(), meta.epoch);
    Ok(meta)
}
