//! Checkpoint save/load.
//!
//! A checkpoint for iteration `i` is a pair of files in the checkpoint
//! directory:
//!
//! - `{i:06}.safetensors`: every array, namespaced by prefix (`g.`, `d.`,
//!   `g_ema.`, `g_optim.`, `d_optim.`)
//! - `{i:06}.json`: [`CheckpointMetadata`]
//!
//! Resuming takes the start iteration from the file stem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use stylekd_core::CompressConfig;
use stylekd_models::{
    inherit_style, load_weights, named_weights, read_safetensors, write_safetensors,
    ImageDiscriminator, ImageGenerator, StyleKeyFilter,
};

use crate::freeze::GanModels;
use crate::optim::RegularizedAdam;
use crate::{Result, TrainerError};

/// Student generator prefix.
pub const G_PREFIX: &str = "g.";
/// Student discriminator prefix.
pub const D_PREFIX: &str = "d.";
/// EMA generator prefix.
pub const G_EMA_PREFIX: &str = "g_ema.";
/// Generator optimizer prefix.
pub const G_OPTIM_PREFIX: &str = "g_optim.";
/// Discriminator optimizer prefix.
pub const D_OPTIM_PREFIX: &str = "d_optim.";

/// Scalar training state stored next to the arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Iteration the checkpoint was taken at.
    pub iteration: usize,
    /// Augmentation probability at that iteration.
    pub ada_aug_p: f32,
    /// Running mean path length.
    #[serde(default)]
    pub mean_path_length: f32,
    /// Resolved configuration of the run.
    pub config: CompressConfig,
    /// Wall-clock time of the save (RFC 3339).
    pub timestamp: String,
    /// Style-key filter version used for inheritance.
    #[serde(default)]
    pub style_filter_version: u32,
}

impl CheckpointMetadata {
    /// Metadata stamped with the current time.
    pub fn new(iteration: usize, ada_aug_p: f32, config: &CompressConfig) -> Self {
        Self {
            iteration,
            ada_aug_p,
            mean_path_length: 0.0,
            config: config.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            style_filter_version: StyleKeyFilter::default().version,
        }
    }

    /// Set the running mean path length.
    pub fn with_mean_path_length(mut self, value: f32) -> Self {
        self.mean_path_length = value;
        self
    }
}

/// Writes checkpoints into one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
}

impl CheckpointManager {
    /// Create the manager, creating the directory if needed.
    pub fn new(checkpoint_dir: impl AsRef<Path>) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self { checkpoint_dir })
    }

    /// Directory checkpoints are written to.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Array file for `iteration`.
    pub fn weights_path(&self, iteration: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("{iteration:06}.safetensors"))
    }

    /// Save the student networks, both optimizers and `metadata`.
    pub fn save<G, D>(
        &self,
        models: &GanModels<G, D>,
        g_optim: &RegularizedAdam,
        d_optim: &RegularizedAdam,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf>
    where
        G: ImageGenerator,
        D: ImageDiscriminator,
    {
        let mut arrays: HashMap<String, Array> = HashMap::new();
        arrays.extend(named_weights(&models.generator, G_PREFIX));
        arrays.extend(named_weights(&models.discriminator, D_PREFIX));
        arrays.extend(named_weights(&models.g_ema, G_EMA_PREFIX));
        arrays.extend(g_optim.state_dict(G_OPTIM_PREFIX));
        arrays.extend(d_optim.state_dict(D_OPTIM_PREFIX));
        let count = arrays.len();

        let weights_path = self.weights_path(metadata.iteration);
        write_safetensors(arrays, &weights_path)?;
        std::fs::write(
            weights_path.with_extension("json"),
            serde_json::to_string_pretty(metadata)?,
        )?;

        tracing::info!(
            iteration = metadata.iteration,
            arrays = count,
            path = %weights_path.display(),
            "saved checkpoint"
        );
        Ok(weights_path)
    }
}

/// Iteration encoded in a checkpoint file stem, or 0 if it is not a number.
pub fn parse_resume_iteration(path: impl AsRef<Path>) -> usize {
    let path = path.as_ref();
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    match stem.parse::<usize>() {
        Ok(iteration) => iteration,
        Err(_) => {
            tracing::warn!(path = %path.display(), "checkpoint name is not an iteration, starting at 0");
            0
        }
    }
}

/// Restore the student networks and optimizers from a checkpoint.
///
/// Weights are loaded strictly. Returns the sidecar metadata when present.
pub fn load_checkpoint<G, D>(
    path: impl AsRef<Path>,
    models: &mut GanModels<G, D>,
    g_optim: &mut RegularizedAdam,
    d_optim: &mut RegularizedAdam,
) -> Result<Option<CheckpointMetadata>>
where
    G: ImageGenerator,
    D: ImageDiscriminator,
{
    let weights_path = path.as_ref().with_extension("safetensors");
    let arrays = read_safetensors(&weights_path)?;

    load_weights(&mut models.generator, &arrays, G_PREFIX, true)?;
    load_weights(&mut models.discriminator, &arrays, D_PREFIX, true)?;
    load_weights(&mut models.g_ema, &arrays, G_EMA_PREFIX, true)?;
    g_optim.load_state_dict(&arrays, G_OPTIM_PREFIX)?;
    d_optim.load_state_dict(&arrays, D_OPTIM_PREFIX)?;

    let metadata_path = weights_path.with_extension("json");
    let metadata = if metadata_path.exists() {
        let content = std::fs::read_to_string(&metadata_path)?;
        Some(serde_json::from_str::<CheckpointMetadata>(&content)?)
    } else {
        tracing::warn!(path = %metadata_path.display(), "checkpoint has no metadata");
        None
    };

    tracing::info!(path = %weights_path.display(), "loaded student checkpoint");
    Ok(metadata)
}

/// Load the teacher generator from `g.` and optionally seed the student's
/// style network from it.
///
/// With `inherit`, the student generator takes the style parameters under
/// `g.` and the EMA generator those under `g_ema.`, non-strictly.
pub fn load_teacher<G, D>(
    path: impl AsRef<Path>,
    models: &mut GanModels<G, D>,
    inherit: bool,
    filter: StyleKeyFilter,
) -> Result<()>
where
    G: ImageGenerator,
    D: ImageDiscriminator,
{
    let path = path.as_ref();
    let arrays = read_safetensors(path)?;
    let report = load_weights(&mut models.teacher, &arrays, G_PREFIX, false)?;
    if report.loaded.is_empty() {
        return Err(TrainerError::Checkpoint(format!(
            "{} holds no teacher generator weights under {G_PREFIX}",
            path.display()
        )));
    }
    tracing::info!(
        path = %path.display(),
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        mismatched = report.mismatched.len(),
        "loaded teacher generator"
    );

    if inherit {
        inherit_style(&mut models.generator, &arrays, G_PREFIX, filter)?;
        inherit_style(&mut models.g_ema, &arrays, G_EMA_PREFIX, filter)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resume_iteration() {
        assert_eq!(parse_resume_iteration("expr/checkpoints/010000.safetensors"), 10_000);
        assert_eq!(parse_resume_iteration("000042.json"), 42);
        assert_eq!(parse_resume_iteration("/ckpt/latest.safetensors"), 0);
        assert_eq!(parse_resume_iteration(""), 0);
    }

    #[test]
    fn test_weights_path_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
        assert!(manager.checkpoint_dir().exists());
        assert!(manager
            .weights_path(20_000)
            .ends_with("checkpoints/020000.safetensors"));
    }

    #[test]
    fn test_metadata_json_round_trip() {
        let meta = CheckpointMetadata::new(7, 0.25, &CompressConfig::default()).with_mean_path_length(0.5);
        let json = serde_json::to_string(&meta).unwrap();
        let back: CheckpointMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
