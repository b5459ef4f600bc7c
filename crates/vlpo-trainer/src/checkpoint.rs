//! Epoch checkpoints and non-strict weight loading.
//!
//! Layout: `<output_dir>/epoch-<n>/pytorch_model.bin` holds the parameter map (MLX
//! safetensors encoding) and `training_state.json` the progress metadata. Writes are not
//! atomic; a directory left by an interrupted run must be treated as invalid.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlx_rs::module::ModuleParameters;
use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use vlpo_core::{Result, VlpoError};
use vlpo_distributed::DistributedContext;

use crate::engine::TrainingEngine;
use crate::model::ParameterMap;

/// Parameter file inside a checkpoint directory.
pub const WEIGHTS_FILE: &str = "pytorch_model.bin";

/// Progress file inside a checkpoint directory.
pub const STATE_FILE: &str = "training_state.json";

/// Training state metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epoch just completed.
    pub epoch: usize,
    /// Optimizer updates so far.
    pub step: usize,
    /// Running mean loss over the epoch.
    pub running_loss: f64,
    /// Learning rate at checkpoint.
    pub learning_rate: f64,
    /// Random seed used.
    pub seed: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: String,
}

impl TrainingState {
    /// Create new metadata for the current training state.
    pub fn new(epoch: usize, step: usize, running_loss: f64, learning_rate: f64) -> Self {
        Self {
            epoch,
            step,
            running_loss,
            learning_rate,
            seed: 0,
            timestamp: unix_timestamp(),
        }
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

/// `<output_dir>/epoch-<epoch>`.
pub fn epoch_dir(output_dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    output_dir.as_ref().join(format!("epoch-{epoch}"))
}

/// Write `params` and `state` into `dir`.
pub fn save_checkpoint(dir: &Path, params: &ParameterMap, state: &TrainingState) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| {
        VlpoError::Checkpoint(format!("failed to create {}: {e}", dir.display()))
    })?;

    let weights_path = dir.join(WEIGHTS_FILE);
    Array::save_safetensors(params.clone(), None, &weights_path)
        .map_err(|e| VlpoError::Checkpoint(format!("failed to save weights: {e}")))?;

    let state_json = serde_json::to_string_pretty(state)
        .map_err(|e| VlpoError::Serialization(e.to_string()))?;
    let state_path = dir.join(STATE_FILE);
    let mut file = File::create(&state_path).map_err(|e| {
        VlpoError::Checkpoint(format!("failed to create {}: {e}", state_path.display()))
    })?;
    file.write_all(state_json.as_bytes())
        .map_err(|e| VlpoError::Checkpoint(format!("failed to write training state: {e}")))?;

    tracing::info!("Saved checkpoint for epoch {} to {:?}", state.epoch, dir);
    Ok(weights_path)
}

/// Load a parameter map from a checkpoint directory or a weights file.
pub fn load_weights(path: impl AsRef<Path>) -> Result<ParameterMap> {
    let path = path.as_ref();
    let file = if path.is_dir() {
        path.join(WEIGHTS_FILE)
    } else {
        path.to_path_buf()
    };
    if !file.is_file() {
        return Err(VlpoError::Checkpoint(format!(
            "checkpoint not found: {}",
            file.display()
        )));
    }
    let params: HashMap<String, Array> = Array::load_safetensors(&file)
        .map_err(|e| VlpoError::Checkpoint(format!("failed to load {}: {e}", file.display())))?;
    Ok(params
        .into_iter()
        .map(|(k, v)| (Rc::from(k.as_str()), v))
        .collect())
}

/// Read `training_state.json` from a checkpoint directory.
pub fn load_training_state(dir: impl AsRef<Path>) -> Result<TrainingState> {
    let path = dir.as_ref().join(STATE_FILE);
    let content = fs::read_to_string(&path).map_err(|e| {
        VlpoError::Checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| VlpoError::Serialization(e.to_string()))
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys copied into the model.
    pub loaded: Vec<String>,
    /// Model parameters the checkpoint did not provide.
    pub missing: Vec<String>,
    /// Checkpoint keys the model does not have.
    pub unexpected: Vec<String>,
    /// Keys present on both sides with different shapes; left untouched.
    pub mismatched: Vec<String>,
}

impl LoadReport {
    /// Whether every model parameter was loaded and nothing was left over.
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    /// Log the report.
    pub fn log(&self, what: &str) {
        tracing::info!(
            "{}: loaded {} tensors ({} missing, {} unexpected, {} shape mismatches)",
            what,
            self.loaded.len(),
            self.missing.len(),
            self.unexpected.len(),
            self.mismatched.len()
        );
        if !self.missing.is_empty() {
            tracing::debug!("{what}: missing keys {:?}", self.missing);
        }
        if !self.unexpected.is_empty() {
            tracing::debug!("{what}: unexpected keys {:?}", self.unexpected);
        }
        if !self.mismatched.is_empty() {
            tracing::warn!("{what}: shape mismatches {:?}", self.mismatched);
        }
    }
}

/// Copy matching tensors into `model`, tolerating missing and extra keys.
pub fn load_non_strict<M: ModuleParameters>(model: &mut M, weights: ParameterMap) -> LoadReport {
    let mut params = model.parameters_mut().flatten();
    let mut report = LoadReport::default();
    let mut seen: HashSet<Rc<str>> = HashSet::new();

    for (key, value) in weights {
        match params.get_mut(&key) {
            Some(param) if param.shape() == value.shape() => {
                **param = value;
                report.loaded.push(key.to_string());
                seen.insert(key);
            }
            Some(_) => {
                report.mismatched.push(key.to_string());
                seen.insert(key);
            }
            None => report.unexpected.push(key.to_string()),
        }
    }
    report.missing = params
        .keys()
        .filter(|k| !seen.contains(*k))
        .map(|k| k.to_string())
        .collect();

    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    report.mismatched.sort();
    report
}

/// Save `engine`'s parameters for `state.epoch`.
///
/// With parameter partitioning every rank passes a barrier before rank 0 materializes the
/// checkpoint, and again afterwards. Otherwise rank 0 writes alone. Returns the weights
/// path on the writing rank.
pub async fn save_epoch_checkpoint(
    ctx: &DistributedContext,
    engine: &dyn TrainingEngine,
    output_dir: &Path,
    state: &TrainingState,
) -> Result<Option<PathBuf>> {
    let gather = engine.runtime_config().stage.partitions_parameters();
    let dir = epoch_dir(output_dir, state.epoch);

    if gather {
        ctx.barrier().await?;
    }
    let written = if ctx.is_master() {
        Some(save_checkpoint(&dir, &engine.state_dict(), state)?)
    } else {
        None
    };
    if gather {
        ctx.barrier().await?;
    }
    Ok(written)
}
