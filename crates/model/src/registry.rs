//! Model registry access and the `from_pretrained` entry point

use std::path::{Path, PathBuf};

use crate::config::{FalconConfig, RuntimeArgs};
use crate::convert::{pt_to_flax, ConvertOptions};
use crate::error::{ModelError, Result};
use crate::loader::SafetensorsLoader;
use crate::params::{FlatParams, NestedParams};
use crate::tensor::Device;

/// Source of pretrained configurations and PyTorch state dicts
pub trait ModelRegistry {
    fn load_config(&self, model_id: &str) -> Result<FalconConfig>;

    fn load_state_dict(&self, model_id: &str, device: Device) -> Result<FlatParams>;
}

/// Registry backed by a local directory tree, one checkpoint directory per
/// model id (`<root>/tiiuae/falcon-7b/`)
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory holding the checkpoint for `model_id`
    pub fn model_dir(&self, model_id: &str) -> Result<PathBuf> {
        if model_id.is_empty() || model_id.split('/').any(|s| s.is_empty() || s == "..") {
            return Err(ModelError::ModelNotFound(format!("invalid model id: {:?}", model_id)));
        }
        let dir = self.root.join(model_id);
        if !dir.is_dir() {
            return Err(ModelError::ModelNotFound(dir.display().to_string()));
        }
        Ok(dir)
    }
}

impl ModelRegistry for LocalRegistry {
    fn load_config(&self, model_id: &str) -> Result<FalconConfig> {
        FalconConfig::from_json_file(self.model_dir(model_id)?.join("config.json"))
    }

    fn load_state_dict(&self, model_id: &str, device: Device) -> Result<FlatParams> {
        SafetensorsLoader::from_directory(self.model_dir(model_id)?)?.load_flat_params(device)
    }
}

/// Fetch a pretrained Falcon checkpoint and convert it for the Flax runtime.
///
/// Returns the parameter tree together with the configuration, augmented
/// with `runtime` flags for the Flax model constructor.
pub fn from_pretrained<R: ModelRegistry + ?Sized>(
    registry: &R,
    model_id: &str,
    options: &ConvertOptions,
    runtime: RuntimeArgs,
) -> Result<(NestedParams, FalconConfig)> {
    let mut config = registry.load_config(model_id)?;
    config.validate()?;
    tracing::info!(
        model = model_id,
        layers = config.num_hidden_layers,
        hidden_size = config.hidden_size,
        "Loaded model config"
    );

    let state_dict = registry.load_state_dict(model_id, options.device)?;
    let params = pt_to_flax(&state_dict, config.num_hidden_layers, options)?;

    config.add_runtime_args(runtime)?;
    Ok((params, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_traversal() {
        let registry = LocalRegistry::new("/tmp");
        assert!(registry.model_dir("../etc").is_err());
        assert!(registry.model_dir("").is_err());
        assert!(registry.model_dir("tiiuae//falcon").is_err());
    }

    #[test]
    fn test_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(dir.path());
        let err = registry.load_config("tiiuae/falcon-7b").unwrap_err();
        assert!(matches!(err, ModelError::ModelNotFound(_)));
    }
}
