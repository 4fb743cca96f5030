//! Falcon model configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ModelError, Result};

/// Gradient checkpoint policies understood by the Flax runtime
pub const CHECKPOINT_POLICIES: &[&str] = &[
    "everything_saveable",
    "nothing_saveable",
    "dots_saveable",
    "checkpoint_dots",
    "dots_with_no_batch_dims_saveable",
    "checkpoint_dots_with_no_batch_dims",
];

/// Falcon configuration as found in a HuggingFace `config.json`.
///
/// Only the fields this crate reads are typed; everything else is kept in
/// `extra` and written back untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FalconConfig {
    /// Vocabulary size
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden size (embedding dimension)
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of decoder layers
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Number of key-value heads (new decoder architecture only)
    #[serde(default)]
    pub num_kv_heads: Option<usize>,

    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,

    /// Whether linear layers carry biases
    #[serde(default)]
    pub bias: bool,

    /// Attention and MLP read the same normalized input
    #[serde(default = "default_true")]
    pub parallel_attn: bool,

    #[serde(default)]
    pub new_decoder_architecture: bool,

    #[serde(default = "default_true")]
    pub multi_query: bool,

    #[serde(default)]
    pub alibi: bool,

    /// Flags added for the Flax runtime by [`FalconConfig::add_runtime_args`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeArgs>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_vocab_size() -> usize { 65024 }
fn default_hidden_size() -> usize { 4544 }
fn default_num_hidden_layers() -> usize { 32 }
fn default_num_attention_heads() -> usize { 71 }
fn default_layer_norm_epsilon() -> f64 { 1e-5 }
fn default_true() -> bool { true }

impl Default for FalconConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_kv_heads: None,
            layer_norm_epsilon: default_layer_norm_epsilon(),
            bias: false,
            parallel_attn: true,
            new_decoder_architecture: false,
            multi_query: true,
            alibi: false,
            runtime: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl FalconConfig {
    /// Load config from a JSON file (config.json from HuggingFace)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write the config, including any runtime flags, as pretty JSON
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Sequential-attention blocks carry a second layer norm before the MLP
    pub fn expects_post_attention_norm(&self) -> bool {
        !self.parallel_attn && !self.new_decoder_architecture
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_hidden_layers == 0 {
            return Err(ModelError::Config("num_hidden_layers must be non-zero".into()));
        }
        if self.num_attention_heads == 0 {
            return Err(ModelError::Config("num_attention_heads must be non-zero".into()));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::Config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    /// Attach the flags the Flax model constructor expects
    pub fn add_runtime_args(&mut self, args: RuntimeArgs) -> Result<()> {
        args.validate()?;
        self.runtime = Some(args);
        Ok(())
    }
}

/// Runtime-specific flags consumed by the Flax model constructor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeArgs {
    /// Gradient checkpoint policy name
    pub gradient_checkpointing: String,
    /// Device mesh shape; `-1` lets the runtime fill in the remainder
    pub axis_dims: Vec<i64>,
    pub axis_names: Vec<String>,
    pub use_flash_attention: bool,
    /// Quantized matmul width, if any
    pub bits: Option<u8>,
    /// Compute dtype name
    pub dtype: String,
}

impl Default for RuntimeArgs {
    fn default() -> Self {
        Self {
            gradient_checkpointing: "nothing_saveable".to_string(),
            axis_dims: vec![1, -1, 1, 1],
            axis_names: ["dp", "fsdp", "tp", "sp"].map(String::from).to_vec(),
            use_flash_attention: false,
            bits: None,
            dtype: "bfloat16".to_string(),
        }
    }
}

impl RuntimeArgs {
    /// Apply `FLAXPORT_*` environment overrides
    pub fn from_env() -> Self {
        let mut args = Self::default();

        if let Ok(policy) = std::env::var("FLAXPORT_GRADIENT_CHECKPOINTING") {
            args.gradient_checkpointing = policy;
        }

        if let Ok(dtype) = std::env::var("FLAXPORT_DTYPE") {
            args.dtype = dtype;
        }

        if let Ok(bits) = std::env::var("FLAXPORT_BITS") {
            match bits.parse() {
                Ok(b) => args.bits = Some(b),
                Err(_) => tracing::warn!(value = %bits, "ignoring unparsable FLAXPORT_BITS"),
            }
        }

        args
    }

    pub fn validate(&self) -> Result<()> {
        if !CHECKPOINT_POLICIES.contains(&self.gradient_checkpointing.as_str()) {
            return Err(ModelError::Config(format!(
                "unknown gradient checkpoint policy: {}",
                self.gradient_checkpointing
            )));
        }
        if self.axis_dims.len() != self.axis_names.len() {
            return Err(ModelError::Config(format!(
                "axis_dims has {} entries but axis_names has {}",
                self.axis_dims.len(),
                self.axis_names.len()
            )));
        }
        if self.axis_dims.iter().filter(|&&d| d == -1).count() > 1 {
            return Err(ModelError::Config(
                "at most one mesh axis may be -1".into(),
            ));
        }
        if let Some(bits) = self.bits {
            if bits != 4 && bits != 8 {
                return Err(ModelError::Config(format!("unsupported bits: {}", bits)));
            }
        }
        Ok(())
    }
}
