//! PyTorch <-> Flax parameter layout conversion for Falcon checkpoints

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::FalconConfig;
use crate::error::{ModelError, Result};
use crate::naming::{ParamKind, ParamSpec, HEAD_PARAMS, LAYER_PARAMS, TAIL_PARAMS};
use crate::params::{FlatParams, NestedParams};
use crate::tensor::{Device, Tensor};

/// Knobs shared by both conversion directions
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Convert per-layer projection and post-attention norm biases
    pub include_bias: bool,
    /// Fail instead of skipping when an optional parameter is absent
    /// (PyTorch -> Flax only)
    pub strict_missing: bool,
    /// Placement tag stamped on every produced tensor
    pub device: Device,
    /// Draw a terminal progress bar over the layer loop
    pub show_progress: bool,
    /// Layers carry a post-attention layer norm (Flax -> PyTorch only).
    /// When set the norm is required; when unset it is never looked up.
    pub post_attention_norm: bool,
}

impl ConvertOptions {
    pub fn with_bias(mut self, include_bias: bool) -> Self {
        self.include_bias = include_bias;
        self
    }

    pub fn strict(mut self, strict_missing: bool) -> Self {
        self.strict_missing = strict_missing;
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn with_post_attention_norm(mut self, post_attention_norm: bool) -> Self {
        self.post_attention_norm = post_attention_norm;
        self
    }

    /// Take the layer structure from the model configuration
    pub fn for_config(self, config: &FalconConfig) -> Self {
        self.with_post_attention_norm(config.expects_post_attention_norm())
    }
}

/// Map a source tensor into the target layout. Kernels are transposed in
/// both directions since the transpose is its own inverse.
fn relayout(spec: &ParamSpec, name: &str, tensor: &Tensor, device: Device) -> Result<Tensor> {
    tensor.expect_rank(name, spec.kind.rank())?;
    let out = match spec.kind {
        ParamKind::Kernel => tensor.transpose_2d(name)?,
        ParamKind::Embedding | ParamKind::Vector => tensor.clone(),
    };
    Ok(out.with_device(device))
}

fn layer_progress(num_layers: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(num_layers as u64);
    let style = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    progress.set_style(style);
    progress.set_message("Converting Layers");
    progress
}

/// Convert a PyTorch state dict into the Flax parameter tree.
///
/// The post-attention layer norm is optional: parallel-attention Falcon
/// variants have none. When it is absent the entry is skipped, unless
/// `strict_missing` is set, in which case the conversion fails with
/// [`ModelError::IncompatibleWeights`]. Every other parameter is required.
pub fn pt_to_flax(
    state_dict: &FlatParams,
    num_layers: usize,
    options: &ConvertOptions,
) -> Result<NestedParams> {
    let mut out = NestedParams::new();

    let mut convert = |spec: &ParamSpec, layer: Option<usize>| -> Result<()> {
        let key = spec.flat_key(layer);
        let tensor = if spec.optional {
            match state_dict.get_optional(&key) {
                Some(t) => t,
                None if options.strict_missing => return Err(ModelError::incompatible(key)),
                None => {
                    tracing::debug!(key = %key, "optional parameter absent, skipping");
                    return Ok(());
                }
            }
        } else {
            state_dict.get(&key)?
        };
        out.insert(spec.nested_path(layer), relayout(spec, &key, tensor, options.device)?);
        Ok(())
    };

    for spec in HEAD_PARAMS {
        convert(spec, None)?;
    }

    let progress = layer_progress(num_layers, options.show_progress);
    for i in 0..num_layers {
        tracing::info!("Converting layer {}/{}", i + 1, num_layers);
        for spec in LAYER_PARAMS.iter().filter(|p| p.selected(options.include_bias)) {
            convert(spec, Some(i))?;
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    for spec in TAIL_PARAMS {
        convert(spec, None)?;
    }

    tracing::info!(
        params = out.len(),
        bytes = out.total_size_bytes(),
        "PyTorch -> Flax conversion complete"
    );
    Ok(out)
}

/// Convert a Flax parameter tree back into a PyTorch state dict.
///
/// Unlike [`pt_to_flax`], nothing is tolerated: every selected parameter
/// must be present and `strict_missing` is ignored. The post-attention layer
/// norm is exported only when `post_attention_norm` is set, and is then
/// required for every layer.
pub fn flax_to_pt(
    params: &NestedParams,
    num_layers: usize,
    options: &ConvertOptions,
) -> Result<FlatParams> {
    let mut out = FlatParams::new();

    let mut convert = |spec: &ParamSpec, layer: Option<usize>| -> Result<()> {
        let path = spec.nested_path(layer);
        let tensor = params.get(&path)?;
        let name = path.to_string();
        out.insert(spec.flat_key(layer), relayout(spec, &name, tensor, options.device)?);
        Ok(())
    };

    for spec in HEAD_PARAMS {
        convert(spec, None)?;
    }

    let progress = layer_progress(num_layers, options.show_progress);
    for i in 0..num_layers {
        tracing::info!("Converting layer {}/{}", i + 1, num_layers);
        let specs = LAYER_PARAMS
            .iter()
            .filter(|p| p.selected(options.include_bias))
            .filter(|p| !p.optional || options.post_attention_norm);
        for spec in specs {
            convert(spec, Some(i))?;
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    for spec in TAIL_PARAMS {
        convert(spec, None)?;
    }

    tracing::info!(
        params = out.len(),
        bytes = out.total_size_bytes(),
        "Flax -> PyTorch conversion complete"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamPath;

    /// Minimal single-layer state dict with distinct values per tensor
    fn tiny_state_dict() -> FlatParams {
        let mut sd = FlatParams::new();
        let mut seed = 0.0f32;
        let mut tensor = |shape: Vec<usize>| {
            let n: usize = shape.iter().product();
            let values: Vec<f32> = (0..n).map(|i| seed + i as f32).collect();
            seed += 100.0;
            Tensor::from_f32(shape, &values).unwrap()
        };
        sd.insert("transformer.word_embeddings.weight", tensor(vec![5, 4]));
        sd.insert("transformer.h.0.input_layernorm.weight", tensor(vec![4]));
        sd.insert("transformer.h.0.input_layernorm.bias", tensor(vec![4]));
        sd.insert("transformer.h.0.mlp.dense_4h_to_h.weight", tensor(vec![4, 16]));
        sd.insert("transformer.h.0.mlp.dense_h_to_4h.weight", tensor(vec![16, 4]));
        sd.insert("transformer.h.0.self_attention.query_key_value.weight", tensor(vec![12, 4]));
        sd.insert("transformer.h.0.self_attention.dense.weight", tensor(vec![4, 4]));
        sd.insert("transformer.ln_f.weight", tensor(vec![4]));
        sd.insert("transformer.ln_f.bias", tensor(vec![4]));
        sd.insert("lm_head.weight", tensor(vec![5, 4]));
        sd
    }

    #[test]
    fn test_kernels_transposed_vectors_copied() {
        let sd = tiny_state_dict();
        let flax = pt_to_flax(&sd, 1, &ConvertOptions::default()).unwrap();

        let up = flax.get(&ParamPath::from(["transformer", "h", "0", "mlp", "up", "kernel"])).unwrap();
        assert_eq!(up.shape(), &[4, 16]);

        let scale = flax
            .get(&ParamPath::from(["transformer", "h", "0", "input_layernorm", "scale"]))
            .unwrap();
        assert_eq!(scale, sd.get("transformer.h.0.input_layernorm.weight").unwrap());

        let wte = flax.get(&ParamPath::from(["transformer", "wte", "embedding"])).unwrap();
        assert_eq!(wte.shape(), &[5, 4]);
    }

    #[test]
    fn test_missing_post_attention_norm_lenient() {
        let sd = tiny_state_dict();
        let flax = pt_to_flax(&sd, 1, &ConvertOptions::default()).unwrap();
        assert_eq!(flax.len(), 10);
        assert!(!flax.contains(&ParamPath::from([
            "transformer",
            "h",
            "0",
            "post_attention_layernorm",
            "scale"
        ])));
    }

    #[test]
    fn test_missing_post_attention_norm_strict() {
        let sd = tiny_state_dict();
        let err = pt_to_flax(&sd, 1, &ConvertOptions::default().strict(true)).unwrap_err();
        match err {
            ModelError::IncompatibleWeights { key, .. } => {
                assert_eq!(key, "transformer.h.0.post_attention_layernorm.weight")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_required_parameter() {
        let sd = tiny_state_dict();
        let err = pt_to_flax(&sd, 2, &ConvertOptions::default()).unwrap_err();
        assert!(
            matches!(err, ModelError::MissingParameter(k) if k == "transformer.h.1.input_layernorm.weight")
        );
    }

    #[test]
    fn test_rank_validated() {
        let mut sd = tiny_state_dict();
        sd.insert(
            "transformer.h.0.input_layernorm.weight",
            Tensor::from_f32(vec![2, 2], &[1.0; 4]).unwrap(),
        );
        let err = pt_to_flax(&sd, 1, &ConvertOptions::default()).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { expected_rank: 1, .. }));
    }

    #[test]
    fn test_device_stamped() {
        let sd = tiny_state_dict();
        let opts = ConvertOptions::default().on_device(Device::Cuda(1));
        let flax = pt_to_flax(&sd, 1, &opts).unwrap();
        assert!(flax.iter().all(|(_, t)| t.device() == Device::Cuda(1)));
    }

    #[test]
    fn test_inverse_parallel_attention_round_trip() {
        let sd = tiny_state_dict();
        let opts = ConvertOptions::default();
        let back = flax_to_pt(&pt_to_flax(&sd, 1, &opts).unwrap(), 1, &opts).unwrap();
        assert_eq!(back, sd);
    }

    #[test]
    fn test_inverse_requires_post_attention_norm_when_expected() {
        let sd = tiny_state_dict();
        let flax = pt_to_flax(&sd, 1, &ConvertOptions::default()).unwrap();
        let opts = ConvertOptions::default().with_post_attention_norm(true);
        let err = flax_to_pt(&flax, 1, &opts).unwrap_err();
        assert!(
            matches!(err, ModelError::MissingParameter(k) if k == "transformer/h/0/post_attention_layernorm/scale")
        );
    }

    #[test]
    fn test_options_follow_config() {
        let sequential = FalconConfig {
            parallel_attn: false,
            ..Default::default()
        };
        assert!(ConvertOptions::default().for_config(&sequential).post_attention_norm);
        assert!(!ConvertOptions::default().for_config(&FalconConfig::default()).post_attention_norm);
    }
}
