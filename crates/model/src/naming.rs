//! Falcon parameter naming table
//!
//! PyTorch checkpoints name parameters with dotted strings such as
//! `transformer.h.3.mlp.dense_4h_to_h.weight`; the Flax model expects the
//! tree path `transformer/h/3/mlp/down/kernel`. Every recognised parameter is
//! listed here once, together with how its tensor layout differs.

use crate::params::ParamPath;

use ParamKind::{Embedding, Kernel, Vector};

/// How a tensor's layout relates between the two conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// 2-D lookup table, copied as-is
    Embedding,
    /// 2-D projection stored `(out, in)` in PyTorch and `(in, out)` in Flax
    Kernel,
    /// 1-D norm scale or bias, copied as-is
    Vector,
}

impl ParamKind {
    pub fn rank(&self) -> usize {
        match self {
            ParamKind::Embedding | ParamKind::Kernel => 2,
            ParamKind::Vector => 1,
        }
    }
}

/// One row of the translation table
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    /// Dotted name, relative to the layer prefix for per-layer entries
    pub flat: &'static str,
    /// Path segments, relative to the layer path for per-layer entries
    pub nested: &'static [&'static str],
    pub kind: ParamKind,
    /// Absent in some model variants (parallel-attention Falcon)
    pub optional: bool,
    /// Only converted when biases are requested
    pub bias: bool,
}

impl ParamSpec {
    const fn new(flat: &'static str, nested: &'static [&'static str], kind: ParamKind) -> Self {
        Self {
            flat,
            nested,
            kind,
            optional: false,
            bias: false,
        }
    }

    const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    const fn bias(mut self) -> Self {
        self.bias = true;
        self
    }

    /// Whether this entry takes part in a conversion with the given bias flag
    pub fn selected(&self, include_bias: bool) -> bool {
        include_bias || !self.bias
    }

    pub fn flat_key(&self, layer: Option<usize>) -> String {
        match layer {
            Some(i) => format!("{}.{}", layer_prefix(i), self.flat),
            None => self.flat.to_string(),
        }
    }

    pub fn nested_path(&self, layer: Option<usize>) -> ParamPath {
        match layer {
            Some(i) => {
                let idx = i.to_string();
                let mut segments = vec!["transformer", "h", idx.as_str()];
                segments.extend_from_slice(self.nested);
                ParamPath::new(segments)
            }
            None => ParamPath::new(self.nested.iter().copied()),
        }
    }
}

/// Parameters emitted before the decoder layers
pub const HEAD_PARAMS: &[ParamSpec] = &[ParamSpec::new(
    "transformer.word_embeddings.weight",
    &["transformer", "wte", "embedding"],
    Embedding,
)];

/// Parameters repeated for every decoder layer, in conversion order
pub const LAYER_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("input_layernorm.weight", &["input_layernorm", "scale"], Vector),
    ParamSpec::new("input_layernorm.bias", &["input_layernorm", "bias"], Vector),
    ParamSpec::new("mlp.dense_4h_to_h.weight", &["mlp", "down", "kernel"], Kernel),
    ParamSpec::new("mlp.dense_h_to_4h.weight", &["mlp", "up", "kernel"], Kernel),
    ParamSpec::new(
        "self_attention.query_key_value.weight",
        &["self_attention", "w_qkv", "kernel"],
        Kernel,
    ),
    ParamSpec::new("self_attention.dense.weight", &["self_attention", "wo", "kernel"], Kernel),
    ParamSpec::new(
        "post_attention_layernorm.weight",
        &["post_attention_layernorm", "scale"],
        Vector,
    )
    .optional(),
    ParamSpec::new(
        "self_attention.query_key_value.bias",
        &["self_attention", "w_qkv", "bias"],
        Vector,
    )
    .bias(),
    ParamSpec::new("self_attention.dense.bias", &["self_attention", "wo", "bias"], Vector).bias(),
    ParamSpec::new("mlp.dense_4h_to_h.bias", &["mlp", "down", "bias"], Vector).bias(),
    ParamSpec::new("mlp.dense_h_to_4h.bias", &["mlp", "up", "bias"], Vector).bias(),
    ParamSpec::new(
        "post_attention_layernorm.bias",
        &["post_attention_layernorm", "bias"],
        Vector,
    )
    .optional()
    .bias(),
];

/// Parameters emitted after the decoder layers
pub const TAIL_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("transformer.ln_f.weight", &["transformer", "ln_f", "scale"], Vector),
    ParamSpec::new("transformer.ln_f.bias", &["transformer", "ln_f", "bias"], Vector),
    ParamSpec::new("lm_head.weight", &["lm_head", "kernel"], Kernel),
];

/// Dotted prefix shared by all parameters of one decoder layer
pub fn layer_prefix(layer: usize) -> String {
    format!("transformer.h.{layer}")
}

/// Number of entries a conversion of `num_layers` layers produces when every
/// optional parameter is present
pub fn expected_param_count(num_layers: usize, include_bias: bool) -> usize {
    let per_layer = LAYER_PARAMS
        .iter()
        .filter(|p| p.selected(include_bias))
        .count();
    HEAD_PARAMS.len() + num_layers * per_layer + TAIL_PARAMS.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_keys() {
        let spec = &LAYER_PARAMS[2];
        assert_eq!(spec.flat_key(Some(3)), "transformer.h.3.mlp.dense_4h_to_h.weight");
        assert_eq!(spec.nested_path(Some(3)).to_string(), "transformer/h/3/mlp/down/kernel");
    }

    #[test]
    fn test_global_keys() {
        let head = &TAIL_PARAMS[2];
        assert_eq!(head.flat_key(None), "lm_head.weight");
        assert_eq!(head.nested_path(None).to_string(), "lm_head/kernel");
        assert_eq!(head.kind, ParamKind::Kernel);
    }

    #[test]
    fn test_expected_counts() {
        // embedding + 7 per layer + ln_f scale/bias + head
        assert_eq!(expected_param_count(2, false), 1 + 2 * 7 + 3);
        // 5 extra biases per layer
        assert_eq!(expected_param_count(2, true), 1 + 2 * 12 + 3);
    }

    #[test]
    fn test_only_post_attention_norm_is_optional() {
        let optional: Vec<_> = LAYER_PARAMS
            .iter()
            .filter(|p| p.optional)
            .map(|p| p.flat)
            .collect();
        assert_eq!(
            optional,
            vec!["post_attention_layernorm.weight", "post_attention_layernorm.bias"]
        );
    }

    #[test]
    fn test_table_is_injective() {
        let mut flat = std::collections::HashSet::new();
        let mut nested = std::collections::HashSet::new();
        for spec in HEAD_PARAMS.iter().chain(TAIL_PARAMS) {
            assert!(flat.insert(spec.flat_key(None)));
            assert!(nested.insert(spec.nested_path(None)));
        }
        for spec in LAYER_PARAMS {
            assert!(flat.insert(spec.flat_key(Some(0))));
            assert!(nested.insert(spec.nested_path(Some(0))));
        }
    }
}
