//! Flat (dotted-key) and nested (path-keyed) parameter dictionaries

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;

/// Separator used when a nested path is stored as a single string
pub const PATH_SEPARATOR: char = '/';

/// Key of a nested parameter, e.g. `transformer/h/3/mlp/down/kernel`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamPath(Vec<String>);

impl ParamPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Split a `/`-joined name back into segments
    pub fn parse(joined: &str) -> Self {
        Self::new(joined.split(PATH_SEPARATOR))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl<const N: usize> From<[&str; N]> for ParamPath {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

/// PyTorch-style state dict: dotted names to tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatParams {
    tensors: BTreeMap<String, Tensor>,
}

impl FlatParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    /// Look up a required parameter
    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.tensors
            .get(key)
            .ok_or_else(|| ModelError::MissingParameter(key.to_string()))
    }

    /// Look up a parameter that some model variants leave out
    pub fn get_optional(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn total_size_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }

    /// Number of decoder layers implied by `transformer.h.<i>.` keys
    pub fn inferred_num_layers(&self) -> Option<usize> {
        self.tensors
            .keys()
            .filter_map(|k| k.strip_prefix("transformer.h."))
            .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
            .max()
            .map(|max| max + 1)
    }

    /// Leaf descriptions keyed by parameter name
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.tensors
            .iter()
            .map(|(k, t)| (k.clone(), t.describe()))
            .collect()
    }
}

impl FromIterator<(String, Tensor)> for FlatParams {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Smallest and largest numeric segment seen at one path depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBounds {
    pub min: usize,
    pub max: usize,
}

/// Flax-style parameter tree, flattened to path keys
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NestedParams {
    tensors: BTreeMap<ParamPath, Tensor>,
}

impl NestedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: ParamPath, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(path, tensor)
    }

    /// Look up a required parameter
    pub fn get(&self, path: &ParamPath) -> Result<&Tensor> {
        self.tensors
            .get(path)
            .ok_or_else(|| ModelError::MissingParameter(path.to_string()))
    }

    pub fn get_optional(&self, path: &ParamPath) -> Option<&Tensor> {
        self.tensors.get(path)
    }

    pub fn contains(&self, path: &ParamPath) -> bool {
        self.tensors.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &ParamPath> {
        self.tensors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamPath, &Tensor)> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn total_size_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }

    /// `/`-joined names, the on-disk form of a flattened flax tree
    pub fn to_flat_keys(&self) -> Vec<(String, &Tensor)> {
        self.tensors
            .iter()
            .map(|(p, t)| (p.to_string(), t))
            .collect()
    }

    /// Leaf descriptions keyed by `/`-joined path
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.tensors
            .iter()
            .map(|(p, t)| (p.to_string(), t.describe()))
            .collect()
    }

    /// Min/max of numeric path segments, per depth
    pub fn index_bounds(&self) -> BTreeMap<usize, IndexBounds> {
        let mut bounds: BTreeMap<usize, IndexBounds> = BTreeMap::new();
        for path in self.tensors.keys() {
            for (depth, segment) in path.segments().iter().enumerate() {
                let Ok(idx) = segment.parse::<usize>() else {
                    continue;
                };
                bounds
                    .entry(depth)
                    .and_modify(|b| {
                        b.min = b.min.min(idx);
                        b.max = b.max.max(idx);
                    })
                    .or_insert(IndexBounds { min: idx, max: idx });
            }
        }
        bounds
    }

    /// Number of decoder layers implied by `transformer/h/<i>` paths
    pub fn inferred_num_layers(&self) -> Option<usize> {
        self.tensors
            .keys()
            .filter_map(|p| match p.segments() {
                [root, h, idx, ..] if root == "transformer" && h == "h" => {
                    idx.parse::<usize>().ok()
                }
                _ => None,
            })
            .max()
            .map(|max| max + 1)
    }
}

impl FromIterator<(ParamPath, Tensor)> for NestedParams {
    fn from_iter<I: IntoIterator<Item = (ParamPath, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(n: usize) -> Tensor {
        Tensor::from_f32(vec![n], &vec![0.0; n]).unwrap()
    }

    #[test]
    fn test_path_display_and_parse() {
        let path = ParamPath::from(["transformer", "h", "3", "mlp", "down", "kernel"]);
        assert_eq!(path.to_string(), "transformer/h/3/mlp/down/kernel");
        assert_eq!(ParamPath::parse("transformer/h/3/mlp/down/kernel"), path);
        assert_eq!(path.len(), 6);
    }

    #[test]
    fn test_flat_missing_key() {
        let params = FlatParams::new();
        let err = params.get("lm_head.weight").unwrap_err();
        assert!(matches!(err, ModelError::MissingParameter(k) if k == "lm_head.weight"));
        assert!(params.get_optional("lm_head.weight").is_none());
    }

    #[test]
    fn test_flat_inferred_layers() {
        let mut params = FlatParams::new();
        params.insert("transformer.h.0.input_layernorm.weight", vector(2));
        params.insert("transformer.h.11.input_layernorm.weight", vector(2));
        params.insert("transformer.ln_f.weight", vector(2));
        assert_eq!(params.inferred_num_layers(), Some(12));
        assert_eq!(FlatParams::new().inferred_num_layers(), None);
    }

    #[test]
    fn test_nested_index_bounds() {
        let mut params = NestedParams::new();
        for i in [2, 5, 9] {
            params.insert(
                ParamPath::new(["transformer", "h", i.to_string().as_str(), "input_layernorm", "scale"]),
                vector(2),
            );
        }
        params.insert(ParamPath::from(["lm_head", "kernel"]), vector(2));

        let bounds = params.index_bounds();
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[&2], IndexBounds { min: 2, max: 9 });
        assert_eq!(params.inferred_num_layers(), Some(10));
    }

    #[test]
    fn test_nested_summary() {
        let mut params = NestedParams::new();
        params.insert(ParamPath::from(["transformer", "ln_f", "scale"]), vector(4));
        let summary = params.summary();
        assert_eq!(summary["transformer/ln_f/scale"], "float32(shape=[4])");
    }
}
