//! Safetensors checkpoint reading and writing

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::View;
use safetensors::SafeTensors;

use crate::config::FalconConfig;
use crate::error::{ModelError, Result};
use crate::params::{FlatParams, NestedParams, ParamPath};
use crate::tensor::{DType, Device, Tensor};

impl View for &Tensor {
    fn dtype(&self) -> safetensors::Dtype {
        Tensor::dtype(self).to_safetensors()
    }

    fn shape(&self) -> &[usize] {
        Tensor::shape(self)
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }

    fn data_len(&self) -> usize {
        self.size_bytes()
    }
}

/// Memory-mapped PyTorch checkpoint directory
/// (`config.json` plus one or more `*.safetensors` shards)
pub struct SafetensorsLoader {
    /// Memory-mapped shards, sorted by file name
    mmaps: Vec<(String, Mmap)>,
    /// Model configuration
    pub config: FalconConfig,
}

impl SafetensorsLoader {
    /// Open a checkpoint directory
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let model_dir = dir.as_ref().to_path_buf();
        if !model_dir.is_dir() {
            return Err(ModelError::ModelNotFound(model_dir.display().to_string()));
        }

        let config = FalconConfig::from_json_file(model_dir.join("config.json"))?;

        let mut mmaps = Vec::new();
        for path in list_safetensor_files(&model_dir)? {
            let file = std::fs::File::open(&path)?;
            let mmap = unsafe { Mmap::map(&file)? };
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            mmaps.push((filename, mmap));
        }

        if mmaps.is_empty() {
            return Err(ModelError::ModelNotFound(format!(
                "no .safetensors files in {}",
                model_dir.display()
            )));
        }

        tracing::info!(
            dir = %model_dir.display(),
            shards = mmaps.len(),
            "Opened safetensors checkpoint"
        );

        Ok(Self { mmaps, config })
    }

    /// Get tensor names across all shards
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (filename, mmap) in &self.mmaps {
            let tensors = deserialize(filename, mmap)?;
            names.extend(tensors.names().into_iter().map(String::from));
        }
        names.sort();
        Ok(names)
    }

    /// Copy every tensor out of the mapped shards. A name present in more
    /// than one shard is an error.
    pub fn load_flat_params(&self, device: Device) -> Result<FlatParams> {
        let mut params = FlatParams::new();
        for (filename, mmap) in &self.mmaps {
            let tensors = deserialize(filename, mmap)?;
            for (name, view) in tensors.tensors() {
                let tensor = Tensor::new(
                    view.shape().to_vec(),
                    DType::from_safetensors(view.dtype())?,
                    view.data().to_vec(),
                )?;
                if params.insert(name.clone(), tensor.with_device(device)).is_some() {
                    return Err(ModelError::Safetensors(format!(
                        "duplicate tensor {} in {}",
                        name, filename
                    )));
                }
            }
        }
        tracing::info!(
            params = params.len(),
            bytes = params.total_size_bytes(),
            "Loaded state dict"
        );
        Ok(params)
    }

    /// Total mapped size in bytes
    pub fn total_size_bytes(&self) -> usize {
        self.mmaps.iter().map(|(_, m)| m.len()).sum()
    }
}

/// List safetensor files in a directory, sorted
pub fn list_safetensor_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "safetensors") {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn deserialize<'a>(filename: &str, data: &'a [u8]) -> Result<SafeTensors<'a>> {
    SafeTensors::deserialize(data)
        .map_err(|e| ModelError::Safetensors(format!("{}: {}", filename, e)))
}

fn format_metadata(format: &str) -> Option<HashMap<String, String>> {
    Some(HashMap::from([("format".to_string(), format.to_string())]))
}

/// Write a PyTorch-style state dict as a single safetensors file
pub fn save_flat<P: AsRef<Path>>(params: &FlatParams, path: P) -> Result<()> {
    safetensors::serialize_to_file(params.iter(), &format_metadata("pt"), path.as_ref())?;
    tracing::info!(path = %path.as_ref().display(), params = params.len(), "Wrote state dict");
    Ok(())
}

/// Write a Flax parameter tree as a safetensors file with `/`-joined keys
pub fn save_nested<P: AsRef<Path>>(params: &NestedParams, path: P) -> Result<()> {
    safetensors::serialize_to_file(params.to_flat_keys(), &format_metadata("flax"), path.as_ref())?;
    tracing::info!(path = %path.as_ref().display(), params = params.len(), "Wrote Flax params");
    Ok(())
}

/// Read a safetensors file into a PyTorch-style state dict
pub fn load_flat<P: AsRef<Path>>(path: P, device: Device) -> Result<FlatParams> {
    Ok(read_file(path.as_ref(), device)?.into_iter().collect())
}

/// Read a safetensors file written by [`save_nested`]
pub fn load_nested<P: AsRef<Path>>(path: P, device: Device) -> Result<NestedParams> {
    Ok(read_file(path.as_ref(), device)?
        .into_iter()
        .map(|(name, t)| (ParamPath::parse(&name), t))
        .collect())
}

fn read_file(path: &Path, device: Device) -> Result<Vec<(String, Tensor)>> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let tensors = deserialize(&path.display().to_string(), &mmap)?;

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let tensor = Tensor::new(
                view.shape().to_vec(),
                DType::from_safetensors(view.dtype())?,
                view.data().to_vec(),
            )?;
            Ok((name, tensor.with_device(device)))
        })
        .collect()
}
