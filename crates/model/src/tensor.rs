//! Host-memory tensor container shared by both parameter conventions

use std::fmt;

use half::{bf16, f16};

use crate::error::{ModelError, Result};

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    pub(crate) fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            DType::F32 => safetensors::Dtype::F32,
            DType::F16 => safetensors::Dtype::F16,
            DType::BF16 => safetensors::Dtype::BF16,
        }
    }

    pub(crate) fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            dt => Err(ModelError::UnsupportedDtype(format!("{:?}", dt))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
        };
        f.write_str(name)
    }
}

/// Placement tag for a tensor. Data always lives in host memory; the tag
/// records where the consuming runtime should materialize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl std::str::FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if s == "cuda" {
            return Ok(Device::Cuda(0));
        }
        s.strip_prefix("cuda:")
            .and_then(|idx| idx.parse().ok())
            .map(Device::Cuda)
            .ok_or_else(|| ModelError::Config(format!("unknown device: {}", s)))
    }
}

/// Dense row-major tensor stored as little-endian bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    data: Vec<u8>,
}

impl Tensor {
    /// Create a CPU tensor, checking the buffer matches the shape
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(ModelError::BufferSize {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            device: Device::Cpu,
            data,
        })
    }

    /// Create an F32 tensor from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, DType::F32, data)
    }

    /// Re-tag the tensor with a target device
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Widen every element to f32
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::F16 => self
                .data
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|b| bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
        }
    }

    /// Fail unless the tensor has exactly `rank` dimensions
    pub fn expect_rank(&self, name: &str, rank: usize) -> Result<()> {
        if self.rank() != rank {
            return Err(ModelError::ShapeMismatch {
                name: name.to_string(),
                expected_rank: rank,
                got: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// Swap the two axes of a matrix: `(rows, cols)` becomes `(cols, rows)`.
    ///
    /// Works on raw element bytes, so the result is bit-exact for every dtype.
    pub fn transpose_2d(&self, name: &str) -> Result<Tensor> {
        self.expect_rank(name, 2)?;
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let elem = self.dtype.size_bytes();

        let mut out = vec![0u8; self.data.len()];
        for r in 0..rows {
            for c in 0..cols {
                let src = (r * cols + c) * elem;
                let dst = (c * rows + r) * elem;
                out[dst..dst + elem].copy_from_slice(&self.data[src..src + elem]);
            }
        }

        Ok(Tensor {
            shape: vec![cols, rows],
            dtype: self.dtype,
            device: self.device,
            data: out,
        })
    }

    /// One-line description used by parameter summaries
    pub fn describe(&self) -> String {
        format!("{}(shape={:?})", self.dtype, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_checked() {
        let err = Tensor::new(vec![2, 3], DType::F32, vec![0u8; 20]).unwrap_err();
        assert!(matches!(err, ModelError::BufferSize { expected: 24, got: 20, .. }));
    }

    #[test]
    fn test_transpose_2d() {
        let t = Tensor::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let tt = t.transpose_2d("w").unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.to_f32_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(tt.transpose_2d("w").unwrap(), t);
    }

    #[test]
    fn test_transpose_half_precision_bit_exact() {
        let values = [0.5f32, -1.25, 3.0, 7.5];
        let data: Vec<u8> = values
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let t = Tensor::new(vec![2, 2], DType::BF16, data).unwrap();
        let tt = t.transpose_2d("w").unwrap();
        assert_eq!(tt.dtype(), DType::BF16);
        assert_eq!(tt.to_f32_vec(), vec![0.5, 3.0, -1.25, 7.5]);
    }

    #[test]
    fn test_transpose_rejects_vector() {
        let t = Tensor::from_f32(vec![4], &[1.0; 4]).unwrap();
        let err = t.transpose_2d("ln.weight").unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { expected_rank: 2, .. }));
    }

    #[test]
    fn test_f16_widening() {
        let data: Vec<u8> = [1.0f32, -2.0]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let t = Tensor::new(vec![2], DType::F16, data).unwrap();
        assert_eq!(t.to_f32_vec(), vec![1.0, -2.0]);
        assert_eq!(t.describe(), "float16(shape=[2])");
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert!("tpu".parse::<Device>().is_err());
    }
}
