//! Dense host tensor with dtype, memory-format and device tags
//!
//! Storage is one of F32/BF16/F16 (the latter two via the `half` crate).
//! Memory format only changes the physical order of the stored values;
//! [`Tensor::to_f32_vec`] always returns logical row-major values, so kernels
//! and rewrites never need to know which layout a weight currently uses.

pub mod layout;
pub mod matmul;

use crate::backend::DeviceClass;
use crate::error::{ForgeError, ForgeResult};
use half::{bf16, f16};
use serde::Serialize;
use std::fmt;

/// Element type of tensor storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DType {
    F32,
    BF16,
    F16,
}

impl DType {
    /// BF16 and F16 are the reduced-precision targets
    pub fn is_reduced(&self) -> bool {
        !matches!(self, DType::F32)
    }

    pub fn element_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::BF16 | DType::F16 => 2,
        }
    }

    /// Round an f32 value to this dtype's precision
    #[inline]
    pub fn round(&self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::BF16 => bf16::from_f32(value).to_f32(),
            DType::F16 => f16::from_f32(value).to_f32(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::BF16 => write!(f, "bf16"),
            DType::F16 => write!(f, "f16"),
        }
    }
}

/// Physical ordering of stored elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemoryFormat {
    /// Row-major over the logical shape
    Contiguous,
    /// Channel dimension (dim 1) stored innermost
    ChannelsLast,
    /// Output dimension (dim 0) split into blocks of `block`, stored innermost
    Blocked { block: usize },
}

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    F32(Vec<f32>),
    BF16(Vec<bf16>),
    F16(Vec<f16>),
}

impl Storage {
    fn encode(values: &[f32], dtype: DType) -> Self {
        match dtype {
            DType::F32 => Storage::F32(values.to_vec()),
            DType::BF16 => Storage::BF16(values.iter().map(|&v| bf16::from_f32(v)).collect()),
            DType::F16 => Storage::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
        }
    }

    fn decode(&self) -> Vec<f32> {
        match self {
            Storage::F32(v) => v.clone(),
            Storage::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Storage::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::BF16(_) => DType::BF16,
            Storage::F16(_) => DType::F16,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::BF16(v) => v.len(),
            Storage::F16(v) => v.len(),
        }
    }
}

/// Dense tensor. `Clone` is a deep copy; two tensors never share storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    storage: Storage,
    shape: Vec<usize>,
    format: MemoryFormat,
    device: DeviceClass,
}

impl Tensor {
    /// Build a contiguous f32 host tensor
    pub fn from_vec(data: Vec<f32>, shape: Vec<usize>) -> ForgeResult<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(ForgeError::ShapeMismatch(format!(
                "{} values do not fill shape {:?} ({} elements)",
                data.len(),
                shape,
                numel
            )));
        }
        Ok(Self {
            storage: Storage::F32(data),
            shape,
            format: MemoryFormat::Contiguous,
            device: DeviceClass::Host,
        })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            storage: Storage::F32(vec![0.0; numel]),
            shape,
            format: MemoryFormat::Contiguous,
            device: DeviceClass::Host,
        }
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            storage: Storage::F32(vec![value; numel]),
            shape,
            format: MemoryFormat::Contiguous,
            device: DeviceClass::Host,
        }
    }

    /// Zero tensor with the same shape, dtype and device as `self`, contiguous
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
            .to_dtype(self.dtype())
            .on_device(self.device)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    /// Number of stored elements (blocked layouts pad dim 0)
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    /// Retag the device class. Host-side stand-in: data stays where it is.
    pub fn on_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    /// Logical row-major values as f32, regardless of dtype or format
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let physical = self.storage.decode();
        match self.format {
            MemoryFormat::Contiguous => physical,
            MemoryFormat::ChannelsLast => layout::from_channels_last(&physical, &self.shape),
            MemoryFormat::Blocked { block } => layout::unpack_blocked(&physical, &self.shape, block),
        }
    }

    /// Overwrite logical values, re-encoding into the current dtype and format
    pub fn assign_f32(&mut self, values: &[f32]) -> ForgeResult<()> {
        if values.len() != self.numel() {
            return Err(ForgeError::ShapeMismatch(format!(
                "cannot assign {} values to tensor of shape {:?}",
                values.len(),
                self.shape
            )));
        }
        let physical = self.physical_order(values);
        self.storage = Storage::encode(&physical, self.dtype());
        Ok(())
    }

    /// Convert storage dtype, keeping format and device
    pub fn to_dtype(&self, dtype: DType) -> Self {
        if dtype == self.dtype() {
            return self.clone();
        }
        Self {
            storage: Storage::encode(&self.storage.decode(), dtype),
            shape: self.shape.clone(),
            format: self.format,
            device: self.device,
        }
    }

    /// Reorder storage into `format`, keeping dtype and device
    pub fn to_format(&self, format: MemoryFormat) -> ForgeResult<Self> {
        if format == self.format {
            return Ok(self.clone());
        }
        match format {
            MemoryFormat::ChannelsLast if !(3..=5).contains(&self.shape.len()) => {
                return Err(ForgeError::ShapeMismatch(format!(
                    "channels-last needs a 3-5D tensor, got {:?}",
                    self.shape
                )))
            }
            MemoryFormat::Blocked { block } if block == 0 || self.shape.len() < 2 => {
                return Err(ForgeError::ShapeMismatch(format!(
                    "blocked layout needs block > 0 and a 2D+ tensor, got block {} for {:?}",
                    block, self.shape
                )))
            }
            _ => {}
        }

        let logical = self.to_f32_vec();
        let mut out = Self {
            storage: Storage::F32(Vec::new()),
            shape: self.shape.clone(),
            format,
            device: self.device,
        };
        let physical = out.physical_order(&logical);
        out.storage = Storage::encode(&physical, self.dtype());
        Ok(out)
    }

    pub fn to_contiguous(&self) -> Self {
        match self.format {
            MemoryFormat::Contiguous => self.clone(),
            _ => Self {
                storage: Storage::encode(&self.to_f32_vec(), self.dtype()),
                shape: self.shape.clone(),
                format: MemoryFormat::Contiguous,
                device: self.device,
            },
        }
    }

    /// Reinterpret the logical shape (contiguous tensors only)
    pub fn reshape(&self, shape: Vec<usize>) -> ForgeResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(ForgeError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        let mut out = self.to_contiguous();
        out.shape = shape;
        Ok(out)
    }

    /// Max absolute elementwise difference over logical values
    pub fn max_abs_diff(&self, other: &Tensor) -> ForgeResult<f32> {
        if self.shape != other.shape {
            return Err(ForgeError::ShapeMismatch(format!(
                "{:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(self
            .to_f32_vec()
            .iter()
            .zip(other.to_f32_vec())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }

    fn physical_order(&self, logical: &[f32]) -> Vec<f32> {
        match self.format {
            MemoryFormat::Contiguous => logical.to_vec(),
            MemoryFormat::ChannelsLast => layout::to_channels_last(logical, &self.shape),
            MemoryFormat::Blocked { block } => layout::pack_blocked(logical, &self.shape, block),
        }
    }
}
