//! Owned checkpoint tensors and per-rank serialization.
//!
//! The converted checkpoint mixes dtypes the tensor library can represent
//! (F32/F16/BF16) with ones it cannot (signed int8, int4 packed two to a
//! byte). [`TensorEntry`] is the common denominator: an owned dtype + shape +
//! little-endian byte buffer that serializes straight into a safetensors
//! file.

use std::borrow::Cow;
use std::path::Path;

use candle_core::{DType, Result, Tensor};
use half::{bf16, f16};
use indexmap::IndexMap;
use safetensors::tensor::{Dtype, View};

/// One named tensor of the output checkpoint, in its serialized form.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorEntry {
    /// Capture a tensor in its native dtype.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let tensor = tensor.contiguous()?;
        let shape = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?;
        let (dtype, data) = match tensor.dtype() {
            DType::F32 => {
                let values = flat.to_vec1::<f32>()?;
                let mut data = Vec::with_capacity(values.len() * 4);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (Dtype::F32, data)
            }
            DType::F16 => {
                let values = flat.to_vec1::<f16>()?;
                let mut data = Vec::with_capacity(values.len() * 2);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (Dtype::F16, data)
            }
            DType::BF16 => {
                let values = flat.to_vec1::<bf16>()?;
                let mut data = Vec::with_capacity(values.len() * 2);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (Dtype::BF16, data)
            }
            DType::U8 => (Dtype::U8, flat.to_vec1::<u8>()?),
            DType::U32 => {
                let values = flat.to_vec1::<u32>()?;
                let mut data = Vec::with_capacity(values.len() * 4);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (Dtype::U32, data)
            }
            DType::I64 => {
                let values = flat.to_vec1::<i64>()?;
                let mut data = Vec::with_capacity(values.len() * 8);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (Dtype::I64, data)
            }
            other => candle_core::bail!("unsupported checkpoint dtype {other:?}"),
        };
        Ok(Self { dtype, shape, data })
    }

    /// Build a signed int8 entry from already-quantized values.
    pub fn int8(values: Vec<i8>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            candle_core::bail!(
                "int8 payload of {} values does not match shape {shape:?}",
                values.len()
            );
        }
        let data = values.into_iter().map(|v| v as u8).collect();
        Ok(Self {
            dtype: Dtype::I8,
            shape,
            data,
        })
    }

    /// Round, clamp to `[-127, 127]`, and capture as signed int8.
    ///
    /// `scaled` must already be in the quantized range (weight times its
    /// quantization scale).
    pub fn int8_from_f32(scaled: &Tensor) -> Result<Self> {
        let shape = scaled.dims().to_vec();
        let values = scaled
            .to_dtype(DType::F32)?
            .round()?
            .clamp(-127f32, 127f32)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v as i8)
            .collect::<Vec<_>>();
        Self::int8(values, shape)
    }

    /// Int4 values packed two to a byte, serialized as an int8 payload with
    /// the packed (halved) final dimension.
    pub fn packed_int4(data: Vec<u8>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            candle_core::bail!(
                "packed int4 payload of {} bytes does not match shape {shape:?}",
                data.len()
            );
        }
        Ok(Self {
            dtype: Dtype::I8,
            shape,
            data,
        })
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Reinterpret the payload as signed int8 values.
    pub fn as_i8(&self) -> Result<Vec<i8>> {
        if self.dtype != Dtype::I8 {
            candle_core::bail!("entry is {:?}, not I8", self.dtype);
        }
        Ok(self.data.iter().map(|&b| b as i8).collect())
    }

    /// Decode the payload back into an f32 vector (native float dtypes only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            Dtype::F32 => Ok(self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()),
            Dtype::F16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()),
            Dtype::BF16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()),
            other => candle_core::bail!("cannot decode {other:?} entry as f32"),
        }
    }
}

impl View for &TensorEntry {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Serialize one rank's named-tensor mapping to a safetensors file.
///
/// Keys keep their insertion order; every destination name appears exactly
/// once by construction of the output map.
pub fn save_checkpoint(tensors: &IndexMap<String, TensorEntry>, path: &Path) -> Result<()> {
    let views = tensors.iter().map(|(name, entry)| (name.as_str(), entry));
    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| candle_core::Error::Msg(format!("writing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_f32_entry_byte_layout() {
        let t = Tensor::new(&[1.0f32, -2.0, 0.5], &Device::Cpu).unwrap();
        let entry = TensorEntry::from_tensor(&t).unwrap();
        assert_eq!(entry.dtype(), Dtype::F32);
        assert_eq!(entry.shape(), &[3]);
        assert_eq!(entry.to_f32_vec().unwrap(), vec![1.0, -2.0, 0.5]);
    }

    #[test]
    fn test_f16_entry_roundtrip() {
        let t = Tensor::new(&[[0.25f32, -1.5], [3.0, 0.0]], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let entry = TensorEntry::from_tensor(&t).unwrap();
        assert_eq!(entry.dtype(), Dtype::F16);
        assert_eq!(entry.shape(), &[2, 2]);
        assert_eq!(entry.to_f32_vec().unwrap(), vec![0.25, -1.5, 3.0, 0.0]);
    }

    #[test]
    fn test_int8_from_f32_rounds_and_clamps() {
        let t = Tensor::new(&[126.6f32, -200.0, 0.4, 200.0], &Device::Cpu).unwrap();
        let entry = TensorEntry::int8_from_f32(&t).unwrap();
        assert_eq!(entry.as_i8().unwrap(), vec![127, -127, 0, 127]);
    }

    #[test]
    fn test_int8_shape_mismatch_rejected() {
        assert!(TensorEntry::int8(vec![1, 2, 3], vec![2, 2]).is_err());
    }

    #[test]
    fn test_save_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rank0.safetensors");

        let mut tensors = IndexMap::new();
        let w = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        tensors.insert("a.weight".to_string(), TensorEntry::from_tensor(&w).unwrap());
        tensors.insert(
            "a.int8".to_string(),
            TensorEntry::int8(vec![-1, 2, -3, 4], vec![2, 2]).unwrap(),
        );
        save_checkpoint(&tensors, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let st = safetensors::SafeTensors::deserialize(&bytes).unwrap();
        let float = st.tensor("a.weight").unwrap();
        assert_eq!(float.dtype(), Dtype::F32);
        assert_eq!(float.shape(), &[2, 2]);
        let int8 = st.tensor("a.int8").unwrap();
        assert_eq!(int8.dtype(), Dtype::I8);
        assert_eq!(
            int8.data().iter().map(|&b| b as i8).collect::<Vec<_>>(),
            vec![-1, 2, -3, 4]
        );
    }
}
