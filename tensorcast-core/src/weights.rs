//! Source parameter map.
//!
//! Loads a Hugging Face checkpoint directory (one safetensors file or an
//! index plus shards) into a flat name-to-tensor mapping, then serves
//! read-only lookups to the converter. Parameter lookup follows the source
//! convention: a prefix resolves to either the exact tensor name or
//! `{prefix}.weight`.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use serde::Deserialize;

/// `model.safetensors.index.json` — only the shard fan-out is needed.
#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Read-only mapping from dotted parameter name to tensor.
pub struct WeightMap {
    tensors: HashMap<String, Tensor>,
}

impl WeightMap {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Load every parameter from a model directory.
    ///
    /// Uses `model.safetensors.index.json` when present, otherwise loads all
    /// `*.safetensors` files in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let index_path = dir.join("model.safetensors.index.json");
        let shard_names = if index_path.is_file() {
            let raw = std::fs::read_to_string(&index_path)?;
            let index: SafetensorsIndex = serde_json::from_str(&raw)
                .map_err(|e| candle_core::Error::Msg(format!("parsing safetensors index: {e}")))?;
            let mut names: Vec<String> = index.weight_map.into_values().collect();
            names.sort();
            names.dedup();
            names
        } else {
            let mut names = Vec::new();
            for item in std::fs::read_dir(dir)? {
                let item = item?;
                let name = item.file_name().to_string_lossy().into_owned();
                if name.ends_with(".safetensors") {
                    names.push(name);
                }
            }
            names.sort();
            names
        };
        if shard_names.is_empty() {
            candle_core::bail!("no safetensors files found in {}", dir.display());
        }

        let mut tensors = HashMap::new();
        for name in &shard_names {
            let path = dir.join(name);
            let file = File::open(&path)?;
            // Safety: the checkpoint file is not mutated while mapped.
            let mmap = unsafe { Mmap::map(&file)? };
            let st = SafeTensors::deserialize(&mmap)
                .map_err(|e| candle_core::Error::Msg(format!("reading {name}: {e}")))?;
            for (tensor_name, view) in st.tensors() {
                let tensor = tensor_from_bytes(view.dtype(), view.shape(), view.data(), device)?;
                tensors.insert(tensor_name.to_string(), tensor);
            }
        }
        tracing::info!(
            "loaded {} parameters from {} shard(s)",
            tensors.len(),
            shard_names.len()
        );
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Resolve `prefix` (exact name or `{prefix}.weight`) and convert to
    /// `dtype`. Returns `None` when neither name exists.
    pub fn try_weight(&self, prefix: &str, dtype: DType) -> Result<Option<Tensor>> {
        let tensor = self
            .tensors
            .get(prefix)
            .or_else(|| self.tensors.get(&format!("{prefix}.weight")));
        match tensor {
            Some(t) => Ok(Some(t.to_dtype(dtype)?)),
            None => Ok(None),
        }
    }

    /// Like [`Self::try_weight`] but the parameter is required.
    pub fn weight(&self, prefix: &str, dtype: DType) -> Result<Tensor> {
        self.try_weight(prefix, dtype)?
            .ok_or_else(|| candle_core::Error::Msg(format!("missing source parameter {prefix}")))
    }

    /// Resolve `{prefix}.bias` and convert to `dtype`, if present.
    pub fn bias(&self, prefix: &str, dtype: DType) -> Result<Option<Tensor>> {
        match self.tensors.get(&format!("{prefix}.bias")) {
            Some(t) => Ok(Some(t.to_dtype(dtype)?)),
            None => Ok(None),
        }
    }
}

fn tensor_from_bytes(dtype: Dtype, shape: &[usize], data: &[u8], device: &Device) -> Result<Tensor> {
    let shape = shape.to_vec();
    match dtype {
        Dtype::F32 => {
            let values: Vec<f32> = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        Dtype::F16 => {
            let values: Vec<f16> = data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        Dtype::BF16 => {
            let values: Vec<bf16> = data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        Dtype::F64 => {
            let values: Vec<f64> = data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        Dtype::U8 => Tensor::from_vec(data.to_vec(), shape, device),
        Dtype::U32 => {
            let values: Vec<u32> = data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        Dtype::I64 => {
            let values: Vec<i64> = data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        other => candle_core::bail!("unsupported source dtype {other:?}"),
    }
}
