//! Model configuration: the Hugging Face DBRX schema on the way in, the
//! engine checkpoint schema on the way out.

use std::path::Path;

use candle_core::{DType, Result};
use serde::{Deserialize, Serialize};

use crate::mapping::Mapping;
use crate::moe::MoeConfig;

fn default_rope_theta() -> f64 {
    10_000.0
}

/// `attn_config` section of the HF DBRX `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DbrxAttnConfig {
    pub kv_n_heads: usize,
    #[serde(default)]
    pub clip_qkv: Option<f64>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

/// `ffn_config` section of the HF DBRX `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DbrxFfnConfig {
    pub ffn_hidden_size: usize,
    #[serde(default)]
    pub moe_num_experts: usize,
    #[serde(default)]
    pub moe_top_k: usize,
}

/// Architecture hyperparameters read from the source model directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DbrxConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub attn_config: DbrxAttnConfig,
    pub ffn_config: DbrxFfnConfig,
}

impl DbrxConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| candle_core::Error::Msg(format!("parsing {}: {e}", path.display())))
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Width of the fused key or value block.
    pub fn kv_dim(&self) -> usize {
        self.attn_config.kv_n_heads * self.head_dim()
    }

    /// True when K/V have fewer heads than Q (grouped-query attention).
    pub fn multi_query_mode(&self) -> bool {
        self.attn_config.kv_n_heads != self.n_heads
    }

    /// Effective top-k: an MoE model with an unset top_k routes to 1 expert.
    pub fn effective_moe_top_k(&self) -> usize {
        if self.ffn_config.moe_num_experts > 0 && self.ffn_config.moe_top_k == 0 {
            1
        } else {
            self.ffn_config.moe_top_k
        }
    }
}

/// Parse a checkpoint dtype name (HF convention) into a tensor dtype.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "float32" => Ok(DType::F32),
        "float16" => Ok(DType::F16),
        "bfloat16" => Ok(DType::BF16),
        other => candle_core::bail!("unsupported dtype {other:?} (expected float32/float16/bfloat16)"),
    }
}

/// The inverse of [`parse_dtype`], for config emission.
pub fn dtype_name(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::F32 => Ok("float32"),
        DType::F16 => Ok("float16"),
        DType::BF16 => Ok("bfloat16"),
        other => candle_core::bail!("dtype {other:?} has no checkpoint name"),
    }
}

/// `quantization` section of the engine config.
#[derive(Debug, Clone, Serialize)]
pub struct QuantizationSection {
    pub quant_algo: Option<String>,
    pub kv_cache_quant_algo: Option<String>,
    pub exclude_modules: Vec<String>,
}

/// `moe_config` section of the engine config.
#[derive(Debug, Clone, Serialize)]
pub struct MoeSection {
    pub num_experts: usize,
    pub top_k: usize,
    pub tp_mode: u32,
    pub normalization_mode: u32,
}

impl MoeSection {
    pub fn from_config(moe: &MoeConfig) -> Self {
        Self {
            num_experts: moe.num_experts,
            top_k: moe.top_k,
            tp_mode: moe.parallelism.code(),
            normalization_mode: moe.normalization.code(),
        }
    }
}

/// `mapping` section of the engine config.
#[derive(Debug, Clone, Serialize)]
pub struct MappingSection {
    pub world_size: usize,
    pub tp_size: usize,
    pub pp_size: usize,
}

impl MappingSection {
    pub fn from_mapping(mapping: &Mapping) -> Self {
        Self {
            world_size: mapping.world_size(),
            tp_size: mapping.tp_size(),
            pp_size: mapping.pp_size(),
        }
    }
}

/// The engine `config.json` written next to the rank shards.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub architecture: String,
    pub dtype: String,
    pub logits_dtype: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub norm_epsilon: f64,
    pub position_embedding_type: String,
    pub hidden_act: String,
    pub rotary_base: f64,
    pub rotary_scaling: Option<Vec<String>>,
    pub quantization: QuantizationSection,
    pub moe_config: MoeSection,
    pub mapping: MappingSection,
    pub clip_qkv: Option<f64>,
    pub dense_context_fmha: bool,
    pub use_parallel_embedding: bool,
    pub embedding_sharding_dim: usize,
    pub share_embedding_table: bool,
    pub disable_weight_only_quant_plugin: bool,
}

impl EngineConfig {
    pub fn write(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| candle_core::Error::Msg(format!("serializing engine config: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "d_model": 16,
        "n_heads": 4,
        "n_layers": 2,
        "vocab_size": 32,
        "max_seq_len": 64,
        "attn_config": {"kv_n_heads": 2, "clip_qkv": 8.0, "rope_theta": 500000.0},
        "ffn_config": {"ffn_hidden_size": 8, "moe_num_experts": 4, "moe_top_k": 2}
    }"#;

    #[test]
    fn test_parse_hf_config() {
        let cfg: DbrxConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.head_dim(), 4);
        assert_eq!(cfg.kv_dim(), 8);
        assert!(cfg.multi_query_mode());
        assert_eq!(cfg.effective_moe_top_k(), 2);
    }

    #[test]
    fn test_top_k_defaults_to_one_for_moe() {
        let raw = SAMPLE.replace("\"moe_top_k\": 2", "\"moe_top_k\": 0");
        let cfg: DbrxConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(cfg.effective_moe_top_k(), 1);
    }

    #[test]
    fn test_dtype_names_round_trip() {
        for name in ["float32", "float16", "bfloat16"] {
            let dtype = parse_dtype(name).unwrap();
            assert_eq!(dtype_name(dtype).unwrap(), name);
        }
        assert!(parse_dtype("int8").is_err());
    }
}
