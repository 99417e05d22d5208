//! Weight transformation and sharding engine for DBRX checkpoint conversion.
//!
//! Converts a Hugging Face DBRX parameter layout into the sharded,
//! quantization-aware layout consumed by the inference engine: per-rank
//! safetensors bundles plus an engine `config.json`.
//!
//! The pipeline, leaf-first:
//!
//! - [`split`]: tensor-parallel sharding, including the QKV-aware split that
//!   keeps grouped-query head boundaries aligned across ranks.
//! - [`calibration`] + [`model`]: running-max activation range capture over a
//!   small forward-pass loop, used for int8 KV-cache scales.
//! - [`quant`]: int8 scale derivation from calibrated ranges, and
//!   weight-only int8/int4 per-channel quantization.
//! - [`convert`]: per-layer conversion and per-rank checkpoint assembly.
//! - [`executor`]: sequential or bounded-pool fan-out over ranks with
//!   aggregate failure reporting.
//!
//! Parallelism context ([`mapping::Mapping`]) and MoE settings
//! ([`moe::MoeConfig`]) are immutable values passed explicitly; nothing here
//! relies on ambient state.

pub mod calibration;
pub mod config;
pub mod convert;
pub mod entry;
pub mod executor;
pub mod mapping;
pub mod model;
pub mod moe;
pub mod quant;
pub mod split;
pub mod weights;

pub use calibration::{
    capture_activation_ranges, ActivationRanges, CalibrationForward, CalibrationSource,
    RangeObserver, TextCalibrationSource,
};
pub use config::{DbrxConfig, EngineConfig};
pub use convert::{convert_rank, ConvertOptions, RankWeights};
pub use entry::{save_checkpoint, TensorEntry};
pub use executor::{run_ranks, RankFailures};
pub use mapping::Mapping;
pub use model::DbrxCalibrationModel;
pub use moe::{MoeConfig, MoeNormalization, MoeParallelism};
pub use quant::{generate_int8, quantize_weight_only, WeightOnlyPrecision};
pub use split::{split, split_qkv};
pub use weights::WeightMap;
