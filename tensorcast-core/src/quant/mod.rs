//! Quantization paths for the converted checkpoint.
//!
//! Two mutually exclusive schemes:
//!
//! - [`weight_only`]: int8/int4 weights with per-channel scales, activations
//!   untouched. Applied to every linear projection when requested.
//! - [`int8`]: activation-aware scale derivation from calibrated ranges.
//!   Used only to produce the int8 KV-cache scaling factor.

pub mod int8;
pub mod weight_only;

pub use int8::{generate_int8, Int8Scales, QkvLayout};
pub use weight_only::{quantize_weight_only, PackedWeight, WeightOnlyPrecision};
