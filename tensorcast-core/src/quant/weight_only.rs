//! Weight-only quantization (int8 / int4 with per-channel scales).
//!
//! Applied uniformly to every linear projection when weight-only
//! quantization is requested; activations stay in full precision. The weight
//! is re-oriented so output channels sit on the last axis, a symmetric
//! per-output-channel scale is derived, and the quantized values are stored
//! one per byte (int8) or packed two per byte (int4, even column in the low
//! nibble). Orthogonal to the activation-aware int8 path, which serves
//! KV-cache scales only.

use candle_core::{DType, Device, Result, Tensor};
use rayon::prelude::*;

use crate::entry::TensorEntry;

/// Target precision for weight-only quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightOnlyPrecision {
    Int8,
    Int4,
}

impl WeightOnlyPrecision {
    /// Quantization algorithm name recorded in the engine config.
    pub fn quant_algo(self) -> &'static str {
        match self {
            WeightOnlyPrecision::Int8 => "W8A16",
            WeightOnlyPrecision::Int4 => "W4A16",
        }
    }

    fn max_q(self) -> f32 {
        match self {
            WeightOnlyPrecision::Int8 => 127.0,
            WeightOnlyPrecision::Int4 => 7.0,
        }
    }
}

/// A quantized projection: packed weight plus per-output-channel scales.
#[derive(Debug)]
pub struct PackedWeight {
    pub weight: TensorEntry,
    /// F32 scales, `[n]` for a 2-D weight or `[experts, n]` for a stacked
    /// expert weight.
    pub per_channel_scale: Tensor,
}

/// Quantize one projection weight.
///
/// `weight` is `[out, in]`, or `[experts, out, in]` for stacked expert
/// weights; each expert matrix gets its own scale row. Int4 requires an even
/// output-channel count (two columns share a byte).
pub fn quantize_weight_only(weight: &Tensor, precision: WeightOnlyPrecision) -> Result<PackedWeight> {
    // Re-orient so output channels are the last axis.
    let v = match weight.rank() {
        2 => weight.t()?,
        3 => weight.transpose(1, 2)?,
        r => candle_core::bail!("weight-only quantization expects a 2-D or 3-D weight, got rank {r}"),
    }
    .contiguous()?
    .to_dtype(DType::F32)?;

    let dims = v.dims().to_vec();
    let n = dims[dims.len() - 1];
    let k = dims[dims.len() - 2];
    let batch: usize = dims[..dims.len() - 2].iter().product();
    let max_q = precision.max_q();
    if precision == WeightOnlyPrecision::Int4 && n % 2 != 0 {
        candle_core::bail!("int4 packing requires an even output-channel count, got {n}");
    }

    let flat = v.flatten_all()?.to_vec1::<f32>()?;

    // Symmetric per-output-channel scales, one row per batched matrix.
    let scales: Vec<f32> = (0..batch * n)
        .into_par_iter()
        .map(|idx| {
            let (b, j) = (idx / n, idx % n);
            let base = b * k * n;
            let mut max_abs = 0f32;
            for i in 0..k {
                max_abs = max_abs.max(flat[base + i * n + j].abs());
            }
            if max_abs > 0.0 {
                max_abs / max_q
            } else {
                1.0
            }
        })
        .collect();

    let quantized: Vec<Vec<i8>> = flat
        .par_chunks(n)
        .enumerate()
        .map(|(row, values)| {
            let scale_base = (row / k) * n;
            values
                .iter()
                .enumerate()
                .map(|(j, &value)| {
                    (value / scales[scale_base + j])
                        .round()
                        .clamp(-max_q, max_q) as i8
                })
                .collect()
        })
        .collect();

    let weight = match precision {
        WeightOnlyPrecision::Int8 => {
            let values: Vec<i8> = quantized.into_iter().flatten().collect();
            TensorEntry::int8(values, dims.clone())?
        }
        WeightOnlyPrecision::Int4 => {
            let packed: Vec<u8> = quantized
                .into_iter()
                .flat_map(|row| {
                    row.chunks_exact(2)
                        .map(|pair| (pair[0] as u8 & 0x0f) | ((pair[1] as u8) << 4))
                        .collect::<Vec<_>>()
                })
                .collect();
            let mut packed_dims = dims.clone();
            *packed_dims.last_mut().unwrap() = n / 2;
            TensorEntry::packed_int4(packed, packed_dims)?
        }
    };

    let scale_shape: Vec<usize> = if dims.len() == 2 {
        vec![n]
    } else {
        vec![batch, n]
    };
    let per_channel_scale = Tensor::from_vec(scales, scale_shape, &Device::Cpu)?;

    Ok(PackedWeight {
        weight,
        per_channel_scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int8_per_channel_round_trip() {
        let dev = Device::Cpu;
        // [out=3, in=2]; re-oriented to [2, 3].
        let weight = Tensor::new(&[[1.0f32, -0.5], [0.25, 2.0], [0.0, -4.0]], &dev).unwrap();
        let packed = quantize_weight_only(&weight, WeightOnlyPrecision::Int8).unwrap();

        assert_eq!(packed.weight.shape(), &[2, 3]);
        let scales = packed.per_channel_scale.to_vec1::<f32>().unwrap();
        assert_eq!(scales.len(), 3);
        assert!((scales[0] - 1.0 / 127.0).abs() < 1e-7);
        assert!((scales[2] - 4.0 / 127.0).abs() < 1e-7);

        let q = packed.weight.as_i8().unwrap();
        let original = weight
            .t()
            .unwrap()
            .contiguous()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (idx, (&qi, &wi)) in q.iter().zip(original.iter()).enumerate() {
            let scale = scales[idx % 3];
            assert!((qi as f32 * scale - wi).abs() <= 0.5 * scale + 1e-6);
        }
    }

    #[test]
    fn test_zero_channel_gets_unit_scale() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[0.0f32, 0.0], [1.0, 1.0]], &dev).unwrap();
        // Re-oriented columns are the output channels; channel 0 is all zero.
        let packed = quantize_weight_only(&weight, WeightOnlyPrecision::Int8).unwrap();
        let scales = packed.per_channel_scale.to_vec1::<f32>().unwrap();
        assert_eq!(scales[0], 1.0);
        let q = packed.weight.as_i8().unwrap();
        assert_eq!(q[0], 0);
        assert_eq!(q[2], 0);
    }

    #[test]
    fn test_int4_nibble_packing() {
        let dev = Device::Cpu;
        // [out=2, in=1]: re-oriented [1, 2], columns quantize to -7 and 7.
        let weight = Tensor::new(&[[-1.0f32], [2.0]], &dev).unwrap();
        let packed = quantize_weight_only(&weight, WeightOnlyPrecision::Int4).unwrap();

        assert_eq!(packed.weight.shape(), &[1, 1]);
        // -7 -> 0x9 low nibble, 7 -> 0x7 high nibble.
        assert_eq!(packed.weight.data(), &[0x79]);
        let scales = packed.per_channel_scale.to_vec1::<f32>().unwrap();
        assert!((scales[0] - 1.0 / 7.0).abs() < 1e-7);
        assert!((scales[1] - 2.0 / 7.0).abs() < 1e-7);
    }

    #[test]
    fn test_int4_odd_channels_rejected() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[1.0f32], [1.0], [1.0]], &dev).unwrap();
        assert!(quantize_weight_only(&weight, WeightOnlyPrecision::Int4).is_err());
    }

    #[test]
    fn test_stacked_expert_weight_per_expert_scales() {
        let dev = Device::Cpu;
        // [experts=2, out=2, in=3] -> re-oriented [2, 3, 2].
        let weight = Tensor::arange(1f32, 13f32, &dev)
            .unwrap()
            .reshape((2, 2, 3))
            .unwrap();
        let packed = quantize_weight_only(&weight, WeightOnlyPrecision::Int8).unwrap();

        assert_eq!(packed.weight.shape(), &[2, 3, 2]);
        assert_eq!(packed.per_channel_scale.dims(), &[2, 2]);
        let scales = packed.per_channel_scale.to_vec2::<f32>().unwrap();
        // Expert 0 channels max at 3 and 6; expert 1 at 9 and 12.
        assert!((scales[0][0] - 3.0 / 127.0).abs() < 1e-6);
        assert!((scales[0][1] - 6.0 / 127.0).abs() < 1e-6);
        assert!((scales[1][0] - 9.0 / 127.0).abs() < 1e-6);
        assert!((scales[1][1] - 12.0 / 127.0).abs() < 1e-6);
    }
}
