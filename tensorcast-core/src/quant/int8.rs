//! Int8 scale derivation from calibrated activation ranges.
//!
//! Two GEMM backends consume the converted checkpoint and they disagree on
//! scaling granularity: one takes separate activation and weight scales and
//! supports per-column weight scales, the other takes a single pre-multiplied
//! accumulator scale. Both variants are derived here, per tensor and per
//! column, together with the quantized weight under each scheme.
//!
//! A fused QKV projection is logically three matrices, so "per tensor"
//! means one scale for each of Q, K, and V. With uniform head counts the
//! weight range reshapes into three equal groups; under grouped-query
//! attention the sub-ranges have their true (unequal) widths, and the
//! per-tensor scales are broadcast out to per-column width so the final
//! division lines up with the fused layout.

use candle_core::{DType, Result, Tensor};

use crate::calibration::RangeEntry;
use crate::entry::TensorEntry;

/// Shape of the fused weight handed to [`generate_int8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// An ordinary (non-fused) projection.
    Standard,
    /// Fused QKV with equal Q/K/V widths, reshaped `[hidden, 3, hidden]`.
    FusedUniform,
    /// Fused QKV under grouped-query attention, `[hidden, hidden + 2 * kv]`.
    FusedGrouped,
}

/// The derived scale families and quantized weights, all single precision.
#[derive(Debug)]
pub struct Int8Scales {
    /// fp activation -> int8 activation (per tensor).
    pub scale_x_orig_quant: Tensor,
    /// int8 output -> fp output (per tensor).
    pub scale_y_quant_orig: Tensor,
    /// int8 weight -> fp weight, per tensor (broadcast to per-column width
    /// for fused QKV layouts).
    pub scale_w_quant_orig: Tensor,
    /// int8 weight -> fp weight, true per-column.
    pub scale_w_quant_orig_col: Tensor,
    /// int32 accumulator -> int8 output, per tensor (broadcast as above).
    pub scale_y_accum_quant: Tensor,
    /// int32 accumulator -> int8 output, per column.
    pub scale_y_accum_quant_col: Tensor,
    /// Weight quantized with the per-tensor scheme.
    pub weight_int8: TensorEntry,
    /// Weight quantized with the per-column scheme.
    pub weight_int8_col: TensorEntry,
}

/// Derive int8 scales and quantized weights for one projection.
///
/// `weight` is oriented with output channels on the last axis (the fused QKV
/// weight is passed transposed). `ranges.w` must cover the same output
/// channels; it arrives floor-clamped from calibration, so its reciprocal is
/// finite. Activation ranges are not floor-clamped: a channel that never
/// fired during calibration is an error here, not a silent scale of zero.
pub fn generate_int8(weight: &Tensor, ranges: &RangeEntry, layout: QkvLayout) -> Result<Int8Scales> {
    let device = weight.device().clone();
    let weight = weight.to_dtype(DType::F32)?.contiguous()?;
    let w_range = ranges.w.to_dtype(DType::F32)?;

    let x_max = max_all(&ranges.x)?;
    let y_max = max_all(&ranges.y)?;
    if x_max <= 0.0 || y_max <= 0.0 {
        candle_core::bail!(
            "degenerate activation range (x_max={x_max}, y_max={y_max}); \
             calibration did not exercise this layer"
        );
    }
    let scale_x_orig_quant = Tensor::new(127.0 / x_max, &device)?;
    let scale_y_orig_quant = 127.0 / y_max;
    let scale_y_quant_orig = Tensor::new(y_max / 127.0, &device)?;
    // scale_y_accum_quant = scale_y_orig_quant / (scale_x_orig_quant * scale_w_orig_quant),
    // folded into one multiplier applied to 1 / scale_w_orig_quant below.
    let accum = scale_y_orig_quant / (127.0 / x_max);

    // Per-column variants are layout-independent: true per-channel values.
    let scale_w_quant_orig_col;
    let scale_y_accum_quant_col;

    let (scale_w_quant_orig, scale_y_accum_quant, weight_int8, weight_int8_col) = match layout {
        QkvLayout::Standard => {
            let w_max = max_all(&w_range)?;
            let scale_w_orig_quant_t = Tensor::new(127.0 / w_max, &device)?;
            let scale_w_orig_quant_c = w_range.recip()?.affine(127.0, 0.0)?;

            scale_w_quant_orig_col = w_range.affine(1.0 / 127.0, 0.0)?;
            scale_y_accum_quant_col = w_range.affine((accum / 127.0) as f64, 0.0)?;

            let weight_int8 =
                TensorEntry::int8_from_f32(&weight.broadcast_mul(&scale_w_orig_quant_t)?)?;
            let weight_int8_col =
                TensorEntry::int8_from_f32(&weight.broadcast_mul(&scale_w_orig_quant_c)?)?;

            (
                Tensor::new(w_max / 127.0, &device)?,
                Tensor::new(accum * w_max / 127.0, &device)?,
                weight_int8,
                weight_int8_col,
            )
        }
        QkvLayout::FusedUniform => {
            let local_dim = w_range.dim(0)?;
            if local_dim % 3 != 0 {
                candle_core::bail!(
                    "fused QKV range of width {local_dim} does not divide into 3 groups"
                );
            }
            let group = local_dim / 3;
            let w3 = w_range.reshape((3, group))?;
            // One scale per Q/K/V group, kept column-broadcastable.
            let t_max = w3.max_keepdim(1)?;
            let scale_w_orig_quant_t = t_max.recip()?.affine(127.0, 0.0)?;
            let scale_w_orig_quant_c = w3.recip()?.affine(127.0, 0.0)?;

            scale_w_quant_orig_col = w3.affine(1.0 / 127.0, 0.0)?;
            scale_y_accum_quant_col = w3.affine((accum / 127.0) as f64, 0.0)?;

            let scale_w_quant_orig = t_max
                .affine(1.0 / 127.0, 0.0)?
                .broadcast_as((3, group))?
                .contiguous()?;
            let scale_y_accum_quant = t_max
                .affine((accum / 127.0) as f64, 0.0)?
                .broadcast_as((3, group))?
                .contiguous()?;

            // weight is [hidden, 3, group]; [3, 1] and [3, group] broadcast
            // over the leading axis.
            let weight_int8 =
                TensorEntry::int8_from_f32(&weight.broadcast_mul(&scale_w_orig_quant_t)?)?;
            let weight_int8_col =
                TensorEntry::int8_from_f32(&weight.broadcast_mul(&scale_w_orig_quant_c)?)?;

            (
                scale_w_quant_orig,
                scale_y_accum_quant,
                weight_int8,
                weight_int8_col,
            )
        }
        QkvLayout::FusedGrouped => {
            let hidden_dim = weight.dim(0)?;
            let local_dim = w_range.dim(0)?;
            if local_dim <= hidden_dim || (local_dim - hidden_dim) % 2 != 0 {
                candle_core::bail!(
                    "grouped QKV range of width {local_dim} does not decompose into \
                     query width {hidden_dim} plus two equal key/value blocks"
                );
            }
            let kv_dim = (local_dim - hidden_dim) / 2;
            let q_max = max_all(&w_range.narrow(0, 0, hidden_dim)?)?;
            let k_max = max_all(&w_range.narrow(0, hidden_dim, kv_dim)?)?;
            let v_max = max_all(&w_range.narrow(0, hidden_dim + kv_dim, kv_dim)?)?;

            let scale_w_orig_quant_c = w_range.recip()?.affine(127.0, 0.0)?;
            scale_w_quant_orig_col = w_range.affine(1.0 / 127.0, 0.0)?;
            scale_y_accum_quant_col = w_range.affine((accum / 127.0) as f64, 0.0)?;

            // Per-tensor scales broadcast out to the true sub-range widths.
            let broadcast_groups = |q: f32, k: f32, v: f32| -> Result<Tensor> {
                Tensor::cat(
                    &[
                        &Tensor::full(q, hidden_dim, &device)?,
                        &Tensor::full(k, kv_dim, &device)?,
                        &Tensor::full(v, kv_dim, &device)?,
                    ],
                    0,
                )
            };
            let scale_w_quant_orig =
                broadcast_groups(q_max / 127.0, k_max / 127.0, v_max / 127.0)?;
            let scale_y_accum_quant = broadcast_groups(
                accum * q_max / 127.0,
                accum * k_max / 127.0,
                accum * v_max / 127.0,
            )?;

            // Group widths differ, so quantization divides by the broadcast
            // dequantization scale instead of multiplying by one fused scale.
            let weight_int8 =
                TensorEntry::int8_from_f32(&weight.broadcast_div(&scale_w_quant_orig)?)?;
            let weight_int8_col =
                TensorEntry::int8_from_f32(&weight.broadcast_mul(&scale_w_orig_quant_c)?)?;

            (
                scale_w_quant_orig,
                scale_y_accum_quant,
                weight_int8,
                weight_int8_col,
            )
        }
    };

    Ok(Int8Scales {
        scale_x_orig_quant,
        scale_y_quant_orig,
        scale_w_quant_orig,
        scale_w_quant_orig_col,
        scale_y_accum_quant,
        scale_y_accum_quant_col,
        weight_int8,
        weight_int8_col,
    })
}

fn max_all(tensor: &Tensor) -> Result<f32> {
    tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn entry(x: &[f32], y: &[f32], w: &[f32]) -> RangeEntry {
        let dev = Device::Cpu;
        RangeEntry {
            x: Tensor::new(x, &dev).unwrap(),
            y: Tensor::new(y, &dev).unwrap(),
            w: Tensor::new(w, &dev).unwrap(),
        }
    }

    #[test]
    fn test_standard_round_trip_bound() {
        let dev = Device::Cpu;
        let weight = Tensor::new(
            &[[0.8f32, -0.2, 0.05, -1.6], [0.4, 0.7, -0.3, 1.2]],
            &dev,
        )
        .unwrap();
        // Per-output-channel max abs of the columns above.
        let ranges = entry(&[2.0, 1.0], &[3.0, 1.5, 0.5, 4.0], &[0.8, 0.7, 0.3, 1.6]);

        let scales = generate_int8(&weight, &ranges, QkvLayout::Standard).unwrap();
        let s = scales.scale_w_quant_orig.to_scalar::<f32>().unwrap();
        assert!((s - 1.6 / 127.0).abs() < 1e-7);

        // dequantize(quantize(w)) stays within half a quantization step.
        let q = scales.weight_int8.as_i8().unwrap();
        let w = weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (qi, wi) in q.iter().zip(w.iter()) {
            let dequant = *qi as f32 * s;
            assert!((dequant - wi).abs() <= 0.5 * s + 1e-6);
        }
    }

    #[test]
    fn test_standard_scalar_scales() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[1.0f32, -2.0]], &dev).unwrap();
        let ranges = entry(&[4.0], &[8.0], &[1.0, 2.0]);
        let scales = generate_int8(&weight, &ranges, QkvLayout::Standard).unwrap();

        assert!(
            (scales.scale_x_orig_quant.to_scalar::<f32>().unwrap() - 127.0 / 4.0).abs() < 1e-6
        );
        assert!(
            (scales.scale_y_quant_orig.to_scalar::<f32>().unwrap() - 8.0 / 127.0).abs() < 1e-6
        );
        // scale_y_accum_quant = sy / (sx * sw) with sy = 127/8, sx = 127/4, sw = 127/2.
        let expected = (127.0 / 8.0) / ((127.0 / 4.0) * (127.0 / 2.0));
        assert!((scales.scale_y_accum_quant.to_scalar::<f32>().unwrap() - expected).abs() < 1e-7);
        assert_eq!(scales.scale_w_quant_orig_col.dims(), &[2]);
        assert_eq!(scales.scale_y_accum_quant_col.dims(), &[2]);
    }

    #[test]
    fn test_fused_uniform_group_scales() {
        let dev = Device::Cpu;
        // hidden = 2, fused width 6 -> reshaped [2, 3, 2].
        let weight = Tensor::arange(0f32, 12f32, &dev)
            .unwrap()
            .reshape((2, 3, 2))
            .unwrap();
        let w = [1.0f32, 2.0, 0.5, 0.25, 4.0, 1.0];
        let ranges = entry(&[1.0, 1.0], &[1.0; 6], &w);

        let scales = generate_int8(&weight, &ranges, QkvLayout::FusedUniform).unwrap();
        // Per-tensor scales are per Q/K/V group, broadcast to column width.
        assert_eq!(scales.scale_w_quant_orig.dims(), &[3, 2]);
        let t = scales.scale_w_quant_orig.to_vec2::<f32>().unwrap();
        assert!((t[0][0] - 2.0 / 127.0).abs() < 1e-7);
        assert!((t[0][1] - 2.0 / 127.0).abs() < 1e-7);
        assert!((t[1][0] - 0.5 / 127.0).abs() < 1e-7);
        assert!((t[2][0] - 4.0 / 127.0).abs() < 1e-7);

        let c = scales.scale_w_quant_orig_col.to_vec2::<f32>().unwrap();
        assert!((c[1][1] - 0.25 / 127.0).abs() < 1e-8);

        assert_eq!(scales.weight_int8.shape(), &[2, 3, 2]);
        assert_eq!(scales.weight_int8_col.shape(), &[2, 3, 2]);
    }

    #[test]
    fn test_fused_grouped_divides_by_broadcast_scale() {
        let dev = Device::Cpu;
        // hidden = 2, kv = 1: fused width 4, weight is [hidden, 4].
        let weight = Tensor::new(&[[1.0f32, -0.5, 0.3, 0.6], [0.2, 2.0, -0.3, -0.6]], &dev)
            .unwrap();
        let w = [1.0f32, 2.0, 0.3, 0.6];
        let ranges = entry(&[1.0, 1.0], &[1.0; 4], &w);

        let scales = generate_int8(&weight, &ranges, QkvLayout::FusedGrouped).unwrap();
        // Q group max is 2.0 (columns 0-1), K is 0.3, V is 0.6.
        let t = scales.scale_w_quant_orig.to_vec1::<f32>().unwrap();
        assert_eq!(t.len(), 4);
        assert!((t[0] - 2.0 / 127.0).abs() < 1e-7);
        assert!((t[1] - 2.0 / 127.0).abs() < 1e-7);
        assert!((t[2] - 0.3 / 127.0).abs() < 1e-7);
        assert!((t[3] - 0.6 / 127.0).abs() < 1e-7);

        // Column 3 holds the V maximum, so it quantizes to exactly +/-127.
        let q = scales.weight_int8.as_i8().unwrap();
        assert_eq!(q[3], 127);
        assert_eq!(q[7], -127);
        // K column: 0.3 / (0.3/127) = 127.
        assert_eq!(q[2], 127);
    }

    #[test]
    fn test_zero_activation_range_fails() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[1.0f32]], &dev).unwrap();
        let ranges = entry(&[0.0], &[1.0], &[1.0]);
        assert!(generate_int8(&weight, &ranges, QkvLayout::Standard).is_err());
    }

    #[test]
    fn test_malformed_fused_range_fails() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0]], &dev).unwrap();
        let ranges = entry(&[1.0], &[1.0], &[1.0, 1.0, 1.0, 1.0]);
        assert!(generate_int8(&weight, &ranges, QkvLayout::FusedUniform).is_err());
    }
}
