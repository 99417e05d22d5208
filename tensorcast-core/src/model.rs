//! Compact DBRX decoder forward pass for calibration.
//!
//! This is a calibration collaborator, not an inference engine: it runs the
//! decoder eagerly on CPU in f32, with no KV cache and no sampling, and
//! reports every linear-layer evaluation (fused QKV, attention output,
//! router, LM head) through the [`RangeObserver`] so activation ranges can be
//! captured on real text.
//!
//! Layer structure follows the source model: pre-norm attention with rotary
//! embeddings and optional QKV clamping, then a softmax top-k
//! mixture-of-experts GLU feed-forward.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::{silu, softmax_last_dim};
use candle_nn::{LayerNorm, Module};

use crate::calibration::{CalibrationForward, RangeObserver};
use crate::config::DbrxConfig;
use crate::convert::expert_matrix;
use crate::moe::{MoeConfig, MoeNormalization};
use crate::weights::WeightMap;

const NORM_EPS: f64 = 1e-5;

struct DecoderBlock {
    layer: usize,
    norm_1: LayerNorm,
    norm_2: LayerNorm,
    /// Fused QKV projection, `[hidden + 2 * kv_dim, hidden]`.
    wqkv: Tensor,
    out_proj: Tensor,
    /// Router, `[experts, hidden]`.
    router: Tensor,
    /// Expert projections, `[experts, ffn, hidden]`.
    w1: Tensor,
    v1: Tensor,
    w2: Tensor,
}

/// CPU calibration model over a loaded DBRX parameter map.
pub struct DbrxCalibrationModel {
    wte: Tensor,
    blocks: Vec<DecoderBlock>,
    norm_f: LayerNorm,
    lm_head: Tensor,
    cos: Tensor,
    sin: Tensor,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    hidden: usize,
    kv_dim: usize,
    clip_qkv: Option<f64>,
    top_k: usize,
    normalization: MoeNormalization,
}

impl DbrxCalibrationModel {
    pub fn new(params: &WeightMap, cfg: &DbrxConfig, moe: &MoeConfig) -> Result<Self> {
        if !moe.has_moe() {
            candle_core::bail!("DBRX calibration model requires an MoE configuration");
        }
        let head_dim = cfg.head_dim();
        if head_dim % 2 != 0 {
            candle_core::bail!("rotary embeddings require an even head dim, got {head_dim}");
        }
        let dtype = DType::F32;
        let (num_experts, ffn, hidden) =
            (moe.num_experts, cfg.ffn_config.ffn_hidden_size, cfg.d_model);

        let mut blocks = Vec::with_capacity(cfg.n_layers);
        for layer in 0..cfg.n_layers {
            let p = format!("transformer.blocks.{layer}");
            let expert = |suffix: &str| -> Result<Tensor> {
                let name = format!("{p}.ffn.experts.mlp.{suffix}");
                expert_matrix(
                    &params.weight(&name, dtype)?,
                    num_experts,
                    ffn,
                    hidden,
                    &name,
                )
            };
            blocks.push(DecoderBlock {
                layer,
                norm_1: LayerNorm::new_no_bias(
                    params.weight(&format!("{p}.norm_attn_norm.norm_1"), dtype)?,
                    NORM_EPS,
                ),
                norm_2: LayerNorm::new_no_bias(
                    params.weight(&format!("{p}.norm_attn_norm.norm_2"), dtype)?,
                    NORM_EPS,
                ),
                wqkv: params.weight(&format!("{p}.norm_attn_norm.attn.Wqkv"), dtype)?,
                out_proj: params.weight(&format!("{p}.norm_attn_norm.attn.out_proj"), dtype)?,
                router: params.weight(&format!("{p}.ffn.router.layer"), dtype)?,
                w1: expert("w1")?,
                v1: expert("v1")?,
                w2: expert("w2")?,
            });
        }

        let wte = params.weight("transformer.wte", dtype)?;
        let lm_head = match params.try_weight("lm_head", dtype)? {
            Some(head) => head,
            None => wte.clone(),
        };
        let (cos, sin) = rope_cache(
            cfg.max_seq_len,
            head_dim,
            cfg.attn_config.rope_theta,
            wte.device(),
        )?;

        Ok(Self {
            wte,
            blocks,
            norm_f: LayerNorm::new_no_bias(params.weight("transformer.norm_f", dtype)?, NORM_EPS),
            lm_head,
            cos,
            sin,
            n_heads: cfg.n_heads,
            n_kv_heads: cfg.attn_config.kv_n_heads,
            head_dim,
            hidden: cfg.d_model,
            kv_dim: cfg.kv_dim(),
            clip_qkv: cfg.attn_config.clip_qkv,
            top_k: moe.top_k,
            normalization: moe.normalization,
        })
    }

    fn attention(
        &self,
        block: &DecoderBlock,
        x: &Tensor,
        mask: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        observer: &mut RangeObserver,
    ) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let qkv_name = format!(
            "transformer.blocks.{}.norm_attn_norm.attn.Wqkv",
            block.layer
        );
        let qkv = observed_linear(&qkv_name, &block.wqkv, x, observer)?;
        let qkv = match self.clip_qkv {
            Some(clip) => qkv.clamp(-clip as f32, clip as f32)?,
            None => qkv,
        };

        let q = qkv.narrow(D::Minus1, 0, self.hidden)?;
        let k = qkv.narrow(D::Minus1, self.hidden, self.kv_dim)?;
        let v = qkv.narrow(D::Minus1, self.hidden + self.kv_dim, self.kv_dim)?;

        let q = q
            .contiguous()?
            .reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .contiguous()?
            .reshape((b, t, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .contiguous()?
            .reshape((b, t, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = candle_nn::rotary_emb::rope(&q, cos, sin)?;
        let k = candle_nn::rotary_emb::rope(&k, cos, sin)?;

        let n_rep = self.n_heads / self.n_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let probs = softmax_last_dim(&scores.broadcast_add(mask)?)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.hidden))?;

        let out_name = format!(
            "transformer.blocks.{}.norm_attn_norm.attn.out_proj",
            block.layer
        );
        observed_linear(&out_name, &block.out_proj, &context, observer)
    }

    fn moe_ffn(
        &self,
        block: &DecoderBlock,
        x: &Tensor,
        observer: &mut RangeObserver,
    ) -> Result<Tensor> {
        let (b, t, hidden) = x.dims3()?;
        let num_experts = block.router.dim(0)?;

        let router_name = format!("transformer.blocks.{}.ffn.router.layer", block.layer);
        let logits = observed_linear(&router_name, &block.router, x, observer)?;
        let probs = softmax_last_dim(&logits.reshape(((), num_experts))?)?;
        let rows = probs.to_vec2::<f32>()?;

        // Token-to-expert assignment, one gather per selected expert.
        let mut top_tokens: Vec<Vec<u32>> = vec![Vec::new(); num_experts];
        let mut top_weights: Vec<Vec<f32>> = vec![Vec::new(); num_experts];
        for (row_idx, row) in rows.iter().enumerate() {
            let mut order: Vec<usize> = (0..num_experts).collect();
            order.sort_by(|&i, &j| row[j].total_cmp(&row[i]));
            let selected = &order[..self.top_k];
            let denom = match self.normalization {
                MoeNormalization::Renormalize => selected.iter().map(|&e| row[e]).sum::<f32>(),
                MoeNormalization::None => 1.0,
            };
            for &e in selected {
                top_tokens[e].push(row_idx as u32);
                top_weights[e].push(row[e] / denom);
            }
        }

        let x_flat = x.reshape(((), hidden))?;
        let mut out = x_flat.zeros_like()?;
        for e in 0..num_experts {
            if top_tokens[e].is_empty() {
                continue;
            }
            let idx = Tensor::new(top_tokens[e].as_slice(), x.device())?;
            let weights = Tensor::new(top_weights[e].as_slice(), x.device())?.reshape(((), 1))?;

            let xe = x_flat.index_select(&idx, 0)?;
            let gate = xe.matmul(&block.w1.get(e)?.t()?.contiguous()?)?;
            let up = xe.matmul(&block.v1.get(e)?.t()?.contiguous()?)?;
            let h = (silu(&gate)? * up)?;
            let expert_out = h.matmul(&block.w2.get(e)?.contiguous()?)?;
            out = out.index_add(&idx, &expert_out.broadcast_mul(&weights)?, 0)?;
        }
        out.reshape((b, t, hidden))
    }
}

impl CalibrationForward for DbrxCalibrationModel {
    fn forward_calibrate(&self, input_ids: &Tensor, observer: &mut RangeObserver) -> Result<()> {
        let (b, t) = input_ids.dims2()?;
        let mut x = self
            .wte
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, t, self.hidden))?;

        let mask = causal_mask(t, x.device())?;
        let cos = self.cos.narrow(0, 0, t)?.contiguous()?;
        let sin = self.sin.narrow(0, 0, t)?.contiguous()?;

        for block in &self.blocks {
            let attn = self.attention(block, &block.norm_1.forward(&x)?, &mask, &cos, &sin, observer)?;
            let x_attn = (&x + &attn)?;
            let ffn = self.moe_ffn(block, &block.norm_2.forward(&x_attn)?, observer)?;
            x = (&x_attn + &ffn)?;
        }

        let x = self.norm_f.forward(&x)?;
        observed_linear("lm_head", &self.lm_head, &x, observer)?;
        Ok(())
    }
}

/// Evaluate `input @ weight.t()` and report it to the observer.
fn observed_linear(
    name: &str,
    weight: &Tensor,
    input: &Tensor,
    observer: &mut RangeObserver,
) -> Result<Tensor> {
    let output = input.broadcast_matmul(&weight.t()?)?;
    observer.record(name, weight, input, &output)?;
    Ok(output)
}

fn rope_cache(max_seq: usize, head_dim: usize, theta: f64, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| 1f32 / (theta as f32).powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions = Tensor::arange(0u32, max_seq as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((max_seq, 1))?;
    let freqs = positions.matmul(&inv_freq)?;
    Ok((freqs.cos()?, freqs.sin()?))
}

fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..t)
        .flat_map(|i| (0..t).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(values, (t, t), device)
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, t, d) = x.dims4()?;
    Tensor::cat(&vec![&x; n_rep], 2)?.reshape((b, n_kv * n_rep, t, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_blocks_future_positions() {
        let mask = causal_mask(3, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][1], f32::NEG_INFINITY);
        assert_eq!(rows[2][1], 0.0);
    }

    #[test]
    fn test_repeat_kv_duplicates_heads() {
        let dev = Device::Cpu;
        let x = Tensor::arange(0f32, 8f32, &dev)
            .unwrap()
            .reshape((1, 2, 2, 2))
            .unwrap();
        let repeated = repeat_kv(x, 2).unwrap();
        assert_eq!(repeated.dims(), &[1, 4, 2, 2]);
        // Each kv head appears twice, in order: [kv0, kv0, kv1, kv1].
        let flat = repeated.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(
            flat,
            vec![0., 1., 2., 3., 0., 1., 2., 3., 4., 5., 6., 7., 4., 5., 6., 7.]
        );
    }

    #[test]
    fn test_rope_cache_shapes() {
        let (cos, sin) = rope_cache(16, 4, 10_000.0, &Device::Cpu).unwrap();
        assert_eq!(cos.dims(), &[16, 2]);
        assert_eq!(sin.dims(), &[16, 2]);
        // Position 0 rotates by nothing.
        assert_eq!(cos.get(0).unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(sin.get(0).unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
    }
}
