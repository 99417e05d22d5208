//! Per-layer weight conversion and per-rank checkpoint assembly.
//!
//! For every decoder layer a pipeline rank owns, this module extracts the
//! attention and expert weights from the source map, shards them for the
//! rank's tensor-parallel slot, applies the requested quantization, and emits
//! them under the destination naming convention
//! `transformer.layers.{local}.{component}.{...}`, where `local` is the layer
//! index relative to the first layer of the pipeline stage. Embedding and
//! head weights are added only on the first/last stage.

use std::time::Instant;

use candle_core::{DType, Result, Tensor};
use indexmap::map::Entry;
use indexmap::IndexMap;
use tracing::info;

use crate::calibration::ActivationRanges;
use crate::config::DbrxConfig;
use crate::entry::TensorEntry;
use crate::mapping::Mapping;
use crate::moe::{MoeConfig, MoeParallelism};
use crate::quant::{generate_int8, quantize_weight_only, QkvLayout, WeightOnlyPrecision};
use crate::split::{split, split_qkv};
use crate::weights::WeightMap;

/// Conversion settings shared by every rank.
#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    /// Target dtype for unquantized weights.
    pub dtype: DType,
    /// Weight-only quantization applied to every linear projection.
    pub weight_only: Option<WeightOnlyPrecision>,
    /// Derive an int8 KV-cache scale per layer from calibrated ranges.
    pub int8_kv_cache: bool,
}

/// One rank's output: destination name to serialized tensor, in emission
/// order.
pub type RankWeights = IndexMap<String, TensorEntry>;

/// Insert under a destination name that must not already exist.
pub(crate) fn insert_unique(out: &mut RankWeights, name: String, entry: TensorEntry) -> Result<()> {
    match out.entry(name) {
        Entry::Occupied(occupied) => {
            candle_core::bail!("duplicate destination tensor name {}", occupied.key())
        }
        Entry::Vacant(vacant) => {
            vacant.insert(entry);
            Ok(())
        }
    }
}

/// Emit one linear projection under `prefix` (trailing dot included),
/// quantizing it if weight-only quantization is enabled.
fn insert_linear(
    out: &mut RankWeights,
    prefix: &str,
    weight: &Tensor,
    bias: Option<&Tensor>,
    weight_only: Option<WeightOnlyPrecision>,
    dtype: DType,
) -> Result<()> {
    if let Some(precision) = weight_only {
        let packed = quantize_weight_only(weight, precision)?;
        insert_unique(out, format!("{prefix}weight"), packed.weight)?;
        insert_unique(
            out,
            format!("{prefix}per_channel_scale"),
            TensorEntry::from_tensor(&packed.per_channel_scale.to_dtype(dtype)?)?,
        )?;
    } else {
        insert_unique(
            out,
            format!("{prefix}weight"),
            TensorEntry::from_tensor(weight)?,
        )?;
    }
    if let Some(bias) = bias {
        insert_unique(out, format!("{prefix}bias"), TensorEntry::from_tensor(bias)?)?;
    }
    Ok(())
}

/// Reinterpret a flattened expert-major weight as `[experts, ffn, hidden]`.
///
/// The source stores the three expert projections stacked along a single
/// leading axis of size `experts * ffn_hidden`; the reshape is only legal
/// when the stored shape matches that contract exactly.
pub(crate) fn expert_matrix(
    weight: &Tensor,
    num_experts: usize,
    ffn_hidden: usize,
    hidden: usize,
    name: &str,
) -> Result<Tensor> {
    if weight.dims() != [num_experts * ffn_hidden, hidden] {
        candle_core::bail!(
            "{name} has shape {:?}, expected [{} * {ffn_hidden}, {hidden}] expert-major storage",
            weight.dims(),
            num_experts
        );
    }
    weight.reshape((num_experts, ffn_hidden, hidden))
}

#[allow(clippy::too_many_arguments)]
fn convert_layer(
    params: &WeightMap,
    cfg: &DbrxConfig,
    mapping: &Mapping,
    moe: &MoeConfig,
    opts: &ConvertOptions,
    act_ranges: Option<&ActivationRanges>,
    layer: usize,
    first_layer: usize,
    out: &mut RankWeights,
) -> Result<()> {
    let src = format!("transformer.blocks.{layer}");
    let dst = format!("transformer.layers.{}", layer - first_layer);
    let (tp_size, tp_rank) = (mapping.tp_size(), mapping.tp_rank());

    // Attention QKV (no bias).
    let qkv_name = format!("{src}.norm_attn_norm.attn.Wqkv");
    let qkv = params.weight(&qkv_name, opts.dtype)?;
    let qkv_shard = split_qkv(
        &qkv,
        cfg.n_heads,
        cfg.attn_config.kv_n_heads,
        cfg.d_model,
        tp_size,
        tp_rank,
    )?;
    insert_linear(
        out,
        &format!("{dst}.attention.qkv."),
        &qkv_shard,
        None,
        opts.weight_only,
        opts.dtype,
    )?;

    // Attention dense consumes the sharded hidden dimension: row split.
    let dense = params.weight(&format!("{src}.norm_attn_norm.attn.out_proj"), opts.dtype)?;
    let dense_shard = split(&dense, tp_size, tp_rank, 1)?;
    insert_linear(
        out,
        &format!("{dst}.attention.dense."),
        &dense_shard,
        None,
        opts.weight_only,
        opts.dtype,
    )?;

    if opts.int8_kv_cache {
        let ranges = act_ranges.ok_or_else(|| {
            candle_core::Error::Msg(
                "int8 KV cache requested but no activation ranges were captured".to_string(),
            )
        })?;
        let entry = ranges.get(&qkv_name).ok_or_else(|| {
            candle_core::Error::Msg(format!("no calibrated activation range for {qkv_name}"))
        })?;
        // Scales derive from the unsplit weight so they are identical on
        // every rank.
        let qkv_t = qkv.t()?.contiguous()?;
        let (qkv_t, layout) = if cfg.multi_query_mode() {
            (qkv_t, QkvLayout::FusedGrouped)
        } else {
            (
                qkv_t.reshape((cfg.d_model, 3, cfg.d_model))?,
                QkvLayout::FusedUniform,
            )
        };
        let scales = generate_int8(&qkv_t, entry, layout)?;
        insert_unique(
            out,
            format!("{dst}.attention.kv_cache_scaling_factor"),
            TensorEntry::from_tensor(&scales.scale_y_quant_orig.reshape(1)?)?,
        )?;
    }

    // Layer norms are not parallelized.
    let input_ln = params.weight(&format!("{src}.norm_attn_norm.norm_1"), opts.dtype)?;
    insert_unique(
        out,
        format!("{dst}.input_layernorm.weight"),
        TensorEntry::from_tensor(&input_ln)?,
    )?;
    let post_ln = params.weight(&format!("{src}.norm_attn_norm.norm_2"), opts.dtype)?;
    insert_unique(
        out,
        format!("{dst}.post_layernorm.weight"),
        TensorEntry::from_tensor(&post_ln)?,
    )?;

    if moe.has_moe() {
        let (num_experts, ffn, hidden) = (moe.num_experts, cfg.ffn_config.ffn_hidden_size, cfg.d_model);
        // Tensor-parallel mode splits expert FFN width; expert-parallel mode
        // assigns whole experts to ranks.
        let ffn_split_dim = |transposed: bool| match moe.parallelism {
            MoeParallelism::TensorParallel => {
                if transposed {
                    2
                } else {
                    1
                }
            }
            MoeParallelism::ExpertParallel => 0,
        };

        let gate_name = format!("{src}.ffn.experts.mlp.w1");
        let gate = expert_matrix(
            &params.weight(&gate_name, opts.dtype)?,
            num_experts,
            ffn,
            hidden,
            &gate_name,
        )?;
        let gate_shard = split(&gate, tp_size, tp_rank, ffn_split_dim(false))?;

        let up_name = format!("{src}.ffn.experts.mlp.v1");
        let up = expert_matrix(
            &params.weight(&up_name, opts.dtype)?,
            num_experts,
            ffn,
            hidden,
            &up_name,
        )?;
        let up_shard = split(&up, tp_size, tp_rank, ffn_split_dim(false))?;

        // The runtime expects one fused gate+up weight, up-projection first,
        // concatenated along the FFN axis.
        let fc = Tensor::cat(&[&up_shard, &gate_shard], 1)?.contiguous()?;
        insert_linear(
            out,
            &format!("{dst}.mlp.fc."),
            &fc,
            None,
            opts.weight_only,
            opts.dtype,
        )?;

        // Down projection stores [ffn, hidden] per expert; the runtime's
        // matmul convention wants [hidden, ffn].
        let down_name = format!("{src}.ffn.experts.mlp.w2");
        let down = expert_matrix(
            &params.weight(&down_name, opts.dtype)?,
            num_experts,
            ffn,
            hidden,
            &down_name,
        )?
        .transpose(1, 2)?
        .contiguous()?;
        let down_shard = split(&down, tp_size, tp_rank, ffn_split_dim(true))?;
        insert_linear(
            out,
            &format!("{dst}.mlp.proj."),
            &down_shard,
            None,
            opts.weight_only,
            opts.dtype,
        )?;

        // Router stays unsharded and in full precision, never quantized.
        let router = params.weight(&format!("{src}.ffn.router.layer"), DType::F32)?;
        insert_unique(
            out,
            format!("{dst}.mlp.router.weight"),
            TensorEntry::from_tensor(&router)?,
        )?;
    }

    Ok(())
}

/// Convert every weight owned by `mapping`'s rank.
pub fn convert_rank(
    params: &WeightMap,
    cfg: &DbrxConfig,
    mapping: &Mapping,
    moe: &MoeConfig,
    opts: &ConvertOptions,
    act_ranges: Option<&ActivationRanges>,
) -> Result<RankWeights> {
    let start = Instant::now();
    let mut out = RankWeights::new();

    let layers = mapping.pp_layers(cfg.n_layers)?;
    let first_layer = layers.start;
    for layer in layers {
        convert_layer(
            params,
            cfg,
            mapping,
            moe,
            opts,
            act_ranges,
            layer,
            first_layer,
            &mut out,
        )?;
    }

    let embed = params.try_weight("transformer.wte", opts.dtype)?;
    let lm_head = params.try_weight("lm_head", opts.dtype)?;

    if mapping.is_first_pp_rank() {
        let embed = embed.as_ref().ok_or_else(|| {
            candle_core::Error::Msg("missing source parameter transformer.wte".to_string())
        })?;
        insert_unique(
            &mut out,
            "transformer.vocab_embedding.weight".to_string(),
            TensorEntry::from_tensor(embed)?,
        )?;
    }
    if mapping.is_last_pp_rank() {
        // No dedicated head means the embedding is tied as the head.
        let head = match lm_head {
            Some(head) => head,
            None => embed.ok_or_else(|| {
                candle_core::Error::Msg(
                    "missing source parameter transformer.wte (needed for tied lm_head)"
                        .to_string(),
                )
            })?,
        };
        let norm_f = params.weight("transformer.norm_f", opts.dtype)?;
        insert_unique(
            &mut out,
            "transformer.ln_f.weight".to_string(),
            TensorEntry::from_tensor(&norm_f)?,
        )?;
        let head_shard = split(&head, mapping.tp_size(), mapping.tp_rank(), 0)?;
        insert_unique(
            &mut out,
            "lm_head.weight".to_string(),
            TensorEntry::from_tensor(&head_shard)?,
        )?;
    }

    info!(
        "rank {}: converted {} tensors in {:.2?}",
        mapping.rank(),
        out.len(),
        start.elapsed()
    );
    Ok(out)
}
