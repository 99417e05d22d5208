//! CLI entry point: convert a Hugging Face DBRX checkpoint directory into a
//! sharded engine checkpoint (`config.json` + one safetensors bundle per
//! rank).

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::Device;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tensorcast_core::config::{
    parse_dtype, EngineConfig, MappingSection, MoeSection, QuantizationSection,
};
use tensorcast_core::{
    capture_activation_ranges, convert_rank, run_ranks, save_checkpoint, ActivationRanges,
    ConvertOptions, DbrxCalibrationModel, DbrxConfig, Mapping, MoeConfig, MoeNormalization,
    MoeParallelism, TextCalibrationSource, WeightMap, WeightOnlyPrecision,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MoeTpModeArg {
    TensorParallel,
    ExpertParallel,
}

impl From<MoeTpModeArg> for MoeParallelism {
    fn from(value: MoeTpModeArg) -> Self {
        match value {
            MoeTpModeArg::TensorParallel => MoeParallelism::TensorParallel,
            MoeTpModeArg::ExpertParallel => MoeParallelism::ExpertParallel,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MoeRenormModeArg {
    None,
    Renormalize,
}

impl From<MoeRenormModeArg> for MoeNormalization {
    fn from(value: MoeRenormModeArg) -> Self {
        match value {
            MoeRenormModeArg::None => MoeNormalization::None,
            MoeRenormModeArg::Renormalize => MoeNormalization::Renormalize,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WeightOnlyPrecisionArg {
    Int8,
    Int4,
}

impl From<WeightOnlyPrecisionArg> for WeightOnlyPrecision {
    fn from(value: WeightOnlyPrecisionArg) -> Self {
        match value {
            WeightOnlyPrecisionArg::Int8 => WeightOnlyPrecision::Int8,
            WeightOnlyPrecisionArg::Int4 => WeightOnlyPrecision::Int4,
        }
    }
}

/// Convert a Hugging Face DBRX checkpoint to a sharded engine checkpoint.
#[derive(Debug, Parser)]
#[command(name = "tensorcast", version, about)]
struct Args {
    /// Directory holding the source model (config.json + safetensors).
    #[arg(long)]
    model_dir: PathBuf,

    /// N-way tensor parallelism size.
    #[arg(long, default_value_t = 1)]
    tp_size: usize,

    /// N-way pipeline parallelism size.
    #[arg(long, default_value_t = 1)]
    pp_size: usize,

    /// Checkpoint dtype for unquantized weights.
    #[arg(long, default_value = "float16")]
    dtype: String,

    /// Dtype of the emitted logits.
    #[arg(long, default_value = "float32")]
    logits_dtype: String,

    /// Quantize the KV cache to int8 (requires calibration text).
    #[arg(long)]
    int8_kv_cache: bool,

    /// Quantize linear-layer weights to int8/int4.
    #[arg(long)]
    use_weight_only: bool,

    /// Precision for weight-only quantization.
    #[arg(long, value_enum, default_value_t = WeightOnlyPrecisionArg::Int8)]
    weight_only_precision: WeightOnlyPrecisionArg,

    /// Where to write the converted checkpoint.
    #[arg(long, default_value = "engine_checkpoint")]
    output_dir: PathBuf,

    /// Worker threads for converting ranks in parallel.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Plain-text calibration corpus, one sample per line.
    #[arg(long)]
    calibration_file: Option<PathBuf>,

    /// Number of calibration samples to run.
    #[arg(long, default_value_t = 1)]
    calibration_samples: usize,

    /// Sequence length calibration samples are padded/truncated to.
    #[arg(long, default_value_t = 512)]
    calibration_seq_len: usize,

    /// How experts are distributed across tensor-parallel ranks.
    #[arg(long, value_enum, default_value_t = MoeTpModeArg::TensorParallel)]
    moe_tp_mode: MoeTpModeArg,

    /// Router score renormalization expected by the runtime.
    #[arg(long, value_enum, default_value_t = MoeRenormModeArg::Renormalize)]
    moe_renorm_mode: MoeRenormModeArg,

    /// Rotary scaling (type, factor), passed through to the engine config.
    #[arg(long, num_args = 2)]
    rotary_scaling: Option<Vec<String>>,

    /// Enable dense fmha in the context phase.
    #[arg(long)]
    dense_context_fmha: bool,

    /// Shard the embedding lookup table across ranks.
    #[arg(long)]
    use_parallel_embedding: bool,

    /// Axis to shard the embedding along (0 = vocab, 1 = hidden).
    #[arg(long, default_value_t = 0)]
    embedding_sharding_dim: usize,

    /// Share the embedding table between embedding and head.
    #[arg(long)]
    use_embedding_sharing: bool,

    /// Use the non-plugin weight-only quantization path.
    #[arg(long)]
    disable_weight_only_quant_plugin: bool,
}

fn engine_config(args: &Args, cfg: &DbrxConfig, moe: &MoeConfig, mapping: &Mapping) -> EngineConfig {
    let quant_algo = args
        .use_weight_only
        .then(|| WeightOnlyPrecision::from(args.weight_only_precision).quant_algo().to_string());
    let mut exclude_modules = vec![
        "lm_head".to_string(),
        "vocab_embedding".to_string(),
        "position_embedding".to_string(),
        "block_embedding".to_string(),
    ];
    if args.use_weight_only && moe.has_moe() {
        exclude_modules.push("router".to_string());
    }

    EngineConfig {
        architecture: "DbrxForCausalLM".to_string(),
        dtype: args.dtype.clone(),
        logits_dtype: args.logits_dtype.clone(),
        vocab_size: cfg.vocab_size,
        hidden_size: cfg.d_model,
        intermediate_size: cfg.ffn_config.ffn_hidden_size,
        num_hidden_layers: cfg.n_layers,
        num_attention_heads: cfg.n_heads,
        num_key_value_heads: cfg.attn_config.kv_n_heads,
        max_position_embeddings: cfg.max_seq_len,
        norm_epsilon: 1e-5,
        position_embedding_type: "rope_gpt_neox".to_string(),
        hidden_act: "swiglu".to_string(),
        rotary_base: cfg.attn_config.rope_theta,
        rotary_scaling: args.rotary_scaling.clone(),
        quantization: QuantizationSection {
            quant_algo,
            kv_cache_quant_algo: args.int8_kv_cache.then(|| "INT8".to_string()),
            exclude_modules,
        },
        moe_config: MoeSection::from_config(moe),
        mapping: MappingSection::from_mapping(mapping),
        clip_qkv: cfg.attn_config.clip_qkv,
        dense_context_fmha: args.dense_context_fmha,
        use_parallel_embedding: args.use_parallel_embedding,
        embedding_sharding_dim: args.embedding_sharding_dim,
        share_embedding_table: args.use_embedding_sharing,
        disable_weight_only_quant_plugin: args.disable_weight_only_quant_plugin,
    }
}

fn calibrate(args: &Args, cfg: &DbrxConfig, moe: &MoeConfig, params: &WeightMap) -> Result<ActivationRanges> {
    let calibration_file = args
        .calibration_file
        .as_ref()
        .ok_or_else(|| anyhow!("--int8-kv-cache requires --calibration-file"))?;

    let tokenizer_path = args.model_dir.join("tokenizer.json");
    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("loading {}: {e}", tokenizer_path.display()))?;
    let pad_id = tokenizer
        .token_to_id("<|endoftext|>")
        .or_else(|| tokenizer.token_to_id("</s>"))
        .unwrap_or(0);

    let source = TextCalibrationSource::from_file(calibration_file, tokenizer, pad_id)
        .context("reading calibration corpus")?;
    info!(
        "calibrating on {} of {} available samples (seq_len {})",
        args.calibration_samples.min(source.len()),
        source.len(),
        args.calibration_seq_len
    );

    let model = DbrxCalibrationModel::new(params, cfg, moe).context("building calibration model")?;
    let ranges = capture_activation_ranges(
        &model,
        &source,
        args.calibration_samples,
        args.calibration_seq_len,
    )
    .context("capturing activation ranges")?;
    info!("captured activation ranges for {} layers", ranges.len());
    Ok(ranges)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let start = Instant::now();

    // Both dtype flags fail fast on a typo, before any heavy work.
    let dtype = parse_dtype(&args.dtype)?;
    parse_dtype(&args.logits_dtype)?;

    let cfg = DbrxConfig::from_file(&args.model_dir.join("config.json"))
        .context("reading source model config")?;
    let moe = MoeConfig::new(
        cfg.ffn_config.moe_num_experts,
        cfg.effective_moe_top_k(),
        args.moe_tp_mode.into(),
        args.moe_renorm_mode.into(),
    )
    .validate()?;

    let world_size = args.tp_size * args.pp_size;
    if world_size == 0 {
        bail!("tp_size and pp_size must be at least 1");
    }

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    // The engine config describes the whole checkpoint, not one rank; any
    // rank's mapping carries the same world/tp/pp sizes.
    let mapping0 = Mapping::new(world_size, 0, args.tp_size, args.pp_size)?;
    engine_config(&args, &cfg, &moe, &mapping0)
        .write(&args.output_dir.join("config.json"))
        .context("writing engine config")?;

    let device = Device::Cpu;
    let params = WeightMap::from_dir(&args.model_dir, &device).context("loading source weights")?;

    let act_ranges = if args.int8_kv_cache {
        Some(calibrate(&args, &cfg, &moe, &params)?)
    } else {
        None
    };

    let opts = ConvertOptions {
        dtype,
        weight_only: args
            .use_weight_only
            .then(|| args.weight_only_precision.into()),
        int8_kv_cache: args.int8_kv_cache,
    };

    run_ranks(world_size, args.workers, |rank| {
        let mapping = Mapping::new(world_size, rank, args.tp_size, args.pp_size)?;
        let weights = convert_rank(&params, &cfg, &mapping, &moe, &opts, act_ranges.as_ref())?;
        let path = args.output_dir.join(format!("rank{rank}.safetensors"));
        save_checkpoint(&weights, &path)?;
        info!("rank {rank}: wrote {}", path.display());
        // The rank's tensors are dropped here, before the next rank starts
        // on this worker.
        Ok(())
    })?;

    info!(
        "converted {} rank(s) to {} in {:.2?}",
        world_size,
        args.output_dir.display(),
        start.elapsed()
    );
    Ok(())
}
