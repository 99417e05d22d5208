//! Mixture-of-experts conversion configuration.
//!
//! Controls how expert weights are distributed across tensor-parallel ranks
//! and how the destination runtime renormalizes router scores. The numeric
//! codes written to the engine `config.json` match the destination runtime's
//! enum values.

use candle_core::Result;

/// How expert weights are distributed across tensor-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoeParallelism {
    /// Every rank holds all experts, each split along its FFN width.
    #[default]
    TensorParallel,
    /// Each rank holds a disjoint subset of whole experts.
    ExpertParallel,
}

impl MoeParallelism {
    /// Numeric code used in the engine config.
    pub fn code(self) -> u32 {
        match self {
            MoeParallelism::ExpertParallel => 1,
            MoeParallelism::TensorParallel => 2,
        }
    }
}

/// Router score normalization applied by the destination runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoeNormalization {
    None,
    /// Renormalize the top-k scores to sum to 1.
    #[default]
    Renormalize,
}

impl MoeNormalization {
    /// Numeric code used in the engine config.
    pub fn code(self) -> u32 {
        match self {
            MoeNormalization::None => 0,
            MoeNormalization::Renormalize => 1,
        }
    }
}

/// MoE conversion settings. `num_experts == 0` means the model is dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoeConfig {
    pub num_experts: usize,
    pub top_k: usize,
    pub parallelism: MoeParallelism,
    pub normalization: MoeNormalization,
}

impl MoeConfig {
    pub fn new(
        num_experts: usize,
        top_k: usize,
        parallelism: MoeParallelism,
        normalization: MoeNormalization,
    ) -> Self {
        Self {
            num_experts,
            top_k,
            parallelism,
            normalization,
        }
    }

    /// A configuration describing a dense (non-MoE) model.
    pub fn dense() -> Self {
        Self {
            num_experts: 0,
            top_k: 0,
            parallelism: MoeParallelism::default(),
            normalization: MoeNormalization::default(),
        }
    }

    pub fn has_moe(&self) -> bool {
        self.num_experts > 0
    }

    /// Check internal consistency. Call once after construction.
    pub fn validate(self) -> Result<Self> {
        if !self.has_moe() && self.top_k > 0 {
            candle_core::bail!("top_k is set but the model has no experts");
        }
        if self.has_moe() && self.top_k == 0 {
            candle_core::bail!("MoE model requires top_k of at least 1");
        }
        if self.top_k > self.num_experts {
            candle_core::bail!(
                "top_k {} exceeds the number of experts {}",
                self.top_k,
                self.num_experts
            );
        }
        Ok(self)
    }
}
