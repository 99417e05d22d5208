//! Parallelism descriptor for checkpoint conversion.
//!
//! A [`Mapping`] pins down one rank's position in the `tp_size x pp_size`
//! grid and derives everything the converter needs from it: the
//! tensor-parallel slot (which slice of each sharded weight this rank owns)
//! and the pipeline stage (which contiguous block of layers it owns).
//!
//! Mappings are small immutable values constructed once per rank and passed
//! explicitly to every component that needs parallelism context.

use std::ops::Range;

use candle_core::Result;

/// One rank's position in the parallel grid.
///
/// `world_size == tp_size * pp_size` always holds. Ranks are laid out
/// tensor-parallel-major: ranks `0..tp_size` form pipeline stage 0,
/// the next `tp_size` ranks form stage 1, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    world_size: usize,
    rank: usize,
    tp_size: usize,
    pp_size: usize,
}

impl Mapping {
    /// Create a mapping for `rank` in a `tp_size x pp_size` grid.
    pub fn new(world_size: usize, rank: usize, tp_size: usize, pp_size: usize) -> Result<Self> {
        if tp_size == 0 || pp_size == 0 {
            candle_core::bail!("tp_size and pp_size must be at least 1");
        }
        if tp_size * pp_size != world_size {
            candle_core::bail!(
                "world_size {world_size} does not match tp_size {tp_size} * pp_size {pp_size}"
            );
        }
        if rank >= world_size {
            candle_core::bail!("rank {rank} out of range for world_size {world_size}");
        }
        Ok(Self {
            world_size,
            rank,
            tp_size,
            pp_size,
        })
    }

    /// A single-rank mapping (no parallelism).
    pub fn single() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            tp_size: 1,
            pp_size: 1,
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    pub fn pp_size(&self) -> usize {
        self.pp_size
    }

    /// Slot within the tensor-parallel group.
    pub fn tp_rank(&self) -> usize {
        self.rank % self.tp_size
    }

    /// Pipeline stage index.
    pub fn pp_rank(&self) -> usize {
        self.rank / self.tp_size
    }

    pub fn is_first_pp_rank(&self) -> bool {
        self.pp_rank() == 0
    }

    pub fn is_last_pp_rank(&self) -> bool {
        self.pp_rank() == self.pp_size - 1
    }

    /// Global layer indices owned by this rank's pipeline stage, in ascending
    /// order. `num_layers` must divide evenly into `pp_size` stages.
    pub fn pp_layers(&self, num_layers: usize) -> Result<Range<usize>> {
        if num_layers % self.pp_size != 0 {
            candle_core::bail!(
                "{num_layers} layers cannot be evenly assigned to {} pipeline stages",
                self.pp_size
            );
        }
        let per_stage = num_layers / self.pp_size;
        let first = self.pp_rank() * per_stage;
        Ok(first..first + per_stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_decomposition() {
        // tp=2, pp=2: ranks 0,1 are stage 0; ranks 2,3 are stage 1.
        for (rank, tp_rank, pp_rank) in [(0, 0, 0), (1, 1, 0), (2, 0, 1), (3, 1, 1)] {
            let mapping = Mapping::new(4, rank, 2, 2).unwrap();
            assert_eq!(mapping.tp_rank(), tp_rank);
            assert_eq!(mapping.pp_rank(), pp_rank);
        }
    }

    #[test]
    fn test_pp_layers_partition() {
        let first = Mapping::new(4, 0, 2, 2).unwrap();
        let last = Mapping::new(4, 3, 2, 2).unwrap();
        assert_eq!(first.pp_layers(8).unwrap(), 0..4);
        assert_eq!(last.pp_layers(8).unwrap(), 4..8);
        assert!(first.is_first_pp_rank());
        assert!(!first.is_last_pp_rank());
        assert!(last.is_last_pp_rank());
    }

    #[test]
    fn test_single_rank_is_both_boundaries() {
        let mapping = Mapping::single();
        assert!(mapping.is_first_pp_rank());
        assert!(mapping.is_last_pp_rank());
        assert_eq!(mapping.pp_layers(6).unwrap(), 0..6);
    }

    #[test]
    fn test_invalid_grid_rejected() {
        assert!(Mapping::new(4, 0, 3, 2).is_err());
        assert!(Mapping::new(4, 4, 2, 2).is_err());
        assert!(Mapping::new(0, 0, 0, 1).is_err());
    }

    #[test]
    fn test_uneven_pp_layers_rejected() {
        let mapping = Mapping::new(2, 0, 1, 2).unwrap();
        assert!(mapping.pp_layers(7).is_err());
    }
}
