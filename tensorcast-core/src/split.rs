//! Tensor-parallel weight splitting.
//!
//! Pure functions that slice a single weight tensor into the contiguous,
//! equally sized shard owned by one tensor-parallel rank. The fused QKV
//! projection gets a dedicated split that respects grouped-query attention:
//! the query block and the (possibly narrower) key/value blocks are separated
//! first and sharded independently, so head boundaries stay aligned across
//! ranks.

use candle_core::{Result, Tensor};

/// Return rank `rank`'s shard of `weight`, split into `tp_size` contiguous
/// equal chunks along `dim`.
///
/// With `tp_size == 1` the weight is returned unchanged. 1-D tensors are
/// always split along their only axis, regardless of `dim`. A dimension that
/// does not divide evenly by `tp_size` is a precondition violation.
pub fn split(weight: &Tensor, tp_size: usize, rank: usize, dim: usize) -> Result<Tensor> {
    if tp_size == 1 {
        return Ok(weight.clone());
    }
    if rank >= tp_size {
        candle_core::bail!("rank {rank} out of range for tp_size {tp_size}");
    }
    let dim = if weight.rank() == 1 { 0 } else { dim };
    let size = weight.dim(dim)?;
    if size % tp_size != 0 {
        candle_core::bail!(
            "cannot split dim {dim} of size {size} into {tp_size} equal shards (shape {:?})",
            weight.dims()
        );
    }
    let shard = size / tp_size;
    weight.narrow(dim, rank * shard, shard)?.contiguous()
}

/// Split a fused QKV weight for tensor parallelism.
///
/// `qkv` is stacked along axis 0 as `[n_hidden, kv_dim, kv_dim]` rows where
/// `kv_dim = n_kv_heads * (n_hidden / n_head)`. Under grouped-query attention
/// the K/V blocks are narrower than Q, so the fused matrix is separated into
/// its three sub-blocks before each is sharded along axis 0 and the shards
/// are re-fused.
pub fn split_qkv(
    qkv: &Tensor,
    n_head: usize,
    n_kv_heads: usize,
    n_hidden: usize,
    tp_size: usize,
    rank: usize,
) -> Result<Tensor> {
    if n_head == 0 || n_hidden % n_head != 0 {
        candle_core::bail!("hidden size {n_hidden} is not divisible into {n_head} heads");
    }
    let kv_dim = n_kv_heads * (n_hidden / n_head);
    let fused_rows = n_hidden + 2 * kv_dim;
    if qkv.dim(0)? != fused_rows {
        candle_core::bail!(
            "fused QKV weight has {} rows, expected {fused_rows} ({n_hidden} + 2 * {kv_dim})",
            qkv.dim(0)?
        );
    }

    let q = qkv.narrow(0, 0, n_hidden)?;
    let k = qkv.narrow(0, n_hidden, kv_dim)?;
    let v = qkv.narrow(0, n_hidden + kv_dim, kv_dim)?;

    let q = split(&q, tp_size, rank, 0)?;
    let k = split(&k, tp_size, rank, 0)?;
    let v = split(&v, tp_size, rank, 0)?;
    Tensor::cat(&[&q, &k, &v], 0)?.contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn arange_2d(rows: usize, cols: usize) -> Tensor {
        Tensor::arange(0f32, (rows * cols) as f32, &Device::Cpu)
            .unwrap()
            .reshape((rows, cols))
            .unwrap()
    }

    #[test]
    fn test_split_concat_roundtrip() {
        let weight = arange_2d(8, 6);
        for tp_size in [1, 2, 4] {
            let shards = (0..tp_size)
                .map(|rank| split(&weight, tp_size, rank, 0).unwrap())
                .collect::<Vec<_>>();
            let refs = shards.iter().collect::<Vec<_>>();
            let rebuilt = Tensor::cat(&refs, 0).unwrap();
            assert_eq!(
                rebuilt.to_vec2::<f32>().unwrap(),
                weight.to_vec2::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn test_split_along_columns() {
        let weight = arange_2d(4, 8);
        let shard = split(&weight, 2, 1, 1).unwrap();
        assert_eq!(shard.dims(), &[4, 4]);
        // Second half of every row.
        assert_eq!(shard.to_vec2::<f32>().unwrap()[0], vec![4., 5., 6., 7.]);
    }

    #[test]
    fn test_split_1d_ignores_dim() {
        let weight = Tensor::arange(0f32, 8f32, &Device::Cpu).unwrap();
        let shard = split(&weight, 4, 2, 1).unwrap();
        assert_eq!(shard.to_vec1::<f32>().unwrap(), vec![4., 5.]);
    }

    #[test]
    fn test_split_indivisible_fails() {
        let weight = arange_2d(6, 2);
        assert!(split(&weight, 4, 0, 0).is_err());
    }

    #[test]
    fn test_split_rank_out_of_range_fails() {
        let weight = arange_2d(4, 2);
        assert!(split(&weight, 2, 2, 0).is_err());
    }

    #[test]
    fn test_qkv_split_alignment_grouped_heads() {
        // n_head=8, n_kv_heads=2, n_hidden=512: kv_dim = 2 * 64 = 128.
        let (n_head, n_kv_heads, n_hidden) = (8, 2, 512);
        let kv_dim = 128;
        let qkv = arange_2d(n_hidden + 2 * kv_dim, 4);

        let tp_size = 2;
        let shards = (0..tp_size)
            .map(|rank| split_qkv(&qkv, n_head, n_kv_heads, n_hidden, tp_size, rank).unwrap())
            .collect::<Vec<_>>();
        for shard in &shards {
            assert_eq!(shard.dim(0).unwrap(), (n_hidden + 2 * kv_dim) / tp_size);
        }

        // Re-fusing each sub-block independently across ranks must rebuild
        // the original tensor exactly.
        let q_rows = n_hidden / tp_size;
        let kv_rows = kv_dim / tp_size;
        let qs = shards
            .iter()
            .map(|s| s.narrow(0, 0, q_rows).unwrap())
            .collect::<Vec<_>>();
        let ks = shards
            .iter()
            .map(|s| s.narrow(0, q_rows, kv_rows).unwrap())
            .collect::<Vec<_>>();
        let vs = shards
            .iter()
            .map(|s| s.narrow(0, q_rows + kv_rows, kv_rows).unwrap())
            .collect::<Vec<_>>();
        let rebuilt = Tensor::cat(
            &[&qs[0], &qs[1], &ks[0], &ks[1], &vs[0], &vs[1]],
            0,
        )
        .unwrap();
        assert_eq!(
            rebuilt.to_vec2::<f32>().unwrap(),
            qkv.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_qkv_split_shape_mismatch_fails() {
        let qkv = arange_2d(500, 4);
        assert!(split_qkv(&qkv, 8, 2, 512, 2, 0).is_err());
    }

    #[test]
    fn test_qkv_split_uniform_heads_matches_plain_split() {
        // With n_kv_heads == n_head every sub-block splits identically, so
        // the result must equal a plain split of the three stacked blocks.
        let qkv = arange_2d(3 * 16, 4);
        let shard = split_qkv(&qkv, 4, 4, 16, 2, 0).unwrap();
        assert_eq!(shard.dims(), &[24, 4]);
        let q = qkv.narrow(0, 0, 8).unwrap();
        let k = qkv.narrow(0, 16, 8).unwrap();
        let v = qkv.narrow(0, 32, 8).unwrap();
        let expected = Tensor::cat(&[&q, &k, &v], 0).unwrap();
        assert_eq!(
            shard.to_vec2::<f32>().unwrap(),
            expected.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_split_preserves_dtype() {
        let weight = arange_2d(4, 4).to_dtype(DType::F16).unwrap();
        let shard = split(&weight, 2, 0, 0).unwrap();
        assert_eq!(shard.dtype(), DType::F16);
    }
}
