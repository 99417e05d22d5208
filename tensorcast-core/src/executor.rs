//! Rank fan-out execution.
//!
//! Runs the `world_size` independent per-rank conversion jobs, either
//! sequentially or on a bounded pool of worker threads. Every rank is
//! attempted regardless of earlier failures; afterwards all failures are
//! reported together as one aggregate error, and the caller treats any
//! failure as "discard the whole output directory".

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use candle_core::Result;
use tracing::error;

/// Aggregate of every per-rank failure from one conversion run.
#[derive(Debug)]
pub struct RankFailures {
    failures: Vec<(usize, candle_core::Error)>,
}

impl RankFailures {
    pub fn failed_ranks(&self) -> Vec<usize> {
        self.failures.iter().map(|(rank, _)| *rank).collect()
    }

    pub fn failures(&self) -> &[(usize, candle_core::Error)] {
        &self.failures
    }
}

impl fmt::Display for RankFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checkpoint conversion failed for {} rank(s):", self.failures.len())?;
        for (rank, err) in &self.failures {
            write!(f, " [rank {rank}] {err};")?;
        }
        Ok(())
    }
}

impl std::error::Error for RankFailures {}

/// Run `job(rank)` for every rank in `0..world_size`.
///
/// With `workers == 1` the jobs run sequentially in rank order. With more
/// workers they run on that many threads, each pulling the next unclaimed
/// rank. In both modes every rank is attempted; failures are collected and
/// raised together once all ranks have finished.
pub fn run_ranks<F>(world_size: usize, workers: usize, job: F) -> std::result::Result<(), RankFailures>
where
    F: Fn(usize) -> Result<()> + Sync,
{
    let workers = workers.max(1).min(world_size.max(1));

    let mut failures: Vec<(usize, candle_core::Error)> = if workers == 1 {
        (0..world_size)
            .filter_map(|rank| job(rank).err().map(|e| (rank, e)))
            .collect()
    } else {
        let next = AtomicUsize::new(0);
        let collected = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let rank = next.fetch_add(1, Ordering::Relaxed);
                    if rank >= world_size {
                        break;
                    }
                    if let Err(e) = job(rank) {
                        collected
                            .lock()
                            .expect("rank failure collection poisoned")
                            .push((rank, e));
                    }
                });
            }
        });
        collected
            .into_inner()
            .expect("rank failure collection poisoned")
    };

    if failures.is_empty() {
        Ok(())
    } else {
        failures.sort_by_key(|(rank, _)| *rank);
        for (rank, err) in &failures {
            error!("rank {rank} conversion failed: {err}");
        }
        Err(RankFailures { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_all_ranks_attempted_despite_failure() {
        for workers in [1, 2, 4] {
            let attempts = AtomicUsize::new(0);
            let result = run_ranks(4, workers, |rank| {
                attempts.fetch_add(1, Ordering::SeqCst);
                if rank == 2 {
                    candle_core::bail!("synthetic failure");
                }
                Ok(())
            });
            assert_eq!(attempts.load(Ordering::SeqCst), 4, "workers={workers}");
            let err = result.unwrap_err();
            assert_eq!(err.failed_ranks(), vec![2], "workers={workers}");
        }
    }

    #[test]
    fn test_multiple_failures_all_reported() {
        let result = run_ranks(4, 2, |rank| {
            if rank % 2 == 1 {
                candle_core::bail!("rank {rank} failed");
            }
            Ok(())
        });
        let err = result.unwrap_err();
        assert_eq!(err.failed_ranks(), vec![1, 3]);
        let message = err.to_string();
        assert!(message.contains("rank 1"));
        assert!(message.contains("rank 3"));
    }

    #[test]
    fn test_success_runs_every_rank_once() {
        let attempts = AtomicUsize::new(0);
        let result = run_ranks(3, 8, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_sequential_order_is_rank_order() {
        let order = Mutex::new(Vec::new());
        run_ranks(4, 1, |rank| {
            order.lock().unwrap().push(rank);
            Ok(())
        })
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
