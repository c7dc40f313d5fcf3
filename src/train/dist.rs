//! Blocking collectives between data-parallel replicas.
//!
//! Every rank must call the same collectives in the same order. A rank that
//! waits longer than the group timeout for its peers fails with
//! [`Error::DistributedSyncTimeout`]; the group cannot be used after that.
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub trait ProcessGroup {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Replaces `values` by their element-wise mean over all ranks.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()>;

    /// Replaces `values` by the ones of rank `root`.
    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<()>;

    /// Concatenates the `values` of every rank, in rank order.
    fn all_gather(&self, values: &[f32]) -> Result<Vec<f32>>;

    fn barrier(&self) -> Result<()>;
}

/// The group of a run without replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f32], _root: usize) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<f32>> {
        Ok(values.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Mean,
    Broadcast(usize),
    Gather,
    Barrier,
}

#[derive(Debug)]
struct Round {
    // Bumped every time a collective completes.
    generation: u64,
    arrived: usize,
    contributions: Vec<Option<Vec<f32>>>,
    // Outcome of the last completed collective.
    result: Arc<std::result::Result<Vec<f32>, String>>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    cond: Condvar,
}

fn combine(op: Op, contributions: Vec<Option<Vec<f32>>>) -> std::result::Result<Vec<f32>, String> {
    let contributions: Vec<Vec<f32>> = contributions.into_iter().map(|c| c.unwrap_or_default()).collect();
    match op {
        Op::Barrier => Ok(vec![]),
        Op::Gather => Ok(contributions.concat()),
        Op::Broadcast(root) => {
            contributions.into_iter().nth(root).ok_or_else(|| format!("invalid root {root}"))
        }
        Op::Mean => {
            let len = contributions[0].len();
            if contributions.iter().any(|c| c.len() != len) {
                let lens: Vec<usize> = contributions.iter().map(|c| c.len()).collect();
                return Err(format!("all-reduce called with mismatched lengths {lens:?}"));
            }
            let world_size = contributions.len() as f32;
            let mut sum = vec![0f32; len];
            for contribution in contributions.iter() {
                for (s, v) in sum.iter_mut().zip(contribution.iter()) {
                    *s += v;
                }
            }
            Ok(sum.into_iter().map(|s| s / world_size).collect())
        }
    }
}

/// One rank of an in-process group of replicas, each running on its own thread.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Returns the members of a new group, indexed by rank.
    pub fn new(world_size: usize, timeout: Duration) -> Vec<LocalGroup> {
        let round = Round {
            generation: 0,
            arrived: 0,
            contributions: vec![None; world_size],
            result: Arc::new(Ok(vec![])),
        };
        let shared =
            Arc::new(Shared { world_size, timeout, round: Mutex::new(round), cond: Condvar::new() });
        (0..world_size).map(|rank| LocalGroup { rank, shared: shared.clone() }).collect()
    }

    fn collective(&self, name: &'static str, op: Op, values: Vec<f32>) -> Result<Vec<f32>> {
        let shared = &self.shared;
        let mut round = shared.round.lock().unwrap_or_else(|e| e.into_inner());
        let generation = round.generation;
        round.contributions[self.rank] = Some(values);
        round.arrived += 1;
        if round.arrived == shared.world_size {
            let contributions = std::mem::replace(&mut round.contributions, vec![None; shared.world_size]);
            round.result = Arc::new(combine(op, contributions));
            round.arrived = 0;
            round.generation += 1;
            shared.cond.notify_all();
        } else {
            let deadline = Instant::now() + shared.timeout;
            while round.generation == generation {
                let now = Instant::now();
                if now >= deadline {
                    tracing::error!(rank = self.rank, "timed out waiting for peers in {name}");
                    return Err(Error::DistributedSyncTimeout {
                        rank: self.rank,
                        collective: name,
                        timeout: shared.timeout,
                    });
                }
                round = shared
                    .cond
                    .wait_timeout(round, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        }
        match round.result.as_ref() {
            Ok(values) => Ok(values.clone()),
            Err(msg) => Err(Error::InvalidConfig(format!("{name}: {msg}"))),
        }
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        let reduced = self.collective("all_reduce", Op::Mean, values.to_vec())?;
        values.copy_from_slice(&reduced);
        Ok(())
    }

    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<()> {
        let contribution = if self.rank == root { values.to_vec() } else { vec![] };
        let received = self.collective("broadcast", Op::Broadcast(root), contribution)?;
        if received.len() != values.len() {
            return Err(Error::InvalidConfig(format!(
                "broadcast of {} values into a buffer of {}",
                received.len(),
                values.len()
            )));
        }
        values.copy_from_slice(&received);
        Ok(())
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<f32>> {
        self.collective("all_gather", Op::Gather, values.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        self.collective("barrier", Op::Barrier, vec![]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_all<F>(world_size: usize, f: F) -> Vec<Result<Vec<f32>>>
    where
        F: Fn(LocalGroup) -> Result<Vec<f32>> + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = LocalGroup::new(world_size, Duration::from_secs(10))
            .into_iter()
            .map(|member| {
                let f = f.clone();
                std::thread::spawn(move || f(member))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_reduce_averages_across_ranks() {
        let results = spawn_all(3, |group| {
            let rank = group.rank() as f32;
            let mut values = vec![rank, 10. * rank];
            for _ in 0..3 {
                group.all_reduce_mean(&mut values)?;
            }
            group.barrier()?;
            Ok(values)
        });
        for values in results {
            assert_eq!(values.unwrap(), [1., 10.]);
        }
    }

    #[test]
    fn broadcast_copies_the_root_values() {
        let results = spawn_all(2, |group| {
            let mut values = vec![group.rank() as f32 + 1.; 4];
            group.broadcast(&mut values, 1)?;
            Ok(values)
        });
        for values in results {
            assert_eq!(values.unwrap(), [2.; 4]);
        }
    }

    #[test]
    fn all_gather_concatenates_in_rank_order() {
        let results = spawn_all(3, |group| {
            let rank = group.rank() as f32;
            group.all_gather(&vec![rank; group.rank() + 1])
        });
        for values in results {
            assert_eq!(values.unwrap(), [0., 1., 1., 2., 2., 2.]);
        }
    }

    #[test]
    fn missing_peer_times_out() {
        let mut members = LocalGroup::new(2, Duration::from_millis(50));
        let _absent = members.pop();
        let mut values = [1f32];
        let err = members[0].all_reduce_mean(&mut values).unwrap_err();
        assert!(matches!(
            err,
            Error::DistributedSyncTimeout { rank: 0, collective: "all_reduce", .. }
        ));
    }

    #[test]
    fn single_process_is_a_no_op() {
        let group = SingleProcess;
        let mut values = [3f32, 4.];
        group.all_reduce_mean(&mut values).unwrap();
        group.broadcast(&mut values, 0).unwrap();
        group.barrier().unwrap();
        assert_eq!(values, [3., 4.]);
        assert_eq!(group.all_gather(&values).unwrap(), [3., 4.]);
        assert_eq!((group.rank(), group.world_size()), (0, 1));
    }
}
