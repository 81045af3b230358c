//! Worker groups: rank assignment, barriers, gradient averaging and teardown.
//!
//! Every worker owns exactly one [`ProcessGroup`]. Collectives must be called
//! by all workers in the same order; a worker that fails inside the loop does
//! not notify its peers, so any error here is fatal to the run.

mod launch;
mod local;
mod tcp;

pub use launch::{launch_local_workers, WorkerCommand};
pub use local::LocalGroup;
pub use tcp::TcpGroup;

use std::env;

use crate::TrainingError;

pub const RANK_ENV: &str = "RANK";
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
pub const MASTER_ADDR_ENV: &str = "MASTER_ADDR";

pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Only rank 0 performs shared side effects.
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every worker in the group has called `barrier`.
    fn barrier(&mut self) -> Result<(), TrainingError>;

    /// Replaces `data` with the element-wise mean over all workers.
    ///
    /// Every worker receives the same bytes, so replicas updated from the
    /// result stay bit-identical.
    fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<(), TrainingError>;

    /// Releases the group. Called once by every worker at exit.
    fn teardown(&mut self) -> Result<(), TrainingError>;
}

impl<G: ProcessGroup + ?Sized> ProcessGroup for Box<G> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn barrier(&mut self) -> Result<(), TrainingError> {
        (**self).barrier()
    }

    fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<(), TrainingError> {
        (**self).all_reduce_mean(data)
    }

    fn teardown(&mut self) -> Result<(), TrainingError> {
        (**self).teardown()
    }
}

/// Group of one: every collective returns immediately.
#[derive(Debug, Default)]
pub struct SoloGroup;

impl ProcessGroup for SoloGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn all_reduce_mean(&mut self, _data: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Rank layout read from the environment of a launched worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEnv {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
}

impl GroupEnv {
    /// Returns `None` when the process was not started as a group member.
    pub fn from_env(default_master: &str) -> Result<Option<Self>, TrainingError> {
        let Ok(rank) = env::var(RANK_ENV) else {
            return Ok(None);
        };
        let rank = parse_env_usize(RANK_ENV, &rank)?;
        let world_size = match env::var(WORLD_SIZE_ENV) {
            Ok(value) => parse_env_usize(WORLD_SIZE_ENV, &value)?,
            Err(_) => {
                return Err(TrainingError::coordination(format!(
                    "{RANK_ENV} is set but {WORLD_SIZE_ENV} is missing"
                )))
            }
        };
        if rank >= world_size {
            return Err(TrainingError::coordination(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        let master_addr = env::var(MASTER_ADDR_ENV).unwrap_or_else(|_| default_master.to_string());
        Ok(Some(Self {
            rank,
            world_size,
            master_addr,
        }))
    }

    /// Joins the group described by this environment.
    pub fn connect(&self) -> Result<Box<dyn ProcessGroup>, TrainingError> {
        if self.world_size == 1 {
            return Ok(Box::new(SoloGroup));
        }
        Ok(Box::new(TcpGroup::connect(
            self.rank,
            self.world_size,
            &self.master_addr,
        )?))
    }
}

fn parse_env_usize(name: &str, value: &str) -> Result<usize, TrainingError> {
    value.trim().parse::<usize>().map_err(|err| {
        TrainingError::coordination(format!("invalid {name} value '{value}': {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_group_is_leader_and_identity() {
        let mut group = SoloGroup;
        let mut data = vec![1.0, 2.0];
        group.barrier().unwrap();
        group.all_reduce_mean(&mut data).unwrap();
        assert!(group.is_leader());
        assert_eq!(group.world_size(), 1);
        assert_eq!(data, vec![1.0, 2.0]);
        group.teardown().unwrap();
    }
}
