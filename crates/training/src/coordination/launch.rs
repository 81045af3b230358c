use std::{
    env,
    ffi::OsString,
    path::PathBuf,
    process::{Child, Command},
};

use log::{error, info};

use super::{MASTER_ADDR_ENV, RANK_ENV, WORLD_SIZE_ENV};
use crate::TrainingError;

/// Program and arguments each spawned worker runs.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub master_addr: String,
}

impl WorkerCommand {
    /// Re-runs the current executable with `args`.
    pub fn current_exe(args: Vec<OsString>, master_addr: impl Into<String>) -> Result<Self, TrainingError> {
        let program = env::current_exe().map_err(|err| {
            TrainingError::coordination(format!("cannot locate current executable: {err}"))
        })?;
        Ok(Self {
            program,
            args,
            master_addr: master_addr.into(),
        })
    }
}

/// Spawns `world_size` local workers and waits for all of them.
///
/// Each child receives its rank, the world size and the leader address
/// through the environment. Fails if any worker exits unsuccessfully.
pub fn launch_local_workers(world_size: usize, command: &WorkerCommand) -> Result<(), TrainingError> {
    if world_size == 0 {
        return Err(TrainingError::coordination("cannot launch zero workers"));
    }
    info!(
        "launching {world_size} workers, leader at {}",
        command.master_addr
    );

    let mut children: Vec<Child> = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        let spawned = Command::new(&command.program)
            .args(&command.args)
            .env(RANK_ENV, rank.to_string())
            .env(WORLD_SIZE_ENV, world_size.to_string())
            .env(MASTER_ADDR_ENV, &command.master_addr)
            .spawn();
        match spawned {
            Ok(child) => children.push(child),
            Err(err) => {
                for mut child in children {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(TrainingError::coordination(format!(
                    "spawn worker {rank}: {err}"
                )));
            }
        }
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children.into_iter().enumerate() {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!("worker {rank} exited with {status}");
                failed.push(rank);
            }
            Err(err) => {
                error!("worker {rank} could not be awaited: {err}");
                failed.push(rank);
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::coordination(format!(
            "workers {failed:?} did not finish successfully"
        )))
    }
}
