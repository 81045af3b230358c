use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::ProcessGroup;
use crate::TrainingError;

/// In-process group whose workers are threads sharing one rendezvous point.
///
/// Reductions accumulate in rank order, so every run over the same inputs
/// produces the same bytes regardless of thread arrival order. A handle
/// dropped before teardown, or a failed collective, breaks the group: every
/// pending and later collective returns an error instead of waiting.
#[derive(Debug)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
    torn_down: bool,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    state: Mutex<Rendezvous>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct Rendezvous {
    generation: u64,
    contributions: Vec<Option<Vec<f32>>>,
    arrived: usize,
    result: Arc<Vec<f32>>,
    broken: bool,
}

impl LocalGroup {
    /// Creates one handle per rank; move each into its worker thread.
    pub fn create(world_size: usize) -> Result<Vec<LocalGroup>, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::coordination(
                "local group requires at least one worker",
            ));
        }
        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(Rendezvous {
                contributions: vec![None; world_size],
                ..Rendezvous::default()
            }),
            released: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
                torn_down: false,
            })
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Rendezvous>, TrainingError> {
        self.shared
            .state
            .lock()
            .map_err(|_| TrainingError::coordination("a peer worker panicked inside a collective"))
    }

    fn rendezvous(&self, contribution: Vec<f32>) -> Result<Arc<Vec<f32>>, TrainingError> {
        if self.torn_down {
            return Err(TrainingError::coordination("collective called after teardown"));
        }
        let mut state = self.lock()?;
        if state.broken {
            return Err(broken_group());
        }
        let generation = state.generation;
        state.contributions[self.rank] = Some(contribution);
        state.arrived += 1;

        if state.arrived == self.shared.world_size {
            let reduced = match reduce_mean(&mut state.contributions, self.shared.world_size) {
                Ok(reduced) => reduced,
                Err(err) => {
                    state.broken = true;
                    self.shared.released.notify_all();
                    return Err(err);
                }
            };
            state.result = Arc::new(reduced);
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.released.notify_all();
            return Ok(Arc::clone(&state.result));
        }

        while state.generation == generation {
            if state.broken {
                return Err(broken_group());
            }
            state = self
                .shared
                .released
                .wait(state)
                .map_err(|_| TrainingError::coordination("a peer worker panicked inside a collective"))?;
        }
        Ok(Arc::clone(&state.result))
    }
}

impl Drop for LocalGroup {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.broken = true;
        self.shared.released.notify_all();
    }
}

fn broken_group() -> TrainingError {
    TrainingError::coordination("a peer worker left the group before teardown")
}

fn reduce_mean(
    contributions: &mut [Option<Vec<f32>>],
    world_size: usize,
) -> Result<Vec<f32>, TrainingError> {
    let mut total: Option<Vec<f32>> = None;
    for slot in contributions.iter_mut() {
        let values = slot
            .take()
            .ok_or_else(|| TrainingError::coordination("missing contribution in collective"))?;
        match total.as_mut() {
            None => total = Some(values),
            Some(acc) => {
                if acc.len() != values.len() {
                    return Err(TrainingError::coordination(format!(
                        "collective length mismatch ({} vs {})",
                        acc.len(),
                        values.len()
                    )));
                }
                for (a, v) in acc.iter_mut().zip(values) {
                    *a += v;
                }
            }
        }
    }
    let mut total = total.unwrap_or_default();
    let scale = 1.0 / world_size as f32;
    for value in &mut total {
        *value *= scale;
    }
    Ok(total)
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&mut self) -> Result<(), TrainingError> {
        self.rendezvous(Vec::new()).map(|_| ())
    }

    fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<(), TrainingError> {
        let result = self.rendezvous(data.to_vec())?;
        if result.len() != data.len() {
            return Err(TrainingError::coordination(
                "collective returned a buffer of unexpected length",
            ));
        }
        data.copy_from_slice(&result);
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TrainingError> {
        if !self.torn_down {
            self.barrier()?;
            self.torn_down = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_reduce_averages_across_threads() {
        let groups = LocalGroup::create(3).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|mut group| {
                thread::spawn(move || {
                    let rank = group.rank() as f32;
                    let mut data = vec![rank, 10.0 * rank];
                    group.all_reduce_mean(&mut data).unwrap();
                    group.barrier().unwrap();
                    group.teardown().unwrap();
                    data
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 10.0]);
        }
    }

    #[test]
    fn barrier_orders_leader_write_before_follower_read() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let written = Arc::new(AtomicUsize::new(0));
        let groups = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|mut group| {
                let written = Arc::clone(&written);
                thread::spawn(move || {
                    if group.is_leader() {
                        thread::sleep(std::time::Duration::from_millis(20));
                        written.store(7, Ordering::SeqCst);
                    }
                    group.barrier().unwrap();
                    written.load(Ordering::SeqCst)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
    }

    #[test]
    fn dropped_peer_breaks_the_group() {
        let mut groups = LocalGroup::create(2).unwrap();
        drop(groups.pop());
        let mut leader = groups.pop().unwrap();
        assert!(matches!(leader.barrier(), Err(TrainingError::Coordination(_))));
        assert!(leader.all_reduce_mean(&mut [1.0]).is_err());
    }

    #[test]
    fn waiting_workers_wake_when_a_peer_exits() {
        let mut groups = LocalGroup::create(3).unwrap().into_iter();
        let failing = groups.next().unwrap();
        let waiting: Vec<_> = groups
            .map(|mut group| thread::spawn(move || group.barrier()))
            .collect();
        thread::sleep(std::time::Duration::from_millis(20));
        drop(failing);

        for handle in waiting {
            assert!(handle.join().unwrap().is_err());
        }
    }

    #[test]
    fn length_mismatch_fails_every_rank() {
        let handles: Vec<_> = LocalGroup::create(2)
            .unwrap()
            .into_iter()
            .map(|mut group| {
                thread::spawn(move || {
                    let mut data = vec![0.0; group.rank() + 1];
                    group.all_reduce_mean(&mut data)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_err());
        }
    }

    #[test]
    fn teardown_then_drop_leaves_peers_unaffected() {
        let handles: Vec<_> = LocalGroup::create(2)
            .unwrap()
            .into_iter()
            .map(|mut group| thread::spawn(move || group.teardown()))
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    }
}
