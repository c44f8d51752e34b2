use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
};

use log::warn;
use parking_lot::Mutex;

use crate::error::{LearnerErr, Result};

/// A blocking all-reduce between a fixed set of replicas.
///
/// Every replica contributes a value, the last one to arrive reduces every contribution in replica
/// order and then all of them pull the same reduced value. Every replica must take part in every
/// round, calling either `all_reduce` or `abort`, otherwise the others block forever.
pub struct ReplicaSync<T> {
    barrier: Barrier,
    slots: Vec<Mutex<Option<T>>>,
    reduced: Mutex<Option<Arc<T>>>,
    failed: AtomicBool,
}

impl<T: Send + Sync> ReplicaSync<T> {
    /// Creates a new `ReplicaSync`.
    ///
    /// # Arguments
    /// * `replicas` - The amount of replicas taking part in every round.
    pub fn new(replicas: usize) -> Self {
        Self {
            barrier: Barrier::new(replicas),
            slots: (0..replicas).map(|_| Mutex::new(None)).collect(),
            reduced: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    /// Contributes to a round and waits for its reduced value.
    ///
    /// # Arguments
    /// * `replica` - The index of the calling replica.
    /// * `contribution` - The value of this replica, or the error that prevented computing it.
    /// * `reduce` - Combines the contributions of every replica, ordered by replica index. A panic
    ///   inside it fails the round instead of leaving the other replicas waiting.
    ///
    /// # Returns
    /// The reduced value, this replica's own error, or `ReplicaAborted` if another replica failed.
    pub fn all_reduce<F>(
        &self,
        replica: usize,
        contribution: Result<T>,
        reduce: F,
    ) -> Result<Arc<T>>
    where
        F: FnOnce(Vec<T>) -> Result<T>,
    {
        let own_err = match contribution {
            Ok(value) => {
                *self.slots[replica].lock() = Some(value);
                None
            }
            Err(e) => {
                warn!(replica = replica; "replica failed before the reduction: {e}");
                self.failed.store(true, Ordering::SeqCst);
                Some(e)
            }
        };

        let mut reduce_err = None;
        if self.barrier.wait().is_leader() {
            let contributions: Vec<_> = self.slots.iter().map(|slot| slot.lock().take()).collect();

            let reduced = if self.failed.swap(false, Ordering::SeqCst) {
                None
            } else {
                let contributions: Option<Vec<T>> = contributions.into_iter().collect();
                let reduced = contributions.map(|contributions| {
                    panic::catch_unwind(AssertUnwindSafe(|| reduce(contributions)))
                        .unwrap_or_else(|payload| Err(LearnerErr::panicked(replica, payload)))
                });

                match reduced {
                    Some(Ok(value)) => Some(Arc::new(value)),
                    Some(Err(e)) => {
                        reduce_err = Some(e);
                        None
                    }
                    None => None,
                }
            };

            *self.reduced.lock() = reduced;
        }

        self.barrier.wait();
        let reduced = self.reduced.lock().clone();

        match (own_err, reduce_err) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => reduced.ok_or(LearnerErr::ReplicaAborted),
        }
    }

    /// Takes part in a round without contributing, making it fail for every replica.
    pub fn abort(&self, replica: usize) {
        let _ = self.all_reduce(replica, Err(LearnerErr::ReplicaAborted), |_| {
            Err(LearnerErr::ReplicaAborted)
        });
    }
}
