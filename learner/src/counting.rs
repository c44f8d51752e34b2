use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

/// A snapshot of every count.
pub type Counts = BTreeMap<String, f64>;

/// Monotonically increasing step and time counts.
///
/// Clones share the same counts, so a counter can be handed to the learner and still be read from
/// outside.
#[derive(Debug, Clone)]
pub struct Counter {
    prefix: String,
    counts: Arc<Mutex<Counts>>,
}

impl Counter {
    /// Creates a new `Counter`.
    ///
    /// # Arguments
    /// * `prefix` - Prepended to every key, as in `learner_steps`.
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
            counts: Arc::default(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    /// The key of the step count, used as the x axis of the logged records.
    pub fn steps_key(&self) -> String {
        self.key("steps")
    }

    /// Adds to the step and elapsed time counts.
    ///
    /// # Returns
    /// A snapshot of the counts after the increment.
    pub fn increment(&self, steps: u64, time_elapsed: f64) -> Counts {
        let mut counts = self.counts.lock();

        *counts.entry(self.key("steps")).or_default() += steps as f64;
        *counts.entry(self.key("time_elapsed")).or_default() += time_elapsed;
        counts.clone()
    }

    pub fn counts(&self) -> Counts {
        self.counts.lock().clone()
    }

    pub fn steps(&self) -> u64 {
        self.counts
            .lock()
            .get(&self.steps_key())
            .copied()
            .unwrap_or_default() as u64
    }

    /// Replaces every count, as when resuming from a checkpoint.
    pub fn restore(&self, counts: Counts) {
        *self.counts.lock() = counts;
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new("learner")
    }
}
