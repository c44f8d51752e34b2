use std::{collections::BTreeMap, fmt::Write, sync::Arc};

use log::info;
use parking_lot::Mutex;

/// A single logged record of named scalars.
pub type Record = BTreeMap<String, f64>;

/// An append only sink of records.
pub trait Logger: Send {
    fn write(&mut self, record: &Record);

    /// Tells the logger which key of a record holds its step.
    fn set_steps_key(&mut self, _steps_key: &str) {}

    /// Flushes whatever the logger holds, called once when its owner is done with it.
    fn close(&mut self) {}
}

/// Renders every record as a single `info` line.
#[derive(Debug, Clone)]
pub struct TerminalLogger {
    label: String,
    steps_key: String,
}

impl TerminalLogger {
    /// Creates a new `TerminalLogger`.
    ///
    /// # Arguments
    /// * `label` - Prefixes every line.
    /// * `steps_key` - The key of the record used as its step, printed first.
    pub fn new(label: &str, steps_key: &str) -> Self {
        Self {
            label: label.to_string(),
            steps_key: steps_key.to_string(),
        }
    }

    pub fn steps_key(&self) -> &str {
        &self.steps_key
    }
}

impl Logger for TerminalLogger {
    fn write(&mut self, record: &Record) {
        let step = record.get(&self.steps_key).copied().unwrap_or_default();

        let mut line = String::new();
        for (key, value) in record.iter().filter(|(key, _)| **key != self.steps_key) {
            let _ = write!(line, " | {key} = {value:.4}");
        }

        info!(label = self.label.as_str(), step = step; "{line}");
    }

    fn set_steps_key(&mut self, steps_key: &str) {
        self.steps_key = steps_key.to_string();
    }
}

/// Keeps every record in memory, clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogger {
    records: Arc<Mutex<Vec<Record>>>,
    closed: Arc<Mutex<bool>>,
}

impl InMemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Logger for InMemoryLogger {
    fn write(&mut self, record: &Record) {
        self.records.lock().push(record.clone());
    }

    fn close(&mut self) {
        *self.closed.lock() = true;
    }
}
