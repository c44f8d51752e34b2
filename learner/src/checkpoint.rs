use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{counting::Counts, error::Result, learner::RngSequence, state::AgentState};

/// Everything a `Learner` needs to resume training where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: AgentState")]
pub struct Checkpoint<S> {
    /// The canonical state of every agent.
    pub states: Vec<S>,
    pub counts: Counts,
    pub rng: RngSequence,
}

impl<S: AgentState> Checkpoint<S> {
    /// Writes the checkpoint as JSON.
    ///
    /// # Arguments
    /// * `path` - The file to create or overwrite.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a checkpoint written by `write`.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
