pub mod builder;
pub mod checkpoint;
pub mod combined;
pub mod config;
pub mod counting;
pub mod data;
pub mod error;
pub mod learner;
pub mod logging;
pub mod predict;
pub mod state;
pub mod step;
pub mod synthetic;
pub mod sync;

pub use builder::ImpalaBuilder;
pub use checkpoint::Checkpoint;
pub use config::{CoreActivation, ImpalaConfig, NetworkConfig, ReplayConfig, RunConfig};
pub use error::{LearnerErr, Result};
pub use learner::{Learner, LearnerOptions, MaLearner, MaLearnerPopArt, RngSequence};
pub use state::{AgentState, PopArtTrainingState, TrainingState};
