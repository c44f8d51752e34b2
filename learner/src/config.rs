use std::{fs, path::Path};

use machine_learning::arch::activations::ActFn;
use serde::{Deserialize, Serialize};

use crate::error::{LearnerErr, Result};

/// The hyper-parameters of a multi-agent IMPALA learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpalaConfig {
    pub n_agents: usize,
    pub replicas: usize,
    pub seed: u64,

    pub learning_rate: f32,
    pub rmsprop_decay: f32,
    pub rmsprop_eps: f32,
    pub rmsprop_init: f32,
    /// Zero disables the momentum trace.
    pub rmsprop_momentum: f32,
    pub max_gradient_norm: f32,

    pub discount: f32,
    pub entropy_cost: f32,
    pub baseline_cost: f32,
    pub max_abs_reward: f32,

    pub use_popart: bool,
    /// Only adapt the target statistics, without preserving the outputs of the value head.
    pub only_art: bool,
    pub step_size: f32,
    pub scale_lb: f32,
    pub scale_ub: f32,

    /// Agents are reshuffled every this many steps, zero never reshuffles them.
    pub agent_shuffle_interval: u64,
}

impl Default for ImpalaConfig {
    fn default() -> Self {
        Self {
            n_agents: 2,
            replicas: 1,
            seed: 0,
            learning_rate: 6e-4,
            rmsprop_decay: 0.99,
            rmsprop_eps: 1e-5,
            rmsprop_init: 0.,
            rmsprop_momentum: 0.,
            max_gradient_norm: 40.,
            discount: 0.99,
            entropy_cost: 0.01,
            baseline_cost: 0.5,
            max_abs_reward: f32::MAX,
            use_popart: false,
            only_art: false,
            step_size: 1e-3,
            scale_lb: 1e-4,
            scale_ub: 1e4,
            agent_shuffle_interval: 1,
        }
    }
}

impl ImpalaConfig {
    /// Checks that every field is in range.
    ///
    /// # Returns
    /// An `InvalidConfig` error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(LearnerErr::InvalidConfig(msg.to_string()));

        if self.n_agents == 0 {
            return invalid("n_agents must be positive");
        }
        if self.replicas == 0 {
            return invalid("replicas must be positive");
        }
        if !(self.learning_rate > 0.) {
            return invalid("learning_rate must be positive");
        }
        if !(0. ..=1.).contains(&self.rmsprop_decay) {
            return invalid("rmsprop_decay must be in [0, 1]");
        }
        if !(0. ..=1.).contains(&self.rmsprop_momentum) {
            return invalid("rmsprop_momentum must be in [0, 1]");
        }
        if !(self.rmsprop_eps >= 0. && self.rmsprop_init >= 0.) {
            return invalid("rmsprop_eps and rmsprop_init must be non negative");
        }
        if !(self.max_gradient_norm > 0.) {
            return invalid("max_gradient_norm must be positive");
        }
        if !(self.max_abs_reward > 0.) {
            return invalid("max_abs_reward must be positive");
        }
        if self.use_popart {
            if !(self.step_size > 0. && self.step_size <= 1.) {
                return invalid("step_size must be in (0, 1]");
            }
            if !(self.scale_lb > 0. && self.scale_lb <= self.scale_ub) {
                return invalid("scale bounds must satisfy 0 < scale_lb <= scale_ub");
            }
        }

        Ok(())
    }
}

/// The activation of the network's recurrent core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreActivation {
    #[default]
    Tanh,
    Sigmoid {
        amp: f32,
    },
}

impl CoreActivation {
    pub fn act_fn(self) -> ActFn {
        match self {
            CoreActivation::Tanh => ActFn::tanh(),
            CoreActivation::Sigmoid { amp } => ActFn::sigmoid(amp),
        }
    }
}

/// The size of the network the learner trains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub obs_size: usize,
    pub state_size: usize,
    pub num_actions: usize,
    pub activation: CoreActivation,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            obs_size: 8,
            state_size: 16,
            num_actions: 4,
            activation: CoreActivation::Tanh,
        }
    }
}

/// The shape of the batches pulled from the replay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub batch_size: usize,
    pub unroll_length: usize,
    pub seed: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            unroll_length: 10,
            seed: 1,
        }
    }
}

/// Everything the `learner` binary needs to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub impala: ImpalaConfig,
    pub network: NetworkConfig,
    pub replay: ReplayConfig,
}

impl RunConfig {
    /// Parses and validates a `RunConfig` from a JSON string, missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a `RunConfig` from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.impala.validate()?;

        let NetworkConfig {
            obs_size,
            state_size,
            num_actions,
            ..
        } = self.network;
        if obs_size == 0 || state_size == 0 || num_actions == 0 {
            return Err(LearnerErr::InvalidConfig(
                "network sizes must be positive".to_string(),
            ));
        }

        if self.replay.batch_size == 0 || self.replay.unroll_length < 2 {
            return Err(LearnerErr::InvalidConfig(
                "batches need at least one unroll of two steps".to_string(),
            ));
        }

        Ok(())
    }
}
