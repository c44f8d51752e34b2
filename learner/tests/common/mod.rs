#![allow(dead_code)]

use learner::{
    ImpalaBuilder, ImpalaConfig, MaLearner, MaLearnerPopArt, NetworkConfig, ReplayConfig,
    data::{ReplaySample, TrainingData}, synthetic::SyntheticReplay,
};
use machine_learning::{
    arch::{RecurrentPolicy, activations::ActFn, loss::ImpalaLoss},
    optimization::Chain,
};

pub const OBS: usize = 3;
pub const STATE: usize = 4;
pub const ACTIONS: usize = 3;

pub fn network() -> RecurrentPolicy {
    RecurrentPolicy::new(OBS, STATE, ACTIONS, ActFn::tanh()).unwrap()
}

pub fn replay(config: &ImpalaConfig, seed: u64) -> SyntheticReplay {
    let network = NetworkConfig {
        obs_size: OBS,
        state_size: STATE,
        num_actions: ACTIONS,
        ..Default::default()
    };
    let replay = ReplayConfig {
        batch_size: 2,
        unroll_length: 4,
        seed,
    };

    SyntheticReplay::new(config.replicas, config.n_agents, replay, network)
}

/// A single batch for the given config.
pub fn batch(config: &ImpalaConfig, seed: u64) -> TrainingData {
    replay(config, seed).next().unwrap().data
}

pub fn learner(config: &ImpalaConfig) -> MaLearner<RecurrentPolicy, ImpalaLoss, Chain> {
    ImpalaBuilder::new(config.clone())
        .unwrap()
        .make_learner(network(), replay(config, 1))
        .unwrap()
}

pub fn popart_learner<I>(
    config: &ImpalaConfig,
    source: I,
) -> MaLearnerPopArt<RecurrentPolicy, ImpalaLoss, Chain>
where
    I: IntoIterator<Item = ReplaySample>,
    I::IntoIter: Send + 'static,
{
    ImpalaBuilder::new(config.clone())
        .unwrap()
        .make_popart_learner(network(), source)
        .unwrap()
}
