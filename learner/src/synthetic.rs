use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};

use crate::{
    config::{NetworkConfig, ReplayConfig},
    data::{AxisLayout, CORE_STATE, LOGITS, ReplaySample, TrainingData},
};

/// The probability of an episode ending on any given step.
const TERMINATION_PROB: f64 = 0.05;

/// An endless source of random, well formed batches in the default layout.
///
/// Stands in for a replay service when running the learner on its own.
#[derive(Debug, Clone)]
pub struct SyntheticReplay {
    replicas: usize,
    agents: usize,
    replay: ReplayConfig,
    network: NetworkConfig,
    reward_scale: f32,
    rng: StdRng,
    key: u64,
}

impl SyntheticReplay {
    /// Creates a new `SyntheticReplay`.
    ///
    /// # Arguments
    /// * `replicas` - The amount of replica shards in every batch.
    /// * `agents` - The amount of agents.
    /// * `replay` - The batch size, unroll length and seed.
    /// * `network` - The sizes of observations, actions and recurrent states.
    pub fn new(
        replicas: usize,
        agents: usize,
        replay: ReplayConfig,
        network: NetworkConfig,
    ) -> Self {
        Self {
            replicas,
            agents,
            replay,
            network,
            reward_scale: 1.,
            rng: StdRng::seed_from_u64(replay.seed),
            key: 0,
        }
    }

    /// Multiplies every reward, handy for exercising value normalization.
    pub fn with_reward_scale(mut self, reward_scale: f32) -> Self {
        self.reward_scale = reward_scale;
        self
    }

    fn normal(&mut self, shape: &[usize], scale: f32) -> ArrayD<f32> {
        let rng = &mut self.rng;
        ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            let x: f32 = StandardNormal.sample(rng);
            scale * x
        })
    }

    fn sample(&mut self) -> TrainingData {
        // Replica, batch, time, agent.
        let leading = [
            self.replicas,
            self.replay.batch_size,
            self.replay.unroll_length,
            self.agents,
        ];
        let with = |features: usize| {
            let mut shape = leading.to_vec();
            shape.push(features);
            shape
        };

        let NetworkConfig {
            obs_size,
            state_size,
            num_actions,
            ..
        } = self.network;

        let observation = self.normal(&with(obs_size), 1.);
        let reward = self.normal(&leading, self.reward_scale);
        let logits = self.normal(&with(num_actions), 1.);

        let rng = &mut self.rng;
        let action =
            ArrayD::from_shape_simple_fn(IxDyn(&leading), || rng.random_range(0..num_actions));
        let discount = ArrayD::from_shape_simple_fn(IxDyn(&leading), || {
            if rng.random_bool(TERMINATION_PROB) { 0. } else { 1. }
        });

        TrainingData {
            layout: AxisLayout::default(),
            observation,
            action,
            reward,
            discount,
            extras: BTreeMap::from([
                (LOGITS.to_string(), logits),
                (CORE_STATE.to_string(), ArrayD::zeros(IxDyn(&with(state_size)))),
            ]),
        }
    }
}

impl Iterator for SyntheticReplay {
    type Item = ReplaySample;

    fn next(&mut self) -> Option<ReplaySample> {
        let data = self.sample();
        self.key += 1;

        Some(ReplaySample {
            key: self.key,
            data,
        })
    }
}
