mod common;

use common::{batch, network, replay};
use learner::{ImpalaBuilder, ImpalaConfig, LearnerErr, data::TrainingData};
use machine_learning::{
    arch::{NetOutput, Network, RecurrentCache, RecurrentPolicy, ValueHead},
    params::ParamTree,
};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::Rng;

const MARKER: f32 = 99.;

/// Panics on any batch holding the marker observation.
struct PanicsOnMarker(RecurrentPolicy);

impl Network for PanicsOnMarker {
    type Cache = RecurrentCache;

    fn state_size(&self) -> usize {
        self.0.state_size()
    }

    fn num_actions(&self) -> usize {
        self.0.num_actions()
    }

    fn initial_state<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f32> {
        self.0.initial_state(rng)
    }

    fn unroll_init<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        initial_state: ArrayView1<f32>,
    ) -> machine_learning::Result<ParamTree> {
        self.0.unroll_init(rng, initial_state)
    }

    fn forward_cached(
        &self,
        params: &ParamTree,
        observation: ArrayView2<f32>,
        state: ArrayView2<f32>,
    ) -> machine_learning::Result<(NetOutput, Self::Cache)> {
        if observation.iter().any(|&x| x == MARKER) {
            panic!("marked observation");
        }

        self.0.forward_cached(params, observation, state)
    }

    fn backward(
        &self,
        params: &ParamTree,
        cache: &Self::Cache,
        d_logits: ArrayView2<f32>,
        d_value: ArrayView1<f32>,
    ) -> machine_learning::Result<ParamTree> {
        self.0.backward(params, cache, d_logits, d_value)
    }

    fn value_head(&self) -> ValueHead {
        self.0.value_head()
    }
}

fn config() -> ImpalaConfig {
    ImpalaConfig {
        replicas: 2,
        n_agents: 1,
        ..Default::default()
    }
}

/// A batch whose second replica shard makes the network panic.
fn marked_batch(config: &ImpalaConfig) -> TrainingData {
    let mut data = batch(config, 3);
    data.observation.index_axis_mut(Axis(0), 1).fill(MARKER);
    data
}

fn assert_panicked_on_second_replica(err: LearnerErr) {
    match err {
        LearnerErr::ReplicaPanicked { replica, message } => {
            assert_eq!(replica, 1);
            assert_eq!(message, "marked observation");
        }
        err => panic!("unexpected error {err}"),
    }
}

#[test]
fn a_panicking_replica_fails_the_step() {
    let config = config();
    let mut learner = ImpalaBuilder::new(config.clone())
        .unwrap()
        .make_learner(PanicsOnMarker(network()), replay(&config, 1))
        .unwrap();
    let before = learner.save().unwrap();

    let err = learner.step_on_data(&marked_batch(&config)).unwrap_err();
    assert_panicked_on_second_replica(err);
    assert_eq!(learner.save().unwrap(), before);
    assert_eq!(learner.counter().steps(), 0);

    // The rounds are left usable for the next step.
    learner.step_on_data(&batch(&config, 4)).unwrap();
    assert_eq!(learner.counter().steps(), 1);
}

#[test]
fn a_panicking_replica_fails_the_normalized_step() {
    let config = ImpalaConfig {
        use_popart: true,
        ..config()
    };
    let mut learner = ImpalaBuilder::new(config.clone())
        .unwrap()
        .make_popart_learner(PanicsOnMarker(network()), replay(&config, 1))
        .unwrap();
    let before = learner.save().unwrap();

    let err = learner.step_on_data(&marked_batch(&config)).unwrap_err();
    assert_panicked_on_second_replica(err);
    assert_eq!(learner.save().unwrap(), before);
}

#[test]
fn identical_nan_replicas_are_not_divergent() {
    let nan_rewards = |config: &ImpalaConfig| {
        let mut data = batch(config, 5);
        data.reward.fill(f32::NAN);
        data
    };

    for replicas in [1, 2] {
        let config = ImpalaConfig {
            replicas,
            agent_shuffle_interval: 0,
            ..Default::default()
        };
        let mut learner = common::learner(&config);

        let record = learner.step_on_data(&nan_rewards(&config)).unwrap();
        assert!(record["agent0/total_loss"].is_nan());
        assert!(learner.save().is_ok());
    }
}
