mod common;

use std::{env, fs, process, sync::Arc};

use common::{batch, learner, popart_learner, replay};
use learner::{
    Checkpoint, ImpalaBuilder, ImpalaConfig, LearnerErr,
    counting::Counter,
    logging::{InMemoryLogger, Logger, Record},
};
use machine_learning::MlErr;
use ndarray::Array4;
use parking_lot::Mutex;

#[test]
fn restore_of_save_is_a_no_op() {
    let config = ImpalaConfig {
        replicas: 2,
        ..Default::default()
    };
    let mut learner = learner(&config);
    learner.step().unwrap();

    let saved = learner.save().unwrap();
    learner.restore(saved.clone()).unwrap();

    assert_eq!(learner.save().unwrap(), saved);
    learner.combined().check_consistency().unwrap();
}

#[test]
fn checkpoints_resume_training_exactly() {
    let config = ImpalaConfig::default();
    let path = env::temp_dir().join(format!("learner-checkpoint-{}.json", process::id()));

    let mut original = learner(&config);
    original.step().unwrap();
    original.step().unwrap();
    original.checkpoint().unwrap().write(&path).unwrap();

    let checkpoint = Checkpoint::read(&path).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!(checkpoint, original.checkpoint().unwrap());

    let mut resumed = learner(&ImpalaConfig {
        seed: 42,
        ..Default::default()
    });
    resumed.load_checkpoint(checkpoint).unwrap();
    assert_eq!(resumed.counter().steps(), 2);

    // Both the update and the shuffle that follows must match.
    let data = batch(&config, 7);
    let mut a = original.step_on_data(&data).unwrap();
    let mut b = resumed.step_on_data(&data).unwrap();
    a.remove("learner_time_elapsed");
    b.remove("learner_time_elapsed");

    assert_eq!(a, b);
    assert_eq!(original.save().unwrap(), resumed.save().unwrap());
}

#[test]
fn restoring_the_wrong_amount_of_agents_fails() {
    let mut learner = learner(&ImpalaConfig::default());
    let mut states = learner.save().unwrap();
    states.pop();

    assert!(matches!(
        learner.restore(states),
        Err(LearnerErr::AgentCountMismatch {
            got: 1,
            expected: 2
        })
    ));
}

#[test]
fn exhausted_iterator_is_fatal() {
    let config = ImpalaConfig::default();
    let source = common::replay(&config, 3).take(2);
    let mut learner = ImpalaBuilder::new(config)
        .unwrap()
        .make_learner(common::network(), source)
        .unwrap();

    learner.step().unwrap();
    learner.step().unwrap();
    assert!(matches!(
        learner.step(),
        Err(LearnerErr::IteratorExhausted { step: 2 })
    ));
}

#[test]
fn records_reach_the_logger_until_drop() {
    let logger = InMemoryLogger::new();
    let mut learner = learner(&ImpalaConfig::default()).with_logger(logger.clone());

    learner.step().unwrap();
    learner.step().unwrap();

    let records = logger.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["learner_steps"], 2.);
    assert!(records[0].contains_key("agent0/param_norm"));
    assert!(records[0].contains_key("agent1/param_updates_norm"));
    assert!(!logger.is_closed());

    drop(learner);
    assert!(logger.is_closed());
}

#[test]
fn restoring_out_of_range_statistics_fails() {
    let config = ImpalaConfig {
        use_popart: true,
        scale_lb: 0.5,
        scale_ub: 2.,
        ..Default::default()
    };
    let mut learner = popart_learner(&config, replay(&config, 1));
    let before = learner.save().unwrap();

    for scale in [4., 0.1, f32::NAN] {
        let mut states = before.clone();
        states[1].popart_state.scale = scale;

        assert!(matches!(
            learner.restore(states),
            Err(LearnerErr::Ml(MlErr::InvalidStatistics { name: "scale", .. }))
        ));
        assert_eq!(learner.save().unwrap(), before);
    }

    let mut states = before.clone();
    states[0].popart_state.shift = f32::INFINITY;
    assert!(learner.restore(states).is_err());
}

/// Remembers the steps key it was handed.
#[derive(Clone, Default)]
struct KeyedLogger {
    steps_key: Arc<Mutex<String>>,
    records: Arc<Mutex<Vec<Record>>>,
}

impl Logger for KeyedLogger {
    fn write(&mut self, record: &Record) {
        self.records.lock().push(record.clone());
    }

    fn set_steps_key(&mut self, steps_key: &str) {
        *self.steps_key.lock() = steps_key.to_string();
    }
}

#[test]
fn loggers_follow_a_replaced_counter() {
    let logger = KeyedLogger::default();
    let mut learner = learner(&ImpalaConfig::default())
        .with_logger(logger.clone())
        .with_counter(Counter::new("actor"));

    assert_eq!(*logger.steps_key.lock(), "actor_steps");

    learner.step().unwrap();
    assert_eq!(logger.records.lock()[0]["actor_steps"], 1.);
}

#[test]
fn predictions_do_not_touch_the_state() {
    let config = ImpalaConfig {
        replicas: 2,
        n_agents: 3,
        ..Default::default()
    };
    let mut learner = learner(&config);
    let before = learner.save().unwrap();

    let initial = learner.initial_recurrent_states().unwrap();
    assert_eq!(initial.dim(), (3, common::STATE));

    let observation = Array4::from_elem((2, 5, 3, common::OBS), 0.3);
    let state = Array4::zeros((2, 5, 3, common::STATE));
    let (actions, prediction) = learner
        .get_actions(observation.view(), state.view())
        .unwrap();

    assert_eq!(actions.dim(), (2, 5, 3));
    assert!(actions.iter().all(|&a| a < common::ACTIONS));
    assert_eq!(prediction.logits.dim(), (2, 5, 3, common::ACTIONS));
    assert_eq!(prediction.value.dim(), (2, 5, 3));
    assert_eq!(prediction.state.dim(), (2, 5, 3, common::STATE));

    assert_eq!(learner.save().unwrap(), before);

    let wrong = Array4::zeros((2, 5, 2, common::OBS));
    assert!(matches!(
        learner.predict(wrong.view(), state.view()),
        Err(LearnerErr::LayoutMismatch { .. })
    ));
}
