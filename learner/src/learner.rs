use std::time::Instant;

use log::{debug, info};
use machine_learning::{
    arch::{
        Network,
        loss::{LossFn, Metrics},
    },
    normalization::PopArt,
    optimization::Optimizer,
    params::ParamTree,
};
use ndarray::{Array2, Array3, ArrayView4};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::Checkpoint,
    combined::{CombinedState, permute},
    counting::Counter,
    data::{ReplaySample, TrainingData},
    error::{LearnerErr, Result},
    logging::{Logger, Record, TerminalLogger},
    predict::{self, Prediction},
    state::{AgentState, PopArtTrainingState, TrainingState},
    step::UpdateStep,
};

/// A deterministic sequence of random number generators.
///
/// Every draw derives a fresh generator from the seed and the amount of previous draws, so saving
/// the sequence is enough to reproduce every following draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSequence {
    seed: u64,
    drawn: u64,
}

impl RngSequence {
    pub fn new(seed: u64) -> Self {
        Self { seed, drawn: 0 }
    }

    /// Returns the next generator of the sequence.
    pub fn next_rng(&mut self) -> StdRng {
        let key = self.seed ^ self.drawn.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        self.drawn += 1;
        StdRng::seed_from_u64(key)
    }
}

/// How a `Learner` lays out and reshuffles its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnerOptions {
    pub n_agents: usize,
    pub replicas: usize,
    pub seed: u64,
    /// Agents are reshuffled every this many steps, zero never reshuffles them.
    pub shuffle_interval: u64,
}

/// Trains a set of independent agents with synchronous data parallel SGD.
///
/// Every agent holds its own parameters, optimizer state and, for normalized states, value
/// statistics. The whole set is replicated once per replica and every step shards the batch among
/// the replicas, averaging the gradients before any replica applies them.
pub struct Learner<S, N, L, O> {
    network: N,
    loss: L,
    optimizer: O,
    popart: Option<PopArt>,
    iterator: Box<dyn Iterator<Item = ReplaySample> + Send>,
    combined: CombinedState<S>,
    rng: RngSequence,
    counter: Counter,
    logger: Box<dyn Logger>,
    shuffle_interval: u64,
}

/// A learner whose agents train on raw value targets.
pub type MaLearner<N, L, O> = Learner<TrainingState, N, L, O>;

/// A learner whose agents normalize their value targets.
pub type MaLearnerPopArt<N, L, O> = Learner<PopArtTrainingState, N, L, O>;

impl<S, N, L, O> Learner<S, N, L, O>
where
    S: AgentState,
    N: Network,
    L: LossFn<N>,
    O: Optimizer,
{
    /// Creates a new `Learner`, initializing every agent from the seed.
    ///
    /// # Arguments
    /// * `network` - The network every agent trains.
    /// * `loss` - The loss to minimize.
    /// * `optimizer` - Turns gradients into parameter updates.
    /// * `popart` - The value normalizer, required exactly when `S` is a normalized state.
    /// * `iterator` - The source of batches.
    /// * `options` - The amount of agents and replicas, the seed and the shuffle interval.
    ///
    /// # Returns
    /// The learner or an error if the options are invalid or the network fails to initialize.
    pub fn new<I>(
        network: N,
        loss: L,
        optimizer: O,
        popart: Option<PopArt>,
        iterator: I,
        options: LearnerOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = ReplaySample>,
        I::IntoIter: Send + 'static,
    {
        if S::NORMALIZED != popart.is_some() {
            return Err(LearnerErr::NormalizerMismatch {
                expected: S::NORMALIZED,
            });
        }

        let mut rng = RngSequence::new(options.seed);
        let states = (0..options.n_agents)
            .map(|_| {
                let mut agent_rng = rng.next_rng();
                let initial_state = network.initial_state(&mut agent_rng);
                let params = network.unroll_init(&mut agent_rng, initial_state.view())?;
                let opt_state = optimizer.init(&params);
                S::new(params, opt_state, popart.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;

        let combined = CombinedState::replicate(states, options.replicas)?;
        let counter = Counter::default();
        let logger = TerminalLogger::new("learner", &counter.steps_key());

        info!(
            agents = options.n_agents,
            replicas = options.replicas,
            seed = options.seed,
            normalized = S::NORMALIZED;
            "learner initialized"
        );

        Ok(Self {
            network,
            loss,
            optimizer,
            popart,
            iterator: Box::new(iterator.into_iter()),
            combined,
            rng,
            counter,
            logger: Box::new(logger),
            shuffle_interval: options.shuffle_interval,
        })
    }

    /// Replaces the step counter, as when sharing one with the rest of the process. The logger
    /// is pointed at the new counter's steps key.
    pub fn with_counter(mut self, counter: Counter) -> Self {
        self.logger.set_steps_key(&counter.steps_key());
        self.counter = counter;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_logger<G: Logger + 'static>(mut self, logger: G) -> Self {
        self.logger = Box::new(logger);
        self.logger.set_steps_key(&self.counter.steps_key());
        self
    }

    /// Pulls a batch from the iterator and trains on it.
    ///
    /// # Returns
    /// The logged record or an error if the iterator is exhausted or the update fails.
    pub fn step(&mut self) -> Result<Record> {
        let sample = self
            .iterator
            .next()
            .ok_or(LearnerErr::IteratorExhausted {
                step: self.counter.steps(),
            })?;

        debug!(key = sample.key; "pulled replay sample");
        self.step_on_data(&sample.data)
    }

    /// Trains every agent on a batch.
    ///
    /// The state is only replaced if the update succeeds on every replica and every replica ends
    /// up with the same state. Afterwards the agents may be reshuffled and the metrics of every
    /// agent, keyed as `agent{i}/{name}`, are written along with the counts.
    ///
    /// # Arguments
    /// * `data` - A batch holding one shard per replica and one trajectory set per agent.
    pub fn step_on_data(&mut self, data: &TrainingData) -> Result<Record> {
        let start = Instant::now();
        let batch = data.canonical()?;

        let update = UpdateStep::new(
            &self.network,
            &self.loss,
            &self.optimizer,
            self.popart.as_ref(),
        );
        let (replicas, metrics) = update.run(self.combined.replicas(), &batch)?;

        let combined = CombinedState::from_replicas(replicas)?;
        combined.check_consistency()?;
        let metrics = representative_metrics(metrics)?;
        self.combined = combined;

        let counts = self
            .counter
            .increment(1, start.elapsed().as_secs_f64());
        let steps = self.counter.steps();

        if self.shuffle_interval > 0 && steps % self.shuffle_interval == 0 {
            self.shuffle_agents()?;
        }

        let mut record: Record = metrics
            .iter()
            .enumerate()
            .flat_map(|(agent, metrics)| {
                metrics
                    .iter()
                    .map(move |(name, &value)| (format!("agent{agent}/{name}"), value as f64))
            })
            .collect();
        record.extend(counts);

        debug!(step = steps; "finished step in {:?}", start.elapsed());
        self.logger.write(&record);
        Ok(record)
    }

    /// Reorders the agents with a permutation drawn from the learner's random sequence.
    ///
    /// # Returns
    /// The permutation applied, agent `i` now holds the state agent `order[i]` had.
    pub fn shuffle_agents(&mut self) -> Result<Vec<usize>> {
        let n = self.combined.num_agents();
        let order = index::sample(&mut self.rng.next_rng(), n, n).into_vec();

        let states = permute(&self.save()?, &order)?;
        self.broadcast(states)?;

        debug!("shuffled agents into {order:?}");
        Ok(order)
    }

    /// Extracts the canonical state of every agent.
    ///
    /// # Returns
    /// The state or an error if the replicas diverged.
    pub fn save(&self) -> Result<Vec<S>> {
        self.combined.reduce_to_canonical()
    }

    /// Broadcasts the state of every agent to every replica.
    ///
    /// # Returns
    /// An error if the amount of agents or the structure of their parameters doesn't match the
    /// current state, or if their value statistics couldn't have come from the learner's
    /// normalizer. In that case nothing is replaced.
    pub fn restore(&mut self, states: Vec<S>) -> Result<()> {
        let current = self
            .combined
            .replica(0)
            .ok_or(LearnerErr::ReplicaAborted)?;

        if states.len() != current.len() {
            return Err(LearnerErr::AgentCountMismatch {
                got: states.len(),
                expected: current.len(),
            });
        }

        for (state, current) in states.iter().zip(current) {
            current
                .params()
                .check_structure(state.params(), "restored parameters")?;
            state.check(self.popart.as_ref())?;
        }

        self.broadcast(states)
    }

    fn broadcast(&mut self, states: Vec<S>) -> Result<()> {
        self.combined = CombinedState::replicate(states, self.combined.num_replicas())?;
        Ok(())
    }

    /// Returns the canonical parameters of every agent.
    pub fn get_variables(&self) -> Result<Vec<ParamTree>> {
        Ok(self
            .save()?
            .into_iter()
            .map(|state| state.params().clone())
            .collect())
    }

    /// Snapshots everything needed to resume training.
    pub fn checkpoint(&self) -> Result<Checkpoint<S>> {
        Ok(Checkpoint {
            states: self.save()?,
            counts: self.counter.counts(),
            rng: self.rng,
        })
    }

    /// Resumes training from a snapshot.
    pub fn load_checkpoint(&mut self, checkpoint: Checkpoint<S>) -> Result<()> {
        self.restore(checkpoint.states)?;
        self.counter.restore(checkpoint.counts);
        self.rng = checkpoint.rng;
        Ok(())
    }

    /// Evaluates the network of every agent on every replica without touching their state.
    ///
    /// # Arguments
    /// * `observation` - `[replica, batch, agent, features]`.
    /// * `state` - The recurrent states, `[replica, batch, agent, state]`.
    pub fn predict(
        &self,
        observation: ArrayView4<f32>,
        state: ArrayView4<f32>,
    ) -> Result<Prediction> {
        predict::predict(&self.network, &self.combined, observation, state)
    }

    /// Samples an action for every agent from its current policy.
    ///
    /// # Returns
    /// The actions, `[replica, batch, agent]`, and the prediction they were sampled from.
    pub fn get_actions(
        &mut self,
        observation: ArrayView4<f32>,
        state: ArrayView4<f32>,
    ) -> Result<(Array3<usize>, Prediction)> {
        let prediction = self.predict(observation, state)?;
        let actions = predict::sample_actions(prediction.logits.view(), &mut self.rng.next_rng())?;
        Ok((actions, prediction))
    }

    /// Draws a fresh recurrent state for every agent, `[agent, state]`.
    pub fn initial_recurrent_states(&mut self) -> Result<Array2<f32>> {
        predict::initial_states(&self.network, self.combined.num_agents(), &mut self.rng)
    }

    pub fn combined(&self) -> &CombinedState<S> {
        &self.combined
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }
}

impl<S, N, L, O> Drop for Learner<S, N, L, O> {
    fn drop(&mut self) {
        self.logger.close();
    }
}

/// Takes the metrics of replica 0 after checking that every replica computed the same ones.
fn representative_metrics(replicas: Vec<Vec<Metrics>>) -> Result<Vec<Metrics>> {
    let mut replicas = replicas.into_iter();
    let first = replicas.next().ok_or(LearnerErr::ReplicaAborted)?;

    for (idx, other) in replicas.enumerate() {
        if !same_metrics(&first, &other) {
            return Err(LearnerErr::ReplicaDivergence { replica: idx + 1 });
        }
    }

    Ok(first)
}

/// Bitwise comparison, so that two `NaN`s count as equal.
fn same_metrics(a: &[Metrics], b: &[Metrics]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(a, b)| {
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b)
                    .all(|((ka, va), (kb, vb))| ka == kb && va.to_bits() == vb.to_bits())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(value: f32) -> Vec<Metrics> {
        vec![Metrics::from([("loss".to_string(), value)])]
    }

    #[test]
    fn rng_sequence_is_reproducible() {
        use rand::Rng;

        let mut a = RngSequence::new(7);
        let mut b = RngSequence::new(7);
        a.next_rng();
        b.next_rng();

        let mut snapshot = a;
        let x: u64 = a.next_rng().random();
        let y: u64 = b.next_rng().random();
        let z: u64 = snapshot.next_rng().random();

        assert_eq!(x, y);
        assert_eq!(x, z);
        assert_ne!(x, RngSequence::new(7).next_rng().random::<u64>());
    }

    #[test]
    fn diverging_metrics_are_reported() {
        let same = vec![metrics(1.), metrics(1.), metrics(1.)];
        assert_eq!(representative_metrics(same).unwrap(), metrics(1.));

        let diverged = vec![metrics(1.), metrics(1.), metrics(2.)];
        assert!(matches!(
            representative_metrics(diverged),
            Err(LearnerErr::ReplicaDivergence { replica: 2 })
        ));
    }

    #[test]
    fn nan_metrics_still_match() {
        assert!(same_metrics(&metrics(f32::NAN), &metrics(f32::NAN)));
    }
}
