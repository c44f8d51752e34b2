use std::{
    panic::{self, AssertUnwindSafe},
    thread,
};

use machine_learning::{
    arch::{
        Network,
        loss::{LossFn, LossOutput, Metrics, Trajectory},
    },
    normalization::{Moments, PopArt},
    optimization::{Optimizer, apply_updates},
    params::ParamTree,
};
use log::warn;
use rayon::prelude::*;

use crate::{
    data::Batch,
    error::{LearnerErr, Result},
    state::AgentState,
    sync::ReplicaSync,
};

/// The gradient and metrics of an agent, averaged across replicas.
struct AgentUpdate {
    grads: ParamTree,
    metrics: Metrics,
}

/// The reduction rounds of a single step.
struct Rounds {
    moments: ReplicaSync<Vec<Moments>>,
    updates: ReplicaSync<Vec<AgentUpdate>>,
}

/// The rounds a replica hasn't taken part in yet.
struct Pending {
    moments: bool,
    updates: bool,
}

/// A synchronous data parallel update of every agent on every replica.
///
/// Each replica runs on its own thread and maps its agents in parallel. Agents never share
/// anything, replicas only meet at the reductions:
///
/// 1. With a value normalizer, the moments of every agent's value targets are averaged across
///    replicas and the statistics (and, in `Full` mode, the value head) are updated with them.
/// 2. The gradient and the loss metrics of every agent are averaged across replicas.
/// 3. Each replica applies the optimizer to the averaged gradient.
///
/// Since every replica starts from the same state and applies the same averaged values, they all
/// end up with the same state.
pub struct UpdateStep<'a, N, L, O> {
    network: &'a N,
    loss: &'a L,
    optimizer: &'a O,
    popart: Option<&'a PopArt>,
}

impl<'a, N, L, O> UpdateStep<'a, N, L, O>
where
    N: Network,
    L: LossFn<N>,
    O: Optimizer,
{
    /// Creates a new `UpdateStep`.
    ///
    /// # Arguments
    /// * `network` - The network every agent trains.
    /// * `loss` - The loss to differentiate.
    /// * `optimizer` - Turns the averaged gradients into parameter updates.
    /// * `popart` - The value normalizer, if the agents' states carry value statistics.
    pub fn new(network: &'a N, loss: &'a L, optimizer: &'a O, popart: Option<&'a PopArt>) -> Self {
        Self {
            network,
            loss,
            optimizer,
            popart,
        }
    }

    /// Runs the update on every replica.
    ///
    /// # Arguments
    /// * `replicas` - The state of every agent, for every replica.
    /// * `batch` - The batch, holding one shard per replica.
    ///
    /// # Returns
    /// The new state of every agent and their metrics, for every replica. If any replica fails,
    /// panics included, the error that caused the failure is returned instead.
    pub fn run<S: AgentState>(
        &self,
        replicas: &[Vec<S>],
        batch: &Batch,
    ) -> Result<(Vec<Vec<S>>, Vec<Vec<Metrics>>)> {
        let dims = batch.dims();
        let agents = replicas.first().map_or(0, Vec::len);

        if dims.replicas != replicas.len() || dims.agents != agents {
            return Err(LearnerErr::LayoutMismatch {
                what: "batch replicas and agents",
                got: vec![dims.replicas, dims.agents],
                expected: vec![replicas.len(), agents],
            });
        }

        if S::NORMALIZED != self.popart.is_some() {
            return Err(LearnerErr::NormalizerMismatch {
                expected: S::NORMALIZED,
            });
        }

        let rounds = Rounds {
            moments: ReplicaSync::new(replicas.len()),
            updates: ReplicaSync::new(replicas.len()),
        };

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = replicas
                .iter()
                .enumerate()
                .map(|(replica, states)| {
                    let rounds = &rounds;
                    s.spawn(move || self.run_replica(replica, states, batch, rounds))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Err(LearnerErr::ReplicaAborted)))
                .collect()
        });

        let mut states = Vec::with_capacity(results.len());
        let mut metrics = Vec::with_capacity(results.len());
        let mut failure = None;

        for result in results {
            match result {
                Ok((s, m)) => {
                    states.push(s);
                    metrics.push(m);
                }
                Err(LearnerErr::ReplicaAborted) => {
                    failure.get_or_insert(LearnerErr::ReplicaAborted);
                }
                Err(e) => {
                    if matches!(failure, None | Some(LearnerErr::ReplicaAborted)) {
                        failure = Some(e);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok((states, metrics)),
        }
    }

    fn run_replica<S: AgentState>(
        &self,
        replica: usize,
        states: &[S],
        batch: &Batch,
        rounds: &Rounds,
    ) -> Result<(Vec<S>, Vec<Metrics>)> {
        let mut pending = Pending {
            moments: self.popart.is_some(),
            updates: true,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.replica_step(replica, states, batch, rounds, &mut pending)
        }))
        .unwrap_or_else(|payload| {
            let err = LearnerErr::panicked(replica, payload);
            warn!(replica = replica; "{err}");
            Err(err)
        });

        if pending.moments {
            rounds.moments.abort(replica);
        }
        if pending.updates {
            rounds.updates.abort(replica);
        }

        result
    }

    fn replica_step<S: AgentState>(
        &self,
        replica: usize,
        states: &[S],
        batch: &Batch,
        rounds: &Rounds,
        pending: &mut Pending,
    ) -> Result<(Vec<S>, Vec<Metrics>)> {
        let trajectories = batch.trajectories(replica)?;
        let mut states = states.to_vec();

        if let Some(popart) = self.popart {
            let moments = self.moments(&states, &trajectories);
            pending.moments = false;

            let averaged = rounds.moments.all_reduce(replica, moments, average_moments)?;
            self.normalize(popart, &mut states, &averaged)?;
        }

        let updates = self.gradients(&states, &trajectories);
        pending.updates = false;

        let averaged = rounds.updates.all_reduce(replica, updates, average_updates)?;
        let metrics = self.apply(&mut states, &averaged)?;

        Ok((states, metrics))
    }

    fn moments<S: AgentState>(
        &self,
        states: &[S],
        trajectories: &[Trajectory],
    ) -> Result<Vec<Moments>> {
        states
            .par_iter()
            .zip(trajectories.par_iter())
            .map(|(state, trajectory)| -> Result<Moments> {
                let targets = self.loss.value_targets(
                    self.network,
                    state.params(),
                    state.popart_state(),
                    trajectory,
                )?;

                Ok(Moments::of(targets.view())?)
            })
            .collect()
    }

    fn normalize<S: AgentState>(
        &self,
        popart: &PopArt,
        states: &mut [S],
        moments: &[Moments],
    ) -> Result<()> {
        let head = self.network.value_head();

        states
            .par_iter_mut()
            .zip(moments.par_iter())
            .try_for_each(|(state, moments)| -> Result<()> {
                let old = *state
                    .popart_state()
                    .ok_or(LearnerErr::NormalizerMismatch { expected: true })?;
                let new = popart.update(&old, moments);

                let (params, _) = state.split_mut();
                popart.preserve_outputs(params, head, &old, &new)?;

                if let Some(popart_state) = state.popart_state_mut() {
                    *popart_state = new;
                }

                Ok(())
            })
    }

    fn gradients<S: AgentState>(
        &self,
        states: &[S],
        trajectories: &[Trajectory],
    ) -> Result<Vec<AgentUpdate>> {
        states
            .par_iter()
            .zip(trajectories.par_iter())
            .map(|(state, trajectory)| -> Result<AgentUpdate> {
                let LossOutput { grads, metrics, .. } = self.loss.loss_and_grad(
                    self.network,
                    state.params(),
                    state.popart_state(),
                    trajectory,
                )?;

                Ok(AgentUpdate { grads, metrics })
            })
            .collect()
    }

    fn apply<S: AgentState>(
        &self,
        states: &mut [S],
        updates: &[AgentUpdate],
    ) -> Result<Vec<Metrics>> {
        states
            .par_iter_mut()
            .zip(updates.par_iter())
            .map(|(state, update)| -> Result<Metrics> {
                let (params, opt_state) = state.split_mut();
                let deltas = self.optimizer.update(update.grads.clone(), opt_state)?;
                apply_updates(params, &deltas)?;

                let mut metrics = update.metrics.clone();
                metrics.insert("param_norm".to_string(), params.global_norm());
                metrics.insert("param_updates_norm".to_string(), deltas.global_norm());

                if let Some(popart_state) = state.popart_state() {
                    metrics.insert("popart_shift".to_string(), popart_state.shift);
                    metrics.insert("popart_scale".to_string(), popart_state.scale);
                }

                Ok(metrics)
            })
            .collect()
    }
}

fn check_agents<T>(parts: &[Vec<T>]) -> Result<usize> {
    let agents = parts.first().map_or(0, Vec::len);

    match parts.iter().find(|part| part.len() != agents) {
        Some(part) => Err(LearnerErr::AgentCountMismatch {
            got: part.len(),
            expected: agents,
        }),
        None => Ok(agents),
    }
}

fn average_moments(parts: Vec<Vec<Moments>>) -> Result<Vec<Moments>> {
    let agents = check_agents(&parts)?;

    (0..agents)
        .map(|agent| -> Result<Moments> {
            Ok(Moments::average(parts.iter().map(|part| part[agent]))?)
        })
        .collect()
}

fn average_updates(parts: Vec<Vec<AgentUpdate>>) -> Result<Vec<AgentUpdate>> {
    let agents = check_agents(&parts)?;

    (0..agents)
        .map(|agent| -> Result<AgentUpdate> {
            let grads = ParamTree::mean(parts.iter().map(|part| &part[agent].grads))?;
            let metrics = mean_metrics(parts.iter().map(|part| &part[agent].metrics));
            Ok(AgentUpdate { grads, metrics })
        })
        .collect()
}

fn mean_metrics<'a, I>(metrics: I) -> Metrics
where
    I: IntoIterator<Item = &'a Metrics>,
{
    let mut count = 0;
    let mut sum = Metrics::new();

    for m in metrics {
        count += 1;
        for (key, value) in m {
            *sum.entry(key.clone()).or_default() += value;
        }
    }

    sum.values_mut().for_each(|v| *v /= count as f32);
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_averaged_per_key() {
        let a = Metrics::from([("loss".to_string(), 1.), ("entropy".to_string(), 0.5)]);
        let b = Metrics::from([("loss".to_string(), 3.), ("entropy".to_string(), 1.5)]);

        let mean = mean_metrics([&a, &b]);
        assert_eq!(mean["loss"], 2.);
        assert_eq!(mean["entropy"], 1.);
    }

    #[test]
    fn ragged_contributions_are_rejected() {
        let parts = vec![
            vec![Moments {
                mean: 0.,
                second_moment: 1.,
            }],
            vec![],
        ];

        assert!(matches!(
            average_moments(parts),
            Err(LearnerErr::AgentCountMismatch { .. })
        ));
    }
}
