use machine_learning::arch::{NetOutput, Network};
use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView4, Axis, s};
use rand::Rng;
use rand_distr::{Distribution, Gumbel};
use rayon::prelude::*;

use crate::{
    combined::CombinedState,
    error::{LearnerErr, Result},
    learner::RngSequence,
    state::AgentState,
};

/// The outputs of every agent's network on every replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// `[replica, batch, agent, actions]`.
    pub logits: Array4<f32>,
    /// `[replica, batch, agent]`.
    pub value: Array3<f32>,
    /// The next recurrent states, `[replica, batch, agent, state]`.
    pub state: Array4<f32>,
}

/// Evaluates the network of every agent on every replica, each with that replica's copy of the
/// agent's parameters.
///
/// # Arguments
/// * `network` - The network the agents share.
/// * `combined` - The replicated agent states, only read.
/// * `observation` - `[replica, batch, agent, features]`.
/// * `state` - The recurrent states, `[replica, batch, agent, state]`.
///
/// # Returns
/// The prediction or an error if the leading axes don't match the replicas and agents.
pub fn predict<N, S>(
    network: &N,
    combined: &CombinedState<S>,
    observation: ArrayView4<f32>,
    state: ArrayView4<f32>,
) -> Result<Prediction>
where
    N: Network,
    S: AgentState,
{
    let (replicas, batch, agents, _) = observation.dim();
    let expected = vec![combined.num_replicas(), batch, combined.num_agents()];

    if replicas != expected[0] || agents != expected[2] {
        return Err(LearnerErr::LayoutMismatch {
            what: "observation",
            got: observation.shape()[..3].to_vec(),
            expected,
        });
    }

    if state.shape()[..3] != expected[..] {
        return Err(LearnerErr::LayoutMismatch {
            what: "recurrent state",
            got: state.shape()[..3].to_vec(),
            expected,
        });
    }

    let outputs = (0..replicas * agents)
        .into_par_iter()
        .map(|idx| -> Result<NetOutput> {
            let (replica, agent) = (idx / agents, idx % agents);
            let params = combined
                .replica(replica)
                .and_then(|states| states.get(agent))
                .ok_or(LearnerErr::ReplicaAborted)?
                .params();

            Ok(network.forward(
                params,
                observation.slice(s![replica, .., agent, ..]),
                state.slice(s![replica, .., agent, ..]),
            )?)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut prediction = Prediction {
        logits: Array4::zeros((replicas, batch, agents, network.num_actions())),
        value: Array3::zeros((replicas, batch, agents)),
        state: Array4::zeros((replicas, batch, agents, network.state_size())),
    };

    for (idx, output) in outputs.iter().enumerate() {
        let (replica, agent) = (idx / agents, idx % agents);

        prediction
            .logits
            .slice_mut(s![replica, .., agent, ..])
            .assign(&output.logits);
        prediction
            .value
            .slice_mut(s![replica, .., agent])
            .assign(&output.value);
        prediction
            .state
            .slice_mut(s![replica, .., agent, ..])
            .assign(&output.state);
    }

    Ok(prediction)
}

/// Draws one action from a categorical distribution over unnormalized log-probabilities.
///
/// Uses the Gumbel-max trick: `argmax(logits + g)` with `g ~ Gumbel(0, 1)`.
pub fn sample_action<R: Rng + ?Sized>(
    logits: ArrayView1<f32>,
    gumbel: &Gumbel<f32>,
    rng: &mut R,
) -> usize {
    logits
        .iter()
        .map(|logit| logit + gumbel.sample(rng))
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (action, score)| {
            if score > best.1 { (action, score) } else { best }
        })
        .0
}

/// Draws an action for every set of logits along the last axis.
///
/// # Arguments
/// * `logits` - `[replica, batch, agent, actions]`.
/// * `rng` - The random number generator.
pub fn sample_actions<R: Rng + ?Sized>(
    logits: ArrayView4<f32>,
    rng: &mut R,
) -> Result<Array3<usize>> {
    let gumbel = Gumbel::new(0., 1.).map_err(|e| LearnerErr::InvalidConfig(e.to_string()))?;
    Ok(logits.map_axis(Axis(3), |lane| sample_action(lane, &gumbel, rng)))
}

/// Draws an initial recurrent state for every agent, `[agent, state]`.
pub fn initial_states<N: Network>(
    network: &N,
    agents: usize,
    rng: &mut RngSequence,
) -> Result<Array2<f32>> {
    let states: Vec<_> = (0..agents)
        .map(|_| network.initial_state(&mut rng.next_rng()))
        .collect();
    let views: Vec<_> = states.iter().map(|state| state.view()).collect();

    Ok(ndarray::stack(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn sampling_follows_the_logits() {
        let gumbel = Gumbel::new(0., 1.).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let logits = arr1(&[0., 2f32.ln(), f32::NEG_INFINITY]);

        let mut counts = [0; 3];
        for _ in 0..6000 {
            counts[sample_action(logits.view(), &gumbel, &mut rng)] += 1;
        }

        assert_eq!(counts[2], 0);
        // p = [1/3, 2/3]
        assert!((1700..2300).contains(&counts[0]), "{counts:?}");
        assert!((3700..4300).contains(&counts[1]), "{counts:?}");
    }

    #[test]
    fn sample_actions_keeps_the_leading_axes() {
        let logits = Array4::zeros((2, 3, 4, 5));
        let actions = sample_actions(logits.view(), &mut StdRng::seed_from_u64(0)).unwrap();

        assert_eq!(actions.dim(), (2, 3, 4));
        assert!(actions.iter().all(|&a| a < 5));
    }
}
