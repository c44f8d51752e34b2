use crate::{
    error::{LearnerErr, Result},
    state::AgentState,
};

/// The per agent states stacked along the agent axis and replicated along the replica axis.
///
/// Every replica holds the same logical state, so any of them can be taken as the canonical one
/// once they are checked to be identical.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedState<S> {
    replicas: Vec<Vec<S>>,
}

impl<S: AgentState> CombinedState<S> {
    /// Broadcasts the agents' states to every replica.
    ///
    /// # Arguments
    /// * `states` - The state of every agent.
    /// * `replicas` - The amount of copies to make.
    pub fn replicate(states: Vec<S>, replicas: usize) -> Result<Self> {
        if replicas == 0 {
            return Err(LearnerErr::InvalidConfig(
                "there must be at least one replica".to_string(),
            ));
        }

        if states.is_empty() {
            return Err(LearnerErr::InvalidConfig(
                "there must be at least one agent".to_string(),
            ));
        }

        let mut copies = vec![states.clone(); replicas - 1];
        copies.insert(0, states);
        Ok(Self { replicas: copies })
    }

    /// Wraps the states computed by every replica.
    ///
    /// # Returns
    /// An error if there are no replicas or they disagree on the amount of agents.
    pub(crate) fn from_replicas(replicas: Vec<Vec<S>>) -> Result<Self> {
        let expected = replicas.first().ok_or(LearnerErr::ReplicaAborted)?.len();

        if let Some(replica) = replicas.iter().find(|r| r.len() != expected) {
            return Err(LearnerErr::AgentCountMismatch {
                got: replica.len(),
                expected,
            });
        }

        Ok(Self { replicas })
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn num_agents(&self) -> usize {
        self.replicas[0].len()
    }

    /// Returns the state of every agent held by a replica.
    pub fn replica(&self, replica: usize) -> Option<&[S]> {
        self.replicas.get(replica).map(Vec::as_slice)
    }

    pub(crate) fn replicas(&self) -> &[Vec<S>] {
        &self.replicas
    }

    /// Checks that every replica holds bit for bit the same state as replica 0.
    pub fn check_consistency(&self) -> Result<()> {
        let (first, rest) = self
            .replicas
            .split_first()
            .ok_or(LearnerErr::ReplicaAborted)?;

        let same = |replica: &Vec<S>| {
            replica.len() == first.len()
                && replica.iter().zip(first).all(|(a, b)| a.bitwise_eq(b))
        };

        match rest.iter().position(|replica| !same(replica)) {
            Some(idx) => Err(LearnerErr::ReplicaDivergence { replica: idx + 1 }),
            None => Ok(()),
        }
    }

    /// Extracts the canonical state after checking that the replicas agree.
    pub fn reduce_to_canonical(&self) -> Result<Vec<S>> {
        self.check_consistency()?;
        Ok(self.replicas[0].clone())
    }
}

/// Checks that `order` is a permutation of `0..n`.
pub fn check_permutation(order: &[usize], n: usize) -> Result<()> {
    let mut seen = vec![false; n];

    for &i in order {
        match seen.get_mut(i) {
            Some(seen) if !*seen => *seen = true,
            _ => {
                return Err(LearnerErr::InvalidPermutation {
                    order: order.to_vec(),
                });
            }
        }
    }

    if order.len() != n {
        return Err(LearnerErr::InvalidPermutation {
            order: order.to_vec(),
        });
    }

    Ok(())
}

/// Reorders a list, item `i` of the result is item `order[i]` of `items`.
pub fn permute<T: Clone>(items: &[T], order: &[usize]) -> Result<Vec<T>> {
    check_permutation(order, items.len())?;
    Ok(order.iter().map(|&i| items[i].clone()).collect())
}

#[cfg(test)]
mod tests {
    use machine_learning::{optimization::OptState, params::ParamTree};
    use ndarray::arr1;

    use super::*;
    use crate::state::TrainingState;

    fn state(value: f32) -> TrainingState {
        TrainingState {
            params: ParamTree::new()
                .with_leaf("w", arr1(&[value]).into_dyn())
                .unwrap(),
            opt_state: OptState::Empty,
        }
    }

    #[test]
    fn replicate_then_reduce() {
        let states = vec![state(1.), state(2.)];
        let combined = CombinedState::replicate(states.clone(), 3).unwrap();

        assert_eq!(combined.num_replicas(), 3);
        assert_eq!(combined.num_agents(), 2);
        assert_eq!(combined.reduce_to_canonical().unwrap(), states);
    }

    #[test]
    fn divergence_is_detected() {
        let combined = CombinedState::from_replicas(vec![
            vec![state(1.)],
            vec![state(1.)],
            vec![state(1.5)],
        ])
        .unwrap();

        assert!(matches!(
            combined.reduce_to_canonical(),
            Err(LearnerErr::ReplicaDivergence { replica: 2 })
        ));
    }

    #[test]
    fn identical_nan_states_are_consistent() {
        let combined = CombinedState::replicate(vec![state(f32::NAN)], 2).unwrap();
        assert!(combined.check_consistency().is_ok());

        let negated =
            CombinedState::from_replicas(vec![vec![state(f32::NAN)], vec![state(-f32::NAN)]])
                .unwrap();
        assert!(matches!(
            negated.check_consistency(),
            Err(LearnerErr::ReplicaDivergence { replica: 1 })
        ));
    }

    #[test]
    fn permutations() {
        assert_eq!(permute(&['a', 'b', 'c'], &[2, 0, 1]).unwrap(), vec!['c', 'a', 'b']);
        assert!(permute(&['a', 'b'], &[0]).is_err());
        assert!(permute(&['a', 'b'], &[1, 1]).is_err());
        assert!(permute(&['a', 'b'], &[0, 2]).is_err());
    }

    #[test]
    fn zero_replicas() {
        assert!(CombinedState::replicate(vec![state(1.)], 0).is_err());
    }
}
