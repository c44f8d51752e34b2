use super::{OptState, Optimizer, optimizer::state_mismatch};
use crate::{Result, params::ParamTree};

/// Applies a sequence of optimizers, each one transforming the output of the previous one.
pub struct Chain {
    optimizers: Vec<Box<dyn Optimizer>>,
}

impl Chain {
    /// Creates a new `Chain`.
    ///
    /// # Arguments
    /// * `optimizers` - The transformations in the order they are applied.
    pub fn new(optimizers: Vec<Box<dyn Optimizer>>) -> Self {
        Self { optimizers }
    }
}

impl Optimizer for Chain {
    fn init(&self, params: &ParamTree) -> OptState {
        OptState::Chain(self.optimizers.iter().map(|opt| opt.init(params)).collect())
    }

    fn update(&self, grads: ParamTree, state: &mut OptState) -> Result<ParamTree> {
        let OptState::Chain(states) = state else {
            return Err(state_mismatch("chain"));
        };

        if states.len() != self.optimizers.len() {
            return Err(state_mismatch("chain"));
        }

        self.optimizers
            .iter()
            .zip(states.iter_mut())
            .try_fold(grads, |grads, (opt, state)| opt.update(grads, state))
    }
}
