use super::{OptState, Optimizer, optimizer::state_mismatch};
use crate::{Result, params::ParamTree};

/// Gradient descent optimization algorithm.
#[derive(Debug, Clone, Copy)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `update`.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn init(&self, _params: &ParamTree) -> OptState {
        OptState::Empty
    }

    /// Makes a step in the opposite direction of the gradient, with a length of `learning_rate`.
    fn update(&self, mut grads: ParamTree, state: &mut OptState) -> Result<ParamTree> {
        let OptState::Empty = state else {
            return Err(state_mismatch("empty"));
        };

        grads.scale(-self.learning_rate);
        Ok(grads)
    }
}
