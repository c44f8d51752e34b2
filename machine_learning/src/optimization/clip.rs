use super::{OptState, Optimizer, optimizer::state_mismatch};
use crate::{MlErr, Result, params::ParamTree};

/// Rescales the gradient so that its global norm never exceeds `max_norm`.
#[derive(Debug, Clone, Copy)]
pub struct ClipByGlobalNorm {
    max_norm: f32,
}

impl ClipByGlobalNorm {
    /// Creates a new `ClipByGlobalNorm`.
    ///
    /// # Arguments
    /// * `max_norm` - The maximum global norm of the gradient.
    ///
    /// # Returns
    /// An error if `max_norm` isn't positive.
    pub fn new(max_norm: f32) -> Result<Self> {
        if !(max_norm > 0.) {
            return Err(MlErr::InvalidHyperParameter {
                name: "max_norm",
                value: max_norm,
            });
        }

        Ok(Self { max_norm })
    }
}

impl Optimizer for ClipByGlobalNorm {
    fn init(&self, _params: &ParamTree) -> OptState {
        OptState::Empty
    }

    fn update(&self, mut grads: ParamTree, state: &mut OptState) -> Result<ParamTree> {
        let OptState::Empty = state else {
            return Err(state_mismatch("empty"));
        };

        let norm = grads.global_norm();
        if norm > self.max_norm {
            grads.scale(self.max_norm / norm);
        }

        Ok(grads)
    }
}
