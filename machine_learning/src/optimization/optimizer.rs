use serde::{Deserialize, Serialize};

use crate::{MlErr, Result, params::ParamTree};

/// The state an `Optimizer` carries between updates.
///
/// Every tree inside the state has the same structure as the parameters it was initialized with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptState {
    Empty,
    Rms { nu: ParamTree },
    RmsMomentum { nu: ParamTree, trace: ParamTree },
    Chain(Vec<OptState>),
}

impl OptState {
    /// Checks that every tree in the state matches the structure of `params`.
    ///
    /// # Arguments
    /// * `params` - The parameters this state should belong to.
    pub fn check(&self, params: &ParamTree) -> Result<()> {
        match self {
            OptState::Empty => Ok(()),
            OptState::Rms { nu } => params.check_structure(nu, "optimizer moment"),
            OptState::RmsMomentum { nu, trace } => {
                params.check_structure(nu, "optimizer moment")?;
                params.check_structure(trace, "optimizer trace")
            }
            OptState::Chain(states) => states.iter().try_for_each(|state| state.check(params)),
        }
    }

    /// Whether both states are of the same kind and hold bitwise equal trees.
    pub fn bitwise_eq(&self, other: &OptState) -> bool {
        match (self, other) {
            (OptState::Empty, OptState::Empty) => true,
            (OptState::Rms { nu: a }, OptState::Rms { nu: b }) => a.bitwise_eq(b),
            (
                OptState::RmsMomentum { nu, trace },
                OptState::RmsMomentum {
                    nu: other_nu,
                    trace: other_trace,
                },
            ) => nu.bitwise_eq(other_nu) && trace.bitwise_eq(other_trace),
            (OptState::Chain(a), OptState::Chain(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.bitwise_eq(b))
            }
            _ => false,
        }
    }
}

/// A gradient transformation.
///
/// Optimizers are stateless themselves, everything that changes between updates lives in the
/// `OptState` they create, so that one optimizer can serve every agent and replica.
pub trait Optimizer: Send + Sync {
    /// Creates the initial optimizer state for the given parameters.
    fn init(&self, params: &ParamTree) -> OptState;

    /// Transforms a gradient into the parameter updates.
    ///
    /// # Arguments
    /// * `grads` - The gradient of the loss with respect to the parameters.
    /// * `state` - The optimizer state, updated in place.
    ///
    /// # Returns
    /// The updates to add to the parameters or an error if the state doesn't belong to this
    /// optimizer or doesn't match the gradient's structure.
    fn update(&self, grads: ParamTree, state: &mut OptState) -> Result<ParamTree>;
}

/// Adds the updates returned by an `Optimizer` to the parameters.
///
/// # Returns
/// An error if the structures don't match, in which case the parameters are left untouched.
pub fn apply_updates(params: &mut ParamTree, updates: &ParamTree) -> Result<()> {
    params.add_assign(updates)
}

pub(super) fn state_mismatch(expected: &'static str) -> MlErr {
    MlErr::OptimizerStateMismatch { expected }
}
