use machine_learning::{
    normalization::{PopArt, PopArtState},
    optimization::OptState,
    params::ParamTree,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{LearnerErr, Result};

/// The training state of a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub params: ParamTree,
    pub opt_state: OptState,
}

/// The training state of a single agent whose value head is normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopArtTrainingState {
    pub params: ParamTree,
    pub opt_state: OptState,
    pub popart_state: PopArtState,
}

/// What the learner needs from a per agent training state.
pub trait AgentState:
    Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Whether this state carries value statistics.
    const NORMALIZED: bool;

    /// Creates a new state from freshly initialized parameters.
    ///
    /// # Arguments
    /// * `params` - The initial parameters.
    /// * `opt_state` - The optimizer state initialized from `params`.
    /// * `popart` - The value normalizer, required exactly when `NORMALIZED`.
    fn new(params: ParamTree, opt_state: OptState, popart: Option<&PopArt>) -> Result<Self>;

    fn params(&self) -> &ParamTree;

    fn opt_state(&self) -> &OptState;

    /// Borrows the parameters and the optimizer state at once.
    fn split_mut(&mut self) -> (&mut ParamTree, &mut OptState);

    fn popart_state(&self) -> Option<&PopArtState>;

    fn popart_state_mut(&mut self) -> Option<&mut PopArtState>;

    /// Checks that the optimizer state belongs to the parameters and, for normalized states,
    /// that the statistics could have come from `popart`.
    fn check(&self, popart: Option<&PopArt>) -> Result<()> {
        self.opt_state().check(self.params())?;

        match (self.popart_state(), popart) {
            (Some(state), Some(popart)) => Ok(popart.check(state)?),
            (None, None) => Ok(()),
            _ => Err(LearnerErr::NormalizerMismatch {
                expected: Self::NORMALIZED,
            }),
        }
    }

    /// Compares every float bit for bit, so that identical `NaN`s count as equal.
    fn bitwise_eq(&self, other: &Self) -> bool {
        self.params().bitwise_eq(other.params())
            && self.opt_state().bitwise_eq(other.opt_state())
            && match (self.popart_state(), other.popart_state()) {
                (Some(a), Some(b)) => a.bitwise_eq(b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl AgentState for TrainingState {
    const NORMALIZED: bool = false;

    fn new(params: ParamTree, opt_state: OptState, popart: Option<&PopArt>) -> Result<Self> {
        if popart.is_some() {
            return Err(LearnerErr::NormalizerMismatch { expected: false });
        }

        Ok(Self { params, opt_state })
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn opt_state(&self) -> &OptState {
        &self.opt_state
    }

    fn split_mut(&mut self) -> (&mut ParamTree, &mut OptState) {
        (&mut self.params, &mut self.opt_state)
    }

    fn popart_state(&self) -> Option<&PopArtState> {
        None
    }

    fn popart_state_mut(&mut self) -> Option<&mut PopArtState> {
        None
    }
}

impl AgentState for PopArtTrainingState {
    const NORMALIZED: bool = true;

    fn new(params: ParamTree, opt_state: OptState, popart: Option<&PopArt>) -> Result<Self> {
        let popart = popart.ok_or(LearnerErr::NormalizerMismatch { expected: true })?;

        Ok(Self {
            params,
            opt_state,
            popart_state: popart.init(),
        })
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn opt_state(&self) -> &OptState {
        &self.opt_state
    }

    fn split_mut(&mut self) -> (&mut ParamTree, &mut OptState) {
        (&mut self.params, &mut self.opt_state)
    }

    fn popart_state(&self) -> Option<&PopArtState> {
        Some(&self.popart_state)
    }

    fn popart_state_mut(&mut self) -> Option<&mut PopArtState> {
        Some(&mut self.popart_state)
    }
}
