use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// A batch of unrolls of a single agent, time major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// `[time, batch, features]`
    pub observation: Array3<f32>,
    /// `[time, batch]`
    pub action: Array2<usize>,
    /// `[time, batch]`
    pub reward: Array2<f32>,
    /// `[time, batch]`
    pub discount: Array2<f32>,
    /// The logits of the policy that acted, `[time, batch, actions]`.
    pub behaviour_logits: Array3<f32>,
    /// The recurrent state at the start of the unroll, `[batch, state]`.
    pub core_state: Array2<f32>,
}

impl Trajectory {
    /// Returns the unroll length and the batch size of the trajectory.
    ///
    /// # Returns
    /// An error if the fields disagree on their leading axes, or the unroll is shorter than two
    /// steps since the last step is only used for bootstrapping.
    pub fn dims(&self) -> Result<(usize, usize)> {
        let (t, b, _) = self.observation.dim();

        let check = |what, got: (usize, usize)| {
            if got == (t, b) {
                Ok(())
            } else {
                Err(MlErr::ShapeMismatch {
                    what: format!("trajectory {what}"),
                    got: vec![got.0, got.1],
                    expected: vec![t, b],
                })
            }
        };

        check("action", self.action.dim())?;
        check("reward", self.reward.dim())?;
        check("discount", self.discount.dim())?;

        let (lt, lb, _) = self.behaviour_logits.dim();
        check("behaviour logits", (lt, lb))?;

        if self.core_state.nrows() != b {
            return Err(MlErr::SizeMismatch {
                what: "core state batch",
                got: self.core_state.nrows(),
                expected: b,
            });
        }

        if t < 2 {
            return Err(MlErr::SizeMismatch {
                what: "unroll length",
                got: t,
                expected: 2,
            });
        }

        Ok((t, b))
    }
}
