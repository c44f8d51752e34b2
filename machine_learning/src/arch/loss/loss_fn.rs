use std::collections::BTreeMap;

use ndarray::Array1;

use super::Trajectory;
use crate::{Result, arch::Network, normalization::PopArtState, params::ParamTree};

/// Named scalar diagnostics.
pub type Metrics = BTreeMap<String, f32>;

/// The result of differentiating a loss.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    pub grads: ParamTree,
    pub metrics: Metrics,
}

/// A differentiable loss over trajectories of a network.
pub trait LossFn<N: Network>: Send + Sync {
    /// Computes the unnormalized value targets of a trajectory, flattened in time major order.
    ///
    /// # Arguments
    /// * `network` - The network that is being trained.
    /// * `params` - The parameters of the network.
    /// * `popart` - The statistics the value head is normalized with, if any.
    /// * `trajectory` - The trajectory to compute targets for.
    fn value_targets(
        &self,
        network: &N,
        params: &ParamTree,
        popart: Option<&PopArtState>,
        trajectory: &Trajectory,
    ) -> Result<Array1<f32>>;

    /// Computes the loss and its gradient with respect to the parameters.
    ///
    /// # Arguments
    /// * `network` - The network that is being trained.
    /// * `params` - The parameters of the network.
    /// * `popart` - The statistics the value head is normalized with, if any.
    /// * `trajectory` - The trajectory to compute the loss on.
    ///
    /// # Returns
    /// The loss, the gradient and the metrics of the computation.
    fn loss_and_grad(
        &self,
        network: &N,
        params: &ParamTree,
        popart: Option<&PopArtState>,
        trajectory: &Trajectory,
    ) -> Result<LossOutput>;
}
