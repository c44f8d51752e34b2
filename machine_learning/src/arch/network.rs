use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;

use crate::{Result, params::ParamTree};

/// The output of a single network step over a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NetOutput {
    /// Unnormalized action log-probabilities, `[batch, actions]`.
    pub logits: Array2<f32>,
    /// State value estimates, `[batch]`.
    pub value: Array1<f32>,
    /// The next recurrent state, `[batch, state]`.
    pub state: Array2<f32>,
}

/// The names of the leaves that make up the value head of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueHead {
    pub weight: &'static str,
    pub bias: &'static str,
}

/// A recurrent actor-critic network.
///
/// Parameters live outside the network in a `ParamTree` so that the same network can be evaluated
/// for every agent and replica with their own parameters.
pub trait Network: Send + Sync {
    /// Whatever the forward pass needs to keep around for computing the backward pass.
    type Cache: Send;

    /// Returns the size of the recurrent state.
    fn state_size(&self) -> usize;

    /// Returns the amount of discrete actions.
    fn num_actions(&self) -> usize;

    /// Creates the recurrent state an unroll starts from.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    fn initial_state<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f32>;

    /// Initializes the parameters of the network.
    ///
    /// The parameters never depend on the batch size or the amount of agents, the initial state
    /// is only used for validating it against the network.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `initial_state` - An unbatched recurrent state.
    ///
    /// # Returns
    /// The initial parameters or an error if the state doesn't belong to this network.
    fn unroll_init<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        initial_state: ArrayView1<f32>,
    ) -> Result<ParamTree>;

    /// Makes a forward pass keeping the intermediate values needed by `backward`.
    ///
    /// # Arguments
    /// * `params` - The parameters of the network.
    /// * `observation` - A batch of observations, `[batch, features]`.
    /// * `state` - A batch of recurrent states, `[batch, state]`.
    fn forward_cached(
        &self,
        params: &ParamTree,
        observation: ArrayView2<f32>,
        state: ArrayView2<f32>,
    ) -> Result<(NetOutput, Self::Cache)>;

    /// Makes a forward pass.
    fn forward(
        &self,
        params: &ParamTree,
        observation: ArrayView2<f32>,
        state: ArrayView2<f32>,
    ) -> Result<NetOutput> {
        let (output, _) = self.forward_cached(params, observation, state)?;
        Ok(output)
    }

    /// Backpropagates the derivatives of a loss with respect to the outputs of a forward pass.
    ///
    /// The incoming recurrent state is taken as a constant, so gradients don't flow through time.
    ///
    /// # Arguments
    /// * `params` - The parameters used in the forward pass.
    /// * `cache` - The cache returned by the forward pass.
    /// * `d_logits` - The derivative of the loss with respect to the logits.
    /// * `d_value` - The derivative of the loss with respect to the values.
    ///
    /// # Returns
    /// The gradient of the loss with respect to `params`.
    fn backward(
        &self,
        params: &ParamTree,
        cache: &Self::Cache,
        d_logits: ArrayView2<f32>,
        d_value: ArrayView1<f32>,
    ) -> Result<ParamTree>;

    /// Returns the leaves the value estimate is linearly computed with.
    fn value_head(&self) -> ValueHead;
}
