use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, arr1, linalg};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{NetOutput, Network, ValueHead, activations::ActFn};
use crate::{
    MlErr, Result,
    initialization::{RandWeightGen, WeightGen},
    params::ParamTree,
};

const CORE_W_X: &str = "core/w_x";
const CORE_W_H: &str = "core/w_h";
const CORE_B: &str = "core/b";
const POLICY_W: &str = "policy/w";
const POLICY_B: &str = "policy/b";
const VALUE_W: &str = "value/w";
const VALUE_B: &str = "value/b";

/// A single layer recurrent actor-critic:
///
/// ```text
/// h' = act(x · Wx + h · Wh + b)
/// logits = h' · Wpi + bpi
/// value = h' · Wv + bv
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentPolicy {
    obs_size: usize,
    state_size: usize,
    num_actions: usize,
    act_fn: ActFn,
}

/// Forward metadata of a `RecurrentPolicy` step.
#[derive(Debug, Clone)]
pub struct RecurrentCache {
    x: Array2<f32>,
    h: Array2<f32>,
    z: Array2<f32>,
    a: Array2<f32>,
}

impl RecurrentPolicy {
    /// Creates a new `RecurrentPolicy`.
    ///
    /// # Arguments
    /// * `obs_size` - The amount of features in an observation.
    /// * `state_size` - The size of the recurrent state.
    /// * `num_actions` - The amount of discrete actions.
    /// * `act_fn` - The activation of the recurrent core.
    ///
    /// # Returns
    /// An error if any of the sizes is zero.
    pub fn new(
        obs_size: usize,
        state_size: usize,
        num_actions: usize,
        act_fn: ActFn,
    ) -> Result<Self> {
        if obs_size == 0 || state_size == 0 || num_actions == 0 {
            return Err(MlErr::InvalidInput("network sizes must be positive"));
        }

        Ok(Self {
            obs_size,
            state_size,
            num_actions,
            act_fn,
        })
    }

    pub fn obs_size(&self) -> usize {
        self.obs_size
    }

    fn expected_shapes(&self) -> [(&'static str, Vec<usize>); 7] {
        let (d, h, a) = (self.obs_size, self.state_size, self.num_actions);

        [
            (CORE_W_X, vec![d, h]),
            (CORE_W_H, vec![h, h]),
            (CORE_B, vec![h]),
            (POLICY_W, vec![h, a]),
            (POLICY_B, vec![a]),
            (VALUE_W, vec![h, 1]),
            (VALUE_B, vec![1]),
        ]
    }

    fn check_params(&self, params: &ParamTree) -> Result<()> {
        for (name, expected) in self.expected_shapes() {
            let got = params.get(name)?.shape();

            if got != expected.as_slice() {
                return Err(MlErr::ShapeMismatch {
                    what: name.to_string(),
                    got: got.to_vec(),
                    expected,
                });
            }
        }

        Ok(())
    }

    fn check_batch(&self, observation: &ArrayView2<f32>, state: &ArrayView2<f32>) -> Result<()> {
        if observation.ncols() != self.obs_size {
            return Err(MlErr::SizeMismatch {
                what: "observation features",
                got: observation.ncols(),
                expected: self.obs_size,
            });
        }

        if state.ncols() != self.state_size {
            return Err(MlErr::SizeMismatch {
                what: "recurrent state",
                got: state.ncols(),
                expected: self.state_size,
            });
        }

        if state.nrows() != observation.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "recurrent state batch",
                got: state.nrows(),
                expected: observation.nrows(),
            });
        }

        Ok(())
    }
}

impl Network for RecurrentPolicy {
    type Cache = RecurrentCache;

    fn state_size(&self) -> usize {
        self.state_size
    }

    fn num_actions(&self) -> usize {
        self.num_actions
    }

    fn initial_state<R: Rng + ?Sized>(&self, _rng: &mut R) -> Array1<f32> {
        Array1::zeros(self.state_size)
    }

    fn unroll_init<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        initial_state: ArrayView1<f32>,
    ) -> Result<ParamTree> {
        if initial_state.len() != self.state_size {
            return Err(MlErr::SizeMismatch {
                what: "initial state",
                got: initial_state.len(),
                expected: self.state_size,
            });
        }

        let zeros = RandWeightGen::constant(0.)?;
        let mut params = ParamTree::new();

        for (name, shape) in self.expected_shapes() {
            let value = if shape.len() == 2 {
                RandWeightGen::lecun_uniform(shape[0])?.sample(rng, &shape)
            } else {
                zeros.sample(rng, &shape)
            };

            params.insert(name, value)?;
        }

        Ok(params)
    }

    fn forward_cached(
        &self,
        params: &ParamTree,
        observation: ArrayView2<f32>,
        state: ArrayView2<f32>,
    ) -> Result<(NetOutput, RecurrentCache)> {
        self.check_params(params)?;
        self.check_batch(&observation, &state)?;

        let w_x = params.matrix(CORE_W_X)?;
        let w_h = params.matrix(CORE_W_H)?;
        let b = params.vector(CORE_B)?;

        let mut z = Array2::zeros((observation.nrows(), self.state_size));
        linalg::general_mat_mul(1.0, &observation, &w_x, 0.0, &mut z);
        linalg::general_mat_mul(1.0, &state, &w_h, 1.0, &mut z);
        z += &b;

        let act_fn = &self.act_fn;
        let a = z.mapv(|z| act_fn.f(z));

        let mut logits = a.dot(&params.matrix(POLICY_W)?);
        logits += &params.vector(POLICY_B)?;

        let value_bias = params.vector(VALUE_B)?[0];
        let value = a.dot(&params.matrix(VALUE_W)?).column(0).mapv(|v| v + value_bias);

        let output = NetOutput {
            logits,
            value,
            state: a.clone(),
        };

        let cache = RecurrentCache {
            x: observation.to_owned(),
            h: state.to_owned(),
            z,
            a,
        };

        Ok((output, cache))
    }

    fn backward(
        &self,
        params: &ParamTree,
        cache: &RecurrentCache,
        d_logits: ArrayView2<f32>,
        d_value: ArrayView1<f32>,
    ) -> Result<ParamTree> {
        self.check_params(params)?;

        let batch = cache.a.nrows();
        if d_logits.dim() != (batch, self.num_actions) {
            return Err(MlErr::ShapeMismatch {
                what: "logits derivative".to_string(),
                got: d_logits.shape().to_vec(),
                expected: vec![batch, self.num_actions],
            });
        }

        if d_value.len() != batch {
            return Err(MlErr::SizeMismatch {
                what: "value derivative",
                got: d_value.len(),
                expected: batch,
            });
        }

        let w_pi = params.matrix(POLICY_W)?;
        let w_v = params.matrix(VALUE_W)?;
        let d_value = d_value.insert_axis(Axis(1));

        let mut d = d_logits.dot(&w_pi.t());
        linalg::general_mat_mul(1.0, &d_value, &w_v.t(), 1.0, &mut d);

        let act_fn = &self.act_fn;
        d.zip_mut_with(&cache.z, |d, &z| *d *= act_fn.df(z));

        ParamTree::new()
            .with_leaf(CORE_W_X, cache.x.t().dot(&d).into_dyn())?
            .with_leaf(CORE_W_H, cache.h.t().dot(&d).into_dyn())?
            .with_leaf(CORE_B, d.sum_axis(Axis(0)).into_dyn())?
            .with_leaf(POLICY_W, cache.a.t().dot(&d_logits).into_dyn())?
            .with_leaf(POLICY_B, d_logits.sum_axis(Axis(0)).into_dyn())?
            .with_leaf(VALUE_W, cache.a.t().dot(&d_value).into_dyn())?
            .with_leaf(VALUE_B, arr1(&[d_value.sum()]).into_dyn())
    }

    fn value_head(&self) -> ValueHead {
        ValueHead {
            weight: VALUE_W,
            bias: VALUE_B,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, arr2};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn setup() -> (RecurrentPolicy, ParamTree, Array2<f32>, Array2<f32>) {
        let net = RecurrentPolicy::new(3, 4, 2, ActFn::tanh()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let state = net.initial_state(&mut rng);
        let mut params = net.unroll_init(&mut rng, state.view()).unwrap();

        // Non zero biases so that every derivative is exercised.
        params.map_inplace(|w| *w += 0.05);

        let obs = arr2(&[[0.5, -1.0, 0.2], [0.1, 0.3, -0.7]]);
        let state = arr2(&[[0.1, -0.2, 0.3, 0.0], [-0.5, 0.4, 0.0, 0.2]]);
        (net, params, obs, state)
    }

    fn objective(
        net: &RecurrentPolicy,
        params: &ParamTree,
        obs: &Array2<f32>,
        h: &Array2<f32>,
    ) -> f32 {
        let out = net.forward(params, obs.view(), h.view()).unwrap();
        let c = arr2(&[[1.0, -2.0], [0.5, 0.25]]);
        let value: f32 = out.value.iter().zip([3.0, -1.0]).map(|(v, c)| v * c).sum();
        (&out.logits * &c).sum() + value
    }

    #[test]
    fn shapes() {
        let (net, params, obs, state) = setup();
        let out = net.forward(&params, obs.view(), state.view()).unwrap();

        assert_eq!(out.logits.dim(), (2, 2));
        assert_eq!(out.value.len(), 2);
        assert_eq!(out.state.dim(), (2, 4));
        assert_eq!(params.size(), 3 * 4 + 4 * 4 + 4 + 4 * 2 + 2 + 4 + 1);
    }

    #[test]
    fn parameters_do_not_depend_on_the_batch() {
        let net = RecurrentPolicy::new(3, 4, 2, ActFn::tanh()).unwrap();
        let state = Array::zeros(4);

        let a = net.unroll_init(&mut StdRng::seed_from_u64(1), state.view()).unwrap();
        let b = net.unroll_init(&mut StdRng::seed_from_u64(1), state.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn backward_matches_finite_differences() {
        const H: f32 = 1e-2;
        let (net, params, obs, state) = setup();

        let (_, cache) = net.forward_cached(&params, obs.view(), state.view()).unwrap();
        let d_logits = arr2(&[[1.0, -2.0], [0.5, 0.25]]);
        let d_value = arr1(&[3.0, -1.0]);
        let grads = net
            .backward(&params, &cache, d_logits.view(), d_value.view())
            .unwrap();
        grads.check_structure(&params, "gradient").unwrap();

        for leaf in params.leaves() {
            let name = leaf.name();
            for idx in 0..leaf.value().len() {
                let mut plus = params.clone();
                plus.get_mut(name).unwrap().as_slice_mut().unwrap()[idx] += H;
                let mut minus = params.clone();
                minus.get_mut(name).unwrap().as_slice_mut().unwrap()[idx] -= H;

                let numeric = (objective(&net, &plus, &obs, &state)
                    - objective(&net, &minus, &obs, &state))
                    / (2. * H);
                let analytic = grads.get(name).unwrap().as_slice().unwrap()[idx];

                assert!(
                    (numeric - analytic).abs() < 2e-2,
                    "{name}[{idx}]: numeric {numeric} analytic {analytic}"
                );
            }
        }
    }

    #[test]
    fn mismatched_observation_is_rejected() {
        let (net, params, _, state) = setup();
        let obs = Array2::zeros((2, 5));

        assert!(matches!(
            net.forward(&params, obs.view(), state.view()),
            Err(MlErr::SizeMismatch { .. })
        ));
    }
}
