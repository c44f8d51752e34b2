use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};

use super::{LossFn, LossOutput, Metrics, Trajectory, vtrace};
use crate::{
    MlErr, Result,
    arch::{NetOutput, Network},
    normalization::{PopArt, PopArtState},
    params::ParamTree,
};

/// The IMPALA actor-critic loss with V-trace corrected targets.
///
/// The last step of every unroll is only used for bootstrapping. When value statistics are given
/// the network's value head is taken as normalized: targets are computed on denormalized values
/// and the critic is trained on normalized targets.
///
/// The gradient is only as deep as `Network::backward`: every step's recurrent state is taken as a
/// constant, so with a recurrent core it is a truncated approximation of the gradient through the
/// whole unroll. V-trace targets are constants as well.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpalaLoss {
    discount: f32,
    entropy_cost: f32,
    baseline_cost: f32,
    max_abs_reward: f32,
}

/// The V-trace targets of a whole trajectory, `[time - 1, batch]`.
struct Returns {
    values: Array2<f32>,
    vs: Array2<f32>,
    advantages: Array2<f32>,
    rhos: Array2<f32>,
}

impl ImpalaLoss {
    /// Creates a new `ImpalaLoss`.
    ///
    /// # Arguments
    /// * `discount` - Multiplies the discounts of the trajectories.
    /// * `entropy_cost` - The weight of the entropy regularizer.
    /// * `baseline_cost` - The weight of the critic loss.
    /// * `max_abs_reward` - Rewards are clipped to `[-max_abs_reward, max_abs_reward]`.
    pub fn new(discount: f32, entropy_cost: f32, baseline_cost: f32, max_abs_reward: f32) -> Self {
        Self {
            discount,
            entropy_cost,
            baseline_cost,
            max_abs_reward,
        }
    }

    fn unroll<N: Network>(
        network: &N,
        params: &ParamTree,
        trajectory: &Trajectory,
    ) -> Result<(Vec<NetOutput>, Vec<N::Cache>)> {
        let mut state = trajectory.core_state.clone();
        let mut outputs = Vec::with_capacity(trajectory.observation.len_of(Axis(0)));
        let mut caches = Vec::with_capacity(outputs.capacity());

        for observation in trajectory.observation.outer_iter() {
            let (output, cache) = network.forward_cached(params, observation, state.view())?;
            state = output.state.clone();
            outputs.push(output);
            caches.push(cache);
        }

        Ok((outputs, caches))
    }

    fn returns(
        &self,
        num_actions: usize,
        outputs: &[NetOutput],
        popart: Option<&PopArtState>,
        trajectory: &Trajectory,
    ) -> Result<Returns> {
        let (t, b) = trajectory.dims()?;

        let behaviour_actions = trajectory.behaviour_logits.len_of(Axis(2));
        if behaviour_actions != num_actions {
            return Err(MlErr::SizeMismatch {
                what: "behaviour logits",
                got: behaviour_actions,
                expected: num_actions,
            });
        }

        if let Some(&action) = trajectory.action.iter().find(|&&a| a >= num_actions) {
            return Err(MlErr::SizeMismatch {
                what: "action index",
                got: action,
                expected: num_actions,
            });
        }

        let mut values = Array2::zeros((t, b));
        for (mut row, output) in values.outer_iter_mut().zip(outputs) {
            match popart {
                Some(state) => row.assign(&PopArt::denormalize(state, output.value.view())),
                None => row.assign(&output.value),
            }
        }

        let log_rhos = Array2::from_shape_fn((t - 1, b), |(i, j)| {
            let action = trajectory.action[[i, j]];
            let target = log_softmax(outputs[i].logits.row(j));
            let behaviour = log_softmax(trajectory.behaviour_logits.slice(s![i, j, ..]));
            target[action] - behaviour[action]
        });

        let max_abs_reward = self.max_abs_reward;
        let rewards = trajectory
            .reward
            .slice(s![..t - 1, ..])
            .mapv(|r| r.clamp(-max_abs_reward, max_abs_reward));
        let discounts = trajectory.discount.slice(s![..t - 1, ..]).mapv(|d| d * self.discount);

        let mut vs = Array2::zeros((t - 1, b));
        let mut advantages = Array2::zeros((t - 1, b));
        let mut rhos = Array2::zeros((t - 1, b));

        for j in 0..b {
            let out = vtrace(
                values.slice(s![..t - 1, j]),
                values[[t - 1, j]],
                rewards.column(j),
                discounts.column(j),
                log_rhos.column(j),
                1.,
                1.,
            )?;

            vs.column_mut(j).assign(&out.vs);
            advantages.column_mut(j).assign(&out.pg_advantages);
            rhos.column_mut(j).assign(&out.rhos);
        }

        values.slice_collapse(s![..t - 1, ..]);
        Ok(Returns {
            values,
            vs,
            advantages,
            rhos,
        })
    }
}

impl<N: Network> LossFn<N> for ImpalaLoss {
    fn value_targets(
        &self,
        network: &N,
        params: &ParamTree,
        popart: Option<&PopArtState>,
        trajectory: &Trajectory,
    ) -> Result<Array1<f32>> {
        let (outputs, _) = Self::unroll(network, params, trajectory)?;
        let returns = self.returns(network.num_actions(), &outputs, popart, trajectory)?;

        Ok(returns.vs.iter().copied().collect())
    }

    fn loss_and_grad(
        &self,
        network: &N,
        params: &ParamTree,
        popart: Option<&PopArtState>,
        trajectory: &Trajectory,
    ) -> Result<LossOutput> {
        let (outputs, caches) = Self::unroll(network, params, trajectory)?;
        let returns = self.returns(network.num_actions(), &outputs, popart, trajectory)?;

        let (steps, batch) = returns.vs.dim();
        let n = (steps * batch) as f32;
        let (shift, scale) = popart.map_or((0., 1.), |state| (state.shift, state.scale));

        let mut policy_loss = 0.;
        let mut baseline_loss = 0.;
        let mut entropy = 0.;
        let mut grads = params.zeros_like();

        for (t, (output, cache)) in outputs.iter().zip(&caches).take(steps).enumerate() {
            let mut d_logits = Array2::zeros(output.logits.dim());
            let mut d_value = Array1::zeros(batch);

            for j in 0..batch {
                let action = trajectory.action[[t, j]];
                let log_probs = log_softmax(output.logits.row(j));
                let probs = log_probs.mapv(f32::exp);
                let h = -probs.iter().zip(&log_probs).map(|(p, l)| p * l).sum::<f32>();

                let advantage = returns.advantages[[t, j]] / scale;
                let target = (returns.vs[[t, j]] - shift) / scale;
                let error = target - output.value[j];

                policy_loss -= log_probs[action] * advantage;
                baseline_loss += 0.5 * error * error;
                entropy += h;

                let mut row = d_logits.row_mut(j);
                for (k, d) in row.iter_mut().enumerate() {
                    let onehot = if k == action { 1. } else { 0. };
                    *d = -advantage * (onehot - probs[k])
                        + self.entropy_cost * probs[k] * (log_probs[k] + h);
                    *d /= n;
                }
                d_value[j] = -self.baseline_cost * error / n;
            }

            let step_grads = network.backward(params, cache, d_logits.view(), d_value.view())?;
            grads.add_assign(&step_grads)?;
        }

        let policy_loss = policy_loss / n;
        let baseline_loss = baseline_loss / n;
        let entropy = entropy / n;
        let entropy_loss = -entropy;
        let loss =
            policy_loss + self.baseline_cost * baseline_loss + self.entropy_cost * entropy_loss;

        let metrics = Metrics::from([
            ("total_loss".to_string(), loss),
            ("policy_loss".to_string(), policy_loss),
            ("baseline_loss".to_string(), baseline_loss),
            ("entropy_loss".to_string(), entropy_loss),
            ("entropy".to_string(), entropy),
            (
                "mean_importance_weight".to_string(),
                returns.rhos.mean().unwrap_or_default(),
            ),
            (
                "mean_value".to_string(),
                returns.values.mean().unwrap_or_default(),
            ),
        ]);

        Ok(LossOutput {
            loss,
            grads,
            metrics,
        })
    }
}

fn log_softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &z| m.max(z));
    let log_sum = logits.iter().map(|z| (z - max).exp()).sum::<f32>().ln();

    logits.mapv(|z| z - max - log_sum)
}
