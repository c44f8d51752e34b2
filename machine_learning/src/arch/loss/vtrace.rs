//! V-trace off-policy corrected value targets.
//!
//! ```text
//! ρ_t = min(ρ̄, π(a_t|s_t) / μ(a_t|s_t))
//! c_t = min(c̄, π(a_t|s_t) / μ(a_t|s_t))
//! δ_t = ρ_t (r_t + γ_t V(s_{t+1}) - V(s_t))
//! v_s = V(s) + δ_s + γ_s c_s (v_{s+1} - V(s+1))
//! ```
//!
//! Espeholt et al., "IMPALA: Scalable Distributed Deep-RL with Importance Weighted Actor-Learner
//! Architectures" (2018).

use ndarray::{Array1, ArrayView1};

use crate::{MlErr, Result};

/// The V-trace targets of a single unroll.
#[derive(Debug, Clone, PartialEq)]
pub struct VTraceReturns {
    /// The value targets `v_s`.
    pub vs: Array1<f32>,
    /// The policy gradient advantages `ρ_t (r_t + γ_t v_{t+1} - V(s_t))`.
    pub pg_advantages: Array1<f32>,
    /// The clipped importance weights `ρ_t`.
    pub rhos: Array1<f32>,
}

/// Computes the V-trace targets of a single unroll.
///
/// # Arguments
/// * `values` - The value estimates `V(s_t)`.
/// * `bootstrap_value` - The value estimate of the state following the unroll.
/// * `rewards` - The rewards `r_t`.
/// * `discounts` - The discounts `γ_t`, zero at episode ends.
/// * `log_rhos` - The log importance ratios `log π(a_t|s_t) - log μ(a_t|s_t)`.
/// * `rho_bar` - The clipping threshold of the importance weights.
/// * `c_bar` - The clipping threshold of the trace coefficients.
///
/// # Returns
/// The targets or an error if the inputs have different lengths.
pub fn vtrace(
    values: ArrayView1<f32>,
    bootstrap_value: f32,
    rewards: ArrayView1<f32>,
    discounts: ArrayView1<f32>,
    log_rhos: ArrayView1<f32>,
    rho_bar: f32,
    c_bar: f32,
) -> Result<VTraceReturns> {
    let n = values.len();

    for (what, got) in [
        ("vtrace rewards", rewards.len()),
        ("vtrace discounts", discounts.len()),
        ("vtrace log rhos", log_rhos.len()),
    ] {
        if got != n {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected: n,
            });
        }
    }

    let ratios = log_rhos.mapv(f32::exp);
    let rhos = ratios.mapv(|r| r.min(rho_bar));
    let cs = ratios.mapv(|r| r.min(c_bar));

    let mut vs = Array1::zeros(n);
    let mut acc = 0.;

    for t in (0..n).rev() {
        let next_value = if t + 1 < n { values[t + 1] } else { bootstrap_value };
        let delta = rhos[t] * (rewards[t] + discounts[t] * next_value - values[t]);

        acc = delta + discounts[t] * cs[t] * acc;
        vs[t] = values[t] + acc;
    }

    let pg_advantages = Array1::from_shape_fn(n, |t| {
        let next_vs = if t + 1 < n { vs[t + 1] } else { bootstrap_value };
        rhos[t] * (rewards[t] + discounts[t] * next_vs - values[t])
    });

    Ok(VTraceReturns {
        vs,
        pg_advantages,
        rhos,
    })
}
