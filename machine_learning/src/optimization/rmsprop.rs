use super::{OptState, Optimizer, optimizer::state_mismatch};
use crate::{MlErr, Result, params::ParamTree};

/// RMSProp optimization algorithm with an optional momentum trace.
///
/// ```text
/// nu = decay * nu + (1 - decay) * g²
/// u = -lr * g / sqrt(nu + eps)
/// trace = u + momentum * trace
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RmsProp {
    learning_rate: f32,
    decay: f32,
    eps: f32,
    initial_scale: f32,
    momentum: Option<f32>,
}

impl RmsProp {
    /// Creates a new `RmsProp` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `decay` - The decay rate of the squared gradient moving average.
    /// * `eps` - Added to the moving average before taking its square root.
    /// * `initial_scale` - The value the moving average starts from.
    /// * `momentum` - The decay of the momentum trace, `None` disables the trace entirely.
    ///
    /// # Returns
    /// An error if any of the hyper-parameters is out of range.
    pub fn new(
        learning_rate: f32,
        decay: f32,
        eps: f32,
        initial_scale: f32,
        momentum: Option<f32>,
    ) -> Result<Self> {
        let invalid = |name, value| Err(MlErr::InvalidHyperParameter { name, value });

        if !(learning_rate > 0.) {
            return invalid("learning_rate", learning_rate);
        }
        if !(0. ..=1.).contains(&decay) {
            return invalid("decay", decay);
        }
        if !(eps >= 0.) {
            return invalid("eps", eps);
        }
        if !(initial_scale >= 0.) {
            return invalid("initial_scale", initial_scale);
        }
        if let Some(momentum) = momentum
            && !(0. ..=1.).contains(&momentum)
        {
            return invalid("momentum", momentum);
        }

        Ok(Self {
            learning_rate,
            decay,
            eps,
            initial_scale,
            momentum,
        })
    }

    fn scale_by_rms(&self, grads: &mut ParamTree, nu: &mut ParamTree) -> Result<()> {
        let Self {
            learning_rate: lr,
            decay,
            eps,
            ..
        } = *self;

        nu.zip_mut_with(grads, |n, g| *n = decay * *n + (1. - decay) * g * g)?;
        grads.zip_mut_with(nu, |g, n| *g *= -lr / (n + eps).sqrt())
    }
}

impl Optimizer for RmsProp {
    fn init(&self, params: &ParamTree) -> OptState {
        let nu = params.full_like(self.initial_scale);

        match self.momentum {
            Some(_) => OptState::RmsMomentum {
                nu,
                trace: params.zeros_like(),
            },
            None => OptState::Rms { nu },
        }
    }

    fn update(&self, mut grads: ParamTree, state: &mut OptState) -> Result<ParamTree> {
        match (self.momentum, state) {
            (None, OptState::Rms { nu }) => {
                self.scale_by_rms(&mut grads, nu)?;
                Ok(grads)
            }
            (Some(momentum), OptState::RmsMomentum { nu, trace }) => {
                grads.check_structure(trace, "optimizer trace")?;
                self.scale_by_rms(&mut grads, nu)?;

                trace.zip_mut_with(&grads, |t, u| *t = u + momentum * *t)?;
                Ok(trace.clone())
            }
            (None, _) => Err(state_mismatch("rms")),
            (Some(_), _) => Err(state_mismatch("rms with momentum")),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    fn tree(values: &[f32]) -> ParamTree {
        ParamTree::new().with_leaf("w", arr1(values).into_dyn()).unwrap()
    }

    fn run(opt: &RmsProp, steps: &[[f32; 2]]) -> Vec<ParamTree> {
        let params = tree(&[0., 0.]);
        let mut state = opt.init(&params);

        steps
            .iter()
            .map(|g| opt.update(tree(g), &mut state).unwrap())
            .collect()
    }

    #[test]
    fn first_step_matches_closed_form() {
        let opt = RmsProp::new(0.1, 0.9, 0., 0., None).unwrap();
        let updates = run(&opt, &[[2., -1.]]);

        // nu = 0.1 * g², u = -lr * g / sqrt(nu) = -lr * sign(g) / sqrt(0.1)
        let expected = -0.1 / 0.1f32.sqrt();
        let u = updates[0].get("w").unwrap();
        assert!((u[0] - expected).abs() < 1e-5);
        assert!((u[1] + expected).abs() < 1e-5);
    }

    #[test]
    fn initial_scale_seeds_the_moment() {
        let opt = RmsProp::new(1., 0.5, 0., 4., None).unwrap();
        let updates = run(&opt, &[[2., 0.]]);

        // nu = 0.5 * 4 + 0.5 * 4 = 4
        assert!((updates[0].get("w").unwrap()[0] + 1.).abs() < 1e-6);
    }

    #[test]
    fn zero_momentum_equals_no_momentum() {
        let steps = [[1., -2.], [0.5, 0.25], [-3., 1.]];
        let with = RmsProp::new(0.01, 0.99, 1e-5, 0., Some(0.)).unwrap();
        let without = RmsProp::new(0.01, 0.99, 1e-5, 0., None).unwrap();

        assert_eq!(run(&with, &steps), run(&without, &steps));
    }

    #[test]
    fn momentum_accumulates_updates() {
        let steps = [[1., 1.], [1., 1.]];
        let plain = run(&RmsProp::new(0.1, 0., 0., 0., None).unwrap(), &steps);
        let heavy = run(&RmsProp::new(0.1, 0., 0., 0., Some(0.5)).unwrap(), &steps);

        let plain = plain[1].get("w").unwrap()[0];
        let heavy = heavy[1].get("w").unwrap()[0];
        assert!((heavy - 1.5 * plain).abs() < 1e-6);
    }

    #[test]
    fn state_must_match_the_momentum_setting() {
        let with = RmsProp::new(0.1, 0.9, 0., 0., Some(0.9)).unwrap();
        let without = RmsProp::new(0.1, 0.9, 0., 0., None).unwrap();
        let mut state = without.init(&tree(&[0., 0.]));

        assert!(matches!(
            with.update(tree(&[1., 1.]), &mut state),
            Err(MlErr::OptimizerStateMismatch { .. })
        ));
    }

    #[test]
    fn invalid_hyper_parameters() {
        assert!(RmsProp::new(0., 0.9, 0., 0., None).is_err());
        assert!(RmsProp::new(0.1, 1.5, 0., 0., None).is_err());
        assert!(RmsProp::new(0.1, 0.9, -1., 0., None).is_err());
        assert!(RmsProp::new(0.1, 0.9, 0., 0., Some(-0.1)).is_err());
    }
}
