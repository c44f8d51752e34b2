//! Adaptive rescaling of value targets.
//!
//! The running statistics track the first and second moments of the value targets with an
//! exponential moving average. The scale derived from them is clamped to `[scale_lb, scale_ub]`,
//! saturating silently instead of failing.
//!
//! In `Full` mode the value head is rescaled on every statistics change so that the unnormalized
//! value predictions stay exactly the same:
//!
//! ```text
//! w' = w * σ / σ'
//! b' = (σ * b + μ - μ') / σ'
//! ```

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result, arch::ValueHead, params::ParamTree};

/// The running statistics of the value targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopArtState {
    pub shift: f32,
    pub scale: f32,
    pub second_moment: f32,
}

impl PopArtState {
    /// Bitwise equality, under which a `NaN` statistic equals itself.
    pub fn bitwise_eq(&self, other: &PopArtState) -> bool {
        self.shift.to_bits() == other.shift.to_bits()
            && self.scale.to_bits() == other.scale.to_bits()
            && self.second_moment.to_bits() == other.second_moment.to_bits()
    }
}

/// Whether outputs are preserved when the statistics change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopArtMode {
    /// Adaptive rescaling of targets while preserving outputs precisely.
    Full,
    /// Adaptive rescaling of targets only.
    ArtOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopArtConfig {
    pub step_size: f32,
    pub scale_lb: f32,
    pub scale_ub: f32,
}

/// The first and second moments of a batch of targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub mean: f32,
    pub second_moment: f32,
}

impl Moments {
    /// Computes the moments of a batch of targets.
    ///
    /// # Returns
    /// An error if there are no targets.
    pub fn of(targets: ArrayView1<f32>) -> Result<Self> {
        if targets.is_empty() {
            return Err(MlErr::InvalidInput("can't compute the moments of no targets"));
        }

        let n = targets.len() as f32;
        let mean = targets.sum() / n;
        let second_moment = targets.iter().map(|t| t * t).sum::<f32>() / n;

        Ok(Self {
            mean,
            second_moment,
        })
    }

    /// Averages moments of batches of the same size, in iteration order.
    pub fn average<I>(moments: I) -> Result<Self>
    where
        I: IntoIterator<Item = Moments>,
    {
        let (count, sum) = moments
            .into_iter()
            .fold((0usize, (0f32, 0f32)), |(count, (m, s)), moments| {
                (count + 1, (m + moments.mean, s + moments.second_moment))
            });

        if count == 0 {
            return Err(MlErr::InvalidInput("can't average an empty set of moments"));
        }

        let count = count as f32;
        Ok(Self {
            mean: sum.0 / count,
            second_moment: sum.1 / count,
        })
    }
}

/// A value normalizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopArt {
    config: PopArtConfig,
    mode: PopArtMode,
}

impl PopArt {
    /// Creates a new `PopArt` normalizer.
    ///
    /// # Arguments
    /// * `config` - The step size and scale bounds.
    /// * `mode` - Whether the value head is rescaled on updates.
    ///
    /// # Returns
    /// An error if the step size isn't in `(0, 1]` or the bounds aren't `0 < lb <= ub`.
    pub fn new(config: PopArtConfig, mode: PopArtMode) -> Result<Self> {
        let PopArtConfig {
            step_size,
            scale_lb,
            scale_ub,
        } = config;

        if !(step_size > 0. && step_size <= 1.) {
            return Err(MlErr::InvalidHyperParameter {
                name: "step_size",
                value: step_size,
            });
        }

        if !(scale_lb > 0.) {
            return Err(MlErr::InvalidHyperParameter {
                name: "scale_lb",
                value: scale_lb,
            });
        }

        if !(scale_ub >= scale_lb) {
            return Err(MlErr::InvalidHyperParameter {
                name: "scale_ub",
                value: scale_ub,
            });
        }

        Ok(Self { config, mode })
    }

    pub fn mode(&self) -> PopArtMode {
        self.mode
    }

    pub fn config(&self) -> PopArtConfig {
        self.config
    }

    /// The statistics of an identity normalization, with the scale clamped to the bounds.
    pub fn init(&self) -> PopArtState {
        PopArtState {
            shift: 0.,
            scale: self.clamp_scale(1.),
            second_moment: 1.,
        }
    }

    /// Checks that statistics coming from elsewhere, such as a checkpoint, could have been
    /// produced by this normalizer.
    ///
    /// # Returns
    /// An error if any statistic isn't finite or the scale is outside the bounds.
    pub fn check(&self, state: &PopArtState) -> Result<()> {
        let PopArtState {
            shift,
            scale,
            second_moment,
        } = *state;

        if !shift.is_finite() {
            return Err(MlErr::InvalidStatistics {
                name: "shift",
                value: shift,
            });
        }

        if !second_moment.is_finite() {
            return Err(MlErr::InvalidStatistics {
                name: "second_moment",
                value: second_moment,
            });
        }

        if !(scale >= self.config.scale_lb && scale <= self.config.scale_ub) {
            return Err(MlErr::InvalidStatistics {
                name: "scale",
                value: scale,
            });
        }

        Ok(())
    }

    /// Moves the statistics towards the moments of a new batch of targets.
    ///
    /// # Arguments
    /// * `state` - The current statistics.
    /// * `moments` - The moments of the new targets.
    ///
    /// # Returns
    /// The new statistics.
    pub fn update(&self, state: &PopArtState, moments: &Moments) -> PopArtState {
        let beta = self.config.step_size;

        let shift = (1. - beta) * state.shift + beta * moments.mean;
        let second_moment = (1. - beta) * state.second_moment + beta * moments.second_moment;
        let variance = (second_moment - shift * shift).max(0.);

        PopArtState {
            shift,
            scale: self.clamp_scale(variance.sqrt()),
            second_moment,
        }
    }

    /// Rescales the value head so that its unnormalized outputs are the same under `new` as they
    /// were under `old`. Does nothing in `ArtOnly` mode.
    ///
    /// # Arguments
    /// * `params` - The network parameters.
    /// * `head` - The leaves of the value head.
    /// * `old` - The statistics the parameters were trained with.
    /// * `new` - The updated statistics.
    pub fn preserve_outputs(
        &self,
        params: &mut ParamTree,
        head: ValueHead,
        old: &PopArtState,
        new: &PopArtState,
    ) -> Result<()> {
        if self.mode == PopArtMode::ArtOnly {
            return Ok(());
        }

        let ratio = old.scale / new.scale;
        params.get_mut(head.weight)?.mapv_inplace(|w| w * ratio);

        let (old_shift, new_shift) = (old.shift, new.shift);
        params
            .get_mut(head.bias)?
            .mapv_inplace(|b| (old.scale * b + old_shift - new_shift) / new.scale);

        Ok(())
    }

    /// Maps unnormalized values into the normalized space.
    pub fn normalize(state: &PopArtState, values: ArrayView1<f32>) -> Array1<f32> {
        values.mapv(|v| (v - state.shift) / state.scale)
    }

    /// Maps normalized values back into the unnormalized space.
    pub fn denormalize(state: &PopArtState, values: ArrayView1<f32>) -> Array1<f32> {
        values.mapv(|v| v * state.scale + state.shift)
    }

    fn clamp_scale(&self, scale: f32) -> f32 {
        scale.clamp(self.config.scale_lb, self.config.scale_ub)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    fn popart(mode: PopArtMode, lb: f32, ub: f32) -> PopArt {
        let config = PopArtConfig {
            step_size: 0.5,
            scale_lb: lb,
            scale_ub: ub,
        };

        PopArt::new(config, mode).unwrap()
    }

    #[test]
    fn update_follows_the_moving_average() {
        let popart = popart(PopArtMode::ArtOnly, 1e-4, 1e4);
        let moments = Moments::of(arr1(&[2., 4.]).view()).unwrap();
        assert_eq!(moments.mean, 3.);
        assert_eq!(moments.second_moment, 10.);

        let state = popart.update(&popart.init(), &moments);
        assert_eq!(state.shift, 1.5);
        assert_eq!(state.second_moment, 5.5);
        assert!((state.scale - (5.5f32 - 2.25).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn scale_saturates_at_the_bounds() {
        let popart = popart(PopArtMode::ArtOnly, 0.5, 2.);
        let mut state = popart.init();

        for _ in 0..20 {
            let huge = Moments::of(arr1(&[-1000., 1000.]).view()).unwrap();
            state = popart.update(&state, &huge);
            assert!((0.5..=2.).contains(&state.scale));
        }
        assert_eq!(state.scale, 2.);

        for _ in 0..40 {
            let flat = Moments::of(arr1(&[7., 7.]).view()).unwrap();
            state = popart.update(&state, &flat);
            assert!((0.5..=2.).contains(&state.scale));
        }
        assert_eq!(state.scale, 0.5);
    }

    #[test]
    fn initial_scale_respects_the_bounds() {
        assert_eq!(popart(PopArtMode::Full, 3., 4.).init().scale, 3.);
    }

    #[test]
    fn full_mode_preserves_outputs() {
        let popart = popart(PopArtMode::Full, 1e-4, 1e4);
        let head = ValueHead {
            weight: "value/w",
            bias: "value/b",
        };

        let mut params = ParamTree::new()
            .with_leaf("value/w", arr2(&[[0.5], [-1.0]]).into_dyn())
            .unwrap()
            .with_leaf("value/b", arr1(&[0.25]).into_dyn())
            .unwrap();

        let features = arr2(&[[1.0, 2.0], [-0.5, 0.3]]);
        let unnormalized = |params: &ParamTree, state: &PopArtState| {
            let w = params.matrix("value/w").unwrap();
            let b = params.vector("value/b").unwrap()[0];
            let normalized = features.dot(&w).column(0).mapv(|v| v + b);
            PopArt::denormalize(state, normalized.view())
        };

        let old = PopArtState {
            shift: 1.,
            scale: 2.,
            second_moment: 5.,
        };
        let new = popart.update(&old, &Moments::of(arr1(&[10., 30.]).view()).unwrap());
        let before = unnormalized(&params, &old);

        popart.preserve_outputs(&mut params, head, &old, &new).unwrap();
        let after = unnormalized(&params, &new);

        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn art_only_leaves_parameters_alone() {
        let popart = popart(PopArtMode::ArtOnly, 1e-4, 1e4);
        let head = ValueHead {
            weight: "value/w",
            bias: "value/b",
        };
        let mut params = ParamTree::new()
            .with_leaf("value/w", arr2(&[[0.5]]).into_dyn())
            .unwrap()
            .with_leaf("value/b", arr1(&[0.25]).into_dyn())
            .unwrap();
        let original = params.clone();

        let old = popart.init();
        let new = popart.update(&old, &Moments::of(arr1(&[10.]).view()).unwrap());
        popart.preserve_outputs(&mut params, head, &old, &new).unwrap();
        assert_eq!(params, original);
    }

    #[test]
    fn normalize_inverts_denormalize() {
        let state = PopArtState {
            shift: -2.,
            scale: 4.,
            second_moment: 20.,
        };
        let values = arr1(&[1., -3., 0.5]);

        let normalized = PopArt::normalize(&state, values.view());
        assert_eq!(PopArt::denormalize(&state, normalized.view()), values);
    }

    #[test]
    fn moments_average() {
        let avg = Moments::average([
            Moments {
                mean: 1.,
                second_moment: 2.,
            },
            Moments {
                mean: 3.,
                second_moment: 6.,
            },
        ])
        .unwrap();

        assert_eq!(avg.mean, 2.);
        assert_eq!(avg.second_moment, 4.);
        assert!(Moments::average([]).is_err());
    }

    #[test]
    fn foreign_statistics_are_checked() {
        let popart = popart(PopArtMode::Full, 0.5, 2.);
        let state = |shift, scale, second_moment| PopArtState {
            shift,
            scale,
            second_moment,
        };

        assert!(popart.check(&popart.init()).is_ok());
        assert!(popart.check(&state(0., 2., 1.)).is_ok());
        assert!(matches!(
            popart.check(&state(0., 3., 1.)),
            Err(MlErr::InvalidStatistics { name: "scale", .. })
        ));
        assert!(popart.check(&state(0., 0.25, 1.)).is_err());
        assert!(popart.check(&state(0., f32::NAN, 1.)).is_err());
        assert!(popart.check(&state(f32::INFINITY, 1., 1.)).is_err());
        assert!(popart.check(&state(0., 1., f32::NAN)).is_err());
    }

    #[test]
    fn nan_statistics_are_bitwise_equal() {
        let nan = PopArtState {
            shift: f32::NAN,
            scale: 1.,
            second_moment: 1.,
        };

        assert_ne!(nan, nan);
        assert!(nan.bitwise_eq(&nan));
        assert!(!nan.bitwise_eq(&PopArtState { shift: 0., ..nan }));
    }

    #[test]
    fn invalid_configs() {
        let config = |step_size, scale_lb, scale_ub| PopArtConfig {
            step_size,
            scale_lb,
            scale_ub,
        };

        assert!(PopArt::new(config(0., 1., 2.), PopArtMode::Full).is_err());
        assert!(PopArt::new(config(0.1, 0., 2.), PopArtMode::Full).is_err());
        assert!(PopArt::new(config(0.1, 3., 2.), PopArtMode::Full).is_err());
    }
}
