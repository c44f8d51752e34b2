use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal, NormalError, Uniform, uniform::Error as UniformError};

use super::WeightGen;
use crate::{MlErr, Result};

impl From<NormalError> for MlErr {
    fn from(value: NormalError) -> Self {
        Self::InvalidDistribution(value.to_string())
    }
}

impl From<UniformError> for MlErr {
    fn from(value: UniformError) -> Self {
        Self::InvalidDistribution(value.to_string())
    }
}

/// A weight generator that follows a certain probabilistic distribution.
#[derive(Debug, Clone)]
pub struct RandWeightGen<D: Distribution<f32>> {
    distribution: D,
}

impl<D: Distribution<f32>> RandWeightGen<D> {
    /// Creates a new `RandWeightGen` weight generator.
    ///
    /// # Arguments
    /// * `distribution` - The distribution to sample the random numbers from.
    pub fn new(distribution: D) -> Self {
        Self { distribution }
    }
}

impl RandWeightGen<Uniform<f32>> {
    /// Creates a new `RandWeightGen` weight generator that always yields the same value.
    ///
    /// # Arguments
    /// * `value` - The value to always generate.
    pub fn constant(value: f32) -> Result<Self> {
        Self::uniform_inclusive(value, value)
    }

    /// Creates a new `RandWeightGen` weight generator with a uniform distribution.
    ///
    /// # Arguments
    /// * `low` - The incluive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(Uniform::new(low, high)?))
    }

    /// Creates a new `RandWeightGen` weight generator with an inclusive uniform distribution.
    ///
    /// # Arguments
    /// * `low` - The inclusive lower limit.
    /// * `high` - The inclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low > high).
    pub fn uniform_inclusive(low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(Uniform::new_inclusive(low, high)?))
    }

    /// Creates a new `RandWeightGen` weight generator using LeCun uniform initialization.
    ///
    /// # Arguments
    /// * `fan_in` - The number of input units in the weight tensor.
    ///
    /// # Returns
    /// An error if the caluculated range is invalid, e.g. `fan_in` is zero.
    pub fn lecun_uniform(fan_in: usize) -> Result<Self> {
        let range = (3. / fan_in as f32).sqrt();
        Self::uniform(-range, range)
    }
}

impl RandWeightGen<Normal<f32>> {
    /// Creates a new `RandWeightGen` weight generator with a normal distribution.
    ///
    /// # Arguments
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(mean: f32, std_dev: f32) -> Result<Self> {
        Ok(Self::new(Normal::new(mean, std_dev)?))
    }
}

impl<D: Distribution<f32>> WeightGen for RandWeightGen<D> {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, shape: &[usize]) -> ArrayD<f32> {
        ArrayD::from_shape_simple_fn(IxDyn(shape), || self.distribution.sample(rng))
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn constant() {
        let mut rng = StdRng::seed_from_u64(42);
        let weight_gen = RandWeightGen::constant(0.5).unwrap();

        let sample = weight_gen.sample(&mut rng, &[2, 3]);
        assert_eq!(sample.shape(), [2, 3]);
        assert!(sample.iter().all(|&w| w == 0.5));
    }

    #[test]
    fn lecun_uniform_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let weight_gen = RandWeightGen::lecun_uniform(12).unwrap();
        let range = (3f32 / 12.).sqrt();

        let sample = weight_gen.sample(&mut rng, &[12, 4]);
        assert!(sample.iter().all(|w| (-range..=range).contains(w)));
    }

    #[test]
    fn same_seed_same_weights() {
        let weight_gen = RandWeightGen::normal(0., 1.).unwrap();

        let a = weight_gen.sample(&mut StdRng::seed_from_u64(7), &[5]);
        let b = weight_gen.sample(&mut StdRng::seed_from_u64(7), &[5]);
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_range() {
        assert!(RandWeightGen::uniform(1., -1.).is_err());
        assert!(RandWeightGen::normal(0., f32::NAN).is_err());
    }
}
