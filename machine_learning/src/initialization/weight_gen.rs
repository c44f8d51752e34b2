use ndarray::ArrayD;
use rand::Rng;

pub trait WeightGen {
    /// Should sample an array of the given shape.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `shape` - The shape of the resulting array.
    ///
    /// # Returns
    /// The sampled weights.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, shape: &[usize]) -> ArrayD<f32>;
}
