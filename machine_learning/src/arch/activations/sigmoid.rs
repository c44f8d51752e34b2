use serde::{Deserialize, Serialize};

/// A logistic function scaled by `amp`, `amp / (1 + e^-z)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sigmoid {
    amp: f32,
}

impl Sigmoid {
    pub fn new(amp: f32) -> Self {
        Self { amp }
    }

    /// Never exponentiates a positive number, so it doesn't overflow for large `|z|`.
    fn logistic(z: f32) -> f32 {
        if z >= 0. {
            1. / (1. + (-z).exp())
        } else {
            let e = z.exp();
            e / (1. + e)
        }
    }

    pub fn f(&self, z: f32) -> f32 {
        self.amp * Self::logistic(z)
    }

    pub fn df(&self, z: f32) -> f32 {
        let s = Self::logistic(z);
        self.amp * s * (1. - s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturates_without_overflowing() {
        let sigmoid = Sigmoid::new(2.);

        assert_eq!(sigmoid.f(0.), 1.);
        assert_eq!(sigmoid.f(-200.), 0.);
        assert_eq!(sigmoid.f(200.), 2.);
        assert_eq!(sigmoid.df(-200.), 0.);
        assert!(sigmoid.df(200.).is_finite());
    }
}
