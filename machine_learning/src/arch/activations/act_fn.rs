use serde::{Deserialize, Serialize};

use super::{Sigmoid, Tanh};

/// The activation applied by the recurrent core of a network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActFn {
    Sigmoid(Sigmoid),
    Tanh(Tanh),
}

impl ActFn {
    pub fn sigmoid(amp: f32) -> Self {
        Self::Sigmoid(Sigmoid::new(amp))
    }

    pub fn tanh() -> Self {
        Self::Tanh(Tanh)
    }

    pub fn f(&self, x: f32) -> f32 {
        match self {
            Self::Sigmoid(a) => a.f(x),
            Self::Tanh(a) => a.f(x),
        }
    }

    pub fn df(&self, x: f32) -> f32 {
        match self {
            Self::Sigmoid(a) => a.df(x),
            Self::Tanh(a) => a.df(x),
        }
    }
}

impl Default for ActFn {
    fn default() -> Self {
        Self::tanh()
    }
}
