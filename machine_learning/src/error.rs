use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Shape(ShapeError),
    MissingLeaf(String),
    DuplicateLeaf(String),
    StructureMismatch {
        what: &'static str,
    },
    OptimizerStateMismatch {
        expected: &'static str,
    },
    InvalidDistribution(String),
    InvalidHyperParameter {
        name: &'static str,
        value: f32,
    },
    InvalidInput(&'static str),
    InvalidStatistics {
        name: &'static str,
        value: f32,
    },
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            MlErr::Shape(e) => write!(f, "Invalid array shape: {e}"),
            MlErr::MissingLeaf(name) => write!(f, "The parameter tree has no leaf named '{name}'"),
            MlErr::DuplicateLeaf(name) => {
                write!(f, "The parameter tree already has a leaf named '{name}'")
            }
            MlErr::StructureMismatch { what } => {
                write!(f, "The {what} tree doesn't match the parameters' structure")
            }
            MlErr::OptimizerStateMismatch { expected } => write!(
                f,
                "The optimizer state doesn't belong to this optimizer, expected a {expected} state"
            ),
            MlErr::InvalidDistribution(msg) => write!(f, "Invalid weight distribution: {msg}"),
            MlErr::InvalidHyperParameter { name, value } => {
                write!(f, "Invalid value {value} for hyper-parameter '{name}'")
            }
            MlErr::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            MlErr::InvalidStatistics { name, value } => {
                write!(f, "Invalid value {value} for the normalization statistic '{name}'")
            }
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}
