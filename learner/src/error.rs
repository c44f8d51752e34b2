use std::{any::Any, error::Error, fmt, io};

use machine_learning::MlErr;
use ndarray::ShapeError;

/// The learner module's result type.
pub type Result<T> = std::result::Result<T, LearnerErr>;

/// Learner runtime failures.
///
/// Every one of them is fatal to the step that raised it, the training state is only ever replaced
/// once a step succeeds on every replica.
#[derive(Debug)]
pub enum LearnerErr {
    Ml(MlErr),
    Io(io::Error),
    Json(serde_json::Error),
    IteratorExhausted {
        step: u64,
    },
    LayoutMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    MissingExtra(&'static str),
    AgentCountMismatch {
        got: usize,
        expected: usize,
    },
    ReplicaDivergence {
        replica: usize,
    },
    ReplicaAborted,
    ReplicaPanicked {
        replica: usize,
        message: String,
    },
    InvalidConfig(String),
    InvalidPermutation {
        order: Vec<usize>,
    },
    NormalizerMismatch {
        expected: bool,
    },
}

impl fmt::Display for LearnerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearnerErr::Ml(e) => write!(f, "machine learning error: {e}"),
            LearnerErr::Io(e) => write!(f, "io error: {e}"),
            LearnerErr::Json(e) => write!(f, "json error: {e}"),
            LearnerErr::IteratorExhausted { step } => {
                write!(f, "the replay iterator was exhausted at step {step}")
            }
            LearnerErr::LayoutMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "layout mismatch in {what}: got {got:?}, expected {expected:?}"
            ),
            LearnerErr::MissingExtra(name) => write!(f, "the batch has no '{name}' extra"),
            LearnerErr::AgentCountMismatch { got, expected } => {
                write!(f, "got the state of {got} agents, expected {expected}")
            }
            LearnerErr::ReplicaDivergence { replica } => {
                write!(f, "replica {replica} diverged from replica 0")
            }
            LearnerErr::ReplicaAborted => write!(f, "another replica failed during the step"),
            LearnerErr::ReplicaPanicked { replica, message } => {
                write!(f, "replica {replica} panicked: {message}")
            }
            LearnerErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            LearnerErr::InvalidPermutation { order } => {
                write!(f, "{order:?} is not a permutation of the agents")
            }
            LearnerErr::NormalizerMismatch { expected: true } => {
                write!(f, "this training state requires a value normalizer")
            }
            LearnerErr::NormalizerMismatch { expected: false } => {
                write!(f, "this training state doesn't support a value normalizer")
            }
        }
    }
}

impl LearnerErr {
    /// Wraps the payload of a panic caught on a replica.
    pub(crate) fn panicked(replica: usize, payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(msg) => *msg,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(msg) => msg.to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        };

        Self::ReplicaPanicked { replica, message }
    }
}

impl Error for LearnerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LearnerErr::Ml(e) => Some(e),
            LearnerErr::Io(e) => Some(e),
            LearnerErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for LearnerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<ShapeError> for LearnerErr {
    fn from(value: ShapeError) -> Self {
        Self::Ml(MlErr::Shape(value))
    }
}

impl From<io::Error> for LearnerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for LearnerErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
