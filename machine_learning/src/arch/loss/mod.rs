mod impala;
mod loss_fn;
mod trajectory;
mod vtrace;

pub use impala::ImpalaLoss;
pub use loss_fn::{LossFn, LossOutput, Metrics};
pub use trajectory::Trajectory;
pub use vtrace::{VTraceReturns, vtrace};
