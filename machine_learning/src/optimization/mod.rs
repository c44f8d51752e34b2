mod chain;
mod clip;
mod gradient_descent;
mod optimizer;
mod rmsprop;

pub use chain::Chain;
pub use clip::ClipByGlobalNorm;
pub use gradient_descent::GradientDescent;
pub use optimizer::{OptState, Optimizer, apply_updates};
pub use rmsprop::RmsProp;
