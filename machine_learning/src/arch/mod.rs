pub mod activations;
pub mod loss;
mod network;
mod recurrent;

pub use network::{NetOutput, Network, ValueHead};
pub use recurrent::{RecurrentCache, RecurrentPolicy};
