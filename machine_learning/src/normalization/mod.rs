mod popart;

pub use popart::{Moments, PopArt, PopArtConfig, PopArtMode, PopArtState};
