mod tree;

pub use tree::{Leaf, ParamTree};
