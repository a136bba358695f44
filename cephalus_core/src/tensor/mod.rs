//! Reverse-mode differentiation over `ndarray` values.
//!
//! [`Weight`]s are the trainable leaves, [`Var`]s the recorded values and
//! [`GradientTape`]s the windows over a shared [`Graph`] from which gradients
//! are read.

pub mod gradient;
pub mod graph;
pub mod var;
pub mod weight;

pub use gradient::{clip_by_global_norm, global_norm, has_non_finite, Gradients};
pub use graph::{GradientTape, Graph};
pub use var::Var;
pub use weight::{Weight, WeightId};
