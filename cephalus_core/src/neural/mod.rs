//! Neural network components: dense layers, template-cloned networks,
//! losses and optimizers.

pub mod layer;
pub mod loss;
pub mod network;
pub mod optimizer;

pub use layer::{Activation, Dense};
pub use loss::{mse_loss, sum_squared_error};
pub use network::{ModelTemplate, Network};
pub use optimizer::{AdamOptimizer, Optimizer, OptimizerConfig, SGDOptimizer};
