//! # Cephalus Core
//!
//! An online state kernel that learns a recurrent state representation one
//! step at a time, plus a TD(0) agent that can act on that state.
//!
//! Each [`StateKernel::step`] gathers inputs from the environment, attends
//! to them, predicts the next state and trains the previous frame against
//! the losses the kernel's modules report. Modules are composed by
//! capability: input, input attention, state prediction, loss, retroactive
//! loss and state gradient.
//!
//! ## Quick Start
//!
//! ```rust
//! use cephalus_core::{KernelConfig, StateKernel};
//!
//! let mut kernel: StateKernel<()> = StateKernel::new();
//! kernel.configure(KernelConfig::new(4, 2))?;
//!
//! let mut environment = ();
//! let mut frame = kernel.step(&mut environment, None)?;
//! for _ in 0..3 {
//!     let next = kernel.step(&mut environment, Some(&mut frame))?;
//!     assert!(frame.is_trained());
//!     frame = next;
//! }
//! assert!(!frame.is_trained());
//! # Ok::<(), cephalus_core::KernelError>(())
//! ```
//!
//! ## Core Modules
//!
//! - [`kernel`] - The step/train cycle and module composition
//! - [`modules`] - Module protocol and stock modules
//! - [`frame`] - Per-step state frames
//! - [`q`] - Q models, action policies and the TD agent
//! - [`tensor`] - Tape-based reverse-mode autodiff
//! - [`neural`] - Dense networks, losses and optimizers
//! - [`config`] - Kernel and agent configuration via TOML
//! - [`logging`] - JSON line-delimited logging

pub mod config;
pub mod error;
pub mod frame;
pub mod kernel;
pub mod logging;
pub mod modules;
pub mod neural;
pub mod q;
pub mod tensor;

pub use config::{AgentConfig, ConfigError, KernelConfig};
pub use error::{KernelError, KernelResult};
pub use frame::StateFrame;
pub use kernel::StateKernel;
pub use modules::{
    Capabilities, DeferredLoss, ExternalLossProvider, FutureGradientProvider,
    InputPredictionProvider, KernelValue, LossQueue, ModuleContext, ModuleId,
    NullStatePredictionProvider, ObservationInputProvider, ObservationSource,
    StandardInputAttentionProvider, StandardStatePredictionProvider, StateKernelModule,
    UntrainedStatePredictionProvider,
};
pub use neural::{ModelTemplate, Optimizer, OptimizerConfig};
pub use q::{
    ActionDecision, ActionPolicy, Discount, EpsilonGreedyPolicy, NetworkQModel,
    ProbabilisticModel, TDAgent,
};
pub use tensor::{GradientTape, Graph, Var, Weight};
