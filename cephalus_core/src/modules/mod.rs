//! The kernel module protocol and the stock modules.
//!
//! A module declares the roles it fills as [`Capabilities`]; the kernel only
//! ever calls the hooks belonging to declared roles. Hooks of undeclared
//! roles keep their default bodies, which report a missing capability.

use std::any::Any;
use std::fmt;
use std::ops::BitOr;

use ndarray::Array1;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::neural::Optimizer;
use crate::tensor::{GradientTape, Graph, Var, Weight};

pub mod external_loss;
pub mod future_gradient;
pub mod input_attention;
pub mod input_prediction;
pub mod observation;
pub mod state_prediction;

pub use external_loss::{DeferredLoss, ExternalLossProvider, LossQueue};
pub use future_gradient::FutureGradientProvider;
pub use input_attention::{AttentionWeights, StandardInputAttentionProvider};
pub use input_prediction::InputPredictionProvider;
pub use observation::{ObservationInputProvider, ObservationSource};
pub use state_prediction::{
    NullStatePredictionProvider, StandardStatePredictionProvider,
    UntrainedStatePredictionProvider,
};

/// Identifier the kernel assigns to a module when it is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    pub fn from_raw(raw: u64) -> Self {
        ModuleId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Set of roles a module fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// Contributes input vectors each step
    pub const INPUT: Capabilities = Capabilities(1 << 0);
    /// Combines the gathered inputs into one attended input
    pub const INPUT_ATTENTION: Capabilities = Capabilities(1 << 1);
    /// Predicts the next state
    pub const STATE_PREDICTION: Capabilities = Capabilities(1 << 2);
    /// Contributes to the combined training loss
    pub const LOSS: Capabilities = Capabilities(1 << 3);
    /// Runs a secondary training pass while the trained frame's tape is open
    pub const RETROACTIVE_LOSS: Capabilities = Capabilities(1 << 4);
    /// Reports a gradient for the current state
    pub const GRADIENT: Capabilities = Capabilities(1 << 5);

    const NAMES: [(Capabilities, &'static str); 6] = [
        (Capabilities::INPUT, "input"),
        (Capabilities::INPUT_ATTENTION, "input attention"),
        (Capabilities::STATE_PREDICTION, "state prediction"),
        (Capabilities::LOSS, "loss"),
        (Capabilities::RETROACTIVE_LOSS, "retroactive loss"),
        (Capabilities::GRADIENT, "gradient"),
    ];

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Display name of a single role.
    pub fn role_name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, name)| *name)
            .unwrap_or("composite")
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

/// Either a trainable kernel vector or a fixed one.
#[derive(Debug, Clone)]
pub enum KernelValue {
    Trainable(Weight),
    Fixed(Array1<f32>),
}

impl KernelValue {
    pub fn width(&self) -> usize {
        match self {
            KernelValue::Trainable(weight) => weight.shape().iter().product(),
            KernelValue::Fixed(values) => values.len(),
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, KernelValue::Trainable(_))
    }

    pub fn weight(&self) -> Option<&Weight> {
        match self {
            KernelValue::Trainable(weight) => Some(weight),
            KernelValue::Fixed(_) => None,
        }
    }

    /// Reads the value onto `graph`.
    pub fn read(&self, graph: &Graph) -> Var {
        match self {
            KernelValue::Trainable(weight) => weight.read(graph),
            KernelValue::Fixed(values) => graph.vector(values.clone()),
        }
    }
}

/// What a module sees of the kernel while being configured.
pub struct ModuleContext<'a> {
    pub id: ModuleId,
    pub config: &'a KernelConfig,
    pub graph: &'a Graph,
    pub initial_state: &'a KernelValue,
}

impl ModuleContext<'_> {
    pub fn state_width(&self) -> usize {
        self.config.state_width
    }

    pub fn input_width(&self) -> usize {
        self.config.input_width
    }

    /// Seed for a network owned by this module, distinct per module.
    pub fn module_seed(&self, salt: u64) -> u64 {
        self.config
            .seed
            .wrapping_add(self.id.raw().wrapping_mul(1_000_003))
            .wrapping_add(salt)
    }
}

/// A pluggable unit of a [`StateKernel`](crate::StateKernel).
///
/// `E` is the environment type the kernel runs in.
pub trait StateKernelModule<E> {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Called once, when the kernel is configured or, for modules added
    /// later, when the module is added.
    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()>;

    fn trainable_weights(&self) -> Vec<Weight> {
        Vec::new()
    }

    /// Relative weight of this module's loss in the combined loss. Modules
    /// with a non-positive scale are left out.
    fn loss_scale(&self) -> f32 {
        1.0
    }

    /// Seeds per-frame data for a freshly created frame.
    fn new_frame_data(
        &self,
        _frame: &StateFrame,
        _previous: Option<&StateFrame>,
    ) -> Option<Box<dyn Any>> {
        None
    }

    /// Loss for the state predicted in `previous`, given its successor.
    fn get_loss(&mut self, _previous: &StateFrame, _current: &StateFrame) -> KernelResult<Option<Var>> {
        Ok(None)
    }

    fn get_input(&mut self, _environment: &mut E, _frame: &StateFrame) -> KernelResult<Option<Var>> {
        Err(missing_capability(self.name(), Capabilities::INPUT))
    }

    /// Combines `frame.input_tensors()` into the attended input.
    fn attend_inputs(&mut self, _frame: &mut StateFrame) -> KernelResult<Var> {
        Err(missing_capability(self.name(), Capabilities::INPUT_ATTENTION))
    }

    /// Predicts the current state from the previous state and attended input.
    fn predict_state(&mut self, _frame: &StateFrame) -> KernelResult<Var> {
        Err(missing_capability(self.name(), Capabilities::STATE_PREDICTION))
    }

    /// Extra training after the main update; `tape` is the trained frame's tape.
    fn train_retroactive_loss(
        &mut self,
        _previous: &StateFrame,
        _current: &StateFrame,
        _tape: &GradientTape,
        _optimizer: &mut dyn Optimizer,
    ) -> KernelResult<()> {
        Err(missing_capability(self.name(), Capabilities::RETROACTIVE_LOSS))
    }

    fn get_current_state_gradient(
        &mut self,
        _environment: &mut E,
        _frame: &StateFrame,
    ) -> KernelResult<Option<Array1<f32>>> {
        Err(missing_capability(self.name(), Capabilities::GRADIENT))
    }
}

pub(crate) fn missing_capability(module: &str, capability: Capabilities) -> KernelError {
    KernelError::MissingCapability {
        module: module.to_string(),
        capability: capability.role_name(),
    }
}

/// Id assigned at configuration, or an error if the module was never configured.
pub(crate) fn configured_id(id: Option<ModuleId>, module: &str) -> KernelResult<ModuleId> {
    id.ok_or_else(|| KernelError::InvalidFrameState {
        details: format!("module '{}' used before it was configured", module),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_sets() {
        let caps = Capabilities::LOSS | Capabilities::RETROACTIVE_LOSS;
        assert!(caps.contains(Capabilities::LOSS));
        assert!(!caps.contains(Capabilities::GRADIENT));
        assert_eq!(caps.names(), vec!["loss", "retroactive loss"]);
        assert!(Capabilities::NONE.is_empty());
        assert_eq!(Capabilities::INPUT_ATTENTION.role_name(), "input attention");
    }

    #[test]
    fn test_kernel_value_widths() {
        let fixed = KernelValue::Fixed(Array1::zeros(3));
        let trainable = KernelValue::Trainable(Weight::zeros("w", 5));
        assert_eq!(fixed.width(), 3);
        assert_eq!(trainable.width(), 5);
        assert!(trainable.is_trainable() && !fixed.is_trainable());
    }
}
