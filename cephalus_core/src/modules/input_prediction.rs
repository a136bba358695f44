//! Self-supervised loss: predict the next attended input from the state.

use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{Capabilities, ModuleContext, StateKernelModule};
use crate::neural::{mse_loss, Activation, Network};
use crate::tensor::{Var, Weight};

/// Learns to predict frame `t + 1`'s attended input from frame `t`'s state.
///
/// The loss pushes the state model toward states that carry information
/// about what comes next.
#[derive(Debug)]
pub struct InputPredictionProvider {
    loss_scale: f32,
    model: Option<Network>,
}

impl Default for InputPredictionProvider {
    fn default() -> Self {
        Self {
            loss_scale: 1.0,
            model: None,
        }
    }
}

impl InputPredictionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_scale(mut self, loss_scale: f32) -> Self {
        self.loss_scale = loss_scale;
        self
    }

    /// Prediction of the input following `state`.
    pub fn predict_next_input(&self, state: &Var) -> KernelResult<Var> {
        let model = self.model.as_ref().ok_or_else(|| KernelError::InvalidFrameState {
            details: "module 'input_prediction' used before it was configured".to_string(),
        })?;
        model.forward(state)
    }
}

impl<E> StateKernelModule<E> for InputPredictionProvider {
    fn name(&self) -> &str {
        "input_prediction"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOSS
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        let template = context
            .config
            .model_template
            .with_output_activation(Activation::Linear);
        self.model = Some(template.clone_model(
            "input_prediction",
            context.state_width(),
            context.input_width(),
            context.module_seed(2),
        ));
        Ok(())
    }

    fn trainable_weights(&self) -> Vec<Weight> {
        self.model.as_ref().map(Network::weights).unwrap_or_default()
    }

    fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    fn get_loss(&mut self, previous: &StateFrame, current: &StateFrame) -> KernelResult<Option<Var>> {
        let state = previous.require_current_state("input prediction loss")?;
        let target = current.require_attended_input("input prediction loss")?;
        let prediction = self.predict_next_input(state)?;
        Ok(Some(mse_loss(&prediction, &target.detach())?))
    }
}
