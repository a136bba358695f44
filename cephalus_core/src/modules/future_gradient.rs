//! Future state gradient prediction.
//!
//! Plays the role for state gradients that bootstrapped Q values play for
//! rewards: the gradient recorded for a state is augmented with a learned,
//! discounted estimate of the gradient the next state will receive.

use ndarray::Array1;

use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{Capabilities, ModuleContext, StateKernelModule};
use crate::neural::{mse_loss, Activation, Network, Optimizer};
use crate::tensor::{clip_by_global_norm, has_non_finite, GradientTape, Var, Weight};

#[derive(Debug)]
pub struct FutureGradientProvider {
    loss_scale: f32,
    coefficient: f32,
    stabilized: bool,
    state_width: usize,
    gradient_model: Option<Network>,
}

impl Default for FutureGradientProvider {
    fn default() -> Self {
        Self {
            loss_scale: 1.0,
            coefficient: 0.0,
            stabilized: true,
            state_width: 0,
            gradient_model: None,
        }
    }
}

impl FutureGradientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_scale(mut self, loss_scale: f32) -> Self {
        self.loss_scale = loss_scale;
        self
    }

    fn model(&self) -> KernelResult<&Network> {
        self.gradient_model
            .as_ref()
            .ok_or_else(|| KernelError::InvalidFrameState {
                details: "module 'future_gradient' used before it was configured".to_string(),
            })
    }

    fn weights(&self) -> Vec<Weight> {
        self.gradient_model
            .as_ref()
            .map(Network::weights)
            .unwrap_or_default()
    }

    /// Predicted gradient at `state`, cut off from the graph.
    pub fn predict_gradient(&self, state: &Var) -> KernelResult<Var> {
        Ok(self.model()?.forward(&state.detach())?.detach())
    }

    fn normalization(&self) -> f32 {
        if self.stabilized {
            1.0 / (1.0 + self.coefficient)
        } else {
            1.0
        }
    }

    fn recorded_gradient(&self, frame: &StateFrame, like: &Var) -> Var {
        let values = frame
            .current_state_gradient()
            .cloned()
            .unwrap_or_else(|| Array1::zeros(self.state_width));
        match like.graph() {
            Some(graph) => graph.vector(values),
            None => Var::vector(values),
        }
    }
}

impl<E> StateKernelModule<E> for FutureGradientProvider {
    fn name(&self) -> &str {
        "future_gradient"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOSS | Capabilities::RETROACTIVE_LOSS
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        self.coefficient = context.config.future_gradient_coefficient;
        self.stabilized = context.config.stabilized_gradient;
        self.state_width = context.state_width();
        let template = context
            .config
            .model_template
            .with_output_activation(Activation::Linear);
        self.gradient_model = Some(template.clone_model(
            "future_gradient",
            context.state_width(),
            context.state_width(),
            context.module_seed(3),
        ));
        Ok(())
    }

    fn trainable_weights(&self) -> Vec<Weight> {
        self.weights()
    }

    fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    /// `(s_t · g_t + c · s_(t+1) · ĝ(s_(t+1)))`, normalized when stabilized.
    /// Its gradient with respect to `s_t` is the recorded gradient.
    fn get_loss(&mut self, previous: &StateFrame, current: &StateFrame) -> KernelResult<Option<Var>> {
        let previous_state = previous.require_current_state("future gradient loss")?;
        let current_state = current.require_current_state("future gradient loss")?;

        let recorded = self.recorded_gradient(previous, previous_state);
        let present = previous_state.dot(&recorded)?;
        let future = current_state
            .dot(&self.predict_gradient(current_state)?)?
            .scale(self.coefficient);
        Ok(Some(present.add(&future)?.scale(self.normalization())))
    }

    /// Moves `ĝ(s_t)` toward `g_t + c · ĝ(s_(t+1))`, normalized when stabilized.
    fn train_retroactive_loss(
        &mut self,
        previous: &StateFrame,
        current: &StateFrame,
        tape: &GradientTape,
        optimizer: &mut dyn Optimizer,
    ) -> KernelResult<()> {
        let previous_state = previous.require_current_state("future gradient training")?;
        let current_state = current.require_current_state("future gradient training")?;

        let target = self
            .recorded_gradient(previous, previous_state)
            .add(&self.predict_gradient(current_state)?.scale(self.coefficient))?
            .scale(self.normalization())
            .detach();
        let prediction = self.model()?.forward(&previous_state.detach())?;
        let loss = mse_loss(&prediction, &target)?;

        let weights = self.weights();
        let mut grads = tape.gradient(&loss, &weights)?;
        if has_non_finite(&grads) {
            return Err(KernelError::NonFinite {
                context: "future gradient training".to_string(),
            });
        }
        clip_by_global_norm(&mut grads, 1.0);
        let pairs: Vec<_> = grads.into_iter().zip(weights).collect();
        optimizer.apply_gradients(&pairs)
    }
}
