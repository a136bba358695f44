//! State prediction providers.
//!
//! Every provider maps `[previous state, attended input]` to the next
//! state. Exactly one of them is designated per kernel.

use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{Capabilities, KernelValue, ModuleContext, StateKernelModule};
use crate::neural::Network;
use crate::tensor::{Graph, Var, Weight};

fn state_model_input(frame: &StateFrame) -> KernelResult<Var> {
    let attended = frame.require_attended_input("state prediction")?;
    Var::concat(&[frame.previous_state().clone(), attended.clone()])
}

fn clone_state_model(context: &ModuleContext<'_>, name: &str) -> Network {
    context.config.model_template.clone_model(
        name,
        context.state_width() + context.input_width(),
        context.state_width(),
        context.module_seed(0),
    )
}

fn predict_with(model: &Option<Network>, module: &str, frame: &StateFrame) -> KernelResult<Var> {
    let model = model.as_ref().ok_or_else(|| KernelError::InvalidFrameState {
        details: format!("module '{}' used before it was configured", module),
    })?;
    model.forward(&state_model_input(frame)?)
}

/// The default provider. Its state model is cloned from the configuration's
/// model template and trained only by the losses of the other modules.
#[derive(Debug, Default)]
pub struct StandardStatePredictionProvider {
    state_model: Option<Network>,
}

impl StandardStatePredictionProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E> StateKernelModule<E> for StandardStatePredictionProvider {
    fn name(&self) -> &str {
        "standard_state_prediction"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STATE_PREDICTION
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        self.state_model = Some(clone_state_model(context, "state_model"));
        Ok(())
    }

    fn trainable_weights(&self) -> Vec<Weight> {
        self.state_model
            .as_ref()
            .map(Network::weights)
            .unwrap_or_default()
    }

    fn predict_state(&mut self, frame: &StateFrame) -> KernelResult<Var> {
        predict_with(&self.state_model, "standard_state_prediction", frame)
    }
}

/// Ignores its inputs and always returns the kernel's initial state.
/// Useful as an experimental baseline.
#[derive(Debug, Default)]
pub struct NullStatePredictionProvider {
    initial_state: Option<(KernelValue, Graph)>,
}

impl NullStatePredictionProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E> StateKernelModule<E> for NullStatePredictionProvider {
    fn name(&self) -> &str {
        "null_state_prediction"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STATE_PREDICTION
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        self.initial_state = Some((context.initial_state.clone(), context.graph.clone()));
        Ok(())
    }

    fn predict_state(&mut self, _frame: &StateFrame) -> KernelResult<Var> {
        let (initial_state, graph) =
            self.initial_state
                .as_ref()
                .ok_or_else(|| KernelError::InvalidFrameState {
                    details: "module 'null_state_prediction' used before it was configured"
                        .to_string(),
                })?;
        Ok(initial_state.read(graph))
    }
}

/// Clones the model template like the standard provider but never exposes
/// its weights, so the state model stays at its initialization.
#[derive(Debug, Default)]
pub struct UntrainedStatePredictionProvider {
    state_model: Option<Network>,
}

impl UntrainedStatePredictionProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E> StateKernelModule<E> for UntrainedStatePredictionProvider {
    fn name(&self) -> &str {
        "untrained_state_prediction"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STATE_PREDICTION
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        self.state_model = Some(clone_state_model(context, "frozen_state_model"));
        Ok(())
    }

    fn predict_state(&mut self, frame: &StateFrame) -> KernelResult<Var> {
        predict_with(&self.state_model, "untrained_state_prediction", frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::modules::ModuleId;
    use ndarray::{array, Array1};

    fn configure<M: StateKernelModule<()>>(module: &mut M, graph: &Graph) {
        let config = KernelConfig::new(3, 2);
        let initial_state = KernelValue::Fixed(Array1::zeros(3));
        let context = ModuleContext {
            id: ModuleId::from_raw(1),
            config: &config,
            graph,
            initial_state: &initial_state,
        };
        module.configure(&context).unwrap();
    }

    fn attended_frame(graph: &Graph) -> StateFrame {
        let tape = graph.open_tape(&[]);
        let mut frame = StateFrame::new(
            "s".to_string(),
            0,
            graph.vector(array![0.5, 0.1, -0.3]),
            tape,
        );
        frame.set_attended_input(graph.vector(array![1.0, -1.0]));
        frame
    }

    #[test]
    fn test_untrained_provider_exposes_no_weights() {
        let graph = Graph::new();
        let mut untrained = UntrainedStatePredictionProvider::new();
        let mut standard = StandardStatePredictionProvider::new();
        configure(&mut untrained, &graph);
        configure(&mut standard, &graph);
        assert!(StateKernelModule::<()>::trainable_weights(&untrained).is_empty());
        assert!(!StateKernelModule::<()>::trainable_weights(&standard).is_empty());
    }

    #[test]
    fn test_untrained_prediction_is_stable() {
        let graph = Graph::new();
        let mut provider = UntrainedStatePredictionProvider::new();
        configure(&mut provider, &graph);
        let frame = attended_frame(&graph);

        let first = StateKernelModule::<()>::predict_state(&mut provider, &frame).unwrap();
        let second = StateKernelModule::<()>::predict_state(&mut provider, &frame).unwrap();
        assert_eq!(first.shape(), &[3]);
        assert_eq!(first.value(), second.value());
    }

    #[test]
    fn test_null_provider_reads_initial_state() {
        let graph = Graph::new();
        let mut provider = NullStatePredictionProvider::new();
        configure(&mut provider, &graph);
        let frame = attended_frame(&graph);
        let state = StateKernelModule::<()>::predict_state(&mut provider, &frame).unwrap();
        assert_eq!(state.to_array1().unwrap(), Array1::<f32>::zeros(3));
    }
}
