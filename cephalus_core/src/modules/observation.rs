//! Input provider reading observations from the environment.

use ndarray::Array1;

use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{Capabilities, ModuleContext, StateKernelModule};
use crate::tensor::Var;

/// An environment that can be observed once per step.
pub trait ObservationSource {
    /// The current observation, or `None` when nothing is observable this step.
    fn observe(&mut self) -> Option<Array1<f32>>;
}

/// Feeds the environment's observation into the kernel as an input.
#[derive(Debug, Default)]
pub struct ObservationInputProvider {
    input_width: Option<usize>,
    observations: u64,
}

impl ObservationInputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of observations contributed so far.
    pub fn observations(&self) -> u64 {
        self.observations
    }
}

impl<E: ObservationSource> StateKernelModule<E> for ObservationInputProvider {
    fn name(&self) -> &str {
        "observation_input"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INPUT
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        self.input_width = Some(context.input_width());
        Ok(())
    }

    fn get_input(&mut self, environment: &mut E, frame: &StateFrame) -> KernelResult<Option<Var>> {
        let Some(observation) = environment.observe() else {
            return Ok(None);
        };
        if let Some(width) = self.input_width {
            if observation.len() != width {
                return Err(KernelError::shape(
                    &[width],
                    &[observation.len()],
                    "observation input",
                ));
            }
        }
        if observation.iter().any(|v| !v.is_finite()) {
            return Err(KernelError::NonFinite {
                context: "observation input".to_string(),
            });
        }
        self.observations += 1;
        Ok(Some(match frame.previous_state().graph() {
            Some(graph) => graph.vector(observation),
            None => Var::vector(observation),
        }))
    }
}
