//! Scaled dot-product attention over the gathered inputs.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{configured_id, Capabilities, ModuleContext, ModuleId, StateKernelModule};
use crate::neural::{Activation, Dense};
use crate::tensor::{Var, Weight};

/// Attention weights chosen for a frame, stored as the provider's frame data.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionWeights(pub Array1<f32>);

/// The default attention provider.
///
/// A learned linear query of the previous state is scored against each
/// input with `q · x / sqrt(input_width)`; the softmax of the scores weights
/// the sum of the inputs. A lone input is passed through unchanged.
#[derive(Debug, Default)]
pub struct StandardInputAttentionProvider {
    id: Option<ModuleId>,
    query: Option<Dense>,
}

impl StandardInputAttentionProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E> StateKernelModule<E> for StandardInputAttentionProvider {
    fn name(&self) -> &str {
        "standard_input_attention"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INPUT_ATTENTION
    }

    fn configure(&mut self, context: &ModuleContext<'_>) -> KernelResult<()> {
        let mut rng = StdRng::seed_from_u64(context.module_seed(1));
        self.id = Some(context.id);
        self.query = Some(Dense::new(
            "input_attention/query",
            context.state_width(),
            context.input_width(),
            Activation::Linear,
            &mut rng,
        ));
        Ok(())
    }

    fn trainable_weights(&self) -> Vec<Weight> {
        self.query.as_ref().map(Dense::weights).unwrap_or_default()
    }

    fn attend_inputs(&mut self, frame: &mut StateFrame) -> KernelResult<Var> {
        let id = configured_id(self.id, "standard_input_attention")?;
        let inputs = frame.input_tensors().to_vec();
        match inputs.len() {
            0 => Err(KernelError::InvalidFrameState {
                details: "attention requires at least one input".to_string(),
            }),
            1 => {
                frame.set_module_data(id, AttentionWeights(Array1::ones(1)));
                Ok(inputs[0].clone())
            }
            _ => {
                let query = self.query.as_ref().ok_or_else(|| KernelError::InvalidFrameState {
                    details: "module 'standard_input_attention' used before it was configured"
                        .to_string(),
                })?;
                let q = query.forward(frame.previous_state())?;
                let temperature = (q.len().max(1) as f32).sqrt().recip();
                let scores = inputs
                    .iter()
                    .map(|input| Ok(q.dot(input)?.scale(temperature)))
                    .collect::<KernelResult<Vec<Var>>>()?;
                let weights = Var::stack(&scores)?.softmax()?;
                let weighted = inputs
                    .iter()
                    .enumerate()
                    .map(|(index, input)| weights.index(index)?.mul_scalar(input))
                    .collect::<KernelResult<Vec<Var>>>()?;
                frame.set_module_data(id, AttentionWeights(weights.to_array1()?));
                Var::add_n(&weighted)
            }
        }
    }
}
