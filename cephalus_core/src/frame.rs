//! Per-step record of a state kernel stream.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use ndarray::Array1;

use crate::error::{KernelError, KernelResult};
use crate::modules::ModuleId;
use crate::tensor::{GradientTape, Var};

/// Everything recorded about one state prediction that training the step
/// may need later.
///
/// A frame is created by [`StateKernel::step`](crate::StateKernel::step)
/// with an open gradient tape. The tape stays open until the next step of
/// the same stream trains the frame, which closes it and marks the frame
/// trained. The last frame of a stream is never trained.
pub struct StateFrame {
    stream_id: String,
    clock_ticks: u64,
    previous_state: Var,
    tape: Option<GradientTape>,
    input_tensors: Option<Vec<Var>>,
    attended_input_tensor: Option<Var>,
    current_state: Option<Var>,
    /// Analogous to the update target `r_t + discount * Q(s_(t+1), a_(t+1))` of SARSA.
    combined_loss: Option<f32>,
    current_state_gradient: Option<Array1<f32>>,
    trained: bool,
    module_data: HashMap<ModuleId, Box<dyn Any>>,
}

impl StateFrame {
    pub(crate) fn new(
        stream_id: String,
        clock_ticks: u64,
        previous_state: Var,
        tape: GradientTape,
    ) -> Self {
        Self {
            stream_id,
            clock_ticks,
            previous_state,
            tape: Some(tape),
            input_tensors: None,
            attended_input_tensor: None,
            current_state: None,
            combined_loss: None,
            current_state_gradient: None,
            trained: false,
            module_data: HashMap::new(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn clock_ticks(&self) -> u64 {
        self.clock_ticks
    }

    pub fn previous_state(&self) -> &Var {
        &self.previous_state
    }

    /// The open tape, or `None` once the frame has been trained.
    pub fn tape(&self) -> Option<&GradientTape> {
        self.tape.as_ref()
    }

    /// Gathered inputs, default input first. Empty before gathering.
    pub fn input_tensors(&self) -> &[Var] {
        self.input_tensors.as_deref().unwrap_or(&[])
    }

    pub fn attended_input(&self) -> Option<&Var> {
        self.attended_input_tensor.as_ref()
    }

    /// Attended input, or an error naming `stage` if attention has not run.
    pub fn require_attended_input(&self, stage: &str) -> KernelResult<&Var> {
        self.attended_input().ok_or_else(|| KernelError::InvalidFrameState {
            details: format!("{} requires an attended input", stage),
        })
    }

    pub fn current_state(&self) -> Option<&Var> {
        self.current_state.as_ref()
    }

    /// Predicted state, or an error naming `stage` if prediction has not run.
    pub fn require_current_state(&self, stage: &str) -> KernelResult<&Var> {
        self.current_state().ok_or_else(|| KernelError::InvalidFrameState {
            details: format!("{} requires a predicted state", stage),
        })
    }

    /// Combined training loss, set once the frame is trained.
    pub fn combined_loss(&self) -> Option<f32> {
        self.combined_loss
    }

    /// Averaged gradient of the predicted state reported by gradient providers.
    pub fn current_state_gradient(&self) -> Option<&Array1<f32>> {
        self.current_state_gradient.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Data stored by the module `id`, if it is of type `T`.
    pub fn module_data<T: Any>(&self, id: ModuleId) -> Option<&T> {
        self.module_data.get(&id).and_then(|data| data.downcast_ref())
    }

    pub fn module_data_mut<T: Any>(&mut self, id: ModuleId) -> Option<&mut T> {
        self.module_data
            .get_mut(&id)
            .and_then(|data| data.downcast_mut())
    }

    /// Stores data for module `id`, replacing any earlier value.
    pub fn set_module_data<T: Any>(&mut self, id: ModuleId, data: T) {
        self.module_data.insert(id, Box::new(data));
    }

    pub(crate) fn insert_module_data(&mut self, id: ModuleId, data: Box<dyn Any>) {
        self.module_data.insert(id, data);
    }

    pub(crate) fn set_input_tensors(&mut self, inputs: Vec<Var>) -> KernelResult<()> {
        if self.current_state.is_some() || self.input_tensors.is_some() {
            return Err(KernelError::InvalidFrameState {
                details: "inputs were already gathered for this frame".to_string(),
            });
        }
        self.input_tensors = Some(inputs);
        Ok(())
    }

    pub(crate) fn has_inputs(&self) -> bool {
        self.input_tensors.is_some()
    }

    pub(crate) fn set_attended_input(&mut self, attended: Var) {
        self.attended_input_tensor = Some(attended);
    }

    pub(crate) fn set_current_state(&mut self, state: Var) -> KernelResult<()> {
        if self.current_state.is_some() {
            return Err(KernelError::InvalidFrameState {
                details: "state was already predicted for this frame".to_string(),
            });
        }
        self.current_state = Some(state);
        Ok(())
    }

    pub(crate) fn set_current_state_gradient(&mut self, gradient: Array1<f32>) {
        self.current_state_gradient = Some(gradient);
    }

    pub(crate) fn set_combined_loss(&mut self, loss: f32) {
        self.combined_loss = Some(loss);
    }

    /// Marks the frame trained and hands over its tape. Fails if the frame
    /// was already trained.
    pub(crate) fn begin_training(&mut self) -> KernelResult<GradientTape> {
        if self.trained {
            return Err(KernelError::AlreadyTrained {
                stream_id: self.stream_id.clone(),
                clock_ticks: self.clock_ticks,
            });
        }
        self.trained = true;
        self.tape.take().ok_or(KernelError::TapeClosed)
    }

    /// Closes the frame's tape without training it, typically at the end of a stream.
    pub fn release_tape(&mut self) {
        if let Some(tape) = self.tape.take() {
            tape.close();
        }
    }
}

impl fmt::Debug for StateFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFrame")
            .field("stream_id", &self.stream_id)
            .field("clock_ticks", &self.clock_ticks)
            .field("inputs", &self.input_tensors().len())
            .field("has_state", &self.current_state.is_some())
            .field("combined_loss", &self.combined_loss)
            .field("trained", &self.trained)
            .field("tape_open", &self.tape.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Graph;
    use ndarray::array;

    fn frame() -> (Graph, StateFrame) {
        let graph = Graph::new();
        let tape = graph.open_tape(&[]);
        let state = graph.vector(array![0.0, 0.0]);
        let frame = StateFrame::new("s".to_string(), 0, state, tape);
        (graph, frame)
    }

    #[test]
    fn test_training_flips_once() {
        let (graph, mut frame) = frame();
        let tape = frame.begin_training().unwrap();
        assert!(frame.is_trained());
        assert!(frame.tape().is_none());
        drop(tape);
        assert!(!graph.is_recording());
        assert!(matches!(
            frame.begin_training(),
            Err(KernelError::AlreadyTrained { .. })
        ));
    }

    #[test]
    fn test_inputs_gathered_once() {
        let (_graph, mut frame) = frame();
        frame.set_input_tensors(vec![]).unwrap();
        assert!(frame.set_input_tensors(vec![]).is_err());
    }

    #[test]
    fn test_module_data_is_typed() {
        let (_graph, mut frame) = frame();
        let id = ModuleId::from_raw(3);
        frame.set_module_data(id, 5usize);
        assert_eq!(frame.module_data::<usize>(id), Some(&5));
        assert!(frame.module_data::<f32>(id).is_none());
        *frame.module_data_mut::<usize>(id).unwrap() += 1;
        assert_eq!(frame.module_data::<usize>(id), Some(&6));
    }

    #[test]
    fn test_release_tape_closes_recording() {
        let (graph, mut frame) = frame();
        assert!(graph.is_recording());
        frame.release_tape();
        assert!(!graph.is_recording());
        assert!(matches!(frame.begin_training(), Err(KernelError::TapeClosed)));
    }
}
