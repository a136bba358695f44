//! The state kernel: module composition and the step/train cycle.

use ndarray::{arr0, Array1};
use tracing::{debug, info, warn};

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{
    Capabilities, KernelValue, ModuleContext, ModuleId, StandardInputAttentionProvider,
    StandardStatePredictionProvider, StateKernelModule,
};
use crate::neural::Optimizer;
use crate::tensor::gradient::mean_of;
use crate::tensor::{clip_by_global_norm, has_non_finite, GradientTape, Graph, Var, Weight};

/// Predicted states are clamped to this magnitude.
pub const STATE_LIMIT: f32 = 1e6;

/// Global norm the combined loss gradients are clipped to.
pub const MAX_GRADIENT_NORM: f32 = 1.0;

struct Registration<E> {
    id: ModuleId,
    capabilities: Capabilities,
    module: Box<dyn StateKernelModule<E>>,
}

/// A configurable kernel for online learning of sequential state updates.
///
/// Modules are added first, then the kernel is configured once. After that
/// a harness drives it one [`step`](StateKernel::step) at a time per stream,
/// passing back the frame the previous step returned. Each step trains the
/// previous frame, so learning happens continuously as the stream advances.
///
/// `E` is the environment type handed to input and gradient providers.
pub struct StateKernel<E> {
    config: Option<KernelConfig>,
    graph: Graph,
    modules: Vec<Registration<E>>,
    next_module_id: u64,
    input_attention_provider: Option<ModuleId>,
    state_prediction_provider: Option<ModuleId>,
    initial_state: Option<KernelValue>,
    default_input: Option<KernelValue>,
    optimizer: Option<Box<dyn Optimizer>>,
    trainable_weights: Vec<Weight>,
    next_stream: u64,
}

impl<E> Default for StateKernel<E> {
    fn default() -> Self {
        Self {
            config: None,
            graph: Graph::new(),
            modules: Vec::new(),
            next_module_id: 0,
            input_attention_provider: None,
            state_prediction_provider: None,
            initial_state: None,
            default_input: None,
            optimizer: None,
            trainable_weights: Vec::new(),
            next_stream: 0,
        }
    }
}

impl<E> StateKernel<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `modules` in order, then configures the kernel with `config`.
    pub fn with_modules(
        modules: Vec<Box<dyn StateKernelModule<E>>>,
        config: KernelConfig,
    ) -> KernelResult<Self> {
        let mut kernel = Self::new();
        for module in modules {
            kernel.add_boxed_module(module)?;
        }
        kernel.configure(config)?;
        Ok(kernel)
    }

    fn require_config(&self, operation: &'static str) -> KernelResult<&KernelConfig> {
        self.config
            .as_ref()
            .ok_or(KernelError::NotConfigured { operation })
    }

    pub fn config(&self) -> Option<&KernelConfig> {
        self.config.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn state_width(&self) -> KernelResult<usize> {
        Ok(self.require_config("state_width")?.state_width)
    }

    pub fn input_width(&self) -> KernelResult<usize> {
        Ok(self.require_config("input_width")?.input_width)
    }

    /// Discount applied to predicted future state gradients.
    pub fn future_gradient_coefficient(&self) -> KernelResult<f32> {
        Ok(self
            .require_config("future_gradient_coefficient")?
            .future_gradient_coefficient)
    }

    pub fn stabilized_gradient(&self) -> KernelResult<bool> {
        Ok(self.require_config("stabilized_gradient")?.stabilized_gradient)
    }

    /// The recording graph shared by the kernel, its modules and its frames.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut (dyn Optimizer + 'static)> {
        self.optimizer.as_deref_mut()
    }

    pub fn state_prediction_provider(&self) -> Option<ModuleId> {
        self.state_prediction_provider
    }

    pub fn input_attention_provider(&self) -> Option<ModuleId> {
        self.input_attention_provider
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.modules.iter().map(|reg| reg.id).collect()
    }

    pub fn module(&self, id: ModuleId) -> Option<&dyn StateKernelModule<E>> {
        self.modules
            .iter()
            .find(|reg| reg.id == id)
            .map(|reg| reg.module.as_ref())
    }

    pub fn capabilities(&self, id: ModuleId) -> Option<Capabilities> {
        self.modules
            .iter()
            .find(|reg| reg.id == id)
            .map(|reg| reg.capabilities)
    }

    /// Adds a module. A module added to a configured kernel is configured
    /// immediately and the trainable weights are recomputed.
    pub fn add_module<M>(&mut self, module: M) -> KernelResult<ModuleId>
    where
        M: StateKernelModule<E> + 'static,
    {
        self.add_boxed_module(Box::new(module))
    }

    pub fn add_boxed_module(
        &mut self,
        mut module: Box<dyn StateKernelModule<E>>,
    ) -> KernelResult<ModuleId> {
        let capabilities = module.capabilities();
        if capabilities.contains(Capabilities::STATE_PREDICTION)
            && self.state_prediction_provider.is_some()
        {
            return Err(KernelError::DuplicateProvider {
                role: Capabilities::STATE_PREDICTION.role_name(),
            });
        }
        if capabilities.contains(Capabilities::INPUT_ATTENTION)
            && self.input_attention_provider.is_some()
        {
            return Err(KernelError::DuplicateProvider {
                role: Capabilities::INPUT_ATTENTION.role_name(),
            });
        }

        let id = ModuleId::from_raw(self.next_module_id);
        if let (Some(config), Some(initial_state)) = (&self.config, &self.initial_state) {
            module.configure(&ModuleContext {
                id,
                config,
                graph: &self.graph,
                initial_state,
            })?;
        }
        self.next_module_id += 1;

        if capabilities.contains(Capabilities::STATE_PREDICTION) {
            self.state_prediction_provider = Some(id);
        }
        if capabilities.contains(Capabilities::INPUT_ATTENTION) {
            self.input_attention_provider = Some(id);
        }
        debug!(
            module = module.name(),
            id = id.raw(),
            capabilities = ?capabilities.names(),
            "module added"
        );
        self.modules.push(Registration {
            id,
            capabilities,
            module,
        });
        if self.config.is_some() {
            self.recompute_trainable_weights();
        }
        Ok(id)
    }

    /// Removes a module. The state prediction provider cannot be removed.
    pub fn discard_module(&mut self, id: ModuleId) -> KernelResult<Box<dyn StateKernelModule<E>>> {
        if self.state_prediction_provider == Some(id) {
            return Err(KernelError::ProtectedModule {
                id: id.raw(),
                role: Capabilities::STATE_PREDICTION.role_name(),
            });
        }
        let index = self
            .modules
            .iter()
            .position(|reg| reg.id == id)
            .ok_or(KernelError::UnknownModule { id: id.raw() })?;
        let registration = self.modules.remove(index);
        if self.input_attention_provider == Some(id) {
            warn!(
                id = id.raw(),
                "input attention provider discarded; steps fail until another is added"
            );
            self.input_attention_provider = None;
        }
        if self.config.is_some() {
            self.recompute_trainable_weights();
        }
        Ok(registration.module)
    }

    /// Applies `config` and configures every module. Missing attention and
    /// state prediction providers are filled with the standard ones.
    pub fn configure(&mut self, config: KernelConfig) -> KernelResult<()> {
        if self.config.is_some() {
            return Err(KernelError::AlreadyConfigured);
        }
        config
            .validate()
            .map_err(|err| KernelError::InvalidConfiguration {
                reason: err.to_string(),
            })?;
        check_width(self.initial_state.as_ref(), config.state_width, "initial state")?;
        check_width(self.default_input.as_ref(), config.input_width, "default input")?;

        let initial_state = self
            .initial_state
            .get_or_insert_with(|| {
                KernelValue::Trainable(Weight::zeros("initial_state", config.state_width))
            })
            .clone();
        if self.default_input.is_none() {
            self.default_input = Some(KernelValue::Trainable(Weight::zeros(
                "default_input",
                config.input_width,
            )));
        }

        for registration in &mut self.modules {
            registration.module.configure(&ModuleContext {
                id: registration.id,
                config: &config,
                graph: &self.graph,
                initial_state: &initial_state,
            })?;
        }
        self.optimizer = Some(config.optimizer.build());
        self.config = Some(config);

        if self.input_attention_provider.is_none() {
            self.add_module(StandardInputAttentionProvider::new())?;
        }
        if self.state_prediction_provider.is_none() {
            self.add_module(StandardStatePredictionProvider::new())?;
        }
        self.recompute_trainable_weights();

        info!(
            modules = self.modules.len(),
            trainable_weights = self.trainable_weights.len(),
            "state kernel configured"
        );
        Ok(())
    }

    pub fn initial_state(&self) -> Option<&KernelValue> {
        self.initial_state.as_ref()
    }

    /// Sets the state streams start from. It can be set only once, and
    /// configuring the kernel sets a trainable zero vector if it is unset.
    pub fn set_initial_state(&mut self, value: KernelValue) -> KernelResult<()> {
        if self.initial_state.is_some() {
            return Err(KernelError::InvalidConfiguration {
                reason: "initial state is already set".to_string(),
            });
        }
        if let Some(config) = &self.config {
            check_width(Some(&value), config.state_width, "initial state")?;
        }
        self.initial_state = Some(value);
        if self.config.is_some() {
            self.recompute_trainable_weights();
        }
        Ok(())
    }

    pub fn default_input(&self) -> Option<&KernelValue> {
        self.default_input.as_ref()
    }

    /// Sets the input that is always gathered first, before module inputs.
    pub fn set_default_input(&mut self, value: KernelValue) -> KernelResult<()> {
        if let Some(config) = &self.config {
            check_width(Some(&value), config.input_width, "default input")?;
        }
        self.default_input = Some(value);
        if self.config.is_some() {
            self.recompute_trainable_weights();
        }
        Ok(())
    }

    /// Collects the trainable weights of the kernel and every module.
    pub fn recompute_trainable_weights(&mut self) {
        let mut weights: Vec<Weight> = Vec::new();
        let kernel_values = [self.initial_state.as_ref(), self.default_input.as_ref()];
        weights.extend(
            kernel_values
                .into_iter()
                .flatten()
                .filter_map(KernelValue::weight)
                .cloned(),
        );
        for registration in &self.modules {
            weights.extend(registration.module.trainable_weights());
        }
        let mut seen = std::collections::HashSet::new();
        weights.retain(|weight| seen.insert(weight.id()));
        self.trainable_weights = weights;
    }

    pub fn trainable_weights(&self) -> &[Weight] {
        &self.trainable_weights
    }

    /// A fresh stream id.
    pub fn new_stream(&mut self) -> String {
        let id = format!("stream-{}", self.next_stream);
        self.next_stream += 1;
        id
    }

    /// Runs the kernel for one step and returns the new frame.
    ///
    /// Gathers inputs, attends to them, predicts the state and, when a
    /// previous frame is given, trains it. Finally records the averaged
    /// state gradient of the gradient providers on the new frame.
    pub fn step(
        &mut self,
        environment: &mut E,
        mut previous_frame: Option<&mut StateFrame>,
    ) -> KernelResult<StateFrame> {
        self.require_config("step")?;
        let mut frame = self.new_frame(previous_frame.as_deref())?;
        self.gather_inputs(environment, &mut frame)?;
        self.attend_inputs(&mut frame)?;
        self.predict_state(&mut frame)?;

        if let Some(previous) = previous_frame.as_deref_mut() {
            // Train even without module losses: retroactive providers have their own.
            self.train(previous, &frame)?;
        }

        self.record_state_gradient(environment, &mut frame)?;
        Ok(frame)
    }

    /// Creates a frame seeded from the previous frame's state, or from the
    /// initial state when starting a new stream, with an open tape.
    pub fn new_frame(&mut self, previous_frame: Option<&StateFrame>) -> KernelResult<StateFrame> {
        self.require_config("new_frame")?;
        let tape = self.graph.open_tape(&self.trainable_weights);
        let (stream_id, clock_ticks, previous_state) = match previous_frame {
            Some(previous) => (
                previous.stream_id().to_string(),
                previous.clock_ticks() + 1,
                previous.require_current_state("new frame")?.clone(),
            ),
            None => {
                let initial_state = self
                    .initial_state
                    .as_ref()
                    .ok_or(KernelError::NotConfigured {
                        operation: "initial_state",
                    })?
                    .read(&self.graph);
                (self.new_stream(), 0, initial_state)
            }
        };

        let mut frame = StateFrame::new(stream_id, clock_ticks, previous_state, tape);
        for registration in &self.modules {
            if let Some(data) = registration.module.new_frame_data(&frame, previous_frame) {
                frame.insert_module_data(registration.id, data);
            }
        }
        Ok(frame)
    }

    /// Gathers the default input plus every input provider's input.
    pub fn gather_inputs(&mut self, environment: &mut E, frame: &mut StateFrame) -> KernelResult<()> {
        let input_width = self.require_config("gather_inputs")?.input_width;
        if frame.has_inputs() || frame.current_state().is_some() {
            return Err(KernelError::InvalidFrameState {
                details: "inputs were already gathered for this frame".to_string(),
            });
        }
        let default_input = self
            .default_input
            .as_ref()
            .ok_or(KernelError::NotConfigured {
                operation: "default_input",
            })?
            .read(&self.graph);

        let mut inputs = vec![default_input];
        for registration in &mut self.modules {
            if !registration.capabilities.contains(Capabilities::INPUT) {
                continue;
            }
            if let Some(input) = registration.module.get_input(environment, frame)? {
                if input.shape() != [input_width] {
                    return Err(KernelError::shape(
                        &[input_width],
                        input.shape(),
                        format!("input from module '{}'", registration.module.name()),
                    ));
                }
                inputs.push(input);
            }
        }
        frame.set_input_tensors(inputs)
    }

    /// Lets the designated attention provider combine the gathered inputs.
    pub fn attend_inputs(&mut self, frame: &mut StateFrame) -> KernelResult<()> {
        let input_width = self.require_config("attend_inputs")?.input_width;
        if !frame.has_inputs() {
            return Err(KernelError::InvalidFrameState {
                details: "attention requires gathered inputs".to_string(),
            });
        }
        let id = self
            .input_attention_provider
            .ok_or(KernelError::MissingProvider {
                role: Capabilities::INPUT_ATTENTION.role_name(),
            })?;
        let registration = self.registration_mut(id)?;
        let attended = registration.module.attend_inputs(frame)?;
        if attended.shape() != [input_width] {
            return Err(KernelError::shape(
                &[input_width],
                attended.shape(),
                "attended input",
            ));
        }
        frame.set_attended_input(attended);
        Ok(())
    }

    /// Predicts the frame's state with the designated provider. NaN values
    /// are rejected; the rest is clamped to `±STATE_LIMIT`.
    pub fn predict_state(&mut self, frame: &mut StateFrame) -> KernelResult<()> {
        let state_width = self.require_config("predict_state")?.state_width;
        frame.require_attended_input("state prediction")?;
        if frame.current_state().is_some() {
            return Err(KernelError::InvalidFrameState {
                details: "state was already predicted for this frame".to_string(),
            });
        }
        let id = self
            .state_prediction_provider
            .ok_or(KernelError::MissingProvider {
                role: Capabilities::STATE_PREDICTION.role_name(),
            })?;
        let registration = self.registration_mut(id)?;
        let state = registration.module.predict_state(frame)?;
        if state.shape() != [state_width] {
            return Err(KernelError::shape(&[state_width], state.shape(), "predicted state"));
        }
        if state.has_nan() {
            return Err(KernelError::NonFinite {
                context: "predicted state".to_string(),
            });
        }
        frame.set_current_state(state.clamp(-STATE_LIMIT, STATE_LIMIT))
    }

    /// Scale-weighted average of the module losses for `previous_frame`'s
    /// state, or `None` when no module reports one.
    pub fn get_loss(
        &mut self,
        previous_frame: &StateFrame,
        current_frame: &StateFrame,
    ) -> KernelResult<Option<Var>> {
        self.require_config("get_loss")?;
        previous_frame.require_current_state("loss")?;

        let mut losses = Vec::new();
        let mut total_scale = 0.0f32;
        for registration in &mut self.modules {
            if !registration.capabilities.contains(Capabilities::LOSS) {
                continue;
            }
            let Some(loss) = registration.module.get_loss(previous_frame, current_frame)? else {
                continue;
            };
            if loss.value().ndim() != 0 {
                return Err(KernelError::shape(
                    &[],
                    loss.shape(),
                    format!("loss from module '{}'", registration.module.name()),
                ));
            }
            let scale = registration.module.loss_scale();
            if scale > 0.0 {
                losses.push(loss.scale(scale));
                total_scale += scale;
            } else {
                warn!(
                    module = registration.module.name(),
                    scale, "loss ignored: non-positive loss scale"
                );
            }
        }

        if losses.is_empty() {
            return Ok(None);
        }
        if !(total_scale > 0.0) {
            return Err(KernelError::InvalidLossScale { total_scale });
        }
        Ok(Some(Var::add_n(&losses)?.scale(1.0 / total_scale)))
    }

    /// Trains the models through `previous_frame`'s tape.
    ///
    /// The frame is marked trained and its tape is released on every exit
    /// path, whether training succeeds or not.
    pub fn train(
        &mut self,
        previous_frame: &mut StateFrame,
        current_frame: &StateFrame,
    ) -> KernelResult<()> {
        self.require_config("train")?;
        previous_frame.require_current_state("training")?;
        let tape = previous_frame.begin_training()?;
        let result = self.train_with_tape(previous_frame, current_frame, &tape);
        tape.close();
        result
    }

    fn train_with_tape(
        &mut self,
        previous_frame: &mut StateFrame,
        current_frame: &StateFrame,
        tape: &GradientTape,
    ) -> KernelResult<()> {
        let loss = match self.get_loss(previous_frame, current_frame)? {
            Some(loss) => loss,
            None => self.graph.constant(arr0(0.0f32).into_dyn()),
        };
        if loss.value().ndim() != 0 {
            return Err(KernelError::shape(&[], loss.shape(), "combined loss"));
        }
        if loss.has_nan() {
            return Err(KernelError::NonFinite {
                context: "combined loss".to_string(),
            });
        }

        let weights = self.trainable_weights.clone();
        let mut grads = tape.gradient(&loss, &weights)?;
        if has_non_finite(&grads) {
            return Err(KernelError::NonFinite {
                context: "loss gradients".to_string(),
            });
        }
        let norm = clip_by_global_norm(&mut grads, MAX_GRADIENT_NORM);
        let optimizer = self
            .optimizer
            .as_deref_mut()
            .ok_or(KernelError::NotConfigured { operation: "train" })?;
        let pairs: Vec<_> = grads.into_iter().zip(weights).collect();
        optimizer.apply_gradients(&pairs)?;

        let combined_loss = loss.scalar()?;
        previous_frame.set_combined_loss(combined_loss);
        debug!(
            stream_id = previous_frame.stream_id(),
            clock_ticks = previous_frame.clock_ticks(),
            combined_loss,
            gradient_norm = norm,
            "frame trained"
        );

        // Retroactive providers run before the tape closes; they may need it.
        let previous_frame: &StateFrame = previous_frame;
        for registration in &mut self.modules {
            if registration
                .capabilities
                .contains(Capabilities::RETROACTIVE_LOSS)
            {
                registration.module.train_retroactive_loss(
                    previous_frame,
                    current_frame,
                    tape,
                    &mut *optimizer,
                )?;
            }
        }
        Ok(())
    }

    fn record_state_gradient(&mut self, environment: &mut E, frame: &mut StateFrame) -> KernelResult<()> {
        let state_width = self.require_config("step")?.state_width;
        let mut gradients: Vec<Array1<f32>> = Vec::new();
        for registration in &mut self.modules {
            if !registration.capabilities.contains(Capabilities::GRADIENT) {
                continue;
            }
            let Some(gradient) = registration
                .module
                .get_current_state_gradient(environment, frame)?
            else {
                continue;
            };
            if gradient.len() != state_width {
                return Err(KernelError::shape(
                    &[state_width],
                    &[gradient.len()],
                    format!("state gradient from module '{}'", registration.module.name()),
                ));
            }
            if gradient.iter().any(|v| v.is_nan()) {
                return Err(KernelError::NonFinite {
                    context: format!("state gradient from module '{}'", registration.module.name()),
                });
            }
            gradients.push(gradient);
        }
        if let Some(combined) = mean_of(&gradients) {
            frame.set_current_state_gradient(combined);
        }
        Ok(())
    }

    fn registration_mut(&mut self, id: ModuleId) -> KernelResult<&mut Registration<E>> {
        self.modules
            .iter_mut()
            .find(|reg| reg.id == id)
            .ok_or(KernelError::UnknownModule { id: id.raw() })
    }
}

fn check_width(value: Option<&KernelValue>, width: usize, what: &str) -> KernelResult<()> {
    match value {
        Some(value) if value.width() != width => Err(KernelError::InvalidConfiguration {
            reason: format!("{} has width {}, expected {}", what, value.width(), width),
        }),
        _ => Ok(()),
    }
}
