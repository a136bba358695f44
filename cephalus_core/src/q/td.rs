//! TD(0) control on top of a probabilistic Q model.
//!
//! Decisions are strictly sequential: a decision is chosen, rewarded, given
//! its target when the next decision (or a reset) arrives, and closed when
//! the next reward (or reset) arrives. Closing yields the decision's loss.

use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::DeferredLoss;
use crate::neural::{ModelTemplate, Optimizer};
use crate::q::action_policies::{ActionPolicy, EpsilonGreedyPolicy};
use crate::q::decision::{ActionDecision, DecisionRecord};
use crate::q::probabilistic_models::{NetworkQModel, ProbabilisticModel};
use crate::q::schedule::{Discount, EpsilonSchedule};
use crate::tensor::{clip_by_global_norm, has_non_finite, Graph, Var, Weight};

const MAX_GRADIENT_NORM: f32 = 1.0;

pub struct TDAgent {
    q_model: Box<dyn ProbabilisticModel>,
    policy: Box<dyn ActionPolicy>,
    discount: Discount,
    stabilize: bool,
    min_observable_reward: Option<f32>,
    max_observable_reward: Option<f32>,
    previous_decision: Option<ActionDecision>,
    current_decision: Option<ActionDecision>,
    episodes: u64,
    total_steps: u64,
    optimizer: Option<Box<dyn Optimizer>>,
    graph: Graph,
    last_closed: Option<DecisionRecord>,
}

impl TDAgent {
    pub fn new(
        q_model: Box<dyn ProbabilisticModel>,
        policy: Box<dyn ActionPolicy>,
        discount: impl Into<Discount>,
        stabilize: bool,
    ) -> Self {
        Self {
            q_model,
            policy,
            discount: discount.into(),
            stabilize,
            min_observable_reward: None,
            max_observable_reward: None,
            previous_decision: None,
            current_decision: None,
            episodes: 0,
            total_steps: 0,
            optimizer: None,
            graph: Graph::new(),
            last_closed: None,
        }
    }

    /// A network Q model with an epsilon-greedy policy, built and ready.
    pub fn from_config(
        config: &AgentConfig,
        template: &ModelTemplate,
        state_width: usize,
        action_count: usize,
    ) -> KernelResult<Self> {
        config
            .validate()
            .map_err(|err| KernelError::InvalidConfiguration {
                reason: err.to_string(),
            })?;
        let q_model = NetworkQModel::new(template.clone(), state_width, action_count, config.seed);
        let schedule = EpsilonSchedule::new(
            config.epsilon_start,
            config.epsilon_end,
            config.epsilon_decay_steps,
        );
        let policy = EpsilonGreedyPolicy::new(schedule, config.seed.wrapping_add(1));
        let mut agent = Self::new(
            Box::new(q_model),
            Box::new(policy),
            config.discount,
            config.stabilize,
        );
        agent.build()?;
        Ok(agent)
    }

    /// Trains the Q model itself whenever a decision closes.
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn build(&mut self) -> KernelResult<()> {
        self.q_model.build()?;
        self.policy.build()
    }

    pub fn q_model(&self) -> &dyn ProbabilisticModel {
        self.q_model.as_ref()
    }

    pub fn policy(&self) -> &dyn ActionPolicy {
        self.policy.as_ref()
    }

    pub fn trainable_weights(&self) -> Vec<Weight> {
        let mut weights = self.q_model.trainable_weights();
        weights.extend(self.policy.trainable_weights());
        weights
    }

    pub fn get_discount(&self) -> f32 {
        self.discount.value(self.episodes, self.total_steps)
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn is_stabilized(&self) -> bool {
        self.stabilize
    }

    /// `(min, max)` of the rewards observed so far, once any were.
    pub fn reward_bounds(&self) -> Option<(f32, f32)> {
        self.min_observable_reward.zip(self.max_observable_reward)
    }

    pub fn previous_decision(&self) -> Option<&ActionDecision> {
        self.previous_decision.as_ref()
    }

    pub fn current_decision(&self) -> Option<&ActionDecision> {
        self.current_decision.as_ref()
    }

    /// Summary of the decision most recently closed, with its loss.
    pub fn last_closed_decision(&self) -> Option<&DecisionRecord> {
        self.last_closed.as_ref()
    }

    /// Predicts Q values for `state_input`, lets the policy select, and
    /// completes the previous decision's TD target.
    pub fn choose_action(&mut self, state_input: &Var) -> KernelResult<usize> {
        if let Some(pending) = &self.current_decision {
            return Err(KernelError::DecisionPending {
                step: pending.step(),
            });
        }
        if state_input.has_non_finite() {
            return Err(KernelError::NonFinite {
                context: "agent state input".to_string(),
            });
        }
        let step = self
            .previous_decision
            .as_ref()
            .map_or(0, |previous| previous.step() + 1);

        let (graph, input) = match state_input.graph() {
            Some(graph) => (graph.clone(), state_input.clone()),
            None => (
                self.graph.clone(),
                self.graph.constant(state_input.value().clone()),
            ),
        };
        let tape = graph.open_tape(&self.trainable_weights());
        let (q_values, confidences) = self.q_model.predict(&input)?;
        let mut decision = ActionDecision::new(input, step, q_values, confidences, Some(tape))?;
        let action = self.policy.choose_action(&mut decision)?;
        debug!(
            step,
            action,
            exploit_action = decision.exploit_action(),
            exploit_q_value = decision.exploit_q_value_prediction(),
            "TD agent chose action"
        );
        self.current_decision = Some(decision);

        self.update_previous_decision()?;
        Ok(action)
    }

    /// Attaches `reward` to the pending decision and closes the one before
    /// it, returning that decision's loss.
    pub fn accept_reward(&mut self, reward: f32) -> KernelResult<Option<Var>> {
        if !reward.is_finite() {
            return Err(KernelError::NonFinite {
                context: "agent reward".to_string(),
            });
        }
        let current = self
            .current_decision
            .as_mut()
            .ok_or(KernelError::NoPendingDecision)?;
        current.set_reward(reward)?;
        self.total_steps += 1;
        if self.stabilize {
            self.observe_reward(reward);
        }
        self.close_previous_decision()
    }

    /// Ends the episode: the last decision is bootstrapped from a Q value of
    /// zero and closed.
    pub fn reset(&mut self) -> KernelResult<Option<Var>> {
        if let Some(pending) = &self.current_decision {
            return Err(KernelError::DecisionPending {
                step: pending.step(),
            });
        }
        self.episodes += 1;
        self.update_previous_decision()?;
        if self.stabilize {
            self.observe_reward(0.0);
        }
        self.close_previous_decision()
    }

    fn observe_reward(&mut self, reward: f32) {
        self.max_observable_reward = Some(
            self.max_observable_reward
                .map_or(reward, |max| max.max(reward)),
        );
        self.min_observable_reward = Some(
            self.min_observable_reward
                .map_or(reward, |min| min.min(reward)),
        );
        debug!(
            min = self.min_observable_reward,
            max = self.max_observable_reward,
            "TD agent reward bounds"
        );
    }

    fn update_previous_decision(&mut self) -> KernelResult<()> {
        let discount = self.get_discount();
        let bounds = self.reward_bounds();
        let next = self.current_decision.as_ref().map(|current| {
            (
                current.exploit_q_value_prediction(),
                current.exploit_confidence(),
            )
        });
        let Some(previous) = self.previous_decision.as_mut() else {
            return Ok(());
        };
        let reward = previous.reward().ok_or(KernelError::MissingReward {
            step: previous.step(),
        })?;
        if previous.q_value_target().is_some() {
            return Err(KernelError::TargetAlreadySet {
                step: previous.step(),
            });
        }

        let (target, confidence) = td_target(reward, next, discount, self.stabilize, bounds);
        previous.set_target(target, confidence)
    }

    /// The rewarded decision's TD loss, rebuilt by the kernel when it trains
    /// the frame the decision was made on.
    ///
    /// Call after [`TDAgent::accept_reward`] and before the next
    /// [`TDAgent::choose_action`], then push the result onto the kernel's
    /// [`LossQueue`](crate::modules::LossQueue) before stepping it. The Q
    /// value is re-predicted from the trained frame's state, so the gradient
    /// flows into the kernel weights that produced that state. The target
    /// bootstraps from the successor frame's state, or from zero when
    /// `terminal` is set.
    pub fn state_loss(&self, terminal: bool) -> KernelResult<DeferredLoss> {
        let decision = self
            .previous_decision
            .as_ref()
            .ok_or(KernelError::NoPendingDecision)?;
        let reward = decision.reward().ok_or(KernelError::MissingReward {
            step: decision.step(),
        })?;
        if decision.q_value_target().is_some() {
            return Err(KernelError::TargetAlreadySet {
                step: decision.step(),
            });
        }
        let (action, _, _) = decision.require_selected()?;
        let step = decision.step();
        let discount = self.get_discount();
        let stabilize = self.stabilize;
        let bounds = self.reward_bounds();
        let model = self.q_model.share();

        let loss = move |previous: &StateFrame, current: &StateFrame| -> KernelResult<Option<Var>> {
            let state = previous.require_current_state("TD state loss")?;
            let next = if terminal {
                None
            } else {
                let next_state = current.require_current_state("TD bootstrap")?.detach();
                let (q_values, confidences) = model.predict(&next_state)?;
                let next = ActionDecision::new(next_state, step + 1, q_values, confidences, None)?;
                Some((next.exploit_q_value_prediction(), next.exploit_confidence()))
            };
            let (target, confidence) = td_target(reward, next, discount, stabilize, bounds);

            let (q_values, confidences) = model.predict(state)?;
            let mut replayed = ActionDecision::new(state.clone(), step, q_values, confidences, None)?;
            replayed.select(action)?;
            replayed.set_target(target, confidence)?;
            model.get_loss(&replayed).map(Some)
        };
        Ok(Box::new(loss))
    }

    fn close_previous_decision(&mut self) -> KernelResult<Option<Var>> {
        let closing = self.previous_decision.take();
        self.previous_decision = self.current_decision.take();
        let Some(mut decision) = closing else {
            return Ok(None);
        };

        let tape = decision.take_tape();
        let loss = self.policy.get_loss(&decision, self.q_model.as_ref())?;
        debug!(
            step = decision.step(),
            predicted = decision
                .selected_q_value_prediction()
                .and_then(|prediction| prediction.scalar().ok()),
            target = decision.q_value_target(),
            loss = loss.scalar().ok(),
            "TD agent closed decision"
        );

        if let Some(tape) = tape {
            let weights = self.trainable_weights();
            if let Some(optimizer) = self.optimizer.as_mut() {
                let mut grads = tape.gradient(&loss, &weights)?;
                if has_non_finite(&grads) {
                    return Err(KernelError::NonFinite {
                        context: "TD agent gradients".to_string(),
                    });
                }
                clip_by_global_norm(&mut grads, MAX_GRADIENT_NORM);
                let pairs: Vec<_> = grads.into_iter().zip(weights).collect();
                optimizer.apply_gradients(&pairs)?;
            }
            tape.close();
        }

        let mut record = decision.record();
        record.loss = loss.scalar().ok();
        self.last_closed = Some(record);
        Ok(Some(loss))
    }
}

/// TD(0) target and its confidence. `next` holds the successor's exploit
/// prediction and confidence; `None` ends the episode.
fn td_target(
    reward: f32,
    next: Option<(f32, f32)>,
    discount: f32,
    stabilize: bool,
    bounds: Option<(f32, f32)>,
) -> (f32, f32) {
    match next {
        Some((mut prediction, confidence)) if stabilize => {
            if let Some((min, max)) = bounds {
                prediction = prediction.max(min).min(max);
            }
            ((reward + discount * prediction) / (1.0 + discount), confidence)
        }
        Some((prediction, confidence)) => (reward + discount * prediction, confidence),
        None if stabilize => (reward / (1.0 + discount), 1.0),
        None => (reward, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::SGDOptimizer;
    use ndarray::{array, Array1};

    /// Q values fixed by the test, so targets are exact.
    #[derive(Clone)]
    struct FixedModel {
        q_values: Array1<f32>,
        confidences: Array1<f32>,
    }

    impl ProbabilisticModel for FixedModel {
        fn build(&mut self) -> KernelResult<()> {
            Ok(())
        }

        fn is_built(&self) -> bool {
            true
        }

        fn action_count(&self) -> usize {
            self.q_values.len()
        }

        fn trainable_weights(&self) -> Vec<Weight> {
            Vec::new()
        }

        fn predict(&self, _state_input: &Var) -> KernelResult<(Var, Var)> {
            Ok((
                Var::vector(self.q_values.clone()),
                Var::vector(self.confidences.clone()),
            ))
        }

        fn get_loss(&self, decision: &ActionDecision) -> KernelResult<Var> {
            let (_, prediction, _) = decision.require_selected()?;
            let (target, _) = decision.require_target()?;
            Ok(prediction.add_scalar(-target).square())
        }

        fn share(&self) -> Box<dyn ProbabilisticModel> {
            Box::new(self.clone())
        }
    }

    fn fixed_agent(prediction: f32, discount: f32, stabilize: bool) -> TDAgent {
        let model = FixedModel {
            q_values: array![prediction, prediction - 1.0],
            confidences: array![0.8, 0.3],
        };
        TDAgent::new(
            Box::new(model),
            Box::new(EpsilonGreedyPolicy::greedy(0)),
            discount,
            stabilize,
        )
    }

    fn state() -> Var {
        Var::vector(array![0.1, 0.2])
    }

    #[test]
    fn test_stabilized_target_clamps_prediction() {
        let mut agent = fixed_agent(2.0, 0.9, true);
        agent.choose_action(&state()).unwrap();
        assert!(agent.accept_reward(1.0).unwrap().is_none());
        agent.choose_action(&state()).unwrap();

        let previous = agent.previous_decision().unwrap();
        let target = previous.q_value_target().unwrap();
        assert!((target - 1.0).abs() < 1e-6);
        assert_eq!(previous.q_value_target_confidence(), Some(0.8));
    }

    #[test]
    fn test_unstabilized_target_bootstraps_raw_prediction() {
        let mut agent = fixed_agent(2.0, 0.5, false);
        agent.choose_action(&state()).unwrap();
        agent.accept_reward(1.0).unwrap();
        agent.choose_action(&state()).unwrap();
        let target = agent.previous_decision().unwrap().q_value_target().unwrap();
        assert!((target - 2.0).abs() < 1e-6);
        assert_eq!(agent.reward_bounds(), None);
    }

    #[test]
    fn test_reset_target_for_zero_reward_is_zero() {
        let mut agent = fixed_agent(3.0, 0.5, true);
        agent.choose_action(&state()).unwrap();
        agent.accept_reward(0.0).unwrap();
        let loss = agent.reset().unwrap().unwrap();

        let closed = agent.last_closed_decision().unwrap();
        assert_eq!(closed.q_value_target, Some(0.0));
        assert_eq!(closed.q_value_target_confidence, Some(1.0));
        assert!((loss.scalar().unwrap() - 9.0).abs() < 1e-5);
        assert_eq!(agent.episodes(), 1);
        assert_eq!(agent.reward_bounds(), Some((0.0, 0.0)));
    }

    #[test]
    fn test_second_choice_without_reward_fails() {
        let mut agent = fixed_agent(1.0, 0.9, true);
        agent.choose_action(&state()).unwrap();
        let err = agent.choose_action(&state()).unwrap_err();
        assert_eq!(err, KernelError::DecisionPending { step: 0 });
    }

    #[test]
    fn test_reward_without_decision_fails() {
        let mut agent = fixed_agent(1.0, 0.9, true);
        assert_eq!(agent.accept_reward(1.0).unwrap_err(), KernelError::NoPendingDecision);
        agent.choose_action(&state()).unwrap();
        assert!(agent.reset().is_err());
    }

    #[test]
    fn test_steps_count_and_loss_arrives_one_step_late() {
        let mut agent = fixed_agent(0.5, 0.9, true);
        agent.choose_action(&state()).unwrap();
        assert!(agent.accept_reward(0.2).unwrap().is_none());
        agent.choose_action(&state()).unwrap();
        assert!(agent.accept_reward(0.4).unwrap().is_some());
        assert_eq!(agent.total_steps(), 2);
        assert_eq!(agent.current_decision().map(ActionDecision::step), None);
        assert_eq!(agent.previous_decision().map(ActionDecision::step), Some(1));
        assert_eq!(agent.reward_bounds(), Some((0.2, 0.4)));
    }

    #[test]
    fn test_scheduled_discount_follows_episodes() {
        let mut agent = fixed_agent(0.0, 0.0, false);
        agent.discount = Discount::scheduled(|episodes, _| episodes as f32);
        assert_eq!(agent.get_discount(), 0.0);
        agent.reset().unwrap();
        assert_eq!(agent.get_discount(), 1.0);
    }

    #[test]
    fn test_optimizer_moves_network_toward_target() {
        let template = ModelTemplate::default();
        let config = AgentConfig {
            epsilon_start: 0.0,
            epsilon_end: 0.0,
            stabilize: false,
            ..AgentConfig::default()
        };
        let mut agent = TDAgent::from_config(&config, &template, 2, 2)
            .unwrap()
            .with_optimizer(Box::new(SGDOptimizer::new(0.1, 0.0, 0.0)));
        let before: Vec<_> = agent.trainable_weights().iter().map(Weight::value).collect();

        agent.choose_action(&state()).unwrap();
        agent.accept_reward(5.0).unwrap();
        agent.reset().unwrap();

        let after: Vec<_> = agent.trainable_weights().iter().map(Weight::value).collect();
        assert_ne!(before, after);
        assert!(agent.last_closed_decision().unwrap().loss.unwrap() > 0.0);
    }

    #[test]
    fn test_state_loss_requires_rewarded_decision() {
        let mut agent = fixed_agent(1.0, 0.5, false);
        assert!(matches!(
            agent.state_loss(false),
            Err(KernelError::NoPendingDecision)
        ));
        agent.choose_action(&state()).unwrap();
        assert!(agent.state_loss(false).is_err());
        agent.accept_reward(1.0).unwrap();
        assert!(agent.state_loss(false).is_ok());
        agent.choose_action(&state()).unwrap();
        assert_eq!(
            agent.state_loss(false).err(),
            Some(KernelError::TargetAlreadySet { step: 0 })
        );
    }

    #[test]
    fn test_targets_match_update_rules() {
        assert_eq!(td_target(1.0, Some((2.0, 0.8)), 0.5, false, None), (2.0, 0.8));
        let (clamped, _) = td_target(1.0, Some((2.0, 0.8)), 0.9, true, Some((0.0, 1.0)));
        assert!((clamped - 1.0).abs() < 1e-6);
        assert_eq!(td_target(3.0, None, 0.5, true, None), (2.0, 1.0));
        assert_eq!(td_target(3.0, None, 0.5, false, None), (3.0, 1.0));
    }
}
