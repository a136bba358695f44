//! One TD decision: what was predicted, what was chosen, what it earned.

use std::fmt;

use serde::Serialize;

use crate::error::{KernelError, KernelResult};
use crate::tensor::{GradientTape, Var};

/// A decision made by a [`TDAgent`](super::TDAgent).
///
/// Created by `choose_action`, given a reward by `accept_reward`, given a TD
/// target once the following decision (or a reset) is known, and closed
/// when it is superseded. The decision's own tape records the Q-model's
/// forward pass so the loss can still be differentiated when it is closed.
pub struct ActionDecision {
    state_input: Var,
    step: u64,
    q_value_predictions: Var,
    confidences: Var,
    exploit_action: usize,
    exploit_q_value_prediction: f32,
    exploit_confidence: f32,
    selected_action: Option<usize>,
    selected_q_value_prediction: Option<Var>,
    selected_confidence: Option<Var>,
    reward: Option<f32>,
    q_value_target: Option<f32>,
    q_value_target_confidence: Option<f32>,
    tape: Option<GradientTape>,
}

impl ActionDecision {
    /// Builds a decision from the model's per-action predictions and
    /// confidences. The exploit action is the argmax of the predictions.
    pub fn new(
        state_input: Var,
        step: u64,
        q_value_predictions: Var,
        confidences: Var,
        tape: Option<GradientTape>,
    ) -> KernelResult<Self> {
        let predictions = q_value_predictions.to_array1()?;
        let confidence_values = confidences.to_array1()?;
        if predictions.is_empty() || predictions.len() != confidence_values.len() {
            return Err(KernelError::shape(
                &[predictions.len()],
                &[confidence_values.len()],
                "decision confidences",
            ));
        }
        let (exploit_action, exploit_q_value_prediction) = predictions
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (index, value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            });
        Ok(Self {
            state_input,
            step,
            exploit_confidence: confidence_values[exploit_action],
            q_value_predictions,
            confidences,
            exploit_action,
            exploit_q_value_prediction,
            selected_action: None,
            selected_q_value_prediction: None,
            selected_confidence: None,
            reward: None,
            q_value_target: None,
            q_value_target_confidence: None,
            tape,
        })
    }

    pub fn state_input(&self) -> &Var {
        &self.state_input
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn action_count(&self) -> usize {
        self.q_value_predictions.len()
    }

    pub fn q_value_predictions(&self) -> &Var {
        &self.q_value_predictions
    }

    pub fn confidences(&self) -> &Var {
        &self.confidences
    }

    pub fn exploit_action(&self) -> usize {
        self.exploit_action
    }

    pub fn exploit_q_value_prediction(&self) -> f32 {
        self.exploit_q_value_prediction
    }

    pub fn exploit_confidence(&self) -> f32 {
        self.exploit_confidence
    }

    pub fn selected_action(&self) -> Option<usize> {
        self.selected_action
    }

    pub fn selected_q_value_prediction(&self) -> Option<&Var> {
        self.selected_q_value_prediction.as_ref()
    }

    pub fn selected_confidence(&self) -> Option<&Var> {
        self.selected_confidence.as_ref()
    }

    pub fn reward(&self) -> Option<f32> {
        self.reward
    }

    pub fn q_value_target(&self) -> Option<f32> {
        self.q_value_target
    }

    pub fn q_value_target_confidence(&self) -> Option<f32> {
        self.q_value_target_confidence
    }

    pub fn tape(&self) -> Option<&GradientTape> {
        self.tape.as_ref()
    }

    /// Records the chosen action. A decision selects exactly once.
    pub fn select(&mut self, action: usize) -> KernelResult<()> {
        if self.selected_action.is_some() {
            return Err(KernelError::InvalidFrameState {
                details: format!("decision {} already selected an action", self.step),
            });
        }
        if action >= self.action_count() {
            return Err(KernelError::InvalidParameter {
                parameter: "action".to_string(),
                value: action.to_string(),
                constraint: format!("below {}", self.action_count()),
            });
        }
        self.selected_q_value_prediction = Some(self.q_value_predictions.index(action)?);
        self.selected_confidence = Some(self.confidences.index(action)?);
        self.selected_action = Some(action);
        Ok(())
    }

    pub(crate) fn set_reward(&mut self, reward: f32) -> KernelResult<()> {
        if self.reward.is_some() {
            return Err(KernelError::RewardAlreadyAccepted { step: self.step });
        }
        self.reward = Some(reward);
        Ok(())
    }

    pub(crate) fn set_target(&mut self, target: f32, confidence: f32) -> KernelResult<()> {
        if self.q_value_target.is_some() {
            return Err(KernelError::TargetAlreadySet { step: self.step });
        }
        self.q_value_target = Some(target);
        self.q_value_target_confidence = Some(confidence);
        Ok(())
    }

    /// The action, or an error if the policy never selected one.
    pub fn require_selected(&self) -> KernelResult<(usize, &Var, &Var)> {
        match (
            self.selected_action,
            self.selected_q_value_prediction.as_ref(),
            self.selected_confidence.as_ref(),
        ) {
            (Some(action), Some(prediction), Some(confidence)) => {
                Ok((action, prediction, confidence))
            }
            _ => Err(KernelError::InvalidFrameState {
                details: format!("decision {} has no selected action", self.step),
            }),
        }
    }

    /// The TD target and its confidence, or an error if not yet computed.
    pub fn require_target(&self) -> KernelResult<(f32, f32)> {
        match (self.q_value_target, self.q_value_target_confidence) {
            (Some(target), Some(confidence)) => Ok((target, confidence)),
            _ => Err(KernelError::InvalidFrameState {
                details: format!("decision {} has no TD target", self.step),
            }),
        }
    }

    pub(crate) fn take_tape(&mut self) -> Option<GradientTape> {
        self.tape.take()
    }

    /// Plain summary of the decision.
    pub fn record(&self) -> DecisionRecord {
        DecisionRecord {
            step: self.step,
            selected_action: self.selected_action,
            exploit_action: self.exploit_action,
            selected_q_value_prediction: self
                .selected_q_value_prediction
                .as_ref()
                .and_then(|prediction| prediction.scalar().ok()),
            exploit_q_value_prediction: self.exploit_q_value_prediction,
            exploit_confidence: self.exploit_confidence,
            reward: self.reward,
            q_value_target: self.q_value_target,
            q_value_target_confidence: self.q_value_target_confidence,
            loss: None,
        }
    }
}

impl fmt::Debug for ActionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDecision")
            .field("step", &self.step)
            .field("selected_action", &self.selected_action)
            .field("exploit_action", &self.exploit_action)
            .field("reward", &self.reward)
            .field("q_value_target", &self.q_value_target)
            .finish()
    }
}

/// Serializable summary of a decision, as logged once it closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub step: u64,
    pub selected_action: Option<usize>,
    pub exploit_action: usize,
    pub selected_q_value_prediction: Option<f32>,
    pub exploit_q_value_prediction: f32,
    pub exploit_confidence: f32,
    pub reward: Option<f32>,
    pub q_value_target: Option<f32>,
    pub q_value_target_confidence: Option<f32>,
    pub loss: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn decision() -> ActionDecision {
        ActionDecision::new(
            Var::vector(array![0.0]),
            4,
            Var::vector(array![0.1, 0.7, 0.3]),
            Var::vector(array![0.5, 0.9, 0.2]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_exploit_is_argmax() {
        let decision = decision();
        assert_eq!(decision.exploit_action(), 1);
        assert_eq!(decision.exploit_q_value_prediction(), 0.7);
        assert_eq!(decision.exploit_confidence(), 0.9);
    }

    #[test]
    fn test_select_once_within_range() {
        let mut decision = decision();
        assert!(decision.select(3).is_err());
        decision.select(2).unwrap();
        let (action, prediction, _) = decision.require_selected().unwrap();
        assert_eq!(action, 2);
        assert!((prediction.scalar().unwrap() - 0.3).abs() < 1e-6);
        assert!(decision.select(0).is_err());
    }

    #[test]
    fn test_reward_and_target_set_once() {
        let mut decision = decision();
        decision.set_reward(1.0).unwrap();
        assert!(matches!(
            decision.set_reward(2.0),
            Err(KernelError::RewardAlreadyAccepted { step: 4 })
        ));
        decision.set_target(0.5, 0.9).unwrap();
        assert!(decision.set_target(0.1, 1.0).is_err());
        assert_eq!(decision.record().q_value_target, Some(0.5));
    }
}
