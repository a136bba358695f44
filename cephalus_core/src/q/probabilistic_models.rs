//! Q-value models that also estimate their own confidence.

use crate::error::{KernelError, KernelResult};
use crate::neural::{Activation, ModelTemplate, Network};
use crate::q::decision::ActionDecision;
use crate::tensor::{Var, Weight};

/// Maps a state input to per-action Q values and confidences in `[0, 1]`.
pub trait ProbabilisticModel {
    fn build(&mut self) -> KernelResult<()>;

    fn is_built(&self) -> bool;

    fn action_count(&self) -> usize;

    fn trainable_weights(&self) -> Vec<Weight>;

    /// Returns `(q_values, confidences)`, both of width `action_count`.
    fn predict(&self, state_input: &Var) -> KernelResult<(Var, Var)>;

    /// Loss for a decision whose target is known.
    fn get_loss(&self, decision: &ActionDecision) -> KernelResult<Var>;

    /// Another handle onto the same weights.
    fn share(&self) -> Box<dyn ProbabilisticModel>;
}

/// A template-cloned network whose output holds the Q values followed by
/// confidence logits. Clones share the network's weights.
#[derive(Debug, Clone)]
pub struct NetworkQModel {
    template: ModelTemplate,
    state_width: usize,
    action_count: usize,
    seed: u64,
    network: Option<Network>,
}

impl NetworkQModel {
    pub fn new(template: ModelTemplate, state_width: usize, action_count: usize, seed: u64) -> Self {
        Self {
            template,
            state_width,
            action_count,
            seed,
            network: None,
        }
    }

    pub fn state_width(&self) -> usize {
        self.state_width
    }

    fn network(&self) -> KernelResult<&Network> {
        self.network.as_ref().ok_or(KernelError::NotBuilt {
            component: "q_model",
        })
    }
}

impl ProbabilisticModel for NetworkQModel {
    fn build(&mut self) -> KernelResult<()> {
        if self.network.is_some() {
            return Ok(());
        }
        if self.state_width == 0 || self.action_count == 0 {
            return Err(KernelError::InvalidParameter {
                parameter: "q_model".to_string(),
                value: format!("{}x{}", self.state_width, self.action_count),
                constraint: "non-zero state width and action count".to_string(),
            });
        }
        self.template.validate()?;
        let template = self.template.with_output_activation(Activation::Linear);
        self.network = Some(template.clone_model(
            "q_model",
            self.state_width,
            2 * self.action_count,
            self.seed,
        ));
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.network.is_some()
    }

    fn action_count(&self) -> usize {
        self.action_count
    }

    fn trainable_weights(&self) -> Vec<Weight> {
        self.network
            .as_ref()
            .map(Network::weights)
            .unwrap_or_default()
    }

    fn predict(&self, state_input: &Var) -> KernelResult<(Var, Var)> {
        let output = self.network()?.forward(state_input)?;
        let q_values = output.slice(0, self.action_count)?;
        let confidences = output
            .slice(self.action_count, 2 * self.action_count)?
            .sigmoid();
        Ok((q_values, confidences))
    }

    /// `tc * (q - t)^2 + (c - exp(-(q - t)^2))^2`, the confidence target
    /// taken as a constant.
    fn get_loss(&self, decision: &ActionDecision) -> KernelResult<Var> {
        let (_, prediction, confidence) = decision.require_selected()?;
        let (target, target_confidence) = decision.require_target()?;

        let squared_error = prediction.add_scalar(-target).square();
        let confidence_target = squared_error.neg().exp().detach();
        let confidence_error = confidence.sub(&confidence_target)?.square();
        squared_error.scale(target_confidence).add(&confidence_error)
    }

    fn share(&self) -> Box<dyn ProbabilisticModel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Graph;
    use ndarray::Array1;

    fn model() -> NetworkQModel {
        let mut model = NetworkQModel::new(ModelTemplate::default(), 4, 3, 11);
        model.build().unwrap();
        model
    }

    #[test]
    fn test_predict_before_build_fails() {
        let model = NetworkQModel::new(ModelTemplate::default(), 4, 3, 11);
        let err = model.predict(&Var::vector(Array1::zeros(4))).unwrap_err();
        assert_eq!(err, KernelError::NotBuilt { component: "q_model" });
    }

    #[test]
    fn test_predict_shapes_and_confidence_range() {
        let model = model();
        let (q, c) = model.predict(&Var::vector(Array1::from_elem(4, 0.5))).unwrap();
        assert_eq!(q.shape(), &[3]);
        assert_eq!(c.shape(), &[3]);
        assert!(c.value().iter().all(|&v| v > 0.0 && v < 1.0));
    }

    #[test]
    fn test_loss_is_zero_error_plus_confidence_gap() {
        let model = model();
        let graph = Graph::new();
        let tape = graph.open_tape(&model.trainable_weights());
        let input = graph.vector(Array1::from_elem(4, 0.2));
        let (q, c) = model.predict(&input).unwrap();
        let mut decision = ActionDecision::new(input, 0, q.clone(), c.clone(), None).unwrap();
        decision.select(1).unwrap();
        let prediction = q.value()[[1]];
        decision.set_target(prediction, 1.0).unwrap();

        let loss = model.get_loss(&decision).unwrap();
        let confidence = c.value()[[1]];
        let expected = (confidence - 1.0).powi(2);
        assert!((loss.scalar().unwrap() - expected).abs() < 1e-5);

        let grads = tape.gradient(&loss, &model.trainable_weights()).unwrap();
        assert!(grads.iter().any(Option::is_some));
    }

    #[test]
    fn test_shared_handle_sees_weight_updates() {
        let model = model();
        let shared = model.share();
        let input = Var::vector(Array1::from_elem(4, 0.3));
        for weight in model.trainable_weights() {
            weight.assign(weight.value().mapv(|v| v + 0.5)).unwrap();
        }
        let (q, _) = model.predict(&input).unwrap();
        let (shared_q, _) = shared.predict(&input).unwrap();
        assert_eq!(q.value(), shared_q.value());
    }
}
