//! In-place optimizers over [`Weight`]s.
//!
//! Per-weight state (velocities, moments) is keyed by [`WeightId`], so a
//! single optimizer can be shared by the kernel and every module.

use std::collections::HashMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::tensor::{Weight, WeightId};

/// Applies gradients to weights in place.
pub trait Optimizer {
    /// Updates each weight for which a gradient is present. `None` entries
    /// are skipped.
    fn apply_gradients(&mut self, grads_and_weights: &[(Option<ArrayD<f32>>, Weight)])
        -> KernelResult<()>;

    fn learning_rate(&self) -> f32;
}

fn check_shape(gradient: &ArrayD<f32>, weight: &Weight) -> KernelResult<()> {
    let shape = weight.shape();
    if gradient.shape() != shape.as_slice() {
        return Err(KernelError::shape(
            &shape,
            gradient.shape(),
            format!("gradient for weight '{}'", weight.name()),
        ));
    }
    Ok(())
}

/// Stochastic Gradient Descent optimizer with momentum.
///
/// Implements the update rule:
/// ```text
/// velocity = momentum * velocity + learning_rate * gradient
/// parameter = parameter - velocity
/// ```
#[derive(Debug, Clone)]
pub struct SGDOptimizer {
    /// Learning rate
    pub learning_rate: f32,
    /// Momentum coefficient (0.0 = no momentum, 0.9 = strong momentum)
    pub momentum: f32,
    /// Weight decay for L2 regularization
    pub weight_decay: f32,
    velocities: HashMap<WeightId, ArrayD<f32>>,
}

impl SGDOptimizer {
    /// Creates a new SGD optimizer.
    ///
    /// # Examples
    ///
    /// ```
    /// use cephalus_core::neural::SGDOptimizer;
    ///
    /// let optimizer = SGDOptimizer::new(0.01, 0.9, 0.0001);
    /// ```
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocities: HashMap::new(),
        }
    }

    fn step(&mut self, weight: &Weight, gradient: &ArrayD<f32>) {
        let (lr, momentum, decay) = (self.learning_rate, self.momentum, self.weight_decay);
        let velocity = self
            .velocities
            .entry(weight.id())
            .or_insert_with(|| ArrayD::zeros(gradient.raw_dim()));
        weight.update(|param| {
            let mut grad = gradient.clone();
            if decay > 0.0 {
                grad.scaled_add(decay, &*param);
            }
            velocity.mapv_inplace(|v| v * momentum);
            velocity.scaled_add(lr, &grad);
            *param -= &*velocity;
        });
    }
}

impl Optimizer for SGDOptimizer {
    fn apply_gradients(
        &mut self,
        grads_and_weights: &[(Option<ArrayD<f32>>, Weight)],
    ) -> KernelResult<()> {
        for (gradient, weight) in grads_and_weights {
            if let Some(gradient) = gradient {
                check_shape(gradient, weight)?;
                self.step(weight, gradient);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Adam optimizer (Adaptive Moment Estimation).
///
/// The time step advances once per `apply_gradients` call, not per weight.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    /// Learning rate
    pub learning_rate: f32,
    /// Exponential decay rate for first moment (typically 0.9)
    pub beta1: f32,
    /// Exponential decay rate for second moment (typically 0.999)
    pub beta2: f32,
    /// Small constant for numerical stability
    pub epsilon: f32,
    /// Weight decay
    pub weight_decay: f32,
    first_moments: HashMap<WeightId, ArrayD<f32>>,
    second_moments: HashMap<WeightId, ArrayD<f32>>,
    t: usize,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
            t: 0,
        }
    }

    pub fn iterations(&self) -> usize {
        self.t
    }

    fn step(&mut self, weight: &Weight, gradient: &ArrayD<f32>) {
        let (beta1, beta2, eps, lr, decay) = (
            self.beta1,
            self.beta2,
            self.epsilon,
            self.learning_rate,
            self.weight_decay,
        );
        let t = self.t as i32;
        let m = self
            .first_moments
            .entry(weight.id())
            .or_insert_with(|| ArrayD::zeros(gradient.raw_dim()));
        let v = self
            .second_moments
            .entry(weight.id())
            .or_insert_with(|| ArrayD::zeros(gradient.raw_dim()));

        weight.update(|param| {
            let mut grad = gradient.clone();
            if decay > 0.0 {
                grad.scaled_add(decay, &*param);
            }
            m.zip_mut_with(&grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            v.zip_mut_with(&grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            let m_correction = 1.0 - beta1.powi(t);
            let v_correction = 1.0 - beta2.powi(t);
            ndarray::Zip::from(param)
                .and(&*m)
                .and(&*v)
                .for_each(|p, &m, &v| {
                    let m_hat = m / m_correction;
                    let v_hat = v / v_correction;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        });
    }
}

impl Optimizer for AdamOptimizer {
    fn apply_gradients(
        &mut self,
        grads_and_weights: &[(Option<ArrayD<f32>>, Weight)],
    ) -> KernelResult<()> {
        for (gradient, weight) in grads_and_weights {
            if let Some(gradient) = gradient {
                check_shape(gradient, weight)?;
            }
        }
        if grads_and_weights.iter().all(|(gradient, _)| gradient.is_none()) {
            return Ok(());
        }
        self.t += 1;
        for (gradient, weight) in grads_and_weights {
            if let Some(gradient) = gradient {
                self.step(weight, gradient);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Serializable optimizer selection, as found in the `[kernel.optimizer]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        learning_rate: f32,
        #[serde(default)]
        momentum: f32,
        #[serde(default)]
        weight_decay: f32,
    },
    Adam {
        learning_rate: f32,
        #[serde(default)]
        weight_decay: f32,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            learning_rate: 0.001,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f32 {
        match self {
            OptimizerConfig::Sgd { learning_rate, .. } => *learning_rate,
            OptimizerConfig::Adam { learning_rate, .. } => *learning_rate,
        }
    }

    pub fn validate(&self) -> KernelResult<()> {
        let lr = self.learning_rate();
        if !(lr.is_finite() && lr > 0.0) {
            return Err(KernelError::InvalidParameter {
                parameter: "optimizer.learning_rate".to_string(),
                value: lr.to_string(),
                constraint: "finite and > 0".to_string(),
            });
        }
        if let OptimizerConfig::Sgd { momentum, .. } = self {
            if !(0.0..1.0).contains(momentum) {
                return Err(KernelError::InvalidParameter {
                    parameter: "optimizer.momentum".to_string(),
                    value: momentum.to_string(),
                    constraint: "in [0, 1)".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn Optimizer> {
        match *self {
            OptimizerConfig::Sgd {
                learning_rate,
                momentum,
                weight_decay,
            } => Box::new(SGDOptimizer::new(learning_rate, momentum, weight_decay)),
            OptimizerConfig::Adam {
                learning_rate,
                weight_decay,
            } => Box::new(AdamOptimizer::new(learning_rate, weight_decay)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sgd_optimizer() {
        let mut optimizer = SGDOptimizer::new(0.1, 0.0, 0.0);
        let w = Weight::new("w", array![1.0f32, 1.0].into_dyn());
        optimizer
            .apply_gradients(&[(Some(array![1.0f32, -2.0].into_dyn()), w.clone())])
            .unwrap();
        let value = w.value();
        assert!((value[[0]] - 0.9).abs() < 1e-6);
        assert!((value[[1]] - 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut optimizer = SGDOptimizer::new(1.0, 0.5, 0.0);
        let w = Weight::new("w", array![0.0f32].into_dyn());
        let grad = array![1.0f32].into_dyn();
        optimizer.apply_gradients(&[(Some(grad.clone()), w.clone())]).unwrap();
        optimizer.apply_gradients(&[(Some(grad), w.clone())]).unwrap();
        // velocities 1.0 then 1.5
        assert!((w.value()[[0]] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_gradients_are_skipped() {
        let mut optimizer = AdamOptimizer::new(0.01, 0.0);
        let w = Weight::new("w", array![1.0f32].into_dyn());
        optimizer.apply_gradients(&[(None, w.clone())]).unwrap();
        assert_eq!(optimizer.iterations(), 0);
        assert_eq!(w.value(), array![1.0f32].into_dyn());
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut optimizer = AdamOptimizer::new(0.01, 0.0);
        let a = Weight::new("a", array![1.0f32].into_dyn());
        let b = Weight::new("b", array![1.0f32].into_dyn());
        optimizer
            .apply_gradients(&[
                (Some(array![5.0f32].into_dyn()), a.clone()),
                (Some(array![-0.1f32].into_dyn()), b.clone()),
            ])
            .unwrap();
        assert_eq!(optimizer.iterations(), 1);
        assert!((a.value()[[0]] - 0.99).abs() < 1e-4);
        assert!((b.value()[[0]] - 1.01).abs() < 1e-4);
    }

    #[test]
    fn test_gradient_shape_is_checked() {
        let mut optimizer = SGDOptimizer::new(0.1, 0.0, 0.0);
        let w = Weight::zeros("w", 2);
        let err = optimizer
            .apply_gradients(&[(Some(array![1.0f32].into_dyn()), w)])
            .unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_config_builds_named_optimizer() {
        let config: OptimizerConfig =
            toml::from_str("kind = \"sgd\"\nlearning_rate = 0.05\nmomentum = 0.9").unwrap();
        assert_eq!(config.learning_rate(), 0.05);
        assert!(config.validate().is_ok());
        assert_eq!(config.build().learning_rate(), 0.05);
    }
}
