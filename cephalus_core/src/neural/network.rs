//! Dense networks cloned from a shared architecture template.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::neural::layer::{Activation, Dense};
use crate::tensor::{Var, Weight};

/// Architecture description that modules clone into fresh networks.
///
/// Every clone gets its own weights; only the shape of the network is
/// shared. Input and output widths are chosen by the cloning module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTemplate {
    /// Width of each hidden layer, in order
    pub hidden_widths: Vec<usize>,
    /// Activation after every hidden layer
    pub hidden_activation: Activation,
    /// Activation after the output layer
    pub output_activation: Activation,
}

impl Default for ModelTemplate {
    fn default() -> Self {
        Self {
            hidden_widths: vec![32],
            hidden_activation: Activation::Tanh,
            output_activation: Activation::Tanh,
        }
    }
}

impl ModelTemplate {
    /// A template without hidden layers.
    pub fn linear(output_activation: Activation) -> Self {
        Self {
            hidden_widths: Vec::new(),
            hidden_activation: Activation::Linear,
            output_activation,
        }
    }

    pub fn with_output_activation(&self, activation: Activation) -> Self {
        Self {
            output_activation: activation,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> KernelResult<()> {
        if let Some(index) = self.hidden_widths.iter().position(|&w| w == 0) {
            return Err(KernelError::InvalidParameter {
                parameter: format!("model_template.hidden_widths[{}]", index),
                value: "0".to_string(),
                constraint: "> 0".to_string(),
            });
        }
        Ok(())
    }

    /// Builds a network with fresh weights mapping `input_width` to `output_width`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cephalus_core::neural::ModelTemplate;
    ///
    /// let template = ModelTemplate::default();
    /// let network = template.clone_model("state_model", 6, 4, 42);
    /// assert_eq!(network.input_width(), 6);
    /// assert_eq!(network.output_width(), 4);
    /// ```
    pub fn clone_model(
        &self,
        name: &str,
        input_width: usize,
        output_width: usize,
        seed: u64,
    ) -> Network {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(self.hidden_widths.len() + 1);
        let mut width = input_width;
        for (index, &hidden) in self.hidden_widths.iter().enumerate() {
            layers.push(Dense::new(
                &format!("{}/hidden{}", name, index),
                width,
                hidden,
                self.hidden_activation,
                &mut rng,
            ));
            width = hidden;
        }
        layers.push(Dense::new(
            &format!("{}/output", name),
            width,
            output_width,
            self.output_activation,
            &mut rng,
        ));
        Network {
            layers,
            input_width,
            output_width,
        }
    }
}

/// A stack of [`Dense`] layers.
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Dense>,
    input_width: usize,
    output_width: usize,
}

impl Network {
    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    /// Forward pass through every layer.
    pub fn forward(&self, input: &Var) -> KernelResult<Var> {
        if input.shape() != [self.input_width] {
            return Err(KernelError::shape(
                &[self.input_width],
                input.shape(),
                "network input",
            ));
        }
        let mut activation = input.clone();
        for layer in &self.layers {
            activation = layer.forward(&activation)?;
        }
        Ok(activation)
    }

    /// All kernels and biases, layer by layer.
    pub fn weights(&self) -> Vec<Weight> {
        self.layers.iter().flat_map(Dense::weights).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn test_clone_model_shapes() {
        let template = ModelTemplate {
            hidden_widths: vec![5, 3],
            ..ModelTemplate::default()
        };
        let network = template.clone_model("net", 4, 2, 1);
        assert_eq!(network.layers().len(), 3);
        assert_eq!(network.weights().len(), 6);
        assert_eq!(network.layers()[1].input_width(), 5);
        let y = network.forward(&Var::vector(Array1::ones(4))).unwrap();
        assert_eq!(y.shape(), &[2]);
    }

    #[test]
    fn test_clones_are_independent() {
        let template = ModelTemplate::default();
        let a = template.clone_model("a", 3, 3, 9);
        let b = template.clone_model("b", 3, 3, 9);
        assert!(a
            .weights()
            .iter()
            .zip(b.weights().iter())
            .all(|(wa, wb)| wa.id() != wb.id()));
        assert_eq!(a.weights()[0].value(), b.weights()[0].value());
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let network = ModelTemplate::linear(Activation::Linear).clone_model("net", 3, 1, 0);
        let err = network.forward(&Var::vector(Array1::ones(2))).unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_zero_hidden_width_is_invalid() {
        let template = ModelTemplate {
            hidden_widths: vec![4, 0],
            ..ModelTemplate::default()
        };
        assert!(template.validate().is_err());
    }
}
