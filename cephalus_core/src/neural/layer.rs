//! Fully connected layers over [`Var`] vectors.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::KernelResult;
use crate::tensor::{Var, Weight};

/// Element-wise nonlinearity applied after a layer's affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Tanh,
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: &Var) -> Var {
        match self {
            Activation::Linear => x.clone(),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.relu(),
            Activation::Sigmoid => x.sigmoid(),
        }
    }
}

/// `activation(kernel · x + bias)`.
///
/// # Architecture
///
/// ```text
/// x [in] → kernel [out, in] · x → + bias [out] → activation → y [out]
/// ```
#[derive(Debug, Clone)]
pub struct Dense {
    pub kernel: Weight,
    pub bias: Weight,
    pub activation: Activation,
}

impl Dense {
    /// Creates a layer with Xavier-scaled uniform kernel and zero bias.
    pub fn new(
        name: &str,
        input_width: usize,
        output_width: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Self {
        let scale = (2.0 / input_width.max(1) as f32).sqrt();
        let kernel = Array2::from_shape_fn((output_width, input_width), |_| {
            (rng.gen::<f32>() - 0.5) * 2.0 * scale
        });
        Self {
            kernel: Weight::new(format!("{}/kernel", name), kernel.into_dyn()),
            bias: Weight::new(
                format!("{}/bias", name),
                Array1::<f32>::zeros(output_width).into_dyn(),
            ),
            activation,
        }
    }

    pub fn input_width(&self) -> usize {
        self.kernel.shape()[1]
    }

    pub fn output_width(&self) -> usize {
        self.kernel.shape()[0]
    }

    /// Forward pass. Weights are read onto the graph `input` lives on.
    pub fn forward(&self, input: &Var) -> KernelResult<Var> {
        let kernel = self.kernel.read_like(input);
        let bias = self.bias.read_like(input);
        let affine = kernel.matvec(input)?.add(&bias)?;
        Ok(self.activation.apply(&affine))
    }

    pub fn weights(&self) -> Vec<Weight> {
        vec![self.kernel.clone(), self.bias.clone()]
    }
}
