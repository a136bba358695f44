//! Differentiable values and the operations defined on them.
//!
//! Each operation computes its forward value eagerly and, when its inputs are
//! tracked on a [`Graph`], records a backward function mapping the output
//! gradient to the input gradients.

use std::fmt;
use std::rc::Rc;

use ndarray::{arr0, s, Array1, Array2, ArrayD, Axis, Ix2};

use crate::error::{KernelError, KernelResult};
use crate::tensor::graph::{Graph, NodeId};

/// An immutable tensor value, optionally tracked on a graph.
#[derive(Clone)]
pub struct Var {
    value: Rc<ArrayD<f32>>,
    node: Option<NodeId>,
    graph: Option<Graph>,
}

impl Var {
    pub(crate) fn from_parts(
        value: Rc<ArrayD<f32>>,
        node: Option<NodeId>,
        graph: Option<Graph>,
    ) -> Self {
        Self { value, node, graph }
    }

    /// A constant attached to no graph.
    pub fn constant(value: ArrayD<f32>) -> Self {
        Self::from_parts(Rc::new(value), None, None)
    }

    pub fn scalar_constant(value: f32) -> Self {
        Self::constant(arr0(value).into_dyn())
    }

    pub fn vector(values: Array1<f32>) -> Self {
        Self::constant(values.into_dyn())
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    pub(crate) fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// True when gradients can flow through this value.
    pub fn is_tracked(&self) -> bool {
        self.node.is_some()
    }

    pub fn has_non_finite(&self) -> bool {
        self.value.iter().any(|v| !v.is_finite())
    }

    pub fn has_nan(&self) -> bool {
        self.value.iter().any(|v| v.is_nan())
    }

    /// The value of a rank-0 tensor.
    pub fn scalar(&self) -> KernelResult<f32> {
        if self.value.ndim() != 0 {
            return Err(KernelError::shape(&[], self.shape(), "scalar read"));
        }
        Ok(self.value.iter().copied().next().unwrap_or(0.0))
    }

    /// The value of a rank-1 tensor.
    pub fn to_array1(&self) -> KernelResult<Array1<f32>> {
        if self.value.ndim() != 1 {
            return Err(KernelError::shape(&[self.len()], self.shape(), "vector read"));
        }
        Ok(self.value.iter().copied().collect())
    }

    /// Same value, cut off from gradient flow but still on the same graph.
    pub fn detach(&self) -> Var {
        Self::from_parts(Rc::clone(&self.value), None, self.graph.clone())
    }

    fn unary<F>(&self, value: ArrayD<f32>, backward: F) -> Var
    where
        F: Fn(&ArrayD<f32>) -> ArrayD<f32> + 'static,
    {
        match &self.graph {
            Some(graph) => graph.record(
                value,
                vec![self.node],
                Box::new(move |grad| vec![backward(grad)]),
            ),
            None => Var::constant(value),
        }
    }

    fn nary<F>(inputs: &[&Var], value: ArrayD<f32>, backward: F, context: &str) -> KernelResult<Var>
    where
        F: Fn(&ArrayD<f32>) -> Vec<ArrayD<f32>> + 'static,
    {
        let graph = shared_graph(inputs, context)?;
        Ok(match graph {
            Some(graph) => graph.record(
                value,
                inputs.iter().map(|input| input.node).collect(),
                Box::new(backward),
            ),
            None => Var::constant(value),
        })
    }

    fn require_same_shape(&self, other: &Var, context: &str) -> KernelResult<()> {
        if self.shape() != other.shape() {
            return Err(KernelError::shape(self.shape(), other.shape(), context));
        }
        Ok(())
    }

    fn require_rank(&self, rank: usize, context: &str) -> KernelResult<()> {
        if self.value.ndim() != rank {
            let expected = vec![self.len(); rank];
            return Err(KernelError::shape(&expected, self.shape(), context));
        }
        Ok(())
    }

    pub fn add(&self, other: &Var) -> KernelResult<Var> {
        self.require_same_shape(other, "add")?;
        let value = &*self.value + &*other.value;
        Self::nary(&[self, other], value, |g| vec![g.clone(), g.clone()], "add")
    }

    pub fn sub(&self, other: &Var) -> KernelResult<Var> {
        self.require_same_shape(other, "sub")?;
        let value = &*self.value - &*other.value;
        Self::nary(
            &[self, other],
            value,
            |g| vec![g.clone(), g.mapv(|x| -x)],
            "sub",
        )
    }

    /// Element-wise product.
    pub fn mul(&self, other: &Var) -> KernelResult<Var> {
        self.require_same_shape(other, "mul")?;
        let a = Rc::clone(&self.value);
        let b = Rc::clone(&other.value);
        let value = &*a * &*b;
        Self::nary(
            &[self, other],
            value,
            move |g| vec![g * &*b, g * &*a],
            "mul",
        )
    }

    pub fn neg(&self) -> Var {
        self.unary(self.value.mapv(|x| -x), |g| g.mapv(|x| -x))
    }

    pub fn scale(&self, factor: f32) -> Var {
        self.unary(&*self.value * factor, move |g| g * factor)
    }

    pub fn add_scalar(&self, offset: f32) -> Var {
        self.unary(&*self.value + offset, |g| g.clone())
    }

    pub fn square(&self) -> Var {
        let x = Rc::clone(&self.value);
        self.unary(x.mapv(|v| v * v), move |g| g * &*x * 2.0)
    }

    pub fn exp(&self) -> Var {
        let y = Rc::new(self.value.mapv(f32::exp));
        let out = (*y).clone();
        self.unary(out, move |g| g * &*y)
    }

    pub fn tanh(&self) -> Var {
        let y = Rc::new(self.value.mapv(f32::tanh));
        let out = (*y).clone();
        self.unary(out, move |g| g * &y.mapv(|v| 1.0 - v * v))
    }

    pub fn sigmoid(&self) -> Var {
        let y = Rc::new(self.value.mapv(|v| 1.0 / (1.0 + (-v).exp())));
        let out = (*y).clone();
        self.unary(out, move |g| g * &y.mapv(|v| v * (1.0 - v)))
    }

    pub fn relu(&self) -> Var {
        let x = Rc::clone(&self.value);
        self.unary(self.value.mapv(|v| v.max(0.0)), move |g| {
            g * &x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
        })
    }

    /// Clamps every element to `[min, max]`. Gradient passes where the input
    /// was inside the range.
    pub fn clamp(&self, min: f32, max: f32) -> Var {
        let x = Rc::clone(&self.value);
        self.unary(self.value.mapv(|v| v.clamp(min, max)), move |g| {
            g * &x.mapv(|v| if v >= min && v <= max { 1.0 } else { 0.0 })
        })
    }

    pub fn sum(&self) -> Var {
        let dim = self.value.raw_dim();
        self.unary(arr0(self.value.sum()).into_dyn(), move |g| {
            ArrayD::from_elem(dim.clone(), g.sum())
        })
    }

    pub fn mean(&self) -> Var {
        let dim = self.value.raw_dim();
        let n = self.len().max(1) as f32;
        self.unary(arr0(self.value.sum() / n).into_dyn(), move |g| {
            ArrayD::from_elem(dim.clone(), g.sum() / n)
        })
    }

    /// Inner product of two vectors.
    pub fn dot(&self, other: &Var) -> KernelResult<Var> {
        self.require_rank(1, "dot")?;
        self.require_same_shape(other, "dot")?;
        let a = Rc::clone(&self.value);
        let b = Rc::clone(&other.value);
        let value = arr0((&*a * &*b).sum()).into_dyn();
        Self::nary(
            &[self, other],
            value,
            move |g| {
                let g = g.sum();
                vec![&*b * g, &*a * g]
            },
            "dot",
        )
    }

    /// Matrix-vector product `self · x` with `self` shaped `[m, n]` and `x` shaped `[n]`.
    pub fn matvec(&self, x: &Var) -> KernelResult<Var> {
        let w: Array2<f32> = self
            .value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| KernelError::shape(&[0, x.len()], self.shape(), "matvec weight"))?
            .to_owned();
        x.require_rank(1, "matvec input")?;
        let (rows, cols) = w.dim();
        if cols != x.len() {
            return Err(KernelError::shape(&[cols], x.shape(), "matvec input"));
        }
        let xv: Array1<f32> = x.value.iter().copied().collect();
        let value = w.dot(&xv).into_dyn();
        Self::nary(
            &[self, x],
            value,
            move |g| {
                let g1: Array1<f32> = g.iter().copied().collect();
                let grad_w = g1
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&xv.view().insert_axis(Axis(0)));
                let grad_x = w.t().dot(&g1);
                debug_assert_eq!(grad_w.dim(), (rows, cols));
                vec![grad_w.into_dyn(), grad_x.into_dyn()]
            },
            "matvec",
        )
    }

    /// Concatenates vectors end to end.
    pub fn concat(parts: &[Var]) -> KernelResult<Var> {
        if parts.is_empty() {
            return Err(KernelError::InvalidParameter {
                parameter: "parts".to_string(),
                value: "0".to_string(),
                constraint: "at least one vector to concatenate".to_string(),
            });
        }
        for part in parts {
            part.require_rank(1, "concat")?;
        }
        let lengths: Vec<usize> = parts.iter().map(Var::len).collect();
        let data: Array1<f32> = parts
            .iter()
            .flat_map(|part| part.value.iter().copied())
            .collect();
        let refs: Vec<&Var> = parts.iter().collect();
        Self::nary(
            &refs,
            data.into_dyn(),
            move |g| {
                let flat: Vec<f32> = g.iter().copied().collect();
                let mut offset = 0;
                lengths
                    .iter()
                    .map(|&len| {
                        let piece = Array1::from(flat[offset..offset + len].to_vec());
                        offset += len;
                        piece.into_dyn()
                    })
                    .collect()
            },
            "concat",
        )
    }

    /// Stacks scalars into a vector.
    pub fn stack(scalars: &[Var]) -> KernelResult<Var> {
        for scalar in scalars {
            scalar.require_rank(0, "stack")?;
        }
        let data: Array1<f32> = scalars
            .iter()
            .map(|scalar| scalar.value.sum())
            .collect();
        let refs: Vec<&Var> = scalars.iter().collect();
        Self::nary(
            &refs,
            data.into_dyn(),
            |g| g.iter().map(|&x| arr0(x).into_dyn()).collect(),
            "stack",
        )
    }

    /// Sum of equally shaped values.
    pub fn add_n(values: &[Var]) -> KernelResult<Var> {
        let (first, rest) = values.split_first().ok_or_else(|| KernelError::InvalidParameter {
            parameter: "values".to_string(),
            value: "0".to_string(),
            constraint: "at least one value to add".to_string(),
        })?;
        rest.iter().try_fold(first.clone(), |acc, value| acc.add(value))
    }

    /// Elements `start..end` of a vector.
    pub fn slice(&self, start: usize, end: usize) -> KernelResult<Var> {
        self.require_rank(1, "slice")?;
        let len = self.len();
        if start > end || end > len {
            return Err(KernelError::InvalidParameter {
                parameter: "slice".to_string(),
                value: format!("{}..{}", start, end),
                constraint: format!("range within 0..{}", len),
            });
        }
        let value: Array1<f32> = self
            .value
            .iter()
            .skip(start)
            .take(end - start)
            .copied()
            .collect();
        Ok(self.unary(value.into_dyn(), move |g| {
            let mut grad = Array1::<f32>::zeros(len);
            grad.slice_mut(s![start..end])
                .iter_mut()
                .zip(g.iter())
                .for_each(|(slot, &v)| *slot = v);
            grad.into_dyn()
        }))
    }

    /// Element `index` of a vector as a scalar.
    pub fn index(&self, index: usize) -> KernelResult<Var> {
        self.require_rank(1, "index")?;
        let len = self.len();
        let value = *self.value.iter().nth(index).ok_or_else(|| {
            KernelError::InvalidParameter {
                parameter: "index".to_string(),
                value: index.to_string(),
                constraint: format!("index below {}", len),
            }
        })?;
        Ok(self.unary(arr0(value).into_dyn(), move |g| {
            let mut grad = Array1::<f32>::zeros(len);
            grad[index] = g.sum();
            grad.into_dyn()
        }))
    }

    /// Scales the vector `other` by this scalar.
    pub fn mul_scalar(&self, other: &Var) -> KernelResult<Var> {
        self.require_rank(0, "mul_scalar factor")?;
        let s = self.value.sum();
        let v = Rc::clone(&other.value);
        let value = &*v * s;
        Self::nary(
            &[self, other],
            value,
            move |g| vec![arr0((g * &*v).sum()).into_dyn(), g * s],
            "mul_scalar",
        )
    }

    /// Softmax over a vector.
    pub fn softmax(&self) -> KernelResult<Var> {
        self.require_rank(1, "softmax")?;
        let max = self
            .value
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let exp = self.value.mapv(|v| (v - max).exp());
        let total = exp.sum();
        let y = Rc::new(exp / total);
        let out = (*y).clone();
        Ok(self.unary(out, move |g| {
            let weighted = (g * &*y).sum();
            &*y * &(g - weighted)
        }))
    }
}

fn shared_graph(inputs: &[&Var], context: &str) -> KernelResult<Option<Graph>> {
    let mut found: Option<&Graph> = None;
    for input in inputs {
        if let Some(graph) = input.graph.as_ref() {
            match found {
                Some(existing) if !existing.ptr_eq(graph) => {
                    return Err(KernelError::GraphMismatch {
                        context: context.to_string(),
                    })
                }
                Some(_) => {}
                None => found = Some(graph),
            }
        }
    }
    Ok(found.cloned())
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("shape", &self.shape())
            .field("tracked", &self.node.is_some())
            .field("value", &*self.value)
            .finish()
    }
}
