//! Trainable variables with stable identity.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{Array1, ArrayD};

use crate::error::{KernelError, KernelResult};
use crate::tensor::graph::Graph;
use crate::tensor::var::Var;

static NEXT_WEIGHT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`Weight`]. Optimizer slots are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightId(u64);

impl WeightId {
    fn next() -> Self {
        WeightId(NEXT_WEIGHT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A trainable variable.
///
/// Cloning a weight yields another handle to the same storage: the id, the
/// name and the value are shared, so an optimizer update through one handle
/// is visible through all of them.
#[derive(Clone)]
pub struct Weight {
    id: WeightId,
    name: Rc<str>,
    value: Rc<RefCell<ArrayD<f32>>>,
}

impl Weight {
    /// Creates a weight holding `value`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cephalus_core::tensor::Weight;
    /// use ndarray::ArrayD;
    ///
    /// let w = Weight::new("bias", ArrayD::zeros(vec![4]));
    /// assert_eq!(w.shape(), vec![4]);
    /// ```
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        let name: String = name.into();
        Self {
            id: WeightId::next(),
            name: Rc::from(name),
            value: Rc::new(RefCell::new(value)),
        }
    }

    /// Creates a 1-D weight of zeros.
    pub fn zeros(name: impl Into<String>, width: usize) -> Self {
        Self::new(name, Array1::<f32>::zeros(width).into_dyn())
    }

    pub fn id(&self) -> WeightId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Vec<usize> {
        self.value.borrow().shape().to_vec()
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> ArrayD<f32> {
        self.value.borrow().clone()
    }

    /// Replaces the value. The shape must not change.
    pub fn assign(&self, value: ArrayD<f32>) -> KernelResult<()> {
        let mut current = self.value.borrow_mut();
        if current.shape() != value.shape() {
            return Err(KernelError::shape(
                current.shape(),
                value.shape(),
                format!("assignment to weight '{}'", self.name),
            ));
        }
        *current = value;
        Ok(())
    }

    /// Applies `update` to the stored value in place.
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut ArrayD<f32>),
    {
        update(&mut self.value.borrow_mut());
    }

    /// Reads the weight onto `graph`. While a tape is open the read is
    /// recorded as a leaf tagged with this weight's id.
    pub fn read(&self, graph: &Graph) -> Var {
        graph.watch(self)
    }

    /// Reads the weight onto the graph `like` lives on, or as a plain constant.
    pub fn read_like(&self, like: &Var) -> Var {
        match like.graph() {
            Some(graph) => graph.watch(self),
            None => Var::constant(self.value()),
        }
    }

    pub fn same_as(&self, other: &Weight) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weight")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.shape())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_storage() {
        let w = Weight::zeros("w", 3);
        let alias = w.clone();
        alias.update(|v| v.fill(2.0));
        assert!(w.value().iter().all(|&x| x == 2.0));
        assert!(w.same_as(&alias));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Weight::zeros("a", 1);
        let b = Weight::zeros("a", 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_assign_rejects_reshape() {
        let w = Weight::zeros("w", 3);
        let err = w.assign(ArrayD::zeros(vec![4])).expect_err("shape change");
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }
}
