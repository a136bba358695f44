//! Recording graph and gradient tapes.
//!
//! A [`Graph`] is an arena of recorded operations shared by everything that
//! takes part in one kernel. Operations are recorded only while at least one
//! [`GradientTape`] is open. A tape sees every node recorded after it was
//! opened; nodes older than it are constants from its point of view. When a
//! tape is released, nodes older than the oldest tape still open are pruned,
//! so memory stays bounded by the span of the open tapes.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use ndarray::{Array1, ArrayD};

use crate::error::{KernelError, KernelResult};
use crate::tensor::var::Var;
use crate::tensor::weight::{Weight, WeightId};

pub(crate) type NodeId = u64;

/// Maps the gradient of a node's output to the gradients of its inputs, in input order.
pub(crate) type BackwardFn = Box<dyn Fn(&ArrayD<f32>) -> Vec<ArrayD<f32>>>;

struct Node {
    parents: Vec<Option<NodeId>>,
    backward: Option<BackwardFn>,
    weight: Option<WeightId>,
}

#[derive(Default)]
struct GraphInner {
    /// Id of `nodes.front()`.
    base: NodeId,
    nodes: VecDeque<Node>,
    /// Start node of every open tape, with multiplicity.
    open_tapes: BTreeMap<NodeId, usize>,
}

impl GraphInner {
    fn next_id(&self) -> NodeId {
        self.base + self.nodes.len() as NodeId
    }

    fn is_live(&self, id: NodeId) -> bool {
        id >= self.base && id < self.next_id()
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        if self.is_live(id) {
            self.nodes.get((id - self.base) as usize)
        } else {
            None
        }
    }

    fn prune(&mut self) {
        let keep_from = self
            .open_tapes
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.next_id());
        while self.base < keep_from && !self.nodes.is_empty() {
            self.nodes.pop_front();
            self.base += 1;
        }
        if self.nodes.is_empty() {
            self.base = keep_from;
        }
    }
}

/// Shared handle to a recording arena. Clones refer to the same arena.
#[derive(Clone, Default)]
pub struct Graph {
    inner: Rc<RefCell<GraphInner>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while at least one tape is open.
    pub fn is_recording(&self) -> bool {
        !self.inner.borrow().open_tapes.is_empty()
    }

    /// Number of nodes currently held by the arena.
    pub fn live_nodes(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    pub fn open_tapes(&self) -> usize {
        self.inner.borrow().open_tapes.values().sum()
    }

    pub fn ptr_eq(&self, other: &Graph) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Opens a tape that records from now on and reports gradients for the
    /// `watched` weights.
    pub fn open_tape(&self, watched: &[Weight]) -> GradientTape {
        let start = {
            let mut inner = self.inner.borrow_mut();
            let start = inner.next_id();
            *inner.open_tapes.entry(start).or_insert(0) += 1;
            start
        };
        GradientTape {
            graph: self.clone(),
            start,
            watched: watched.iter().map(Weight::id).collect(),
            open: true,
        }
    }

    /// A constant living on this graph. Operations with it are recorded, but
    /// no gradient flows into it.
    pub fn constant(&self, value: ArrayD<f32>) -> Var {
        Var::from_parts(Rc::new(value), None, Some(self.clone()))
    }

    pub fn vector(&self, values: Array1<f32>) -> Var {
        self.constant(values.into_dyn())
    }

    pub(crate) fn watch(&self, weight: &Weight) -> Var {
        let value = Rc::new(weight.value());
        let mut inner = self.inner.borrow_mut();
        if inner.open_tapes.is_empty() {
            drop(inner);
            return Var::from_parts(value, None, Some(self.clone()));
        }
        let id = inner.next_id();
        inner.nodes.push_back(Node {
            parents: Vec::new(),
            backward: None,
            weight: Some(weight.id()),
        });
        drop(inner);
        Var::from_parts(value, Some(id), Some(self.clone()))
    }

    /// Records an operation. Falls back to a constant when nothing is being
    /// recorded or none of the inputs is still live.
    pub(crate) fn record(
        &self,
        value: ArrayD<f32>,
        parents: Vec<Option<NodeId>>,
        backward: BackwardFn,
    ) -> Var {
        let value = Rc::new(value);
        let mut inner = self.inner.borrow_mut();
        let tracked = !inner.open_tapes.is_empty()
            && parents.iter().flatten().any(|&parent| inner.is_live(parent));
        if !tracked {
            drop(inner);
            return Var::from_parts(value, None, Some(self.clone()));
        }
        let id = inner.next_id();
        inner.nodes.push_back(Node {
            parents,
            backward: Some(backward),
            weight: None,
        });
        drop(inner);
        Var::from_parts(value, Some(id), Some(self.clone()))
    }

    fn release(&self, start: NodeId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(count) = inner.open_tapes.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                inner.open_tapes.remove(&start);
            }
        }
        inner.prune();
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Graph")
            .field("base", &inner.base)
            .field("live_nodes", &inner.nodes.len())
            .field("open_tapes", &inner.open_tapes.len())
            .finish()
    }
}

/// A scoped recording window on a [`Graph`].
///
/// Dropping the tape releases it; [`GradientTape::close`] does the same
/// explicitly. A released tape can never be read again.
pub struct GradientTape {
    graph: Graph,
    start: NodeId,
    watched: HashSet<WeightId>,
    open: bool,
}

impl GradientTape {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn watches(&self, weight: &Weight) -> bool {
        self.watched.contains(&weight.id())
    }

    /// Adds weights to the watched set, e.g. after a module change.
    pub fn watch(&mut self, weights: &[Weight]) {
        self.watched.extend(weights.iter().map(Weight::id));
    }

    /// Gradient of the scalar `loss` with respect to each of `weights`.
    ///
    /// Entries are `None` for weights that are unwatched or did not reach the
    /// loss through nodes recorded on this tape.
    pub fn gradient(
        &self,
        loss: &Var,
        weights: &[Weight],
    ) -> KernelResult<Vec<Option<ArrayD<f32>>>> {
        if !self.open {
            return Err(KernelError::TapeClosed);
        }
        if loss.value().ndim() != 0 {
            return Err(KernelError::shape(&[], loss.shape(), "tape gradient target"));
        }
        if let Some(graph) = loss.graph() {
            if !graph.ptr_eq(&self.graph) {
                return Err(KernelError::GraphMismatch {
                    context: "tape gradient".to_string(),
                });
            }
        }

        let inner = self.graph.inner.borrow();
        let floor = self.start.max(inner.base);
        let loss_node = match loss.node() {
            Some(id) if id >= floor && inner.is_live(id) => id,
            _ => return Ok(vec![None; weights.len()]),
        };

        let mut pending: HashMap<NodeId, ArrayD<f32>> = HashMap::new();
        pending.insert(loss_node, ArrayD::ones(loss.value().raw_dim()));
        let mut weight_grads: HashMap<WeightId, ArrayD<f32>> = HashMap::new();

        for id in (floor..=loss_node).rev() {
            let Some(grad) = pending.remove(&id) else {
                continue;
            };
            let Some(node) = inner.node(id) else {
                continue;
            };
            if let Some(weight) = node.weight {
                if self.watched.contains(&weight) {
                    accumulate(&mut weight_grads, weight, grad);
                }
                continue;
            }
            let Some(backward) = node.backward.as_ref() else {
                continue;
            };
            for (parent, parent_grad) in node.parents.iter().zip(backward(&grad)) {
                if let Some(parent) = *parent {
                    if parent >= floor {
                        accumulate(&mut pending, parent, parent_grad);
                    }
                }
            }
        }

        Ok(weights
            .iter()
            .map(|weight| weight_grads.remove(&weight.id()))
            .collect())
    }

    /// Releases the tape.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.graph.release(self.start);
        }
    }
}

impl Drop for GradientTape {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for GradientTape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientTape")
            .field("start", &self.start)
            .field("watched", &self.watched.len())
            .field("open", &self.open)
            .finish()
    }
}

fn accumulate<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, ArrayD<f32>>,
    key: K,
    grad: ArrayD<f32>,
) {
    match map.get_mut(&key) {
        Some(existing) => *existing += &grad,
        None => {
            map.insert(key, grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_nothing_recorded_without_tape() {
        let graph = Graph::new();
        let w = Weight::new("w", array![1.0f32, 2.0].into_dyn());
        let read = w.read(&graph);
        let _sum = read.sum();
        assert_eq!(graph.live_nodes(), 0);
        assert!(read.node().is_none());
    }

    #[test]
    fn test_gradient_of_sum() {
        let graph = Graph::new();
        let w = Weight::new("w", array![1.0f32, 2.0, 3.0].into_dyn());
        let tape = graph.open_tape(&[w.clone()]);
        let loss = w.read(&graph).square().sum();
        let grads = tape.gradient(&loss, &[w.clone()]).unwrap();
        let grad = grads[0].as_ref().expect("gradient");
        assert_eq!(grad, &array![2.0f32, 4.0, 6.0].into_dyn());
    }

    #[test]
    fn test_unwatched_weight_has_no_gradient() {
        let graph = Graph::new();
        let watched = Weight::zeros("watched", 2);
        let frozen = Weight::zeros("frozen", 2);
        let tape = graph.open_tape(&[watched.clone()]);
        let loss = watched
            .read(&graph)
            .add(&frozen.read(&graph))
            .unwrap()
            .sum();
        let grads = tape.gradient(&loss, &[watched, frozen]).unwrap();
        assert!(grads[0].is_some());
        assert!(grads[1].is_none());
    }

    #[test]
    fn test_later_tape_does_not_see_earlier_nodes() {
        let graph = Graph::new();
        let w = Weight::new("w", array![1.0f32].into_dyn());
        let early = graph.open_tape(&[w.clone()]);
        let hidden = w.read(&graph).scale(3.0);
        let late = graph.open_tape(&[w.clone()]);
        let loss = hidden.sum();

        let early_grad = early.gradient(&loss, &[w.clone()]).unwrap();
        let late_grad = late.gradient(&loss, &[w.clone()]).unwrap();
        assert_eq!(early_grad[0].as_ref().unwrap(), &array![3.0f32].into_dyn());
        assert!(late_grad[0].is_none());
    }

    #[test]
    fn test_release_prunes_and_closes() {
        let graph = Graph::new();
        let w = Weight::zeros("w", 2);
        let tape = graph.open_tape(&[w.clone()]);
        let _ = w.read(&graph).sum();
        assert!(graph.live_nodes() > 0);
        tape.close();
        assert_eq!(graph.live_nodes(), 0);
        assert_eq!(graph.open_tapes(), 0);
        assert!(!graph.is_recording());
    }

    #[test]
    fn test_drop_releases_tape() {
        let graph = Graph::new();
        {
            let _tape = graph.open_tape(&[]);
            assert!(graph.is_recording());
        }
        assert!(!graph.is_recording());
    }
}
