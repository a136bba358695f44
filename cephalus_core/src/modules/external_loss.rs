//! Losses pushed into the kernel from outside, e.g. by a TD agent.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{KernelError, KernelResult};
use crate::frame::StateFrame;
use crate::modules::{Capabilities, ModuleContext, StateKernelModule};
use crate::tensor::Var;

/// A loss built while the kernel trains, from the frame being trained and
/// its successor. Its nodes land on the trained frame's open tape, so its
/// gradient reaches every kernel weight that produced that frame's state.
pub type DeferredLoss = Box<dyn FnOnce(&StateFrame, &StateFrame) -> KernelResult<Option<Var>>>;

enum PendingLoss {
    Ready(Var),
    Deferred(DeferredLoss),
}

/// Shared handle to the pending external losses.
#[derive(Clone, Default)]
pub struct LossQueue {
    pending: Rc<RefCell<Vec<PendingLoss>>>,
}

impl fmt::Debug for LossQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl LossQueue {
    /// Queues a scalar loss for the next training call.
    ///
    /// Only nodes recorded since the trained frame's tape opened carry
    /// gradient. A loss computed from an older state still counts toward the
    /// combined loss but moves no weight; use [`LossQueue::push_deferred`]
    /// for those.
    pub fn push(&self, loss: Var) -> KernelResult<()> {
        check_loss(&loss)?;
        self.pending.borrow_mut().push(PendingLoss::Ready(loss));
        Ok(())
    }

    /// Queues a loss to be built during the next training call.
    pub fn push_deferred(&self, loss: DeferredLoss) {
        self.pending.borrow_mut().push(PendingLoss::Deferred(loss));
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    fn drain(&self) -> Vec<PendingLoss> {
        self.pending.borrow_mut().drain(..).collect()
    }
}

fn check_loss(loss: &Var) -> KernelResult<()> {
    if loss.value().ndim() != 0 {
        return Err(KernelError::shape(&[], loss.shape(), "external loss"));
    }
    if loss.has_nan() {
        return Err(KernelError::NonFinite {
            context: "external loss".to_string(),
        });
    }
    Ok(())
}

/// Returns the mean of all losses queued since the last training call.
#[derive(Debug)]
pub struct ExternalLossProvider {
    queue: LossQueue,
    loss_scale: f32,
}

impl Default for ExternalLossProvider {
    fn default() -> Self {
        Self {
            queue: LossQueue::default(),
            loss_scale: 1.0,
        }
    }
}

impl ExternalLossProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_scale(mut self, loss_scale: f32) -> Self {
        self.loss_scale = loss_scale;
        self
    }

    /// A handle for pushing losses; clones share the queue.
    pub fn queue(&self) -> LossQueue {
        self.queue.clone()
    }
}

impl<E> StateKernelModule<E> for ExternalLossProvider {
    fn name(&self) -> &str {
        "external_loss"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOSS
    }

    fn configure(&mut self, _context: &ModuleContext<'_>) -> KernelResult<()> {
        Ok(())
    }

    fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    fn get_loss(&mut self, previous: &StateFrame, current: &StateFrame) -> KernelResult<Option<Var>> {
        let mut losses = Vec::new();
        for pending in self.queue.drain() {
            let loss = match pending {
                PendingLoss::Ready(loss) => loss,
                PendingLoss::Deferred(build) => match build(previous, current)? {
                    Some(loss) => {
                        check_loss(&loss)?;
                        loss
                    }
                    None => continue,
                },
            };
            losses.push(loss);
        }
        if losses.is_empty() {
            return Ok(None);
        }
        let count = losses.len() as f32;
        Ok(Some(Var::add_n(&losses)?.scale(1.0 / count)))
    }
}
