//! Error types for kernel, autodiff and agent operations.
//!
//! Every invariant the kernel and the TD agent enforce surfaces here as a
//! variant. None of them are retried: they signal a composition or
//! programming error in the owning harness.

use std::fmt;

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Error type shared by the state kernel, its modules, the autodiff graph and the TD agent
#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    /// `configure` was called on a kernel that already has a configuration
    AlreadyConfigured,

    /// An operation requires a configured kernel
    NotConfigured { operation: &'static str },

    /// The supplied configuration failed validation
    InvalidConfiguration { reason: String },

    /// A second module claimed a role that admits a single provider
    DuplicateProvider { role: &'static str },

    /// No module fills a role the step cycle depends on
    MissingProvider { role: &'static str },

    /// The kernel invoked a capability the module never declared
    MissingCapability {
        module: String,
        capability: &'static str,
    },

    /// No module is registered under the given id
    UnknownModule { id: u64 },

    /// The module cannot be removed from the kernel
    ProtectedModule { id: u64, role: &'static str },

    /// A frame was handed to `train` a second time
    AlreadyTrained { stream_id: String, clock_ticks: u64 },

    /// A gradient tape was read after it had been released
    TapeClosed,

    /// A frame was driven through the step cycle out of order
    InvalidFrameState { details: String },

    /// Tensor shapes do not line up
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
        context: String,
    },

    /// Two values recorded on different graphs met in one operation
    GraphMismatch { context: String },

    /// A NaN or infinite value appeared where only finite values are allowed
    NonFinite { context: String },

    /// The module losses carry no usable scale
    InvalidLossScale { total_scale: f32 },

    /// `choose_action` was called while a decision still awaits its reward
    DecisionPending { step: u64 },

    /// A reward arrived with no decision to attach it to
    NoPendingDecision,

    /// The current decision already holds a reward
    RewardAlreadyAccepted { step: u64 },

    /// A decision was closed before its reward was known
    MissingReward { step: u64 },

    /// A decision's TD target was computed twice
    TargetAlreadySet { step: u64 },

    /// A component was used before `build` was called
    NotBuilt { component: &'static str },

    /// Invalid parameter value
    InvalidParameter {
        parameter: String,
        value: String,
        constraint: String,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::AlreadyConfigured => write!(f, "Kernel is already configured"),
            KernelError::NotConfigured { operation } => {
                write!(
                    f,
                    "Kernel not configured: operation '{}' requires configure() to be called first",
                    operation
                )
            }
            KernelError::InvalidConfiguration { reason } => {
                write!(f, "Invalid kernel configuration: {}", reason)
            }
            KernelError::DuplicateProvider { role } => {
                write!(f, "A {} provider is already designated for this kernel", role)
            }
            KernelError::MissingProvider { role } => {
                write!(f, "No {} provider is designated for this kernel", role)
            }
            KernelError::MissingCapability { module, capability } => {
                write!(
                    f,
                    "Module '{}' does not provide the '{}' capability",
                    module, capability
                )
            }
            KernelError::UnknownModule { id } => write!(f, "No module registered with id {}", id),
            KernelError::ProtectedModule { id, role } => {
                write!(f, "Module {} is the {} provider and cannot be removed", id, role)
            }
            KernelError::AlreadyTrained {
                stream_id,
                clock_ticks,
            } => {
                write!(
                    f,
                    "Frame {} of stream '{}' has already been trained",
                    clock_ticks, stream_id
                )
            }
            KernelError::TapeClosed => write!(f, "Gradient tape has already been closed"),
            KernelError::InvalidFrameState { details } => {
                write!(f, "Invalid frame state: {}", details)
            }
            KernelError::ShapeMismatch {
                expected,
                got,
                context,
            } => {
                write!(
                    f,
                    "Shape mismatch in {}: expected {:?}, got {:?}",
                    context, expected, got
                )
            }
            KernelError::GraphMismatch { context } => {
                write!(f, "Values from different graphs combined in {}", context)
            }
            KernelError::NonFinite { context } => {
                write!(f, "Non-finite value detected in {}", context)
            }
            KernelError::InvalidLossScale { total_scale } => {
                write!(
                    f,
                    "Module losses were reported but their total scale is {}",
                    total_scale
                )
            }
            KernelError::DecisionPending { step } => {
                write!(
                    f,
                    "Decision {} is still pending; accept a reward or reset first",
                    step
                )
            }
            KernelError::NoPendingDecision => {
                write!(f, "No pending decision to attach the reward to")
            }
            KernelError::RewardAlreadyAccepted { step } => {
                write!(f, "Decision {} already holds a reward", step)
            }
            KernelError::MissingReward { step } => {
                write!(f, "Decision {} was closed before its reward arrived", step)
            }
            KernelError::TargetAlreadySet { step } => {
                write!(f, "Decision {} already has a TD target", step)
            }
            KernelError::NotBuilt { component } => {
                write!(f, "{} must be built before use. Call build() first.", component)
            }
            KernelError::InvalidParameter {
                parameter,
                value,
                constraint,
            } => {
                write!(
                    f,
                    "Invalid parameter '{}' = '{}': must satisfy {}",
                    parameter, value, constraint
                )
            }
        }
    }
}

impl std::error::Error for KernelError {}

impl KernelError {
    /// Shape mismatch with the expected and observed shapes and a short context label.
    pub fn shape(expected: &[usize], got: &[usize], context: impl Into<String>) -> Self {
        KernelError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
            context: context.into(),
        }
    }

    /// True for failures that come from the step/decision ordering rather than numerics.
    pub fn is_sequencing(&self) -> bool {
        matches!(
            self,
            KernelError::AlreadyConfigured
                | KernelError::AlreadyTrained { .. }
                | KernelError::TapeClosed
                | KernelError::InvalidFrameState { .. }
                | KernelError::DecisionPending { .. }
                | KernelError::NoPendingDecision
                | KernelError::RewardAlreadyAccepted { .. }
                | KernelError::MissingReward { .. }
                | KernelError::TargetAlreadySet { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_role() {
        let err = KernelError::DuplicateProvider {
            role: "state prediction",
        };
        assert!(err.to_string().contains("state prediction"));
    }

    #[test]
    fn test_sequencing_classification() {
        assert!(KernelError::DecisionPending { step: 3 }.is_sequencing());
        assert!(!KernelError::NonFinite {
            context: "loss".into()
        }
        .is_sequencing());
    }
}
