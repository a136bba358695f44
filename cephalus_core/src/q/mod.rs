//! Temporal-difference control: Q models, action policies and the TD agent.

pub mod action_policies;
pub mod decision;
pub mod probabilistic_models;
pub mod schedule;
pub mod td;

pub use action_policies::{ActionPolicy, EpsilonGreedyPolicy};
pub use decision::{ActionDecision, DecisionRecord};
pub use probabilistic_models::{NetworkQModel, ProbabilisticModel};
pub use schedule::{Discount, EpsilonSchedule};
pub use td::TDAgent;
