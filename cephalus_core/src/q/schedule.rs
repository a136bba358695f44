//! Exploration and discount schedules.

use std::fmt;
use std::rc::Rc;

/// Linear epsilon schedule for epsilon-greedy exploration.
#[derive(Clone, Debug, PartialEq)]
pub struct EpsilonSchedule {
    start: f32,
    end: f32,
    steps: u64,
    step: u64,
}

impl EpsilonSchedule {
    pub fn new(start: f32, end: f32, steps: u64) -> Self {
        Self {
            start: start.clamp(0.0, 1.0),
            end: end.clamp(0.0, 1.0),
            steps: steps.max(1),
            step: 0,
        }
    }

    /// A schedule that never changes.
    pub fn constant(epsilon: f32) -> Self {
        Self::new(epsilon, epsilon, 1)
    }

    pub fn value(&self) -> f32 {
        let progress = (self.step as f32 / self.steps as f32).clamp(0.0, 1.0);
        self.start + (self.end - self.start) * progress
    }

    pub fn advance(&mut self) -> f32 {
        self.step = self.step.saturating_add(1).min(self.steps);
        self.value()
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}

/// Discount for the next decision's predicted value.
#[derive(Clone)]
pub enum Discount {
    Constant(f32),
    /// Computed from `(episodes, total_steps)` every time it is needed.
    Scheduled(Rc<dyn Fn(u64, u64) -> f32>),
}

impl Discount {
    pub fn scheduled<F>(schedule: F) -> Self
    where
        F: Fn(u64, u64) -> f32 + 'static,
    {
        Discount::Scheduled(Rc::new(schedule))
    }

    pub fn value(&self, episodes: u64, total_steps: u64) -> f32 {
        match self {
            Discount::Constant(discount) => *discount,
            Discount::Scheduled(schedule) => schedule(episodes, total_steps),
        }
    }
}

impl From<f32> for Discount {
    fn from(discount: f32) -> Self {
        Discount::Constant(discount)
    }
}

impl fmt::Debug for Discount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discount::Constant(discount) => f.debug_tuple("Constant").field(discount).finish(),
            Discount::Scheduled(_) => f.write_str("Scheduled(..)"),
        }
    }
}
