//! Action selection on top of a [`ProbabilisticModel`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::KernelResult;
use crate::q::decision::ActionDecision;
use crate::q::probabilistic_models::ProbabilisticModel;
use crate::q::schedule::EpsilonSchedule;
use crate::tensor::{Var, Weight};

pub trait ActionPolicy {
    fn build(&mut self) -> KernelResult<()> {
        Ok(())
    }

    fn trainable_weights(&self) -> Vec<Weight> {
        Vec::new()
    }

    /// Selects an action on `decision` and returns it.
    fn choose_action(&mut self, decision: &mut ActionDecision) -> KernelResult<usize>;

    fn get_loss(&self, decision: &ActionDecision, model: &dyn ProbabilisticModel) -> KernelResult<Var> {
        model.get_loss(decision)
    }
}

/// Uniform exploration with probability epsilon, argmax otherwise.
#[derive(Debug)]
pub struct EpsilonGreedyPolicy {
    schedule: EpsilonSchedule,
    rng: StdRng,
}

impl EpsilonGreedyPolicy {
    pub fn new(schedule: EpsilonSchedule, seed: u64) -> Self {
        Self {
            schedule,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Always exploits.
    pub fn greedy(seed: u64) -> Self {
        Self::new(EpsilonSchedule::constant(0.0), seed)
    }

    pub fn epsilon(&self) -> f32 {
        self.schedule.value()
    }

    pub fn schedule(&self) -> &EpsilonSchedule {
        &self.schedule
    }
}

impl ActionPolicy for EpsilonGreedyPolicy {
    fn choose_action(&mut self, decision: &mut ActionDecision) -> KernelResult<usize> {
        let epsilon = self.schedule.value();
        let action = if self.rng.gen::<f32>() < epsilon {
            self.rng.gen_range(0..decision.action_count())
        } else {
            decision.exploit_action()
        };
        decision.select(action)?;
        self.schedule.advance();
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn decision() -> ActionDecision {
        ActionDecision::new(
            Var::vector(array![0.0]),
            0,
            Var::vector(array![0.2, -0.1, 0.9, 0.4]),
            Var::vector(array![0.5, 0.5, 0.5, 0.5]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_greedy_picks_exploit_action() {
        let mut policy = EpsilonGreedyPolicy::greedy(3);
        for _ in 0..5 {
            let mut decision = decision();
            assert_eq!(policy.choose_action(&mut decision).unwrap(), 2);
            assert_eq!(decision.selected_action(), Some(2));
        }
    }

    #[test]
    fn test_full_exploration_covers_actions() {
        let mut policy = EpsilonGreedyPolicy::new(EpsilonSchedule::constant(1.0), 5);
        let mut seen = [false; 4];
        for _ in 0..200 {
            let mut decision = decision();
            seen[policy.choose_action(&mut decision).unwrap()] = true;
        }
        assert!(seen.iter().all(|&hit| hit));
    }

    #[test]
    fn test_schedule_advances_per_choice() {
        let mut policy = EpsilonGreedyPolicy::new(EpsilonSchedule::new(1.0, 0.0, 2), 1);
        policy.choose_action(&mut decision()).unwrap();
        policy.choose_action(&mut decision()).unwrap();
        assert_eq!(policy.epsilon(), 0.0);
    }
}
