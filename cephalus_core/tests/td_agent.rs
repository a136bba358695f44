use cephalus_core::logging::log_decision;
use cephalus_core::{
    AgentConfig, ExternalLossProvider, KernelConfig, KernelError, LossQueue, ModelTemplate,
    ObservationInputProvider, ObservationSource, StateKernel, TDAgent, Var, Weight,
};
use ndarray::{array, Array1, ArrayD};

/// Two-armed bandit whose observation says which arm pays.
struct Bandit {
    t: usize,
}

impl Bandit {
    fn paying_arm(&self) -> usize {
        self.t % 2
    }

    fn reward(&self, action: usize) -> f32 {
        if action == self.paying_arm() {
            1.0
        } else {
            -1.0
        }
    }
}

impl ObservationSource for Bandit {
    fn observe(&mut self) -> Option<Array1<f32>> {
        self.t += 1;
        let arm = self.paying_arm() as f32;
        Some(array![arm, 1.0 - arm])
    }
}

fn template() -> ModelTemplate {
    ModelTemplate {
        hidden_widths: vec![8],
        ..ModelTemplate::default()
    }
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        epsilon_start: 0.5,
        epsilon_end: 0.0,
        epsilon_decay_steps: 10,
        ..AgentConfig::default()
    }
}

fn bandit_kernel() -> (StateKernel<Bandit>, LossQueue) {
    let external = ExternalLossProvider::new();
    let queue = external.queue();
    let mut kernel: StateKernel<Bandit> = StateKernel::new();
    kernel.add_module(ObservationInputProvider::new()).unwrap();
    kernel.add_module(external).unwrap();
    kernel
        .configure(KernelConfig::new(4, 2).with_model_template(template()))
        .unwrap();
    (kernel, queue)
}

fn kernel_weights(kernel: &StateKernel<Bandit>) -> Vec<ArrayD<f32>> {
    kernel.trainable_weights().iter().map(Weight::value).collect()
}

#[test]
fn agent_acts_on_kernel_state_and_feeds_losses_back() {
    let (mut kernel, queue) = bandit_kernel();
    let mut agent = TDAgent::from_config(&agent_config(), &template(), 4, 2).unwrap();
    let mut bandit = Bandit { t: 0 };
    let mut frame = kernel.step(&mut bandit, None).unwrap();
    let mut losses = 0;

    for _ in 0..8 {
        let state = frame.current_state().unwrap().clone();
        let action = agent.choose_action(&state).unwrap();
        assert!(action < 2);
        if let Some(loss) = agent.accept_reward(bandit.reward(action)).unwrap() {
            assert!(loss.scalar().unwrap().is_finite());
            losses += 1;
        }
        queue.push_deferred(agent.state_loss(false).unwrap());
        let next = kernel.step(&mut bandit, Some(&mut frame)).unwrap();
        assert!(frame.is_trained());
        assert!(frame.combined_loss().unwrap() > 0.0);
        frame = next;
    }

    assert_eq!(losses, 7);
    assert!(queue.is_empty());
    assert_eq!(agent.total_steps(), 8);
    assert!(agent.reset().unwrap().is_some());
    assert_eq!(agent.episodes(), 1);
}

#[test]
fn td_losses_train_the_kernel_weights() {
    for feed_back in [false, true] {
        let (mut kernel, queue) = bandit_kernel();
        let mut agent = TDAgent::from_config(&agent_config(), &template(), 4, 2).unwrap();
        let initial = kernel_weights(&kernel);
        let mut bandit = Bandit { t: 0 };
        let mut frame = kernel.step(&mut bandit, None).unwrap();

        for step in 0..5 {
            let state = frame.current_state().unwrap().clone();
            let action = agent.choose_action(&state).unwrap();
            agent.accept_reward(bandit.reward(action)).unwrap();
            if feed_back {
                queue.push_deferred(agent.state_loss(step == 4).unwrap());
            }
            let next = kernel.step(&mut bandit, Some(&mut frame)).unwrap();
            frame = next;
        }

        let trained = kernel_weights(&kernel);
        if feed_back {
            assert_ne!(initial, trained);
        } else {
            assert_eq!(initial, trained);
        }
    }
}

#[test]
fn ready_losses_from_stale_states_move_no_kernel_weight() {
    let (mut kernel, queue) = bandit_kernel();
    let mut agent = TDAgent::from_config(&agent_config(), &template(), 4, 2).unwrap();
    let initial = kernel_weights(&kernel);
    let mut bandit = Bandit { t: 0 };
    let mut frame = kernel.step(&mut bandit, None).unwrap();

    for _ in 0..4 {
        let state = frame.current_state().unwrap().clone();
        let action = agent.choose_action(&state).unwrap();
        if let Some(loss) = agent.accept_reward(bandit.reward(action)).unwrap() {
            queue.push(loss).unwrap();
        }
        let next = kernel.step(&mut bandit, Some(&mut frame)).unwrap();
        frame = next;
    }
    assert_eq!(initial, kernel_weights(&kernel));
}

#[test]
fn choosing_twice_without_reward_fails() {
    let mut agent = TDAgent::from_config(&agent_config(), &template(), 3, 2).unwrap();
    let state = Var::vector(array![0.1, 0.2, 0.3]);
    agent.choose_action(&state).unwrap();
    assert_eq!(
        agent.choose_action(&state).unwrap_err(),
        KernelError::DecisionPending { step: 0 }
    );
}

#[test]
fn stabilized_targets_stay_within_reward_bounds() {
    let config = AgentConfig {
        discount: 0.9,
        ..agent_config()
    };
    let mut agent = TDAgent::from_config(&config, &template(), 2, 3).unwrap();
    for step in 0..6 {
        let state = Var::vector(array![step as f32 * 0.1, 1.0]);
        agent.choose_action(&state).unwrap();
        if step > 0 {
            let target = agent.previous_decision().unwrap().q_value_target().unwrap();
            assert!((0.5 - 1e-5..=1.0 + 1e-5).contains(&target), "target {} out of bounds", target);
        }
        agent.accept_reward(if step % 2 == 0 { 1.0 } else { 0.5 }).unwrap();
    }
    assert_eq!(agent.reward_bounds(), Some((0.5, 1.0)));
}

#[test]
fn episodes_restart_step_numbering() {
    let mut agent = TDAgent::from_config(&agent_config(), &template(), 2, 2).unwrap();
    let state = Var::vector(array![0.0, 1.0]);
    agent.choose_action(&state).unwrap();
    agent.accept_reward(1.0).unwrap();
    agent.choose_action(&state).unwrap();
    agent.accept_reward(0.0).unwrap();
    assert_eq!(agent.previous_decision().unwrap().step(), 1);

    assert!(agent.reset().unwrap().is_some());
    agent.choose_action(&state).unwrap();
    assert_eq!(agent.current_decision().unwrap().step(), 0);
}

#[test]
fn closed_decisions_are_logged_as_json_lines() {
    let mut agent = TDAgent::from_config(&agent_config(), &template(), 2, 2).unwrap();
    let state = Var::vector(array![0.3, -0.3]);
    agent.choose_action(&state).unwrap();
    agent.accept_reward(1.0).unwrap();
    agent.reset().unwrap();

    let path = std::env::temp_dir().join(format!("cephalus-decisions-{}.jsonl", uuid::Uuid::new_v4()));
    let record = agent.last_closed_decision().unwrap();
    log_decision(&path, record, agent.episodes()).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let line: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
    assert_eq!(line["step"], 0);
    assert_eq!(line["episode"], 1);
    assert!(line["loss"].as_f64().is_some());
    std::fs::remove_file(&path).ok();
}
