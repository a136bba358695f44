use cephalus_core::config::ConfigError;
use cephalus_core::logging;
use cephalus_core::{
    AgentConfig, ExternalLossProvider, FutureGradientProvider, InputPredictionProvider,
    KernelConfig, ObservationInputProvider, ObservationSource, StateKernel, TDAgent,
};
use ndarray::{array, Array1};

const CONFIG_PATH: &str = "config/cephalus.toml";
const EPISODES: u64 = 20;
const MAX_STEPS: usize = 50;

/// A corridor of `length` cells; reaching the right end pays 1.
struct Corridor {
    length: usize,
    position: usize,
}

impl Corridor {
    fn apply(&mut self, action: usize) -> (f32, bool) {
        if action == 1 {
            self.position += 1;
        } else {
            self.position = self.position.saturating_sub(1);
        }
        if self.position + 1 >= self.length {
            (1.0, true)
        } else {
            (-0.01, false)
        }
    }
}

impl ObservationSource for Corridor {
    fn observe(&mut self) -> Option<Array1<f32>> {
        let progress = self.position as f32 / (self.length - 1) as f32;
        Some(array![progress, 1.0 - progress])
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let (kernel_config, agent_config) = load_config()?;
    let template = kernel_config.model_template.clone();
    let state_width = kernel_config.state_width;

    let external = ExternalLossProvider::new();
    let td_losses = external.queue();
    let mut kernel: StateKernel<Corridor> = StateKernel::new();
    kernel.add_module(ObservationInputProvider::new())?;
    kernel.add_module(InputPredictionProvider::new())?;
    kernel.add_module(FutureGradientProvider::new().with_loss_scale(0.1))?;
    kernel.add_module(external)?;
    kernel.configure(kernel_config)?;

    let mut agent = TDAgent::from_config(&agent_config, &template, state_width, 2)?;

    for episode in 0..EPISODES {
        let mut corridor = Corridor {
            length: 8,
            position: 0,
        };
        let mut frame = kernel.step(&mut corridor, None)?;
        let mut steps = 0;
        loop {
            let state = frame.current_state().ok_or("frame has no state")?.clone();
            let action = agent.choose_action(&state)?;
            let (reward, done) = corridor.apply(action);
            if agent.accept_reward(reward)?.is_some() {
                if let Some(record) = agent.last_closed_decision() {
                    logging::log_decision("out/decisions.jsonl", record, episode)?;
                }
            }
            // Rebuilt against this frame's state when the kernel trains it.
            td_losses.push_deferred(agent.state_loss(done)?);

            let next = kernel.step(&mut corridor, Some(&mut frame))?;
            logging::log_frame("out/frames.jsonl", &frame)?;
            frame = next;
            steps += 1;
            if done || steps >= MAX_STEPS {
                break;
            }
        }
        if agent.reset()?.is_some() {
            if let Some(record) = agent.last_closed_decision() {
                logging::log_decision("out/decisions.jsonl", record, episode)?;
            }
        }
        frame.release_tape();
        println!("Episode {episode}: {steps} steps");
    }

    Ok(())
}

fn load_config() -> Result<(KernelConfig, AgentConfig), ConfigError> {
    let kernel = KernelConfig::load_from_file(CONFIG_PATH).or_else(|err| {
        eprintln!("Falling back to default kernel config: {err}");
        Ok::<_, ConfigError>(KernelConfig::new(8, 2))
    })?;
    let agent = AgentConfig::load_from_file(CONFIG_PATH).or_else(|err| {
        eprintln!("Falling back to default agent config: {err}");
        Ok::<_, ConfigError>(AgentConfig::default())
    })?;
    Ok((kernel, agent))
}
