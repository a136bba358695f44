//! Kernel and agent configuration via TOML files.
//!
//! Both sections are optional in a file; missing tables and keys fall back
//! to the defaults below. Values are validated once on load and again when a
//! kernel is configured.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::neural::{ModelTemplate, OptimizerConfig};

/// State kernel configuration, read from the `[kernel]` table.
///
/// # Examples
///
/// ```
/// use cephalus_core::KernelConfig;
///
/// let config = KernelConfig::from_str(
///     "[kernel]\nstate_width = 8\ninput_width = 3\n\n[kernel.optimizer]\nkind = \"sgd\"\nlearning_rate = 0.01",
/// )
/// .unwrap();
/// assert_eq!(config.state_width, 8);
/// assert_eq!(config.optimizer.learning_rate(), 0.01);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Width of every state vector
    pub state_width: usize,
    /// Width every input vector must have
    pub input_width: usize,
    /// Optimizer shared by the kernel and its modules
    pub optimizer: OptimizerConfig,
    /// Architecture cloned by modules that need a network
    pub model_template: ModelTemplate,
    /// Weight of the predicted future state gradient relative to the true one
    pub future_gradient_coefficient: f32,
    /// Divide true plus discounted future gradient by `1 + future_gradient_coefficient`
    pub stabilized_gradient: bool,
    /// Seed for weight initialization
    pub seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            state_width: 16,
            input_width: 4,
            optimizer: OptimizerConfig::default(),
            model_template: ModelTemplate::default(),
            future_gradient_coefficient: 0.9,
            stabilized_gradient: true,
            seed: 42,
        }
    }
}

impl KernelConfig {
    pub fn new(state_width: usize, input_width: usize) -> Self {
        Self {
            state_width,
            input_width,
            ..Self::default()
        }
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_model_template(mut self, template: ModelTemplate) -> Self {
        self.model_template = template;
        self
    }

    pub fn with_future_gradient(mut self, coefficient: f32, stabilized: bool) -> Self {
        self.future_gradient_coefficient = coefficient;
        self.stabilized_gradient = stabilized;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawConfigFile =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let config = raw.kernel.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_width == 0 {
            return Err(ConfigError::Parse("kernel.state_width must be positive".into()));
        }
        if self.input_width == 0 {
            return Err(ConfigError::Parse("kernel.input_width must be positive".into()));
        }
        if !self.future_gradient_coefficient.is_finite() || self.future_gradient_coefficient < 0.0
        {
            return Err(ConfigError::Parse(
                "kernel.future_gradient_coefficient must be finite and non-negative".into(),
            ));
        }
        self.optimizer
            .validate()
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        self.model_template
            .validate()
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        Ok(())
    }
}

/// TD agent configuration, read from the `[agent]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Constant discount applied to the next decision's prediction
    pub discount: f32,
    /// Clamp bootstrapped predictions to observed reward bounds and normalize targets
    pub stabilize: bool,
    /// Exploration rate at the first step
    pub epsilon_start: f32,
    /// Exploration rate once the schedule has run out
    pub epsilon_end: f32,
    /// Steps over which epsilon decays linearly
    pub epsilon_decay_steps: u64,
    /// Seed for exploration and Q-model initialization
    pub seed: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            discount: 0.9,
            stabilize: true,
            epsilon_start: 1.0,
            epsilon_end: 0.05,
            epsilon_decay_steps: 1000,
            seed: 7,
        }
    }
}

impl AgentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawConfigFile =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let config = raw.agent.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.discount.is_finite() || self.discount < 0.0 {
            return Err(ConfigError::Parse(
                "agent.discount must be finite and non-negative".into(),
            ));
        }
        for (name, value) in [
            ("agent.epsilon_start", self.epsilon_start),
            ("agent.epsilon_end", self.epsilon_end),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Parse(format!("{} must be in [0, 1]", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    kernel: Option<KernelConfig>,
    #[serde(default)]
    agent: Option<AgentConfig>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "IO error: {}", err),
            ConfigError::Parse(err) => write!(f, "Parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::Activation;

    #[test]
    fn kernel_config_defaults_when_section_missing() {
        let config = KernelConfig::from_str("[agent]\ndiscount = 0.5").unwrap();
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn kernel_config_parses_custom_values() {
        let toml = r#"
[kernel]
state_width = 6
input_width = 2
future_gradient_coefficient = 0.5
stabilized_gradient = false

[kernel.optimizer]
kind = "adam"
learning_rate = 0.01

[kernel.model_template]
hidden_widths = [8, 8]
hidden_activation = "relu"
"#;
        let config = KernelConfig::from_str(toml).unwrap();
        assert_eq!(config.state_width, 6);
        assert_eq!(config.input_width, 2);
        assert!(!config.stabilized_gradient);
        assert_eq!(config.model_template.hidden_widths, vec![8, 8]);
        assert_eq!(config.model_template.hidden_activation, Activation::Relu);
        assert_eq!(
            config.model_template.output_activation,
            ModelTemplate::default().output_activation
        );
        assert!(matches!(config.optimizer, OptimizerConfig::Adam { .. }));
    }

    #[test]
    fn kernel_config_rejects_zero_width() {
        let err = KernelConfig::from_str("[kernel]\nstate_width = 0").unwrap_err();
        assert!(err.to_string().contains("state_width"));
    }

    #[test]
    fn kernel_config_rejects_malformed_toml() {
        assert!(matches!(
            KernelConfig::from_str("[kernel\nstate_width = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn agent_config_parses_and_validates() {
        let config = AgentConfig::from_str("[agent]\ndiscount = 0.5\nstabilize = false").unwrap();
        assert_eq!(config.discount, 0.5);
        assert!(!config.stabilize);
        assert!(AgentConfig::from_str("[agent]\nepsilon_start = 2.0").is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!("cephalus-{}.toml", uuid::Uuid::new_v4()));
        assert!(matches!(
            KernelConfig::load_from_file(&path),
            Err(ConfigError::Io(_))
        ));
    }
}
