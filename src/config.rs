use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MODEL: &str = "gpt-5.2";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_STEPS: u32 = 25;
pub const MAX_STEPS_CEILING: u32 = 200;

/// Runtime configuration for the agent.
///
/// Built from the environment by [`AgentConfig::from_env`]; the binary layers
/// command-line overrides on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Bearer token for the chat-completion endpoint. Never serialized.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    /// Per-run step budget, clamped to 1..=200 when read.
    pub max_steps: u32,
    /// Retries for transient model failures (429, 5xx, dropped connections).
    pub model_max_retries: u32,
    pub model_retry_base_ms: u64,
    pub model_timeout_secs: u64,
    /// Pause after click/type/close actions so the UI can settle.
    pub action_settle_ms: u64,
    /// Pause after a non-done step before the next observation.
    pub step_settle_ms: u64,
    pub navigation_timeout_ms: u64,
    pub navigation_poll_ms: u64,
    /// History records carried into a `continue` session.
    pub history_limit: usize,
    /// Where RuntimeState is persisted. `None` keeps it in memory only.
    pub state_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            model_max_retries: 2,
            model_retry_base_ms: 500,
            model_timeout_secs: 90,
            action_settle_ms: 450,
            step_settle_ms: 600,
            navigation_timeout_ms: 15_000,
            navigation_poll_ms: 250,
            history_limit: 40,
            state_file: None,
        }
    }
}

impl AgentConfig {
    /// Reads `OPENAI_API_KEY`, `OPENAI_API_BASE`, `OPENAI_MODEL`,
    /// `AGENT_MAX_STEPS` and `AGENT_STATE_FILE`. Unset variables keep defaults;
    /// the state file defaults to the platform data directory.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Ok(base) = std::env::var("OPENAI_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.model = model;
        }
        if let Some(steps) = std::env::var("AGENT_MAX_STEPS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.max_steps = steps;
        }
        config.state_file = std::env::var("AGENT_STATE_FILE")
            .ok()
            .map(PathBuf::from)
            .or_else(default_state_file);
        config
    }

    /// Fast settings for tests and fakes: no settle pauses, no retries.
    pub fn immediate() -> Self {
        Self {
            model_max_retries: 0,
            action_settle_ms: 0,
            step_settle_ms: 0,
            navigation_timeout_ms: 200,
            navigation_poll_ms: 10,
            ..Self::default()
        }
    }

    pub fn effective_max_steps(&self) -> u32 {
        self.max_steps.clamp(1, MAX_STEPS_CEILING)
    }
}

pub fn default_state_file() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("browser-pilot").join("runtime_state.json"))
}
