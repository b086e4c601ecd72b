use thiserror::Error;

/// Errors raised by the model-backed clients.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("OPENAI_API_KEY not set in environment")]
    MissingApiKey,

    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model returned an empty response")]
    Empty,

    #[error("failed to parse model response: {0}")]
    Parse(String),

    #[error("model response is missing field `{0}`")]
    MissingField(&'static str),

    #[error("model request cancelled")]
    Cancelled,
}

impl ModelError {
    /// Rate limits, server errors and dropped connections are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Transport(_) => true,
            ModelError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("a run is already active")]
    AlreadyRunning,

    #[error("goal must not be empty")]
    EmptyGoal,

    #[error("no pending plan to approve")]
    NoPendingPlan,

    #[error("observation capture failed: {0}")]
    Capture(String),

    #[error("planner failed: {0}")]
    Planner(#[source] ModelError),

    #[error("plan generation failed: {0}")]
    PlanGenerator(#[source] ModelError),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("run cancelled")]
    Cancelled,
}

impl AgentError {
    pub(crate) fn browser(err: anyhow::Error) -> Self {
        AgentError::Browser(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
