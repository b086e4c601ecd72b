//! Browser automation agent: turns a natural-language goal into a verified
//! sequence of page actions in one browser tab.

pub mod brain;
pub mod chrome;
pub mod config;
pub mod dom;
pub mod error;
pub mod hands;
pub mod host;
pub mod orchestrator;
pub mod runtime;
pub mod types;
pub mod verifier;

pub use brain::{ChatModel, OpenAiChat};
pub use config::AgentConfig;
pub use error::{AgentError, ModelError};
pub use host::{BrowserHost, PageScript, TabHandle};
pub use orchestrator::{Orchestrator, StopAck};
pub use runtime::{RunStatus, RuntimeState, RuntimeStore};
pub use types::{Action, CompletionReport, DoneResult, PendingPlan, RunMode, RunOutcome};
