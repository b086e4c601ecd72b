use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single atomic instruction the planner asks the agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    OpenUrl { url: String },
    ClickText { text: String },
    ClickSelector { selector: String },
    TypeSelector { selector: String, text: String },
    CloseModal,
    Wait {
        #[serde(default = "default_wait_ms")]
        ms: u64,
    },
    Done {
        #[serde(default)]
        result: DoneResult,
    },
}

fn default_wait_ms() -> u64 {
    1_000
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::OpenUrl { .. } => "open_url",
            Action::ClickText { .. } => "click_text",
            Action::ClickSelector { .. } => "click_selector",
            Action::TypeSelector { .. } => "type_selector",
            Action::CloseModal => "close_modal",
            Action::Wait { .. } => "wait",
            Action::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done { .. })
    }

    /// Checks that the fields the variant needs are actually filled in.
    pub fn validate(&self) -> Result<(), String> {
        let missing = |field: &str| Err(format!("{} requires a non-empty `{}`", self.kind(), field));
        match self {
            Action::OpenUrl { url } if url.trim().is_empty() => missing("url"),
            Action::ClickText { text } if text.trim().is_empty() => missing("text"),
            Action::ClickSelector { selector } if selector.trim().is_empty() => missing("selector"),
            Action::TypeSelector { selector, .. } if selector.trim().is_empty() => {
                missing("selector")
            }
            _ => Ok(()),
        }
    }

    /// One-line human readable description for logs and the UI.
    pub fn describe(&self) -> String {
        match self {
            Action::OpenUrl { url } => format!("open {}", url),
            Action::ClickText { text } => format!("click text \"{}\"", clip(text, 60)),
            Action::ClickSelector { selector } => format!("click {}", selector),
            Action::TypeSelector { selector, text } => format!(
                "type {} chars into {}",
                text.chars().count(),
                selector
            ),
            Action::CloseModal => "close modal".to_string(),
            Action::Wait { ms } => format!("wait {}ms", ms),
            Action::Done { result } => format!("done: {}", clip(&result.summary, 80)),
        }
    }
}

/// Payload of a `done` claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DoneResultRepr")]
pub struct DoneResult {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    pub blocked: bool,
}

impl DoneResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// Models sometimes answer `"result": "..."` instead of an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum DoneResultRepr {
    Text(String),
    Full {
        #[serde(default, alias = "message")]
        summary: String,
        #[serde(default)]
        evidence: Option<String>,
        #[serde(default)]
        blocked: bool,
    },
}

impl From<DoneResultRepr> for DoneResult {
    fn from(repr: DoneResultRepr) -> Self {
        match repr {
            DoneResultRepr::Text(summary) => DoneResult::new(summary),
            DoneResultRepr::Full {
                summary,
                evidence,
                blocked,
            } => DoneResult {
                summary,
                evidence,
                blocked,
            },
        }
    }
}

/// Outcome of applying an [`Action`] to the tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Ok {
        mode: String,
        #[serde(default)]
        metadata: Value,
    },
    Failed { code: String, message: String },
}

impl ExecutionResult {
    pub fn ok(mode: impl Into<String>, metadata: Value) -> Self {
        ExecutionResult::Ok {
            mode: mode.into(),
            metadata,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutionResult::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionResult::Ok { .. })
    }

    pub fn metadata(&self) -> Option<&Value> {
        match self {
            ExecutionResult::Ok { metadata, .. } => Some(metadata),
            ExecutionResult::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyCode {
    Ok,
    NoNavigationChange,
    WrongDestination,
    NoPageChange,
    WrongTargetKind,
    NoVisibleTextChange,
}

impl VerifyCode {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyCode::Ok => "OK",
            VerifyCode::NoNavigationChange => "NO_NAVIGATION_CHANGE",
            VerifyCode::WrongDestination => "WRONG_DESTINATION",
            VerifyCode::NoPageChange => "NO_PAGE_CHANGE",
            VerifyCode::WrongTargetKind => "WRONG_TARGET_KIND",
            VerifyCode::NoVisibleTextChange => "NO_VISIBLE_TEXT_CHANGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub ok: bool,
    pub code: VerifyCode,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl VerificationResult {
    pub fn pass(message: impl Into<String>, details: Value) -> Self {
        Self {
            ok: true,
            code: VerifyCode::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn reject(code: VerifyCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            ok: false,
            code,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    ExecutionFailed,
    VerificationRejected,
    DoneRejected,
    RepeatBlocked,
}

/// One entry of the append-only action history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub action: Action,
    pub exec_result: ExecutionResult,
    pub observed_url: String,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StepRecord {
    /// Failures that count towards the repeated-action guard.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::ExecutionFailed | StepOutcome::VerificationRejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    #[serde(default)]
    pub details: String,
}

/// Up-front plan shown to the human before any action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPlan {
    pub created_at: DateTime<Utc>,
    pub goal: String,
    pub summary: String,
    pub steps: Vec<PlanStep>,
    pub risks: Vec<String>,
    pub requires_confirmation_before: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    New,
    Continue,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(RunMode::New),
            "continue" => Ok(RunMode::Continue),
            other => Err(format!("unknown run mode '{}', expected new or continue", other)),
        }
    }
}

/// Non-error terminal outcomes of a run. Failures are reported as `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        session_id: String,
        steps: u32,
        result: DoneResult,
    },
    Stopped {
        session_id: String,
        steps: u32,
    },
    PausedMaxSteps {
        session_id: String,
        tab_id: String,
        steps: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Failed,
}

/// Callback body the task relay expects once a run ends or fails to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub status: ReportStatus,
    pub summary: String,
    pub error: Option<String>,
}

impl CompletionReport {
    pub fn from_outcome<E: std::fmt::Display>(outcome: &Result<RunOutcome, E>) -> Self {
        match outcome {
            Ok(RunOutcome::Completed { result, .. }) => Self {
                status: ReportStatus::Completed,
                summary: result.summary.clone(),
                error: None,
            },
            Ok(RunOutcome::Stopped { steps, .. }) => Self {
                status: ReportStatus::Failed,
                summary: format!("Stopped by user after {} steps", steps),
                error: Some("stopped".to_string()),
            },
            Ok(RunOutcome::PausedMaxSteps { steps, .. }) => Self {
                status: ReportStatus::Failed,
                summary: format!("Paused after reaching the step budget ({} steps)", steps),
                error: Some("paused_max_steps".to_string()),
            },
            Err(e) => Self {
                status: ReportStatus::Failed,
                summary: String::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actions_parse_from_tagged_json() {
        let action: Action =
            serde_json::from_value(json!({"type": "type_selector", "selector": "#q", "text": "hi"}))
                .unwrap();
        assert_eq!(
            action,
            Action::TypeSelector {
                selector: "#q".into(),
                text: "hi".into()
            }
        );

        let action: Action = serde_json::from_value(json!({"type": "close_modal"})).unwrap();
        assert_eq!(action, Action::CloseModal);

        let action: Action = serde_json::from_value(json!({"type": "wait"})).unwrap();
        assert_eq!(action, Action::Wait { ms: 1_000 });
    }

    #[test]
    fn done_result_accepts_plain_string() {
        let action: Action =
            serde_json::from_value(json!({"type": "done", "result": "found it"})).unwrap();
        match action {
            Action::Done { result } => assert_eq!(result.summary, "found it"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_action_type_is_rejected() {
        let parsed = serde_json::from_value::<Action>(json!({"type": "scroll", "dy": 100}));
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_reports_missing_fields() {
        let err = Action::OpenUrl { url: "  ".into() }.validate().unwrap_err();
        assert!(err.contains("url"));
        assert!(Action::CloseModal.validate().is_ok());
    }

    #[test]
    fn completion_report_for_paused_run_is_failed() {
        let outcome: Result<RunOutcome, String> = Ok(RunOutcome::PausedMaxSteps {
            session_id: "s".into(),
            tab_id: "t".into(),
            steps: 3,
        });
        let report = CompletionReport::from_outcome(&outcome);
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("paused_max_steps"));
    }
}
