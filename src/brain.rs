use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::dom::Observation;
use crate::error::ModelError;
use crate::types::{Action, DoneResult, PendingPlan, PlanStep, StepOutcome, StepRecord};

pub const PLANNER_TEMPERATURE: f32 = 0.2;
pub const PLAN_GENERATOR_TEMPERATURE: f32 = 0.2;
pub const DONE_CHECKER_TEMPERATURE: f32 = 0.0;

pub const MAX_PLAN_STEPS: usize = 12;
pub const MAX_PLAN_RISKS: usize = 8;
pub const MAX_PLAN_CONFIRMATIONS: usize = 8;
pub const DONE_CHECK_RECENT_ACTIONS: usize = 8;

const PLANNER_PROMPT: &str = r#"You are a browser automation agent. You control one real browser tab by issuing ONE action at a time as JSON.

Respond with a single JSON object: {"thought": "<short reasoning>", "action": <action>}

Available actions (closed set, nothing else is accepted):
- {"type":"open_url","url":"https://..."}
- {"type":"click_text","text":"visible text of the control"}
- {"type":"click_selector","selector":"css selector"}
- {"type":"type_selector","selector":"css selector","text":"text to enter"}
- {"type":"close_modal"}
- {"type":"wait","ms":1000}
- {"type":"done","result":{"summary":"what was achieved","evidence":"what on the page proves it","blocked":false}}

Rules:
1. Prefer click_text over click_selector whenever the control has visible text.
2. For checkboxes, radios and selects, reuse the exact selector listed in observation.form_controls. Never invent selectors.
3. When a modal is active, only interact with elements marked in_modal, or close the modal first.
4. Long text belongs in a content field (textarea or rich editor), never in a search box.
5. Never hand the task back to the human. Do not ask questions; act.
6. Only use done when the page shows real evidence the goal is complete, or when you are genuinely blocked (set "blocked": true and explain why).
7. If planner_feedback is present, it describes why your previous action failed. Do not repeat a rejected action on the same target.
8. Keep steps minimal. Do not over-navigate."#;

const PLAN_GENERATOR_PROMPT: &str = r#"You plan browser automation tasks for human review before anything runs.

Given a goal and the current page, respond with a single JSON object:
{"summary": "one paragraph", "steps": [{"title": "...", "details": "..."}], "risks": ["..."], "requires_confirmation_before": ["..."]}

Rules:
1. At most 12 steps, 8 risks and 8 confirmation points.
2. Steps describe intent ("open the settings page"), not selectors.
3. List anything irreversible (purchases, sending messages, deleting data) under requires_confirmation_before."#;

const DONE_CHECKER_PROMPT: &str = r#"You audit a browser agent's claim that it finished a task.

You get the goal, the agent's done result, the page before and at the done claim, and the agent's recent actions.
Respond with a single JSON object: {"accept": true|false, "reason": "...", "guidance": "what to do next if rejected"}

Accept only if the page shows the goal is actually complete, or the agent is genuinely blocked (login wall, missing permission, the thing does not exist) and says so.
Reject claims that rely on actions that were not verified or on pages the agent never reached."#;

/// A message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
}

/// A chat-completion endpoint that is forced to answer with a JSON object.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ModelError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiChat {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_retries: u32,
    retry_base: Duration,
}

impl OpenAiChat {
    pub fn new(config: &AgentConfig) -> Result<Self, ModelError> {
        let api_key = config.api_key.clone().ok_or(ModelError::MissingApiKey)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.model_timeout_secs))
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.model_max_retries,
            retry_base: Duration::from_millis(config.model_retry_base_ms.max(1)),
        })
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "temperature": request.temperature,
                "messages": request.messages,
                "response_format": { "type": "json_object" },
            }))
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or(ModelError::Empty)
    }

    /// Exponential backoff with up to one extra base interval of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_base.as_millis() as u64;
        let jitter = rand::random::<u64>() % base;
        Duration::from_millis(base.saturating_mul(1 << attempt.min(6)) + jitter)
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ModelError> {
        let mut attempt = 0;
        loop {
            match self.send_once(request).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "model call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Compact view of a history record for prompts.
#[derive(Debug, Serialize)]
pub struct ActionSummary<'a> {
    pub step: u32,
    pub action: &'a Action,
    pub outcome: StepOutcome,
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<&'a str>,
}

impl<'a> From<&'a StepRecord> for ActionSummary<'a> {
    fn from(record: &'a StepRecord) -> Self {
        Self {
            step: record.step,
            action: &record.action,
            outcome: record.outcome,
            url: &record.observed_url,
            note: record.note.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlannerInput<'a> {
    pub goal: &'a str,
    pub step: u32,
    pub planner_feedback: Option<&'a str>,
    pub previous_actions: Vec<ActionSummary<'a>>,
    pub observation: &'a Observation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_plan: Option<&'a PendingPlan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerDecision {
    pub thought: Option<String>,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPlan {
    pub summary: String,
    pub steps: Vec<PlanStep>,
    pub risks: Vec<String>,
    pub requires_confirmation_before: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DoneCheckInput<'a> {
    pub goal: &'a str,
    pub done_result: &'a DoneResult,
    pub observation_before_done: &'a Observation,
    pub observation_at_done: &'a Observation,
    pub recent_actions: Vec<ActionSummary<'a>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneVerdict {
    pub accept: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub guidance: Option<String>,
}

/// The three model-backed clients. Stateless: every call is one request.
#[derive(Clone)]
pub struct Brain {
    model: Arc<dyn ChatModel>,
}

impl Brain {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Planner: exactly one next action.
    pub async fn next_action(&self, input: &PlannerInput<'_>) -> Result<PlannerDecision, ModelError> {
        let content = self
            .ask(PLANNER_PROMPT, PLANNER_TEMPERATURE, input)
            .await?;
        let decision = parse_planner_reply(&content)?;
        debug!(action = %decision.action.describe(), "planner decided");
        Ok(decision)
    }

    /// Plan generator: reviewable outline produced before anything runs.
    pub async fn generate_plan(
        &self,
        goal: &str,
        observation: &Observation,
    ) -> Result<GeneratedPlan, ModelError> {
        let input = json!({ "goal": goal, "observation": observation });
        let content = self
            .ask(PLAN_GENERATOR_PROMPT, PLAN_GENERATOR_TEMPERATURE, &input)
            .await?;
        parse_plan_reply(&content)
    }

    /// Done checker: second opinion on a `done` claim.
    pub async fn check_done(&self, input: &DoneCheckInput<'_>) -> Result<DoneVerdict, ModelError> {
        let content = self
            .ask(DONE_CHECKER_PROMPT, DONE_CHECKER_TEMPERATURE, input)
            .await?;
        parse_done_reply(&content)
    }

    async fn ask<T: Serialize + ?Sized>(
        &self,
        system: &str,
        temperature: f32,
        input: &T,
    ) -> Result<String, ModelError> {
        let user = serde_json::to_string(input).map_err(|e| ModelError::Parse(e.to_string()))?;
        let request = ChatRequest {
            temperature,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        };
        self.model.complete(&request).await
    }
}

/// Local stand-in for the done checker when the model is unreachable.
///
/// Accepts any claim with a non-empty summary. This is much weaker than the
/// model check: a run can complete on an unverified claim while the
/// checker endpoint is down.
pub fn fallback_done_verdict(result: &DoneResult) -> DoneVerdict {
    if result.summary.trim().is_empty() {
        DoneVerdict {
            accept: false,
            reason: "done result has no summary".to_string(),
            guidance: Some("Describe what was achieved, with evidence from the page.".to_string()),
        }
    } else {
        DoneVerdict {
            accept: true,
            reason: "accepted by local fallback (done checker unavailable)".to_string(),
            guidance: None,
        }
    }
}

/// Strip possible markdown fences the model might add.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```JSON"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn parse_object(content: &str) -> Result<Value, ModelError> {
    let cleaned = strip_code_fences(content);
    if cleaned.is_empty() {
        return Err(ModelError::Empty);
    }
    let value: Value = match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(first) => {
            // Tolerate prose around a single object.
            let start = cleaned.find('{');
            let end = cleaned.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&cleaned[s..=e])
                    .map_err(|_| ModelError::Parse(format!("{}: {}", first, cleaned)))?,
                _ => return Err(ModelError::Parse(format!("{}: {}", first, cleaned))),
            }
        }
    };
    if !value.is_object() {
        return Err(ModelError::Parse(format!("expected a JSON object, got {}", value)));
    }
    Ok(value)
}

pub fn parse_planner_reply(content: &str) -> Result<PlannerDecision, ModelError> {
    let value = parse_object(content)?;
    let thought = value
        .get("thought")
        .and_then(Value::as_str)
        .map(String::from);

    let mut raw = match value.get("action") {
        Some(action) if action.is_object() => action.clone(),
        // {"action": "click_text", "text": "..."} flattened form
        Some(Value::String(kind)) => {
            let mut flat = value.clone();
            flat["type"] = Value::String(kind.clone());
            flat
        }
        _ if value.get("type").is_some() => value.clone(),
        _ => return Err(ModelError::MissingField("action")),
    };

    if raw.get("type").and_then(Value::as_str) == Some("done") && raw.get("result").is_none() {
        if let Some(summary) = raw.get("summary").cloned() {
            raw["result"] = json!({ "summary": summary });
        }
    }

    let action: Action = serde_json::from_value(raw.clone())
        .map_err(|e| ModelError::Parse(format!("invalid action {}: {}", raw, e)))?;
    Ok(PlannerDecision { thought, action })
}

pub fn parse_plan_reply(content: &str) -> Result<GeneratedPlan, ModelError> {
    let value = parse_object(content)?;
    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .ok_or(ModelError::MissingField("summary"))?
        .to_string();
    let steps = value
        .get("steps")
        .and_then(Value::as_array)
        .ok_or(ModelError::MissingField("steps"))?
        .iter()
        .filter_map(|step| match step {
            Value::String(title) => Some(PlanStep {
                title: title.clone(),
                details: String::new(),
            }),
            Value::Object(_) => serde_json::from_value(step.clone()).ok(),
            _ => None,
        })
        .take(MAX_PLAN_STEPS)
        .collect();

    Ok(GeneratedPlan {
        summary,
        steps,
        risks: string_list(&value, "risks", MAX_PLAN_RISKS),
        requires_confirmation_before: string_list(
            &value,
            "requires_confirmation_before",
            MAX_PLAN_CONFIRMATIONS,
        ),
    })
}

pub fn parse_done_reply(content: &str) -> Result<DoneVerdict, ModelError> {
    let value = parse_object(content)?;
    if !value.get("accept").is_some_and(Value::is_boolean) {
        return Err(ModelError::MissingField("accept"));
    }
    serde_json::from_value(value).map_err(|e| ModelError::Parse(e.to_string()))
}

fn string_list(value: &Value, key: &str, cap: usize) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .take(cap)
                .collect()
        })
        .unwrap_or_default()
}
