//! Run-loop state machine: observe → plan → act → verify, until the goal is
//! accepted as done, the user stops the run, or the step budget runs out.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::brain::{
    ActionSummary, Brain, ChatModel, DONE_CHECK_RECENT_ACTIONS, DoneCheckInput, DoneVerdict,
    PlannerInput, fallback_done_verdict,
};
use crate::config::AgentConfig;
use crate::dom::{self, Observation, PageKind};
use crate::error::{AgentError, ModelError, Result};
use crate::hands::Executor;
use crate::host::{BrowserHost, TabHandle};
use crate::runtime::{LogKind, RunControl, RunLease, RunStatus, RuntimeState, RuntimeStore};
use crate::types::{
    Action, DoneResult, ExecutionResult, PendingPlan, RunMode, RunOutcome, StepOutcome,
    StepRecord,
};
use crate::verifier::{self, VerifyInput};

/// History entries scanned by the repeated-failure guard.
pub const REPEAT_WINDOW: usize = 6;
/// Failed occurrences of one fingerprint that block a further attempt.
pub const REPEAT_THRESHOLD: usize = 2;
/// Blocked repeats in a row before the block itself uses up a step.
pub const MAX_CONSECUTIVE_BLOCKS: u32 = 3;

/// Deterministic key identifying "the same" action.
pub fn fingerprint(action: &Action) -> String {
    match action {
        Action::OpenUrl { url } => format!("open_url:{}", url.trim().trim_end_matches('/')),
        Action::ClickText { text } => format!("click_text:{}", normalize_text(text)),
        Action::ClickSelector { selector } => format!("click_selector:{}", selector.trim()),
        Action::TypeSelector { selector, .. } => format!("type_selector:{}", selector.trim()),
        Action::CloseModal => "close_modal".to_string(),
        Action::Wait { .. } => "wait".to_string(),
        Action::Done { .. } => "done".to_string(),
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// True when `fp` already failed at least [`REPEAT_THRESHOLD`] times within
/// the last [`REPEAT_WINDOW`] history entries.
pub fn is_repeated_failure(history: &[StepRecord], fp: &str) -> bool {
    history
        .iter()
        .rev()
        .take(REPEAT_WINDOW)
        .filter(|record| record.is_failure() && fingerprint(&record.action) == fp)
        .count()
        >= REPEAT_THRESHOLD
}

/// Domain checks a done claim must pass on top of the done checker.
/// Returns the reason the claim is premature.
pub fn completion_gate(
    goal: &str,
    result: &DoneResult,
    at_done: &Observation,
    history: &[StepRecord],
) -> Option<String> {
    if result.blocked {
        return None;
    }
    let goal = goal.to_lowercase();

    if goal.contains("quiz") || goal.contains("question") {
        if let Some(progress) = at_done.quiz_progress.filter(|p| p.has_unanswered()) {
            let done = progress.answered.or(progress.current).unwrap_or(0);
            return Some(format!(
                "The quiz still shows unanswered questions ({} of {}). Finish them before claiming done.",
                done, progress.total
            ));
        }
    }

    const WRITING: [&str; 6] = ["write", "draft", "type", "compose", "essay", "paragraph"];
    if at_done.page_kind == PageKind::DocumentEditor && WRITING.iter().any(|w| goal.contains(w)) {
        let typed = history.iter().any(|r| {
            r.outcome == StepOutcome::Succeeded && matches!(r.action, Action::TypeSelector { .. })
        });
        if !typed {
            return Some(
                "The goal asks for text in the document, but no text has been entered successfully yet."
                    .to_string(),
            );
        }
    }
    None
}

#[derive(Debug, Clone, Serialize)]
pub struct StopAck {
    pub accepted: bool,
    pub status: RunStatus,
}

/// A run's tab and memory; kept after the run ends so `continue` can resume.
#[derive(Debug, Clone)]
struct Session {
    id: String,
    tab: TabHandle,
    history: Vec<StepRecord>,
    plan: Option<PendingPlan>,
    step: u32,
}

enum Phase {
    Observe,
    Plan {
        obs: Observation,
    },
    Execute {
        obs: Observation,
        action: Action,
    },
    Verify {
        before: Observation,
        action: Action,
        exec: ExecutionResult,
    },
    DoneGate {
        before_done: Observation,
        at_done: Observation,
        action: Action,
        exec: ExecutionResult,
        result: DoneResult,
    },
    Settle,
}

enum LoopExit {
    Completed(DoneResult),
    Stopped,
    Paused,
}

pub struct Orchestrator {
    host: Arc<dyn BrowserHost>,
    brain: Brain,
    executor: Executor,
    store: Arc<RuntimeStore>,
    control: RunControl,
    config: AgentConfig,
    session: Mutex<Option<Session>>,
    /// Tab the last plan was generated in and that no run has claimed yet.
    planning_tab: Mutex<Option<TabHandle>>,
}

impl Orchestrator {
    pub fn new(
        host: Arc<dyn BrowserHost>,
        model: Arc<dyn ChatModel>,
        store: Arc<RuntimeStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            executor: Executor::new(host.clone(), &config),
            brain: Brain::new(model),
            host,
            store,
            control: RunControl::default(),
            config,
            session: Mutex::new(None),
            planning_tab: Mutex::new(None),
        }
    }

    pub fn runtime_state(&self) -> RuntimeState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeState> {
        self.store.subscribe()
    }

    /// Whether a run or plan generation currently holds the run slot.
    pub fn is_busy(&self) -> bool {
        self.control.is_busy()
    }

    /// Asks the active run (or plan generation) to stop at its next safe point.
    pub fn request_stop(&self) -> StopAck {
        if !self.control.stop() {
            return StopAck {
                accepted: false,
                status: self.store.snapshot().status,
            };
        }
        let status = self.store.update(|s| {
            s.cancel_requested = true;
            s.status
        });
        self.store
            .log(LogKind::Warning, "Stop requested", Value::Null);
        StopAck {
            accepted: true,
            status,
        }
    }

    /// Produces a reviewable plan for `goal` without acting on the page.
    pub async fn generate_plan(&self, goal: &str) -> Result<PendingPlan> {
        let goal = normalized_goal(goal)?;
        let (_lease, token) = self.control.begin().ok_or(AgentError::AlreadyRunning)?;

        self.store.update(|s| {
            s.status = RunStatus::PlanningRun;
            s.goal = Some(goal.clone());
            s.pending_plan = None;
            s.cancel_requested = token.is_cancelled();
            s.last_error = None;
        });
        self.store
            .log(LogKind::Plan, format!("Planning: {}", goal), Value::Null);

        match self.plan_inner(&goal, &token).await {
            Ok(plan) => {
                self.store.update(|s| {
                    s.pending_plan = Some(plan.clone());
                    s.status = RunStatus::AwaitingPlanApproval;
                });
                self.store.log(
                    LogKind::Plan,
                    format!("Plan ready with {} steps, awaiting approval", plan.steps.len()),
                    serde_json::to_value(&plan).unwrap_or(Value::Null),
                );
                Ok(plan)
            }
            Err(AgentError::Cancelled) => {
                self.store.update(|s| {
                    s.status = RunStatus::Stopped;
                    s.ended_at = Some(Utc::now());
                });
                self.store
                    .log(LogKind::Info, "Planning stopped by user", Value::Null);
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                self.mark_failed(&e);
                Err(e)
            }
        }
    }

    async fn plan_inner(&self, goal: &str, token: &CancellationToken) -> Result<PendingPlan> {
        let tab = match self.idle_planning_tab().await? {
            Some(tab) => tab,
            None => self.host.open_tab().await.map_err(AgentError::browser)?,
        };
        self.store.update(|s| {
            s.tab_id = Some(tab.id.clone());
            s.tab_group_id = tab.group_id.clone();
        });
        *self.planning_tab.lock() = Some(tab.clone());

        let obs = self.observe(&tab).await?;
        let generated = match cancellable(token, self.brain.generate_plan(goal, &obs)).await {
            Ok(plan) => plan,
            Err(ModelError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => return Err(AgentError::PlanGenerator(e)),
        };
        Ok(PendingPlan {
            created_at: Utc::now(),
            goal: goal.to_string(),
            summary: generated.summary,
            steps: generated.steps,
            risks: generated.risks,
            requires_confirmation_before: generated.requires_confirmation_before,
        })
    }

    /// Starts the run described by the pending plan, in the tab it was
    /// planned against.
    pub async fn approve_plan(&self) -> Result<RunOutcome> {
        let (lease, token) = self.control.begin().ok_or(AgentError::AlreadyRunning)?;
        let plan = self
            .store
            .snapshot()
            .pending_plan
            .ok_or(AgentError::NoPendingPlan)?;
        self.store.log(
            LogKind::Plan,
            "Plan approved",
            json!({ "goal": plan.goal }),
        );
        let goal = plan.goal.clone();
        self.execute_run((lease, token), goal, RunMode::New, Some(plan))
            .await
    }

    /// Discards the pending plan. Returns whether there was one. The planning
    /// tab stays parked for the next plan or new run.
    pub fn reject_plan(&self) -> bool {
        if self.control.is_busy() {
            return false;
        }
        let had_plan = self.store.update(|s| {
            let had = s.pending_plan.take().is_some();
            if had {
                s.status = RunStatus::Ready;
            }
            had
        });
        if had_plan {
            self.store
                .log(LogKind::Plan, "Plan rejected", Value::Null);
        }
        had_plan
    }

    pub async fn run(&self, goal: &str, mode: RunMode) -> Result<RunOutcome> {
        let goal = normalized_goal(goal)?;
        let run = self.control.begin().ok_or(AgentError::AlreadyRunning)?;
        self.execute_run(run, goal, mode, None).await
    }

    async fn execute_run(
        &self,
        (_lease, token): (RunLease, CancellationToken),
        goal: String,
        mode: RunMode,
        plan: Option<PendingPlan>,
    ) -> Result<RunOutcome> {
        self.store.update(|s| {
            s.is_running = true;
            // A stop may already have landed between acquiring and here.
            s.cancel_requested = token.is_cancelled();
            s.status = RunStatus::StartingRun;
            s.goal = Some(goal.clone());
            s.pending_plan = None;
            s.started_at = Some(Utc::now());
            s.ended_at = None;
            s.last_error = None;
            s.last_result = None;
        });
        self.store.log(
            LogKind::Info,
            format!("Starting run ({:?}): {}", mode, goal),
            json!({ "mode": mode }),
        );

        let mut session = match self.prepare_session(mode, plan).await {
            Ok(session) => session,
            Err(e) => {
                self.mark_failed(&e);
                return Err(e);
            }
        };
        self.store.update(|s| {
            s.session_id = Some(session.id.clone());
            s.tab_id = Some(session.tab.id.clone());
            s.tab_group_id = session.tab.group_id.clone();
            s.step = session.step;
            s.status = RunStatus::Running;
        });

        let exit = self.drive(&goal, &mut session, &token).await;
        let steps = session.step;
        let outcome = match exit {
            Ok(LoopExit::Completed(result)) => {
                self.store.update(|s| {
                    s.is_running = false;
                    s.status = RunStatus::Completed;
                    s.ended_at = Some(Utc::now());
                    s.last_result = serde_json::to_value(&result).ok();
                });
                self.store.log(
                    LogKind::Done,
                    format!("Completed: {}", result.summary),
                    serde_json::to_value(&result).unwrap_or(Value::Null),
                );
                Ok(RunOutcome::Completed {
                    session_id: session.id.clone(),
                    steps,
                    result,
                })
            }
            Ok(LoopExit::Stopped) => {
                self.store.update(|s| {
                    s.is_running = false;
                    s.status = RunStatus::Stopped;
                    s.ended_at = Some(Utc::now());
                });
                self.store
                    .log(LogKind::Info, "Run stopped by user", Value::Null);
                Ok(RunOutcome::Stopped {
                    session_id: session.id.clone(),
                    steps,
                })
            }
            Ok(LoopExit::Paused) => {
                self.store.update(|s| {
                    s.is_running = false;
                    s.status = RunStatus::PausedMaxSteps;
                    s.ended_at = Some(Utc::now());
                });
                self.store.log(
                    LogKind::Info,
                    format!(
                        "Step budget reached after {} steps; run `continue` to resume in the same tab",
                        steps
                    ),
                    Value::Null,
                );
                Ok(RunOutcome::PausedMaxSteps {
                    session_id: session.id.clone(),
                    tab_id: session.tab.id.clone(),
                    steps,
                })
            }
            Err(e) => {
                self.mark_failed(&e);
                Err(e)
            }
        };

        *self.session.lock() = Some(session);
        outcome
    }

    /// `new` allocates a session in the parked planning tab or a fresh one;
    /// `continue` reattaches to the previous session's tab and history.
    async fn prepare_session(
        &self,
        mode: RunMode,
        plan: Option<PendingPlan>,
    ) -> Result<Session> {
        if mode == RunMode::Continue {
            let previous = self.session.lock().take().or_else(|| self.recorded_session());
            match previous {
                Some(mut session) => {
                    session.tab = self.reattach(&session.tab).await?;
                    let excess = session
                        .history
                        .len()
                        .saturating_sub(self.config.history_limit);
                    session.history.drain(..excess);
                    self.store.log(
                        LogKind::Info,
                        format!(
                            "Continuing session {} in tab {} ({} history entries)",
                            session.id,
                            session.tab.id,
                            session.history.len()
                        ),
                        Value::Null,
                    );
                    return Ok(session);
                }
                None => self.store.log(
                    LogKind::Warning,
                    "No previous session to continue; starting a new one",
                    Value::Null,
                ),
            }
        }

        let tab = match self.idle_planning_tab().await? {
            Some(tab) => tab,
            None => self.host.open_tab().await.map_err(AgentError::browser)?,
        };
        Ok(Session {
            id: new_session_id(),
            tab,
            history: Vec::new(),
            plan,
            step: 0,
        })
    }

    /// Claims the parked planning tab if the browser still has it.
    async fn idle_planning_tab(&self) -> Result<Option<TabHandle>> {
        let Some(parked) = self.planning_tab.lock().take() else {
            return Ok(None);
        };
        self.host
            .find_tab(&parked.id)
            .await
            .map_err(AgentError::browser)
    }

    /// Session recorded in persisted state by an earlier process.
    fn recorded_session(&self) -> Option<Session> {
        let state = self.store.snapshot();
        Some(Session {
            id: state.session_id?,
            tab: TabHandle {
                id: state.tab_id?,
                group_id: state.tab_group_id,
            },
            history: Vec::new(),
            plan: None,
            step: state.step,
        })
    }

    async fn reattach(&self, tab: &TabHandle) -> Result<TabHandle> {
        match self
            .host
            .find_tab(&tab.id)
            .await
            .map_err(AgentError::browser)?
        {
            Some(found) => Ok(found),
            None => {
                self.store.log(
                    LogKind::Warning,
                    format!("Tab {} is gone; opening a replacement", tab.id),
                    Value::Null,
                );
                self.host.open_tab().await.map_err(AgentError::browser)
            }
        }
    }

    async fn drive(
        &self,
        goal: &str,
        session: &mut Session,
        token: &CancellationToken,
    ) -> Result<LoopExit> {
        let budget = self.config.effective_max_steps();
        let mut executed: u32 = 0;
        let mut consecutive_blocks: u32 = 0;
        let mut feedback: Option<String> = None;
        let mut previous_obs: Option<Observation> = None;
        let mut phase = Phase::Observe;

        loop {
            phase = match phase {
                Phase::Observe => {
                    if token.is_cancelled() {
                        return Ok(LoopExit::Stopped);
                    }
                    if executed >= budget {
                        return Ok(LoopExit::Paused);
                    }
                    self.set_status(RunStatus::ReadingBrowser);
                    let obs = self.observe(&session.tab).await?;
                    Phase::Plan { obs }
                }

                Phase::Plan { obs } => {
                    self.set_status(RunStatus::Planning);
                    let decision = {
                        let input = PlannerInput {
                            goal,
                            step: session.step + 1,
                            planner_feedback: feedback.as_deref(),
                            previous_actions: session.history.iter().map(ActionSummary::from).collect(),
                            observation: &obs,
                            approved_plan: session.plan.as_ref(),
                        };
                        cancellable(token, self.brain.next_action(&input)).await
                    };
                    let decision = match decision {
                        Ok(decision) => decision,
                        Err(ModelError::Cancelled) => return Ok(LoopExit::Stopped),
                        Err(e) => return Err(AgentError::Planner(e)),
                    };
                    feedback = None;
                    let action = decision.action;
                    self.store.log(
                        LogKind::Decision,
                        format!("Planner chose: {}", action.describe()),
                        json!({ "thought": decision.thought, "action": action }),
                    );

                    let fp = fingerprint(&action);
                    if !action.is_done() && is_repeated_failure(&session.history, &fp) {
                        consecutive_blocks += 1;
                        feedback = Some(format!(
                            "Do not repeat this action/target: {} already failed {} or more times recently. Choose a different element or approach.",
                            action.describe(),
                            REPEAT_THRESHOLD
                        ));
                        self.store.log(
                            LogKind::Warning,
                            format!("Blocked repeated failing action: {}", action.describe()),
                            json!({ "fingerprint": fp, "consecutiveBlocks": consecutive_blocks }),
                        );
                        if consecutive_blocks >= MAX_CONSECUTIVE_BLOCKS {
                            // The planner is stuck; let the block cost a step so
                            // the budget still bounds the run.
                            consecutive_blocks = 0;
                            executed += 1;
                            self.advance_step(session);
                            self.record(
                                session,
                                action,
                                ExecutionResult::failed("REPEAT_BLOCKED", "not executed"),
                                &obs.url,
                                StepOutcome::RepeatBlocked,
                                Some(fp),
                            );
                            previous_obs = Some(obs);
                            Phase::Observe
                        } else {
                            Phase::Plan { obs }
                        }
                    } else {
                        consecutive_blocks = 0;
                        executed += 1;
                        self.advance_step(session);
                        Phase::Execute { obs, action }
                    }
                }

                Phase::Execute { obs, action } => {
                    self.set_status(RunStatus::ExecutingAction);
                    let attempt = if matches!(action, Action::Wait { .. }) {
                        tokio::select! {
                            _ = token.cancelled() => return Ok(LoopExit::Stopped),
                            r = self.executor.execute(&session.tab, &action) => r,
                        }
                    } else {
                        self.executor.execute(&session.tab, &action).await
                    };

                    match attempt {
                        Err(e) => {
                            let message = e.to_string();
                            self.store.log(
                                LogKind::Execution,
                                format!("Step {} {} errored: {}", session.step, action.kind(), message),
                                Value::Null,
                            );
                            feedback = Some(format!(
                                "Executing {} failed with an error: {}. Try a different approach.",
                                action.describe(),
                                message
                            ));
                            self.record(
                                session,
                                action,
                                ExecutionResult::failed("EXECUTION_ERROR", message),
                                &obs.url,
                                StepOutcome::ExecutionFailed,
                                None,
                            );
                            previous_obs = Some(obs);
                            Phase::Settle
                        }
                        Ok(ExecutionResult::Failed { code, message }) => {
                            self.store.log(
                                LogKind::Execution,
                                format!("Step {} {} failed: {} ({})", session.step, action.kind(), message, code),
                                json!({ "code": code }),
                            );
                            feedback = Some(format!(
                                "{} failed: {} ({}). Pick another target or approach.",
                                action.describe(),
                                message,
                                code
                            ));
                            let note = format!("{}: {}", code, message);
                            self.record(
                                session,
                                action,
                                ExecutionResult::Failed { code, message },
                                &obs.url,
                                StepOutcome::ExecutionFailed,
                                Some(note),
                            );
                            previous_obs = Some(obs);
                            Phase::Settle
                        }
                        Ok(exec) => {
                            self.store.log(
                                LogKind::Execution,
                                format!("Step {} executed: {}", session.step, action.describe()),
                                serde_json::to_value(&exec).unwrap_or(Value::Null),
                            );
                            Phase::Verify {
                                before: obs,
                                action,
                                exec,
                            }
                        }
                    }
                }

                Phase::Verify {
                    before,
                    action,
                    exec,
                } => {
                    let after = if action.is_done() {
                        before.clone()
                    } else {
                        self.set_status(RunStatus::ReadingBrowser);
                        self.observe(&session.tab).await?
                    };
                    self.set_status(RunStatus::VerifyingAction);
                    let verdict = verifier::verify(VerifyInput {
                        action: &action,
                        before: &before,
                        after: &after,
                        exec_result: &exec,
                    });
                    self.store.log(
                        LogKind::Verification,
                        format!(
                            "Verification {} for {}: {}",
                            verdict.code.as_str(),
                            action.kind(),
                            verdict.message
                        ),
                        serde_json::to_value(&verdict).unwrap_or(Value::Null),
                    );

                    if !verdict.ok {
                        feedback = Some(format!(
                            "{} was rejected by verification ({}): {}. The page did not change as intended; do not assume it worked.",
                            action.describe(),
                            verdict.code.as_str(),
                            verdict.message
                        ));
                        let note = format!("{}: {}", verdict.code.as_str(), verdict.message);
                        self.record(
                            session,
                            action,
                            exec,
                            &after.url,
                            StepOutcome::VerificationRejected,
                            Some(note),
                        );
                        previous_obs = Some(after);
                        Phase::Settle
                    } else if let Action::Done { result } = &action {
                        let result = result.clone();
                        Phase::DoneGate {
                            before_done: previous_obs.take().unwrap_or_else(|| before.clone()),
                            at_done: after,
                            action,
                            exec,
                            result,
                        }
                    } else {
                        self.record(
                            session,
                            action,
                            exec,
                            &after.url,
                            StepOutcome::Succeeded,
                            None,
                        );
                        previous_obs = Some(after);
                        Phase::Settle
                    }
                }

                Phase::DoneGate {
                    before_done,
                    at_done,
                    action,
                    exec,
                    result,
                } => {
                    let Some(verdict) = self
                        .check_done(goal, session, &result, &before_done, &at_done, token)
                        .await
                    else {
                        return Ok(LoopExit::Stopped);
                    };
                    let rejection = if !verdict.accept {
                        let mut text = format!("Your done claim was rejected: {}.", verdict.reason);
                        if let Some(guidance) = verdict.guidance.as_deref().filter(|g| !g.is_empty()) {
                            text.push_str(&format!(" Guidance: {}", guidance));
                        }
                        Some(text)
                    } else {
                        completion_gate(goal, &result, &at_done, &session.history)
                    };

                    match rejection {
                        Some(reason) => {
                            self.store.log(
                                LogKind::Done,
                                format!("Done claim rejected: {}", reason),
                                serde_json::to_value(&verdict).unwrap_or(Value::Null),
                            );
                            self.record(
                                session,
                                action,
                                exec,
                                &at_done.url,
                                StepOutcome::DoneRejected,
                                Some(reason.clone()),
                            );
                            feedback = Some(reason);
                            previous_obs = Some(at_done);
                            Phase::Observe
                        }
                        None => {
                            self.store.log(
                                LogKind::Done,
                                format!("Done claim accepted: {}", verdict.reason),
                                serde_json::to_value(&verdict).unwrap_or(Value::Null),
                            );
                            self.record(
                                session,
                                action,
                                exec,
                                &at_done.url,
                                StepOutcome::Succeeded,
                                None,
                            );
                            return Ok(LoopExit::Completed(result));
                        }
                    }
                }

                Phase::Settle => {
                    // Let any navigation the action triggered land before the
                    // next observation.
                    if self.config.step_settle_ms > 0 {
                        let settle = Duration::from_millis(self.config.step_settle_ms);
                        tokio::select! {
                            _ = token.cancelled() => return Ok(LoopExit::Stopped),
                            _ = tokio::time::sleep(settle) => {}
                        }
                    }
                    Phase::Observe
                }
            };
        }
    }

    /// `None` when the run was cancelled while the checker was thinking.
    async fn check_done(
        &self,
        goal: &str,
        session: &Session,
        result: &DoneResult,
        before_done: &Observation,
        at_done: &Observation,
        token: &CancellationToken,
    ) -> Option<DoneVerdict> {
        let recent_start = session
            .history
            .len()
            .saturating_sub(DONE_CHECK_RECENT_ACTIONS);
        let input = DoneCheckInput {
            goal,
            done_result: result,
            observation_before_done: before_done,
            observation_at_done: at_done,
            recent_actions: session.history[recent_start..]
                .iter()
                .map(ActionSummary::from)
                .collect(),
        };
        match cancellable(token, self.brain.check_done(&input)).await {
            Ok(verdict) => Some(verdict),
            Err(ModelError::Cancelled) => None,
            Err(e) => {
                self.store.log(
                    LogKind::Warning,
                    format!("Done checker unavailable ({}); using local fallback", e),
                    Value::Null,
                );
                Some(fallback_done_verdict(result))
            }
        }
    }

    async fn observe(&self, tab: &TabHandle) -> Result<Observation> {
        let obs = dom::capture(self.host.as_ref(), tab)
            .await
            .map_err(|e| AgentError::Capture(format!("{:#}", e)))?;
        self.store.log(
            LogKind::Observation,
            format!(
                "Observed {} ({:?}, {} interactive, {} fields)",
                obs.url,
                obs.page_kind,
                obs.interactive.len(),
                obs.editable_fields.len()
            ),
            json!({
                "url": obs.url,
                "title": obs.title,
                "pageKind": obs.page_kind,
                "pageSignature": obs.page_signature,
                "formStateHash": obs.form_state_hash,
                "modal": obs.active_modal,
                "note": obs.note,
            }),
        );
        Ok(obs)
    }

    fn record(
        &self,
        session: &mut Session,
        action: Action,
        exec_result: ExecutionResult,
        observed_url: &str,
        outcome: StepOutcome,
        note: Option<String>,
    ) {
        session.history.push(StepRecord {
            step: session.step,
            action,
            exec_result,
            observed_url: observed_url.to_string(),
            outcome,
            note,
        });
    }

    fn advance_step(&self, session: &mut Session) {
        session.step += 1;
        let step = session.step;
        self.store.update(|s| s.step = step);
    }

    fn set_status(&self, status: RunStatus) {
        self.store.update(|s| s.status = status);
    }

    fn mark_failed(&self, error: &AgentError) {
        let message = error.to_string();
        warn!(error = %message, "run failed");
        self.store.update(|s| {
            s.is_running = false;
            s.status = RunStatus::Failed;
            s.last_error = Some(message.clone());
            s.ended_at = Some(Utc::now());
        });
        self.store
            .log(LogKind::Error, format!("Run failed: {}", message), Value::Null);
    }
}

/// Races a model call against the run's cancellation token; dropping the
/// losing future aborts the in-flight HTTP request.
async fn cancellable<T>(
    token: &CancellationToken,
    call: impl Future<Output = std::result::Result<T, ModelError>>,
) -> std::result::Result<T, ModelError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ModelError::Cancelled),
        result = call => result,
    }
}

fn normalized_goal(goal: &str) -> Result<String> {
    let goal = goal.trim();
    if goal.is_empty() {
        return Err(AgentError::EmptyGoal);
    }
    Ok(goal.to_string())
}

fn new_session_id() -> String {
    let id = format!("sess-{:016x}", rand::random::<u64>());
    info!(session = %id, "new session");
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::QuizProgress;

    fn record(action: Action, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            step: 1,
            action,
            exec_result: ExecutionResult::failed("X", "x"),
            observed_url: "https://a.example".into(),
            outcome,
            note: None,
        }
    }

    #[test]
    fn fingerprints_are_deterministic() {
        let a = Action::ClickText {
            text: "  Add   to Cart ".into(),
        };
        let b = Action::ClickText {
            text: "add to cart".into(),
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), "click_text:add to cart");

        let c = Action::ClickText {
            text: "Checkout".into(),
        };
        assert_ne!(fingerprint(&a), fingerprint(&c));

        let s1 = Action::ClickSelector {
            selector: "#a".into(),
        };
        let s2 = Action::ClickSelector {
            selector: "#b".into(),
        };
        assert_ne!(fingerprint(&s1), fingerprint(&s2));

        let t1 = Action::TypeSelector {
            selector: "#q".into(),
            text: "one".into(),
        };
        let t2 = Action::TypeSelector {
            selector: "#q".into(),
            text: "two".into(),
        };
        assert_eq!(fingerprint(&t1), fingerprint(&t2));

        let u1 = Action::OpenUrl {
            url: "https://a.example/".into(),
        };
        let u2 = Action::OpenUrl {
            url: "https://b.example".into(),
        };
        assert_eq!(fingerprint(&u1), "open_url:https://a.example");
        assert_ne!(fingerprint(&u1), fingerprint(&u2));
    }

    #[test]
    fn two_failures_within_window_block_the_third() {
        let click = Action::ClickText {
            text: "Buy".into(),
        };
        let fp = fingerprint(&click);
        let mut history = vec![record(click.clone(), StepOutcome::ExecutionFailed)];
        assert!(!is_repeated_failure(&history, &fp));
        history.push(record(click.clone(), StepOutcome::VerificationRejected));
        assert!(is_repeated_failure(&history, &fp));
    }

    #[test]
    fn successes_and_old_failures_do_not_block() {
        let click = Action::ClickText {
            text: "Next".into(),
        };
        let fp = fingerprint(&click);
        let history = vec![
            record(click.clone(), StepOutcome::Succeeded),
            record(click.clone(), StepOutcome::Succeeded),
            record(click.clone(), StepOutcome::Succeeded),
        ];
        assert!(!is_repeated_failure(&history, &fp));

        let mut history = vec![
            record(click.clone(), StepOutcome::ExecutionFailed),
            record(click.clone(), StepOutcome::ExecutionFailed),
        ];
        for _ in 0..REPEAT_WINDOW {
            history.push(record(Action::Wait { ms: 100 }, StepOutcome::Succeeded));
        }
        assert!(!is_repeated_failure(&history, &fp));
    }

    #[test]
    fn quiz_gate_requires_all_answers() {
        let mut obs = Observation::restricted("https://quiz.example");
        obs.quiz_progress = Some(QuizProgress {
            answered: Some(4),
            current: None,
            total: 5,
        });
        let reason = completion_gate("finish the quiz", &DoneResult::new("done"), &obs, &[]);
        assert!(reason.unwrap().contains("4 of 5"));

        let blocked = DoneResult {
            blocked: true,
            ..DoneResult::new("login required")
        };
        assert!(completion_gate("finish the quiz", &blocked, &obs, &[]).is_none());
        assert!(completion_gate("buy shoes", &DoneResult::new("done"), &obs, &[]).is_none());
    }

    #[test]
    fn document_gate_requires_typing() {
        let mut obs = Observation::restricted("https://docs.google.com/document/d/x/edit");
        obs.page_kind = PageKind::DocumentEditor;
        let goal = "write a short poem in this doc";
        assert!(completion_gate(goal, &DoneResult::new("wrote"), &obs, &[]).is_some());

        let typed = record(
            Action::TypeSelector {
                selector: ".kix-page".into(),
                text: "roses".into(),
            },
            StepOutcome::Succeeded,
        );
        assert!(completion_gate(goal, &DoneResult::new("wrote"), &obs, &[typed]).is_none());
    }
}
