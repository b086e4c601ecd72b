//! Drives the orchestrator end to end against an in-memory browser and a
//! scripted chat model.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use browser_pilot::brain::{ChatModel, ChatRequest};
use browser_pilot::runtime::{LogKind, RunStatus, RuntimeState, RuntimeStore};
use browser_pilot::{
    AgentConfig, AgentError, BrowserHost, ModelError, Orchestrator, PageScript, RunMode,
    RunOutcome, TabHandle,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

const START_URL: &str = "https://start.example/";

struct FakeTab {
    url: String,
    clicks: u32,
    typed: String,
}

/// A browser whose pages are just counters: a click bumps the click count
/// (when enabled) and typing replaces the typed text, both visible in the
/// page text.
#[derive(Default)]
struct FakeHost {
    tabs: Mutex<HashMap<String, FakeTab>>,
    opened: AtomicU32,
    click_calls: AtomicU32,
    clicks_change_page: AtomicBool,
    snapshot_fails: AtomicBool,
}

impl FakeHost {
    fn new() -> Arc<Self> {
        let host = Self::default();
        host.clicks_change_page.store(true, Ordering::SeqCst);
        Arc::new(host)
    }

    fn close_tab(&self, id: &str) {
        self.tabs.lock().remove(id);
    }
}

#[async_trait]
impl BrowserHost for FakeHost {
    async fn open_tab(&self) -> anyhow::Result<TabHandle> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("tab-{}", n);
        self.tabs.lock().insert(
            id.clone(),
            FakeTab {
                url: START_URL.to_string(),
                clicks: 0,
                typed: String::new(),
            },
        );
        Ok(TabHandle {
            id,
            group_id: Some("test-group".to_string()),
        })
    }

    async fn find_tab(&self, tab_id: &str) -> anyhow::Result<Option<TabHandle>> {
        Ok(self.tabs.lock().contains_key(tab_id).then(|| TabHandle {
            id: tab_id.to_string(),
            group_id: Some("test-group".to_string()),
        }))
    }

    async fn tab_url(&self, tab: &TabHandle) -> anyhow::Result<String> {
        self.tabs
            .lock()
            .get(&tab.id)
            .map(|t| t.url.clone())
            .ok_or_else(|| anyhow!("no tab {}", tab.id))
    }

    async fn navigate(&self, tab: &TabHandle, url: &str) -> anyhow::Result<()> {
        let mut tabs = self.tabs.lock();
        let page = tabs.get_mut(&tab.id).ok_or_else(|| anyhow!("no tab"))?;
        page.url = url.to_string();
        Ok(())
    }

    async fn run_in_page(
        &self,
        tab: &TabHandle,
        script: PageScript,
        args: Value,
    ) -> anyhow::Result<Value> {
        let mut tabs = self.tabs.lock();
        let page = tabs.get_mut(&tab.id).ok_or_else(|| anyhow!("no tab"))?;
        match script {
            PageScript::Snapshot => {
                if self.snapshot_fails.load(Ordering::SeqCst) {
                    bail!("page crashed");
                }
                Ok(json!({
                    "url": page.url,
                    "title": "Fake page",
                    "text": format!("clicks={} typed={}", page.clicks, page.typed),
                }))
            }
            PageScript::ReadyState => Ok(json!("complete")),
            PageScript::Click => {
                self.click_calls.fetch_add(1, Ordering::SeqCst);
                if args["selector"] == "#missing" {
                    return Ok(json!({"ok": false, "code": "NOT_FOUND", "message": "nothing matches"}));
                }
                if self.clicks_change_page.load(Ordering::SeqCst) {
                    page.clicks += 1;
                }
                Ok(json!({"ok": true, "mode": "native_click"}))
            }
            PageScript::Type => {
                page.typed = args["text"].as_str().unwrap_or_default().to_string();
                Ok(json!({"ok": true, "mode": "native_value", "targetKind": "input"}))
            }
            PageScript::CloseModal => {
                Ok(json!({"ok": false, "code": "NO_ACTIVE_MODAL", "message": "no modal"}))
            }
        }
    }
}

enum Reply {
    Text(String),
    Fail(ModelError),
    Hang,
}

/// Answers each of the three model roles from its own queue, told apart by
/// the system prompt.
#[derive(Default)]
struct ScriptedModel {
    planner: Mutex<VecDeque<Reply>>,
    planner_default: Mutex<Option<String>>,
    plans: Mutex<VecDeque<Reply>>,
    checks: Mutex<VecDeque<Reply>>,
    planner_inputs: Mutex<Vec<Value>>,
}

impl ScriptedModel {
    fn plan_next(&self, replies: impl IntoIterator<Item = Reply>) {
        self.planner.lock().extend(replies);
    }

    fn check_next(&self, replies: impl IntoIterator<Item = Reply>) {
        self.checks.lock().extend(replies);
    }

    fn planner_input(&self, index: usize) -> Value {
        self.planner_inputs.lock()[index].clone()
    }

    fn next_reply(&self, system: &str, user: &str) -> Option<Reply> {
        if system.starts_with("You audit") {
            self.checks.lock().pop_front()
        } else if system.starts_with("You plan browser") {
            self.plans.lock().pop_front()
        } else {
            self.planner_inputs
                .lock()
                .push(serde_json::from_str(user).unwrap_or(Value::Null));
            self.planner
                .lock()
                .pop_front()
                .or_else(|| self.planner_default.lock().clone().map(Reply::Text))
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ModelError> {
        let reply = self.next_reply(&request.messages[0].content, &request.messages[1].content);
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(ModelError::Empty),
        }
    }
}

fn act(action: Value) -> Reply {
    Reply::Text(json!({ "thought": "next", "action": action }).to_string())
}

fn click(text: &str) -> Value {
    json!({ "type": "click_text", "text": text })
}

fn done(summary: &str) -> Value {
    json!({ "type": "done", "result": { "summary": summary, "evidence": "page shows it" } })
}

fn verdict(accept: bool, reason: &str) -> Reply {
    Reply::Text(json!({ "accept": accept, "reason": reason, "guidance": "look again" }).to_string())
}

fn agent(max_steps: u32) -> (Arc<Orchestrator>, Arc<FakeHost>, Arc<ScriptedModel>) {
    let host = FakeHost::new();
    let config = AgentConfig {
        max_steps,
        ..AgentConfig::immediate()
    };
    let (orchestrator, model) =
        agent_with(host.clone(), Arc::new(RuntimeStore::in_memory()), config);
    (orchestrator, host, model)
}

fn agent_with(
    host: Arc<FakeHost>,
    store: Arc<RuntimeStore>,
    config: AgentConfig,
) -> (Arc<Orchestrator>, Arc<ScriptedModel>) {
    let model = Arc::new(ScriptedModel::default());
    let orchestrator = Orchestrator::new(host, model.clone(), store, config);
    (Arc::new(orchestrator), model)
}

fn keep_clicking(model: &ScriptedModel, text: &str) {
    *model.planner_default.lock() =
        Some(json!({ "thought": "keep going", "action": click(text) }).to_string());
}

async fn wait_until(orchestrator: &Orchestrator, pred: impl Fn(&RuntimeState) -> bool) {
    for _ in 0..400 {
        if pred(&orchestrator.runtime_state()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state never reached: {:?}", orchestrator.runtime_state().status);
}

#[tokio::test]
async fn step_budget_pauses_and_continue_resumes_in_same_tab() {
    let (agent, host, model) = agent(3);
    *model.planner_default.lock() = Some(
        json!({ "thought": "keep going", "action": click("Next") }).to_string(),
    );

    let first = agent.run("click through the wizard", RunMode::New).await.unwrap();
    let RunOutcome::PausedMaxSteps {
        session_id,
        tab_id,
        steps,
    } = first
    else {
        panic!("expected pause, got {:?}", first);
    };
    assert_eq!(steps, 3);
    assert_eq!(host.click_calls.load(Ordering::SeqCst), 3);

    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::PausedMaxSteps);
    assert!(!state.is_running);
    assert_eq!(state.step, 3);
    assert_eq!(state.tab_id.as_deref(), Some(tab_id.as_str()));

    let second = agent
        .run("click through the wizard", RunMode::Continue)
        .await
        .unwrap();
    assert_eq!(
        second,
        RunOutcome::PausedMaxSteps {
            session_id,
            tab_id,
            steps: 6,
        }
    );
    assert_eq!(host.opened.load(Ordering::SeqCst), 1);

    let resumed = model.planner_input(3);
    assert_eq!(resumed["step"], 4);
    assert_eq!(resumed["previous_actions"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn repeated_failing_click_is_blocked_with_feedback() {
    let (agent, host, model) = agent(10);
    host.clicks_change_page.store(false, Ordering::SeqCst);
    model.plan_next([
        act(click("Buy")),
        act(click("Buy")),
        act(click("Buy")),
        act(done("gave up on the broken button")),
    ]);
    model.check_next([verdict(true, "blocked honestly")]);

    let outcome = agent.run("buy the item", RunMode::New).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { steps: 3, .. }), "{:?}", outcome);

    // The third click never reached the page.
    assert_eq!(host.click_calls.load(Ordering::SeqCst), 2);

    let second = model.planner_input(1);
    assert!(
        second["planner_feedback"]
            .as_str()
            .unwrap()
            .contains("NO_PAGE_CHANGE")
    );
    let after_block = model.planner_input(3);
    assert!(
        after_block["planner_feedback"]
            .as_str()
            .unwrap()
            .contains("Do not repeat")
    );
    assert!(
        agent
            .runtime_state()
            .logs
            .iter()
            .any(|e| e.kind == LogKind::Warning && e.message.contains("Blocked repeated"))
    );
}

#[tokio::test]
async fn rejected_done_claim_keeps_running_and_fallback_accepts() {
    let (agent, _host, model) = agent(10);
    model.plan_next([act(done("finished")), act(done("finished for real"))]);
    model.check_next([
        verdict(false, "cart is still empty"),
        Reply::Fail(ModelError::Transport("connection reset".into())),
    ]);

    let outcome = agent.run("add the book to the cart", RunMode::New).await.unwrap();
    match outcome {
        RunOutcome::Completed { steps, result, .. } => {
            assert_eq!(steps, 2);
            assert_eq!(result.summary, "finished for real");
        }
        other => panic!("expected completion, got {:?}", other),
    }

    let feedback = model.planner_input(1)["planner_feedback"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(feedback.contains("cart is still empty"));
    assert!(feedback.contains("look again"));

    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.last_result.unwrap()["summary"], "finished for real");
    assert!(state.logs.iter().any(|e| e.message.contains("local fallback")));
}

#[tokio::test]
async fn invalid_url_is_an_execution_failure_not_a_crash() {
    let (agent, _host, model) = agent(10);
    model.plan_next([
        act(json!({ "type": "open_url", "url": "ftp://files.example/a" })),
        act(json!({ "type": "open_url", "url": "https://shop.example/" })),
        act(done("on the shop")),
    ]);
    model.check_next([verdict(true, "shop is open")]);

    let outcome = agent.run("open the shop", RunMode::New).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { steps: 3, .. }));
    assert!(
        model.planner_input(1)["planner_feedback"]
            .as_str()
            .unwrap()
            .contains("INVALID_URL")
    );
    assert_eq!(
        model.planner_input(2)["observation"]["url"],
        "https://shop.example/"
    );
}

#[tokio::test]
async fn concurrent_run_is_refused_and_stop_ends_the_active_one() {
    let (agent, _host, model) = agent(10);
    model.plan_next([Reply::Hang]);

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run("wait forever", RunMode::New).await })
    };
    wait_until(&agent, |s| s.status == RunStatus::Planning).await;
    let before = agent.runtime_state();

    let err = agent.run("something else", RunMode::New).await.unwrap_err();
    assert!(matches!(err, AgentError::AlreadyRunning));
    let err = agent.generate_plan("something else").await.unwrap_err();
    assert!(matches!(err, AgentError::AlreadyRunning));
    assert_eq!(agent.runtime_state(), before);

    let ack = agent.request_stop();
    assert!(ack.accepted);
    let outcome = runner.await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::Stopped { steps: 0, .. }));

    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::Stopped);
    assert!(!state.is_running);
    assert!(!agent.is_busy());
}

#[tokio::test]
async fn stop_without_active_run_is_not_accepted() {
    let (agent, _host, _model) = agent(10);
    let ack = agent.request_stop();
    assert!(!ack.accepted);
    assert_eq!(ack.status, RunStatus::Idle);
    assert!(!agent.runtime_state().cancel_requested);
}

#[tokio::test]
async fn capture_failure_fails_the_run_and_frees_the_slot() {
    let (agent, host, _model) = agent(10);
    host.snapshot_fails.store(true, Ordering::SeqCst);

    let err = agent.run("read the page", RunMode::New).await.unwrap_err();
    assert!(matches!(err, AgentError::Capture(_)), "{:?}", err);

    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(!state.is_running);
    assert!(state.last_error.unwrap().contains("page crashed"));

    let err = agent.run("read the page", RunMode::New).await.unwrap_err();
    assert!(matches!(err, AgentError::Capture(_)));
}

#[tokio::test]
async fn empty_goal_is_refused_without_state_change() {
    let (agent, _host, _model) = agent(10);
    let err = agent.run("   ", RunMode::New).await.unwrap_err();
    assert!(matches!(err, AgentError::EmptyGoal));
    assert_eq!(agent.runtime_state(), RuntimeState::default());
}

#[tokio::test]
async fn approved_plan_runs_in_the_planning_tab() {
    let (agent, host, model) = agent(10);
    model.plans.lock().push_back(Reply::Text(
        json!({
            "summary": "Order a pizza",
            "steps": [{ "title": "Open menu", "details": "find pizzas" }, "Check out"],
            "risks": ["charges the saved card"],
            "requires_confirmation_before": ["payment"],
        })
        .to_string(),
    ));
    model.plan_next([act(done("pizza ordered"))]);
    model.check_next([verdict(true, "confirmation page shown")]);

    let plan = agent.generate_plan("order a pizza").await.unwrap();
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[1].title, "Check out");
    assert_eq!(plan.requires_confirmation_before, vec!["payment".to_string()]);

    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::AwaitingPlanApproval);
    assert_eq!(state.pending_plan.as_ref(), Some(&plan));

    let outcome = agent.approve_plan().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { steps: 1, .. }));
    assert_eq!(host.opened.load(Ordering::SeqCst), 1);
    assert_eq!(
        model.planner_input(0)["approved_plan"]["summary"],
        "Order a pizza"
    );
    assert!(agent.runtime_state().pending_plan.is_none());
}

#[tokio::test]
async fn rejected_plan_cannot_be_approved() {
    let (agent, _host, model) = agent(10);
    model.plans.lock().push_back(Reply::Text(
        json!({ "summary": "Delete the account", "steps": ["Open settings"] }).to_string(),
    ));

    agent.generate_plan("delete my account").await.unwrap();
    assert!(agent.reject_plan());
    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::Ready);
    assert!(state.pending_plan.is_none());

    let err = agent.approve_plan().await.unwrap_err();
    assert!(matches!(err, AgentError::NoPendingPlan));
    assert!(!agent.reject_plan());
}

#[tokio::test]
async fn planner_error_is_fatal() {
    let (agent, _host, model) = agent(10);
    model.plan_next([Reply::Text(r#"{"thought": "?", "action": {"type": "teleport"}}"#.into())]);

    let err = agent.run("do something", RunMode::New).await.unwrap_err();
    assert!(matches!(err, AgentError::Planner(ModelError::Parse(_))), "{:?}", err);
    assert_eq!(agent.runtime_state().status, RunStatus::Failed);
}

#[tokio::test]
async fn stuck_planner_is_charged_a_step_per_three_blocks() {
    let (agent, host, model) = agent(3);
    host.clicks_change_page.store(false, Ordering::SeqCst);
    keep_clicking(&model, "Buy");

    let outcome = agent.run("buy the item", RunMode::New).await.unwrap();
    assert!(
        matches!(outcome, RunOutcome::PausedMaxSteps { steps: 3, .. }),
        "{:?}",
        outcome
    );
    // Two real clicks, then three blocked proposals folded into one step.
    assert_eq!(host.click_calls.load(Ordering::SeqCst), 2);
    assert_eq!(model.planner_inputs.lock().len(), 5);

    agent.run("buy the item", RunMode::Continue).await.unwrap();
    let resumed = model.planner_input(5);
    let history = resumed["previous_actions"].as_array().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0]["outcome"], "verification_rejected");
    assert_eq!(history[2]["outcome"], "repeat_blocked");
    assert_eq!(host.click_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn continue_replaces_a_closed_tab_in_the_same_session() {
    let (agent, host, model) = agent(10);
    model.plan_next([act(done("first")), act(done("second"))]);
    model.check_next([verdict(true, "ok"), verdict(true, "ok")]);

    let RunOutcome::Completed { session_id, .. } =
        agent.run("read the page", RunMode::New).await.unwrap()
    else {
        panic!("expected completion");
    };
    host.close_tab("tab-1");

    let outcome = agent.run("read the page", RunMode::Continue).await.unwrap();
    let RunOutcome::Completed {
        session_id: resumed, ..
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(resumed, session_id);
    assert_eq!(host.opened.load(Ordering::SeqCst), 2);

    let state = agent.runtime_state();
    assert_eq!(state.tab_id.as_deref(), Some("tab-2"));
    assert!(
        state
            .logs
            .iter()
            .any(|e| e.kind == LogKind::Warning && e.message.contains("tab-1 is gone"))
    );
}

#[tokio::test]
async fn continue_after_restart_uses_the_persisted_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime_state.json");
    let host = FakeHost::new();
    let config = AgentConfig {
        max_steps: 1,
        ..AgentConfig::immediate()
    };

    let first_store = Arc::new(RuntimeStore::new(Some(path.clone())));
    let (first, model) = agent_with(host.clone(), first_store.clone(), config.clone());
    keep_clicking(&model, "Next");
    let RunOutcome::PausedMaxSteps {
        session_id, tab_id, ..
    } = first.run("click through the wizard", RunMode::New).await.unwrap()
    else {
        panic!("expected pause");
    };
    first_store.flush();

    let (restarted, model) = agent_with(
        host.clone(),
        Arc::new(RuntimeStore::new(Some(path))),
        config,
    );
    keep_clicking(&model, "Next");
    let outcome = restarted
        .run("click through the wizard", RunMode::Continue)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::PausedMaxSteps {
            session_id,
            tab_id,
            steps: 2,
        }
    );
    assert_eq!(host.opened.load(Ordering::SeqCst), 1);
    assert_eq!(model.planner_input(0)["step"], 2);
    assert!(
        model.planner_input(0)["previous_actions"]
            .as_array()
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn continue_trims_history_to_the_configured_limit() {
    let host = FakeHost::new();
    let config = AgentConfig {
        max_steps: 3,
        history_limit: 2,
        ..AgentConfig::immediate()
    };
    let (agent, model) = agent_with(host, Arc::new(RuntimeStore::in_memory()), config);
    keep_clicking(&model, "Next");

    agent.run("click through the wizard", RunMode::New).await.unwrap();
    agent
        .run("click through the wizard", RunMode::Continue)
        .await
        .unwrap();

    let resumed = model.planner_input(3);
    let history = resumed["previous_actions"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["step"], 2);
    assert_eq!(history[1]["step"], 3);
}

#[tokio::test]
async fn rejected_plans_reuse_one_planning_tab() {
    let (agent, host, model) = agent(10);
    for summary in ["First idea", "Second idea"] {
        model
            .plans
            .lock()
            .push_back(Reply::Text(json!({ "summary": summary, "steps": ["Look"] }).to_string()));
    }
    model.plan_next([act(done("looked"))]);
    model.check_next([verdict(true, "ok")]);

    agent.generate_plan("look around").await.unwrap();
    assert!(agent.reject_plan());
    agent.generate_plan("look around").await.unwrap();
    assert!(agent.reject_plan());
    assert_eq!(host.opened.load(Ordering::SeqCst), 1);

    // A new run claims the parked tab instead of opening another.
    let outcome = agent.run("look around", RunMode::New).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(host.opened.load(Ordering::SeqCst), 1);
    assert_eq!(agent.runtime_state().tab_id.as_deref(), Some("tab-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_right_after_start_is_honoured() {
    let (agent, _host, model) = agent(10);
    // However late the stop lands, the run can't finish on its own.
    model.plan_next([act(click("Next")), act(click("Next")), Reply::Hang]);

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run("click forever", RunMode::New).await })
    };
    while !agent.is_busy() {
        tokio::task::yield_now().await;
    }
    assert!(agent.request_stop().accepted);

    let outcome = runner.await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::Stopped { .. }), "{:?}", outcome);
    let state = agent.runtime_state();
    assert_eq!(state.status, RunStatus::Stopped);
    assert!(state.cancel_requested);
}
