use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use browser_pilot::{
    AgentError, CompletionReport, Orchestrator, PendingPlan, RunMode, RunOutcome, RuntimeState,
    StopAck,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub http: reqwest::Client,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(err: AgentError) -> ApiError {
    let status = match err {
        AgentError::AlreadyRunning => StatusCode::CONFLICT,
        AgentError::EmptyGoal => StatusCode::BAD_REQUEST,
        AgentError::NoPendingPlan => StatusCode::NOT_FOUND,
        AgentError::Cancelled => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn accepted() -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({ "accepted": true })))
}

#[derive(Deserialize)]
struct GoalPayload {
    goal: String,
}

#[derive(Deserialize)]
struct RunPayload {
    goal: String,
    #[serde(default)]
    mode: RunMode,
}

#[derive(Deserialize)]
struct RelayPayload {
    goal: String,
    #[serde(default)]
    callback_url: Option<String>,
}

/// Binds the first free port in `port..port + 10`.
pub async fn bind(port: u16) -> Result<(TcpListener, u16)> {
    for p in port..port.saturating_add(10) {
        match TcpListener::bind(format!("127.0.0.1:{}", p)).await {
            Ok(listener) => return Ok((listener, p)),
            Err(e) => warn!(port = p, error = %e, "port unavailable"),
        }
    }
    anyhow::bail!(
        "could not bind to any port {}-{}; stop the old agent first",
        port,
        port.saturating_add(9)
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/state", get(state_handler))
        .route("/events", get(sse_handler))
        .route("/plan", post(plan_handler))
        .route("/plan/approve", post(approve_handler))
        .route("/plan/reject", post(reject_handler))
        .route("/run", post(run_handler))
        .route("/stop", post(stop_handler))
        .route("/relay/task", post(relay_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("web server stopped")
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn state_handler(State(app): State<AppState>) -> Json<RuntimeState> {
    Json(app.orchestrator.runtime_state())
}

fn state_event(state: &RuntimeState) -> Option<Event> {
    Event::default().event("state").json_data(state).ok()
}

/// Current state first, then every published change. Lagging clients skip
/// to the newest state.
async fn sse_handler(
    State(app): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = app.orchestrator.subscribe();
    let initial = state_event(&app.orchestrator.runtime_state());
    let updates = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(state) => state_event(&state),
        Err(_) => None,
    });
    let stream = tokio_stream::iter(initial)
        .chain(updates)
        .map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn plan_handler(
    State(app): State<AppState>,
    Json(payload): Json<GoalPayload>,
) -> std::result::Result<Json<PendingPlan>, ApiError> {
    info!(goal = %payload.goal, "POST /plan");
    app.orchestrator
        .generate_plan(&payload.goal)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn approve_handler(
    State(app): State<AppState>,
) -> std::result::Result<(StatusCode, Json<Value>), ApiError> {
    if app.orchestrator.is_busy() {
        return Err(api_error(AgentError::AlreadyRunning));
    }
    if app.orchestrator.runtime_state().pending_plan.is_none() {
        return Err(api_error(AgentError::NoPendingPlan));
    }
    let orchestrator = app.orchestrator.clone();
    spawn_run(async move { orchestrator.approve_plan().await });
    Ok(accepted())
}

async fn reject_handler(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "rejected": app.orchestrator.reject_plan() }))
}

async fn run_handler(
    State(app): State<AppState>,
    Json(payload): Json<RunPayload>,
) -> std::result::Result<(StatusCode, Json<Value>), ApiError> {
    if payload.goal.trim().is_empty() {
        return Err(api_error(AgentError::EmptyGoal));
    }
    if app.orchestrator.is_busy() {
        return Err(api_error(AgentError::AlreadyRunning));
    }
    let orchestrator = app.orchestrator.clone();
    spawn_run(async move { orchestrator.run(&payload.goal, payload.mode).await });
    Ok(accepted())
}

async fn stop_handler(State(app): State<AppState>) -> Json<StopAck> {
    Json(app.orchestrator.request_stop())
}

/// Relay boundary: runs the goal and reports back to `callback_url`, even
/// when the run could not start.
async fn relay_handler(
    State(app): State<AppState>,
    Json(payload): Json<RelayPayload>,
) -> (StatusCode, Json<Value>) {
    info!(goal = %payload.goal, callback = ?payload.callback_url, "relay task received");
    tokio::spawn(async move {
        let outcome = app.orchestrator.run(&payload.goal, RunMode::New).await;
        log_outcome(&outcome);
        let report = CompletionReport::from_outcome(&outcome);
        if let Some(url) = payload.callback_url {
            match app.http.post(&url).json(&report).send().await {
                Ok(resp) if resp.status().is_success() => info!(%url, "completion report delivered"),
                Ok(resp) => warn!(%url, status = %resp.status(), "completion report rejected"),
                Err(e) => warn!(%url, error = %e, "completion report not delivered"),
            }
        }
    });
    accepted()
}

fn spawn_run<F>(run: F)
where
    F: Future<Output = std::result::Result<RunOutcome, AgentError>> + Send + 'static,
{
    tokio::spawn(async move {
        log_outcome(&run.await);
    });
}

fn log_outcome(outcome: &std::result::Result<RunOutcome, AgentError>) {
    match outcome {
        Ok(outcome) => info!(?outcome, "run finished"),
        Err(e) => warn!(error = %e, "run ended with error"),
    }
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Browser Pilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 20px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .status { margin-left: auto; font-size: 13px; color: #888; font-family: monospace; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  .dot.busy { background: #f59e0b; animation: pulse 1.2s infinite; }
  .dot.failed { background: #ef4444; }
  @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.4; } }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 20px 32px;
    gap: 12px;
    overflow: hidden;
  }
  #plan {
    display: none;
    background: #111118;
    border-left: 3px solid #6366f1;
    border-radius: 8px;
    padding: 12px 16px;
    font-size: 14px;
    line-height: 1.5;
  }
  #plan ol { margin: 8px 0 8px 20px; }
  #plan .risks { color: #fcd34d; font-size: 13px; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; padding-right: 8px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 13px; line-height: 1.45; background: #111118; border-left: 3px solid #333; }
  .entry .kind { color: #6366f1; font-weight: 700; margin-right: 8px; font-family: monospace; }
  .entry.decision { border-left-color: #3b82f6; }
  .entry.execution { border-left-color: #0ea5e9; }
  .entry.verification { border-left-color: #a855f7; }
  .entry.done { border-left-color: #22c55e; color: #86efac; }
  .entry.warning { border-left-color: #f59e0b; color: #fcd34d; }
  .entry.error { border-left-color: #ef4444; color: #fca5a5; background: #1a0a0a; }
  .input-area { display: flex; gap: 8px; flex-wrap: wrap; }
  #goal {
    flex: 1 1 100%;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 12px 16px;
    color: #fff;
    font-size: 16px;
    outline: none;
  }
  #goal:focus { border-color: #6366f1; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 10px 18px;
    font-size: 14px;
    font-weight: 600;
    cursor: pointer;
  }
  button.secondary { background: #27273a; }
  button.danger { background: #b91c1c; }
  button:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="dot"></div>
    <h1>Browser Pilot</h1>
    <div class="status" id="status">idle</div>
  </header>
  <div class="main">
    <div id="plan"></div>
    <div id="log"></div>
    <div class="input-area">
      <input type="text" id="goal" placeholder="Describe the goal..." autofocus />
      <button id="btn-plan" onclick="post('/plan', {goal: goalText()})">Plan</button>
      <button id="btn-approve" class="secondary" onclick="post('/plan/approve')">Approve plan</button>
      <button id="btn-reject" class="secondary" onclick="post('/plan/reject')">Reject plan</button>
      <button id="btn-run" onclick="post('/run', {goal: goalText(), mode: 'new'})">Run</button>
      <button id="btn-continue" class="secondary" onclick="post('/run', {goal: goalText(), mode: 'continue'})">Continue</button>
      <button id="btn-stop" class="danger" onclick="post('/stop')">Stop</button>
    </div>
  </div>
<script>
  const esc = s => String(s ?? '').replace(/&/g, '&amp;').replace(/</g, '&lt;');
  const $ = id => document.getElementById(id);
  let lastGoal = '';

  function goalText() {
    return $('goal').value.trim() || lastGoal;
  }

  async function post(path, body) {
    const resp = await fetch(path, {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: body === undefined ? '{}' : JSON.stringify(body),
    });
    if (!resp.ok) {
      const d = await resp.json().catch(() => ({}));
      alert(d.error || resp.statusText);
    }
  }

  function renderPlan(plan) {
    const el = $('plan');
    if (!plan) { el.style.display = 'none'; return; }
    const steps = plan.steps.map(s => '<li><strong>' + esc(s.title) + '</strong> ' + esc(s.details) + '</li>').join('');
    const risks = plan.risks.length ? '<div class="risks">Risks: ' + plan.risks.map(esc).join('; ') + '</div>' : '';
    const confirm = plan.requiresConfirmationBefore.length
      ? '<div class="risks">Confirm before: ' + plan.requiresConfirmationBefore.map(esc).join('; ') + '</div>' : '';
    el.innerHTML = '<strong>Plan:</strong> ' + esc(plan.summary) + '<ol>' + steps + '</ol>' + risks + confirm;
    el.style.display = 'block';
  }

  function renderLogs(logs) {
    const log = $('log');
    const atBottom = log.scrollTop + log.clientHeight >= log.scrollHeight - 20;
    log.innerHTML = logs.map(e =>
      '<div class="entry ' + e.kind + '"><span class="kind">' + e.kind + '</span>' + esc(e.message) + '</div>'
    ).join('');
    if (atBottom) log.scrollTop = log.scrollHeight;
  }

  function render(state) {
    if (state.goal) lastGoal = state.goal;
    const busy = state.isRunning || state.status === 'planning_run';
    $('dot').className = 'dot' + (busy ? ' busy' : state.status === 'failed' ? ' failed' : '');
    let status = state.status + (state.step ? ' · step ' + state.step : '');
    if (state.lastError) status += ' · ' + state.lastError;
    $('status').textContent = status;
    ['btn-plan', 'btn-run', 'btn-continue'].forEach(id => $(id).disabled = busy);
    $('btn-approve').disabled = busy || !state.pendingPlan;
    $('btn-reject').disabled = busy || !state.pendingPlan;
    $('btn-stop').disabled = !busy;
    renderPlan(state.pendingPlan);
    renderLogs(state.logs || []);
  }

  $('goal').addEventListener('keydown', e => {
    if (e.key === 'Enter') post('/plan', {goal: goalText()});
  });

  const es = new EventSource('/events');
  es.addEventListener('state', e => render(JSON.parse(e.data)));
</script>
</body>
</html>
"##;
