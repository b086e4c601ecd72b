mod face;

use anyhow::Result;
use browser_pilot::chrome::{ChromeHost, DEFAULT_DEBUG_ENDPOINT, LaunchSettings};
use browser_pilot::{AgentConfig, OpenAiChat, Orchestrator, RuntimeStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent", version, about = "Goal-driven browser agent with a local control page")]
struct Args {
    /// First port to try for the control page; the next nine are fallbacks.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Step budget per run (overrides AGENT_MAX_STEPS).
    #[arg(long)]
    max_steps: Option<u32>,

    /// Chat model name (overrides OPENAI_MODEL).
    #[arg(long)]
    model: Option<String>,

    /// Launch Chrome headless when no debugging Chrome is attached.
    #[arg(long)]
    headless: bool,

    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// DevTools endpoint of an already running Chrome to attach to.
    #[arg(long, default_value = DEFAULT_DEBUG_ENDPOINT)]
    attach: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("browser_pilot=info,agent=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::from_env();
    if let Some(steps) = args.max_steps {
        config.max_steps = steps;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let model = Arc::new(OpenAiChat::new(&config)?);
    let store = Arc::new(RuntimeStore::new(config.state_file.clone()));

    // Claim the port before Chrome starts so a second agent fails fast.
    let (listener, port) = face::bind(args.port).await?;

    info!("connecting to chrome...");
    let host = ChromeHost::attach_or_launch(
        &args.attach,
        LaunchSettings {
            headless: args.headless,
            chrome_path: args.chrome_path,
            profile_dir: None,
        },
    )
    .await?;

    let orchestrator = Arc::new(Orchestrator::new(Arc::new(host), model, store, config));
    info!("control page at http://localhost:{}", port);
    face::serve(
        listener,
        face::AppState {
            orchestrator,
            http: reqwest::Client::new(),
        },
    )
    .await
}
