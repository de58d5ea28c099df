//! taskloom — task-orchestration runtime for LLM-driven workflows
//!
//! Usage:
//!   taskloom task <identifier> [key=value ...] [--help]
//!   taskloom task '(sexp …)'
//!
//! Exit codes: 0 success, 2 parse/input error, 3 input validation
//! failure, 4 resource exhaustion, 5 task failure, 6 identifier not
//! found, 7 cancelled.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taskloom::dispatcher::{render_human, render_json, DispatchOutput, Dispatcher};
use taskloom_engine::{Engine, EngineConfig};
use taskloom_llm::{AnthropicProvider, LlmProvider, MockProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskloom",
    about = "Task-orchestration runtime for LLM-driven workflows",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory of *.toml task templates to register at startup
    #[arg(long, global = true)]
    templates: Option<PathBuf>,

    /// JSON file of {absolute_path: description} entries for the file index
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    /// Emit the result as JSON instead of the human-readable form
    #[arg(long, global = true)]
    json: bool,

    /// Use the deterministic mock provider instead of a live LLM
    #[arg(long, global = true)]
    mock: bool,

    /// Override the default model
    #[arg(long, global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task, direct tool, or S-expression workflow
    Task {
        /// Identifier with key=value arguments, or a parenthesised
        /// S-expression
        input: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(model) = &cli.model {
        config.default_model = model.clone();
    }

    let provider: Arc<dyn LlmProvider> = if cli.mock {
        Arc::new(MockProvider::echo())
    } else {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY is not set (use --mock for offline runs)")?;
        Arc::new(AnthropicProvider::new(api_key))
    };

    let cancel = CancellationToken::new();
    let tools = taskloom_tools::create_default_registry(&config.workdir);
    let engine = Arc::new(Engine::new(provider, tools, config).with_cancel(cancel.clone()));

    if let Some(dir) = &cli.templates {
        engine
            .templates()
            .load_dir(dir)
            .with_context(|| format!("loading templates from {}", dir.display()))?;
    }
    if let Some(path) = &cli.index {
        load_index(&engine, path)
            .with_context(|| format!("loading file index from {}", path.display()))?;
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        }
    });

    let Commands::Task { input } = cli.command;
    if input.is_empty() {
        bail!("no input given; try: taskloom task <identifier> [key=value ...]");
    }
    let input = input.join(" ");

    let dispatcher = Dispatcher::new(engine);
    let output = dispatcher.dispatch(&input).await;
    let code = output.exit_code();

    match &output {
        DispatchOutput::Help(text) => println!("{}", text),
        DispatchOutput::ParseError(message) => eprintln!("parse error: {}", message),
        DispatchOutput::Result(result) => {
            if cli.json {
                println!("{}", render_json(result));
            } else {
                println!("{}", render_human(result));
            }
        }
    }

    std::process::exit(code);
}

fn load_index(engine: &Engine, path: &PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;
    let mut loaded = 0usize;
    for (path, description) in entries {
        let Some(description) = description.as_str() else {
            bail!("index values must be strings, got {} for '{}'", description, path);
        };
        engine
            .index()
            .insert(path.clone(), description)
            .map_err(anyhow::Error::msg)?;
        loaded += 1;
    }
    tracing::info!("indexed {} file(s)", loaded);
    Ok(())
}
