mod cli_adapter;
mod config;
mod coordinator;
mod format;
mod literal;
mod render;
mod serving;
mod slack_adapter;
mod stream;
mod surface;
mod transcript;
mod types;

use crate::config::Config;
use crate::serving::{DatabricksClient, ServingEndpoint};
use crate::stream::TurnRunner;
use crate::surface::TerminalSurface;
use crate::transcript::Session;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "forage-chat", version, about = "Tropical forages research assistant")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "FORAGE_CHAT_CONFIG", default_value = "forage-chat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat in the terminal.
    Chat,
    /// Ask a single question and print the answer.
    Ask {
        #[arg(long)]
        message: String,
        /// Print the answer's wire messages as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Answer app mentions in Slack threads (socket mode).
    Slack,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let runner = connect(&config).await?;

    match cli.command {
        Command::Chat => cli_adapter::run_chat(&runner, &config.chat.example_prompts).await,
        Command::Ask { message, json } => run_ask(&runner, &message, json).await,
        Command::Slack => run_slack(runner, &config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forage_chat=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(config: &Config) -> Result<TurnRunner> {
    let timeout = Duration::from_secs(config.chat.request_timeout_secs);
    let client = DatabricksClient::new(&config.serving, timeout)
        .context("failed to create serving endpoint client")?;
    let info = client
        .describe()
        .await
        .with_context(|| format!("failed to look up serving endpoint {}", config.serving.endpoint))?;
    Ok(TurnRunner::new(Arc::new(client), info))
}

async fn run_ask(runner: &TurnRunner, message: &str, json: bool) -> Result<()> {
    let mut session = Session::new();
    let outcome = if json {
        let mut surface = TerminalSurface::new(std::io::sink());
        runner.handle_prompt(&mut session, &mut surface, message).await?
    } else {
        let mut surface = TerminalSurface::new(std::io::stdout());
        runner.handle_prompt(&mut session, &mut surface, message).await?
    };
    if json {
        println!("{}", cli_adapter::pretty_answer(&outcome.turn)?);
    }
    Ok(())
}

async fn run_slack(runner: TurnRunner, config: &Config) -> Result<()> {
    let slack_config = config.slack()?;
    let slack = slack_adapter::SlackAdapter::connect(slack_config).await?;
    coordinator::Coordinator::new(
        runner,
        slack,
        config.chat.example_prompts.clone(),
        Duration::from_secs(slack_config.session_idle_secs),
    )
    .run()
    .await
}
