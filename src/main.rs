use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use panbot::agent::ClaudeCliRunner;
use panbot::config::Config;
use panbot::events::{EventBus, EventKind};
use panbot::gateway::{self, AppState};
use panbot::notify::{DeliveryWorker, NotificationService};
use panbot::orchestrator::Orchestrator;
use panbot::rendezvous::PendingQuestions;
use panbot::router::{ChannelRouter, ProjectRegistry};
use panbot::scheduler::JobScheduler;
use panbot::slack::SlackClient;
use panbot::storage::Database;

#[derive(Parser)]
#[command(name = "panbot", about = "Slack bridge for a scheduled, stateful coding agent")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot (default).
    Start,
    /// Validate the configuration and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).await?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Check => {
            info!(config = %cli.config.display(), "configuration is valid");
            Ok(())
        }
        Command::Start => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let db = Arc::new(Database::open_path(&config.database_path())?);
    let bus = Arc::new(EventBus::new());
    let chat = Arc::new(SlackClient::new(config.slack.bot_token.clone()));
    let router = Arc::new(ChannelRouter::new(
        ProjectRegistry::new(config.projects.clone()),
        db.clone(),
    ));
    let pending = Arc::new(PendingQuestions::default());
    let scheduler = Arc::new(JobScheduler::new(
        db.clone(),
        bus.clone(),
        config.tz()?,
        cancel.clone(),
    ));
    let agent = Arc::new(ClaudeCliRunner::new(
        config.claude.binary.clone(),
        Duration::from_secs(config.claude.timeout_secs),
        config.claude.max_turns,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        chat.clone(),
        router.clone(),
        agent,
        scheduler.clone(),
        pending.clone(),
        bus.clone(),
        db.clone(),
        config.bot_name.clone(),
        config.approved_directory.clone(),
    ));
    for kind in [EventKind::UserMessage, EventKind::Scheduled, EventKind::Webhook] {
        bus.subscribe(kind, orchestrator.clone()).await;
    }

    let (notifications, queue) = NotificationService::new();
    bus.subscribe(EventKind::AgentResponse, Arc::new(notifications)).await;
    let worker = DeliveryWorker::new(chat.clone(), config.notification_channel_ids.clone());
    let delivery = tokio::spawn(worker.run(queue, cancel.clone()));

    // Channel reconciliation is best effort; a Slack outage at boot
    // should not keep the scheduler down.
    match router.sync_channels(chat.as_ref()).await {
        Ok(result) => info!(
            created = result.created,
            reused = result.reused,
            failed = result.failed,
            "channel sync complete"
        ),
        Err(e) => warn!(error = %e, "channel sync failed"),
    }

    scheduler.start().await?;

    let state = Arc::new(AppState {
        bus: bus.clone(),
        pending,
        signing_secret: config.slack.signing_secret.clone(),
        webhook_secret: config.webhook_secret.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let http = tokio::spawn(gateway::serve(listener, state, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    let _ = http.await;
    let _ = delivery.await;
    info!("goodbye");
    Ok(())
}
