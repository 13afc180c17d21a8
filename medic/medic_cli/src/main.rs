use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use medic_agent::{
    AgentConfig, AgentOutcome, AgentReply, AgentRequest, AgentTelemetry, CheckpointStore,
    FileCheckpointStore, MedicalAgent, NoopCheckpointStore, SessionKey,
};
use serde_json::Value;
use shared_event_bus::{EventSubscriber, FanoutPublisher, FileEventPublisher, MemoryEventBus};
use shared_logging::LogLevel;
use tokio::{runtime::Runtime, sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "medic", version, about = "Answers medical questions from PubMed and web evidence")]
struct Cli {
    /// Question to answer; prompted for on stdin when omitted.
    #[arg(long)]
    query: Option<String>,
    /// Session key; continues an earlier conversation when checkpoints are enabled.
    #[arg(long)]
    session: Option<String>,
    /// Directory holding one checkpoint file per session.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    /// JSON-lines log file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// JSON-lines event log.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Overrides MEDIC_MAX_ATTEMPTS.
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Suppresses progress lines.
    #[arg(long)]
    quiet: bool,
}

struct Settings {
    config: AgentConfig,
    log_level: LogLevel,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match load_settings(&cli, |key| std::env::var(key).ok()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(2);
        }
    };
    match execute(cli, settings) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn load_settings<F>(cli: &Cli, lookup: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let log_level = match lookup("MEDIC_LOG_LEVEL") {
        Some(value) => LogLevel::from_str(&value).context("MEDIC_LOG_LEVEL")?,
        None => LogLevel::Info,
    };
    let mut config = AgentConfig::read_lookup(lookup)?;
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    config.validate()?;
    Ok(Settings { config, log_level })
}

fn execute(cli: Cli, settings: Settings) -> Result<ExitCode> {
    let question = match &cli.query {
        Some(question) => question.clone(),
        None => prompt_question()?,
    };
    let runtime = Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(answer(cli, settings, question))
}

fn prompt_question() -> Result<String> {
    print!("Enter your medical question: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

async fn answer(cli: Cli, settings: Settings, question: String) -> Result<ExitCode> {
    let bus = Arc::new(MemoryEventBus::new(256));
    let mut publisher = FanoutPublisher::new().with(bus.clone());
    if let Some(path) = &cli.event_log {
        publisher = publisher.with(Arc::new(FileEventPublisher::new(path)?));
    }
    let mut telemetry = AgentTelemetry::builder("medic")
        .min_level(settings.log_level)
        .event_publisher(Arc::new(publisher));
    if let Some(path) = &cli.log_file {
        telemetry = telemetry.log_path(path);
    }

    let checkpoints: Arc<dyn CheckpointStore> = match &cli.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::open(dir)?),
        None => Arc::new(NoopCheckpointStore),
    };
    let agent = MedicalAgent::from_config(&settings.config, telemetry.build()?)?
        .with_checkpoints(checkpoints);

    let printer = if cli.quiet {
        None
    } else {
        Some(spawn_progress_printer(bus.subscribe().await?))
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let mut request = AgentRequest::new(question).with_cancellation(cancel);
    if let Some(key) = &cli.session {
        request = request.with_session(SessionKey::new(key.clone()));
    }
    let reply = agent.answer(request).await;

    // Closing every sender ends the printer once it has drained the channel.
    drop(agent);
    drop(bus);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if cli.session.is_none() && cli.checkpoint_dir.is_some() {
        eprintln!("Session: {}", reply.session);
    }
    Ok(render(&reply))
}

fn spawn_progress_printer(
    mut events: tokio::sync::broadcast::Receiver<shared_event_bus::EventRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.event_type == "agent.transition" => {
                    for line in progress_lines(&event.payload) {
                        println!("{line}");
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn progress_lines(payload: &Value) -> Vec<String> {
    if payload["to"] != "searching" {
        return Vec::new();
    }
    let mut lines = Vec::new();
    if payload["origin"] == "refined" {
        if let Some(query) = payload["query"].as_str() {
            lines.push(format!("[Agent] Refining query → {query}"));
        }
    }
    match payload["source"].as_str() {
        Some("PubMed") => lines.push("[Agent] Using PubMed for scholarly search...".into()),
        Some("Tavily") => lines.push("[Agent] Using Tavily for general medical search...".into()),
        _ => {}
    }
    lines
}

fn render(reply: &AgentReply) -> ExitCode {
    match &reply.outcome {
        AgentOutcome::Done { summary } => {
            println!("\n{}\n", summary.text);
            if !summary.citations.is_empty() {
                println!("Sources:");
                for (idx, identifier) in summary.citations.iter().enumerate() {
                    println!("[{}] {identifier}", idx + 1);
                }
                println!();
            }
            println!("{}", summary.disclaimer);
            ExitCode::SUCCESS
        }
        AgentOutcome::Failed(report) => {
            println!("\n{}", report.message);
            if let Some(evidence) = &report.partial_evidence {
                println!("\nUnvalidated results:");
                for (idx, item) in evidence.iter().enumerate() {
                    println!("[{}] {} ({})", idx + 1, item.title, item.identifier);
                }
            }
            ExitCode::from(1)
        }
    }
}
