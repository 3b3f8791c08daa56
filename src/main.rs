use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use resilience_engine::checkpoint::{FileCheckpointStore, JsonFileState, SqliteCheckpointStore};
use resilience_engine::config::default_checkpoint_dir;
use resilience_engine::logging::init_logging;
use resilience_engine::*;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "resilience")]
#[command(about = "Classify runtime errors, drive recovery and manage state checkpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, env = "RESILIENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a single error and print the verdict as JSON
    Classify {
        /// Error message
        #[arg(short, long)]
        message: Option<String>,

        /// File containing the stack trace
        #[arg(short, long)]
        stack: Option<PathBuf>,

        /// Context entries as key=value (value parsed as JSON when possible)
        #[arg(short, long = "context", value_parser = parse_context)]
        context: Vec<(String, serde_json::Value)>,
    },

    /// Feed JSON-lines error events through a controller
    Replay {
        /// File with one JSON error event per line
        events: PathBuf,

        /// JSON state file checkpoints are taken from
        #[arg(long)]
        state: PathBuf,

        /// Checkpoint store: a directory, or a `.db`/`.sqlite` file
        #[arg(long)]
        store: Option<PathBuf>,

        /// Milliseconds between idle passes
        #[arg(long, default_value = "50")]
        idle_ms: u64,
    },

    /// Create or list checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Restore a checkpoint into the state file
    #[command(group(ArgGroup::new("mode").args(["id", "latest", "progressive"])))]
    Rollback {
        #[arg(long)]
        state: PathBuf,

        #[arg(long)]
        store: Option<PathBuf>,

        /// Restore this checkpoint only
        #[arg(long)]
        id: Option<String>,

        /// Restore the newest valid checkpoint only
        #[arg(long)]
        latest: bool,

        /// Walk back through checkpoints until one restores (default)
        #[arg(long)]
        progressive: bool,

        #[arg(long, default_value = "manual rollback")]
        reason: String,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Snapshot the state file
    Create {
        #[arg(long)]
        state: PathBuf,

        #[arg(long)]
        store: Option<PathBuf>,

        /// Mark as a milestone (kept in the separate milestone pool)
        #[arg(long)]
        milestone: bool,
    },

    /// List stored checkpoints, newest first
    List {
        #[arg(long)]
        state: PathBuf,

        #[arg(long)]
        store: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ResilienceConfig::load(cli.config.as_deref())?;
    if cli.debug {
        config.logging.level = "debug".to_string();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    let _log_guard = init_logging(&config.logging)?;

    match cli.command {
        Commands::Classify {
            message,
            stack,
            context,
        } => classify(&config, message, stack.as_deref(), context)?,
        Commands::Replay {
            events,
            state,
            store,
            idle_ms,
        } => replay(config, &events, &state, store, Duration::from_millis(idle_ms)).await?,
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Create {
                state,
                store,
                milestone,
            } => create_checkpoint(config, &state, store, milestone)?,
            CheckpointAction::List { state, store, json } => list_checkpoints(config, &state, store, json)?,
        },
        Commands::Rollback {
            state,
            store,
            id,
            latest,
            progressive: _,
            reason,
        } => {
            let target = match (id, latest) {
                (Some(id), _) => RollbackTarget::Id(id),
                (None, true) => RollbackTarget::Latest,
                (None, false) => RollbackTarget::Progressive,
            };
            rollback(config, &state, store, target, &reason)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn parse_context(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err("context key must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn classify(
    config: &ResilienceConfig,
    message: Option<String>,
    stack: Option<&Path>,
    context: Vec<(String, serde_json::Value)>,
) -> Result<()> {
    let mut event = ErrorEvent {
        message,
        ..ErrorEvent::default()
    };
    event.timestamp = chrono::Utc::now();
    if let Some(path) = stack {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        event = event.with_stack(text);
    }
    for (key, value) in context {
        event = event.with_context(key, value);
    }

    let classifier = ErrorClassifier::new(config.classifier.clone());
    let classification = classifier.classify(&event);
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

/// Pick the store backend from the path: SQLite for `.db`/`.sqlite` files,
/// the file store for anything else
fn open_store(config: &ResilienceConfig, store: Option<PathBuf>) -> Result<Arc<dyn CheckpointStore>> {
    let path = match store.or_else(|| config.checkpoint.directory.clone()) {
        Some(path) => path,
        None => default_checkpoint_dir().context("No checkpoint store given and no platform data directory")?,
    };
    let capacity = config.checkpoint.store_capacity;

    let is_sqlite = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("db") | Some("sqlite") | Some("sqlite3")
    );
    let store: Arc<dyn CheckpointStore> = if is_sqlite {
        Arc::new(SqliteCheckpointStore::open(&path, capacity)?)
    } else {
        Arc::new(FileCheckpointStore::open(&path, capacity)?)
    };

    tracing::debug!(store = %path.display(), sqlite = is_sqlite, "Checkpoint store opened");
    Ok(store)
}

fn build_controller(
    config: ResilienceConfig,
    state: &Path,
    store: Option<PathBuf>,
) -> Result<ErrorResilienceController> {
    if !state.exists() {
        bail!("State file not found: {}", state.display());
    }
    let store = open_store(&config, store)?;
    let provider = Arc::new(JsonFileState::new(state));
    Ok(ControllerBuilder::new(provider).config(config).store(store).build()?)
}

async fn replay(
    config: ResilienceConfig,
    events: &Path,
    state: &Path,
    store: Option<PathBuf>,
    idle: Duration,
) -> Result<()> {
    let file = fs::File::open(events).with_context(|| format!("Failed to open {}", events.display()))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to read {}", events.display()))?;

    let controller = Arc::new(build_controller(config, state, store)?);
    let driver = controller.spawn_idle_driver(idle);

    let progress = ProgressBar::new(lines.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    let started = Instant::now();
    let mut skipped = 0usize;
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            progress.inc(1);
            continue;
        }
        match serde_json::from_str::<ErrorEvent>(line) {
            Ok(event) => controller.report_error(event),
            Err(e) => {
                skipped += 1;
                tracing::warn!(line = index + 1, error = %e, "Skipping unparseable event");
            }
        }
        progress.inc(1);
        // Let the idle driver interleave with the replay
        tokio::task::yield_now().await;
    }
    progress.finish_with_message("replayed");

    // Give scheduled retries a last chance before reporting
    controller.run_idle();
    let diagnostics = controller.export_diagnostics();
    controller.shutdown();
    driver.await?;

    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    eprintln!(
        "{} {} events in {}, {} skipped, {} emergencies",
        "Replayed".green().bold(),
        lines.len() - skipped,
        humantime::format_duration(Duration::from_millis(started.elapsed().as_millis() as u64)),
        skipped,
        diagnostics.emergencies
    );
    Ok(())
}

fn create_checkpoint(config: ResilienceConfig, state: &Path, store: Option<PathBuf>, milestone: bool) -> Result<()> {
    let controller = build_controller(config, state, store)?;
    let trigger = if milestone {
        TriggerType::Milestone
    } else {
        TriggerType::Manual
    };

    let summary = controller.create_checkpoint(trigger, CheckpointPriority::High)?;
    println!(
        "{} {} ({}, {} bytes, sha256 {})",
        "Created".green().bold(),
        summary.id,
        summary.trigger,
        summary.snapshot_bytes,
        &summary.checksum[..12.min(summary.checksum.len())]
    );
    Ok(())
}

fn list_checkpoints(config: ResilienceConfig, state: &Path, store: Option<PathBuf>, json: bool) -> Result<()> {
    let controller = build_controller(config, state, store)?;
    let checkpoints = controller.checkpoints().list();

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("No checkpoints");
        return Ok(());
    }

    println!(
        "{:<38} {:>5} {:<25} {:<12} {:<18} {:>10}",
        "ID", "SEQ", "CREATED", "TRIGGER", "STATUS", "BYTES"
    );
    println!("{}", "-".repeat(113));
    for summary in &checkpoints {
        let status = format!("{:?}", summary.status);
        let status = if summary.status.is_usable() {
            status.normal()
        } else {
            status.red()
        };
        let trigger = if summary.milestone {
            summary.trigger.to_string().yellow()
        } else {
            summary.trigger.to_string().normal()
        };
        println!(
            "{:<38} {:>5} {:<25} {:<12} {:<18} {:>10}",
            summary.id,
            summary.sequence,
            summary.timestamp.format("%Y-%m-%d %H:%M:%S"),
            trigger,
            status,
            summary.stored_bytes
        );
    }
    Ok(())
}

fn rollback(
    config: ResilienceConfig,
    state: &Path,
    store: Option<PathBuf>,
    target: RollbackTarget,
    reason: &str,
) -> Result<()> {
    let controller = build_controller(config, state, store)?;

    match controller.rollback_to_checkpoint(target, reason) {
        RollbackResult::Restored(report) => {
            println!(
                "{} {} after trying {} candidate(s)",
                "Restored".green().bold(),
                report.checkpoint_id,
                report.tried
            );
            for id in &report.invalidated {
                println!("  {} {}", "invalidated".yellow(), id);
            }
            Ok(())
        }
        RollbackResult::Busy => bail!("Another rollback is in progress"),
        RollbackResult::Exhausted { tried } => {
            eprintln!("{} no checkpoint could be restored ({} tried)", "Failed:".red().bold(), tried);
            bail!("Rollback exhausted")
        }
        RollbackResult::Failed { error } => {
            eprintln!("{} {}", "Failed:".red().bold(), error);
            bail!("Rollback failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_context_values() {
        assert_eq!(
            parse_context("http_status=503").unwrap(),
            ("http_status".to_string(), serde_json::json!(503))
        );
        assert_eq!(
            parse_context("subsystem=network").unwrap(),
            ("subsystem".to_string(), serde_json::json!("network"))
        );
        assert!(parse_context("novalue").is_err());
        assert!(parse_context("=x").is_err());
    }

    #[test]
    fn test_rollback_modes_are_exclusive() {
        let parsed = Cli::try_parse_from(["resilience", "rollback", "--state", "s.json", "--latest", "--id", "x"]);
        assert!(parsed.is_err());
    }
}
