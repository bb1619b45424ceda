use std::collections::HashMap;
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use training_stream::bus::{EventKind, EventLogEntry};
use training_stream::runtime::NoopListener;
use training_stream::{init_tracing, MonitorConfig, TrainingMonitor, TrainingState};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start {
        agent_id: String,
        agent_name: String,
        source_ids: Vec<String>,
    },
    Resume,
    Status,
    Cancel {
        agent_id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("training_watch failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1).peekable();
    let Some(subcommand) = args.next() else {
        print_help();
        return Ok(());
    };
    if subcommand == "--help" || subcommand == "-h" {
        print_help();
        return Ok(());
    }

    let command = match subcommand.as_str() {
        "start" => {
            let agent_id = args
                .next()
                .ok_or_else(|| "start requires <agent_id>".to_string())?;
            let agent_name = args
                .next()
                .ok_or_else(|| "start requires <agent_name>".to_string())?;
            Command::Start {
                agent_id,
                agent_name,
                source_ids: args.by_ref().collect(),
            }
        }
        "resume" => Command::Resume,
        "status" => Command::Status,
        "cancel" => {
            let agent_id = args
                .next()
                .ok_or_else(|| "cancel requires <agent_id>".to_string())?;
            Command::Cancel { agent_id }
        }
        other => {
            return Err(format!(
                "unknown command '{other}'. Use start, resume, status, or cancel"
            ))
        }
    };
    if let Some(extra) = args.peek() {
        return Err(format!("unexpected argument '{extra}'"));
    }

    init_tracing();
    let config = MonitorConfig::from_env().map_err(|e| e.to_string())?;
    let monitor = TrainingMonitor::from_config(&config).map_err(|e| e.to_string())?;

    let result = match command {
        Command::Start {
            agent_id,
            agent_name,
            source_ids,
        } => {
            let entries = monitor.event_log().subscribe();
            let task_id = monitor
                .orchestrator()
                .start_training(&agent_id, &source_ids, &agent_name, Arc::new(NoopListener))
                .await
                .map_err(|e| e.to_string())?;
            println!("started training task {task_id} for {agent_name} ({agent_id})");
            watch(&monitor, entries, vec![agent_id]).await
        }
        Command::Resume => {
            let entries = monitor.event_log().subscribe();
            let resumed = monitor
                .orchestrator()
                .resume_in_flight(Arc::new(NoopListener))
                .map_err(|e| e.to_string())?;
            if resumed.is_empty() {
                println!("no training in flight");
                Ok(())
            } else {
                for task in &resumed {
                    println!(
                        "resuming task {} for {} ({})",
                        task.task_id, task.agent_name, task.agent_id
                    );
                }
                let agents = resumed.into_iter().map(|task| task.agent_id).collect();
                watch(&monitor, entries, agents).await
            }
        }
        Command::Status => {
            let tasks = monitor.tasks().get_all().map_err(|e| e.to_string())?;
            if tasks.is_empty() {
                println!("no training records");
            }
            for task in tasks {
                println!(
                    "{:<12} {:<10} {:<24} {} (started {})",
                    task.agent_id,
                    task.status.as_str(),
                    task.agent_name,
                    task.task_id,
                    task.started_at.to_rfc3339()
                );
            }
            Ok(())
        }
        Command::Cancel { agent_id } => {
            monitor
                .orchestrator()
                .cancel_training(&agent_id)
                .await
                .map_err(|e| e.to_string())?;
            println!("cancelled training for {agent_id}");
            Ok(())
        }
    };

    monitor.shutdown();
    result
}

/// Render one progress bar per agent from the event log until every agent
/// reaches a terminal state or the user interrupts.
async fn watch(
    monitor: &TrainingMonitor,
    mut entries: broadcast::Receiver<EventLogEntry>,
    agents: Vec<String>,
) -> Result<(), String> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] {prefix:>12} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .map_err(|e| e.to_string())?
    .progress_chars("#>-");

    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    for agent_id in &agents {
        let pb = multi.add(ProgressBar::new(1));
        pb.set_style(style.clone());
        pb.set_prefix(agent_id.clone());
        pb.set_message("waiting for stream");
        bars.insert(agent_id.clone(), pb);
    }

    let mut failures = Vec::new();
    let mut remaining = agents.len();
    while remaining > 0 {
        let entry = tokio::select! {
            entry = entries.recv() => entry,
            _ = tokio::signal::ctrl_c() => {
                for agent_id in &agents {
                    if !monitor.orchestrator().state(agent_id).is_terminal() {
                        if let Err(e) = monitor.orchestrator().cancel_training(agent_id).await {
                            failures.push(format!("{agent_id}: {e}"));
                        }
                    }
                }
                for pb in bars.values() {
                    pb.abandon_with_message("interrupted");
                }
                break;
            }
        };

        let entry = match entry {
            Ok(entry) => entry,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress display fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(pb) = bars.get(&entry.agent_id).cloned() else {
            continue;
        };

        let event = &entry.event;
        match event.kind {
            EventKind::Connected => pb.set_message("connected"),
            EventKind::Progress => {
                if let Some(progress) = &event.progress {
                    if let Some(total) = progress.total {
                        pb.set_length(total.max(1));
                    }
                    if let Some(processed) = progress.processed {
                        pb.set_position(processed);
                    }
                    let phase = progress.phase.as_deref().unwrap_or("training");
                    let message = match (&progress.message, &progress.current_source) {
                        (Some(message), _) => format!("{phase}: {message}"),
                        (None, Some(source)) => format!("{phase}: {source}"),
                        (None, None) => phase.to_string(),
                    };
                    pb.set_message(message);
                }
            }
            EventKind::Completed => {
                pb.set_position(pb.length().unwrap_or(1));
                pb.finish_with_message("completed");
                bars.remove(&entry.agent_id);
                remaining -= 1;
            }
            EventKind::Failed => {
                let message = event
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "training failed".to_string());
                pb.abandon_with_message(format!("failed: {message}"));
                failures.push(format!("{}: {message}", entry.agent_id));
                bars.remove(&entry.agent_id);
                remaining -= 1;
            }
        }
    }

    for agent_id in &agents {
        if let TrainingState::Completed { task_id } = monitor.orchestrator().state(agent_id) {
            println!("{agent_id}: task {task_id} completed");
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

fn print_help() {
    println!("Follow agent training jobs from the terminal");
    println!();
    println!("Usage:");
    println!("  training_watch start <agent_id> <agent_name> [source_id ...]");
    println!("  training_watch resume");
    println!("  training_watch status");
    println!("  training_watch cancel <agent_id>");
    println!();
    println!("Environment:");
    println!("  TRAINING_API_URL                  Backend base URL (required)");
    println!("  TRAINING_API_TOKEN                Bearer token (required)");
    println!("  TRAINING_DATA_DIR                 Task database directory (default: ~/.training-stream)");
    println!("  TRAINING_RECONNECT_BASE_MS        Reconnect base delay (default: 1000)");
    println!("  TRAINING_MAX_RECONNECT_ATTEMPTS   Reconnect attempts before giving up (default: 5)");
    println!("  TRAINING_REMOVAL_GRACE_MS         Delay before finished records are removed (default: 5000)");
    println!("  TRAINING_EVENT_LOG_CAPACITY       Recent events kept in memory (default: 100)");
    println!("  RUST_LOG                          Log filter (default: training_stream=debug,info)");
}
