//! backwork CLI: operator interface to a scheduler database.

use std::time::Duration;

use backwork::config::Config;
use backwork::event::EventKind;
use backwork::model::{ConstraintSnapshot, Constraints, ExistingWorkPolicy, NetworkType};
use backwork::storage::Storage;
use backwork::telemetry::{TelemetryConfig, init_telemetry};
use backwork::worker::CommandWorker;
use backwork::{BackoffPolicy, NewWork, Scheduler, State, SubmitResult, WorkId, WorkRecord};
use clap::{Parser, Subcommand};

/// Every state, in the order `list` prints them.
const ALL_STATES: [State; 6] = [
    State::Running,
    State::Enqueued,
    State::Blocked,
    State::Succeeded,
    State::Failed,
    State::Cancelled,
];

#[derive(Parser)]
#[command(name = "backwork", about = "Persistent background work scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon, executing "command" work
    Serve,
    /// Work record operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit work for a registered worker
    Submit {
        /// Worker name ("command" runs input.command through sh)
        worker: String,
        /// JSON input, e.g. '{"command": "make backup"}'
        #[arg(long)]
        input: Option<String>,
        /// Tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Unique name to admit the work under
        #[arg(long)]
        unique: Option<String>,
        /// Conflict policy for --unique: keep, replace or append
        #[arg(long, default_value = "keep")]
        policy: ExistingWorkPolicy,
        /// Priority (higher = armed first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Delay before the first run, in seconds
        #[arg(long = "delay")]
        delay_secs: Option<u64>,
        /// Repeat every N seconds
        #[arg(long)]
        every_secs: Option<u64>,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Linear backoff base in seconds (default: exponential 30s)
        #[arg(long)]
        linear_backoff_secs: Option<u64>,
        /// Prerequisite work ids (full UUID or prefix)
        #[arg(long = "after")]
        after: Vec<String>,
        /// Required network: connected, unmetered, not_roaming or metered
        #[arg(long)]
        network: Option<NetworkType>,
        #[arg(long)]
        charging: bool,
    },
    /// List work records
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<State>,
        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a work record
    Show {
        /// Work id (full UUID or prefix)
        id: String,
    },
    /// Cancel work by id, tag or unique name, or everything unfinished
    Cancel {
        /// Work id (full UUID or prefix)
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        tag: Option<String>,
        #[arg(long, conflicts_with_all = ["id", "tag"])]
        unique: Option<String>,
        #[arg(long, conflicts_with_all = ["id", "tag", "unique"])]
        all: bool,
    },
    /// Delete finished records older than the retention window
    Prune,
    /// Print the event log
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Work { action } => {
            let scheduler = open_scheduler(&config, ConstraintSnapshot::default())?;
            match action {
                WorkAction::Submit {
                    worker,
                    input,
                    tags,
                    unique,
                    policy,
                    priority,
                    delay_secs,
                    every_secs,
                    max_attempts,
                    linear_backoff_secs,
                    after,
                    network,
                    charging,
                } => {
                    let input: serde_json::Value = match input {
                        Some(json) => serde_json::from_str(&json)?,
                        None => serde_json::Value::Null,
                    };
                    let mut new = NewWork::new(worker).input(input).priority(priority);
                    for tag in tags {
                        new = new.tag(tag);
                    }
                    for prefix in &after {
                        new = new.after(resolve_id(&scheduler, prefix)?);
                    }
                    if let Some(secs) = delay_secs {
                        new = new.initial_delay(Duration::from_secs(secs));
                    }
                    if let Some(secs) = every_secs {
                        new = new.periodic(Duration::from_secs(secs));
                    }
                    if let Some(n) = max_attempts {
                        new = new.max_attempts(n);
                    }
                    if let Some(secs) = linear_backoff_secs {
                        new = new.backoff(BackoffPolicy::linear(Duration::from_secs(secs)));
                    }
                    let mut constraints = Constraints::default();
                    if let Some(network) = network {
                        constraints = constraints.network(network);
                    }
                    if charging {
                        constraints = constraints.charging();
                    }
                    new = new.constraints(constraints);

                    cmd_work_submit(&scheduler, new, unique, policy)
                }
                WorkAction::List { state, tag, limit } => {
                    cmd_work_list(&scheduler, state, tag, limit)
                }
                WorkAction::Show { id } => cmd_work_show(&scheduler, &id),
                WorkAction::Cancel {
                    id,
                    tag,
                    unique,
                    all,
                } => cmd_work_cancel(&scheduler, id, tag, unique, all),
                WorkAction::Prune => {
                    let count = scheduler.prune()?;
                    println!("Pruned {count} record(s)");
                    Ok(())
                }
                WorkAction::Events { since } => {
                    for event in scheduler.events_since(since)? {
                        let kind = match &event.kind {
                            EventKind::Unknown { raw } => raw.clone(),
                            kind => serde_json::to_string(kind)?,
                        };
                        println!(
                            "{:>6}  {}  {kind}",
                            event.seq,
                            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}

fn open_scheduler(config: &Config, snapshot: ConstraintSnapshot) -> anyhow::Result<Scheduler> {
    let storage = Storage::open(&config.database_path)?;
    let scheduler = Scheduler::builder(storage)
        .config(config.scheduler.clone())
        .worker("command", CommandWorker::new())
        .constraints(snapshot)
        .build()?;
    Ok(scheduler)
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig::for_scheduler(&config))?;

    // No sensors on a plain host: every constraint holds.
    let scheduler = open_scheduler(&config, ConstraintSnapshot::unrestricted())?;
    let report = scheduler.recover()?;
    tracing::info!(
        database = %config.database_path.display(),
        requeued = report.requeued,
        "serving"
    );

    let handle = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    scheduler.run().await?;
    if let Err(e) = guard.flush() {
        tracing::warn!("{e}");
    }
    Ok(())
}

fn cmd_work_submit(
    scheduler: &Scheduler,
    new: NewWork,
    unique: Option<String>,
    policy: ExistingWorkPolicy,
) -> anyhow::Result<()> {
    let result = match unique {
        Some(name) => scheduler.enqueue_unique(&name, policy, new)?,
        None => {
            let id = scheduler.enqueue(new)?;
            SubmitResult::Created(scheduler.work_info(id)?)
        }
    };

    match result {
        SubmitResult::Created(record) => {
            println!("Created: {} (state: {})", record.id, record.state);
        }
        SubmitResult::Kept { existing } => {
            println!("Kept: existing {existing} holds the name");
        }
    }
    Ok(())
}

fn cmd_work_list(
    scheduler: &Scheduler,
    state: Option<State>,
    tag: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut records = match (&tag, state) {
        (Some(tag), _) => scheduler.infos_by_tag(tag)?,
        (None, Some(state)) => scheduler.infos_by_state(state)?,
        (None, None) => all_records(scheduler)?,
    };
    if let (Some(_), Some(state)) = (&tag, state) {
        records.retain(|r| r.state == state);
    }

    if records.is_empty() {
        println!("No work records found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<10}  {:<4}  {:<4}  {:<24}  CREATED",
        "ID", "WORKER", "STATE", "PRI", "TRY", "UNIQUE_NAME"
    );
    println!("{}", "-".repeat(90));

    for record in records.iter().take(limit) {
        let unique_display = truncate(record.unique_name.as_deref().unwrap_or("-"), 24);
        println!(
            "{:<8}  {:<10}  {:<10}  {:<4}  {:<4}  {:<24}  {}",
            record.id,
            record.worker,
            record.state,
            record.priority,
            record.run_attempt_count,
            unique_display,
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} record(s)", records.len().min(limit));
    Ok(())
}

/// At most `max` characters of `s`.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

fn cmd_work_show(scheduler: &Scheduler, id: &str) -> anyhow::Result<()> {
    let record = scheduler.work_info(resolve_id(scheduler, id)?)?;

    println!("ID:          {}", record.id.0);
    println!("Worker:      {}", record.worker);
    println!("State:       {}", record.state);
    println!("Priority:    {}", record.priority);
    println!(
        "Unique Name: {}",
        record.unique_name.as_deref().unwrap_or("-")
    );
    if !record.tags.is_empty() {
        let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
        println!("Tags:        {}", tags.join(", "));
    }
    println!("Input:       {}", serde_json::to_string_pretty(&record.input)?);
    println!("Schedule:    {}", serde_json::to_string(&record.schedule)?);
    println!(
        "Constraints: {}",
        serde_json::to_string(&record.constraints)?
    );
    println!(
        "Backoff:     {} {}s",
        record.backoff.kind.as_str(),
        record.backoff.base_delay.as_secs()
    );
    println!("Attempts:    {}", record.run_attempt_count);
    println!(
        "Max Tries:   {}",
        record
            .max_attempts
            .map(|n| n.to_string())
            .unwrap_or("-".to_string())
    );
    if let Some(at) = record.earliest_start {
        println!(
            "Not Before:  {at}{}",
            if record.is_backed_off {
                " (backing off)"
            } else {
                ""
            }
        );
    }
    println!("Created:     {}", record.created_at);
    println!("Updated:     {}", record.updated_at);
    if let Some(finished) = record.finished_at {
        println!("Finished:    {finished}");
    }
    if let Some(ref error) = record.last_error {
        println!("Last Error:  {error}");
    }
    if let Some(ref output) = record.output {
        println!("---");
        println!("Output:      {}", serde_json::to_string_pretty(output)?);
    }
    Ok(())
}

fn cmd_work_cancel(
    scheduler: &Scheduler,
    id: Option<String>,
    tag: Option<String>,
    unique: Option<String>,
    all: bool,
) -> anyhow::Result<()> {
    if all {
        println!("Cancelled {} record(s)", scheduler.cancel_all()?);
        return Ok(());
    }
    let count = match (id, tag, unique) {
        (Some(id), _, _) => {
            let id = resolve_id(scheduler, &id)?;
            let before = scheduler.status_of(id)?;
            scheduler.cancel(id)?;
            usize::from(!before.is_terminal())
        }
        (None, Some(tag), _) => scheduler.cancel_by_tag(&tag)?,
        (None, None, Some(name)) => scheduler.cancel_by_unique_name(&name)?,
        (None, None, None) => anyhow::bail!("give an id, --tag, --unique or --all"),
    };
    println!("Cancelled {count} record(s)");
    Ok(())
}

fn all_records(scheduler: &Scheduler) -> anyhow::Result<Vec<WorkRecord>> {
    let mut records = Vec::new();
    for state in ALL_STATES {
        records.extend(scheduler.infos_by_state(state)?);
    }
    Ok(records)
}

/// Accept a full UUID or a unique prefix of one.
fn resolve_id(scheduler: &Scheduler, id: &str) -> anyhow::Result<WorkId> {
    if id.len() == 36 {
        return Ok(id.parse()?);
    }
    let matches: Vec<WorkId> = all_records(scheduler)?
        .into_iter()
        .map(|r| r.id)
        .filter(|candidate| candidate.0.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no work record matching prefix '{id}'"),
        1 => Ok(matches[0]),
        n => anyhow::bail!("{n} work records match prefix '{id}', be more specific"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_characters_not_bytes() {
        let name = "a夜間バックアップ同期ジョブ";
        assert_eq!(truncate(name, 24), name);
        assert_eq!(truncate(name, 5), "a夜間バッ");
        assert_eq!(truncate("nightly-report", 7), "nightly");
        assert_eq!(truncate("-", 24), "-");
    }

    #[test]
    fn list_prints_long_multibyte_unique_names() {
        let scheduler = Scheduler::builder(Storage::in_memory().unwrap())
            .build()
            .unwrap();
        scheduler
            .enqueue_unique(
                "a夜間バックアップ同期ジョブ夜間バックアップ同期ジョブ",
                ExistingWorkPolicy::Keep,
                NewWork::new("command"),
            )
            .unwrap();
        cmd_work_list(&scheduler, None, None, 10).unwrap();
    }
}
