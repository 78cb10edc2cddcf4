//! CLI entry point for the Arbiter decision engine.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use arbiter_core::{DecisionId, RawEvent};
use arbiter_history::{EscalationOutbox, FileHistoryStore, HistoryStore, Journal, Lesson};

use arbiter_engine::{oracle, ConfigHandle, CycleReport, Engine, Ingestor, Shutdown};

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(about = "Autonomous decision engine: observe, reason, act, learn")]
struct Cli {
    /// Config file prefix (default: arbiter).
    #[arg(short, long, default_value = "arbiter", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON events from stdin, one per line, and run the decision loop
    /// until stdin closes and the queue drains.
    Run {
        /// Emit a time_elapsed event every N seconds.
        #[arg(long)]
        tick: Option<u64>,
    },
    /// Decide on a single JSON event and print the recorded decision.
    Once {
        #[arg(long)]
        event: String,
    },
    /// List pending escalations, most important first.
    Outbox,
    /// Resolve a pending escalation.
    Resolve {
        /// Decision ID of the escalation.
        id: String,
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        note: Option<String>,
    },
    /// Print per-pattern statistics.
    Stats,
    /// Print recorded lessons.
    Lessons,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let handle = ConfigHandle::open(&cli.config);
    let data_dir = PathBuf::from(&handle.current().storage.data_dir);

    match cli.command {
        Command::Run { tick } => run(handle, tick).await?,
        Command::Once { event } => {
            let event: RawEvent = serde_json::from_str(&event)
                .map_err(|e| anyhow::anyhow!("Invalid event JSON: {e}"))?;
            let oracle = oracle::from_config(&handle.current().oracle)?;
            let mut engine = Engine::open(handle, oracle)?;
            engine.ingest(event);
            match engine.run_once().await {
                Some(CycleReport::Decided { decision, .. }) => {
                    println!("{}", serde_json::to_string_pretty(&decision)?)
                }
                Some(CycleReport::Discarded { observation_id }) => {
                    println!("{}", serde_json::json!({ "discarded": observation_id }))
                }
                Some(CycleReport::Requeued { error, .. }) => {
                    anyhow::bail!("Decision could not be recorded: {error}")
                }
                None => anyhow::bail!("Event produced no observation"),
            }
        }
        Command::Outbox => {
            let outbox = EscalationOutbox::open(data_dir.join("outbox"))?;
            for escalation in outbox.list_pending()? {
                println!("{}", serde_json::to_string(&escalation)?);
            }
        }
        Command::Resolve { id, approve, note } => {
            let decision_id = DecisionId(Uuid::parse_str(&id)?);
            let outbox = EscalationOutbox::open(data_dir.join("outbox"))?;
            let resolution = outbox.resolve(decision_id, approve, note)?;
            println!("{}", serde_json::to_string(&resolution)?);
        }
        Command::Stats => {
            let store = FileHistoryStore::open(&data_dir)?;
            let mut stats = store.all_pattern_stats()?;
            stats.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.0.cmp(&b.key.0)));
            for row in stats {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Command::Lessons => {
            let lessons: Journal<Lesson> = Journal::new(data_dir.join("lessons.jsonl"));
            for lesson in lessons.read_all()? {
                println!("{}", serde_json::to_string(&lesson)?);
            }
        }
    }

    Ok(())
}

async fn run(handle: ConfigHandle, tick: Option<u64>) -> anyhow::Result<()> {
    let oracle = oracle::from_config(&handle.current().oracle)?;
    let mut engine = Engine::open(handle, oracle)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(Shutdown::Running);

    tokio::spawn(read_events(engine.ingestor(), shutdown_tx.clone()));

    if let Some(secs) = tick.filter(|s| *s > 0) {
        let ingestor = engine.ingestor();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ingestor.ingest(RawEvent::new(
                    "clock",
                    "time_elapsed",
                    &format!("{secs}s elapsed"),
                ));
            }
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping after the current cycle");
            shutdown_tx.send_replace(Shutdown::Stop);
        }
    });

    engine.run(shutdown_rx).await;
    Ok(())
}

async fn read_events(ingestor: Ingestor, shutdown: watch::Sender<Shutdown>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<RawEvent>(&line) {
                Ok(event) => {
                    ingestor.ingest(event);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping malformed event line"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Event input failed");
                break;
            }
        }
    }
    tracing::info!("Event input closed, draining queue");
    shutdown.send_if_modified(|state| {
        if *state == Shutdown::Running {
            *state = Shutdown::Drain;
            true
        } else {
            false
        }
    });
}
