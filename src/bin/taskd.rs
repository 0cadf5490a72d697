//! taskd: flush worker process and WAL inspection tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use taskwal::flush::{FlushWorker, FlushWorkerConfig};
use taskwal::storage::{SqliteTaskRepository, TaskRepository};
use taskwal::telemetry::{OtelHooks, TelemetryConfig, init_telemetry};
use taskwal::wal::EventLogReader;

#[derive(Parser)]
#[command(name = "taskd", about = "Durable task engine tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the flush worker; speaks length-prefixed JSON on stdin/stdout
    FlushWorker {
        /// Event log path
        #[arg(long)]
        wal: PathBuf,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        #[arg(long, default_value_t = 5)]
        breaker_threshold: u32,
        #[arg(long, default_value_t = 30_000)]
        breaker_reset_ms: u64,
        /// First retry delay within one batch; doubles per attempt
        #[arg(long, default_value_t = 100)]
        retry_base_ms: u64,
        /// Drain budget on shutdown
        #[arg(long, default_value_t = 10_000)]
        shutdown_timeout_ms: u64,
    },
    /// Event log inspection
    Wal {
        #[command(subcommand)]
        action: WalAction,
    },
}

#[derive(Subcommand)]
enum WalAction {
    /// Print every entry across generations
    Inspect {
        #[arg(long)]
        wal: PathBuf,
    },
    /// Print the log and flush checkpoints and the lag between them
    Checkpoints {
        #[arg(long)]
        wal: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        service_name: "taskd".to_string(),
        default_filter: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
    })?;

    match cli.command {
        Command::FlushWorker {
            wal,
            interval_ms,
            batch_size,
            max_retries,
            breaker_threshold,
            breaker_reset_ms,
            retry_base_ms,
            shutdown_timeout_ms,
        } => {
            let mut config = FlushWorkerConfig::new(wal);
            config.flush_interval = Duration::from_millis(interval_ms);
            config.max_batch_size = batch_size;
            config.max_retries = max_retries;
            config.circuit_breaker_threshold = breaker_threshold;
            config.circuit_breaker_reset = Duration::from_millis(breaker_reset_ms);
            config.retry_base_delay = Duration::from_millis(retry_base_ms);
            config.shutdown_timeout = Duration::from_millis(shutdown_timeout_ms);
            cmd_flush_worker(config).await
        }
        Command::Wal { action } => match action {
            WalAction::Inspect { wal } => cmd_wal_inspect(wal).await,
            WalAction::Checkpoints { wal } => cmd_wal_checkpoints(wal).await,
        },
    }
}

async fn cmd_flush_worker(config: FlushWorkerConfig) -> anyhow::Result<()> {
    let database_url = SecretString::from(
        std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))?,
    );
    let repository = SqliteTaskRepository::connect(database_url.expose_secret()).await?;
    repository.initialize().await?;
    let repository: Arc<dyn TaskRepository> = Arc::new(repository);

    let worker = FlushWorker::new(config, repository)
        .await?
        .with_hooks(Arc::new(OtelHooks));
    worker
        .run_ipc(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(())
}

async fn cmd_wal_inspect(wal: PathBuf) -> anyhow::Result<()> {
    let reader = EventLogReader::new(wal)?;
    let generations = reader.generations().await?;

    println!(
        "{:<8}  {:<10}  {:<36}  {:<24}  KEY",
        "SEQ", "TYPE", "TASK", "TIMESTAMP"
    );
    println!("{}", "-".repeat(110));

    let mut total = 0;
    let mut malformed = 0;
    for path in generations.iter().rev() {
        let file = reader.read_file(path).await?;
        malformed += file.malformed;
        for event in &file.events {
            let key = event.entry.idempotency_key.to_string();
            println!(
                "{:<8}  {:<10}  {:<36}  {:<24}  {}",
                event.seq,
                event.entry.entry_type.as_str(),
                event.entry.task_id,
                event.entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                &key[..key.len().min(16)]
            );
        }
        total += file.events.len();
    }

    println!(
        "\n{total} entr{} in {} file(s), {malformed} malformed line(s)",
        if total == 1 { "y" } else { "ies" },
        generations.len()
    );
    Ok(())
}

async fn cmd_wal_checkpoints(wal: PathBuf) -> anyhow::Result<()> {
    let reader = EventLogReader::new(wal)?;
    let checkpoint = reader.read_checkpoint().await?;
    let flushed = reader.read_flush_checkpoint().await?;
    let last = reader.last_known_seq().await?;

    let show = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or("-".to_string());
    println!("Log seq:          {last}");
    println!("Log checkpoint:   {}", show(checkpoint));
    println!("Flush checkpoint: {}", show(flushed));
    println!("Flush lag:        {}", last.saturating_sub(flushed.unwrap_or(0)));
    Ok(())
}
