use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use trade_signal_desk::{
    monitoring::logger::{log_startup, redact_host},
    pipeline::{self, PipelineMode},
    replay::{self, ReplayOptions},
    storage,
    types::{AppConfig, LogFormat},
};

#[derive(Parser, Debug)]
#[command(name = "trade-signal-desk")]
#[command(about = "Classifies trading-channel messages and keeps a trade ledger", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the message processor and the trade manager
    Run {},
    /// Run only the message processor
    Processor {},
    /// Run only the trade manager
    TradeManager {},
    /// Apply database migrations
    Migrate {},
    /// Store one listener message record (JSON) and queue it
    Ingest {
        /// File holding the record; stdin when omitted
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Re-queue stored messages that were never processed
    Replay {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Pause between pushes in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Clear both queues first
        #[arg(long)]
        flush: bool,
    },
}

fn init_tracing(format: LogFormat) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "trade_signal_desk=debug,bot=debug,info");
    }
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_format);
    tracing::info!(target: "bot", "trade-signal-desk starting");
    tracing::debug!(target: "bot", config = %cli.config, "loading config");

    let settings = AppConfig::from_file(&cli.config)?;
    tracing::info!(
        target: "bot",
        config = %cli.config,
        model = %settings.classifier.model,
        message_queue = %settings.pipeline.message_queue,
        trade_action_queue = %settings.pipeline.trade_action_queue,
        postgres_host = redact_host(&settings.postgres.url),
        "config loaded"
    );

    match cli.command.unwrap_or(Commands::Run {}) {
        Commands::Run {} => run(settings, PipelineMode::Both).await?,
        Commands::Processor {} => run(settings, PipelineMode::ProcessorOnly).await?,
        Commands::TradeManager {} => run(settings, PipelineMode::TradeManagerOnly).await?,
        Commands::Migrate {} => {
            let pool = storage::create_pg_pool(&settings.postgres)
                .await
                .context("failed to connect to Postgres")?;
            storage::run_migrations(&pool).await?;
            tracing::info!(target: "bot", "migrations applied");
        }
        Commands::Ingest { file } => pipeline::run_ingest(settings, file).await?,
        Commands::Replay {
            limit,
            delay_ms,
            flush,
        } => {
            let opts = ReplayOptions {
                limit,
                delay: Duration::from_millis(delay_ms),
                flush,
            };
            replay::run_replay(settings, opts).await?;
        }
    }

    Ok(())
}

async fn run(settings: AppConfig, mode: PipelineMode) -> anyhow::Result<()> {
    log_startup(&settings, mode.as_str());
    pipeline::run_pipeline(settings, mode).await
}
