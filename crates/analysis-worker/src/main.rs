//! Analysis Worker
//!
//! Runs a pool of native Stockfish processes and feeds them game analysis
//! jobs from SQS. `--moves` and `--position` analyze a single request
//! locally and print the result as JSON.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use analysis_worker::config::WorkerConfig;
use analysis_worker::db::PgStore;
use analysis_worker::sqs::{SqsClient, SqsIntake};
use analysis_worker::stockfish::StockfishLauncher;
use analysis_worker::{AnalysisStore, EnginePool, GameRequest, MemoryStore, Orchestrator};

enum Mode {
    Game { moves: Vec<String>, fen: Option<String> },
    Position { fen: String, depth: u32 },
    Queue,
}

/// Value following `flag` on the command line.
fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_mode() -> anyhow::Result<Mode> {
    let args: Vec<String> = std::env::args().collect();

    if let Some(moves) = arg_value(&args, "--moves") {
        let moves = moves.split_whitespace().map(String::from).collect();
        return Ok(Mode::Game {
            moves,
            fen: arg_value(&args, "--fen"),
        });
    }

    if let Some(fen) = arg_value(&args, "--position") {
        let depth = match arg_value(&args, "--depth") {
            Some(d) => d.parse().context("--depth must be a number")?,
            None => 0,
        };
        return Ok(Mode::Position { fen, depth });
    }

    Ok(Mode::Queue)
}

async fn open_store(config: &WorkerConfig) -> anyhow::Result<Arc<dyn AnalysisStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set, keeping results in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Cancel `token` on SIGTERM (spot interruption) or Ctrl-C.
fn cancel_on_signal(token: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C");
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load .env file for local dev
    let _ = dotenvy::dotenv();

    let mode = parse_mode()?;
    let config = WorkerConfig::from_env()?;
    info!(
        stockfish_path = %config.stockfish_path,
        pool_size = config.pool_size,
        "Worker config loaded"
    );

    let launcher = Arc::new(StockfishLauncher::new(config.stockfish_path.clone()));
    let pool = EnginePool::start(launcher, config.engine_options(), config.pool_config()).await?;
    let store = open_store(&config).await?;
    let orchestrator = Orchestrator::start(pool, store.clone(), config.orchestrator_config());

    let outcome = run(&mode, &config, &orchestrator, store).await;
    orchestrator.shutdown().await;
    outcome
}

async fn run(
    mode: &Mode,
    config: &WorkerConfig,
    orchestrator: &Orchestrator,
    store: Arc<dyn AnalysisStore>,
) -> anyhow::Result<()> {
    match mode {
        Mode::Game { moves, fen } => {
            let request = GameRequest {
                game_id: None,
                start_fen: fen.clone(),
                moves: moves.clone(),
            };
            let output = orchestrator.submit_game(request)?.wait().await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Mode::Position { fen, depth } => {
            let output = orchestrator.submit_position(fen, *depth)?.wait().await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Mode::Queue => {
            let settings = config
                .sqs_settings()
                .context("SQS_QUEUE_URL not set (use --moves or --position for local runs)")?;

            let sqs = SqsClient::new(&settings).await?;
            info!(queue_url = %settings.queue_url, "SQS client ready");

            let shutdown = CancellationToken::new();
            cancel_on_signal(shutdown.clone())?;

            let intake = SqsIntake::new(
                sqs,
                store,
                settings.max_empty_receives,
                orchestrator.pool().size(),
            );
            let stats = intake.run(orchestrator, shutdown).await?;
            if stats.failed > 0 {
                warn!(failed = stats.failed, "Some jobs failed");
            }
            info!("Graceful shutdown complete");
        }
    }
    Ok(())
}
