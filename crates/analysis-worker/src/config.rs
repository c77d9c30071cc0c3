//! Worker configuration from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::analyzer::GameConfig;
use crate::error::WorkerError;
use crate::jobs::RetryPolicy;
use crate::orchestrator::OrchestratorConfig;
use crate::pool::PoolConfig;
use crate::position::PositionConfig;
use crate::session::EngineOptions;
use crate::sqs::SqsSettings;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Path to Stockfish binary
    pub stockfish_path: String,

    /// Engine processes kept running
    pub pool_size: usize,

    pub engine_threads: u32,
    pub engine_hash_mb: u32,
    /// Candidate lines per search (MultiPV)
    pub engine_multi_pv: u32,
    pub engine_startup_timeout: Duration,
    pub engine_stop_grace: Duration,
    pub engine_shutdown_grace: Duration,

    pub pool_acquire_timeout: Duration,

    pub position_depth: u32,
    pub position_timeout: Duration,

    pub game_movetime: Duration,
    pub game_search_timeout: Duration,

    pub hint_max_attempts: u32,
    pub game_max_attempts: u32,

    /// Postgres connection URL; results stay in memory when unset
    pub database_url: Option<String>,

    /// SQS queue URL for analysis jobs
    pub sqs_queue_url: Option<String>,

    /// Custom SQS endpoint URL (for LocalStack)
    pub sqs_endpoint_url: Option<String>,

    /// SQS visibility timeout in seconds
    pub visibility_timeout_secs: u32,

    /// Consecutive empty SQS receives before exiting
    pub max_empty_receives: u32,
}

impl WorkerConfig {
    /// Load configuration from environment variables. Numeric values fall
    /// back to their defaults when unset or unparsable.
    pub fn from_env() -> Result<Self, WorkerError> {
        let stockfish_path = env::var("STOCKFISH_PATH")
            .unwrap_or_else(|_| "/usr/local/bin/stockfish".to_string());
        if stockfish_path.trim().is_empty() {
            return Err(WorkerError::Config("STOCKFISH_PATH is empty".into()));
        }

        Ok(Self {
            stockfish_path,
            pool_size: env_or("ENGINE_POOL_SIZE", num_cpus::get()).max(1),
            engine_threads: env_or("ENGINE_THREADS", 1u32).max(1),
            engine_hash_mb: env_or("ENGINE_HASH_MB", 256),
            engine_multi_pv: env_or("ENGINE_MULTI_PV", 3u32).max(1),
            engine_startup_timeout: Duration::from_secs(env_or("ENGINE_STARTUP_TIMEOUT_SECS", 10)),
            engine_stop_grace: Duration::from_millis(env_or("ENGINE_STOP_GRACE_MS", 2000)),
            engine_shutdown_grace: Duration::from_millis(env_or("ENGINE_SHUTDOWN_GRACE_MS", 1000)),
            pool_acquire_timeout: Duration::from_secs(env_or("POOL_ACQUIRE_TIMEOUT_SECS", 30)),
            position_depth: env_or("POSITION_DEPTH", 18u32).max(1),
            position_timeout: Duration::from_secs(env_or("POSITION_TIMEOUT_SECS", 15)),
            game_movetime: Duration::from_millis(env_or("GAME_MOVETIME_MS", 100u64).max(1)),
            game_search_timeout: Duration::from_secs(env_or("GAME_SEARCH_TIMEOUT_SECS", 10)),
            hint_max_attempts: env_or("HINT_MAX_ATTEMPTS", 2),
            game_max_attempts: env_or("GAME_MAX_ATTEMPTS", 5),
            database_url: non_empty("DATABASE_URL"),
            sqs_queue_url: non_empty("SQS_QUEUE_URL"),
            sqs_endpoint_url: non_empty("SQS_ENDPOINT_URL"),
            visibility_timeout_secs: env_or("VISIBILITY_TIMEOUT_SECS", 300),
            max_empty_receives: env_or("MAX_EMPTY_RECEIVES", 5),
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            threads: self.engine_threads,
            hash_mb: self.engine_hash_mb,
            multi_pv: self.engine_multi_pv,
            startup_timeout: self.engine_startup_timeout,
            stop_grace: self.engine_stop_grace,
            shutdown_grace: self.engine_shutdown_grace,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            acquire_timeout: self.pool_acquire_timeout,
            ..PoolConfig::default()
        }
    }

    pub fn position_config(&self) -> PositionConfig {
        PositionConfig {
            depth: self.position_depth,
            timeout: self.position_timeout,
            lines: self.engine_multi_pv as usize,
        }
    }

    pub fn game_config(&self) -> GameConfig {
        GameConfig {
            movetime: self.game_movetime,
            search_timeout: self.game_search_timeout,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.pool_size,
            hint_policy: RetryPolicy::hint().with_max_attempts(self.hint_max_attempts),
            game_policy: RetryPolicy::game().with_max_attempts(self.game_max_attempts),
            position: self.position_config(),
            game: self.game_config(),
            ..OrchestratorConfig::default()
        }
    }

    /// SQS settings, when a queue is configured.
    pub fn sqs_settings(&self) -> Option<SqsSettings> {
        Some(SqsSettings {
            queue_url: self.sqs_queue_url.clone()?,
            endpoint_url: self.sqs_endpoint_url.clone(),
            visibility_timeout_secs: self.visibility_timeout_secs,
            max_empty_receives: self.max_empty_receives,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
