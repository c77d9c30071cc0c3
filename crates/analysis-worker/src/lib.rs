//! Engine analysis worker: a pool of UCI engine sessions, position and
//! game analyzers built on it, and a job orchestrator that schedules
//! analysis with priority, retries and backoff.

pub mod analysis;
pub mod analyzer;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod pool;
pub mod position;
pub mod session;
pub mod sqs;
pub mod stockfish;
pub mod store;
pub mod uci;

pub use analysis::{Evaluation, GameAnalysis, MoveCategory, MoveRecord, SideSummary};
pub use analyzer::{GameAnalyzer, GameConfig, GameRequest};
pub use error::WorkerError;
pub use jobs::{JobId, JobKind, JobOutput, JobPayload, RetryPolicy, PRIORITY_GAME, PRIORITY_HINT};
pub use orchestrator::{JobHandle, Orchestrator, OrchestratorConfig};
pub use pool::{EngineLauncher, EnginePool, PoolConfig, PoolStatus, SessionLease};
pub use position::{CandidateMove, PositionAnalysis, PositionAnalyzer, PositionConfig};
pub use session::{EngineOptions, EngineSession, SearchEvent, SearchOutcome, SessionState};
pub use store::{AnalysisStore, JobFailure, MemoryStore};
