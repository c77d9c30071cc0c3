//! Standalone position evaluation through one leased session.

use std::time::Duration;

use chess_core::{san_line, validate_fen};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::pool::EnginePool;
use crate::session::SearchOutcome;

#[derive(Debug, Clone)]
pub struct PositionConfig {
    /// Depth used when a request asks for depth 0.
    pub depth: u32,
    /// Ceiling for the search to report `bestmove`.
    pub timeout: Duration,
    /// Candidate lines kept in the result.
    pub lines: usize,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            depth: 18,
            timeout: Duration::from_secs(15),
            lines: 3,
        }
    }
}

/// One engine candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMove {
    /// UCI notation.
    #[serde(rename = "move")]
    pub mv: String,
    pub san: Option<String>,
    /// White-relative.
    pub evaluation_pawns: f64,
    /// Continuation after the move, UCI notation.
    pub continuation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionAnalysis {
    pub fen: String,
    /// White-relative evaluation of the position.
    pub evaluation_pawns: f64,
    /// Ordered best first.
    pub best_moves: Vec<CandidateMove>,
    pub depth_reached: u32,
}

impl PositionAnalysis {
    fn from_outcome(fen: String, outcome: SearchOutcome, keep: usize) -> Self {
        let mut best_moves: Vec<CandidateMove> = outcome
            .lines
            .iter()
            .filter_map(|line| {
                let (first, rest) = line.moves.split_first()?;
                Some(CandidateMove {
                    mv: first.clone(),
                    san: None,
                    evaluation_pawns: line.evaluation.pawns(),
                    continuation: rest.to_vec(),
                })
            })
            .take(keep)
            .collect();

        // Forced positions can finish without any scored line.
        if best_moves.is_empty() {
            if let Some(mv) = outcome.best_move {
                best_moves.push(CandidateMove {
                    mv,
                    san: None,
                    evaluation_pawns: outcome.evaluation.pawns(),
                    continuation: outcome.ponder.into_iter().collect(),
                });
            }
        }

        for candidate in &mut best_moves {
            candidate.san = san_line(&fen, std::slice::from_ref(&candidate.mv))
                .ok()
                .and_then(|line| line.into_iter().next());
        }

        Self {
            fen,
            evaluation_pawns: outcome.evaluation.pawns(),
            best_moves,
            depth_reached: outcome.depth_reached,
        }
    }
}

#[derive(Clone)]
pub struct PositionAnalyzer {
    pool: EnginePool,
    config: PositionConfig,
}

impl PositionAnalyzer {
    pub fn new(pool: EnginePool, config: PositionConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// Evaluate `fen` to `depth` (0 = configured default). The descriptor is
    /// validated before a session is leased.
    pub async fn analyze(
        &self,
        fen: &str,
        depth: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<PositionAnalysis, WorkerError> {
        let fen = validate_fen(fen)?;
        let depth = if depth == 0 { self.config.depth } else { depth };

        let mut lease = self.pool.acquire_with(cancel).await?;
        let session_id = lease.id();
        debug!(session_id, depth, fen = %fen, "Analyzing position");

        lease.set_position(&fen).await?;
        let outcome = lease
            .search_to_depth(depth)
            .await?
            .finish_within(self.config.timeout, cancel)
            .await?;

        let analysis = PositionAnalysis::from_outcome(fen, outcome, self.config.lines);
        info!(
            session_id,
            depth = analysis.depth_reached,
            eval = analysis.evaluation_pawns,
            "Position analyzed"
        );
        Ok(analysis)
    }
}
