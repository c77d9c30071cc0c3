//! Whole-game analysis: walk a game ply by ply against one leased session.

use std::time::Duration;

use chess_core::{replay_moves, san_line, Ply};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analysis::{self, GameAnalysis, MoveRecord};
use crate::error::WorkerError;
use crate::pool::EnginePool;
use crate::session::{EngineSession, SearchOutcome};

#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Search time per position.
    pub movetime: Duration,
    /// Ceiling per search, on top of which the search is stopped.
    pub search_timeout: Duration,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            movetime: Duration::from_millis(100),
            search_timeout: Duration::from_secs(10),
        }
    }
}

/// A recorded game to analyze. Moves may be SAN or UCI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRequest {
    pub game_id: Option<i64>,
    pub start_fen: Option<String>,
    pub moves: Vec<String>,
}

impl GameRequest {
    pub fn from_moves<S: AsRef<str>>(moves: &[S]) -> Self {
        Self {
            moves: moves.iter().map(|m| m.as_ref().to_string()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct GameAnalyzer {
    pool: EnginePool,
    config: GameConfig,
}

impl GameAnalyzer {
    pub fn new(pool: EnginePool, config: GameConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Classify every ply of `request`. The move list is validated before a
    /// session is leased; an empty game never touches the pool.
    pub async fn analyze(
        &self,
        request: &GameRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<GameAnalysis, WorkerError> {
        let plies = replay_moves(request.start_fen.as_deref(), &request.moves)?;
        let Some(first) = plies.first() else {
            return Ok(GameAnalysis::from_records(Vec::new()));
        };

        let mut lease = self.pool.acquire_with(cancel).await?;
        let session_id = lease.id();
        info!(session_id, game_id = ?request.game_id, plies = plies.len(), "Starting game analysis");

        lease.new_game().await?;

        // The position after ply i is the position before ply i+1, so each
        // position is searched once.
        let mut before = self.evaluate(&mut lease, &first.fen_before, cancel).await?;
        let mut records = Vec::with_capacity(plies.len());

        for ply in &plies {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(WorkerError::Cancelled);
            }

            let after = self.evaluate(&mut lease, &ply.fen_after, cancel).await?;
            let record = classify_ply(ply, &before, &after);
            debug!(
                session_id,
                ply = ply.number,
                mv = %record.move_notation,
                cp_loss = record.centipawn_loss,
                category = ?record.category,
                "Classified move"
            );
            records.push(record);
            before = after;
        }

        let analysis = GameAnalysis::from_records(records);
        info!(
            session_id,
            game_id = ?request.game_id,
            acpl = analysis.average_centipawn_loss,
            blunders = analysis.blunders.len(),
            mistakes = analysis.mistakes.len(),
            inaccuracies = analysis.inaccuracies.len(),
            "Game analysis complete"
        );
        Ok(analysis)
    }

    async fn evaluate(
        &self,
        session: &mut EngineSession,
        fen: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<SearchOutcome, WorkerError> {
        session.set_position(fen).await?;
        session
            .search_for_duration(self.config.movetime)
            .await?
            .finish_within(self.config.search_timeout, cancel)
            .await
    }
}

/// Score one ply from the mover's point of view: the engine's best line
/// before the move against the position the move actually produced.
pub fn classify_ply(ply: &Ply, before: &SearchOutcome, after: &SearchOutcome) -> MoveRecord {
    let best_cp = before.evaluation.for_side(ply.mover);
    let actual_cp = after.evaluation.for_side(ply.mover);
    let centipawn_loss = analysis::calculate_cp_loss(best_cp, actual_cp);

    let best_move_notation = before.best_move.as_ref().map(|uci| {
        san_line(&ply.fen_before, std::slice::from_ref(uci))
            .ok()
            .and_then(|line| line.into_iter().next())
            .unwrap_or_else(|| uci.clone())
    });

    MoveRecord {
        move_number: ply.number,
        side: ply.mover,
        move_notation: ply.san.clone(),
        move_uci: ply.uci.clone(),
        evaluation_pawns: after.evaluation.pawns(),
        best_move_notation,
        centipawn_loss,
        category: analysis::classify_move(centipawn_loss),
    }
}
