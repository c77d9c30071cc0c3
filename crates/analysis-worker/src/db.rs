//! Postgres-backed analysis store

use async_trait::async_trait;
use chess_core::pgn::extract_moves;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::analysis::GameAnalysis;
use crate::analyzer::GameRequest;
use crate::error::WorkerError;
use crate::jobs::JobId;
use crate::position::PositionAnalysis;
use crate::store::{AnalysisStore, JobFailure};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS position_analysis (
        fen TEXT NOT NULL,
        depth INTEGER NOT NULL,
        evaluation_pawns DOUBLE PRECISION NOT NULL,
        best_moves JSONB NOT NULL,
        job_id BIGINT NOT NULL,
        analyzed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (fen, depth)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS game_analysis (
        game_id BIGINT PRIMARY KEY,
        job_id BIGINT NOT NULL,
        average_cp_loss DOUBLE PRECISION NOT NULL,
        game_quality DOUBLE PRECISION NOT NULL,
        white_accuracy DOUBLE PRECISION NOT NULL,
        black_accuracy DOUBLE PRECISION NOT NULL,
        white_avg_cp_loss DOUBLE PRECISION NOT NULL,
        black_avg_cp_loss DOUBLE PRECISION NOT NULL,
        blunders INTEGER NOT NULL,
        mistakes INTEGER NOT NULL,
        inaccuracies INTEGER NOT NULL,
        moves JSONB NOT NULL,
        analyzed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS analysis_failures (
        id BIGSERIAL PRIMARY KEY,
        job_id BIGINT NOT NULL,
        kind TEXT NOT NULL,
        game_id BIGINT,
        fen TEXT,
        attempts INTEGER NOT NULL,
        error TEXT NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL
    )"#,
];

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, WorkerError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("Connected to database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the result tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), WorkerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisStore for PgStore {
    async fn save_position(
        &self,
        job_id: JobId,
        analysis: &PositionAnalysis,
    ) -> Result<(), WorkerError> {
        let best_moves = serde_json::to_value(&analysis.best_moves)?;

        sqlx::query(
            r#"INSERT INTO position_analysis (fen, depth, evaluation_pawns, best_moves, job_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (fen, depth) DO UPDATE SET
                evaluation_pawns = EXCLUDED.evaluation_pawns,
                best_moves = EXCLUDED.best_moves,
                job_id = EXCLUDED.job_id,
                analyzed_at = NOW()"#,
        )
        .bind(&analysis.fen)
        .bind(i32::try_from(analysis.depth_reached).unwrap_or(i32::MAX))
        .bind(analysis.evaluation_pawns)
        .bind(&best_moves)
        .bind(job_id.0 as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_game(
        &self,
        job_id: JobId,
        game_id: Option<i64>,
        analysis: &GameAnalysis,
    ) -> Result<(), WorkerError> {
        let Some(game_id) = game_id else {
            debug!(%job_id, "Ad-hoc game analysis, nothing to persist");
            return Ok(());
        };

        let moves = serde_json::to_value(&analysis.moves)?;

        sqlx::query(
            r#"INSERT INTO game_analysis (
                game_id, job_id, average_cp_loss, game_quality,
                white_accuracy, black_accuracy,
                white_avg_cp_loss, black_avg_cp_loss,
                blunders, mistakes, inaccuracies, moves
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (game_id) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                average_cp_loss = EXCLUDED.average_cp_loss,
                game_quality = EXCLUDED.game_quality,
                white_accuracy = EXCLUDED.white_accuracy,
                black_accuracy = EXCLUDED.black_accuracy,
                white_avg_cp_loss = EXCLUDED.white_avg_cp_loss,
                black_avg_cp_loss = EXCLUDED.black_avg_cp_loss,
                blunders = EXCLUDED.blunders,
                mistakes = EXCLUDED.mistakes,
                inaccuracies = EXCLUDED.inaccuracies,
                moves = EXCLUDED.moves,
                analyzed_at = NOW()"#,
        )
        .bind(game_id)
        .bind(job_id.0 as i64)
        .bind(analysis.average_centipawn_loss)
        .bind(analysis.game_quality)
        .bind(analysis.white.accuracy)
        .bind(analysis.black.accuracy)
        .bind(analysis.white.average_centipawn_loss)
        .bind(analysis.black.average_centipawn_loss)
        .bind(analysis.blunders.len() as i32)
        .bind(analysis.mistakes.len() as i32)
        .bind(analysis.inaccuracies.len() as i32)
        .bind(&moves)
        .execute(&self.pool)
        .await?;

        // Mark game as analyzed
        sqlx::query("UPDATE user_games SET analyzed_at = NOW() WHERE id = $1")
            .bind(game_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_failure(&self, failure: &JobFailure) -> Result<(), WorkerError> {
        sqlx::query(
            r#"INSERT INTO analysis_failures (job_id, kind, game_id, fen, attempts, error, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(failure.job_id.0 as i64)
        .bind(failure.kind.to_string())
        .bind(failure.game_id)
        .bind(&failure.fen)
        .bind(failure.attempts as i32)
        .bind(&failure.error)
        .bind(failure.failed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_game(&self, game_id: i64) -> Result<GameRequest, WorkerError> {
        let row: Option<(Option<JsonValue>, Option<String>)> =
            sqlx::query_as("SELECT moves, pgn FROM user_games WHERE id = $1")
                .bind(game_id)
                .fetch_optional(&self.pool)
                .await?;

        let (moves_json, pgn) = row.ok_or(WorkerError::GameNotFound(game_id))?;
        let moves = moves_json
            .as_ref()
            .and_then(moves_from_json)
            .or_else(|| pgn.as_deref().map(extract_moves))
            .unwrap_or_default();

        debug!(game_id, move_count = moves.len(), "Loaded game");
        Ok(GameRequest {
            game_id: Some(game_id),
            start_fen: None,
            moves,
        })
    }
}

/// A JSON array of move strings. Anything else is treated as missing.
fn moves_from_json(value: &JsonValue) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|mv| mv.as_str().map(String::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_moves_from_json() {
        assert_eq!(
            moves_from_json(&json!(["e4", "e5", "Nf3"])),
            Some(vec!["e4".to_string(), "e5".into(), "Nf3".into()])
        );
        assert_eq!(moves_from_json(&json!(["e4", 5])), None);
        assert_eq!(moves_from_json(&json!({"moves": []})), None);
    }
}
