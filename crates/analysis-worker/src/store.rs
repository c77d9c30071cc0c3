//! Persistence contract for analysis results, plus an in-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::analysis::GameAnalysis;
use crate::analyzer::GameRequest;
use crate::error::WorkerError;
use crate::jobs::{JobId, JobKind};
use crate::position::PositionAnalysis;

/// A job that will not be retried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub kind: JobKind,
    pub game_id: Option<i64>,
    pub fen: Option<String>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn save_position(
        &self,
        job_id: JobId,
        analysis: &PositionAnalysis,
    ) -> Result<(), WorkerError>;

    async fn save_game(
        &self,
        job_id: JobId,
        game_id: Option<i64>,
        analysis: &GameAnalysis,
    ) -> Result<(), WorkerError>;

    async fn record_failure(&self, failure: &JobFailure) -> Result<(), WorkerError>;

    /// Load a stored game's moves for analysis.
    async fn load_game(&self, game_id: i64) -> Result<GameRequest, WorkerError>;
}

#[derive(Default)]
struct MemoryState {
    positions: Vec<(JobId, PositionAnalysis)>,
    games: Vec<(JobId, Option<i64>, GameAnalysis)>,
    failures: Vec<JobFailure>,
    stored_games: HashMap<i64, GameRequest>,
}

/// Keeps everything in memory. Used for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a game available to [`AnalysisStore::load_game`].
    pub fn insert_game(&self, game_id: i64, moves: Vec<String>) {
        let request = GameRequest {
            game_id: Some(game_id),
            start_fen: None,
            moves,
        };
        self.state.lock().stored_games.insert(game_id, request);
    }

    pub fn positions(&self) -> Vec<(JobId, PositionAnalysis)> {
        self.state.lock().positions.clone()
    }

    pub fn games(&self) -> Vec<(JobId, Option<i64>, GameAnalysis)> {
        self.state.lock().games.clone()
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        self.state.lock().failures.clone()
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn save_position(
        &self,
        job_id: JobId,
        analysis: &PositionAnalysis,
    ) -> Result<(), WorkerError> {
        self.state.lock().positions.push((job_id, analysis.clone()));
        Ok(())
    }

    async fn save_game(
        &self,
        job_id: JobId,
        game_id: Option<i64>,
        analysis: &GameAnalysis,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock();
        // Re-analysis of a stored game replaces the earlier result.
        if let Some(id) = game_id {
            state.games.retain(|(_, existing, _)| *existing != Some(id));
        }
        state.games.push((job_id, game_id, analysis.clone()));
        Ok(())
    }

    async fn record_failure(&self, failure: &JobFailure) -> Result<(), WorkerError> {
        self.state.lock().failures.push(failure.clone());
        Ok(())
    }

    async fn load_game(&self, game_id: i64) -> Result<GameRequest, WorkerError> {
        self.state
            .lock()
            .stored_games
            .get(&game_id)
            .cloned()
            .ok_or(WorkerError::GameNotFound(game_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_game_replaces_same_game() {
        let store = MemoryStore::new();
        let analysis = GameAnalysis::from_records(Vec::new());
        store.save_game(JobId(1), Some(9), &analysis).await.unwrap();
        store.save_game(JobId(2), Some(9), &analysis).await.unwrap();
        store.save_game(JobId(3), None, &analysis).await.unwrap();

        let games = store.games();
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].0, JobId(2));
    }

    #[tokio::test]
    async fn test_load_game() {
        let store = MemoryStore::new();
        store.insert_game(4, vec!["e4".into(), "e5".into()]);
        let request = store.load_game(4).await.unwrap();
        assert_eq!(request.game_id, Some(4));
        assert_eq!(request.moves.len(), 2);
        assert!(matches!(
            store.load_game(5).await,
            Err(WorkerError::GameNotFound(5))
        ));
    }
}
