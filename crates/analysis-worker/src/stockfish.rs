//! Stockfish process launcher (async I/O)

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::WorkerError;
use crate::pool::EngineLauncher;
use crate::session::{EngineOptions, EngineSession};

/// Spawns a UCI engine binary with piped stdin/stdout. The pool runs the
/// handshake on the returned session.
#[derive(Debug, Clone)]
pub struct StockfishLauncher {
    path: String,
}

impl StockfishLauncher {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl EngineLauncher for StockfishLauncher {
    async fn launch(&self, id: usize, options: &EngineOptions) -> Result<EngineSession, WorkerError> {
        let mut process = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::EngineStartup(format!("Failed to spawn {}: {e}", self.path))
            })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| WorkerError::EngineStartup("engine stdin not captured".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| WorkerError::EngineStartup("engine stdout not captured".into()))?;

        debug!(session_id = id, path = %self.path, pid = ?process.id(), "Spawned engine");

        Ok(EngineSession::connect(
            id,
            stdout,
            stdin,
            Some(process),
            options.clone(),
        ))
    }
}
