//! One engine process driven over UCI.
//!
//! A background task turns the engine's stdout into [`EngineEvent`]s on a
//! bounded channel; whichever command is in flight consumes them. The
//! [`SessionState`] machine rejects commands issued out of turn, and any
//! pipe failure marks the session dead for the pool to replace.

use std::collections::BTreeMap;
use std::time::Duration;

use chess_core::{side_to_move, Side};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::Evaluation;
use crate::error::WorkerError;
use crate::uci::{parse_line, Command, EngineEvent, InfoLine};

const EVENT_BUFFER: usize = 1024;

/// Engine configuration applied during the handshake, plus protocol timing.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub threads: u32,
    pub hash_mb: u32,
    /// Number of candidate lines (MultiPV).
    pub multi_pv: u32,
    /// Ceiling for the handshake and other `isready` round trips.
    pub startup_timeout: Duration,
    /// How long an interrupted search may take to report `bestmove`.
    pub stop_grace: Duration,
    /// How long to wait for the process to exit after `quit`.
    pub shutdown_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            hash_mb: 256,
            multi_pv: 3,
            startup_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    AwaitingReady,
    Idle,
    Searching,
    Draining,
    Dead,
}

/// Latest report for one candidate line.
#[derive(Debug, Clone, PartialEq)]
pub struct PvLine {
    pub rank: u32,
    pub depth: u32,
    pub evaluation: Evaluation,
    pub moves: Vec<String>,
}

/// Result of a completed search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub best_move: Option<String>,
    pub ponder: Option<String>,
    /// White-relative evaluation of the searched position.
    pub evaluation: Evaluation,
    pub depth_reached: u32,
    /// Most recent report per candidate line, ordered by rank.
    pub lines: Vec<PvLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    Info(InfoLine),
    Finished(SearchOutcome),
}

pub struct EngineSession {
    id: usize,
    name: String,
    state: SessionState,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    events: mpsc::Receiver<EngineEvent>,
    reader: JoinHandle<()>,
    child: Option<Child>,
    side_to_move: Side,
    options: EngineOptions,
}

impl EngineSession {
    /// Wrap an engine's output/input streams. `child`, when present, is
    /// reaped on shutdown and killed on drop.
    pub fn connect<R, W>(
        id: usize,
        reader: R,
        writer: W,
        child: Option<Child>,
        options: EngineOptions,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_events(id, reader, tx));

        Self {
            id,
            name: String::new(),
            state: SessionState::Starting,
            writer: Box::new(writer),
            events,
            reader,
            child,
            side_to_move: Side::White,
            options,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Engine name from `id name`, empty until initialized.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == SessionState::Dead
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Handshake and configure the engine, returning once `readyok` arrives.
    pub async fn initialize(&mut self) -> Result<(), WorkerError> {
        if self.state != SessionState::Starting {
            return Err(self.out_of_turn("initialize"));
        }

        let limit = self.options.startup_timeout;
        if let Err(e) = self.handshake(Instant::now() + limit).await {
            self.mark_dead();
            return Err(match e {
                WorkerError::EngineCrash(msg) | WorkerError::Protocol(msg) => {
                    WorkerError::EngineStartup(msg)
                }
                WorkerError::AnalysisTimeout(_) => {
                    WorkerError::EngineStartup(format!("no readyok within {limit:?}"))
                }
                other => other,
            });
        }

        self.state = SessionState::Idle;
        info!(session_id = self.id, engine = %self.name, "Engine ready");
        Ok(())
    }

    async fn handshake(&mut self, deadline: Instant) -> Result<(), WorkerError> {
        self.state = SessionState::AwaitingReady;
        self.send(Command::Uci).await?;
        loop {
            match self.recv_until(deadline).await? {
                Some(EngineEvent::Id { name }) => self.name = name,
                Some(EngineEvent::UciOk) => break,
                Some(_) => {}
                None => return Err(WorkerError::AnalysisTimeout(self.options.startup_timeout)),
            }
        }

        let settings = [
            ("Threads", self.options.threads.to_string()),
            ("Hash", self.options.hash_mb.to_string()),
            ("MultiPV", self.options.multi_pv.to_string()),
            ("UCI_AnalyseMode", "true".to_string()),
        ];
        for (name, value) in settings {
            self.send(Command::SetOption { name, value }).await?;
        }

        self.sync(deadline).await
    }

    /// `isready` round trip.
    async fn sync(&mut self, deadline: Instant) -> Result<(), WorkerError> {
        self.send(Command::IsReady).await?;
        loop {
            match self.recv_until(deadline).await? {
                Some(EngineEvent::ReadyOk) => return Ok(()),
                Some(_) => {}
                None => return Err(WorkerError::AnalysisTimeout(self.options.startup_timeout)),
            }
        }
    }

    /// Reset engine state between unrelated games.
    pub async fn new_game(&mut self) -> Result<(), WorkerError> {
        self.ensure_idle("ucinewgame")?;
        self.send(Command::NewGame).await?;

        self.state = SessionState::AwaitingReady;
        let deadline = Instant::now() + self.options.startup_timeout;
        match self.sync(deadline).await {
            Ok(()) => {
                self.state = SessionState::Idle;
                Ok(())
            }
            Err(e) => {
                self.mark_dead();
                Err(e)
            }
        }
    }

    /// Set the position to search. The engine sends no reply.
    pub async fn set_position(&mut self, fen: &str) -> Result<(), WorkerError> {
        self.ensure_idle("position")?;
        let side = side_to_move(fen).ok_or_else(|| {
            WorkerError::InvalidPosition(format!("no side to move in '{fen}'"))
        })?;

        self.send(Command::Position {
            fen: fen.to_string(),
        })
        .await?;
        self.side_to_move = side;
        Ok(())
    }

    pub async fn search_to_depth(&mut self, depth: u32) -> Result<Search<'_>, WorkerError> {
        self.begin_search(Command::GoDepth(depth)).await
    }

    pub async fn search_for_duration(&mut self, movetime: Duration) -> Result<Search<'_>, WorkerError> {
        let ms = u64::try_from(movetime.as_millis()).unwrap_or(u64::MAX).max(1);
        self.begin_search(Command::GoMovetime(ms)).await
    }

    async fn begin_search(&mut self, go: Command) -> Result<Search<'_>, WorkerError> {
        self.ensure_idle("go")?;
        self.send(go).await?;
        self.state = SessionState::Searching;
        Ok(Search::new(self))
    }

    /// Bring a session whose last exchange was abandoned back to `Idle`.
    /// Marks the session dead if the engine does not respond in time.
    pub async fn recover(&mut self) -> Result<(), WorkerError> {
        let grace = self.options.stop_grace;
        let deadline = Instant::now() + grace;

        match self.state {
            SessionState::Idle => return Ok(()),
            SessionState::Searching => {
                debug!(session_id = self.id, "Stopping abandoned search");
                self.send(Command::Stop).await?;
                loop {
                    match self.recv_until(deadline).await? {
                        Some(EngineEvent::BestMove { .. }) => break,
                        Some(_) => {}
                        None => {
                            self.mark_dead();
                            return Err(WorkerError::AnalysisTimeout(grace));
                        }
                    }
                }
            }
            SessionState::AwaitingReady => loop {
                match self.recv_until(deadline).await? {
                    Some(EngineEvent::ReadyOk) => break,
                    Some(_) => {}
                    None => {
                        self.mark_dead();
                        return Err(WorkerError::AnalysisTimeout(grace));
                    }
                }
            },
            SessionState::Starting | SessionState::Draining | SessionState::Dead => {
                self.mark_dead();
                return Err(WorkerError::EngineCrash(format!(
                    "session {} cannot be recovered",
                    self.id
                )));
            }
        }

        self.state = SessionState::Idle;
        Ok(())
    }

    /// Best-effort `quit`, then kill the process if it outlives the grace period.
    pub async fn shutdown(&mut self) {
        if self.state != SessionState::Dead {
            self.state = SessionState::Draining;
            let _ = self.send(Command::Quit).await;
        }

        if let Some(mut child) = self.child.take() {
            if timeout(self.options.shutdown_grace, child.wait()).await.is_err() {
                warn!(session_id = self.id, "Engine ignored quit, killing");
                let _ = child.kill().await;
            }
        }

        self.reader.abort();
        self.state = SessionState::Dead;
        debug!(session_id = self.id, "Engine shut down");
    }

    fn mark_dead(&mut self) {
        if self.state != SessionState::Dead {
            warn!(session_id = self.id, state = ?self.state, "Engine session marked dead");
        }
        self.state = SessionState::Dead;
    }

    fn ensure_idle(&self, command: &str) -> Result<(), WorkerError> {
        if self.state == SessionState::Idle {
            Ok(())
        } else {
            Err(self.out_of_turn(command))
        }
    }

    fn out_of_turn(&self, command: &str) -> WorkerError {
        if self.state == SessionState::Dead {
            WorkerError::EngineCrash(format!("session {} is dead", self.id))
        } else {
            WorkerError::Protocol(format!(
                "cannot send {command} while session {} is {:?}",
                self.id, self.state
            ))
        }
    }

    async fn send(&mut self, cmd: Command) -> Result<(), WorkerError> {
        let text = cmd.to_string();
        debug!(session_id = self.id, cmd = %text, "engine <");

        let written = async {
            self.writer.write_all(text.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        }
        .await;

        written.map_err(|e| {
            self.mark_dead();
            WorkerError::EngineCrash(format!("failed to write to engine: {e}"))
        })
    }

    async fn recv(&mut self) -> Result<EngineEvent, WorkerError> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => {
                self.mark_dead();
                Err(WorkerError::EngineCrash("engine output closed".into()))
            }
        }
    }

    /// Next event, or `None` once `deadline` passes.
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<EngineEvent>, WorkerError> {
        match timeout_at(deadline, self.recv()).await {
            Ok(event) => event.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

async fn read_events<R>(session_id: usize, reader: R, tx: mpsc::Sender<EngineEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(session_id, line = line.trim(), "engine >");
                if tx.send(parse_line(&line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to read from engine");
                break;
            }
        }
    }
}

/// An in-flight search: a lazy sequence of intermediate events ending in
/// exactly one [`SearchEvent::Finished`].
///
/// Dropping a `Search` before it finishes leaves the session `Searching`;
/// [`EngineSession::recover`] stops it.
pub struct Search<'a> {
    session: &'a mut EngineSession,
    lines: BTreeMap<u32, PvLine>,
    last_evaluation: Option<Evaluation>,
    depth_reached: u32,
    finished: bool,
}

impl<'a> Search<'a> {
    fn new(session: &'a mut EngineSession) -> Self {
        Self {
            session,
            lines: BTreeMap::new(),
            last_evaluation: None,
            depth_reached: 0,
            finished: false,
        }
    }

    /// Next search event, `None` after the terminal event was returned.
    pub async fn next_event(&mut self) -> Result<Option<SearchEvent>, WorkerError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            match self.session.recv().await? {
                EngineEvent::Info(info) => {
                    self.absorb(&info);
                    return Ok(Some(SearchEvent::Info(info)));
                }
                EngineEvent::BestMove { mv, ponder } => {
                    self.finished = true;
                    self.session.state = SessionState::Idle;
                    return Ok(Some(SearchEvent::Finished(self.outcome(mv, ponder))));
                }
                _ => {}
            }
        }
    }

    /// Consume events until the engine reports its best move.
    pub async fn finish(&mut self) -> Result<SearchOutcome, WorkerError> {
        while let Some(event) = self.next_event().await? {
            if let SearchEvent::Finished(outcome) = event {
                return Ok(outcome);
            }
        }
        Err(WorkerError::Protocol("search already finished".into()))
    }

    /// Interrupt the search and collect whatever the engine settled on.
    pub async fn stop(&mut self) -> Result<SearchOutcome, WorkerError> {
        if self.finished {
            return Err(WorkerError::Protocol("search already finished".into()));
        }

        self.session.send(Command::Stop).await?;
        let grace = self.session.options.stop_grace;
        let settled = timeout(grace, self.finish()).await;
        match settled {
            Ok(outcome) => outcome,
            Err(_) => {
                self.session.mark_dead();
                Err(WorkerError::AnalysisTimeout(grace))
            }
        }
    }

    /// Finish within `limit`. On timeout or cancellation the search is
    /// stopped so the session stays usable, and the interruption is returned
    /// as the error.
    pub async fn finish_within(
        &mut self,
        limit: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<SearchOutcome, WorkerError> {
        let interrupted = {
            let finished = timeout(limit, self.finish());
            match cancel {
                Some(token) => tokio::select! {
                    result = finished => match result {
                        Ok(outcome) => return outcome,
                        Err(_) => WorkerError::AnalysisTimeout(limit),
                    },
                    _ = token.cancelled() => WorkerError::Cancelled,
                },
                None => match finished.await {
                    Ok(outcome) => return outcome,
                    Err(_) => WorkerError::AnalysisTimeout(limit),
                },
            }
        };

        debug!(session_id = self.session.id, reason = %interrupted, "Interrupting search");
        if let Err(e) = self.stop().await {
            warn!(session_id = self.session.id, error = %e, "Engine did not stop cleanly");
        }
        Err(interrupted)
    }

    fn absorb(&mut self, info: &InfoLine) {
        if let Some(depth) = info.depth {
            self.depth_reached = self.depth_reached.max(depth);
        }
        let Some(score) = info.score else {
            return;
        };

        let evaluation = Evaluation::from_engine(score, self.session.side_to_move);
        self.last_evaluation = Some(evaluation);

        if !info.pv.is_empty() {
            let rank = info.rank();
            self.lines.insert(
                rank,
                PvLine {
                    rank,
                    depth: info.depth.unwrap_or(0),
                    evaluation,
                    moves: info.pv.clone(),
                },
            );
        }
    }

    fn outcome(&mut self, best_move: Option<String>, ponder: Option<String>) -> SearchOutcome {
        let lines: Vec<PvLine> = std::mem::take(&mut self.lines).into_values().collect();
        let evaluation = lines
            .first()
            .filter(|line| line.rank == 1)
            .map(|line| line.evaluation)
            .or(self.last_evaluation)
            .unwrap_or_default();

        SearchOutcome {
            best_move,
            ponder,
            evaluation,
            depth_reached: self.depth_reached,
            lines,
        }
    }
}
