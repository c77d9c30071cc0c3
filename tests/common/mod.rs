#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_worker::store::JobFailure;
use analysis_worker::{
    AnalysisStore, EngineLauncher, EngineOptions, EnginePool, EngineSession, GameAnalysis,
    GameRequest, JobId, PoolConfig, PositionAnalysis, RetryPolicy, WorkerError,
};
use async_trait::async_trait;
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// What the scripted engine says about one position. Scores are relative
/// to the side to move, as a real engine reports them.
#[derive(Debug, Clone)]
pub struct Reply {
    pub lines: Vec<(i32, Vec<String>)>,
    pub best: String,
}

impl Reply {
    fn render(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .lines
            .iter()
            .enumerate()
            .map(|(i, (cp, pv))| {
                format!(
                    "info depth 12 seldepth 16 multipv {} score cp {cp} nodes 4096 nps 100000 pv {}",
                    i + 1,
                    pv.join(" ")
                )
            })
            .collect();
        out.push(format!("bestmove {}", self.best));
        out
    }
}

/// Position key: piece placement and side to move.
fn key(fen: &str) -> String {
    fen.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
pub struct Script {
    replies: Mutex<HashMap<String, Reply>>,
    go_commands: Mutex<Vec<String>>,
    crash_next: AtomicUsize,
    hang: AtomicBool,
    delay_ms: AtomicUsize,
    fail_launches: AtomicUsize,
    launches: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Single-line answer for `fen`.
    pub fn score(&self, fen: &str, cp: i32, best: &str) {
        self.lines(fen, vec![(cp, vec![best])]);
    }

    /// Multi-line answer for `fen`; the first line's first move is `bestmove`.
    pub fn lines(&self, fen: &str, lines: Vec<(i32, Vec<&str>)>) {
        let best = lines
            .first()
            .and_then(|(_, pv)| pv.first())
            .map(|m| m.to_string())
            .unwrap_or_else(|| "0000".to_string());
        let lines = lines
            .into_iter()
            .map(|(cp, pv)| (cp, pv.into_iter().map(String::from).collect()))
            .collect();
        self.replies
            .lock()
            .unwrap()
            .insert(key(fen), Reply { lines, best });
    }

    /// The next `n` searches close the pipes instead of answering.
    pub fn crash_next_searches(&self, n: usize) {
        self.crash_next.store(n, Ordering::SeqCst);
    }

    /// Searches run until `stop`.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// The next `n` launches fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn go_commands(&self) -> Vec<String> {
        self.go_commands.lock().unwrap().clone()
    }

    pub fn searches(&self) -> usize {
        self.go_commands.lock().unwrap().len()
    }

    fn reply_for(&self, fen: &str) -> Reply {
        self.replies
            .lock()
            .unwrap()
            .get(&key(fen))
            .cloned()
            .unwrap_or_else(|| Reply {
                lines: vec![(0, vec!["0000".to_string()])],
                best: "0000".to_string(),
            })
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn serve(script: Arc<Script>, engine: DuplexStream) {
    let (read, mut write) = split(engine);
    let mut commands = BufReader::new(read).lines();
    let mut position = String::new();

    while let Ok(Some(line)) = commands.next_line().await {
        let cmd = line.trim().to_string();
        let reply: Vec<String> = if cmd == "uci" {
            vec!["id name FakeFish 1.0".into(), "uciok".into()]
        } else if cmd == "isready" {
            vec!["readyok".into()]
        } else if let Some(fen) = cmd.strip_prefix("position fen ") {
            position = fen.to_string();
            continue;
        } else if cmd.starts_with("go") {
            script.go_commands.lock().unwrap().push(cmd.clone());
            if Script::take_one(&script.crash_next) {
                return;
            }
            if script.hang.load(Ordering::SeqCst) {
                loop {
                    match commands.next_line().await {
                        Ok(Some(l)) if l.trim() == "stop" => break,
                        Ok(Some(_)) => continue,
                        _ => return,
                    }
                }
            } else {
                let delay = script.delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                }
            }
            script.reply_for(&position).render()
        } else if cmd == "quit" {
            return;
        } else {
            continue;
        };

        for out in reply {
            if write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = write.flush().await;
    }
}

/// Launches in-memory engines that answer from a shared [`Script`].
pub struct ScriptedLauncher {
    pub script: Arc<Script>,
}

#[async_trait]
impl EngineLauncher for ScriptedLauncher {
    async fn launch(&self, id: usize, options: &EngineOptions) -> Result<EngineSession, WorkerError> {
        self.script.launches.fetch_add(1, Ordering::SeqCst);
        if Script::take_one(&self.script.fail_launches) {
            return Err(WorkerError::EngineStartup("scripted launch failure".into()));
        }

        let (ours, theirs) = duplex(64 * 1024);
        tokio::spawn(serve(self.script.clone(), theirs));
        let (read, write) = split(ours);
        Ok(EngineSession::connect(id, read, write, None, options.clone()))
    }
}

pub fn fast_options() -> EngineOptions {
    EngineOptions {
        threads: 1,
        hash_mb: 16,
        multi_pv: 3,
        startup_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_millis(500),
        shutdown_grace: Duration::from_millis(100),
    }
}

pub fn pool_config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        acquire_timeout: Duration::from_secs(5),
        replace_backoff: RetryPolicy {
            max_attempts: u32::MAX,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        },
    }
}

pub async fn start_pool(script: &Arc<Script>, size: usize) -> EnginePool {
    start_pool_with(script, pool_config(size)).await
}

pub async fn start_pool_with(script: &Arc<Script>, config: PoolConfig) -> EnginePool {
    let launcher = Arc::new(ScriptedLauncher {
        script: script.clone(),
    });
    EnginePool::start(launcher, fast_options(), config)
        .await
        .expect("pool should start")
}

/// Poll until the pool has `idle` idle sessions, or panic after two seconds.
pub async fn wait_for_idle(pool: &EnginePool, idle: usize) {
    for _ in 0..200 {
        if pool.status().idle == idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached {idle} idle sessions: {:?}", pool.status());
}

/// Positions of a game: the start position followed by the position after
/// each move.
pub fn positions(moves: &[&str]) -> Vec<String> {
    let moves: Vec<String> = moves.iter().map(|m| m.to_string()).collect();
    let plies = chess_core::replay_moves(None, &moves).expect("legal test game");
    let mut fens = vec![START_FEN.to_string()];
    fens.extend(plies.into_iter().map(|p| p.fen_after));
    fens
}

/// Store that records the order in which jobs complete or fail.
#[derive(Default)]
pub struct RecordingStore {
    pub completed: Mutex<Vec<JobId>>,
    pub failures: Mutex<Vec<JobFailure>>,
}

impl RecordingStore {
    pub fn completed(&self) -> Vec<JobId> {
        self.completed.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisStore for RecordingStore {
    async fn save_position(&self, job_id: JobId, _: &PositionAnalysis) -> Result<(), WorkerError> {
        self.completed.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn save_game(
        &self,
        job_id: JobId,
        _: Option<i64>,
        _: &GameAnalysis,
    ) -> Result<(), WorkerError> {
        self.completed.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn record_failure(&self, failure: &JobFailure) -> Result<(), WorkerError> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }

    async fn load_game(&self, game_id: i64) -> Result<GameRequest, WorkerError> {
        Err(WorkerError::GameNotFound(game_id))
    }
}
