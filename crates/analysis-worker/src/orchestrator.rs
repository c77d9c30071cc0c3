//! Job orchestration: priority scheduling, retries with backoff, persistence.
//!
//! Workers pull the most urgent job from a shared [`JobQueue`], run it
//! through the matching analyzer and hand the outcome to the store. A
//! retryable failure puts the job back on the queue after its backoff delay,
//! keeping its original sequence number so ties still resolve by submission
//! order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::{GameAnalyzer, GameConfig, GameRequest};
use crate::error::WorkerError;
use crate::jobs::{
    AnalysisJob, JobId, JobOutput, JobPayload, JobQueue, RetryPolicy, PRIORITY_GAME,
    PRIORITY_HINT,
};
use crate::pool::EnginePool;
use crate::position::{PositionAnalyzer, PositionConfig};
use crate::store::{AnalysisStore, JobFailure};

type Reply = oneshot::Sender<Result<JobOutput, WorkerError>>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent workers; 0 means one per pooled engine.
    pub workers: usize,
    /// Upper bound on how long an idle worker waits before rechecking shutdown.
    pub poll_interval: Duration,
    pub hint_policy: RetryPolicy,
    pub game_policy: RetryPolicy,
    pub position: PositionConfig,
    pub game: GameConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            poll_interval: Duration::from_millis(250),
            hint_policy: RetryPolicy::hint(),
            game_policy: RetryPolicy::game(),
            position: PositionConfig::default(),
            game: GameConfig::default(),
        }
    }
}

struct QueuedJob {
    job: AnalysisJob,
    cancel: CancellationToken,
    reply: Reply,
}

/// Handle to a submitted job.
pub struct JobHandle {
    id: JobId,
    cancel: CancellationToken,
    result: oneshot::Receiver<Result<JobOutput, WorkerError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cancellation. An in-flight search is stopped and its session
    /// released; the job then resolves with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<JobOutput, WorkerError> {
        match self.result.await {
            Ok(result) => result,
            // Dropped unanswered: the orchestrator shut down first.
            Err(_) => Err(WorkerError::PoolClosed),
        }
    }
}

struct Inner {
    queue: JobQueue<QueuedJob>,
    positions: PositionAnalyzer,
    games: GameAnalyzer,
    pool: EnginePool,
    store: Arc<dyn AnalysisStore>,
    config: OrchestratorConfig,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start the worker tasks. Must be called within a tokio runtime.
    pub fn start(
        pool: EnginePool,
        store: Arc<dyn AnalysisStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let worker_count = if config.workers == 0 {
            pool.size()
        } else {
            config.workers
        };

        let inner = Arc::new(Inner {
            queue: JobQueue::new(),
            positions: PositionAnalyzer::new(pool.clone(), config.position.clone()),
            games: GameAnalyzer::new(pool.clone(), config.game.clone()),
            pool,
            store,
            config,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let workers = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(inner.clone(), worker)))
            .collect();

        info!(workers = worker_count, "Orchestrator started");
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job. Lower `priority` values are served first.
    pub fn submit(
        &self,
        payload: JobPayload,
        priority: u32,
        policy: RetryPolicy,
    ) -> Result<JobHandle, WorkerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WorkerError::PoolClosed);
        }

        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::AcqRel));
        let job = AnalysisJob::new(id, payload, priority, policy);
        let cancel = self.inner.shutdown.child_token();
        let (reply, result) = oneshot::channel();

        debug!(job_id = %id, kind = %job.kind(), priority, "Job submitted");
        self.inner.queue.push(
            priority,
            id.0,
            QueuedJob {
                job,
                cancel: cancel.clone(),
                reply,
            },
        );
        if self.inner.shutdown.is_cancelled() {
            self.inner.close_queue();
        }

        Ok(JobHandle { id, cancel, result })
    }

    /// Interactive single-position request: top priority, small retry budget.
    pub fn submit_position(&self, fen: &str, depth: u32) -> Result<JobHandle, WorkerError> {
        let payload = JobPayload::Position {
            fen: fen.to_string(),
            depth,
        };
        self.submit(payload, PRIORITY_HINT, self.inner.config.hint_policy)
    }

    pub fn submit_game(&self, request: GameRequest) -> Result<JobHandle, WorkerError> {
        self.submit(
            JobPayload::Game(request),
            PRIORITY_GAME,
            self.inner.config.game_policy,
        )
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn pool(&self) -> &EnginePool {
        &self.inner.pool
    }

    /// Cancel in-flight jobs, stop the workers, fail anything still queued
    /// and shut the engine pool down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        join_all(workers).await;

        self.inner.close_queue();
        self.inner.pool.shutdown().await;
        info!("Orchestrator shut down");
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    debug!(worker, "Worker started");
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = inner.queue.pop_wait(inner.config.poll_interval) => next,
        };
        if let Some(queued) = next {
            inner.run(queued).await;
        }
    }
    debug!(worker, "Worker stopped");
}

impl Inner {
    async fn run(self: &Arc<Self>, queued: QueuedJob) {
        let QueuedJob {
            mut job,
            cancel,
            reply,
        } = queued;

        if cancel.is_cancelled() {
            let _ = reply.send(Err(WorkerError::Cancelled));
            return;
        }

        job.attempts += 1;
        let job_id = job.id;
        let attempt = job.attempts;
        debug!(%job_id, attempt, kind = %job.kind(), "Running job");

        let err = match self.execute(&job, &cancel).await {
            Ok(output) => {
                info!(%job_id, attempt, kind = %job.kind(), "Job completed");
                let _ = reply.send(Ok(output));
                return;
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(%job_id, attempt, error = %err, "Job failed");
            if !matches!(err, WorkerError::Cancelled | WorkerError::PoolClosed) {
                self.report_failure(&job, &err).await;
            }
            let _ = reply.send(Err(err));
            return;
        }

        if job.attempts_remaining() == 0 {
            error!(%job_id, attempts = attempt, error = %err, "Job retries exhausted");
            self.report_failure(&job, &err).await;
            let _ = reply.send(Err(WorkerError::RetryExhausted {
                job_id,
                attempts: attempt,
                last_error: err.to_string(),
            }));
            return;
        }

        let delay = job.policy.backoff_delay(attempt - 1);
        warn!(%job_id, attempt, error = %err, ?delay, "Job failed, retrying");
        self.requeue_after(
            delay,
            QueuedJob {
                job,
                cancel,
                reply,
            },
        );
    }

    async fn execute(
        &self,
        job: &AnalysisJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, WorkerError> {
        match &job.payload {
            JobPayload::Position { fen, depth } => {
                let analysis = self.positions.analyze(fen, *depth, Some(cancel)).await?;
                self.store.save_position(job.id, &analysis).await?;
                Ok(JobOutput::Position(analysis))
            }
            JobPayload::Game(request) => {
                let analysis = self.games.analyze(request, Some(cancel)).await?;
                self.store
                    .save_game(job.id, request.game_id, &analysis)
                    .await?;
                Ok(JobOutput::Game(analysis))
            }
        }
    }

    fn requeue_after(self: &Arc<Self>, delay: Duration, queued: QueuedJob) {
        let inner = self.clone();
        let cancel = queued.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = queued.reply.send(Err(WorkerError::Cancelled));
                }
                _ = tokio::time::sleep(delay) => {
                    let (priority, seq) = (queued.job.priority, queued.job.id.0);
                    inner.queue.push(priority, seq, queued);
                    if inner.shutdown.is_cancelled() {
                        inner.close_queue();
                    }
                }
            }
        });
    }

    /// Fail everything still queued. Jobs pushed after shutdown has fired
    /// land here too, so no handle is left waiting on a stopped worker.
    fn close_queue(&self) {
        for queued in self.queue.drain() {
            let _ = queued.reply.send(Err(WorkerError::PoolClosed));
        }
    }

    async fn report_failure(&self, job: &AnalysisJob, err: &WorkerError) {
        let (game_id, fen) = match &job.payload {
            JobPayload::Position { fen, .. } => (None, Some(fen.clone())),
            JobPayload::Game(request) => (request.game_id, request.start_fen.clone()),
        };
        let failure = JobFailure {
            job_id: job.id,
            kind: job.kind(),
            game_id,
            fen,
            attempts: job.attempts,
            error: err.to_string(),
            failed_at: Utc::now(),
        };

        if let Err(e) = self.store.record_failure(&failure).await {
            warn!(job_id = %job.id, error = %e, "Failed to record job failure");
        }
    }
}
