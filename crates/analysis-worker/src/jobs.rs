//! Analysis job model, retry policy and the priority queue feeding workers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::analysis::GameAnalysis;
use crate::analyzer::GameRequest;
use crate::position::PositionAnalysis;

/// Interactive single-position requests.
pub const PRIORITY_HINT: u32 = 0;
/// Whole-game analysis, tolerant of delay.
pub const PRIORITY_GAME: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Position,
    Game,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Position => f.write_str("position"),
            JobKind::Game => f.write_str("game"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    /// `depth` 0 uses the analyzer's configured depth.
    Position { fen: String, depth: u32 },
    Game(GameRequest),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Position { .. } => JobKind::Position,
            JobPayload::Game(_) => JobKind::Game,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobOutput {
    Position(PositionAnalysis),
    Game(GameAnalysis),
}

/// Attempt limit plus exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Fail fast: one retry, short delays.
    pub fn hint() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    pub fn game() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retry number `attempt` (0-indexed), capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }
}

/// A unit of analysis work.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: u32,
    pub policy: RetryPolicy,
    /// Attempts already made.
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn new(id: JobId, payload: JobPayload, priority: u32, policy: RetryPolicy) -> Self {
        Self {
            id,
            payload,
            priority,
            policy,
            attempts: 0,
            submitted_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(self.attempts)
    }
}

struct Entry<T> {
    priority: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap: the lowest (priority, seq) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// Priority queue: lower priority value first, then lower sequence number.
pub struct JobQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    notify: Notify,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, priority: u32, seq: u64, item: T) {
        self.heap.lock().push(Entry { priority, seq, item });
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<T> {
        self.heap.lock().pop().map(|entry| entry.item)
    }

    /// Pop, waiting up to `poll` for an item to arrive.
    pub async fn pop_wait(&self, poll: Duration) -> Option<T> {
        if let Some(item) = self.pop() {
            return Some(item);
        }
        let _ = tokio::time::timeout(poll, self.notify.notified()).await;
        self.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Remove everything still queued.
    pub fn drain(&self) -> Vec<T> {
        let mut heap = self.heap.lock();
        let mut items = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            items.push(entry.item);
        }
        items
    }
}
