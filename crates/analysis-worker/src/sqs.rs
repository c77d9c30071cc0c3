//! SQS job intake: game ids in, game analysis jobs out.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_sqs::Client;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::jobs::JobOutput;
use crate::orchestrator::Orchestrator;
use crate::store::AnalysisStore;

const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// A message received from SQS
#[derive(Debug, Clone)]
pub struct SqsMessage {
    /// Message body (contains game ID)
    pub body: String,
    /// Receipt handle for deletion
    pub receipt_handle: String,
}

#[derive(Debug, Clone)]
pub struct SqsSettings {
    pub queue_url: String,
    /// Custom SQS endpoint URL (for LocalStack)
    pub endpoint_url: Option<String>,
    pub visibility_timeout_secs: u32,
    /// Consecutive empty receives before the intake loop exits.
    pub max_empty_receives: u32,
}

#[derive(Clone)]
pub struct SqsClient {
    client: Client,
    queue_url: String,
    visibility_timeout: i32,
}

impl SqsClient {
    pub async fn new(settings: &SqsSettings) -> Result<Self, WorkerError> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        // For LocalStack/local dev, use custom endpoint
        let client = if let Some(endpoint) = &settings.endpoint_url {
            let sqs_config = aws_sdk_sqs::config::Builder::from(&aws_config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(sqs_config)
        } else {
            Client::new(&aws_config)
        };

        Ok(Self {
            client,
            queue_url: settings.queue_url.clone(),
            visibility_timeout: i32::try_from(settings.visibility_timeout_secs).unwrap_or(i32::MAX),
        })
    }

    /// Receive messages from the queue with long polling
    pub async fn receive_messages(&self, max: i32) -> Result<Vec<SqsMessage>, WorkerError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.clamp(1, 10))
            .wait_time_seconds(20) // Long polling
            .visibility_timeout(self.visibility_timeout)
            .send()
            .await
            .map_err(|e| WorkerError::Sqs(format!("Failed to receive messages: {e}")))?;

        let messages = response
            .messages()
            .iter()
            .filter_map(|msg| {
                let body = msg.body()?;
                let receipt = msg.receipt_handle()?;
                Some(SqsMessage {
                    body: body.to_string(),
                    receipt_handle: receipt.to_string(),
                })
            })
            .collect();

        debug!(count = response.messages().len(), "Received messages");
        Ok(messages)
    }

    /// Delete a message from the queue (after it has been dealt with)
    pub async fn delete_message(&self, receipt_handle: &str) -> Result<(), WorkerError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| WorkerError::Sqs(format!("Failed to delete message: {e}")))?;

        debug!("Deleted message");
        Ok(())
    }
}

#[derive(Deserialize)]
struct GameMessage {
    game_id: i64,
}

/// Accepts a bare id (`"123"`) or `{"game_id": 123}`.
pub fn parse_game_id(body: &str) -> Option<i64> {
    let body = body.trim();
    body.parse()
        .ok()
        .or_else(|| serde_json::from_str::<GameMessage>(body).ok().map(|m| m.game_id))
}

/// Whether a message is finished with. Retry exhaustion leaves it on the
/// queue so SQS redelivers it after the visibility timeout.
pub fn should_delete(result: &Result<JobOutput, WorkerError>) -> bool {
    match result {
        Ok(_) => true,
        Err(WorkerError::RetryExhausted { .. }) => false,
        Err(WorkerError::Cancelled) | Err(WorkerError::PoolClosed) => false,
        Err(e) => !e.is_retryable(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntakeStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

pub struct SqsIntake {
    sqs: SqsClient,
    store: Arc<dyn AnalysisStore>,
    max_empty_receives: u32,
    max_in_flight: usize,
}

impl SqsIntake {
    pub fn new(
        sqs: SqsClient,
        store: Arc<dyn AnalysisStore>,
        max_empty_receives: u32,
        max_in_flight: usize,
    ) -> Self {
        Self {
            sqs,
            store,
            max_empty_receives,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Poll until `shutdown` fires or the queue stays empty for
    /// `max_empty_receives` polls, then wait for in-flight jobs.
    pub async fn run(
        &self,
        orchestrator: &Orchestrator,
        shutdown: CancellationToken,
    ) -> Result<IntakeStats, WorkerError> {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight: JoinSet<bool> = JoinSet::new();
        let mut stats = IntakeStats::default();
        let mut empty_receives = 0;

        info!(max_in_flight = self.max_in_flight, "Starting intake loop");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, waiting for in-flight work...");
                    break;
                }
                received = self.sqs.receive_messages(self.max_in_flight as i32) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Failed to receive messages");
                    tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                    continue;
                }
            };

            if messages.is_empty() {
                empty_receives += 1;
                if empty_receives >= self.max_empty_receives {
                    info!(polls = empty_receives, "Queue empty, exiting");
                    break;
                }
                continue;
            }
            empty_receives = 0;

            for msg in messages {
                stats.received += 1;
                let Some(game_id) = parse_game_id(&msg.body) else {
                    warn!(body = %msg.body, "Invalid game ID format, deleting message");
                    stats.rejected += 1;
                    let _ = self.sqs.delete_message(&msg.receipt_handle).await;
                    continue;
                };

                let request = match self.store.load_game(game_id).await {
                    Ok(request) => request,
                    Err(e) if e.is_retryable() => {
                        error!(game_id, error = %e, "Failed to load game, leaving message");
                        stats.failed += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(game_id, error = %e, "Game not loadable, deleting message");
                        stats.rejected += 1;
                        let _ = self.sqs.delete_message(&msg.receipt_handle).await;
                        continue;
                    }
                };

                let permit = slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkerError::Sqs("intake slots closed".into()))?;
                let handle = orchestrator.submit_game(request)?;
                let sqs = self.sqs.clone();
                let receipt = msg.receipt_handle;

                in_flight.spawn(async move {
                    let _permit = permit; // Hold until done
                    let job_id = handle.id();
                    let result = handle.wait().await;
                    match &result {
                        Ok(_) => info!(game_id, %job_id, "Analysis complete"),
                        Err(e) => error!(game_id, %job_id, error = %e, "Analysis failed"),
                    }
                    if should_delete(&result) {
                        let _ = sqs.delete_message(&receipt).await;
                    }
                    result.is_ok()
                });
            }

            while let Some(done) = in_flight.try_join_next() {
                record(&mut stats, done);
            }
        }

        while let Some(done) = in_flight.join_next().await {
            record(&mut stats, done);
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            failed = stats.failed,
            rejected = stats.rejected,
            "Intake loop finished"
        );
        Ok(stats)
    }
}

fn record(stats: &mut IntakeStats, done: Result<bool, tokio::task::JoinError>) {
    match done {
        Ok(true) => stats.completed += 1,
        _ => stats.failed += 1,
    }
}
