use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::execution::{CloseDispatch, OrderExecutor};
use crate::models::ExecutionRequest;

pub const DEFAULT_QUEUE_KEY: &str = "signaltrader:jobs";
const POP_TIMEOUT_SECS: f64 = 5.0;

/// Inbound job envelope, as produced by the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum TradeJob {
    ExecuteOrder(ExecutionRequest),
    ClosePosition {
        user_id: Uuid,
        symbol: String,
        exchange: String,
    },
}

/// Redis-list job queue shared by the API producers and the workers.
///
/// Ordering per (user, symbol) is NOT guaranteed here; the ledger's
/// transactional checks are the safety enforcement point.
pub struct JobQueue {
    conn: ConnectionManager,
    key: String,
}

impl JobQueue {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key` - List key the producers push to
    pub async fn new(redis_url: &str, key: impl Into<String>) -> crate::Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow::anyhow!("Redis connection timeout after 5 seconds"))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.into(),
        })
    }

    /// Enqueue a job.
    pub async fn push(&self, job: &TradeJob) -> crate::Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, payload).await?;
        Ok(())
    }

    /// Blocking pop with a short timeout; None when the queue stayed
    /// empty so the caller's select loop keeps breathing.
    pub async fn pop(&self) -> crate::Result<Option<TradeJob>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn.blpop(&self.key, POP_TIMEOUT_SECS).await?;

        match result {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

/// Consume jobs from the queue and monitor-dispatched closes from the
/// internal channel. Each job runs in its own task so a slow exchange
/// call never blocks the next pop.
pub async fn worker_loop(
    queue: Arc<JobQueue>,
    executor: Arc<OrderExecutor>,
    mut close_rx: mpsc::Receiver<CloseDispatch>,
) {
    tracing::info!("Worker loop started");

    loop {
        tokio::select! {
            job = queue.pop() => match job {
                Ok(Some(job)) => {
                    let executor = executor.clone();
                    tokio::spawn(async move { run_job(executor, job).await });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Queue pop failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            },
            Some(dispatch) = close_rx.recv() => {
                let executor = executor.clone();
                tokio::spawn(async move {
                    let report = executor
                        .close_position(dispatch.user_id, &dispatch.symbol, &dispatch.exchange)
                        .await;
                    tracing::info!(
                        "Monitor-dispatched close for {}: {}",
                        dispatch.symbol,
                        report.message
                    );
                });
            }
        }
    }
}

async fn run_job(executor: Arc<OrderExecutor>, job: TradeJob) {
    match job {
        TradeJob::ExecuteOrder(request) => {
            let report = executor.execute(&request).await;
            if report.success {
                tracing::info!("{}", report.message);
            } else {
                tracing::warn!("{}", report.message);
            }
        }
        TradeJob::ClosePosition {
            user_id,
            symbol,
            exchange,
        } => {
            let report = executor.close_position(user_id, &symbol, &exchange).await;
            if report.success {
                tracing::info!("{}", report.message);
            } else {
                tracing::warn!("{}", report.message);
            }
        }
    }
}
