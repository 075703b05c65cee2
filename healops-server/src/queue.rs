//! Attempt job queue and worker pool.
//!
//! The queue contract is at-least-once delivery of "process attempt N for
//! run R" work items; the orchestrator's terminal-state guard makes
//! redelivery safe. `InProcessQueue` is the default single-instance
//! implementation over an mpsc channel drained by a small worker pool.
//! Durability guarantees belong to an external queue behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use crate::model::RunId;
use crate::orchestrator::Orchestrator;

/// Default worker pool size.
pub const WORKER_COUNT: usize = 3;

/// One unit of work: run one attempt for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptJob {
    pub run_id: RunId,
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("attempt queue is closed")]
    Closed,
}

#[async_trait]
pub trait AttemptQueue: Send + Sync {
    async fn enqueue(&self, job: AttemptJob) -> Result<(), QueueError>;
}

/// In-process queue over an unbounded mpsc channel.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<AttemptJob>,
}

impl InProcessQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AttemptJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AttemptQueue for InProcessQueue {
    async fn enqueue(&self, job: AttemptJob) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|_| QueueError::Closed)
    }
}

/// Spawn `count` workers draining the queue.
///
/// Each worker runs the orchestrator synchronously to completion for its
/// job; a failed job is logged and the worker moves on.
pub fn spawn_workers(
    count: usize,
    rx: mpsc::UnboundedReceiver<AttemptJob>,
    orchestrator: Arc<Orchestrator>,
) {
    let rx = Arc::new(Mutex::new(rx));
    for worker_id in 0..count {
        let rx = rx.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            info!("Attempt worker {} started", worker_id);
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else {
                    info!("Attempt worker {} shutting down: queue closed", worker_id);
                    break;
                };

                info!(
                    "Worker {} processing attempt {} for run {}",
                    worker_id, job.attempt, job.run_id
                );
                if let Err(e) = orchestrator.process_job(&job).await {
                    error!(
                        "Worker {} failed attempt {} for run {}: {}",
                        worker_id, job.attempt, job.run_id, e
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_and_receive() {
        let (queue, mut rx) = InProcessQueue::new();
        let job = AttemptJob {
            run_id: RunId::from("run-1"),
            attempt: 1,
        };
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(job));
    }

    #[tokio::test]
    async fn test_enqueue_after_close_errors() {
        let (queue, rx) = InProcessQueue::new();
        drop(rx);
        let result = queue
            .enqueue(AttemptJob {
                run_id: RunId::from("run-1"),
                attempt: 1,
            })
            .await;
        assert!(matches!(result, Err(QueueError::Closed)));
    }
}
