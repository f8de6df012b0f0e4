use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::runtime::event::SubscriptionId;

/// A due timer of one process instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub instance_id: Uuid,
    pub subscription_id: SubscriptionId,
    /// Catching activity, for logging.
    pub activity_id: String,
}

// --- Interfaces ---

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: Job) -> Result<()>;
    /// `None` once every sender is gone.
    async fn pop(&self) -> Result<Option<Job>>;
}

// --- In-Memory Implementations ---

pub struct InMemoryJobQueue {
    sender: mpsc::Sender<Job>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
}

impl InMemoryJobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: tx,
            receiver: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| anyhow::anyhow!("Job channel closed: {}", e))
    }

    async fn pop(&self) -> Result<Option<Job>> {
        let mut rx = self.receiver.lock().await;
        Ok(rx.recv().await)
    }
}
