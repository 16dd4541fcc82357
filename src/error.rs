use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum DaemonError {
    #[error("Worker query failed: {0}")]
    WorkerQuery(String),

    #[error("Worker did not answer within {0:?}")]
    WorkerTimeout(Duration),

    #[error("Worker binary not found: {0}")]
    WorkerBinaryNotFound(String),

    #[error("Failed to launch worker: {0}")]
    WorkerLaunchFailed(String),

    #[error("Worker returned an error: {0}")]
    WorkerRejected(String),

    #[error("Webhook delivery failed: {0}")]
    WebhookFailed(String),

    #[error("Webhook returned HTTP {0}")]
    WebhookStatus(u16),

    #[error("Webhook timed out after {0:?}")]
    WebhookTimeout(Duration),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
