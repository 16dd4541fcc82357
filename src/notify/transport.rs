use crate::error::{DaemonError, Result};
use crate::events::EventRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// Body posted to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub message: String,
    pub event: EventRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Deliver one payload. Non-2xx responses are errors.
    async fn post(&self, url: &str, token: Option<&str>, payload: &WebhookPayload) -> Result<()>;
}

pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            warn!("[Webhook] Falling back to default HTTP client: {}", e);
            Client::new()
        });
        Self { http_client }
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, url: &str, token: Option<&str>, payload: &WebhookPayload) -> Result<()> {
        let mut request = self.http_client.post(url).json(payload);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DaemonError::WebhookFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DaemonError::WebhookStatus(response.status().as_u16()))
        }
    }
}
