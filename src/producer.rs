//! Outbound decision event publishing.

use crate::types::RefundResponse;
use anyhow::Result;
use async_nats::Client;
use async_trait::async_trait;
use tracing::debug;

/// Sink for outbound decision events. The NATS publisher is the
/// production impl; tests capture responses through the same seam.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn publish(&self, response: &RefundResponse) -> Result<()>;
}

/// Publisher for refund decisions on the response subject.
#[derive(Clone)]
pub struct ResponsePublisher {
    client: Client,
    subject: String,
}

impl ResponsePublisher {
    /// Create a new response publisher
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl ResponseSink for ResponsePublisher {
    async fn publish(&self, response: &RefundResponse) -> Result<()> {
        let payload = serde_json::to_vec(response)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(
            chat_id = response.chat_id,
            decision = response.decision.as_str(),
            "Published refund response"
        );

        Ok(())
    }
}
