//! NATS message consumer for incoming refund requests

use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::info;

/// Consumer for receiving refund requests from NATS.
///
/// With a queue group set, multiple pipeline instances can subscribe to
/// the same subject and NATS delivers each request to exactly one of
/// them; without one, this instance sees every request.
pub struct RefundRequestConsumer {
    client: Client,
    subject: String,
    queue_group: Option<String>,
}

impl RefundRequestConsumer {
    /// Create a consumer that receives every request on the subject.
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
            queue_group: None,
        }
    }

    /// Create a consumer that shares the subject with other instances
    /// in the same queue group.
    pub fn with_queue_group(client: Client, subject: &str, queue_group: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
            queue_group: Some(queue_group.to_string()),
        }
    }

    /// Subscribe to the refund request subject.
    pub async fn subscribe(&self) -> Result<Subscriber> {
        let subscriber = match &self.queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(self.subject.clone(), group.clone())
                    .await?
            }
            None => self.client.subscribe(self.subject.clone()).await?,
        };

        info!(
            subject = %self.subject,
            queue_group = ?self.queue_group,
            "Subscribed to refund request subject"
        );
        Ok(subscriber)
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue group this consumer shares work through, if any.
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }
}
