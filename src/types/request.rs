//! Refund request event structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A refund request received from the inbound event subject.
///
/// Immutable once created. `chat_id` routes the response back to the
/// requesting conversation; the bare test publisher omits it, so it
/// defaults to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Conversation to route the decision back to (0 when absent)
    #[serde(default)]
    pub chat_id: i64,

    /// Requesting user
    pub user_id: i64,

    /// Order the refund is requested against
    pub order_id: i64,

    /// Free-text refund reason (mapped to a reason code for the classifier)
    pub reason: String,

    /// Requested refund amount
    pub amount: f64,

    /// Receipt timestamp (assigned on message receipt when absent)
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,

    /// Identifies this run in the audit record
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
}

impl RefundRequest {
    /// Create a new refund request
    pub fn new(user_id: i64, order_id: i64, reason: &str, amount: f64) -> Self {
        Self {
            chat_id: 0,
            user_id,
            order_id,
            reason: reason.to_string(),
            amount,
            received_at: Utc::now(),
            request_id: Uuid::new_v4(),
        }
    }
}
