//! Advisory judgment from the external reasoning service.
//!
//! The advisor builds a structured prompt from the request, the user
//! profile, and the order items, and normalizes the free-text reply to
//! one of {approve, deny, manual_review, unknown}. A constrained JSON
//! reply is requested first; keyword matching over the raw text is the
//! fallback path. A failed call yields `Unknown`, never a propagated
//! fault — and `Unknown` is never coerced to approve.

pub mod client;

pub use client::{OpenAiClient, ReasoningClient};

use crate::types::{ItemDetail, RefundRequest, UserProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Fixed system role for every advisory call.
pub const SYSTEM_ROLE: &str = "You are an expert fraud analyst.";

const JSON_INSTRUCTION: &str = r#"Respond with a JSON object of the form {"decision": "approve" | "deny" | "manual_review", "rationale": "<one sentence>"}."#;

/// Normalized advisory outcome. `Unknown` marks a failed external call
/// and stays distinct from `Deny` end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryDecision {
    Approve,
    Deny,
    ManualReview,
    Unknown,
}

impl AdvisoryDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvisoryDecision::Approve => "approve",
            AdvisoryDecision::Deny => "deny",
            AdvisoryDecision::ManualReview => "manual_review",
            AdvisoryDecision::Unknown => "unknown",
        }
    }
}

/// Advisory signal for one request. `raw_text` is `None` when the
/// external call failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryJudgment {
    pub raw_text: Option<String>,
    pub decision: AdvisoryDecision,
}

impl AdvisoryJudgment {
    /// Failed external call: no text, decision unknown.
    pub fn unavailable() -> Self {
        Self {
            raw_text: None,
            decision: AdvisoryDecision::Unknown,
        }
    }
}

/// Advisor over a reasoning client.
pub struct JudgmentAdvisor {
    client: Arc<dyn ReasoningClient>,
    structured_replies: bool,
}

impl JudgmentAdvisor {
    pub fn new(client: Arc<dyn ReasoningClient>, structured_replies: bool) -> Self {
        Self {
            client,
            structured_replies,
        }
    }

    /// Obtain an advisory judgment for a request. Tolerates any reply
    /// text; a failed call degrades to `Unknown`.
    pub async fn evaluate(
        &self,
        request: &RefundRequest,
        profile: &UserProfile,
        items: &[ItemDetail],
    ) -> AdvisoryJudgment {
        let prompt = build_prompt(request, profile, items);

        let reply = if self.structured_replies {
            self.client
                .chat_json(SYSTEM_ROLE, &format!("{prompt}\n\n{JSON_INSTRUCTION}"))
                .await
        } else {
            self.client.chat(SYSTEM_ROLE, &prompt).await
        };

        match reply {
            Ok(text) => {
                let decision = if self.structured_replies {
                    parse_structured(&text).unwrap_or_else(|| normalize_reply(&text))
                } else {
                    normalize_reply(&text)
                };
                debug!(
                    request_id = %request.request_id,
                    decision = decision.as_str(),
                    "Advisory judgment obtained"
                );
                AdvisoryJudgment {
                    raw_text: Some(text),
                    decision,
                }
            }
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "Reasoning service call failed, advisory signal unknown"
                );
                AdvisoryJudgment::unavailable()
            }
        }
    }
}

fn build_prompt(request: &RefundRequest, profile: &UserProfile, items: &[ItemDetail]) -> String {
    let item_summary = if items.is_empty() {
        "unavailable".to_string()
    } else {
        items
            .iter()
            .map(|item| format!("{}x {} (${:.2})", item.quantity, item.name, item.unit_price))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "A customer with user ID {user_id} has requested a refund for order {order_id}.\n\
         Refund amount: ${amount:.2}.\n\
         Reason: {reason}.\n\n\
         User details:\n\
         - Account age: {account_age} days\n\
         - Total orders: {total_orders}\n\
         - Previous refunds: {total_refunds}\n\
         - Flagged for fraud: {flagged}\n\
         - Item details: {items}\n\n\
         Analyze whether this request seems legitimate.\n\
         Based on this information, should this refund be APPROVED, DENIED, \
         or sent for MANUAL REVIEW?",
        user_id = request.user_id,
        order_id = request.order_id,
        amount = request.amount,
        reason = request.reason,
        account_age = profile.account_age_days,
        total_orders = profile.total_orders,
        total_refunds = profile.total_refunds,
        flagged = profile.flagged_for_fraud,
        items = item_summary,
    )
}

/// Parse a constrained JSON reply. `None` hands over to the keyword
/// fallback.
fn parse_structured(text: &str) -> Option<AdvisoryDecision> {
    #[derive(Deserialize)]
    struct StructuredReply {
        decision: String,
    }

    let reply: StructuredReply = serde_json::from_str(text).ok()?;
    match reply.decision.trim().to_lowercase().replace(' ', "_").as_str() {
        "approve" | "approved" => Some(AdvisoryDecision::Approve),
        "deny" | "denied" => Some(AdvisoryDecision::Deny),
        "manual_review" => Some(AdvisoryDecision::ManualReview),
        _ => None,
    }
}

/// Best-effort keyword classification of a free-text reply. Unmatched
/// text denies per current policy.
pub fn normalize_reply(text: &str) -> AdvisoryDecision {
    let text = text.to_lowercase();
    if text.contains("review") || text.contains("additional data") {
        AdvisoryDecision::ManualReview
    } else if text.contains("approve") {
        AdvisoryDecision::Approve
    } else {
        AdvisoryDecision::Deny
    }
}
