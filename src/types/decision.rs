//! Decision outcome and audit record structures

use crate::advisor::AdvisoryJudgment;
use crate::anomaly::AnomalyScore;
use crate::classifier::ClassifierScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal decision for one refund request. Produced exactly once per
/// request by the fusion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalDecision {
    Approved,
    Denied,
    ManualReview,
}

impl FinalDecision {
    /// Wire representation, matching the outbound event contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalDecision::Approved => "approved",
            FinalDecision::Denied => "denied",
            FinalDecision::ManualReview => "manual_review",
        }
    }
}

/// Outbound decision event published on the response subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResponse {
    pub chat_id: i64,
    pub decision: FinalDecision,
}

/// Audit artifact for one pipeline run: every signal plus the final
/// decision. Constructed by the orchestrator and handed to the store;
/// storage itself is owned elsewhere.
///
/// Classifier and advisory are `None` on the anomaly short-circuit path
/// where those signals were skipped.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub request_id: Uuid,
    pub chat_id: i64,
    pub user_id: i64,
    pub order_id: i64,
    pub anomaly: AnomalyScore,
    pub classifier: Option<ClassifierScore>,
    pub advisory: Option<AdvisoryJudgment>,
    pub final_decision: FinalDecision,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    /// Continuous fraud signal persisted alongside the decision; the
    /// z-score is the only continuous measure the run produces, so 0.0
    /// stands in when no z was computed.
    pub fn fraud_score(&self) -> f64 {
        self.anomaly.z_score.unwrap_or(0.0)
    }

    /// Advisory outcome persisted in the `ai_prediction` column;
    /// "skipped" on the short-circuit path.
    pub fn ai_prediction(&self) -> &'static str {
        self.advisory
            .as_ref()
            .map(|judgment| judgment.decision.as_str())
            .unwrap_or("skipped")
    }
}
