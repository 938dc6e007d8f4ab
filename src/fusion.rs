//! Decision fusion: the fixed precedence table combining the three
//! signals into one terminal decision.
//!
//! Policy table, not weighted scoring:
//! 1. anomaly short-circuits everything to manual review
//! 2. classifier approve AND advisory approve -> approved
//! 3. advisory manual review -> manual review
//! 4. everything else denies (an `Unknown` advisory lands here)
//!
//! The classifier label only gates the joint-approve path. That mirrors
//! the current production policy and is flagged for the system owner to
//! confirm; any future weighting must preserve the anomaly
//! short-circuit.

use crate::advisor::AdvisoryDecision;
use crate::anomaly::AnomalyScore;
use crate::classifier::ClassifierLabel;
use crate::types::FinalDecision;

/// Fuse the three signals into the terminal decision.
pub fn fuse(
    anomaly: &AnomalyScore,
    classifier: ClassifierLabel,
    advisory: AdvisoryDecision,
) -> FinalDecision {
    if anomaly.is_anomaly {
        return FinalDecision::ManualReview;
    }

    if classifier == ClassifierLabel::Approve && advisory == AdvisoryDecision::Approve {
        return FinalDecision::Approved;
    }

    if advisory == AdvisoryDecision::ManualReview {
        return FinalDecision::ManualReview;
    }

    FinalDecision::Denied
}
