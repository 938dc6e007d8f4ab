//! Pipeline orchestrator: the per-request state machine.
//!
//! `Received -> Scoring -> Fused -> Persisted -> Responded`, terminal
//! on `Responded` or `Failed`. Every per-request fault resolves to a
//! terminal decision; the requester is never left waiting.

use crate::advisor::{AdvisoryDecision, AdvisoryJudgment, JudgmentAdvisor};
use crate::anomaly::{AnomalyDetector, AnomalyScore};
use crate::classifier::{ClassifierLabel, ClassifierScore, ClassifierScorer};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fusion::fuse;
use crate::metrics::PipelineMetrics;
use crate::producer::ResponseSink;
use crate::store::RefundStore;
use crate::types::{DecisionRecord, FinalDecision, RefundRequest, RefundResponse};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Runtime policy knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Per-run deadline; expiry resolves to manual review
    pub run_timeout: Duration,
    /// Still run the classifier/advisor after an anomaly flag
    pub score_all_signals: bool,
    /// Never two in-flight runs for the same user
    pub per_user_serial: bool,
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            score_all_signals: config.score_all_signals,
            per_user_serial: config.per_user_serial,
        }
    }
}

/// Optional per-user sequential admission: a per-user async mutex,
/// entries dropped once no run or waiter holds them.
pub struct UserAdmission {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserAdmission {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until no other run is in flight for this user.
    pub async fn admit(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Release the user's slot and drop the entry when idle.
    pub async fn release(&self, user_id: i64, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(&user_id) {
            // Only the map holds it: no run, no waiter
            if Arc::strong_count(lock) == 1 {
                locks.remove(&user_id);
            }
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl Default for UserAdmission {
    fn default() -> Self {
        Self::new()
    }
}

/// The risk-decision pipeline for one inbound subject.
pub struct DecisionPipeline {
    store: Arc<dyn RefundStore>,
    detector: Arc<AnomalyDetector>,
    scorer: Arc<ClassifierScorer>,
    advisor: Arc<JudgmentAdvisor>,
    sink: Arc<dyn ResponseSink>,
    metrics: Arc<PipelineMetrics>,
    options: PipelineOptions,
    admission: UserAdmission,
}

impl DecisionPipeline {
    pub fn new(
        store: Arc<dyn RefundStore>,
        detector: Arc<AnomalyDetector>,
        scorer: Arc<ClassifierScorer>,
        advisor: Arc<JudgmentAdvisor>,
        sink: Arc<dyn ResponseSink>,
        metrics: Arc<PipelineMetrics>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            detector,
            scorer,
            advisor,
            sink,
            metrics,
            options,
            admission: UserAdmission::new(),
        }
    }

    /// Entry point for one inbound event payload.
    ///
    /// Malformed payloads fail without entering scoring; when a chat id
    /// is salvageable from the raw JSON the requester still gets the
    /// safe default, otherwise the rejection is only logged.
    pub async fn handle_message(&self, payload: &[u8]) {
        self.metrics.record_request();

        let request = match serde_json::from_slice::<RefundRequest>(payload) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.record_input_error();
                let err = PipelineError::Input(e.to_string());
                match salvage_chat_id(payload) {
                    Some(chat_id) => {
                        warn!(
                            chat_id,
                            error = %err,
                            "Rejected malformed refund request, replying with safe default"
                        );
                        self.respond(chat_id, FinalDecision::ManualReview).await;
                    }
                    None => {
                        warn!(
                            error = %err,
                            "Rejected malformed refund request with no recoverable chat id"
                        );
                    }
                }
                return;
            }
        };

        self.handle_request(request).await;
    }

    /// Run the state machine for one parsed request. Always resolves to
    /// a terminal decision.
    pub async fn handle_request(&self, request: RefundRequest) -> FinalDecision {
        let started = Instant::now();
        debug!(
            request_id = %request.request_id,
            user_id = request.user_id,
            order_id = request.order_id,
            amount = request.amount,
            stage = "received",
            "Refund request accepted"
        );

        let admission = if self.options.per_user_serial {
            Some(self.admission.admit(request.user_id).await)
        } else {
            None
        };

        let chat_id = request.chat_id;
        let user_id = request.user_id;
        let outcome = tokio::time::timeout(self.options.run_timeout, self.run(&request)).await;

        if let Some(guard) = admission {
            self.admission.release(user_id, guard).await;
        }

        let decision = match outcome {
            Ok(decision) => decision,
            Err(_) => {
                // Failed: deadline expired mid-run; the requester still
                // gets a terminal answer
                self.metrics.record_deadline();
                let err = PipelineError::Deadline(self.options.run_timeout);
                error!(
                    request_id = %request.request_id,
                    error = %err,
                    "Run failed, resolving to safe default"
                );
                FinalDecision::ManualReview
            }
        };

        // The single publish per request lives outside the deadline
        // scope: a cancelled run can never race its own response
        self.respond(chat_id, decision).await;

        info!(
            request_id = %request.request_id,
            user_id = request.user_id,
            order_id = request.order_id,
            decision = decision.as_str(),
            stage = "responded",
            "Refund decision emitted"
        );

        self.metrics
            .record_decision(decision.as_str(), started.elapsed());
        decision
    }

    async fn run(&self, request: &RefundRequest) -> FinalDecision {
        debug!(request_id = %request.request_id, stage = "scoring", "Gathering signals");

        // History fetch failure degrades the anomaly signal to an empty
        // snapshot (non-anomalous at sample size 0)
        let history = match self.store.refund_history().await {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "Refund history unavailable, anomaly signal degraded"
                );
                Vec::new()
            }
        };

        let signal_start = Instant::now();
        let anomaly = self.detector.evaluate(request, &history);
        self.metrics
            .record_signal_time("anomaly", signal_start.elapsed());

        if anomaly.is_anomaly {
            self.metrics.record_anomaly(!self.options.score_all_signals);
        }

        if anomaly.is_anomaly && !self.options.score_all_signals {
            info!(
                request_id = %request.request_id,
                z_score = ?anomaly.z_score,
                "Anomalous refund, short-circuiting to manual review"
            );
            return self.finish(request, anomaly, None, None).await;
        }

        // Classifier failure degrades the label to hold
        let signal_start = Instant::now();
        let classifier = match self.scorer.evaluate(request) {
            Ok(score) => score,
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "Classifier unavailable, label degraded to hold"
                );
                ClassifierScore {
                    label: ClassifierLabel::Hold,
                    model_version: self.scorer.current_version(),
                }
            }
        };
        self.metrics
            .record_signal_time("classifier", signal_start.elapsed());

        // A missing profile is a total feature-provider failure for this
        // request and forces manual review
        let profile = match self.store.user_profile(request.user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!(
                    request_id = %request.request_id,
                    user_id = request.user_id,
                    "No profile for user, forcing manual review"
                );
                return self
                    .finish_with(request, anomaly, Some(classifier), None, FinalDecision::ManualReview)
                    .await;
            }
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "User profile unavailable, forcing manual review"
                );
                return self
                    .finish_with(request, anomaly, Some(classifier), None, FinalDecision::ManualReview)
                    .await;
            }
        };

        let items = match self.store.item_details(request.order_id).await {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "Item details unavailable, advisory prompt degraded"
                );
                Vec::new()
            }
        };

        let signal_start = Instant::now();
        let advisory = self.advisor.evaluate(request, &profile, &items).await;
        self.metrics
            .record_signal_time("advisory", signal_start.elapsed());
        self.metrics.record_advisory(advisory.decision.as_str());

        self.finish(request, anomaly, Some(classifier), Some(advisory))
            .await
    }

    /// Fuse and persist. The skip path fuses with hold/unknown
    /// placeholders; the anomaly flag decides regardless. Responding is
    /// the caller's job, after the deadline has resolved.
    async fn finish(
        &self,
        request: &RefundRequest,
        anomaly: AnomalyScore,
        classifier: Option<ClassifierScore>,
        advisory: Option<AdvisoryJudgment>,
    ) -> FinalDecision {
        let decision = fuse(
            &anomaly,
            classifier
                .map(|score| score.label)
                .unwrap_or(ClassifierLabel::Hold),
            advisory
                .as_ref()
                .map(|judgment| judgment.decision)
                .unwrap_or(AdvisoryDecision::Unknown),
        );
        debug!(request_id = %request.request_id, stage = "fused", decision = decision.as_str(), "Signals fused");

        self.finish_with(request, anomaly, classifier, advisory, decision)
            .await
    }

    async fn finish_with(
        &self,
        request: &RefundRequest,
        anomaly: AnomalyScore,
        classifier: Option<ClassifierScore>,
        advisory: Option<AdvisoryJudgment>,
        decision: FinalDecision,
    ) -> FinalDecision {
        let record = DecisionRecord {
            request_id: request.request_id,
            chat_id: request.chat_id,
            user_id: request.user_id,
            order_id: request.order_id,
            anomaly,
            classifier,
            advisory,
            final_decision: decision,
            decided_at: Utc::now(),
        };

        // Decision correctness outranks audit durability: a dropped row
        // is a known consistency gap, never a blocked response
        if let Err(e) = self.store.insert_decision(&record).await {
            self.metrics.record_persist_failure();
            warn!(
                request_id = %request.request_id,
                error = %e,
                "Decision audit row not persisted, responding anyway"
            );
        } else {
            debug!(request_id = %request.request_id, stage = "persisted", "Audit row stored");
        }

        decision
    }

    async fn respond(&self, chat_id: i64, decision: FinalDecision) {
        let response = RefundResponse { chat_id, decision };
        if let Err(e) = self.sink.publish(&response).await {
            error!(
                chat_id,
                decision = decision.as_str(),
                error = %e,
                "Failed to publish refund response"
            );
        }
    }
}

/// Best-effort chat-id recovery from an unparseable payload, so the
/// safe-default response can still be routed.
fn salvage_chat_id(payload: &[u8]) -> Option<i64> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("chat_id")?
        .as_i64()
}
