//! End-to-end pipeline tests over trait-backed fakes.
//!
//! The store, reasoning client, classifier backend, and response sink
//! are all replaced at their seams, so every scenario runs the real
//! orchestrator, anomaly detector, fusion table, and record assembly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use refund_risk_pipeline::advisor::{AdvisoryDecision, JudgmentAdvisor, ReasoningClient};
use refund_risk_pipeline::anomaly::AnomalyDetector;
use refund_risk_pipeline::classifier::{ClassifierLabel, ClassifierScorer, InferenceBackend};
use refund_risk_pipeline::config::AnomalyConfig;
use refund_risk_pipeline::error::PipelineError;
use refund_risk_pipeline::metrics::PipelineMetrics;
use refund_risk_pipeline::pipeline::{DecisionPipeline, PipelineOptions};
use refund_risk_pipeline::producer::ResponseSink;
use refund_risk_pipeline::store::RefundStore;
use refund_risk_pipeline::types::{
    DecisionRecord, FinalDecision, HistoricalRefundSample, ItemDetail, RefundRequest,
    RefundResponse, UserProfile,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone)]
enum ProfileBehavior {
    Found(UserProfile),
    Missing,
    Fail,
}

struct FakeStore {
    samples: Vec<HistoricalRefundSample>,
    profile: ProfileBehavior,
    items: Vec<ItemDetail>,
    fail_history: bool,
    fail_insert: bool,
    history_delay: Option<Duration>,
    inserted: Mutex<Vec<DecisionRecord>>,
}

impl FakeStore {
    fn new(samples: Vec<HistoricalRefundSample>, profile: ProfileBehavior) -> Self {
        Self {
            samples,
            profile,
            items: vec![ItemDetail {
                item_id: 1,
                name: "Wireless headphones".to_string(),
                quantity: 1,
                unit_price: 89.99,
            }],
            fail_history: false,
            fail_insert: false,
            history_delay: None,
            inserted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RefundStore for FakeStore {
    async fn refund_history(&self) -> Result<Vec<HistoricalRefundSample>, PipelineError> {
        if let Some(delay) = self.history_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history {
            return Err(PipelineError::collaborator(
                "database",
                anyhow!("connection refused"),
            ));
        }
        Ok(self.samples.clone())
    }

    async fn user_profile(&self, _user_id: i64) -> Result<Option<UserProfile>, PipelineError> {
        match &self.profile {
            ProfileBehavior::Found(profile) => Ok(Some(profile.clone())),
            ProfileBehavior::Missing => Ok(None),
            ProfileBehavior::Fail => Err(PipelineError::collaborator(
                "database",
                anyhow!("connection refused"),
            )),
        }
    }

    async fn item_details(&self, _order_id: i64) -> Result<Vec<ItemDetail>, PipelineError> {
        Ok(self.items.clone())
    }

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<(), PipelineError> {
        if self.fail_insert {
            return Err(PipelineError::collaborator(
                "database",
                anyhow!("write timeout"),
            ));
        }
        self.inserted.lock().await.push(record.clone());
        Ok(())
    }
}

struct FakeReasoning {
    reply: Option<String>,
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl ReasoningClient for FakeReasoning {
    async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply
            .clone()
            .ok_or_else(|| anyhow!("connection timed out"))
    }

    async fn chat_json(&self, system: &str, user: &str) -> Result<String> {
        self.chat(system, user).await
    }
}

struct CountingBackend {
    label: ClassifierLabel,
    calls: Arc<AtomicU64>,
}

impl InferenceBackend for CountingBackend {
    fn predict(&self, _features: &[f32]) -> Result<ClassifierLabel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.label)
    }
}

struct CaptureSink {
    responses: Mutex<Vec<RefundResponse>>,
    publish_delay: Option<Duration>,
}

impl CaptureSink {
    fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            publish_delay: None,
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            publish_delay: Some(delay),
        }
    }
}

#[async_trait]
impl ResponseSink for CaptureSink {
    async fn publish(&self, response: &RefundResponse) -> Result<()> {
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        self.responses.lock().await.push(response.clone());
        Ok(())
    }
}

struct Harness {
    pipeline: DecisionPipeline,
    store: Arc<FakeStore>,
    sink: Arc<CaptureSink>,
    backend_calls: Arc<AtomicU64>,
    reasoning_calls: Arc<AtomicU64>,
}

impl Harness {
    fn build(
        store: FakeStore,
        label: ClassifierLabel,
        reply: Option<&str>,
        options: PipelineOptions,
    ) -> Self {
        Self::build_with_sink(store, label, reply, options, CaptureSink::new())
    }

    fn build_with_sink(
        store: FakeStore,
        label: ClassifierLabel,
        reply: Option<&str>,
        options: PipelineOptions,
        sink: CaptureSink,
    ) -> Self {
        let store = Arc::new(store);
        let sink = Arc::new(sink);
        let backend_calls = Arc::new(AtomicU64::new(0));
        let reasoning_calls = Arc::new(AtomicU64::new(0));

        let detector = Arc::new(AnomalyDetector::new(AnomalyConfig {
            seed: Some(42),
            ..AnomalyConfig::default()
        }));
        let scorer = Arc::new(ClassifierScorer::with_backend(Box::new(CountingBackend {
            label,
            calls: backend_calls.clone(),
        })));
        let advisor = Arc::new(JudgmentAdvisor::new(
            Arc::new(FakeReasoning {
                reply: reply.map(str::to_string),
                calls: reasoning_calls.clone(),
            }),
            false,
        ));

        let pipeline = DecisionPipeline::new(
            store.clone(),
            detector,
            scorer,
            advisor,
            sink.clone(),
            Arc::new(PipelineMetrics::new()),
            options,
        );

        Self {
            pipeline,
            store,
            sink,
            backend_calls,
            reasoning_calls,
        }
    }

    async fn responses(&self) -> Vec<RefundResponse> {
        self.sink.responses.lock().await.clone()
    }

    async fn records(&self) -> Vec<DecisionRecord> {
        self.store.inserted.lock().await.clone()
    }
}

fn default_options() -> PipelineOptions {
    PipelineOptions {
        run_timeout: Duration::from_secs(5),
        score_all_signals: false,
        per_user_serial: false,
    }
}

fn benign_history() -> Vec<HistoricalRefundSample> {
    [
        70.0, 80.0, 85.0, 90.0, 95.0, 100.0, 100.0, 105.0, 105.0, 110.0, 115.0, 120.0, 125.0,
        130.0, 140.0,
    ]
    .iter()
    .enumerate()
    .map(|(i, &amount)| HistoricalRefundSample::new(i as i64 + 1, amount))
    .collect()
}

fn good_profile() -> UserProfile {
    UserProfile {
        account_age_days: 400,
        total_orders: 25,
        total_refunds: 1,
        flagged_for_fraud: false,
    }
}

fn request(amount: f64) -> RefundRequest {
    let mut request = RefundRequest::new(1, 42, "damaged product", amount);
    request.chat_id = 7001;
    request
}

#[tokio::test]
async fn approves_when_every_signal_agrees() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::Approved);

    let responses = harness.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].chat_id, 7001);
    assert_eq!(responses[0].decision, FinalDecision::Approved);

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_decision, FinalDecision::Approved);
    assert_eq!(
        records[0].classifier.unwrap().label,
        ClassifierLabel::Approve
    );
    assert_eq!(
        records[0].advisory.as_ref().unwrap().decision,
        AdvisoryDecision::Approve
    );
    assert!(!records[0].anomaly.is_anomaly);
}

#[tokio::test]
async fn anomaly_short_circuits_without_spending_external_calls() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    let decision = harness.pipeline.handle_request(request(500.0)).await;
    assert_eq!(decision, FinalDecision::ManualReview);

    // Skipped signals cost nothing
    assert_eq!(harness.backend_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.reasoning_calls.load(Ordering::SeqCst), 0);

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].anomaly.is_anomaly);
    assert!(records[0].classifier.is_none());
    assert!(records[0].advisory.is_none());
    assert_eq!(records[0].ai_prediction(), "skipped");

    let responses = harness.responses().await;
    assert_eq!(responses[0].decision, FinalDecision::ManualReview);
}

#[tokio::test]
async fn score_all_signals_keeps_scoring_past_the_anomaly_flag() {
    let options = PipelineOptions {
        score_all_signals: true,
        ..default_options()
    };
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        options,
    );

    let decision = harness.pipeline.handle_request(request(500.0)).await;

    // The anomaly flag still decides, but the record carries every signal
    assert_eq!(decision, FinalDecision::ManualReview);
    assert_eq!(harness.backend_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.reasoning_calls.load(Ordering::SeqCst), 1);

    let records = harness.records().await;
    assert!(records[0].anomaly.is_anomaly);
    assert!(records[0].classifier.is_some());
    assert!(records[0].advisory.is_some());
}

#[tokio::test]
async fn advisory_failure_with_hold_label_denies() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Hold,
        None,
        default_options(),
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::Denied);

    // The failed advisory call lands in the record as unknown, never as
    // an approval
    let records = harness.records().await;
    assert_eq!(
        records[0].advisory.as_ref().unwrap().decision,
        AdvisoryDecision::Unknown
    );
    assert_eq!(records[0].ai_prediction(), "unknown");
}

#[tokio::test]
async fn missing_profile_forces_manual_review() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Missing),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::ManualReview);

    // The advisor never ran: no profile means no prompt
    assert_eq!(harness.reasoning_calls.load(Ordering::SeqCst), 0);

    let records = harness.records().await;
    assert!(records[0].advisory.is_none());
    assert!(records[0].classifier.is_some());
}

#[tokio::test]
async fn profile_fetch_failure_forces_manual_review() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Fail),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::ManualReview);
    assert_eq!(harness.reasoning_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn history_failure_degrades_to_empty_snapshot() {
    let mut store = FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile()));
    store.fail_history = true;
    let harness = Harness::build(
        store,
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    // With no history the anomaly leg cannot fire; the other signals
    // still decide
    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::Approved);

    let records = harness.records().await;
    assert_eq!(records[0].anomaly.sample_size, 0);
    assert!(!records[0].anomaly.is_anomaly);
}

#[tokio::test]
async fn persist_failure_still_responds() {
    let mut store = FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile()));
    store.fail_insert = true;
    let harness = Harness::build(
        store,
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::Approved);

    // The audit row was dropped but the requester still got an answer
    assert!(harness.records().await.is_empty());
    let responses = harness.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].decision, FinalDecision::Approved);
}

#[tokio::test]
async fn deadline_expiry_resolves_to_manual_review() {
    let mut store = FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile()));
    store.history_delay = Some(Duration::from_millis(200));
    let options = PipelineOptions {
        run_timeout: Duration::from_millis(50),
        ..default_options()
    };
    let harness = Harness::build(
        store,
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        options,
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::ManualReview);

    // The run was cut off before persistence, but the requester still
    // got the safe default
    assert!(harness.records().await.is_empty());
    let responses = harness.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].chat_id, 7001);
    assert_eq!(responses[0].decision, FinalDecision::ManualReview);
}

#[tokio::test]
async fn slow_publish_is_not_cut_short_by_the_run_deadline() {
    // Scoring finishes inside the deadline; only the publish is slow.
    // The requester still gets exactly one response carrying the run's
    // real decision, never a conflicting safe default.
    let options = PipelineOptions {
        run_timeout: Duration::from_millis(100),
        ..default_options()
    };
    let harness = Harness::build_with_sink(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        options,
        CaptureSink::with_delay(Duration::from_millis(250)),
    );

    let decision = harness.pipeline.handle_request(request(110.0)).await;
    assert_eq!(decision, FinalDecision::Approved);

    let responses = harness.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].decision, FinalDecision::Approved);
}

#[tokio::test]
async fn malformed_payload_with_chat_id_gets_safe_default() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    harness
        .pipeline
        .handle_message(br#"{"chat_id": 9001, "amount": "not-a-number"}"#)
        .await;

    let responses = harness.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].chat_id, 9001);
    assert_eq!(responses[0].decision, FinalDecision::ManualReview);

    // Rejected before scoring: nothing persisted
    assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn malformed_payload_without_chat_id_is_dropped() {
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    harness.pipeline.handle_message(b"not json at all").await;

    assert!(harness.responses().await.is_empty());
    assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn tight_history_flags_large_refund() {
    // A genuine event payload end to end: parse, score, fuse, respond
    let harness = Harness::build(
        FakeStore::new(benign_history(), ProfileBehavior::Found(good_profile())),
        ClassifierLabel::Approve,
        Some("This looks legitimate, approve it"),
        default_options(),
    );

    let payload = br#"{"chat_id": 5555, "user_id": 3, "order_id": 99, "reason": "other", "amount": 4500.0}"#;
    harness.pipeline.handle_message(payload).await;

    let responses = harness.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].chat_id, 5555);
    assert_eq!(responses[0].decision, FinalDecision::ManualReview);
}
