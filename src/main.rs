//! Refund Risk-Decision Pipeline - Main Entry Point
//!
//! Consumes refund requests from NATS, gathers the anomaly, classifier,
//! and advisory signals, and publishes the fused decision. Pipeline
//! runs execute on a bounded worker pool so one slow external call
//! never stalls message receipt.

use anyhow::Result;
use futures::StreamExt;
use refund_risk_pipeline::{
    advisor::{JudgmentAdvisor, OpenAiClient},
    anomaly::AnomalyDetector,
    classifier::{ClassifierScorer, ModelWatcher},
    config::AppConfig,
    consumer::RefundRequestConsumer,
    metrics::{MetricsReporter, PipelineMetrics},
    pipeline::{DecisionPipeline, PipelineOptions},
    producer::ResponsePublisher,
    store::PgRefundStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so logging can honor the configured level
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("refund_risk_pipeline={}", config.logging.level).parse()?,
            ),
        )
        .init();

    info!("Starting Refund Risk-Decision Pipeline");
    info!(
        z_threshold = config.anomaly.z_threshold,
        contamination = config.anomaly.contamination,
        min_samples = config.anomaly.min_samples,
        "Anomaly detection configured"
    );

    // Initialize metrics
    let metrics = Arc::new(PipelineMetrics::new());

    // Feature provider / audit store
    let store = Arc::new(
        PgRefundStore::connect(&config.database.url, config.database.max_connections).await?,
    );

    // Scoring components
    let detector = Arc::new(AnomalyDetector::new(config.anomaly.clone()));

    let scorer = Arc::new(ClassifierScorer::from_artifact(
        &config.model.artifact_path,
        config.model.onnx_threads,
    )?);
    info!(
        artifact = %config.model.artifact_path,
        version = scorer.current_version(),
        "Classifier model loaded"
    );

    let reasoning_client = OpenAiClient::from_env(
        &config.reasoning.model,
        Duration::from_secs(config.reasoning.timeout_secs),
    )?;
    let advisor = Arc::new(JudgmentAdvisor::new(
        Arc::new(reasoning_client),
        config.reasoning.structured_replies,
    ));

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url).await?;
    info!("Connected to NATS at {}", config.nats.url);

    let consumer = match config.nats.queue_group.as_deref() {
        Some(group) => RefundRequestConsumer::with_queue_group(
            client.clone(),
            &config.nats.request_subject,
            group,
        ),
        None => RefundRequestConsumer::new(client.clone(), &config.nats.request_subject),
    };
    let producer = Arc::new(ResponsePublisher::new(
        client.clone(),
        &config.nats.response_subject,
    ));

    let pipeline = Arc::new(DecisionPipeline::new(
        store,
        detector,
        scorer.clone(),
        advisor,
        producer,
        metrics.clone(),
        PipelineOptions::from(&config.pipeline),
    ));

    // Shutdown signal: stop accepting, drain in-flight runs
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    // Model watcher picks up retrain-job rewrites without a restart
    if config.model.watch {
        let watcher = ModelWatcher::new(
            scorer,
            PathBuf::from(&config.model.artifact_path),
            Duration::from_secs(config.model.reload_interval_secs),
            metrics.clone(),
        );
        let watcher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            watcher.run(watcher_shutdown).await;
        });
    }

    // Start metrics reporter (prints summary every 30 seconds)
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        let reporter = MetricsReporter::new(metrics_clone, 30);
        reporter.start().await;
    });

    let num_workers = config.pipeline.workers;
    info!(
        workers = num_workers,
        subject = %config.nats.request_subject,
        response_subject = %config.nats.response_subject,
        "Starting refund request processing loop"
    );

    // Bounded worker pool: the subscribe loop acquires a permit before
    // spawning each run
    let semaphore = Arc::new(Semaphore::new(num_workers));

    let mut subscription = consumer.subscribe().await?;
    let mut shutdown = shutdown_rx;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Shutdown signal received, no longer accepting requests");
                break;
            }
            maybe_message = subscription.next() => {
                let Some(message) = maybe_message else {
                    warn!("Request subscription closed");
                    break;
                };

                let permit = semaphore.clone().acquire_owned().await?;
                let pipeline = pipeline.clone();

                tokio::spawn(async move {
                    pipeline.handle_message(&message.payload).await;
                    drop(permit);
                });
            }
        }
    }

    // Drain: wait for every worker slot to come back
    info!("Draining in-flight pipeline runs...");
    let _drain = semaphore.acquire_many(num_workers as u32).await?;
    client.flush().await?;

    info!("Pipeline shutting down");
    metrics.print_summary();

    Ok(())
}
