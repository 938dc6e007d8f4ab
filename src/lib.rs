//! Refund Risk-Decision Pipeline Library
//!
//! Consumes refund-request events from NATS, gathers statistical,
//! supervised, and advisory signals, fuses them under fixed precedence
//! rules, and emits an approve/deny/manual-review decision.

pub mod advisor;
pub mod anomaly;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod error;
pub mod features;
pub mod fusion;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use consumer::RefundRequestConsumer;
pub use error::PipelineError;
pub use pipeline::{DecisionPipeline, PipelineOptions};
pub use producer::ResponsePublisher;
pub use types::{DecisionRecord, FinalDecision, RefundRequest, RefundResponse};
