//! Test Refund Request Producer
//!
//! Generates and publishes refund-request events to NATS for pipeline
//! testing, mixing plausible refunds with oversized suspicious ones.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Refund request structure matching the pipeline's inbound contract
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefundRequestEvent {
    chat_id: i64,
    user_id: i64,
    order_id: i64,
    reason: String,
    amount: f64,
}

/// Refund request generator for testing
struct RequestGenerator {
    rng: rand::rngs::ThreadRng,
    order_counter: i64,
}

impl RequestGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
            order_counter: 0,
        }
    }

    /// Generate a plausible refund request
    fn generate_legitimate(&mut self) -> RefundRequestEvent {
        self.order_counter += 1;

        RefundRequestEvent {
            chat_id: self.rng.gen_range(1000..9999),
            user_id: self.rng.gen_range(1..500),
            order_id: self.order_counter,
            reason: self
                .random_choice(&["damaged product", "wrong item", "payment failure"])
                .to_string(),
            amount: self.rng.gen_range(15.0..250.0),
        }
    }

    /// Generate a suspicious refund request (oversized amount, vague
    /// reason, fresh user id)
    fn generate_suspicious(&mut self) -> RefundRequestEvent {
        self.order_counter += 1;

        RefundRequestEvent {
            chat_id: self.rng.gen_range(1000..9999),
            user_id: self.rng.gen_range(9000..9999), // Unseen users
            order_id: self.order_counter,
            reason: self
                .random_choice(&["other", "damaged product"])
                .to_string(),
            amount: self.rng.gen_range(1500.0..10000.0), // High amount
        }
    }

    fn random_choice<'a>(&mut self, choices: &[&'a str]) -> &'a str {
        choices[self.rng.gen_range(0..choices.len())]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Refund Request Producer");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("nats://localhost:4222");
    let subject = args.get(2).map(|s| s.as_str()).unwrap_or("refund_requests");
    let count: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(100);
    let anomaly_rate: f64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.1);
    let delay_ms: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        subject = %subject,
        count,
        anomaly_rate,
        delay_ms,
        "Configuration loaded"
    );

    // Connect to NATS
    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, anomaly_rate, delay_ms).await;
        }
    };

    // Generate and publish refund requests
    let mut generator = RequestGenerator::new();
    let mut rng = rand::thread_rng();

    info!("Starting to publish {} refund requests...", count);

    let mut legitimate_count = 0;
    let mut suspicious_count = 0;

    for i in 0..count {
        let request = if rng.gen_bool(anomaly_rate) {
            suspicious_count += 1;
            generator.generate_suspicious()
        } else {
            legitimate_count += 1;
            generator.generate_legitimate()
        };

        let payload = serde_json::to_vec(&request)?;

        client.publish(subject.to_string(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} requests ({} legitimate, {} suspicious)",
                i + 1,
                count,
                legitimate_count,
                suspicious_count
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    info!(
        "Completed! Published {} requests ({} legitimate, {} suspicious)",
        count, legitimate_count, suspicious_count
    );

    Ok(())
}

async fn run_dry_mode(count: u64, anomaly_rate: f64, delay_ms: u64) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = RequestGenerator::new();
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let request = if rng.gen_bool(anomaly_rate) {
            generator.generate_suspicious()
        } else {
            generator.generate_legitimate()
        };

        let json = serde_json::to_string_pretty(&request)?;

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample refund request {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
