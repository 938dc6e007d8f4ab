//! Statistical anomaly detection over historical refund amounts.
//!
//! Two legs: a population z-score of the requested amount against the
//! historical amounts, and an isolation forest over `(user_id, amount)`
//! pairs. Either leg firing marks the request anomalous.

pub mod isolation;

pub use isolation::{ForestParams, IsolationForest, IsolationLabel};

use crate::config::AnomalyConfig;
use crate::types::{HistoricalRefundSample, RefundRequest};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Combined anomaly signal for one request. Folded into the decision
/// record, never persisted independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// `None` when the sample set was too small or degenerate (stddev 0)
    pub z_score: Option<f64>,
    /// `None` when no forest was fitted (insufficient data)
    pub isolation_label: Option<IsolationLabel>,
    pub is_anomaly: bool,
    pub sample_size: usize,
}

impl AnomalyScore {
    /// Defined, non-error outcome for sample sets below the minimum.
    pub fn insufficient_data(sample_size: usize) -> Self {
        Self {
            z_score: None,
            isolation_label: None,
            is_anomaly: false,
            sample_size,
        }
    }
}

struct CachedForest {
    fingerprint: u64,
    forest: Arc<IsolationForest>,
}

/// Anomaly detector with a cached forest fit.
///
/// Fitting is decoupled from per-request latency: the forest is keyed
/// by a fingerprint of the sample snapshot and only refitted when the
/// snapshot changes.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    cache: RwLock<Option<CachedForest>>,
}

impl AnomalyDetector {
    /// Create a detector with the given tuning parameters.
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(None),
        }
    }

    /// Score a request against the historical sample snapshot.
    pub fn evaluate(
        &self,
        request: &RefundRequest,
        samples: &[HistoricalRefundSample],
    ) -> AnomalyScore {
        let sample_size = samples.len();
        if sample_size < self.config.min_samples {
            debug!(
                request_id = %request.request_id,
                sample_size,
                min_samples = self.config.min_samples,
                "Insufficient history for anomaly detection"
            );
            return AnomalyScore::insufficient_data(sample_size);
        }

        let amounts: Vec<f64> = samples.iter().map(|s| s.amount).collect();
        let z = z_score(request.amount, &amounts);

        let forest = self.forest_for(samples);
        let label = forest.classify([request.user_id as f64, request.amount]);

        let z_flag = z.map_or(false, |z| z > self.config.z_threshold);
        let is_anomaly = z_flag || label == IsolationLabel::Outlier;

        if is_anomaly {
            info!(
                request_id = %request.request_id,
                user_id = request.user_id,
                amount = request.amount,
                z_score = ?z,
                isolation_label = ?label,
                sample_size,
                "Refund request flagged as anomalous"
            );
        }

        AnomalyScore {
            z_score: z,
            isolation_label: Some(label),
            is_anomaly,
            sample_size,
        }
    }

    fn forest_for(&self, samples: &[HistoricalRefundSample]) -> Arc<IsolationForest> {
        let fingerprint = fingerprint(samples);

        if let Ok(cache) = self.cache.read() {
            if let Some(cached) = cache.as_ref() {
                if cached.fingerprint == fingerprint {
                    return cached.forest.clone();
                }
            }
        }

        let data: Vec<[f64; 2]> = samples
            .iter()
            .map(|s| [s.user_id as f64, s.amount])
            .collect();
        let params = ForestParams {
            trees: self.config.trees,
            subsample: self.config.subsample,
            contamination: self.config.contamination,
            seed: self.config.seed,
        };
        let forest = Arc::new(IsolationForest::fit(&data, &params));
        debug!(
            sample_size = samples.len(),
            trees = params.trees,
            "Fitted isolation forest for new sample snapshot"
        );

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(CachedForest {
                fingerprint,
                forest: forest.clone(),
            });
        }

        forest
    }
}

/// Population z-score of `amount` against the historical amounts.
/// `None` for a degenerate distribution (stddev 0) rather than a
/// division error.
pub(crate) fn z_score(amount: f64, amounts: &[f64]) -> Option<f64> {
    let n = amounts.len() as f64;
    let mean = amounts.iter().sum::<f64>() / n;
    let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    Some((amount - mean) / stddev)
}

fn fingerprint(samples: &[HistoricalRefundSample]) -> u64 {
    let mut hasher = DefaultHasher::new();
    samples.len().hash(&mut hasher);
    for sample in samples {
        sample.user_id.hash(&mut hasher);
        sample.amount.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}
