//! Feature extraction for refund classifier inference.
//!
//! The feature vector must match the order used during model training:
//! `[user_id, order_id, reason_code, amount]`.

use crate::types::RefundRequest;

/// Map a free-text refund reason to its training-time code.
///
/// Case-insensitive; unmapped reasons fall into the "other" bucket,
/// never an error.
pub fn reason_code(reason: &str) -> f32 {
    match reason.trim().to_lowercase().as_str() {
        "damaged product" => 1.0,
        "wrong item" => 2.0,
        "payment failure" => 3.0,
        _ => 0.0,
    }
}

/// Feature extractor that transforms refund requests into model input
/// features, in the exact order expected by the ONNX artifact.
pub struct FeatureExtractor;

impl FeatureExtractor {
    /// Create a new feature extractor.
    pub fn new() -> Self {
        Self
    }

    /// Extract the classifier feature vector from a refund request.
    pub fn extract(&self, request: &RefundRequest) -> Vec<f32> {
        vec![
            request.user_id as f32,
            request.order_id as f32,
            reason_code(&request.reason),
            request.amount as f32,
        ]
    }

    /// Get the number of features produced.
    pub fn feature_count(&self) -> usize {
        4
    }

    /// Get feature names (matching training order).
    pub fn feature_names(&self) -> Vec<&'static str> {
        vec!["user_id", "order_id", "reason_code", "amount"]
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}
