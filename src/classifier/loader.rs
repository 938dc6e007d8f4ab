//! ONNX classifier artifact loading and label extraction.

use crate::classifier::ClassifierLabel;
use anyhow::{Context, Result};
use ort::memory::Allocator;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Opaque predict(features) -> label interface over the classifier
/// artifact. Production backend is an ONNX session; tests substitute
/// their own.
pub trait InferenceBackend: Send + Sync {
    fn predict(&self, features: &[f32]) -> Result<ClassifierLabel>;
}

/// A loaded ONNX model with its resolved input/output names.
pub struct OnnxModel {
    session: RwLock<Session>,
    input_name: String,
    /// int64 label tensor emitted by skl2onnx exports, when present
    label_output: Option<String>,
    prob_output: String,
}

/// Loader for the ONNX classifier artifact.
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with default settings (1 thread).
    pub fn new() -> Result<Self> {
        Self::with_threads(1)
    }

    /// Create a new model loader with the given intra-op thread count.
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        ort::init().commit()?;
        info!(onnx_threads, "ONNX Runtime initialized");
        Ok(Self { onnx_threads })
    }

    /// Load the classifier artifact from file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<OnnxModel> {
        let path = path.as_ref();

        info!(path = %path.display(), threads = self.onnx_threads, "Loading classifier artifact");

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?
            .commit_from_file(path)
            .context(format!("Failed to load model from {:?}", path))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let label_output = session
            .outputs
            .iter()
            .find(|o| o.name.contains("label"))
            .map(|o| o.name.clone());

        let prob_output = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob") || o.name.contains("output"))
            .map(|o| o.name.clone())
            .unwrap_or_else(|| {
                session
                    .outputs
                    .last()
                    .map(|o| o.name.clone())
                    .unwrap_or_else(|| "probabilities".to_string())
            });

        info!(
            path = %path.display(),
            input = %input_name,
            label_output = ?label_output,
            prob_output = %prob_output,
            "Classifier artifact loaded"
        );

        Ok(OnnxModel {
            session: RwLock::new(session),
            input_name,
            label_output,
            prob_output,
        })
    }
}

impl InferenceBackend for OnnxModel {
    fn predict(&self, features: &[f32]) -> Result<ClassifierLabel> {
        use ort::value::Tensor;

        let shape = vec![1_i64, features.len() as i64];
        let input_tensor = Tensor::from_array((shape, features.to_vec()))
            .context("Failed to create input tensor")?;

        let mut session = self
            .session
            .write()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let outputs = session.run(ort::inputs![&self.input_name => input_tensor])?;

        // skl2onnx convention: an int64 label tensor alongside the
        // probability output
        if let Some(name) = &self.label_output {
            if let Some(output) = outputs.get(name) {
                if let Ok((_, data)) = output.try_extract_tensor::<i64>() {
                    let label = data.first().copied().unwrap_or(0);
                    debug!(label, "Extracted label tensor");
                    return Ok(ClassifierLabel::from_class(label));
                }
            }
        }

        // Otherwise fall back to the class-1 probability against a 0.5
        // cutoff
        let prob = extract_probability(&outputs, &self.prob_output)?;
        Ok(ClassifierLabel::from_class(i64::from(prob >= 0.5)))
    }
}

/// Extract the class-1 probability from model output.
/// Handles both tensor outputs and seq(map) outputs.
fn extract_probability(outputs: &ort::session::SessionOutputs, prob_output: &str) -> Result<f64> {
    if let Some(output) = outputs.get(prob_output) {
        let dtype = output.dtype();

        if let Ok(tensor) = output.try_extract_tensor::<f32>() {
            let (shape, data) = tensor;
            let prob = class_one_prob_from_tensor(&shape, data);
            debug!(prob, "Extracted from tensor");
            return Ok(prob);
        }

        if DynSequenceValueType::can_downcast(&dtype) {
            if let Ok(prob) = extract_from_sequence_map(output) {
                return Ok(prob);
            }
        }
    }

    // Fallback: iterate all outputs and try extraction
    for (name, output) in outputs.iter() {
        if name.contains("label") {
            continue;
        }

        let dtype = output.dtype();

        if let Ok(tensor) = output.try_extract_tensor::<f32>() {
            let (shape, data) = tensor;
            let prob = class_one_prob_from_tensor(&shape, data);
            debug!(output = %name, prob, "Extracted from tensor (fallback)");
            return Ok(prob);
        }

        if DynSequenceValueType::can_downcast(&dtype) {
            if let Ok(prob) = extract_from_sequence_map(&output) {
                return Ok(prob);
            }
        }
    }

    warn!("Could not extract probability, using neutral 0.5");
    Ok(0.5)
}

/// Extract the class-1 probability from seq(map(int64, float)) output.
fn extract_from_sequence_map(output: &ort::value::DynValue) -> Result<f64> {
    let allocator = Allocator::default();

    let sequence = output
        .downcast_ref::<DynSequenceValueType>()
        .map_err(|e| anyhow::anyhow!("Failed to downcast to sequence: {}", e))?;

    let maps = sequence.try_extract_sequence::<DynMapValueType>(&allocator)?;

    if maps.is_empty() {
        return Err(anyhow::anyhow!("Empty sequence"));
    }

    // Batch size is always 1
    let kv_pairs = maps[0].try_extract_key_values::<i64, f32>()?;

    for (class_id, prob) in &kv_pairs {
        if *class_id == 1 {
            debug!(prob = *prob, "Extracted from seq(map)");
            return Ok(*prob as f64);
        }
    }

    for (class_id, prob) in &kv_pairs {
        if *class_id == 0 {
            return Ok(1.0 - *prob as f64);
        }
    }

    Err(anyhow::anyhow!("No probability found in map"))
}

/// Extract the class-1 probability from tensor data.
fn class_one_prob_from_tensor(shape: &ort::tensor::Shape, data: &[f32]) -> f64 {
    let dims: Vec<i64> = shape.iter().copied().collect();

    if dims.len() == 2 {
        let num_classes = dims[1] as usize;
        if num_classes >= 2 {
            return data[1] as f64;
        } else if num_classes == 1 {
            return data[0] as f64;
        }
    } else if dims.len() == 1 {
        let num_classes = dims[0] as usize;
        if num_classes >= 2 {
            return data[1] as f64;
        } else if num_classes == 1 {
            return data[0] as f64;
        }
    }

    data.last().map(|&v| v as f64).unwrap_or(0.5)
}
