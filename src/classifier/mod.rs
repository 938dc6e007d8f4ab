//! Pretrained classifier scoring with hot-swappable model versions.
//!
//! The scorer holds a versioned handle to the current model. Each
//! request pins one version at the start of evaluation, so a concurrent
//! reload never produces a torn read mid-request. A background watcher
//! polls the artifact's mtime and hot-swaps when the retrain job
//! rewrites it.

pub mod loader;

pub use loader::{InferenceBackend, ModelLoader, OnnxModel};

use crate::error::PipelineError;
use crate::features::FeatureExtractor;
use crate::metrics::PipelineMetrics;
use crate::types::RefundRequest;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Binary approve/hold signal from the supervised model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierLabel {
    Approve,
    Hold,
}

impl ClassifierLabel {
    /// Map the model's class output: 1 approves, everything else holds.
    pub fn from_class(class: i64) -> Self {
        if class == 1 {
            ClassifierLabel::Approve
        } else {
            ClassifierLabel::Hold
        }
    }
}

/// Classifier signal for one request, tagged with the model version
/// that produced it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassifierScore {
    pub label: ClassifierLabel,
    pub model_version: u64,
}

/// One published model version. Immutable once published; in-flight
/// requests keep their `Arc` alive across reloads.
pub struct VersionedModel {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    backend: Box<dyn InferenceBackend>,
}

impl VersionedModel {
    /// Run the backing model over a feature vector.
    pub fn predict(&self, features: &[f32]) -> Result<ClassifierLabel> {
        self.backend.predict(features)
    }
}

/// Scorer over the fixed feature vector `[user_id, order_id,
/// reason_code, amount]`, with load-then-publish model swaps.
pub struct ClassifierScorer {
    model: RwLock<Arc<VersionedModel>>,
    extractor: FeatureExtractor,
    onnx_threads: usize,
}

impl ClassifierScorer {
    /// Load the artifact once at startup and publish it as version 1.
    pub fn from_artifact<P: AsRef<Path>>(path: P, onnx_threads: usize) -> Result<Self> {
        let loader = ModelLoader::with_threads(onnx_threads)?;
        let backend = loader.load(path)?;
        Ok(Self {
            model: RwLock::new(Arc::new(VersionedModel {
                version: 1,
                loaded_at: Utc::now(),
                backend: Box::new(backend),
            })),
            extractor: FeatureExtractor::new(),
            onnx_threads,
        })
    }

    /// Build a scorer over an arbitrary backend (tests).
    pub fn with_backend(backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            model: RwLock::new(Arc::new(VersionedModel {
                version: 1,
                loaded_at: Utc::now(),
                backend,
            })),
            extractor: FeatureExtractor::new(),
            onnx_threads: 1,
        }
    }

    /// Score a request against the currently published model version.
    pub fn evaluate(&self, request: &RefundRequest) -> Result<ClassifierScore, PipelineError> {
        let model = self.snapshot();
        let features = self.extractor.extract(request);

        let label = model.predict(&features).map_err(PipelineError::Model)?;

        debug!(
            request_id = %request.request_id,
            label = ?label,
            model_version = model.version,
            "Classifier scored request"
        );

        Ok(ClassifierScore {
            label,
            model_version: model.version,
        })
    }

    /// Pin the current model version. The returned handle stays valid
    /// through a concurrent reload.
    pub fn snapshot(&self) -> Arc<VersionedModel> {
        self.model
            .read()
            .map(|model| model.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Version of the currently published model.
    pub fn current_version(&self) -> u64 {
        self.snapshot().version
    }

    /// Publish a new backend as the next version (load-then-publish).
    pub fn reload_backend(&self, backend: Box<dyn InferenceBackend>) -> u64 {
        let mut model = match self.model.write() {
            Ok(model) => model,
            Err(poisoned) => poisoned.into_inner(),
        };
        let version = model.version + 1;
        *model = Arc::new(VersionedModel {
            version,
            loaded_at: Utc::now(),
            backend,
        });
        version
    }

    /// Load a fresh copy of the artifact and publish it. The old
    /// version stays live for requests that already pinned it.
    pub fn reload_from_artifact<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let loader = ModelLoader::with_threads(self.onnx_threads)?;
        let backend = loader.load(path)?;
        Ok(self.reload_backend(Box::new(backend)))
    }
}

/// Background task that polls the artifact's mtime and hot-swaps the
/// model when the retrain job rewrites the file.
pub struct ModelWatcher {
    scorer: Arc<ClassifierScorer>,
    artifact: PathBuf,
    interval: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl ModelWatcher {
    pub fn new(
        scorer: Arc<ClassifierScorer>,
        artifact: PathBuf,
        interval: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            scorer,
            artifact,
            interval,
            metrics,
        }
    }

    /// Poll until shutdown. Reload failures keep the current version
    /// and wait for the next rewrite.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut last_mtime = poll_mtime(&self.artifact);

        info!(
            artifact = %self.artifact.display(),
            interval_secs = self.interval.as_secs(),
            "Model watcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let mtime = poll_mtime(&self.artifact);
                    if mtime.is_some() && mtime != last_mtime {
                        match self.scorer.reload_from_artifact(&self.artifact) {
                            Ok(version) => {
                                self.metrics.record_model_reload();
                                info!(version, "Classifier model hot-swapped");
                            }
                            Err(e) => {
                                warn!(error = %e, "Model reload failed, keeping current version");
                            }
                        }
                        last_mtime = mtime;
                    }
                }
            }
        }

        debug!("Model watcher stopped");
    }
}

fn poll_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FixedBackend(ClassifierLabel);

    impl InferenceBackend for FixedBackend {
        fn predict(&self, _features: &[f32]) -> Result<ClassifierLabel> {
            Ok(self.0)
        }
    }

    struct FailingBackend;

    impl InferenceBackend for FailingBackend {
        fn predict(&self, _features: &[f32]) -> Result<ClassifierLabel> {
            Err(anyhow::anyhow!("shape mismatch"))
        }
    }

    #[test]
    fn test_label_from_class() {
        assert_eq!(ClassifierLabel::from_class(1), ClassifierLabel::Approve);
        assert_eq!(ClassifierLabel::from_class(0), ClassifierLabel::Hold);
        assert_eq!(ClassifierLabel::from_class(-1), ClassifierLabel::Hold);
    }

    #[test]
    fn test_evaluate_tags_model_version() {
        let scorer = ClassifierScorer::with_backend(Box::new(FixedBackend(
            ClassifierLabel::Approve,
        )));
        let request = RefundRequest::new(1, 1, "damaged product", 100.0);

        let score = scorer.evaluate(&request).unwrap();
        assert_eq!(score.label, ClassifierLabel::Approve);
        assert_eq!(score.model_version, 1);
    }

    #[test]
    fn test_pinned_version_survives_reload() {
        let scorer = ClassifierScorer::with_backend(Box::new(FixedBackend(
            ClassifierLabel::Approve,
        )));

        let pinned = scorer.snapshot();
        let new_version = scorer.reload_backend(Box::new(FixedBackend(ClassifierLabel::Hold)));

        assert_eq!(pinned.version, 1);
        assert_eq!(new_version, 2);
        assert_eq!(scorer.current_version(), 2);

        // The pinned handle still answers with the old model
        assert_eq!(pinned.predict(&[1.0]).unwrap(), ClassifierLabel::Approve);

        let request = RefundRequest::new(1, 1, "other", 50.0);
        let score = scorer.evaluate(&request).unwrap();
        assert_eq!(score.label, ClassifierLabel::Hold);
        assert_eq!(score.model_version, 2);
    }

    #[test]
    fn test_backend_failure_maps_to_model_error() {
        let scorer = ClassifierScorer::with_backend(Box::new(FailingBackend));
        let request = RefundRequest::new(1, 1, "other", 50.0);

        let err = scorer.evaluate(&request).unwrap_err();
        assert!(matches!(err, PipelineError::Model(_)));
    }

    #[test]
    fn test_poll_mtime_tracks_rewrites() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "v1").unwrap();
        file.flush().unwrap();

        let first = poll_mtime(file.path());
        assert!(first.is_some());

        // A rewrite in the future must read as a different mtime
        let later = SystemTime::now() + Duration::from_secs(60);
        let times = std::fs::FileTimes::new().set_modified(later);
        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .set_times(times)
            .unwrap();

        let second = poll_mtime(file.path());
        assert!(second.is_some());
        assert_ne!(first, second);

        assert!(poll_mtime(Path::new("/nonexistent/model.onnx")).is_none());
    }
}
