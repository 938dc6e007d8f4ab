//! Error taxonomy for the refund risk-decision pipeline.
//!
//! No variant is fatal to the process: input errors are rejected before
//! scoring, collaborator and model failures degrade the affected signal,
//! and deadline expiry resolves to the safe default decision.

use std::time::Duration;
use thiserror::Error;

/// Per-request fault classification.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed inbound event. Rejected without scoring, never retried.
    #[error("malformed inbound event: {0}")]
    Input(String),

    /// A collaborator (database, reasoning service, bus) was unreachable
    /// or returned garbage. The affected signal degrades to its safe
    /// default instead of aborting the run.
    #[error("{collaborator} unavailable: {source}")]
    Collaborator {
        collaborator: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Classifier failure (artifact load, shape mismatch, runtime error).
    /// Treated like a collaborator failure; the label degrades to hold.
    #[error("classifier model failure: {0}")]
    Model(#[source] anyhow::Error),

    /// The run exceeded its deadline and resolved to manual review.
    #[error("pipeline run exceeded {0:?} deadline")]
    Deadline(Duration),
}

impl PipelineError {
    /// Wrap a collaborator fault with the collaborator's name.
    pub fn collaborator(collaborator: &'static str, source: anyhow::Error) -> Self {
        Self::Collaborator {
            collaborator,
            source,
        }
    }
}
