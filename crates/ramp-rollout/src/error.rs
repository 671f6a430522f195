//! Error types for rollout operations.

use thiserror::Error;

use ramp_state::StateError;

/// Errors from rollout construction and state transitions.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout not found: {0}")]
    NotFound(String),

    #[error("service {0} already has an active rollout")]
    AlreadyActive(String),

    #[error("target-group bindings for {0} are not resolved yet")]
    BindingsUnresolved(String),

    #[error("analysis steps already attached to rollout {0}")]
    AnalysisAlreadyAttached(String),

    #[error(transparent)]
    State(#[from] StateError),
}
