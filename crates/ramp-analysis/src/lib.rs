//! ramp-analysis — comparative canary analysis.
//!
//! Each invocation queries error and request counts for the canary and
//! baseline target groups over a trailing window and renders a verdict:
//! `Pass` if the canary's error rate stays within a relative tolerance of
//! baseline, `Fail` otherwise, `Inconclusive` when neither population saw
//! traffic. The engine is stateless per call — the rollout state machine
//! owns the consecutive-failure counter.

pub mod engine;

pub use engine::{AnalysisConfig, AnalysisEngine, AnalysisError, MetricsBackend, compare_rates};
