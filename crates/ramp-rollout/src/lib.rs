//! ramp-rollout — the progressive-delivery state machine.
//!
//! Drives a rollout through weight-set, pause, and analysis steps:
//! `Progressing → Paused → Analyzing → {Progressing | Aborted | Promoted}`.
//! Weight changes go to the external traffic router, analysis verdicts come
//! from the canary analysis engine, and target-group bindings arrive
//! asynchronously from the dependency resolver.
//!
//! Construction is deliberately two-phase: a rollout is submitted without
//! any analysis steps (the analysis configuration needs target-group
//! identifiers that only exist after the first weight-set executes), and
//! the analysis steps are patched in once both bindings have resolved.

pub mod builder;
pub mod config;
pub mod controller;
pub mod error;

pub use builder::{attach_analysis, submit};
pub use config::RolloutConfig;
pub use controller::{Notifier, RolloutController, TrafficRouter};
pub use error::RolloutError;
