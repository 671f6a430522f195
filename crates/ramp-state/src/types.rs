//! Domain types for the Ramp state store.
//!
//! These types represent the persisted state of services, rollouts,
//! target-group bindings, and analysis records. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a service (namespace-scoped, `{namespace}/{name}`).
pub type ServiceId = String;

/// Unique identifier for a rollout.
pub type RolloutId = String;

// ── Service ───────────────────────────────────────────────────────

/// Specification for a routable unit of deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub namespace: String,
    pub name: String,
    /// Replica count currently running.
    pub current_replicas: u32,
    /// Replica bounds under normal operation.
    pub replicas: ReplicaBounds,
    /// Alternate bounds used in reduced-capacity mode, if configured.
    pub reduced_replicas: Option<ReplicaBounds>,
    /// Resource request/limit profile per replica.
    pub resources: ResourceProfile,
    /// Autoscaling configuration.
    pub scaling: Option<ScalingConfig>,
    /// Unix timestamp (seconds) when this spec was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this spec was last updated.
    pub updated_at: u64,
}

/// Min/max replica count for a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

/// Resource request/limit profile per replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceProfile {
    pub cpu_request_millis: u32,
    pub cpu_limit_millis: u32,
    pub memory_request_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Autoscaling parameters for a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingConfig {
    /// Target CPU utilization (percent).
    pub cpu_target_percent: f64,
    /// Target memory utilization (percent).
    pub memory_target_percent: f64,
    /// Derived queueing-delay signal, when the telemetry source exists.
    pub signal: Option<SignalConfig>,
    /// Stabilization before acting on a scale-up (seconds).
    pub scale_up_stabilization_secs: u64,
    /// Stabilization before acting on a scale-down (seconds).
    pub scale_down_stabilization_secs: u64,
    /// Minimum spacing between single-replica scale-down steps (seconds).
    pub scale_down_step_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            cpu_target_percent: 70.0,
            memory_target_percent: 80.0,
            signal: None,
            scale_up_stabilization_secs: 45,
            scale_down_stabilization_secs: 300,
            scale_down_step_secs: 15,
        }
    }
}

/// Calibration constants for the derived queueing-delay signal.
///
/// The deriver maps a windowed-minimum queueing delay into a dimensionless
/// scalar: floor-subtract `baseline_delay`, `log10`, then divide so the
/// output equals `calibration` when the input sits exactly at the idle
/// baseline. The consuming policy targets `target` (1.0), so an idle
/// service biases continuously toward scale-down probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalConfig {
    /// Delay representative of an idle system, same unit as the raw input.
    pub baseline_delay: f64,
    /// Deriver output when the input equals `baseline_delay`.
    pub calibration: f64,
    /// Target value used by the autoscaling policy.
    pub target: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            baseline_delay: 1000.0,
            calibration: 0.83,
            target: 1.0,
        }
    }
}

// ── Rollout ───────────────────────────────────────────────────────

/// One step in a rollout's ordered step program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutStep {
    /// Shift canary traffic weight to the given percentage.
    SetWeight { percent: u32 },
    /// Hold for a fixed duration before the next step.
    Pause { seconds: u64 },
    /// Run comparative analysis until enough passes accumulate.
    Analysis,
}

/// Status of a rollout. `Promoted` and `Aborted` are terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RolloutStatus {
    Progressing,
    Paused,
    Analyzing,
    Promoted,
    Aborted { reason: AbortReason },
}

/// Why a rollout was aborted. Distinguishes "analysis rejected the canary"
/// from "the rollout never got set up".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Consecutive failing analysis runs reached the failure limit.
    AnalysisFailed,
    /// Target-group bindings did not resolve within the timeout budget.
    ResolutionTimeout,
    /// Operator-initiated abort.
    Manual,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnalysisFailed => f.write_str("analysis_failed"),
            Self::ResolutionTimeout => f.write_str("resolution_timeout"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// The progressive-delivery process for one service version change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub service_id: ServiceId,
    pub old_version: String,
    pub new_version: String,
    /// Ordered step program. Analysis steps are absent until the
    /// two-phase builder patches them in post-resolution.
    pub steps: Vec<RolloutStep>,
    /// Index of the next step to execute.
    pub step_index: usize,
    pub status: RolloutStatus,
    /// Current canary traffic weight (percent).
    pub canary_weight: u32,
    /// Whether analysis steps have been patched into the step program.
    pub analysis_attached: bool,
    /// Consecutive failing analysis runs (reset on any pass).
    pub consecutive_failures: u32,
    /// Passing analysis runs accumulated at the current analysis step.
    pub passes_at_step: u32,
    /// Unix timestamp when the current pause began.
    pub paused_at: Option<u64>,
    /// Unix timestamp of the most recent analysis invocation.
    pub last_analysis_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Rollout {
    /// Whether this rollout has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RolloutStatus::Promoted | RolloutStatus::Aborted { .. }
        )
    }

    /// The step at the current index, if any remain.
    pub fn current_step(&self) -> Option<&RolloutStep> {
        self.steps.get(self.step_index)
    }
}

// ── Target-group bindings ─────────────────────────────────────────

/// Which traffic population a binding or metric query refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    Baseline,
    Canary,
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => f.write_str("baseline"),
            Self::Canary => f.write_str("canary"),
        }
    }
}

/// Maps one population of a service to its externally-assigned
/// load-balancer target-group identifier. Immutable once resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetGroupBinding {
    pub service_id: ServiceId,
    pub population: Population,
    /// Identifier assigned by the external load balancer.
    pub target_group_id: String,
    /// Unix timestamp when the identifier was discovered.
    pub resolved_at: u64,
}

// ── Analysis ──────────────────────────────────────────────────────

/// Outcome of one analysis run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

/// One invocation of the canary analysis engine for a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    pub rollout_id: RolloutId,
    /// Unix timestamp of the invocation.
    pub epoch: u64,
    /// Trailing query window (seconds).
    pub window_secs: u64,
    pub baseline_errors: f64,
    pub baseline_requests: f64,
    pub canary_errors: f64,
    pub canary_requests: f64,
    pub baseline_rate: f64,
    pub canary_rate: f64,
    /// Relative error-rate delta of canary over baseline.
    pub delta: f64,
    pub verdict: Verdict,
}

// ── Autoscaling ───────────────────────────────────────────────────

/// A point-in-time reading consumed by the autoscaling policy evaluator.
///
/// Ephemeral: never persisted beyond the evaluation that consumes it.
/// A `None` field means the corresponding telemetry source is absent or
/// unavailable and must be excluded from the decision, not treated as zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AutoscalingSample {
    /// CPU utilization (percent of target profile).
    pub cpu_percent: Option<f64>,
    /// Memory utilization (percent of target profile).
    pub memory_percent: Option<f64>,
    /// Derived queueing-delay signal (dimensionless).
    pub signal: Option<f64>,
}

// ── Composite keys ────────────────────────────────────────────────

impl ServiceSpec {
    /// Build the composite key for the services table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl TargetGroupBinding {
    /// Build the composite key for the bindings table.
    pub fn table_key(&self) -> String {
        binding_key(&self.service_id, self.population)
    }
}

/// Composite key for a binding lookup.
pub fn binding_key(service_id: &str, population: Population) -> String {
    format!("{service_id}:{population}")
}

impl AnalysisRecord {
    /// Build the composite key for the analyses table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.rollout_id, self.epoch)
    }
}
