//! Analysis engine — error-rate comparison between canary and baseline.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use ramp_state::{AnalysisRecord, TargetGroupBinding, Verdict};

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Metric name for error counts.
pub const ERRORS_METRIC: &str = "http_errors";
/// Metric name for request counts.
pub const REQUESTS_METRIC: &str = "http_requests";

/// Time-series query interface to the external metrics backend.
///
/// Returns the aggregated sum of a metric for one target group over a
/// trailing window.
pub trait MetricsBackend: Send + Sync {
    fn query_count(
        &self,
        metric: &str,
        target_group: &str,
        window: Duration,
    ) -> BoxFuture<anyhow::Result<f64>>;
}

/// Errors from an analysis invocation.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The metrics backend failed or timed out. Transient: the caller
    /// retries on the next interval, never aborts on this alone.
    #[error("metrics backend: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Analysis tuning parameters.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Maximum tolerated relative error-rate delta of canary over baseline.
    pub max_relative_delta: f64,
    /// Trailing query window.
    pub window: Duration,
    /// Spacing between invocations (owned by the rollout controller).
    pub interval: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_relative_delta: 0.05,
            window: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

/// Result of comparing two error rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateComparison {
    pub baseline_rate: f64,
    pub canary_rate: f64,
    pub delta: f64,
    pub verdict: Verdict,
}

/// Compare canary against baseline error rates.
///
/// Zero traffic on both sides is `Inconclusive` — the absence of traffic
/// is not evidence of regression. With zero baseline errors, any canary
/// error counts as a full-severity regression (delta 1): at low baseline
/// volume there is nothing to normalize against, and the conservative
/// reading avoids false negatives.
pub fn compare_rates(
    baseline_errors: f64,
    baseline_requests: f64,
    canary_errors: f64,
    canary_requests: f64,
    max_relative_delta: f64,
) -> RateComparison {
    if baseline_requests <= 0.0 && canary_requests <= 0.0 {
        return RateComparison {
            baseline_rate: 0.0,
            canary_rate: 0.0,
            delta: 0.0,
            verdict: Verdict::Inconclusive,
        };
    }

    let baseline_rate = if baseline_requests > 0.0 {
        baseline_errors / baseline_requests
    } else {
        0.0
    };
    let canary_rate = if canary_requests > 0.0 {
        canary_errors / canary_requests
    } else {
        0.0
    };

    let delta = if baseline_rate == 0.0 {
        if canary_rate > 0.0 { 1.0 } else { 0.0 }
    } else {
        (canary_rate - baseline_rate) / baseline_rate
    };

    let verdict = if delta <= max_relative_delta {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    RateComparison {
        baseline_rate,
        canary_rate,
        delta,
        verdict,
    }
}

/// Stateless per-invocation canary analysis.
pub struct AnalysisEngine {
    backend: Arc<dyn MetricsBackend>,
    config: AnalysisConfig,
}

impl AnalysisEngine {
    /// Create a new engine.
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self::with_config(backend, AnalysisConfig::default())
    }

    /// Create an engine with explicit tuning parameters.
    pub fn with_config(backend: Arc<dyn MetricsBackend>, config: AnalysisConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run one analysis invocation for a rollout.
    ///
    /// Queries both populations' error and request counts over the trailing
    /// window, scoped by their resolved target-group identifiers, and
    /// renders a verdict. Returns the record for the caller to persist.
    pub async fn analyze(
        &self,
        rollout_id: &str,
        baseline: &TargetGroupBinding,
        canary: &TargetGroupBinding,
        now: u64,
    ) -> Result<AnalysisRecord, AnalysisError> {
        let window = self.config.window;

        let baseline_errors = self.query(ERRORS_METRIC, &baseline.target_group_id).await?;
        let baseline_requests = self.query(REQUESTS_METRIC, &baseline.target_group_id).await?;
        let canary_errors = self.query(ERRORS_METRIC, &canary.target_group_id).await?;
        let canary_requests = self.query(REQUESTS_METRIC, &canary.target_group_id).await?;

        let comparison = compare_rates(
            baseline_errors,
            baseline_requests,
            canary_errors,
            canary_requests,
            self.config.max_relative_delta,
        );

        let record = AnalysisRecord {
            rollout_id: rollout_id.to_string(),
            epoch: now,
            window_secs: window.as_secs(),
            baseline_errors,
            baseline_requests,
            canary_errors,
            canary_requests,
            baseline_rate: comparison.baseline_rate,
            canary_rate: comparison.canary_rate,
            delta: comparison.delta,
            verdict: comparison.verdict,
        };

        match record.verdict {
            Verdict::Inconclusive => debug!(%rollout_id, "analysis inconclusive: no traffic"),
            verdict => info!(
                %rollout_id,
                ?verdict,
                baseline_rate = comparison.baseline_rate,
                canary_rate = comparison.canary_rate,
                delta = comparison.delta,
                "analysis run complete"
            ),
        }

        Ok(record)
    }

    async fn query(&self, metric: &str, target_group: &str) -> Result<f64, AnalysisError> {
        self.backend
            .query_count(metric, target_group, self.config.window)
            .await
            .map_err(AnalysisError::Backend)
    }
}
