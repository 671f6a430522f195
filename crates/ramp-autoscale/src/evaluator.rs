//! Policy evaluator — combines CPU, memory, and the derived signal into
//! replica-count decisions.
//!
//! Scaling is asymmetric: over-provisioning is cheap but under-provisioning
//! risks cascading overload, and instance-local caches make churn expensive.
//! Scale-up reacts within a short window with a capped step; scale-down
//! requires a long window of consistently lower desired counts and sheds
//! one replica at a time.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use ramp_state::{AutoscalingSample, ServiceSpec, StateStore};

use crate::signal::derive_signal;

/// A scaling decision for a single service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified replica count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Which replica bounds apply. Affects only the bounds, not the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityMode {
    #[default]
    Full,
    Reduced,
}

/// Callback type for performing scaling actions.
///
/// The autoscaler calls this with (service_id, target_replicas); actuation
/// is fire-and-forget from this subsystem's perspective.
pub type ScaleCallback = Box<dyn Fn(&str, u32) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Callback type for fetching the latest sample for a service.
pub type SampleCallback =
    Box<dyn Fn(&str) -> BoxFuture<anyhow::Result<AutoscalingSample>> + Send + Sync>;

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Per-service scaling state.
struct ScaleState {
    /// Last time we scaled up.
    last_scale_up: u64,
    /// Last time we scaled down.
    last_scale_down: u64,
    /// When the desired count first dropped below current, if it has
    /// stayed there since.
    below_since: Option<u64>,
    /// Highest desired count observed while below current.
    max_desired_below: u32,
}

impl ScaleState {
    fn new() -> Self {
        Self {
            last_scale_up: 0,
            last_scale_down: 0,
            below_since: None,
            max_desired_below: 0,
        }
    }

    fn reset_below(&mut self) {
        self.below_since = None;
        self.max_desired_below = 0;
    }
}

/// The autoscaler evaluates samples and decides whether to scale
/// services up or down.
pub struct Autoscaler {
    state: StateStore,
    mode: CapacityMode,
    /// Per-service scaling state (stabilization tracking).
    scale_states: HashMap<String, ScaleState>,
    /// Callback to perform scaling.
    scale_fn: Option<ScaleCallback>,
    /// Callback to fetch the latest sample for a service.
    sample_fn: Option<SampleCallback>,
}

impl Autoscaler {
    /// Create a new autoscaler.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            mode: CapacityMode::Full,
            scale_states: HashMap::new(),
            scale_fn: None,
            sample_fn: None,
        }
    }

    /// Use reduced-capacity replica bounds where a service defines them.
    pub fn with_mode(mut self, mode: CapacityMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the callback used to perform scaling.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    /// Set the callback used to fetch samples.
    pub fn with_sample_fn(mut self, f: SampleCallback) -> Self {
        self.sample_fn = Some(f);
        self
    }

    /// Evaluate a single service and return a scaling decision.
    ///
    /// `now` is the evaluation timestamp (unix seconds); passing it in
    /// keeps stabilization windows deterministic under test.
    pub fn evaluate(
        &mut self,
        spec: &ServiceSpec,
        sample: &AutoscalingSample,
        now: u64,
    ) -> ScaleDecision {
        let scaling = match &spec.scaling {
            Some(s) => s,
            None => return ScaleDecision::NoChange,
        };

        let bounds = match self.mode {
            CapacityMode::Full => spec.replicas,
            CapacityMode::Reduced => spec.reduced_replicas.unwrap_or(spec.replicas),
        };
        let current = spec.current_replicas;

        // Desired count per available metric; a missing source is excluded,
        // never a failure.
        let mut desired: Option<u32> = None;
        let mut consider = |value: f64, target: f64| {
            if target > 0.0 {
                let d = ((current as f64) * value / target).ceil() as u32;
                desired = Some(desired.map_or(d, |prev| prev.max(d)));
            }
        };
        if let Some(cpu) = sample.cpu_percent {
            consider(cpu, scaling.cpu_target_percent);
        }
        if let Some(memory) = sample.memory_percent {
            consider(memory, scaling.memory_target_percent);
        }
        if let Some(signal_cfg) = &scaling.signal
            && let Some(signal) = sample.signal
        {
            consider(signal, signal_cfg.target);
        }

        let desired = match desired {
            Some(d) => d.clamp(bounds.min, bounds.max),
            None => {
                debug!(service = %spec.id, "no metric sources available, skipping");
                return ScaleDecision::NoChange;
            }
        };

        let scale_state = self
            .scale_states
            .entry(spec.id.clone())
            .or_insert_with(ScaleState::new);

        if desired > current {
            scale_state.reset_below();

            if now.saturating_sub(scale_state.last_scale_up) < scaling.scale_up_stabilization_secs {
                return ScaleDecision::NoChange;
            }

            // Per-step increase: the smaller of doubling and +4, so noisy
            // spikes cannot overshoot while reaction stays fast.
            let step = current.min(4).max(1);
            let target = desired.min(current + step).min(bounds.max);
            if target > current {
                scale_state.last_scale_up = now;
                debug!(
                    service = %spec.id,
                    from = current,
                    to = target,
                    desired,
                    "scaling up"
                );
                return ScaleDecision::ScaleTo(target);
            }
            return ScaleDecision::NoChange;
        }

        if desired < current {
            match scale_state.below_since {
                None => {
                    scale_state.below_since = Some(now);
                    scale_state.max_desired_below = desired;
                    return ScaleDecision::NoChange;
                }
                Some(since) => {
                    scale_state.max_desired_below = scale_state.max_desired_below.max(desired);

                    if now.saturating_sub(since) < scaling.scale_down_stabilization_secs {
                        return ScaleDecision::NoChange;
                    }
                    if now.saturating_sub(scale_state.last_scale_down)
                        < scaling.scale_down_step_secs
                    {
                        return ScaleDecision::NoChange;
                    }
                    // The whole window stayed below current; shed one replica.
                    if scale_state.max_desired_below < current {
                        let target = (current - 1).max(bounds.min);
                        if target < current {
                            scale_state.last_scale_down = now;
                            debug!(
                                service = %spec.id,
                                from = current,
                                to = target,
                                desired,
                                "scaling down"
                            );
                            return ScaleDecision::ScaleTo(target);
                        }
                    }
                    return ScaleDecision::NoChange;
                }
            }
        }

        // desired == current: the window of consistently-lower counts broke.
        scale_state.reset_below();
        ScaleDecision::NoChange
    }

    /// Evaluate all services with scaling configs.
    ///
    /// Fetches the latest sample per service via the sample callback and
    /// actuates any `ScaleTo` decisions via the scale callback.
    pub async fn evaluate_all(&mut self) -> anyhow::Result<Vec<(String, ScaleDecision)>> {
        let services = self.state.list_services()?;
        let now = epoch_secs();
        let mut decisions = Vec::new();

        for spec in &services {
            if spec.scaling.is_none() {
                continue;
            }

            let sample = match &self.sample_fn {
                Some(f) => match f(&spec.id).await {
                    Ok(s) => s,
                    Err(e) => {
                        // Transient telemetry failure; retry next interval.
                        debug!(service = %spec.id, error = %e, "sample fetch failed");
                        continue;
                    }
                },
                None => continue,
            };

            let decision = self.evaluate(spec, &sample, now);

            if let ScaleDecision::ScaleTo(target) = &decision
                && let Some(ref scale_fn) = self.scale_fn
                && let Err(e) = scale_fn(&spec.id, *target).await
            {
                warn!(
                    service = %spec.id,
                    target,
                    error = %e,
                    "scaling action failed"
                );
            }

            decisions.push((spec.id.clone(), decision));
        }

        Ok(decisions)
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

/// Build a sample from raw telemetry, deriving the signal when the raw
/// windowed-minimum delay and its config are both present.
pub fn sample_from_raw(
    cpu_percent: Option<f64>,
    memory_percent: Option<f64>,
    raw_delay: Option<f64>,
    signal_cfg: Option<&ramp_state::SignalConfig>,
) -> AutoscalingSample {
    let signal = match (raw_delay, signal_cfg) {
        (Some(delay), Some(cfg)) => Some(derive_signal(delay, cfg)),
        _ => None,
    };
    AutoscalingSample {
        cpu_percent,
        memory_percent,
        signal,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramp_state::*;

    fn test_spec(current: u32) -> ServiceSpec {
        ServiceSpec {
            id: "default/api".to_string(),
            namespace: "default".to_string(),
            name: "api".to_string(),
            current_replicas: current,
            replicas: ReplicaBounds { min: 1, max: 50 },
            reduced_replicas: None,
            resources: ResourceProfile {
                cpu_request_millis: 500,
                cpu_limit_millis: 1000,
                memory_request_bytes: 256 * 1024 * 1024,
                memory_limit_bytes: 512 * 1024 * 1024,
            },
            scaling: Some(ScalingConfig {
                cpu_target_percent: 70.0,
                memory_target_percent: 80.0,
                signal: Some(SignalConfig::default()),
                scale_up_stabilization_secs: 0, // No stabilization for tests.
                scale_down_stabilization_secs: 300,
                scale_down_step_secs: 15,
            }),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn cpu_sample(cpu: f64) -> AutoscalingSample {
        AutoscalingSample {
            cpu_percent: Some(cpu),
            memory_percent: None,
            signal: None,
        }
    }

    fn scaler() -> Autoscaler {
        Autoscaler::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn no_scaling_config_returns_no_change() {
        let mut scaler = scaler();
        let mut spec = test_spec(2);
        spec.scaling = None;
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(200.0), 0),
            ScaleDecision::NoChange
        );
    }

    #[test]
    fn no_metric_sources_returns_no_change() {
        let mut scaler = scaler();
        let spec = test_spec(2);
        assert_eq!(
            scaler.evaluate(&spec, &AutoscalingSample::default(), 0),
            ScaleDecision::NoChange
        );
    }

    #[test]
    fn scale_up_when_above_target() {
        let mut scaler = scaler();
        // CPU at 140% of a 70% target with 2 replicas → wants 4.
        let decision = scaler.evaluate(&test_spec(2), &cpu_sample(140.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(4));
    }

    #[test]
    fn scale_up_capped_at_four_replicas() {
        let mut scaler = scaler();
        // CPU at 10x target with 10 replicas → wants 100, step cap is +4.
        let decision = scaler.evaluate(&test_spec(10), &cpu_sample(700.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(14));
    }

    #[test]
    fn scale_up_capped_at_doubling_when_small() {
        let mut scaler = scaler();
        // 2 replicas: doubling (+2) is smaller than +4.
        let decision = scaler.evaluate(&test_spec(2), &cpu_sample(700.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(4));
    }

    #[test]
    fn scale_up_from_one_can_always_move() {
        let mut scaler = scaler();
        let decision = scaler.evaluate(&test_spec(1), &cpu_sample(700.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(2));
    }

    #[test]
    fn scale_up_respects_stabilization_window() {
        let mut scaler = scaler();
        let mut spec = test_spec(2);
        if let Some(s) = spec.scaling.as_mut() {
            s.scale_up_stabilization_secs = 45;
        }

        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(140.0), 100),
            ScaleDecision::ScaleTo(4)
        );
        spec.current_replicas = 4;
        // 30s later: still inside the window.
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(140.0), 130),
            ScaleDecision::NoChange
        );
        // 50s later: window elapsed.
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(140.0), 150),
            ScaleDecision::ScaleTo(8)
        );
    }

    #[test]
    fn respects_max_replicas() {
        let mut scaler = scaler();
        let mut spec = test_spec(48);
        spec.replicas.max = 50;
        let decision = scaler.evaluate(&spec, &cpu_sample(700.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(50));
    }

    #[test]
    fn scale_down_requires_stabilization_then_steps_one() {
        let mut scaler = scaler();
        let spec = test_spec(10);
        let sample = cpu_sample(7.0); // Wants 1 replica.

        // First observation starts the window.
        assert_eq!(scaler.evaluate(&spec, &sample, 0), ScaleDecision::NoChange);
        // Inside the 300s window: no action.
        assert_eq!(scaler.evaluate(&spec, &sample, 150), ScaleDecision::NoChange);
        // Window elapsed: shed exactly one replica.
        assert_eq!(
            scaler.evaluate(&spec, &sample, 300),
            ScaleDecision::ScaleTo(9)
        );
    }

    #[test]
    fn scale_down_at_most_one_per_step_interval() {
        let mut scaler = scaler();
        let mut spec = test_spec(10);
        let sample = cpu_sample(7.0);

        assert_eq!(scaler.evaluate(&spec, &sample, 0), ScaleDecision::NoChange);
        assert_eq!(
            scaler.evaluate(&spec, &sample, 300),
            ScaleDecision::ScaleTo(9)
        );
        spec.current_replicas = 9;
        // 10s later: inside the 15s step spacing.
        assert_eq!(scaler.evaluate(&spec, &sample, 310), ScaleDecision::NoChange);
        // 16s later: next single step allowed.
        assert_eq!(
            scaler.evaluate(&spec, &sample, 316),
            ScaleDecision::ScaleTo(8)
        );
    }

    #[test]
    fn scale_down_window_resets_on_higher_desired() {
        let mut scaler = scaler();
        let spec = test_spec(10);

        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(7.0), 0),
            ScaleDecision::NoChange
        );
        // Load returns to target mid-window: the streak breaks.
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(70.0), 150),
            ScaleDecision::NoChange
        );
        // Low again — window restarts, so 300s from the original start is
        // not enough.
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(7.0), 200),
            ScaleDecision::NoChange
        );
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(7.0), 400),
            ScaleDecision::NoChange
        );
        assert_eq!(
            scaler.evaluate(&spec, &cpu_sample(7.0), 500),
            ScaleDecision::ScaleTo(9)
        );
    }

    #[test]
    fn scale_down_not_below_min() {
        let mut scaler = scaler();
        let mut spec = test_spec(2);
        spec.replicas.min = 2;
        let sample = cpu_sample(7.0);

        assert_eq!(scaler.evaluate(&spec, &sample, 0), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(&spec, &sample, 300), ScaleDecision::NoChange);
    }

    #[test]
    fn worst_case_metric_wins() {
        let mut scaler = scaler();
        let spec = test_spec(4);
        // CPU is idle but memory is at 2x its target.
        let sample = AutoscalingSample {
            cpu_percent: Some(10.0),
            memory_percent: Some(160.0),
            signal: None,
        };
        let decision = scaler.evaluate(&spec, &sample, 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(8));
    }

    #[test]
    fn missing_signal_does_not_block_cpu_scaling() {
        let mut scaler = scaler();
        // Signal source configured but no sample arrived; CPU alone decides.
        let decision = scaler.evaluate(&test_spec(2), &cpu_sample(140.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(4));
    }

    #[test]
    fn signal_drives_scale_up() {
        let mut scaler = scaler();
        let spec = test_spec(3);
        let sample = AutoscalingSample {
            cpu_percent: None,
            memory_percent: None,
            signal: Some(2.0), // 2x the 1.0 target.
        };
        let decision = scaler.evaluate(&spec, &sample, 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(6));
    }

    #[test]
    fn idle_signal_biases_toward_scale_down() {
        let mut scaler = scaler();
        let spec = test_spec(10);
        // Calibrated idle value: desired = ceil(10 * 0.83) = 9 < 10.
        let sample = AutoscalingSample {
            cpu_percent: None,
            memory_percent: None,
            signal: Some(0.83),
        };
        assert_eq!(scaler.evaluate(&spec, &sample, 0), ScaleDecision::NoChange);
        assert_eq!(
            scaler.evaluate(&spec, &sample, 300),
            ScaleDecision::ScaleTo(9)
        );
    }

    #[test]
    fn reduced_capacity_mode_swaps_bounds_only() {
        let mut scaler = scaler().with_mode(CapacityMode::Reduced);
        let mut spec = test_spec(2);
        spec.replicas = ReplicaBounds { min: 1, max: 50 };
        spec.reduced_replicas = Some(ReplicaBounds { min: 1, max: 3 });

        let decision = scaler.evaluate(&spec, &cpu_sample(700.0), 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn sample_from_raw_derives_signal() {
        let cfg = SignalConfig::default();
        let sample = sample_from_raw(Some(50.0), None, Some(1000.0), Some(&cfg));
        assert_eq!(sample.cpu_percent, Some(50.0));
        let signal = sample.signal.unwrap();
        assert!((signal - 0.83).abs() < 1e-9);

        // No raw delay → no derived signal.
        let sample = sample_from_raw(Some(50.0), None, None, Some(&cfg));
        assert!(sample.signal.is_none());
    }

    #[tokio::test]
    async fn evaluate_all_actuates_decisions() {
        use std::sync::{Arc, Mutex};

        let state = StateStore::open_in_memory().unwrap();
        state.put_service(&test_spec(2)).unwrap();

        let actuated: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = actuated.clone();

        let mut scaler = Autoscaler::new(state)
            .with_sample_fn(Box::new(|_id| {
                Box::pin(async { Ok::<_, anyhow::Error>(cpu_sample_owned(140.0)) })
            }))
            .with_scale_fn(Box::new(move |id, target| {
                let sink = sink.clone();
                let id = id.to_string();
                Box::pin(async move {
                    sink.lock().unwrap().push((id, target));
                    Ok::<_, anyhow::Error>(())
                })
            }));

        let decisions = scaler.evaluate_all().await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].1, ScaleDecision::ScaleTo(4));
        assert_eq!(
            actuated.lock().unwrap().as_slice(),
            &[("default/api".to_string(), 4)]
        );
    }

    fn cpu_sample_owned(cpu: f64) -> AutoscalingSample {
        AutoscalingSample {
            cpu_percent: Some(cpu),
            memory_percent: None,
            signal: None,
        }
    }
}
