//! Rollout controller — drives the rollout state machine.
//!
//! Each rollout is owned by a single controller task; a tick loads the
//! rollout from the store, applies at most one transition, and writes it
//! back. The controller owns the consecutive-failure counter (the analysis
//! engine is stateless per call) and is the only writer of rollout state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ramp_analysis::AnalysisEngine;
use ramp_resolver::{BindingResolver, ResolveOutcome};
use ramp_state::{
    AbortReason, Rollout, RolloutStatus, RolloutStep, StateStore, TargetGroupBinding, Verdict,
};

use crate::builder;
use crate::config::RolloutConfig;
use crate::error::RolloutError;

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Interface to the external traffic router.
///
/// The controller only computes and submits desired weights and the
/// target-group-to-population mapping; it never performs the routing.
pub trait TrafficRouter: Send + Sync {
    fn set_weights(
        &self,
        service_id: &str,
        baseline_weight: u32,
        canary_weight: u32,
        bindings: &[TargetGroupBinding],
    ) -> BoxFuture<anyhow::Result<()>>;
}

/// Interface to the external notification sink. Receives exactly one
/// event per rollout, on reaching a terminal state.
pub trait Notifier: Send + Sync {
    fn notify(&self, rollout_id: &str, outcome: &RolloutStatus) -> BoxFuture<()>;
}

/// Per-rollout controller task state.
struct ControllerSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Orchestrates weight changes, pauses, analysis invocation, and
/// promote/abort decisions for all rollouts.
pub struct RolloutController {
    state: StateStore,
    resolver: Arc<BindingResolver>,
    engine: Arc<AnalysisEngine>,
    router: Arc<dyn TrafficRouter>,
    notifier: Arc<dyn Notifier>,
    config: RolloutConfig,
    /// Active controller tasks: rollout_id → slot.
    slots: Arc<RwLock<HashMap<String, ControllerSlot>>>,
}

impl RolloutController {
    pub fn new(
        state: StateStore,
        resolver: Arc<BindingResolver>,
        engine: Arc<AnalysisEngine>,
        router: Arc<dyn TrafficRouter>,
        notifier: Arc<dyn Notifier>,
        config: RolloutConfig,
    ) -> Self {
        Self {
            state,
            resolver,
            engine,
            router,
            notifier,
            config,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Apply at most one state transition to a rollout.
    ///
    /// `now` is the tick timestamp (unix seconds); the driving loop passes
    /// the wall clock, tests pass explicit values.
    pub async fn tick(&self, rollout_id: &str, now: u64) -> Result<(), RolloutError> {
        let mut rollout = self
            .state
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;

        if rollout.is_terminal() {
            return Ok(());
        }

        // A resolution timeout is terminal for the rollout, with a reason
        // operators can tell apart from a failed analysis.
        if self.resolver.outcome(rollout_id).await == Some(ResolveOutcome::TimedOut) {
            return self
                .finish(&mut rollout, RolloutStatus::Aborted {
                    reason: AbortReason::ResolutionTimeout,
                }, now)
                .await;
        }

        match rollout.status.clone() {
            RolloutStatus::Progressing => self.tick_progressing(&mut rollout, now).await,
            RolloutStatus::Paused => self.tick_paused(&mut rollout, now).await,
            RolloutStatus::Analyzing => self.tick_analyzing(&mut rollout, now).await,
            RolloutStatus::Promoted | RolloutStatus::Aborted { .. } => Ok(()),
        }
    }

    async fn tick_progressing(&self, rollout: &mut Rollout, now: u64) -> Result<(), RolloutError> {
        let Some(step) = rollout.current_step().cloned() else {
            // Ran out of steps; the last weight-set reached 100.
            return self.finish(rollout, RolloutStatus::Promoted, now).await;
        };

        match step {
            RolloutStep::SetWeight { percent } => {
                if let Err(e) = self.apply_weight(rollout, percent).await {
                    // Transient router failure; retry on the next tick.
                    warn!(rollout = %rollout.id, percent, error = %e, "weight change failed");
                    return Ok(());
                }

                let first_weight = rollout.step_index == 0;
                rollout.canary_weight = percent;
                rollout.step_index += 1;
                rollout.updated_at = now;
                info!(rollout = %rollout.id, percent, "canary weight set");

                if first_weight {
                    // The traffic-shaping object now exists, so the load
                    // balancer can materialize target groups.
                    let (namespace, service) = split_service_id(&rollout.service_id);
                    self.resolver
                        .start_resolve(&rollout.id, namespace, service)
                        .await;
                }

                if percent >= 100 {
                    return self.finish(rollout, RolloutStatus::Promoted, now).await;
                }
                self.state.put_rollout(rollout)?;
                Ok(())
            }
            RolloutStep::Pause { .. } => {
                rollout.status = RolloutStatus::Paused;
                rollout.paused_at = Some(now);
                rollout.updated_at = now;
                self.state.put_rollout(rollout)?;
                debug!(rollout = %rollout.id, "rollout paused");
                Ok(())
            }
            RolloutStep::Analysis => {
                // Never analyze with unresolved bindings.
                if self.state.resolved_bindings(&rollout.service_id)?.is_none() {
                    warn!(rollout = %rollout.id, "analysis step with unresolved bindings");
                    rollout.status = RolloutStatus::Paused;
                    rollout.paused_at = Some(now);
                    self.state.put_rollout(rollout)?;
                    return Ok(());
                }
                rollout.status = RolloutStatus::Analyzing;
                rollout.passes_at_step = 0;
                rollout.last_analysis_at = None;
                rollout.updated_at = now;
                self.state.put_rollout(rollout)?;
                info!(rollout = %rollout.id, "analysis started");
                Ok(())
            }
        }
    }

    async fn tick_paused(&self, rollout: &mut Rollout, now: u64) -> Result<(), RolloutError> {
        let pause_seconds = match rollout.current_step() {
            Some(RolloutStep::Pause { seconds }) => *seconds,
            // Parked here from an analysis step whose bindings were not
            // resolved. Hold position until they are; Progressing then
            // re-runs the gate at the same step index.
            _ => {
                if self.state.resolved_bindings(&rollout.service_id)?.is_some() {
                    rollout.status = RolloutStatus::Progressing;
                    rollout.paused_at = None;
                    rollout.updated_at = now;
                    self.state.put_rollout(rollout)?;
                    debug!(rollout = %rollout.id, "bindings resolved, resuming");
                }
                return Ok(());
            }
        };
        let paused_at = rollout.paused_at.unwrap_or(now);
        if now.saturating_sub(paused_at) < pause_seconds {
            return Ok(());
        }

        if !rollout.analysis_attached {
            // Second phase of construction: patch analysis steps in once
            // both bindings exist. Until then the rollout stays here —
            // Paused is the only sanctioned wait state.
            if self.state.resolved_bindings(&rollout.service_id)?.is_none() {
                debug!(rollout = %rollout.id, "pause elapsed, awaiting binding resolution");
                return Ok(());
            }
            *rollout = builder::attach_analysis(&self.state, &rollout.id)?;
        }

        rollout.step_index += 1;
        rollout.paused_at = None;
        rollout.status = RolloutStatus::Progressing;
        rollout.updated_at = now;
        self.state.put_rollout(rollout)?;
        debug!(rollout = %rollout.id, "pause elapsed");
        Ok(())
    }

    async fn tick_analyzing(&self, rollout: &mut Rollout, now: u64) -> Result<(), RolloutError> {
        let interval = self.engine.config().interval.as_secs();
        if let Some(last) = rollout.last_analysis_at
            && now.saturating_sub(last) < interval
        {
            return Ok(());
        }

        let Some((baseline, canary)) = self.state.resolved_bindings(&rollout.service_id)? else {
            // Unreachable via normal transitions; fall back to the wait state.
            warn!(rollout = %rollout.id, "analyzing with unresolved bindings");
            rollout.status = RolloutStatus::Paused;
            rollout.paused_at = Some(now);
            self.state.put_rollout(rollout)?;
            return Ok(());
        };

        let record = match self.engine.analyze(&rollout.id, &baseline, &canary, now).await {
            Ok(record) => record,
            Err(e) => {
                // Transient backend failure: retry next interval, never abort.
                warn!(rollout = %rollout.id, error = %e, "analysis query failed");
                rollout.last_analysis_at = Some(now);
                self.state.put_rollout(rollout)?;
                return Ok(());
            }
        };

        if let Err(e) = self.state.put_analysis(&record) {
            error!(rollout = %rollout.id, error = %e, "failed to store analysis record");
        }
        rollout.last_analysis_at = Some(now);
        rollout.updated_at = now;

        match record.verdict {
            Verdict::Pass => {
                rollout.consecutive_failures = 0;
                rollout.passes_at_step += 1;
                if rollout.passes_at_step >= self.config.required_passes {
                    rollout.passes_at_step = 0;
                    rollout.step_index += 1;
                    rollout.status = RolloutStatus::Progressing;
                    info!(rollout = %rollout.id, "analysis gate passed, advancing");
                }
                self.state.put_rollout(rollout)?;
                Ok(())
            }
            Verdict::Fail => {
                rollout.consecutive_failures += 1;
                if rollout.consecutive_failures >= self.config.failure_limit {
                    warn!(
                        rollout = %rollout.id,
                        failures = rollout.consecutive_failures,
                        "failure limit reached, aborting"
                    );
                    return self
                        .finish(rollout, RolloutStatus::Aborted {
                            reason: AbortReason::AnalysisFailed,
                        }, now)
                        .await;
                }
                self.state.put_rollout(rollout)?;
                Ok(())
            }
            Verdict::Inconclusive => {
                // No traffic is not evidence of regression; the failure
                // tally is untouched.
                self.state.put_rollout(rollout)?;
                Ok(())
            }
        }
    }

    /// Abort a rollout (operator action). No-op on terminal rollouts.
    pub async fn abort(&self, rollout_id: &str, now: u64) -> Result<(), RolloutError> {
        let mut rollout = self
            .state
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;
        if rollout.is_terminal() {
            return Ok(());
        }
        self.finish(&mut rollout, RolloutStatus::Aborted {
            reason: AbortReason::Manual,
        }, now)
        .await
    }

    /// Drive a rollout to a terminal state: revert or confirm weights,
    /// release the service's active slot, stop resolution, notify once.
    async fn finish(
        &self,
        rollout: &mut Rollout,
        outcome: RolloutStatus,
        now: u64,
    ) -> Result<(), RolloutError> {
        if let RolloutStatus::Aborted { reason } = &outcome {
            // Canary traffic reverts immediately; a router failure here
            // must not keep the rollout alive.
            if let Err(e) = self.apply_weight(rollout, 0).await {
                error!(rollout = %rollout.id, error = %e, "failed to revert weights on abort");
            }
            rollout.canary_weight = 0;
            warn!(rollout = %rollout.id, %reason, "rollout aborted");
        } else {
            info!(rollout = %rollout.id, "rollout promoted");
        }

        rollout.status = outcome.clone();
        rollout.updated_at = now;
        self.state.put_rollout(rollout)?;

        self.resolver.cancel(&rollout.id).await;
        self.notifier.notify(&rollout.id, &outcome).await;
        Ok(())
    }

    async fn apply_weight(&self, rollout: &Rollout, percent: u32) -> anyhow::Result<()> {
        let bindings: Vec<TargetGroupBinding> = self
            .state
            .resolved_bindings(&rollout.service_id)?
            .map(|(b, c)| vec![b, c])
            .unwrap_or_default();
        self.router
            .set_weights(&rollout.service_id, 100 - percent, percent, &bindings)
            .await
    }

    // ── Driving loops ──────────────────────────────────────────────

    /// Start the owning task for a rollout. Each rollout's transitions are
    /// processed by exactly one task; starting again replaces the old one.
    pub async fn start(self: &Arc<Self>, rollout_id: &str) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let controller = self.clone();
        let id = rollout_id.to_string();

        // Hold the slot lock across spawn + insert so the task cannot
        // observe the map before its own entry exists.
        let mut slots = self.slots.write().await;
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(controller.config.tick_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match controller.tick(&id, epoch_secs()).await {
                            Ok(()) => {
                                let done = controller
                                    .state
                                    .get_rollout(&id)
                                    .ok()
                                    .flatten()
                                    .is_none_or(|r| r.is_terminal());
                                if done {
                                    debug!(rollout = %id, "controller loop finished");
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(rollout = %id, error = %e, "tick failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(rollout = %id, "controller loop shutting down");
                        break;
                    }
                }
            }
            controller.slots.write().await.remove(&id);
        });

        if let Some(old) = slots.insert(
            rollout_id.to_string(),
            ControllerSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        drop(slots);
        info!(rollout = %rollout_id, "rollout controller started");
    }

    /// Stop the owning task for a rollout.
    pub async fn stop(&self, rollout_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(rollout_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(rollout = %rollout_id, "rollout controller stopped");
        }
    }

    /// Stop all tasks (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(rollout = %id, "rollout controller stopped");
        }
        self.resolver.cancel_all().await;
        info!("all rollout controllers stopped");
    }
}

/// Split a `{namespace}/{name}` service id.
fn split_service_id(service_id: &str) -> (&str, &str) {
    service_id.split_once('/').unwrap_or(("default", service_id))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
