//! Two-phase rollout construction.
//!
//! Phase one (`submit`) creates and persists a rollout whose step program
//! contains weight-set and pause steps only. Phase two (`attach_analysis`)
//! patches analysis steps into the program once both target-group bindings
//! have resolved. The split exists because the analysis configuration
//! references identifiers that the load balancer assigns only after the
//! first weight-set has executed; collapsing the two phases into one pass
//! would reintroduce that circular dependency.

use tracing::info;

use ramp_state::{
    Rollout, RolloutStatus, RolloutStep, ServiceSpec, StateError, StateStore,
};

use crate::config::RolloutConfig;
use crate::error::RolloutError;

/// Create and persist a rollout for a service version change.
///
/// The step program interleaves each weight below 100 with a pause; no
/// analysis steps are present yet. Fails with `AlreadyActive` if the
/// service's active-rollout slot is taken.
pub fn submit(
    store: &StateStore,
    service: &ServiceSpec,
    old_version: &str,
    new_version: &str,
    config: &RolloutConfig,
    now: u64,
) -> Result<Rollout, RolloutError> {
    let mut steps = Vec::new();
    for &percent in &config.weight_ladder {
        steps.push(RolloutStep::SetWeight { percent });
        if percent < 100 {
            steps.push(RolloutStep::Pause {
                seconds: config.pause_seconds,
            });
        }
    }
    if !matches!(steps.last(), Some(RolloutStep::SetWeight { percent: 100 })) {
        steps.push(RolloutStep::SetWeight { percent: 100 });
    }

    let rollout = Rollout {
        id: format!("{}@{}", service.id, new_version),
        service_id: service.id.clone(),
        old_version: old_version.to_string(),
        new_version: new_version.to_string(),
        steps,
        step_index: 0,
        status: RolloutStatus::Progressing,
        canary_weight: 0,
        analysis_attached: false,
        consecutive_failures: 0,
        passes_at_step: 0,
        paused_at: None,
        last_analysis_at: None,
        created_at: now,
        updated_at: now,
    };

    match store.put_rollout(&rollout) {
        Ok(()) => {}
        Err(StateError::Conflict(_)) => {
            return Err(RolloutError::AlreadyActive(service.id.clone()));
        }
        Err(e) => return Err(e.into()),
    }

    info!(
        rollout = %rollout.id,
        service = %service.id,
        old = %old_version,
        new = %new_version,
        steps = rollout.steps.len(),
        "rollout submitted"
    );
    Ok(rollout)
}

/// Patch analysis steps into a submitted rollout.
///
/// Inserts one `Analysis` step after every pause. Requires both
/// target-group bindings to be resolved; callable exactly once.
pub fn attach_analysis(store: &StateStore, rollout_id: &str) -> Result<Rollout, RolloutError> {
    let mut rollout = store
        .get_rollout(rollout_id)?
        .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;

    if rollout.analysis_attached {
        return Err(RolloutError::AnalysisAlreadyAttached(rollout_id.to_string()));
    }
    if store.resolved_bindings(&rollout.service_id)?.is_none() {
        return Err(RolloutError::BindingsUnresolved(rollout.service_id.clone()));
    }

    let mut steps = Vec::with_capacity(rollout.steps.len() * 2);
    for step in rollout.steps.drain(..) {
        let is_pause = matches!(step, RolloutStep::Pause { .. });
        steps.push(step);
        if is_pause {
            steps.push(RolloutStep::Analysis);
        }
    }
    rollout.steps = steps;
    rollout.analysis_attached = true;
    store.put_rollout(&rollout)?;

    info!(rollout = %rollout_id, "analysis steps attached");
    Ok(rollout)
}
