//! Binding resolver — background polling tasks keyed by rollout id.
//!
//! The `BindingResolver` spawns one task per rollout that repeatedly asks
//! the discovery service for the baseline and canary target-group
//! identifiers, persisting each binding as soon as it appears. The task
//! finishes when both populations are resolved or the timeout budget
//! elapses, and records the outcome for the rollout controller to pick up
//! on its next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ramp_state::{Population, StateStore, TargetGroupBinding};

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Lookup interface to the external target-group discovery service.
///
/// Given (namespace, service name, population tag), returns zero or one
/// identifier string. The backing service is eventually consistent, so a
/// miss now may be a hit on the next attempt; lookups must be idempotent.
pub trait DiscoveryClient: Send + Sync {
    fn lookup(
        &self,
        namespace: &str,
        service: &str,
        population: Population,
    ) -> BoxFuture<anyhow::Result<Option<String>>>;
}

/// How a resolution task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Both bindings resolved and were persisted.
    Resolved,
    /// The timeout budget elapsed with at least one binding missing.
    /// Terminal for the owning rollout.
    TimedOut,
}

/// Resolver timing parameters.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Spacing between lookup rounds.
    pub poll_interval: Duration,
    /// Overall budget before resolution is declared failed.
    pub timeout_budget: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout_budget: Duration::from_secs(300),
        }
    }
}

/// Per-rollout resolution task state.
struct ResolveSlot {
    /// Handle to the background polling task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this task.
    shutdown_tx: watch::Sender<bool>,
}

/// Manages binding-resolution tasks for all in-flight rollouts.
pub struct BindingResolver {
    state: StateStore,
    discovery: Arc<dyn DiscoveryClient>,
    config: ResolverConfig,
    /// Active tasks: rollout_id → slot.
    slots: Arc<RwLock<HashMap<String, ResolveSlot>>>,
    /// Finished tasks: rollout_id → outcome.
    outcomes: Arc<RwLock<HashMap<String, ResolveOutcome>>>,
}

impl BindingResolver {
    /// Create a new resolver.
    pub fn new(state: StateStore, discovery: Arc<dyn DiscoveryClient>) -> Self {
        Self::with_config(state, discovery, ResolverConfig::default())
    }

    /// Create a resolver with explicit timing parameters.
    pub fn with_config(
        state: StateStore,
        discovery: Arc<dyn DiscoveryClient>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            state,
            discovery,
            config,
            slots: Arc::new(RwLock::new(HashMap::new())),
            outcomes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start resolving bindings for a rollout's service.
    ///
    /// Call after the rollout's traffic-shaping object exists — the load
    /// balancer does not materialize target groups before that point.
    /// Starting again for the same rollout replaces the previous task.
    pub async fn start_resolve(&self, rollout_id: &str, namespace: &str, service: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let id = rollout_id.to_string();
        let ns = namespace.to_string();
        let svc = service.to_string();
        let state = self.state.clone();
        let discovery = self.discovery.clone();
        let config = self.config.clone();
        let outcomes = self.outcomes.clone();
        let task_slots = self.slots.clone();

        self.outcomes.write().await.remove(rollout_id);

        // Hold the slot lock across spawn + insert so the task cannot
        // observe the map before its own entry exists.
        let mut slots = self.slots.write().await;
        let handle = tokio::spawn(async move {
            run_resolve_loop(
                &id, &ns, &svc, state, discovery, config, outcomes, shutdown_rx,
            )
            .await;
            task_slots.write().await.remove(&id);
        });

        if let Some(old) = slots.insert(
            rollout_id.to_string(),
            ResolveSlot {
                handle,
                shutdown_tx,
            },
        ) {
            // Stop the old task if one was running.
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        drop(slots);

        info!(%rollout_id, %namespace, %service, "binding resolution started");
    }

    /// Cancel the resolution task for a rollout (e.g. manual abort) and
    /// discard any recorded outcome.
    pub async fn cancel(&self, rollout_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(rollout_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%rollout_id, "binding resolution cancelled");
        }
        drop(slots);
        self.outcomes.write().await.remove(rollout_id);
    }

    /// Cancel all tasks (for graceful shutdown).
    pub async fn cancel_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(rollout_id = %id, "binding resolution cancelled");
        }
        drop(slots);
        self.outcomes.write().await.clear();
        info!("all binding resolutions cancelled");
    }

    /// The outcome of a finished resolution task, if any.
    pub async fn outcome(&self, rollout_id: &str) -> Option<ResolveOutcome> {
        self.outcomes.read().await.get(rollout_id).copied()
    }

    /// List rollout ids with resolution tasks (finished or not).
    pub async fn active_resolvers(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        slots.keys().cloned().collect()
    }
}

/// The polling loop for a single rollout.
#[allow(clippy::too_many_arguments)]
async fn run_resolve_loop(
    rollout_id: &str,
    namespace: &str,
    service: &str,
    state: StateStore,
    discovery: Arc<dyn DiscoveryClient>,
    config: ResolverConfig,
    outcomes: Arc<RwLock<HashMap<String, ResolveOutcome>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let service_id = format!("{namespace}/{service}");
    let started = Instant::now();

    debug!(%rollout_id, %service_id, "resolve loop starting");

    loop {
        let mut missing = 0;
        for population in [Population::Baseline, Population::Canary] {
            let already = state
                .get_binding(&service_id, population)
                .ok()
                .flatten()
                .is_some();
            if already {
                continue;
            }

            match discovery.lookup(namespace, service, population).await {
                Ok(Some(target_group_id)) => {
                    let binding = TargetGroupBinding {
                        service_id: service_id.clone(),
                        population,
                        target_group_id: target_group_id.clone(),
                        resolved_at: epoch_secs(),
                    };
                    match state.put_binding(&binding) {
                        Ok(()) => {
                            info!(
                                %rollout_id,
                                %service_id,
                                %population,
                                target_group = %target_group_id,
                                "binding resolved"
                            );
                        }
                        Err(e) => {
                            error!(%rollout_id, %population, error = %e, "failed to store binding");
                            missing += 1;
                        }
                    }
                }
                Ok(None) => {
                    debug!(%rollout_id, %population, "target group not yet assigned");
                    missing += 1;
                }
                Err(e) => {
                    // Transient: eventual consistency or a timed-out call.
                    debug!(%rollout_id, %population, error = %e, "lookup failed, will retry");
                    missing += 1;
                }
            }
        }

        if missing == 0 {
            outcomes
                .write()
                .await
                .insert(rollout_id.to_string(), ResolveOutcome::Resolved);
            info!(%rollout_id, %service_id, "both bindings resolved");
            break;
        }

        if started.elapsed() >= config.timeout_budget {
            outcomes
                .write()
                .await
                .insert(rollout_id.to_string(), ResolveOutcome::TimedOut);
            warn!(
                %rollout_id,
                %service_id,
                waited_secs = started.elapsed().as_secs(),
                "binding resolution timed out"
            );
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                debug!(%rollout_id, "resolve loop shutting down");
                break;
            }
        }
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
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Discovery stub that starts returning identifiers after a number of
    /// misses, mimicking eventual consistency.
    struct FakeDiscovery {
        calls: AtomicU32,
        ready_after: u32,
        fail_first: u32,
    }

    impl FakeDiscovery {
        fn new(ready_after: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_after,
                fail_first: 0,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl DiscoveryClient for FakeDiscovery {
        fn lookup(
            &self,
            _namespace: &str,
            _service: &str,
            population: Population,
        ) -> BoxFuture<anyhow::Result<Option<String>>> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            let fail = n < self.fail_first;
            let ready = n >= self.ready_after;
            Box::pin(async move {
                if fail {
                    anyhow::bail!("discovery unavailable");
                }
                if ready {
                    Ok(Some(format!("tg-{population}")))
                } else {
                    Ok(None)
                }
            })
        }
    }

    fn fast_config(budget_ms: u64) -> ResolverConfig {
        ResolverConfig {
            poll_interval: Duration::from_millis(5),
            timeout_budget: Duration::from_millis(budget_ms),
        }
    }

    async fn wait_for_outcome(resolver: &BindingResolver, rollout_id: &str) -> ResolveOutcome {
        for _ in 0..500 {
            if let Some(outcome) = resolver.outcome(rollout_id).await {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("resolution did not finish");
    }

    #[tokio::test]
    async fn resolves_both_populations() {
        let state = StateStore::open_in_memory().unwrap();
        let resolver = BindingResolver::with_config(
            state.clone(),
            Arc::new(FakeDiscovery::new(0)),
            fast_config(5000),
        );

        resolver.start_resolve("ro-1", "default", "api").await;
        assert_eq!(
            wait_for_outcome(&resolver, "ro-1").await,
            ResolveOutcome::Resolved
        );

        let (baseline, canary) = state.resolved_bindings("default/api").unwrap().unwrap();
        assert_eq!(baseline.target_group_id, "tg-baseline");
        assert_eq!(canary.target_group_id, "tg-canary");
    }

    #[tokio::test]
    async fn eventual_consistency_is_retried() {
        let state = StateStore::open_in_memory().unwrap();
        // First three lookups miss before identifiers appear.
        let resolver = BindingResolver::with_config(
            state.clone(),
            Arc::new(FakeDiscovery::new(3)),
            fast_config(5000),
        );

        resolver.start_resolve("ro-1", "default", "api").await;
        assert_eq!(
            wait_for_outcome(&resolver, "ro-1").await,
            ResolveOutcome::Resolved
        );
        assert!(state.resolved_bindings("default/api").unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_lookup_errors_are_retried() {
        let state = StateStore::open_in_memory().unwrap();
        let discovery = Arc::new(FakeDiscovery {
            calls: AtomicU32::new(0),
            ready_after: 4,
            fail_first: 4,
        });
        let resolver =
            BindingResolver::with_config(state.clone(), discovery, fast_config(5000));

        resolver.start_resolve("ro-1", "default", "api").await;
        assert_eq!(
            wait_for_outcome(&resolver, "ro-1").await,
            ResolveOutcome::Resolved
        );
    }

    #[tokio::test]
    async fn timeout_budget_is_terminal() {
        let state = StateStore::open_in_memory().unwrap();
        // Discovery never returns identifiers.
        let resolver = BindingResolver::with_config(
            state.clone(),
            Arc::new(FakeDiscovery::new(u32::MAX)),
            fast_config(20),
        );

        resolver.start_resolve("ro-1", "default", "api").await;
        assert_eq!(
            wait_for_outcome(&resolver, "ro-1").await,
            ResolveOutcome::TimedOut
        );
        // Nothing was written: analysis must never see partial bindings.
        assert!(state.resolved_bindings("default/api").unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_stops_polling() {
        let state = StateStore::open_in_memory().unwrap();
        let discovery = Arc::new(FakeDiscovery::new(u32::MAX));
        let resolver = BindingResolver::with_config(
            state.clone(),
            discovery.clone(),
            fast_config(60_000),
        );

        resolver.start_resolve("ro-1", "default", "api").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.cancel("ro-1").await;

        let after_cancel = discovery.call_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(discovery.call_count(), after_cancel);
        assert!(resolver.outcome("ro-1").await.is_none());
        assert!(resolver.active_resolvers().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_stops_every_task() {
        let state = StateStore::open_in_memory().unwrap();
        let resolver = BindingResolver::with_config(
            state,
            Arc::new(FakeDiscovery::new(u32::MAX)),
            fast_config(60_000),
        );

        resolver.start_resolve("ro-1", "default", "api").await;
        resolver.start_resolve("ro-2", "default", "web").await;
        assert_eq!(resolver.active_resolvers().await.len(), 2);

        resolver.cancel_all().await;
        assert!(resolver.active_resolvers().await.is_empty());
    }

    #[tokio::test]
    async fn finished_task_prunes_its_slot() {
        let state = StateStore::open_in_memory().unwrap();
        let resolver = BindingResolver::with_config(
            state,
            Arc::new(FakeDiscovery::new(0)),
            fast_config(5000),
        );

        resolver.start_resolve("ro-1", "default", "api").await;
        assert_eq!(
            wait_for_outcome(&resolver, "ro-1").await,
            ResolveOutcome::Resolved
        );

        // The task removes its own slot once the loop finishes.
        for _ in 0..500 {
            if resolver.active_resolvers().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(resolver.active_resolvers().await.is_empty());

        // Cancel discards the recorded outcome.
        resolver.cancel("ro-1").await;
        assert!(resolver.outcome("ro-1").await.is_none());
    }

    #[tokio::test]
    async fn pre_resolved_binding_is_reused() {
        let state = StateStore::open_in_memory().unwrap();
        // Baseline already resolved by an earlier attempt.
        state
            .put_binding(&TargetGroupBinding {
                service_id: "default/api".to_string(),
                population: Population::Baseline,
                target_group_id: "tg-preexisting".to_string(),
                resolved_at: 1000,
            })
            .unwrap();

        let resolver = BindingResolver::with_config(
            state.clone(),
            Arc::new(FakeDiscovery::new(0)),
            fast_config(5000),
        );
        resolver.start_resolve("ro-1", "default", "api").await;
        assert_eq!(
            wait_for_outcome(&resolver, "ro-1").await,
            ResolveOutcome::Resolved
        );

        // The resolved baseline identifier was not overwritten.
        let (baseline, _) = state.resolved_bindings("default/api").unwrap().unwrap();
        assert_eq!(baseline.target_group_id, "tg-preexisting");
    }
}
