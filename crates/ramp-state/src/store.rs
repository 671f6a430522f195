//! StateStore — redb-backed state persistence for Ramp.
//!
//! Provides typed CRUD operations over services, rollouts, target-group
//! bindings, and analysis records. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Two rules are enforced at the write boundary rather than by callers:
//! a service holds at most one non-terminal rollout, and a resolved
//! target-group binding is immutable.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE_ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        txn.open_table(ANALYSES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service spec.
    pub fn put_service(&self, spec: &ServiceSpec) -> StateResult<()> {
        let key = spec.table_key();
        let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "service stored");
        Ok(())
    }

    /// Get a service by namespace/name key.
    pub fn get_service(&self, key: &str) -> StateResult<Option<ServiceSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let spec: ServiceSpec =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(spec))
            }
            None => Ok(None),
        }
    }

    /// List all services.
    pub fn list_services(&self) -> StateResult<Vec<ServiceSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let spec: ServiceSpec =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(spec);
        }
        Ok(results)
    }

    /// Delete a service by key. Returns true if it existed.
    pub fn delete_service(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "service deleted");
        Ok(existed)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert or update a rollout, maintaining the active-rollout slot.
    ///
    /// Writing a non-terminal rollout claims the service's slot; writing
    /// it while another rollout holds the slot is a `Conflict`. Writing a
    /// terminal rollout releases the slot.
    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        let value = serde_json::to_vec(rollout).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut active = txn.open_table(ACTIVE_ROLLOUTS).map_err(map_err!(Table))?;
            let holder = active
                .get(rollout.service_id.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());

            if rollout.is_terminal() {
                if holder.as_deref() == Some(rollout.id.as_str()) {
                    active
                        .remove(rollout.service_id.as_str())
                        .map_err(map_err!(Write))?;
                }
            } else {
                if let Some(existing) = holder
                    && existing != rollout.id
                {
                    return Err(StateError::Conflict(format!(
                        "service {} already has active rollout {existing}",
                        rollout.service_id
                    )));
                }
                active
                    .insert(rollout.service_id.as_str(), rollout.id.as_str())
                    .map_err(map_err!(Write))?;
            }

            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(rollout.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = %rollout.id, service = %rollout.service_id, "rollout stored");
        Ok(())
    }

    /// Get a rollout by id.
    pub fn get_rollout(&self, id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Ok(None),
        }
    }

    /// Get the active (non-terminal) rollout for a service, if any.
    pub fn get_active_rollout(&self, service_id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_ROLLOUTS).map_err(map_err!(Table))?;
        let rollout_id = match active.get(service_id).map_err(map_err!(Read))? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(rollout_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Err(StateError::NotFound(format!(
                "active rollout {rollout_id} for service {service_id}"
            ))),
        }
    }

    /// List all rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rollout);
        }
        Ok(results)
    }

    // ── Target-group bindings ──────────────────────────────────────

    /// Store a resolved binding.
    ///
    /// Re-writing the same identifier is idempotent (discovery lookups are
    /// retried); writing a different identifier for an already-resolved
    /// binding is a `Conflict`.
    pub fn put_binding(&self, binding: &TargetGroupBinding) -> StateResult<()> {
        let key = binding.table_key();
        let value = serde_json::to_vec(binding).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            // Existence check inside the write transaction: concurrent
            // writers serialize here, so the immutability rule holds.
            let existing = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<TargetGroupBinding>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            if let Some(existing) = existing {
                if existing.target_group_id == binding.target_group_id {
                    return Ok(());
                }
                return Err(StateError::Conflict(format!(
                    "binding {key} already resolved to {}",
                    existing.target_group_id
                )));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, target_group = %binding.target_group_id, "binding stored");
        Ok(())
    }

    /// Get the binding for one population of a service.
    pub fn get_binding(
        &self,
        service_id: &str,
        population: Population,
    ) -> StateResult<Option<TargetGroupBinding>> {
        let key = binding_key(service_id, population);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let binding: TargetGroupBinding =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(binding))
            }
            None => Ok(None),
        }
    }

    /// Get the (baseline, canary) binding pair, present only when both
    /// populations have resolved.
    pub fn resolved_bindings(
        &self,
        service_id: &str,
    ) -> StateResult<Option<(TargetGroupBinding, TargetGroupBinding)>> {
        let baseline = self.get_binding(service_id, Population::Baseline)?;
        let canary = self.get_binding(service_id, Population::Canary)?;
        match (baseline, canary) {
            (Some(b), Some(c)) => Ok(Some((b, c))),
            _ => Ok(None),
        }
    }

    /// Delete both bindings for a service (rollout teardown). Returns the
    /// number of bindings removed.
    pub fn delete_bindings(&self, service_id: &str) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            for population in [Population::Baseline, Population::Canary] {
                let key = binding_key(service_id, population);
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Analysis records ───────────────────────────────────────────

    /// Store an analysis record.
    pub fn put_analysis(&self, record: &AnalysisRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ANALYSES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List the most recent analysis records for a rollout, newest first.
    pub fn list_analyses_for_rollout(
        &self,
        rollout_id: &str,
        limit: usize,
    ) -> StateResult<Vec<AnalysisRecord>> {
        let prefix = format!("{rollout_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ANALYSES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let record: AnalysisRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        results.sort_by(|a, b| b.epoch.cmp(&a.epoch));
        results.truncate(limit);
        Ok(results)
    }
}
