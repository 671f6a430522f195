//! redb table definitions for the Ramp state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{namespace}/{name}` or
//! `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Service specs keyed by `{namespace}/{name}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Rollouts keyed by rollout id.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Active (non-terminal) rollout id per service, keyed by service id.
///
/// This is the explicit "service → current rollout" map; a service may
/// have at most one entry here at any time.
pub const ACTIVE_ROLLOUTS: TableDefinition<&str, &str> = TableDefinition::new("active_rollouts");

/// Target-group bindings keyed by `{service_id}:{population}`.
pub const BINDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("bindings");

/// Analysis records keyed by `{rollout_id}:{epoch}`.
pub const ANALYSES: TableDefinition<&str, &[u8]> = TableDefinition::new("analyses");
