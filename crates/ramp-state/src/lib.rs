//! ramp-state — embedded state store for the Ramp rollout controller.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for services, rollouts, target-group bindings, and
//! analysis records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{name}`, `{service_id}:{population}`) enable
//! efficient prefix scans for related records. The active-rollout table maps
//! each service id to its single non-terminal rollout, so "current state of
//! all rollouts" is an explicit keyed store rather than ambient state.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
