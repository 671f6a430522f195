//! ramp-resolver — out-of-band resolution of target-group bindings.
//!
//! A rollout's analysis configuration needs load-balancer target-group
//! identifiers that do not exist until the rollout's first traffic-shaping
//! step has executed. The resolver breaks that cycle: once the traffic
//! object is created, a background task per rollout polls the external
//! discovery service until both the baseline and canary identifiers are
//! returned, then records them as immutable `TargetGroupBinding`s.
//!
//! Each task is cancellable (an aborted rollout must stop its poll loop)
//! and bounded by an overall timeout budget; exhausting the budget is a
//! terminal outcome for the owning rollout, while individual lookup
//! misses and errors are transient and simply retried.

pub mod resolver;

pub use resolver::{BindingResolver, DiscoveryClient, ResolveOutcome, ResolverConfig};
