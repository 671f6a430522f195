//! ramp-autoscale — metrics-driven replica scaling.
//!
//! Derives a bounded queueing-delay signal, combines it with CPU and
//! memory utilization, and emits replica-count decisions with asymmetric
//! scale-up/scale-down behavior. The actual scaling is performed by a
//! callback to the external replica actuator.
//!
//! # Scaling algorithm
//!
//! ```text
//! per metric m in {cpu, memory, signal} that is present:
//!     desired_m = ceil(current * value_m / target_m)
//! desired = max(desired_m)          // scale for the worst-case resource
//!
//! if desired > current:             // up: fast, capped
//!     after 45s since last scale-up,
//!     step = min(current, 4)        // smaller of doubling and +4
//!     ScaleTo(min(desired, current + step, max))
//!
//! if desired < current:             // down: slow, one at a time
//!     after 300s of consistently lower desired counts,
//!     at most -1 replica per 15s,
//!     ScaleTo(max(current - 1, min))
//! ```
//!
//! A missing metric source is excluded from the max() and never blocks
//! scaling on the remaining signals.

pub mod evaluator;
pub mod signal;

pub use evaluator::{Autoscaler, CapacityMode, ScaleDecision};
pub use signal::derive_signal;
