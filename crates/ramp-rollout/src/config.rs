//! Rollout configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a canary rollout's step program and gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Canary weight percentages, in order, ending at 100.
    pub weight_ladder: Vec<u32>,
    /// Hold after each weight change before analysis (seconds). Chosen to
    /// exceed the analysis window so the first run has trailing data.
    pub pause_seconds: u64,
    /// Passing analysis runs required to advance to the next weight.
    pub required_passes: u32,
    /// Consecutive failing analysis runs that abort the rollout.
    pub failure_limit: u32,
    /// Controller loop tick spacing (seconds).
    pub tick_interval_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            weight_ladder: vec![20, 50, 100],
            pause_seconds: 300,
            required_passes: 2,
            failure_limit: 2,
            tick_interval_secs: 5,
        }
    }
}
