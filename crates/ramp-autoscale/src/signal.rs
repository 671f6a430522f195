//! Derived autoscaling signal from windowed-minimum queueing delay.
//!
//! The raw input is the minimum observed queueing delay over a sliding
//! window, averaged across replicas. A *minimum* distinguishes sustained
//! overload from transient spikes: if the minimum stays high, the queue
//! never drained. The raw value spans 3–5 orders of magnitude between
//! idle and overloaded, so it is floor-subtracted, log-compressed, and
//! calibrated into a scalar the policy evaluator can target at 1.0.

use ramp_state::SignalConfig;

/// Transform a raw windowed-minimum delay into the dimensionless signal.
///
/// Steps, in order:
/// 1. `raised = max(input - baseline, baseline)` — near-zero noise cannot
///    dominate the output.
/// 2. `log10(raised)` — compress the dynamic range to a roughly linear scale.
/// 3. divide by `log10(baseline) / calibration`, so the output equals
///    `calibration` (slightly below the 1.0 target) when the input sits
///    exactly at the idle baseline.
///
/// Monotonically non-decreasing for all non-negative inputs. Requires
/// `baseline_delay > 1` for the calibration divisor to be positive.
pub fn derive_signal(input: f64, config: &SignalConfig) -> f64 {
    let raised = (input - config.baseline_delay).max(config.baseline_delay);
    let divisor = (config.baseline_delay.log10() / config.calibration).max(f64::MIN_POSITIVE);
    raised.log10() / divisor
}
