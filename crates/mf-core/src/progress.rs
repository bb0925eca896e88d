//! Progress throttling.
//!
//! Encoders may report progress many times per second. The aggregator turns
//! raw `(current, total)` samples into a monotonic per-item fraction and
//! decides when a change is worth an event: an advance of at least
//! [`MIN_STEP`] since the last emitted value, or any advance once the
//! fraction reaches [`NEAR_COMPLETE`].
//!
//! Per-item state is an explicit [`ProgressState`] value passed in and
//! returned, so callers own it and nothing is captured behind the scenes.
//! Batch progress is never derived from these samples; it comes from
//! committed counts via [`crate::committed_fraction`].

/// Minimum advance between two emitted fractions.
pub const MIN_STEP: f64 = 0.05;

/// Fractions at or above this are always emitted when they advance.
pub const NEAR_COMPLETE: f64 = 0.99;

const EPSILON: f64 = 1e-9;

/// Last emitted fraction for one item; `Default` is the state at item start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressState {
    last_emitted: f64,
}

impl ProgressState {
    pub fn last_emitted(&self) -> f64 {
        self.last_emitted
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Emit {
    pub fraction: f64,
    pub current: u64,
    pub total: u64,
}

/// Result of feeding one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub state: ProgressState,
    pub emit: Option<Emit>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressAggregator {
    min_step: f64,
    near_complete: f64,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self {
            min_step: MIN_STEP,
            near_complete: NEAR_COMPLETE,
        }
    }
}

impl ProgressAggregator {
    pub fn on_sample(&self, state: ProgressState, current: u64, total: u64) -> Sample {
        if total == 0 {
            return Sample { state, emit: None };
        }
        let fraction = (current as f64 / total as f64).clamp(0.0, 1.0);
        let last = state.last_emitted;

        let advanced = fraction - last >= self.min_step - EPSILON;
        let near_done = fraction >= self.near_complete && fraction > last;

        if advanced || near_done {
            Sample {
                state: ProgressState {
                    last_emitted: fraction,
                },
                emit: Some(Emit {
                    fraction,
                    current,
                    total,
                }),
            }
        } else {
            Sample { state, emit: None }
        }
    }

    /// Closing signal for a successful item: emits `1.0` unless a
    /// near-complete value was already emitted.
    pub fn on_complete(&self, state: ProgressState) -> Sample {
        if state.last_emitted >= self.near_complete {
            return Sample { state, emit: None };
        }
        Sample {
            state: ProgressState { last_emitted: 1.0 },
            emit: Some(Emit {
                fraction: 1.0,
                current: 1,
                total: 1,
            }),
        }
    }
}
