// settings.rs — Simulation settings and the cancellation token
//
// All tolerances and grid parameters travel through this struct; nothing
// in the engine reads global mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Absolute tolerance for the initialization solver and junction emptiness.
pub const TOLERANCE: f64 = 1e-6;

/// Tolerance for junction balance checks (inflow vs outflow).
pub const BALANCE_TOLERANCE: f64 = 1e-9;

/// Simulation grid and numeric tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub t_start: f64,
    pub t_end: f64,
    /// Step size in years. Positive and finite.
    pub dt: f64,
    /// Initialization / junction-emptiness tolerance.
    pub tolerance: f64,
    /// Junction inflow-outflow balance tolerance.
    pub balance_tolerance: f64,
}

impl Settings {
    /// Create settings for the half-open grid `t_start .. t_end` inclusive.
    pub fn new(t_start: f64, t_end: f64, dt: f64) -> Result<Self> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::Settings(format!(
                "dt must be positive and finite, got {dt}"
            )));
        }
        if !t_start.is_finite() || !t_end.is_finite() {
            return Err(EngineError::Settings(
                "t_start and t_end must be finite".into(),
            ));
        }
        if t_end < t_start {
            return Err(EngineError::Settings(format!(
                "t_end ({t_end}) precedes t_start ({t_start})"
            )));
        }
        Ok(Settings {
            t_start,
            t_end,
            dt,
            tolerance: TOLERANCE,
            balance_tolerance: BALANCE_TOLERANCE,
        })
    }

    /// The simulation time vector: `t_start + k*dt` up to and including
    /// `t_end` (an `arange(t_start, t_end + dt/2, dt)` grid).
    pub fn tvec(&self) -> Vec<f64> {
        let n = ((self.t_end - self.t_start) / self.dt + 0.5).floor() as usize + 1;
        (0..n).map(|k| self.t_start + k as f64 * self.dt).collect()
    }
}

/// Cooperative cancellation handle. The integration loop checks it between
/// ticks; on cancellation the run stops and a partial result is returned
/// with `t_index` marking the last completed tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from another thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
