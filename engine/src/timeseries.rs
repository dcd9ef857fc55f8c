// timeseries.rs — Time-stamped values with interpolation
//
// The storage unit behind every databook quantity: a sorted set of
// (t, value) pairs, an optional constant assumption used when no pairs are
// present, and a units tag. Interpolation is piecewise linear inside the
// data range and constant-extrapolating outside it.

use serde::{Deserialize, Serialize};

/// A single time-stamped data series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Observation times, kept sorted and unique.
    pub t: Vec<f64>,
    /// Observed values, aligned with `t`.
    pub vals: Vec<f64>,
    /// Constant assumption used when there are no time-specific values.
    pub assumption: Option<f64>,
    /// Units tag (e.g. "number", "probability"). Informational.
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(units: Option<&str>) -> Self {
        TimeSeries {
            t: Vec::new(),
            vals: Vec::new(),
            assumption: None,
            units: units.map(str::to_string),
        }
    }

    /// Build a series from parallel time/value slices.
    pub fn from_data(t: &[f64], vals: &[f64]) -> Self {
        assert_eq!(t.len(), vals.len(), "time and value lengths differ");
        let mut ts = TimeSeries::default();
        for (&ti, &vi) in t.iter().zip(vals) {
            ts.insert(ti, vi);
        }
        ts
    }

    /// Build a series holding only a constant assumption.
    pub fn constant(value: f64) -> Self {
        TimeSeries {
            assumption: Some(value),
            ..TimeSeries::default()
        }
    }

    /// Insert a (t, value) pair, replacing any existing value at `time`.
    pub fn insert(&mut self, time: f64, value: f64) {
        match self.t.binary_search_by(|x| x.total_cmp(&time)) {
            Ok(i) => self.vals[i] = value,
            Err(i) => {
                self.t.insert(i, time);
                self.vals.insert(i, value);
            }
        }
    }

    /// Remove the pair at `time`, if present.
    pub fn remove(&mut self, time: f64) {
        if let Ok(i) = self.t.binary_search_by(|x| x.total_cmp(&time)) {
            self.t.remove(i);
            self.vals.remove(i);
        }
    }

    /// True if the series carries any usable value.
    pub fn has_data(&self) -> bool {
        !self.t.is_empty() || self.assumption.is_some()
    }

    /// True if the series has time-specific values (not just an assumption).
    pub fn has_time_data(&self) -> bool {
        !self.t.is_empty()
    }

    /// Sample the series at a single time.
    ///
    /// Piecewise linear between observations, constant extrapolation
    /// outside the observed range, assumption when no observations exist,
    /// NaN when the series is entirely empty.
    pub fn sample(&self, time: f64) -> f64 {
        if self.t.is_empty() {
            return self.assumption.unwrap_or(f64::NAN);
        }
        let n = self.t.len();
        if time <= self.t[0] {
            return self.vals[0];
        }
        if time >= self.t[n - 1] {
            return self.vals[n - 1];
        }
        // First index with t[i] > time; the bracketing interval is [i-1, i].
        let i = self.t.partition_point(|&x| x <= time);
        let (t0, t1) = (self.t[i - 1], self.t[i]);
        let (v0, v1) = (self.vals[i - 1], self.vals[i]);
        v0 + (v1 - v0) * (time - t0) / (t1 - t0)
    }

    /// Interpolate onto a whole time vector.
    pub fn interpolate(&self, tvec: &[f64]) -> Vec<f64> {
        tvec.iter().map(|&t| self.sample(t)).collect()
    }
}
