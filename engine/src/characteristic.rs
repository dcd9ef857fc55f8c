// characteristic.rs — Derived quantities over compartment groupings
//
// A characteristic sums its components (compartments or other
// characteristics) and optionally divides by a denominator. Division
// follows the 0/0 → 0, x/0 → ∞ policy. Characteristics another variable
// depends on during the loop are flagged dynamic and updated per tick;
// the rest are filled vectorised after integration.

use serde::{Deserialize, Serialize};

use crate::compartment::Compartment;
use crate::expr::CompiledExpr;
use crate::id::{CharacId, PopId, VarRef};
use crate::parameter::DepTarget;

/// One characteristic in the integration graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Characteristic {
    pub id: CharacId,
    pub pop: PopId,
    pub name: String,
    /// Component compartments/characteristics whose values are summed.
    pub includes: Vec<VarRef>,
    pub denominator: Option<VarRef>,
    /// Output-only function override; evaluated after integration.
    pub function: Option<CompiledExpr>,
    /// Resolved dependency targets aligned with `function`'s table.
    pub deps: Vec<DepTarget>,
    /// Another object reads this characteristic during the loop.
    pub dynamic: bool,
    /// Per-tick values. Allocated for dynamic characteristics; filled at
    /// finalization otherwise.
    pub vals: Vec<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Characteristic {
    pub fn new(id: CharacId, pop: PopId, name: String) -> Self {
        Characteristic {
            id,
            pop,
            name,
            includes: Vec::new(),
            denominator: None,
            function: None,
            deps: Vec::new(),
            dynamic: false,
            vals: Vec::new(),
            min: None,
            max: None,
        }
    }

    /// Allocate per-tick storage (NaN so missed updates are visible).
    pub fn preallocate(&mut self, tlen: usize) {
        self.vals = vec![f64::NAN; tlen];
    }

    /// Apply the ratio policy: 0/0 → 0 (within tolerance), x/0 → ∞.
    pub fn apply_denominator(numerator: f64, denominator: f64, tolerance: f64) -> f64 {
        if denominator > 0.0 {
            numerator / denominator
        } else if numerator.abs() < tolerance {
            0.0
        } else {
            f64::INFINITY
        }
    }

    /// Compute this characteristic's value at one tick from its components.
    /// Included characteristics must already hold a value at `ti` (the
    /// model updates characteristics in dependency order).
    pub fn value_at(
        &self,
        ti: usize,
        comps: &[Compartment],
        characs: &[Characteristic],
        tolerance: f64,
    ) -> f64 {
        let fetch = |r: &VarRef| -> f64 {
            match r {
                VarRef::Comp(c) => comps[c.index()].vals[ti],
                VarRef::Charac(c) => characs[c.index()].vals[ti],
                _ => f64::NAN,
            }
        };
        let num: f64 = self.includes.iter().map(fetch).sum();
        let mut out = match &self.denominator {
            Some(d) => Self::apply_denominator(num, fetch(d), tolerance),
            None => num,
        };
        if let Some(lo) = self.min {
            out = out.max(lo);
        }
        if let Some(hi) = self.max {
            out = out.min(hi);
        }
        out
    }
}
