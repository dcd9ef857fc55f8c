// parameter.rs — Parameter arena nodes and dependency targets
//
// A parameter is the per-population scalar timeline that drives links and
// feeds other functions. Values are always annualized; conversion to
// per-step flows happens in update_links. The evaluation mode (data-only,
// precomputed, dynamic) is chosen at build time; the extras the Python
// source kept in attribute bags live here as a struct of optionals.

use serde::{Deserialize, Serialize};

use crate::compartment::Compartment;
use crate::expr::{AggSpec, CompiledExpr};
use crate::framework::ParamFormat;
use crate::id::{CharacId, CompId, LinkId, ParId, PopId};
use crate::link::Link;

/// What one function dependency slot reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DepTarget {
    /// The current time `t`.
    Time,
    /// The step size `dt`.
    Dt,
    Comp(CompId),
    Charac(CharacId),
    Par(ParId),
    /// Annualized flow rate: the summed per-step values of these links
    /// divided by dt (a `par:flow` reference).
    Flow(Vec<LinkId>),
}

/// One parameter in the integration graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub id: ParId,
    pub pop: PopId,
    pub name: String,
    pub format: Option<ParamFormat>,
    /// Years per rate unit (e.g. 1/52 for a weekly rate).
    pub timescale: f64,
    /// Annualized values, one per tick.
    pub vals: Vec<f64>,
    /// Compiled function, if the framework supplies one (aggregations are
    /// kept separately in `agg`).
    pub function: Option<CompiledExpr>,
    /// Resolved dependency targets aligned with `function`'s table.
    pub deps: Vec<DepTarget>,
    /// Cross-population aggregation descriptor.
    pub agg: Option<AggSpec>,
    /// Inclusive clip range applied after each update.
    pub limits: Option<(f64, f64)>,
    /// Time window [lo, hi] in which the function is not evaluated and the
    /// data-supplied values are kept.
    pub skip_function: Option<(f64, f64)>,
    /// The function yields dx/dt; integrated with explicit Euler.
    pub is_derivative: bool,
    /// Evaluated per tick inside the loop.
    pub dynamic: bool,
    /// Evaluated vectorised before the loop.
    pub precompute: bool,
    /// Interpolated databook data was written into `vals` at build.
    pub has_data: bool,
    /// Product of the parset meta factor and the population y-factor.
    pub scale_factor: f64,
    /// Links this parameter drives.
    pub links: Vec<LinkId>,
}

impl Parameter {
    pub fn new(id: ParId, pop: PopId, name: String) -> Self {
        Parameter {
            id,
            pop,
            name,
            format: None,
            timescale: 1.0,
            vals: Vec::new(),
            function: None,
            deps: Vec::new(),
            agg: None,
            limits: None,
            skip_function: None,
            is_derivative: false,
            dynamic: false,
            precompute: false,
            has_data: false,
            scale_factor: 1.0,
            links: Vec::new(),
        }
    }

    pub fn preallocate(&mut self, tlen: usize) {
        self.vals = vec![f64::NAN; tlen];
    }

    /// True if the function should not be evaluated at time `t`.
    pub fn in_skip_window(&self, t: f64) -> bool {
        match self.skip_function {
            Some((lo, hi)) => t >= lo && t <= hi,
            None => false,
        }
    }

    /// Clip the value at one tick to the configured limits.
    pub fn constrain(&mut self, ti: usize) {
        if let Some((lo, hi)) = self.limits {
            self.vals[ti] = self.vals[ti].clamp(lo, hi);
        }
    }

    /// Clip every tick (vectorised path for data and precomputed values).
    pub fn constrain_all(&mut self) {
        if let Some((lo, hi)) = self.limits {
            for v in &mut self.vals {
                *v = v.clamp(lo, hi);
            }
        }
    }

    /// Total people in the source compartments of this parameter's links.
    pub fn source_popsize(&self, ti: usize, comps: &[Compartment], links: &[Link]) -> f64 {
        let mut seen: Vec<CompId> = Vec::with_capacity(self.links.len());
        let mut n = 0.0;
        for &l in &self.links {
            let src = links[l.index()].source;
            if !seen.contains(&src) {
                seen.push(src);
                n += comps[src.index()].vals[ti];
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompKind;

    #[test]
    fn skip_window() {
        let mut p = Parameter::new(ParId(0), PopId(0), "x".into());
        assert!(!p.in_skip_window(2000.0));
        p.skip_function = Some((2005.0, 2010.0));
        assert!(!p.in_skip_window(2004.9));
        assert!(p.in_skip_window(2005.0));
        assert!(p.in_skip_window(2007.5));
        assert!(p.in_skip_window(2010.0));
        assert!(!p.in_skip_window(2010.1));
    }

    #[test]
    fn constrain_clips_both_ends() {
        let mut p = Parameter::new(ParId(0), PopId(0), "x".into());
        p.vals = vec![-1.0, 0.5, 9.0];
        p.limits = Some((0.0, 1.0));
        p.constrain_all();
        assert_eq!(p.vals, vec![0.0, 0.5, 1.0]);

        p.vals[1] = 7.0;
        p.constrain(1);
        assert_eq!(p.vals[1], 1.0);
    }

    #[test]
    fn source_popsize_counts_each_compartment_once() {
        let mut c0 = Compartment::new(CompId(0), PopId(0), "a".into(), CompKind::Plain);
        c0.vals = vec![10.0];
        let mut c1 = Compartment::new(CompId(1), PopId(0), "b".into(), CompKind::Plain);
        c1.vals = vec![5.0];
        let comps = vec![c0, c1];

        let mut l0 = Link::new(LinkId(0), PopId(0), "l0".into(), ParId(0), CompId(0), CompId(1));
        let mut l1 = Link::new(LinkId(1), PopId(0), "l1".into(), ParId(0), CompId(0), CompId(1));
        let mut l2 = Link::new(LinkId(2), PopId(0), "l2".into(), ParId(0), CompId(1), CompId(0));
        l0.preallocate(1);
        l1.preallocate(1);
        l2.preallocate(1);
        let links = vec![l0, l1, l2];

        let mut p = Parameter::new(ParId(0), PopId(0), "x".into());
        p.links = vec![LinkId(0), LinkId(1), LinkId(2)];
        // Compartment 0 appears as the source of two links but counts once.
        assert_eq!(p.source_popsize(0, &comps, &links), 15.0);
    }
}
