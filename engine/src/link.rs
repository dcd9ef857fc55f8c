// link.rs — Directed transitions between compartments
//
// A link is driven by exactly one parameter; a parameter may drive many
// links. Link values are per-step flows (people moved between tick ti and
// ti+1, stored at column ti). Timed links additionally carry a per-row
// matrix aligned with their source timed compartment.

use ndarray::{Array2, ShapeBuilder};
use serde::{Deserialize, Serialize};

use crate::id::{CompId, LinkId, ParId, PopId};

/// A directed flow between two compartments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    /// Population owning this link (the source side).
    pub pop: PopId,
    /// Unique tag: `par.source->dest` (dest pop-qualified for transfers).
    pub name: String,
    pub par: ParId,
    pub source: CompId,
    pub dest: CompId,
    /// Per-step flow, one entry per tick.
    pub vals: Vec<f64>,
    /// Per-row flows for duration-preserving links; rows match the source
    /// timed compartment (or the duration group, for junction outlinks).
    pub row_vals: Option<Array2<f64>>,
    /// Connects compartments across populations.
    pub is_transfer: bool,
    /// The implicit outlink draining the oldest row of a timed compartment.
    pub is_flush: bool,
    /// Per-step fraction cache written by update_links each tick. For a
    /// link out of a source compartment this caches the absolute count.
    #[serde(skip)]
    pub frac: f64,
}

impl Link {
    pub fn new(
        id: LinkId,
        pop: PopId,
        name: String,
        par: ParId,
        source: CompId,
        dest: CompId,
    ) -> Self {
        Link {
            id,
            pop,
            name,
            par,
            source,
            dest,
            vals: Vec::new(),
            row_vals: None,
            is_transfer: false,
            is_flush: false,
            frac: 0.0,
        }
    }

    /// Promote this link to a duration-preserving timed link with `rows`
    /// subcompartment rows. Storage is sized in `preallocate`.
    pub fn make_timed(&mut self, rows: usize) {
        self.row_vals = Some(Array2::zeros((rows, 0).f()));
    }

    pub fn is_timed(&self) -> bool {
        self.row_vals.is_some()
    }

    /// Allocate value storage for a grid of `tlen` ticks. Columns are
    /// written every tick, so scalar values start as NaN to surface any
    /// missed write; row matrices start at zero because junction balancing
    /// accumulates into them.
    pub fn preallocate(&mut self, tlen: usize) {
        self.vals = vec![f64::NAN; tlen];
        if let Some(rows) = &self.row_vals {
            let r = rows.nrows();
            self.row_vals = Some(Array2::zeros((r, tlen).f()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> Link {
        Link::new(
            LinkId(0),
            PopId(0),
            "rate.sus->rec".into(),
            ParId(0),
            CompId(0),
            CompId(1),
        )
    }

    #[test]
    fn preallocate_scalar() {
        let mut l = link();
        l.preallocate(5);
        assert_eq!(l.vals.len(), 5);
        assert!(l.vals.iter().all(|v| v.is_nan()));
        assert!(!l.is_timed());
    }

    #[test]
    fn preallocate_timed_rows() {
        let mut l = link();
        l.make_timed(4);
        l.preallocate(6);
        let rows = l.row_vals.as_ref().unwrap();
        assert_eq!(rows.nrows(), 4);
        assert_eq!(rows.ncols(), 6);
        assert!(rows.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn frac_cache_not_serialized() {
        let mut l = link();
        l.preallocate(2);
        l.frac = 0.7;
        let bytes = bincode::serialize(&l).unwrap();
        let back: Link = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.frac, 0.0);
        assert_eq!(back.name, l.name);
    }
}
