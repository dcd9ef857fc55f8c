// compartment.rs — Compartment arena nodes
//
// One tagged union covers the five behavioural variants (plain, source,
// sink, junction, timed); every call site dispatches with a single match.
// Values are people counts per tick. Timed compartments additionally keep
// a rows × ticks matrix of duration subcompartments, stored column-major
// so the per-tick column sum is cache-friendly.

use ndarray::{Array1, Array2, ShapeBuilder};
use serde::{Deserialize, Serialize};

use crate::id::{CompId, LinkId, PopId};
use crate::link::Link;

/// Duration-tracking state for a timed compartment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedComp {
    /// Name of the timed parameter defining the duration group.
    pub group: String,
    /// Number of duration subcompartments; constant for the run.
    pub rows: usize,
    /// rows × ticks storage. Row 0 is the oldest bucket (next to flush);
    /// row rows-1 is the newest. People age toward row 0 each tick.
    pub row_vals: Array2<f64>,
    /// The flush outlink draining row 0; wired during graph construction.
    pub flush: Option<LinkId>,
}

/// Behavioural variant of a compartment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompKind {
    Plain,
    /// Unbounded origin; its own value stays 0 and its single outlink flow
    /// is set directly by the driving parameter in number units.
    Source,
    /// Terminal; accumulates inflow and has no outlinks.
    Sink,
    /// Holds nothing across ticks; inflow is redistributed to outflow in
    /// the same tick. May itself belong to a duration group.
    Junction { duration_group: Option<String> },
    Timed(TimedComp),
}

/// One compartment in the integration graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    pub id: CompId,
    pub pop: PopId,
    pub name: String,
    pub kind: CompKind,
    /// People count per tick. For timed compartments this is the column
    /// sum of `row_vals`, maintained by `update`.
    pub vals: Vec<f64>,
    pub inlinks: Vec<LinkId>,
    pub outlinks: Vec<LinkId>,
}

impl Compartment {
    pub fn new(id: CompId, pop: PopId, name: String, kind: CompKind) -> Self {
        Compartment {
            id,
            pop,
            name,
            kind,
            vals: Vec::new(),
            inlinks: Vec::new(),
            outlinks: Vec::new(),
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self.kind, CompKind::Source)
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.kind, CompKind::Sink)
    }

    pub fn is_junction(&self) -> bool {
        matches!(self.kind, CompKind::Junction { .. })
    }

    pub fn is_timed(&self) -> bool {
        matches!(self.kind, CompKind::Timed(_))
    }

    /// Sources and sinks are excluded from population size.
    pub fn counts_toward_popsize(&self) -> bool {
        !self.is_source() && !self.is_sink()
    }

    /// The duration group this compartment belongs to, if any.
    pub fn duration_group(&self) -> Option<&str> {
        match &self.kind {
            CompKind::Timed(t) => Some(&t.group),
            CompKind::Junction { duration_group } => duration_group.as_deref(),
            _ => None,
        }
    }

    pub fn timed(&self) -> Option<&TimedComp> {
        match &self.kind {
            CompKind::Timed(t) => Some(t),
            _ => None,
        }
    }

    pub fn timed_mut(&mut self) -> Option<&mut TimedComp> {
        match &mut self.kind {
            CompKind::Timed(t) => Some(t),
            _ => None,
        }
    }

    /// Allocate value storage for a grid of `tlen` ticks. Later columns are
    /// NaN until written so a missed update is visible, except the timed
    /// matrix which balancing and initialization accumulate into.
    pub fn preallocate(&mut self, tlen: usize) {
        self.vals = vec![f64::NAN; tlen];
        if let CompKind::Timed(t) = &mut self.kind {
            t.row_vals = Array2::zeros((t.rows, tlen).f());
        }
    }

    /// Convert the per-link fraction caches into actual per-step flows out
    /// of this compartment at tick `ti`, rescaling proportionally when the
    /// total fraction exceeds 1 so the compartment cannot go negative.
    /// Sinks and junctions are no-ops (junction outflows are produced by
    /// junction balancing).
    pub fn resolve_outflows(&self, ti: usize, links: &mut [Link]) {
        match &self.kind {
            CompKind::Sink | CompKind::Junction { .. } => {}
            CompKind::Source => {
                // The cached fraction holds the absolute count directly.
                for &l in &self.outlinks {
                    let link = &mut links[l.index()];
                    link.vals[ti] = link.frac;
                }
            }
            CompKind::Plain => {
                let total: f64 = self.outlinks.iter().map(|&l| links[l.index()].frac).sum();
                let scale = if total > 1.0 { 1.0 / total } else { 1.0 };
                let size = self.vals[ti];
                for &l in &self.outlinks {
                    let link = &mut links[l.index()];
                    link.vals[ti] = link.frac * scale * size;
                }
            }
            CompKind::Timed(t) => {
                let total: f64 = self
                    .outlinks
                    .iter()
                    .map(|&l| &links[l.index()])
                    .filter(|l| !l.is_flush)
                    .map(|l| l.frac)
                    .sum();
                let scale = if total > 1.0 { 1.0 / total } else { 1.0 };
                let col = t.row_vals.column(ti).to_owned();
                let col_sum: f64 = col.sum();

                for &l in &self.outlinks {
                    let link = &mut links[l.index()];
                    if link.is_flush {
                        continue;
                    }
                    let frac = link.frac * scale;
                    match &mut link.row_vals {
                        Some(rows) => {
                            let mut out = 0.0;
                            for r in 0..t.rows {
                                let v = frac * col[r];
                                rows[[r, ti]] = v;
                                out += v;
                            }
                            link.vals[ti] = out;
                        }
                        None => {
                            // Scalar links drain all rows proportionally.
                            link.vals[ti] = frac * col_sum;
                        }
                    }
                }

                if let Some(f) = t.flush {
                    // Whatever remains of the oldest bucket leaves now.
                    let drained = total * scale;
                    links[f.index()].vals[ti] = col[0] * (1.0 - drained);
                }
            }
        }
    }

    /// Roll this compartment forward to tick `ti` using the flows stored at
    /// `ti - 1`.
    pub fn update(&mut self, ti: usize, links: &[Link]) {
        let inflow: f64 = self
            .inlinks
            .iter()
            .map(|&l| links[l.index()].vals[ti - 1])
            .sum();
        let outflow: f64 = self
            .outlinks
            .iter()
            .map(|&l| links[l.index()].vals[ti - 1])
            .sum();

        match &mut self.kind {
            CompKind::Source => {
                self.vals[ti] = 0.0;
            }
            CompKind::Sink => {
                self.vals[ti] = self.vals[ti - 1] + inflow;
            }
            CompKind::Plain => {
                self.vals[ti] = (self.vals[ti - 1] + inflow - outflow).max(0.0);
            }
            CompKind::Junction { .. } => {
                // Balanced junctions have inflow == outflow, so this is 0 up
                // to rounding; balancing pins it to exactly 0 afterwards.
                self.vals[ti] = self.vals[ti - 1] + inflow - outflow;
            }
            CompKind::Timed(t) => {
                let rows = t.rows;
                let prev = t.row_vals.column(ti - 1).to_owned();
                let prev_total: f64 = prev.sum();
                let mut w = prev.clone();

                // Remove ordinary outflows row by row.
                for &l in &self.outlinks {
                    let link = &links[l.index()];
                    if link.is_flush {
                        continue;
                    }
                    match &link.row_vals {
                        Some(rv) => {
                            for r in 0..rows {
                                w[r] -= rv[[r, ti - 1]];
                            }
                        }
                        None => {
                            if prev_total > 0.0 {
                                let v = link.vals[ti - 1];
                                for r in 0..rows {
                                    w[r] -= v * prev[r] / prev_total;
                                }
                            }
                        }
                    }
                }
                // The flush empties what is left of the oldest bucket.
                if let Some(f) = t.flush {
                    w[0] -= links[f.index()].vals[ti - 1];
                }

                // Advance the keyring: everyone moves one bucket closer to
                // flushing and the newest bucket starts empty.
                let mut new = Array1::zeros(rows);
                for r in 0..rows - 1 {
                    new[r] = w[r + 1];
                }

                // Arrivals: duration-preserving links land in matching rows,
                // everything else enters the newest bucket.
                for &l in &self.inlinks {
                    let link = &links[l.index()];
                    match &link.row_vals {
                        Some(rv) => {
                            for r in 0..rows {
                                new[r] += rv[[r, ti - 1]];
                            }
                        }
                        None => {
                            new[rows - 1] += link.vals[ti - 1];
                        }
                    }
                }

                let mut sum = 0.0;
                for r in 0..rows {
                    let v = new[r].max(0.0);
                    t.row_vals[[r, ti]] = v;
                    sum += v;
                }
                self.vals[ti] = sum;
            }
        }
    }
}
