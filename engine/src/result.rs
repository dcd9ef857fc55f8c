// result.rs — Typed access to integrated trajectories
//
// A result owns the processed model. Lookups run in the same order as
// everywhere else (compartment, characteristic, parameter, then links by
// tag); program runs additionally expose spending, capacity, and coverage
// views. Every result is stamped with a provenance fingerprint of the
// build inputs so reproducibility is checkable across processes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::framework::Framework;
use crate::id::VarRef;
use crate::model::Model;
use crate::parset::ParameterSet;
use crate::programs::{ProgramInstructions, ProgramSet};
use crate::settings::{CancelToken, Settings};

// ── Provenance ──────────────────────────────────────────────────────────────

/// Fingerprint of the inputs a result was produced from.
///
/// `input_hash` is the SHA-256 of the binary forms of the framework, the
/// parameter set, and the settings, in that order. Two processes given the
/// same inputs produce the same hash, and `process` is deterministic, so
/// equal hashes imply elementwise-identical trajectories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub input_hash: [u8; 32],
    pub engine_version: String,
}

impl Provenance {
    /// Hex string of the input hash (64 characters).
    pub fn input_hash_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.input_hash {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

/// Compute the provenance fingerprint for a build.
pub fn compute_provenance(
    framework: &Framework,
    parset: &ParameterSet,
    settings: &Settings,
) -> Result<Provenance> {
    let mut hasher = Sha256::new();
    hasher.update(framework.to_bytes()?);
    hasher.update(parset.to_bytes()?);
    hasher.update(
        bincode::serialize(settings).map_err(|e| EngineError::Persistence(e.to_string()))?,
    );
    let digest = hasher.finalize();
    let mut input_hash = [0u8; 32];
    input_hash.copy_from_slice(&digest);
    Ok(Provenance {
        input_hash,
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ── Series ──────────────────────────────────────────────────────────────────

/// One named trajectory extracted from a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub vals: Vec<f64>,
}

// ── SimResult ───────────────────────────────────────────────────────────────

/// The outcome of one simulation: the processed model plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimResult {
    pub name: String,
    pub model: Model,
    pub provenance: Provenance,
}

impl SimResult {
    pub fn t(&self) -> &[f64] {
        &self.model.t
    }

    /// Last completed tick (can be before the end of the grid when the run
    /// was cancelled).
    pub fn t_index(&self) -> usize {
        self.model.t_index
    }

    /// Index of the grid point closest to `year`.
    fn tick_of(&self, year: f64) -> Result<usize> {
        let t = &self.model.t;
        let first = t[0];
        let last = t[t.len() - 1];
        if year < first - self.model.dt / 2.0 || year > last + self.model.dt / 2.0 {
            return Err(EngineError::NotFound {
                name: format!("time {year}"),
                population: String::new(),
            });
        }
        let i = ((year - first) / self.model.dt).round() as usize;
        Ok(i.min(t.len() - 1))
    }

    /// Look up a variable by code name. Compartments, characteristics, and
    /// parameters return one series; a link tag returns one series per
    /// matching link.
    pub fn get_variable(&self, pop: &str, name: &str) -> Result<Vec<Series>> {
        let p = self.model.pop_named(pop)?;
        let refs = p.resolve(name).ok_or_else(|| EngineError::NotFound {
            name: name.to_string(),
            population: pop.to_string(),
        })?;
        Ok(refs
            .into_iter()
            .map(|r| match r {
                VarRef::Comp(c) => Series {
                    name: self.model.comps[c.index()].name.clone(),
                    vals: self.model.comps[c.index()].vals.clone(),
                },
                VarRef::Charac(c) => Series {
                    name: self.model.characs[c.index()].name.clone(),
                    vals: self.model.characs[c.index()].vals.clone(),
                },
                VarRef::Par(q) => Series {
                    name: self.model.pars[q.index()].name.clone(),
                    vals: self.model.pars[q.index()].vals.clone(),
                },
                VarRef::Link(l) => Series {
                    name: self.model.links[l.index()].name.clone(),
                    vals: self.model.links[l.index()].vals.clone(),
                },
            })
            .collect())
    }

    /// Convenience accessor for a single-series variable.
    pub fn series(&self, pop: &str, name: &str) -> Result<Series> {
        let mut all = self.get_variable(pop, name)?;
        Ok(all.swap_remove(0))
    }

    /// Population size over time (sources and sinks excluded).
    pub fn popsize(&self, pop: &str) -> Result<Series> {
        let p = self.model.pop_named(pop)?;
        Ok(Series {
            name: format!("{pop} popsize"),
            vals: self.model.popsize(p),
        })
    }

    /// Per-step flows out of a compartment at one tick: (destination,
    /// people per step), plus the people who stay put.
    pub fn expected_outflow(&self, pop: &str, comp: &str, ti: usize) -> Result<Vec<(String, f64)>> {
        let p = self.model.pop_named(pop)?;
        let cid = p.comp_id(comp).ok_or_else(|| EngineError::NotFound {
            name: comp.to_string(),
            population: pop.to_string(),
        })?;
        let c = &self.model.comps[cid.index()];
        let mut out = Vec::new();
        let mut moved = 0.0;
        for &l in &c.outlinks {
            let link = &self.model.links[l.index()];
            let dest = &self.model.comps[link.dest.index()];
            out.push((dest.name.clone(), link.vals[ti]));
            moved += link.vals[ti];
        }
        out.push((c.name.clone(), c.vals[ti] - moved));
        Ok(out)
    }

    /// Expected years a person entering this compartment remains in it if
    /// the current outflow rates hold (geometric expectation over steps).
    pub fn expected_duration(&self, pop: &str, comp: &str, ti: usize) -> Result<f64> {
        let p = self.model.pop_named(pop)?;
        let cid = p.comp_id(comp).ok_or_else(|| EngineError::NotFound {
            name: comp.to_string(),
            population: pop.to_string(),
        })?;
        let c = &self.model.comps[cid.index()];
        let size = c.vals[ti];
        if size <= 0.0 {
            return Ok(f64::INFINITY);
        }
        let outflow: f64 = c
            .outlinks
            .iter()
            .map(|&l| self.model.links[l.index()].vals[ti])
            .sum();
        let p_step = (outflow / size).min(1.0);
        if p_step <= 0.0 {
            return Ok(f64::INFINITY);
        }
        Ok(self.model.dt / p_step)
    }

    /// Cascade stage values at `year`: each stage is the sum of its
    /// constituent compartments/characteristics in one population.
    pub fn cascade_vals(&self, cascade: &str, pop: &str, year: f64) -> Result<Vec<(String, f64)>> {
        let spec = self
            .model
            .framework
            .cascades
            .iter()
            .find(|c| c.name == cascade)
            .ok_or_else(|| EngineError::NotFound {
                name: cascade.to_string(),
                population: pop.to_string(),
            })?;
        let ti = self.tick_of(year)?;
        let mut out = Vec::with_capacity(spec.stages.len());
        for stage in &spec.stages {
            let mut total = 0.0;
            for item in &stage.constituents {
                for series in self.get_variable(pop, item)? {
                    total += series.vals[ti];
                }
            }
            out.push((stage.name.clone(), total));
        }
        Ok(out)
    }

    // ── Program views ───────────────────────────────────────────────────────

    fn program_state(&self) -> Result<&crate::model::ProgramState> {
        self.model.programs.as_ref().ok_or_else(|| {
            EngineError::program("this result was produced without a program set")
        })
    }

    /// Spending per program at `year`.
    pub fn get_alloc(&self, year: f64) -> Result<Vec<(String, f64)>> {
        let ps = self.program_state()?;
        let ti = self.tick_of(year)?;
        Ok(ps
            .progset
            .programs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), ps.spending[i][ti]))
            .collect())
    }

    /// Coverage per program at `year`. `quantity` selects the view:
    /// "capacity" (people coverable per year), "fraction" (observed
    /// proportion covered, clipped to 1), or "number" (people covered).
    pub fn get_coverage(&self, quantity: &str, year: f64) -> Result<Vec<(String, f64)>> {
        let ps = self.program_state()?;
        let ti = self.tick_of(year)?;
        let mut out = Vec::new();
        for (i, p) in ps.progset.programs.iter().enumerate() {
            let v = match quantity {
                "capacity" => ps.capacity[i][ti],
                "fraction" => ps.coverage_frac[i][ti],
                "number" => {
                    let target: f64 = ps.target_comps[i]
                        .iter()
                        .map(|c| self.model.comps[c.index()].vals[ti])
                        .sum();
                    ps.coverage_frac[i][ti] * target
                }
                other => {
                    return Err(EngineError::program(format!(
                        "unknown coverage quantity '{other}' (expected capacity, fraction, \
                         or number)"
                    )))
                }
            };
            out.push((p.name.clone(), v));
        }
        Ok(out)
    }

    /// Serialize to the binary persistence form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Restore from the binary persistence form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| EngineError::Persistence(e.to_string()))
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Build and process a model, producing a result.
pub fn run(
    settings: &Settings,
    framework: &Framework,
    parset: &ParameterSet,
    programs: Option<(&ProgramSet, &ProgramInstructions)>,
) -> Result<SimResult> {
    run_with(settings, framework, parset, programs, &CancelToken::new())
}

/// `run` with a cancellation token; a cancelled run returns a partial
/// result whose `t_index` marks the last completed tick.
pub fn run_with(
    settings: &Settings,
    framework: &Framework,
    parset: &ParameterSet,
    programs: Option<(&ProgramSet, &ProgramInstructions)>,
    cancel: &CancelToken,
) -> Result<SimResult> {
    let provenance = compute_provenance(framework, parset, settings)?;
    let mut model = Model::build(settings, framework, parset, programs)?;
    model.process_with(cancel)?;
    Ok(SimResult {
        name: parset.name.clone(),
        model,
        provenance,
    })
}
