// model.rs — Graph construction and the integration loop
//
// The Model owns the full integration graph in flat arenas (compartments,
// links, characteristics, parameters) plus the orderings computed once at
// build time: junction topology, characteristic dependency order, and the
// per-name parameter execution groups. `build` wires everything and
// initializes tick 0; `process` runs the four-phase loop
// (comps → pars → links → junctions) over the rest of the grid.
//
// Preconditions: validated framework and parset (revalidated here).
// Postconditions: after `process`, every variable holds values for ticks
//                 0..=t_index; remaining outputs are filled vectorised.
// Failure modes: build-time wiring errors, BadInitialization, junction
//                cycles, numeric guards during integration.
// Side effects: tracing warnings for the recoverable conditions.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::characteristic::Characteristic;
use crate::compartment::Compartment;
use crate::error::{EngineError, Result};
use crate::expr::AggKind;
use crate::framework::{Framework, ParamFormat};
use crate::id::{CharacId, CompId, LinkId, ParId, PopId, VarRef};
use crate::init;
use crate::link::Link;
use crate::parameter::{DepTarget, Parameter};
use crate::parset::ParameterSet;
use crate::population::{mark_charac_dynamic, GraphBuilder, Population};
use crate::programs::{ProgramInstructions, ProgramSet};
use crate::settings::{CancelToken, Settings};

// ── Build-time tables ───────────────────────────────────────────────────────

/// Interpolated interaction weights for one named interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InteractionWeights {
    pub name: String,
    /// (from pop, to pop, per-tick weight).
    pub entries: Vec<(PopId, PopId, Vec<f64>)>,
}

impl InteractionWeights {
    fn weight(&self, from: PopId, to: PopId, ti: usize) -> f64 {
        self.entries
            .iter()
            .find(|(f, t, _)| *f == from && *t == to)
            .map(|(_, _, w)| w[ti])
            .unwrap_or(0.0)
    }
}

/// One cross-population aggregation, resolved to arena ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AggInstance {
    pub kind: AggKind,
    /// Parameters receiving the aggregated value (one per result pop).
    pub row_pars: Vec<ParId>,
    /// Argument parameter per column pop.
    pub col_pars: Vec<ParId>,
    /// Index into `Model::interactions`.
    pub interaction: usize,
    /// Optional weight variable per column pop.
    pub weights: Option<Vec<DepTarget>>,
}

/// Per-name execution group for update_pars, in framework declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParGroup {
    name: String,
    pars: Vec<ParId>,
    /// Index into `Model::aggs` when this name aggregates across pops.
    agg: Option<usize>,
}

/// Resolved coverage-outcome entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResolvedCovout {
    pub par: ParId,
    pub baseline: f64,
    /// (program index, outcome at full coverage).
    pub outcomes: Vec<(usize, f64)>,
}

/// Deep-copied program set plus everything precomputable at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProgramState {
    pub progset: ProgramSet,
    pub instructions: ProgramInstructions,
    /// Per program, per tick.
    pub spending: Vec<Vec<f64>>,
    pub capacity: Vec<Vec<f64>>,
    pub coverage_override: Vec<Option<Vec<f64>>>,
    /// Observed coverage fraction; NaN outside the instruction window.
    pub coverage_frac: Vec<Vec<f64>>,
    /// Resolved target compartments per program.
    pub target_comps: Vec<Vec<CompId>>,
    pub covouts: Vec<ResolvedCovout>,
}

// ── Model ───────────────────────────────────────────────────────────────────

/// The integration engine: graph arenas, orderings, and the time loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub settings: Settings,
    pub framework: Framework,
    pub t: Vec<f64>,
    pub dt: f64,
    /// Last completed tick.
    pub t_index: usize,
    pub pops: Vec<Population>,
    pub comps: Vec<Compartment>,
    pub links: Vec<Link>,
    pub characs: Vec<Characteristic>,
    pub pars: Vec<Parameter>,
    par_groups: Vec<ParGroup>,
    junction_order: Vec<CompId>,
    charac_order: Vec<CharacId>,
    /// Function parameters evaluated after the loop, in declaration order.
    output_pars: Vec<ParId>,
    /// Duration-group row counts: (pop, group name, rows).
    group_rows: Vec<(PopId, String, usize)>,
    pub(crate) interactions: Vec<InteractionWeights>,
    pub(crate) aggs: Vec<AggInstance>,
    pub(crate) programs: Option<ProgramState>,
    processed: bool,
}

impl Model {
    /// Construct the integration graph and initialize tick 0.
    pub fn build(
        settings: &Settings,
        framework: &Framework,
        parset: &ParameterSet,
        programs: Option<(&ProgramSet, &ProgramInstructions)>,
    ) -> Result<Model> {
        framework.validate()?;
        parset.validate(framework)?;
        let program_targets = match programs {
            Some((ps, ins)) => {
                ps.validate(framework, parset)?;
                ins.validate(ps)?;
                ps.target_par_names()
            }
            None => HashSet::new(),
        };

        let t = settings.tvec();
        let dt = settings.dt;

        // Instantiate every population.
        let mut builder = GraphBuilder::new(framework, program_targets);
        for pop in &parset.pops {
            builder.add_population(&pop.name, &pop.pop_type)?;
        }
        let GraphBuilder {
            mut comps,
            mut links,
            mut characs,
            mut pars,
            mut pops,
            timed_links,
            ..
        } = builder;

        let mut model = Model {
            settings: settings.clone(),
            framework: framework.clone(),
            t,
            dt,
            t_index: 0,
            pops: Vec::new(),
            comps: Vec::new(),
            links: Vec::new(),
            characs: Vec::new(),
            pars: Vec::new(),
            par_groups: Vec::new(),
            junction_order: Vec::new(),
            charac_order: Vec::new(),
            output_pars: Vec::new(),
            group_rows: Vec::new(),
            interactions: Vec::new(),
            aggs: Vec::new(),
            programs: None,
            processed: false,
        };

        // Parameter data: preallocate, interpolate, scale, clip.
        let tlen = model.t.len();
        for par in pars.iter_mut() {
            par.preallocate(tlen);
        }
        for pop in &pops {
            for &pid in &pop.pars {
                let par = &mut pars[pid.index()];
                if let Some(q) = parset.quantity(&par.name) {
                    par.scale_factor = q.y_factor(&pop.name) * parset.meta_y_factor;
                    if let Some(w) = q.skip_window(&pop.name) {
                        par.skip_function = Some(w);
                    }
                    if q.get(&pop.name).map(|ts| ts.has_data()).unwrap_or(false) {
                        par.vals = parset.interpolate(&par.name, &pop.name, &model.t)?;
                        par.has_data = true;
                        par.constrain_all();
                    }
                }
                if par.skip_function.is_some() && !par.has_data {
                    return Err(EngineError::parset(format!(
                        "parameter '{}' in population '{}' has a skip-function window but no \
                         data to fall back on",
                        par.name, pop.name
                    )));
                }
                if par.is_derivative && !par.has_data {
                    return Err(EngineError::parset(format!(
                        "derivative parameter '{}' in population '{}' needs data for its \
                         initial value",
                        par.name, pop.name
                    )));
                }
            }
        }

        // Transfers: one data parameter per (from, to) pair plus links
        // between corresponding compartments.
        let mut timed_links = timed_links;
        timed_links.extend(wire_transfers(
            parset, &mut pops, &mut comps, &mut links, &mut pars, &model.t,
        )?);

        // Precompute: vectorised evaluation before the loop.
        precompute_pars(&mut pars, &model.t, dt)?;

        // Duration groups: fix row counts, promote timed links.
        model.group_rows = size_duration_groups(&pops, &mut comps, &pars, dt)?;
        for (lid, group) in &timed_links {
            let pop = links[lid.index()].pop;
            let rows = lookup_rows(&model.group_rows, pop, group).ok_or_else(|| {
                EngineError::framework(format!(
                    "duration group '{group}' has no timed compartment in population index {}",
                    pop.0
                ))
            })?;
            if links[lid.index()].is_transfer {
                let dest_pop = comps[links[lid.index()].dest.index()].pop;
                let dest_rows = lookup_rows(&model.group_rows, dest_pop, group);
                if dest_rows != Some(rows) {
                    return Err(EngineError::framework(format!(
                        "duration group '{group}' has mismatched row counts across transfer \
                         populations"
                    )));
                }
            }
            links[lid.index()].make_timed(rows);
        }

        // Preallocate state arrays.
        for c in comps.iter_mut() {
            c.preallocate(tlen);
        }
        for l in links.iter_mut() {
            l.preallocate(tlen);
        }

        // Orderings.
        model.junction_order = junction_topology(&comps, &links)?;
        model.charac_order = charac_dependency_order(&pops, &characs);
        for c in model.charac_order.iter() {
            if characs[c.index()].dynamic {
                characs[c.index()].preallocate(tlen);
            }
        }

        // Initialization solver, one population at a time.
        for pop in &pops {
            init::initialize_population(
                pop,
                &mut comps,
                framework,
                parset,
                model.t[0],
                settings.tolerance,
            )?;
        }

        // Interactions and aggregations.
        model.interactions = interpolate_interactions(parset, &pops, &model.t);
        model.aggs = resolve_aggregations(
            framework, &pops, &mut pars, &mut characs, &model.interactions,
        )?;

        // Per-name execution groups and output parameters.
        let agg_of: HashMap<&str, usize> = model
            .aggs
            .iter()
            .enumerate()
            .filter_map(|(i, a)| {
                a.row_pars
                    .first()
                    .map(|&p| (pars[p.index()].name.as_str(), i))
            })
            .collect();
        let program_target_names: HashSet<String> = match programs {
            Some((ps, _)) => ps.target_par_names(),
            None => HashSet::new(),
        };
        for spec in &framework.pars {
            let ids: Vec<ParId> = pops
                .iter()
                .filter_map(|p| p.par_id(&spec.name))
                .collect();
            if ids.is_empty() {
                continue;
            }
            let any_dynamic = ids.iter().any(|p| pars[p.index()].dynamic);
            if any_dynamic || program_target_names.contains(&spec.name) {
                model.par_groups.push(ParGroup {
                    name: spec.name.clone(),
                    pars: ids,
                    agg: agg_of.get(spec.name.as_str()).copied(),
                });
            }
        }
        model.output_pars = pars
            .iter()
            .filter(|p| (p.function.is_some()) && !p.dynamic && !p.precompute)
            .map(|p| p.id)
            .collect();

        // Program state.
        if let Some((progset, instructions)) = programs {
            model.programs = Some(build_program_state(progset, instructions, &pops, &model.t)?);
        }

        model.pops = pops;
        model.comps = comps;
        model.links = links;
        model.characs = characs;
        model.pars = pars;
        Ok(model)
    }

    /// Run the integration loop over the full grid.
    pub fn process(&mut self) -> Result<()> {
        self.process_with(&CancelToken::new())
    }

    /// Run the integration loop, checking the cancellation token between
    /// ticks. On cancellation the model holds a partial trajectory with
    /// `t_index` marking the last completed tick.
    pub fn process_with(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.processed {
            return Ok(());
        }

        // Initial-tick pre-sequence: parameters, initial junction flush,
        // parameters again (the flush may have moved people), link flows,
        // and a regular balancing pass.
        self.update_pars(0)?;
        self.update_junctions(0, true)?;
        self.update_pars(0)?;
        self.update_links(0)?;
        self.update_junctions(0, false)?;

        for ti in 1..self.t.len() {
            if cancel.is_cancelled() {
                break;
            }
            self.update_comps(ti);
            self.update_pars(ti)?;
            self.update_links(ti)?;
            self.update_junctions(ti, false)?;
            self.t_index = ti;
        }

        self.finalize()?;
        self.processed = true;
        Ok(())
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn pop_named(&self, name: &str) -> Result<&Population> {
        self.pops
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| EngineError::NotFound {
                name: name.to_string(),
                population: name.to_string(),
            })
    }

    /// Total people across a population's compartments, excluding sources
    /// and sinks.
    pub fn popsize(&self, pop: &Population) -> Vec<f64> {
        let mut out = vec![0.0; self.t.len()];
        for &c in &pop.comps {
            let comp = &self.comps[c.index()];
            if comp.counts_toward_popsize() {
                for (o, v) in out.iter_mut().zip(&comp.vals) {
                    *o += v;
                }
            }
        }
        out
    }

    // ── Phase 1: compartments ───────────────────────────────────────────────

    fn update_comps(&mut self, ti: usize) {
        let links = &self.links;
        for comp in self.comps.iter_mut() {
            comp.update(ti, links);
        }
    }

    // ── Phase 2: parameters ─────────────────────────────────────────────────

    fn dep_value(&self, dep: &DepTarget, ti: usize) -> f64 {
        match dep {
            DepTarget::Time => self.t[ti],
            DepTarget::Dt => self.dt,
            DepTarget::Comp(c) => self.comps[c.index()].vals[ti],
            DepTarget::Charac(c) => self.characs[c.index()].vals[ti],
            DepTarget::Par(p) => self.pars[p.index()].vals[ti],
            DepTarget::Flow(ls) => {
                ls.iter()
                    .map(|l| self.links[l.index()].vals[ti])
                    .sum::<f64>()
                    / self.dt
            }
        }
    }

    fn eval_par_function(&self, pid: ParId, ti: usize) -> Result<f64> {
        let par = &self.pars[pid.index()];
        let Some(f) = &par.function else {
            return Ok(par.vals[ti]);
        };
        let mut values = Vec::with_capacity(par.deps.len());
        for dep in &par.deps {
            values.push(self.dep_value(dep, ti));
        }
        f.evaluate(&values)
    }

    fn update_pars(&mut self, ti: usize) -> Result<()> {
        // Dynamic characteristics first, in dependency order.
        for idx in 0..self.charac_order.len() {
            let c = self.charac_order[idx];
            if self.characs[c.index()].dynamic {
                let v = self.characs[c.index()].value_at(
                    ti,
                    &self.comps,
                    &self.characs,
                    self.settings.tolerance,
                );
                self.characs[c.index()].vals[ti] = v;
            }
        }

        // Program-driven overwrites for this tick.
        let prog_vals = self.compute_program_outcomes(ti)?;

        // One parameter name at a time, across populations, in framework
        // declaration order.
        for gi in 0..self.par_groups.len() {
            let group = self.par_groups[gi].clone();
            let mut dx: HashMap<ParId, f64> = HashMap::new();

            for &pid in &group.pars {
                let (dynamic, has_fn, is_deriv, skip) = {
                    let p = &self.pars[pid.index()];
                    (
                        p.dynamic,
                        p.function.is_some(),
                        p.is_derivative,
                        p.in_skip_window(self.t[ti]),
                    )
                };

                if dynamic && has_fn && !skip {
                    let v = self.eval_par_function(pid, ti)?;
                    if is_deriv {
                        dx.insert(pid, v);
                    } else {
                        let v = self.check_finite(pid, v, ti)?;
                        self.pars[pid.index()].vals[ti] = v;
                    }
                }

                if let Some(&pv) = prog_vals.get(&pid) {
                    if is_deriv {
                        dx.insert(pid, pv);
                    } else {
                        let v = self.convert_program_value(pid, pv, ti);
                        self.pars[pid.index()].vals[ti] = v;
                    }
                }
            }

            // Cross-population aggregation reads the just-updated values.
            if let Some(ai) = group.agg {
                self.compute_aggregation(ai, ti)?;
            }

            for &pid in &group.pars {
                if let Some(&d) = dx.get(&pid) {
                    // Explicit Euler step for derivative parameters.
                    if ti + 1 < self.t.len() {
                        let next = self.pars[pid.index()].vals[ti] + d * self.dt;
                        self.pars[pid.index()].vals[ti + 1] = next;
                        self.pars[pid.index()].constrain(ti + 1);
                    }
                } else {
                    self.pars[pid.index()].constrain(ti);
                }
            }
        }
        Ok(())
    }

    /// Non-finite policy: clamp to 0 with a warning for transition
    /// parameters, propagate otherwise.
    fn check_finite(&self, pid: ParId, v: f64, ti: usize) -> Result<f64> {
        if v.is_finite() {
            return Ok(v);
        }
        let par = &self.pars[pid.index()];
        if !par.links.is_empty() {
            warn!(
                parameter = %par.name,
                population = %self.pops[par.pop.index()].name,
                time = self.t[ti],
                "non-finite transition parameter value clamped to 0"
            );
            Ok(0.0)
        } else {
            Err(EngineError::Numeric {
                message: format!("function produced non-finite value {v}"),
                variable: par.name.clone(),
                population: self.pops[par.pop.index()].name.clone(),
                time: self.t[ti],
            })
        }
    }

    /// Program outcomes for number-unit transition parameters arrive as
    /// "per person reached per step" and are annualised here.
    fn convert_program_value(&self, pid: ParId, pv: f64, ti: usize) -> f64 {
        let par = &self.pars[pid.index()];
        if par.format == Some(ParamFormat::Number) && !par.links.is_empty() {
            pv * par.source_popsize(ti, &self.comps, &self.links) / self.dt
        } else {
            pv
        }
    }

    fn compute_aggregation(&mut self, ai: usize, ti: usize) -> Result<()> {
        let inst = self.aggs[ai].clone();
        let nrow = inst.row_pars.len();
        let ncol = inst.col_pars.len();
        let interaction = &self.interactions[inst.interaction];

        let mut out = vec![0.0; nrow];
        for r in 0..nrow {
            let row_pop = self.pars[inst.row_pars[r].index()].pop;
            let mut wsum = 0.0;
            let mut acc = 0.0;
            for c in 0..ncol {
                let col_pop = self.pars[inst.col_pars[c].index()].pop;
                // SRC_* aggregates over the interaction's source pops, so
                // the stored (from, to) weight is read transposed.
                let mut w = if inst.kind.is_source() {
                    interaction.weight(col_pop, row_pop, ti)
                } else {
                    interaction.weight(row_pop, col_pop, ti)
                };
                if let Some(weights) = &inst.weights {
                    w *= self.dep_value(&weights[c], ti);
                }
                wsum += w;
                acc += w * self.pars[inst.col_pars[c].index()].vals[ti];
            }
            out[r] = if inst.kind.is_average() {
                if wsum.abs() > 0.0 {
                    acc / wsum
                } else {
                    0.0
                }
            } else {
                acc
            };
        }
        for (r, &pid) in inst.row_pars.iter().enumerate() {
            self.pars[pid.index()].vals[ti] = out[r];
        }
        Ok(())
    }

    // ── Phase 3: links ──────────────────────────────────────────────────────

    fn update_links(&mut self, ti: usize) -> Result<()> {
        for p in 0..self.pars.len() {
            if self.pars[p].links.is_empty() {
                continue;
            }
            let name = self.pars[p].name.clone();
            let pop_name = self.pops[self.pars[p].pop.index()].name.clone();

            let raw = self.pars[p].vals[ti];
            let mut val = raw;
            if !val.is_finite() {
                warn!(
                    parameter = %name,
                    population = %pop_name,
                    time = self.t[ti],
                    "non-finite transition value clamped to 0"
                );
                val = 0.0;
                self.pars[p].vals[ti] = 0.0;
            } else if val < 0.0 {
                warn!(
                    parameter = %name,
                    population = %pop_name,
                    time = self.t[ti],
                    value = raw,
                    "negative transition value clamped to 0"
                );
                val = 0.0;
                self.pars[p].vals[ti] = 0.0;
            }

            let timescale = self.pars[p].timescale;
            let format = match self.pars[p].format {
                Some(f) => f,
                None => {
                    return Err(EngineError::Numeric {
                        message: "transition parameter has no units".into(),
                        variable: name,
                        population: pop_name,
                        time: self.t[ti],
                    })
                }
            };

            let frac = match format {
                ParamFormat::Duration => (self.dt / (val * timescale)).min(1.0),
                ParamFormat::Probability | ParamFormat::Fraction => {
                    (val * self.dt / timescale).min(1.0)
                }
                ParamFormat::Number => {
                    let amt = val * self.dt / timescale;
                    let first = self.pars[p].links[0];
                    let src = self.links[first.index()].source;
                    if self.comps[src.index()].is_source() {
                        amt
                    } else {
                        let popsize =
                            self.pars[p].source_popsize(ti, &self.comps, &self.links);
                        if popsize > 0.0 {
                            amt / popsize
                        } else {
                            if amt > 0.0 {
                                warn!(
                                    parameter = %name,
                                    population = %pop_name,
                                    time = self.t[ti],
                                    requested = amt,
                                    "number-unit flow requested from empty compartments"
                                );
                            }
                            0.0
                        }
                    }
                }
                // Junction outflow proportions are consumed by balancing.
                ParamFormat::Proportion => val,
                ParamFormat::Unitless => {
                    return Err(EngineError::Numeric {
                        message: "unitless parameter cannot drive transitions".into(),
                        variable: name,
                        population: pop_name,
                        time: self.t[ti],
                    })
                }
            };

            for i in 0..self.pars[p].links.len() {
                let l = self.pars[p].links[i];
                self.links[l.index()].frac = frac;
            }
        }

        let links = &mut self.links;
        for comp in self.comps.iter() {
            comp.resolve_outflows(ti, links);
        }
        Ok(())
    }

    // ── Phase 4: junctions ──────────────────────────────────────────────────

    fn junction_rows(&self, j: CompId) -> usize {
        self.comps[j.index()]
            .duration_group()
            .and_then(|g| lookup_rows(&self.group_rows, self.comps[j.index()].pop, g))
            .unwrap_or(1)
    }

    fn update_junctions(&mut self, ti: usize, initial: bool) -> Result<()> {
        if self.junction_order.is_empty() {
            return Ok(());
        }

        if !initial {
            // Junction outlinks are produced here, not by resolve_outflows:
            // start each pass from zero.
            for idx in 0..self.junction_order.len() {
                let j = self.junction_order[idx];
                let outlinks = self.comps[j.index()].outlinks.clone();
                for l in outlinks {
                    let link = &mut self.links[l.index()];
                    link.vals[ti] = 0.0;
                    if let Some(rv) = &mut link.row_vals {
                        rv.column_mut(ti).fill(0.0);
                    }
                }
            }
        }

        for idx in 0..self.junction_order.len() {
            let j = self.junction_order[idx];
            self.balance_junction(j, ti, initial)?;
        }
        Ok(())
    }

    fn balance_junction(&mut self, j: CompId, ti: usize, initial: bool) -> Result<()> {
        let rows = self.junction_rows(j);
        let mut input = vec![0.0; rows];

        if initial {
            let amount = self.comps[j.index()].vals[ti];
            if amount.is_nan() || amount <= self.settings.tolerance {
                self.comps[j.index()].vals[ti] = 0.0;
                return Ok(());
            }
            let share = amount / rows as f64;
            for slot in input.iter_mut() {
                *slot = share;
            }
        } else {
            let inlinks = self.comps[j.index()].inlinks.clone();
            for l in inlinks {
                let link = &self.links[l.index()];
                match &link.row_vals {
                    Some(rv) if rows > 1 => {
                        // One row toward the flush end; the last row stays
                        // empty. Row 0 absorbs its own shift so nobody is
                        // dropped.
                        input[0] += rv[[0, ti]];
                        for r in 1..rows {
                            input[r - 1] += rv[[r, ti]];
                        }
                    }
                    _ => {
                        input[rows - 1] += link.vals[ti];
                    }
                }
            }
        }

        self.comps[j.index()].vals[ti] = 0.0;
        let total: f64 = input.iter().sum();
        if total <= 0.0 {
            return Ok(());
        }

        // Normalise outlink weights from the driving parameter values.
        let outlinks = self.comps[j.index()].outlinks.clone();
        let mut weights = Vec::with_capacity(outlinks.len());
        for &l in &outlinks {
            let par = self.links[l.index()].par;
            weights.push(self.pars[par.index()].vals[ti].max(0.0));
        }
        let wsum: f64 = weights.iter().sum();
        if wsum <= 0.0 {
            return Err(EngineError::Numeric {
                message: "junction outflow proportions sum to zero".into(),
                variable: self.comps[j.index()].name.clone(),
                population: self.pops[self.comps[j.index()].pop.index()].name.clone(),
                time: self.t[ti],
            });
        }

        for (k, &l) in outlinks.iter().enumerate() {
            let share = weights[k] / wsum;
            if share == 0.0 {
                continue;
            }
            if initial {
                // Move people at this tick directly; downstream junctions
                // are later in topological order and re-flush on their turn.
                let dst = self.links[l.index()].dest;
                let is_timed_link = self.links[l.index()].row_vals.is_some();
                let dest = &mut self.comps[dst.index()];
                let mut into_rows = false;
                if let Some(tc) = dest.timed_mut() {
                    if is_timed_link {
                        for (r, &v) in input.iter().enumerate() {
                            tc.row_vals[[r, ti]] += share * v;
                        }
                    } else {
                        let newest = tc.rows - 1;
                        tc.row_vals[[newest, ti]] += share * total;
                    }
                    into_rows = true;
                }
                if into_rows {
                    // Stored totals of timed compartments are always the
                    // column sum.
                    let col_sum = dest.timed().map(|tc| tc.row_vals.column(ti).sum());
                    if let Some(s) = col_sum {
                        dest.vals[ti] = s;
                    }
                } else {
                    dest.vals[ti] += share * total;
                }
            } else {
                let link = &mut self.links[l.index()];
                link.vals[ti] += share * total;
                if let Some(rv) = &mut link.row_vals {
                    for (r, &v) in input.iter().enumerate() {
                        rv[[r, ti]] += share * v;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Finalization ────────────────────────────────────────────────────────

    /// Fill everything not needed during the loop: non-dynamic
    /// characteristics, then pure-output function parameters, then
    /// function characteristics (which may read the output parameters).
    fn finalize(&mut self) -> Result<()> {
        let end = self.t_index + 1;
        let tlen = self.t.len();

        for idx in 0..self.charac_order.len() {
            let c = self.charac_order[idx];
            if self.characs[c.index()].dynamic || self.characs[c.index()].function.is_some() {
                continue;
            }
            self.characs[c.index()].preallocate(tlen);
            for ti in 0..end {
                let v = self.characs[c.index()].value_at(
                    ti,
                    &self.comps,
                    &self.characs,
                    self.settings.tolerance,
                );
                self.characs[c.index()].vals[ti] = v;
            }
        }

        for idx in 0..self.output_pars.len() {
            let pid = self.output_pars[idx];
            for ti in 0..end {
                let (skip, has_data) = {
                    let p = &self.pars[pid.index()];
                    (p.in_skip_window(self.t[ti]), p.has_data)
                };
                if skip && has_data {
                    continue;
                }
                let v = self.eval_par_function(pid, ti)?;
                self.pars[pid.index()].vals[ti] = v;
            }
            self.pars[pid.index()].constrain_all();
        }

        for idx in 0..self.charac_order.len() {
            let c = self.charac_order[idx];
            if self.characs[c.index()].function.is_none() {
                continue;
            }
            self.characs[c.index()].preallocate(tlen);
            for ti in 0..end {
                let v = self.eval_charac_function(c, ti)?;
                self.characs[c.index()].vals[ti] = v;
            }
        }
        Ok(())
    }

    fn eval_charac_function(&self, cid: CharacId, ti: usize) -> Result<f64> {
        let charac = &self.characs[cid.index()];
        let Some(f) = &charac.function else {
            return Ok(f64::NAN);
        };
        let mut values = Vec::with_capacity(charac.deps.len());
        for dep in &charac.deps {
            values.push(self.dep_value(dep, ti));
        }
        let mut v = f.evaluate(&values)?;
        if let Some(lo) = charac.min {
            v = v.max(lo);
        }
        if let Some(hi) = charac.max {
            v = v.min(hi);
        }
        Ok(v)
    }

    // ── Programs ────────────────────────────────────────────────────────────

    fn compute_program_outcomes(&mut self, ti: usize) -> Result<HashMap<ParId, f64>> {
        let mut out = HashMap::new();
        let t = self.t[ti];
        let comps = &self.comps;
        let Some(ps) = &mut self.programs else {
            return Ok(out);
        };
        if !ps.instructions.active(t) {
            return Ok(out);
        }

        let n = ps.progset.programs.len();
        let mut props = vec![0.0; n];
        for p in 0..n {
            let target_size: f64 = ps.target_comps[p]
                .iter()
                .map(|c| comps[c.index()].vals[ti])
                .sum();
            // Coverage fractions are clipped to 1 before outcomes are
            // formed, so the reported coverage and the outcomes agree.
            let prop = match &ps.coverage_override[p] {
                Some(cov) => cov[ti].clamp(0.0, 1.0),
                None => {
                    if target_size > 0.0 {
                        (ps.capacity[p][ti] / target_size).min(1.0)
                    } else {
                        0.0
                    }
                }
            };
            props[p] = prop;
            ps.coverage_frac[p][ti] = prop;
        }

        for rc in &ps.covouts {
            let mut v = rc.baseline;
            for &(pi, outcome) in &rc.outcomes {
                v += props[pi] * (outcome - rc.baseline);
            }
            out.insert(rc.par, v);
        }
        Ok(out)
    }
}

// ── Build helpers ───────────────────────────────────────────────────────────

fn lookup_rows(group_rows: &[(PopId, String, usize)], pop: PopId, group: &str) -> Option<usize> {
    group_rows
        .iter()
        .find(|(p, g, _)| *p == pop && g == group)
        .map(|(_, _, r)| *r)
}

/// Fix the row count of every duration group from the timed parameter's
/// value at the first tick.
fn size_duration_groups(
    pops: &[Population],
    comps: &mut [Compartment],
    pars: &[Parameter],
    dt: f64,
) -> Result<Vec<(PopId, String, usize)>> {
    let mut out: Vec<(PopId, String, usize)> = Vec::new();
    for pop in pops {
        for &cid in &pop.comps {
            let Some(group) = comps[cid.index()].timed().map(|t| t.group.clone()) else {
                continue;
            };
            let rows = match lookup_rows(&out, pop.id, &group) {
                Some(r) => r,
                None => {
                    let pid = pop.par_id(&group).ok_or_else(|| {
                        EngineError::framework(format!(
                            "duration group '{group}' is not a parameter in population '{}'",
                            pop.name
                        ))
                    })?;
                    let par = &pars[pid.index()];
                    if par.dynamic {
                        return Err(EngineError::framework(format!(
                            "timed parameter '{group}' cannot depend on integration state"
                        )));
                    }
                    let duration_years = par.vals[0] * par.timescale;
                    if !duration_years.is_finite() || duration_years <= 0.0 {
                        return Err(EngineError::parset(format!(
                            "timed parameter '{group}' in population '{}' must have a \
                             positive finite duration, got {duration_years}",
                            pop.name
                        )));
                    }
                    let r = (duration_years / dt).ceil().max(1.0) as usize;
                    out.push((pop.id, group.clone(), r));
                    r
                }
            };
            if let Some(tc) = comps[cid.index()].timed_mut() {
                tc.rows = rows;
            }
        }
    }
    Ok(out)
}

/// Kahn's algorithm over junction-to-junction edges; any cycle refuses the
/// build.
fn junction_topology(comps: &[Compartment], links: &[Link]) -> Result<Vec<CompId>> {
    let juncs: Vec<CompId> = comps
        .iter()
        .filter(|c| c.is_junction())
        .map(|c| c.id)
        .collect();
    if juncs.is_empty() {
        return Ok(Vec::new());
    }
    let pos: HashMap<CompId, usize> = juncs.iter().enumerate().map(|(i, &j)| (j, i)).collect();
    let mut indegree = vec![0usize; juncs.len()];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); juncs.len()];
    for (i, &j) in juncs.iter().enumerate() {
        for &l in &comps[j.index()].outlinks {
            let dst = links[l.index()].dest;
            if let Some(&k) = pos.get(&dst) {
                edges[i].push(k);
                indegree[k] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..juncs.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(juncs.len());
    while let Some(i) = queue.pop_front() {
        order.push(juncs[i]);
        for &k in &edges[i] {
            indegree[k] -= 1;
            if indegree[k] == 0 {
                queue.push_back(k);
            }
        }
    }
    if order.len() != juncs.len() {
        let stuck: Vec<&str> = juncs
            .iter()
            .filter(|j| !order.contains(*j))
            .map(|j| comps[j.index()].name.as_str())
            .collect();
        return Err(EngineError::framework(format!(
            "junctions form a cycle ({}); junction flows must be acyclic",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// Characteristics ordered so components come before the characteristics
/// including them, population by population.
fn charac_dependency_order(pops: &[Population], characs: &[Characteristic]) -> Vec<CharacId> {
    fn visit(
        cid: CharacId,
        characs: &[Characteristic],
        done: &mut HashSet<CharacId>,
        order: &mut Vec<CharacId>,
    ) {
        if !done.insert(cid) {
            return;
        }
        let c = &characs[cid.index()];
        for r in c.includes.iter().chain(c.denominator.iter()) {
            if let VarRef::Charac(inner) = r {
                visit(*inner, characs, done, order);
            }
        }
        order.push(cid);
    }

    let mut done = HashSet::new();
    let mut order = Vec::new();
    for pop in pops {
        for &cid in &pop.characs {
            visit(cid, characs, &mut done, &mut order);
        }
    }
    order
}

/// Evaluate precomputed parameters vectorised over the whole grid, in
/// dependency order (a precomputed parameter may reference another one
/// declared after it).
fn precompute_pars(pars: &mut [Parameter], t: &[f64], dt: f64) -> Result<()> {
    fn visit(i: usize, pars: &[Parameter], done: &mut HashSet<usize>, order: &mut Vec<usize>) {
        if !done.insert(i) {
            return;
        }
        for dep in &pars[i].deps {
            if let DepTarget::Par(q) = dep {
                if pars[q.index()].precompute {
                    visit(q.index(), pars, done, order);
                }
            }
        }
        order.push(i);
    }

    let mut done = HashSet::new();
    let mut order = Vec::new();
    for i in 0..pars.len() {
        if pars[i].precompute {
            visit(i, pars, &mut done, &mut order);
        }
    }

    for p in order {
        if !pars[p].precompute {
            continue;
        }
        let Some(f) = pars[p].function.clone() else {
            continue;
        };
        let deps = pars[p].deps.clone();
        for (ti, &time) in t.iter().enumerate() {
            if pars[p].has_data && pars[p].in_skip_window(time) {
                continue;
            }
            let mut values = Vec::with_capacity(deps.len());
            for dep in &deps {
                let v = match dep {
                    DepTarget::Time => time,
                    DepTarget::Dt => dt,
                    DepTarget::Par(q) => pars[q.index()].vals[ti],
                    // Classification guarantees precompute deps are free of
                    // integration state.
                    _ => f64::NAN,
                };
                values.push(v);
            }
            let mut v = f.evaluate(&values)?;
            if !v.is_finite() {
                warn!(
                    parameter = %pars[p].name,
                    time,
                    "non-finite precomputed value clamped to 0"
                );
                v = 0.0;
            }
            pars[p].vals[ti] = v;
        }
        pars[p].constrain_all();
    }
    Ok(())
}

/// Instantiate transfer parameters and their cross-population links.
/// Returns the created links that preserve duration rows (same-named timed
/// compartments share their group across populations).
fn wire_transfers(
    parset: &ParameterSet,
    pops: &mut [Population],
    comps: &mut Vec<Compartment>,
    links: &mut Vec<Link>,
    pars: &mut Vec<Parameter>,
    t: &[f64],
) -> Result<Vec<(LinkId, String)>> {
    let mut timed = Vec::new();
    for transfer in &parset.transfers {
        for entry in &transfer.entries {
            let from = pops
                .iter()
                .position(|p| p.name == entry.from_pop)
                .ok_or_else(|| {
                    EngineError::parset(format!(
                        "transfer '{}' references unknown population '{}'",
                        transfer.name, entry.from_pop
                    ))
                })?;
            let to = pops
                .iter()
                .position(|p| p.name == entry.to_pop)
                .ok_or_else(|| {
                    EngineError::parset(format!(
                        "transfer '{}' references unknown population '{}'",
                        transfer.name, entry.to_pop
                    ))
                })?;

            let format = entry
                .series
                .units
                .as_deref()
                .and_then(ParamFormat::parse)
                .ok_or_else(|| {
                    EngineError::parset(format!(
                        "transfer '{}' ('{}' → '{}') must declare number or probability \
                         units",
                        transfer.name, entry.from_pop, entry.to_pop
                    ))
                })?;
            if !matches!(
                format,
                ParamFormat::Number | ParamFormat::Probability | ParamFormat::Fraction
            ) {
                return Err(EngineError::parset(format!(
                    "transfer '{}' has unsupported units '{}'",
                    transfer.name,
                    format.as_str()
                )));
            }

            let par_name = format!("{}_{}_to_{}", transfer.name, entry.from_pop, entry.to_pop);
            let pid = ParId(pars.len() as u32);
            let mut par = Parameter::new(pid, pops[from].id, par_name.clone());
            par.format = Some(format);
            par.scale_factor = entry.y_factor * parset.meta_y_factor;
            par.vals = entry
                .series
                .interpolate(t)
                .into_iter()
                .map(|v| v * par.scale_factor)
                .collect();
            par.has_data = true;
            pars.push(par);
            pops[from].pars.push(pid);
            pops[from].par_lookup.insert(par_name, pid);

            // Link every ordinary compartment to its counterpart.
            let sources: Vec<CompId> = pops[from]
                .comps
                .iter()
                .copied()
                .filter(|&c| {
                    comps[c.index()].counts_toward_popsize() && !comps[c.index()].is_junction()
                })
                .collect();
            for src in sources {
                let src_name = comps[src.index()].name.clone();
                let Some(dst) = pops[to].comp_id(&src_name) else {
                    continue;
                };
                let lid = LinkId(links.len() as u32);
                let link_name = format!(
                    "{}.{}->{}@{}",
                    pars[pid.index()].name,
                    src_name,
                    src_name,
                    pops[to].name
                );
                let mut link = Link::new(lid, pops[from].id, link_name.clone(), pid, src, dst);
                link.is_transfer = true;
                if let Some(g) = comps[src.index()].duration_group() {
                    if comps[dst.index()].duration_group() == Some(g) {
                        timed.push((lid, g.to_string()));
                    }
                }
                pars[pid.index()].links.push(lid);
                comps[src.index()].outlinks.push(lid);
                comps[dst.index()].inlinks.push(lid);
                links.push(link);
                pops[from].links.push(lid);
                pops[from]
                    .link_lookup
                    .entry(link_name)
                    .or_default()
                    .push(lid);
            }
        }
    }
    Ok(timed)
}

/// Interpolate interaction weight series onto the grid.
fn interpolate_interactions(
    parset: &ParameterSet,
    pops: &[Population],
    t: &[f64],
) -> Vec<InteractionWeights> {
    let mut out = Vec::new();
    for data in &parset.interactions {
        let mut entries = Vec::new();
        for e in &data.entries {
            let from = pops.iter().find(|p| p.name == e.from_pop);
            let to = pops.iter().find(|p| p.name == e.to_pop);
            if let (Some(f), Some(tp)) = (from, to) {
                entries.push((f.id, tp.id, e.series.interpolate(t)));
            }
        }
        out.push(InteractionWeights {
            name: data.name.clone(),
            entries,
        });
    }
    out
}

/// Resolve population aggregations into arena-id instances and make sure
/// their argument parameters and weight variables are available during
/// the loop.
fn resolve_aggregations(
    fw: &Framework,
    pops: &[Population],
    pars: &mut [Parameter],
    characs: &mut [Characteristic],
    interactions: &[InteractionWeights],
) -> Result<Vec<AggInstance>> {
    let mut out = Vec::new();
    let fw_index: HashMap<&str, usize> = fw
        .pars
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    for (spec_idx, spec) in fw.pars.iter().enumerate() {
        // All instances of one name share the same spec, so inspect any one.
        let Some(first) = pops.iter().find_map(|p| p.par_id(&spec.name)) else {
            continue;
        };
        let Some(agg) = pars[first.index()].agg.clone() else {
            continue;
        };

        let interaction_spec = fw.interaction(&agg.interaction).ok_or_else(|| {
            EngineError::framework(format!(
                "'{}' aggregates over unknown interaction '{}'",
                spec.name, agg.interaction
            ))
        })?;
        let interaction = interactions
            .iter()
            .position(|iw| iw.name == agg.interaction)
            .ok_or_else(|| {
                EngineError::parset(format!(
                    "no interaction data supplied for '{}'",
                    agg.interaction
                ))
            })?;

        let col_type = if agg.kind.is_source() {
            &interaction_spec.from_pop_type
        } else {
            &interaction_spec.to_pop_type
        };

        let row_pars: Vec<ParId> = pops.iter().filter_map(|p| p.par_id(&spec.name)).collect();
        let mut col_pars = Vec::new();
        let mut weights = agg.weight.as_ref().map(|_| Vec::new());
        for pop in pops.iter().filter(|p| &p.pop_type == col_type) {
            let arg = pop.par_id(&agg.par).ok_or_else(|| {
                EngineError::framework(format!(
                    "'{}' aggregates parameter '{}' which is missing from population '{}'",
                    spec.name, agg.par, pop.name
                ))
            })?;
            ensure_in_loop(arg, spec_idx, &fw_index, pars, characs)?;
            col_pars.push(arg);

            if let (Some(list), Some(wname)) = (&mut weights, &agg.weight) {
                let target = resolve_weight(pop, wname, &spec.name)?;
                match &target {
                    DepTarget::Charac(c) => mark_charac_dynamic(characs, *c)?,
                    DepTarget::Par(q) => ensure_in_loop(*q, spec_idx, &fw_index, pars, characs)?,
                    _ => {}
                }
                list.push(target);
            }
        }
        if col_pars.is_empty() {
            return Err(EngineError::framework(format!(
                "'{}' aggregates over interaction '{}' but no population has type '{}'",
                spec.name, agg.interaction, col_type
            )));
        }

        out.push(AggInstance {
            kind: agg.kind,
            row_pars,
            col_pars,
            interaction,
            weights,
        });
    }
    Ok(out)
}

fn resolve_weight(pop: &Population, name: &str, owner: &str) -> Result<DepTarget> {
    if let Some(c) = pop.comp_id(name) {
        return Ok(DepTarget::Comp(c));
    }
    if let Some(c) = pop.charac_id(name) {
        return Ok(DepTarget::Charac(c));
    }
    if let Some(p) = pop.par_id(name) {
        return Ok(DepTarget::Par(p));
    }
    Err(EngineError::framework(format!(
        "'{owner}' uses aggregation weight '{name}' which is missing from population '{}'",
        pop.name
    )))
}

/// Make one parameter's values available at every tick of the loop: data
/// parameters already are; function parameters are promoted to dynamic or
/// precomputed as their dependencies demand.
fn ensure_in_loop(
    pid: ParId,
    user_fw_index: usize,
    fw_index: &HashMap<&str, usize>,
    pars: &mut [Parameter],
    characs: &mut [Characteristic],
) -> Result<()> {
    let (has_fn, dynamic, precompute, name) = {
        let p = &pars[pid.index()];
        (
            p.function.is_some() || p.agg.is_some(),
            p.dynamic,
            p.precompute,
            p.name.clone(),
        )
    };
    let own_index = fw_index.get(name.as_str()).copied().unwrap_or(usize::MAX);
    if dynamic {
        if own_index >= user_fw_index {
            return Err(EngineError::framework(format!(
                "parameter '{name}' must be declared before the aggregation that reads it"
            )));
        }
        return Ok(());
    }
    if !has_fn || precompute {
        return Ok(());
    }

    // Decide between precompute and dynamic from the dependency targets.
    let deps = pars[pid.index()].deps.clone();
    let mut needs_loop = false;
    for dep in &deps {
        match dep {
            DepTarget::Comp(_) | DepTarget::Charac(_) | DepTarget::Flow(_) => needs_loop = true,
            DepTarget::Par(q) => {
                if pars[q.index()].dynamic {
                    needs_loop = true;
                }
            }
            _ => {}
        }
    }
    if needs_loop {
        if own_index >= user_fw_index {
            return Err(EngineError::framework(format!(
                "parameter '{name}' must be declared before the aggregation that reads it"
            )));
        }
        pars[pid.index()].dynamic = true;
        for dep in deps {
            match dep {
                DepTarget::Charac(c) => mark_charac_dynamic(characs, c)?,
                DepTarget::Par(q) => {
                    ensure_in_loop(q, own_index, fw_index, pars, characs)?;
                }
                DepTarget::Flow(_) => {
                    return Err(EngineError::framework(format!(
                        "parameter '{name}' uses a flow-rate dependency and must be \
                         output-only"
                    )))
                }
                _ => {}
            }
        }
    } else {
        pars[pid.index()].precompute = true;
    }
    Ok(())
}

/// Precompute per-program spending/capacity/coverage trajectories and
/// resolve targets against the graph.
fn build_program_state(
    progset: &ProgramSet,
    instructions: &ProgramInstructions,
    pops: &[Population],
    t: &[f64],
) -> Result<ProgramState> {
    let n = progset.programs.len();
    let tlen = t.len();
    let mut spending = Vec::with_capacity(n);
    let mut capacity = Vec::with_capacity(n);
    let mut coverage_override = Vec::with_capacity(n);
    let mut target_comps = Vec::with_capacity(n);

    for prog in &progset.programs {
        let spend: Vec<f64> = match instructions.alloc_override(&prog.name) {
            Some(ts) => ts.interpolate(t),
            None => prog.spend_data.interpolate(t),
        };

        let mut cap: Vec<f64> = match instructions.capacity_override(&prog.name) {
            Some(ts) => ts.interpolate(t),
            None => {
                let mut out = Vec::with_capacity(tlen);
                for (ti, &time) in t.iter().enumerate() {
                    let uc = prog.unit_cost.sample(time);
                    if !uc.is_finite() || uc <= 0.0 {
                        return Err(EngineError::program(format!(
                            "program '{}' has non-positive unit cost {uc} at t={time}",
                            prog.name
                        )));
                    }
                    out.push(spend[ti] / uc);
                }
                out
            }
        };
        if let Some(constraint) = &prog.capacity_constraint {
            for (ti, &time) in t.iter().enumerate() {
                cap[ti] = cap[ti].min(constraint.sample(time));
            }
        }

        spending.push(spend);
        capacity.push(cap);
        coverage_override.push(
            instructions
                .coverage_override(&prog.name)
                .map(|ts| ts.interpolate(t)),
        );

        let mut comps_for_prog = Vec::new();
        for pop_name in &prog.target_pops {
            let pop = pops
                .iter()
                .find(|p| &p.name == pop_name)
                .ok_or_else(|| {
                    EngineError::program(format!(
                        "program '{}' targets unknown population '{pop_name}'",
                        prog.name
                    ))
                })?;
            for comp_name in &prog.target_comps {
                if let Some(c) = pop.comp_id(comp_name) {
                    comps_for_prog.push(c);
                }
            }
        }
        if comps_for_prog.is_empty() {
            return Err(EngineError::program(format!(
                "program '{}' targets no existing compartments",
                prog.name
            )));
        }
        target_comps.push(comps_for_prog);
    }

    let mut covouts = Vec::new();
    for c in &progset.covouts {
        let pop = pops.iter().find(|p| p.name == c.pop).ok_or_else(|| {
            EngineError::program(format!(
                "coverage-outcome for '{}' references unknown population '{}'",
                c.par, c.pop
            ))
        })?;
        let par = pop.par_id(&c.par).ok_or_else(|| {
            EngineError::program(format!(
                "coverage-outcome references parameter '{}' missing from population '{}'",
                c.par, c.pop
            ))
        })?;
        let mut outcomes = Vec::new();
        for (prog_name, outcome) in &c.outcomes {
            let pi = progset
                .programs
                .iter()
                .position(|p| &p.name == prog_name)
                .ok_or_else(|| {
                    EngineError::program(format!(
                        "coverage-outcome for '{}' references unknown program '{prog_name}'",
                        c.par
                    ))
                })?;
            outcomes.push((pi, *outcome));
        }
        covouts.push(ResolvedCovout {
            par,
            baseline: c.baseline,
            outcomes,
        });
    }

    Ok(ProgramState {
        progset: progset.clone(),
        instructions: instructions.clone(),
        spending,
        capacity,
        coverage_override,
        coverage_frac: vec![vec![f64::NAN; tlen]; n],
        target_comps,
        covouts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CharacteristicSpec, CompartmentSpec, ParameterSpec};
    use crate::parset::PopDef;

    /// Closed three-compartment system with a dynamic force of infection.
    fn sir_inputs() -> (Settings, Framework, ParameterSet) {
        let mut fw = Framework::new("sir");
        for name in ["sus", "inf", "rec"] {
            let mut c = CompartmentSpec::new(name);
            c.databook_page = Some("comps".into());
            fw.comps.push(c);
        }
        fw.characs
            .push(CharacteristicSpec::new("alive", &["sus", "inf", "rec"]));

        let mut transpercontact = ParameterSpec::new("transpercontact");
        transpercontact.databook_page = Some("pars".into());
        fw.pars.push(transpercontact);
        let mut contacts = ParameterSpec::new("contacts");
        contacts.databook_page = Some("pars".into());
        fw.pars.push(contacts);
        let mut foi = ParameterSpec::new("foi");
        foi.format = Some(ParamFormat::Probability);
        foi.function = Some("transpercontact*contacts*inf/alive".into());
        fw.pars.push(foi);
        let mut rec_rate = ParameterSpec::new("rec_rate");
        rec_rate.format = Some(ParamFormat::Probability);
        rec_rate.databook_page = Some("pars".into());
        fw.pars.push(rec_rate);
        fw.add_transition("foi", "sus", "inf");
        fw.add_transition("rec_rate", "inf", "rec");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("sus", "adults", 990.0).unwrap();
        ps.set_constant("inf", "adults", 10.0).unwrap();
        ps.set_constant("rec", "adults", 0.0).unwrap();
        ps.set_constant("transpercontact", "adults", 0.005).unwrap();
        ps.set_constant("contacts", "adults", 80.0).unwrap();
        ps.set_constant("rec_rate", "adults", 0.1).unwrap();

        let settings = Settings::new(2000.0, 2020.0, 0.25).unwrap();
        (settings, fw, ps)
    }

    #[test]
    fn build_and_process_sir() {
        let (settings, fw, ps) = sir_inputs();
        let mut model = Model::build(&settings, &fw, &ps, None).unwrap();
        model.process().unwrap();
        assert!(model.is_processed());
        assert_eq!(model.t_index, model.t.len() - 1);

        let pop = model.pop_named("adults").unwrap().clone();
        let popsize = model.popsize(&pop);
        for (ti, n) in popsize.iter().enumerate() {
            assert!(
                (n - 1000.0).abs() < 1e-9,
                "popsize drifted to {n} at tick {ti}"
            );
        }
        // Every compartment stays finite and non-negative.
        for comp in &model.comps {
            for (ti, v) in comp.vals.iter().enumerate() {
                assert!(v.is_finite() && *v >= 0.0, "{} at {ti}: {v}", comp.name);
            }
        }
        // The epidemic actually happened.
        let inf = pop.comp_id("inf").unwrap();
        let last = model.t.len() - 1;
        assert!(model.comps[inf.index()].vals[last] > 0.0);
    }

    #[test]
    fn process_twice_is_a_no_op() {
        let (settings, fw, ps) = sir_inputs();
        let mut model = Model::build(&settings, &fw, &ps, None).unwrap();
        model.process().unwrap();
        let snapshot: Vec<Vec<f64>> = model.comps.iter().map(|c| c.vals.clone()).collect();
        model.process().unwrap();
        let again: Vec<Vec<f64>> = model.comps.iter().map(|c| c.vals.clone()).collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn cancellation_yields_partial_result() {
        let (settings, fw, ps) = sir_inputs();
        let mut model = Model::build(&settings, &fw, &ps, None).unwrap();
        let token = CancelToken::new();
        token.cancel();
        model.process_with(&token).unwrap();
        assert_eq!(model.t_index, 0);
    }

    #[test]
    fn dynamic_characteristic_tracks_compartments() {
        let (settings, fw, ps) = sir_inputs();
        let mut model = Model::build(&settings, &fw, &ps, None).unwrap();
        model.process().unwrap();
        let pop = model.pop_named("adults").unwrap();
        let alive = pop.charac_id("alive").unwrap();
        assert!(model.characs[alive.index()].dynamic);
        for ti in 0..model.t.len() {
            assert!((model.characs[alive.index()].vals[ti] - 1000.0).abs() < 1e-9);
        }
    }

    #[test]
    fn junction_chain_routes_everything_to_the_end() {
        // inflow → J1 → (J2 | rec); J2 → rec2, with equal weights out of J1.
        let mut fw = Framework::new("junc");
        let mut start = CompartmentSpec::new("start");
        start.databook_page = Some("comps".into());
        fw.comps.push(start);
        for name in ["j1", "j2"] {
            let mut c = CompartmentSpec::new(name);
            c.is_junction = true;
            fw.comps.push(c);
        }
        for name in ["rec_a", "rec_b"] {
            let mut c = CompartmentSpec::new(name);
            c.databook_page = Some("comps".into());
            fw.comps.push(c);
        }

        let mut move_in = ParameterSpec::new("move_in");
        move_in.format = Some(ParamFormat::Probability);
        move_in.databook_page = Some("pars".into());
        fw.pars.push(move_in);
        for name in ["w1", "w2", "w3"] {
            let mut w = ParameterSpec::new(name);
            w.format = Some(ParamFormat::Proportion);
            w.databook_page = Some("pars".into());
            fw.pars.push(w);
        }
        fw.add_transition("move_in", "start", "j1");
        fw.add_transition("w1", "j1", "j2");
        fw.add_transition("w2", "j1", "rec_a");
        fw.add_transition("w3", "j2", "rec_b");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("start", "adults", 100.0).unwrap();
        ps.set_constant("rec_a", "adults", 0.0).unwrap();
        ps.set_constant("rec_b", "adults", 0.0).unwrap();
        ps.set_constant("move_in", "adults", 1.0).unwrap();
        ps.set_constant("w1", "adults", 0.5).unwrap();
        ps.set_constant("w2", "adults", 0.5).unwrap();
        ps.set_constant("w3", "adults", 1.0).unwrap();

        let settings = Settings::new(2000.0, 2010.0, 1.0).unwrap();
        let mut model = Model::build(&settings, &fw, &ps, None).unwrap();
        model.process().unwrap();

        let pop = model.pop_named("adults").unwrap().clone();
        let j1 = pop.comp_id("j1").unwrap();
        let j2 = pop.comp_id("j2").unwrap();
        for ti in 0..model.t.len() {
            assert!(model.comps[j1.index()].vals[ti].abs() < 1e-9);
            assert!(model.comps[j2.index()].vals[ti].abs() < 1e-9);
        }
        // Everyone ends up split between rec_a and rec_b, none lost.
        let last = model.t.len() - 1;
        let total: f64 = ["start", "rec_a", "rec_b"]
            .iter()
            .map(|n| model.comps[pop.comp_id(n).unwrap().index()].vals[last])
            .sum();
        assert!((total - 100.0).abs() < 1e-9);
        let rec_a = model.comps[pop.comp_id("rec_a").unwrap().index()].vals[last];
        let rec_b = model.comps[pop.comp_id("rec_b").unwrap().index()].vals[last];
        assert!((rec_a - rec_b).abs() < 1e-9);
    }

    #[test]
    fn junction_cycle_refused_at_build() {
        let mut fw = Framework::new("cycle");
        let mut start = CompartmentSpec::new("start");
        start.databook_page = Some("comps".into());
        fw.comps.push(start);
        for name in ["j1", "j2"] {
            let mut c = CompartmentSpec::new(name);
            c.is_junction = true;
            fw.comps.push(c);
        }
        let mut move_in = ParameterSpec::new("move_in");
        move_in.format = Some(ParamFormat::Probability);
        move_in.databook_page = Some("pars".into());
        fw.pars.push(move_in);
        for name in ["w1", "w2"] {
            let mut w = ParameterSpec::new(name);
            w.format = Some(ParamFormat::Proportion);
            w.databook_page = Some("pars".into());
            fw.pars.push(w);
        }
        fw.add_transition("move_in", "start", "j1");
        fw.add_transition("w1", "j1", "j2");
        fw.add_transition("w2", "j2", "j1");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("start", "adults", 100.0).unwrap();
        ps.set_constant("move_in", "adults", 0.5).unwrap();
        ps.set_constant("w1", "adults", 1.0).unwrap();
        ps.set_constant("w2", "adults", 1.0).unwrap();

        let settings = Settings::new(2000.0, 2005.0, 1.0).unwrap();
        let err = Model::build(&settings, &fw, &ps, None).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn serde_roundtrip_preserves_trajectories() {
        let (settings, fw, ps) = sir_inputs();
        let mut model = Model::build(&settings, &fw, &ps, None).unwrap();
        model.process().unwrap();
        let bytes = bincode::serialize(&model).unwrap();
        let back: Model = bincode::deserialize(&bytes).unwrap();
        for (a, b) in model.comps.iter().zip(&back.comps) {
            assert_eq!(a.vals, b.vals);
        }
        assert_eq!(bincode::serialize(&back).unwrap(), bytes);
    }
}
