// population.rs — Per-population graph instantiation and wiring
//
// Transforms the validated framework tables into arena nodes for one
// population: compartments, characteristics, parameters, and links, in
// declaration order. Also resolves function dependencies to typed targets
// and classifies every parameter's evaluation mode (data-only /
// precomputed / dynamic).
//
// Preconditions: `framework.validate()` has passed.
// Postconditions: arena vectors hold a fully wired population; parameter
//                 flags are consistent with the selection rule.
// Failure modes: unresolvable names for this population's type, circular
//                parameter dependencies, flow references from non-output
//                parameters.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::characteristic::Characteristic;
use crate::compartment::{CompKind, Compartment, TimedComp};
use crate::error::{EngineError, Result};
use crate::expr::{self, ParsedFunction};
use crate::framework::{Framework, FLOW_SUFFIX};
use crate::id::{CharacId, CompId, LinkId, ParId, PopId, VarRef};
use crate::link::Link;
use crate::parameter::{DepTarget, Parameter};

/// One population's slice of the integration graph: id lists into the
/// model arenas plus name lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    pub id: PopId,
    pub name: String,
    pub pop_type: String,
    pub comps: Vec<CompId>,
    pub characs: Vec<CharacId>,
    pub pars: Vec<ParId>,
    pub links: Vec<LinkId>,
    pub(crate) comp_lookup: BTreeMap<String, CompId>,
    pub(crate) charac_lookup: BTreeMap<String, CharacId>,
    pub(crate) par_lookup: BTreeMap<String, ParId>,
    pub(crate) link_lookup: BTreeMap<String, Vec<LinkId>>,
}

impl Population {
    fn new(id: PopId, name: &str, pop_type: &str) -> Self {
        Population {
            id,
            name: name.to_string(),
            pop_type: pop_type.to_string(),
            comps: Vec::new(),
            characs: Vec::new(),
            pars: Vec::new(),
            links: Vec::new(),
            comp_lookup: BTreeMap::new(),
            charac_lookup: BTreeMap::new(),
            par_lookup: BTreeMap::new(),
            link_lookup: BTreeMap::new(),
        }
    }

    pub fn comp_id(&self, name: &str) -> Option<CompId> {
        self.comp_lookup.get(name).copied()
    }

    pub fn charac_id(&self, name: &str) -> Option<CharacId> {
        self.charac_lookup.get(name).copied()
    }

    pub fn par_id(&self, name: &str) -> Option<ParId> {
        self.par_lookup.get(name).copied()
    }

    pub fn links_named(&self, name: &str) -> Option<&[LinkId]> {
        self.link_lookup.get(name).map(|v| v.as_slice())
    }

    /// Resolve a name the way lookups are ordered everywhere: compartment,
    /// characteristic, parameter, then links by tag.
    pub fn resolve(&self, name: &str) -> Option<Vec<VarRef>> {
        if let Some(c) = self.comp_id(name) {
            return Some(vec![VarRef::Comp(c)]);
        }
        if let Some(c) = self.charac_id(name) {
            return Some(vec![VarRef::Charac(c)]);
        }
        if let Some(p) = self.par_id(name) {
            return Some(vec![VarRef::Par(p)]);
        }
        self.links_named(name)
            .map(|ls| ls.iter().map(|&l| VarRef::Link(l)).collect())
    }
}

/// Accumulates arena nodes while populations are instantiated. The model
/// takes the vectors over when construction finishes.
pub(crate) struct GraphBuilder<'f> {
    pub fw: &'f Framework,
    pub comps: Vec<Compartment>,
    pub links: Vec<Link>,
    pub characs: Vec<Characteristic>,
    pub pars: Vec<Parameter>,
    pub pops: Vec<Population>,
    /// Links that become duration-preserving once group row counts are
    /// known: (link, duration group name).
    pub timed_links: Vec<(LinkId, String)>,
    /// Parameter names a program set will overwrite.
    pub program_targets: HashSet<String>,
}

impl<'f> GraphBuilder<'f> {
    pub fn new(fw: &'f Framework, program_targets: HashSet<String>) -> Self {
        GraphBuilder {
            fw,
            comps: Vec::new(),
            links: Vec::new(),
            characs: Vec::new(),
            pars: Vec::new(),
            pops: Vec::new(),
            timed_links: Vec::new(),
            program_targets,
        }
    }

    /// Instantiate one population: nodes, wiring, dependency resolution,
    /// and evaluation-mode classification.
    pub fn add_population(&mut self, name: &str, pop_type: &str) -> Result<PopId> {
        let pid = PopId(self.pops.len() as u32);
        let mut pop = Population::new(pid, name, pop_type);

        self.instantiate_comps(&mut pop);
        self.instantiate_characs(&mut pop)?;
        self.instantiate_pars(&mut pop)?;
        self.create_links(&mut pop)?;
        self.resolve_function_deps(&pop)?;
        self.classify(&pop)?;

        self.pops.push(pop);
        Ok(pid)
    }

    /// Whether a spec'd item belongs in a population of `pop_type`.
    fn type_matches(spec_type: Option<&str>, pop_type: &str) -> bool {
        spec_type.map(|t| t == pop_type).unwrap_or(true)
    }

    fn instantiate_comps(&mut self, pop: &mut Population) {
        for spec in &self.fw.comps {
            if !Self::type_matches(spec.pop_type.as_deref(), &pop.pop_type) {
                continue;
            }
            let cid = CompId(self.comps.len() as u32);
            let kind = if spec.is_source {
                CompKind::Source
            } else if spec.is_sink {
                CompKind::Sink
            } else if spec.is_junction {
                CompKind::Junction {
                    duration_group: spec.duration_group.clone(),
                }
            } else if let Some(group) = &spec.duration_group {
                CompKind::Timed(TimedComp {
                    group: group.clone(),
                    rows: 0,
                    row_vals: Array2::zeros((0, 0)),
                    flush: None,
                })
            } else {
                CompKind::Plain
            };
            self.comps
                .push(Compartment::new(cid, pop.id, spec.name.clone(), kind));
            pop.comps.push(cid);
            pop.comp_lookup.insert(spec.name.clone(), cid);
        }
    }

    fn instantiate_characs(&mut self, pop: &mut Population) -> Result<()> {
        // First pass: create the objects so nested references resolve.
        for spec in &self.fw.characs {
            if !Self::type_matches(spec.pop_type.as_deref(), &pop.pop_type) {
                continue;
            }
            let cid = CharacId(self.characs.len() as u32);
            self.characs
                .push(Characteristic::new(cid, pop.id, spec.name.clone()));
            pop.characs.push(cid);
            pop.charac_lookup.insert(spec.name.clone(), cid);
        }

        // Second pass: wire includes and denominators.
        for spec in &self.fw.characs {
            let Some(cid) = pop.charac_id(&spec.name) else {
                continue;
            };
            let mut includes = Vec::new();
            for comp in &spec.components {
                includes.push(self.resolve_include(pop, &spec.name, comp)?);
            }
            let denominator = match &spec.denominator {
                Some(d) => Some(self.resolve_include(pop, &spec.name, d)?),
                None => None,
            };
            let function = match &spec.function {
                Some(src) => match expr::parse_function(src)? {
                    ParsedFunction::Expr(c) => Some(c),
                    ParsedFunction::Aggregation(_) => {
                        return Err(EngineError::framework(format!(
                            "characteristic '{}' cannot be a population aggregation",
                            spec.name
                        )))
                    }
                },
                None => None,
            };
            let charac = &mut self.characs[cid.index()];
            charac.includes = includes;
            charac.denominator = denominator;
            charac.function = function;
            charac.min = spec.min;
            charac.max = spec.max;
        }
        Ok(())
    }

    fn resolve_include(&self, pop: &Population, owner: &str, name: &str) -> Result<VarRef> {
        if let Some(c) = pop.comp_id(name) {
            return Ok(VarRef::Comp(c));
        }
        if let Some(c) = pop.charac_id(name) {
            return Ok(VarRef::Charac(c));
        }
        Err(EngineError::framework(format!(
            "characteristic '{owner}' includes '{name}' which does not exist in population \
             '{}'",
            pop.name
        )))
    }

    fn instantiate_pars(&mut self, pop: &mut Population) -> Result<()> {
        for spec in &self.fw.pars {
            if !Self::type_matches(spec.pop_type.as_deref(), &pop.pop_type) {
                continue;
            }
            let id = ParId(self.pars.len() as u32);
            let mut par = Parameter::new(id, pop.id, spec.name.clone());
            par.format = spec.format;
            par.timescale = spec.effective_timescale();
            par.is_derivative = spec.is_derivative;
            if spec.min.is_some() || spec.max.is_some() {
                par.limits = Some((
                    spec.min.unwrap_or(f64::NEG_INFINITY),
                    spec.max.unwrap_or(f64::INFINITY),
                ));
            }
            if let Some(src) = &spec.function {
                match expr::parse_function(src)? {
                    ParsedFunction::Expr(c) => par.function = Some(c),
                    ParsedFunction::Aggregation(a) => par.agg = Some(a),
                }
            }
            self.pars.push(par);
            pop.pars.push(id);
            pop.par_lookup.insert(spec.name.clone(), id);
        }
        Ok(())
    }

    fn create_links(&mut self, pop: &mut Population) -> Result<()> {
        for spec in &self.fw.pars {
            let Some(par_id) = pop.par_id(&spec.name) else {
                continue;
            };
            for (from, to) in self.fw.transitions_for(&spec.name) {
                let src = pop.comp_id(from).ok_or_else(|| {
                    EngineError::framework(format!(
                        "transition '{}': compartment '{from}' missing from population '{}'",
                        spec.name, pop.name
                    ))
                })?;
                let dst = pop.comp_id(to).ok_or_else(|| {
                    EngineError::framework(format!(
                        "transition '{}': compartment '{to}' missing from population '{}'",
                        spec.name, pop.name
                    ))
                })?;
                let is_flush = spec.is_timed
                    && !self.comps[src.index()].is_junction()
                    && self.comps[src.index()].duration_group() == Some(spec.name.as_str());
                self.connect(pop, par_id, src, dst, is_flush, false)?;
            }
        }
        Ok(())
    }

    /// Create one link and wire it into the graph. Decides whether the
    /// link preserves duration rows:
    ///   - a timed compartment links into its own duration group (a timed
    ///     compartment with the same parameter, or a junction whose group
    ///     is that parameter);
    ///   - a junction belonging to a duration group always produces timed
    ///     outlinks.
    /// Flush links are always scalar: row 0 leaves the group.
    pub(crate) fn connect(
        &mut self,
        pop: &mut Population,
        par: ParId,
        src: CompId,
        dst: CompId,
        is_flush: bool,
        is_transfer: bool,
    ) -> Result<LinkId> {
        let id = LinkId(self.links.len() as u32);
        let par_name = self.pars[par.index()].name.clone();
        let src_name = self.comps[src.index()].name.clone();
        let dst_name = self.comps[dst.index()].name.clone();
        let name = if is_transfer {
            let dst_pop = self.comps[dst.index()].pop;
            format!(
                "{par_name}.{src_name}->{dst_name}@{}",
                self.pops[dst_pop.index()].name
            )
        } else {
            format!("{par_name}.{src_name}->{dst_name}")
        };

        let mut link = Link::new(id, pop.id, name.clone(), par, src, dst);
        link.is_flush = is_flush;
        link.is_transfer = is_transfer;

        if !is_flush {
            let group = match self.comps[src.index()].duration_group() {
                Some(g) if self.comps[src.index()].is_junction() => Some(g.to_string()),
                Some(g) if self.comps[dst.index()].duration_group() == Some(g) => {
                    Some(g.to_string())
                }
                _ => None,
            };
            if let Some(g) = group {
                self.timed_links.push((id, g));
            }
        }

        self.pars[par.index()].links.push(id);
        self.comps[src.index()].outlinks.push(id);
        self.comps[dst.index()].inlinks.push(id);
        if is_flush {
            if let Some(tc) = self.comps[src.index()].timed_mut() {
                tc.flush = Some(id);
            }
        }
        self.links.push(link);
        pop.links.push(id);
        pop.link_lookup.entry(name).or_default().push(id);
        Ok(id)
    }

    /// Resolve a dependency name within one population.
    fn resolve_name(&self, pop: &Population, owner: &str, name: &str) -> Result<DepTarget> {
        match name {
            "t" => return Ok(DepTarget::Time),
            "dt" => return Ok(DepTarget::Dt),
            _ => {}
        }
        if let Some(base) = name.strip_suffix(FLOW_SUFFIX) {
            let par = pop.par_id(base).ok_or_else(|| {
                EngineError::framework(format!(
                    "'{owner}' references flow '{name}' but '{base}' does not exist in \
                     population '{}'",
                    pop.name
                ))
            })?;
            return Ok(DepTarget::Flow(self.pars[par.index()].links.clone()));
        }
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
            "'{owner}' references '{name}' which does not exist in population '{}'",
            pop.name
        )))
    }

    fn resolve_function_deps(&mut self, pop: &Population) -> Result<()> {
        for &pid in &pop.pars {
            if let Some(f) = &self.pars[pid.index()].function {
                let names = f.deps.clone();
                let owner = self.pars[pid.index()].name.clone();
                let mut targets = Vec::with_capacity(names.len());
                for n in &names {
                    targets.push(self.resolve_name(pop, &owner, n)?);
                }
                self.pars[pid.index()].deps = targets;
            }
        }
        for &cid in &pop.characs {
            if let Some(f) = &self.characs[cid.index()].function {
                let names = f.deps.clone();
                let owner = self.characs[cid.index()].name.clone();
                let mut targets = Vec::with_capacity(names.len());
                for n in &names {
                    targets.push(self.resolve_name(pop, &owner, n)?);
                }
                self.characs[cid.index()].deps = targets;
            }
        }
        Ok(())
    }

    // ── Evaluation-mode classification ──────────────────────────────────────
    //
    // A parameter is dynamic iff it drives links and transitively depends on
    // a compartment, characteristic, flow, dynamic parameter, or a
    // program-overwritten parameter; or it is a derivative; or it is a
    // population aggregation. Link-driving function parameters that are not
    // dynamic are precomputed. Everything else with a function is a pure
    // output, evaluated after the loop.

    fn classify(&mut self, pop: &Population) -> Result<()> {
        let mut memo: HashMap<ParId, bool> = HashMap::new();
        for &pid in &pop.pars {
            let mut visiting = HashSet::new();
            self.requires_loop(pid, &mut memo, &mut visiting)?;
        }

        for &pid in &pop.pars {
            let rl = memo[&pid];
            let par = &mut self.pars[pid.index()];
            if par.is_derivative || par.agg.is_some() {
                par.dynamic = true;
            }
            if !par.links.is_empty() && par.function.is_some() {
                if rl {
                    par.dynamic = true;
                } else {
                    par.precompute = true;
                }
            }
        }

        // Pull the dependency chains of dynamic parameters into the loop.
        let dynamic: Vec<ParId> = pop
            .pars
            .iter()
            .copied()
            .filter(|p| self.pars[p.index()].dynamic)
            .collect();
        for pid in dynamic {
            self.mark_deps_needed(pid, &memo)?;
        }

        // Flow references are output-only: a parameter evaluated before or
        // during the loop would read link values that do not exist yet.
        for &pid in &pop.pars {
            let par = &self.pars[pid.index()];
            if (par.dynamic || par.precompute)
                && par.deps.iter().any(|d| matches!(d, DepTarget::Flow(_)))
            {
                return Err(EngineError::framework(format!(
                    "parameter '{}' uses a flow-rate dependency and must be output-only",
                    par.name
                )));
            }
        }
        Ok(())
    }

    fn requires_loop(
        &self,
        pid: ParId,
        memo: &mut HashMap<ParId, bool>,
        visiting: &mut HashSet<ParId>,
    ) -> Result<bool> {
        if let Some(&v) = memo.get(&pid) {
            return Ok(v);
        }
        if !visiting.insert(pid) {
            return Err(EngineError::framework(format!(
                "parameter '{}' participates in a circular dependency",
                self.pars[pid.index()].name
            )));
        }
        let par = &self.pars[pid.index()];
        let mut rl = par.is_derivative
            || par.agg.is_some()
            || self.program_targets.contains(&par.name);
        if !rl {
            for dep in &par.deps {
                match dep {
                    DepTarget::Comp(_) | DepTarget::Charac(_) | DepTarget::Flow(_) => {
                        rl = true;
                        break;
                    }
                    DepTarget::Par(q) => {
                        if self.requires_loop(*q, memo, visiting)? {
                            rl = true;
                            break;
                        }
                    }
                    DepTarget::Time | DepTarget::Dt => {}
                }
            }
        }
        visiting.remove(&pid);
        memo.insert(pid, rl);
        Ok(rl)
    }

    /// Make sure every dependency of an in-loop parameter has a value at
    /// every tick of the loop.
    fn mark_deps_needed(&mut self, pid: ParId, memo: &HashMap<ParId, bool>) -> Result<()> {
        let deps = self.pars[pid.index()].deps.clone();
        for dep in deps {
            match dep {
                DepTarget::Charac(c) => self.mark_charac_dynamic(c)?,
                DepTarget::Par(q) => {
                    let (has_fn, is_dyn, is_pre) = {
                        let p = &self.pars[q.index()];
                        (p.function.is_some() || p.agg.is_some(), p.dynamic, p.precompute)
                    };
                    if has_fn && !is_dyn && !is_pre {
                        if memo.get(&q).copied().unwrap_or(false) {
                            if q > pid {
                                return Err(EngineError::framework(format!(
                                    "parameter '{}' must be declared before '{}' because it \
                                     is computed during integration",
                                    self.pars[q.index()].name,
                                    self.pars[pid.index()].name
                                )));
                            }
                            self.pars[q.index()].dynamic = true;
                            self.mark_deps_needed(q, memo)?;
                        } else {
                            self.pars[q.index()].precompute = true;
                        }
                    } else if is_dyn && q > pid {
                        return Err(EngineError::framework(format!(
                            "parameter '{}' must be declared before '{}' because it is \
                             computed during integration",
                            self.pars[q.index()].name,
                            self.pars[pid.index()].name
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn mark_charac_dynamic(&mut self, cid: CharacId) -> Result<()> {
        mark_charac_dynamic(&mut self.characs, cid)
    }
}

/// Flag a characteristic (and, transitively, its nested components) as
/// needed during the integration loop. Function characteristics are pure
/// outputs and cannot be dependencies.
pub(crate) fn mark_charac_dynamic(characs: &mut [Characteristic], cid: CharacId) -> Result<()> {
    if characs[cid.index()].dynamic {
        return Ok(());
    }
    if characs[cid.index()].function.is_some() {
        return Err(EngineError::framework(format!(
            "characteristic '{}' has a function and cannot be a dependency",
            characs[cid.index()].name
        )));
    }
    characs[cid.index()].dynamic = true;
    let refs = characs[cid.index()].includes.clone();
    for r in refs.into_iter().chain(characs[cid.index()].denominator) {
        if let VarRef::Charac(c) = r {
            mark_charac_dynamic(characs, c)?;
        }
    }
    Ok(())
}
