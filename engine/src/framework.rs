// framework.rs — Typed framework tables and load-time validation
//
// The framework is the immutable description of the transition network:
// compartments, characteristics, parameters, interactions, transitions,
// and cascades. Everything the integration graph needs is validated here,
// before any population is instantiated, so the builder can assume a
// well-formed network.
//
// Preconditions: none (plain data).
// Postconditions: `validate()` passing implies every network invariant that
//                 can be checked statically.
// Failure modes: `EngineError::Framework` with the offending item named.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::expr::{self, AggKind, ParsedFunction, BUILTIN_FUNCTIONS, RESERVED_BINDINGS};

/// Default population type assigned when a framework does not use types.
pub const DEFAULT_POP_TYPE: &str = "default";

/// Suffix for flow-rate dependency references (`par:flow`).
pub const FLOW_SUFFIX: &str = ":flow";

// ── Units ───────────────────────────────────────────────────────────────────

/// Units a transition parameter can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamFormat {
    Probability,
    Number,
    Duration,
    Proportion,
    Fraction,
    Unitless,
}

impl ParamFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "probability" => Some(ParamFormat::Probability),
            "number" => Some(ParamFormat::Number),
            "duration" => Some(ParamFormat::Duration),
            "proportion" => Some(ParamFormat::Proportion),
            "fraction" => Some(ParamFormat::Fraction),
            "" | "unitless" => Some(ParamFormat::Unitless),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamFormat::Probability => "probability",
            ParamFormat::Number => "number",
            ParamFormat::Duration => "duration",
            ParamFormat::Proportion => "proportion",
            ParamFormat::Fraction => "fraction",
            ParamFormat::Unitless => "unitless",
        }
    }
}

impl fmt::Display for ParamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Table rows ──────────────────────────────────────────────────────────────

/// One compartment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentSpec {
    pub name: String,
    pub display_name: String,
    pub is_source: bool,
    pub is_sink: bool,
    pub is_junction: bool,
    /// Name of the timed parameter whose duration group this compartment
    /// belongs to.
    pub duration_group: Option<String>,
    /// Explicit setup weight; defaults to 1 when a databook page is set,
    /// 0 otherwise.
    pub setup_weight: Option<f64>,
    pub databook_page: Option<String>,
    pub databook_order: Option<i32>,
    pub pop_type: Option<String>,
}

impl CompartmentSpec {
    pub fn new(name: &str) -> Self {
        CompartmentSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            is_source: false,
            is_sink: false,
            is_junction: false,
            duration_group: None,
            setup_weight: None,
            databook_page: None,
            databook_order: None,
            pop_type: None,
        }
    }

    pub fn effective_setup_weight(&self) -> f64 {
        self.setup_weight
            .unwrap_or(if self.databook_page.is_some() { 1.0 } else { 0.0 })
    }
}

/// One characteristic definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacteristicSpec {
    pub name: String,
    pub display_name: String,
    /// Compartment or characteristic code names whose values are summed.
    pub components: Vec<String>,
    pub denominator: Option<String>,
    /// Optional function expression; a function characteristic is a pure
    /// output computed after integration.
    pub function: Option<String>,
    pub setup_weight: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub databook_page: Option<String>,
    pub databook_order: Option<i32>,
    pub pop_type: Option<String>,
}

impl CharacteristicSpec {
    pub fn new(name: &str, components: &[&str]) -> Self {
        CharacteristicSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            components: components.iter().map(|s| s.to_string()).collect(),
            denominator: None,
            function: None,
            setup_weight: None,
            min: None,
            max: None,
            databook_page: None,
            databook_order: None,
            pop_type: None,
        }
    }

    pub fn effective_setup_weight(&self) -> f64 {
        self.setup_weight
            .unwrap_or(if self.databook_page.is_some() { 1.0 } else { 0.0 })
    }
}

/// One parameter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub display_name: String,
    pub format: Option<ParamFormat>,
    /// Years per unit of this parameter's rate (e.g. 1/52 for weekly).
    pub timescale: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub function: Option<String>,
    /// The function yields dx/dt, integrated with explicit Euler.
    pub is_derivative: bool,
    /// This parameter names a duration group; compartments tagged with it
    /// track per-duration subcompartments.
    pub is_timed: bool,
    pub pop_type: Option<String>,
    pub databook_page: Option<String>,
    pub databook_order: Option<i32>,
}

impl ParameterSpec {
    pub fn new(name: &str) -> Self {
        ParameterSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            format: None,
            timescale: None,
            min: None,
            max: None,
            function: None,
            is_derivative: false,
            is_timed: false,
            pop_type: None,
            databook_page: None,
            databook_order: None,
        }
    }

    pub fn effective_timescale(&self) -> f64 {
        self.timescale.unwrap_or(1.0)
    }
}

/// One interaction (cross-population weight matrix) definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSpec {
    pub name: String,
    pub display_name: String,
    pub from_pop_type: String,
    pub to_pop_type: String,
}

impl InteractionSpec {
    pub fn new(name: &str) -> Self {
        InteractionSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            from_pop_type: DEFAULT_POP_TYPE.to_string(),
            to_pop_type: DEFAULT_POP_TYPE.to_string(),
        }
    }
}

/// One transition matrix entry: `parameter` drives a flow `from → to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub par: String,
    pub from: String,
    pub to: String,
}

/// One cascade stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStage {
    pub name: String,
    pub constituents: Vec<String>,
}

/// A reporting cascade: named, ordered stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeSpec {
    pub name: String,
    pub stages: Vec<CascadeStage>,
}

// ── Framework ───────────────────────────────────────────────────────────────

/// The complete framework: typed tables in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Framework {
    pub name: String,
    pub comps: Vec<CompartmentSpec>,
    pub characs: Vec<CharacteristicSpec>,
    pub pars: Vec<ParameterSpec>,
    pub interactions: Vec<InteractionSpec>,
    pub transitions: Vec<Transition>,
    pub cascades: Vec<CascadeSpec>,
}

impl Framework {
    pub fn new(name: &str) -> Self {
        Framework {
            name: name.to_string(),
            ..Framework::default()
        }
    }

    pub fn comp(&self, name: &str) -> Option<&CompartmentSpec> {
        self.comps.iter().find(|c| c.name == name)
    }

    pub fn charac(&self, name: &str) -> Option<&CharacteristicSpec> {
        self.characs.iter().find(|c| c.name == name)
    }

    pub fn par(&self, name: &str) -> Option<&ParameterSpec> {
        self.pars.iter().find(|p| p.name == name)
    }

    pub fn interaction(&self, name: &str) -> Option<&InteractionSpec> {
        self.interactions.iter().find(|i| i.name == name)
    }

    /// Add a transition entry.
    pub fn add_transition(&mut self, par: &str, from: &str, to: &str) {
        self.transitions.push(Transition {
            par: par.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Transition pairs driven by one parameter, in declaration order.
    pub fn transitions_for(&self, par: &str) -> Vec<(&str, &str)> {
        self.transitions
            .iter()
            .filter(|t| t.par == par)
            .map(|t| (t.from.as_str(), t.to.as_str()))
            .collect()
    }

    /// The full parameter → [(from, to)] map.
    pub fn transition_map(&self) -> BTreeMap<&str, Vec<(&str, &str)>> {
        let mut map: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
        for t in &self.transitions {
            map.entry(t.par.as_str())
                .or_default()
                .push((t.from.as_str(), t.to.as_str()));
        }
        map
    }

    /// Serialize to the binary persistence form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Restore from the binary persistence form. The result is revalidated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let fw: Framework =
            bincode::deserialize(bytes).map_err(|e| EngineError::Persistence(e.to_string()))?;
        fw.validate()?;
        Ok(fw)
    }

    /// Pretty JSON form for human inspection and review diffs.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Restore from the JSON form. The result is revalidated.
    pub fn from_json(text: &str) -> Result<Self> {
        let fw: Framework =
            serde_json::from_str(text).map_err(|e| EngineError::Persistence(e.to_string()))?;
        fw.validate()?;
        Ok(fw)
    }

    // ── Validation ──────────────────────────────────────────────────────────

    /// Check every statically-checkable invariant from the data model.
    pub fn validate(&self) -> Result<()> {
        self.validate_names()?;
        self.validate_comps()?;
        self.validate_characs()?;
        self.validate_pars()?;
        self.validate_transitions()?;
        self.validate_duration_groups()?;
        self.validate_functions()?;
        self.validate_cascades()?;
        Ok(())
    }

    fn validate_names(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        let all = self
            .comps
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.characs.iter().map(|c| c.name.as_str()))
            .chain(self.pars.iter().map(|p| p.name.as_str()))
            .chain(self.interactions.iter().map(|i| i.name.as_str()));

        for name in all {
            valid_code_name(name)?;
            if !seen.insert(name) {
                return Err(EngineError::framework(format!(
                    "code name '{name}' is used more than once; names must be unique across \
                     compartments, characteristics, parameters, and interactions"
                )));
            }
        }
        for i in &self.interactions {
            if i.from_pop_type.is_empty() || i.to_pop_type.is_empty() {
                return Err(EngineError::framework(format!(
                    "interaction '{}' must declare source and target population types",
                    i.name
                )));
            }
        }
        Ok(())
    }

    fn validate_comps(&self) -> Result<()> {
        for c in &self.comps {
            let flags = [c.is_source, c.is_sink, c.is_junction];
            if flags.iter().filter(|&&f| f).count() > 1 {
                return Err(EngineError::framework(format!(
                    "compartment '{}' can be at most one of source, sink, junction",
                    c.name
                )));
            }
            if (c.is_source || c.is_sink) && c.effective_setup_weight() != 0.0 {
                return Err(EngineError::framework(format!(
                    "compartment '{}' is a source or sink and must have setup weight 0",
                    c.name
                )));
            }
            if (c.is_source || c.is_sink) && c.databook_page.is_some() {
                return Err(EngineError::framework(format!(
                    "compartment '{}' is a source or sink and cannot have a databook page",
                    c.name
                )));
            }
            if c.effective_setup_weight() < 0.0 {
                return Err(EngineError::framework(format!(
                    "compartment '{}' has a negative setup weight",
                    c.name
                )));
            }
            if c.duration_group.is_some() && (c.is_source || c.is_sink) {
                return Err(EngineError::framework(format!(
                    "compartment '{}' cannot be in a duration group and be a source or sink",
                    c.name
                )));
            }
        }
        Ok(())
    }

    fn validate_characs(&self) -> Result<()> {
        for c in &self.characs {
            if c.components.is_empty() && c.function.is_none() {
                return Err(EngineError::framework(format!(
                    "characteristic '{}' has no components",
                    c.name
                )));
            }
            for comp in &c.components {
                if self.comp(comp).is_none() && self.charac(comp).is_none() {
                    return Err(EngineError::framework(format!(
                        "characteristic '{}' includes unknown component '{comp}'",
                        c.name
                    )));
                }
            }
            if let Some(denom) = &c.denominator {
                if self.comp(denom).is_none() && self.charac(denom).is_none() {
                    return Err(EngineError::framework(format!(
                        "characteristic '{}' has unknown denominator '{denom}'",
                        c.name
                    )));
                }
            }
            if let (Some(lo), Some(hi)) = (c.min, c.max) {
                if lo > hi {
                    return Err(EngineError::framework(format!(
                        "characteristic '{}' has min > max",
                        c.name
                    )));
                }
            }
        }
        self.check_charac_cycles()?;
        Ok(())
    }

    /// Reject cyclic characteristic inclusion.
    fn check_charac_cycles(&self) -> Result<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();

        fn visit<'a>(
            fw: &'a Framework,
            name: &'a str,
            state: &mut HashMap<&'a str, u8>,
        ) -> Result<()> {
            match state.get(name) {
                Some(1) => {
                    return Err(EngineError::framework(format!(
                        "characteristic '{name}' includes itself (possibly indirectly)"
                    )))
                }
                Some(2) => return Ok(()),
                _ => {}
            }
            state.insert(name, 1);
            if let Some(spec) = fw.charac(name) {
                for comp in &spec.components {
                    if fw.charac(comp).is_some() {
                        visit(fw, comp, state)?;
                    }
                }
                if let Some(denom) = &spec.denominator {
                    if fw.charac(denom).is_some() {
                        visit(fw, denom, state)?;
                    }
                }
            }
            state.insert(name, 2);
            Ok(())
        }

        for c in &self.characs {
            visit(self, &c.name, &mut state)?;
        }
        Ok(())
    }

    fn validate_pars(&self) -> Result<()> {
        for p in &self.pars {
            if let (Some(lo), Some(hi)) = (p.min, p.max) {
                if lo > hi {
                    return Err(EngineError::framework(format!(
                        "parameter '{}' has min > max",
                        p.name
                    )));
                }
            }
            if let Some(ts) = p.timescale {
                if !ts.is_finite() || ts <= 0.0 {
                    return Err(EngineError::framework(format!(
                        "parameter '{}' has a non-positive timescale",
                        p.name
                    )));
                }
            }
            if p.is_derivative && p.function.is_none() {
                return Err(EngineError::framework(format!(
                    "parameter '{}' is marked as a derivative but has no function",
                    p.name
                )));
            }
            if p.is_timed && p.format != Some(ParamFormat::Duration) {
                return Err(EngineError::framework(format!(
                    "parameter '{}' is timed and must be in duration units",
                    p.name
                )));
            }
            let has_links = self.transitions.iter().any(|t| t.par == p.name);
            if has_links && p.format.is_none() {
                return Err(EngineError::framework(format!(
                    "parameter '{}' drives transitions and must declare a format",
                    p.name
                )));
            }
        }
        Ok(())
    }

    fn validate_transitions(&self) -> Result<()> {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for t in &self.transitions {
            let par = self.par(&t.par).ok_or_else(|| {
                EngineError::framework(format!(
                    "transition references unknown parameter '{}'",
                    t.par
                ))
            })?;
            let from = self.comp(&t.from).ok_or_else(|| {
                EngineError::framework(format!(
                    "transition for '{}' references unknown compartment '{}'",
                    t.par, t.from
                ))
            })?;
            let to = self.comp(&t.to).ok_or_else(|| {
                EngineError::framework(format!(
                    "transition for '{}' references unknown compartment '{}'",
                    t.par, t.to
                ))
            })?;

            if !seen.insert((t.par.as_str(), t.from.as_str())) {
                return Err(EngineError::framework(format!(
                    "parameter '{}' is associated with two or more transitions from \
                     compartment '{}'",
                    t.par, t.from
                )));
            }
            if from.is_sink {
                return Err(EngineError::framework(format!(
                    "parameter '{}' cannot drive a transition out of sink '{}'",
                    t.par, t.from
                )));
            }
            if to.is_source {
                return Err(EngineError::framework(format!(
                    "parameter '{}' cannot drive a transition into source '{}'",
                    t.par, t.to
                )));
            }
            if from.is_source {
                if to.is_sink {
                    return Err(EngineError::framework(format!(
                        "parameter '{}' drives a pointless source-to-sink flow '{}' → '{}'",
                        t.par, t.from, t.to
                    )));
                }
                if self.transitions_for(&t.par).len() > 1 {
                    return Err(EngineError::framework(format!(
                        "parameter '{}' flows out of source '{}' and must drive exactly one \
                         transition",
                        t.par, t.from
                    )));
                }
                if par.format != Some(ParamFormat::Number) {
                    return Err(EngineError::framework(format!(
                        "parameter '{}' flows out of source '{}' and must be in number units",
                        t.par, t.from
                    )));
                }
            }
            if from.is_junction && par.format != Some(ParamFormat::Proportion) {
                return Err(EngineError::framework(format!(
                    "parameter '{}' flows out of junction '{}' and must be in proportion units",
                    t.par, t.from
                )));
            }
            if par.format == Some(ParamFormat::Proportion) && !from.is_junction {
                return Err(EngineError::framework(format!(
                    "parameter '{}' is in proportion units but flows out of non-junction '{}'",
                    t.par, t.from
                )));
            }
        }

        // Every junction must be drained by at least one outgoing transition.
        for c in self.comps.iter().filter(|c| c.is_junction) {
            if !self.transitions.iter().any(|t| t.from == c.name) {
                return Err(EngineError::framework(format!(
                    "junction '{}' has no outgoing transitions",
                    c.name
                )));
            }
        }
        Ok(())
    }

    fn validate_duration_groups(&self) -> Result<()> {
        for c in &self.comps {
            let Some(group) = &c.duration_group else {
                continue;
            };
            let par = self.par(group).ok_or_else(|| {
                EngineError::framework(format!(
                    "compartment '{}' references unknown duration group '{group}'",
                    c.name
                ))
            })?;
            if !par.is_timed {
                return Err(EngineError::framework(format!(
                    "duration group '{group}' of compartment '{}' is not a timed parameter",
                    c.name
                )));
            }
            // A timed (non-junction) compartment must have exactly one flush
            // transition under its group parameter.
            if !c.is_junction {
                let flushes = self
                    .transitions
                    .iter()
                    .filter(|t| t.par == *group && t.from == c.name)
                    .count();
                if flushes != 1 {
                    return Err(EngineError::framework(format!(
                        "timed compartment '{}' needs exactly one flush transition under \
                         '{group}', found {flushes}",
                        c.name
                    )));
                }
            }
        }

        // Timed parameters may only flow out of members of their own group.
        for p in self.pars.iter().filter(|p| p.is_timed) {
            for t in self.transitions.iter().filter(|t| t.par == p.name) {
                let Some(from) = self.comp(&t.from) else {
                    continue; // unknown compartments reported by transition checks
                };
                if from.duration_group.as_deref() != Some(p.name.as_str()) {
                    return Err(EngineError::framework(format!(
                        "timed parameter '{}' flows out of '{}' which is not in its duration \
                         group",
                        p.name, t.from
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse every function expression and resolve its dependencies.
    fn validate_functions(&self) -> Result<()> {
        for p in &self.pars {
            if let Some(src) = &p.function {
                let parsed = expr::parse_function(src)?;
                self.check_function_deps(&p.name, &parsed)?;
            }
        }
        for c in &self.characs {
            if let Some(src) = &c.function {
                let parsed = expr::parse_function(src)?;
                if matches!(parsed, ParsedFunction::Aggregation(_)) {
                    return Err(EngineError::framework(format!(
                        "characteristic '{}' cannot be a population aggregation",
                        c.name
                    )));
                }
                self.check_function_deps(&c.name, &parsed)?;
            }
        }
        Ok(())
    }

    fn check_function_deps(&self, owner: &str, parsed: &ParsedFunction) -> Result<()> {
        if let ParsedFunction::Aggregation(agg) = parsed {
            if self.par(&agg.par).is_none() {
                return Err(EngineError::framework(format!(
                    "'{owner}' aggregates unknown parameter '{}'",
                    agg.par
                )));
            }
            if self.interaction(&agg.interaction).is_none() {
                return Err(EngineError::framework(format!(
                    "'{owner}' aggregates over unknown interaction '{}'",
                    agg.interaction
                )));
            }
            if let Some(w) = &agg.weight {
                if !self.name_exists(w) {
                    return Err(EngineError::framework(format!(
                        "'{owner}' uses unknown aggregation weight '{w}'"
                    )));
                }
            }
            return Ok(());
        }

        for dep in parsed.deps() {
            if RESERVED_BINDINGS.contains(&dep.as_str()) {
                continue;
            }
            if let Some(base) = dep.strip_suffix(FLOW_SUFFIX) {
                let has_links = self.transitions.iter().any(|t| t.par == base);
                if self.par(base).is_none() || !has_links {
                    return Err(EngineError::framework(format!(
                        "'{owner}' references flow '{dep}' but '{base}' is not a transition \
                         parameter"
                    )));
                }
                continue;
            }
            if !self.name_exists(&dep) {
                return Err(EngineError::framework(format!(
                    "'{owner}' references unknown variable '{dep}'"
                )));
            }
        }
        Ok(())
    }

    fn name_exists(&self, name: &str) -> bool {
        self.comp(name).is_some() || self.charac(name).is_some() || self.par(name).is_some()
    }

    fn validate_cascades(&self) -> Result<()> {
        for cascade in &self.cascades {
            for stage in &cascade.stages {
                for item in &stage.constituents {
                    if self.comp(item).is_none() && self.charac(item).is_none() {
                        return Err(EngineError::framework(format!(
                            "cascade '{}' stage '{}' references unknown '{item}'",
                            cascade.name, stage.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Check that a code name is usable: identifier charset, not reserved.
fn valid_code_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !head_ok || !tail_ok {
        return Err(EngineError::framework(format!(
            "invalid code name '{name}': names are non-empty, start with a letter or \
             underscore, and contain no separators"
        )));
    }
    if RESERVED_BINDINGS.contains(&name)
        || BUILTIN_FUNCTIONS.contains(&name)
        || AggKind::from_name(name).is_some()
    {
        return Err(EngineError::framework(format!(
            "code name '{name}' is reserved"
        )));
    }
    Ok(())
}

// ── Tests ──
