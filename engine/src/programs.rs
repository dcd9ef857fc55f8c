// programs.rs — Program sets and run-time instructions
//
// A program converts spending into covered people (via unit cost and an
// optional capacity constraint) and covered people into parameter outcomes
// (via coverage-outcome entries). Instructions activate the program set
// over [start_year, stop_year] and may override spending, capacity, or
// coverage per program. The engine deep-copies the program set into the
// Model; outcome evaluation itself lives in the integration loop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::framework::Framework;
use crate::parset::ParameterSet;
use crate::timeseries::TimeSeries;

/// One fundable program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub label: String,
    /// Populations this program reaches.
    pub target_pops: Vec<String>,
    /// Compartments whose occupants are eligible for coverage.
    pub target_comps: Vec<String>,
    /// Cost per person covered per year.
    pub unit_cost: TimeSeries,
    /// Maximum number of people covered per year, regardless of spending.
    pub capacity_constraint: Option<TimeSeries>,
    /// Default spending when the instructions do not override it.
    pub spend_data: TimeSeries,
}

impl Program {
    pub fn new(name: &str) -> Self {
        Program {
            name: name.to_string(),
            label: name.to_string(),
            target_pops: Vec::new(),
            target_comps: Vec::new(),
            unit_cost: TimeSeries::default(),
            capacity_constraint: None,
            spend_data: TimeSeries::default(),
        }
    }
}

/// Coverage-outcome entry for one (parameter, population): the value at
/// zero coverage and the value each program attains at full coverage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Covout {
    pub par: String,
    pub pop: String,
    /// Outcome with no program running.
    pub baseline: f64,
    /// (program name, outcome at full coverage).
    pub outcomes: Vec<(String, f64)>,
}

/// A named collection of programs plus their coverage-outcome mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramSet {
    pub name: String,
    pub programs: Vec<Program>,
    pub covouts: Vec<Covout>,
}

impl ProgramSet {
    pub fn new(name: &str) -> Self {
        ProgramSet {
            name: name.to_string(),
            programs: Vec::new(),
            covouts: Vec::new(),
        }
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.name == name)
    }

    pub fn covout(&self, par: &str, pop: &str) -> Option<&Covout> {
        self.covouts
            .iter()
            .find(|c| c.par == par && c.pop == pop)
    }

    /// Names of every parameter some program overwrites.
    pub fn target_par_names(&self) -> HashSet<String> {
        self.covouts.iter().map(|c| c.par.clone()).collect()
    }

    /// Check the program set against the framework and parameter set.
    pub fn validate(&self, fw: &Framework, parset: &ParameterSet) -> Result<()> {
        let mut seen = HashSet::new();
        for prog in &self.programs {
            if !seen.insert(prog.name.as_str()) {
                return Err(EngineError::program(format!(
                    "program '{}' defined twice",
                    prog.name
                )));
            }
            if prog.target_pops.is_empty() || prog.target_comps.is_empty() {
                return Err(EngineError::program(format!(
                    "program '{}' must target at least one population and compartment",
                    prog.name
                )));
            }
            for pop in &prog.target_pops {
                if parset.pop(pop).is_none() {
                    return Err(EngineError::program(format!(
                        "program '{}' targets unknown population '{pop}'",
                        prog.name
                    )));
                }
            }
            for comp in &prog.target_comps {
                match fw.comp(comp) {
                    None => {
                        return Err(EngineError::program(format!(
                            "program '{}' targets unknown compartment '{comp}'",
                            prog.name
                        )))
                    }
                    Some(spec) if spec.is_source || spec.is_sink => {
                        return Err(EngineError::program(format!(
                            "program '{}' cannot target source/sink compartment '{comp}'",
                            prog.name
                        )))
                    }
                    Some(_) => {}
                }
            }
            if !prog.unit_cost.has_data() {
                return Err(EngineError::program(format!(
                    "program '{}' has no unit cost data",
                    prog.name
                )));
            }
        }

        for c in &self.covouts {
            if fw.par(&c.par).is_none() {
                return Err(EngineError::program(format!(
                    "coverage-outcome references unknown parameter '{}'",
                    c.par
                )));
            }
            if parset.pop(&c.pop).is_none() {
                return Err(EngineError::program(format!(
                    "coverage-outcome for '{}' references unknown population '{}'",
                    c.par, c.pop
                )));
            }
            for (prog, _) in &c.outcomes {
                if self.program(prog).is_none() {
                    return Err(EngineError::program(format!(
                        "coverage-outcome for '{}' references unknown program '{prog}'",
                        c.par
                    )));
                }
            }
        }
        Ok(())
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

/// Run-time activation of a program set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramInstructions {
    pub start_year: f64,
    /// Programs run forever when absent.
    pub stop_year: Option<f64>,
    /// Spending overrides per program.
    pub alloc: Vec<(String, TimeSeries)>,
    /// Capacity overrides per program (people per year).
    pub capacity: Vec<(String, TimeSeries)>,
    /// Fractional coverage overrides per program.
    pub coverage: Vec<(String, TimeSeries)>,
}

impl ProgramInstructions {
    pub fn new(start_year: f64) -> Self {
        ProgramInstructions {
            start_year,
            stop_year: None,
            alloc: Vec::new(),
            capacity: Vec::new(),
            coverage: Vec::new(),
        }
    }

    pub fn stop(&self) -> f64 {
        self.stop_year.unwrap_or(f64::INFINITY)
    }

    /// Whether programs are active at time `t`.
    pub fn active(&self, t: f64) -> bool {
        t >= self.start_year && t <= self.stop()
    }

    pub fn set_alloc(&mut self, program: &str, series: TimeSeries) {
        set_override(&mut self.alloc, program, series);
    }

    pub fn set_capacity(&mut self, program: &str, series: TimeSeries) {
        set_override(&mut self.capacity, program, series);
    }

    pub fn set_coverage(&mut self, program: &str, series: TimeSeries) {
        set_override(&mut self.coverage, program, series);
    }

    pub fn alloc_override(&self, program: &str) -> Option<&TimeSeries> {
        get_override(&self.alloc, program)
    }

    pub fn capacity_override(&self, program: &str) -> Option<&TimeSeries> {
        get_override(&self.capacity, program)
    }

    pub fn coverage_override(&self, program: &str) -> Option<&TimeSeries> {
        get_override(&self.coverage, program)
    }

    /// Check that every override names a real program.
    pub fn validate(&self, progset: &ProgramSet) -> Result<()> {
        if !self.start_year.is_finite() {
            return Err(EngineError::program("start year must be finite"));
        }
        if self.stop() < self.start_year {
            return Err(EngineError::program(format!(
                "stop year {} precedes start year {}",
                self.stop(),
                self.start_year
            )));
        }
        for (name, _) in self.alloc.iter().chain(&self.capacity).chain(&self.coverage) {
            if progset.program(name).is_none() {
                return Err(EngineError::program(format!(
                    "instructions override unknown program '{name}'"
                )));
            }
        }
        Ok(())
    }
}

fn set_override(list: &mut Vec<(String, TimeSeries)>, program: &str, series: TimeSeries) {
    match list.iter_mut().find(|(p, _)| p == program) {
        Some((_, slot)) => *slot = series,
        None => list.push((program.to_string(), series)),
    }
}

fn get_override<'a>(list: &'a [(String, TimeSeries)], program: &str) -> Option<&'a TimeSeries> {
    list.iter().find(|(p, _)| p == program).map(|(_, ts)| ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CompartmentSpec, ParamFormat, ParameterSpec};
    use crate::parset::PopDef;

    fn fixture() -> (Framework, ParameterSet, ProgramSet) {
        let mut fw = Framework::new("t");
        let mut sus = CompartmentSpec::new("sus");
        sus.databook_page = Some("comps".into());
        fw.comps.push(sus);
        let mut rec = CompartmentSpec::new("rec");
        rec.databook_page = Some("comps".into());
        fw.comps.push(rec);
        let mut rate = ParameterSpec::new("rate");
        rate.format = Some(ParamFormat::Probability);
        rate.databook_page = Some("pars".into());
        fw.pars.push(rate);
        fw.add_transition("rate", "sus", "rec");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let parset = ParameterSet::new("default", &fw, &pops);

        let mut ps = ProgramSet::new("default");
        let mut prog = Program::new("outreach");
        prog.target_pops = vec!["adults".into()];
        prog.target_comps = vec!["sus".into()];
        prog.unit_cost = TimeSeries::constant(10.0);
        prog.spend_data = TimeSeries::constant(1000.0);
        ps.programs.push(prog);
        ps.covouts.push(Covout {
            par: "rate".into(),
            pop: "adults".into(),
            baseline: 0.1,
            outcomes: vec![("outreach".into(), 0.5)],
        });
        (fw, parset, ps)
    }

    #[test]
    fn valid_progset_passes() {
        let (fw, parset, ps) = fixture();
        ps.validate(&fw, &parset).unwrap();
    }

    #[test]
    fn unknown_targets_rejected() {
        let (fw, parset, mut ps) = fixture();
        ps.programs[0].target_comps = vec!["ghost".into()];
        assert!(ps.validate(&fw, &parset).is_err());

        let (fw, parset, mut ps) = fixture();
        ps.programs[0].target_pops = vec!["ghosts".into()];
        assert!(ps.validate(&fw, &parset).is_err());
    }

    #[test]
    fn missing_unit_cost_rejected() {
        let (fw, parset, mut ps) = fixture();
        ps.programs[0].unit_cost = TimeSeries::default();
        let err = ps.validate(&fw, &parset).unwrap_err();
        assert!(err.to_string().contains("unit cost"));
    }

    #[test]
    fn covout_references_checked() {
        let (fw, parset, mut ps) = fixture();
        ps.covouts[0].par = "ghost".into();
        assert!(ps.validate(&fw, &parset).is_err());

        let (fw, parset, mut ps) = fixture();
        ps.covouts[0].outcomes[0].0 = "ghost".into();
        assert!(ps.validate(&fw, &parset).is_err());
    }

    #[test]
    fn target_par_names() {
        let (_, _, ps) = fixture();
        let names = ps.target_par_names();
        assert!(names.contains("rate"));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn instructions_window() {
        let mut ins = ProgramInstructions::new(2018.0);
        assert!(!ins.active(2017.9));
        assert!(ins.active(2018.0));
        assert!(ins.active(2100.0));
        ins.stop_year = Some(2020.0);
        assert!(ins.active(2020.0));
        assert!(!ins.active(2020.1));
    }

    #[test]
    fn instructions_overrides() {
        let (_, _, ps) = fixture();
        let mut ins = ProgramInstructions::new(2018.0);
        ins.set_alloc("outreach", TimeSeries::constant(2000.0));
        ins.validate(&ps).unwrap();
        assert_eq!(
            ins.alloc_override("outreach").unwrap().sample(2018.0),
            2000.0
        );
        assert!(ins.alloc_override("other").is_none());

        ins.set_coverage("ghost", TimeSeries::constant(0.5));
        assert!(ins.validate(&ps).is_err());
    }

    #[test]
    fn invalid_window_rejected() {
        let (_, _, ps) = fixture();
        let mut ins = ProgramInstructions::new(2020.0);
        ins.stop_year = Some(2018.0);
        assert!(ins.validate(&ps).is_err());
    }

    #[test]
    fn binary_roundtrip() {
        let (_, _, ps) = fixture();
        let bytes = ps.to_bytes().unwrap();
        let back = ProgramSet::from_bytes(&bytes).unwrap();
        assert_eq!(back.to_bytes().unwrap(), bytes);
        assert_eq!(back.programs[0].name, "outreach");
    }
}
