// scenario.rs — Parameter overwrites applied to a copy of the parset
//
// A parameter scenario replaces the databook series of chosen
// (parameter, population) pairs before the model is built. Overwrite
// points hold until the next point (stepped look); a smooth onset of `s`
// years inserts a ramp point `s` years before each overwrite carrying the
// previous value, clamped so it never reaches back past the preceding
// overwrite. An empty scenario reproduces the baseline run exactly.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::parset::ParameterSet;
use crate::settings::Settings;
use crate::timeseries::TimeSeries;

/// One (parameter, population) overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overwrite {
    pub par: String,
    pub pop: String,
    pub t: Vec<f64>,
    pub y: Vec<f64>,
    /// Ramp length in years before each overwrite point. Defaults to one
    /// simulation step, which keeps values stepped on the grid.
    pub smooth_onset: Option<f64>,
}

/// A named set of parameter overwrites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterScenario {
    pub name: String,
    pub overwrites: Vec<Overwrite>,
}

impl ParameterScenario {
    pub fn new(name: &str) -> Self {
        ParameterScenario {
            name: name.to_string(),
            ..ParameterScenario::default()
        }
    }

    pub fn add_overwrite(
        &mut self,
        par: &str,
        pop: &str,
        t: &[f64],
        y: &[f64],
        smooth_onset: Option<f64>,
    ) {
        self.overwrites.push(Overwrite {
            par: par.to_string(),
            pop: pop.to_string(),
            t: t.to_vec(),
            y: y.to_vec(),
            smooth_onset,
        });
    }

    /// Produce the modified parameter set this scenario runs against.
    pub fn apply(&self, parset: &ParameterSet, settings: &Settings) -> Result<ParameterSet> {
        let mut out = parset.clone();
        for ow in &self.overwrites {
            if ow.t.len() != ow.y.len() || ow.t.is_empty() {
                return Err(EngineError::parset(format!(
                    "scenario overwrite for '{}' needs matching non-empty t and y",
                    ow.par
                )));
            }
            if ow.t.windows(2).any(|w| w[0] >= w[1]) {
                return Err(EngineError::parset(format!(
                    "scenario overwrite for '{}' must have strictly increasing times",
                    ow.par
                )));
            }
            let onset = ow.smooth_onset.unwrap_or(settings.dt);
            if onset < 0.0 {
                return Err(EngineError::parset(format!(
                    "scenario overwrite for '{}' has a negative smooth onset",
                    ow.par
                )));
            }

            let mut series = TimeSeries::default();
            for (k, (&tk, &yk)) in ow.t.iter().zip(&ow.y).enumerate() {
                if k > 0 && onset > 0.0 {
                    let ramp_start = (tk - onset).max(ow.t[k - 1]);
                    if ramp_start > ow.t[k - 1] {
                        series.insert(ramp_start, ow.y[k - 1]);
                    }
                }
                series.insert(tk, yk);
            }
            out.set_series(&ow.par, &ow.pop, series)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CompartmentSpec, ParamFormat, ParameterSpec};
    use crate::parset::PopDef;
    use crate::framework::Framework;

    fn fixture() -> (ParameterSet, Settings) {
        let mut fw = Framework::new("t");
        let mut sus = CompartmentSpec::new("sus");
        sus.databook_page = Some("comps".into());
        fw.comps.push(sus);
        let mut rec = CompartmentSpec::new("rec");
        rec.databook_page = Some("comps".into());
        fw.comps.push(rec);
        let mut contacts = ParameterSpec::new("contacts");
        contacts.format = Some(ParamFormat::Probability);
        contacts.databook_page = Some("pars".into());
        fw.pars.push(contacts);
        fw.add_transition("contacts", "sus", "rec");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut parset = ParameterSet::new("default", &fw, &pops);
        parset.set_constant("contacts", "adults", 80.0).unwrap();
        let settings = Settings::new(2000.0, 2023.0, 1.0).unwrap();
        (parset, settings)
    }

    #[test]
    fn empty_scenario_is_identity() {
        let (parset, settings) = fixture();
        let scen = ParameterScenario::new("none");
        let out = scen.apply(&parset, &settings).unwrap();
        assert_eq!(out.to_bytes().unwrap(), parset.to_bytes().unwrap());
    }

    #[test]
    fn default_onset_is_stepped() {
        let (parset, settings) = fixture();
        let mut scen = ParameterScenario::new("step");
        scen.add_overwrite("contacts", "adults", &[2010.0, 2020.0], &[80.0, 40.0], None);
        let out = scen.apply(&parset, &settings).unwrap();
        assert_eq!(out.sample("contacts", "adults", 2010.0).unwrap(), 80.0);
        assert_eq!(out.sample("contacts", "adults", 2015.0).unwrap(), 80.0);
        assert_eq!(out.sample("contacts", "adults", 2020.0).unwrap(), 40.0);
    }

    #[test]
    fn smooth_onset_ramps_linearly() {
        let (parset, settings) = fixture();
        let mut scen = ParameterScenario::new("onset2");
        scen.add_overwrite(
            "contacts",
            "adults",
            &[2010.0, 2020.0],
            &[80.0, 40.0],
            Some(2.0),
        );
        let out = scen.apply(&parset, &settings).unwrap();
        assert_eq!(out.sample("contacts", "adults", 2018.0).unwrap(), 80.0);
        assert_eq!(out.sample("contacts", "adults", 2019.0).unwrap(), 60.0);
        assert_eq!(out.sample("contacts", "adults", 2020.0).unwrap(), 40.0);
    }

    #[test]
    fn long_onset_clamps_to_previous_point() {
        let (parset, settings) = fixture();
        let mut scen = ParameterScenario::new("onset11");
        scen.add_overwrite(
            "contacts",
            "adults",
            &[2010.0, 2020.0],
            &[80.0, 40.0],
            Some(11.0),
        );
        let out = scen.apply(&parset, &settings).unwrap();
        assert_eq!(out.sample("contacts", "adults", 2010.0).unwrap(), 80.0);
        assert_eq!(out.sample("contacts", "adults", 2015.0).unwrap(), 60.0);
        assert_eq!(out.sample("contacts", "adults", 2020.0).unwrap(), 40.0);
    }

    #[test]
    fn constant_extrapolation_after_last_overwrite() {
        let (parset, settings) = fixture();
        let mut scen = ParameterScenario::new("step");
        scen.add_overwrite("contacts", "adults", &[2010.0, 2020.0], &[80.0, 40.0], None);
        let out = scen.apply(&parset, &settings).unwrap();
        assert_eq!(out.sample("contacts", "adults", 2023.0).unwrap(), 40.0);
        assert_eq!(out.sample("contacts", "adults", 2000.0).unwrap(), 80.0);
    }

    #[test]
    fn bad_overwrites_rejected() {
        let (parset, settings) = fixture();
        let mut scen = ParameterScenario::new("bad");
        scen.add_overwrite("contacts", "adults", &[2010.0], &[80.0, 40.0], None);
        assert!(scen.apply(&parset, &settings).is_err());

        let mut scen = ParameterScenario::new("bad2");
        scen.add_overwrite("contacts", "adults", &[2020.0, 2010.0], &[1.0, 2.0], None);
        assert!(scen.apply(&parset, &settings).is_err());

        let mut scen = ParameterScenario::new("bad3");
        scen.add_overwrite("ghost", "adults", &[2010.0], &[1.0], None);
        assert!(scen.apply(&parset, &settings).is_err());
    }
}
