// parset.rs — Per-population calibration data
//
// Holds one TimeSeries per databook quantity per population, plus transfer
// series linking population pairs and interaction weight series. Values are
// interpolated onto the simulation grid during Model::build; y-factors and
// the parset-wide meta factor scale the interpolated output.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::framework::Framework;
use crate::timeseries::TimeSeries;

/// A population definition: code name plus population type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopDef {
    pub name: String,
    pub pop_type: String,
}

impl PopDef {
    pub fn new(name: &str, pop_type: &str) -> Self {
        PopDef {
            name: name.to_string(),
            pop_type: pop_type.to_string(),
        }
    }
}

/// Data for one quantity across populations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantityData {
    /// (population, series) pairs in population order.
    pub series: Vec<(String, TimeSeries)>,
    /// Calibration scale factors per population; missing means 1.
    pub y_factors: Vec<(String, f64)>,
    /// Per-population [t_lo, t_hi] windows in which a parameter function is
    /// skipped and the data-supplied values are kept.
    pub skip_windows: Vec<(String, (f64, f64))>,
}

impl QuantityData {
    pub fn get(&self, pop: &str) -> Option<&TimeSeries> {
        self.series
            .iter()
            .find(|(p, _)| p == pop)
            .map(|(_, ts)| ts)
    }

    pub fn get_mut(&mut self, pop: &str) -> Option<&mut TimeSeries> {
        self.series
            .iter_mut()
            .find(|(p, _)| p == pop)
            .map(|(_, ts)| ts)
    }

    pub fn y_factor(&self, pop: &str) -> f64 {
        self.y_factors
            .iter()
            .find(|(p, _)| p == pop)
            .map(|(_, y)| *y)
            .unwrap_or(1.0)
    }

    pub fn set_y_factor(&mut self, pop: &str, y: f64) {
        match self.y_factors.iter_mut().find(|(p, _)| p == pop) {
            Some((_, slot)) => *slot = y,
            None => self.y_factors.push((pop.to_string(), y)),
        }
    }

    pub fn skip_window(&self, pop: &str) -> Option<(f64, f64)> {
        self.skip_windows
            .iter()
            .find(|(p, _)| p == pop)
            .map(|(_, w)| *w)
    }

    pub fn set_skip_window(&mut self, pop: &str, window: (f64, f64)) {
        match self.skip_windows.iter_mut().find(|(p, _)| p == pop) {
            Some((_, slot)) => *slot = window,
            None => self.skip_windows.push((pop.to_string(), window)),
        }
    }
}

/// One transfer: movement of people between populations, keyed by
/// (from_pop, to_pop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferData {
    pub name: String,
    pub entries: Vec<TransferEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEntry {
    pub from_pop: String,
    pub to_pop: String,
    pub series: TimeSeries,
    pub y_factor: f64,
}

/// Weight data for one interaction, keyed by (from_pop, to_pop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionData {
    pub name: String,
    pub entries: Vec<InteractionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEntry {
    pub from_pop: String,
    pub to_pop: String,
    pub series: TimeSeries,
}

/// The full parameter set for one calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    pub name: String,
    pub pops: Vec<PopDef>,
    /// (quantity code name, per-population data) in framework order.
    pub quantities: Vec<(String, QuantityData)>,
    pub transfers: Vec<TransferData>,
    pub interactions: Vec<InteractionData>,
    /// Parset-wide multiplier applied to every interpolated output.
    pub meta_y_factor: f64,
}

impl ParameterSet {
    /// Create an empty parameter set with one slot per databook quantity
    /// (compartments, characteristics, and parameters with databook pages,
    /// plus every parameter so functions can be overridden by data).
    pub fn new(name: &str, framework: &Framework, pops: &[PopDef]) -> Self {
        let mut quantities = Vec::new();
        let names = framework
            .comps
            .iter()
            .filter(|c| c.databook_page.is_some())
            .map(|c| c.name.clone())
            .chain(
                framework
                    .characs
                    .iter()
                    .filter(|c| c.databook_page.is_some())
                    .map(|c| c.name.clone()),
            )
            .chain(framework.pars.iter().map(|p| p.name.clone()));
        for name in names {
            let data = QuantityData {
                series: pops
                    .iter()
                    .map(|p| (p.name.clone(), TimeSeries::default()))
                    .collect(),
                y_factors: Vec::new(),
                skip_windows: Vec::new(),
            };
            quantities.push((name, data));
        }
        ParameterSet {
            name: name.to_string(),
            pops: pops.to_vec(),
            quantities,
            transfers: Vec::new(),
            interactions: Vec::new(),
            meta_y_factor: 1.0,
        }
    }

    pub fn pop(&self, name: &str) -> Option<&PopDef> {
        self.pops.iter().find(|p| p.name == name)
    }

    pub fn quantity(&self, name: &str) -> Option<&QuantityData> {
        self.quantities
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, q)| q)
    }

    pub fn quantity_mut(&mut self, name: &str) -> Option<&mut QuantityData> {
        self.quantities
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, q)| q)
    }

    /// Convenience: replace the series for one (quantity, population).
    pub fn set_series(&mut self, quantity: &str, pop: &str, series: TimeSeries) -> Result<()> {
        let data = self.quantity_mut(quantity).ok_or_else(|| {
            EngineError::parset(format!("unknown quantity '{quantity}'"))
        })?;
        match data.get_mut(pop) {
            Some(slot) => {
                *slot = series;
                Ok(())
            }
            None => Err(EngineError::parset(format!(
                "unknown population '{pop}' for quantity '{quantity}'"
            ))),
        }
    }

    /// Convenience: set a constant assumption for one (quantity, population).
    pub fn set_constant(&mut self, quantity: &str, pop: &str, value: f64) -> Result<()> {
        self.set_series(quantity, pop, TimeSeries::constant(value))
    }

    /// Whether any data exists for (quantity, population).
    pub fn has_data(&self, quantity: &str, pop: &str) -> bool {
        self.quantity(quantity)
            .and_then(|q| q.get(pop))
            .map(|ts| ts.has_data())
            .unwrap_or(false)
    }

    /// Interpolate one quantity onto a time vector for one population,
    /// applying the population y-factor and the parset meta factor.
    pub fn interpolate(&self, quantity: &str, pop: &str, tvec: &[f64]) -> Result<Vec<f64>> {
        let data = self.quantity(quantity).ok_or_else(|| {
            EngineError::parset(format!("unknown quantity '{quantity}'"))
        })?;
        let ts = data.get(pop).ok_or_else(|| {
            EngineError::parset(format!(
                "no data slot for quantity '{quantity}' in population '{pop}'"
            ))
        })?;
        let scale = data.y_factor(pop) * self.meta_y_factor;
        Ok(ts.interpolate(tvec).into_iter().map(|v| v * scale).collect())
    }

    /// Sample one quantity at a single time with scale factors applied.
    pub fn sample(&self, quantity: &str, pop: &str, time: f64) -> Result<f64> {
        Ok(self.interpolate(quantity, pop, &[time])?[0])
    }

    /// Check the parset against its framework and population list: every
    /// databook compartment and characteristic needs data in every
    /// population for initialization to be possible.
    pub fn validate(&self, framework: &Framework) -> Result<()> {
        if self.pops.is_empty() {
            return Err(EngineError::parset("no populations defined"));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.pops {
            if !seen.insert(p.name.as_str()) {
                return Err(EngineError::parset(format!(
                    "population '{}' defined twice",
                    p.name
                )));
            }
        }

        let init_names = framework
            .comps
            .iter()
            .filter(|c| c.databook_page.is_some())
            .map(|c| (c.name.as_str(), c.pop_type.as_deref()))
            .chain(
                framework
                    .characs
                    .iter()
                    .filter(|c| c.databook_page.is_some())
                    .map(|c| (c.name.as_str(), c.pop_type.as_deref())),
            );
        for (name, pop_type) in init_names {
            for pop in self.pops_of_type(pop_type) {
                if !self.has_data(name, &pop.name) {
                    return Err(EngineError::parset(format!(
                        "databook quantity '{name}' has no data in population '{}'",
                        pop.name
                    )));
                }
            }
        }

        for tr in &self.transfers {
            for e in &tr.entries {
                if self.pop(&e.from_pop).is_none() || self.pop(&e.to_pop).is_none() {
                    return Err(EngineError::parset(format!(
                        "transfer '{}' references unknown population pair ('{}', '{}')",
                        tr.name, e.from_pop, e.to_pop
                    )));
                }
                if e.from_pop == e.to_pop {
                    return Err(EngineError::parset(format!(
                        "transfer '{}' moves population '{}' into itself",
                        tr.name, e.from_pop
                    )));
                }
            }
        }
        for i in &self.interactions {
            if framework.interaction(&i.name).is_none() {
                return Err(EngineError::parset(format!(
                    "interaction data '{}' has no framework definition",
                    i.name
                )));
            }
            for e in &i.entries {
                if self.pop(&e.from_pop).is_none() || self.pop(&e.to_pop).is_none() {
                    return Err(EngineError::parset(format!(
                        "interaction '{}' references unknown population pair ('{}', '{}')",
                        i.name, e.from_pop, e.to_pop
                    )));
                }
            }
        }
        Ok(())
    }

    /// Populations matching a framework population type (None means the
    /// framework does not restrict the type).
    pub fn pops_of_type(&self, pop_type: Option<&str>) -> Vec<&PopDef> {
        self.pops
            .iter()
            .filter(|p| pop_type.map(|t| p.pop_type == t).unwrap_or(true))
            .collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CompartmentSpec, ParamFormat, ParameterSpec};

    fn small_framework() -> Framework {
        let mut fw = Framework::new("test");
        let mut sus = CompartmentSpec::new("sus");
        sus.databook_page = Some("comps".into());
        fw.comps.push(sus);
        let mut rec = CompartmentSpec::new("rec");
        rec.databook_page = Some("comps".into());
        fw.comps.push(rec);
        let mut rate = ParameterSpec::new("rate");
        rate.format = Some(ParamFormat::Probability);
        fw.pars.push(rate);
        fw.add_transition("rate", "sus", "rec");
        fw
    }

    fn pops() -> Vec<PopDef> {
        vec![PopDef::new("adults", "default")]
    }

    #[test]
    fn new_creates_slots_for_databook_quantities() {
        let ps = ParameterSet::new("default", &small_framework(), &pops());
        assert!(ps.quantity("sus").is_some());
        assert!(ps.quantity("rec").is_some());
        assert!(ps.quantity("rate").is_some());
    }

    #[test]
    fn set_and_interpolate_with_factors() {
        let mut ps = ParameterSet::new("default", &small_framework(), &pops());
        ps.set_series("rate", "adults", TimeSeries::from_data(&[2000.0, 2010.0], &[0.1, 0.2]))
            .unwrap();
        let vals = ps.interpolate("rate", "adults", &[2005.0]).unwrap();
        assert!((vals[0] - 0.15).abs() < 1e-12);

        ps.quantity_mut("rate").unwrap().set_y_factor("adults", 2.0);
        ps.meta_y_factor = 3.0;
        let vals = ps.interpolate("rate", "adults", &[2005.0]).unwrap();
        assert!((vals[0] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn unknown_quantity_and_pop_rejected() {
        let mut ps = ParameterSet::new("default", &small_framework(), &pops());
        assert!(ps.set_constant("ghost", "adults", 1.0).is_err());
        assert!(ps.set_constant("rate", "ghosts", 1.0).is_err());
        assert!(ps.interpolate("ghost", "adults", &[2000.0]).is_err());
    }

    #[test]
    fn validate_requires_initialization_data() {
        let fw = small_framework();
        let mut ps = ParameterSet::new("default", &fw, &pops());
        let err = ps.validate(&fw).unwrap_err();
        assert!(err.to_string().contains("no data"));

        ps.set_constant("sus", "adults", 100.0).unwrap();
        ps.set_constant("rec", "adults", 0.0).unwrap();
        ps.validate(&fw).unwrap();
    }

    #[test]
    fn validate_rejects_self_transfer() {
        let fw = small_framework();
        let mut ps = ParameterSet::new("default", &fw, &pops());
        ps.set_constant("sus", "adults", 100.0).unwrap();
        ps.set_constant("rec", "adults", 0.0).unwrap();
        ps.transfers.push(TransferData {
            name: "aging".into(),
            entries: vec![TransferEntry {
                from_pop: "adults".into(),
                to_pop: "adults".into(),
                series: TimeSeries::constant(0.1),
                y_factor: 1.0,
            }],
        });
        assert!(ps.validate(&fw).is_err());
    }

    #[test]
    fn binary_roundtrip() {
        let fw = small_framework();
        let mut ps = ParameterSet::new("default", &fw, &pops());
        ps.set_constant("rate", "adults", 0.5).unwrap();
        let bytes = ps.to_bytes().unwrap();
        let back = ParameterSet::from_bytes(&bytes).unwrap();
        assert_eq!(back.to_bytes().unwrap(), bytes);
        assert_eq!(back.sample("rate", "adults", 2000.0).unwrap(), 0.5);
    }
}
