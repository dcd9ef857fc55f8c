// Shared fixtures for the integration test suite.

#![allow(dead_code)]

use epidyn::framework::{CharacteristicSpec, CompartmentSpec, ParamFormat, ParameterSpec};
use epidyn::parset::PopDef;
use epidyn::{Framework, ParameterSet, Settings};

/// The canonical SIR network: sus/inf/rec with a force-of-infection
/// function and a recovery probability.
pub fn sir_framework() -> Framework {
    let mut fw = Framework::new("sir");
    for name in ["sus", "inf", "rec"] {
        let mut c = CompartmentSpec::new(name);
        c.databook_page = Some("comps".into());
        fw.comps.push(c);
    }
    fw.characs
        .push(CharacteristicSpec::new("alive", &["sus", "inf", "rec"]));
    let mut prev = CharacteristicSpec::new("prev", &["inf"]);
    prev.denominator = Some("alive".into());
    fw.characs.push(prev);

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
    fw
}

/// The databook matching `sir_framework`: 990/10/0 people, the demo
/// parameter values, and a 0.1/year recovery rate.
pub fn sir_parset(fw: &Framework) -> ParameterSet {
    let pops = vec![PopDef::new("adults", "default")];
    let mut ps = ParameterSet::new("default", fw, &pops);
    ps.set_constant("sus", "adults", 990.0).unwrap();
    ps.set_constant("inf", "adults", 10.0).unwrap();
    ps.set_constant("rec", "adults", 0.0).unwrap();
    ps.set_constant("transpercontact", "adults", 0.005).unwrap();
    ps.set_constant("contacts", "adults", 80.0).unwrap();
    ps.set_constant("rec_rate", "adults", 0.1).unwrap();
    ps
}

pub fn sir_settings() -> Settings {
    Settings::new(2000.0, 2030.0, 0.25).unwrap()
}

/// Two-compartment network with one configurable transition parameter,
/// for boundary-behaviour tests.
pub fn two_comp_framework(format: ParamFormat, timescale: Option<f64>) -> Framework {
    let mut fw = Framework::new("pair");
    let mut a = CompartmentSpec::new("a");
    a.databook_page = Some("comps".into());
    fw.comps.push(a);
    let mut b = CompartmentSpec::new("b");
    b.databook_page = Some("comps".into());
    fw.comps.push(b);
    let mut rate = ParameterSpec::new("rate");
    rate.format = Some(format);
    rate.timescale = timescale;
    rate.databook_page = Some("pars".into());
    fw.pars.push(rate);
    fw.add_transition("rate", "a", "b");
    fw.validate().unwrap();
    fw
}

pub fn two_comp_parset(fw: &Framework, a: f64, b: f64, rate: f64) -> ParameterSet {
    let pops = vec![PopDef::new("adults", "default")];
    let mut ps = ParameterSet::new("default", fw, &pops);
    ps.set_constant("a", "adults", a).unwrap();
    ps.set_constant("b", "adults", b).unwrap();
    ps.set_constant("rate", "adults", rate).unwrap();
    ps
}
