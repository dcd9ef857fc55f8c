// Determinism and round-trip guarantees.
//
// These tests verify that identical inputs produce elementwise-identical
// trajectories, that persistence round-trips are stable, and that the
// no-programs and empty-scenario paths match the baseline exactly.

mod common;

use common::*;
use epidyn::{
    compute_provenance, run, Framework, ParameterScenario, ParameterSet, SimResult,
};

fn all_series(res: &epidyn::SimResult) -> Vec<(String, Vec<f64>)> {
    ["sus", "inf", "rec", "alive", "prev", "foi"]
        .iter()
        .map(|name| {
            (
                name.to_string(),
                res.series("adults", name).unwrap().vals,
            )
        })
        .collect()
}

#[test]
fn identical_inputs_identical_arrays() {
    let fw = sir_framework();
    let ps = sir_parset(&fw);
    let settings = sir_settings();

    let a = run(&settings, &fw, &ps, None).unwrap();
    let b = run(&settings, &fw, &ps, None).unwrap();

    for ((name, va), (_, vb)) in all_series(&a).into_iter().zip(all_series(&b)) {
        let max_diff = va
            .iter()
            .zip(&vb)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f64, f64::max);
        assert_eq!(max_diff, 0.0, "series '{name}' differed between runs");
    }
    assert_eq!(a.provenance, b.provenance);
}

#[test]
fn rebuilt_inputs_from_bytes_reproduce_the_run() {
    let fw = sir_framework();
    let ps = sir_parset(&fw);
    let settings = sir_settings();

    let baseline = run(&settings, &fw, &ps, None).unwrap();

    // Round-trip the inputs through their binary forms, rebuild, re-run.
    let fw2 = Framework::from_bytes(&fw.to_bytes().unwrap()).unwrap();
    let ps2 = ParameterSet::from_bytes(&ps.to_bytes().unwrap()).unwrap();
    let again = run(&settings, &fw2, &ps2, None).unwrap();

    for ((name, va), (_, vb)) in all_series(&baseline).into_iter().zip(all_series(&again)) {
        assert_eq!(va, vb, "series '{name}' differed after input round-trip");
    }
}

#[test]
fn framework_bytes_are_stable() {
    let fw = sir_framework();
    let bytes = fw.to_bytes().unwrap();
    let back = Framework::from_bytes(&bytes).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);
}

#[test]
fn parset_bytes_are_stable() {
    let fw = sir_framework();
    let ps = sir_parset(&fw);
    let bytes = ps.to_bytes().unwrap();
    let back = ParameterSet::from_bytes(&bytes).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);
}

#[test]
fn result_bytes_are_stable() {
    let fw = sir_framework();
    let ps = sir_parset(&fw);
    let res = run(&sir_settings(), &fw, &ps, None).unwrap();
    let bytes = res.to_bytes().unwrap();
    let back = SimResult::from_bytes(&bytes).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);
    assert_eq!(
        back.series("adults", "inf").unwrap().vals,
        res.series("adults", "inf").unwrap().vals
    );
}

#[test]
fn empty_parameter_scenario_matches_baseline() {
    let fw = sir_framework();
    let ps = sir_parset(&fw);
    let settings = sir_settings();

    let baseline = run(&settings, &fw, &ps, None).unwrap();

    let scen = ParameterScenario::new("no overwrites");
    let scen_ps = scen.apply(&ps, &settings).unwrap();
    let scen_res = run(&settings, &fw, &scen_ps, None).unwrap();

    for ((name, va), (_, vb)) in all_series(&baseline)
        .into_iter()
        .zip(all_series(&scen_res))
    {
        assert_eq!(va, vb, "series '{name}' differed under the empty scenario");
    }
}

#[test]
fn provenance_matches_across_processes_given_equal_inputs() {
    // Two independently constructed (but identical) input sets hash the
    // same, so results can be compared across machines by fingerprint.
    let fw1 = sir_framework();
    let ps1 = sir_parset(&fw1);
    let fw2 = sir_framework();
    let ps2 = sir_parset(&fw2);
    let settings = sir_settings();
    let a = compute_provenance(&fw1, &ps1, &settings).unwrap();
    let b = compute_provenance(&fw2, &ps2, &settings).unwrap();
    assert_eq!(a, b);
}
