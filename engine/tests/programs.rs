// Program-driven overwrites: budgets, capacity, coverage clipping, and
// parameter scenarios.

mod common;

use common::*;
use epidyn::programs::Covout;
use epidyn::{
    run, ParameterScenario, Program, ProgramInstructions, ProgramSet, Settings, TimeSeries,
};

/// A treatment program covering infected people: coverage raises the
/// recovery rate from 0.1 (baseline) towards 0.9 (full coverage).
fn treatment_progset() -> ProgramSet {
    let mut ps = ProgramSet::new("default");
    let mut tx = Program::new("treatment");
    tx.target_pops = vec!["adults".into()];
    tx.target_comps = vec!["inf".into()];
    tx.unit_cost = TimeSeries::constant(100.0);
    tx.spend_data = TimeSeries::constant(2000.0);
    ps.programs.push(tx);
    ps.covouts.push(Covout {
        par: "rec_rate".into(),
        pop: "adults".into(),
        baseline: 0.1,
        outcomes: vec![("treatment".into(), 0.9)],
    });
    ps
}

#[test]
fn programs_with_default_spending_change_the_epidemic() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = sir_settings();
    let progset = treatment_progset();
    let instructions = ProgramInstructions::new(2018.0);

    let baseline = run(&settings, &fw, &parset, None).unwrap();
    let programmed = run(&settings, &fw, &parset, Some((&progset, &instructions))).unwrap();

    // Treatment speeds up recovery, so the infected burden from the
    // program start onward is strictly lower.
    let t = baseline.t().to_vec();
    let base_inf = baseline.series("adults", "inf").unwrap().vals;
    let prog_inf = programmed.series("adults", "inf").unwrap().vals;
    let burden = |vals: &[f64]| -> f64 {
        t.iter()
            .zip(vals)
            .filter(|(ti, _)| **ti >= 2018.0 && **ti <= 2023.0)
            .map(|(_, v)| v)
            .sum()
    };
    assert!(burden(&prog_inf) < burden(&base_inf));

    // Before the window the runs are identical.
    for (ti, time) in t.iter().enumerate() {
        if *time < 2018.0 {
            assert_eq!(base_inf[ti], prog_inf[ti], "diverged before start year");
        }
    }
}

#[test]
fn doubling_the_budget_reduces_burden_further() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = sir_settings();
    let progset = treatment_progset();

    let baseline_ins = ProgramInstructions::new(2018.0);
    let mut doubled_ins = ProgramInstructions::new(2018.0);
    doubled_ins.set_alloc("treatment", TimeSeries::constant(4000.0));

    let base = run(&settings, &fw, &parset, Some((&progset, &baseline_ins))).unwrap();
    let doubled = run(&settings, &fw, &parset, Some((&progset, &doubled_ins))).unwrap();

    let t = base.t().to_vec();
    let burden = |res: &epidyn::SimResult| -> f64 {
        let vals = res.series("adults", "inf").unwrap().vals;
        t.iter()
            .zip(&vals)
            .filter(|(ti, _)| **ti >= 2018.0 && **ti <= 2023.0)
            .map(|(_, v)| *v)
            .sum()
    };
    assert!(burden(&doubled) < burden(&base));

    // Spending views reflect the override.
    assert_eq!(base.get_alloc(2018.0).unwrap()[0].1, 2000.0);
    assert_eq!(doubled.get_alloc(2018.0).unwrap()[0].1, 4000.0);
}

#[test]
fn coverage_override_above_one_is_clipped() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = sir_settings();
    let progset = treatment_progset();
    let mut instructions = ProgramInstructions::new(2018.0);
    instructions.set_coverage("treatment", TimeSeries::constant(2.0));

    let res = run(&settings, &fw, &parset, Some((&progset, &instructions))).unwrap();

    // The observed coverage fraction is exactly 1.0 across the window.
    for &year in &[2018.0, 2020.0, 2025.0, 2030.0] {
        let cov = res.get_coverage("fraction", year).unwrap();
        assert_eq!(cov[0].1, 1.0, "coverage not clipped at {year}");
    }
    // Outside the window no coverage is recorded.
    let before = res.get_coverage("fraction", 2010.0).unwrap();
    assert!(before[0].1.is_nan());

    // Full coverage drives the recovery rate to the saturating outcome.
    let rec_rate = res.series("adults", "rec_rate").unwrap().vals;
    let t = res.t().to_vec();
    for (ti, time) in t.iter().enumerate() {
        if *time >= 2018.0 {
            assert!((rec_rate[ti] - 0.9).abs() < 1e-12);
        } else {
            assert!((rec_rate[ti] - 0.1).abs() < 1e-12);
        }
    }
}

#[test]
fn capacity_constraint_caps_the_program() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = sir_settings();

    let mut progset = treatment_progset();
    // Plenty of money but almost no delivery capacity.
    progset.programs[0].spend_data = TimeSeries::constant(1e9);
    progset.programs[0].capacity_constraint = Some(TimeSeries::constant(5.0));
    let instructions = ProgramInstructions::new(2018.0);

    let res = run(&settings, &fw, &parset, Some((&progset, &instructions))).unwrap();
    let cap = res.get_coverage("capacity", 2020.0).unwrap();
    assert_eq!(cap[0].1, 5.0);

    // Covered number can never exceed the capacity constraint.
    let n = res.get_coverage("number", 2020.0).unwrap();
    assert!(n[0].1 <= 5.0 + 1e-9);
}

#[test]
fn stop_year_ends_the_overwrite() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = sir_settings();
    let progset = treatment_progset();
    let mut instructions = ProgramInstructions::new(2010.0);
    instructions.stop_year = Some(2015.0);
    instructions.set_coverage("treatment", TimeSeries::constant(1.0));

    let res = run(&settings, &fw, &parset, Some((&progset, &instructions))).unwrap();
    let rec_rate = res.series("adults", "rec_rate").unwrap().vals;
    let t = res.t().to_vec();
    for (ti, time) in t.iter().enumerate() {
        if *time >= 2010.0 && *time <= 2015.0 {
            assert!((rec_rate[ti] - 0.9).abs() < 1e-12, "inside window at {time}");
        } else {
            assert!((rec_rate[ti] - 0.1).abs() < 1e-12, "outside window at {time}");
        }
    }
}

// ── Parameter scenarios through the engine ──────────────────────────────────

#[test]
fn parameter_scenario_with_smooth_onset() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = Settings::new(2000.0, 2023.0, 1.0).unwrap();

    let mut scen = ParameterScenario::new("fewer contacts");
    scen.add_overwrite(
        "contacts",
        "adults",
        &[2010.0, 2020.0],
        &[80.0, 40.0],
        Some(2.0),
    );
    let scen_ps = scen.apply(&parset, &settings).unwrap();
    let res = run(&settings, &fw, &scen_ps, None).unwrap();

    let contacts = res.series("adults", "contacts").unwrap().vals;
    let t = res.t().to_vec();
    let at = |year: f64| -> f64 {
        contacts[t.iter().position(|x| (*x - year).abs() < 1e-9).unwrap()]
    };
    assert!((at(2018.0) - 80.0).abs() < 1e-9);
    assert!((at(2019.0) - 60.0).abs() < 1e-9);
    assert!((at(2020.0) - 40.0).abs() < 1e-9);
    assert!((at(2023.0) - 40.0).abs() < 1e-9);
}

#[test]
fn parameter_scenario_changes_the_epidemic() {
    let fw = sir_framework();
    let parset = sir_parset(&fw);
    let settings = sir_settings();

    let mut scen = ParameterScenario::new("fewer contacts");
    scen.add_overwrite("contacts", "adults", &[2005.0], &[10.0], None);
    let scen_ps = scen.apply(&parset, &settings).unwrap();

    let baseline = run(&settings, &fw, &parset, None).unwrap();
    let reduced = run(&settings, &fw, &scen_ps, None).unwrap();

    let last = baseline.t().len() - 1;
    let base_rec = baseline.series("adults", "rec").unwrap().vals[last];
    let red_rec = reduced.series("adults", "rec").unwrap().vals[last];
    assert!(red_rec < base_rec);
}
