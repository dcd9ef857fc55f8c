// init.rs — Compartment initialization from characteristic targets
//
// Builds the inclusion system A·x = b from the databook targets at the
// first simulation time and solves it in the least-squares sense
// (minimum-norm via SVD when underdetermined). Setup weights scale the
// rows. Failure produces a BadInitialization carrying a diagnostic trace
// that names each failing characteristic and its contributing
// compartments.
//
// Preconditions: graph nodes exist and are preallocated; parset validated.
// Postconditions: vals[0] written for every compartment of the population
//                 (timed compartments spread evenly over their rows).
// Failure modes: residual above tolerance, negative sizes, per-target
//                mismatch above tolerance, SVD failure.
// Side effects: writes compartment values at tick 0.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::compartment::Compartment;
use crate::error::{EngineError, Result};
use crate::framework::Framework;
use crate::parset::ParameterSet;
use crate::population::Population;

/// One row of the initialization system.
struct Target {
    name: String,
    /// Databook value at t_init (denominator applied for fractions).
    value: f64,
    weight: f64,
    /// Column indices of the included compartments.
    includes: Vec<usize>,
}

/// Initialize one population's compartments at tick 0.
pub(crate) fn initialize_population(
    pop: &Population,
    comps: &mut [Compartment],
    fw: &Framework,
    parset: &ParameterSet,
    t_init: f64,
    tolerance: f64,
) -> Result<()> {
    // Compartments being solved: everything that holds people.
    let solved: Vec<usize> = pop
        .comps
        .iter()
        .filter(|&&c| comps[c.index()].counts_toward_popsize())
        .map(|c| c.index())
        .collect();
    let col_of: BTreeMap<&str, usize> = solved
        .iter()
        .enumerate()
        .map(|(j, &c)| (comps[c].name.as_str(), j))
        .collect();

    let targets = collect_targets(pop, fw, parset, t_init, &col_of)?;

    if targets.is_empty() {
        // Nothing to solve: all compartments start empty.
        for &c in &solved {
            write_initial(&mut comps[c], 0.0);
        }
        zero_special(pop, comps);
        return Ok(());
    }

    let nrow = targets.len();
    let ncol = solved.len();
    let mut a = DMatrix::<f64>::zeros(nrow, ncol);
    let mut b = DVector::<f64>::zeros(nrow);
    for (i, tgt) in targets.iter().enumerate() {
        for &j in &tgt.includes {
            a[(i, j)] = tgt.weight;
        }
        b[i] = tgt.value * tgt.weight;
    }

    let svd = a.clone().svd(true, true);
    let x = svd.solve(&b, 1e-12).map_err(|e| EngineError::BadInitialization {
        population: pop.name.clone(),
        messages: vec![format!("least-squares solve failed: {e}")],
    })?;
    let x = x.column(0).into_owned();

    let mut messages = Vec::new();

    // Per-target consistency, unweighted.
    for tgt in &targets {
        let proposed: f64 = tgt.includes.iter().map(|&j| x[j]).sum();
        if (proposed - tgt.value).abs() > tolerance {
            messages.push(format!(
                "characteristic '{}': requested {:.6}, calculated {:.6}",
                tgt.name, tgt.value, proposed
            ));
            report_target(tgt, &solved, comps, &x, &mut messages);
        }
    }

    // Overall residual of the weighted system.
    let residual = (&a * &x - &b).norm_squared();
    if residual > tolerance {
        messages.push(format!(
            "residual {residual:.3e} exceeds tolerance {tolerance:.3e}; the initial values \
             are inconsistent"
        ));
    }

    // Negative sizes beyond tolerance.
    for (j, &c) in solved.iter().enumerate() {
        if x[j] < -tolerance {
            messages.push(format!(
                "compartment '{}': calculated negative size {:.6}",
                comps[c].name, x[j]
            ));
            for tgt in targets.iter().filter(|t| t.includes.contains(&j)) {
                report_target(tgt, &solved, comps, &x, &mut messages);
            }
        }
    }

    if !messages.is_empty() {
        return Err(EngineError::BadInitialization {
            population: pop.name.clone(),
            messages,
        });
    }

    for (j, &c) in solved.iter().enumerate() {
        write_initial(&mut comps[c], x[j].max(0.0));
    }
    zero_special(pop, comps);
    Ok(())
}

/// Build the target rows from every databook compartment/characteristic
/// with a non-zero setup weight.
fn collect_targets(
    pop: &Population,
    fw: &Framework,
    parset: &ParameterSet,
    t_init: f64,
    col_of: &BTreeMap<&str, usize>,
) -> Result<Vec<Target>> {
    let mut targets = Vec::new();

    for spec in &fw.characs {
        if spec.databook_page.is_none()
            || spec.effective_setup_weight() == 0.0
            || spec.function.is_some()
            || pop.charac_id(&spec.name).is_none()
        {
            continue;
        }
        let mut value = parset.sample(&spec.name, &pop.name, t_init)?;
        if let Some(denom) = &spec.denominator {
            // Fraction characteristics: scale the target back up to a count.
            if parset.has_data(denom, &pop.name) {
                value *= parset.sample(denom, &pop.name, t_init)?;
            }
        }
        let mut includes = Vec::new();
        expand_includes(fw, &spec.name, col_of, &mut includes);
        includes.sort_unstable();
        includes.dedup();
        targets.push(Target {
            name: spec.name.clone(),
            value,
            weight: spec.effective_setup_weight(),
            includes,
        });
    }

    for spec in &fw.comps {
        if spec.databook_page.is_none()
            || spec.effective_setup_weight() == 0.0
            || pop.comp_id(&spec.name).is_none()
        {
            continue;
        }
        let value = parset.sample(&spec.name, &pop.name, t_init)?;
        let includes = match col_of.get(spec.name.as_str()) {
            Some(&j) => vec![j],
            None => continue,
        };
        targets.push(Target {
            name: spec.name.clone(),
            value,
            weight: spec.effective_setup_weight(),
            includes,
        });
    }

    Ok(targets)
}

/// Transitively expand a characteristic (or compartment) name into solved
/// compartment columns. Source and sink components contribute nothing.
fn expand_includes(
    fw: &Framework,
    name: &str,
    col_of: &BTreeMap<&str, usize>,
    out: &mut Vec<usize>,
) {
    if let Some(&j) = col_of.get(name) {
        out.push(j);
        return;
    }
    if let Some(spec) = fw.charac(name) {
        for comp in &spec.components {
            expand_includes(fw, comp, col_of, out);
        }
    }
}

/// Append the per-compartment breakdown of one target to the trace.
fn report_target(
    tgt: &Target,
    solved: &[usize],
    comps: &[Compartment],
    x: &DVector<f64>,
    messages: &mut Vec<String>,
) {
    for &j in &tgt.includes {
        messages.push(format!(
            "  '{}' includes compartment '{}': computed {:.6}",
            tgt.name,
            comps[solved[j]].name,
            x[j]
        ));
    }
}

fn write_initial(comp: &mut Compartment, value: f64) {
    comp.vals[0] = value;
    if let Some(t) = comp.timed_mut() {
        let rows = t.rows;
        if rows > 0 {
            let share = value / rows as f64;
            let mut sum = 0.0;
            for r in 0..rows {
                t.row_vals[[r, 0]] = share;
                sum += share;
            }
            // Keep the stored total bitwise-equal to the row sum, the same
            // summation the per-tick update performs.
            comp.vals[0] = sum;
        }
    }
}

fn zero_special(pop: &Population, comps: &mut [Compartment]) {
    for &c in &pop.comps {
        let comp = &mut comps[c.index()];
        if comp.is_source() || comp.is_sink() {
            comp.vals[0] = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CharacteristicSpec, CompartmentSpec, ParamFormat, ParameterSpec};
    use crate::parset::PopDef;
    use crate::population::GraphBuilder;
    use std::collections::HashSet;

    /// sus/inf with databook totals via characteristics:
    /// alive = sus + inf = 100, infected = inf = 10.
    fn fixture(alive: f64, inf: f64) -> (Framework, ParameterSet) {
        let mut fw = Framework::new("t");
        fw.comps.push(CompartmentSpec::new("sus"));
        fw.comps.push(CompartmentSpec::new("inf"));
        let mut alive_spec = CharacteristicSpec::new("alive", &["sus", "inf"]);
        alive_spec.databook_page = Some("chars".into());
        fw.characs.push(alive_spec);
        let mut inf_spec = CharacteristicSpec::new("infected", &["inf"]);
        inf_spec.databook_page = Some("chars".into());
        fw.characs.push(inf_spec);
        let mut rate = ParameterSpec::new("rate");
        rate.format = Some(ParamFormat::Probability);
        rate.databook_page = Some("pars".into());
        fw.pars.push(rate);
        fw.add_transition("rate", "sus", "inf");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("alive", "adults", alive).unwrap();
        ps.set_constant("infected", "adults", inf).unwrap();
        ps.set_constant("rate", "adults", 0.1).unwrap();
        (fw, ps)
    }

    fn build_and_init(fw: &Framework, ps: &ParameterSet) -> Result<Vec<f64>> {
        let mut b = GraphBuilder::new(fw, HashSet::new());
        b.add_population("adults", "default").unwrap();
        let GraphBuilder {
            mut comps, pops, ..
        } = b;
        for c in comps.iter_mut() {
            c.preallocate(3);
        }
        initialize_population(&pops[0], &mut comps, fw, ps, 2000.0, 1e-6)?;
        Ok(pops[0]
            .comps
            .iter()
            .map(|&c| comps[c.index()].vals[0])
            .collect())
    }

    #[test]
    fn solves_exactly_determined_system() {
        let (fw, ps) = fixture(100.0, 10.0);
        let vals = build_and_init(&fw, &ps).unwrap();
        assert!((vals[0] - 90.0).abs() < 1e-9);
        assert!((vals[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn negative_solution_rejected_with_trace() {
        // alive = 5 but infected = 10 forces sus = -5.
        let (fw, ps) = fixture(5.0, 10.0);
        let err = build_and_init(&fw, &ps).unwrap_err();
        match err {
            EngineError::BadInitialization {
                population,
                messages,
            } => {
                assert_eq!(population, "adults");
                assert!(messages.iter().any(|m| m.contains("negative size")));
                assert!(messages.iter().any(|m| m.contains("'alive'")));
            }
            other => panic!("expected BadInitialization, got {other}"),
        }
    }

    #[test]
    fn inconsistent_overdetermined_system_rejected() {
        let (mut fw, _) = fixture(100.0, 10.0);
        // Add a direct databook target for inf that contradicts 'infected'.
        fw.comps[1].databook_page = Some("comps".into());
        fw.validate().unwrap();
        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("alive", "adults", 100.0).unwrap();
        ps.set_constant("infected", "adults", 10.0).unwrap();
        ps.set_constant("inf", "adults", 50.0).unwrap();
        ps.set_constant("rate", "adults", 0.1).unwrap();

        let err = build_and_init(&fw, &ps).unwrap_err();
        assert!(matches!(err, EngineError::BadInitialization { .. }));
        let text = err.to_string();
        assert!(text.contains("requested") || text.contains("residual"));
    }

    #[test]
    fn underdetermined_system_uses_minimum_norm() {
        // Only 'alive' is specified over two compartments: the minimum-norm
        // solution splits the total evenly.
        let mut fw = Framework::new("t");
        fw.comps.push(CompartmentSpec::new("a"));
        fw.comps.push(CompartmentSpec::new("b"));
        let mut total = CharacteristicSpec::new("total", &["a", "b"]);
        total.databook_page = Some("chars".into());
        fw.characs.push(total);
        let mut rate = ParameterSpec::new("rate");
        rate.format = Some(ParamFormat::Probability);
        fw.pars.push(rate);
        fw.add_transition("rate", "a", "b");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("total", "adults", 50.0).unwrap();

        let vals = build_and_init(&fw, &ps).unwrap();
        assert!((vals[0] - 25.0).abs() < 1e-9);
        assert!((vals[1] - 25.0).abs() < 1e-9);
    }

    #[test]
    fn fraction_characteristic_scaled_by_denominator() {
        let mut fw = Framework::new("t");
        fw.comps.push(CompartmentSpec::new("sus"));
        fw.comps.push(CompartmentSpec::new("inf"));
        let mut alive = CharacteristicSpec::new("alive", &["sus", "inf"]);
        alive.databook_page = Some("chars".into());
        fw.characs.push(alive);
        let mut prev = CharacteristicSpec::new("prev", &["inf"]);
        prev.denominator = Some("alive".into());
        prev.databook_page = Some("chars".into());
        fw.characs.push(prev);
        let mut rate = ParameterSpec::new("rate");
        rate.format = Some(ParamFormat::Probability);
        fw.pars.push(rate);
        fw.add_transition("rate", "sus", "inf");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("alive", "adults", 200.0).unwrap();
        ps.set_constant("prev", "adults", 0.25).unwrap();

        let vals = build_and_init(&fw, &ps).unwrap();
        assert!((vals[1] - 50.0).abs() < 1e-9);
        assert!((vals[0] - 150.0).abs() < 1e-9);
    }
}
