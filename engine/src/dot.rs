// dot.rs — Graphviz DOT output for integration graphs
//
// Renders a built model's compartment network in DOT format suitable for
// `dot`, `neato`, or other Graphviz layout engines: one cluster per
// population, nodes styled by compartment kind, edges labelled with the
// driving parameter. Transfers appear as dashed inter-cluster edges.
//
// Preconditions: `model` has been built (links wired).
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::compartment::CompKind;
use crate::model::Model;

/// Emit the model's compartment network as a Graphviz DOT string.
pub fn emit_dot(model: &Model) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph model {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    for pop in &model.pops {
        let cluster = sanitize(&pop.name);
        writeln!(buf).unwrap();
        writeln!(buf, "    subgraph cluster_{cluster} {{").unwrap();
        writeln!(buf, "        label=\"population: {}\";", pop.name).unwrap();
        writeln!(buf, "        style=rounded;").unwrap();
        writeln!(buf, "        color=gray50;").unwrap();
        for &cid in &pop.comps {
            let comp = &model.comps[cid.index()];
            let node = node_id(&pop.name, &comp.name);
            let (shape, extra) = match &comp.kind {
                CompKind::Source => ("invtriangle", ", style=filled, fillcolor=gray90"),
                CompKind::Sink => ("triangle", ", style=filled, fillcolor=gray90"),
                CompKind::Junction { .. } => ("diamond", ""),
                CompKind::Timed(_) => ("box3d", ""),
                CompKind::Plain => ("box", ""),
            };
            writeln!(
                buf,
                "        {node} [label=\"{}\", shape={shape}{extra}];",
                comp.name
            )
            .unwrap();
        }
        writeln!(buf, "    }}").unwrap();
    }

    writeln!(buf).unwrap();
    for link in &model.links {
        let src = &model.comps[link.source.index()];
        let dst = &model.comps[link.dest.index()];
        let par = &model.pars[link.par.index()];
        let from = node_id(&model.pops[src.pop.index()].name, &src.name);
        let to = node_id(&model.pops[dst.pop.index()].name, &dst.name);
        let style = if link.is_transfer {
            ", style=dashed"
        } else if link.is_flush {
            ", style=bold"
        } else {
            ""
        };
        writeln!(buf, "    {from} -> {to} [label=\"{}\"{style}];", par.name).unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

fn node_id(pop: &str, comp: &str) -> String {
    format!("{}_{}", sanitize(pop), sanitize(comp))
}

/// Replace characters DOT identifiers cannot contain.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CompartmentSpec, Framework, ParamFormat, ParameterSpec};
    use crate::parset::{ParameterSet, PopDef};
    use crate::settings::Settings;

    fn small_model() -> Model {
        let mut fw = Framework::new("t");
        let mut sus = CompartmentSpec::new("sus");
        sus.databook_page = Some("comps".into());
        fw.comps.push(sus);
        let mut dead = CompartmentSpec::new("dead");
        dead.is_sink = true;
        fw.comps.push(dead);
        let mut death = ParameterSpec::new("death");
        death.format = Some(ParamFormat::Probability);
        death.databook_page = Some("pars".into());
        fw.pars.push(death);
        fw.add_transition("death", "sus", "dead");
        fw.validate().unwrap();

        let pops = vec![PopDef::new("adults", "default")];
        let mut ps = ParameterSet::new("default", &fw, &pops);
        ps.set_constant("sus", "adults", 100.0).unwrap();
        ps.set_constant("death", "adults", 0.1).unwrap();

        let settings = Settings::new(2000.0, 2002.0, 1.0).unwrap();
        Model::build(&settings, &fw, &ps, None).unwrap()
    }

    #[test]
    fn emits_clusters_nodes_and_edges() {
        let model = small_model();
        let dot = emit_dot(&model);
        assert!(dot.starts_with("digraph model {"));
        assert!(dot.contains("subgraph cluster_adults"));
        assert!(dot.contains("adults_sus [label=\"sus\", shape=box];"));
        assert!(dot.contains("shape=triangle"));
        assert!(dot.contains("adults_sus -> adults_dead [label=\"death\"];"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn output_is_deterministic() {
        let a = emit_dot(&small_model());
        let b = emit_dot(&small_model());
        assert_eq!(a, b);
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("pop one"), "pop_one");
        assert_eq!(sanitize("a-b"), "a_b");
    }
}
