//! Per-procedure control-flow graph: one node per instruction, with
//! fall-through edges and explicit edges to every jump target.

use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;

use crate::assem::Instr;
use crate::error::{Error, Result};
use crate::temp::Label;

pub struct FlowGraph {
    pub graph: DiGraph<usize, ()>,
    /// Node of the i-th instruction.
    pub nodes: Vec<NodeIndex>,
}

impl FlowGraph {
    pub fn successors(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.graph
            .neighbors(self.nodes[index])
            .map(|n| self.graph[n])
    }
}

fn is_unconditional_jump(instr: &Instr) -> bool {
    matches!(
        instr,
        Instr::Oper { assem, jumps: Some(_), .. } if assem.starts_with("jmp")
    )
}

pub fn build(instrs: &[Instr]) -> Result<FlowGraph> {
    let mut graph = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..instrs.len()).map(|i| graph.add_node(i)).collect();

    let mut label_nodes: FxHashMap<&Label, NodeIndex> = FxHashMap::default();
    for (i, instr) in instrs.iter().enumerate() {
        if let Instr::Label { label, .. } = instr {
            label_nodes.insert(label, nodes[i]);
        }
    }

    for (i, instr) in instrs.iter().enumerate() {
        if i + 1 < instrs.len() && !is_unconditional_jump(instr) {
            graph.add_edge(nodes[i], nodes[i + 1], ());
        }
        if let Some(targets) = instr.jump_targets() {
            for target in targets {
                let node = label_nodes
                    .get(target)
                    .ok_or_else(|| Error::UndefinedLabel(target.to_string()))?;
                graph.add_edge(nodes[i], *node, ());
            }
        }
    }

    Ok(FlowGraph { graph, nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempFactory;
    use rustc_hash::FxHashSet;

    #[test]
    fn fall_through_stops_at_unconditional_jumps() {
        let mut temps = TempFactory::new();
        let t = temps.fresh();
        let l = Label::named("L0");
        let instrs = vec![
            Instr::oper("movq $1, `d0", vec![t], vec![]),
            Instr::jump_to("jmp `j0", vec![l.clone()]),
            Instr::oper("movq $2, `d0", vec![t], vec![]),
            Instr::label(l),
        ];
        let fg = build(&instrs).unwrap();
        let succ0: Vec<usize> = fg.successors(0).collect();
        assert_eq!(succ0, vec![1]);
        // The jump leads to the label, not the dead move behind it.
        let succ1: FxHashSet<usize> = fg.successors(1).collect();
        assert_eq!(succ1, FxHashSet::from_iter([3]));
        let succ2: Vec<usize> = fg.successors(2).collect();
        assert_eq!(succ2, vec![3]);
    }

    #[test]
    fn conditional_jumps_reach_both_targets() {
        let t = Label::named("T");
        let f = Label::named("F");
        let instrs = vec![
            Instr::jump_to("jle `j0", vec![t.clone(), f.clone()]),
            Instr::label(f),
            Instr::label(t),
        ];
        let fg = build(&instrs).unwrap();
        let succ: FxHashSet<usize> = fg.successors(0).collect();
        assert_eq!(succ, FxHashSet::from_iter([1, 2]));
    }

    #[test]
    fn dangling_targets_are_detected() {
        let instrs = vec![Instr::jump_to("jmp `j0", vec![Label::named("nowhere")])];
        assert!(matches!(build(&instrs), Err(Error::UndefinedLabel(_))));
    }
}
