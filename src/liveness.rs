//! Liveness analysis and interference-graph construction. The dataflow is
//! the classic backward fixed point
//!
//! ```text
//! in[n]  = use[n] ∪ (out[n] \ def[n])
//! out[n] = ⋃ in[s]  for s ∈ succ(n)
//! ```
//!
//! iterated in reverse program order until nothing grows.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::assem::Instr;
use crate::flowgraph::FlowGraph;
use crate::frame::x64;
use crate::temp::Temp;

pub struct Liveness {
    pub live_in: Vec<FxHashSet<Temp>>,
    pub live_out: Vec<FxHashSet<Temp>>,
}

pub fn analyze(fg: &FlowGraph, instrs: &[Instr]) -> Liveness {
    let n = instrs.len();
    let mut live_in: Vec<FxHashSet<Temp>> = vec![FxHashSet::default(); n];
    let mut live_out: Vec<FxHashSet<Temp>> = vec![FxHashSet::default(); n];

    let mut rounds = 0usize;
    let mut changed = true;
    while changed {
        changed = false;
        rounds += 1;
        for i in (0..n).rev() {
            let mut out_new: FxHashSet<Temp> = FxHashSet::default();
            for s in fg.successors(i) {
                out_new.extend(live_in[s].iter().copied());
            }
            let defs = instrs[i].defs();
            let mut in_new: FxHashSet<Temp> = instrs[i].uses().into_iter().collect();
            for &t in &out_new {
                if !defs.contains(&t) {
                    in_new.insert(t);
                }
            }
            if out_new != live_out[i] {
                live_out[i] = out_new;
                changed = true;
            }
            if in_new != live_in[i] {
                live_in[i] = in_new;
                changed = true;
            }
        }
    }
    trace!(instrs = n, rounds, "liveness fixed point");
    Liveness { live_in, live_out }
}

/// Checks both dataflow equations at once, for the benefit of tests.
pub fn is_fixed_point(fg: &FlowGraph, instrs: &[Instr], liveness: &Liveness) -> bool {
    for i in 0..instrs.len() {
        let mut out: FxHashSet<Temp> = FxHashSet::default();
        for s in fg.successors(i) {
            out.extend(liveness.live_in[s].iter().copied());
        }
        if out != liveness.live_out[i] {
            return false;
        }
        let defs = instrs[i].defs();
        let mut inn: FxHashSet<Temp> = instrs[i].uses().into_iter().collect();
        for &t in &out {
            if !defs.contains(&t) {
                inn.insert(t);
            }
        }
        if inn != liveness.live_in[i] {
            return false;
        }
    }
    true
}

/// Interference of temporaries, plus the move pairs the colorer may
/// coalesce.
pub struct InterferenceGraph {
    pub nodes: Vec<Temp>,
    edges: FxHashSet<(Temp, Temp)>,
    /// `(src, dst)` of every register-to-register move.
    pub moves: Vec<(Temp, Temp)>,
}

impl InterferenceGraph {
    pub fn interferes(&self, a: Temp, b: Temp) -> bool {
        self.edges.contains(&(a, b))
    }

    pub fn edges(&self) -> impl Iterator<Item = (Temp, Temp)> + '_ {
        self.edges.iter().copied()
    }
}

pub fn interference(instrs: &[Instr], live_out: &[FxHashSet<Temp>]) -> InterferenceGraph {
    let mut nodes = Vec::new();
    let mut seen: FxHashSet<Temp> = FxHashSet::default();
    for &reg in x64::REGISTERS.iter() {
        seen.insert(reg);
        nodes.push(reg);
    }
    for instr in instrs {
        for t in instr.defs().into_iter().chain(instr.uses()) {
            if seen.insert(t) {
                nodes.push(t);
            }
        }
    }

    let mut edges: FxHashSet<(Temp, Temp)> = FxHashSet::default();
    let mut add_edge = |edges: &mut FxHashSet<(Temp, Temp)>, a: Temp, b: Temp| {
        if a != b {
            edges.insert((a, b));
            edges.insert((b, a));
        }
    };

    let mut moves = Vec::new();
    let mut move_seen: FxHashSet<(Temp, Temp)> = FxHashSet::default();
    for (i, instr) in instrs.iter().enumerate() {
        match instr {
            Instr::Move { dst, src, .. } => {
                // The move source does not interfere with the target, so
                // the two stay coalescable.
                for &o in &live_out[i] {
                    if o != *dst && o != *src {
                        add_edge(&mut edges, *dst, o);
                    }
                }
                if move_seen.insert((*src, *dst)) {
                    moves.push((*src, *dst));
                }
            }
            _ => {
                for d in instr.defs() {
                    for &o in &live_out[i] {
                        if o != d {
                            add_edge(&mut edges, d, o);
                        }
                    }
                }
            }
        }
    }

    // Machine registers are pairwise incompatible by definition.
    for &a in x64::REGISTERS.iter() {
        for &b in x64::REGISTERS.iter() {
            add_edge(&mut edges, a, b);
        }
    }

    InterferenceGraph { nodes, edges, moves }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowgraph;
    use crate::temp::{Label, TempFactory};

    fn straight_line(instrs: &[Instr]) -> (Liveness, FlowGraph) {
        let fg = flowgraph::build(instrs).unwrap();
        let lv = analyze(&fg, instrs);
        (lv, fg)
    }

    #[test]
    fn uses_propagate_backwards() {
        let mut temps = TempFactory::new();
        let a = temps.fresh();
        let b = temps.fresh();
        let instrs = vec![
            Instr::oper("movq $1, `d0", vec![a], vec![]),
            Instr::oper("movq $2, `d0", vec![b], vec![]),
            Instr::oper("addq `s0, `d0", vec![b], vec![a, b]),
        ];
        let (lv, fg) = straight_line(&instrs);
        assert!(lv.live_out[0].contains(&a));
        assert!(lv.live_out[1].contains(&a));
        assert!(lv.live_in[2].contains(&a));
        assert!(lv.live_out[2].is_empty());
        assert!(is_fixed_point(&fg, &instrs, &lv));
    }

    #[test]
    fn loops_keep_temps_live_around_the_back_edge() {
        let mut temps = TempFactory::new();
        let i = temps.fresh();
        let top = Label::named("top");
        let out = Label::named("out");
        let instrs = vec![
            Instr::oper("movq $0, `d0", vec![i], vec![]),
            Instr::label(top.clone()),
            Instr::oper("addq $1, `d0", vec![i], vec![i]),
            Instr::jump_to("jle `j0", vec![top, out.clone()]),
            Instr::label(out),
        ];
        let (lv, fg) = straight_line(&instrs);
        // Live along the back edge into the label.
        assert!(lv.live_in[1].contains(&i));
        assert!(lv.live_out[3].contains(&i));
        assert!(is_fixed_point(&fg, &instrs, &lv));
    }

    #[test]
    fn interference_skips_move_sources() {
        let mut temps = TempFactory::new();
        let a = temps.fresh();
        let b = temps.fresh();
        let c = temps.fresh();
        let instrs = vec![
            Instr::oper("movq $1, `d0", vec![a], vec![]),
            Instr::oper("movq $2, `d0", vec![c], vec![]),
            Instr::mov(b, a),
            Instr::oper("addq `s0, `d0", vec![b], vec![a, b]),
            Instr::oper("addq `s0, `d0", vec![c], vec![c, c]),
        ];
        let fg = flowgraph::build(&instrs).unwrap();
        let lv = analyze(&fg, &instrs);
        let ig = interference(&instrs, &lv.live_out);
        // b is copied from a while a stays live, but that alone must not
        // make them interfere.
        assert!(!ig.interferes(a, b));
        // c is live across the definition of b.
        assert!(ig.interferes(b, c));
        assert!(ig.moves.contains(&(a, b)));
    }

    #[test]
    fn machine_registers_mutually_interfere() {
        let instrs: Vec<Instr> = vec![];
        let ig = interference(&instrs, &[]);
        assert!(ig.interferes(x64::RAX, x64::RBX));
        assert!(ig.interferes(x64::R15, x64::RDI));
        assert!(!ig.interferes(x64::RAX, x64::RAX));
    }
}
