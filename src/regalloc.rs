//! The register-allocation driver: build the flow graph, run liveness,
//! color, and either finish or rewrite spilled temporaries through frame
//! slots and try again. Each spill introduces fresh short-lived
//! temporaries that are exempt from further spilling, so the loop makes
//! progress every round.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::assem::Instr;
use crate::color::{self, ColorResult};
use crate::error::{Error, Result};
use crate::flowgraph;
use crate::frame::{x64, Frame};
use crate::liveness;
use crate::temp::{Temp, TempFactory};

pub struct Allocation {
    pub instrs: Vec<Instr>,
    /// Machine register for every temporary in `instrs`.
    pub coloring: FxHashMap<Temp, Temp>,
}

pub fn allocate(
    frame: &mut Frame,
    mut instrs: Vec<Instr>,
    temps: &mut TempFactory,
    max_rounds: usize,
) -> Result<Allocation> {
    let mut not_spill: FxHashSet<Temp> = FxHashSet::default();
    for round in 0..max_rounds {
        let fg = flowgraph::build(&instrs)?;
        let lv = liveness::analyze(&fg, &instrs);
        let ig = liveness::interference(&instrs, &lv.live_out);
        let result = color::color(&ig, &not_spill);
        if result.spills.is_empty() {
            verify_complete(&instrs, &result)?;
            debug!(round, "allocation complete");
            return Ok(Allocation {
                instrs,
                coloring: result.coloring,
            });
        }
        debug!(
            round,
            spills = result.spills.len(),
            "rewriting spilled temporaries"
        );
        rewrite_program(frame, &mut instrs, &result.spills, temps, &mut not_spill);
    }
    Err(Error::AllocatorDiverged {
        proc_name: frame.name().to_string(),
        iterations: max_rounds,
    })
}

/// A temporary with no assigned register after a clean coloring is a
/// pipeline bug and must not reach the emitter.
fn verify_complete(instrs: &[Instr], result: &ColorResult) -> Result<()> {
    for instr in instrs {
        for t in instr.defs().into_iter().chain(instr.uses()) {
            let named = x64::name(t).is_some()
                || result
                    .coloring
                    .get(&t)
                    .is_some_and(|reg| x64::name(*reg).is_some());
            if !named {
                return Err(Error::DanglingTemp(t.to_string()));
            }
        }
    }
    Ok(())
}

/// Gives every spilled temporary a frame slot and rewrites each of its
/// occurrences through a fresh temporary, loading before uses and storing
/// after definitions.
fn rewrite_program(
    frame: &mut Frame,
    instrs: &mut Vec<Instr>,
    spills: &[Temp],
    temps: &mut TempFactory,
    not_spill: &mut FxHashSet<Temp>,
) {
    for &spilled in spills {
        let offset = frame.alloc_spill();
        let sym = frame.framesize_symbol();
        let slot = -offset;
        let mut rewritten: Vec<Instr> = Vec::with_capacity(instrs.len() + 2);
        for mut instr in instrs.drain(..) {
            let used = instr.uses().contains(&spilled);
            let defined = instr.defs().contains(&spilled);
            if !used && !defined {
                rewritten.push(instr);
                continue;
            }
            let fresh = temps.fresh();
            not_spill.insert(fresh);
            instr.replace_temp(spilled, fresh);
            if used {
                rewritten.push(Instr::oper(
                    format!("movq {}-{}(`s0), `d0", sym, slot),
                    vec![fresh],
                    vec![x64::RSP],
                ));
            }
            rewritten.push(instr);
            if defined {
                rewritten.push(Instr::oper(
                    format!("movq `s0, {}-{}(`s1)", sym, slot),
                    vec![],
                    vec![fresh, x64::RSP],
                ));
            }
        }
        *instrs = rewritten;
    }
}
