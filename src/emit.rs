//! Drives each procedure fragment through canonicalization, selection and
//! register allocation, then renders the final `.s` text: a `.text`
//! section of prologs, allocated bodies and epilogs, followed by the
//! string literals as length-prefixed byte blocks.

use tracing::info;

use crate::assem::Instr;
use crate::canon;
use crate::codegen;
use crate::config::Options;
use crate::error::Result;
use crate::frame::{x64, Fragment, Frame};
use crate::ir::Stm;
use crate::regalloc;
use crate::temp::Label;
use crate::Context;

pub fn assemble(frags: Vec<Fragment>, options: &Options, ctx: &mut Context) -> Result<String> {
    let mut out = String::new();
    let mut strings: Vec<(Label, String)> = Vec::new();

    out.push_str(".text\n");
    out.push_str(&format!(".globl {}\n", options.entry_label));
    let mut procs = 0usize;
    for frag in frags {
        match frag {
            Fragment::Proc { body, mut frame } => {
                emit_proc(&mut out, body, &mut frame, options, ctx)?;
                procs += 1;
            }
            Fragment::Str { label, text } => strings.push((label, text)),
        }
    }

    if !strings.is_empty() {
        out.push_str(&format!("{}\n", options.data_section));
        for (label, text) in &strings {
            out.push_str(&format!(
                "{}:\n\t.quad {}\n\t.ascii \"{}\"\n",
                label,
                text.len(),
                escape_bytes(text)
            ));
        }
    }
    info!(procs, strings = strings.len(), "assembly emitted");
    Ok(out)
}

fn emit_proc(
    out: &mut String,
    body: Stm,
    frame: &mut Frame,
    options: &Options,
    ctx: &mut Context,
) -> Result<()> {
    let stms = canon::canonicalize(body, ctx);
    let mut instrs = codegen::select(frame, stms, &mut ctx.temps)?;
    frame.proc_entry_exit2(&mut instrs);
    let allocation = regalloc::allocate(frame, instrs, &mut ctx.temps, options.max_alloc_rounds)?;

    // The prolog renders last-minute: the frame size now includes every
    // spill slot.
    out.push_str(&frame.prolog());
    let coloring = &allocation.coloring;
    let name_of = |t: crate::temp::Temp| {
        x64::name(t)
            .or_else(|| coloring.get(&t).and_then(|reg| x64::name(*reg)))
            .expect("allocation left a temp unnamed")
            .to_string()
    };
    for instr in &allocation.instrs {
        match instr {
            // Coalescing pays off here: same-register copies disappear.
            Instr::Move { dst, src, .. } if coloring.get(dst) == coloring.get(src) => continue,
            Instr::Oper { assem, .. } if assem.is_empty() => continue,
            Instr::Label { .. } => {
                out.push_str(&instr.format(&name_of));
                out.push('\n');
            }
            _ => {
                out.push('\t');
                out.push_str(&instr.format(&name_of));
                out.push('\n');
            }
        }
    }
    out.push_str(&frame.epilog());
    Ok(())
}

fn escape_bytes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for &b in text.as_bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{:03o}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WORD_SIZE;
    use crate::ir::Exp;

    #[test]
    fn a_constant_body_emits_prolog_body_epilog() {
        let mut ctx = Context::new();
        let frame = Frame::new(Label::named("tigermain"), &[], &mut ctx.temps);
        let body = Stm::mov(Exp::Temp(x64::RETURN_VALUE), Exp::Const(7));
        let frags = vec![Fragment::Proc { body, frame }];
        let text = assemble(frags, &Options::default(), &mut ctx).unwrap();
        assert!(text.starts_with(".text\n.globl tigermain\n"));
        assert!(text.contains(".set tigermain_framesize, 0"));
        assert!(text.contains("tigermain:"));
        assert!(text.contains("\tsubq $tigermain_framesize, %rsp"));
        assert!(text.contains("\tmovq $7, %rax"));
        assert!(text.contains("\taddq $tigermain_framesize, %rsp"));
        assert!(text.contains("\tretq"));
        // No placeholder or abstract temp survives into the text.
        assert!(!text.contains('`'));
    }

    #[test]
    fn string_fragments_are_length_prefixed() {
        let mut ctx = Context::new();
        let frags = vec![Fragment::Str {
            label: Label::named("L7"),
            text: "abc\"\n".to_string(),
        }];
        let text = assemble(frags, &Options::default(), &mut ctx).unwrap();
        assert!(text.contains(".data\nL7:\n\t.quad 5\n\t.ascii \"abc\\\"\\n\"\n"));
    }

    #[test]
    fn frame_accesses_resolve_through_the_framesize_symbol() {
        let mut ctx = Context::new();
        let mut frame = Frame::new(Label::named("f"), &[], &mut ctx.temps);
        let local = frame.alloc_local(true, &mut ctx.temps);
        assert_eq!(frame.size(), WORD_SIZE);
        let body = Stm::mov(
            Exp::Temp(x64::RETURN_VALUE),
            local.exp(Exp::Temp(x64::FP)),
        );
        let frags = vec![Fragment::Proc { body, frame }];
        let text = assemble(frags, &Options::default(), &mut ctx).unwrap();
        assert!(text.contains(".set f_framesize, 8"));
        assert!(text.contains("movq f_framesize-8(%rsp), %rax"));
    }
}
