//! Maximal-munch instruction selection: walks the canonical IR and tiles
//! it with x86-64 instructions over fresh temporaries. The abstract frame
//! pointer never survives selection; it is rewritten to `%rsp` plus the
//! procedure's framesize symbol.

use crate::assem::Instr;
use crate::error::{Error, Result};
use crate::frame::{x64, Frame};
use crate::ir::{BinOp, Exp, RelOp, Stm};
use crate::temp::{Temp, TempFactory};

pub fn select(frame: &Frame, stms: Vec<Stm>, temps: &mut TempFactory) -> Result<Vec<Instr>> {
    let mut munch = Munch {
        fs: frame.framesize_symbol(),
        instrs: Vec::new(),
        temps,
    };
    for stm in stms {
        munch.munch_stm(stm)?;
    }
    Ok(munch.instrs)
}

fn jcc(op: RelOp) -> &'static str {
    match op {
        RelOp::Eq => "je",
        RelOp::Ne => "jne",
        RelOp::Lt => "jl",
        RelOp::Gt => "jg",
        RelOp::Le => "jle",
        RelOp::Ge => "jge",
    }
}

/// `sym+c` or `sym-c` as an assembler displacement expression.
fn disp(symbol: &str, c: i64) -> String {
    if c >= 0 {
        format!("{}+{}", symbol, c)
    } else {
        format!("{}-{}", symbol, -c)
    }
}

struct Munch<'a> {
    fs: String,
    instrs: Vec<Instr>,
    temps: &'a mut TempFactory,
}

impl Munch<'_> {
    fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    fn munch_stm(&mut self, stm: Stm) -> Result<()> {
        match stm {
            Stm::Seq(a, b) => {
                self.munch_stm(*a)?;
                self.munch_stm(*b)
            }
            Stm::Label(label) => {
                self.push(Instr::label(label));
                Ok(())
            }
            Stm::Jump(e, targets) => match *e {
                Exp::Name(_) => {
                    self.push(Instr::jump_to("jmp `j0", targets));
                    Ok(())
                }
                _ => Err(Error::ComputedJump),
            },
            Stm::CJump(op, l, r, t, f) => {
                let lt = self.munch_exp(*l)?;
                let rt = self.munch_exp(*r)?;
                self.push(Instr::oper("cmpq `s1, `s0", vec![], vec![lt, rt]));
                self.push(Instr::jump_to(format!("{} `j0", jcc(op)), vec![t, f]));
                Ok(())
            }
            Stm::Move(dst, src) => match *dst {
                Exp::Temp(d) => self.munch_move_temp(d, *src),
                Exp::Mem(addr) => self.munch_move_mem(*addr, *src),
                _ => Err(Error::MoveDestination),
            },
            Stm::Exp(e) => match *e {
                Exp::Call {
                    func,
                    args,
                    static_link,
                } => self.munch_call(*func, args, static_link),
                Exp::Const(_) => Ok(()),
                other => {
                    self.munch_exp(other)?;
                    Ok(())
                }
            },
        }
    }

    fn munch_move_temp(&mut self, d: Temp, src: Exp) -> Result<()> {
        match src {
            Exp::Const(n) => {
                self.push(Instr::oper(format!("movq ${}, `d0", n), vec![d], vec![]));
            }
            Exp::Name(label) => {
                self.push(Instr::oper(
                    format!("leaq {}(%rip), `d0", label),
                    vec![d],
                    vec![],
                ));
            }
            Exp::Temp(s) if s == x64::FP => {
                self.push(Instr::oper(
                    format!("leaq {}(`s0), `d0", self.fs),
                    vec![d],
                    vec![x64::RSP],
                ));
            }
            Exp::Temp(s) => {
                self.push(Instr::mov(d, s));
            }
            Exp::Mem(addr) => {
                self.munch_load(d, *addr)?;
            }
            Exp::Call {
                func,
                args,
                static_link,
            } => {
                self.munch_call(*func, args, static_link)?;
                self.push(Instr::mov(d, x64::RAX));
            }
            other => {
                let s = self.munch_exp(other)?;
                self.push(Instr::mov(d, s));
            }
        }
        Ok(())
    }

    /// `movq <addr-form>, d`, folding constant displacements and the
    /// frame pointer into the address.
    fn munch_load(&mut self, d: Temp, addr: Exp) -> Result<()> {
        match addr {
            Exp::Binop(BinOp::Plus, base, off) => match (*base, *off) {
                (Exp::Temp(t), Exp::Const(c)) if t == x64::FP => {
                    self.push(Instr::oper(
                        format!("movq {}(`s0), `d0", disp(&self.fs, c)),
                        vec![d],
                        vec![x64::RSP],
                    ));
                }
                (base, Exp::Const(c)) => {
                    let b = self.munch_exp(base)?;
                    self.push(Instr::oper(
                        format!("movq {}(`s0), `d0", c),
                        vec![d],
                        vec![b],
                    ));
                }
                (Exp::Const(c), base) => {
                    let b = self.munch_exp(base)?;
                    self.push(Instr::oper(
                        format!("movq {}(`s0), `d0", c),
                        vec![d],
                        vec![b],
                    ));
                }
                (base, off) => {
                    let a = self.munch_exp(Exp::binop(BinOp::Plus, base, off))?;
                    self.push(Instr::oper("movq (`s0), `d0", vec![d], vec![a]));
                }
            },
            other => {
                let a = self.munch_exp(other)?;
                self.push(Instr::oper("movq (`s0), `d0", vec![d], vec![a]));
            }
        }
        Ok(())
    }

    fn munch_move_mem(&mut self, addr: Exp, src: Exp) -> Result<()> {
        let s = self.munch_exp(src)?;
        match addr {
            Exp::Binop(BinOp::Plus, base, off) => match (*base, *off) {
                (Exp::Temp(t), Exp::Const(c)) if t == x64::FP => {
                    self.push(Instr::oper(
                        format!("movq `s0, {}(`s1)", disp(&self.fs, c)),
                        vec![],
                        vec![s, x64::RSP],
                    ));
                }
                (base, Exp::Const(c)) => {
                    let b = self.munch_exp(base)?;
                    self.push(Instr::oper(
                        format!("movq `s0, {}(`s1)", c),
                        vec![],
                        vec![s, b],
                    ));
                }
                (Exp::Const(c), base) => {
                    let b = self.munch_exp(base)?;
                    self.push(Instr::oper(
                        format!("movq `s0, {}(`s1)", c),
                        vec![],
                        vec![s, b],
                    ));
                }
                (base, off) => {
                    let a = self.munch_exp(Exp::binop(BinOp::Plus, base, off))?;
                    self.push(Instr::oper("movq `s0, (`s1)", vec![], vec![s, a]));
                }
            },
            other => {
                let a = self.munch_exp(other)?;
                self.push(Instr::oper("movq `s0, (`s1)", vec![], vec![s, a]));
            }
        }
        Ok(())
    }

    fn munch_exp(&mut self, exp: Exp) -> Result<Temp> {
        match exp {
            Exp::Const(n) => {
                let d = self.temps.fresh();
                self.push(Instr::oper(format!("movq ${}, `d0", n), vec![d], vec![]));
                Ok(d)
            }
            Exp::Name(label) => {
                let d = self.temps.fresh();
                self.push(Instr::oper(
                    format!("leaq {}(%rip), `d0", label),
                    vec![d],
                    vec![],
                ));
                Ok(d)
            }
            Exp::Temp(t) if t == x64::FP => {
                let d = self.temps.fresh();
                self.push(Instr::oper(
                    format!("leaq {}(`s0), `d0", self.fs),
                    vec![d],
                    vec![x64::RSP],
                ));
                Ok(d)
            }
            Exp::Temp(t) => Ok(t),
            Exp::Mem(addr) => {
                let d = self.temps.fresh();
                self.munch_load(d, *addr)?;
                Ok(d)
            }
            Exp::Binop(op, l, r) => self.munch_binop(op, *l, *r),
            Exp::Call {
                func,
                args,
                static_link,
            } => {
                self.munch_call(*func, args, static_link)?;
                let d = self.temps.fresh();
                self.push(Instr::mov(d, x64::RAX));
                Ok(d)
            }
            Exp::Eseq(s, e) => {
                self.munch_stm(*s)?;
                self.munch_exp(*e)
            }
        }
    }

    fn munch_binop(&mut self, op: BinOp, l: Exp, r: Exp) -> Result<Temp> {
        let mnemonic = match op {
            BinOp::Plus => "addq",
            BinOp::Minus => "subq",
            BinOp::And => "andq",
            BinOp::Or => "orq",
            BinOp::Mul | BinOp::Div => return self.munch_mul_div(op, l, r),
        };
        // Constant right operands fold into an immediate form; addition
        // also commutes a constant left operand.
        let (l, r) = match (l, r) {
            (Exp::Const(c), r) if op == BinOp::Plus => (r, Exp::Const(c)),
            (l, r) => (l, r),
        };
        let d = self.temps.fresh();
        if let Exp::Const(c) = &r {
            let c = *c;
            let lt = self.munch_exp(l)?;
            self.push(Instr::mov(d, lt));
            self.push(Instr::oper(
                format!("{} ${}, `d0", mnemonic, c),
                vec![d],
                vec![d],
            ));
            return Ok(d);
        }
        let lt = self.munch_exp(l)?;
        let rt = self.munch_exp(r)?;
        self.push(Instr::mov(d, lt));
        self.push(Instr::oper(
            format!("{} `s0, `d0", mnemonic),
            vec![d],
            vec![rt, d],
        ));
        Ok(d)
    }

    /// Multiplication and division go through the fixed `%rax`/`%rdx`
    /// pair the hardware requires.
    fn munch_mul_div(&mut self, op: BinOp, l: Exp, r: Exp) -> Result<Temp> {
        let lt = self.munch_exp(l)?;
        let rt = self.munch_exp(r)?;
        self.push(Instr::mov(x64::RAX, lt));
        match op {
            BinOp::Mul => {
                self.push(Instr::oper(
                    "imulq `s0",
                    vec![x64::RAX, x64::RDX],
                    vec![rt, x64::RAX],
                ));
            }
            BinOp::Div => {
                self.push(Instr::oper("cqto", vec![x64::RDX], vec![x64::RAX]));
                self.push(Instr::oper(
                    "idivq `s0",
                    vec![x64::RAX, x64::RDX],
                    vec![rt, x64::RAX, x64::RDX],
                ));
            }
            _ => unreachable!(),
        }
        let d = self.temps.fresh();
        self.push(Instr::mov(d, x64::RAX));
        Ok(d)
    }

    /// Lowers a call: the first six arguments travel in registers, later
    /// ones in the incoming-argument area of the callee, and the static
    /// link is written at the caller's `%rsp` immediately before `callq`
    /// so the callee reads it one word above its frame pointer. The
    /// instruction defines every caller-save register.
    fn munch_call(
        &mut self,
        func: Exp,
        args: Vec<Exp>,
        static_link: Option<Box<Exp>>,
    ) -> Result<()> {
        let label = match func {
            Exp::Name(label) => label,
            _ => return Err(Error::ComputedCall),
        };
        let link_temp = match static_link {
            Some(link) => Some(self.munch_exp(*link)?),
            None => None,
        };
        let mut arg_temps = Vec::with_capacity(args.len());
        for arg in args {
            arg_temps.push(self.munch_exp(arg)?);
        }

        let mut used = Vec::new();
        for (i, &t) in arg_temps.iter().take(x64::ARG_REGS.len()).enumerate() {
            self.push(Instr::mov(x64::ARG_REGS[i], t));
            used.push(x64::ARG_REGS[i]);
        }

        let overflow: Vec<Temp> = arg_temps
            .iter()
            .skip(x64::ARG_REGS.len())
            .copied()
            .collect();
        let mut stack_words = 0i64;
        let push_word = |m: &mut Self, t: Temp| {
            m.push(Instr::oper("subq $8, %rsp", vec![], vec![]));
            m.push(Instr::oper("movq `s0, (%rsp)", vec![], vec![t]));
        };
        if link_temp.is_some() {
            // Leftmost overflow argument lands farthest from the link.
            for &t in &overflow {
                push_word(self, t);
                stack_words += 1;
            }
        } else {
            // Plain System V: push right to left.
            for &t in overflow.iter().rev() {
                push_word(self, t);
                stack_words += 1;
            }
        }
        if let Some(link) = link_temp {
            push_word(self, link);
            stack_words += 1;
        }

        self.push(Instr::Oper {
            assem: format!("callq {}", label),
            dst: x64::CALLER_SAVES.to_vec(),
            src: used,
            jumps: None,
        });
        if stack_words > 0 {
            self.push(Instr::oper(
                format!("addq ${}, %rsp", stack_words * 8),
                vec![],
                vec![],
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::external_call;
    use crate::temp::Label;
    use rustc_hash::FxHashSet;

    fn test_frame(temps: &mut TempFactory) -> Frame {
        Frame::new(Label::named("f"), &[], temps)
    }

    /// Every temporary read by an instruction is precolored or was
    /// defined earlier in straight-line order.
    fn assert_defs_before_uses(instrs: &[Instr]) {
        let mut defined: FxHashSet<Temp> = x64::REGISTERS.iter().copied().collect();
        defined.insert(x64::RSP);
        for instr in instrs {
            for u in instr.uses() {
                assert!(defined.contains(&u), "use of undefined temp {} in {:?}", u, instr);
            }
            defined.extend(instr.defs());
        }
    }

    #[test]
    fn constants_load_as_immediates() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let t = temps.fresh();
        let instrs = select(
            &frame,
            vec![Stm::mov(Exp::Temp(t), Exp::Const(42))],
            &mut temps,
        )
        .unwrap();
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].format(&|t| t.to_string()), format!("movq $42, {}", t));
    }

    #[test]
    fn frame_pointer_rewrites_to_rsp_plus_framesize() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let t = temps.fresh();
        let instrs = select(
            &frame,
            vec![Stm::mov(
                Exp::Temp(t),
                Exp::mem_offset(Exp::Temp(x64::FP), -8),
            )],
            &mut temps,
        )
        .unwrap();
        let text = instrs[0]
            .format(&|t| x64::name(t).map(str::to_string).unwrap_or(t.to_string()));
        assert_eq!(text, format!("movq f_framesize-8(%rsp), {}", t));
        assert_defs_before_uses(&instrs);
    }

    #[test]
    fn conditional_jumps_compare_then_branch() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let t = Label::named("T");
        let f = Label::named("F");
        let instrs = select(
            &frame,
            vec![Stm::cjump(RelOp::Le, Exp::Const(1), Exp::Const(2), t.clone(), f)],
            &mut temps,
        )
        .unwrap();
        let texts: Vec<String> = instrs
            .iter()
            .map(|i| i.format(&|t| t.to_string()))
            .collect();
        assert!(texts.iter().any(|s| s.starts_with("cmpq")));
        assert_eq!(texts.last().unwrap(), "jle T");
        assert_eq!(instrs.last().unwrap().jump_targets().unwrap().len(), 2);
        assert_defs_before_uses(&instrs);
    }

    #[test]
    fn division_routes_through_rax_and_rdx() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let d = temps.fresh();
        let instrs = select(
            &frame,
            vec![Stm::mov(
                Exp::Temp(d),
                Exp::binop(BinOp::Div, Exp::Const(10), Exp::Const(3)),
            )],
            &mut temps,
        )
        .unwrap();
        let texts: Vec<String> = instrs
            .iter()
            .map(|i| i.format(&|t| x64::name(t).map(str::to_string).unwrap_or(t.to_string())))
            .collect();
        assert!(texts.iter().any(|s| s == "cqto"));
        assert!(texts.iter().any(|s| s.starts_with("idivq")));
        assert_defs_before_uses(&instrs);
    }

    #[test]
    fn calls_fill_argument_registers_left_to_right() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let call = external_call("init_array", vec![Exp::Const(10), Exp::Const(0)]);
        let d = temps.fresh();
        let instrs = select(
            &frame,
            vec![Stm::mov(Exp::Temp(d), call)],
            &mut temps,
        )
        .unwrap();
        let rdi_move = instrs
            .iter()
            .position(|i| matches!(i, Instr::Move { dst, .. } if *dst == x64::RDI))
            .expect("first argument moves into %rdi");
        let rsi_move = instrs
            .iter()
            .position(|i| matches!(i, Instr::Move { dst, .. } if *dst == x64::RSI))
            .expect("second argument moves into %rsi");
        assert!(rdi_move < rsi_move);
        let call_at = instrs
            .iter()
            .position(|i| matches!(i, Instr::Oper { assem, .. } if assem.starts_with("callq")))
            .unwrap();
        assert!(rsi_move < call_at);
        // The call kills every caller-save register.
        let defs = instrs[call_at].defs();
        for reg in x64::CALLER_SAVES {
            assert!(defs.contains(&reg));
        }
        // The result is read from %rax.
        assert!(matches!(
            &instrs[call_at + 1],
            Instr::Move { src, .. } if *src == x64::RAX
        ));
        assert_defs_before_uses(&instrs);
    }

    #[test]
    fn static_link_is_pushed_below_the_return_address() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let call = Exp::Call {
            func: Box::new(Exp::Name(Label::named("g_0"))),
            args: vec![Exp::Const(7)],
            static_link: Some(Box::new(Exp::Temp(x64::FP))),
        };
        let instrs = select(&frame, vec![Stm::discard(call)], &mut temps).unwrap();
        let texts: Vec<String> = instrs
            .iter()
            .map(|i| i.format(&|t| t.to_string()))
            .collect();
        let push_link = texts
            .iter()
            .rposition(|s| s.starts_with("movq") && s.ends_with("(%rsp)"))
            .expect("link stored at the stack top");
        let call_at = texts.iter().position(|s| s == "callq g_0").unwrap();
        assert_eq!(push_link + 1, call_at);
        // One word is popped after the call returns.
        assert_eq!(texts[call_at + 1], "addq $8, %rsp");
        assert_defs_before_uses(&instrs);
    }

    #[test]
    fn bad_move_destinations_are_invariant_violations() {
        let mut temps = TempFactory::new();
        let frame = test_frame(&mut temps);
        let result = select(
            &frame,
            vec![Stm::mov(Exp::Const(1), Exp::Const(2))],
            &mut temps,
        );
        assert!(matches!(result, Err(Error::MoveDestination)));
    }
}
