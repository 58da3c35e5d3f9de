//! Activation records and the x86-64 System V ABI description.
//!
//! The frame pointer is abstract: `x64::FP` never reaches the emitted
//! text. Instruction selection rewrites it to `%rsp` plus the procedure's
//! `_framesize` assembler symbol, which is only fixed once spilling has
//! stopped growing the frame.

use crate::assem::Instr;
use crate::ir::{self, Exp, Stm};
use crate::temp::{Label, Temp, TempFactory};

pub const WORD_SIZE: i64 = 8;

/// Register assignments over the reserved temporary ids.
pub mod x64 {
    use crate::temp::Temp;

    /// Number of colorable machine registers.
    pub const K: usize = 15;

    pub const RAX: Temp = Temp::with_index(0);
    pub const RDI: Temp = Temp::with_index(1);
    pub const RSI: Temp = Temp::with_index(2);
    pub const RDX: Temp = Temp::with_index(3);
    pub const RCX: Temp = Temp::with_index(4);
    pub const R8: Temp = Temp::with_index(5);
    pub const R9: Temp = Temp::with_index(6);
    pub const R10: Temp = Temp::with_index(7);
    pub const R11: Temp = Temp::with_index(8);
    pub const RBX: Temp = Temp::with_index(9);
    pub const RBP: Temp = Temp::with_index(10);
    pub const R12: Temp = Temp::with_index(11);
    pub const R13: Temp = Temp::with_index(12);
    pub const R14: Temp = Temp::with_index(13);
    pub const R15: Temp = Temp::with_index(14);
    pub const RSP: Temp = Temp::with_index(15);
    /// The abstract frame pointer.
    pub const FP: Temp = Temp::with_index(16);

    /// All colorable registers, in calling-convention order.
    pub const REGISTERS: [Temp; K] = [
        RAX, RDI, RSI, RDX, RCX, R8, R9, R10, R11, RBX, RBP, R12, R13, R14, R15,
    ];

    pub const ARG_REGS: [Temp; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    pub const CALLER_SAVES: [Temp; 9] = [RAX, RDI, RSI, RDX, RCX, R8, R9, R10, R11];

    pub const CALLEE_SAVES: [Temp; 6] = [RBX, RBP, R12, R13, R14, R15];

    pub const RETURN_VALUE: Temp = RAX;

    /// The assembler spelling of a machine register, `None` for every
    /// other temporary.
    pub fn name(t: Temp) -> Option<&'static str> {
        const NAMES: [&str; 16] = [
            "%rax", "%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9", "%r10", "%r11", "%rbx", "%rbp",
            "%r12", "%r13", "%r14", "%r15", "%rsp",
        ];
        NAMES.get(t.index() as usize).copied()
    }
}

/// Where a variable lives: a frame slot at a fixed frame-pointer offset,
/// or a register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    InFrame(i64),
    InReg(Temp),
}

impl Access {
    /// The IR expression reading this access given an expression for the
    /// owning frame's frame pointer.
    pub fn exp(&self, fp: Exp) -> Exp {
        match self {
            Access::InFrame(offset) => Exp::mem_offset(fp, *offset),
            Access::InReg(t) => Exp::Temp(*t),
        }
    }
}

/// One procedure's activation record.
#[derive(Debug)]
pub struct Frame {
    name: Label,
    formals: Vec<Access>,
    /// Next free local slot, growing downward from the frame pointer.
    offset: i64,
}

impl Frame {
    /// Lays out a frame for a procedure whose formals have the given
    /// escape flags. For nested procedures the first formal is the static
    /// link, which the caller stores in the dedicated incoming slot just
    /// above the return address.
    pub fn new(name: Label, formals: &[bool], temps: &mut TempFactory) -> Frame {
        let mut frame = Frame {
            name,
            formals: Vec::with_capacity(formals.len()),
            offset: 0,
        };
        for (i, &escape) in formals.iter().enumerate() {
            let access = if i == 0 {
                Access::InFrame(WORD_SIZE)
            } else {
                frame.alloc_local(escape, temps)
            };
            frame.formals.push(access);
        }
        frame
    }

    pub fn name(&self) -> &Label {
        &self.name
    }

    pub fn formals(&self) -> &[Access] {
        &self.formals
    }

    /// Current frame size in bytes; final only after spilling.
    pub fn size(&self) -> i64 {
        -self.offset
    }

    pub fn framesize_symbol(&self) -> String {
        format!("{}_framesize", self.name)
    }

    pub fn alloc_local(&mut self, escape: bool, temps: &mut TempFactory) -> Access {
        if escape {
            self.offset -= WORD_SIZE;
            Access::InFrame(self.offset)
        } else {
            Access::InReg(temps.fresh())
        }
    }

    /// Reserves one word for a spilled temporary and returns its offset.
    pub fn alloc_spill(&mut self) -> i64 {
        self.offset -= WORD_SIZE;
        self.offset
    }

    /// The view shift. Copies each callee-save register into a fresh
    /// temporary at entry and restores it at exit, then moves every
    /// incoming argument (register or stack slot) into the formal's chosen
    /// access. `body` must already end by moving the result into the
    /// return-value register.
    pub fn proc_entry_exit1(&self, body: Stm, temps: &mut TempFactory) -> Stm {
        let mut entry: Vec<Stm> = Vec::new();
        let mut exit: Vec<Stm> = Vec::new();
        for &reg in &x64::CALLEE_SAVES {
            let saved = temps.fresh();
            entry.push(Stm::mov(Exp::Temp(saved), Exp::Temp(reg)));
            exit.push(Stm::mov(Exp::Temp(reg), Exp::Temp(saved)));
        }

        let real_formals = self.formals.len().saturating_sub(1);
        for (i, access) in self.formals.iter().skip(1).enumerate() {
            let src = if i < x64::ARG_REGS.len() {
                Exp::Temp(x64::ARG_REGS[i])
            } else {
                let slot = (real_formals as i64 - (i as i64 + 1) + 2) * WORD_SIZE;
                Exp::mem_offset(Exp::Temp(x64::FP), slot)
            };
            entry.push(Stm::mov(access.exp(Exp::Temp(x64::FP)), src));
        }

        let mut stms = entry;
        stms.push(body);
        stms.extend(exit);
        ir::seq(stms)
    }

    /// Appends the return sink: an empty instruction using the
    /// callee-saves plus `%rax` and `%rsp`, so the allocator keeps them
    /// live to the end of the procedure.
    pub fn proc_entry_exit2(&self, instrs: &mut Vec<Instr>) {
        let mut sink: Vec<Temp> = x64::CALLEE_SAVES.to_vec();
        sink.push(x64::RETURN_VALUE);
        sink.push(x64::RSP);
        instrs.push(Instr::Oper {
            assem: String::new(),
            dst: vec![],
            src: sink,
            jumps: None,
        });
    }

    /// Prolog text: framesize symbol, entry label, stack adjustment.
    pub fn prolog(&self) -> String {
        let sym = self.framesize_symbol();
        format!(
            ".set {}, {}\n{}:\n\tsubq ${}, %rsp\n",
            sym,
            self.size(),
            self.name,
            sym
        )
    }

    pub fn epilog(&self) -> String {
        format!("\taddq ${}, %rsp\n\tretq\n", self.framesize_symbol())
    }
}

/// A unit of back-end output.
#[derive(Debug)]
pub enum Fragment {
    Proc { body: Stm, frame: Frame },
    Str { label: Label, text: String },
}

/// A call into the runtime library: plain platform ABI, no static link.
pub fn external_call(name: &str, args: Vec<Exp>) -> Exp {
    Exp::Call {
        func: Box::new(Exp::Name(Label::named(name))),
        args,
        static_link: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BinOp;

    #[test]
    fn locals_grow_downward_and_registers_are_fresh() {
        let mut temps = TempFactory::new();
        let mut frame = Frame::new(Label::named("f"), &[], &mut temps);
        assert_eq!(frame.alloc_local(true, &mut temps), Access::InFrame(-8));
        assert_eq!(frame.alloc_local(true, &mut temps), Access::InFrame(-16));
        assert!(matches!(frame.alloc_local(false, &mut temps), Access::InReg(_)));
        assert_eq!(frame.size(), 16);
    }

    #[test]
    fn first_formal_is_the_incoming_link_slot() {
        let mut temps = TempFactory::new();
        let frame = Frame::new(Label::named("g"), &[true, true, false], &mut temps);
        assert_eq!(frame.formals()[0], Access::InFrame(WORD_SIZE));
        assert_eq!(frame.formals()[1], Access::InFrame(-8));
        assert!(matches!(frame.formals()[2], Access::InReg(_)));
    }

    #[test]
    fn in_frame_access_reads_through_the_frame_pointer() {
        let access = Access::InFrame(-24);
        match access.exp(Exp::Temp(x64::FP)) {
            Exp::Mem(addr) => match *addr {
                Exp::Binop(BinOp::Plus, base, offset) => {
                    assert_eq!(*base, Exp::Temp(x64::FP));
                    assert_eq!(*offset, Exp::Const(-24));
                }
                other => panic!("unexpected address {:?}", other),
            },
            other => panic!("expected Mem, got {:?}", other),
        }
    }

    #[test]
    fn spill_slots_extend_the_frame() {
        let mut temps = TempFactory::new();
        let mut frame = Frame::new(Label::named("h"), &[], &mut temps);
        assert_eq!(frame.alloc_spill(), -8);
        assert_eq!(frame.alloc_spill(), -16);
        assert_eq!(frame.size(), 16);
    }

    #[test]
    fn return_sink_keeps_callee_saves_live() {
        let mut temps = TempFactory::new();
        let frame = Frame::new(Label::named("f"), &[], &mut temps);
        let mut instrs = Vec::new();
        frame.proc_entry_exit2(&mut instrs);
        let sink = instrs.last().unwrap();
        let uses = sink.uses();
        for reg in x64::CALLEE_SAVES {
            assert!(uses.contains(&reg));
        }
        assert!(uses.contains(&x64::RAX));
        assert!(uses.contains(&x64::RSP));
        assert!(sink.defs().is_empty());
    }
}
