//! Abstract assembly: x86-64 instruction text over unbounded temporaries.
//! Operands are written as `` `s0 ``, `` `d0 ``, `` `j0 `` placeholders and
//! substituted once register allocation has produced a mapping.

use crate::temp::{Label, Temp};

#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Oper {
        assem: String,
        dst: Vec<Temp>,
        src: Vec<Temp>,
        jumps: Option<Vec<Label>>,
    },
    /// A register-to-register `movq`; the only kind eligible for
    /// coalescing.
    Move { assem: String, dst: Temp, src: Temp },
    Label { assem: String, label: Label },
}

impl Instr {
    pub fn oper(assem: impl Into<String>, dst: Vec<Temp>, src: Vec<Temp>) -> Instr {
        Instr::Oper {
            assem: assem.into(),
            dst,
            src,
            jumps: None,
        }
    }

    pub fn jump_to(assem: impl Into<String>, targets: Vec<Label>) -> Instr {
        Instr::Oper {
            assem: assem.into(),
            dst: vec![],
            src: vec![],
            jumps: Some(targets),
        }
    }

    pub fn mov(dst: Temp, src: Temp) -> Instr {
        Instr::Move {
            assem: "movq `s0, `d0".to_string(),
            dst,
            src,
        }
    }

    pub fn label(label: Label) -> Instr {
        Instr::Label {
            assem: format!("{}:", label),
            label,
        }
    }

    pub fn defs(&self) -> Vec<Temp> {
        match self {
            Instr::Oper { dst, .. } => dst.clone(),
            Instr::Move { dst, .. } => vec![*dst],
            Instr::Label { .. } => vec![],
        }
    }

    pub fn uses(&self) -> Vec<Temp> {
        match self {
            Instr::Oper { src, .. } => src.clone(),
            Instr::Move { src, .. } => vec![*src],
            Instr::Label { .. } => vec![],
        }
    }

    pub fn is_move(&self) -> bool {
        matches!(self, Instr::Move { .. })
    }

    pub fn jump_targets(&self) -> Option<&[Label]> {
        match self {
            Instr::Oper {
                jumps: Some(targets),
                ..
            } => Some(targets),
            _ => None,
        }
    }

    /// Substitutes `from` for `to` in this instruction's def and use sets.
    pub fn replace_temp(&mut self, from: Temp, to: Temp) {
        match self {
            Instr::Oper { dst, src, .. } => {
                for t in dst.iter_mut().chain(src.iter_mut()) {
                    if *t == from {
                        *t = to;
                    }
                }
            }
            Instr::Move { dst, src, .. } => {
                if *dst == from {
                    *dst = to;
                }
                if *src == from {
                    *src = to;
                }
            }
            Instr::Label { .. } => {}
        }
    }

    /// Renders the instruction with every placeholder replaced through
    /// `name_of`.
    pub fn format(&self, name_of: &dyn Fn(Temp) -> String) -> String {
        let (assem, dst, src, jumps): (&str, &[Temp], &[Temp], &[Label]) = match self {
            Instr::Oper {
                assem, dst, src, jumps,
            } => (assem, dst, src, jumps.as_deref().unwrap_or(&[])),
            Instr::Move { assem, dst, src } => {
                (assem, std::slice::from_ref(dst), std::slice::from_ref(src), &[])
            }
            Instr::Label { assem, .. } => (assem, &[], &[], &[]),
        };

        let mut out = String::with_capacity(assem.len());
        let mut chars = assem.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '`' {
                out.push(c);
                continue;
            }
            let kind = chars.next().expect("dangling placeholder in assem text");
            let index = chars
                .next()
                .and_then(|d| d.to_digit(10))
                .expect("placeholder without operand index") as usize;
            match kind {
                's' => out.push_str(&name_of(src[index])),
                'd' => out.push_str(&name_of(dst[index])),
                'j' => out.push_str(jumps[index].as_str()),
                other => panic!("unknown placeholder kind `{}", other),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn placeholders_substitute_in_order() {
        let mut temps = TempFactory::new();
        let a = temps.fresh();
        let b = temps.fresh();
        let instr = Instr::oper("addq `s0, `d0", vec![b], vec![a, b]);
        let text = instr.format(&|t| format!("%{}", t));
        assert_eq!(text, format!("addq %{}, %{}", a, b));
    }

    #[test]
    fn replace_temp_touches_defs_and_uses() {
        let mut temps = TempFactory::new();
        let a = temps.fresh();
        let b = temps.fresh();
        let mut instr = Instr::mov(a, a);
        instr.replace_temp(a, b);
        assert_eq!(instr.defs(), vec![b]);
        assert_eq!(instr.uses(), vec![b]);
    }

    #[test]
    fn jump_formatting_uses_label_names() {
        let l = Label::named("L3");
        let instr = Instr::jump_to("jmp `j0", vec![l]);
        assert_eq!(instr.format(&|t| t.to_string()), "jmp L3");
    }
}
