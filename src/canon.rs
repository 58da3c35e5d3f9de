//! Canonicalization: rewrites a procedure body so that no `Eseq` remains,
//! every `Call` sits directly under a `Move` to a temporary or an `Exp`
//! statement, and every `CJump` is immediately followed by its false
//! label. The result is the statement list the instruction selector
//! consumes.

use rustc_hash::FxHashMap;

use crate::ir::{Exp, Stm};
use crate::temp::Label;
use crate::Context;

pub fn canonicalize(stm: Stm, ctx: &mut Context) -> Vec<Stm> {
    let linear = linearize(stm, ctx);
    let (blocks, done) = basic_blocks(linear, ctx);
    trace_schedule(blocks, done, ctx)
}

/// Hoists every `Eseq` and isolates nested calls, then flattens the
/// remaining `Seq` spine.
fn linearize(stm: Stm, ctx: &mut Context) -> Vec<Stm> {
    let stm = do_stm(stm, ctx);
    let mut out = Vec::new();
    flatten(stm, &mut out);
    out
}

fn flatten(stm: Stm, out: &mut Vec<Stm>) {
    match stm {
        Stm::Seq(a, b) => {
            flatten(*a, out);
            flatten(*b, out);
        }
        s if s.is_nop() => {}
        s => out.push(s),
    }
}

fn seq2(a: Stm, b: Stm) -> Stm {
    if a.is_nop() {
        b
    } else if b.is_nop() {
        a
    } else {
        Stm::Seq(Box::new(a), Box::new(b))
    }
}

/// Whether evaluating `exp` can be postponed past `stm`.
fn commute(stm: &Stm, exp: &Exp) -> bool {
    stm.is_nop() || matches!(exp, Exp::Const(_) | Exp::Name(_))
}

fn do_stm(stm: Stm, ctx: &mut Context) -> Stm {
    match stm {
        Stm::Seq(a, b) => seq2(do_stm(*a, ctx), do_stm(*b, ctx)),
        Stm::Label(_) => stm,
        Stm::Jump(e, targets) => {
            let (s, e) = do_exp(*e, ctx);
            seq2(s, Stm::Jump(Box::new(e), targets))
        }
        Stm::CJump(op, l, r, t, f) => {
            let (s, mut exps) = reorder(vec![*l, *r], ctx);
            let right = exps.pop().expect("two operands");
            let left = exps.pop().expect("two operands");
            seq2(s, Stm::cjump(op, left, right, t, f))
        }
        Stm::Move(dst, src) => do_move(*dst, *src, ctx),
        Stm::Exp(e) => match *e {
            Exp::Call {
                func,
                args,
                static_link,
            } => {
                let (s, func, args, link) = reorder_call(*func, args, static_link, ctx);
                seq2(
                    s,
                    Stm::discard(Exp::Call {
                        func: Box::new(func),
                        args,
                        static_link: link.map(Box::new),
                    }),
                )
            }
            other => {
                let (s, e) = do_exp(other, ctx);
                seq2(s, Stm::discard(e))
            }
        },
    }
}

fn do_move(dst: Exp, src: Exp, ctx: &mut Context) -> Stm {
    match (dst, src) {
        (
            Exp::Temp(t),
            Exp::Call {
                func,
                args,
                static_link,
            },
        ) => {
            // A call already in move position keeps its result register.
            let (s, func, args, link) = reorder_call(*func, args, static_link, ctx);
            seq2(
                s,
                Stm::mov(
                    Exp::Temp(t),
                    Exp::Call {
                        func: Box::new(func),
                        args,
                        static_link: link.map(Box::new),
                    },
                ),
            )
        }
        (Exp::Temp(t), src) => {
            let (s, src) = do_exp(src, ctx);
            seq2(s, Stm::mov(Exp::Temp(t), src))
        }
        (Exp::Mem(addr), src) => {
            let (s, mut exps) = reorder(vec![*addr, src], ctx);
            let src = exps.pop().expect("two operands");
            let addr = exps.pop().expect("two operands");
            seq2(s, Stm::mov(Exp::mem(addr), src))
        }
        (Exp::Eseq(s, e), src) => do_stm(
            Stm::Seq(s, Box::new(Stm::Move(e, Box::new(src)))),
            ctx,
        ),
        // Anything else is an invalid destination; the selector reports it.
        (dst, src) => Stm::mov(dst, src),
    }
}

fn do_exp(exp: Exp, ctx: &mut Context) -> (Stm, Exp) {
    match exp {
        Exp::Binop(op, l, r) => {
            let (s, mut exps) = reorder(vec![*l, *r], ctx);
            let right = exps.pop().expect("two operands");
            let left = exps.pop().expect("two operands");
            (s, Exp::binop(op, left, right))
        }
        Exp::Mem(addr) => {
            let (s, mut exps) = reorder(vec![*addr], ctx);
            (s, Exp::mem(exps.pop().expect("one operand")))
        }
        Exp::Eseq(s, e) => {
            let s1 = do_stm(*s, ctx);
            let (s2, e) = do_exp(*e, ctx);
            (seq2(s1, s2), e)
        }
        Exp::Call {
            func,
            args,
            static_link,
        } => {
            // Isolate the call so a sibling call cannot clobber its
            // result register.
            let (s, func, args, link) = reorder_call(*func, args, static_link, ctx);
            let t = ctx.temps.fresh();
            let call = Exp::Call {
                func: Box::new(func),
                args,
                static_link: link.map(Box::new),
            };
            (seq2(s, Stm::mov(Exp::Temp(t), call)), Exp::Temp(t))
        }
        atom => (Stm::nop(), atom),
    }
}

fn reorder_call(
    func: Exp,
    args: Vec<Exp>,
    static_link: Option<Box<Exp>>,
    ctx: &mut Context,
) -> (Stm, Exp, Vec<Exp>, Option<Exp>) {
    let has_link = static_link.is_some();
    let mut kids = vec![func];
    if let Some(link) = static_link {
        kids.push(*link);
    }
    kids.extend(args);
    let (s, mut exps) = reorder(kids, ctx);
    let func = exps.remove(0);
    let link = if has_link { Some(exps.remove(0)) } else { None };
    (s, func, exps, link)
}

/// Pulls the side effects of a child list out in front, preserving
/// left-to-right evaluation order. A child whose value could be changed
/// by a later sibling's effects is parked in a fresh temporary.
fn reorder(exps: Vec<Exp>, ctx: &mut Context) -> (Stm, Vec<Exp>) {
    let mut rest_stm = Stm::nop();
    let mut out = Vec::with_capacity(exps.len());
    for e in exps.into_iter().rev() {
        let (s, e1) = do_exp(e, ctx);
        if commute(&rest_stm, &e1) {
            rest_stm = seq2(s, rest_stm);
            out.push(e1);
        } else {
            let t = ctx.temps.fresh();
            rest_stm = seq2(s, seq2(Stm::mov(Exp::Temp(t), e1), rest_stm));
            out.push(Exp::Temp(t));
        }
    }
    out.reverse();
    (rest_stm, out)
}

/// Splits a linear statement list into basic blocks, each beginning with
/// a label and ending with a jump. The returned label is the virtual exit
/// every falling-off block jumps to.
fn basic_blocks(stms: Vec<Stm>, ctx: &mut Context) -> (Vec<Vec<Stm>>, Label) {
    let done = ctx.labels.fresh();
    let mut blocks: Vec<Vec<Stm>> = Vec::new();
    let mut cur: Vec<Stm> = Vec::new();
    for stm in stms {
        match stm {
            Stm::Label(ref label) => {
                if cur.is_empty() {
                    cur.push(stm);
                } else {
                    cur.push(Stm::jump(label.clone()));
                    blocks.push(std::mem::take(&mut cur));
                    cur.push(stm);
                }
            }
            s @ (Stm::Jump(..) | Stm::CJump(..)) => {
                if cur.is_empty() {
                    cur.push(Stm::Label(ctx.labels.fresh()));
                }
                cur.push(s);
                blocks.push(std::mem::take(&mut cur));
            }
            s => {
                if cur.is_empty() {
                    cur.push(Stm::Label(ctx.labels.fresh()));
                }
                cur.push(s);
            }
        }
    }
    if !cur.is_empty() {
        cur.push(Stm::jump(done.clone()));
        blocks.push(cur);
    }
    (blocks, done)
}

/// Orders blocks into traces so conditional jumps fall through to their
/// false labels, negating or bridging where the layout cannot oblige.
fn trace_schedule(mut blocks: Vec<Vec<Stm>>, done: Label, ctx: &mut Context) -> Vec<Stm> {
    let mut table: FxHashMap<Label, usize> = FxHashMap::default();
    for (i, block) in blocks.iter().enumerate() {
        match &block[0] {
            Stm::Label(l) => {
                table.insert(l.clone(), i);
            }
            _ => unreachable!("block without an entry label"),
        }
    }

    let mut scheduled = vec![false; blocks.len()];
    let mut out = Vec::new();
    for start in 0..blocks.len() {
        let mut cur = start;
        while !scheduled[cur] {
            scheduled[cur] = true;
            let mut block = std::mem::take(&mut blocks[cur]);
            let last = block.pop().expect("block has a terminator");
            match last {
                Stm::Jump(e, targets) => {
                    let next = if targets.len() == 1 {
                        table
                            .get(&targets[0])
                            .copied()
                            .filter(|&i| !scheduled[i])
                    } else {
                        None
                    };
                    match next {
                        Some(next) => {
                            // The target follows directly; drop the jump.
                            out.extend(block);
                            cur = next;
                        }
                        None => {
                            block.push(Stm::Jump(e, targets));
                            out.extend(block);
                            break;
                        }
                    }
                }
                Stm::CJump(op, l, r, t, f) => {
                    let f_next = table.get(&f).copied().filter(|&i| !scheduled[i]);
                    let t_next = table.get(&t).copied().filter(|&i| !scheduled[i]);
                    if let Some(next) = f_next {
                        block.push(Stm::CJump(op, l, r, t, f));
                        out.extend(block);
                        cur = next;
                    } else if let Some(next) = t_next {
                        block.push(Stm::CJump(op.negate(), l, r, f, t));
                        out.extend(block);
                        cur = next;
                    } else {
                        let bridge = ctx.labels.fresh();
                        block.push(Stm::CJump(op, l, r, t, bridge.clone()));
                        block.push(Stm::Label(bridge));
                        block.push(Stm::jump(f));
                        out.extend(block);
                        break;
                    }
                }
                other => {
                    block.push(other);
                    out.extend(block);
                    break;
                }
            }
        }
    }
    out.push(Stm::Label(done));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::external_call;
    use crate::ir::{self, BinOp, RelOp};

    fn assert_canonical(stms: &[Stm]) {
        fn check_exp(exp: &Exp) {
            match exp {
                Exp::Eseq(..) => panic!("Eseq survived canonicalization"),
                Exp::Call { .. } => panic!("call in expression position"),
                Exp::Binop(_, l, r) => {
                    check_exp(l);
                    check_exp(r);
                }
                Exp::Mem(e) => check_exp(e),
                _ => {}
            }
        }
        fn check_call_kids(exp: &Exp) {
            if let Exp::Call {
                func,
                args,
                static_link,
            } = exp
            {
                check_exp(func);
                for a in args {
                    check_exp(a);
                }
                if let Some(link) = static_link {
                    check_exp(link);
                }
            } else {
                check_exp(exp);
            }
        }
        for stm in stms {
            match stm {
                Stm::Seq(..) => panic!("Seq survived linearization"),
                Stm::Label(_) => {}
                Stm::Jump(e, _) => check_exp(e),
                Stm::CJump(_, l, r, _, _) => {
                    check_exp(l);
                    check_exp(r);
                }
                Stm::Move(dst, src) => {
                    check_exp(dst);
                    check_call_kids(src);
                }
                Stm::Exp(e) => check_call_kids(e),
            }
        }
    }

    fn assert_false_labels_follow(stms: &[Stm]) {
        for (i, stm) in stms.iter().enumerate() {
            if let Stm::CJump(_, _, _, _, f) = stm {
                match stms.get(i + 1) {
                    Some(Stm::Label(l)) => assert_eq!(l, f, "false label must fall through"),
                    other => panic!("conditional jump not followed by a label: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn hoists_eseq_out_of_binops() {
        let mut ctx = Context::new();
        let t = ctx.temps.fresh();
        let exp = Exp::binop(
            BinOp::Plus,
            Exp::eseq(Stm::mov(Exp::Temp(t), Exp::Const(1)), Exp::Temp(t)),
            Exp::Const(2),
        );
        let stms = canonicalize(Stm::discard(exp), &mut ctx);
        assert_canonical(&stms);
        assert_false_labels_follow(&stms);
    }

    #[test]
    fn isolates_nested_calls() {
        let mut ctx = Context::new();
        let inner = external_call("getchar", vec![]);
        let outer = external_call("ord", vec![inner]);
        let stms = canonicalize(Stm::discard(outer), &mut ctx);
        assert_canonical(&stms);
        // The inner call lands in its own move statement.
        let call_moves = stms
            .iter()
            .filter(|s| {
                matches!(s, Stm::Move(_, src) if matches!(&**src, Exp::Call { .. }))
            })
            .count();
        assert!(call_moves >= 1);
    }

    #[test]
    fn schedules_false_branches_to_fall_through() {
        let mut ctx = Context::new();
        let t = ctx.labels.fresh();
        let f = ctx.labels.fresh();
        let join = ctx.labels.fresh();
        let r = ctx.temps.fresh();
        // A diamond in source order: true block first, as the translator
        // lays out if-expressions.
        let stm = ir::seq(vec![
            Stm::cjump(RelOp::Lt, Exp::Const(1), Exp::Const(2), t.clone(), f.clone()),
            Stm::Label(t),
            Stm::mov(Exp::Temp(r), Exp::Const(1)),
            Stm::jump(join.clone()),
            Stm::Label(f),
            Stm::mov(Exp::Temp(r), Exp::Const(0)),
            Stm::Label(join),
        ]);
        let stms = canonicalize(stm, &mut ctx);
        assert_canonical(&stms);
        assert_false_labels_follow(&stms);
    }

    #[test]
    fn preserves_evaluation_order_around_calls() {
        let mut ctx = Context::new();
        let t = ctx.temps.fresh();
        // t + getchar(): the left operand must be read before the call
        // can clobber anything.
        let exp = Exp::binop(
            BinOp::Plus,
            Exp::Temp(t),
            external_call("getchar", vec![]),
        );
        let stms = canonicalize(Stm::discard(exp), &mut ctx);
        assert_canonical(&stms);
        let call_index = stms
            .iter()
            .position(|s| matches!(s, Stm::Move(_, src) if matches!(&**src, Exp::Call { .. })))
            .expect("isolated call");
        let park_index = stms
            .iter()
            .position(|s| matches!(s, Stm::Move(dst, src)
                if matches!(&**dst, Exp::Temp(_)) && **src == Exp::Temp(t)))
            .expect("left operand parked in a temporary");
        assert!(park_index < call_index);
    }
}
