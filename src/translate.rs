//! Lowers the typed AST into tree IR, threading static links through
//! nested functions and accumulating one fragment per procedure plus one
//! per string literal.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::ast;
use crate::env::{self, Entry, Table};
use crate::error::{Error, Result};
use crate::frame::{external_call, x64, Access, Fragment, Frame, WORD_SIZE};
use crate::ir::{self, BinOp, Exp as IrExp, RelOp, Stm};
use crate::temp::Label;
use crate::types::{self, Ty, TyRef};
use crate::Context;

/// Handle into the translator's level arena.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LevelId(usize);

/// One static-nesting level: a frame plus the level it is declared in.
#[derive(Debug)]
struct Level {
    parent: Option<LevelId>,
    frame: Frame,
}

/// Where a variable lives, together with the level that owns it.
#[derive(Clone, Debug)]
pub struct VarAccess {
    pub level: LevelId,
    pub access: Access,
}

type CxGen = Box<dyn FnOnce(Label, Label) -> Stm>;

/// A translated expression: a value, a statement, or a branch whose true
/// and false destinations are supplied by the consumer.
enum TrExp {
    Ex(IrExp),
    Nx(Stm),
    Cx(CxGen),
}

impl fmt::Debug for TrExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrExp::Ex(e) => write!(f, "Ex({:?})", e),
            TrExp::Nx(s) => write!(f, "Nx({:?})", s),
            TrExp::Cx(_) => write!(f, "Cx(..)"),
        }
    }
}

impl TrExp {
    fn un_ex(self, ctx: &mut Context) -> IrExp {
        match self {
            TrExp::Ex(e) => e,
            TrExp::Nx(s) => IrExp::eseq(s, IrExp::Const(0)),
            TrExp::Cx(gen) => {
                let r = ctx.temps.fresh();
                let t = ctx.labels.fresh();
                let f = ctx.labels.fresh();
                IrExp::eseq(
                    ir::seq(vec![
                        Stm::mov(IrExp::Temp(r), IrExp::Const(1)),
                        gen(t.clone(), f.clone()),
                        Stm::Label(f),
                        Stm::mov(IrExp::Temp(r), IrExp::Const(0)),
                        Stm::Label(t),
                    ]),
                    IrExp::Temp(r),
                )
            }
        }
    }

    fn un_nx(self, ctx: &mut Context) -> Stm {
        match self {
            TrExp::Ex(e) => Stm::discard(e),
            TrExp::Nx(s) => s,
            TrExp::Cx(gen) => {
                let l = ctx.labels.fresh();
                Stm::Seq(Box::new(gen(l.clone(), l.clone())), Box::new(Stm::Label(l)))
            }
        }
    }

    fn un_cx(self) -> Result<CxGen> {
        match self {
            TrExp::Ex(IrExp::Const(0)) => Ok(Box::new(|_, f| Stm::jump(f))),
            TrExp::Ex(IrExp::Const(_)) => Ok(Box::new(|t, _| Stm::jump(t))),
            TrExp::Ex(e) => Ok(Box::new(move |t, f| {
                Stm::cjump(RelOp::Ne, e, IrExp::Const(0), t, f)
            })),
            TrExp::Cx(gen) => Ok(gen),
            TrExp::Nx(_) => Err(Error::CondFromStatement),
        }
    }
}

pub struct Translator {
    levels: Vec<Level>,
    /// Finished procedure bodies waiting to claim their frames.
    procs: Vec<(Stm, LevelId)>,
    venv: Table<Entry>,
    tenv: Table<TyRef>,
}

/// Translates the whole program into `ctx.frags`. The outermost body
/// becomes a fragment labeled `entry`.
pub fn translate_program(program: &ast::Exp, entry: &str, ctx: &mut Context) -> Result<()> {
    let mut tr = Translator {
        levels: Vec::new(),
        procs: Vec::new(),
        venv: env::base_venv(),
        tenv: env::base_tenv(),
    };
    let main = tr.new_level(None, Label::named(entry), &[], ctx);
    let (body, _ty) = tr.trans_exp(program, main, None, ctx)?;
    tr.finish_proc(main, body, ctx);

    let Translator { levels, procs, .. } = tr;
    let mut frames: Vec<Option<Frame>> = levels.into_iter().map(|l| Some(l.frame)).collect();
    for (body, level) in procs {
        let frame = frames[level.0].take().expect("one fragment per level");
        ctx.frags.push(Fragment::Proc { body, frame });
    }
    debug!(fragments = ctx.frags.len(), "translation finished");
    Ok(())
}

impl Translator {
    fn new_level(
        &mut self,
        parent: Option<LevelId>,
        name: Label,
        formal_escapes: &[bool],
        ctx: &mut Context,
    ) -> LevelId {
        let frame = Frame::new(name, formal_escapes, &mut ctx.temps);
        self.levels.push(Level { parent, frame });
        LevelId(self.levels.len() - 1)
    }

    /// The frame pointer of `target` as seen from code running in `from`,
    /// chasing one stored link per level in between.
    fn static_link(&self, target: LevelId, from: LevelId) -> IrExp {
        let mut exp = IrExp::Temp(x64::FP);
        let mut cur = from;
        while cur != target {
            exp = IrExp::mem_offset(exp, WORD_SIZE);
            cur = self.levels[cur.0]
                .parent
                .expect("static link chase escaped the outermost level");
        }
        exp
    }

    fn simple_var(&self, access: &VarAccess, level: LevelId) -> IrExp {
        let fp = self.static_link(access.level, level);
        access.access.exp(fp)
    }

    fn finish_proc(&mut self, level: LevelId, body: TrExp, ctx: &mut Context) {
        let result = body.un_ex(ctx);
        let stm = Stm::mov(IrExp::Temp(x64::RETURN_VALUE), result);
        let stm = self.levels[level.0].frame.proc_entry_exit1(stm, &mut ctx.temps);
        self.procs.push((stm, level));
    }

    fn trans_var(
        &mut self,
        var: &ast::Var,
        level: LevelId,
        done: Option<&Label>,
        ctx: &mut Context,
    ) -> Result<(TrExp, TyRef)> {
        match var {
            ast::Var::Simple(sym) => {
                let (access, ty) = match self.venv.look(sym) {
                    Some(Entry::Var { access, ty, .. }) => (access.clone(), ty.clone()),
                    _ => return Err(Error::UndefinedVariable(sym.clone())),
                };
                Ok((TrExp::Ex(self.simple_var(&access, level)), types::actual(&ty)))
            }
            ast::Var::Field(base, field) => {
                let (base_exp, base_ty) = self.trans_var(base, level, done, ctx)?;
                let base_ty = types::actual(&base_ty);
                let Ty::Record { fields, .. } = &*base_ty else {
                    return Err(Error::TypeMismatch("field access on a non-record"));
                };
                let (index, field_ty) = fields
                    .iter()
                    .enumerate()
                    .find(|(_, (name, _))| name == field)
                    .map(|(i, (_, ty))| (i, ty.clone()))
                    .ok_or_else(|| Error::UnknownField(field.clone()))?;
                let exp =
                    IrExp::mem_offset(base_exp.un_ex(ctx), index as i64 * WORD_SIZE);
                Ok((TrExp::Ex(exp), types::actual(&field_ty)))
            }
            ast::Var::Subscript(base, index) => {
                let (base_exp, base_ty) = self.trans_var(base, level, done, ctx)?;
                let base_ty = types::actual(&base_ty);
                let Ty::Array { elem, .. } = &*base_ty else {
                    return Err(Error::TypeMismatch("subscript on a non-array"));
                };
                let elem = elem.clone();
                let (index_exp, index_ty) = self.trans_exp(index, level, done, ctx)?;
                if !types::compatible(&index_ty, &types::int()) {
                    return Err(Error::TypeMismatch("array subscript"));
                }
                let addr = IrExp::binop(
                    BinOp::Plus,
                    base_exp.un_ex(ctx),
                    IrExp::binop(BinOp::Mul, index_exp.un_ex(ctx), IrExp::Const(WORD_SIZE)),
                );
                Ok((TrExp::Ex(IrExp::mem(addr)), types::actual(&elem)))
            }
        }
    }

    fn trans_exp(
        &mut self,
        exp: &ast::Exp,
        level: LevelId,
        done: Option<&Label>,
        ctx: &mut Context,
    ) -> Result<(TrExp, TyRef)> {
        match exp {
            ast::Exp::Var(var) => self.trans_var(var, level, done, ctx),
            ast::Exp::Nil => Ok((TrExp::Ex(IrExp::Const(0)), types::nil())),
            ast::Exp::Int(n) => Ok((TrExp::Ex(IrExp::Const(*n)), types::int())),
            ast::Exp::Str(s) => {
                let label = ctx.labels.fresh();
                ctx.frags.push(Fragment::Str {
                    label: label.clone(),
                    text: s.clone(),
                });
                Ok((TrExp::Ex(IrExp::Name(label)), types::string()))
            }
            ast::Exp::Call { func, args } => self.trans_call(func, args, level, done, ctx),
            ast::Exp::Op { op, left, right } => self.trans_op(*op, left, right, level, done, ctx),
            ast::Exp::Record { typ, fields } => {
                let ty = self
                    .tenv
                    .look(typ)
                    .cloned()
                    .ok_or_else(|| Error::UndefinedType(typ.clone()))?;
                let ty = types::actual(&ty);
                let decl_fields = match &*ty {
                    Ty::Record { fields, .. } => fields.clone(),
                    _ => return Err(Error::TypeMismatch("record expression of a non-record type")),
                };
                if decl_fields.len() != fields.len() {
                    return Err(Error::TypeMismatch("record field count"));
                }
                let r = ctx.temps.fresh();
                let mut stms = vec![Stm::mov(
                    IrExp::Temp(r),
                    external_call(
                        "alloc_record",
                        vec![IrExp::Const(decl_fields.len() as i64 * WORD_SIZE)],
                    ),
                )];
                for (i, ((name, init), (decl_name, decl_ty))) in
                    fields.iter().zip(&decl_fields).enumerate()
                {
                    if name != decl_name {
                        return Err(Error::TypeMismatch("record field order"));
                    }
                    let (e, field_ty) = self.trans_exp(init, level, done, ctx)?;
                    if !types::compatible(&field_ty, decl_ty) {
                        return Err(Error::TypeMismatch("record field initializer"));
                    }
                    stms.push(Stm::mov(
                        IrExp::mem_offset(IrExp::Temp(r), i as i64 * WORD_SIZE),
                        e.un_ex(ctx),
                    ));
                }
                Ok((
                    TrExp::Ex(IrExp::eseq(ir::seq(stms), IrExp::Temp(r))),
                    ty.clone(),
                ))
            }
            ast::Exp::Seq(exps) => {
                if exps.is_empty() {
                    return Ok((TrExp::Nx(Stm::nop()), types::unit()));
                }
                let mut stms = Vec::new();
                let mut last: Option<(TrExp, TyRef)> = None;
                for e in exps {
                    if let Some((prev, _)) = last.take() {
                        stms.push(prev.un_nx(ctx));
                    }
                    last = Some(self.trans_exp(e, level, done, ctx)?);
                }
                let (last_exp, last_ty) = last.expect("nonempty sequence");
                if stms.is_empty() {
                    return Ok((last_exp, last_ty));
                }
                if matches!(&*types::actual(&last_ty), Ty::Unit) {
                    stms.push(last_exp.un_nx(ctx));
                    Ok((TrExp::Nx(ir::seq(stms)), last_ty))
                } else {
                    let e = last_exp.un_ex(ctx);
                    Ok((TrExp::Ex(IrExp::eseq(ir::seq(stms), e)), last_ty))
                }
            }
            ast::Exp::Assign { var, exp } => {
                if let ast::Var::Simple(sym) = var {
                    if let Some(Entry::Var { readonly: true, .. }) = self.venv.look(sym) {
                        return Err(Error::AssignToLoopVar(sym.clone()));
                    }
                }
                let (lhs, lhs_ty) = self.trans_var(var, level, done, ctx)?;
                let (rhs, rhs_ty) = self.trans_exp(exp, level, done, ctx)?;
                if !types::compatible(&lhs_ty, &rhs_ty) {
                    return Err(Error::TypeMismatch("assignment"));
                }
                Ok((
                    TrExp::Nx(Stm::mov(lhs.un_ex(ctx), rhs.un_ex(ctx))),
                    types::unit(),
                ))
            }
            ast::Exp::If { test, then, els } => {
                let (test_exp, test_ty) = self.trans_exp(test, level, done, ctx)?;
                if !types::compatible(&test_ty, &types::int()) {
                    return Err(Error::TypeMismatch("if condition"));
                }
                let gen = test_exp.un_cx()?;
                let (then_exp, then_ty) = self.trans_exp(then, level, done, ctx)?;
                match els {
                    Some(els) => {
                        let (else_exp, else_ty) = self.trans_exp(els, level, done, ctx)?;
                        if !types::compatible(&then_ty, &else_ty) {
                            return Err(Error::TypeMismatch("if branches"));
                        }
                        let result_ty = if matches!(&*types::actual(&then_ty), Ty::Nil) {
                            else_ty
                        } else {
                            then_ty
                        };
                        let t = ctx.labels.fresh();
                        let f = ctx.labels.fresh();
                        let join = ctx.labels.fresh();
                        if matches!(&*types::actual(&result_ty), Ty::Unit) {
                            let stm = ir::seq(vec![
                                gen(t.clone(), f.clone()),
                                Stm::Label(t),
                                then_exp.un_nx(ctx),
                                Stm::jump(join.clone()),
                                Stm::Label(f),
                                else_exp.un_nx(ctx),
                                Stm::Label(join),
                            ]);
                            Ok((TrExp::Nx(stm), result_ty))
                        } else {
                            let r = ctx.temps.fresh();
                            let stm = ir::seq(vec![
                                gen(t.clone(), f.clone()),
                                Stm::Label(t),
                                Stm::mov(IrExp::Temp(r), then_exp.un_ex(ctx)),
                                Stm::jump(join.clone()),
                                Stm::Label(f),
                                Stm::mov(IrExp::Temp(r), else_exp.un_ex(ctx)),
                                Stm::Label(join),
                            ]);
                            Ok((TrExp::Ex(IrExp::eseq(stm, IrExp::Temp(r))), result_ty))
                        }
                    }
                    None => {
                        if !matches!(&*types::actual(&then_ty), Ty::Unit) {
                            return Err(Error::TypeMismatch("if-then producing a value"));
                        }
                        let t = ctx.labels.fresh();
                        let f = ctx.labels.fresh();
                        let stm = ir::seq(vec![
                            gen(t.clone(), f.clone()),
                            Stm::Label(t),
                            then_exp.un_nx(ctx),
                            Stm::Label(f),
                        ]);
                        Ok((TrExp::Nx(stm), types::unit()))
                    }
                }
            }
            ast::Exp::While { test, body } => {
                let (test_exp, test_ty) = self.trans_exp(test, level, done, ctx)?;
                if !types::compatible(&test_ty, &types::int()) {
                    return Err(Error::TypeMismatch("while condition"));
                }
                let gen = test_exp.un_cx()?;
                let test_l = ctx.labels.fresh();
                let body_l = ctx.labels.fresh();
                let done_l = ctx.labels.fresh();
                let (body_exp, body_ty) = self.trans_exp(body, level, Some(&done_l), ctx)?;
                if !matches!(&*types::actual(&body_ty), Ty::Unit) {
                    return Err(Error::TypeMismatch("while body producing a value"));
                }
                let stm = ir::seq(vec![
                    Stm::Label(test_l.clone()),
                    gen(body_l.clone(), done_l.clone()),
                    Stm::Label(body_l),
                    body_exp.un_nx(ctx),
                    Stm::jump(test_l),
                    Stm::Label(done_l),
                ]);
                Ok((TrExp::Nx(stm), types::unit()))
            }
            ast::Exp::For {
                var,
                escape,
                lo,
                hi,
                body,
            } => {
                let (lo_exp, lo_ty) = self.trans_exp(lo, level, done, ctx)?;
                let (hi_exp, hi_ty) = self.trans_exp(hi, level, done, ctx)?;
                if !types::compatible(&lo_ty, &types::int())
                    || !types::compatible(&hi_ty, &types::int())
                {
                    return Err(Error::TypeMismatch("for bounds"));
                }
                let iv_access = VarAccess {
                    level,
                    access: self.levels[level.0]
                        .frame
                        .alloc_local(escape.get(), &mut ctx.temps),
                };
                let limit_access = VarAccess {
                    level,
                    access: self.levels[level.0].frame.alloc_local(false, &mut ctx.temps),
                };
                let iv = self.simple_var(&iv_access, level);
                let limit = self.simple_var(&limit_access, level);
                let body_l = ctx.labels.fresh();
                let incr_l = ctx.labels.fresh();
                let done_l = ctx.labels.fresh();
                self.venv.begin_scope();
                self.venv.enter(
                    var.clone(),
                    Entry::Var {
                        access: iv_access,
                        ty: types::int(),
                        readonly: true,
                    },
                );
                let (body_exp, body_ty) = self.trans_exp(body, level, Some(&done_l), ctx)?;
                self.venv.end_scope();
                if !matches!(&*types::actual(&body_ty), Ty::Unit) {
                    return Err(Error::TypeMismatch("for body producing a value"));
                }
                // The increment runs only below the limit, so the loop
                // cannot wrap when the bound is the maximum integer.
                let stm = ir::seq(vec![
                    Stm::mov(iv.clone(), lo_exp.un_ex(ctx)),
                    Stm::mov(limit.clone(), hi_exp.un_ex(ctx)),
                    Stm::cjump(
                        RelOp::Le,
                        iv.clone(),
                        limit.clone(),
                        body_l.clone(),
                        done_l.clone(),
                    ),
                    Stm::Label(body_l.clone()),
                    body_exp.un_nx(ctx),
                    Stm::cjump(RelOp::Lt, iv.clone(), limit, incr_l.clone(), done_l.clone()),
                    Stm::Label(incr_l),
                    Stm::mov(
                        iv.clone(),
                        IrExp::binop(BinOp::Plus, iv, IrExp::Const(1)),
                    ),
                    Stm::jump(body_l),
                    Stm::Label(done_l),
                ]);
                Ok((TrExp::Nx(stm), types::unit()))
            }
            ast::Exp::Break => {
                let done = done.ok_or(Error::BreakOutsideLoop)?;
                Ok((TrExp::Nx(Stm::jump(done.clone())), types::unit()))
            }
            ast::Exp::Let { decs, body } => {
                self.venv.begin_scope();
                self.tenv.begin_scope();
                let mut stms = Vec::new();
                for dec in decs {
                    if let Some(stm) = self.trans_dec(dec, level, done, ctx)? {
                        stms.push(stm);
                    }
                }
                let (body_exp, body_ty) = self.trans_exp(body, level, done, ctx)?;
                let result = if stms.is_empty() {
                    (body_exp, body_ty)
                } else if matches!(&*types::actual(&body_ty), Ty::Unit) {
                    stms.push(body_exp.un_nx(ctx));
                    (TrExp::Nx(ir::seq(stms)), body_ty)
                } else {
                    let e = body_exp.un_ex(ctx);
                    (TrExp::Ex(IrExp::eseq(ir::seq(stms), e)), body_ty)
                };
                self.tenv.end_scope();
                self.venv.end_scope();
                Ok(result)
            }
            ast::Exp::Array { typ, size, init } => {
                let ty = self
                    .tenv
                    .look(typ)
                    .cloned()
                    .ok_or_else(|| Error::UndefinedType(typ.clone()))?;
                let ty = types::actual(&ty);
                let elem = match &*ty {
                    Ty::Array { elem, .. } => elem.clone(),
                    _ => return Err(Error::TypeMismatch("array expression of a non-array type")),
                };
                let (size_exp, size_ty) = self.trans_exp(size, level, done, ctx)?;
                if !types::compatible(&size_ty, &types::int()) {
                    return Err(Error::TypeMismatch("array size"));
                }
                let (init_exp, init_ty) = self.trans_exp(init, level, done, ctx)?;
                if !types::compatible(&init_ty, &elem) {
                    return Err(Error::TypeMismatch("array initializer"));
                }
                let call = external_call(
                    "init_array",
                    vec![size_exp.un_ex(ctx), init_exp.un_ex(ctx)],
                );
                Ok((TrExp::Ex(call), ty.clone()))
            }
        }
    }

    fn trans_call(
        &mut self,
        func: &crate::symbol::Symbol,
        args: &[ast::Exp],
        level: LevelId,
        done: Option<&Label>,
        ctx: &mut Context,
    ) -> Result<(TrExp, TyRef)> {
        let (flevel, label, formals, result) = match self.venv.look(func) {
            Some(Entry::Fun {
                level,
                label,
                formals,
                result,
            }) => (*level, label.clone(), formals.clone(), result.clone()),
            _ => return Err(Error::UndefinedFunction(func.clone())),
        };
        if formals.len() != args.len() {
            return Err(Error::ArityMismatch {
                callee: func.clone(),
                expected: formals.len(),
                found: args.len(),
            });
        }
        let mut arg_exps = Vec::with_capacity(args.len());
        for (arg, formal_ty) in args.iter().zip(&formals) {
            let (e, ty) = self.trans_exp(arg, level, done, ctx)?;
            if !types::compatible(&ty, formal_ty) {
                return Err(Error::TypeMismatch("call argument"));
            }
            arg_exps.push(e.un_ex(ctx));
        }
        let exp = match flevel {
            None => external_call(label.as_str(), arg_exps),
            Some(callee) => {
                let parent = self.levels[callee.0]
                    .parent
                    .expect("nested function without a parent level");
                let link = self.static_link(parent, level);
                IrExp::Call {
                    func: Box::new(IrExp::Name(label)),
                    args: arg_exps,
                    static_link: Some(Box::new(link)),
                }
            }
        };
        Ok((TrExp::Ex(exp), types::actual(&result)))
    }

    fn trans_op(
        &mut self,
        op: ast::Oper,
        left: &ast::Exp,
        right: &ast::Exp,
        level: LevelId,
        done: Option<&Label>,
        ctx: &mut Context,
    ) -> Result<(TrExp, TyRef)> {
        use ast::Oper;

        let (left_exp, left_ty) = self.trans_exp(left, level, done, ctx)?;
        let (right_exp, right_ty) = self.trans_exp(right, level, done, ctx)?;
        match op {
            Oper::Plus | Oper::Minus | Oper::Times | Oper::Divide | Oper::And | Oper::Or => {
                if !types::compatible(&left_ty, &types::int())
                    || !types::compatible(&right_ty, &types::int())
                {
                    return Err(Error::TypeMismatch("arithmetic operand"));
                }
                let bop = match op {
                    Oper::Plus => BinOp::Plus,
                    Oper::Minus => BinOp::Minus,
                    Oper::Times => BinOp::Mul,
                    Oper::Divide => BinOp::Div,
                    Oper::And => BinOp::And,
                    Oper::Or => BinOp::Or,
                    _ => unreachable!(),
                };
                let exp = IrExp::binop(bop, left_exp.un_ex(ctx), right_exp.un_ex(ctx));
                Ok((TrExp::Ex(exp), types::int()))
            }
            Oper::Eq | Oper::Neq => {
                if !types::compatible(&left_ty, &right_ty) {
                    return Err(Error::TypeMismatch("equality operands"));
                }
                let rel = if op == Oper::Eq { RelOp::Eq } else { RelOp::Ne };
                let l = left_exp.un_ex(ctx);
                let r = right_exp.un_ex(ctx);
                let gen: CxGen = if matches!(&*types::actual(&left_ty), Ty::String) {
                    // String contents compare through the runtime.
                    let call = external_call("string_equal", vec![l, r]);
                    Box::new(move |t, f| Stm::cjump(rel, call, IrExp::Const(1), t, f))
                } else {
                    Box::new(move |t, f| Stm::cjump(rel, l, r, t, f))
                };
                Ok((TrExp::Cx(gen), types::int()))
            }
            Oper::Lt | Oper::Le | Oper::Gt | Oper::Ge => {
                if !types::compatible(&left_ty, &types::int())
                    || !types::compatible(&right_ty, &types::int())
                {
                    return Err(Error::TypeMismatch("ordered comparison operand"));
                }
                let rel = match op {
                    Oper::Lt => RelOp::Lt,
                    Oper::Le => RelOp::Le,
                    Oper::Gt => RelOp::Gt,
                    Oper::Ge => RelOp::Ge,
                    _ => unreachable!(),
                };
                let l = left_exp.un_ex(ctx);
                let r = right_exp.un_ex(ctx);
                let gen: CxGen = Box::new(move |t, f| Stm::cjump(rel, l, r, t, f));
                Ok((TrExp::Cx(gen), types::int()))
            }
        }
    }

    fn trans_dec(
        &mut self,
        dec: &ast::Dec,
        level: LevelId,
        done: Option<&Label>,
        ctx: &mut Context,
    ) -> Result<Option<Stm>> {
        match dec {
            ast::Dec::Var {
                name,
                escape,
                typ,
                init,
            } => {
                let (init_exp, init_ty) = self.trans_exp(init, level, done, ctx)?;
                let var_ty = match typ {
                    Some(ty_name) => {
                        let declared = self
                            .tenv
                            .look(ty_name)
                            .cloned()
                            .ok_or_else(|| Error::UndefinedType(ty_name.clone()))?;
                        if !types::compatible(&declared, &init_ty) {
                            return Err(Error::TypeMismatch("variable initializer"));
                        }
                        types::actual(&declared)
                    }
                    None => {
                        if matches!(&*types::actual(&init_ty), Ty::Nil) {
                            return Err(Error::TypeMismatch(
                                "nil initializer without a record type",
                            ));
                        }
                        init_ty
                    }
                };
                let access = VarAccess {
                    level,
                    access: self.levels[level.0]
                        .frame
                        .alloc_local(escape.get(), &mut ctx.temps),
                };
                let dst = self.simple_var(&access, level);
                self.venv.enter(
                    name.clone(),
                    Entry::Var {
                        access,
                        ty: var_ty,
                        readonly: false,
                    },
                );
                Ok(Some(Stm::mov(dst, init_exp.un_ex(ctx))))
            }
            ast::Dec::Types(batch) => {
                self.trans_type_batch(batch, ctx)?;
                Ok(None)
            }
            ast::Dec::Functions(batch) => {
                self.trans_function_batch(batch, level, ctx)?;
                Ok(None)
            }
        }
    }

    fn trans_type_batch(&mut self, batch: &[ast::TyDec], ctx: &mut Context) -> Result<()> {
        // Headers first so mutual recursion resolves.
        for tydec in batch {
            self.tenv.enter(
                tydec.name.clone(),
                Rc::new(Ty::Name {
                    name: tydec.name.clone(),
                    binding: RefCell::new(None),
                }),
            );
        }
        for tydec in batch {
            let ty = self.resolve_ty(&tydec.ty, ctx)?;
            let header = self
                .tenv
                .look(&tydec.name)
                .cloned()
                .expect("header entered above");
            if let Ty::Name { binding, .. } = &*header {
                *binding.borrow_mut() = Some(ty);
            }
        }
        for tydec in batch {
            let mut seen: FxHashSet<crate::symbol::Symbol> = FxHashSet::default();
            let mut cur = self
                .tenv
                .look(&tydec.name)
                .cloned()
                .expect("header entered above");
            loop {
                let next = match &*cur {
                    Ty::Name { name, binding } => {
                        if !seen.insert(name.clone()) {
                            return Err(Error::TypeCycle(tydec.name.clone()));
                        }
                        binding.borrow().clone()
                    }
                    _ => break,
                };
                match next {
                    Some(n) => cur = n,
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn resolve_ty(&mut self, abs: &ast::TyAbs, ctx: &mut Context) -> Result<TyRef> {
        match abs {
            ast::TyAbs::Name(sym) => self
                .tenv
                .look(sym)
                .cloned()
                .ok_or_else(|| Error::UndefinedType(sym.clone())),
            ast::TyAbs::Record(fields) => {
                let mut resolved = Vec::with_capacity(fields.len());
                for field in fields {
                    let ty = self
                        .tenv
                        .look(&field.typ)
                        .cloned()
                        .ok_or_else(|| Error::UndefinedType(field.typ.clone()))?;
                    resolved.push((field.name.clone(), ty));
                }
                Ok(Rc::new(Ty::Record {
                    fields: resolved,
                    unique: ctx.fresh_unique(),
                }))
            }
            ast::TyAbs::Array(sym) => {
                let elem = self
                    .tenv
                    .look(sym)
                    .cloned()
                    .ok_or_else(|| Error::UndefinedType(sym.clone()))?;
                Ok(Rc::new(Ty::Array {
                    elem,
                    unique: ctx.fresh_unique(),
                }))
            }
        }
    }

    fn trans_function_batch(
        &mut self,
        batch: &[ast::FunDec],
        level: LevelId,
        ctx: &mut Context,
    ) -> Result<()> {
        // Pass one: enter every header so mutual recursion is visible.
        for fundec in batch {
            let mut formal_tys = Vec::with_capacity(fundec.params.len());
            for param in &fundec.params {
                formal_tys.push(
                    self.tenv
                        .look(&param.typ)
                        .cloned()
                        .ok_or_else(|| Error::UndefinedType(param.typ.clone()))?,
                );
            }
            let result_ty = match &fundec.result {
                Some(sym) => self
                    .tenv
                    .look(sym)
                    .cloned()
                    .ok_or_else(|| Error::UndefinedType(sym.clone()))?,
                None => types::unit(),
            };
            let label = ctx.labels.fresh_named(fundec.name.as_str());
            let mut escapes = vec![true]; // the static link always escapes
            escapes.extend(fundec.params.iter().map(|p| p.escape.get()));
            let flevel = self.new_level(Some(level), label.clone(), &escapes, ctx);
            self.venv.enter(
                fundec.name.clone(),
                Entry::Fun {
                    level: Some(flevel),
                    label,
                    formals: formal_tys,
                    result: result_ty,
                },
            );
        }
        // Pass two: translate each body in its own level.
        for fundec in batch {
            let (flevel, formal_tys, result_ty) = match self.venv.look(&fundec.name) {
                Some(Entry::Fun {
                    level: Some(l),
                    formals,
                    result,
                    ..
                }) => (*l, formals.clone(), result.clone()),
                _ => return Err(Error::UndefinedFunction(fundec.name.clone())),
            };
            let formal_accesses: Vec<Access> =
                self.levels[flevel.0].frame.formals()[1..].to_vec();
            self.venv.begin_scope();
            for ((param, ty), access) in fundec
                .params
                .iter()
                .zip(&formal_tys)
                .zip(&formal_accesses)
            {
                self.venv.enter(
                    param.name.clone(),
                    Entry::Var {
                        access: VarAccess {
                            level: flevel,
                            access: access.clone(),
                        },
                        ty: ty.clone(),
                        readonly: false,
                    },
                );
            }
            let (body_exp, body_ty) = self.trans_exp(&fundec.body, flevel, None, ctx)?;
            if !types::compatible(&body_ty, &result_ty) {
                return Err(Error::TypeMismatch("function body result"));
            }
            self.venv.end_scope();
            self.finish_proc(flevel, body_exp, ctx);
        }
        Ok(())
    }
}
