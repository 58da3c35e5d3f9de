//! Escape analysis: a variable escapes when it is referenced from a
//! lexical depth strictly greater than the depth of its declaration, and
//! must then live in its frame rather than a register. Flags only move
//! from `false` to `true`.

use std::cell::Cell;

use crate::ast::{Dec, Exp, Var};
use crate::env::Table;

struct EscapeEntry<'a> {
    depth: u32,
    escape: &'a Cell<bool>,
}

/// Settles every escape flag in the program. Must run before translation.
pub fn find_escapes(program: &Exp) {
    let mut env: Table<EscapeEntry<'_>> = Table::new();
    traverse_exp(&mut env, 0, program);
}

fn traverse_var<'a>(env: &mut Table<EscapeEntry<'a>>, depth: u32, var: &'a Var) {
    match var {
        Var::Simple(sym) => {
            // Unknown names are the front end's problem; the translator
            // reports them.
            if let Some(entry) = env.look(sym) {
                if depth > entry.depth {
                    entry.escape.set(true);
                }
            }
        }
        Var::Field(base, _) => traverse_var(env, depth, base),
        Var::Subscript(base, index) => {
            traverse_var(env, depth, base);
            traverse_exp(env, depth, index);
        }
    }
}

fn traverse_exp<'a>(env: &mut Table<EscapeEntry<'a>>, depth: u32, exp: &'a Exp) {
    match exp {
        Exp::Var(var) => traverse_var(env, depth, var),
        Exp::Nil | Exp::Int(_) | Exp::Str(_) | Exp::Break => {}
        Exp::Call { args, .. } => {
            for arg in args {
                traverse_exp(env, depth, arg);
            }
        }
        Exp::Op { left, right, .. } => {
            traverse_exp(env, depth, left);
            traverse_exp(env, depth, right);
        }
        Exp::Record { fields, .. } => {
            for (_, field) in fields {
                traverse_exp(env, depth, field);
            }
        }
        Exp::Seq(exps) => {
            for e in exps {
                traverse_exp(env, depth, e);
            }
        }
        Exp::Assign { var, exp } => {
            traverse_var(env, depth, var);
            traverse_exp(env, depth, exp);
        }
        Exp::If { test, then, els } => {
            traverse_exp(env, depth, test);
            traverse_exp(env, depth, then);
            if let Some(e) = els {
                traverse_exp(env, depth, e);
            }
        }
        Exp::While { test, body } => {
            traverse_exp(env, depth, test);
            traverse_exp(env, depth, body);
        }
        Exp::For {
            var,
            escape,
            lo,
            hi,
            body,
        } => {
            // Bounds are evaluated outside the induction variable's scope.
            traverse_exp(env, depth, lo);
            traverse_exp(env, depth, hi);
            escape.set(false);
            env.begin_scope();
            env.enter(var.clone(), EscapeEntry { depth, escape });
            traverse_exp(env, depth, body);
            env.end_scope();
        }
        Exp::Let { decs, body } => {
            env.begin_scope();
            for dec in decs {
                traverse_dec(env, depth, dec);
            }
            traverse_exp(env, depth, body);
            env.end_scope();
        }
        Exp::Array { size, init, .. } => {
            traverse_exp(env, depth, size);
            traverse_exp(env, depth, init);
        }
    }
}

fn traverse_dec<'a>(env: &mut Table<EscapeEntry<'a>>, depth: u32, dec: &'a Dec) {
    match dec {
        Dec::Var {
            name,
            escape,
            init,
            ..
        } => {
            traverse_exp(env, depth, init);
            escape.set(false);
            env.enter(name.clone(), EscapeEntry { depth, escape });
        }
        Dec::Functions(fundecs) => {
            for fundec in fundecs {
                env.begin_scope();
                for param in &fundec.params {
                    param.escape.set(false);
                    env.enter(
                        param.name.clone(),
                        EscapeEntry {
                            depth: depth + 1,
                            escape: &param.escape,
                        },
                    );
                }
                traverse_exp(env, depth + 1, &fundec.body);
                env.end_scope();
            }
        }
        Dec::Types(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Field, FunDec, Oper};
    use crate::symbol::Symbol;
    use std::cell::Cell;

    fn let_with_fn(body_of_fn: Exp) -> Exp {
        // let var x := 0  function f() : int = <body> in 0 end
        let dec = Dec::Var {
            name: Symbol::new("x"),
            escape: Cell::new(true), // pass must reset, then decide
            typ: None,
            init: Exp::Int(0),
        };
        let fun = Dec::Functions(vec![FunDec {
            name: Symbol::new("f"),
            params: vec![],
            result: Some(Symbol::new("int")),
            body: body_of_fn,
        }]);
        Exp::Let {
            decs: vec![dec, fun],
            body: Box::new(Exp::Int(0)),
        }
    }

    fn var_escape(program: &Exp) -> bool {
        match program {
            Exp::Let { decs, .. } => match &decs[0] {
                Dec::Var { escape, .. } => escape.get(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn use_from_nested_function_escapes() {
        let program = let_with_fn(Exp::simple_var("x"));
        find_escapes(&program);
        assert!(var_escape(&program));
    }

    #[test]
    fn use_at_same_depth_does_not_escape() {
        let program = let_with_fn(Exp::Int(1));
        find_escapes(&program);
        assert!(!var_escape(&program));
    }

    #[test]
    fn parameters_escape_when_captured_deeper() {
        // function g(a: int) : int = let function h() : int = a in h() end
        let param = Field::new("a", "int");
        let fundec = FunDec {
            name: Symbol::new("g"),
            params: vec![param],
            result: Some(Symbol::new("int")),
            body: Exp::Let {
                decs: vec![Dec::Functions(vec![FunDec {
                    name: Symbol::new("h"),
                    params: vec![],
                    result: Some(Symbol::new("int")),
                    body: Exp::simple_var("a"),
                }])],
                body: Box::new(Exp::call("h", vec![])),
            },
        };
        let program = Exp::Let {
            decs: vec![Dec::Functions(vec![fundec])],
            body: Box::new(Exp::Int(0)),
        };
        find_escapes(&program);
        match &program {
            Exp::Let { decs, .. } => match &decs[0] {
                Dec::Functions(fs) => assert!(fs[0].params[0].escape.get()),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn loop_variable_stays_in_register_when_local() {
        let for_loop = Exp::For {
            var: Symbol::new("i"),
            escape: Cell::new(true),
            lo: Box::new(Exp::Int(1)),
            hi: Box::new(Exp::Int(10)),
            body: Box::new(Exp::op(
                Oper::Plus,
                Exp::simple_var("i"),
                Exp::Int(1),
            )),
        };
        find_escapes(&for_loop);
        match &for_loop {
            Exp::For { escape, .. } => assert!(!escape.get()),
            _ => unreachable!(),
        }
    }
}
