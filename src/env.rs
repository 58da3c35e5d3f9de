//! LIFO-scoped symbol tables for the translator, plus the base
//! environments holding the runtime primitives.

use rustc_hash::FxHashMap;

use crate::symbol::Symbol;
use crate::temp::Label;
use crate::translate::{LevelId, VarAccess};
use crate::types::{self, TyRef};

/// A stack of scopes looked up innermost-first.
#[derive(Debug)]
pub struct Table<T> {
    scopes: Vec<FxHashMap<Symbol, T>>,
}

impl<T> Table<T> {
    pub fn new() -> Self {
        Table {
            scopes: vec![FxHashMap::default()],
        }
    }

    pub fn begin_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn end_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn enter(&mut self, sym: Symbol, value: T) {
        self.scopes
            .last_mut()
            .expect("symbol table has no open scope")
            .insert(sym, value);
    }

    pub fn look(&self, sym: &Symbol) -> Option<&T> {
        self.scopes.iter().rev().find_map(|scope| scope.get(sym))
    }
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A value-environment entry.
#[derive(Debug)]
pub enum Entry {
    Var {
        access: VarAccess,
        ty: TyRef,
        /// Set for loop induction variables, which must not be assigned.
        readonly: bool,
    },
    Fun {
        /// `None` for runtime primitives, which are called without a
        /// static link.
        level: Option<LevelId>,
        label: Label,
        formals: Vec<TyRef>,
        result: TyRef,
    },
}

/// The value environment seeded with the runtime library.
pub fn base_venv() -> Table<Entry> {
    let mut venv = Table::new();
    let prims: &[(&str, Vec<TyRef>, TyRef)] = &[
        ("print", vec![types::string()], types::unit()),
        ("printi", vec![types::int()], types::unit()),
        ("flush", vec![], types::unit()),
        ("getchar", vec![], types::string()),
        ("ord", vec![types::string()], types::int()),
        ("chr", vec![types::int()], types::string()),
        ("size", vec![types::string()], types::int()),
        (
            "substring",
            vec![types::string(), types::int(), types::int()],
            types::string(),
        ),
        (
            "concat",
            vec![types::string(), types::string()],
            types::string(),
        ),
        ("not", vec![types::int()], types::int()),
        ("exit", vec![types::int()], types::unit()),
    ];
    for (name, formals, result) in prims {
        venv.enter(
            Symbol::new(name),
            Entry::Fun {
                level: None,
                label: Label::named(name),
                formals: formals.clone(),
                result: result.clone(),
            },
        );
    }
    venv
}

/// The type environment seeded with the primitive types.
pub fn base_tenv() -> Table<TyRef> {
    let mut tenv = Table::new();
    tenv.enter(Symbol::new("int"), types::int());
    tenv.enter(Symbol::new("string"), types::string());
    tenv
}
