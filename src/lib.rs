//! Back end of a compiler for a small statically typed language with
//! nested functions, records, arrays and structured control flow. The
//! crate consumes a type-checked AST and produces x86-64 assembly in
//! AT&T syntax for the System V ABI.
//!
//! The pipeline runs one procedure at a time: escape analysis over the
//! whole program, translation to tree IR with static links, then per
//! fragment canonicalization, maximal-munch instruction selection,
//! liveness analysis and iterated graph-coloring register allocation
//! with coalescing and spilling, and finally text emission.

pub mod assem;
pub mod ast;
pub mod canon;
pub mod codegen;
pub mod color;
pub mod config;
pub mod emit;
pub mod env;
pub mod error;
pub mod escape;
pub mod flowgraph;
pub mod frame;
pub mod ir;
pub mod liveness;
pub mod regalloc;
pub mod symbol;
pub mod temp;
pub mod translate;
pub mod types;

pub use config::Options;
pub use error::Error;

use frame::Fragment;
use temp::{LabelFactory, TempFactory};
use types::Unique;

/// Shared state threaded through every pass: the temporary and label
/// factories, the accumulating fragment list, and the nominal-type
/// counter. One `Context` lives for one compilation.
pub struct Context {
    pub temps: TempFactory,
    pub labels: LabelFactory,
    pub frags: Vec<Fragment>,
    uniques: u32,
}

impl Context {
    pub fn new() -> Self {
        Context {
            temps: TempFactory::new(),
            labels: LabelFactory::new(),
            frags: Vec::new(),
            uniques: 0,
        }
    }

    pub fn fresh_unique(&mut self) -> Unique {
        let u = Unique(self.uniques);
        self.uniques += 1;
        u
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiles a type-checked program to assembly text.
pub fn compile_to_string(program: &ast::Exp, options: &Options) -> error::Result<String> {
    let mut ctx = Context::new();
    escape::find_escapes(program);
    translate::translate_program(program, &options.entry_label, &mut ctx)?;
    let frags = std::mem::take(&mut ctx.frags);
    emit::assemble(frags, options, &mut ctx)
}
