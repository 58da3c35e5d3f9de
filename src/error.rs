use crate::symbol::Symbol;
use thiserror::Error;

/// Errors raised by the back end. The input is assumed to be well typed, so
/// everything here is either an invariant violation in the pipeline or
/// malformed input from the front end; nothing is recoverable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("conditional requested from a statement translation")]
    CondFromStatement,

    #[error("move destination is neither a temporary nor a memory location")]
    MoveDestination,

    #[error("jump through a computed address is not supported")]
    ComputedJump,

    #[error("call through a computed address is not supported")]
    ComputedCall,

    #[error("jump to undefined label `{0}`")]
    UndefinedLabel(String),

    #[error("temporary {0} survived allocation without a register")]
    DanglingTemp(String),

    #[error("call to `{callee}` passes {found} arguments, declared with {expected}")]
    ArityMismatch {
        callee: Symbol,
        expected: usize,
        found: usize,
    },

    #[error("illegal type cycle through `{0}`")]
    TypeCycle(Symbol),

    #[error("assignment to loop variable `{0}`")]
    AssignToLoopVar(Symbol),

    #[error("break outside of a loop")]
    BreakOutsideLoop,

    #[error("undefined variable `{0}`")]
    UndefinedVariable(Symbol),

    #[error("undefined function `{0}`")]
    UndefinedFunction(Symbol),

    #[error("undefined type `{0}`")]
    UndefinedType(Symbol),

    #[error("no field `{0}` on record type")]
    UnknownField(Symbol),

    #[error("type mismatch in {0}")]
    TypeMismatch(&'static str),

    #[error("register allocation did not converge for `{proc_name}` after {iterations} rounds")]
    AllocatorDiverged {
        proc_name: String,
        iterations: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
