//! Runtime state representation for the VM.

use reef_types::{FuncAddr, Word};

/// Resulting state of one tier's execution of a function activation.
///
/// The outer dispatch loop consumes these: `Returned` pops the activation,
/// `Tail` re-dispatches in place (no depth growth), `JitRestart` recompiles
/// the function and re-enters it. A restart is only ever produced before
/// the activation performs an observable write, so re-entering is
/// indistinguishable from having taken the native path from the start.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteState {
    /// The activation finished; results in operand-cell form.
    Returned(Vec<u128>),
    /// `return_call`: replace this activation with the given callee.
    Tail(FuncAddr, Vec<u128>),
    /// The function crossed a promotion threshold; compile and re-enter.
    JitRestart,
}

impl ExecuteState {
    /// Whether the activation is finished.
    pub fn is_returned(&self) -> bool {
        matches!(self, Self::Returned(_))
    }
}

/// Resulting state of a top-level program execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramState {
    /// The export returned normally with these values (word form, v128 as
    /// two words).
    Completed(Vec<Word>),
    /// The program requested termination via WASI `proc_exit`.
    Exited(i32),
}

impl ProgramState {
    /// The returned values, treating an exit as an empty return.
    pub fn into_values(self) -> Vec<Word> {
        match self {
            Self::Completed(values) => values,
            Self::Exited(_) => Vec::new(),
        }
    }

    /// The WASI exit code, when the program exited.
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Completed(_) => None,
        }
    }
}
