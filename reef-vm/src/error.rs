//! Runtime error implementation.

use core::fmt;

use reef_asm::TrapReason;
use reef_types::Word;

/// Engine error variants, observable to the embedder.
#[derive(Debug, Clone, derive_more::Display, PartialEq, Eq)]
pub enum VmError {
    /// Decode or validation rejected the binary.
    #[display(fmt = "invalid wasm module: {_0}")]
    InvalidWasm(&'static str),
    /// Instantiation could not resolve an import.
    #[display(fmt = "unresolved import: {_0}")]
    ImportNotFound(String),
    /// An import resolved but is type-incompatible.
    #[display(fmt = "incompatible import: {_0}")]
    LinkError(&'static str),
    /// The requested export does not exist or has the wrong kind.
    #[display(fmt = "unknown export: {_0}")]
    ExportNotFound(String),
    /// Execution trapped.
    #[display(fmt = "trap: {_0}")]
    Trap(TrapReason),
    /// A Wasm exception propagated out of the top-level invocation.
    #[display(fmt = "uncaught wasm exception")]
    Uncaught,
    /// The host allocator refused a request.
    #[display(fmt = "out of memory")]
    OutOfMemory,
}

impl VmError {
    /// The trap reason, when this error is a trap.
    pub const fn trap_reason(&self) -> Option<TrapReason> {
        match self {
            Self::Trap(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl std::error::Error for VmError {}

impl From<TrapReason> for VmError {
    fn from(reason: TrapReason) -> Self {
        Self::Trap(reason)
    }
}

/// Control-flow-bearing error used inside the execution tiers.
///
/// Wasm exceptions unwind as `Thrown` until a frame with a matching
/// `try_table` clause absorbs them; one that survives to the top level
/// becomes [`VmError::Uncaught`]. `Exit` is the WASI `proc_exit` unwind.
/// Neither is an error in the Wasm sense; both share the `?` plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// A trap; terminal for the invocation.
    Trap(TrapReason),
    /// An in-flight Wasm exception, carrying its tagged exnref word.
    Thrown(Word),
    /// WASI `proc_exit` with the given code.
    Exit(i32),
}

impl From<TrapReason> for RuntimeError {
    fn from(reason: TrapReason) -> Self {
        Self::Trap(reason)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trap(reason) => write!(f, "trap: {reason}"),
            Self::Thrown(_) => write!(f, "wasm exception"),
            Self::Exit(code) => write!(f, "proc_exit({code})"),
        }
    }
}

/// Result alias used throughout the execution tiers.
pub type ExecResult<T> = Result<T, RuntimeError>;
