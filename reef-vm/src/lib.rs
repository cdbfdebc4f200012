//! reef WebAssembly engine implementation.
//!
//! The engine raises each function through up to three execution tiers:
//! a stack interpreter over predecoded IR, a register interpreter over
//! three-address IR, and a per-function native JIT. The [`runtime`] module
//! is the embedding surface; everything below it is the machinery.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod consts;
pub mod decode;
pub mod error;
pub mod exception;
pub mod gc;
pub mod host;
pub mod instance;
pub mod interpreter;
pub mod jit;
pub mod lower;
pub mod memory;
pub mod module;
pub mod params;
pub mod predecode;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod store;
pub mod validate;
pub mod wasi;

#[cfg(any(test, feature = "test-helpers"))]
pub mod util;

#[cfg(test)]
mod tests;

// Fully re-export the instruction-set and primitive-type crates.
#[doc(no_inline)]
pub use reef_asm;
#[doc(no_inline)]
pub use reef_types;

pub mod prelude {
    //! Required imports for typical embedding.
    #[doc(no_inline)]
    pub use reef_asm::TrapReason;
    #[doc(no_inline)]
    pub use reef_types::{RefRepr, ValType, Word, V128};

    #[doc(no_inline)]
    pub use crate::error::VmError;
    #[doc(no_inline)]
    pub use crate::params::VmParams;
    #[doc(no_inline)]
    pub use crate::runtime::{inspect_imports, ExportInfo, ImportInfo, WasmModule};
    #[doc(no_inline)]
    pub use crate::wasi::Capabilities;
}
