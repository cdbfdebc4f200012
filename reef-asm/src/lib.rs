//! Instruction-set layer of the reef WebAssembly runtime.
//!
//! This crate is the single source of truth for everything
//! instruction-shaped:
//!
//! - [`Op`]: the packed internal opcode space covering every Wasm opcode
//!   plane (core one-byte, `0xFC` miscellaneous, `0xFD` vector, `0xFE`
//!   atomics, `0xFB` GC) plus the runtime's fused superinstructions,
//! - [`Instr`]: the fixed-width 8-byte predecoded-IR record,
//! - [`RegOp`]/[`RegInstr`]: the three-address register IR consumed by the
//!   register interpreter and the JIT back ends,
//! - [`TrapReason`]: the runtime trap taxonomy.

#![warn(missing_docs)]
#![deny(unused_must_use)]

#[macro_use]
mod macros;

mod instr;
mod op;
mod reg;
mod trap;

pub use instr::{BlockTypeRepr, Instr, OperandKind, Plane};
pub use op::Op;
pub use reg::{RegInstr, RegOp};
pub use trap::TrapReason;

/// Prefix byte of the `0xFB` GC opcode plane.
pub const GC_PREFIX: u8 = 0xFB;
/// Prefix byte of the `0xFC` miscellaneous opcode plane.
pub const MISC_PREFIX: u8 = 0xFC;
/// Prefix byte of the `0xFD` vector opcode plane.
pub const SIMD_PREFIX: u8 = 0xFD;
/// Prefix byte of the `0xFE` atomic opcode plane.
pub const ATOMIC_PREFIX: u8 = 0xFE;
