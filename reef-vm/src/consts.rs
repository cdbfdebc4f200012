//! Engine parameters.

/// Default call-depth ceiling. Any call that would exceed it fails with
/// `CallStackExhausted` before transferring control.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Operand-stack capacity, in 128-bit slots.
pub const MAX_OPERAND_SLOTS: usize = 64 * 1024;

/// Call-count threshold at which a function is promoted to native code.
pub const JIT_CALL_THRESHOLD: u32 = 10;

/// Back-edge threshold at which a function is promoted mid-execution.
pub const JIT_BACKEDGE_THRESHOLD: u32 = 1_000;

/// Default Wasm page size, and the only one valid without the custom
/// page-size limits flag.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// log2 of [`WASM_PAGE_SIZE`].
pub const DEFAULT_PAGE_SIZE_LOG2: u8 = 16;

/// Virtual reservation of a 32-bit linear memory on 64-bit hosts: a full
/// 4 GiB index space, doubled to absorb the largest static offset, plus one
/// trailing guard page granule. Accesses past the accessible prefix land in
/// `PROT_NONE` and fault.
pub const MEMORY_RESERVATION: usize = 8 * 1024 * 1024 * 1024 + 64 * 1024;

// The guard must absorb any 32-bit index plus any 32-bit static offset plus
// the widest single access.
static_assertions::const_assert!(
    MEMORY_RESERVATION as u64 >= (1 << 32) + (u32::MAX as u64) + 16
);

/// Hard ceiling on pages of a 32-bit memory.
pub const MAX_MEMORY32_PAGES: u64 = 65_536;

/// Virtual registers available to the register tier. Functions needing more
/// stay on the stack tier.
pub const MAX_VIRTUAL_REGS: usize = 255;

// Decoder resource ceilings. Exceeding any of them rejects the module.

/// Items per section.
pub const MAX_SECTION_ITEMS: u32 = 1 << 20;
/// Declared locals per function.
pub const MAX_FUNC_LOCALS: u32 = 50_000;
/// Block nesting depth per function body.
pub const MAX_BLOCK_DEPTH: usize = 1_000;
/// `br_table` target count.
pub const MAX_BR_TABLE_TARGETS: u32 = 65_520;
/// Data segments per module.
pub const MAX_DATA_SEGMENTS: u32 = 100_000;
/// Struct fields per type.
pub const MAX_STRUCT_FIELDS: u32 = 10_000;
/// Parameters or results per function type.
pub const MAX_FUNC_TYPE_ARITY: u32 = 1_000;
/// Bytes per function body.
pub const MAX_FUNC_BODY_BYTES: u32 = 1 << 24;
