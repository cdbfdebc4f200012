//! Embedder-tunable execution parameters.

use crate::consts::*;

/// Execution parameters of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmParams {
    /// Call-depth ceiling.
    pub max_call_depth: usize,
    /// Fuel budget; `None` disables metering.
    pub fuel: Option<u64>,
    /// Ceiling on total linear-memory bytes per instance; `memory.grow`
    /// requests past it fail with -1.
    pub max_memory_bytes: Option<u64>,
    /// Whether functions are promoted to native code at all.
    pub jit: bool,
    /// Call-count promotion threshold.
    pub jit_call_threshold: u32,
    /// Back-edge promotion threshold. Zero promotes on function entry, which
    /// the differential tests use to force compilation.
    pub jit_backedge_threshold: u32,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            max_call_depth: MAX_CALL_DEPTH,
            fuel: None,
            max_memory_bytes: None,
            jit: cfg!(any(target_arch = "aarch64", target_arch = "x86_64")),
            jit_call_threshold: JIT_CALL_THRESHOLD,
            jit_backedge_threshold: JIT_BACKEDGE_THRESHOLD,
        }
    }
}

impl VmParams {
    /// The sandbox profile: every capability denied by the caller, fuel and
    /// memory clamped.
    pub fn sandboxed() -> Self {
        Self {
            fuel: Some(1_000_000_000),
            max_memory_bytes: Some(1 << 28),
            ..Self::default()
        }
    }
}

/// Decoder resource ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Items per section.
    pub max_section_items: u32,
    /// Declared locals per function.
    pub max_locals: u32,
    /// Block nesting depth per function body.
    pub max_block_depth: usize,
    /// Data segments per module.
    pub max_data_segments: u32,
    /// Bytes per function body.
    pub max_func_body_bytes: u32,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_section_items: MAX_SECTION_ITEMS,
            max_locals: MAX_FUNC_LOCALS,
            max_block_depth: MAX_BLOCK_DEPTH,
            max_data_segments: MAX_DATA_SEGMENTS,
            max_func_body_bytes: MAX_FUNC_BODY_BYTES,
        }
    }
}
