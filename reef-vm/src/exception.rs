//! The exception arena.
//!
//! `throw` packages the operand-stack slice matching its tag's parameter
//! types into an [`ExnObject`] here and unwinds with the tagged exnref word.
//! Like the GC heap, the arena is append-only; exception objects live until
//! store teardown so a caught-and-rethrown exnref stays valid indefinitely.

use reef_asm::TrapReason;
use reef_types::TagAddr;

/// One thrown exception.
#[derive(Debug, Clone)]
pub struct ExnObject {
    /// Store address of the tag it was thrown with.
    pub tag: TagAddr,
    /// Payload cells, one per tag parameter (operand-stack slot format).
    pub payload: Vec<u128>,
}

/// Append-only exception storage.
#[derive(Debug, Default)]
pub struct ExnArena {
    objects: Vec<ExnObject>,
}

impl ExnArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Package an exception; returns its arena index.
    pub fn alloc(&mut self, tag: TagAddr, payload: Vec<u128>) -> usize {
        let index = self.objects.len();
        self.objects.push(ExnObject { tag, payload });
        index
    }

    /// The exception at an arena index.
    pub fn get(&self, index: usize) -> Result<&ExnObject, TrapReason> {
        self.objects.get(index).ok_or(TrapReason::NullReference)
    }
}
