//! Tagged 64-bit encoding of reference values.
//!
//! Every reference travels on the operand stack as a single [`Word`]:
//!
//! | kind | encoding |
//! |---|---|
//! | null | `0` |
//! | funcref | `(store_addr + 1) \| (FUNC_TAG << 32)` |
//! | externref | `(handle + 1) \| (EXTERN_TAG << 32)` |
//! | gc ref | `(heap_index + 1) \| (GC_TAG << 32)` |
//! | exnref | `(arena_index + 1) \| (EXN_TAG << 32)` |
//! | i31 | bit 63 set, payload in bits 0..=30 |
//!
//! Zero always denotes null, so a freshly zeroed local or table slot is a
//! valid null reference. The `+1` bias keeps address zero distinguishable
//! from null. Bit 63 is disjoint from every tag, so unboxed i31 values never
//! collide with heap indices.

use crate::Word;

/// The null reference of every reference type.
pub const NULL_REF: Word = 0;

/// Bit position of the kind tag.
pub const REF_TAG_SHIFT: u32 = 32;

/// Kind tag of function references.
pub const FUNC_TAG: Word = 1;
/// Kind tag of host (extern) references.
pub const EXTERN_TAG: Word = 2;
/// Kind tag of GC heap references.
pub const GC_TAG: Word = 3;
/// Kind tag of exception references.
pub const EXN_TAG: Word = 4;

/// Marker bit of unboxed i31 references.
pub const I31_FLAG: Word = 1 << 63;

const PAYLOAD_MASK: Word = (1 << REF_TAG_SHIFT) - 1;

/// Decoded view of a tagged reference word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefRepr {
    /// The null reference.
    Null,
    /// Function reference carrying a store address.
    Func(usize),
    /// Host reference carrying an opaque handle.
    Extern(u32),
    /// GC reference carrying a heap index.
    Gc(usize),
    /// Exception reference carrying an arena index.
    Exn(usize),
    /// Unboxed 31-bit integer, sign-extended.
    I31(i32),
}

impl RefRepr {
    /// Encode into the on-stack word form.
    pub const fn encode(self) -> Word {
        match self {
            Self::Null => NULL_REF,
            Self::Func(addr) => (addr as Word + 1) | (FUNC_TAG << REF_TAG_SHIFT),
            Self::Extern(handle) => {
                (handle as Word + 1) | (EXTERN_TAG << REF_TAG_SHIFT)
            }
            Self::Gc(index) => (index as Word + 1) | (GC_TAG << REF_TAG_SHIFT),
            Self::Exn(index) => (index as Word + 1) | (EXN_TAG << REF_TAG_SHIFT),
            Self::I31(value) => I31_FLAG | ((value as u32 as Word) & 0x7fff_ffff),
        }
    }

    /// Decode from the on-stack word form.
    pub const fn decode(word: Word) -> Self {
        if word == NULL_REF {
            return Self::Null;
        }
        if word & I31_FLAG != 0 {
            // Sign-extend the 31-bit payload through bit 30.
            let payload = (word & 0x7fff_ffff) as u32;
            let value = ((payload << 1) as i32) >> 1;
            return Self::I31(value);
        }
        let payload = ((word & PAYLOAD_MASK) as usize).wrapping_sub(1);
        match word >> REF_TAG_SHIFT {
            FUNC_TAG => Self::Func(payload),
            EXTERN_TAG => Self::Extern(payload as u32),
            GC_TAG => Self::Gc(payload),
            EXN_TAG => Self::Exn(payload),
            _ => Self::Null,
        }
    }

    /// Whether the word encodes null.
    pub const fn is_null(word: Word) -> bool {
        word == NULL_REF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_round_trip() {
        for repr in [
            RefRepr::Null,
            RefRepr::Func(0),
            RefRepr::Func(417),
            RefRepr::Extern(7),
            RefRepr::Gc(0),
            RefRepr::Gc(usize::pow(2, 20)),
            RefRepr::Exn(3),
            RefRepr::I31(0),
            RefRepr::I31(1_073_741_823),
            RefRepr::I31(-1_073_741_824),
            RefRepr::I31(-1),
        ] {
            assert_eq!(RefRepr::decode(repr.encode()), repr, "{repr:?}");
        }
    }

    #[test]
    fn null_is_zero() {
        assert_eq!(RefRepr::Null.encode(), 0);
        assert!(RefRepr::is_null(0));
        // Address zero is distinguishable from null.
        assert_ne!(RefRepr::Func(0).encode(), NULL_REF);
    }

    #[test]
    fn i31_disjoint_from_tags() {
        let i31 = RefRepr::I31(-5).encode();
        assert!(i31 & I31_FLAG != 0);
        for tagged in [RefRepr::Func(5), RefRepr::Gc(5), RefRepr::Exn(5)] {
            assert_eq!(tagged.encode() & I31_FLAG, 0);
        }
    }
}
