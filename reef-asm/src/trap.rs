//! Runtime trap taxonomy.

use core::fmt;

/// Trap reason representation for the runtime.
///
/// Every trap is terminal for the invocation that raised it; the embedder
/// receives the reason, and the CLI maps it onto its exit-code contract.
/// Wasm exceptions caught by a matching `try_table` are control flow, not
/// traps, and never surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
#[non_exhaustive]
pub enum TrapReason {
    /// The byte can't be mapped to any known `TrapReason`.
    UnknownTrapReason = 0x00,
    /// `unreachable` executed.
    Unreachable = 0x01,
    /// Integer division or remainder by zero.
    IntegerDivideByZero = 0x02,
    /// Signed division overflow, or a float-to-int truncation out of range.
    IntegerOverflow = 0x03,
    /// Float-to-int truncation of a NaN.
    InvalidConversionToInteger = 0x04,
    /// Linear-memory access outside the accessible prefix. May arrive via
    /// the signal-recovery path when raised from JIT code.
    OutOfBoundsMemoryAccess = 0x05,
    /// Table access outside the table's current size.
    OutOfBoundsTableAccess = 0x06,
    /// `call_indirect` through a null table element.
    UndefinedElement = 0x07,
    /// Table element read before initialization.
    UninitializedElement = 0x08,
    /// `call_indirect` target whose type id does not match.
    IndirectCallTypeMismatch = 0x09,
    /// Null dereference in `call_ref`, `ref.as_non_null`, a GC accessor, or
    /// `throw_ref`.
    NullReference = 0x0A,
    /// Call depth exceeded the configured ceiling.
    CallStackExhausted = 0x0B,
    /// The fuel counter reached zero.
    FuelExhausted = 0x0C,
    /// The host allocator refused a request.
    OutOfMemory = 0x0D,
    /// GC array access outside the array's length.
    OutOfBoundsArrayAccess = 0x0E,
    /// `ref.cast` to a type the value does not inhabit.
    CastFailure = 0x0F,
    /// An exception propagated out of the top-level invocation.
    UncaughtException = 0x10,
    /// Atomic operation on an unshared memory required a shared one.
    ExpectedSharedMemory = 0x11,
    /// WASI syscall attempted without the required capability.
    WasiCapabilityDenied = 0x12,
    /// Atomic access whose address is not aligned to its width.
    UnalignedAtomicAccess = 0x13,
}

impl TrapReason {
    /// The stable byte value, as stored in JIT return registers.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a JIT return-register value.
    pub fn from_code(code: u8) -> Self {
        use strum::IntoEnumIterator;
        Self::iter()
            .find(|reason| reason.code() == code)
            .unwrap_or(Self::UnknownTrapReason)
    }
}

impl fmt::Display for TrapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::UnknownTrapReason => "unknown trap",
            Self::Unreachable => "unreachable executed",
            Self::IntegerDivideByZero => "integer divide by zero",
            Self::IntegerOverflow => "integer overflow",
            Self::InvalidConversionToInteger => "invalid conversion to integer",
            Self::OutOfBoundsMemoryAccess => "out of bounds memory access",
            Self::OutOfBoundsTableAccess => "out of bounds table access",
            Self::UndefinedElement => "undefined element",
            Self::UninitializedElement => "uninitialized element",
            Self::IndirectCallTypeMismatch => "indirect call type mismatch",
            Self::NullReference => "null reference",
            Self::CallStackExhausted => "call stack exhausted",
            Self::FuelExhausted => "fuel exhausted",
            Self::OutOfMemory => "out of memory",
            Self::OutOfBoundsArrayAccess => "out of bounds array access",
            Self::CastFailure => "cast failure",
            Self::UncaughtException => "uncaught exception",
            Self::ExpectedSharedMemory => "expected shared memory",
            Self::WasiCapabilityDenied => "capability denied",
            Self::UnalignedAtomicAccess => "unaligned atomic access",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for TrapReason {}

#[cfg(test)]
mod tests {
    use super::TrapReason;
    use strum::IntoEnumIterator;

    #[test]
    fn codes_round_trip() {
        for reason in TrapReason::iter() {
            assert_eq!(TrapReason::from_code(reason.code()), reason);
        }
    }

    #[test]
    fn unknown_code_is_absorbed() {
        assert_eq!(TrapReason::from_code(0xEE), TrapReason::UnknownTrapReason);
    }
}
