//! The `define_ops!` macro.
//!
//! The opcode table in `op.rs` is the single source of truth from which the
//! [`Op`](crate::Op) enum, its packed-value decoder, and its name table are
//! all derived. Each row is `raw_value VariantName "spec.name"`, grouped
//! under the base value of its opcode plane.

macro_rules! define_ops {
    ($($base:literal => { $($raw:literal $name:ident $text:literal)* })*) => {
        /// An opcode of the predecoded IR.
        ///
        /// Discriminants pack the opcode plane into the high bits and the
        /// in-plane value into the low bits, so a single `u16` field in an
        /// [`Instr`](crate::Instr) record identifies any instruction of any
        /// plane. Fused superinstructions live in a plane of their own above
        /// the Wasm-defined ones.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Op {
            $($(
                #[doc = $text]
                $name = $base + $raw,
            )*)*
        }

        const OP_LUT_LEN: usize = 0x800;

        static OP_LUT: [bool; OP_LUT_LEN] = {
            let mut lut = [false; OP_LUT_LEN];
            $($( lut[($base + $raw) as usize] = true; )*)*
            lut
        };

        impl Op {
            /// Number of defined opcodes.
            pub const COUNT: usize = 0 $($( + { let _ = $raw; 1 } )*)*;

            /// Decode a packed opcode value, rejecting undefined slots.
            #[inline]
            pub fn from_packed(code: u16) -> Option<Self> {
                if (code as usize) < OP_LUT_LEN && OP_LUT[code as usize] {
                    // SAFETY: the LUT admits exactly the declared
                    // discriminants of this fieldless repr(u16) enum.
                    Some(unsafe { core::mem::transmute::<u16, Op>(code) })
                } else {
                    None
                }
            }

            /// The packed `u16` value of this opcode.
            #[inline]
            pub const fn packed(self) -> u16 {
                self as u16
            }

            /// Spec name of the instruction.
            pub const fn name(self) -> &'static str {
                match self {
                    $($( Self::$name => $text, )*)*
                }
            }
        }
    };
}
