//! Constant-expression decoding.
//!
//! Constant expressions appear in global initializers, segment offsets,
//! element items, and table initializers. The grammar here admits the
//! extended-constant and GC allocation forms; whether each op is legal in a
//! given position is the validator's concern.

use crate::error::VmError;
use crate::module::{ConstExpr, ConstOp};

use super::Reader;

/// Decode one constant expression up to and including its `end`.
pub fn decode_const_expr(r: &mut Reader<'_>) -> Result<ConstExpr, VmError> {
    let mut ops = Vec::new();
    loop {
        match r.u8()? {
            0x0B => break,
            0x41 => ops.push(ConstOp::I32(r.i32_leb()?)),
            0x42 => ops.push(ConstOp::I64(r.i64_leb()?)),
            0x43 => ops.push(ConstOp::F32(r.f32_bits()?)),
            0x44 => ops.push(ConstOp::F64(r.f64_bits()?)),
            0xD0 => ops.push(ConstOp::RefNull(r.heap_type()?)),
            0xD2 => ops.push(ConstOp::RefFunc(r.u32_leb()?)),
            0x23 => ops.push(ConstOp::GlobalGet(r.u32_leb()?)),
            0x6A => ops.push(ConstOp::I32Add),
            0x6B => ops.push(ConstOp::I32Sub),
            0x6C => ops.push(ConstOp::I32Mul),
            0x7C => ops.push(ConstOp::I64Add),
            0x7D => ops.push(ConstOp::I64Sub),
            0x7E => ops.push(ConstOp::I64Mul),
            0xFD => {
                if r.u32_leb()? != 0x0C {
                    return Err(VmError::InvalidWasm(
                        "non-constant vector op in constant expression",
                    ));
                }
                ops.push(ConstOp::V128(u128::from_le_bytes(r.bytes_exact::<16>()?)));
            }
            0xFB => match r.u32_leb()? {
                0x00 => ops.push(ConstOp::StructNew(r.u32_leb()?)),
                0x01 => ops.push(ConstOp::StructNewDefault(r.u32_leb()?)),
                0x06 => ops.push(ConstOp::ArrayNew(r.u32_leb()?)),
                0x07 => ops.push(ConstOp::ArrayNewDefault(r.u32_leb()?)),
                0x08 => {
                    let ty = r.u32_leb()?;
                    let n = r.u32_leb()?;
                    ops.push(ConstOp::ArrayNewFixed(ty, n));
                }
                0x1C => ops.push(ConstOp::RefI31),
                _ => {
                    return Err(VmError::InvalidWasm(
                        "non-constant gc op in constant expression",
                    ))
                }
            },
            _ => {
                return Err(VmError::InvalidWasm(
                    "non-constant op in constant expression",
                ))
            }
        }
    }
    if ops.is_empty() {
        return Err(VmError::InvalidWasm("empty constant expression"));
    }
    Ok(ConstExpr { ops })
}
