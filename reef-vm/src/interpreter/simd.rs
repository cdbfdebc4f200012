//! Vector (v128) execution for the stack tier.
//!
//! The register tier and the JIT never see these opcodes; the lowerer pins
//! any function containing them to this interpreter. Lane math leans on the
//! lane accessors of [`V128`] and stays scalar per lane; throughput is
//! explicitly not a goal here, correctness is.

use reef_asm::{Instr, Op, TrapReason};
use reef_types::V128;

use crate::error::ExecResult;

use super::stack::{sat_i32_s, sat_i32_u, Exec};

macro_rules! un8 {
    ($ex:ident, $f:expr) => {{
        let a = V128(($ex).simd_pop()).u8x16();
        ($ex).simd_push(V128::from_u8x16(a.map($f)).0)?;
    }};
}
macro_rules! bin8 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).u8x16();
        let a = V128(($ex).simd_pop()).u8x16();
        let mut out = [0u8; 16];
        for i in 0..16 {
            out[i] = $f(a[i], b[i]);
        }
        ($ex).simd_push(V128::from_u8x16(out).0)?;
    }};
}
macro_rules! bin16 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).u16x8();
        let a = V128(($ex).simd_pop()).u16x8();
        let mut out = [0u16; 8];
        for i in 0..8 {
            out[i] = $f(a[i], b[i]);
        }
        ($ex).simd_push(V128::from_u16x8(out).0)?;
    }};
}
macro_rules! bin32 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).u32x4();
        let a = V128(($ex).simd_pop()).u32x4();
        let mut out = [0u32; 4];
        for i in 0..4 {
            out[i] = $f(a[i], b[i]);
        }
        ($ex).simd_push(V128::from_u32x4(out).0)?;
    }};
}
macro_rules! bin64 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).u64x2();
        let a = V128(($ex).simd_pop()).u64x2();
        let mut out = [0u64; 2];
        for i in 0..2 {
            out[i] = $f(a[i], b[i]);
        }
        ($ex).simd_push(V128::from_u64x2(out).0)?;
    }};
}
macro_rules! cmp8 {
    ($ex:ident, $f:expr) => {
        bin8!($ex, |a, b| if $f(a, b) { 0xFFu8 } else { 0 })
    };
}
macro_rules! cmp16 {
    ($ex:ident, $f:expr) => {
        bin16!($ex, |a, b| if $f(a, b) { 0xFFFFu16 } else { 0 })
    };
}
macro_rules! cmp32 {
    ($ex:ident, $f:expr) => {
        bin32!($ex, |a, b| if $f(a, b) { u32::MAX } else { 0 })
    };
}
macro_rules! cmp64 {
    ($ex:ident, $f:expr) => {
        bin64!($ex, |a, b| if $f(a, b) { u64::MAX } else { 0 })
    };
}
macro_rules! fbin32 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).f32x4();
        let a = V128(($ex).simd_pop()).f32x4();
        let mut out = [0f32; 4];
        for i in 0..4 {
            out[i] = $f(a[i], b[i]);
        }
        ($ex).simd_push(V128::from_f32x4(out).0)?;
    }};
}
macro_rules! fbin64 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).f64x2();
        let a = V128(($ex).simd_pop()).f64x2();
        let mut out = [0f64; 2];
        for i in 0..2 {
            out[i] = $f(a[i], b[i]);
        }
        ($ex).simd_push(V128::from_f64x2(out).0)?;
    }};
}
macro_rules! fun32 {
    ($ex:ident, $f:expr) => {{
        let a = V128(($ex).simd_pop()).f32x4();
        ($ex).simd_push(V128::from_f32x4(a.map($f)).0)?;
    }};
}
macro_rules! fun64 {
    ($ex:ident, $f:expr) => {{
        let a = V128(($ex).simd_pop()).f64x2();
        ($ex).simd_push(V128::from_f64x2(a.map($f)).0)?;
    }};
}
macro_rules! fcmp32 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).f32x4();
        let a = V128(($ex).simd_pop()).f32x4();
        let mut out = [0u32; 4];
        for i in 0..4 {
            out[i] = if $f(a[i], b[i]) { u32::MAX } else { 0 };
        }
        ($ex).simd_push(V128::from_u32x4(out).0)?;
    }};
}
macro_rules! fcmp64 {
    ($ex:ident, $f:expr) => {{
        let b = V128(($ex).simd_pop()).f64x2();
        let a = V128(($ex).simd_pop()).f64x2();
        let mut out = [0u64; 2];
        for i in 0..2 {
            out[i] = if $f(a[i], b[i]) { u64::MAX } else { 0 };
        }
        ($ex).simd_push(V128::from_u64x2(out).0)?;
    }};
}
macro_rules! shift {
    ($ex:ident, $width:expr, $from:ident, $to:ident, $f:expr) => {{
        let count = ($ex).simd_pop_u32() % $width;
        let a = V128(($ex).simd_pop()).$from();
        ($ex).simd_push(V128::$to(a.map(|l| $f(l, count))).0)?;
    }};
}

#[allow(clippy::too_many_lines)]
pub(super) fn step(
    ex: &mut Exec<'_, '_>,
    instr: Instr,
    code: &[Instr],
    pc: &mut usize,
) -> ExecResult<()> {
    use Op::*;

    match instr.op {
        // Memory.
        V128Load => {
            let (mem, addr) = ex.simd_load_bytes(instr, 16)?;
            ex.simd_push(u128::from_le_bytes(mem.load::<16>(addr)?))?;
        }
        V128Store => {
            let v = ex.simd_pop();
            let (mem, addr) = ex.simd_load_bytes(instr, 16)?;
            mem.store::<16>(addr, v.to_le_bytes())?;
        }
        V128Load8x8S | V128Load8x8U => {
            let (mem, addr) = ex.simd_load_bytes(instr, 8)?;
            let b = mem.load::<8>(addr)?;
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = if instr.op == V128Load8x8S {
                    b[i] as i8 as i16 as u16
                } else {
                    b[i] as u16
                };
            }
            ex.simd_push(V128::from_u16x8(out).0)?;
        }
        V128Load16x4S | V128Load16x4U => {
            let (mem, addr) = ex.simd_load_bytes(instr, 8)?;
            let b = mem.load::<8>(addr)?;
            let mut out = [0u32; 4];
            for i in 0..4 {
                let lane = u16::from_le_bytes([b[2 * i], b[2 * i + 1]]);
                out[i] = if instr.op == V128Load16x4S {
                    lane as i16 as i32 as u32
                } else {
                    lane as u32
                };
            }
            ex.simd_push(V128::from_u32x4(out).0)?;
        }
        V128Load32x2S | V128Load32x2U => {
            let (mem, addr) = ex.simd_load_bytes(instr, 8)?;
            let b = mem.load::<8>(addr)?;
            let mut out = [0u64; 2];
            for i in 0..2 {
                let lane = u32::from_le_bytes([
                    b[4 * i],
                    b[4 * i + 1],
                    b[4 * i + 2],
                    b[4 * i + 3],
                ]);
                out[i] = if instr.op == V128Load32x2S {
                    lane as i32 as i64 as u64
                } else {
                    lane as u64
                };
            }
            ex.simd_push(V128::from_u64x2(out).0)?;
        }
        V128Load8Splat => {
            let (mem, addr) = ex.simd_load_bytes(instr, 1)?;
            let b = mem.load::<1>(addr)?[0];
            ex.simd_push(V128::from_u8x16([b; 16]).0)?;
        }
        V128Load16Splat => {
            let (mem, addr) = ex.simd_load_bytes(instr, 2)?;
            let l = u16::from_le_bytes(mem.load::<2>(addr)?);
            ex.simd_push(V128::from_u16x8([l; 8]).0)?;
        }
        V128Load32Splat => {
            let (mem, addr) = ex.simd_load_bytes(instr, 4)?;
            let l = u32::from_le_bytes(mem.load::<4>(addr)?);
            ex.simd_push(V128::from_u32x4([l; 4]).0)?;
        }
        V128Load64Splat => {
            let (mem, addr) = ex.simd_load_bytes(instr, 8)?;
            let l = u64::from_le_bytes(mem.load::<8>(addr)?);
            ex.simd_push(V128::from_u64x2([l; 2]).0)?;
        }
        V128Load32Zero => {
            let (mem, addr) = ex.simd_load_bytes(instr, 4)?;
            let l = u32::from_le_bytes(mem.load::<4>(addr)?);
            ex.simd_push(l as u128)?;
        }
        V128Load64Zero => {
            let (mem, addr) = ex.simd_load_bytes(instr, 8)?;
            let l = u64::from_le_bytes(mem.load::<8>(addr)?);
            ex.simd_push(l as u128)?;
        }
        V128Load8Lane | V128Load16Lane | V128Load32Lane | V128Load64Lane
        | V128Store8Lane | V128Store16Lane | V128Store32Lane | V128Store64Lane => {
            let lane = code[*pc].extra as usize;
            *pc += 1;
            let v = V128(ex.simd_pop());
            let width: u64 = match instr.op {
                V128Load8Lane | V128Store8Lane => 1,
                V128Load16Lane | V128Store16Lane => 2,
                V128Load32Lane | V128Store32Lane => 4,
                _ => 8,
            };
            let (mem, addr) = ex.simd_load_bytes(instr, width)?;
            let is_store = matches!(
                instr.op,
                V128Store8Lane | V128Store16Lane | V128Store32Lane | V128Store64Lane
            );
            if is_store {
                let bytes = v.to_le_bytes();
                let start = lane * width as usize;
                mem.write_from(addr, &bytes[start..start + width as usize])?;
            } else {
                let mut bytes = v.to_le_bytes();
                let mut buf = [0u8; 8];
                mem.read_into(addr, &mut buf[..width as usize])?;
                let start = lane * width as usize;
                bytes[start..start + width as usize]
                    .copy_from_slice(&buf[..width as usize]);
                ex.simd_push(u128::from_le_bytes(bytes))?;
            }
        }

        V128Const => {
            let v = ex.simd_pool(instr.operand);
            ex.simd_push(v)?;
        }
        I8x16Shuffle => {
            let lanes = V128(ex.simd_pool(instr.operand)).u8x16();
            let b = V128(ex.simd_pop()).u8x16();
            let a = V128(ex.simd_pop()).u8x16();
            let mut out = [0u8; 16];
            for i in 0..16 {
                let sel = lanes[i] as usize;
                out[i] = if sel < 16 { a[sel] } else { b[sel - 16] };
            }
            ex.simd_push(V128::from_u8x16(out).0)?;
        }
        I8x16Swizzle => {
            let s = V128(ex.simd_pop()).u8x16();
            let a = V128(ex.simd_pop()).u8x16();
            let mut out = [0u8; 16];
            for i in 0..16 {
                out[i] = if (s[i] as usize) < 16 { a[s[i] as usize] } else { 0 };
            }
            ex.simd_push(V128::from_u8x16(out).0)?;
        }

        I8x16Splat => {
            let v = ex.simd_pop_u32() as u8;
            ex.simd_push(V128::from_u8x16([v; 16]).0)?;
        }
        I16x8Splat => {
            let v = ex.simd_pop_u32() as u16;
            ex.simd_push(V128::from_u16x8([v; 8]).0)?;
        }
        I32x4Splat => {
            let v = ex.simd_pop_u32();
            ex.simd_push(V128::from_u32x4([v; 4]).0)?;
        }
        I64x2Splat => {
            let v = ex.simd_pop_u64();
            ex.simd_push(V128::from_u64x2([v; 2]).0)?;
        }
        F32x4Splat => {
            let v = ex.simd_pop_u32();
            ex.simd_push(V128::from_u32x4([v; 4]).0)?;
        }
        F64x2Splat => {
            let v = ex.simd_pop_u64();
            ex.simd_push(V128::from_u64x2([v; 2]).0)?;
        }

        I8x16ExtractLaneS => {
            let a = V128(ex.simd_pop()).u8x16();
            ex.simd_push_u32(a[instr.extra as usize] as i8 as i32 as u32);
        }
        I8x16ExtractLaneU => {
            let a = V128(ex.simd_pop()).u8x16();
            ex.simd_push_u32(a[instr.extra as usize] as u32);
        }
        I16x8ExtractLaneS => {
            let a = V128(ex.simd_pop()).u16x8();
            ex.simd_push_u32(a[instr.extra as usize] as i16 as i32 as u32);
        }
        I16x8ExtractLaneU => {
            let a = V128(ex.simd_pop()).u16x8();
            ex.simd_push_u32(a[instr.extra as usize] as u32);
        }
        I32x4ExtractLane | F32x4ExtractLane => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push_u32(a[instr.extra as usize]);
        }
        I64x2ExtractLane | F64x2ExtractLane => {
            let a = V128(ex.simd_pop()).u64x2();
            ex.simd_push_u64(a[instr.extra as usize]);
        }
        I8x16ReplaceLane => {
            let v = ex.simd_pop_u32() as u8;
            let mut a = V128(ex.simd_pop()).u8x16();
            a[instr.extra as usize] = v;
            ex.simd_push(V128::from_u8x16(a).0)?;
        }
        I16x8ReplaceLane => {
            let v = ex.simd_pop_u32() as u16;
            let mut a = V128(ex.simd_pop()).u16x8();
            a[instr.extra as usize] = v;
            ex.simd_push(V128::from_u16x8(a).0)?;
        }
        I32x4ReplaceLane | F32x4ReplaceLane => {
            let v = ex.simd_pop_u32();
            let mut a = V128(ex.simd_pop()).u32x4();
            a[instr.extra as usize] = v;
            ex.simd_push(V128::from_u32x4(a).0)?;
        }
        I64x2ReplaceLane | F64x2ReplaceLane => {
            let v = ex.simd_pop_u64();
            let mut a = V128(ex.simd_pop()).u64x2();
            a[instr.extra as usize] = v;
            ex.simd_push(V128::from_u64x2(a).0)?;
        }

        // Comparisons.
        I8x16Eq => cmp8!(ex, |a, b| a == b),
        I8x16Ne => cmp8!(ex, |a, b| a != b),
        I8x16LtS => cmp8!(ex, |a, b| (a as i8) < (b as i8)),
        I8x16LtU => cmp8!(ex, |a: u8, b: u8| a < b),
        I8x16GtS => cmp8!(ex, |a, b| (a as i8) > (b as i8)),
        I8x16GtU => cmp8!(ex, |a: u8, b: u8| a > b),
        I8x16LeS => cmp8!(ex, |a, b| (a as i8) <= (b as i8)),
        I8x16LeU => cmp8!(ex, |a: u8, b: u8| a <= b),
        I8x16GeS => cmp8!(ex, |a, b| (a as i8) >= (b as i8)),
        I8x16GeU => cmp8!(ex, |a: u8, b: u8| a >= b),
        I16x8Eq => cmp16!(ex, |a, b| a == b),
        I16x8Ne => cmp16!(ex, |a, b| a != b),
        I16x8LtS => cmp16!(ex, |a, b| (a as i16) < (b as i16)),
        I16x8LtU => cmp16!(ex, |a: u16, b: u16| a < b),
        I16x8GtS => cmp16!(ex, |a, b| (a as i16) > (b as i16)),
        I16x8GtU => cmp16!(ex, |a: u16, b: u16| a > b),
        I16x8LeS => cmp16!(ex, |a, b| (a as i16) <= (b as i16)),
        I16x8LeU => cmp16!(ex, |a: u16, b: u16| a <= b),
        I16x8GeS => cmp16!(ex, |a, b| (a as i16) >= (b as i16)),
        I16x8GeU => cmp16!(ex, |a: u16, b: u16| a >= b),
        I32x4Eq => cmp32!(ex, |a, b| a == b),
        I32x4Ne => cmp32!(ex, |a, b| a != b),
        I32x4LtS => cmp32!(ex, |a, b| (a as i32) < (b as i32)),
        I32x4LtU => cmp32!(ex, |a: u32, b: u32| a < b),
        I32x4GtS => cmp32!(ex, |a, b| (a as i32) > (b as i32)),
        I32x4GtU => cmp32!(ex, |a: u32, b: u32| a > b),
        I32x4LeS => cmp32!(ex, |a, b| (a as i32) <= (b as i32)),
        I32x4LeU => cmp32!(ex, |a: u32, b: u32| a <= b),
        I32x4GeS => cmp32!(ex, |a, b| (a as i32) >= (b as i32)),
        I32x4GeU => cmp32!(ex, |a: u32, b: u32| a >= b),
        I64x2Eq => cmp64!(ex, |a, b| a == b),
        I64x2Ne => cmp64!(ex, |a, b| a != b),
        I64x2LtS => cmp64!(ex, |a, b| (a as i64) < (b as i64)),
        I64x2GtS => cmp64!(ex, |a, b| (a as i64) > (b as i64)),
        I64x2LeS => cmp64!(ex, |a, b| (a as i64) <= (b as i64)),
        I64x2GeS => cmp64!(ex, |a, b| (a as i64) >= (b as i64)),
        F32x4Eq => fcmp32!(ex, |a, b| a == b),
        F32x4Ne => fcmp32!(ex, |a, b| a != b),
        F32x4Lt => fcmp32!(ex, |a, b| a < b),
        F32x4Gt => fcmp32!(ex, |a, b| a > b),
        F32x4Le => fcmp32!(ex, |a, b| a <= b),
        F32x4Ge => fcmp32!(ex, |a, b| a >= b),
        F64x2Eq => fcmp64!(ex, |a, b| a == b),
        F64x2Ne => fcmp64!(ex, |a, b| a != b),
        F64x2Lt => fcmp64!(ex, |a, b| a < b),
        F64x2Gt => fcmp64!(ex, |a, b| a > b),
        F64x2Le => fcmp64!(ex, |a, b| a <= b),
        F64x2Ge => fcmp64!(ex, |a, b| a >= b),

        // Bitwise.
        V128Not => {
            let a = ex.simd_pop();
            ex.simd_push(!a)?;
        }
        V128And => {
            let b = ex.simd_pop();
            let a = ex.simd_pop();
            ex.simd_push(a & b)?;
        }
        V128AndNot => {
            let b = ex.simd_pop();
            let a = ex.simd_pop();
            ex.simd_push(a & !b)?;
        }
        V128Or => {
            let b = ex.simd_pop();
            let a = ex.simd_pop();
            ex.simd_push(a | b)?;
        }
        V128Xor => {
            let b = ex.simd_pop();
            let a = ex.simd_pop();
            ex.simd_push(a ^ b)?;
        }
        V128Bitselect => {
            let c = ex.simd_pop();
            let b = ex.simd_pop();
            let a = ex.simd_pop();
            ex.simd_push((a & c) | (b & !c))?;
        }
        V128AnyTrue => {
            let a = ex.simd_pop();
            ex.simd_push_u32(u32::from(a != 0));
        }

        // Lane tests.
        I8x16AllTrue => {
            let a = V128(ex.simd_pop()).u8x16();
            ex.simd_push_u32(u32::from(a.iter().all(|&l| l != 0)));
        }
        I16x8AllTrue => {
            let a = V128(ex.simd_pop()).u16x8();
            ex.simd_push_u32(u32::from(a.iter().all(|&l| l != 0)));
        }
        I32x4AllTrue => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push_u32(u32::from(a.iter().all(|&l| l != 0)));
        }
        I64x2AllTrue => {
            let a = V128(ex.simd_pop()).u64x2();
            ex.simd_push_u32(u32::from(a.iter().all(|&l| l != 0)));
        }
        I8x16Bitmask => {
            let a = V128(ex.simd_pop()).u8x16();
            let mut m = 0u32;
            for (i, &l) in a.iter().enumerate() {
                m |= u32::from(l >> 7) << i;
            }
            ex.simd_push_u32(m);
        }
        I16x8Bitmask => {
            let a = V128(ex.simd_pop()).u16x8();
            let mut m = 0u32;
            for (i, &l) in a.iter().enumerate() {
                m |= u32::from(l >> 15) << i;
            }
            ex.simd_push_u32(m);
        }
        I32x4Bitmask => {
            let a = V128(ex.simd_pop()).u32x4();
            let mut m = 0u32;
            for (i, &l) in a.iter().enumerate() {
                m |= (l >> 31) << i;
            }
            ex.simd_push_u32(m);
        }
        I64x2Bitmask => {
            let a = V128(ex.simd_pop()).u64x2();
            let mut m = 0u32;
            for (i, &l) in a.iter().enumerate() {
                m |= ((l >> 63) as u32) << i;
            }
            ex.simd_push_u32(m);
        }

        // Narrowing and widening.
        I8x16NarrowI16x8S | I8x16NarrowI16x8U => {
            let b = V128(ex.simd_pop()).u16x8();
            let a = V128(ex.simd_pop()).u16x8();
            let mut out = [0u8; 16];
            for i in 0..16 {
                let lane = if i < 8 { a[i] } else { b[i - 8] } as i16;
                out[i] = if instr.op == I8x16NarrowI16x8S {
                    lane.clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8
                } else {
                    lane.clamp(0, u8::MAX as i16) as u8
                };
            }
            ex.simd_push(V128::from_u8x16(out).0)?;
        }
        I16x8NarrowI32x4S | I16x8NarrowI32x4U => {
            let b = V128(ex.simd_pop()).u32x4();
            let a = V128(ex.simd_pop()).u32x4();
            let mut out = [0u16; 8];
            for i in 0..8 {
                let lane = if i < 4 { a[i] } else { b[i - 4] } as i32;
                out[i] = if instr.op == I16x8NarrowI32x4S {
                    lane.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16
                } else {
                    lane.clamp(0, u16::MAX as i32) as u16
                };
            }
            ex.simd_push(V128::from_u16x8(out).0)?;
        }
        I16x8ExtendLowI8x16S | I16x8ExtendHighI8x16S | I16x8ExtendLowI8x16U
        | I16x8ExtendHighI8x16U => {
            let a = V128(ex.simd_pop()).u8x16();
            let base = if matches!(instr.op, I16x8ExtendHighI8x16S | I16x8ExtendHighI8x16U)
            {
                8
            } else {
                0
            };
            let signed =
                matches!(instr.op, I16x8ExtendLowI8x16S | I16x8ExtendHighI8x16S);
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = if signed {
                    a[base + i] as i8 as i16 as u16
                } else {
                    a[base + i] as u16
                };
            }
            ex.simd_push(V128::from_u16x8(out).0)?;
        }
        I32x4ExtendLowI16x8S | I32x4ExtendHighI16x8S | I32x4ExtendLowI16x8U
        | I32x4ExtendHighI16x8U => {
            let a = V128(ex.simd_pop()).u16x8();
            let base = if matches!(instr.op, I32x4ExtendHighI16x8S | I32x4ExtendHighI16x8U)
            {
                4
            } else {
                0
            };
            let signed =
                matches!(instr.op, I32x4ExtendLowI16x8S | I32x4ExtendHighI16x8S);
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = if signed {
                    a[base + i] as i16 as i32 as u32
                } else {
                    a[base + i] as u32
                };
            }
            ex.simd_push(V128::from_u32x4(out).0)?;
        }
        I64x2ExtendLowI32x4S | I64x2ExtendHighI32x4S | I64x2ExtendLowI32x4U
        | I64x2ExtendHighI32x4U => {
            let a = V128(ex.simd_pop()).u32x4();
            let base = if matches!(instr.op, I64x2ExtendHighI32x4S | I64x2ExtendHighI32x4U)
            {
                2
            } else {
                0
            };
            let signed =
                matches!(instr.op, I64x2ExtendLowI32x4S | I64x2ExtendHighI32x4S);
            let mut out = [0u64; 2];
            for i in 0..2 {
                out[i] = if signed {
                    a[base + i] as i32 as i64 as u64
                } else {
                    a[base + i] as u64
                };
            }
            ex.simd_push(V128::from_u64x2(out).0)?;
        }
        I16x8ExtAddPairwiseI8x16S | I16x8ExtAddPairwiseI8x16U => {
            let a = V128(ex.simd_pop()).u8x16();
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = if instr.op == I16x8ExtAddPairwiseI8x16S {
                    ((a[2 * i] as i8 as i16) + (a[2 * i + 1] as i8 as i16)) as u16
                } else {
                    (a[2 * i] as u16) + (a[2 * i + 1] as u16)
                };
            }
            ex.simd_push(V128::from_u16x8(out).0)?;
        }
        I32x4ExtAddPairwiseI16x8S | I32x4ExtAddPairwiseI16x8U => {
            let a = V128(ex.simd_pop()).u16x8();
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = if instr.op == I32x4ExtAddPairwiseI16x8S {
                    ((a[2 * i] as i16 as i32) + (a[2 * i + 1] as i16 as i32)) as u32
                } else {
                    (a[2 * i] as u32) + (a[2 * i + 1] as u32)
                };
            }
            ex.simd_push(V128::from_u32x4(out).0)?;
        }

        // Integer lane arithmetic.
        I8x16Abs => un8!(ex, |l| (l as i8).wrapping_abs() as u8),
        I8x16Neg => un8!(ex, |l| (l as i8).wrapping_neg() as u8),
        I8x16Popcnt => un8!(ex, |l: u8| l.count_ones() as u8),
        I8x16Shl => shift!(ex, 8, u8x16, from_u8x16, |l: u8, c| l.wrapping_shl(c)),
        I8x16ShrS => {
            shift!(ex, 8, u8x16, from_u8x16, |l: u8, c| ((l as i8) >> c) as u8)
        }
        I8x16ShrU => shift!(ex, 8, u8x16, from_u8x16, |l: u8, c| l >> c),
        I8x16Add => bin8!(ex, u8::wrapping_add),
        I8x16AddSatS => bin8!(ex, |a, b| (a as i8).saturating_add(b as i8) as u8),
        I8x16AddSatU => bin8!(ex, u8::saturating_add),
        I8x16Sub => bin8!(ex, u8::wrapping_sub),
        I8x16SubSatS => bin8!(ex, |a, b| (a as i8).saturating_sub(b as i8) as u8),
        I8x16SubSatU => bin8!(ex, u8::saturating_sub),
        I8x16MinS => bin8!(ex, |a, b| (a as i8).min(b as i8) as u8),
        I8x16MinU => bin8!(ex, |a: u8, b: u8| a.min(b)),
        I8x16MaxS => bin8!(ex, |a, b| (a as i8).max(b as i8) as u8),
        I8x16MaxU => bin8!(ex, |a: u8, b: u8| a.max(b)),
        I8x16AvgrU => bin8!(ex, |a, b| ((a as u16 + b as u16 + 1) / 2) as u8),

        I16x8Abs => {
            let a = V128(ex.simd_pop()).u16x8();
            ex.simd_push(V128::from_u16x8(a.map(|l| (l as i16).wrapping_abs() as u16)).0)?;
        }
        I16x8Neg => {
            let a = V128(ex.simd_pop()).u16x8();
            ex.simd_push(V128::from_u16x8(a.map(|l| (l as i16).wrapping_neg() as u16)).0)?;
        }
        I16x8Q15MulrSatS => bin16!(ex, |a, b| {
            let product = (a as i16 as i32) * (b as i16 as i32);
            (((product + 0x4000) >> 15).clamp(i16::MIN as i32, i16::MAX as i32)) as i16
                as u16
        }),
        I16x8Shl => {
            shift!(ex, 16, u16x8, from_u16x8, |l: u16, c| l.wrapping_shl(c))
        }
        I16x8ShrS => {
            shift!(ex, 16, u16x8, from_u16x8, |l: u16, c| ((l as i16) >> c) as u16)
        }
        I16x8ShrU => shift!(ex, 16, u16x8, from_u16x8, |l: u16, c| l >> c),
        I16x8Add => bin16!(ex, u16::wrapping_add),
        I16x8AddSatS => bin16!(ex, |a, b| (a as i16).saturating_add(b as i16) as u16),
        I16x8AddSatU => bin16!(ex, u16::saturating_add),
        I16x8Sub => bin16!(ex, u16::wrapping_sub),
        I16x8SubSatS => bin16!(ex, |a, b| (a as i16).saturating_sub(b as i16) as u16),
        I16x8SubSatU => bin16!(ex, u16::saturating_sub),
        I16x8Mul => bin16!(ex, u16::wrapping_mul),
        I16x8MinS => bin16!(ex, |a, b| (a as i16).min(b as i16) as u16),
        I16x8MinU => bin16!(ex, |a: u16, b: u16| a.min(b)),
        I16x8MaxS => bin16!(ex, |a, b| (a as i16).max(b as i16) as u16),
        I16x8MaxU => bin16!(ex, |a: u16, b: u16| a.max(b)),
        I16x8AvgrU => bin16!(ex, |a, b| ((a as u32 + b as u32 + 1) / 2) as u16),
        I16x8ExtMulLowI8x16S | I16x8ExtMulHighI8x16S | I16x8ExtMulLowI8x16U
        | I16x8ExtMulHighI8x16U => {
            let b = V128(ex.simd_pop()).u8x16();
            let a = V128(ex.simd_pop()).u8x16();
            let base = if matches!(instr.op, I16x8ExtMulHighI8x16S | I16x8ExtMulHighI8x16U)
            {
                8
            } else {
                0
            };
            let signed = matches!(instr.op, I16x8ExtMulLowI8x16S | I16x8ExtMulHighI8x16S);
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = if signed {
                    ((a[base + i] as i8 as i16) * (b[base + i] as i8 as i16)) as u16
                } else {
                    (a[base + i] as u16) * (b[base + i] as u16)
                };
            }
            ex.simd_push(V128::from_u16x8(out).0)?;
        }

        I32x4Abs => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push(V128::from_u32x4(a.map(|l| (l as i32).wrapping_abs() as u32)).0)?;
        }
        I32x4Neg => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push(V128::from_u32x4(a.map(|l| (l as i32).wrapping_neg() as u32)).0)?;
        }
        I32x4Shl => {
            shift!(ex, 32, u32x4, from_u32x4, |l: u32, c| l.wrapping_shl(c))
        }
        I32x4ShrS => {
            shift!(ex, 32, u32x4, from_u32x4, |l: u32, c| ((l as i32) >> c) as u32)
        }
        I32x4ShrU => shift!(ex, 32, u32x4, from_u32x4, |l: u32, c| l >> c),
        I32x4Add => bin32!(ex, u32::wrapping_add),
        I32x4Sub => bin32!(ex, u32::wrapping_sub),
        I32x4Mul => bin32!(ex, u32::wrapping_mul),
        I32x4MinS => bin32!(ex, |a, b| (a as i32).min(b as i32) as u32),
        I32x4MinU => bin32!(ex, |a: u32, b: u32| a.min(b)),
        I32x4MaxS => bin32!(ex, |a, b| (a as i32).max(b as i32) as u32),
        I32x4MaxU => bin32!(ex, |a: u32, b: u32| a.max(b)),
        I32x4DotI16x8S => {
            let b = V128(ex.simd_pop()).u16x8();
            let a = V128(ex.simd_pop()).u16x8();
            let mut out = [0u32; 4];
            for i in 0..4 {
                let p0 = (a[2 * i] as i16 as i32) * (b[2 * i] as i16 as i32);
                let p1 = (a[2 * i + 1] as i16 as i32) * (b[2 * i + 1] as i16 as i32);
                out[i] = p0.wrapping_add(p1) as u32;
            }
            ex.simd_push(V128::from_u32x4(out).0)?;
        }
        I32x4ExtMulLowI16x8S | I32x4ExtMulHighI16x8S | I32x4ExtMulLowI16x8U
        | I32x4ExtMulHighI16x8U => {
            let b = V128(ex.simd_pop()).u16x8();
            let a = V128(ex.simd_pop()).u16x8();
            let base = if matches!(instr.op, I32x4ExtMulHighI16x8S | I32x4ExtMulHighI16x8U)
            {
                4
            } else {
                0
            };
            let signed = matches!(instr.op, I32x4ExtMulLowI16x8S | I32x4ExtMulHighI16x8S);
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = if signed {
                    ((a[base + i] as i16 as i32) * (b[base + i] as i16 as i32)) as u32
                } else {
                    (a[base + i] as u32) * (b[base + i] as u32)
                };
            }
            ex.simd_push(V128::from_u32x4(out).0)?;
        }

        I64x2Abs => {
            let a = V128(ex.simd_pop()).u64x2();
            ex.simd_push(V128::from_u64x2(a.map(|l| (l as i64).wrapping_abs() as u64)).0)?;
        }
        I64x2Neg => {
            let a = V128(ex.simd_pop()).u64x2();
            ex.simd_push(V128::from_u64x2(a.map(|l| (l as i64).wrapping_neg() as u64)).0)?;
        }
        I64x2Shl => {
            shift!(ex, 64, u64x2, from_u64x2, |l: u64, c| l.wrapping_shl(c))
        }
        I64x2ShrS => {
            shift!(ex, 64, u64x2, from_u64x2, |l: u64, c| ((l as i64) >> c) as u64)
        }
        I64x2ShrU => shift!(ex, 64, u64x2, from_u64x2, |l: u64, c| l >> c),
        I64x2Add => bin64!(ex, u64::wrapping_add),
        I64x2Sub => bin64!(ex, u64::wrapping_sub),
        I64x2Mul => bin64!(ex, u64::wrapping_mul),
        I64x2ExtMulLowI32x4S | I64x2ExtMulHighI32x4S | I64x2ExtMulLowI32x4U
        | I64x2ExtMulHighI32x4U => {
            let b = V128(ex.simd_pop()).u32x4();
            let a = V128(ex.simd_pop()).u32x4();
            let base = if matches!(instr.op, I64x2ExtMulHighI32x4S | I64x2ExtMulHighI32x4U)
            {
                2
            } else {
                0
            };
            let signed = matches!(instr.op, I64x2ExtMulLowI32x4S | I64x2ExtMulHighI32x4S);
            let mut out = [0u64; 2];
            for i in 0..2 {
                out[i] = if signed {
                    ((a[base + i] as i32 as i64) * (b[base + i] as i32 as i64)) as u64
                } else {
                    (a[base + i] as u64) * (b[base + i] as u64)
                };
            }
            ex.simd_push(V128::from_u64x2(out).0)?;
        }

        // Float lane arithmetic.
        F32x4Abs => fun32!(ex, f32::abs),
        F32x4Neg => fun32!(ex, |l: f32| -l),
        F32x4Sqrt => fun32!(ex, f32::sqrt),
        F32x4Ceil => fun32!(ex, f32::ceil),
        F32x4Floor => fun32!(ex, f32::floor),
        F32x4Trunc => fun32!(ex, f32::trunc),
        F32x4Nearest => fun32!(ex, f32::round_ties_even),
        F32x4Add => fbin32!(ex, |a, b| a + b),
        F32x4Sub => fbin32!(ex, |a, b| a - b),
        F32x4Mul => fbin32!(ex, |a, b| a * b),
        F32x4Div => fbin32!(ex, |a, b| a / b),
        F32x4Min => fbin32!(ex, super::stack::wasm_fmin32),
        F32x4Max => fbin32!(ex, super::stack::wasm_fmax32),
        F32x4Pmin => fbin32!(ex, |a, b| if b < a { b } else { a }),
        F32x4Pmax => fbin32!(ex, |a, b| if a < b { b } else { a }),
        F64x2Abs => fun64!(ex, f64::abs),
        F64x2Neg => fun64!(ex, |l: f64| -l),
        F64x2Sqrt => fun64!(ex, f64::sqrt),
        F64x2Ceil => fun64!(ex, f64::ceil),
        F64x2Floor => fun64!(ex, f64::floor),
        F64x2Trunc => fun64!(ex, f64::trunc),
        F64x2Nearest => fun64!(ex, f64::round_ties_even),
        F64x2Add => fbin64!(ex, |a, b| a + b),
        F64x2Sub => fbin64!(ex, |a, b| a - b),
        F64x2Mul => fbin64!(ex, |a, b| a * b),
        F64x2Div => fbin64!(ex, |a, b| a / b),
        F64x2Min => fbin64!(ex, super::stack::wasm_fmin64),
        F64x2Max => fbin64!(ex, super::stack::wasm_fmax64),
        F64x2Pmin => fbin64!(ex, |a, b| if b < a { b } else { a }),
        F64x2Pmax => fbin64!(ex, |a, b| if a < b { b } else { a }),

        // Conversions.
        I32x4TruncSatF32x4S => {
            let a = V128(ex.simd_pop()).f32x4();
            ex.simd_push(V128::from_u32x4(a.map(|l| sat_i32_s(l as f64) as u32)).0)?;
        }
        I32x4TruncSatF32x4U => {
            let a = V128(ex.simd_pop()).f32x4();
            ex.simd_push(V128::from_u32x4(a.map(|l| sat_i32_u(l as f64))).0)?;
        }
        F32x4ConvertI32x4S => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push(V128::from_f32x4(a.map(|l| l as i32 as f32)).0)?;
        }
        F32x4ConvertI32x4U => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push(V128::from_f32x4(a.map(|l| l as f32)).0)?;
        }
        I32x4TruncSatF64x2SZero => {
            let a = V128(ex.simd_pop()).f64x2();
            let out = [sat_i32_s(a[0]) as u32, sat_i32_s(a[1]) as u32, 0, 0];
            ex.simd_push(V128::from_u32x4(out).0)?;
        }
        I32x4TruncSatF64x2UZero => {
            let a = V128(ex.simd_pop()).f64x2();
            let out = [sat_i32_u(a[0]), sat_i32_u(a[1]), 0, 0];
            ex.simd_push(V128::from_u32x4(out).0)?;
        }
        F64x2ConvertLowI32x4S => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push(V128::from_f64x2([a[0] as i32 as f64, a[1] as i32 as f64]).0)?;
        }
        F64x2ConvertLowI32x4U => {
            let a = V128(ex.simd_pop()).u32x4();
            ex.simd_push(V128::from_f64x2([a[0] as f64, a[1] as f64]).0)?;
        }
        F32x4DemoteF64x2Zero => {
            let a = V128(ex.simd_pop()).f64x2();
            ex.simd_push(V128::from_f32x4([a[0] as f32, a[1] as f32, 0.0, 0.0]).0)?;
        }
        F64x2PromoteLowF32x4 => {
            let a = V128(ex.simd_pop()).f32x4();
            ex.simd_push(V128::from_f64x2([a[0] as f64, a[1] as f64]).0)?;
        }

        _ => return Err(TrapReason::UnknownTrapReason.into()),
    }
    Ok(())
}
