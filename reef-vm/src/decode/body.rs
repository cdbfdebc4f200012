//! The shared function-body instruction walk.
//!
//! The validator and the predecoder both traverse raw bodies through
//! [`InstrReader`], so immediate parsing exists exactly once. The reader
//! yields the packed [`Op`] plus a decoded [`Imm`]; neither caller ever
//! touches raw bytes.

use reef_asm::{BlockTypeRepr, Op, OperandKind};
use reef_types::{HeapType, ValType};

use crate::error::VmError;

use super::Reader;

/// Decoded immediates of one instruction.
#[derive(Debug, Clone)]
pub enum Imm {
    /// No immediates.
    None,
    /// Block signature.
    Block(BlockTypeRepr),
    /// One index or label.
    U32(u32),
    /// Two indices.
    U32x2(u32, u32),
    /// i32 constant.
    I32(i32),
    /// i64 constant.
    I64(i64),
    /// f32 constant, by bits.
    F32(u32),
    /// f64 constant, by bits.
    F64(u64),
    /// Memory immediate.
    Mem {
        /// log2 alignment.
        align: u32,
        /// Static offset.
        offset: u64,
        /// Memory index.
        mem: u32,
    },
    /// Memory immediate plus lane.
    MemLane {
        /// log2 alignment.
        align: u32,
        /// Static offset.
        offset: u64,
        /// Memory index.
        mem: u32,
        /// Lane index.
        lane: u8,
    },
    /// Lane index.
    Lane(u8),
    /// 16 immediate bytes.
    Bytes16([u8; 16]),
    /// `br_table` targets plus default.
    BrTable {
        /// Branch targets.
        targets: Vec<u32>,
        /// Default target.
        default: u32,
    },
    /// Heap type.
    Heap(HeapType),
    /// `br_on_cast` immediates.
    CastPair {
        /// Bit 0: source nullable; bit 1: target nullable.
        flags: u8,
        /// Source heap type.
        from: HeapType,
        /// Target heap type.
        to: HeapType,
        /// Branch label.
        label: u32,
    },
    /// `select t` type annotation.
    SelectT(Vec<ValType>),
    /// `try_table` header.
    TryTable {
        /// Block signature.
        block: BlockTypeRepr,
        /// Catch clauses, in match order.
        catches: Vec<Catch>,
    },
    /// One raw byte.
    Byte(u8),
}

/// One catch clause of a `try_table`.
#[derive(Debug, Clone, Copy)]
pub enum Catch {
    /// `catch tag label`: push the unpacked payload.
    One {
        /// Matched tag.
        tag: u32,
        /// Branch label.
        label: u32,
    },
    /// `catch_ref tag label`: push payload then exnref.
    OneRef {
        /// Matched tag.
        tag: u32,
        /// Branch label.
        label: u32,
    },
    /// `catch_all label`.
    All {
        /// Branch label.
        label: u32,
    },
    /// `catch_all_ref label`: push the exnref.
    AllRef {
        /// Branch label.
        label: u32,
    },
}

impl Catch {
    /// The clause's branch label.
    pub const fn label(self) -> u32 {
        match self {
            Self::One { label, .. }
            | Self::OneRef { label, .. }
            | Self::All { label }
            | Self::AllRef { label } => label,
        }
    }
}

/// Streaming instruction reader over one function body.
#[derive(Debug, Clone)]
pub struct InstrReader<'a> {
    r: Reader<'a>,
}

impl<'a> InstrReader<'a> {
    /// Walk the given body window of a module image.
    pub fn new(image: &'a [u8], body: core::ops::Range<usize>) -> Result<Self, VmError> {
        if body.end > image.len() || body.start > body.end {
            return Err(VmError::InvalidWasm("function body out of range"));
        }
        let mut r = Reader::new(image);
        r.skip(body.start)?;
        Ok(Self { r: r.sub_reader(body.end - body.start)? })
    }

    /// Absolute byte offset of the next instruction.
    pub fn pos(&self) -> usize {
        self.r.pos()
    }

    /// Whether the body is exhausted.
    pub fn done(&self) -> bool {
        self.r.is_empty()
    }

    /// Read one instruction.
    pub fn next(&mut self) -> Result<(Op, Imm), VmError> {
        let byte = self.r.u8()?;
        let op = match byte {
            reef_asm::GC_PREFIX
            | reef_asm::MISC_PREFIX
            | reef_asm::SIMD_PREFIX
            | reef_asm::ATOMIC_PREFIX => {
                let sub = self.r.u32_leb()?;
                Op::from_parts(byte, sub)
                    .ok_or(VmError::InvalidWasm("unknown prefixed opcode"))?
            }
            _ => Op::from_packed(u16::from(byte))
                .ok_or(VmError::InvalidWasm("unknown opcode"))?,
        };
        let imm = self.immediates(op)?;
        Ok((op, imm))
    }

    fn immediates(&mut self, op: Op) -> Result<Imm, VmError> {
        let r = &mut self.r;
        Ok(match op.operands() {
            OperandKind::None => Imm::None,
            OperandKind::BlockType => Imm::Block(block_type(r)?),
            OperandKind::U32 => Imm::U32(r.u32_leb()?),
            OperandKind::U32x2 => {
                let a = r.u32_leb()?;
                let b = r.u32_leb()?;
                Imm::U32x2(a, b)
            }
            OperandKind::I32Imm => Imm::I32(r.i32_leb()?),
            OperandKind::I64Imm => Imm::I64(r.i64_leb()?),
            OperandKind::F32Imm => Imm::F32(r.f32_bits()?),
            OperandKind::F64Imm => Imm::F64(r.f64_bits()?),
            OperandKind::MemArg => {
                let (align, offset, mem) = memarg(r)?;
                Imm::Mem { align, offset, mem }
            }
            OperandKind::MemArgLane => {
                let (align, offset, mem) = memarg(r)?;
                let lane = r.u8()?;
                Imm::MemLane { align, offset, mem, lane }
            }
            OperandKind::Lane => Imm::Lane(r.u8()?),
            OperandKind::Bytes16 => Imm::Bytes16(r.bytes_exact::<16>()?),
            OperandKind::BrTable => {
                let count = r.u32_leb()?;
                if count > crate::consts::MAX_BR_TABLE_TARGETS {
                    return Err(VmError::InvalidWasm("br_table too large"));
                }
                let mut targets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    targets.push(r.u32_leb()?);
                }
                let default = r.u32_leb()?;
                Imm::BrTable { targets, default }
            }
            OperandKind::HeapType => Imm::Heap(r.heap_type()?),
            OperandKind::CastPair => {
                let flags = r.u8()?;
                if flags > 0x03 {
                    return Err(VmError::InvalidWasm("bad cast flags"));
                }
                let label = r.u32_leb()?;
                let from = r.heap_type()?;
                let to = r.heap_type()?;
                Imm::CastPair { flags, from, to, label }
            }
            OperandKind::SelectT => {
                let count = r.u32_leb()?;
                if count != 1 {
                    return Err(VmError::InvalidWasm("select arity must be 1"));
                }
                Imm::SelectT(vec![r.val_type()?])
            }
            OperandKind::TryTable => {
                let block = block_type(r)?;
                let count = r.u32_leb()?;
                let mut catches = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let kind = r.u8()?;
                    let catch = match kind {
                        0x00 => Catch::One { tag: r.u32_leb()?, label: r.u32_leb()? },
                        0x01 => Catch::OneRef { tag: r.u32_leb()?, label: r.u32_leb()? },
                        0x02 => Catch::All { label: r.u32_leb()? },
                        0x03 => Catch::AllRef { label: r.u32_leb()? },
                        _ => return Err(VmError::InvalidWasm("unknown catch kind")),
                    };
                    catches.push(catch);
                }
                Imm::TryTable { block, catches }
            }
            OperandKind::Byte => Imm::Byte(r.u8()?),
        })
    }
}

fn block_type(r: &mut Reader<'_>) -> Result<BlockTypeRepr, VmError> {
    // Empty (0x40) and single-value block types share the s33 space with
    // function-type indices; peek the byte to disambiguate the shorthands.
    let lead = r.clone().u8()?;
    if lead == 0x40 {
        r.u8()?;
        return Ok(BlockTypeRepr::Empty);
    }
    if matches!(lead, 0x7B..=0x7F | 0x63 | 0x64 | 0x69..=0x74) {
        return Ok(BlockTypeRepr::Val(r.val_type()?));
    }
    let value = r.s33_leb()?;
    if value < 0 {
        return Err(VmError::InvalidWasm("bad block type"));
    }
    Ok(BlockTypeRepr::Func(value as u32))
}

fn memarg(r: &mut Reader<'_>) -> Result<(u32, u64, u32), VmError> {
    let align = r.u32_leb()?;
    let mem = if align & 0x40 != 0 { r.u32_leb()? } else { 0 };
    let offset = r.u64_leb()?;
    Ok((align & !0x40, offset, mem))
}
