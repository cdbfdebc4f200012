//! The predecoder: raw bytecode to fixed-width IR.
//!
//! Runs once per function, on first call. Every Wasm instruction becomes one
//! or more 8-byte [`Instr`] records: block signatures collapse to arities,
//! branch labels resolve to absolute record PCs via a back-patching pass,
//! i64/f64/v128 immediates move into a per-function constant pool, and a
//! handful of frequent two-instruction shapes fuse into superinstructions.
//!
//! Record conventions consumed by the stack interpreter:
//!
//! - `Block`/`If`/`TryTable`: `extra` = result arity, followed by one `Aux`
//!   whose operand is the post-`end` PC (the label target). `If` itself
//!   carries the false-branch PC in `operand`.
//! - `Loop`: `extra` = parameter arity; its own PC is the label target.
//! - `Else`: `operand` = the PC of the matching `End`.
//! - `Br`/`BrIf`/`BrOnNull`/`BrOnNonNull`: `extra` = label depth,
//!   `operand` = resolved target PC.
//! - `BrTable`: `operand` = entry count, followed by that many `Aux`
//!   records, each `extra` = depth and `operand` = target PC (default last).
//! - `TryTable`: `operand` = index into the function's try-table array.
//! - Loads/stores: `operand` = static offset, `extra` = memory index, with
//!   bit 15 flagging a pooled 64-bit offset.
//! - `CallIndirect`/`ReturnCallIndirect`: `operand` = global type id,
//!   `extra` = table index.

use std::sync::Arc;

use reef_asm::{BlockTypeRepr, Instr, Op};
use reef_types::{TypeId, ValType};

use crate::decode::{Catch, Imm, InstrReader};
use crate::error::VmError;
use crate::module::{FuncDef, Module};

/// Offset-extra flag: the operand is a pool index holding a 64-bit offset.
pub const MEM_OFFSET_POOLED: u16 = 0x8000;

/// Memory-index mask of a load/store record's extra.
pub const MEM_INDEX_MASK: u16 = 0x7FFF;

/// One resolved catch clause of a `try_table`.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedCatch {
    /// Module-local tag index, or `None` for the catch_all forms.
    pub tag: Option<u32>,
    /// Whether the clause pushes the exnref after the payload.
    pub with_ref: bool,
    /// Labels to pop when taking this clause, counting the try block itself.
    pub pop_labels: u32,
    /// Absolute target PC, patched like a branch.
    pub target: u32,
}

/// One `try_table`'s clause list.
#[derive(Debug, Clone, Default)]
pub struct TryTableInfo {
    /// Clauses in match order.
    pub clauses: Vec<ResolvedCatch>,
}

/// A function body in predecoded form.
#[derive(Debug)]
pub struct PredecodedFunc {
    /// The record array.
    pub code: Vec<Instr>,
    /// 64-bit constant pool; v128 constants occupy two consecutive slots.
    pub pool: Vec<u64>,
    /// Types of params plus declared locals, module-local form.
    pub local_types: Vec<ValType>,
    /// Leading parameter count within `local_types`.
    pub param_count: usize,
    /// Result types.
    pub results: Vec<ValType>,
    /// Global id of the function's type.
    pub type_id: TypeId,
    /// `try_table` clause lists, indexed by record operand.
    pub try_tables: Vec<TryTableInfo>,
}

/// Predecode one function body.
pub fn predecode(module: &Module, def: &FuncDef) -> Result<Arc<PredecodedFunc>, VmError> {
    let ty = module
        .func_type(def.type_idx)
        .ok_or(VmError::InvalidWasm("function type out of range"))?;
    let mut local_types: Vec<ValType> = ty.params.clone();
    for &(n, local_ty) in &def.locals {
        local_types.extend(std::iter::repeat(local_ty).take(n as usize));
    }

    let mut p = Predecoder {
        module,
        code: Vec::new(),
        pool: Vec::new(),
        blocks: Vec::new(),
        try_tables: Vec::new(),
    };
    // The function body behaves as one implicit block.
    p.blocks.push(Pending {
        kind: Op::Block,
        header: 0,
        arity: ty.results.len(),
        code_patches: Vec::new(),
        catch_patches: Vec::new(),
    });

    let mut reader = InstrReader::new(&module.bytes, def.body.clone())?;
    while !p.blocks.is_empty() {
        if reader.done() {
            return Err(VmError::InvalidWasm("function body ended inside a block"));
        }
        let (op, imm) = reader.next()?;
        p.instr(op, imm)?;
    }

    Ok(Arc::new(PredecodedFunc {
        code: p.code,
        pool: p.pool,
        local_types,
        param_count: ty.params.len(),
        results: ty.results.clone(),
        type_id: module.global_type_id(def.type_idx),
        try_tables: p.try_tables,
    }))
}

struct Pending {
    kind: Op,
    /// Record PC of the control record itself.
    header: usize,
    /// Branch arity of the label (params for loop, results otherwise).
    arity: usize,
    /// Record slots to receive the post-end PC (Else slots receive the End
    /// PC instead).
    code_patches: Vec<usize>,
    /// `(table, clause)` slots to receive the post-end PC.
    catch_patches: Vec<(usize, usize)>,
}

struct Predecoder<'a> {
    module: &'a Module,
    code: Vec<Instr>,
    pool: Vec<u64>,
    blocks: Vec<Pending>,
    try_tables: Vec<TryTableInfo>,
}

enum PatchSlot {
    Code(usize),
    Catch(usize, usize),
}

impl Predecoder<'_> {
    fn pc(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    fn pool_u64(&mut self, value: u64) -> u32 {
        if let Some(found) = self.pool.iter().position(|&v| v == value) {
            return found as u32;
        }
        self.pool.push(value);
        (self.pool.len() - 1) as u32
    }

    fn pool_v128(&mut self, value: u128) -> u32 {
        let index = self.pool.len() as u32;
        self.pool.push(value as u64);
        self.pool.push((value >> 64) as u64);
        index
    }

    fn block_arity(&self, repr: BlockTypeRepr) -> Result<(usize, usize), VmError> {
        Ok(match repr {
            BlockTypeRepr::Empty => (0, 0),
            BlockTypeRepr::Val(_) => (0, 1),
            BlockTypeRepr::Func(idx) => {
                let ft = self
                    .module
                    .func_type(idx)
                    .ok_or(VmError::InvalidWasm("block type out of range"))?;
                (ft.params.len(), ft.results.len())
            }
        })
    }

    /// Resolve a label: loops resolve immediately to their header PC,
    /// everything else registers `slot` for back-patching at the matching
    /// `end`.
    fn resolve_label(&mut self, depth: u32, slot: PatchSlot) -> Result<Option<u32>, VmError> {
        let index = self
            .blocks
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(VmError::InvalidWasm("branch label out of range"))?;
        let block = &mut self.blocks[index];
        if block.kind == Op::Loop {
            return Ok(Some(block.header as u32));
        }
        match slot {
            PatchSlot::Code(pc) => block.code_patches.push(pc),
            PatchSlot::Catch(table, clause) => block.catch_patches.push((table, clause)),
        }
        Ok(None)
    }

    fn emit_branch(&mut self, op: Op, depth: u32) -> Result<(), VmError> {
        let pc = self.pc();
        self.emit(Instr { op, extra: depth as u16, operand: 0 });
        if let Some(target) = self.resolve_label(depth, PatchSlot::Code(pc))? {
            self.code[pc].operand = target;
        }
        Ok(())
    }

    fn instr(&mut self, op: Op, imm: Imm) -> Result<(), VmError> {
        use Op::*;
        match op {
            Block => {
                let Imm::Block(repr) = imm else { return Err(err_imm()) };
                let (params, results) = self.block_arity(repr)?;
                let header = self.pc();
                self.emit(Instr { op, extra: results as u16, operand: 0 });
                self.emit(Instr::aux(params as u16, 0));
                self.blocks.push(Pending {
                    kind: Block,
                    header,
                    arity: results,
                    code_patches: vec![header + 1],
                    catch_patches: Vec::new(),
                });
            }
            Loop => {
                let Imm::Block(repr) = imm else { return Err(err_imm()) };
                let (params, _) = self.block_arity(repr)?;
                let header = self.pc();
                self.emit(Instr { op, extra: params as u16, operand: 0 });
                self.blocks.push(Pending {
                    kind: Loop,
                    header,
                    arity: params,
                    code_patches: Vec::new(),
                    catch_patches: Vec::new(),
                });
            }
            If => {
                let Imm::Block(repr) = imm else { return Err(err_imm()) };
                let (params, results) = self.block_arity(repr)?;
                let header = self.pc();
                self.emit(Instr { op, extra: results as u16, operand: 0 });
                self.emit(Instr::aux(params as u16, 0));
                self.blocks.push(Pending {
                    kind: If,
                    header,
                    arity: results,
                    code_patches: vec![header + 1],
                    catch_patches: Vec::new(),
                });
            }
            Else => {
                let else_pc = self.pc();
                let block = self
                    .blocks
                    .last_mut()
                    .ok_or(VmError::InvalidWasm("else outside if"))?;
                if block.kind != If {
                    return Err(VmError::InvalidWasm("else outside if"));
                }
                block.kind = Else;
                let header = block.header;
                // Falling out of the then-branch jumps to the matching end;
                // patched there.
                block.code_patches.push(else_pc);
                self.emit(Instr { op, extra: 0, operand: 0 });
                // The false branch of the if lands just after the else.
                self.code[header].operand = (else_pc + 1) as u32;
            }
            End => {
                let block = self
                    .blocks
                    .pop()
                    .ok_or(VmError::InvalidWasm("unbalanced end"))?;
                let end_pc = self.pc();
                self.emit(Instr::plain(End));
                let post_end = self.pc() as u32;
                if block.kind == If {
                    // No else: the false branch falls to the End record so
                    // the label still pops.
                    self.code[block.header].operand = end_pc as u32;
                }
                for pc in block.code_patches {
                    self.code[pc].operand = if self.code[pc].op == Else {
                        end_pc as u32
                    } else {
                        post_end
                    };
                }
                for (table, clause) in block.catch_patches {
                    self.try_tables[table].clauses[clause].target = post_end;
                }
            }
            TryTable => {
                let Imm::TryTable { block, catches } = imm else { return Err(err_imm()) };
                let (params, results) = self.block_arity(block)?;
                let header = self.pc();
                let table_index = self.try_tables.len();
                self.try_tables.push(TryTableInfo::default());
                self.emit(Instr { op, extra: results as u16, operand: table_index as u32 });
                self.emit(Instr::aux(params as u16, 0));
                self.blocks.push(Pending {
                    kind: TryTable,
                    header,
                    arity: results,
                    code_patches: vec![header + 1],
                    catch_patches: Vec::new(),
                });
                for (clause_index, catch) in catches.iter().enumerate() {
                    let (tag, with_ref, depth) = match *catch {
                        Catch::One { tag, label } => (Some(tag), false, label),
                        Catch::OneRef { tag, label } => (Some(tag), true, label),
                        Catch::All { label } => (None, false, label),
                        Catch::AllRef { label } => (None, true, label),
                    };
                    // Clause labels are relative to the context enclosing
                    // the try_table, which our block stack now nests one
                    // deeper.
                    let depth = depth + 1;
                    self.try_tables[table_index].clauses.push(ResolvedCatch {
                        tag,
                        with_ref,
                        pop_labels: depth + 1,
                        target: 0,
                    });
                    if let Some(target) = self
                        .resolve_label(depth, PatchSlot::Catch(table_index, clause_index))?
                    {
                        self.try_tables[table_index].clauses[clause_index].target = target;
                    }
                }
            }

            Br | BrIf | BrOnNull | BrOnNonNull => {
                let Imm::U32(depth) = imm else { return Err(err_imm()) };
                self.emit_branch(op, depth)?;
            }
            BrTable => {
                let Imm::BrTable { targets, default } = imm else { return Err(err_imm()) };
                self.emit(Instr { op, extra: 0, operand: (targets.len() + 1) as u32 });
                for depth in targets.iter().copied().chain(std::iter::once(default)) {
                    let pc = self.pc();
                    self.emit(Instr::aux(depth as u16, 0));
                    if let Some(target) = self.resolve_label(depth, PatchSlot::Code(pc))? {
                        self.code[pc].operand = target;
                    }
                }
            }

            Call | ReturnCall | Throw | RefFunc => {
                let Imm::U32(index) = imm else { return Err(err_imm()) };
                self.emit(Instr::with_operand(op, index));
            }
            CallIndirect | ReturnCallIndirect => {
                let Imm::U32x2(ty, table) = imm else { return Err(err_imm()) };
                let id = self.module.global_type_id(ty);
                self.emit(Instr { op, extra: table as u16, operand: id.0 });
            }
            CallRef | ReturnCallRef => {
                let Imm::U32(ty) = imm else { return Err(err_imm()) };
                let id = self.module.global_type_id(ty);
                self.emit(Instr::with_operand(op, id.0));
            }

            I32Const => {
                let Imm::I32(value) = imm else { return Err(err_imm()) };
                if let Some(prev) = self.fusable_local_get() {
                    self.code.pop();
                    self.emit(Instr {
                        op: Op::LocalGetConst32,
                        extra: prev,
                        operand: value as u32,
                    });
                } else {
                    self.emit(Instr::with_operand(op, value as u32));
                }
            }
            I64Const => {
                let Imm::I64(value) = imm else { return Err(err_imm()) };
                let slot = self.pool_u64(value as u64);
                self.emit(Instr::with_operand(op, slot));
            }
            F32Const => {
                let Imm::F32(bits) = imm else { return Err(err_imm()) };
                self.emit(Instr::with_operand(op, bits));
            }
            F64Const => {
                let Imm::F64(bits) = imm else { return Err(err_imm()) };
                let slot = self.pool_u64(bits);
                self.emit(Instr::with_operand(op, slot));
            }

            LocalGet => {
                let Imm::U32(idx) = imm else { return Err(err_imm()) };
                if idx <= u16::MAX as u32 {
                    if let Some(prev) = self.fusable_local_get() {
                        self.code.pop();
                        self.emit(Instr { op: Op::LocalGetPair, extra: prev, operand: idx });
                        return Ok(());
                    }
                }
                self.emit(Instr::with_operand(op, idx));
            }
            LocalSet | LocalTee | GlobalGet | GlobalSet | TableGet | TableSet
            | MemorySize | MemoryGrow | MemoryFill | DataDrop | ElemDrop | TableGrow
            | TableSize | TableFill => {
                let Imm::U32(idx) = imm else { return Err(err_imm()) };
                self.emit(Instr::with_operand(op, idx));
            }
            MemoryInit | MemoryCopy | TableInit | TableCopy => {
                let Imm::U32x2(a, b) = imm else { return Err(err_imm()) };
                self.emit(Instr { op, extra: b as u16, operand: a });
            }

            RefNull | RefTest | RefTestNull | RefCast | RefCastNull => {
                let Imm::Heap(heap) = imm else { return Err(err_imm()) };
                let (tag, payload) = encode_heap(self.module, heap);
                self.emit(Instr { op, extra: tag, operand: payload });
            }
            BrOnCast | BrOnCastFail => {
                let Imm::CastPair { flags, from, to, label } = imm else {
                    return Err(err_imm())
                };
                self.emit_branch(op, label)?;
                let (from_tag, from_payload) = encode_heap(self.module, from);
                let (to_tag, to_payload) = encode_heap(self.module, to);
                self.emit(Instr::aux(from_tag | ((flags as u16) << 8), from_payload));
                self.emit(Instr::aux(to_tag, to_payload));
            }

            StructNew | StructNewDefault | ArrayNew | ArrayNewDefault | ArrayGet
            | ArrayGetS | ArrayGetU | ArraySet | ArrayFill => {
                let Imm::U32(ty) = imm else { return Err(err_imm()) };
                self.emit(Instr::with_operand(op, ty));
            }
            StructGet | StructGetS | StructGetU | StructSet | ArrayNewFixed
            | ArrayNewData | ArrayNewElem | ArrayCopy | ArrayInitData
            | ArrayInitElem => {
                let Imm::U32x2(a, b) = imm else { return Err(err_imm()) };
                self.emit(Instr { op, extra: b as u16, operand: a });
            }

            SelectT => {
                // The type annotation only matters to validation.
                self.emit(Instr::plain(Op::Select));
            }

            _ => match imm {
                Imm::None => {
                    if is_i32_compare(op) {
                        if let Some((l1, l2)) = self.fusable_local_pair() {
                            self.code.pop();
                            self.emit(Instr {
                                op: Op::I32CmpLocals,
                                extra: op.packed(),
                                operand: l1 | (l2 << 16),
                            });
                            return Ok(());
                        }
                    }
                    self.emit(Instr::plain(op));
                }
                Imm::Mem { offset, mem, .. } => {
                    let record = self.mem_record(op, offset, mem);
                    self.emit(record);
                }
                Imm::MemLane { offset, mem, lane, .. } => {
                    let record = self.mem_record(op, offset, mem);
                    self.emit(record);
                    self.emit(Instr::aux(lane as u16, 0));
                }
                Imm::Lane(lane) => {
                    self.emit(Instr { op, extra: lane as u16, operand: 0 });
                }
                Imm::Bytes16(bytes) => {
                    let slot = self.pool_v128(u128::from_le_bytes(bytes));
                    self.emit(Instr::with_operand(op, slot));
                }
                Imm::Byte(_) => self.emit(Instr::plain(op)),
                _ => return Err(err_imm()),
            },
        }
        Ok(())
    }

    fn mem_record(&mut self, op: Op, offset: u64, mem: u32) -> Instr {
        if offset <= u32::MAX as u64 {
            Instr { op, extra: mem as u16, operand: offset as u32 }
        } else {
            let slot = self.pool_u64(offset);
            Instr { op, extra: mem as u16 | MEM_OFFSET_POOLED, operand: slot }
        }
    }

    /// The previous record, when it is a lone `local.get` with a small index.
    fn fusable_local_get(&self) -> Option<u16> {
        let prev = self.code.last()?;
        if prev.op == Op::LocalGet && prev.operand <= u16::MAX as u32 {
            Some(prev.operand as u16)
        } else {
            None
        }
    }

    /// The previous record, when it pushes exactly two locals.
    fn fusable_local_pair(&self) -> Option<(u32, u32)> {
        let prev = self.code.last()?;
        if prev.op == Op::LocalGetPair && prev.operand <= u16::MAX as u32 {
            Some((prev.extra as u32, prev.operand))
        } else {
            None
        }
    }
}

fn is_i32_compare(op: Op) -> bool {
    use Op::*;
    matches!(
        op,
        I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU
    )
}

/// Heap types in record form: a small tag with an optional global type id.
///
/// Tags 0..=11 are the abstract heap types; tag 12 is a concrete type whose
/// global id rides in the payload.
pub fn encode_heap(module: &Module, heap: reef_types::HeapType) -> (u16, u32) {
    use reef_types::HeapType::*;
    match heap {
        Func => (0, 0),
        Extern => (1, 0),
        Exn => (2, 0),
        Any => (3, 0),
        Eq => (4, 0),
        I31 => (5, 0),
        Struct => (6, 0),
        Array => (7, 0),
        None => (8, 0),
        NoFunc => (9, 0),
        NoExtern => (10, 0),
        NoExn => (11, 0),
        Concrete(idx) => (12, module.global_type_id(idx).0),
    }
}

/// Inverse of [`encode_heap`]; the payload is a global type id.
pub fn decode_heap(tag: u16, payload: u32) -> reef_types::HeapType {
    use reef_types::HeapType::*;
    match tag & 0xFF {
        0 => Func,
        1 => Extern,
        2 => Exn,
        3 => Any,
        4 => Eq,
        5 => I31,
        6 => Struct,
        7 => Array,
        8 => None,
        9 => NoFunc,
        10 => NoExtern,
        11 => NoExn,
        _ => Concrete(payload),
    }
}

fn err_imm() -> VmError {
    VmError::InvalidWasm("immediate shape mismatch")
}
