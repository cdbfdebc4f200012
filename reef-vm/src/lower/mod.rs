//! The register lowerer: predecoded IR to three-address register IR.
//!
//! A single pass of abstract interpretation over the predecoded records. The
//! virtual stack holds register numbers instead of values: `local.get`
//! pushes the local's own register and emits nothing; every other producer
//! allocates the stack temporary keyed to its stack position
//! (`local_count + position`), so a value's register is unique for as long
//! as the value is live and registers recycle as the stack shrinks.
//!
//! Lowering is best-effort by design: any construct outside the supported
//! scalar subset (vector ops, exception handling, GC, multi-value or
//! parameterized blocks, more than 255 virtual registers, calls past the
//! argument budget, non-zero memory indices) abandons the function to the
//! stack tier. Abandonment is not an error; the caller records it and the
//! function simply never reaches this tier again.

use std::sync::Arc;

use reef_asm::{Instr, Op, RegInstr, RegOp};
use reef_types::ValType;

use crate::consts::MAX_VIRTUAL_REGS;
use crate::instance::InstanceData;
use crate::module::{CompositeType, Module};
use crate::predecode::{PredecodedFunc, MEM_INDEX_MASK, MEM_OFFSET_POOLED};
use crate::registry::TypeRegistry;

mod peephole;

/// A function in register-IR form.
#[derive(Debug)]
pub struct RegFunc {
    /// The instruction array.
    pub code: Vec<RegInstr>,
    /// Constant pool, shared layout with the predecoded pool.
    pub pool: Vec<u64>,
    /// Total virtual registers (locals first, then temporaries).
    pub reg_count: usize,
    /// Parameter registers.
    pub param_count: usize,
    /// Parameter plus declared-local registers.
    pub local_count: usize,
    /// Whether the function returns one value.
    pub has_result: bool,
}

/// Why a function could not be lowered. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerAbort(pub &'static str);

/// What the lowerer needs to know about the world around the function.
pub struct LowerCtx<'a> {
    /// Defining module.
    pub module: &'a Module,
    /// Type registry, for indirect-call signatures.
    pub registry: &'a TypeRegistry,
    /// The owning instance, for global store addresses.
    pub instance: &'a InstanceData,
}

impl LowerCtx<'_> {
    /// Whether the default memory (when any) is 32-bit addressed. The
    /// register tier's loads and stores assume the guard-page model.
    fn mem0_is_32(&self) -> bool {
        for import in &self.module.imports {
            if let crate::module::ImportDesc::Memory(ty) = &import.desc {
                return !ty.width.is_64();
            }
        }
        self.module
            .memories
            .first()
            .map(|ty| !ty.width.is_64())
            .unwrap_or(true)
    }

    fn func_sig(&self, func: u32) -> Result<(usize, usize), LowerAbort> {
        let ty = self
            .module
            .func_type_idx(func)
            .ok_or(LowerAbort("call target out of range"))?;
        let ft = self
            .module
            .func_type(ty)
            .ok_or(LowerAbort("call target has no function type"))?;
        Ok((ft.params.len(), ft.results.len()))
    }

    fn type_sig(&self, type_id: u32) -> Result<(usize, usize), LowerAbort> {
        match &self.registry.get(reef_types::TypeId(type_id)).composite {
            CompositeType::Func(ft) => Ok((ft.params.len(), ft.results.len())),
            _ => Err(LowerAbort("indirect call type is not a function")),
        }
    }
}

struct LBlock {
    kind: Op,
    entry_depth: usize,
    arity: usize,
    result_reg: u8,
    /// Register-IR PC of the loop header.
    header: usize,
    /// Register-IR slots to patch with the post-end PC.
    patches: Vec<usize>,
    /// Pending false-branch slot of an `if`.
    if_false: Option<usize>,
}

struct Lowerer<'a> {
    cx: &'a LowerCtx<'a>,
    pre: &'a PredecodedFunc,
    out: Vec<RegInstr>,
    vstack: Vec<u8>,
    blocks: Vec<LBlock>,
    local_count: usize,
    max_reg: usize,
    has_result: bool,
    unreachable: bool,
    skip_depth: usize,
}

/// Lower one predecoded function.
pub fn lower(
    cx: &LowerCtx<'_>,
    pre: &PredecodedFunc,
) -> Result<Arc<RegFunc>, LowerAbort> {
    let local_count = pre.local_types.len();
    if local_count > MAX_VIRTUAL_REGS {
        return Err(LowerAbort("too many locals"));
    }
    if pre.results.len() > 1 {
        return Err(LowerAbort("multi-result function"));
    }
    if pre.local_types.iter().any(|&t| t == ValType::V128) {
        return Err(LowerAbort("vector local"));
    }

    let mut l = Lowerer {
        cx,
        pre,
        out: Vec::with_capacity(pre.code.len()),
        vstack: Vec::new(),
        blocks: Vec::new(),
        local_count,
        max_reg: local_count,
        has_result: pre.results.len() == 1,
        unreachable: false,
        skip_depth: 0,
    };
    let result_reg = l.temp_at(0)?;
    l.blocks.push(LBlock {
        kind: Op::Block,
        entry_depth: 0,
        arity: pre.results.len(),
        result_reg,
        header: 0,
        patches: Vec::new(),
        if_false: None,
    });
    l.run()?;

    let mut code = l.out;
    peephole::fuse_const_binops(&mut code, local_count);
    peephole::propagate_copies(&mut code, local_count);
    peephole::compact(&mut code);

    Ok(Arc::new(RegFunc {
        code,
        pool: pre.pool.clone(),
        reg_count: l.max_reg,
        param_count: pre.param_count,
        local_count,
        has_result: l.has_result,
    }))
}

impl Lowerer<'_> {
    fn rpc(&self) -> usize {
        self.out.len()
    }

    fn emit(&mut self, instr: RegInstr) {
        self.out.push(instr);
    }

    /// The stack temporary keyed to a stack position.
    fn temp_at(&mut self, position: usize) -> Result<u8, LowerAbort> {
        let reg = self.local_count + position;
        if reg > MAX_VIRTUAL_REGS {
            return Err(LowerAbort("virtual register budget exceeded"));
        }
        self.max_reg = self.max_reg.max(reg + 1);
        Ok(reg as u8)
    }

    /// Allocate the temporary for the next push.
    fn alloc_top(&mut self) -> Result<u8, LowerAbort> {
        self.temp_at(self.vstack.len())
    }

    fn pop(&mut self) -> Result<u8, LowerAbort> {
        self.vstack.pop().ok_or(LowerAbort("virtual stack underflow"))
    }

    fn top(&self) -> Result<u8, LowerAbort> {
        self.vstack
            .last()
            .copied()
            .ok_or(LowerAbort("virtual stack underflow"))
    }

    fn push_temp_op(&mut self, op: RegOp, srcs: &[u8]) -> Result<(), LowerAbort> {
        let rd = self.alloc_top()?;
        let instr = match srcs {
            [] => RegInstr { op, rd, rs1: 0, operand: 0 },
            [a] => RegInstr::rr(op, rd, *a),
            [a, b] => RegInstr::rrr(op, rd, *a, *b),
            _ => return Err(LowerAbort("operand shape")),
        };
        self.emit(instr);
        self.vstack.push(rd);
        Ok(())
    }

    fn binop(&mut self, op: RegOp) -> Result<(), LowerAbort> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push_temp_op(op, &[a, b])
    }

    fn unop(&mut self, op: RegOp) -> Result<(), LowerAbort> {
        let a = self.pop()?;
        self.push_temp_op(op, &[a])
    }

    /// Detach every virtual-stack alias of local `reg` into fresh temps.
    fn detach_local(&mut self, reg: u8) -> Result<(), LowerAbort> {
        for position in 0..self.vstack.len() {
            if self.vstack[position] == reg {
                let temp = self.temp_at(position)?;
                self.emit(RegInstr::rr(RegOp::Mov, temp, reg));
                self.vstack[position] = temp;
            }
        }
        Ok(())
    }

    fn block_at(&self, depth: u32) -> Result<usize, LowerAbort> {
        self.blocks
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(LowerAbort("branch label out of range"))
    }

    /// Emit the value move a branch to `target` needs, without disturbing
    /// the virtual stack.
    fn branch_value_move(&mut self, target: usize) -> Result<(), LowerAbort> {
        if self.blocks[target].kind == Op::Loop || self.blocks[target].arity == 0 {
            return Ok(());
        }
        let src = self.top()?;
        let dst = self.blocks[target].result_reg;
        if src != dst {
            self.emit(RegInstr::rr(RegOp::Mov, dst, src));
        }
        Ok(())
    }

    /// Emit a branch record, resolved for loops, patched otherwise. Returns
    /// the record's PC.
    fn emit_jump(&mut self, op: RegOp, cond: u8, target: usize) -> usize {
        let pc = self.rpc();
        let operand = if self.blocks[target].kind == Op::Loop {
            self.blocks[target].header as u32
        } else {
            self.blocks[target].patches.push(pc);
            0
        };
        self.emit(RegInstr { op, rd: 0, rs1: cond, operand });
        pc
    }

    fn mem_args(&self, instr: Instr) -> Result<u32, LowerAbort> {
        if instr.extra & MEM_OFFSET_POOLED != 0 {
            return Err(LowerAbort("64-bit memory offset"));
        }
        if instr.extra & MEM_INDEX_MASK != 0 {
            return Err(LowerAbort("non-default memory"));
        }
        if !self.cx.mem0_is_32() {
            return Err(LowerAbort("64-bit memory"));
        }
        Ok(instr.operand)
    }

    fn load(&mut self, op: RegOp, instr: Instr) -> Result<(), LowerAbort> {
        let offset = self.mem_args(instr)?;
        let addr = self.pop()?;
        let rd = self.alloc_top()?;
        self.emit(RegInstr { op, rd, rs1: addr, operand: offset });
        self.vstack.push(rd);
        Ok(())
    }

    fn store(&mut self, op: RegOp, instr: Instr) -> Result<(), LowerAbort> {
        let offset = self.mem_args(instr)?;
        let value = self.pop()?;
        let addr = self.pop()?;
        self.emit(RegInstr { op, rd: value, rs1: addr, operand: offset });
        Ok(())
    }

    /// Pop `count` argument registers (last argument on top) and emit the
    /// packed aux words.
    fn emit_args(&mut self, count: usize) -> Result<(), LowerAbort> {
        if count > RegInstr::MAX_CALL_ARGS {
            return Err(LowerAbort("call argument budget exceeded"));
        }
        let start = self
            .vstack
            .len()
            .checked_sub(count)
            .ok_or(LowerAbort("virtual stack underflow"))?;
        let args: Vec<u8> = self.vstack.drain(start..).collect();
        for chunk in args.chunks(RegInstr::ARGS_PER_AUX) {
            let word = RegInstr::pack_args(chunk);
            self.emit(RegInstr { op: RegOp::Aux, rd: 0, rs1: 0, operand: word });
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), LowerAbort> {
        let code = &self.pre.code;
        let mut pc = 0usize;
        while pc < code.len() && !self.blocks.is_empty() {
            let instr = code[pc];
            let advance = record_len(code, pc);
            if self.unreachable && !self.skip_instr(instr)? {
                pc += advance;
                continue;
            }
            self.instr(instr, code, pc)?;
            pc += advance;
        }
        if !self.blocks.is_empty() {
            return Err(LowerAbort("unbalanced control flow"));
        }
        Ok(())
    }

    /// Handle a record while dead. Returns true when the record must still
    /// be processed (a control record closing or splitting the live block).
    fn skip_instr(&mut self, instr: Instr) -> Result<bool, LowerAbort> {
        match instr.op {
            Op::Block | Op::Loop | Op::If | Op::TryTable => {
                self.skip_depth += 1;
                Ok(false)
            }
            Op::End => {
                if self.skip_depth > 0 {
                    self.skip_depth -= 1;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            Op::Else => Ok(self.skip_depth == 0),
            _ => Ok(false),
        }
    }

    fn instr(&mut self, instr: Instr, code: &[Instr], pc: usize) -> Result<(), LowerAbort> {
        use RegOp as R;

        let op = instr.op;
        match op {
            Op::Nop => {}
            Op::Unreachable => {
                // The stack tier owns trap reporting for straight-line
                // unreachable; a function containing it stays interpretable
                // but the register tier can express it as a trapping idiom.
                return Err(LowerAbort("unreachable"));
            }

            Op::Block | Op::TryTable => {
                if op == Op::TryTable {
                    return Err(LowerAbort("exception handling"));
                }
                let params = code[pc + 1].extra as usize;
                let arity = instr.extra as usize;
                if params != 0 || arity > 1 {
                    return Err(LowerAbort("block signature"));
                }
                let entry_depth = self.vstack.len();
                let result_reg = self.temp_at(entry_depth)?;
                self.blocks.push(LBlock {
                    kind: Op::Block,
                    entry_depth,
                    arity,
                    result_reg,
                    header: 0,
                    patches: Vec::new(),
                    if_false: None,
                });
            }
            Op::Loop => {
                if instr.extra != 0 {
                    return Err(LowerAbort("block signature"));
                }
                let entry_depth = self.vstack.len();
                self.blocks.push(LBlock {
                    kind: Op::Loop,
                    entry_depth,
                    arity: 0,
                    result_reg: 0,
                    header: self.rpc(),
                    patches: Vec::new(),
                    if_false: None,
                });
            }
            Op::If => {
                let params = code[pc + 1].extra as usize;
                let arity = instr.extra as usize;
                if params != 0 || arity > 1 {
                    return Err(LowerAbort("block signature"));
                }
                let cond = self.pop()?;
                let entry_depth = self.vstack.len();
                let result_reg = self.temp_at(entry_depth)?;
                let false_pc = self.rpc();
                self.emit(RegInstr { op: R::BrIfNot, rd: 0, rs1: cond, operand: 0 });
                self.blocks.push(LBlock {
                    kind: Op::If,
                    entry_depth,
                    arity,
                    result_reg,
                    header: 0,
                    patches: Vec::new(),
                    if_false: Some(false_pc),
                });
            }
            Op::Else => {
                let Some(block) = self.blocks.last_mut() else {
                    return Err(LowerAbort("else outside if"));
                };
                let arity = block.arity;
                let result_reg = block.result_reg;
                let entry_depth = block.entry_depth;
                if !self.unreachable {
                    if arity == 1 {
                        let src = self.top()?;
                        if src != result_reg {
                            self.emit(RegInstr::rr(R::Mov, result_reg, src));
                        }
                    }
                    let pc_jump = self.rpc();
                    self.emit(RegInstr { op: R::Br, rd: 0, rs1: 0, operand: 0 });
                    self.blocks
                        .last_mut()
                        .expect("still inside if")
                        .patches
                        .push(pc_jump);
                }
                let here = self.rpc() as u32;
                let block = self.blocks.last_mut().expect("still inside if");
                if let Some(slot) = block.if_false.take() {
                    self.out[slot].operand = here;
                }
                block.kind = Op::Else;
                self.vstack.truncate(entry_depth);
                self.unreachable = false;
            }
            Op::End => {
                let block = self.blocks.last().ok_or(LowerAbort("unbalanced end"))?;
                let kind = block.kind;
                let arity = block.arity;
                let result_reg = block.result_reg;
                let entry_depth = block.entry_depth;
                let fallthrough = !self.unreachable;

                if fallthrough && arity == 1 && kind != Op::Loop {
                    let src = self.pop()?;
                    if src != result_reg {
                        self.emit(RegInstr::rr(R::Mov, result_reg, src));
                    }
                }
                let here = self.rpc() as u32;
                let block = self.blocks.pop().ok_or(LowerAbort("unbalanced end"))?;
                let had_forward_entry = !block.patches.is_empty() || block.if_false.is_some();
                for slot in block.patches {
                    self.out[slot].operand = here;
                }
                if let Some(slot) = block.if_false {
                    self.out[slot].operand = here;
                }
                if kind == Op::Loop {
                    // A loop's fallthrough values stay in whatever registers
                    // the body left them in; nothing to reconcile because
                    // the loop label carries no results.
                    if !fallthrough {
                        self.vstack.truncate(entry_depth);
                    }
                } else {
                    self.vstack.truncate(entry_depth);
                    if arity == 1 {
                        self.vstack.push(result_reg);
                    }
                }
                // Code after the block is live when the body falls through
                // or any forward branch lands here; a loop only falls.
                self.unreachable = match kind {
                    Op::Loop => !fallthrough,
                    _ => !(fallthrough || had_forward_entry),
                };
                if self.blocks.is_empty() {
                    let has = self.has_result;
                    let src = if has { result_reg } else { 0 };
                    self.emit(RegInstr {
                        op: R::Ret,
                        rd: u8::from(has),
                        rs1: src,
                        operand: 0,
                    });
                }
            }

            Op::Br => {
                let target = self.block_at(instr.extra as u32)?;
                self.branch_value_move(target)?;
                self.emit_jump(R::Br, 0, target);
                self.unreachable = true;
            }
            Op::BrIf => {
                let cond = self.pop()?;
                let target = self.block_at(instr.extra as u32)?;
                self.branch_value_move(target)?;
                self.emit_jump(R::BrIf, cond, target);
            }
            Op::BrTable => {
                let count = instr.operand as usize;
                let index = self.pop()?;
                self.emit(RegInstr {
                    op: R::BrTable,
                    rd: 0,
                    rs1: index,
                    operand: count as u32,
                });
                // Reserve the entry words, then fill them (possibly via
                // per-target trampolines when result registers differ).
                let entry_base = self.rpc();
                for _ in 0..count {
                    self.emit(RegInstr { op: R::Aux, rd: 0, rs1: 0, operand: 0 });
                }
                let src = if self.blocks[self.block_at(code[pc + 1].extra as u32)?].arity
                    == 1
                {
                    Some(self.top()?)
                } else {
                    None
                };
                for entry in 0..count {
                    let depth = code[pc + 1 + entry].extra as u32;
                    let target = self.block_at(depth)?;
                    let needs_move = self.blocks[target].kind != Op::Loop
                        && self.blocks[target].arity == 1
                        && src.is_some_and(|s| s != self.blocks[target].result_reg);
                    if needs_move {
                        let tramp = self.rpc() as u32;
                        let dst = self.blocks[target].result_reg;
                        self.emit(RegInstr::rr(R::Mov, dst, src.expect("checked")));
                        self.emit_jump(R::Br, 0, target);
                        self.out[entry_base + entry].operand = tramp;
                    } else if self.blocks[target].kind == Op::Loop {
                        self.out[entry_base + entry].operand =
                            self.blocks[target].header as u32;
                    } else {
                        let slot = entry_base + entry;
                        self.blocks[target].patches.push(slot);
                    }
                }
                self.unreachable = true;
            }
            Op::Return => {
                let has = self.has_result;
                let src = if has { self.top()? } else { 0 };
                self.emit(RegInstr { op: R::Ret, rd: u8::from(has), rs1: src, operand: 0 });
                self.unreachable = true;
            }

            Op::Call | Op::ReturnCall => {
                let (params, results) = self.cx.func_sig(instr.operand)?;
                if results > 1 {
                    return Err(LowerAbort("multi-result call"));
                }
                let reg_op = if op == Op::Call { R::Call } else { R::ReturnCall };
                // The call record precedes its argument words.
                let rd_slot = self.vstack.len().saturating_sub(params);
                let rd = self.temp_at(rd_slot)?;
                self.emit(RegInstr {
                    op: reg_op,
                    rd,
                    rs1: results as u8,
                    operand: instr.operand,
                });
                self.emit_args(params)?;
                if op == Op::ReturnCall {
                    self.unreachable = true;
                } else if results == 1 {
                    self.vstack.push(rd);
                }
            }
            Op::CallIndirect => {
                let (params, results) = self.cx.type_sig(instr.operand)?;
                if results > 1 {
                    return Err(LowerAbort("multi-result call"));
                }
                let index = self.pop()?;
                let rd_slot = self.vstack.len().saturating_sub(params);
                let rd = self.temp_at(rd_slot)?;
                self.emit(RegInstr {
                    op: R::CallIndirect,
                    rd,
                    rs1: index,
                    operand: instr.operand,
                });
                // Table index rides in the first aux word's extra position.
                self.emit(RegInstr {
                    op: R::Aux,
                    rd: results as u8,
                    rs1: 0,
                    operand: instr.extra as u32,
                });
                self.emit_args(params)?;
                if results == 1 {
                    self.vstack.push(rd);
                }
            }

            Op::Drop => {
                self.pop()?;
            }
            Op::Select => {
                let cond = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                let rd = self.alloc_top()?;
                self.emit(RegInstr {
                    op: R::Select,
                    rd,
                    rs1: a,
                    operand: u32::from(b) | (u32::from(cond) << 8),
                });
                self.vstack.push(rd);
            }

            Op::LocalGet => {
                let reg = local_reg(instr.operand)?;
                self.vstack.push(reg);
            }
            Op::LocalGetPair => {
                self.vstack.push(local_reg(instr.extra as u32)?);
                self.vstack.push(local_reg(instr.operand)?);
            }
            Op::LocalGetConst32 => {
                self.vstack.push(local_reg(instr.extra as u32)?);
                let rd = self.alloc_top()?;
                self.emit(RegInstr { op: R::Const32, rd, rs1: 0, operand: instr.operand });
                self.vstack.push(rd);
            }
            Op::I32CmpLocals => {
                let cmp = map_cmp(instr.extra)?;
                let l1 = local_reg(instr.operand & 0xFFFF)?;
                let l2 = local_reg(instr.operand >> 16)?;
                self.push_temp_op(cmp, &[l1, l2])?;
            }
            Op::LocalSet | Op::LocalTee => {
                let local = local_reg(instr.operand)?;
                let src = self.pop()?;
                self.detach_local(local)?;
                if src != local {
                    self.emit(RegInstr::rr(R::Mov, local, src));
                }
                if op == Op::LocalTee {
                    self.vstack.push(local);
                }
            }
            Op::GlobalGet | Op::GlobalSet => {
                let addr = *self
                    .cx
                    .instance
                    .globals
                    .get(instr.operand as usize)
                    .ok_or(LowerAbort("global index out of range"))?;
                if op == Op::GlobalGet {
                    let rd = self.alloc_top()?;
                    self.emit(RegInstr { op: R::GlobalGet, rd, rs1: 0, operand: addr as u32 });
                    self.vstack.push(rd);
                } else {
                    let src = self.pop()?;
                    self.emit(RegInstr {
                        op: R::GlobalSet,
                        rd: 0,
                        rs1: src,
                        operand: addr as u32,
                    });
                }
            }

            Op::I32Const => {
                let rd = self.alloc_top()?;
                self.emit(RegInstr { op: R::Const32, rd, rs1: 0, operand: instr.operand });
                self.vstack.push(rd);
            }
            Op::F32Const => {
                let rd = self.alloc_top()?;
                self.emit(RegInstr { op: R::Const32, rd, rs1: 0, operand: instr.operand });
                self.vstack.push(rd);
            }
            Op::I64Const | Op::F64Const => {
                let rd = self.alloc_top()?;
                self.emit(RegInstr { op: R::Const64, rd, rs1: 0, operand: instr.operand });
                self.vstack.push(rd);
            }

            Op::MemorySize => {
                if instr.operand != 0 || !self.cx.mem0_is_32() {
                    return Err(LowerAbort("non-default memory"));
                }
                self.push_temp_op(R::MemorySize, &[])?;
            }
            Op::MemoryGrow => {
                if instr.operand != 0 || !self.cx.mem0_is_32() {
                    return Err(LowerAbort("non-default memory"));
                }
                let delta = self.pop()?;
                self.push_temp_op(R::MemoryGrow, &[delta])?;
            }
            Op::MemoryFill => {
                if instr.operand != 0 || !self.cx.mem0_is_32() {
                    return Err(LowerAbort("non-default memory"));
                }
                let len = self.pop()?;
                let val = self.pop()?;
                let dst = self.pop()?;
                self.emit(RegInstr { op: R::MemoryFill, rd: len, rs1: dst, operand: val.into() });
            }
            Op::MemoryCopy => {
                if instr.operand != 0 || instr.extra != 0 || !self.cx.mem0_is_32() {
                    return Err(LowerAbort("non-default memory"));
                }
                let len = self.pop()?;
                let src = self.pop()?;
                let dst = self.pop()?;
                self.emit(RegInstr { op: R::MemoryCopy, rd: len, rs1: dst, operand: src.into() });
            }

            _ => return self.simple(instr),
        }
        Ok(())
    }

    /// Loads, stores, and pure data ops with a direct register-IR mirror.
    fn simple(&mut self, instr: Instr) -> Result<(), LowerAbort> {
        use RegOp as R;

        if let Some((reg_op, is_store)) = mem_op(instr.op) {
            return if is_store {
                self.store(reg_op, instr)
            } else {
                self.load(reg_op, instr)
            };
        }
        if let Some(reg_op) = binary_op(instr.op) {
            return self.binop(reg_op);
        }
        if let Some(reg_op) = unary_op(instr.op) {
            return self.unop(reg_op);
        }
        let _ = R::Nop; // Nop only enters the stream as a peephole tombstone.
        Err(LowerAbort("unsupported opcode"))
    }
}

fn local_reg(index: u32) -> Result<u8, LowerAbort> {
    u8::try_from(index).map_err(|_| LowerAbort("local register out of range"))
}

/// Length in records of the instruction starting at `pc`.
fn record_len(code: &[Instr], pc: usize) -> usize {
    match code[pc].op {
        Op::Block | Op::If | Op::TryTable => 2,
        Op::BrTable => 1 + code[pc].operand as usize,
        Op::BrOnCast | Op::BrOnCastFail => 3,
        Op::V128Load8Lane | Op::V128Load16Lane | Op::V128Load32Lane
        | Op::V128Load64Lane | Op::V128Store8Lane | Op::V128Store16Lane
        | Op::V128Store32Lane | Op::V128Store64Lane => 2,
        _ => 1,
    }
}

fn map_cmp(packed: u16) -> Result<RegOp, LowerAbort> {
    let op = Op::from_packed(packed).ok_or(LowerAbort("bad fused compare"))?;
    binary_op(op).ok_or(LowerAbort("bad fused compare"))
}

fn mem_op(op: Op) -> Option<(RegOp, bool)> {
    use Op::*;
    use RegOp as R;
    Some(match op {
        I32Load => (R::I32Load, false),
        I64Load => (R::I64Load, false),
        F32Load => (R::F32Load, false),
        F64Load => (R::F64Load, false),
        I32Load8S => (R::I32Load8S, false),
        I32Load8U => (R::I32Load8U, false),
        I32Load16S => (R::I32Load16S, false),
        I32Load16U => (R::I32Load16U, false),
        I64Load8S => (R::I64Load8S, false),
        I64Load8U => (R::I64Load8U, false),
        I64Load16S => (R::I64Load16S, false),
        I64Load16U => (R::I64Load16U, false),
        I64Load32S => (R::I64Load32S, false),
        I64Load32U => (R::I64Load32U, false),
        I32Store => (R::I32Store, true),
        I64Store => (R::I64Store, true),
        F32Store => (R::F32Store, true),
        F64Store => (R::F64Store, true),
        I32Store8 => (R::I32Store8, true),
        I32Store16 => (R::I32Store16, true),
        I64Store8 => (R::I64Store8, true),
        I64Store16 => (R::I64Store16, true),
        I64Store32 => (R::I64Store32, true),
        _ => return None,
    })
}

fn binary_op(op: Op) -> Option<RegOp> {
    use Op::*;
    use RegOp as R;
    Some(match op {
        I32Add => R::I32Add,
        I32Sub => R::I32Sub,
        I32Mul => R::I32Mul,
        I32DivS => R::I32DivS,
        I32DivU => R::I32DivU,
        I32RemS => R::I32RemS,
        I32RemU => R::I32RemU,
        I32And => R::I32And,
        I32Or => R::I32Or,
        I32Xor => R::I32Xor,
        I32Shl => R::I32Shl,
        I32ShrS => R::I32ShrS,
        I32ShrU => R::I32ShrU,
        I32Rotl => R::I32Rotl,
        I32Rotr => R::I32Rotr,
        I32Eq => R::I32Eq,
        I32Ne => R::I32Ne,
        I32LtS => R::I32LtS,
        I32LtU => R::I32LtU,
        I32GtS => R::I32GtS,
        I32GtU => R::I32GtU,
        I32LeS => R::I32LeS,
        I32LeU => R::I32LeU,
        I32GeS => R::I32GeS,
        I32GeU => R::I32GeU,
        I64Add => R::I64Add,
        I64Sub => R::I64Sub,
        I64Mul => R::I64Mul,
        I64DivS => R::I64DivS,
        I64DivU => R::I64DivU,
        I64RemS => R::I64RemS,
        I64RemU => R::I64RemU,
        I64And => R::I64And,
        I64Or => R::I64Or,
        I64Xor => R::I64Xor,
        I64Shl => R::I64Shl,
        I64ShrS => R::I64ShrS,
        I64ShrU => R::I64ShrU,
        I64Rotl => R::I64Rotl,
        I64Rotr => R::I64Rotr,
        I64Eq => R::I64Eq,
        I64Ne => R::I64Ne,
        I64LtS => R::I64LtS,
        I64LtU => R::I64LtU,
        I64GtS => R::I64GtS,
        I64GtU => R::I64GtU,
        I64LeS => R::I64LeS,
        I64LeU => R::I64LeU,
        I64GeS => R::I64GeS,
        I64GeU => R::I64GeU,
        F32Add => R::F32Add,
        F32Sub => R::F32Sub,
        F32Mul => R::F32Mul,
        F32Div => R::F32Div,
        F32Min => R::F32Min,
        F32Max => R::F32Max,
        F32Copysign => R::F32Copysign,
        F32Eq => R::F32Eq,
        F32Ne => R::F32Ne,
        F32Lt => R::F32Lt,
        F32Gt => R::F32Gt,
        F32Le => R::F32Le,
        F32Ge => R::F32Ge,
        F64Add => R::F64Add,
        F64Sub => R::F64Sub,
        F64Mul => R::F64Mul,
        F64Div => R::F64Div,
        F64Min => R::F64Min,
        F64Max => R::F64Max,
        F64Copysign => R::F64Copysign,
        F64Eq => R::F64Eq,
        F64Ne => R::F64Ne,
        F64Lt => R::F64Lt,
        F64Gt => R::F64Gt,
        F64Le => R::F64Le,
        F64Ge => R::F64Ge,
        _ => return None,
    })
}

fn unary_op(op: Op) -> Option<RegOp> {
    use Op::*;
    use RegOp as R;
    Some(match op {
        I32Eqz => R::I32Eqz,
        I64Eqz => R::I64Eqz,
        I32Clz => R::I32Clz,
        I32Ctz => R::I32Ctz,
        I32Popcnt => R::I32Popcnt,
        I64Clz => R::I64Clz,
        I64Ctz => R::I64Ctz,
        I64Popcnt => R::I64Popcnt,
        I32Extend8S => R::I32Extend8S,
        I32Extend16S => R::I32Extend16S,
        I64Extend8S => R::I64Extend8S,
        I64Extend16S => R::I64Extend16S,
        I64Extend32S => R::I64Extend32S,
        I64ExtendI32S => R::I64ExtendI32S,
        I64ExtendI32U => R::I64ExtendI32U,
        I32WrapI64 => R::I32WrapI64,
        F32Abs => R::F32Abs,
        F32Neg => R::F32Neg,
        F32Ceil => R::F32Ceil,
        F32Floor => R::F32Floor,
        F32Trunc => R::F32Trunc,
        F32Nearest => R::F32Nearest,
        F32Sqrt => R::F32Sqrt,
        F64Abs => R::F64Abs,
        F64Neg => R::F64Neg,
        F64Ceil => R::F64Ceil,
        F64Floor => R::F64Floor,
        F64Trunc => R::F64Trunc,
        F64Nearest => R::F64Nearest,
        F64Sqrt => R::F64Sqrt,
        I32TruncF32S => R::I32TruncF32S,
        I32TruncF32U => R::I32TruncF32U,
        I32TruncF64S => R::I32TruncF64S,
        I32TruncF64U => R::I32TruncF64U,
        I64TruncF32S => R::I64TruncF32S,
        I64TruncF32U => R::I64TruncF32U,
        I64TruncF64S => R::I64TruncF64S,
        I64TruncF64U => R::I64TruncF64U,
        I32TruncSatF32S => R::I32TruncSatF32S,
        I32TruncSatF32U => R::I32TruncSatF32U,
        I32TruncSatF64S => R::I32TruncSatF64S,
        I32TruncSatF64U => R::I32TruncSatF64U,
        I64TruncSatF32S => R::I64TruncSatF32S,
        I64TruncSatF32U => R::I64TruncSatF32U,
        I64TruncSatF64S => R::I64TruncSatF64S,
        I64TruncSatF64U => R::I64TruncSatF64U,
        F32ConvertI32S => R::F32ConvertI32S,
        F32ConvertI32U => R::F32ConvertI32U,
        F32ConvertI64S => R::F32ConvertI64S,
        F32ConvertI64U => R::F32ConvertI64U,
        F64ConvertI32S => R::F64ConvertI32S,
        F64ConvertI32U => R::F64ConvertI32U,
        F64ConvertI64S => R::F64ConvertI64S,
        F64ConvertI64U => R::F64ConvertI64U,
        F32DemoteF64 => R::F32DemoteF64,
        F64PromoteF32 => R::F64PromoteF32,
        I32ReinterpretF32 => R::I32ReinterpretF32,
        I64ReinterpretF64 => R::I64ReinterpretF64,
        F32ReinterpretI32 => R::F32ReinterpretI32,
        F64ReinterpretI64 => R::F64ReinterpretI64,
        _ => return None,
    })
}
