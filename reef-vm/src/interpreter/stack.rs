//! The stack interpreter: the fallback tier that executes everything.
//!
//! Reads predecoded IR against the VM's shared operand stack of 128-bit
//! slots. Frame locals live at the bottom of the frame's stack window.
//! Block state is a label stack; branches jump to the PCs the predecoder
//! resolved. Exception unwinding walks the label stack for `try_table`
//! entries before propagating to the caller.

use std::sync::Arc;

use reef_asm::{Instr, Op, TrapReason};
use reef_types::{AddrWidth, HeapType, RefRepr, TypeId, Word};

use crate::consts::MAX_OPERAND_SLOTS;
use crate::error::{ExecResult, RuntimeError};
use crate::gc::GcKind;
use crate::memory::{LinearMemory, WaitExpect};
use crate::module::{CompositeType, ConstExpr, ConstOp, Module, StorageType};
use crate::predecode::{decode_heap, PredecodedFunc, MEM_INDEX_MASK, MEM_OFFSET_POOLED};
use crate::store::Store;

use super::{simd, Vm};
use crate::state::ExecuteState;

/// A label-stack entry.
#[derive(Debug, Clone, Copy)]
struct Label {
    /// Resolved jump target of a branch to this label.
    target: u32,
    /// Operand height (relative to the frame) at label entry.
    height: u32,
    /// Values a branch to this label carries.
    arity: u16,
    /// Index into the function's try tables, or -1.
    try_table: i32,
}

pub(super) struct Exec<'vm, 'st> {
    vm: &'vm mut Vm<'st>,
    pre: Arc<PredecodedFunc>,
    module: Arc<Module>,
    instance: usize,
    locals_base: usize,
    frame_base: usize,
    labels: Vec<Label>,
    mem0: Option<Arc<LinearMemory>>,
}

/// Execute one function in the stack tier.
pub(super) fn run(
    vm: &mut Vm<'_>,
    addr: usize,
    pre: &Arc<PredecodedFunc>,
    args: &[u128],
) -> ExecResult<ExecuteState> {
    let func = vm.store.func(addr).wasm().expect("stack tier runs wasm");
    let module = Arc::clone(&func.module);
    let instance = func.instance;

    let locals_base = vm.stack.len();
    if locals_base + pre.local_types.len() + 64 > MAX_OPERAND_SLOTS {
        return Err(TrapReason::CallStackExhausted.into());
    }
    vm.stack.extend_from_slice(args);
    vm.stack
        .resize(locals_base + pre.local_types.len(), 0u128);
    let frame_base = vm.stack.len();

    let mem0 = vm.store.instances[instance]
        .memories
        .first()
        .map(|&m| Arc::clone(&vm.store.memories[m].memory));

    let mut ex = Exec {
        vm: &mut *vm,
        pre: Arc::clone(pre),
        module,
        instance,
        locals_base,
        frame_base,
        labels: vec![Label {
            target: pre.code.len() as u32,
            height: 0,
            arity: pre.results.len() as u16,
            try_table: -1,
        }],
        mem0,
    };

    let outcome = ex.exec_loop();
    // Collect results and drop the frame window regardless of how we exit.
    let result = match outcome {
        Ok(None) => {
            let n = pre.results.len();
            let split = ex.vm.stack.len() - n;
            let results = ex.vm.stack.split_off(split);
            Ok(ExecuteState::Returned(results))
        }
        Ok(Some(tail)) => Ok(tail),
        Err(e) => Err(e),
    };
    vm.stack.truncate(locals_base);
    result
}

/// Evaluate a constant initializer expression against the store.
pub(crate) fn eval_const_expr(
    store: &mut Store,
    module: &Module,
    instance: usize,
    expr: &ConstExpr,
) -> Result<Vec<u128>, RuntimeError> {
    let mut stack: Vec<u128> = Vec::new();
    for &op in &expr.ops {
        match op {
            ConstOp::I32(v) => stack.push(v as u32 as u128),
            ConstOp::I64(v) => stack.push(v as u64 as u128),
            ConstOp::F32(bits) => stack.push(bits as u128),
            ConstOp::F64(bits) => stack.push(bits as u128),
            ConstOp::V128(v) => stack.push(v),
            ConstOp::RefNull(_) => stack.push(0),
            ConstOp::RefFunc(f) => {
                let addr = store.instances[instance].funcs[f as usize];
                stack.push(RefRepr::Func(addr).encode() as u128);
            }
            ConstOp::GlobalGet(g) => {
                let addr = store.instances[instance].globals[g as usize];
                stack.push(store.globals[addr].cell());
            }
            ConstOp::I32Add | ConstOp::I32Sub | ConstOp::I32Mul => {
                let b = stack.pop().unwrap_or_default() as u32;
                let a = stack.pop().unwrap_or_default() as u32;
                let v = match op {
                    ConstOp::I32Add => a.wrapping_add(b),
                    ConstOp::I32Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                };
                stack.push(v as u128);
            }
            ConstOp::I64Add | ConstOp::I64Sub | ConstOp::I64Mul => {
                let b = stack.pop().unwrap_or_default() as u64;
                let a = stack.pop().unwrap_or_default() as u64;
                let v = match op {
                    ConstOp::I64Add => a.wrapping_add(b),
                    ConstOp::I64Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                };
                stack.push(v as u128);
            }
            ConstOp::RefI31 => {
                let v = stack.pop().unwrap_or_default() as u32 as i32;
                stack.push(RefRepr::I31(((v << 1) >> 1)).encode() as u128);
            }
            ConstOp::StructNew(ty) | ConstOp::StructNewDefault(ty) => {
                let id = module.global_type_id(ty);
                let count = match &store.registry.get(id).composite {
                    CompositeType::Struct(st) => st.fields.len(),
                    _ => 0,
                };
                let fields = if matches!(op, ConstOp::StructNew(_)) {
                    let split = stack.len().saturating_sub(count);
                    stack.split_off(split)
                } else {
                    vec![0u128; count]
                };
                let idx = store.gc.alloc_struct(id, fields);
                stack.push(RefRepr::Gc(idx).encode() as u128);
            }
            ConstOp::ArrayNew(ty) | ConstOp::ArrayNewDefault(ty) => {
                let id = module.global_type_id(ty);
                let len = stack.pop().unwrap_or_default() as u32 as usize;
                let fill = if matches!(op, ConstOp::ArrayNew(_)) {
                    stack.pop().unwrap_or_default()
                } else {
                    0
                };
                let idx = store.gc.alloc_array(id, vec![fill; len]);
                stack.push(RefRepr::Gc(idx).encode() as u128);
            }
            ConstOp::ArrayNewFixed(ty, n) => {
                let id = module.global_type_id(ty);
                let split = stack.len().saturating_sub(n as usize);
                let elems = stack.split_off(split);
                let idx = store.gc.alloc_array(id, elems);
                stack.push(RefRepr::Gc(idx).encode() as u128);
            }
        }
    }
    Ok(stack)
}

macro_rules! b32 {
    ($ex:ident, $f:expr) => {{
        let b = $ex.pop_u32();
        let a = $ex.pop_u32();
        $ex.push_u32($f(a, b));
    }};
}
macro_rules! b64 {
    ($ex:ident, $f:expr) => {{
        let b = $ex.pop_u64();
        let a = $ex.pop_u64();
        $ex.push_u64($f(a, b));
    }};
}
macro_rules! c32 {
    ($ex:ident, $f:expr) => {{
        let b = $ex.pop_u32();
        let a = $ex.pop_u32();
        $ex.push_u32(u32::from($f(a, b)));
    }};
}
macro_rules! c64 {
    ($ex:ident, $f:expr) => {{
        let b = $ex.pop_u64();
        let a = $ex.pop_u64();
        $ex.push_u32(u32::from($f(a, b)));
    }};
}
macro_rules! f32op {
    ($ex:ident, $f:expr) => {{
        let b = $ex.pop_f32();
        let a = $ex.pop_f32();
        $ex.push_f32($f(a, b));
    }};
}
macro_rules! f64op {
    ($ex:ident, $f:expr) => {{
        let b = $ex.pop_f64();
        let a = $ex.pop_f64();
        $ex.push_f64($f(a, b));
    }};
}

impl Exec<'_, '_> {
    // Stack primitives. Validated code cannot underflow; a zero result on a
    // broken invariant is deterministic and harmless.

    #[inline]
    fn push(&mut self, cell: u128) -> ExecResult<()> {
        if self.vm.stack.len() >= MAX_OPERAND_SLOTS {
            return Err(TrapReason::CallStackExhausted.into());
        }
        self.vm.stack.push(cell);
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> u128 {
        self.vm.stack.pop().unwrap_or_default()
    }

    #[inline]
    fn pop_u32(&mut self) -> u32 {
        self.pop() as u32
    }

    #[inline]
    fn pop_u64(&mut self) -> u64 {
        self.pop() as u64
    }

    #[inline]
    fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop() as u32)
    }

    #[inline]
    fn pop_f64(&mut self) -> f64 {
        f64::from_bits(self.pop() as u64)
    }

    #[inline]
    fn push_u32(&mut self, v: u32) {
        self.vm.stack.push(v as u128);
    }

    #[inline]
    fn push_u64(&mut self, v: u64) {
        self.vm.stack.push(v as u128);
    }

    #[inline]
    fn push_f32(&mut self, v: f32) {
        self.push_u32(v.to_bits());
    }

    #[inline]
    fn push_f64(&mut self, v: f64) {
        self.push_u64(v.to_bits());
    }

    fn local(&self, index: u32) -> u128 {
        self.vm.stack[self.locals_base + index as usize]
    }

    fn set_local(&mut self, index: u32, cell: u128) {
        self.vm.stack[self.locals_base + index as usize] = cell;
    }

    fn height(&self) -> u32 {
        (self.vm.stack.len() - self.frame_base) as u32
    }

    // Memory helpers.

    fn memory(&self, mem: u16) -> Arc<LinearMemory> {
        let index = (mem & MEM_INDEX_MASK) as usize;
        if index == 0 {
            if let Some(mem0) = &self.mem0 {
                return Arc::clone(mem0);
            }
        }
        let addr = self.vm.store.instances[self.instance].memories[index];
        Arc::clone(&self.vm.store.memories[addr].memory)
    }

    fn mem_offset(&self, instr: Instr) -> u64 {
        if instr.extra & MEM_OFFSET_POOLED != 0 {
            self.pre.pool[instr.operand as usize]
        } else {
            instr.operand as u64
        }
    }

    /// Pop an address by the memory's index width and add the static offset.
    fn pop_addr(&mut self, memory: &LinearMemory, offset: u64) -> ExecResult<u64> {
        let index = match memory.ty().width {
            AddrWidth::A32 => self.pop_u32() as u64,
            AddrWidth::A64 => self.pop_u64(),
        };
        index
            .checked_add(offset)
            .ok_or_else(|| TrapReason::OutOfBoundsMemoryAccess.into())
    }

    fn load_n<const N: usize>(&mut self, instr: Instr) -> ExecResult<[u8; N]> {
        let memory = self.memory(instr.extra);
        let offset = self.mem_offset(instr);
        let addr = self.pop_addr(&memory, offset)?;
        memory.load::<N>(addr).map_err(Into::into)
    }

    fn store_n<const N: usize>(&mut self, instr: Instr, bytes: [u8; N]) -> ExecResult<()> {
        let memory = self.memory(instr.extra);
        let offset = self.mem_offset(instr);
        let addr = self.pop_addr(&memory, offset)?;
        memory.store::<N>(addr, bytes).map_err(Into::into)
    }

    // Control helpers.

    /// Take a branch: move the label's arity values, unwind, jump.
    fn do_branch(&mut self, depth: u32, target_override: u32) -> u32 {
        let index = self.labels.len() - 1 - depth as usize;
        let label = self.labels[index];
        let arity = label.arity as usize;
        let keep_from = self.vm.stack.len() - arity;
        let dest = self.frame_base + label.height as usize;
        self.vm.stack.copy_within(keep_from.., dest);
        self.vm.stack.truncate(dest + arity);
        self.labels.truncate(index);
        if target_override != u32::MAX {
            target_override
        } else {
            label.target
        }
    }

    /// Deliver an in-flight exception to the innermost matching handler in
    /// this frame, or report it unhandled.
    fn deliver(&mut self, exn_word: Word) -> ExecResult<Option<u32>> {
        let index = RefRepr::decode(exn_word);
        let RefRepr::Exn(arena_index) = index else {
            return Err(TrapReason::NullReference.into());
        };
        let (exn_tag, payload_len) = {
            let exn = self.vm.store.exns.get(arena_index)?;
            (exn.tag, exn.payload.len())
        };
        for pos in (0..self.labels.len()).rev() {
            let table = self.labels[pos].try_table;
            if table < 0 {
                continue;
            }
            let info = &self.pre.try_tables[table as usize];
            for clause in info.clauses.clone() {
                let tag_matches = match clause.tag {
                    None => true,
                    Some(local_tag) => {
                        self.vm.store.instances[self.instance].tags[local_tag as usize]
                            == exn_tag
                    }
                };
                if !tag_matches {
                    continue;
                }
                // Unwind to the try block, then branch like the clause's
                // label, pushing payload and/or the exnref.
                self.labels.truncate(pos + 1);
                let keep = self.labels.len() - clause.pop_labels as usize;
                let target_label = self.labels[keep];
                self.vm
                    .stack
                    .truncate(self.frame_base + target_label.height as usize);
                self.labels.truncate(keep);
                if clause.tag.is_some() {
                    for i in 0..payload_len {
                        let cell = self.vm.store.exns.get(arena_index)?.payload[i];
                        self.push(cell)?;
                    }
                }
                if clause.with_ref {
                    self.push(exn_word as u128)?;
                }
                return Ok(Some(clause.target));
            }
        }
        Ok(None)
    }

    fn throw(&mut self, exn_word: Word) -> ExecResult<u32> {
        match self.deliver(exn_word)? {
            Some(pc) => Ok(pc),
            None => Err(RuntimeError::Thrown(exn_word)),
        }
    }

    /// Run a callee, catching exceptions against this frame's handlers.
    fn call_into(&mut self, addr: usize, args: Vec<u128>) -> ExecResult<Option<u32>> {
        match self.vm.call_function(addr, args) {
            Ok(results) => {
                for cell in results {
                    self.push(cell)?;
                }
                Ok(None)
            }
            Err(RuntimeError::Thrown(word)) => match self.deliver(word)? {
                Some(pc) => Ok(Some(pc)),
                None => Err(RuntimeError::Thrown(word)),
            },
            Err(e) => Err(e),
        }
    }

    fn pop_args(&mut self, count: usize) -> Vec<u128> {
        let split = self.vm.stack.len() - count;
        self.vm.stack.split_off(split)
    }

    fn func_sig(&self, addr: usize) -> (usize, usize) {
        let id = self.vm.store.func(addr).type_id;
        match self.vm.store.registry.func_type(id) {
            Some(ft) => (ft.params.len(), ft.results.len()),
            None => (0, 0),
        }
    }

    fn resolve_callee_indirect(&mut self, instr: Instr) -> ExecResult<usize> {
        let table_addr =
            self.vm.store.instances[self.instance].tables[instr.extra as usize];
        let width = self.vm.store.tables[table_addr].ty.width;
        let index = match width {
            AddrWidth::A32 => self.pop_u32() as u64,
            AddrWidth::A64 => self.pop_u64(),
        };
        let table = &self.vm.store.tables[table_addr];
        if index >= table.size() {
            return Err(TrapReason::UndefinedElement.into());
        }
        let word = table.get(index)?;
        let addr = match RefRepr::decode(word) {
            RefRepr::Func(addr) => addr,
            RefRepr::Null => return Err(TrapReason::UninitializedElement.into()),
            _ => return Err(TrapReason::UndefinedElement.into()),
        };
        let actual = self.vm.store.func(addr).type_id;
        let expected = TypeId(instr.operand);
        if !self.vm.store.registry.is_subtype(actual, expected) {
            return Err(TrapReason::IndirectCallTypeMismatch.into());
        }
        Ok(addr)
    }

    fn resolve_callee_ref(&mut self) -> ExecResult<usize> {
        let word = self.pop_u64();
        match RefRepr::decode(word) {
            RefRepr::Func(addr) => Ok(addr),
            RefRepr::Null => Err(TrapReason::NullReference.into()),
            _ => Err(TrapReason::UndefinedElement.into()),
        }
    }

    // The main loop. Returns `Some(tail)` for a tail-call replacement.

    fn exec_loop(&mut self) -> ExecResult<Option<ExecuteState>> {
        let pre = Arc::clone(&self.pre);
        let code = &pre.code;
        let mut pc = 0usize;

        while pc < code.len() {
            let instr = code[pc];
            pc += 1;
            match self.step(instr, code, &mut pc)? {
                Step::Next => {}
                Step::Tail(addr, args) => {
                    self.vm.stack.truncate(self.locals_base);
                    return Ok(Some(ExecuteState::Tail(addr, args)));
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, instr: Instr, code: &[Instr], pc: &mut usize) -> ExecResult<Step> {
        use Op::*;

        match instr.op {
            Nop | Aux | End => {
                if instr.op == End {
                    self.labels.pop();
                }
            }
            Unreachable => return Err(TrapReason::Unreachable.into()),

            Block | TryTable => {
                let target = code[*pc].operand;
                self.labels.push(Label {
                    target,
                    height: self.height(),
                    arity: instr.extra,
                    try_table: if instr.op == TryTable {
                        instr.operand as i32
                    } else {
                        -1
                    },
                });
                *pc += 1;
            }
            Loop => {
                self.vm.fuel_charge()?;
                self.labels.push(Label {
                    target: (*pc - 1) as u32,
                    height: self.height() - instr.extra as u32,
                    arity: instr.extra,
                    try_table: -1,
                });
            }
            If => {
                let target = code[*pc].operand;
                let cond = self.pop_u32();
                self.labels.push(Label {
                    target,
                    height: self.height(),
                    arity: instr.extra,
                    try_table: -1,
                });
                if cond == 0 {
                    *pc = instr.operand as usize;
                } else {
                    *pc += 1;
                }
            }
            Else => {
                // Reached only by falling out of the then branch.
                *pc = instr.operand as usize;
            }

            Br => {
                if instr.operand as usize <= *pc {
                    self.vm.fuel_charge()?;
                }
                *pc = self.do_branch(instr.extra as u32, instr.operand) as usize;
            }
            BrIf => {
                if self.pop_u32() != 0 {
                    if instr.operand as usize <= *pc {
                        self.vm.fuel_charge()?;
                    }
                    *pc = self.do_branch(instr.extra as u32, instr.operand) as usize;
                }
            }
            BrTable => {
                let count = instr.operand as usize;
                let index = (self.pop_u32() as usize).min(count - 1);
                let entry = code[*pc + index];
                *pc = self.do_branch(entry.extra as u32, entry.operand) as usize;
            }
            Return => {
                *pc = self.do_branch(self.labels.len() as u32 - 1, u32::MAX) as usize;
            }

            Call => {
                let addr = self.vm.store.instances[self.instance].funcs
                    [instr.operand as usize];
                let (params, _) = self.func_sig(addr);
                let args = self.pop_args(params);
                if let Some(resume) = self.call_into(addr, args)? {
                    *pc = resume as usize;
                }
            }
            CallIndirect => {
                let addr = self.resolve_callee_indirect(instr)?;
                let (params, _) = self.func_sig(addr);
                let args = self.pop_args(params);
                if let Some(resume) = self.call_into(addr, args)? {
                    *pc = resume as usize;
                }
            }
            CallRef => {
                let addr = self.resolve_callee_ref()?;
                let (params, _) = self.func_sig(addr);
                let args = self.pop_args(params);
                if let Some(resume) = self.call_into(addr, args)? {
                    *pc = resume as usize;
                }
            }
            ReturnCall => {
                let addr = self.vm.store.instances[self.instance].funcs
                    [instr.operand as usize];
                let (params, _) = self.func_sig(addr);
                let args = self.pop_args(params);
                return Ok(Step::Tail(addr, args));
            }
            ReturnCallIndirect => {
                let addr = self.resolve_callee_indirect(instr)?;
                let (params, _) = self.func_sig(addr);
                let args = self.pop_args(params);
                return Ok(Step::Tail(addr, args));
            }
            ReturnCallRef => {
                let addr = self.resolve_callee_ref()?;
                let (params, _) = self.func_sig(addr);
                let args = self.pop_args(params);
                return Ok(Step::Tail(addr, args));
            }

            Throw => {
                let tag_addr = self.vm.store.instances[self.instance].tags
                    [instr.operand as usize];
                let count = self.vm.store.tags[tag_addr].param_count;
                let payload = self.pop_args(count);
                let index = self.vm.store.exns.alloc(tag_addr, payload);
                let word = RefRepr::Exn(index).encode();
                *pc = self.throw(word)? as usize;
            }
            ThrowRef => {
                let word = self.pop_u64();
                if RefRepr::is_null(word) {
                    return Err(TrapReason::NullReference.into());
                }
                *pc = self.throw(word)? as usize;
            }

            Drop => {
                self.pop();
            }
            Select => {
                let cond = self.pop_u32();
                let b = self.pop();
                let a = self.pop();
                self.push(if cond != 0 { a } else { b })?;
            }

            LocalGet => {
                let cell = self.local(instr.operand);
                self.push(cell)?;
            }
            LocalGetPair => {
                let a = self.local(instr.extra as u32);
                let b = self.local(instr.operand);
                self.push(a)?;
                self.push(b)?;
            }
            LocalGetConst32 => {
                let a = self.local(instr.extra as u32);
                self.push(a)?;
                self.push_u32(instr.operand);
            }
            I32CmpLocals => {
                let a = self.local(instr.operand & 0xFFFF) as u32;
                let b = self.local(instr.operand >> 16) as u32;
                let result = eval_i32_cmp(instr.extra, a, b);
                self.push_u32(u32::from(result));
            }
            LocalSet => {
                let cell = self.pop();
                self.set_local(instr.operand, cell);
            }
            LocalTee => {
                let cell = *self.vm.stack.last().unwrap_or(&0);
                self.set_local(instr.operand, cell);
            }
            GlobalGet => {
                let addr =
                    self.vm.store.instances[self.instance].globals[instr.operand as usize];
                let cell = self.vm.store.globals[addr].cell();
                self.push(cell)?;
            }
            GlobalSet => {
                let addr =
                    self.vm.store.instances[self.instance].globals[instr.operand as usize];
                let cell = self.pop();
                self.vm.store.globals[addr].set_cell(cell);
            }

            TableGet => {
                let addr =
                    self.vm.store.instances[self.instance].tables[instr.operand as usize];
                let table = &self.vm.store.tables[addr];
                let index = match table.ty.width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                let word = self.vm.store.tables[addr].get(index)?;
                self.push_u64(word);
            }
            TableSet => {
                let addr =
                    self.vm.store.instances[self.instance].tables[instr.operand as usize];
                let value = self.pop_u64();
                let table = &self.vm.store.tables[addr];
                let index = match table.ty.width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                self.vm.store.tables[addr].set(index, value)?;
            }

            // Loads and stores.
            I32Load => {
                let b = self.load_n::<4>(instr)?;
                self.push_u32(u32::from_le_bytes(b));
            }
            I64Load => {
                let b = self.load_n::<8>(instr)?;
                self.push_u64(u64::from_le_bytes(b));
            }
            F32Load => {
                let b = self.load_n::<4>(instr)?;
                self.push_u32(u32::from_le_bytes(b));
            }
            F64Load => {
                let b = self.load_n::<8>(instr)?;
                self.push_u64(u64::from_le_bytes(b));
            }
            I32Load8S => {
                let b = self.load_n::<1>(instr)?;
                self.push_u32(b[0] as i8 as i32 as u32);
            }
            I32Load8U => {
                let b = self.load_n::<1>(instr)?;
                self.push_u32(b[0] as u32);
            }
            I32Load16S => {
                let b = self.load_n::<2>(instr)?;
                self.push_u32(i16::from_le_bytes(b) as i32 as u32);
            }
            I32Load16U => {
                let b = self.load_n::<2>(instr)?;
                self.push_u32(u16::from_le_bytes(b) as u32);
            }
            I64Load8S => {
                let b = self.load_n::<1>(instr)?;
                self.push_u64(b[0] as i8 as i64 as u64);
            }
            I64Load8U => {
                let b = self.load_n::<1>(instr)?;
                self.push_u64(b[0] as u64);
            }
            I64Load16S => {
                let b = self.load_n::<2>(instr)?;
                self.push_u64(i16::from_le_bytes(b) as i64 as u64);
            }
            I64Load16U => {
                let b = self.load_n::<2>(instr)?;
                self.push_u64(u16::from_le_bytes(b) as u64);
            }
            I64Load32S => {
                let b = self.load_n::<4>(instr)?;
                self.push_u64(i32::from_le_bytes(b) as i64 as u64);
            }
            I64Load32U => {
                let b = self.load_n::<4>(instr)?;
                self.push_u64(u32::from_le_bytes(b) as u64);
            }
            I32Store => {
                let v = self.pop_u32();
                self.store_n::<4>(instr, v.to_le_bytes())?;
            }
            I64Store => {
                let v = self.pop_u64();
                self.store_n::<8>(instr, v.to_le_bytes())?;
            }
            F32Store => {
                let v = self.pop_u32();
                self.store_n::<4>(instr, v.to_le_bytes())?;
            }
            F64Store => {
                let v = self.pop_u64();
                self.store_n::<8>(instr, v.to_le_bytes())?;
            }
            I32Store8 => {
                let v = self.pop_u32();
                self.store_n::<1>(instr, [v as u8])?;
            }
            I32Store16 => {
                let v = self.pop_u32();
                self.store_n::<2>(instr, (v as u16).to_le_bytes())?;
            }
            I64Store8 => {
                let v = self.pop_u64();
                self.store_n::<1>(instr, [v as u8])?;
            }
            I64Store16 => {
                let v = self.pop_u64();
                self.store_n::<2>(instr, (v as u16).to_le_bytes())?;
            }
            I64Store32 => {
                let v = self.pop_u64();
                self.store_n::<4>(instr, (v as u32).to_le_bytes())?;
            }

            MemorySize => {
                let memory = self.memory(instr.operand as u16);
                match memory.ty().width {
                    AddrWidth::A32 => self.push_u32(memory.pages() as u32),
                    AddrWidth::A64 => self.push_u64(memory.pages()),
                }
            }
            MemoryGrow => {
                let memory = self.memory(instr.operand as u16);
                let cap = self.vm.params.max_memory_bytes;
                let delta = match memory.ty().width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                let ceiling_hit = cap.is_some_and(|cap| {
                    memory
                        .pages()
                        .saturating_add(delta)
                        .saturating_mul(memory.ty().page_size())
                        > cap
                });
                let old = if ceiling_hit { -1 } else { memory.grow(delta) };
                match memory.ty().width {
                    AddrWidth::A32 => self.push_u32(old as i32 as u32),
                    AddrWidth::A64 => self.push_u64(old as u64),
                }
            }
            MemoryFill => {
                let memory = self.memory(instr.operand as u16);
                let len = match memory.ty().width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                let value = self.pop_u32() as u8;
                let dst = match memory.ty().width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                memory.fill(dst, value, len)?;
            }
            MemoryCopy => {
                let dst_mem = self.memory(instr.operand as u16);
                let src_mem = self.memory(instr.extra);
                let wide = dst_mem.ty().width.is_64() && src_mem.ty().width.is_64();
                let len = if wide { self.pop_u64() } else { self.pop_u32() as u64 };
                let src = match src_mem.ty().width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                let dst = match dst_mem.ty().width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                dst_mem.copy_within(dst, &src_mem, src, len)?;
            }
            MemoryInit => {
                let memory = self.memory(instr.extra);
                let len = self.pop_u32() as u64;
                let src = self.pop_u32() as u64;
                let dst = match memory.ty().width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                let bytes = self.vm.store.instances[self.instance]
                    .data_bytes(&self.module, instr.operand as usize, src, len)?;
                memory.write_from(dst, &bytes)?;
            }
            DataDrop => {
                self.vm.store.instances[self.instance].drop_data(instr.operand as usize);
            }

            TableInit | TableCopy | TableGrow | TableSize | TableFill | ElemDrop => {
                self.table_misc(instr)?;
            }

            // Constants.
            I32Const => self.push_u32(instr.operand),
            F32Const => self.push_u32(instr.operand),
            I64Const | F64Const => {
                let v = self.pre.pool[instr.operand as usize];
                self.push_u64(v);
            }

            // i32 arithmetic.
            I32Eqz => {
                let a = self.pop_u32();
                self.push_u32(u32::from(a == 0));
            }
            I32Eq => c32!(self, |a, b| a == b),
            I32Ne => c32!(self, |a, b| a != b),
            I32LtS => c32!(self, |a, b| (a as i32) < (b as i32)),
            I32LtU => c32!(self, |a: u32, b: u32| a < b),
            I32GtS => c32!(self, |a, b| (a as i32) > (b as i32)),
            I32GtU => c32!(self, |a: u32, b: u32| a > b),
            I32LeS => c32!(self, |a, b| (a as i32) <= (b as i32)),
            I32LeU => c32!(self, |a: u32, b: u32| a <= b),
            I32GeS => c32!(self, |a, b| (a as i32) >= (b as i32)),
            I32GeU => c32!(self, |a: u32, b: u32| a >= b),
            I32Clz => {
                let a = self.pop_u32();
                self.push_u32(a.leading_zeros());
            }
            I32Ctz => {
                let a = self.pop_u32();
                self.push_u32(a.trailing_zeros());
            }
            I32Popcnt => {
                let a = self.pop_u32();
                self.push_u32(a.count_ones());
            }
            I32Add => b32!(self, u32::wrapping_add),
            I32Sub => b32!(self, u32::wrapping_sub),
            I32Mul => b32!(self, u32::wrapping_mul),
            I32DivS => {
                let b = self.pop_u32() as i32;
                let a = self.pop_u32() as i32;
                self.push_u32(div_s32(a, b)? as u32);
            }
            I32DivU => {
                let b = self.pop_u32();
                let a = self.pop_u32();
                if b == 0 {
                    return Err(TrapReason::IntegerDivideByZero.into());
                }
                self.push_u32(a / b);
            }
            I32RemS => {
                let b = self.pop_u32() as i32;
                let a = self.pop_u32() as i32;
                if b == 0 {
                    return Err(TrapReason::IntegerDivideByZero.into());
                }
                self.push_u32(a.wrapping_rem(b) as u32);
            }
            I32RemU => {
                let b = self.pop_u32();
                let a = self.pop_u32();
                if b == 0 {
                    return Err(TrapReason::IntegerDivideByZero.into());
                }
                self.push_u32(a % b);
            }
            I32And => b32!(self, |a, b| a & b),
            I32Or => b32!(self, |a, b| a | b),
            I32Xor => b32!(self, |a, b| a ^ b),
            I32Shl => b32!(self, |a: u32, b: u32| a.wrapping_shl(b)),
            I32ShrS => b32!(self, |a: u32, b: u32| ((a as i32).wrapping_shr(b)) as u32),
            I32ShrU => b32!(self, |a: u32, b: u32| a.wrapping_shr(b)),
            I32Rotl => b32!(self, |a: u32, b: u32| a.rotate_left(b & 31)),
            I32Rotr => b32!(self, |a: u32, b: u32| a.rotate_right(b & 31)),

            // i64 arithmetic.
            I64Eqz => {
                let a = self.pop_u64();
                self.push_u32(u32::from(a == 0));
            }
            I64Eq => c64!(self, |a, b| a == b),
            I64Ne => c64!(self, |a, b| a != b),
            I64LtS => c64!(self, |a, b| (a as i64) < (b as i64)),
            I64LtU => c64!(self, |a: u64, b: u64| a < b),
            I64GtS => c64!(self, |a, b| (a as i64) > (b as i64)),
            I64GtU => c64!(self, |a: u64, b: u64| a > b),
            I64LeS => c64!(self, |a, b| (a as i64) <= (b as i64)),
            I64LeU => c64!(self, |a: u64, b: u64| a <= b),
            I64GeS => c64!(self, |a, b| (a as i64) >= (b as i64)),
            I64GeU => c64!(self, |a: u64, b: u64| a >= b),
            I64Clz => {
                let a = self.pop_u64();
                self.push_u64(a.leading_zeros() as u64);
            }
            I64Ctz => {
                let a = self.pop_u64();
                self.push_u64(a.trailing_zeros() as u64);
            }
            I64Popcnt => {
                let a = self.pop_u64();
                self.push_u64(a.count_ones() as u64);
            }
            I64Add => b64!(self, u64::wrapping_add),
            I64Sub => b64!(self, u64::wrapping_sub),
            I64Mul => b64!(self, u64::wrapping_mul),
            I64DivS => {
                let b = self.pop_u64() as i64;
                let a = self.pop_u64() as i64;
                self.push_u64(div_s64(a, b)? as u64);
            }
            I64DivU => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                if b == 0 {
                    return Err(TrapReason::IntegerDivideByZero.into());
                }
                self.push_u64(a / b);
            }
            I64RemS => {
                let b = self.pop_u64() as i64;
                let a = self.pop_u64() as i64;
                if b == 0 {
                    return Err(TrapReason::IntegerDivideByZero.into());
                }
                self.push_u64(a.wrapping_rem(b) as u64);
            }
            I64RemU => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                if b == 0 {
                    return Err(TrapReason::IntegerDivideByZero.into());
                }
                self.push_u64(a % b);
            }
            I64And => b64!(self, |a, b| a & b),
            I64Or => b64!(self, |a, b| a | b),
            I64Xor => b64!(self, |a, b| a ^ b),
            I64Shl => b64!(self, |a: u64, b: u64| a.wrapping_shl(b as u32)),
            I64ShrS => {
                b64!(self, |a: u64, b: u64| ((a as i64).wrapping_shr(b as u32)) as u64)
            }
            I64ShrU => b64!(self, |a: u64, b: u64| a.wrapping_shr(b as u32)),
            I64Rotl => b64!(self, |a: u64, b: u64| a.rotate_left((b & 63) as u32)),
            I64Rotr => b64!(self, |a: u64, b: u64| a.rotate_right((b & 63) as u32)),

            // Float arithmetic.
            F32Eq => {
                let b = self.pop_f32();
                let a = self.pop_f32();
                self.push_u32(u32::from(a == b));
            }
            F32Ne => {
                let b = self.pop_f32();
                let a = self.pop_f32();
                self.push_u32(u32::from(a != b));
            }
            F32Lt => {
                let b = self.pop_f32();
                let a = self.pop_f32();
                self.push_u32(u32::from(a < b));
            }
            F32Gt => {
                let b = self.pop_f32();
                let a = self.pop_f32();
                self.push_u32(u32::from(a > b));
            }
            F32Le => {
                let b = self.pop_f32();
                let a = self.pop_f32();
                self.push_u32(u32::from(a <= b));
            }
            F32Ge => {
                let b = self.pop_f32();
                let a = self.pop_f32();
                self.push_u32(u32::from(a >= b));
            }
            F64Eq => {
                let b = self.pop_f64();
                let a = self.pop_f64();
                self.push_u32(u32::from(a == b));
            }
            F64Ne => {
                let b = self.pop_f64();
                let a = self.pop_f64();
                self.push_u32(u32::from(a != b));
            }
            F64Lt => {
                let b = self.pop_f64();
                let a = self.pop_f64();
                self.push_u32(u32::from(a < b));
            }
            F64Gt => {
                let b = self.pop_f64();
                let a = self.pop_f64();
                self.push_u32(u32::from(a > b));
            }
            F64Le => {
                let b = self.pop_f64();
                let a = self.pop_f64();
                self.push_u32(u32::from(a <= b));
            }
            F64Ge => {
                let b = self.pop_f64();
                let a = self.pop_f64();
                self.push_u32(u32::from(a >= b));
            }

            F32Abs => {
                let a = self.pop_f32();
                self.push_f32(a.abs());
            }
            F32Neg => {
                let a = self.pop_f32();
                self.push_f32(-a);
            }
            F32Ceil => {
                let a = self.pop_f32();
                self.push_f32(a.ceil());
            }
            F32Floor => {
                let a = self.pop_f32();
                self.push_f32(a.floor());
            }
            F32Trunc => {
                let a = self.pop_f32();
                self.push_f32(a.trunc());
            }
            F32Nearest => {
                let a = self.pop_f32();
                self.push_f32(a.round_ties_even());
            }
            F32Sqrt => {
                let a = self.pop_f32();
                self.push_f32(a.sqrt());
            }
            F32Add => f32op!(self, |a, b| a + b),
            F32Sub => f32op!(self, |a, b| a - b),
            F32Mul => f32op!(self, |a, b| a * b),
            F32Div => f32op!(self, |a, b| a / b),
            F32Min => f32op!(self, wasm_fmin32),
            F32Max => f32op!(self, wasm_fmax32),
            F32Copysign => f32op!(self, f32::copysign),

            F64Abs => {
                let a = self.pop_f64();
                self.push_f64(a.abs());
            }
            F64Neg => {
                let a = self.pop_f64();
                self.push_f64(-a);
            }
            F64Ceil => {
                let a = self.pop_f64();
                self.push_f64(a.ceil());
            }
            F64Floor => {
                let a = self.pop_f64();
                self.push_f64(a.floor());
            }
            F64Trunc => {
                let a = self.pop_f64();
                self.push_f64(a.trunc());
            }
            F64Nearest => {
                let a = self.pop_f64();
                self.push_f64(a.round_ties_even());
            }
            F64Sqrt => {
                let a = self.pop_f64();
                self.push_f64(a.sqrt());
            }
            F64Add => f64op!(self, |a, b| a + b),
            F64Sub => f64op!(self, |a, b| a - b),
            F64Mul => f64op!(self, |a, b| a * b),
            F64Div => f64op!(self, |a, b| a / b),
            F64Min => f64op!(self, wasm_fmin64),
            F64Max => f64op!(self, wasm_fmax64),
            F64Copysign => f64op!(self, f64::copysign),

            // Conversions.
            I32WrapI64 => {
                let a = self.pop_u64();
                self.push_u32(a as u32);
            }
            I32TruncF32S => {
                let a = self.pop_f32();
                self.push_u32(trunc_i32_s(a as f64)? as u32);
            }
            I32TruncF32U => {
                let a = self.pop_f32();
                self.push_u32(trunc_i32_u(a as f64)?);
            }
            I32TruncF64S => {
                let a = self.pop_f64();
                self.push_u32(trunc_i32_s(a)? as u32);
            }
            I32TruncF64U => {
                let a = self.pop_f64();
                self.push_u32(trunc_i32_u(a)?);
            }
            I64ExtendI32S => {
                let a = self.pop_u32();
                self.push_u64(a as i32 as i64 as u64);
            }
            I64ExtendI32U => {
                let a = self.pop_u32();
                self.push_u64(a as u64);
            }
            I64TruncF32S => {
                let a = self.pop_f32();
                self.push_u64(trunc_i64_s(a as f64)? as u64);
            }
            I64TruncF32U => {
                let a = self.pop_f32();
                self.push_u64(trunc_i64_u(a as f64)?);
            }
            I64TruncF64S => {
                let a = self.pop_f64();
                self.push_u64(trunc_i64_s(a)? as u64);
            }
            I64TruncF64U => {
                let a = self.pop_f64();
                self.push_u64(trunc_i64_u(a)?);
            }
            F32ConvertI32S => {
                let a = self.pop_u32() as i32;
                self.push_f32(a as f32);
            }
            F32ConvertI32U => {
                let a = self.pop_u32();
                self.push_f32(a as f32);
            }
            F32ConvertI64S => {
                let a = self.pop_u64() as i64;
                self.push_f32(a as f32);
            }
            F32ConvertI64U => {
                let a = self.pop_u64();
                self.push_f32(a as f32);
            }
            F32DemoteF64 => {
                let a = self.pop_f64();
                self.push_f32(a as f32);
            }
            F64ConvertI32S => {
                let a = self.pop_u32() as i32;
                self.push_f64(a as f64);
            }
            F64ConvertI32U => {
                let a = self.pop_u32();
                self.push_f64(a as f64);
            }
            F64ConvertI64S => {
                let a = self.pop_u64() as i64;
                self.push_f64(a as f64);
            }
            F64ConvertI64U => {
                let a = self.pop_u64();
                self.push_f64(a as f64);
            }
            F64PromoteF32 => {
                let a = self.pop_f32();
                self.push_f64(a as f64);
            }
            I32ReinterpretF32 | I64ReinterpretF64 | F32ReinterpretI32
            | F64ReinterpretI64 => {
                // Bit patterns already travel verbatim.
            }
            I32Extend8S => {
                let a = self.pop_u32();
                self.push_u32(a as u8 as i8 as i32 as u32);
            }
            I32Extend16S => {
                let a = self.pop_u32();
                self.push_u32(a as u16 as i16 as i32 as u32);
            }
            I64Extend8S => {
                let a = self.pop_u64();
                self.push_u64(a as u8 as i8 as i64 as u64);
            }
            I64Extend16S => {
                let a = self.pop_u64();
                self.push_u64(a as u16 as i16 as i64 as u64);
            }
            I64Extend32S => {
                let a = self.pop_u64();
                self.push_u64(a as u32 as i32 as i64 as u64);
            }

            I32TruncSatF32S => {
                let a = self.pop_f32();
                self.push_u32(sat_i32_s(a as f64) as u32);
            }
            I32TruncSatF32U => {
                let a = self.pop_f32();
                self.push_u32(sat_i32_u(a as f64));
            }
            I32TruncSatF64S => {
                let a = self.pop_f64();
                self.push_u32(sat_i32_s(a) as u32);
            }
            I32TruncSatF64U => {
                let a = self.pop_f64();
                self.push_u32(sat_i32_u(a));
            }
            I64TruncSatF32S => {
                let a = self.pop_f32();
                self.push_u64(sat_i64_s(a as f64) as u64);
            }
            I64TruncSatF32U => {
                let a = self.pop_f32();
                self.push_u64(sat_i64_u(a as f64));
            }
            I64TruncSatF64S => {
                let a = self.pop_f64();
                self.push_u64(sat_i64_s(a) as u64);
            }
            I64TruncSatF64U => {
                let a = self.pop_f64();
                self.push_u64(sat_i64_u(a));
            }

            // Wide arithmetic.
            I64Add128 | I64Sub128 => {
                let rhs_hi = self.pop_u64() as u128;
                let rhs_lo = self.pop_u64() as u128;
                let lhs_hi = self.pop_u64() as u128;
                let lhs_lo = self.pop_u64() as u128;
                let lhs = lhs_lo | (lhs_hi << 64);
                let rhs = rhs_lo | (rhs_hi << 64);
                let out = if instr.op == I64Add128 {
                    lhs.wrapping_add(rhs)
                } else {
                    lhs.wrapping_sub(rhs)
                };
                self.push_u64(out as u64);
                self.push_u64((out >> 64) as u64);
            }
            I64MulWideS => {
                let b = self.pop_u64() as i64 as i128;
                let a = self.pop_u64() as i64 as i128;
                let out = (a * b) as u128;
                self.push_u64(out as u64);
                self.push_u64((out >> 64) as u64);
            }
            I64MulWideU => {
                let b = self.pop_u64() as u128;
                let a = self.pop_u64() as u128;
                let out = a * b;
                self.push_u64(out as u64);
                self.push_u64((out >> 64) as u64);
            }

            // References.
            RefNull => self.push_u64(0),
            RefIsNull => {
                let word = self.pop_u64();
                self.push_u32(u32::from(RefRepr::is_null(word)));
            }
            RefFunc => {
                let addr = self.vm.store.instances[self.instance].funcs
                    [instr.operand as usize];
                self.push_u64(RefRepr::Func(addr).encode());
            }
            RefEq => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                self.push_u32(u32::from(a == b));
            }
            RefAsNonNull => {
                let word = self.pop_u64();
                if RefRepr::is_null(word) {
                    return Err(TrapReason::NullReference.into());
                }
                self.push_u64(word);
            }
            BrOnNull => {
                let word = self.pop_u64();
                if RefRepr::is_null(word) {
                    *pc = self.do_branch(instr.extra as u32, instr.operand) as usize;
                } else {
                    self.push_u64(word);
                }
            }
            BrOnNonNull => {
                let word = self.pop_u64();
                if !RefRepr::is_null(word) {
                    self.push_u64(word);
                    *pc = self.do_branch(instr.extra as u32, instr.operand) as usize;
                }
            }

            RefTest | RefTestNull | RefCast | RefCastNull | BrOnCast | BrOnCastFail
            | StructNew | StructNewDefault | StructGet | StructGetS | StructGetU
            | StructSet | ArrayNew | ArrayNewDefault | ArrayNewFixed | ArrayNewData
            | ArrayNewElem | ArrayGet | ArrayGetS | ArrayGetU | ArraySet | ArrayLen
            | ArrayFill | ArrayCopy | ArrayInitData | ArrayInitElem
            | AnyConvertExtern | ExternConvertAny | RefI31 | I31GetS | I31GetU => {
                self.gc_step(instr, code, pc)?;
            }

            op if matches!(op.plane(), reef_asm::Plane::Simd) => {
                simd::step(self, instr, code, pc)?;
            }
            op if matches!(op.plane(), reef_asm::Plane::Atomic) => {
                self.atomic_step(instr)?;
            }

            other => {
                debug_assert!(false, "unhandled opcode {}", other.name());
                return Err(TrapReason::UnknownTrapReason.into());
            }
        }
        Ok(Step::Next)
    }
}

pub(super) enum Step {
    Next,
    Tail(usize, Vec<u128>),
}

// Numeric helpers shared with the register tier.

pub(super) fn div_s32(a: i32, b: i32) -> Result<i32, TrapReason> {
    if b == 0 {
        return Err(TrapReason::IntegerDivideByZero);
    }
    a.checked_div(b).ok_or(TrapReason::IntegerOverflow)
}

pub(super) fn div_s64(a: i64, b: i64) -> Result<i64, TrapReason> {
    if b == 0 {
        return Err(TrapReason::IntegerDivideByZero);
    }
    a.checked_div(b).ok_or(TrapReason::IntegerOverflow)
}

pub(super) fn wasm_fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

pub(super) fn wasm_fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

pub(super) fn wasm_fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

pub(super) fn wasm_fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

pub(super) fn trunc_i32_s(x: f64) -> Result<i32, TrapReason> {
    if x.is_nan() {
        return Err(TrapReason::InvalidConversionToInteger);
    }
    let t = x.trunc();
    if t < -2_147_483_648.0 || t > 2_147_483_647.0 {
        return Err(TrapReason::IntegerOverflow);
    }
    Ok(t as i32)
}

pub(super) fn trunc_i32_u(x: f64) -> Result<u32, TrapReason> {
    if x.is_nan() {
        return Err(TrapReason::InvalidConversionToInteger);
    }
    let t = x.trunc();
    if t < 0.0 || t > 4_294_967_295.0 {
        return Err(TrapReason::IntegerOverflow);
    }
    Ok(t as u32)
}

pub(super) fn trunc_i64_s(x: f64) -> Result<i64, TrapReason> {
    if x.is_nan() {
        return Err(TrapReason::InvalidConversionToInteger);
    }
    let t = x.trunc();
    // 2^63 is exactly representable; the valid range is [-2^63, 2^63).
    if t < -9_223_372_036_854_775_808.0 || t >= 9_223_372_036_854_775_808.0 {
        return Err(TrapReason::IntegerOverflow);
    }
    Ok(t as i64)
}

pub(super) fn trunc_i64_u(x: f64) -> Result<u64, TrapReason> {
    if x.is_nan() {
        return Err(TrapReason::InvalidConversionToInteger);
    }
    let t = x.trunc();
    if t < 0.0 || t >= 18_446_744_073_709_551_616.0 {
        return Err(TrapReason::IntegerOverflow);
    }
    Ok(t as u64)
}

pub(super) fn sat_i32_s(x: f64) -> i32 {
    if x.is_nan() {
        0
    } else {
        x.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }
}

pub(super) fn sat_i32_u(x: f64) -> u32 {
    if x.is_nan() {
        0
    } else {
        x.trunc().clamp(0.0, u32::MAX as f64) as u32
    }
}

pub(super) fn sat_i64_s(x: f64) -> i64 {
    if x.is_nan() {
        0
    } else {
        let t = x.trunc();
        if t >= 9_223_372_036_854_775_808.0 {
            i64::MAX
        } else if t <= -9_223_372_036_854_775_808.0 {
            i64::MIN
        } else {
            t as i64
        }
    }
}

pub(super) fn sat_i64_u(x: f64) -> u64 {
    if x.is_nan() {
        0
    } else {
        let t = x.trunc();
        if t >= 18_446_744_073_709_551_616.0 {
            u64::MAX
        } else if t <= 0.0 {
            0
        } else {
            t as u64
        }
    }
}

fn eval_i32_cmp(packed: u16, a: u32, b: u32) -> bool {
    match Op::from_packed(packed) {
        Some(Op::I32Eq) => a == b,
        Some(Op::I32Ne) => a != b,
        Some(Op::I32LtS) => (a as i32) < (b as i32),
        Some(Op::I32LtU) => a < b,
        Some(Op::I32GtS) => (a as i32) > (b as i32),
        Some(Op::I32GtU) => a > b,
        Some(Op::I32LeS) => (a as i32) <= (b as i32),
        Some(Op::I32LeU) => a <= b,
        Some(Op::I32GeS) => (a as i32) >= (b as i32),
        Some(Op::I32GeU) => a >= b,
        _ => false,
    }
}

// GC and atomic planes live in their own impl blocks below to keep the main
// dispatch readable.

impl Exec<'_, '_> {
    fn gc_heap_of(&mut self, word: Word) -> ExecResult<usize> {
        match RefRepr::decode(word) {
            RefRepr::Gc(index) => Ok(index),
            RefRepr::Null => Err(TrapReason::NullReference.into()),
            _ => Err(TrapReason::CastFailure.into()),
        }
    }

    /// Runtime type test of a reference word against a decoded heap type.
    fn ref_matches(&self, word: Word, heap: HeapType, nullable: bool) -> bool {
        let repr = RefRepr::decode(word);
        if matches!(repr, RefRepr::Null) {
            return nullable;
        }
        match heap {
            HeapType::Any => matches!(repr, RefRepr::Gc(_) | RefRepr::I31(_)),
            HeapType::Eq => matches!(repr, RefRepr::Gc(_) | RefRepr::I31(_)),
            HeapType::I31 => matches!(repr, RefRepr::I31(_)),
            HeapType::Struct => match repr {
                RefRepr::Gc(i) => {
                    matches!(self.vm.store.gc.get(i).map(|o| o.kind), Ok(GcKind::Struct))
                }
                _ => false,
            },
            HeapType::Array => match repr {
                RefRepr::Gc(i) => {
                    matches!(self.vm.store.gc.get(i).map(|o| o.kind), Ok(GcKind::Array))
                }
                _ => false,
            },
            HeapType::Func => matches!(repr, RefRepr::Func(_)),
            HeapType::Extern => matches!(repr, RefRepr::Extern(_)),
            HeapType::Exn => matches!(repr, RefRepr::Exn(_)),
            HeapType::None | HeapType::NoFunc | HeapType::NoExtern | HeapType::NoExn => {
                false
            }
            HeapType::Concrete(id) => {
                let expected = TypeId(id);
                match repr {
                    RefRepr::Gc(i) => match self.vm.store.gc.type_of(i) {
                        Ok(actual) => self.vm.store.registry.is_subtype(actual, expected),
                        Err(_) => false,
                    },
                    RefRepr::Func(addr) => {
                        let actual = self.vm.store.func(addr).type_id;
                        self.vm.store.registry.is_subtype(actual, expected)
                    }
                    _ => false,
                }
            }
        }
    }

    fn storage_of(&self, id: TypeId, field: usize) -> (StorageType, usize) {
        match &self.vm.store.registry.get(id).composite {
            CompositeType::Struct(st) => (st.fields[field].storage, st.fields.len()),
            CompositeType::Array(at) => (at.elem.storage, 0),
            CompositeType::Func(_) => (StorageType::Val(reef_types::ValType::I32), 0),
        }
    }

    fn pack_storage(storage: StorageType, cell: u128) -> u128 {
        match storage {
            StorageType::I8 => cell & 0xFF,
            StorageType::I16 => cell & 0xFFFF,
            StorageType::Val(_) => cell,
        }
    }

    fn unpack_storage(storage: StorageType, cell: u128, signed: bool) -> u128 {
        match storage {
            StorageType::I8 if signed => (cell as u8 as i8 as i32 as u32) as u128,
            StorageType::I16 if signed => (cell as u16 as i16 as i32 as u32) as u128,
            _ => cell,
        }
    }

    fn gc_step(&mut self, instr: Instr, code: &[Instr], pc: &mut usize) -> ExecResult<()> {
        use Op::*;
        match instr.op {
            StructNew | StructNewDefault => {
                let id = self.module.global_type_id(instr.operand);
                let CompositeType::Struct(st) =
                    self.vm.store.registry.get(id).composite.clone()
                else {
                    return Err(TrapReason::CastFailure.into());
                };
                let fields = if instr.op == StructNew {
                    let mut cells = self.pop_args(st.fields.len());
                    for (cell, field) in cells.iter_mut().zip(&st.fields) {
                        *cell = Self::pack_storage(field.storage, *cell);
                    }
                    cells
                } else {
                    vec![0u128; st.fields.len()]
                };
                let index = self.vm.store.gc.alloc_struct(id, fields);
                self.push_u64(RefRepr::Gc(index).encode());
            }
            StructGet | StructGetS | StructGetU => {
                let id = self.module.global_type_id(instr.operand);
                let field = instr.extra as usize;
                let (storage, _) = self.storage_of(id, field);
                let word = self.pop_u64();
                let heap = self.gc_heap_of(word)?;
                let cell = self.vm.store.gc.get(heap)?.fields[field];
                let cell = Self::unpack_storage(storage, cell, instr.op == StructGetS);
                self.push(cell)?;
            }
            StructSet => {
                let id = self.module.global_type_id(instr.operand);
                let field = instr.extra as usize;
                let (storage, _) = self.storage_of(id, field);
                let value = Self::pack_storage(storage, self.pop());
                let word = self.pop_u64();
                let heap = self.gc_heap_of(word)?;
                self.vm.store.gc.get_mut(heap)?.fields[field] = value;
            }
            ArrayNew | ArrayNewDefault => {
                let id = self.module.global_type_id(instr.operand);
                let (storage, _) = self.storage_of(id, 0);
                let len = self.pop_u32() as usize;
                let fill = if instr.op == ArrayNew {
                    Self::pack_storage(storage, self.pop())
                } else {
                    0
                };
                let index = self.vm.store.gc.alloc_array(id, vec![fill; len]);
                self.push_u64(RefRepr::Gc(index).encode());
            }
            ArrayNewFixed => {
                let id = self.module.global_type_id(instr.operand);
                let (storage, _) = self.storage_of(id, 0);
                let mut elems = self.pop_args(instr.extra as usize);
                for cell in &mut elems {
                    *cell = Self::pack_storage(storage, *cell);
                }
                let index = self.vm.store.gc.alloc_array(id, elems);
                self.push_u64(RefRepr::Gc(index).encode());
            }
            ArrayNewData | ArrayInitData => {
                let id = self.module.global_type_id(instr.operand);
                let (storage, _) = self.storage_of(id, 0);
                let width = storage_width(storage);
                if instr.op == ArrayNewData {
                    let len = self.pop_u32() as u64;
                    let src = self.pop_u32() as u64;
                    let bytes = self.vm.store.instances[self.instance].data_bytes(
                        &self.module,
                        instr.extra as usize,
                        src,
                        len * width as u64,
                    )?;
                    let elems: Vec<u128> = bytes
                        .chunks(width)
                        .map(|chunk| cell_from_le(chunk))
                        .collect();
                    let index = self.vm.store.gc.alloc_array(id, elems);
                    self.push_u64(RefRepr::Gc(index).encode());
                } else {
                    let len = self.pop_u32() as u64;
                    let src = self.pop_u32() as u64;
                    let dst = self.pop_u32() as u64;
                    let word = self.pop_u64();
                    let heap = self.gc_heap_of(word)?;
                    let bytes = self.vm.store.instances[self.instance].data_bytes(
                        &self.module,
                        instr.extra as usize,
                        src,
                        len * width as u64,
                    )?;
                    if dst + len > u64::from(self.vm.store.gc.array_len(heap)?) {
                        return Err(TrapReason::OutOfBoundsArrayAccess.into());
                    }
                    for (i, chunk) in bytes.chunks(width).enumerate() {
                        self.vm.store.gc.array_set(
                            heap,
                            dst + i as u64,
                            cell_from_le(chunk),
                        )?;
                    }
                }
            }
            ArrayNewElem | ArrayInitElem => {
                let elems = self.vm.store.instances[self.instance]
                    .elem_words(instr.extra as usize);
                if instr.op == ArrayNewElem {
                    let id = self.module.global_type_id(instr.operand);
                    let len = self.pop_u32() as usize;
                    let src = self.pop_u32() as usize;
                    if src + len > elems.len() {
                        return Err(TrapReason::OutOfBoundsTableAccess.into());
                    }
                    let cells: Vec<u128> =
                        elems[src..src + len].iter().map(|&w| w as u128).collect();
                    let index = self.vm.store.gc.alloc_array(id, cells);
                    self.push_u64(RefRepr::Gc(index).encode());
                } else {
                    let len = self.pop_u32() as usize;
                    let src = self.pop_u32() as usize;
                    let dst = self.pop_u32() as u64;
                    let word = self.pop_u64();
                    let heap = self.gc_heap_of(word)?;
                    if src + len > elems.len()
                        || dst + len as u64
                            > u64::from(self.vm.store.gc.array_len(heap)?)
                    {
                        return Err(TrapReason::OutOfBoundsArrayAccess.into());
                    }
                    for (i, &w) in elems[src..src + len].iter().enumerate() {
                        self.vm.store.gc.array_set(heap, dst + i as u64, w as u128)?;
                    }
                }
            }
            ArrayGet | ArrayGetS | ArrayGetU => {
                let id = self.module.global_type_id(instr.operand);
                let (storage, _) = self.storage_of(id, 0);
                let index = self.pop_u32() as u64;
                let word = self.pop_u64();
                let heap = self.gc_heap_of(word)?;
                let cell = self.vm.store.gc.array_get(heap, index)?;
                let cell = Self::unpack_storage(storage, cell, instr.op == ArrayGetS);
                self.push(cell)?;
            }
            ArraySet => {
                let id = self.module.global_type_id(instr.operand);
                let (storage, _) = self.storage_of(id, 0);
                let value = Self::pack_storage(storage, self.pop());
                let index = self.pop_u32() as u64;
                let word = self.pop_u64();
                let heap = self.gc_heap_of(word)?;
                self.vm.store.gc.array_set(heap, index, value)?;
            }
            ArrayLen => {
                let word = self.pop_u64();
                let heap = self.gc_heap_of(word)?;
                let len = self.vm.store.gc.array_len(heap)?;
                self.push_u32(len);
            }
            ArrayFill => {
                let id = self.module.global_type_id(instr.operand);
                let (storage, _) = self.storage_of(id, 0);
                let len = self.pop_u32() as u64;
                let value = Self::pack_storage(storage, self.pop());
                let start = self.pop_u32() as u64;
                let word = self.pop_u64();
                let heap = self.gc_heap_of(word)?;
                if start + len > u64::from(self.vm.store.gc.array_len(heap)?) {
                    return Err(TrapReason::OutOfBoundsArrayAccess.into());
                }
                for i in 0..len {
                    self.vm.store.gc.array_set(heap, start + i, value)?;
                }
            }
            ArrayCopy => {
                let len = self.pop_u32() as u64;
                let src_i = self.pop_u32() as u64;
                let src_word = self.pop_u64();
                let dst_i = self.pop_u32() as u64;
                let dst_word = self.pop_u64();
                let src = self.gc_heap_of(src_word)?;
                let dst = self.gc_heap_of(dst_word)?;
                if src_i + len > u64::from(self.vm.store.gc.array_len(src)?)
                    || dst_i + len > u64::from(self.vm.store.gc.array_len(dst)?)
                {
                    return Err(TrapReason::OutOfBoundsArrayAccess.into());
                }
                // Copy through a scratch buffer; src and dst may alias.
                let cells: Vec<u128> = (0..len)
                    .map(|i| self.vm.store.gc.array_get(src, src_i + i))
                    .collect::<Result<_, _>>()?;
                for (i, cell) in cells.into_iter().enumerate() {
                    self.vm.store.gc.array_set(dst, dst_i + i as u64, cell)?;
                }
            }
            RefTest | RefTestNull => {
                let heap = decode_heap(instr.extra, instr.operand);
                let word = self.pop_u64();
                let ok = self.ref_matches(word, heap, instr.op == RefTestNull);
                self.push_u32(u32::from(ok));
            }
            RefCast | RefCastNull => {
                let heap = decode_heap(instr.extra, instr.operand);
                let word = self.pop_u64();
                if !self.ref_matches(word, heap, instr.op == RefCastNull) {
                    return Err(TrapReason::CastFailure.into());
                }
                self.push_u64(word);
            }
            BrOnCast | BrOnCastFail => {
                let to = decode_heap(code[*pc + 1].extra, code[*pc + 1].operand);
                let flags = (code[*pc].extra >> 8) as u8;
                let word = *self.vm.stack.last().unwrap_or(&0) as u64;
                let matches = self.ref_matches(word, to, flags & 0x02 != 0);
                let take = matches == (instr.op == BrOnCast);
                if take {
                    *pc = self.do_branch(instr.extra as u32, instr.operand) as usize;
                } else {
                    *pc += 2;
                }
            }
            AnyConvertExtern | ExternConvertAny => {
                // Internal and external references share one word encoding;
                // the conversions are identity on the payload.
            }
            RefI31 => {
                let v = self.pop_u32() as i32;
                self.push_u64(RefRepr::I31((v << 1) >> 1).encode());
            }
            I31GetS | I31GetU => {
                let word = self.pop_u64();
                match RefRepr::decode(word) {
                    RefRepr::I31(v) => {
                        if instr.op == I31GetS {
                            self.push_u32(v as u32);
                        } else {
                            self.push_u32((v as u32) & 0x7FFF_FFFF);
                        }
                    }
                    RefRepr::Null => return Err(TrapReason::NullReference.into()),
                    _ => return Err(TrapReason::CastFailure.into()),
                }
            }
            _ => return Err(TrapReason::UnknownTrapReason.into()),
        }
        Ok(())
    }

    fn table_misc(&mut self, instr: Instr) -> ExecResult<()> {
        use Op::*;
        match instr.op {
            TableInit => {
                let table_addr =
                    self.vm.store.instances[self.instance].tables[instr.extra as usize];
                let len = self.pop_u32() as usize;
                let src = self.pop_u32() as usize;
                let table = &self.vm.store.tables[table_addr];
                let dst = match table.ty.width {
                    AddrWidth::A32 => self.pop_u32() as u64,
                    AddrWidth::A64 => self.pop_u64(),
                };
                let words = self.vm.store.instances[self.instance]
                    .elem_words(instr.operand as usize);
                if src + len > words.len() {
                    return Err(TrapReason::OutOfBoundsTableAccess.into());
                }
                let slice: Vec<Word> = words[src..src + len].to_vec();
                let table = &mut self.vm.store.tables[table_addr];
                if dst + len as u64 > table.size() {
                    return Err(TrapReason::OutOfBoundsTableAccess.into());
                }
                for (i, word) in slice.into_iter().enumerate() {
                    table.set(dst + i as u64, word)?;
                }
            }
            ElemDrop => {
                self.vm.store.instances[self.instance].drop_elem(instr.operand as usize);
            }
            TableCopy => {
                let dst_addr =
                    self.vm.store.instances[self.instance].tables[instr.operand as usize];
                let src_addr =
                    self.vm.store.instances[self.instance].tables[instr.extra as usize];
                let dst64 = self.vm.store.tables[dst_addr].ty.width.is_64();
                let src64 = self.vm.store.tables[src_addr].ty.width.is_64();
                let len = if dst64 && src64 {
                    self.pop_u64()
                } else {
                    self.pop_u32() as u64
                };
                let src = if src64 { self.pop_u64() } else { self.pop_u32() as u64 };
                let dst = if dst64 { self.pop_u64() } else { self.pop_u32() as u64 };
                if src + len > self.vm.store.tables[src_addr].size()
                    || dst + len > self.vm.store.tables[dst_addr].size()
                {
                    return Err(TrapReason::OutOfBoundsTableAccess.into());
                }
                let cells: Vec<Word> = (0..len)
                    .map(|i| self.vm.store.tables[src_addr].get(src + i))
                    .collect::<Result<_, _>>()?;
                for (i, cell) in cells.into_iter().enumerate() {
                    self.vm.store.tables[dst_addr].set(dst + i as u64, cell)?;
                }
            }
            TableGrow => {
                let addr =
                    self.vm.store.instances[self.instance].tables[instr.operand as usize];
                let is64 = self.vm.store.tables[addr].ty.width.is_64();
                let delta = if is64 { self.pop_u64() } else { self.pop_u32() as u64 };
                let init = self.pop_u64();
                let old = self.vm.store.tables[addr].grow(delta, init);
                if is64 {
                    self.push_u64(old as u64);
                } else {
                    self.push_u32(old as i32 as u32);
                }
            }
            TableSize => {
                let addr =
                    self.vm.store.instances[self.instance].tables[instr.operand as usize];
                let size = self.vm.store.tables[addr].size();
                if self.vm.store.tables[addr].ty.width.is_64() {
                    self.push_u64(size);
                } else {
                    self.push_u32(size as u32);
                }
            }
            TableFill => {
                let addr =
                    self.vm.store.instances[self.instance].tables[instr.operand as usize];
                let is64 = self.vm.store.tables[addr].ty.width.is_64();
                let len = if is64 { self.pop_u64() } else { self.pop_u32() as u64 };
                let value = self.pop_u64();
                let start = if is64 { self.pop_u64() } else { self.pop_u32() as u64 };
                self.vm.store.tables[addr].fill(start, value, len)?;
            }
            _ => return Err(TrapReason::UnknownTrapReason.into()),
        }
        Ok(())
    }

    fn atomic_step(&mut self, instr: Instr) -> ExecResult<()> {
        use std::sync::atomic::Ordering::SeqCst;
        use Op::*;

        let memory = self.memory(instr.extra);
        let offset = self.mem_offset(instr);

        macro_rules! rmw32 {
            ($width:expr, $f:expr) => {{
                let operand = self.pop_u32();
                let addr = self.pop_addr(&memory, offset)?;
                let old = atomic_rmw32(&memory, addr, $width, operand, $f)?;
                self.push_u32(old);
            }};
        }
        macro_rules! rmw64 {
            ($width:expr, $f:expr) => {{
                let operand = self.pop_u64();
                let addr = self.pop_addr(&memory, offset)?;
                let old = atomic_rmw64(&memory, addr, $width, operand, $f)?;
                self.push_u64(old);
            }};
        }

        match instr.op {
            AtomicFence => {
                std::sync::atomic::fence(SeqCst);
            }
            MemoryAtomicNotify => {
                let count = self.pop_u32();
                let addr = self.pop_addr(&memory, offset)?;
                let woken = memory.notify(addr, count)?;
                self.push_u32(woken);
            }
            MemoryAtomicWait32 => {
                let timeout = self.pop_u64() as i64;
                let expected = self.pop_u32();
                let addr = self.pop_addr(&memory, offset)?;
                let code = memory.wait(addr, WaitExpect::U32(expected), timeout)?;
                self.push_u32(code);
            }
            MemoryAtomicWait64 => {
                let timeout = self.pop_u64() as i64;
                let expected = self.pop_u64();
                let addr = self.pop_addr(&memory, offset)?;
                let code = memory.wait(addr, WaitExpect::U64(expected), timeout)?;
                self.push_u32(code);
            }

            I32AtomicLoad => {
                let addr = self.pop_addr(&memory, offset)?;
                self.push_u32(memory.atomic_u32(addr)?.load(SeqCst));
            }
            I64AtomicLoad => {
                let addr = self.pop_addr(&memory, offset)?;
                self.push_u64(memory.atomic_u64(addr)?.load(SeqCst));
            }
            I32AtomicLoad8U | I64AtomicLoad8U => {
                let addr = self.pop_addr(&memory, offset)?;
                let v = atomic_load_narrow(&memory, addr, 1)?;
                if instr.op == I32AtomicLoad8U {
                    self.push_u32(v as u32);
                } else {
                    self.push_u64(v);
                }
            }
            I32AtomicLoad16U | I64AtomicLoad16U => {
                let addr = self.pop_addr(&memory, offset)?;
                let v = atomic_load_narrow(&memory, addr, 2)?;
                if instr.op == I32AtomicLoad16U {
                    self.push_u32(v as u32);
                } else {
                    self.push_u64(v);
                }
            }
            I64AtomicLoad32U => {
                let addr = self.pop_addr(&memory, offset)?;
                let v = atomic_load_narrow(&memory, addr, 4)?;
                self.push_u64(v);
            }

            I32AtomicStore => {
                let v = self.pop_u32();
                let addr = self.pop_addr(&memory, offset)?;
                memory.atomic_u32(addr)?.store(v, SeqCst);
            }
            I64AtomicStore => {
                let v = self.pop_u64();
                let addr = self.pop_addr(&memory, offset)?;
                memory.atomic_u64(addr)?.store(v, SeqCst);
            }
            I32AtomicStore8 | I64AtomicStore8 => {
                let v = if instr.op == I32AtomicStore8 {
                    self.pop_u32() as u64
                } else {
                    self.pop_u64()
                };
                let addr = self.pop_addr(&memory, offset)?;
                atomic_store_narrow(&memory, addr, 1, v)?;
            }
            I32AtomicStore16 | I64AtomicStore16 => {
                let v = if instr.op == I32AtomicStore16 {
                    self.pop_u32() as u64
                } else {
                    self.pop_u64()
                };
                let addr = self.pop_addr(&memory, offset)?;
                atomic_store_narrow(&memory, addr, 2, v)?;
            }
            I64AtomicStore32 => {
                let v = self.pop_u64();
                let addr = self.pop_addr(&memory, offset)?;
                atomic_store_narrow(&memory, addr, 4, v)?;
            }

            I32AtomicRmwAdd => rmw32!(4, |a, b| a.wrapping_add(b)),
            I32AtomicRmw8AddU => rmw32!(1, |a, b| a.wrapping_add(b)),
            I32AtomicRmw16AddU => rmw32!(2, |a, b| a.wrapping_add(b)),
            I64AtomicRmwAdd => rmw64!(8, |a, b| a.wrapping_add(b)),
            I64AtomicRmw8AddU => rmw64!(1, |a, b| a.wrapping_add(b)),
            I64AtomicRmw16AddU => rmw64!(2, |a, b| a.wrapping_add(b)),
            I64AtomicRmw32AddU => rmw64!(4, |a, b| a.wrapping_add(b)),

            I32AtomicRmwSub => rmw32!(4, |a, b| a.wrapping_sub(b)),
            I32AtomicRmw8SubU => rmw32!(1, |a, b| a.wrapping_sub(b)),
            I32AtomicRmw16SubU => rmw32!(2, |a, b| a.wrapping_sub(b)),
            I64AtomicRmwSub => rmw64!(8, |a, b| a.wrapping_sub(b)),
            I64AtomicRmw8SubU => rmw64!(1, |a, b| a.wrapping_sub(b)),
            I64AtomicRmw16SubU => rmw64!(2, |a, b| a.wrapping_sub(b)),
            I64AtomicRmw32SubU => rmw64!(4, |a, b| a.wrapping_sub(b)),

            I32AtomicRmwAnd => rmw32!(4, |a, b| a & b),
            I32AtomicRmw8AndU => rmw32!(1, |a, b| a & b),
            I32AtomicRmw16AndU => rmw32!(2, |a, b| a & b),
            I64AtomicRmwAnd => rmw64!(8, |a, b| a & b),
            I64AtomicRmw8AndU => rmw64!(1, |a, b| a & b),
            I64AtomicRmw16AndU => rmw64!(2, |a, b| a & b),
            I64AtomicRmw32AndU => rmw64!(4, |a, b| a & b),

            I32AtomicRmwOr => rmw32!(4, |a, b| a | b),
            I32AtomicRmw8OrU => rmw32!(1, |a, b| a | b),
            I32AtomicRmw16OrU => rmw32!(2, |a, b| a | b),
            I64AtomicRmwOr => rmw64!(8, |a, b| a | b),
            I64AtomicRmw8OrU => rmw64!(1, |a, b| a | b),
            I64AtomicRmw16OrU => rmw64!(2, |a, b| a | b),
            I64AtomicRmw32OrU => rmw64!(4, |a, b| a | b),

            I32AtomicRmwXor => rmw32!(4, |a, b| a ^ b),
            I32AtomicRmw8XorU => rmw32!(1, |a, b| a ^ b),
            I32AtomicRmw16XorU => rmw32!(2, |a, b| a ^ b),
            I64AtomicRmwXor => rmw64!(8, |a, b| a ^ b),
            I64AtomicRmw8XorU => rmw64!(1, |a, b| a ^ b),
            I64AtomicRmw16XorU => rmw64!(2, |a, b| a ^ b),
            I64AtomicRmw32XorU => rmw64!(4, |a, b| a ^ b),

            I32AtomicRmwXchg => rmw32!(4, |_, b| b),
            I32AtomicRmw8XchgU => rmw32!(1, |_, b| b),
            I32AtomicRmw16XchgU => rmw32!(2, |_, b| b),
            I64AtomicRmwXchg => rmw64!(8, |_, b| b),
            I64AtomicRmw8XchgU => rmw64!(1, |_, b| b),
            I64AtomicRmw16XchgU => rmw64!(2, |_, b| b),
            I64AtomicRmw32XchgU => rmw64!(4, |_, b| b),

            I32AtomicRmwCmpxchg | I32AtomicRmw8CmpxchgU | I32AtomicRmw16CmpxchgU => {
                let width = match instr.op {
                    I32AtomicRmwCmpxchg => 4,
                    I32AtomicRmw8CmpxchgU => 1,
                    _ => 2,
                };
                let replacement = self.pop_u32() as u64;
                let expected = self.pop_u32() as u64;
                let addr = self.pop_addr(&memory, offset)?;
                let old = atomic_cmpxchg(&memory, addr, width, expected, replacement)?;
                self.push_u32(old as u32);
            }
            I64AtomicRmwCmpxchg | I64AtomicRmw8CmpxchgU | I64AtomicRmw16CmpxchgU
            | I64AtomicRmw32CmpxchgU => {
                let width = match instr.op {
                    I64AtomicRmwCmpxchg => 8,
                    I64AtomicRmw8CmpxchgU => 1,
                    I64AtomicRmw16CmpxchgU => 2,
                    _ => 4,
                };
                let replacement = self.pop_u64();
                let expected = self.pop_u64();
                let addr = self.pop_addr(&memory, offset)?;
                let old = atomic_cmpxchg(&memory, addr, width, expected, replacement)?;
                self.push_u64(old);
            }
            _ => return Err(TrapReason::UnknownTrapReason.into()),
        }
        Ok(())
    }
}

fn cell_from_le(chunk: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf[..chunk.len()].copy_from_slice(chunk);
    u128::from_le_bytes(buf)
}

fn storage_width(storage: StorageType) -> usize {
    match storage {
        StorageType::I8 => 1,
        StorageType::I16 => 2,
        StorageType::Val(reef_types::ValType::I32 | reef_types::ValType::F32) => 4,
        StorageType::Val(reef_types::ValType::V128) => 16,
        StorageType::Val(_) => 8,
    }
}

// Narrow atomics emulate on the containing 32-bit cell with a CAS loop, the
// way hardware without sub-word atomics does.

fn atomic_load_narrow(memory: &LinearMemory, addr: u64, width: u64) -> ExecResult<u64> {
    if addr % width != 0 {
        return Err(TrapReason::UnalignedAtomicAccess.into());
    }
    match width {
        4 => Ok(memory
            .atomic_u32(addr)?
            .load(std::sync::atomic::Ordering::SeqCst) as u64),
        _ => {
            let cell_addr = addr & !3;
            let shift = (addr - cell_addr) * 8;
            let mask = (1u64 << (width * 8)) - 1;
            let cell =
                memory.atomic_u32(cell_addr)?.load(std::sync::atomic::Ordering::SeqCst);
            Ok((u64::from(cell) >> shift) & mask)
        }
    }
}

fn atomic_store_narrow(
    memory: &LinearMemory,
    addr: u64,
    width: u64,
    value: u64,
) -> ExecResult<()> {
    atomic_rmw_narrow(memory, addr, width, value, |_, b| b).map(|_| ())
}

fn atomic_rmw_narrow(
    memory: &LinearMemory,
    addr: u64,
    width: u64,
    operand: u64,
    f: impl Fn(u64, u64) -> u64,
) -> ExecResult<u64> {
    use std::sync::atomic::Ordering::SeqCst;
    if addr % width != 0 {
        return Err(TrapReason::UnalignedAtomicAccess.into());
    }
    let cell_addr = addr & !3;
    let shift = ((addr - cell_addr) * 8) as u32;
    let mask = ((1u64 << (width * 8)) - 1) as u32;
    let cell = memory.atomic_u32(cell_addr)?;
    loop {
        let old_cell = cell.load(SeqCst);
        let old = (old_cell >> shift) & mask;
        let new = (f(u64::from(old), operand) as u32) & mask;
        let new_cell = (old_cell & !(mask << shift)) | (new << shift);
        if cell
            .compare_exchange(old_cell, new_cell, SeqCst, SeqCst)
            .is_ok()
        {
            return Ok(u64::from(old));
        }
    }
}

fn atomic_rmw32(
    memory: &LinearMemory,
    addr: u64,
    width: u64,
    operand: u32,
    f: impl Fn(u32, u32) -> u32,
) -> ExecResult<u32> {
    use std::sync::atomic::Ordering::SeqCst;
    if width == 4 {
        let cell = memory.atomic_u32(addr)?;
        let mut old = cell.load(SeqCst);
        loop {
            match cell.compare_exchange(old, f(old, operand), SeqCst, SeqCst) {
                Ok(_) => return Ok(old),
                Err(actual) => old = actual,
            }
        }
    } else {
        atomic_rmw_narrow(memory, addr, width, u64::from(operand), |a, b| {
            u64::from(f(a as u32, b as u32))
        })
        .map(|v| v as u32)
    }
}

fn atomic_rmw64(
    memory: &LinearMemory,
    addr: u64,
    width: u64,
    operand: u64,
    f: impl Fn(u64, u64) -> u64,
) -> ExecResult<u64> {
    use std::sync::atomic::Ordering::SeqCst;
    if width == 8 {
        let cell = memory.atomic_u64(addr)?;
        let mut old = cell.load(SeqCst);
        loop {
            match cell.compare_exchange(old, f(old, operand), SeqCst, SeqCst) {
                Ok(_) => return Ok(old),
                Err(actual) => old = actual,
            }
        }
    } else {
        atomic_rmw_narrow(memory, addr, width, operand, f)
    }
}

fn atomic_cmpxchg(
    memory: &LinearMemory,
    addr: u64,
    width: u64,
    expected: u64,
    replacement: u64,
) -> ExecResult<u64> {
    use std::sync::atomic::Ordering::SeqCst;
    match width {
        8 => {
            let cell = memory.atomic_u64(addr)?;
            Ok(match cell.compare_exchange(expected, replacement, SeqCst, SeqCst) {
                Ok(old) | Err(old) => old,
            })
        }
        4 => {
            let cell = memory.atomic_u32(addr)?;
            Ok(
                match cell.compare_exchange(
                    expected as u32,
                    replacement as u32,
                    SeqCst,
                    SeqCst,
                ) {
                    Ok(old) | Err(old) => old,
                } as u64,
            )
        }
        _ => {
            if addr % width != 0 {
                return Err(TrapReason::UnalignedAtomicAccess.into());
            }
            let mask = (1u64 << (width * 8)) - 1;
            atomic_rmw_narrow(memory, addr, width, replacement, move |old, repl| {
                if old == expected & mask {
                    repl
                } else {
                    old
                }
            })
        }
    }
}

// The vector tier reaches back into the frame through these.
impl Exec<'_, '_> {
    pub(super) fn simd_pop(&mut self) -> u128 {
        self.pop()
    }

    pub(super) fn simd_push(&mut self, cell: u128) -> ExecResult<()> {
        self.push(cell)
    }

    pub(super) fn simd_pop_u32(&mut self) -> u32 {
        self.pop_u32()
    }

    pub(super) fn simd_pop_u64(&mut self) -> u64 {
        self.pop_u64()
    }

    pub(super) fn simd_push_u32(&mut self, v: u32) {
        self.push_u32(v)
    }

    pub(super) fn simd_push_u64(&mut self, v: u64) {
        self.push_u64(v)
    }

    pub(super) fn simd_pool(&self, slot: u32) -> u128 {
        let lo = self.pre.pool[slot as usize] as u128;
        let hi = self.pre.pool[slot as usize + 1] as u128;
        lo | (hi << 64)
    }

    pub(super) fn simd_load_bytes(&mut self, instr: Instr, len: u64) -> ExecResult<(Arc<LinearMemory>, u64)> {
        let memory = self.memory(instr.extra);
        let offset = self.mem_offset(instr);
        let addr = self.pop_addr(&memory, offset)?;
        memory.check(addr, len)?;
        Ok((memory, addr))
    }
}
