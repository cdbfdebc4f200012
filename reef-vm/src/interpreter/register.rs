//! The register interpreter: the hot path for non-vector code.
//!
//! Reads register IR against a per-frame `u64` register file. Register
//! reads and writes are direct array indexing; the operand stack is not
//! touched at all. Back edges bump the function's promotion counter; once
//! it crosses the threshold the run either restarts through the JIT (when
//! the activation has not yet written anything observable) or finishes here
//! and lets the next entry compile.
//!
//! Value convention: i32 results are stored zero-extended, f32 as their
//! bit pattern in the low word, references as their tagged encoding.

use std::sync::Arc;

use reef_asm::{RegInstr, RegOp, TrapReason};
use reef_types::{AddrWidth, RefRepr, TypeId};

use crate::error::ExecResult;
use crate::lower::RegFunc;
use crate::memory::LinearMemory;
use crate::store::DerivedTier;

use super::stack::{
    div_s32, div_s64, sat_i32_s, sat_i32_u, sat_i64_s, sat_i64_u, trunc_i32_s,
    trunc_i32_u, trunc_i64_s, trunc_i64_u, wasm_fmax32, wasm_fmax64, wasm_fmin32,
    wasm_fmin64,
};
use super::Vm;
use crate::state::ExecuteState;

/// Execute one function in the register tier.
pub(super) fn run(
    vm: &mut Vm<'_>,
    addr: usize,
    func: &Arc<RegFunc>,
    args: &[u128],
) -> ExecResult<ExecuteState> {
    let (instance, can_compile) = {
        let wasm = vm.store.func(addr).wasm().expect("register tier runs wasm");
        let can_compile =
            vm.params.jit && matches!(wasm.tier.jit, DerivedTier::Pending);
        (wasm.instance, can_compile)
    };

    // Entry-time restart: hotness accumulated by earlier runs' back edges.
    if can_compile {
        let hotness = vm
            .store
            .func(addr)
            .wasm()
            .map(|w| w.tier.hotness)
            .unwrap_or(0);
        if hotness > vm.params.jit_backedge_threshold {
            return Ok(ExecuteState::JitRestart);
        }
    }

    let mut regs = vec![0u64; func.reg_count.max(1)];
    for (reg, cell) in regs.iter_mut().zip(args) {
        *reg = *cell as u64;
    }

    let mem0 = vm.store.instances[instance]
        .memories
        .first()
        .map(|&m| Arc::clone(&vm.store.memories[m].memory));

    let mut frame = RegExec {
        vm,
        func: Arc::clone(func),
        addr,
        instance,
        regs,
        mem0,
        backedges: 0,
        dirty: false,
        can_compile,
    };
    frame.exec()
}

struct RegExec<'vm, 'st> {
    vm: &'vm mut Vm<'st>,
    func: Arc<RegFunc>,
    addr: usize,
    instance: usize,
    regs: Vec<u64>,
    mem0: Option<Arc<LinearMemory>>,
    backedges: u32,
    /// Whether this activation performed an externally visible write. A
    /// clean activation may restart through the JIT; a dirty one must run
    /// to completion here.
    dirty: bool,
    can_compile: bool,
}

macro_rules! alu32 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = $self.regs[$i.rs1 as usize] as u32;
        let b = $self.regs[$i.rs2() as usize] as u32;
        $self.regs[$i.rd as usize] = $f(a, b) as u64;
    }};
}
macro_rules! alu32i {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = $self.regs[$i.rs1 as usize] as u32;
        $self.regs[$i.rd as usize] = $f(a, $i.operand) as u64;
    }};
}
macro_rules! alu64 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = $self.regs[$i.rs1 as usize];
        let b = $self.regs[$i.rs2() as usize];
        $self.regs[$i.rd as usize] = $f(a, b);
    }};
}
macro_rules! cmp32 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = $self.regs[$i.rs1 as usize] as u32;
        let b = $self.regs[$i.rs2() as usize] as u32;
        $self.regs[$i.rd as usize] = u64::from($f(a, b));
    }};
}
macro_rules! cmp64 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = $self.regs[$i.rs1 as usize];
        let b = $self.regs[$i.rs2() as usize];
        $self.regs[$i.rd as usize] = u64::from($f(a, b));
    }};
}
macro_rules! un {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = $self.regs[$i.rs1 as usize];
        $self.regs[$i.rd as usize] = $f(a);
    }};
}
macro_rules! fop32 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = f32::from_bits($self.regs[$i.rs1 as usize] as u32);
        let b = f32::from_bits($self.regs[$i.rs2() as usize] as u32);
        $self.regs[$i.rd as usize] = $f(a, b).to_bits() as u64;
    }};
}
macro_rules! fop64 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = f64::from_bits($self.regs[$i.rs1 as usize]);
        let b = f64::from_bits($self.regs[$i.rs2() as usize]);
        $self.regs[$i.rd as usize] = $f(a, b).to_bits();
    }};
}
macro_rules! fcmp32 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = f32::from_bits($self.regs[$i.rs1 as usize] as u32);
        let b = f32::from_bits($self.regs[$i.rs2() as usize] as u32);
        $self.regs[$i.rd as usize] = u64::from($f(a, b));
    }};
}
macro_rules! fcmp64 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = f64::from_bits($self.regs[$i.rs1 as usize]);
        let b = f64::from_bits($self.regs[$i.rs2() as usize]);
        $self.regs[$i.rd as usize] = u64::from($f(a, b));
    }};
}
macro_rules! fun32 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = f32::from_bits($self.regs[$i.rs1 as usize] as u32);
        $self.regs[$i.rd as usize] = $f(a).to_bits() as u64;
    }};
}
macro_rules! fun64 {
    ($self:ident, $i:ident, $f:expr) => {{
        let a = f64::from_bits($self.regs[$i.rs1 as usize]);
        $self.regs[$i.rd as usize] = $f(a).to_bits();
    }};
}
macro_rules! load {
    ($self:ident, $i:ident, $n:expr, $conv:expr) => {{
        let mem = $self.mem0()?;
        let addr = ($self.regs[$i.rs1 as usize] as u32 as u64) + $i.operand as u64;
        let bytes = mem.load::<$n>(addr)?;
        $self.regs[$i.rd as usize] = $conv(bytes);
    }};
}
macro_rules! store {
    ($self:ident, $i:ident, $n:expr, $conv:expr) => {{
        let mem = $self.mem0()?;
        let addr = ($self.regs[$i.rs1 as usize] as u32 as u64) + $i.operand as u64;
        let value = $self.regs[$i.rd as usize];
        mem.store::<$n>(addr, $conv(value))?;
        $self.dirty = true;
    }};
}

impl RegExec<'_, '_> {
    fn mem0(&self) -> Result<&Arc<LinearMemory>, TrapReason> {
        self.mem0
            .as_ref()
            .ok_or(TrapReason::OutOfBoundsMemoryAccess)
    }

    /// Account a back edge; decide whether to restart through the JIT.
    fn back_edge(&mut self) -> ExecResult<bool> {
        self.vm.fuel_charge()?;
        self.backedges += 1;
        if !self.can_compile {
            return Ok(false);
        }
        let hotness = self
            .vm
            .store
            .func(self.addr)
            .wasm()
            .map(|w| w.tier.hotness)
            .unwrap_or(0);
        Ok(!self.dirty
            && hotness.saturating_add(self.backedges)
                > self.vm.params.jit_backedge_threshold)
    }

    fn persist_hotness(&mut self) {
        if let Some(wasm) = self.vm.store.func_mut(self.addr).wasm_mut() {
            wasm.tier.hotness = wasm.tier.hotness.saturating_add(self.backedges);
        }
    }

    fn read_args(&self, code: &[RegInstr], first_aux: usize, count: usize) -> Vec<u128> {
        let mut args = Vec::with_capacity(count);
        let mut word_index = first_aux;
        let mut in_word = 0usize;
        for _ in 0..count {
            if in_word == RegInstr::ARGS_PER_AUX {
                word_index += 1;
                in_word = 0;
            }
            let reg = RegInstr::unpack_arg(code[word_index].operand, in_word);
            args.push(self.regs[reg as usize] as u128);
            in_word += 1;
        }
        args
    }

    #[allow(clippy::too_many_lines)]
    fn exec(&mut self) -> ExecResult<ExecuteState> {
        use RegOp as R;

        let func = Arc::clone(&self.func);
        let code = &func.code[..];
        let pool = &func.pool[..];
        let mut pc = 0usize;

        loop {
            let i = code[pc];
            pc += 1;
            match i.op {
                R::Nop | R::Aux => {}

                R::Mov => {
                    self.regs[i.rd as usize] = self.regs[i.rs1 as usize];
                }
                R::Const32 => {
                    self.regs[i.rd as usize] = i.operand as u64;
                }
                R::Const64 => {
                    self.regs[i.rd as usize] = pool[i.operand as usize];
                }

                R::Br => {
                    if i.operand as usize <= pc - 1 && self.back_edge()? {
                        self.persist_hotness();
                        return Ok(ExecuteState::JitRestart);
                    }
                    pc = i.operand as usize;
                }
                R::BrIf => {
                    if self.regs[i.rs1 as usize] as u32 != 0 {
                        if i.operand as usize <= pc - 1 && self.back_edge()? {
                            self.persist_hotness();
                            return Ok(ExecuteState::JitRestart);
                        }
                        pc = i.operand as usize;
                    }
                }
                R::BrIfNot => {
                    if self.regs[i.rs1 as usize] as u32 == 0 {
                        if i.operand as usize <= pc - 1 && self.back_edge()? {
                            self.persist_hotness();
                            return Ok(ExecuteState::JitRestart);
                        }
                        pc = i.operand as usize;
                    }
                }
                R::BrTable => {
                    let count = i.operand as usize;
                    let index =
                        (self.regs[i.rs1 as usize] as u32 as usize).min(count - 1);
                    let target = code[pc + index].operand as usize;
                    if target <= pc - 1 && self.back_edge()? {
                        self.persist_hotness();
                        return Ok(ExecuteState::JitRestart);
                    }
                    pc = target;
                }
                R::Ret => {
                    self.persist_hotness();
                    let results = if i.rd != 0 {
                        vec![self.regs[i.rs1 as usize] as u128]
                    } else {
                        Vec::new()
                    };
                    return Ok(ExecuteState::Returned(results));
                }

                R::Call => {
                    let callee = self.vm.store.instances[self.instance].funcs
                        [i.operand as usize];
                    let (params, results) = self.callee_sig(callee);
                    let args = self.read_args(code, pc, params);
                    pc += aux_words(params);
                    self.dirty = true;
                    let out = self.vm.call_function(callee, args)?;
                    if results == 1 {
                        self.regs[i.rd as usize] =
                            out.first().copied().unwrap_or_default() as u64;
                    }
                }
                R::ReturnCall => {
                    let callee = self.vm.store.instances[self.instance].funcs
                        [i.operand as usize];
                    let (params, _) = self.callee_sig(callee);
                    let args = self.read_args(code, pc, params);
                    self.persist_hotness();
                    return Ok(ExecuteState::Tail(callee, args));
                }
                R::CallIndirect => {
                    let table_index = code[pc].operand as usize;
                    let results = code[pc].rd as usize;
                    let callee = self.resolve_indirect(
                        i.operand,
                        table_index,
                        self.regs[i.rs1 as usize],
                    )?;
                    let (params, _) = self.callee_sig(callee);
                    let args = self.read_args(code, pc + 1, params);
                    pc += 1 + aux_words(params);
                    self.dirty = true;
                    let out = self.vm.call_function(callee, args)?;
                    if results == 1 {
                        self.regs[i.rd as usize] =
                            out.first().copied().unwrap_or_default() as u64;
                    }
                }
                R::Select => {
                    let cond = self.regs[(i.operand >> 8) as u8 as usize] as u32;
                    let b = self.regs[i.rs2() as usize];
                    let a = self.regs[i.rs1 as usize];
                    self.regs[i.rd as usize] = if cond != 0 { a } else { b };
                }

                R::GlobalGet => {
                    self.regs[i.rd as usize] =
                        self.vm.store.globals[i.operand as usize].lo;
                }
                R::GlobalSet => {
                    self.dirty = true;
                    self.vm.store.globals[i.operand as usize].lo =
                        self.regs[i.rs1 as usize];
                }

                R::I32Load => load!(self, i, 4, |b| u32::from_le_bytes(b) as u64),
                R::I64Load => load!(self, i, 8, u64::from_le_bytes),
                R::F32Load => load!(self, i, 4, |b| u32::from_le_bytes(b) as u64),
                R::F64Load => load!(self, i, 8, u64::from_le_bytes),
                R::I32Load8S => load!(self, i, 1, |b: [u8; 1]| b[0] as i8 as i32 as u32
                    as u64),
                R::I32Load8U => load!(self, i, 1, |b: [u8; 1]| b[0] as u64),
                R::I32Load16S => load!(self, i, 2, |b| i16::from_le_bytes(b) as i32
                    as u32 as u64),
                R::I32Load16U => load!(self, i, 2, |b| u16::from_le_bytes(b) as u64),
                R::I64Load8S => load!(self, i, 1, |b: [u8; 1]| b[0] as i8 as i64 as u64),
                R::I64Load8U => load!(self, i, 1, |b: [u8; 1]| b[0] as u64),
                R::I64Load16S => load!(self, i, 2, |b| i16::from_le_bytes(b) as i64
                    as u64),
                R::I64Load16U => load!(self, i, 2, |b| u16::from_le_bytes(b) as u64),
                R::I64Load32S => load!(self, i, 4, |b| i32::from_le_bytes(b) as i64
                    as u64),
                R::I64Load32U => load!(self, i, 4, |b| u32::from_le_bytes(b) as u64),

                R::I32Store => store!(self, i, 4, |v| (v as u32).to_le_bytes()),
                R::I64Store => store!(self, i, 8, u64::to_le_bytes),
                R::F32Store => store!(self, i, 4, |v| (v as u32).to_le_bytes()),
                R::F64Store => store!(self, i, 8, u64::to_le_bytes),
                R::I32Store8 => store!(self, i, 1, |v| [v as u8]),
                R::I32Store16 => store!(self, i, 2, |v| (v as u16).to_le_bytes()),
                R::I64Store8 => store!(self, i, 1, |v| [v as u8]),
                R::I64Store16 => store!(self, i, 2, |v| (v as u16).to_le_bytes()),
                R::I64Store32 => store!(self, i, 4, |v| (v as u32).to_le_bytes()),

                R::MemorySize => {
                    let mem = self.mem0()?;
                    self.regs[i.rd as usize] = mem.pages();
                }
                R::MemoryGrow => {
                    self.dirty = true;
                    let delta = self.regs[i.rs1 as usize] as u32 as u64;
                    let mem = Arc::clone(self.mem0()?);
                    let cap = self.vm.params.max_memory_bytes;
                    let refused = cap.is_some_and(|cap| {
                        mem.pages()
                            .saturating_add(delta)
                            .saturating_mul(mem.ty().page_size())
                            > cap
                    });
                    let old = if refused { -1 } else { mem.grow(delta) };
                    self.regs[i.rd as usize] = old as i32 as u32 as u64;
                }
                R::MemoryFill => {
                    self.dirty = true;
                    let mem = Arc::clone(self.mem0()?);
                    let dst = self.regs[i.rs1 as usize] as u32 as u64;
                    let val = self.regs[i.rs2() as usize] as u8;
                    let len = self.regs[i.rd as usize] as u32 as u64;
                    mem.fill(dst, val, len)?;
                }
                R::MemoryCopy => {
                    self.dirty = true;
                    let mem = Arc::clone(self.mem0()?);
                    let dst = self.regs[i.rs1 as usize] as u32 as u64;
                    let src = self.regs[i.rs2() as usize] as u32 as u64;
                    let len = self.regs[i.rd as usize] as u32 as u64;
                    mem.copy_within(dst, &mem, src, len)?;
                }

                // i32 ALU.
                R::I32Add => alu32!(self, i, u32::wrapping_add),
                R::I32Sub => alu32!(self, i, u32::wrapping_sub),
                R::I32Mul => alu32!(self, i, u32::wrapping_mul),
                R::I32DivS => {
                    let a = self.regs[i.rs1 as usize] as i32;
                    let b = self.regs[i.rs2() as usize] as i32;
                    self.regs[i.rd as usize] = div_s32(a, b)? as u32 as u64;
                }
                R::I32DivU => {
                    let a = self.regs[i.rs1 as usize] as u32;
                    let b = self.regs[i.rs2() as usize] as u32;
                    if b == 0 {
                        return Err(TrapReason::IntegerDivideByZero.into());
                    }
                    self.regs[i.rd as usize] = (a / b) as u64;
                }
                R::I32RemS => {
                    let a = self.regs[i.rs1 as usize] as i32;
                    let b = self.regs[i.rs2() as usize] as i32;
                    if b == 0 {
                        return Err(TrapReason::IntegerDivideByZero.into());
                    }
                    self.regs[i.rd as usize] = a.wrapping_rem(b) as u32 as u64;
                }
                R::I32RemU => {
                    let a = self.regs[i.rs1 as usize] as u32;
                    let b = self.regs[i.rs2() as usize] as u32;
                    if b == 0 {
                        return Err(TrapReason::IntegerDivideByZero.into());
                    }
                    self.regs[i.rd as usize] = (a % b) as u64;
                }
                R::I32And => alu32!(self, i, |a, b| a & b),
                R::I32Or => alu32!(self, i, |a, b| a | b),
                R::I32Xor => alu32!(self, i, |a, b| a ^ b),
                R::I32Shl => alu32!(self, i, |a: u32, b: u32| a.wrapping_shl(b)),
                R::I32ShrS => {
                    alu32!(self, i, |a: u32, b: u32| (a as i32).wrapping_shr(b) as u32)
                }
                R::I32ShrU => alu32!(self, i, |a: u32, b: u32| a.wrapping_shr(b)),
                R::I32Rotl => alu32!(self, i, |a: u32, b: u32| a.rotate_left(b & 31)),
                R::I32Rotr => alu32!(self, i, |a: u32, b: u32| a.rotate_right(b & 31)),
                R::I32Eq => cmp32!(self, i, |a, b| a == b),
                R::I32Ne => cmp32!(self, i, |a, b| a != b),
                R::I32LtS => cmp32!(self, i, |a, b| (a as i32) < (b as i32)),
                R::I32LtU => cmp32!(self, i, |a: u32, b: u32| a < b),
                R::I32GtS => cmp32!(self, i, |a, b| (a as i32) > (b as i32)),
                R::I32GtU => cmp32!(self, i, |a: u32, b: u32| a > b),
                R::I32LeS => cmp32!(self, i, |a, b| (a as i32) <= (b as i32)),
                R::I32LeU => cmp32!(self, i, |a: u32, b: u32| a <= b),
                R::I32GeS => cmp32!(self, i, |a, b| (a as i32) >= (b as i32)),
                R::I32GeU => cmp32!(self, i, |a: u32, b: u32| a >= b),
                R::I32Eqz => un!(self, i, |a| u64::from(a as u32 == 0)),
                R::I32Clz => un!(self, i, |a| (a as u32).leading_zeros() as u64),
                R::I32Ctz => un!(self, i, |a| (a as u32).trailing_zeros() as u64),
                R::I32Popcnt => un!(self, i, |a| (a as u32).count_ones() as u64),

                // i32 immediate forms.
                R::I32AddImm => alu32i!(self, i, u32::wrapping_add),
                R::I32SubImm => alu32i!(self, i, u32::wrapping_sub),
                R::I32MulImm => alu32i!(self, i, u32::wrapping_mul),
                R::I32AndImm => alu32i!(self, i, |a, b| a & b),
                R::I32OrImm => alu32i!(self, i, |a, b| a | b),
                R::I32XorImm => alu32i!(self, i, |a, b| a ^ b),
                R::I32ShlImm => alu32i!(self, i, |a: u32, b: u32| a.wrapping_shl(b)),
                R::I32EqImm => alu32i!(self, i, |a, b| u32::from(a == b)),
                R::I32NeImm => alu32i!(self, i, |a, b| u32::from(a != b)),
                R::I32LtSImm => {
                    alu32i!(self, i, |a, b| u32::from((a as i32) < (b as i32)))
                }
                R::I32LtUImm => alu32i!(self, i, |a: u32, b: u32| u32::from(a < b)),
                R::I32GtSImm => {
                    alu32i!(self, i, |a, b| u32::from((a as i32) > (b as i32)))
                }
                R::I32LeSImm => {
                    alu32i!(self, i, |a, b| u32::from((a as i32) <= (b as i32)))
                }
                R::I32GeSImm => {
                    alu32i!(self, i, |a, b| u32::from((a as i32) >= (b as i32)))
                }
                R::I32GeUImm => alu32i!(self, i, |a: u32, b: u32| u32::from(a >= b)),

                // i64 ALU.
                R::I64Add => alu64!(self, i, u64::wrapping_add),
                R::I64Sub => alu64!(self, i, u64::wrapping_sub),
                R::I64Mul => alu64!(self, i, u64::wrapping_mul),
                R::I64DivS => {
                    let a = self.regs[i.rs1 as usize] as i64;
                    let b = self.regs[i.rs2() as usize] as i64;
                    self.regs[i.rd as usize] = div_s64(a, b)? as u64;
                }
                R::I64DivU => {
                    let a = self.regs[i.rs1 as usize];
                    let b = self.regs[i.rs2() as usize];
                    if b == 0 {
                        return Err(TrapReason::IntegerDivideByZero.into());
                    }
                    self.regs[i.rd as usize] = a / b;
                }
                R::I64RemS => {
                    let a = self.regs[i.rs1 as usize] as i64;
                    let b = self.regs[i.rs2() as usize] as i64;
                    if b == 0 {
                        return Err(TrapReason::IntegerDivideByZero.into());
                    }
                    self.regs[i.rd as usize] = a.wrapping_rem(b) as u64;
                }
                R::I64RemU => {
                    let a = self.regs[i.rs1 as usize];
                    let b = self.regs[i.rs2() as usize];
                    if b == 0 {
                        return Err(TrapReason::IntegerDivideByZero.into());
                    }
                    self.regs[i.rd as usize] = a % b;
                }
                R::I64And => alu64!(self, i, |a, b| a & b),
                R::I64Or => alu64!(self, i, |a, b| a | b),
                R::I64Xor => alu64!(self, i, |a, b| a ^ b),
                R::I64Shl => alu64!(self, i, |a: u64, b: u64| a.wrapping_shl(b as u32)),
                R::I64ShrS => alu64!(self, i, |a: u64, b: u64| (a as i64)
                    .wrapping_shr(b as u32)
                    as u64),
                R::I64ShrU => alu64!(self, i, |a: u64, b: u64| a.wrapping_shr(b as u32)),
                R::I64Rotl => {
                    alu64!(self, i, |a: u64, b: u64| a.rotate_left((b & 63) as u32))
                }
                R::I64Rotr => {
                    alu64!(self, i, |a: u64, b: u64| a.rotate_right((b & 63) as u32))
                }
                R::I64Eq => cmp64!(self, i, |a, b| a == b),
                R::I64Ne => cmp64!(self, i, |a, b| a != b),
                R::I64LtS => cmp64!(self, i, |a, b| (a as i64) < (b as i64)),
                R::I64LtU => cmp64!(self, i, |a: u64, b: u64| a < b),
                R::I64GtS => cmp64!(self, i, |a, b| (a as i64) > (b as i64)),
                R::I64GtU => cmp64!(self, i, |a: u64, b: u64| a > b),
                R::I64LeS => cmp64!(self, i, |a, b| (a as i64) <= (b as i64)),
                R::I64LeU => cmp64!(self, i, |a: u64, b: u64| a <= b),
                R::I64GeS => cmp64!(self, i, |a, b| (a as i64) >= (b as i64)),
                R::I64GeU => cmp64!(self, i, |a: u64, b: u64| a >= b),
                R::I64Eqz => un!(self, i, |a| u64::from(a == 0)),
                R::I64Clz => un!(self, i, |a: u64| a.leading_zeros() as u64),
                R::I64Ctz => un!(self, i, |a: u64| a.trailing_zeros() as u64),
                R::I64Popcnt => un!(self, i, |a: u64| a.count_ones() as u64),

                // Extensions and wraps.
                R::I32Extend8S => un!(self, i, |a| a as u8 as i8 as i32 as u32 as u64),
                R::I32Extend16S => {
                    un!(self, i, |a| a as u16 as i16 as i32 as u32 as u64)
                }
                R::I64Extend8S => un!(self, i, |a| a as u8 as i8 as i64 as u64),
                R::I64Extend16S => un!(self, i, |a| a as u16 as i16 as i64 as u64),
                R::I64Extend32S => un!(self, i, |a| a as u32 as i32 as i64 as u64),
                R::I64ExtendI32S => un!(self, i, |a| a as u32 as i32 as i64 as u64),
                R::I64ExtendI32U => un!(self, i, |a| a as u32 as u64),
                R::I32WrapI64 => un!(self, i, |a| a as u32 as u64),

                // f32 ALU.
                R::F32Add => fop32!(self, i, |a, b| a + b),
                R::F32Sub => fop32!(self, i, |a, b| a - b),
                R::F32Mul => fop32!(self, i, |a, b| a * b),
                R::F32Div => fop32!(self, i, |a, b| a / b),
                R::F32Min => fop32!(self, i, wasm_fmin32),
                R::F32Max => fop32!(self, i, wasm_fmax32),
                R::F32Copysign => fop32!(self, i, f32::copysign),
                R::F32Abs => fun32!(self, i, f32::abs),
                R::F32Neg => fun32!(self, i, |a: f32| -a),
                R::F32Ceil => fun32!(self, i, f32::ceil),
                R::F32Floor => fun32!(self, i, f32::floor),
                R::F32Trunc => fun32!(self, i, f32::trunc),
                R::F32Nearest => fun32!(self, i, f32::round_ties_even),
                R::F32Sqrt => fun32!(self, i, f32::sqrt),
                R::F32Eq => fcmp32!(self, i, |a, b| a == b),
                R::F32Ne => fcmp32!(self, i, |a, b| a != b),
                R::F32Lt => fcmp32!(self, i, |a, b| a < b),
                R::F32Gt => fcmp32!(self, i, |a, b| a > b),
                R::F32Le => fcmp32!(self, i, |a, b| a <= b),
                R::F32Ge => fcmp32!(self, i, |a, b| a >= b),

                // f64 ALU.
                R::F64Add => fop64!(self, i, |a, b| a + b),
                R::F64Sub => fop64!(self, i, |a, b| a - b),
                R::F64Mul => fop64!(self, i, |a, b| a * b),
                R::F64Div => fop64!(self, i, |a, b| a / b),
                R::F64Min => fop64!(self, i, wasm_fmin64),
                R::F64Max => fop64!(self, i, wasm_fmax64),
                R::F64Copysign => fop64!(self, i, f64::copysign),
                R::F64Abs => fun64!(self, i, f64::abs),
                R::F64Neg => fun64!(self, i, |a: f64| -a),
                R::F64Ceil => fun64!(self, i, f64::ceil),
                R::F64Floor => fun64!(self, i, f64::floor),
                R::F64Trunc => fun64!(self, i, f64::trunc),
                R::F64Nearest => fun64!(self, i, f64::round_ties_even),
                R::F64Sqrt => fun64!(self, i, f64::sqrt),
                R::F64Eq => fcmp64!(self, i, |a, b| a == b),
                R::F64Ne => fcmp64!(self, i, |a, b| a != b),
                R::F64Lt => fcmp64!(self, i, |a, b| a < b),
                R::F64Gt => fcmp64!(self, i, |a, b| a > b),
                R::F64Le => fcmp64!(self, i, |a, b| a <= b),
                R::F64Ge => fcmp64!(self, i, |a, b| a >= b),

                // Conversions.
                R::I32TruncF32S => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = trunc_i32_s(a as f64)? as u32 as u64;
                }
                R::I32TruncF32U => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = trunc_i32_u(a as f64)? as u64;
                }
                R::I32TruncF64S => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = trunc_i32_s(a)? as u32 as u64;
                }
                R::I32TruncF64U => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = trunc_i32_u(a)? as u64;
                }
                R::I64TruncF32S => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = trunc_i64_s(a as f64)? as u64;
                }
                R::I64TruncF32U => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = trunc_i64_u(a as f64)?;
                }
                R::I64TruncF64S => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = trunc_i64_s(a)? as u64;
                }
                R::I64TruncF64U => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = trunc_i64_u(a)?;
                }
                R::I32TruncSatF32S => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = sat_i32_s(a as f64) as u32 as u64;
                }
                R::I32TruncSatF32U => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = sat_i32_u(a as f64) as u64;
                }
                R::I32TruncSatF64S => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = sat_i32_s(a) as u32 as u64;
                }
                R::I32TruncSatF64U => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = sat_i32_u(a) as u64;
                }
                R::I64TruncSatF32S => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = sat_i64_s(a as f64) as u64;
                }
                R::I64TruncSatF32U => {
                    let a = f32::from_bits(self.regs[i.rs1 as usize] as u32);
                    self.regs[i.rd as usize] = sat_i64_u(a as f64);
                }
                R::I64TruncSatF64S => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = sat_i64_s(a) as u64;
                }
                R::I64TruncSatF64U => {
                    let a = f64::from_bits(self.regs[i.rs1 as usize]);
                    self.regs[i.rd as usize] = sat_i64_u(a);
                }
                R::F32ConvertI32S => {
                    un!(self, i, |a| (a as u32 as i32 as f32).to_bits() as u64)
                }
                R::F32ConvertI32U => {
                    un!(self, i, |a| (a as u32 as f32).to_bits() as u64)
                }
                R::F32ConvertI64S => {
                    un!(self, i, |a| (a as i64 as f32).to_bits() as u64)
                }
                R::F32ConvertI64U => un!(self, i, |a: u64| (a as f32).to_bits() as u64),
                R::F64ConvertI32S => {
                    un!(self, i, |a| (a as u32 as i32 as f64).to_bits())
                }
                R::F64ConvertI32U => un!(self, i, |a| (a as u32 as f64).to_bits()),
                R::F64ConvertI64S => un!(self, i, |a| (a as i64 as f64).to_bits()),
                R::F64ConvertI64U => un!(self, i, |a: u64| (a as f64).to_bits()),
                R::F32DemoteF64 => {
                    un!(self, i, |a: u64| (f64::from_bits(a) as f32).to_bits() as u64)
                }
                R::F64PromoteF32 => un!(self, i, |a| {
                    (f32::from_bits(a as u32) as f64).to_bits()
                }),
                R::I32ReinterpretF32 | R::F32ReinterpretI32 => {
                    un!(self, i, |a| a as u32 as u64)
                }
                R::I64ReinterpretF64 | R::F64ReinterpretI64 => un!(self, i, |a| a),
            }
        }
    }

    fn callee_sig(&self, callee: usize) -> (usize, usize) {
        let id = self.vm.store.func(callee).type_id;
        match self.vm.store.registry.func_type(id) {
            Some(ft) => (ft.params.len(), ft.results.len()),
            None => (0, 0),
        }
    }

    fn resolve_indirect(
        &mut self,
        type_id: u32,
        table_index: usize,
        elem_index: u64,
    ) -> ExecResult<usize> {
        let table_addr = self.vm.store.instances[self.instance].tables[table_index];
        let table = &self.vm.store.tables[table_addr];
        let index = match table.ty.width {
            AddrWidth::A32 => elem_index as u32 as u64,
            AddrWidth::A64 => elem_index,
        };
        if index >= table.size() {
            return Err(TrapReason::UndefinedElement.into());
        }
        let word = table.get(index)?;
        let callee = match RefRepr::decode(word) {
            RefRepr::Func(addr) => addr,
            RefRepr::Null => return Err(TrapReason::UninitializedElement.into()),
            _ => return Err(TrapReason::UndefinedElement.into()),
        };
        let actual = self.vm.store.func(callee).type_id;
        if !self.vm.store.registry.is_subtype(actual, TypeId(type_id)) {
            return Err(TrapReason::IndirectCallTypeMismatch.into());
        }
        Ok(callee)
    }
}

fn aux_words(params: usize) -> usize {
    params.div_ceil(RegInstr::ARGS_PER_AUX)
}
