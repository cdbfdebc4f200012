//! x86-64 back end (SysV).
//!
//! Analogous to the AArch64 plan with the smaller register file:
//!
//! | role | registers |
//! |---|---|
//! | first 3 Wasm locals | rbx, r12, r13 (callee-saved) |
//! | bridge pointer | r14 (callee-saved) |
//! | memory base | r15 (callee-saved) |
//! | first 4 stack temporaries | r8..r11 (caller-saved) |
//! | scratch | rax, rcx, rdx |
//! | C-ABI marshalling | rdi, rsi, rdx, rcx, r8, r9 |
//! | FP cache | xmm2..xmm7 |
//!
//! The status returns in rax, a result in rdx. 32-bit operations use the
//! 32-bit register forms, whose implicit zero extension matches the value
//! convention for i32. A handful of shapes the ISA cannot express without
//! long sequences (Wasm float min/max, unsigned 64-bit int-to-float,
//! saturating truncation) are rejected; those functions stay on the
//! register interpreter, observable only as throughput.

use reef_asm::{RegInstr, RegOp, TrapReason};

use crate::lower::RegFunc;

use super::{bridge_offsets, buf::CodeBuf, CompileCtx, CompiledFunc};

const OUT_ARGS: u32 = 0;
const RET_SLOT: u32 = 64;
const SELF_SAVE: u32 = 80;
const FLAG: u32 = 208;
const ARGS_PTR: u32 = 216;
const SPILL: u32 = 224;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14; // bridge
const R15: u8 = 15; // memory base

const MAPPED_LOCALS: usize = 3;
const MAPPED_TEMPS: usize = 4;

const LOCAL_REGS: [u8; 3] = [RBX, R12, R13];
/// Self-call argument staging registers, in order.
const STAGE: [u8; 8] = [RDI, RSI, RDX, RCX, 8, 9, 10, 11];

// setcc condition nibbles.
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_A: u8 = 0x7;
const CC_BE: u8 = 0x6;
const CC_L: u8 = 0xC;
const CC_GE: u8 = 0xD;
const CC_G: u8 = 0xF;
const CC_LE: u8 = 0xE;

const TARGET_BODY: usize = usize::MAX;
const TARGET_ERR: usize = usize::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Home {
    Reg(u8),
    Slot(u32),
}

struct Emitter<'a> {
    cx: &'a CompileCtx<'a>,
    func: &'a RegFunc,
    code: Vec<u8>,
    pc_map: Vec<u32>,
    /// (offset of the rel32 field, IR target or sentinel).
    fixups: Vec<(usize, usize)>,
    trap_fixups: Vec<(usize, TrapReason)>,
    targets: Vec<bool>,
    frame_size: u32,
    fp_cache: [Option<(u8, bool)>; 6],
    fp_next: usize,
    body_start: usize,
    self_entry: usize,
    epilogue_err: usize,
}

pub(super) fn compile(
    cx: &CompileCtx<'_>,
    func: &RegFunc,
) -> Result<CompiledFunc, &'static str> {
    let spills = spill_count(func);
    // Keep rsp 16-aligned at call sites: 5 pushes after the return address.
    let frame_size = ((SPILL + spills * 8 + 15) & !15) + 8;

    let mut e = Emitter {
        cx,
        func,
        code: Vec::with_capacity(func.code.len() * 16 + 256),
        pc_map: vec![0; func.code.len() + 1],
        fixups: Vec::new(),
        trap_fixups: Vec::new(),
        targets: branch_targets(func),
        frame_size,
        fp_cache: [None; 6],
        fp_next: 0,
        body_start: 0,
        self_entry: 0,
        epilogue_err: 0,
    };

    let entry = e.code.len();
    e.prologue_cold();
    e.self_entry = e.code.len();
    let self_usable = e.prologue_self();
    e.body_start = e.code.len();
    e.emit_shared_entry_tail();

    let mut pc = 0usize;
    while pc < func.code.len() {
        e.pc_map[pc] = e.code.len() as u32;
        if e.targets[pc] {
            e.flush_fp_all();
        }
        pc = e.record(pc)?;
    }
    e.pc_map[func.code.len()] = e.code.len() as u32;
    e.emit_epilogues();
    e.emit_trap_stubs();
    e.patch_fixups();

    let oob_exit = e.epilogue_err;
    let self_entry = if self_usable { e.self_entry } else { entry };
    let buf = CodeBuf::publish(&e.code).map_err(|_| "code buffer allocation failed")?;
    Ok(CompiledFunc {
        buf,
        entry,
        self_entry,
        oob_exit,
        pc_map: e.pc_map,
        reg_count: func.reg_count,
        param_count: func.param_count,
        has_result: func.has_result,
    })
}

fn spill_count(func: &RegFunc) -> u32 {
    let local_spills = func.local_count.saturating_sub(MAPPED_LOCALS);
    let temp_count = func.reg_count.saturating_sub(func.local_count);
    let temp_spills = temp_count.saturating_sub(MAPPED_TEMPS);
    (local_spills + temp_spills) as u32
}

fn branch_targets(func: &RegFunc) -> Vec<bool> {
    let mut targets = vec![false; func.code.len() + 1];
    let mut i = 0;
    while i < func.code.len() {
        match func.code[i].op {
            RegOp::Br | RegOp::BrIf | RegOp::BrIfNot => {
                targets[func.code[i].operand as usize] = true;
                i += 1;
            }
            RegOp::BrTable => {
                let count = func.code[i].operand as usize;
                for entry in 1..=count {
                    targets[func.code[i + entry].operand as usize] = true;
                }
                i += 1 + count;
            }
            RegOp::Call | RegOp::ReturnCall | RegOp::CallIndirect => {
                i += 1;
                while i < func.code.len() && func.code[i].op == RegOp::Aux {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    targets
}

impl Emitter<'_> {
    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.code.extend_from_slice(bs);
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    // REX + ModRM plumbing.

    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let mut rex = 0x40u8;
        if w {
            rex |= 8;
        }
        if reg >= 8 {
            rex |= 4;
        }
        if rm >= 8 {
            rex |= 1;
        }
        if rex != 0x40 || w {
            self.byte(rex);
        } else if reg_needs_rex8(reg) || reg_needs_rex8(rm) {
            self.byte(rex);
        }
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.byte(0xC0 | (reg & 7) << 3 | (rm & 7));
    }

    /// `[base + disp32]` addressing.
    fn modrm_mem(&mut self, reg: u8, base: u8, disp: u32) {
        self.byte(0x80 | (reg & 7) << 3 | (base & 7));
        if base & 7 == RSP {
            self.byte(0x24); // SIB: base only
        }
        self.bytes(&disp.to_le_bytes());
    }

    // Moves.

    fn mov_rr(&mut self, rd: u8, rm: u8) {
        if rd != rm {
            self.rex(true, rm, rd);
            self.byte(0x89);
            self.modrm_reg(rm, rd);
        }
    }

    fn mov_imm64(&mut self, rd: u8, value: u64) {
        if value <= u32::MAX as u64 {
            // 32-bit immediate zero-extends.
            self.rex(false, 0, rd);
            self.byte(0xB8 + (rd & 7));
            self.bytes(&(value as u32).to_le_bytes());
        } else {
            self.rex(true, 0, rd);
            self.byte(0xB8 + (rd & 7));
            self.bytes(&value.to_le_bytes());
        }
    }

    fn load64(&mut self, rd: u8, base: u8, disp: u32) {
        self.rex(true, rd, base);
        self.byte(0x8B);
        self.modrm_mem(rd, base, disp);
    }

    fn store64(&mut self, src: u8, base: u8, disp: u32) {
        self.rex(true, src, base);
        self.byte(0x89);
        self.modrm_mem(src, base, disp);
    }

    fn push(&mut self, r: u8) {
        if r >= 8 {
            self.byte(0x41);
        }
        self.byte(0x50 + (r & 7));
    }

    fn pop(&mut self, r: u8) {
        if r >= 8 {
            self.byte(0x41);
        }
        self.byte(0x58 + (r & 7));
    }

    // Homes.

    fn home(&self, v: u8) -> Home {
        let v = v as usize;
        if v < self.func.local_count {
            if v < MAPPED_LOCALS {
                Home::Reg(LOCAL_REGS[v])
            } else {
                Home::Slot(SPILL + ((v - MAPPED_LOCALS) as u32) * 8)
            }
        } else {
            let t = v - self.func.local_count;
            if t < MAPPED_TEMPS {
                Home::Reg(R8 + t as u8)
            } else {
                let local_spills = self.func.local_count.saturating_sub(MAPPED_LOCALS);
                Home::Slot(SPILL + ((local_spills + t - MAPPED_TEMPS) as u32) * 8)
            }
        }
    }

    fn self_save_slot(&self, v: u8) -> u32 {
        let v = v as usize;
        if v < self.func.local_count {
            SELF_SAVE + (v as u32) * 8
        } else {
            SELF_SAVE + ((8 + v - self.func.local_count) as u32) * 8
        }
    }

    fn save_temps(&mut self) {
        let live = (self.func.reg_count - self.func.local_count).min(MAPPED_TEMPS);
        for t in 0..live {
            self.store64(R8 + t as u8, RSP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
    }

    fn restore_temps(&mut self) {
        let live = (self.func.reg_count - self.func.local_count).min(MAPPED_TEMPS);
        for t in 0..live {
            self.load64(R8 + t as u8, RSP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
    }

    fn read(&mut self, v: u8, scratch: u8) -> u8 {
        self.flush_fp_of(v);
        match self.home(v) {
            Home::Reg(r) => r,
            Home::Slot(offset) => {
                self.load64(scratch, RSP, offset);
                scratch
            }
        }
    }

    fn dst(&self, v: u8) -> u8 {
        match self.home(v) {
            Home::Reg(r) => r,
            Home::Slot(_) => RAX,
        }
    }

    fn commit(&mut self, v: u8) {
        self.evict_fp_of(v);
        if let Home::Slot(offset) = self.home(v) {
            self.store64(RAX, RSP, offset);
        }
    }

    fn write_from(&mut self, v: u8, src: u8) {
        self.evict_fp_of(v);
        match self.home(v) {
            Home::Reg(r) => self.mov_rr(r, src),
            Home::Slot(offset) => self.store64(src, RSP, offset),
        }
    }

    // FP cache (xmm2..xmm7).

    fn flush_fp_of(&mut self, v: u8) {
        for slot in 0..self.fp_cache.len() {
            if let Some((vreg, dirty)) = self.fp_cache[slot] {
                if vreg == v {
                    if dirty {
                        self.fp_writeback(slot as u8 + 2, v);
                    }
                    self.fp_cache[slot] = None;
                }
            }
        }
    }

    fn evict_fp_of(&mut self, v: u8) {
        for slot in 0..self.fp_cache.len() {
            if matches!(self.fp_cache[slot], Some((vreg, _)) if vreg == v) {
                self.fp_cache[slot] = None;
            }
        }
    }

    fn flush_fp_all(&mut self) {
        for slot in 0..self.fp_cache.len() {
            if let Some((vreg, dirty)) = self.fp_cache[slot] {
                if dirty {
                    self.fp_writeback(slot as u8 + 2, vreg);
                }
                self.fp_cache[slot] = None;
            }
        }
    }

    fn fp_writeback(&mut self, xmm: u8, v: u8) {
        // movq rax, xmm
        self.bytes(&[0x66, 0x48, 0x0F, 0x7E]);
        self.modrm_reg(xmm, RAX);
        match self.home(v) {
            Home::Reg(r) => self.mov_rr(r, RAX),
            Home::Slot(offset) => self.store64(RAX, RSP, offset),
        }
    }

    fn fp_read(&mut self, v: u8) -> u8 {
        for slot in 0..self.fp_cache.len() {
            if matches!(self.fp_cache[slot], Some((vreg, _)) if vreg == v) {
                return slot as u8 + 2;
            }
        }
        let slot = self.fp_alloc(&[]);
        let src = match self.home(v) {
            Home::Reg(r) => r,
            Home::Slot(offset) => {
                self.load64(RAX, RSP, offset);
                RAX
            }
        };
        let xmm = slot as u8 + 2;
        // movq xmm, r64
        self.byte(0x66);
        self.rex(true, xmm, src);
        self.bytes(&[0x0F, 0x6E]);
        self.modrm_reg(xmm, src);
        self.fp_cache[slot] = Some((v, false));
        xmm
    }

    fn fp_write(&mut self, v: u8, avoid: &[u8]) -> u8 {
        self.evict_fp_of(v);
        let slot = self.fp_alloc(avoid);
        self.fp_cache[slot] = Some((v, true));
        slot as u8 + 2
    }

    /// Pick a cache register, never one of `avoid` (live operand xmms).
    fn fp_alloc(&mut self, avoid: &[u8]) -> usize {
        for _ in 0..self.fp_cache.len() {
            let slot = self.fp_next;
            self.fp_next = (self.fp_next + 1) % self.fp_cache.len();
            if avoid.contains(&(slot as u8 + 2)) {
                continue;
            }
            if self.fp_cache[slot].is_none() {
                return slot;
            }
        }
        let slot = loop {
            let slot = self.fp_next;
            self.fp_next = (self.fp_next + 1) % self.fp_cache.len();
            if !avoid.contains(&(slot as u8 + 2)) {
                break slot;
            }
        };
        if let Some((vreg, dirty)) = self.fp_cache[slot].take() {
            if dirty {
                self.fp_writeback(slot as u8 + 2, vreg);
            }
        }
        slot
    }

    // Branch plumbing: every branch is jmp/jcc rel32 with a 4-byte fixup.

    fn jmp_fix(&mut self, ir_target: usize) {
        self.byte(0xE9);
        self.fixups.push((self.here(), ir_target));
        self.bytes(&[0; 4]);
    }

    fn jcc_fix(&mut self, cc: u8, ir_target: usize) {
        self.bytes(&[0x0F, 0x80 + cc]);
        self.fixups.push((self.here(), ir_target));
        self.bytes(&[0; 4]);
    }

    fn jcc_trap(&mut self, cc: u8, reason: TrapReason) {
        self.bytes(&[0x0F, 0x80 + cc]);
        self.trap_fixups.push((self.here(), reason));
        self.bytes(&[0; 4]);
    }

    fn call_abs(&mut self, native: usize) {
        self.byte(0xE8);
        let rel = (native as i64 - (self.here() as i64 + 4)) as i32;
        self.bytes(&rel.to_le_bytes());
    }

    fn jmp_abs(&mut self, native: usize) {
        self.byte(0xE9);
        let rel = (native as i64 - (self.here() as i64 + 4)) as i32;
        self.bytes(&rel.to_le_bytes());
    }

    /// `test r32, r32` then a conditional jump on zero/nonzero.
    fn test32(&mut self, r: u8) {
        self.rex(false, r, r);
        self.byte(0x85);
        self.modrm_reg(r, r);
    }

    fn status_check(&mut self) {
        self.test32(RAX);
        self.jcc_fix(CC_NE, TARGET_ERR);
    }

    // Prologues and epilogues.

    fn prologue_cold(&mut self) {
        self.push(RBP);
        self.mov_rr(RBP, RSP);
        self.push(RBX);
        self.push(R12);
        self.push(R13);
        self.push(R14);
        self.push(R15);
        self.sub_rsp(self.frame_size);
        self.mov_imm64(RAX, 1);
        self.store64(RAX, RSP, FLAG);
        self.store64(RDI, RSP, ARGS_PTR);
        self.mov_rr(R14, RSI);
        self.load64(R15, R14, bridge_offsets::MEM_BASE);
        for i in 0..self.func.param_count.min(self.func.local_count) {
            let offset = (i * 8) as u32;
            match self.home(i as u8) {
                Home::Reg(r) => self.load64(r, RDI, offset),
                Home::Slot(slot) => {
                    self.load64(RAX, RDI, offset);
                    self.store64(RAX, RSP, slot);
                }
            }
        }
        self.jmp_fix(TARGET_BODY);
    }

    fn sub_rsp(&mut self, amount: u32) {
        self.bytes(&[0x48, 0x81, 0xEC]);
        self.bytes(&amount.to_le_bytes());
    }

    fn prologue_self(&mut self) -> bool {
        let usable = self.func.param_count <= STAGE.len();
        self.push(RBP);
        self.mov_rr(RBP, RSP);
        // Reserve the 40 bytes of skipped callee-saved pushes so the frame
        // offsets match the cold entry.
        self.sub_rsp(40 + self.frame_size);
        self.mov_imm64(RAX, 0);
        self.store64(RAX, RSP, FLAG);
        self.store64(RAX, RSP, ARGS_PTR);
        if usable {
            for i in 0..self.func.param_count {
                let src = STAGE[i];
                match self.home(i as u8) {
                    Home::Reg(r) => self.mov_rr(r, src),
                    Home::Slot(slot) => self.store64(src, RSP, slot),
                }
            }
        }
        usable
    }

    fn emit_shared_entry_tail(&mut self) {
        if self.func.param_count < self.func.local_count {
            self.mov_imm64(RAX, 0);
            for i in self.func.param_count..self.func.local_count {
                match self.home(i as u8) {
                    Home::Reg(r) => self.mov_rr(r, RAX),
                    Home::Slot(slot) => self.store64(RAX, RSP, slot),
                }
            }
        }
        self.fuel_check();
    }

    /// Decrement the bridge fuel cell unless metering is off (all-ones).
    /// Clobbers rax and rcx.
    fn fuel_check(&mut self) {
        self.load64(RAX, R14, bridge_offsets::FUEL);
        // cmp rax, -1 ; je skip
        self.bytes(&[0x48, 0x83, 0xF8, 0xFF]);
        self.bytes(&[0x0F, 0x84]);
        let skip_at = self.here();
        self.bytes(&[0; 4]);
        // test rax, rax ; jz fuel stub
        self.bytes(&[0x48, 0x85, 0xC0]);
        self.jcc_trap(CC_E, TrapReason::FuelExhausted);
        // dec rax ; store
        self.bytes(&[0x48, 0xFF, 0xC8]);
        self.store64(RAX, R14, bridge_offsets::FUEL);
        let rel = (self.here() as i64 - (skip_at as i64 + 4)) as i32;
        self.code[skip_at..skip_at + 4].copy_from_slice(&rel.to_le_bytes());
    }

    fn emit_epilogues(&mut self) {
        // Success: rax = 0, result in rdx, stored to the args buffer when
        // one exists.
        self.mov_imm64(RAX, 0);
        self.load64(RCX, RSP, ARGS_PTR);
        // test rcx, rcx ; jz over-store
        self.bytes(&[0x48, 0x85, 0xC9]);
        self.bytes(&[0x0F, 0x84]);
        let skip_at = self.here();
        self.bytes(&[0; 4]);
        self.store64(RDX, RCX, 0);
        let rel = (self.here() as i64 - (skip_at as i64 + 4)) as i32;
        self.code[skip_at..skip_at + 4].copy_from_slice(&rel.to_le_bytes());

        // Error path joins here; rax carries the status (the signal handler
        // lands here with rax rewritten).
        self.epilogue_err = self.here();
        self.load64(RCX, RSP, FLAG);
        self.bytes(&[0x48, 0x85, 0xC9]);
        self.bytes(&[0x0F, 0x84]);
        let skip_restore = self.here();
        self.bytes(&[0; 4]);
        // Saved below rbp: rbx, r12, r13, r14, r15 at -8..-40.
        self.load64_neg(RBX, 8);
        self.load64_neg(R12, 16);
        self.load64_neg(R13, 24);
        self.load64_neg(R14, 32);
        self.load64_neg(R15, 40);
        let rel = (self.here() as i64 - (skip_restore as i64 + 4)) as i32;
        self.code[skip_restore..skip_restore + 4].copy_from_slice(&rel.to_le_bytes());
        self.mov_rr(RSP, RBP);
        self.pop(RBP);
        self.byte(0xC3); // ret
    }

    /// `mov r, [rbp - disp]`.
    fn load64_neg(&mut self, r: u8, disp: u32) {
        self.rex(true, r, RBP);
        self.byte(0x8B);
        self.byte(0x80 | (r & 7) << 3 | (RBP & 7));
        self.bytes(&(disp.wrapping_neg()).to_le_bytes());
    }

    fn emit_trap_stubs(&mut self) {
        let fixups = std::mem::take(&mut self.trap_fixups);
        let mut stubs: Vec<(TrapReason, usize)> = Vec::new();
        for (at, reason) in fixups {
            let stub = match stubs.iter().find(|(r, _)| *r == reason) {
                Some(&(_, offset)) => offset,
                None => {
                    let offset = self.here();
                    self.mov_imm64(RAX, u64::from(reason.code()));
                    self.jmp_abs(self.epilogue_err);
                    stubs.push((reason, offset));
                    offset
                }
            };
            let rel = (stub as i64 - (at as i64 + 4)) as i32;
            self.code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        }
    }

    fn patch_fixups(&mut self) {
        let fixups = std::mem::take(&mut self.fixups);
        for (at, ir_target) in fixups {
            let native = match ir_target {
                TARGET_BODY => self.body_start,
                TARGET_ERR => self.epilogue_err,
                t => self.pc_map[t] as usize,
            };
            let rel = (native as i64 - (at as i64 + 4)) as i32;
            self.code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        }
    }

    // Record lowering.

    fn record(&mut self, pc: usize) -> Result<usize, &'static str> {
        use RegOp as R;
        let i = self.func.code[pc];

        if !is_fp_op(i.op) {
            self.flush_fp_all();
        }

        match i.op {
            R::Nop | R::Aux => {}

            R::Mov => {
                let src = self.read(i.rs1, RAX);
                self.write_from(i.rd, src);
            }
            R::Const32 => {
                let rd = self.dst(i.rd);
                self.mov_imm64(rd, u64::from(i.operand));
                self.commit(i.rd);
            }
            R::Const64 => {
                let rd = self.dst(i.rd);
                self.mov_imm64(rd, self.func.pool[i.operand as usize]);
                self.commit(i.rd);
            }

            R::Br => {
                if i.operand as usize <= pc {
                    self.fuel_check();
                }
                self.jmp_fix(i.operand as usize);
            }
            R::BrIf | R::BrIfNot => {
                let cond = self.read(i.rs1, RAX);
                if i.operand as usize <= pc {
                    // Fuel clobbers rax/rcx; stage the condition in rdx.
                    self.mov_rr(RDX, cond);
                    self.fuel_check();
                    self.test32(RDX);
                } else {
                    self.test32(cond);
                }
                let cc = if i.op == R::BrIf { CC_NE } else { CC_E };
                self.jcc_fix(cc, i.operand as usize);
            }
            R::BrTable => {
                let count = i.operand as usize;
                let index = self.read(i.rs1, RAX);
                self.mov_rr(RDX, index);
                self.fuel_check();
                // Clamp: cmp edx, count-1; jb keep; mov edx, count-1
                self.rex(false, 0, RDX);
                self.byte(0x81);
                self.byte(0xC0 | 7 << 3 | (RDX & 7));
                self.bytes(&((count - 1) as u32).to_le_bytes());
                self.bytes(&[0x0F, 0x82]);
                let keep_at = self.here();
                self.bytes(&[0; 4]);
                self.mov_imm64(RDX, (count - 1) as u64);
                let rel = (self.here() as i64 - (keep_at as i64 + 4)) as i32;
                self.code[keep_at..keep_at + 4].copy_from_slice(&rel.to_le_bytes());
                // Compare ladder.
                for entry in 0..count {
                    let target = self.func.code[pc + 1 + entry].operand as usize;
                    if entry == count - 1 {
                        self.jmp_fix(target);
                    } else {
                        self.rex(false, 0, RDX);
                        self.byte(0x81);
                        self.byte(0xC0 | 7 << 3 | (RDX & 7));
                        self.bytes(&(entry as u32).to_le_bytes());
                        self.jcc_fix(CC_E, target);
                    }
                }
                return Ok(pc + 1 + count);
            }
            R::Ret => {
                if i.rd != 0 {
                    let src = self.read(i.rs1, RAX);
                    self.mov_rr(RDX, src);
                }
                self.jmp_fix(self.func.code.len());
            }

            R::Call => return self.emit_call(pc, i),
            R::ReturnCall => return self.emit_return_call(pc, i),
            R::CallIndirect => return self.emit_call_indirect(pc, i),

            R::Select => {
                let cond = self.read((i.operand >> 8) as u8, RCX);
                self.test32(cond);
                let a = self.read(i.rs1, RAX);
                let rd = self.dst(i.rd);
                self.mov_rr(rd, a);
                let b = self.read(i.operand as u8, RCX);
                // cmove rd, b  (condition was "cond == 0")
                self.rex(true, rd, b);
                self.bytes(&[0x0F, 0x44]);
                self.modrm_reg(rd, b);
                self.commit(i.rd);
            }

            R::GlobalGet => {
                self.save_temps();
                self.mov_rr(RDI, R14);
                self.mov_imm64(RSI, u64::from(i.operand));
                self.load64(RAX, R14, bridge_offsets::GLOBAL_GET);
                self.call_reg(RAX);
                self.restore_temps();
                self.write_from(i.rd, RAX);
            }
            R::GlobalSet => {
                let src = self.read(i.rs1, RAX);
                self.mov_rr(RDX, src);
                self.save_temps();
                self.mov_rr(RDI, R14);
                self.mov_imm64(RSI, u64::from(i.operand));
                self.load64(RAX, R14, bridge_offsets::GLOBAL_SET);
                self.call_reg(RAX);
                self.restore_temps();
            }
            R::MemorySize => {
                self.save_temps();
                self.mov_rr(RDI, R14);
                self.load64(RAX, R14, bridge_offsets::MEMORY_SIZE);
                self.call_reg(RAX);
                self.restore_temps();
                self.write_from(i.rd, RAX);
            }
            R::MemoryGrow => {
                let delta = self.read(i.rs1, RAX);
                self.mov_rr(RSI, delta);
                self.save_temps();
                self.mov_rr(RDI, R14);
                self.load64(RAX, R14, bridge_offsets::MEMORY_GROW);
                self.call_reg(RAX);
                self.restore_temps();
                self.write_from(i.rd, RAX);
            }
            R::MemoryFill | R::MemoryCopy => {
                let field = if i.op == R::MemoryFill {
                    bridge_offsets::MEMORY_FILL
                } else {
                    bridge_offsets::MEMORY_COPY
                };
                let dst = self.read(i.rs1, RAX);
                self.mov_rr(RSI, dst);
                let second = self.read(i.rs2(), RAX);
                self.mov_rr(RDX, second);
                let len = self.read(i.rd, RAX);
                self.mov_rr(RCX, len);
                self.save_temps();
                self.mov_rr(RDI, R14);
                self.load64(RAX, R14, field);
                self.call_reg(RAX);
                self.restore_temps();
                self.status_check();
            }

            R::I32Load => self.load_mem(i, LoadKind::U32),
            R::I64Load | R::F64Load => self.load_mem(i, LoadKind::U64),
            R::F32Load => self.load_mem(i, LoadKind::U32),
            R::I32Load8U | R::I64Load8U => self.load_mem(i, LoadKind::U8),
            R::I32Load8S => self.load_mem(i, LoadKind::S8_32),
            R::I64Load8S => self.load_mem(i, LoadKind::S8_64),
            R::I32Load16U | R::I64Load16U => self.load_mem(i, LoadKind::U16),
            R::I32Load16S => self.load_mem(i, LoadKind::S16_32),
            R::I64Load16S => self.load_mem(i, LoadKind::S16_64),
            R::I64Load32U => self.load_mem(i, LoadKind::U32),
            R::I64Load32S => self.load_mem(i, LoadKind::S32_64),
            R::I32Store | R::F32Store => self.store_mem(i, 4),
            R::I64Store | R::F64Store => self.store_mem(i, 8),
            R::I32Store8 | R::I64Store8 => self.store_mem(i, 1),
            R::I32Store16 | R::I64Store16 => self.store_mem(i, 2),
            R::I64Store32 => self.store_mem(i, 4),

            _ => self.alu(i)?,
        }
        Ok(pc + 1)
    }

    fn call_reg(&mut self, r: u8) {
        self.rex(false, 2, r);
        self.byte(0xFF);
        self.modrm_reg(2, r);
    }

    /// ea -> rax: mem base + zero-extended address register.
    fn effective_address(&mut self, i: RegInstr) -> u32 {
        let addr = self.read(i.rs1, RAX);
        if addr != RAX {
            // mov eax, addr32 zero-extends.
            self.rex(false, addr, RAX);
            self.byte(0x89);
            self.modrm_reg(addr, RAX);
        } else {
            // mov eax, eax clears the high half explicitly.
            self.bytes(&[0x89, 0xC0]);
        }
        // add rax, r15
        self.rex(true, R15, RAX);
        self.byte(0x01);
        self.modrm_reg(R15, RAX);
        let offset = i.operand;
        if offset > i32::MAX as u32 {
            self.mov_imm64(RCX, u64::from(offset));
            self.rex(true, RCX, RAX);
            self.byte(0x01);
            self.modrm_reg(RCX, RAX);
            0
        } else {
            offset
        }
    }

    fn load_mem(&mut self, i: RegInstr, kind: LoadKind) {
        let disp = self.effective_address(i);
        let rd = self.dst(i.rd);
        match kind {
            LoadKind::U8 => {
                self.rex(false, rd, RAX);
                self.bytes(&[0x0F, 0xB6]);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::U16 => {
                self.rex(false, rd, RAX);
                self.bytes(&[0x0F, 0xB7]);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::U32 => {
                self.rex(false, rd, RAX);
                self.byte(0x8B);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::U64 => {
                self.rex(true, rd, RAX);
                self.byte(0x8B);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::S8_32 => {
                self.rex(false, rd, RAX);
                self.bytes(&[0x0F, 0xBE]);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::S8_64 => {
                self.rex(true, rd, RAX);
                self.bytes(&[0x0F, 0xBE]);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::S16_32 => {
                self.rex(false, rd, RAX);
                self.bytes(&[0x0F, 0xBF]);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::S16_64 => {
                self.rex(true, rd, RAX);
                self.bytes(&[0x0F, 0xBF]);
                self.modrm_mem(rd, RAX, disp);
            }
            LoadKind::S32_64 => {
                self.rex(true, rd, RAX);
                self.byte(0x63); // movsxd
                self.modrm_mem(rd, RAX, disp);
            }
        }
        self.commit(i.rd);
    }

    fn store_mem(&mut self, i: RegInstr, size: u32) {
        let disp = self.effective_address(i);
        let value = self.read(i.rd, RCX);
        match size {
            1 => {
                self.rex(false, value, RAX);
                self.byte(0x88);
                self.modrm_mem(value, RAX, disp);
            }
            2 => {
                self.byte(0x66);
                self.rex(false, value, RAX);
                self.byte(0x89);
                self.modrm_mem(value, RAX, disp);
            }
            4 => {
                self.rex(false, value, RAX);
                self.byte(0x89);
                self.modrm_mem(value, RAX, disp);
            }
            _ => {
                self.rex(true, value, RAX);
                self.byte(0x89);
                self.modrm_mem(value, RAX, disp);
            }
        }
    }

    // Calls.

    fn collect_args(&self, first_aux: usize, count: usize) -> Vec<u8> {
        let mut regs = Vec::with_capacity(count);
        let mut word = first_aux;
        let mut lane = 0usize;
        for _ in 0..count {
            if lane == RegInstr::ARGS_PER_AUX {
                word += 1;
                lane = 0;
            }
            regs.push(RegInstr::unpack_arg(self.func.code[word].operand, lane));
            lane += 1;
        }
        regs
    }

    fn emit_call(&mut self, pc: usize, i: RegInstr) -> Result<usize, &'static str> {
        let (params, results) = self.cx.callee_sig(i.operand);
        let aux = params.div_ceil(RegInstr::ARGS_PER_AUX);
        let args = self.collect_args(pc + 1, params);
        if self.cx.is_self_call(i.operand) && params <= STAGE.len() {
            self.emit_self_call(&args, results, i.rd);
        } else {
            self.emit_bridge_call(i.operand, &args, results == 1, i.rd);
        }
        Ok(pc + 1 + aux)
    }

    fn emit_self_call(&mut self, args: &[u8], results: usize, rd: u8) {
        let live_locals = self.func.local_count.min(MAPPED_LOCALS);
        let live_temps = (self.func.reg_count - self.func.local_count).min(MAPPED_TEMPS);
        for l in 0..live_locals {
            self.store64(LOCAL_REGS[l], RSP, SELF_SAVE + (l as u32) * 8);
        }
        for t in 0..live_temps {
            self.store64(R8 + t as u8, RSP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
        for (n, &arg) in args.iter().enumerate() {
            let dst = STAGE[n];
            match self.home(arg) {
                Home::Reg(_) => {
                    let slot = self.self_save_slot(arg);
                    self.load64(dst, RSP, slot);
                }
                Home::Slot(slot) => self.load64(dst, RSP, slot),
            }
        }
        self.call_abs(self.self_entry);
        for l in 0..live_locals {
            self.load64(LOCAL_REGS[l], RSP, SELF_SAVE + (l as u32) * 8);
        }
        for t in 0..live_temps {
            self.load64(R8 + t as u8, RSP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
        self.status_check();
        if results == 1 {
            self.write_from(rd, RDX);
        }
    }

    fn emit_bridge_call(&mut self, func_index: u32, args: &[u8], take_result: bool, rd: u8) {
        for (n, &arg) in args.iter().enumerate() {
            let src = self.read(arg, RAX);
            self.store64(src, RSP, OUT_ARGS + (n as u32) * 8);
        }
        self.save_temps();
        self.mov_rr(RDI, R14);
        self.mov_imm64(RSI, u64::from(func_index));
        self.lea_rsp(RDX, OUT_ARGS);
        self.mov_imm64(RCX, args.len() as u64);
        self.lea_rsp(R8, RET_SLOT);
        self.load64(RAX, R14, bridge_offsets::CALL);
        self.call_reg(RAX);
        self.restore_temps();
        self.status_check();
        if take_result {
            self.load64(RAX, RSP, RET_SLOT);
            self.write_from(rd, RAX);
        }
    }

    fn lea_rsp(&mut self, rd: u8, disp: u32) {
        self.rex(true, rd, RSP);
        self.byte(0x8D);
        self.modrm_mem(rd, RSP, disp);
    }

    fn emit_return_call(&mut self, pc: usize, i: RegInstr) -> Result<usize, &'static str> {
        let (params, _) = self.cx.callee_sig(i.operand);
        let aux = params.div_ceil(RegInstr::ARGS_PER_AUX);
        let args = self.collect_args(pc + 1, params);
        if self.cx.is_self_call(i.operand) && params <= STAGE.len() {
            // Frame reuse: stage through the save area to avoid clobbering
            // argument sources mid-move, then branch to the body.
            for (n, &arg) in args.iter().enumerate() {
                let src = self.read(arg, RAX);
                self.store64(src, RSP, SELF_SAVE + (n as u32) * 8);
            }
            for n in 0..args.len() {
                self.load64(RAX, RSP, SELF_SAVE + (n as u32) * 8);
                self.write_from(n as u8, RAX);
            }
            self.jmp_fix(TARGET_BODY);
        } else {
            self.emit_bridge_call(i.operand, &args, false, 0);
            if self.func.has_result {
                self.load64(RDX, RSP, RET_SLOT);
            }
            self.jmp_fix(self.func.code.len());
        }
        Ok(pc + 1 + aux)
    }

    fn emit_call_indirect(&mut self, pc: usize, i: RegInstr) -> Result<usize, &'static str> {
        let (params, results) = self.cx.type_sig(i.operand);
        let aux = 1 + params.div_ceil(RegInstr::ARGS_PER_AUX);
        let table_index = self.func.code[pc + 1].operand;
        let args = self.collect_args(pc + 2, params);

        for (n, &arg) in args.iter().enumerate() {
            let src = self.read(arg, RAX);
            self.store64(src, RSP, OUT_ARGS + (n as u32) * 8);
        }
        let elem = self.read(i.rs1, RAX);
        self.mov_rr(RCX, elem);
        self.save_temps();
        self.mov_rr(RDI, R14);
        self.mov_imm64(RSI, u64::from(i.operand));
        self.mov_imm64(RDX, u64::from(table_index));
        self.lea_rsp(R8, OUT_ARGS);
        self.mov_imm64(9, args.len() as u64);
        // The 7th argument travels on the stack in SysV: pad first so rsp
        // stays 16-aligned at the call, then push it so it sits at [rsp].
        self.sub_rsp(8);
        self.lea_rsp(RAX, RET_SLOT + 8);
        self.push(RAX);
        self.load64(RAX, R14, bridge_offsets::CALL_INDIRECT);
        self.call_reg(RAX);
        self.bytes(&[0x48, 0x83, 0xC4, 0x10]); // add rsp, 16
        self.restore_temps();
        self.status_check();
        if results == 1 {
            self.load64(RAX, RSP, RET_SLOT);
            self.write_from(i.rd, RAX);
        }
        Ok(pc + 1 + aux)
    }

    // ALU.

    fn alu_rr(&mut self, i: RegInstr, opcode: u8, w: bool) {
        let a = self.read(i.rs1, RAX);
        let rd = self.dst(i.rd);
        self.mov_rr(rd, a);
        let b = self.read(i.rs2(), RCX);
        self.rex(w, b, rd);
        self.byte(opcode);
        self.modrm_reg(b, rd);
        self.commit(i.rd);
    }

    fn mul_rr(&mut self, i: RegInstr, w: bool) {
        let a = self.read(i.rs1, RAX);
        let rd = self.dst(i.rd);
        self.mov_rr(rd, a);
        let b = self.read(i.rs2(), RCX);
        self.rex(w, rd, b);
        self.bytes(&[0x0F, 0xAF]);
        self.modrm_reg(rd, b);
        self.commit(i.rd);
    }

    fn shift_rr(&mut self, i: RegInstr, modrm_ext: u8, w: bool) {
        let b = self.read(i.rs2(), RCX);
        self.mov_rr(RCX, b);
        let a = self.read(i.rs1, RAX);
        let rd = self.dst(i.rd);
        self.mov_rr(rd, a);
        self.rex(w, modrm_ext, rd);
        self.byte(0xD3);
        self.modrm_reg(modrm_ext, rd);
        self.commit(i.rd);
    }

    fn cmp_set(&mut self, i: RegInstr, w: bool, cc: u8) {
        let a = self.read(i.rs1, RAX);
        let b = self.read(i.rs2(), RCX);
        self.rex(w, b, a);
        self.byte(0x39);
        self.modrm_reg(b, a);
        self.setcc_into(i.rd, cc);
    }

    fn setcc_into(&mut self, rd: u8, cc: u8) {
        // setcc dl ; movzx dst32, dl
        self.bytes(&[0x0F, 0x90 + cc, 0xC2]);
        let dst = self.dst(rd);
        self.rex(false, dst, RDX);
        self.bytes(&[0x0F, 0xB6]);
        self.modrm_reg(dst, RDX);
        self.commit(rd);
    }

    fn cmp_imm_set(&mut self, i: RegInstr, cc: u8) {
        let a = self.read(i.rs1, RAX);
        self.rex(false, 7, a);
        self.byte(0x81);
        self.modrm_reg(7, a);
        self.bytes(&i.operand.to_le_bytes());
        self.setcc_into(i.rd, cc);
    }

    fn alu_imm(&mut self, i: RegInstr, modrm_ext: u8) {
        let a = self.read(i.rs1, RAX);
        let rd = self.dst(i.rd);
        self.mov_rr(rd, a);
        self.rex(false, modrm_ext, rd);
        self.byte(0x81);
        self.modrm_reg(modrm_ext, rd);
        self.bytes(&i.operand.to_le_bytes());
        self.commit(i.rd);
    }

    fn divide(&mut self, i: RegInstr, w: bool, signed: bool, rem: bool) {
        let b = self.read(i.rs2(), RCX);
        self.mov_rr(RCX, b);
        // test rcx, rcx ; jz div0
        self.rex(w, RCX, RCX);
        self.byte(0x85);
        self.modrm_reg(RCX, RCX);
        self.jcc_trap(CC_E, TrapReason::IntegerDivideByZero);
        if signed && !rem {
            // INT_MIN / -1 overflow check.
            self.rex(w, 7, RCX);
            self.byte(0x83);
            self.modrm_reg(7, RCX);
            self.byte(0xFF); // cmp rcx, -1
            self.bytes(&[0x0F, 0x85]);
            let skip_at = self.here();
            self.bytes(&[0; 4]);
            let a = self.read(i.rs1, RAX);
            if w {
                self.mov_imm64(RDX, i64::MIN as u64);
                self.rex(true, RDX, a);
                self.byte(0x39);
                self.modrm_reg(RDX, a);
            } else {
                self.rex(false, 7, a);
                self.byte(0x81);
                self.modrm_reg(7, a);
                self.bytes(&(i32::MIN as u32).to_le_bytes());
            }
            self.jcc_trap(CC_E, TrapReason::IntegerOverflow);
            let rel = (self.here() as i64 - (skip_at as i64 + 4)) as i32;
            self.code[skip_at..skip_at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        let a = self.read(i.rs1, RDX);
        self.mov_rr(RAX, a);
        if signed {
            if w {
                self.bytes(&[0x48, 0x99]); // cqo
            } else {
                self.byte(0x99); // cdq
            }
        } else {
            self.bytes(&[0x31, 0xD2]); // xor edx, edx
        }
        // idiv/div rcx
        self.rex(w, if signed { 7 } else { 6 }, RCX);
        self.byte(0xF7);
        self.modrm_reg(if signed { 7 } else { 6 }, RCX);
        let out = if rem { RDX } else { RAX };
        match self.home(i.rd) {
            Home::Reg(r) => self.mov_rr(r, out),
            Home::Slot(offset) => self.store64(out, RSP, offset),
        }
        self.evict_fp_of(i.rd);
    }

    fn unary_0f(&mut self, i: RegInstr, prefix: u8, opcode: u8, w: bool) {
        let a = self.read(i.rs1, RCX);
        let rd = self.dst(i.rd);
        self.byte(prefix);
        self.rex(w, rd, a);
        self.bytes(&[0x0F, opcode]);
        self.modrm_reg(rd, a);
        self.commit(i.rd);
    }

    fn fp3(&mut self, i: RegInstr, prefix: u8, opcode: u8) {
        let b = self.fp_read(i.rs2());
        let a = self.fp_read(i.rs1);
        let rd = self.fp_write(i.rd, &[a, b]);
        // movaps rd, a; op rd, b
        if rd != a {
            self.bytes(&[0x0F, 0x28]);
            self.modrm_reg(rd, a);
        }
        self.byte(prefix);
        self.bytes(&[0x0F, opcode]);
        self.modrm_reg(rd, b);
    }

    fn fp2(&mut self, i: RegInstr, prefix: u8, opcode: u8) {
        let a = self.fp_read(i.rs1);
        let rd = self.fp_write(i.rd, &[a]);
        self.byte(prefix);
        self.bytes(&[0x0F, opcode]);
        self.modrm_reg(rd, a);
    }

    fn round(&mut self, i: RegInstr, double: bool, mode: u8) {
        let a = self.fp_read(i.rs1);
        let rd = self.fp_write(i.rd, &[a]);
        self.byte(0x66);
        self.bytes(&[0x0F, 0x3A, if double { 0x0B } else { 0x0A }]);
        self.modrm_reg(rd, a);
        self.byte(0x08 | mode);
    }

    fn fcmp(&mut self, double: bool, lhs: u8, rhs: u8) {
        if double {
            self.byte(0x66);
        }
        self.bytes(&[0x0F, 0x2E]);
        self.modrm_reg(lhs, rhs);
    }

    #[allow(clippy::too_many_lines)]
    fn alu(&mut self, i: RegInstr) -> Result<(), &'static str> {
        use RegOp as R;
        match i.op {
            R::I32Add => self.alu_rr(i, 0x01, false),
            R::I32Sub => self.alu_rr(i, 0x29, false),
            R::I32And => self.alu_rr(i, 0x21, false),
            R::I32Or => self.alu_rr(i, 0x09, false),
            R::I32Xor => self.alu_rr(i, 0x31, false),
            R::I32Mul => self.mul_rr(i, false),
            R::I64Add => self.alu_rr(i, 0x01, true),
            R::I64Sub => self.alu_rr(i, 0x29, true),
            R::I64And => self.alu_rr(i, 0x21, true),
            R::I64Or => self.alu_rr(i, 0x09, true),
            R::I64Xor => self.alu_rr(i, 0x31, true),
            R::I64Mul => self.mul_rr(i, true),

            R::I32Shl => self.shift_rr(i, 4, false),
            R::I32ShrU => self.shift_rr(i, 5, false),
            R::I32ShrS => self.shift_rr(i, 7, false),
            R::I32Rotl => self.shift_rr(i, 0, false),
            R::I32Rotr => self.shift_rr(i, 1, false),
            R::I64Shl => self.shift_rr(i, 4, true),
            R::I64ShrU => self.shift_rr(i, 5, true),
            R::I64ShrS => self.shift_rr(i, 7, true),
            R::I64Rotl => self.shift_rr(i, 0, true),
            R::I64Rotr => self.shift_rr(i, 1, true),

            R::I32DivS => self.divide(i, false, true, false),
            R::I32DivU => self.divide(i, false, false, false),
            R::I32RemS => self.divide(i, false, true, true),
            R::I32RemU => self.divide(i, false, false, true),
            R::I64DivS => self.divide(i, true, true, false),
            R::I64DivU => self.divide(i, true, false, false),
            R::I64RemS => self.divide(i, true, true, true),
            R::I64RemU => self.divide(i, true, false, true),

            R::I32Eq => self.cmp_set(i, false, CC_E),
            R::I32Ne => self.cmp_set(i, false, CC_NE),
            R::I32LtS => self.cmp_set(i, false, CC_L),
            R::I32LtU => self.cmp_set(i, false, CC_B),
            R::I32GtS => self.cmp_set(i, false, CC_G),
            R::I32GtU => self.cmp_set(i, false, CC_A),
            R::I32LeS => self.cmp_set(i, false, CC_LE),
            R::I32LeU => self.cmp_set(i, false, CC_BE),
            R::I32GeS => self.cmp_set(i, false, CC_GE),
            R::I32GeU => self.cmp_set(i, false, CC_AE),
            R::I64Eq => self.cmp_set(i, true, CC_E),
            R::I64Ne => self.cmp_set(i, true, CC_NE),
            R::I64LtS => self.cmp_set(i, true, CC_L),
            R::I64LtU => self.cmp_set(i, true, CC_B),
            R::I64GtS => self.cmp_set(i, true, CC_G),
            R::I64GtU => self.cmp_set(i, true, CC_A),
            R::I64LeS => self.cmp_set(i, true, CC_LE),
            R::I64LeU => self.cmp_set(i, true, CC_BE),
            R::I64GeS => self.cmp_set(i, true, CC_GE),
            R::I64GeU => self.cmp_set(i, true, CC_AE),
            R::I32Eqz => {
                let a = self.read(i.rs1, RAX);
                self.test32(a);
                self.setcc_into(i.rd, CC_E);
            }
            R::I64Eqz => {
                let a = self.read(i.rs1, RAX);
                self.rex(true, a, a);
                self.byte(0x85);
                self.modrm_reg(a, a);
                self.setcc_into(i.rd, CC_E);
            }

            R::I32AddImm => self.alu_imm(i, 0),
            R::I32SubImm => self.alu_imm(i, 5),
            R::I32AndImm => self.alu_imm(i, 4),
            R::I32OrImm => self.alu_imm(i, 1),
            R::I32XorImm => self.alu_imm(i, 6),
            R::I32MulImm => {
                // imul rd, a, imm32
                let a = self.read(i.rs1, RAX);
                let rd = self.dst(i.rd);
                self.rex(false, rd, a);
                self.byte(0x69);
                self.modrm_reg(rd, a);
                self.bytes(&i.operand.to_le_bytes());
                self.commit(i.rd);
            }
            R::I32ShlImm => {
                let a = self.read(i.rs1, RAX);
                let rd = self.dst(i.rd);
                self.mov_rr(rd, a);
                self.rex(false, 4, rd);
                self.byte(0xC1);
                self.modrm_reg(4, rd);
                self.byte((i.operand & 31) as u8);
                self.commit(i.rd);
            }
            R::I32EqImm => self.cmp_imm_set(i, CC_E),
            R::I32NeImm => self.cmp_imm_set(i, CC_NE),
            R::I32LtSImm => self.cmp_imm_set(i, CC_L),
            R::I32LtUImm => self.cmp_imm_set(i, CC_B),
            R::I32GtSImm => self.cmp_imm_set(i, CC_G),
            R::I32LeSImm => self.cmp_imm_set(i, CC_LE),
            R::I32GeSImm => self.cmp_imm_set(i, CC_GE),
            R::I32GeUImm => self.cmp_imm_set(i, CC_AE),

            R::I32Clz => self.unary_0f(i, 0xF3, 0xBD, false),
            R::I32Ctz => self.unary_0f(i, 0xF3, 0xBC, false),
            R::I32Popcnt => self.unary_0f(i, 0xF3, 0xB8, false),
            R::I64Clz => self.unary_0f(i, 0xF3, 0xBD, true),
            R::I64Ctz => self.unary_0f(i, 0xF3, 0xBC, true),
            R::I64Popcnt => self.unary_0f(i, 0xF3, 0xB8, true),

            R::I32Extend8S => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(false, rd, a);
                self.bytes(&[0x0F, 0xBE]);
                self.modrm_reg(rd, a);
                self.commit(i.rd);
            }
            R::I32Extend16S => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(false, rd, a);
                self.bytes(&[0x0F, 0xBF]);
                self.modrm_reg(rd, a);
                self.commit(i.rd);
            }
            R::I64Extend8S => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(true, rd, a);
                self.bytes(&[0x0F, 0xBE]);
                self.modrm_reg(rd, a);
                self.commit(i.rd);
            }
            R::I64Extend16S => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(true, rd, a);
                self.bytes(&[0x0F, 0xBF]);
                self.modrm_reg(rd, a);
                self.commit(i.rd);
            }
            R::I64Extend32S | R::I64ExtendI32S => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(true, rd, a);
                self.byte(0x63);
                self.modrm_reg(rd, a);
                self.commit(i.rd);
            }
            R::I64ExtendI32U | R::I32WrapI64 => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(false, a, rd);
                self.byte(0x89);
                self.modrm_reg(a, rd);
                self.commit(i.rd);
            }

            R::F32Add => self.fp3(i, 0xF3, 0x58),
            R::F32Sub => self.fp3(i, 0xF3, 0x5C),
            R::F32Mul => self.fp3(i, 0xF3, 0x59),
            R::F32Div => self.fp3(i, 0xF3, 0x5E),
            R::F64Add => self.fp3(i, 0xF2, 0x58),
            R::F64Sub => self.fp3(i, 0xF2, 0x5C),
            R::F64Mul => self.fp3(i, 0xF2, 0x59),
            R::F64Div => self.fp3(i, 0xF2, 0x5E),
            R::F32Sqrt => self.fp2(i, 0xF3, 0x51),
            R::F64Sqrt => self.fp2(i, 0xF2, 0x51),
            R::F32Ceil => self.round(i, false, 0x02),
            R::F32Floor => self.round(i, false, 0x01),
            R::F32Trunc => self.round(i, false, 0x03),
            R::F32Nearest => self.round(i, false, 0x00),
            R::F64Ceil => self.round(i, true, 0x02),
            R::F64Floor => self.round(i, true, 0x01),
            R::F64Trunc => self.round(i, true, 0x03),
            R::F64Nearest => self.round(i, true, 0x00),

            // abs/neg/copysign are sign-bit surgery on the integer file.
            R::F32Abs => self.sign_op(i, false, SignOp::Abs),
            R::F32Neg => self.sign_op(i, false, SignOp::Neg),
            R::F64Abs => self.sign_op(i, true, SignOp::Abs),
            R::F64Neg => self.sign_op(i, true, SignOp::Neg),
            R::F32Copysign => self.sign_op(i, false, SignOp::Copysign),
            R::F64Copysign => self.sign_op(i, true, SignOp::Copysign),

            R::F32Eq => self.fcmp_eq_ne(i, false, true),
            R::F32Ne => self.fcmp_eq_ne(i, false, false),
            R::F64Eq => self.fcmp_eq_ne(i, true, true),
            R::F64Ne => self.fcmp_eq_ne(i, true, false),
            R::F32Lt => self.fcmp_ord(i, false, true, false),
            R::F32Le => self.fcmp_ord(i, false, true, true),
            R::F32Gt => self.fcmp_ord(i, false, false, false),
            R::F32Ge => self.fcmp_ord(i, false, false, true),
            R::F64Lt => self.fcmp_ord(i, true, true, false),
            R::F64Le => self.fcmp_ord(i, true, true, true),
            R::F64Gt => self.fcmp_ord(i, true, false, false),
            R::F64Ge => self.fcmp_ord(i, true, false, true),

            R::F32ConvertI32S => self.int_to_fp(i, 0xF3, false),
            R::F64ConvertI32S => self.int_to_fp(i, 0xF2, false),
            R::F32ConvertI64S => self.int_to_fp(i, 0xF3, true),
            R::F64ConvertI64S => self.int_to_fp(i, 0xF2, true),
            R::F32ConvertI32U | R::F64ConvertI32U => {
                // Zero-extended 32-bit value converts exactly through the
                // signed 64-bit path.
                let prefix = if i.op == R::F32ConvertI32U { 0xF3 } else { 0xF2 };
                self.int_to_fp(i, prefix, true)
            }
            R::F32DemoteF64 => self.fp2(i, 0xF2, 0x5A),
            R::F64PromoteF32 => self.fp2(i, 0xF3, 0x5A),
            R::I32ReinterpretF32 | R::F32ReinterpretI32 => {
                let a = self.read(i.rs1, RCX);
                let rd = self.dst(i.rd);
                self.rex(false, a, rd);
                self.byte(0x89);
                self.modrm_reg(a, rd);
                self.commit(i.rd);
            }
            R::I64ReinterpretF64 | R::F64ReinterpretI64 => {
                let a = self.read(i.rs1, RCX);
                self.write_from(i.rd, a);
            }

            // Shapes the ISA cannot express without long sequences stay on
            // the register interpreter.
            R::F32Min | R::F32Max | R::F64Min | R::F64Max => {
                return Err("float min/max semantics")
            }
            R::F32ConvertI64U | R::F64ConvertI64U => {
                return Err("unsigned 64-bit convert")
            }
            R::I32TruncSatF32S | R::I32TruncSatF32U | R::I32TruncSatF64S
            | R::I32TruncSatF64U | R::I64TruncSatF32S | R::I64TruncSatF32U
            | R::I64TruncSatF64S | R::I64TruncSatF64U => {
                return Err("saturating truncation")
            }
            R::I32TruncF32S | R::I32TruncF32U | R::I32TruncF64S | R::I32TruncF64U
            | R::I64TruncF32S | R::I64TruncF32U | R::I64TruncF64S | R::I64TruncF64U => {
                return Err("trapping float truncation")
            }

            _ => return Err("unsupported opcode"),
        }
        Ok(())
    }

    fn int_to_fp(&mut self, i: RegInstr, prefix: u8, w: bool) {
        let a = self.read(i.rs1, RAX);
        let rd = self.fp_write(i.rd, &[]);
        self.byte(prefix);
        self.rex(w, rd, a);
        self.bytes(&[0x0F, 0x2A]);
        self.modrm_reg(rd, a);
    }

    fn fcmp_eq_ne(&mut self, i: RegInstr, double: bool, eq: bool) {
        let a = self.fp_read(i.rs1);
        let b = self.fp_read(i.rs2());
        self.fcmp(double, a, b);
        self.flush_fp_all();
        if eq {
            // eq: ZF=1 && PF=0.
            self.bytes(&[0x0F, 0x9B, 0xC2]); // setnp dl
            self.bytes(&[0x0F, 0x94, 0xC1]); // sete cl
            self.bytes(&[0x20, 0xCA]); // and dl, cl
        } else {
            // ne: ZF=0 || PF=1.
            self.bytes(&[0x0F, 0x9A, 0xC2]); // setp dl
            self.bytes(&[0x0F, 0x95, 0xC1]); // setne cl
            self.bytes(&[0x08, 0xCA]); // or dl, cl
        }
        let dst = self.dst(i.rd);
        self.rex(false, dst, RDX);
        self.bytes(&[0x0F, 0xB6]);
        self.modrm_reg(dst, RDX);
        self.commit(i.rd);
    }

    /// Ordered compares via operand swap: `a < b` is `ucomis(b, a); seta`.
    fn fcmp_ord(&mut self, i: RegInstr, double: bool, swap: bool, or_equal: bool) {
        let a = self.fp_read(i.rs1);
        let b = self.fp_read(i.rs2());
        if swap {
            self.fcmp(double, b, a);
        } else {
            self.fcmp(double, a, b);
        }
        self.flush_fp_all();
        self.setcc_into(i.rd, if or_equal { CC_AE } else { CC_A });
    }

    fn sign_op(&mut self, i: RegInstr, double: bool, op: SignOp) {
        let sign: u64 = if double { 1 << 63 } else { 1 << 31 };
        match op {
            SignOp::Abs | SignOp::Neg => {
                let a = self.read(i.rs1, RAX);
                let rd = self.dst(i.rd);
                self.mov_rr(rd, a);
                self.mov_imm64(RCX, if op == SignOp::Abs { !sign & mask(double) } else { sign });
                let opcode = if op == SignOp::Abs { 0x21 } else { 0x31 };
                self.rex(true, RCX, rd);
                self.byte(opcode);
                self.modrm_reg(RCX, rd);
                self.commit(i.rd);
            }
            SignOp::Copysign => {
                let b = self.read(i.rs2(), RAX);
                self.mov_rr(RDX, b);
                self.mov_imm64(RCX, sign);
                self.rex(true, RCX, RDX);
                self.byte(0x21); // and rdx, sign
                self.modrm_reg(RCX, RDX);
                let a = self.read(i.rs1, RAX);
                let rd = self.dst(i.rd);
                self.mov_rr(rd, a);
                self.mov_imm64(RCX, !sign & mask(double));
                self.rex(true, RCX, rd);
                self.byte(0x21); // and rd, !sign
                self.modrm_reg(RCX, rd);
                self.rex(true, RDX, rd);
                self.byte(0x09); // or rd, rdx
                self.modrm_reg(RDX, rd);
                self.commit(i.rd);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SignOp {
    Abs,
    Neg,
    Copysign,
}

fn mask(double: bool) -> u64 {
    if double {
        u64::MAX
    } else {
        u32::MAX as u64
    }
}

#[derive(Clone, Copy)]
enum LoadKind {
    U8,
    U16,
    U32,
    U64,
    S8_32,
    S8_64,
    S16_32,
    S16_64,
    S32_64,
}

/// rsp/rbp/rsi/rdi need a REX prefix to address their low byte.
fn reg_needs_rex8(r: u8) -> bool {
    (4..=7).contains(&r)
}

fn is_fp_op(op: RegOp) -> bool {
    use RegOp as R;
    matches!(
        op,
        R::F32Add
            | R::F32Sub
            | R::F32Mul
            | R::F32Div
            | R::F32Sqrt
            | R::F32Ceil
            | R::F32Floor
            | R::F32Trunc
            | R::F32Nearest
            | R::F64Add
            | R::F64Sub
            | R::F64Mul
            | R::F64Div
            | R::F64Sqrt
            | R::F64Ceil
            | R::F64Floor
            | R::F64Trunc
            | R::F64Nearest
            | R::F32DemoteF64
            | R::F64PromoteF32
    )
}
