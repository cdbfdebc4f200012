//! AArch64 back end.
//!
//! Register plan:
//!
//! | role | registers |
//! |---|---|
//! | first 8 Wasm locals | x19..x26 (callee-saved) |
//! | bridge pointer | x27 (callee-saved) |
//! | memory base | x28 (callee-saved) |
//! | first 8 stack temporaries | x8..x15 (caller-saved) |
//! | scratch | x16, x17 |
//! | call marshalling / ABI | x0..x7 |
//! | FP cache | d2..d7 |
//!
//! Virtual registers beyond the mapped sets spill to frame slots. The cold
//! entry saves the callee-saved set and loads parameters from the args
//! buffer; the self-call entry expects arguments pre-loaded in x2.. and
//! skips the save, with a frame flag steering the epilogue to skip the
//! symmetric restore.
//!
//! Frame layout (offsets from sp after the prologue):
//!
//! ```text
//! +0    outgoing bridge-call argument buffer (8 slots)
//! +64   bridge-call return slot
//! +80   self-call register save area (16 slots)
//! +208  restore flag (1 = cold entry)
//! +216  args-buffer pointer (0 for the self entry)
//! +224  spill slots
//! ```

use reef_asm::{RegInstr, RegOp, TrapReason};

use crate::lower::RegFunc;

use super::{bridge_offsets, buf::CodeBuf, CompileCtx, CompiledFunc};

const OUT_ARGS: u32 = 0;
const RET_SLOT: u32 = 64;
const SELF_SAVE: u32 = 80;
const FLAG: u32 = 208;
const ARGS_PTR: u32 = 216;
const SPILL: u32 = 224;

const BRIDGE: u8 = 27;
const MEM_BASE: u8 = 28;
const S0: u8 = 16;
const S1: u8 = 17;
const ZR: u8 = 31;
const SP: u8 = 31;
const FP: u8 = 29;
const LR: u8 = 30;

const MAPPED_LOCALS: usize = 8;
const MAPPED_TEMPS: usize = 8;

// Condition codes.
const EQ: u8 = 0x0;
const NE: u8 = 0x1;
const HS: u8 = 0x2;
const LO: u8 = 0x3;
const MI: u8 = 0x4;
const HI: u8 = 0x8;
const LS: u8 = 0x9;
const GE: u8 = 0xA;
const LT: u8 = 0xB;
const GT: u8 = 0xC;
const LE: u8 = 0xD;

/// Fixup sentinel: branch to the body start.
const TARGET_BODY: usize = usize::MAX;
/// Fixup sentinel: branch to the error epilogue (status already in x0).
const TARGET_ERR: usize = usize::MAX - 1;

/// Where a virtual register lives.
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
    /// (native offset, IR target or sentinel, 19-bit form).
    fixups: Vec<(usize, usize, bool)>,
    /// (native offset of a cbz/b.cond, trap reason) resolved to stubs.
    trap_fixups: Vec<(usize, TrapReason)>,
    targets: Vec<bool>,
    frame_size: u32,
    /// d2..d7 cache: cached vreg and dirty bit per host register.
    fp_cache: [Option<(u8, bool)>; 6],
    fp_next: usize,
    body_start: usize,
    self_entry: usize,
    epilogue_err: usize,
}

/// Compile one function.
pub(super) fn compile(
    cx: &CompileCtx<'_>,
    func: &RegFunc,
) -> Result<CompiledFunc, &'static str> {
    let spills = spill_count(func);
    let frame_size = (SPILL + spills * 8 + 15) & !15;
    if frame_size >= 4096 * 2 {
        return Err("frame too large");
    }

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
    // The success epilogue doubles as the target of branches past the end.
    e.pc_map[func.code.len()] = e.code.len() as u32;
    e.emit_epilogues();
    e.emit_trap_stubs();
    e.patch_fixups()?;

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
    fn put(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch32(&mut self, at: usize, word: u32) {
        self.code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    // Virtual register homes.

    fn home(&self, v: u8) -> Home {
        let v = v as usize;
        if v < self.func.local_count {
            if v < MAPPED_LOCALS {
                Home::Reg(19 + v as u8)
            } else {
                Home::Slot(SPILL + ((v - MAPPED_LOCALS) as u32) * 8)
            }
        } else {
            let t = v - self.func.local_count;
            if t < MAPPED_TEMPS {
                Home::Reg(8 + t as u8)
            } else {
                let local_spills = self.func.local_count.saturating_sub(MAPPED_LOCALS);
                Home::Slot(SPILL + ((local_spills + t - MAPPED_TEMPS) as u32) * 8)
            }
        }
    }

    /// Slot a mapped register is saved to around a self-call.
    fn self_save_slot(&self, v: u8) -> u32 {
        let v = v as usize;
        if v < self.func.local_count {
            SELF_SAVE + (v as u32) * 8
        } else {
            SELF_SAVE + ((8 + v - self.func.local_count) as u32) * 8
        }
    }

    /// Save the mapped temporaries around a C call (they live in
    /// caller-saved registers).
    fn save_temps(&mut self) {
        let live = (self.func.reg_count - self.func.local_count).min(MAPPED_TEMPS);
        for t in 0..live {
            self.str_imm(8 + t as u8, SP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
    }

    fn restore_temps(&mut self) {
        let live = (self.func.reg_count - self.func.local_count).min(MAPPED_TEMPS);
        for t in 0..live {
            self.ldr_imm(8 + t as u8, SP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
    }

    /// Materialize a vreg into a host register, using `scratch` for spills.
    fn read(&mut self, v: u8, scratch: u8) -> u8 {
        self.flush_fp_of(v);
        match self.home(v) {
            Home::Reg(r) => r,
            Home::Slot(offset) => {
                self.ldr_imm(scratch, SP, offset);
                scratch
            }
        }
    }

    /// The host register a result should be computed into.
    fn dst(&self, v: u8) -> u8 {
        match self.home(v) {
            Home::Reg(r) => r,
            Home::Slot(_) => S0,
        }
    }

    /// Write back a result produced in `dst(v)`.
    fn commit(&mut self, v: u8) {
        self.evict_fp_of(v);
        if let Home::Slot(offset) = self.home(v) {
            self.str_imm(S0, SP, offset);
        }
    }

    /// Route a value currently in `src` into a vreg's home.
    fn write_from(&mut self, v: u8, src: u8) {
        self.evict_fp_of(v);
        match self.home(v) {
            Home::Reg(r) => self.mov_rr(r, src),
            Home::Slot(offset) => self.str_imm(src, SP, offset),
        }
    }

    // FP cache (d2..d7).

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

    fn fp_writeback(&mut self, dreg: u8, v: u8) {
        // fmov x16, d<n>, then store to the vreg's home.
        self.put(0x9E66_0000 | u32::from(dreg) << 5 | u32::from(S0));
        match self.home(v) {
            Home::Reg(r) => self.mov_rr(r, S0),
            Home::Slot(offset) => self.str_imm(S0, SP, offset),
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
                self.ldr_imm(S0, SP, offset);
                S0
            }
        };
        let dreg = slot as u8 + 2;
        self.put(0x9E67_0000 | u32::from(src) << 5 | u32::from(dreg)); // fmov d, x
        self.fp_cache[slot] = Some((v, false));
        dreg
    }

    fn fp_write(&mut self, v: u8, avoid: &[u8]) -> u8 {
        self.evict_fp_of(v);
        let slot = self.fp_alloc(avoid);
        self.fp_cache[slot] = Some((v, true));
        slot as u8 + 2
    }

    /// Pick a cache register, never one of `avoid` (live operand dregs).
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

    // Instruction helpers.

    fn mov_rr(&mut self, rd: u8, rm: u8) {
        if rd != rm {
            self.put(0xAA00_03E0 | u32::from(rm) << 16 | u32::from(rd));
        }
    }

    fn mov_imm64(&mut self, rd: u8, value: u64) {
        let chunks = [
            (value & 0xFFFF) as u32,
            ((value >> 16) & 0xFFFF) as u32,
            ((value >> 32) & 0xFFFF) as u32,
            ((value >> 48) & 0xFFFF) as u32,
        ];
        // movz on the first nonzero chunk (or a bare movz #0), movk after.
        let first = chunks.iter().position(|&c| c != 0).unwrap_or(0);
        self.put(0xD280_0000 | (first as u32) << 21 | chunks[first] << 5 | u32::from(rd));
        for (hw, &chunk) in chunks.iter().enumerate().skip(first + 1) {
            if chunk != 0 {
                self.put(0xF280_0000 | (hw as u32) << 21 | chunk << 5 | u32::from(rd));
            }
        }
    }

    fn add_imm(&mut self, rd: u8, rn: u8, imm: u32) {
        debug_assert!(imm < 4096);
        self.put(0x9100_0000 | imm << 10 | u32::from(rn) << 5 | u32::from(rd));
    }

    fn ldr_imm(&mut self, rt: u8, rn: u8, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.put(0xF940_0000 | (offset / 8) << 10 | u32::from(rn) << 5 | u32::from(rt));
    }

    fn str_imm(&mut self, rt: u8, rn: u8, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.put(0xF900_0000 | (offset / 8) << 10 | u32::from(rn) << 5 | u32::from(rt));
    }

    fn stp_pre(&mut self, rt: u8, rt2: u8) {
        self.put(0xA9BF_0000 | u32::from(rt2) << 10 | u32::from(SP) << 5 | u32::from(rt));
    }

    fn ldp_post(&mut self, rt: u8, rt2: u8) {
        self.put(0xA8C1_0000 | u32::from(rt2) << 10 | u32::from(SP) << 5 | u32::from(rt));
    }

    fn ldp_below_fp(&mut self, rt: u8, rt2: u8, pair_index: u32) {
        // ldp rt, rt2, [x29, #-(16 * pair_index)]
        let imm7 = (0u32.wrapping_sub(2 * pair_index)) & 0x7F;
        self.put(
            0xA940_0000
                | imm7 << 15
                | u32::from(rt2) << 10
                | u32::from(FP) << 5
                | u32::from(rt),
        );
    }

    fn cmp_rr(&mut self, is64: bool, rn: u8, rm: u8) {
        let base = if is64 { 0xEB00_001F } else { 0x6B00_001F };
        self.put(base | u32::from(rm) << 16 | u32::from(rn) << 5);
    }

    fn cset(&mut self, rd: u8, cond: u8) {
        self.put(0x1A9F_07E0 | u32::from(cond ^ 1) << 12 | u32::from(rd));
    }

    fn blr(&mut self, rn: u8) {
        self.put(0xD63F_0000 | u32::from(rn) << 5);
    }

    fn b_fix(&mut self, ir_target: usize) {
        self.fixups.push((self.here(), ir_target, false));
        self.put(0x1400_0000);
    }

    fn b_cond_fix(&mut self, cond: u8, ir_target: usize) {
        self.fixups.push((self.here(), ir_target, true));
        self.put(0x5400_0000 | u32::from(cond));
    }

    fn cbz32_fix(&mut self, rt: u8, ir_target: usize) {
        self.fixups.push((self.here(), ir_target, true));
        self.put(0x3400_0000 | u32::from(rt));
    }

    fn cbnz32_fix(&mut self, rt: u8, ir_target: usize) {
        self.fixups.push((self.here(), ir_target, true));
        self.put(0x3500_0000 | u32::from(rt));
    }

    fn bl_abs(&mut self, native_target: usize) {
        let delta = (native_target as i64 - self.here() as i64) / 4;
        self.put(0x9400_0000 | (delta as u32 & 0x03FF_FFFF));
    }

    fn b_abs(&mut self, native_target: usize) {
        let delta = (native_target as i64 - self.here() as i64) / 4;
        self.put(0x1400_0000 | (delta as u32 & 0x03FF_FFFF));
    }

    /// Conditional branch into a trap stub.
    fn trap_cond(&mut self, cond: u8, reason: TrapReason) {
        self.trap_fixups.push((self.here(), reason));
        self.put(0x5400_0000 | u32::from(cond));
    }

    /// `cbz` (32- or 64-bit) into a trap stub.
    fn trap_cbz(&mut self, is64: bool, rt: u8, reason: TrapReason) {
        self.trap_fixups.push((self.here(), reason));
        let base = if is64 { 0xB400_0000 } else { 0x3400_0000 };
        self.put(base | u32::from(rt));
    }

    /// Bridge-call status check: nonzero w0 leaves through the error
    /// epilogue with the status preserved.
    fn status_check(&mut self) {
        self.cbnz32_fix(0, TARGET_ERR);
    }

    // Prologues, epilogues, stubs.

    fn prologue_cold(&mut self) {
        self.stp_pre(FP, LR);
        self.add_imm(FP, SP, 0);
        self.stp_pre(19, 20);
        self.stp_pre(21, 22);
        self.stp_pre(23, 24);
        self.stp_pre(25, 26);
        self.stp_pre(27, 28);
        self.sub_sp(self.frame_size);
        self.mov_imm64(S0, 1);
        self.str_imm(S0, SP, FLAG);
        self.str_imm(0, SP, ARGS_PTR);
        self.mov_rr(BRIDGE, 1);
        self.ldr_imm(MEM_BASE, BRIDGE, bridge_offsets::MEM_BASE);
        for i in 0..self.func.param_count.min(self.func.local_count) {
            let offset = (i * 8) as u32;
            match self.home(i as u8) {
                Home::Reg(r) => self.ldr_imm(r, 0, offset),
                Home::Slot(slot) => {
                    self.ldr_imm(S0, 0, offset);
                    self.str_imm(S0, SP, slot);
                }
            }
        }
        self.b_fix(TARGET_BODY);
    }

    fn sub_sp(&mut self, amount: u32) {
        let mut remaining = amount;
        while remaining > 0 {
            let step = remaining.min(4080);
            self.put(0xD100_0000 | step << 10 | u32::from(SP) << 5 | u32::from(SP));
            remaining -= step;
        }
    }

    /// Emit the hot entry. Returns whether it is usable.
    fn prologue_self(&mut self) -> bool {
        let usable = self.func.param_count <= 8;
        self.stp_pre(FP, LR);
        self.add_imm(FP, SP, 0);
        // Reserve the 80 bytes where the cold entry saved callee-saved
        // registers so frame offsets match between the entries.
        self.sub_sp(80 + self.frame_size);
        self.str_imm(ZR, SP, FLAG);
        self.str_imm(ZR, SP, ARGS_PTR);
        if usable {
            for i in 0..self.func.param_count {
                let src = 2 + i as u8;
                match self.home(i as u8) {
                    Home::Reg(r) => self.mov_rr(r, src),
                    Home::Slot(slot) => self.str_imm(src, SP, slot),
                }
            }
        }
        // Falls through into the shared tail at body_start.
        usable
    }

    fn emit_shared_entry_tail(&mut self) {
        for i in self.func.param_count..self.func.local_count {
            match self.home(i as u8) {
                Home::Reg(r) => self.mov_rr(r, ZR),
                Home::Slot(slot) => self.str_imm(ZR, SP, slot),
            }
        }
        self.fuel_check(S0);
    }

    /// Decrement the bridge fuel cell unless metering is off (all-ones).
    /// Clobbers only `scratch`.
    fn fuel_check(&mut self, scratch: u8) {
        self.ldr_imm(scratch, BRIDGE, bridge_offsets::FUEL);
        self.put(0xB100_041F | u32::from(scratch) << 5); // cmn x, #1
        let skip_at = self.here();
        self.put(0x5400_0000 | u32::from(EQ));
        self.trap_cbz(true, scratch, TrapReason::FuelExhausted);
        self.put(0xD100_0400 | u32::from(scratch) << 5 | u32::from(scratch)); // sub #1
        self.str_imm(scratch, BRIDGE, bridge_offsets::FUEL);
        let delta = ((self.here() - skip_at) / 4) as u32;
        self.patch32(skip_at, 0x5400_0000 | (delta & 0x7FFFF) << 5 | u32::from(EQ));
    }

    fn emit_epilogues(&mut self) {
        // Success: status 0; a result is already in x1; store it into the
        // caller's args buffer when one exists (cold entry only).
        self.put(0xAA1F_03E0); // mov x0, xzr
        self.ldr_imm(S0, SP, ARGS_PTR);
        let skip_at = self.here();
        self.put(0xB400_0000 | u32::from(S0)); // cbz x16 (patched)
        self.str_imm(1, S0, 0);
        let delta = ((self.here() - skip_at) / 4) as u32;
        self.patch32(skip_at, 0xB400_0000 | (delta & 0x7FFFF) << 5 | u32::from(S0));

        // Error path joins here; x0 carries the status. The signal handler
        // redirects faulting PCs here with x0 rewritten to the trap code.
        self.epilogue_err = self.here();
        self.ldr_imm(S1, SP, FLAG);
        let skip_restore = self.here();
        self.put(0x3400_0000 | u32::from(S1)); // cbz w17 (patched)
        self.ldp_below_fp(19, 20, 1);
        self.ldp_below_fp(21, 22, 2);
        self.ldp_below_fp(23, 24, 3);
        self.ldp_below_fp(25, 26, 4);
        self.ldp_below_fp(27, 28, 5);
        let delta = ((self.here() - skip_restore) / 4) as u32;
        self.patch32(
            skip_restore,
            0x3400_0000 | (delta & 0x7FFFF) << 5 | u32::from(S1),
        );
        self.add_imm(SP, FP, 0); // mov sp, x29
        self.ldp_post(FP, LR);
        self.put(0xD65F_03C0); // ret
    }

    fn emit_trap_stubs(&mut self) {
        let fixups = std::mem::take(&mut self.trap_fixups);
        let mut stubs: Vec<(TrapReason, usize)> = Vec::new();
        for (at, reason) in fixups {
            let stub = match stubs.iter().find(|(r, _)| *r == reason) {
                Some(&(_, offset)) => offset,
                None => {
                    let offset = self.here();
                    self.mov_imm64(0, u64::from(reason.code()));
                    self.b_abs(self.epilogue_err);
                    stubs.push((reason, offset));
                    offset
                }
            };
            let delta = ((stub as i64 - at as i64) / 4) as u32;
            let insn = u32::from_le_bytes(self.code[at..at + 4].try_into().expect("4"));
            self.patch32(at, insn | (delta & 0x7FFFF) << 5);
        }
    }

    fn patch_fixups(&mut self) -> Result<(), &'static str> {
        let fixups = std::mem::take(&mut self.fixups);
        for (at, ir_target, narrow) in fixups {
            let native = match ir_target {
                TARGET_BODY => self.body_start,
                TARGET_ERR => self.epilogue_err,
                t => self.pc_map[t] as usize,
            };
            let delta = (native as i64 - at as i64) / 4;
            let insn = u32::from_le_bytes(self.code[at..at + 4].try_into().expect("4"));
            let patched = if narrow {
                if !(-(1 << 18)..(1 << 18)).contains(&delta) {
                    return Err("conditional branch out of range");
                }
                insn | ((delta as u32) & 0x7FFFF) << 5
            } else {
                if !(-(1 << 25)..(1 << 25)).contains(&delta) {
                    return Err("branch out of range");
                }
                insn | (delta as u32) & 0x03FF_FFFF
            };
            self.patch32(at, patched);
        }
        Ok(())
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
                let src = self.read(i.rs1, S0);
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
                    self.fuel_check(S0);
                }
                self.b_fix(i.operand as usize);
            }
            R::BrIf | R::BrIfNot => {
                let cond = self.read(i.rs1, S0);
                if i.operand as usize <= pc {
                    self.fuel_check(if cond == S0 { S1 } else { S0 });
                }
                if i.op == R::BrIf {
                    self.cbnz32_fix(cond, i.operand as usize);
                } else {
                    self.cbz32_fix(cond, i.operand as usize);
                }
            }
            R::BrTable => {
                let count = i.operand as usize;
                if count > 4095 {
                    return Err("branch table too large");
                }
                let index = self.read(i.rs1, S0);
                // Clamp to the default entry, charge fuel conservatively.
                self.mov_imm64(S1, (count - 1) as u64);
                self.cmp_rr(false, index, S1);
                // csel w16, w<index>, w17, lo
                self.put(
                    0x1A80_0000
                        | u32::from(S1) << 16
                        | u32::from(LO) << 12
                        | u32::from(index) << 5
                        | u32::from(S0),
                );
                self.fuel_check(S1);
                // Compare ladder; trivial relocation, adequate dispatch for
                // the table sizes the register tier accepts.
                for entry in 0..count {
                    let target = self.func.code[pc + 1 + entry].operand as usize;
                    if entry == count - 1 {
                        self.b_fix(target);
                    } else {
                        self.put(0x7100_001F | (entry as u32) << 10 | u32::from(S0) << 5);
                        self.b_cond_fix(EQ, target);
                    }
                }
                return Ok(pc + 1 + count);
            }
            R::Ret => {
                if i.rd != 0 {
                    let src = self.read(i.rs1, S0);
                    self.mov_rr(1, src);
                }
                self.b_fix(self.func.code.len());
            }

            R::Call => return self.emit_call(pc, i),
            R::ReturnCall => return self.emit_return_call(pc, i),
            R::CallIndirect => return self.emit_call_indirect(pc, i),

            R::Select => {
                let cond = self.read((i.operand >> 8) as u8, S1);
                self.put(0x7100_001F | u32::from(cond) << 5); // cmp w, #0
                let a = self.read(i.rs1, S0);
                let b = self.read(i.operand as u8, S1);
                let rd = self.dst(i.rd);
                self.put(
                    0x9A80_0000
                        | u32::from(b) << 16
                        | u32::from(NE) << 12
                        | u32::from(a) << 5
                        | u32::from(rd),
                );
                self.commit(i.rd);
            }

            R::GlobalGet => {
                self.save_temps();
                self.mov_rr(0, BRIDGE);
                self.mov_imm64(1, u64::from(i.operand));
                self.ldr_imm(S1, BRIDGE, bridge_offsets::GLOBAL_GET);
                self.blr(S1);
                self.restore_temps();
                self.write_from(i.rd, 0);
            }
            R::GlobalSet => {
                let src = self.read(i.rs1, S0);
                self.mov_rr(2, src);
                self.save_temps();
                self.mov_rr(0, BRIDGE);
                self.mov_imm64(1, u64::from(i.operand));
                self.ldr_imm(S1, BRIDGE, bridge_offsets::GLOBAL_SET);
                self.blr(S1);
                self.restore_temps();
            }

            R::MemorySize => {
                self.save_temps();
                self.mov_rr(0, BRIDGE);
                self.ldr_imm(S1, BRIDGE, bridge_offsets::MEMORY_SIZE);
                self.blr(S1);
                self.restore_temps();
                self.write_from(i.rd, 0);
            }
            R::MemoryGrow => {
                let delta = self.read(i.rs1, S0);
                self.mov_rr(1, delta);
                self.save_temps();
                self.mov_rr(0, BRIDGE);
                self.ldr_imm(S1, BRIDGE, bridge_offsets::MEMORY_GROW);
                self.blr(S1);
                self.restore_temps();
                self.write_from(i.rd, 0);
            }
            R::MemoryFill | R::MemoryCopy => {
                let field = if i.op == R::MemoryFill {
                    bridge_offsets::MEMORY_FILL
                } else {
                    bridge_offsets::MEMORY_COPY
                };
                let dst = self.read(i.rs1, S0);
                self.mov_rr(1, dst);
                let second = self.read(i.rs2(), S0);
                self.mov_rr(2, second);
                let len = self.read(i.rd, S0);
                self.mov_rr(3, len);
                self.save_temps();
                self.mov_rr(0, BRIDGE);
                self.ldr_imm(S1, BRIDGE, field);
                self.blr(S1);
                self.restore_temps();
                self.status_check();
            }

            R::I32Load => self.load_mem(i, 0xB940_0000, 4),
            R::I64Load | R::F64Load => self.load_mem(i, 0xF940_0000, 8),
            R::F32Load => self.load_mem(i, 0xB940_0000, 4),
            R::I32Load8U | R::I64Load8U => self.load_mem(i, 0x3940_0000, 1),
            R::I32Load8S => self.load_mem(i, 0x39C0_0000, 1),
            R::I64Load8S => self.load_mem(i, 0x3980_0000, 1),
            R::I32Load16U | R::I64Load16U => self.load_mem(i, 0x7940_0000, 2),
            R::I32Load16S => self.load_mem(i, 0x79C0_0000, 2),
            R::I64Load16S => self.load_mem(i, 0x7980_0000, 2),
            R::I64Load32U => self.load_mem(i, 0xB940_0000, 4),
            R::I64Load32S => self.load_mem(i, 0xB980_0000, 4),
            R::I32Store | R::F32Store => self.store_mem(i, 0xB900_0000, 4),
            R::I64Store | R::F64Store => self.store_mem(i, 0xF900_0000, 8),
            R::I32Store8 | R::I64Store8 => self.store_mem(i, 0x3900_0000, 1),
            R::I32Store16 | R::I64Store16 => self.store_mem(i, 0x7900_0000, 2),
            R::I64Store32 => self.store_mem(i, 0xB900_0000, 4),

            _ => self.alu(i)?,
        }
        Ok(pc + 1)
    }

    fn load_mem(&mut self, i: RegInstr, opcode: u32, size: u32) {
        let addr = self.read(i.rs1, S0);
        // ea = mem_base + zext(addr32)
        self.put(
            0x8B20_4000 | u32::from(addr) << 16 | u32::from(MEM_BASE) << 5 | u32::from(S1),
        );
        let offset = i.operand;
        if offset % size == 0 && offset / size < 4096 {
            let rd = self.dst(i.rd);
            self.put(opcode | (offset / size) << 10 | u32::from(S1) << 5 | u32::from(rd));
        } else {
            self.mov_imm64(S0, u64::from(offset));
            self.put(0x8B00_0000 | u32::from(S0) << 16 | u32::from(S1) << 5 | u32::from(S1));
            let rd = self.dst(i.rd);
            self.put(opcode | u32::from(S1) << 5 | u32::from(rd));
        }
        self.commit(i.rd);
    }

    fn store_mem(&mut self, i: RegInstr, opcode: u32, size: u32) {
        let addr = self.read(i.rs1, S0);
        self.put(
            0x8B20_4000 | u32::from(addr) << 16 | u32::from(MEM_BASE) << 5 | u32::from(S1),
        );
        let offset = i.operand;
        let folded = offset % size == 0 && offset / size < 4096;
        if !folded {
            // Fold the full offset into the address before loading the
            // value, keeping S0 free for it.
            self.mov_imm64(S0, u64::from(offset));
            self.put(0x8B00_0000 | u32::from(S0) << 16 | u32::from(S1) << 5 | u32::from(S1));
        }
        let value = self.read(i.rd, S0);
        if folded {
            self.put(opcode | (offset / size) << 10 | u32::from(S1) << 5 | u32::from(value));
        } else {
            self.put(opcode | u32::from(S1) << 5 | u32::from(value));
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
        if self.cx.is_self_call(i.operand) && params <= 8 {
            self.emit_self_call(&args, results, i.rd);
        } else {
            self.emit_bridge_call(i.operand, &args, results == 1, i.rd);
        }
        Ok(pc + 1 + aux)
    }

    /// Direct self-call: spill the mapped register file to the save area,
    /// load arguments into x2.., branch-and-link to the hot entry, restore.
    fn emit_self_call(&mut self, args: &[u8], results: usize, rd: u8) {
        let live_locals = self.func.local_count.min(MAPPED_LOCALS);
        let live_temps = (self.func.reg_count - self.func.local_count).min(MAPPED_TEMPS);
        for l in 0..live_locals {
            self.str_imm(19 + l as u8, SP, SELF_SAVE + (l as u32) * 8);
        }
        for t in 0..live_temps {
            self.str_imm(8 + t as u8, SP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
        // Arguments load from saved homes: destinations x2.. never clobber
        // the save area or the spill slots.
        for (n, &arg) in args.iter().enumerate() {
            let dst = 2 + n as u8;
            match self.home(arg) {
                Home::Reg(_) => {
                    let slot = self.self_save_slot(arg);
                    self.ldr_imm(dst, SP, slot);
                }
                Home::Slot(slot) => self.ldr_imm(dst, SP, slot),
            }
        }
        self.bl_abs(self.self_entry);
        for l in 0..live_locals {
            self.ldr_imm(19 + l as u8, SP, SELF_SAVE + (l as u32) * 8);
        }
        for t in 0..live_temps {
            self.ldr_imm(8 + t as u8, SP, SELF_SAVE + ((8 + t) as u32) * 8);
        }
        self.status_check();
        if results == 1 {
            self.write_from(rd, 1);
        }
    }

    /// Call through the shared bridge trampoline.
    fn emit_bridge_call(&mut self, func_index: u32, args: &[u8], take_result: bool, rd: u8) {
        for (n, &arg) in args.iter().enumerate() {
            let src = self.read(arg, S0);
            self.str_imm(src, SP, OUT_ARGS + (n as u32) * 8);
        }
        self.save_temps();
        self.mov_rr(0, BRIDGE);
        self.mov_imm64(1, u64::from(func_index));
        self.add_imm(2, SP, OUT_ARGS);
        self.mov_imm64(3, args.len() as u64);
        self.add_imm(4, SP, RET_SLOT);
        self.ldr_imm(S1, BRIDGE, bridge_offsets::CALL);
        self.blr(S1);
        self.restore_temps();
        self.status_check();
        if take_result {
            self.ldr_imm(S0, SP, RET_SLOT);
            self.write_from(rd, S0);
        }
    }

    fn emit_return_call(&mut self, pc: usize, i: RegInstr) -> Result<usize, &'static str> {
        let (params, _) = self.cx.callee_sig(i.operand);
        let aux = params.div_ceil(RegInstr::ARGS_PER_AUX);
        let args = self.collect_args(pc + 1, params);
        if self.cx.is_self_call(i.operand) && params <= 8 {
            // Frame reuse: stage arguments in x2.., commit them into the
            // parameter homes, and branch to the body (which re-zeroes the
            // non-parameter locals).
            for (n, &arg) in args.iter().enumerate() {
                let src = self.read(arg, S0);
                self.mov_rr(2 + n as u8, src);
            }
            for n in 0..args.len() {
                match self.home(n as u8) {
                    Home::Reg(r) => self.mov_rr(r, 2 + n as u8),
                    Home::Slot(slot) => self.str_imm(2 + n as u8, SP, slot),
                }
            }
            self.b_fix(TARGET_BODY);
        } else {
            self.emit_bridge_call(i.operand, &args, false, 0);
            if self.func.has_result {
                self.ldr_imm(1, SP, RET_SLOT);
            }
            self.b_fix(self.func.code.len());
        }
        Ok(pc + 1 + aux)
    }

    fn emit_call_indirect(&mut self, pc: usize, i: RegInstr) -> Result<usize, &'static str> {
        let (params, results) = self.cx.type_sig(i.operand);
        let aux = 1 + params.div_ceil(RegInstr::ARGS_PER_AUX);
        let table_index = self.func.code[pc + 1].operand;
        let args = self.collect_args(pc + 2, params);

        for (n, &arg) in args.iter().enumerate() {
            let src = self.read(arg, S0);
            self.str_imm(src, SP, OUT_ARGS + (n as u32) * 8);
        }
        let elem = self.read(i.rs1, S0);
        self.mov_rr(3, elem);
        self.save_temps();
        self.mov_rr(0, BRIDGE);
        self.mov_imm64(1, u64::from(i.operand));
        self.mov_imm64(2, u64::from(table_index));
        self.add_imm(4, SP, OUT_ARGS);
        self.mov_imm64(5, args.len() as u64);
        self.add_imm(6, SP, RET_SLOT);
        self.ldr_imm(S1, BRIDGE, bridge_offsets::CALL_INDIRECT);
        self.blr(S1);
        self.restore_temps();
        self.status_check();
        if results == 1 {
            self.ldr_imm(S0, SP, RET_SLOT);
            self.write_from(i.rd, S0);
        }
        Ok(pc + 1 + aux)
    }

    // ALU lowering.

    fn rrr(&mut self, i: RegInstr, f: impl FnOnce(u32, u32, u32) -> u32) {
        let a = self.read(i.rs1, S0);
        let b = self.read(i.rs2(), S1);
        let rd = self.dst(i.rd);
        let word = f(u32::from(rd), u32::from(a), u32::from(b));
        self.put(word);
        self.commit(i.rd);
    }

    fn rr2(&mut self, i: RegInstr, f: impl FnOnce(u32, u32) -> u32) {
        let a = self.read(i.rs1, S0);
        let rd = self.dst(i.rd);
        self.put(f(u32::from(rd), u32::from(a)));
        self.commit(i.rd);
    }

    fn cmp_set(&mut self, i: RegInstr, is64: bool, cond: u8) {
        let a = self.read(i.rs1, S0);
        let b = self.read(i.rs2(), S1);
        self.cmp_rr(is64, a, b);
        let rd = self.dst(i.rd);
        self.cset(rd, cond);
        self.commit(i.rd);
    }

    fn cmp_imm_set(&mut self, i: RegInstr, cond: u8) {
        let a = self.read(i.rs1, S0);
        if i.operand < 4096 {
            self.put(0x7100_001F | i.operand << 10 | u32::from(a) << 5);
        } else {
            self.mov_imm64(S1, u64::from(i.operand));
            self.cmp_rr(false, a, S1);
        }
        let rd = self.dst(i.rd);
        self.cset(rd, cond);
        self.commit(i.rd);
    }

    fn alu_imm(&mut self, i: RegInstr, reg_form: u32) {
        let a = self.read(i.rs1, S0);
        self.mov_imm64(S1, u64::from(i.operand));
        let rd = self.dst(i.rd);
        self.put(reg_form | u32::from(S1) << 16 | u32::from(a) << 5 | u32::from(rd));
        self.commit(i.rd);
    }

    fn fp3(&mut self, i: RegInstr, base: u32) {
        let a = self.fp_read(i.rs1);
        let b = self.fp_read(i.rs2());
        let rd = self.fp_write(i.rd, &[a, b]);
        self.put(base | u32::from(b) << 16 | u32::from(a) << 5 | u32::from(rd));
    }

    fn fp2(&mut self, i: RegInstr, base: u32) {
        let a = self.fp_read(i.rs1);
        let rd = self.fp_write(i.rd, &[a]);
        self.put(base | u32::from(a) << 5 | u32::from(rd));
    }

    fn fcmp_set(&mut self, i: RegInstr, is64: bool, cond: u8) {
        let a = self.fp_read(i.rs1);
        let b = self.fp_read(i.rs2());
        let base = if is64 { 0x1E60_2000 } else { 0x1E20_2000 };
        self.put(base | u32::from(b) << 16 | u32::from(a) << 5);
        self.flush_fp_all();
        let rd = self.dst(i.rd);
        self.cset(rd, cond);
        self.commit(i.rd);
    }

    fn divide(&mut self, i: RegInstr, is64: bool, signed: bool, rem: bool) {
        let a = self.read(i.rs1, S0);
        let b = self.read(i.rs2(), S1);
        self.trap_cbz(is64, b, TrapReason::IntegerDivideByZero);
        if signed && !rem {
            // INT_MIN / -1 overflows.
            let cmn = if is64 { 0xB100_041F } else { 0x3100_041F };
            self.put(cmn | u32::from(b) << 5); // cmn b, #1
            let bne_at = self.here();
            self.put(0x5400_0000 | u32::from(NE));
            // x7 is free between calls; a may live in S0.
            if is64 {
                self.mov_imm64(7, i64::MIN as u64);
            } else {
                self.mov_imm64(7, u64::from(i32::MIN as u32));
            }
            self.cmp_rr(is64, a, 7);
            self.trap_cond(EQ, TrapReason::IntegerOverflow);
            let delta = ((self.here() - bne_at) / 4) as u32;
            self.patch32(bne_at, 0x5400_0000 | (delta & 0x7FFFF) << 5 | u32::from(NE));
            let div = if is64 { 0x9AC0_0C00 } else { 0x1AC0_0C00 };
            let rd = self.dst(i.rd);
            self.put(div | u32::from(b) << 16 | u32::from(a) << 5 | u32::from(rd));
            self.commit(i.rd);
            return;
        }
        let div = match (is64, signed) {
            (true, true) => 0x9AC0_0C00,
            (true, false) => 0x9AC0_0800,
            (false, true) => 0x1AC0_0C00,
            (false, false) => 0x1AC0_0800,
        };
        if rem {
            // q = a div b (into the free x7); rd = a - q * b via msub.
            self.put(div | u32::from(b) << 16 | u32::from(a) << 5 | 7);
            let msub = if is64 { 0x9B00_8000 } else { 0x1B00_8000 };
            let rd = self.dst(i.rd);
            self.put(
                msub | u32::from(b) << 16 | u32::from(a) << 10 | 7 << 5 | u32::from(rd),
            );
            self.commit(i.rd);
        } else {
            let rd = self.dst(i.rd);
            self.put(div | u32::from(b) << 16 | u32::from(a) << 5 | u32::from(rd));
            self.commit(i.rd);
        }
    }

    fn popcnt(&mut self, i: RegInstr) {
        let a = self.read(i.rs1, S0);
        self.put(0x9E67_0000 | u32::from(a) << 5); // fmov d0, x
        self.put(0x0E20_5800); // cnt v0.8b, v0.8b
        self.put(0x0E31_B800); // addv b0, v0.8b
        let rd = self.dst(i.rd);
        self.put(0x1E26_0000 | u32::from(rd)); // fmov w, s0
        self.commit(i.rd);
    }

    #[allow(clippy::too_many_lines)]
    fn alu(&mut self, i: RegInstr) -> Result<(), &'static str> {
        use RegOp as R;
        match i.op {
            // i32 three-register.
            R::I32Add => self.rrr(i, |d, n, m| 0x0B00_0000 | m << 16 | n << 5 | d),
            R::I32Sub => self.rrr(i, |d, n, m| 0x4B00_0000 | m << 16 | n << 5 | d),
            R::I32Mul => self.rrr(i, |d, n, m| 0x1B00_7C00 | m << 16 | n << 5 | d),
            R::I32And => self.rrr(i, |d, n, m| 0x0A00_0000 | m << 16 | n << 5 | d),
            R::I32Or => self.rrr(i, |d, n, m| 0x2A00_0000 | m << 16 | n << 5 | d),
            R::I32Xor => self.rrr(i, |d, n, m| 0x4A00_0000 | m << 16 | n << 5 | d),
            R::I32Shl => self.rrr(i, |d, n, m| 0x1AC0_2000 | m << 16 | n << 5 | d),
            R::I32ShrU => self.rrr(i, |d, n, m| 0x1AC0_2400 | m << 16 | n << 5 | d),
            R::I32ShrS => self.rrr(i, |d, n, m| 0x1AC0_2800 | m << 16 | n << 5 | d),
            R::I32Rotr => self.rrr(i, |d, n, m| 0x1AC0_2C00 | m << 16 | n << 5 | d),
            R::I32Rotl => {
                // rotl(a, b) = rotr(a, -b)
                let b = self.read(i.rs2(), S1);
                self.put(0x4B00_03E0 | u32::from(b) << 16 | u32::from(S1)); // neg w17, wb
                let a = self.read(i.rs1, S0);
                let rd = self.dst(i.rd);
                self.put(
                    0x1AC0_2C00 | u32::from(S1) << 16 | u32::from(a) << 5 | u32::from(rd),
                );
                self.commit(i.rd);
            }
            R::I32DivS => self.divide(i, false, true, false),
            R::I32DivU => self.divide(i, false, false, false),
            R::I32RemS => self.divide(i, false, true, true),
            R::I32RemU => self.divide(i, false, false, true),

            R::I32Eq => self.cmp_set(i, false, EQ),
            R::I32Ne => self.cmp_set(i, false, NE),
            R::I32LtS => self.cmp_set(i, false, LT),
            R::I32LtU => self.cmp_set(i, false, LO),
            R::I32GtS => self.cmp_set(i, false, GT),
            R::I32GtU => self.cmp_set(i, false, HI),
            R::I32LeS => self.cmp_set(i, false, LE),
            R::I32LeU => self.cmp_set(i, false, LS),
            R::I32GeS => self.cmp_set(i, false, GE),
            R::I32GeU => self.cmp_set(i, false, HS),
            R::I32Eqz => {
                let a = self.read(i.rs1, S0);
                self.put(0x7100_001F | u32::from(a) << 5);
                let rd = self.dst(i.rd);
                self.cset(rd, EQ);
                self.commit(i.rd);
            }
            R::I32Clz => self.rr2(i, |d, n| 0x5AC0_1000 | n << 5 | d),
            R::I32Ctz => {
                let a = self.read(i.rs1, S0);
                self.put(0x5AC0_0000 | u32::from(a) << 5 | u32::from(S1)); // rbit
                let rd = self.dst(i.rd);
                self.put(0x5AC0_1000 | u32::from(S1) << 5 | u32::from(rd)); // clz
                self.commit(i.rd);
            }
            R::I32Popcnt | R::I64Popcnt => self.popcnt(i),

            // i32 immediate forms.
            R::I32AddImm => {
                if i.operand < 4096 {
                    let a = self.read(i.rs1, S0);
                    let rd = self.dst(i.rd);
                    self.put(0x1100_0000 | i.operand << 10 | u32::from(a) << 5 | u32::from(rd));
                    self.commit(i.rd);
                } else {
                    self.alu_imm(i, 0x0B00_0000);
                }
            }
            R::I32SubImm => {
                if i.operand < 4096 {
                    let a = self.read(i.rs1, S0);
                    let rd = self.dst(i.rd);
                    self.put(0x5100_0000 | i.operand << 10 | u32::from(a) << 5 | u32::from(rd));
                    self.commit(i.rd);
                } else {
                    self.alu_imm(i, 0x4B00_0000);
                }
            }
            R::I32MulImm => self.alu_imm(i, 0x1B00_7C00),
            R::I32AndImm => self.alu_imm(i, 0x0A00_0000),
            R::I32OrImm => self.alu_imm(i, 0x2A00_0000),
            R::I32XorImm => self.alu_imm(i, 0x4A00_0000),
            R::I32ShlImm => {
                // Constant shifts use ubfm directly.
                let shift = i.operand & 31;
                let a = self.read(i.rs1, S0);
                let rd = self.dst(i.rd);
                let immr = (32 - shift) & 31;
                let imms = 31 - shift;
                self.put(
                    0x5300_0000 | immr << 16 | imms << 10 | u32::from(a) << 5 | u32::from(rd),
                );
                self.commit(i.rd);
            }
            R::I32EqImm => self.cmp_imm_set(i, EQ),
            R::I32NeImm => self.cmp_imm_set(i, NE),
            R::I32LtSImm => self.cmp_imm_set(i, LT),
            R::I32LtUImm => self.cmp_imm_set(i, LO),
            R::I32GtSImm => self.cmp_imm_set(i, GT),
            R::I32LeSImm => self.cmp_imm_set(i, LE),
            R::I32GeSImm => self.cmp_imm_set(i, GE),
            R::I32GeUImm => self.cmp_imm_set(i, HS),

            // i64 three-register.
            R::I64Add => self.rrr(i, |d, n, m| 0x8B00_0000 | m << 16 | n << 5 | d),
            R::I64Sub => self.rrr(i, |d, n, m| 0xCB00_0000 | m << 16 | n << 5 | d),
            R::I64Mul => self.rrr(i, |d, n, m| 0x9B00_7C00 | m << 16 | n << 5 | d),
            R::I64And => self.rrr(i, |d, n, m| 0x8A00_0000 | m << 16 | n << 5 | d),
            R::I64Or => self.rrr(i, |d, n, m| 0xAA00_0000 | m << 16 | n << 5 | d),
            R::I64Xor => self.rrr(i, |d, n, m| 0xCA00_0000 | m << 16 | n << 5 | d),
            R::I64Shl => self.rrr(i, |d, n, m| 0x9AC0_2000 | m << 16 | n << 5 | d),
            R::I64ShrU => self.rrr(i, |d, n, m| 0x9AC0_2400 | m << 16 | n << 5 | d),
            R::I64ShrS => self.rrr(i, |d, n, m| 0x9AC0_2800 | m << 16 | n << 5 | d),
            R::I64Rotr => self.rrr(i, |d, n, m| 0x9AC0_2C00 | m << 16 | n << 5 | d),
            R::I64Rotl => {
                let b = self.read(i.rs2(), S1);
                self.put(0xCB00_03E0 | u32::from(b) << 16 | u32::from(S1)); // neg x17
                let a = self.read(i.rs1, S0);
                let rd = self.dst(i.rd);
                self.put(
                    0x9AC0_2C00 | u32::from(S1) << 16 | u32::from(a) << 5 | u32::from(rd),
                );
                self.commit(i.rd);
            }
            R::I64DivS => self.divide(i, true, true, false),
            R::I64DivU => self.divide(i, true, false, false),
            R::I64RemS => self.divide(i, true, true, true),
            R::I64RemU => self.divide(i, true, false, true),

            R::I64Eq => self.cmp_set(i, true, EQ),
            R::I64Ne => self.cmp_set(i, true, NE),
            R::I64LtS => self.cmp_set(i, true, LT),
            R::I64LtU => self.cmp_set(i, true, LO),
            R::I64GtS => self.cmp_set(i, true, GT),
            R::I64GtU => self.cmp_set(i, true, HI),
            R::I64LeS => self.cmp_set(i, true, LE),
            R::I64LeU => self.cmp_set(i, true, LS),
            R::I64GeS => self.cmp_set(i, true, GE),
            R::I64GeU => self.cmp_set(i, true, HS),
            R::I64Eqz => {
                let a = self.read(i.rs1, S0);
                self.put(0xF100_001F | u32::from(a) << 5);
                let rd = self.dst(i.rd);
                self.cset(rd, EQ);
                self.commit(i.rd);
            }
            R::I64Clz => self.rr2(i, |d, n| 0xDAC0_1000 | n << 5 | d),
            R::I64Ctz => {
                let a = self.read(i.rs1, S0);
                self.put(0xDAC0_0000 | u32::from(a) << 5 | u32::from(S1));
                let rd = self.dst(i.rd);
                self.put(0xDAC0_1000 | u32::from(S1) << 5 | u32::from(rd));
                self.commit(i.rd);
            }

            // Extensions and wraps.
            R::I32Extend8S => self.rr2(i, |d, n| 0x1300_1C00 | n << 5 | d),
            R::I32Extend16S => self.rr2(i, |d, n| 0x1300_3C00 | n << 5 | d),
            R::I64Extend8S => self.rr2(i, |d, n| 0x9340_1C00 | n << 5 | d),
            R::I64Extend16S => self.rr2(i, |d, n| 0x9340_3C00 | n << 5 | d),
            R::I64Extend32S | R::I64ExtendI32S => {
                self.rr2(i, |d, n| 0x9340_7C00 | n << 5 | d)
            }
            R::I64ExtendI32U | R::I32WrapI64 => {
                // mov wd, wn zero-extends.
                self.rr2(i, |d, n| 0x2A00_03E0 | n << 16 | d)
            }

            // f32 / f64 arithmetic (through the FP cache).
            R::F32Add => self.fp3(i, 0x1E20_2800),
            R::F32Sub => self.fp3(i, 0x1E20_3800),
            R::F32Mul => self.fp3(i, 0x1E20_0800),
            R::F32Div => self.fp3(i, 0x1E20_1800),
            R::F32Min => self.fp3(i, 0x1E20_5800),
            R::F32Max => self.fp3(i, 0x1E20_4800),
            R::F64Add => self.fp3(i, 0x1E60_2800),
            R::F64Sub => self.fp3(i, 0x1E60_3800),
            R::F64Mul => self.fp3(i, 0x1E60_0800),
            R::F64Div => self.fp3(i, 0x1E60_1800),
            R::F64Min => self.fp3(i, 0x1E60_5800),
            R::F64Max => self.fp3(i, 0x1E60_4800),
            R::F32Abs => self.fp2(i, 0x1E20_C000),
            R::F32Neg => self.fp2(i, 0x1E21_4000),
            R::F32Sqrt => self.fp2(i, 0x1E21_C000),
            R::F32Ceil => self.fp2(i, 0x1E24_C000),
            R::F32Floor => self.fp2(i, 0x1E25_4000),
            R::F32Trunc => self.fp2(i, 0x1E25_C000),
            R::F32Nearest => self.fp2(i, 0x1E24_4000),
            R::F64Abs => self.fp2(i, 0x1E60_C000),
            R::F64Neg => self.fp2(i, 0x1E61_4000),
            R::F64Sqrt => self.fp2(i, 0x1E61_C000),
            R::F64Ceil => self.fp2(i, 0x1E64_C000),
            R::F64Floor => self.fp2(i, 0x1E65_4000),
            R::F64Trunc => self.fp2(i, 0x1E65_C000),
            R::F64Nearest => self.fp2(i, 0x1E64_4000),

            R::F32Eq => self.fcmp_set(i, false, EQ),
            R::F32Ne => self.fcmp_set(i, false, NE),
            R::F32Lt => self.fcmp_set(i, false, MI),
            R::F32Gt => self.fcmp_set(i, false, GT),
            R::F32Le => self.fcmp_set(i, false, LS),
            R::F32Ge => self.fcmp_set(i, false, GE),
            R::F64Eq => self.fcmp_set(i, true, EQ),
            R::F64Ne => self.fcmp_set(i, true, NE),
            R::F64Lt => self.fcmp_set(i, true, MI),
            R::F64Gt => self.fcmp_set(i, true, GT),
            R::F64Le => self.fcmp_set(i, true, LS),
            R::F64Ge => self.fcmp_set(i, true, GE),

            // Copysign works on the bit patterns in the integer file.
            R::F32Copysign => {
                let b = self.read(i.rs2(), S1);
                // lsr w17, wb, #31
                self.put(0x5300_7C00 | 31 << 16 | u32::from(b) << 5 | u32::from(S1));
                let a = self.read(i.rs1, S0);
                let rd = self.dst(i.rd);
                self.put(0x2A00_03E0 | u32::from(a) << 16 | u32::from(rd)); // mov w
                // bfi wd, w17, #31, #1
                self.put(0x3300_0400 | 1 << 16 | u32::from(S1) << 5 | u32::from(rd));
                self.commit(i.rd);
            }
            R::F64Copysign => {
                let b = self.read(i.rs2(), S1);
                // lsr x17, xb, #63
                self.put(0xD340_FC00 | u32::from(b) << 5 | u32::from(S1));
                let a = self.read(i.rs1, S0);
                let rd = self.dst(i.rd);
                self.mov_rr(rd, a);
                // bfi xd, x17, #63, #1
                self.put(0xB340_0400 | 1 << 16 | u32::from(S1) << 5 | u32::from(rd));
                self.commit(i.rd);
            }

            // Non-trapping conversions.
            R::F32ConvertI32S => self.int_to_fp(i, 0x1E22_0000),
            R::F32ConvertI32U => self.int_to_fp(i, 0x1E23_0000),
            R::F32ConvertI64S => self.int_to_fp(i, 0x9E22_0000),
            R::F32ConvertI64U => self.int_to_fp(i, 0x9E23_0000),
            R::F64ConvertI32S => self.int_to_fp(i, 0x1E62_0000),
            R::F64ConvertI32U => self.int_to_fp(i, 0x1E63_0000),
            R::F64ConvertI64S => self.int_to_fp(i, 0x9E62_0000),
            R::F64ConvertI64U => self.int_to_fp(i, 0x9E63_0000),
            R::F32DemoteF64 => {
                let a = self.fp_read(i.rs1);
                let rd = self.fp_write(i.rd, &[a]);
                self.put(0x1E62_4000 | u32::from(a) << 5 | u32::from(rd));
            }
            R::F64PromoteF32 => {
                let a = self.fp_read(i.rs1);
                let rd = self.fp_write(i.rd, &[a]);
                self.put(0x1E22_C000 | u32::from(a) << 5 | u32::from(rd));
            }
            // fcvtzs/fcvtzu saturate on AArch64, exactly the sat semantics.
            R::I32TruncSatF32S => self.fp_to_int(i, 0x1E38_0000),
            R::I32TruncSatF32U => self.fp_to_int(i, 0x1E39_0000),
            R::I32TruncSatF64S => self.fp_to_int(i, 0x1E78_0000),
            R::I32TruncSatF64U => self.fp_to_int(i, 0x1E79_0000),
            R::I64TruncSatF32S => self.fp_to_int(i, 0x9E38_0000),
            R::I64TruncSatF32U => self.fp_to_int(i, 0x9E39_0000),
            R::I64TruncSatF64S => self.fp_to_int(i, 0x9E78_0000),
            R::I64TruncSatF64U => self.fp_to_int(i, 0x9E79_0000),

            // Reinterprets are identities over the integer register file.
            R::I32ReinterpretF32 | R::F32ReinterpretI32 => {
                self.rr2(i, |d, n| 0x2A00_03E0 | n << 16 | d)
            }
            R::I64ReinterpretF64 | R::F64ReinterpretI64 => {
                let a = self.read(i.rs1, S0);
                self.write_from(i.rd, a);
            }

            // Trapping float-to-int needs range checks the emitter does not
            // carry; the register tier owns these.
            R::I32TruncF32S | R::I32TruncF32U | R::I32TruncF64S | R::I32TruncF64U
            | R::I64TruncF32S | R::I64TruncF32U | R::I64TruncF64S | R::I64TruncF64U => {
                return Err("trapping float truncation")
            }

            _ => return Err("unsupported opcode"),
        }
        Ok(())
    }

    fn int_to_fp(&mut self, i: RegInstr, base: u32) {
        let a = self.read(i.rs1, S0);
        let rd = self.fp_write(i.rd, &[]);
        self.put(base | u32::from(a) << 5 | u32::from(rd));
    }

    fn fp_to_int(&mut self, i: RegInstr, base: u32) {
        let a = self.fp_read(i.rs1);
        self.flush_fp_all();
        let rd = self.dst(i.rd);
        self.put(base | u32::from(a) << 5 | u32::from(rd));
        self.commit(i.rd);
    }
}

fn is_fp_op(op: RegOp) -> bool {
    use RegOp as R;
    matches!(
        op,
        R::F32Add
            | R::F32Sub
            | R::F32Mul
            | R::F32Div
            | R::F32Min
            | R::F32Max
            | R::F32Abs
            | R::F32Neg
            | R::F32Ceil
            | R::F32Floor
            | R::F32Trunc
            | R::F32Nearest
            | R::F32Sqrt
            | R::F64Add
            | R::F64Sub
            | R::F64Mul
            | R::F64Div
            | R::F64Min
            | R::F64Max
            | R::F64Abs
            | R::F64Neg
            | R::F64Ceil
            | R::F64Floor
            | R::F64Trunc
            | R::F64Nearest
            | R::F64Sqrt
            | R::F32DemoteF64
            | R::F64PromoteF32
    )
}
