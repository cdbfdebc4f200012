//! Signal-driven trap recovery for JIT code.
//!
//! Guard-page faults raised by compiled loads and stores arrive as SIGSEGV
//! (SIGBUS on macOS). The handler inspects the thread-local [`RecoveryInfo`]
//! and the faulting PC; when both say the fault came from JIT code, it
//! rewrites the saved PC to the function's out-of-line OOB exit and the
//! return register to the trap code, so returning from the handler leaves
//! the native frame through its normal error epilogue. Faults from anywhere
//! else are re-raised with the default disposition.
//!
//! The handler is async-signal-safe: it reads one const-initialized
//! thread-local, rewrites two saved registers, and returns. No allocation,
//! no locks.

use std::cell::Cell;
use std::sync::Once;

use reef_asm::TrapReason;

/// Per-thread recovery window, valid while `active` is nonzero.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RecoveryInfo {
    /// Nonzero while JIT code is on this thread's stack.
    pub active: u32,
    /// Absolute address of the current function's OOB exit stub.
    pub oob_exit_pc: usize,
    /// First byte of the current function's code.
    pub code_start: usize,
    /// One past the last byte.
    pub code_end: usize,
}

const INACTIVE: RecoveryInfo = RecoveryInfo {
    active: 0,
    oob_exit_pc: 0,
    code_start: 0,
    code_end: 0,
};

thread_local! {
    static RECOVERY: Cell<RecoveryInfo> = const { Cell::new(INACTIVE) };
}

/// Arm recovery for a JIT activation.
pub(super) fn enter(info: RecoveryInfo) {
    RECOVERY.with(|cell| cell.set(info));
}

/// Disarm after the activation returns.
pub(super) fn leave() {
    RECOVERY.with(|cell| cell.set(INACTIVE));
}

/// Install the process-wide fault handler once.
pub(super) fn install_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: standard sigaction installation; the handler itself is
        // async-signal-safe as documented above.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
        }
    });
}

extern "C" fn handler(
    signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let recovery = RECOVERY.with(|cell| cell.get());
    let pc = fault_pc(context);
    if recovery.active != 0 && pc >= recovery.code_start && pc < recovery.code_end {
        redirect(
            context,
            recovery.oob_exit_pc,
            u64::from(TrapReason::OutOfBoundsMemoryAccess.code()),
        );
        return;
    }
    // Not ours: restore the default disposition and re-raise.
    // SAFETY: signal-safe calls only.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signal, &action, std::ptr::null_mut());
        libc::raise(signal);
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn fault_pc(context: *mut libc::c_void) -> usize {
    // SAFETY: the kernel hands the handler a valid ucontext.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn redirect(context: *mut libc::c_void, pc: usize, status: u64) {
    // SAFETY: as above; RIP and RAX are rewritten in the saved frame.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
        (*uc).uc_mcontext.gregs[libc::REG_RAX as usize] = status as i64;
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn fault_pc(context: *mut libc::c_void) -> usize {
    // SAFETY: the kernel hands the handler a valid ucontext.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        (*uc).uc_mcontext.pc as usize
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn redirect(context: *mut libc::c_void, pc: usize, status: u64) {
    // SAFETY: as above; PC and x0 are rewritten in the saved frame.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        (*uc).uc_mcontext.pc = pc as u64;
        (*uc).uc_mcontext.regs[0] = status;
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn fault_pc(context: *mut libc::c_void) -> usize {
    // SAFETY: the kernel hands the handler a valid ucontext.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        let ss = &(*(*uc).uc_mcontext).__ss;
        ss.__pc as usize
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn redirect(context: *mut libc::c_void, pc: usize, status: u64) {
    // SAFETY: as above; PC and x0 are rewritten in the saved frame.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        let ss = &mut (*(*uc).uc_mcontext).__ss;
        ss.__pc = pc as u64;
        ss.__x[0] = status;
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
fn fault_pc(context: *mut libc::c_void) -> usize {
    // SAFETY: the kernel hands the handler a valid ucontext.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        (*(*uc).uc_mcontext).__ss.__rip as usize
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
fn redirect(context: *mut libc::c_void, pc: usize, status: u64) {
    // SAFETY: as above; RIP and RAX are rewritten in the saved frame.
    unsafe {
        let uc = context.cast::<libc::ucontext_t>();
        let ss = &mut (*(*uc).uc_mcontext).__ss;
        ss.__rip = pc as u64;
        ss.__rax = status;
    }
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
fn fault_pc(_context: *mut libc::c_void) -> usize {
    0
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
fn redirect(_context: *mut libc::c_void, _pc: usize, _status: u64) {}
