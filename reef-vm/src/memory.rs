//! Guard-paged linear memory.
//!
//! Each memory instance reserves a fixed virtual region with `PROT_NONE`
//! and makes only its accessible prefix readable/writable. For 32-bit
//! memories the reservation covers the whole 4 GiB index space plus the
//! largest static offset, so JIT code needs no bounds checks: an
//! out-of-bounds access lands in the guard and faults, and the signal
//! recovery path turns the fault into a trap. The interpreters always check
//! explicitly (their faults would not be recoverable), as does every access
//! to a 64-bit memory.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicU32, AtomicU64, AtomicUsize, Ordering,
};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use reef_asm::TrapReason;
use reef_types::AddrWidth;

use crate::consts::{MEMORY_RESERVATION, WASM_PAGE_SIZE};
use crate::error::VmError;
use crate::module::MemoryType;

/// A linear memory instance.
///
/// Shared memories hand clones of one `Arc<LinearMemory>` to several
/// instances; plain loads and stores then race by design (the Wasm memory
/// model gives them no ordering), while atomic accesses go through real
/// hardware atomics below.
#[derive(Debug)]
pub struct LinearMemory {
    base: NonNull<u8>,
    reserved: usize,
    accessible: AtomicUsize,
    ty: MemoryType,
    /// Byte ceiling beyond which `memory.grow` reports failure.
    ceiling: u64,
    grow_lock: Mutex<()>,
}

// SAFETY: the raw base pointer refers to a process-lifetime mapping owned by
// this value; concurrent access is either exclusive (unshared memories are
// reached through one VM) or explicitly racy per the Wasm threads memory
// model (shared memories), with atomics implemented via hardware atomics.
unsafe impl Send for LinearMemory {}
// SAFETY: see above.
unsafe impl Sync for LinearMemory {}

impl LinearMemory {
    /// Map a new memory of the given type.
    ///
    /// `cap` further restricts growth below the type's declared maximum.
    pub fn new(ty: MemoryType, cap: Option<u64>) -> Result<Self, VmError> {
        let page_size = ty.page_size();
        // Either width caps its backing at the full 32-bit index space; a
        // 64-bit memory larger than that must shrink its declared maximum.
        let declared = ty
            .limits
            .max
            .map(|pages| pages.saturating_mul(page_size))
            .unwrap_or(1 << 32);
        let mut ceiling = declared.min(1 << 32);
        if let Some(cap) = cap {
            ceiling = ceiling.min(cap);
        }

        let reserved = match ty.width {
            // Full index space + largest static offset + guard granule.
            AddrWidth::A32 => MEMORY_RESERVATION,
            // 64-bit memories are explicitly checked; reserve only the
            // ceiling plus one guard page granule.
            AddrWidth::A64 => (ceiling as usize).saturating_add(WASM_PAGE_SIZE as usize),
        };

        // SAFETY: anonymous private reservation; failure is reported, the
        // pointer is checked before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(VmError::OutOfMemory);
        }
        let base = NonNull::new(base.cast::<u8>()).ok_or(VmError::OutOfMemory)?;

        let memory = Self {
            base,
            reserved,
            accessible: AtomicUsize::new(0),
            ty,
            ceiling,
            grow_lock: Mutex::new(()),
        };

        let initial = ty.limits.min.saturating_mul(page_size);
        if initial > ceiling {
            return Err(VmError::OutOfMemory);
        }
        if initial > 0 && !memory.protect_rw(initial as usize) {
            return Err(VmError::OutOfMemory);
        }
        memory.accessible.store(initial as usize, Ordering::Release);
        Ok(memory)
    }

    fn protect_rw(&self, len: usize) -> bool {
        if len > self.reserved {
            return false;
        }
        // SAFETY: the range lies inside this memory's own reservation.
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        rc == 0
    }

    /// The memory's declared type.
    pub const fn ty(&self) -> &MemoryType {
        &self.ty
    }

    /// Accessible prefix, in bytes.
    pub fn byte_len(&self) -> usize {
        self.accessible.load(Ordering::Acquire)
    }

    /// Current size in pages.
    pub fn pages(&self) -> u64 {
        self.byte_len() as u64 / self.ty.page_size()
    }

    /// Base of the mapping, for JIT code and raw views.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Grow by `delta` pages. Returns the old page count, or -1 on refusal.
    pub fn grow(&self, delta: u64) -> i64 {
        let _guard = self.grow_lock.lock().unwrap_or_else(|e| e.into_inner());
        let page_size = self.ty.page_size();
        let old_bytes = self.byte_len() as u64;
        let old_pages = old_bytes / page_size;
        if delta == 0 {
            return old_pages as i64;
        }
        let new_pages = match old_pages.checked_add(delta) {
            Some(p) => p,
            None => return -1,
        };
        if let Some(max) = self.ty.limits.max {
            if new_pages > max {
                return -1;
            }
        }
        let new_bytes = match new_pages.checked_mul(page_size) {
            Some(b) if b <= self.ceiling => b,
            _ => return -1,
        };
        if new_bytes as usize > self.reserved.saturating_sub(WASM_PAGE_SIZE as usize) {
            return -1;
        }
        if !self.protect_rw(new_bytes as usize) {
            return -1;
        }
        self.accessible.store(new_bytes as usize, Ordering::Release);
        old_pages as i64
    }

    /// Bounds-check an access; returns the base offset on success.
    #[inline]
    pub fn check(&self, addr: u64, len: u64) -> Result<usize, TrapReason> {
        let end = addr.checked_add(len).ok_or(TrapReason::OutOfBoundsMemoryAccess)?;
        if end > self.byte_len() as u64 {
            return Err(TrapReason::OutOfBoundsMemoryAccess);
        }
        Ok(addr as usize)
    }

    /// Read `N` little-endian bytes.
    #[inline]
    pub fn load<const N: usize>(&self, addr: u64) -> Result<[u8; N], TrapReason> {
        let offset = self.check(addr, N as u64)?;
        let mut out = [0u8; N];
        // SAFETY: bounds-checked above against the accessible prefix.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                out.as_mut_ptr(),
                N,
            );
        }
        Ok(out)
    }

    /// Write `N` little-endian bytes.
    #[inline]
    pub fn store<const N: usize>(&self, addr: u64, bytes: [u8; N]) -> Result<(), TrapReason> {
        let offset = self.check(addr, N as u64)?;
        // SAFETY: bounds-checked above against the accessible prefix.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                N,
            );
        }
        Ok(())
    }

    /// Copy out an arbitrary span.
    pub fn read_into(&self, addr: u64, out: &mut [u8]) -> Result<(), TrapReason> {
        let offset = self.check(addr, out.len() as u64)?;
        // SAFETY: bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Copy in an arbitrary span.
    pub fn write_from(&self, addr: u64, data: &[u8]) -> Result<(), TrapReason> {
        let offset = self.check(addr, data.len() as u64)?;
        // SAFETY: bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// `memory.fill`.
    pub fn fill(&self, addr: u64, value: u8, len: u64) -> Result<(), TrapReason> {
        let offset = self.check(addr, len)?;
        // SAFETY: bounds-checked above.
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr().add(offset), value, len as usize);
        }
        Ok(())
    }

    /// `memory.copy`, including overlapping and cross-memory forms.
    pub fn copy_within(
        &self,
        dst: u64,
        src: &LinearMemory,
        src_addr: u64,
        len: u64,
    ) -> Result<(), TrapReason> {
        let dst_off = self.check(dst, len)?;
        let src_off = src.check(src_addr, len)?;
        // SAFETY: both ranges bounds-checked; copy handles overlap.
        unsafe {
            std::ptr::copy(
                src.base.as_ptr().add(src_off),
                self.base.as_ptr().add(dst_off),
                len as usize,
            );
        }
        Ok(())
    }

    fn atomic_offset(&self, addr: u64, size: u64) -> Result<usize, TrapReason> {
        if addr % size != 0 {
            return Err(TrapReason::UnalignedAtomicAccess);
        }
        self.check(addr, size)
    }

    /// A 32-bit atomic view of the cell at `addr`.
    pub fn atomic_u32(&self, addr: u64) -> Result<&AtomicU32, TrapReason> {
        let offset = self.atomic_offset(addr, 4)?;
        // SAFETY: in-bounds, aligned, and the mapping outlives the borrow.
        Ok(unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU32>() })
    }

    /// A 64-bit atomic view of the cell at `addr`.
    pub fn atomic_u64(&self, addr: u64) -> Result<&AtomicU64, TrapReason> {
        let offset = self.atomic_offset(addr, 8)?;
        // SAFETY: in-bounds, aligned, and the mapping outlives the borrow.
        Ok(unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU64>() })
    }

    /// `memory.atomic.wait32`/`wait64`. `timeout_ns < 0` waits forever.
    ///
    /// Returns 0 (woken), 1 (value mismatch), or 2 (timed out).
    pub fn wait(
        &self,
        addr: u64,
        expected: WaitExpect,
        timeout_ns: i64,
    ) -> Result<u32, TrapReason> {
        if !self.ty.shared {
            return Err(TrapReason::ExpectedSharedMemory);
        }
        let matches = match expected {
            WaitExpect::U32(v) => self.atomic_u32(addr)?.load(Ordering::SeqCst) == v,
            WaitExpect::U64(v) => self.atomic_u64(addr)?.load(Ordering::SeqCst) == v,
        };
        if !matches {
            return Ok(1);
        }
        let key = self.base.as_ptr() as usize + addr as usize;
        Ok(waiter_hub().wait(key, timeout_ns))
    }

    /// `memory.atomic.notify`. Returns the number of waiters woken.
    pub fn notify(&self, addr: u64, count: u32) -> Result<u32, TrapReason> {
        // Bounds and alignment still apply even when nothing can be waiting.
        let _ = self.atomic_u32(addr)?;
        if !self.ty.shared {
            return Ok(0);
        }
        let key = self.base.as_ptr() as usize + addr as usize;
        Ok(waiter_hub().notify(key, count))
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        // SAFETY: unmapping our own reservation exactly once.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.reserved);
        }
    }
}

/// Expected value of an atomic wait.
#[derive(Debug, Clone, Copy)]
pub enum WaitExpect {
    /// 32-bit compare.
    U32(u32),
    /// 64-bit compare.
    U64(u64),
}

/// Host park/unpark primitive behind `memory.atomic.wait`/`notify`.
struct WaiterHub {
    queues: Mutex<HashMap<usize, Arc<WaitQueue>>>,
}

struct WaitQueue {
    state: Mutex<u64>,
    cv: Condvar,
    waiters: AtomicUsize,
}

fn waiter_hub() -> &'static WaiterHub {
    static HUB: OnceLock<WaiterHub> = OnceLock::new();
    HUB.get_or_init(|| WaiterHub { queues: Mutex::new(HashMap::new()) })
}

impl WaiterHub {
    fn queue(&self, key: usize) -> Arc<WaitQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(queues.entry(key).or_insert_with(|| {
            Arc::new(WaitQueue {
                state: Mutex::new(0),
                cv: Condvar::new(),
                waiters: AtomicUsize::new(0),
            })
        }))
    }

    fn wait(&self, key: usize, timeout_ns: i64) -> u32 {
        let queue = self.queue(key);
        queue.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = queue.state.lock().unwrap_or_else(|e| e.into_inner());
        let start_gen = *guard;
        let code = if timeout_ns < 0 {
            let mut guard = guard;
            while *guard == start_gen {
                guard = queue.cv.wait(guard).unwrap_or_else(|e| e.into_inner());
            }
            0
        } else {
            let deadline = Duration::from_nanos(timeout_ns as u64);
            let (guard, result) = queue
                .cv
                .wait_timeout_while(guard, deadline, |gen| *gen == start_gen)
                .unwrap_or_else(|e| e.into_inner());
            drop(guard);
            if result.timed_out() {
                2
            } else {
                0
            }
        };
        queue.waiters.fetch_sub(1, Ordering::SeqCst);
        code
    }

    fn notify(&self, key: usize, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get(&key) else { return 0 };
        let parked = queue.waiters.load(Ordering::SeqCst) as u32;
        let woken = parked.min(count);
        if woken == 0 {
            return 0;
        }
        let mut gen = queue.state.lock().unwrap_or_else(|e| e.into_inner());
        *gen += 1;
        // Condvar has no counted wake; waking everything parked on this
        // address over-delivers but stays within the spec's allowance of
        // spurious wakeups on the waiter side.
        queue.cv.notify_all();
        drop(gen);
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_types::Limits;

    fn mem32(min: u64, max: Option<u64>) -> LinearMemory {
        LinearMemory::new(
            MemoryType {
                limits: Limits { min, max },
                ..MemoryType::default()
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn grow_and_bounds() {
        let m = mem32(1, Some(4));
        assert_eq!(m.pages(), 1);
        assert!(m.store::<4>(0xFFFC, [1, 2, 3, 4]).is_ok());
        assert_eq!(
            m.store::<4>(0xFFFD, [0; 4]),
            Err(TrapReason::OutOfBoundsMemoryAccess)
        );
        assert_eq!(m.grow(2), 1);
        assert!(m.store::<4>(0x2FFFC, [0; 4]).is_ok());
        assert_eq!(m.grow(2), -1);
        assert_eq!(m.grow(1), 3);
    }

    #[test]
    fn ceiling_blocks_growth() {
        let m = LinearMemory::new(
            MemoryType { limits: Limits { min: 1, max: None }, ..MemoryType::default() },
            Some(2 * WASM_PAGE_SIZE),
        )
        .unwrap();
        assert_eq!(m.grow(1), 1);
        assert_eq!(m.grow(1), -1);
    }

    #[test]
    fn data_round_trips() {
        let m = mem32(1, None);
        m.write_from(100, b"reef").unwrap();
        let mut out = [0u8; 4];
        m.read_into(100, &mut out).unwrap();
        assert_eq!(&out, b"reef");
        assert_eq!(m.load::<2>(102).unwrap(), *b"ef");
    }

    #[test]
    fn unaligned_atomics_trap() {
        let m = mem32(1, None);
        assert!(m.atomic_u32(4).is_ok());
        assert_eq!(
            m.atomic_u32(2).err(),
            Some(TrapReason::UnalignedAtomicAccess)
        );
    }

    #[test]
    fn zero_min_memory_starts_empty() {
        let m = mem32(0, Some(1));
        assert_eq!(m.pages(), 0);
        assert_eq!(m.load::<1>(0), Err(TrapReason::OutOfBoundsMemoryAccess));
        assert_eq!(m.grow(1), 0);
        assert!(m.load::<1>(0).is_ok());
    }
}
