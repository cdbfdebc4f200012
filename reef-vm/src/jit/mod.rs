//! The function-level JIT.
//!
//! One function compiles at a time, from its register IR, into its own
//! mmap'd buffer that transitions RW -> RX before first execution (W^X:
//! never simultaneously writable and executable). Two back ends share this
//! driver; each lowers register IR 1-to-few instructions per record.
//!
//! # Native ABI
//!
//! Compiled code has the C signature
//! `fn(args: *mut u64, bridge: *mut VmBridge) -> u64`:
//!
//! - `args` holds one `u64` per virtual register; the caller fills the
//!   parameters, the function stores its result into `args[0]` on success.
//! - The return value is 0 on success, a [`TrapReason`] code on a trap, or
//!   [`STATUS_PENDING`] when a bridge callback parked a non-trap unwind
//!   (exception or exit) in the bridge.
//!
//! Everything the code cannot do inline crosses the bridge: calls to
//! other functions (the shared trampoline of the tier design — it consults
//! the callee's tiers and falls back to interpretation when no native code
//! exists), indirect calls, bulk memory, globals, and growth. Self-calls
//! bypass the bridge entirely via a second entry point.

use std::sync::Arc;

use reef_asm::TrapReason;
use reef_types::FuncAddr;

use crate::error::{ExecResult, RuntimeError};
use crate::interpreter::Vm;
use crate::state::ExecuteState;
use crate::lower::RegFunc;
use crate::store::Store;

mod buf;
mod recovery;

#[cfg(target_arch = "aarch64")]
mod a64;
#[cfg(target_arch = "x86_64")]
mod x64;

pub use buf::CodeBuf;
pub use recovery::RecoveryInfo;

/// Status value signalling "a non-trap unwind is parked in the bridge".
pub const STATUS_PENDING: u64 = 0xFF;

/// Per-function native code.
pub struct CompiledFunc {
    /// The executable mapping.
    pub buf: CodeBuf,
    /// Offset of the cold entry (loads arguments from the args buffer).
    pub entry: usize,
    /// Offset of the self-call entry (arguments pre-loaded in registers,
    /// callee-saved save/restore skipped).
    pub self_entry: usize,
    /// Offset of the out-of-line out-of-bounds exit; the signal handler
    /// steers a faulting PC here.
    pub oob_exit: usize,
    /// Register-IR PC -> native offset of its first emitted instruction.
    pub pc_map: Vec<u32>,
    /// Virtual register count (the args buffer must be this large).
    pub reg_count: usize,
    /// Parameter count.
    pub param_count: usize,
    /// Whether `args[0]` receives a result.
    pub has_result: bool,
}

// SAFETY: the mapping is immutable (RX) after construction and the metadata
// is plain data.
unsafe impl Send for CompiledFunc {}
// SAFETY: see above.
unsafe impl Sync for CompiledFunc {}

type Entry = unsafe extern "C" fn(*mut u64, *mut VmBridge) -> u64;

/// The state shared between native code and the VM for one JIT activation.
///
/// Field order and types are part of the emitted code's ABI; both back ends
/// hard-code these offsets.
#[repr(C)]
pub struct VmBridge {
    /// Type-erased `&mut Vm`.
    pub vm: *mut core::ffi::c_void,
    /// Base of the default linear memory, or null.
    pub mem_base: *mut u8,
    /// Fuel cell; `u64::MAX` disables metering.
    pub fuel: u64,
    /// Owning instance index.
    pub instance: u32,
    /// Address of the function being run (self-call identity).
    pub func_addr: u64,
    /// Call into another function by module-local index.
    pub call: unsafe extern "C" fn(*mut VmBridge, u32, *mut u64, u32, *mut u64) -> u64,
    /// Indirect call: expected type id, table index, element index.
    pub call_indirect:
        unsafe extern "C" fn(*mut VmBridge, u32, u32, u64, *mut u64, u32, *mut u64) -> u64,
    /// `memory.size` in pages.
    pub memory_size: unsafe extern "C" fn(*mut VmBridge) -> u64,
    /// `memory.grow`; returns the old page count or -1.
    pub memory_grow: unsafe extern "C" fn(*mut VmBridge, u64) -> u64,
    /// `memory.fill`; returns a status.
    pub memory_fill: unsafe extern "C" fn(*mut VmBridge, u64, u64, u64) -> u64,
    /// `memory.copy`; returns a status.
    pub memory_copy: unsafe extern "C" fn(*mut VmBridge, u64, u64, u64) -> u64,
    /// Read a global by store address.
    pub global_get: unsafe extern "C" fn(*mut VmBridge, u32) -> u64,
    /// Write a global by store address.
    pub global_set: unsafe extern "C" fn(*mut VmBridge, u32, u64),
    /// Parked non-trap unwind (exception or exit), type-erased.
    pending: Option<RuntimeError>,
}

/// Byte offsets of the bridge fields the emitters touch directly.
pub(crate) mod bridge_offsets {
    /// `mem_base`.
    pub const MEM_BASE: u32 = 8;
    /// `fuel`.
    pub const FUEL: u32 = 16;
    /// `call`.
    pub const CALL: u32 = 40;
    /// `call_indirect`.
    pub const CALL_INDIRECT: u32 = 48;
    /// `memory_size`.
    pub const MEMORY_SIZE: u32 = 56;
    /// `memory_grow`.
    pub const MEMORY_GROW: u32 = 64;
    /// `memory_fill`.
    pub const MEMORY_FILL: u32 = 72;
    /// `memory_copy`.
    pub const MEMORY_COPY: u32 = 80;
    /// `global_get`.
    pub const GLOBAL_GET: u32 = 88;
    /// `global_set`.
    pub const GLOBAL_SET: u32 = 96;
}

const _: () = {
    assert!(std::mem::offset_of!(VmBridge, mem_base) == bridge_offsets::MEM_BASE as usize);
    assert!(std::mem::offset_of!(VmBridge, fuel) == bridge_offsets::FUEL as usize);
    assert!(std::mem::offset_of!(VmBridge, call) == bridge_offsets::CALL as usize);
    assert!(
        std::mem::offset_of!(VmBridge, call_indirect)
            == bridge_offsets::CALL_INDIRECT as usize
    );
    assert!(
        std::mem::offset_of!(VmBridge, memory_size) == bridge_offsets::MEMORY_SIZE as usize
    );
    assert!(
        std::mem::offset_of!(VmBridge, memory_grow) == bridge_offsets::MEMORY_GROW as usize
    );
    assert!(
        std::mem::offset_of!(VmBridge, memory_fill) == bridge_offsets::MEMORY_FILL as usize
    );
    assert!(
        std::mem::offset_of!(VmBridge, memory_copy) == bridge_offsets::MEMORY_COPY as usize
    );
    assert!(
        std::mem::offset_of!(VmBridge, global_get) == bridge_offsets::GLOBAL_GET as usize
    );
    assert!(
        std::mem::offset_of!(VmBridge, global_set) == bridge_offsets::GLOBAL_SET as usize
    );
};

/// Compile one function for the host architecture.
pub fn compile(
    store: &Store,
    addr: FuncAddr,
    func: &RegFunc,
) -> Result<Arc<CompiledFunc>, &'static str> {
    let wasm = store.func(addr).wasm().ok_or("host functions are not compiled")?;
    let cx = CompileCtx {
        store,
        instance: wasm.instance,
        self_addr: addr,
    };
    #[cfg(target_arch = "aarch64")]
    {
        a64::compile(&cx, func).map(Arc::new)
    }
    #[cfg(target_arch = "x86_64")]
    {
        x64::compile(&cx, func).map(Arc::new)
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        let _ = cx;
        Err("unsupported architecture")
    }
}

/// What the back ends may ask about the world at compile time.
pub(crate) struct CompileCtx<'a> {
    pub store: &'a Store,
    pub instance: usize,
    pub self_addr: FuncAddr,
}

impl CompileCtx<'_> {
    /// Whether a module-local function index is a self-call target.
    pub fn is_self_call(&self, func_index: u32) -> bool {
        self.store.instances[self.instance]
            .funcs
            .get(func_index as usize)
            .is_some_and(|&a| a == self.self_addr)
    }

    /// Parameter and result counts of a module-local callee.
    pub fn callee_sig(&self, func_index: u32) -> (usize, usize) {
        let addr = self.store.instances[self.instance].funcs[func_index as usize];
        let id = self.store.func(addr).type_id;
        match self.store.registry.func_type(id) {
            Some(ft) => (ft.params.len(), ft.results.len()),
            None => (0, 0),
        }
    }

    /// Signature behind a global type id (indirect calls).
    pub fn type_sig(&self, type_id: u32) -> (usize, usize) {
        match self.store.registry.func_type(reef_types::TypeId(type_id)) {
            Some(ft) => (ft.params.len(), ft.results.len()),
            None => (0, 0),
        }
    }
}

/// Execute a compiled function.
pub(crate) fn run(
    vm: &mut Vm<'_>,
    addr: FuncAddr,
    code: &Arc<CompiledFunc>,
    args: &[u128],
) -> ExecResult<ExecuteState> {
    recovery::install_handler();

    let instance = vm
        .store
        .func(addr)
        .wasm()
        .map(|w| w.instance)
        .expect("jit runs wasm functions");
    let mem_base = vm.store.instances[instance]
        .memories
        .first()
        .map(|&m| vm.store.memories[m].memory.base_ptr())
        .unwrap_or(std::ptr::null_mut());

    let mut regs = vec![0u64; code.reg_count.max(1)];
    for (reg, cell) in regs.iter_mut().zip(args) {
        *reg = *cell as u64;
    }

    let mut bridge = VmBridge {
        vm: (vm as *mut Vm<'_>).cast(),
        mem_base,
        fuel: vm.fuel_remaining().unwrap_or(u64::MAX),
        instance: instance as u32,
        func_addr: addr as u64,
        call: shims::call,
        call_indirect: shims::call_indirect,
        memory_size: shims::memory_size,
        memory_grow: shims::memory_grow,
        memory_fill: shims::memory_fill,
        memory_copy: shims::memory_copy,
        global_get: shims::global_get,
        global_set: shims::global_set,
        pending: None,
    };

    let base = code.buf.as_ptr() as usize;
    recovery::enter(RecoveryInfo {
        active: 1,
        oob_exit_pc: base + code.oob_exit,
        code_start: base,
        code_end: base + code.buf.len(),
    });

    // SAFETY: the buffer holds a complete function emitted for this ABI and
    // is RX; arguments and bridge outlive the call; recovery state is set.
    let status = unsafe {
        let entry: Entry = std::mem::transmute(base + code.entry);
        entry(regs.as_mut_ptr(), &mut bridge)
    };

    recovery::leave();
    vm.set_fuel_from_bridge(bridge.fuel);

    match status {
        0 => {
            let results = if code.has_result {
                vec![regs[0] as u128]
            } else {
                Vec::new()
            };
            Ok(ExecuteState::Returned(results))
        }
        STATUS_PENDING => Err(bridge
            .pending
            .take()
            .unwrap_or(RuntimeError::Trap(TrapReason::UnknownTrapReason))),
        code => Err(RuntimeError::Trap(TrapReason::from_code(code as u8))),
    }
}

/// The C-ABI callbacks native code crosses into.
mod shims {
    use super::*;

    unsafe fn vm_of<'a>(bridge: *mut VmBridge) -> &'a mut Vm<'a> {
        // SAFETY: the bridge's vm pointer is live for the whole activation,
        // and native code is single-threaded within it.
        unsafe { &mut *(*bridge).vm.cast::<Vm<'a>>() }
    }

    /// Copy the bridge fuel into the VM, run `f`, copy it back.
    unsafe fn with_vm<R>(
        bridge: *mut VmBridge,
        f: impl FnOnce(&mut Vm<'_>) -> R,
    ) -> R {
        // SAFETY: caller contract of the shim entry points.
        let vm = unsafe { vm_of(bridge) };
        let fuel = unsafe { (*bridge).fuel };
        vm.set_fuel_from_bridge(fuel);
        let out = f(vm);
        // SAFETY: bridge outlives the activation.
        unsafe {
            (*bridge).fuel = vm.fuel_remaining().unwrap_or(u64::MAX);
        }
        out
    }

    fn status_of(bridge: *mut VmBridge, e: RuntimeError) -> u64 {
        match e {
            RuntimeError::Trap(reason) => u64::from(reason.code()),
            other => {
                // SAFETY: bridge is live; single-threaded access.
                unsafe {
                    (*bridge).pending = Some(other);
                }
                STATUS_PENDING
            }
        }
    }

    pub(super) unsafe extern "C" fn call(
        bridge: *mut VmBridge,
        func_index: u32,
        args: *mut u64,
        argc: u32,
        ret: *mut u64,
    ) -> u64 {
        // SAFETY: native code passes a live bridge and an argc-sized buffer.
        unsafe {
            let instance = (*bridge).instance as usize;
            with_vm(bridge, |vm| {
                let callee = vm.store.instances[instance].funcs[func_index as usize];
                let cells: Vec<u128> = (0..argc as usize)
                    .map(|i| *args.add(i) as u128)
                    .collect();
                match vm.call_function(callee, cells) {
                    Ok(results) => {
                        if let Some(&first) = results.first() {
                            *ret = first as u64;
                        }
                        0
                    }
                    Err(e) => status_of(bridge, e),
                }
            })
        }
    }

    pub(super) unsafe extern "C" fn call_indirect(
        bridge: *mut VmBridge,
        type_id: u32,
        table_index: u32,
        elem_index: u64,
        args: *mut u64,
        argc: u32,
        ret: *mut u64,
    ) -> u64 {
        // SAFETY: as for `call`.
        unsafe {
            let instance = (*bridge).instance as usize;
            with_vm(bridge, |vm| {
                let resolved = resolve_indirect(vm, instance, type_id, table_index, elem_index);
                let callee = match resolved {
                    Ok(callee) => callee,
                    Err(reason) => return u64::from(reason.code()),
                };
                let cells: Vec<u128> = (0..argc as usize)
                    .map(|i| *args.add(i) as u128)
                    .collect();
                match vm.call_function(callee, cells) {
                    Ok(results) => {
                        if let Some(&first) = results.first() {
                            *ret = first as u64;
                        }
                        0
                    }
                    Err(e) => status_of(bridge, e),
                }
            })
        }
    }

    fn resolve_indirect(
        vm: &mut Vm<'_>,
        instance: usize,
        type_id: u32,
        table_index: u32,
        elem_index: u64,
    ) -> Result<usize, TrapReason> {
        use reef_types::RefRepr;
        let table_addr = vm.store.instances[instance].tables[table_index as usize];
        let table = &vm.store.tables[table_addr];
        if elem_index >= table.size() {
            return Err(TrapReason::UndefinedElement);
        }
        let word = table.get(elem_index)?;
        let callee = match RefRepr::decode(word) {
            RefRepr::Func(a) => a,
            RefRepr::Null => return Err(TrapReason::UninitializedElement),
            _ => return Err(TrapReason::UndefinedElement),
        };
        let actual = vm.store.func(callee).type_id;
        if !vm.store.registry.is_subtype(actual, reef_types::TypeId(type_id)) {
            return Err(TrapReason::IndirectCallTypeMismatch);
        }
        Ok(callee)
    }

    pub(super) unsafe extern "C" fn memory_size(bridge: *mut VmBridge) -> u64 {
        // SAFETY: shim contract.
        unsafe {
            let instance = (*bridge).instance as usize;
            with_vm(bridge, |vm| {
                vm.store.instances[instance]
                    .memories
                    .first()
                    .map(|&m| vm.store.memories[m].memory.pages())
                    .unwrap_or(0)
            })
        }
    }

    pub(super) unsafe extern "C" fn memory_grow(bridge: *mut VmBridge, delta: u64) -> u64 {
        // SAFETY: shim contract.
        unsafe {
            let instance = (*bridge).instance as usize;
            with_vm(bridge, |vm| {
                let Some(&m) = vm.store.instances[instance].memories.first() else {
                    return -1i64 as u64;
                };
                let mem = Arc::clone(&vm.store.memories[m].memory);
                let refused = vm.params.max_memory_bytes.is_some_and(|cap| {
                    mem.pages()
                        .saturating_add(delta)
                        .saturating_mul(mem.ty().page_size())
                        > cap
                });
                if refused {
                    -1i64 as u64
                } else {
                    mem.grow(delta) as u64
                }
            })
        }
    }

    pub(super) unsafe extern "C" fn memory_fill(
        bridge: *mut VmBridge,
        dst: u64,
        val: u64,
        len: u64,
    ) -> u64 {
        // SAFETY: shim contract.
        unsafe {
            let instance = (*bridge).instance as usize;
            with_vm(bridge, |vm| {
                let Some(&m) = vm.store.instances[instance].memories.first() else {
                    return u64::from(TrapReason::OutOfBoundsMemoryAccess.code());
                };
                match vm.store.memories[m].memory.fill(dst, val as u8, len) {
                    Ok(()) => 0,
                    Err(reason) => u64::from(reason.code()),
                }
            })
        }
    }

    pub(super) unsafe extern "C" fn memory_copy(
        bridge: *mut VmBridge,
        dst: u64,
        src: u64,
        len: u64,
    ) -> u64 {
        // SAFETY: shim contract.
        unsafe {
            let instance = (*bridge).instance as usize;
            with_vm(bridge, |vm| {
                let Some(&m) = vm.store.instances[instance].memories.first() else {
                    return u64::from(TrapReason::OutOfBoundsMemoryAccess.code());
                };
                let mem = Arc::clone(&vm.store.memories[m].memory);
                match mem.copy_within(dst, &mem, src, len) {
                    Ok(()) => 0,
                    Err(reason) => u64::from(reason.code()),
                }
            })
        }
    }

    pub(super) unsafe extern "C" fn global_get(bridge: *mut VmBridge, addr: u32) -> u64 {
        // SAFETY: shim contract.
        unsafe { vm_of(bridge).store.globals[addr as usize].lo }
    }

    pub(super) unsafe extern "C" fn global_set(bridge: *mut VmBridge, addr: u32, value: u64) {
        // SAFETY: shim contract.
        unsafe {
            vm_of(bridge).store.globals[addr as usize].lo = value;
        }
    }
}
