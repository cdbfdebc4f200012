//! The store: the process-wide address space of runtime resources.
//!
//! One arena of vectors per resource kind. Addresses are vector indices,
//! stable for the store's lifetime; the store is never compacted. Addresses
//! from different instances coexist freely, which is what makes
//! cross-instance calls plain address passing.

use std::collections::HashMap;
use std::sync::Arc;

use reef_asm::TrapReason;
use reef_types::{
    FuncAddr, GlobalAddr, MemAddr, RefRepr, TableAddr, TagAddr, TypeId, Word,
};

use crate::exception::ExnArena;
use crate::gc::GcHeap;
use crate::host::HostFunc;
use crate::instance::InstanceData;
use crate::jit::CompiledFunc;
use crate::lower::RegFunc;
use crate::memory::LinearMemory;
use crate::module::{GlobalType, Module, TableType};
use crate::predecode::PredecodedFunc;
use crate::registry::TypeRegistry;

/// A value crossing the import/export boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternVal {
    /// Function address.
    Func(FuncAddr),
    /// Table address.
    Table(TableAddr),
    /// Memory address.
    Memory(MemAddr),
    /// Global address.
    Global(GlobalAddr),
    /// Tag address.
    Tag(TagAddr),
}

/// The store.
#[derive(Default)]
pub struct Store {
    /// Singleton type registry.
    pub registry: TypeRegistry,
    /// Function instances.
    pub funcs: Vec<FuncInst>,
    /// Table instances.
    pub tables: Vec<TableInst>,
    /// Memory instances.
    pub memories: Vec<MemInst>,
    /// Global instances.
    pub globals: Vec<GlobalInst>,
    /// Tag instances.
    pub tags: Vec<TagInst>,
    /// Exception arena.
    pub exns: ExnArena,
    /// GC heap.
    pub gc: GcHeap,
    /// Instances, in instantiation order.
    pub instances: Vec<InstanceData>,
    /// `module name -> export table` for link-time lookup.
    registered: HashMap<String, HashMap<String, ExternVal>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance's exports under a module name, making them
    /// visible to later instantiations.
    pub fn register_exports(&mut self, name: &str, exports: HashMap<String, ExternVal>) {
        self.registered.insert(name.to_string(), exports);
    }

    /// Resolve a registered export.
    pub fn lookup_export(&self, module: &str, name: &str) -> Option<ExternVal> {
        self.registered.get(module)?.get(name).copied()
    }

    /// Append a function instance.
    pub fn push_func(&mut self, func: FuncInst) -> FuncAddr {
        self.funcs.push(func);
        self.funcs.len() - 1
    }

    /// Append a table instance.
    pub fn push_table(&mut self, table: TableInst) -> TableAddr {
        self.tables.push(table);
        self.tables.len() - 1
    }

    /// Append a memory instance.
    pub fn push_memory(&mut self, memory: MemInst) -> MemAddr {
        self.memories.push(memory);
        self.memories.len() - 1
    }

    /// Append a global instance.
    pub fn push_global(&mut self, global: GlobalInst) -> GlobalAddr {
        self.globals.push(global);
        self.globals.len() - 1
    }

    /// Append a tag instance.
    pub fn push_tag(&mut self, tag: TagInst) -> TagAddr {
        self.tags.push(tag);
        self.tags.len() - 1
    }

    /// The function at an address.
    pub fn func(&self, addr: FuncAddr) -> &FuncInst {
        &self.funcs[addr]
    }

    /// Mutable function access (tier transitions, counters).
    pub fn func_mut(&mut self, addr: FuncAddr) -> &mut FuncInst {
        &mut self.funcs[addr]
    }

    /// Dereference a funcref word, checking the tag discipline.
    pub fn funcref_addr(&self, word: Word) -> Result<FuncAddr, TrapReason> {
        match RefRepr::decode(word) {
            RefRepr::Func(addr) if addr < self.funcs.len() => Ok(addr),
            RefRepr::Null => Err(TrapReason::NullReference),
            _ => Err(TrapReason::UndefinedElement),
        }
    }
}

/// A function instance.
pub struct FuncInst {
    /// Global id of the function's type.
    pub type_id: TypeId,
    /// Wasm-defined or host-defined payload.
    pub kind: FuncKind,
}

/// Function payload.
pub enum FuncKind {
    /// A function defined by a module.
    Wasm(WasmFunc),
    /// A host callback.
    Host(HostFunc),
}

impl FuncInst {
    /// The Wasm payload, when this is a module function.
    pub fn wasm(&self) -> Option<&WasmFunc> {
        match &self.kind {
            FuncKind::Wasm(f) => Some(f),
            FuncKind::Host(_) => None,
        }
    }

    /// Mutable Wasm payload.
    pub fn wasm_mut(&mut self) -> Option<&mut WasmFunc> {
        match &mut self.kind {
            FuncKind::Wasm(f) => Some(f),
            FuncKind::Host(_) => None,
        }
    }
}

/// A module-defined function plus its tier artifacts.
pub struct WasmFunc {
    /// Defining module.
    pub module: Arc<Module>,
    /// Store index of the owning instance.
    pub instance: usize,
    /// Index into the module's local function definitions.
    pub def_index: usize,
    /// Lazily raised execution artifacts.
    pub tier: TierState,
}

/// Per-function tier pipeline state.
///
/// The register IR and native code are derived artifacts of the predecoded
/// IR; when a derivation fails the function simply stays below that tier,
/// with no observable difference beyond throughput.
#[derive(Default)]
pub struct TierState {
    /// Predecoded IR, built on first call.
    pub predecoded: Option<Arc<PredecodedFunc>>,
    /// Register IR, or the record that lowering failed.
    pub reg: DerivedTier<Arc<RegFunc>>,
    /// Native code, or the record that emission failed.
    pub jit: DerivedTier<Arc<CompiledFunc>>,
    /// Promotion counter: +1 per entry, +1 per register-tier back edge.
    pub hotness: u32,
}

/// State of one derived artifact.
#[derive(Default)]
pub enum DerivedTier<T> {
    /// Not attempted yet.
    #[default]
    Pending,
    /// Built and usable.
    Ready(T),
    /// Derivation failed; never retried.
    Failed,
}

impl<T: Clone> DerivedTier<T> {
    /// The artifact, when ready.
    pub fn ready(&self) -> Option<T> {
        match self {
            Self::Ready(t) => Some(t.clone()),
            _ => None,
        }
    }
}

/// A table instance.
#[derive(Debug)]
pub struct TableInst {
    /// The table's type.
    pub ty: TableType,
    /// Elements, as tagged reference words.
    pub elems: Vec<Word>,
}

impl TableInst {
    /// Create a table filled with `init`.
    pub fn new(ty: TableType, init: Word) -> Self {
        Self { ty, elems: vec![init; ty.limits.min as usize] }
    }

    /// Current element count.
    pub fn size(&self) -> u64 {
        self.elems.len() as u64
    }

    /// Read an element.
    pub fn get(&self, index: u64) -> Result<Word, TrapReason> {
        self.elems
            .get(index as usize)
            .copied()
            .ok_or(TrapReason::OutOfBoundsTableAccess)
    }

    /// Write an element.
    pub fn set(&mut self, index: u64, value: Word) -> Result<(), TrapReason> {
        match self.elems.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TrapReason::OutOfBoundsTableAccess),
        }
    }

    /// Grow by `delta` elements of `init`. Returns the old size or -1.
    pub fn grow(&mut self, delta: u64, init: Word) -> i64 {
        let old = self.size();
        let Some(new) = old.checked_add(delta) else { return -1 };
        if let Some(max) = self.ty.limits.max {
            if new > max {
                return -1;
            }
        }
        if new > u32::MAX as u64 {
            return -1;
        }
        self.elems.resize(new as usize, init);
        old as i64
    }

    /// `table.fill`.
    pub fn fill(&mut self, start: u64, value: Word, len: u64) -> Result<(), TrapReason> {
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.size())
            .ok_or(TrapReason::OutOfBoundsTableAccess)?;
        self.elems[start as usize..end as usize].fill(value);
        Ok(())
    }
}

/// A memory instance: the declared type plus its (possibly shared) backing.
#[derive(Debug, Clone)]
pub struct MemInst {
    /// Backing mapping.
    pub memory: Arc<LinearMemory>,
}

/// A global instance.
///
/// The extension word carries the high half of a `v128` global; scalars use
/// only `lo`.
#[derive(Debug, Clone, Copy)]
pub struct GlobalInst {
    /// The global's type.
    pub ty: GlobalType,
    /// Value word.
    pub lo: Word,
    /// High half for v128.
    pub hi: u64,
}

impl GlobalInst {
    /// The 128-bit cell view.
    pub fn cell(&self) -> u128 {
        (self.lo as u128) | ((self.hi as u128) << 64)
    }

    /// Store a 128-bit cell.
    pub fn set_cell(&mut self, cell: u128) {
        self.lo = cell as u64;
        self.hi = (cell >> 64) as u64;
    }
}

/// A tag instance.
#[derive(Debug, Clone)]
pub struct TagInst {
    /// Global id of the tag's function type.
    pub type_id: TypeId,
    /// Cached parameter count, for payload packing.
    pub param_count: usize,
}
