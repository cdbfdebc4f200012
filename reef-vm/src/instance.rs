//! Instances and instantiation.
//!
//! An instance binds one module against the store: every import resolves to
//! an existing store address, every local definition appends a fresh one.
//! The instance holds no code; execution reaches the store through the
//! address tables here.

use std::collections::HashMap;
use std::sync::Arc;

use reef_asm::TrapReason;
use reef_types::{HeapType, RefRepr, RefType, ValType, Word};

use crate::error::{RuntimeError, VmError};
use crate::host::ImportSet;
use crate::interpreter::{eval_const_expr, Vm};
use crate::memory::LinearMemory;
use crate::module::{
    ElemItems, ElemMode, ExternKind, FuncType, GlobalType, Import, ImportDesc, Module,
    TableType,
};
use crate::params::VmParams;
use crate::store::{
    ExternVal, FuncInst, FuncKind, GlobalInst, MemInst, Store, TableInst, TagInst,
    TierState, WasmFunc,
};

/// Per-instance state in the store.
pub struct InstanceData {
    /// The defining module.
    pub module: Arc<Module>,
    /// Function address table (imports first).
    pub funcs: Vec<usize>,
    /// Table address table.
    pub tables: Vec<usize>,
    /// Memory address table.
    pub memories: Vec<usize>,
    /// Global address table.
    pub globals: Vec<usize>,
    /// Tag address table.
    pub tags: Vec<usize>,
    /// Resolved exports by name.
    pub exports: HashMap<String, ExternVal>,
    /// Runtime element segments; dropped segments are empty.
    elems: Vec<Vec<Word>>,
    /// Dropped flags of the data segments.
    data_dropped: Vec<bool>,
}

impl InstanceData {
    /// The words of a runtime element segment (empty once dropped).
    pub fn elem_words(&self, index: usize) -> Vec<Word> {
        self.elems.get(index).cloned().unwrap_or_default()
    }

    /// Drop a passive element segment.
    pub fn drop_elem(&mut self, index: usize) {
        if let Some(seg) = self.elems.get_mut(index) {
            seg.clear();
        }
    }

    /// Copy out data-segment bytes, bounds-checked against the (undropped)
    /// segment.
    pub fn data_bytes(
        &self,
        module: &Module,
        index: usize,
        src: u64,
        len: u64,
    ) -> Result<Vec<u8>, TrapReason> {
        let segment = module
            .datas
            .get(index)
            .ok_or(TrapReason::OutOfBoundsMemoryAccess)?;
        let dropped = self.data_dropped.get(index).copied().unwrap_or(true);
        let bytes: &[u8] = if dropped {
            &[]
        } else {
            &module.bytes[segment.bytes.clone()]
        };
        let end = src
            .checked_add(len)
            .filter(|&end| end <= bytes.len() as u64)
            .ok_or(TrapReason::OutOfBoundsMemoryAccess)?;
        Ok(bytes[src as usize..end as usize].to_vec())
    }

    /// Drop a passive data segment.
    pub fn drop_data(&mut self, index: usize) {
        if let Some(flag) = self.data_dropped.get_mut(index) {
            *flag = true;
        }
    }
}

/// Failure mode of instantiation. When the start function trapped, the
/// partially built instance stays readable (its exports are simply never
/// registered), matching the embedder-visible contract.
#[derive(Debug)]
pub struct InstantiateError {
    /// The underlying error.
    pub error: VmError,
    /// The instance index, when one was materialized before the failure.
    pub instance: Option<usize>,
}

impl From<VmError> for InstantiateError {
    fn from(error: VmError) -> Self {
        Self { error, instance: None }
    }
}

/// Instantiate a module whose types are registered and which validated.
pub fn instantiate(
    store: &mut Store,
    module: Arc<Module>,
    imports: &ImportSet,
    params: &VmParams,
) -> Result<usize, InstantiateError> {
    let index = store.instances.len();
    let mut funcs = Vec::new();
    let mut tables = Vec::new();
    let mut memories = Vec::new();
    let mut globals = Vec::new();
    let mut tags = Vec::new();

    // 1. Resolve and type-check imports.
    for import in &module.imports {
        resolve_import(
            store, &module, import, imports, &mut funcs, &mut tables, &mut memories,
            &mut globals, &mut tags,
        )?;
    }

    // 2. Append fresh store entries for local definitions.
    for (def_index, _) in module.funcs.iter().enumerate() {
        let type_idx = module.funcs[def_index].type_idx;
        let addr = store.push_func(FuncInst {
            type_id: module.global_type_id(type_idx),
            kind: FuncKind::Wasm(WasmFunc {
                module: Arc::clone(&module),
                instance: index,
                def_index,
                tier: TierState::default(),
            }),
        });
        funcs.push(addr);
    }
    for def in &module.tables {
        let ty = canon_table_type(&module, def.ty);
        tables.push(store.push_table(TableInst::new(ty, 0)));
    }
    for &ty in &module.memories {
        let memory = LinearMemory::new(ty, params.max_memory_bytes)
            .map_err(InstantiateError::from)?;
        memories.push(store.push_memory(MemInst { memory: Arc::new(memory) }));
    }
    for def in &module.globals {
        let ty = canon_global_type(&module, def.ty);
        globals.push(store.push_global(GlobalInst { ty, lo: 0, hi: 0 }));
    }
    for &type_idx in &module.tags {
        let param_count = module
            .func_type(type_idx)
            .map(|ft| ft.params.len())
            .unwrap_or(0);
        tags.push(store.push_tag(TagInst {
            type_id: module.global_type_id(type_idx),
            param_count,
        }));
    }

    let mut exports = HashMap::new();
    for export in &module.exports {
        let value = match export.kind {
            ExternKind::Func => ExternVal::Func(funcs[export.index as usize]),
            ExternKind::Table => ExternVal::Table(tables[export.index as usize]),
            ExternKind::Memory => ExternVal::Memory(memories[export.index as usize]),
            ExternKind::Global => ExternVal::Global(globals[export.index as usize]),
            ExternKind::Tag => ExternVal::Tag(tags[export.index as usize]),
        };
        exports.insert(export.name.clone(), value);
    }

    store.instances.push(InstanceData {
        module: Arc::clone(&module),
        funcs,
        tables,
        memories,
        globals,
        tags,
        exports,
        elems: Vec::new(),
        data_dropped: vec![false; module.datas.len()],
    });

    // 3. Initialize globals, tables, memories from their initializers.
    initialize(store, &module, index).map_err(|error| InstantiateError {
        error,
        instance: Some(index),
    })?;

    // 4 & 5. Run the start function, then make exports visible. A start trap
    // is a failed instantiation that still leaves the instance inspectable.
    if let Some(start) = module.start {
        let addr = store.instances[index].funcs[start as usize];
        let mut vm = Vm::new(store, params.clone());
        if let Err(e) = vm.invoke(addr, &[]) {
            let error = match e {
                RuntimeError::Trap(reason) => VmError::Trap(reason),
                RuntimeError::Thrown(_) => VmError::Uncaught,
                RuntimeError::Exit(_) => {
                    // proc_exit from a start function terminates cleanly.
                    return finish(store, &module, index);
                }
            };
            return Err(InstantiateError { error, instance: Some(index) });
        }
    }
    finish(store, &module, index)
}

fn finish(
    store: &mut Store,
    module: &Module,
    index: usize,
) -> Result<usize, InstantiateError> {
    if let Some(name) = &module.name {
        let exports = store.instances[index].exports.clone();
        store.register_exports(name, exports);
    }
    Ok(index)
}

#[allow(clippy::too_many_arguments)]
fn resolve_import(
    store: &mut Store,
    module: &Module,
    import: &Import,
    host: &ImportSet,
    funcs: &mut Vec<usize>,
    tables: &mut Vec<usize>,
    memories: &mut Vec<usize>,
    globals: &mut Vec<usize>,
    tags: &mut Vec<usize>,
) -> Result<(), InstantiateError> {
    let resolved = store.lookup_export(&import.module, &import.name);
    match &import.desc {
        ImportDesc::Func(type_idx) => {
            let expected = module.global_type_id(*type_idx);
            if let Some(ExternVal::Func(addr)) = resolved {
                if store.func(addr).type_id != expected {
                    return Err(VmError::LinkError("imported function type mismatch").into());
                }
                funcs.push(addr);
                return Ok(());
            }
            if let Some(hf) = host.find(&import.module, &import.name) {
                let declared = module
                    .func_type(*type_idx)
                    .ok_or(VmError::LinkError("import type is not a function"))?;
                if !same_signature(declared, &hf.ty) {
                    return Err(VmError::LinkError("host function type mismatch").into());
                }
                let addr = store.push_func(FuncInst {
                    type_id: expected,
                    kind: FuncKind::Host(hf.clone()),
                });
                funcs.push(addr);
                return Ok(());
            }
            Err(not_found(import))
        }
        ImportDesc::Table(declared) => {
            let Some(ExternVal::Table(addr)) = resolved else {
                return Err(not_found(import));
            };
            let declared = canon_table_type(module, *declared);
            let actual = &store.tables[addr];
            if actual.ty.elem != declared.elem
                || actual.ty.width != declared.width
                || !declared.limits.accepts(&reef_types::Limits {
                    min: actual.size(),
                    max: actual.ty.limits.max,
                })
            {
                return Err(VmError::LinkError("imported table incompatible").into());
            }
            tables.push(addr);
            Ok(())
        }
        ImportDesc::Memory(declared) => {
            let Some(ExternVal::Memory(addr)) = resolved else {
                return Err(not_found(import));
            };
            let actual = store.memories[addr].memory.ty();
            if actual.width != declared.width
                || actual.shared != declared.shared
                || actual.page_size_log2 != declared.page_size_log2
                || !declared.limits.accepts(&reef_types::Limits {
                    min: store.memories[addr].memory.pages(),
                    max: actual.limits.max,
                })
            {
                return Err(VmError::LinkError("imported memory incompatible").into());
            }
            memories.push(addr);
            Ok(())
        }
        ImportDesc::Global(declared) => {
            let Some(ExternVal::Global(addr)) = resolved else {
                return Err(not_found(import));
            };
            let declared = canon_global_type(module, *declared);
            let actual = store.globals[addr].ty;
            if actual.val != declared.val || actual.mutable != declared.mutable {
                return Err(VmError::LinkError("imported global incompatible").into());
            }
            globals.push(addr);
            Ok(())
        }
        ImportDesc::Tag(type_idx) => {
            let Some(ExternVal::Tag(addr)) = resolved else {
                return Err(not_found(import));
            };
            if store.tags[addr].type_id != module.global_type_id(*type_idx) {
                return Err(VmError::LinkError("imported tag incompatible").into());
            }
            tags.push(addr);
            Ok(())
        }
    }
}

fn not_found(import: &Import) -> InstantiateError {
    VmError::ImportNotFound(format!("{}.{}", import.module, import.name)).into()
}

fn same_signature(a: &FuncType, b: &FuncType) -> bool {
    a.params == b.params && a.results == b.results
}

/// Initialize globals, evaluate table initializers, copy active segments.
fn initialize(store: &mut Store, module: &Module, index: usize) -> Result<(), VmError> {
    let as_vm_error = |e: RuntimeError| match e {
        RuntimeError::Trap(reason) => VmError::Trap(reason),
        _ => VmError::Trap(TrapReason::UnknownTrapReason),
    };

    // Globals, in declaration order.
    for (i, def) in module.globals.iter().enumerate() {
        let cells = eval_const_expr(store, module, index, &def.init).map_err(as_vm_error)?;
        let cell = cells.last().copied().unwrap_or_default();
        let addr = store.instances[index].globals[module.import_counts().globals + i];
        store.globals[addr].set_cell(cell);
    }

    // Table initializers.
    for (i, def) in module.tables.iter().enumerate() {
        let addr = store.instances[index].tables[module.import_counts().tables + i];
        if let Some(init) = &def.init {
            let cells = eval_const_expr(store, module, index, init).map_err(as_vm_error)?;
            let word = cells.last().copied().unwrap_or_default() as Word;
            let size = store.tables[addr].size();
            for slot in 0..size {
                let _ = store.tables[addr].set(slot, word);
            }
        }
    }

    // Element segments: materialize words, then place active ones.
    let mut runtime_elems: Vec<Vec<Word>> = Vec::with_capacity(module.elems.len());
    for elem in &module.elems {
        let words = match &elem.items {
            ElemItems::Funcs(items) => items
                .iter()
                .map(|&f| {
                    RefRepr::Func(store.instances[index].funcs[f as usize]).encode()
                })
                .collect::<Vec<_>>(),
            ElemItems::Exprs(exprs) => {
                let mut out = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    let cells =
                        eval_const_expr(store, module, index, expr).map_err(as_vm_error)?;
                    out.push(cells.last().copied().unwrap_or_default() as Word);
                }
                out
            }
        };
        runtime_elems.push(words);
    }

    for (i, elem) in module.elems.iter().enumerate() {
        match &elem.mode {
            ElemMode::Active { table, offset } => {
                let cells =
                    eval_const_expr(store, module, index, offset).map_err(as_vm_error)?;
                let start = cells.last().copied().unwrap_or_default() as u64;
                let addr = store.instances[index].tables[*table as usize];
                let words = &runtime_elems[i];
                if start
                    .checked_add(words.len() as u64)
                    .is_none_or(|end| end > store.tables[addr].size())
                {
                    return Err(VmError::Trap(TrapReason::OutOfBoundsTableAccess));
                }
                for (j, &word) in words.iter().enumerate() {
                    store.tables[addr]
                        .set(start + j as u64, word)
                        .map_err(VmError::Trap)?;
                }
                runtime_elems[i].clear();
            }
            ElemMode::Declared => runtime_elems[i].clear(),
            ElemMode::Passive => {}
        }
    }
    store.instances[index].elems = runtime_elems;

    // Data segments: active ones copy then drop.
    for (i, data) in module.datas.iter().enumerate() {
        if let crate::module::DataMode::Active { memory, offset } = &data.mode {
            let cells =
                eval_const_expr(store, module, index, offset).map_err(as_vm_error)?;
            let start = cells.last().copied().unwrap_or_default() as u64;
            let addr = store.instances[index].memories[*memory as usize];
            let bytes = &module.bytes[data.bytes.clone()];
            store.memories[addr]
                .memory
                .write_from(start, bytes)
                .map_err(VmError::Trap)?;
            store.instances[index].data_dropped[i] = true;
        }
    }

    Ok(())
}

/// Rewrite a table type's element heap into store-global form.
pub(crate) fn canon_table_type(module: &Module, ty: TableType) -> TableType {
    TableType { elem: canon_ref(module, ty.elem), ..ty }
}

/// Rewrite a global type's value into store-global form.
pub(crate) fn canon_global_type(module: &Module, ty: GlobalType) -> GlobalType {
    let val = match ty.val {
        ValType::Ref(rt) => ValType::Ref(canon_ref(module, rt)),
        other => other,
    };
    GlobalType { val, mutable: ty.mutable }
}

fn canon_ref(module: &Module, rt: RefType) -> RefType {
    match rt.heap {
        HeapType::Concrete(idx) => RefType {
            nullable: rt.nullable,
            heap: HeapType::Concrete(module.global_type_id(idx).0),
        },
        _ => rt,
    }
}
