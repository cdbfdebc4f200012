//! Module validation.
//!
//! Runs after decoding and type registration. Validation is total: once a
//! module passes, every instruction is guaranteed to execute without type
//! mismatch, so runtime dispatch never re-validates anything.

use reef_types::{AddrWidth, HeapType, RefType, ValType};

use crate::error::VmError;
use crate::module::*;
use crate::registry::TypeRegistry;

mod func;

pub use func::FuncValidator;

/// Validate a module whose types are already registered.
pub fn validate(module: &Module, registry: &TypeRegistry) -> Result<(), VmError> {
    let cx = ModuleContext::build(module, registry)?;

    check_type_section(module, registry)?;
    check_imports(module, &cx)?;
    check_tables(module, &cx)?;
    check_memories(module)?;
    check_globals(module, &cx)?;
    check_tags(module, &cx)?;
    check_exports(module, &cx)?;
    check_start(module, &cx)?;
    check_segments(module, &cx)?;

    for (index, def) in module.funcs.iter().enumerate() {
        FuncValidator::new(&cx, def)?.run().map_err(|e| {
            tracing::debug!(func = index, "validation failed: {e}");
            e
        })?;
    }
    Ok(())
}

/// Flattened index spaces of a module, shared by every body validation.
pub struct ModuleContext<'m> {
    /// The module.
    pub module: &'m Module,
    /// The registry.
    pub registry: &'m TypeRegistry,
    /// Function index space: type index per function, imports first.
    pub funcs: Vec<u32>,
    /// Table index space.
    pub tables: Vec<TableType>,
    /// Memory index space.
    pub memories: Vec<MemoryType>,
    /// Global index space, with an import marker.
    pub globals: Vec<(GlobalType, bool)>,
    /// Tag index space: type index per tag.
    pub tags: Vec<u32>,
    /// Functions usable by `ref.func` (exported, in segments, or in
    /// declared element segments).
    pub declared_funcs: Vec<bool>,
}

impl<'m> ModuleContext<'m> {
    fn build(module: &'m Module, registry: &'m TypeRegistry) -> Result<Self, VmError> {
        let mut funcs = Vec::new();
        let mut tables = Vec::new();
        let mut memories = Vec::new();
        let mut globals = Vec::new();
        let mut tags = Vec::new();

        for import in &module.imports {
            match &import.desc {
                ImportDesc::Func(ty) => funcs.push(*ty),
                ImportDesc::Table(ty) => tables.push(*ty),
                ImportDesc::Memory(ty) => memories.push(*ty),
                ImportDesc::Global(ty) => globals.push((*ty, true)),
                ImportDesc::Tag(ty) => tags.push(*ty),
            }
        }
        for def in &module.funcs {
            funcs.push(def.type_idx);
        }
        for def in &module.tables {
            tables.push(def.ty);
        }
        memories.extend(module.memories.iter().copied());
        for def in &module.globals {
            globals.push((def.ty, false));
        }
        tags.extend(module.tags.iter().copied());

        let mut declared_funcs = vec![false; funcs.len()];
        for export in &module.exports {
            if export.kind == ExternKind::Func {
                if let Some(slot) = declared_funcs.get_mut(export.index as usize) {
                    *slot = true;
                }
            }
        }
        for elem in &module.elems {
            let mark = |slot: Option<&mut bool>| {
                if let Some(slot) = slot {
                    *slot = true;
                }
            };
            match &elem.items {
                ElemItems::Funcs(items) => {
                    for &f in items {
                        mark(declared_funcs.get_mut(f as usize));
                    }
                }
                ElemItems::Exprs(exprs) => {
                    for expr in exprs {
                        for op in &expr.ops {
                            if let ConstOp::RefFunc(f) = op {
                                mark(declared_funcs.get_mut(*f as usize));
                            }
                        }
                    }
                }
            }
        }

        Ok(Self {
            module,
            registry,
            funcs,
            tables,
            memories,
            globals,
            tags,
            declared_funcs,
        })
    }

    /// The function type behind a type index, or an error for non-func types.
    pub fn func_type(&self, ty: u32) -> Result<&FuncType, VmError> {
        self.module
            .func_type(ty)
            .ok_or(VmError::InvalidWasm("type index is not a function type"))
    }

    /// Rewrite a module-local heap type to its store-global form.
    pub fn canon_heap(&self, heap: HeapType) -> Result<HeapType, VmError> {
        Ok(match heap {
            HeapType::Concrete(idx) => {
                if idx as usize >= self.module.type_count() {
                    return Err(VmError::InvalidWasm("type index out of range"));
                }
                HeapType::Concrete(self.module.global_type_id(idx).0)
            }
            other => other,
        })
    }

    /// Rewrite a module-local value type to its store-global form.
    pub fn canon_val(&self, ty: ValType) -> Result<ValType, VmError> {
        Ok(match ty {
            ValType::Ref(rt) => ValType::Ref(RefType {
                nullable: rt.nullable,
                heap: self.canon_heap(rt.heap)?,
            }),
            other => other,
        })
    }

    /// Value subtyping over store-global types.
    pub fn is_subtype_val(&self, sub: ValType, sup: ValType) -> bool {
        if sub == sup {
            return true;
        }
        match (sub, sup) {
            (ValType::Ref(a), ValType::Ref(b)) => {
                (b.nullable || !a.nullable) && self.is_subtype_heap(a.heap, b.heap)
            }
            _ => false,
        }
    }

    /// Heap subtyping over store-global types.
    pub fn is_subtype_heap(&self, sub: HeapType, sup: HeapType) -> bool {
        use HeapType::*;
        if sub == sup {
            return true;
        }
        match (sub, sup) {
            (None, Any | Eq | I31 | Struct | Array) => true,
            (NoFunc, Func) => true,
            (NoExtern, Extern) => true,
            (NoExn, Exn) => true,
            (I31 | Struct | Array | Eq, Any) => true,
            (I31 | Struct | Array, Eq) => true,
            (None, Concrete(_)) => {
                matches!(self.concrete_top(sup), Struct | Array)
            }
            (NoFunc, Concrete(_)) => self.concrete_top(sup) == Func,
            (Concrete(_), Any | Eq) => {
                matches!(self.concrete_top(sub), Struct | Array)
            }
            (Concrete(_), Struct) => self.concrete_top(sub) == Struct,
            (Concrete(_), Array) => self.concrete_top(sub) == Array,
            (Concrete(_), Func) => self.concrete_top(sub) == Func,
            (Concrete(a), Concrete(b)) => self
                .registry
                .is_subtype(reef_types::TypeId(a), reef_types::TypeId(b)),
            _ => false,
        }
    }

    /// The abstract classifier of a concrete heap type.
    fn concrete_top(&self, heap: HeapType) -> HeapType {
        let HeapType::Concrete(id) = heap else { return heap };
        match &self.registry.get(reef_types::TypeId(id)).composite {
            CompositeType::Func(_) => HeapType::Func,
            CompositeType::Struct(_) => HeapType::Struct,
            CompositeType::Array(_) => HeapType::Array,
        }
    }

    /// The default (bottom) heap type of a hierarchy, for `ref.null`
    /// normalization in typing contexts.
    pub fn bottom_of(&self, heap: HeapType) -> HeapType {
        use HeapType::*;
        match heap {
            Func | NoFunc => NoFunc,
            Extern | NoExtern => NoExtern,
            Exn | NoExn => NoExn,
            Concrete(_) => match self.concrete_top(heap) {
                Func => NoFunc,
                _ => None,
            },
            _ => None,
        }
    }
}

fn check_type_section(module: &Module, registry: &TypeRegistry) -> Result<(), VmError> {
    // Declared supertypes must have compatible composite shapes. The
    // registry already rejected final supertypes.
    for idx in 0..module.type_count() as u32 {
        let id = module.global_type_id(idx);
        let ty = registry.get(id);
        let Some(sup) = ty.supertype else { continue };
        let sup_ty = registry.get(sup);
        let compatible = match (&ty.composite, &sup_ty.composite) {
            (CompositeType::Func(a), CompositeType::Func(b)) => {
                a.params.len() == b.params.len() && a.results.len() == b.results.len()
            }
            (CompositeType::Struct(a), CompositeType::Struct(b)) => {
                a.fields.len() >= b.fields.len()
            }
            (CompositeType::Array(_), CompositeType::Array(_)) => true,
            _ => false,
        };
        if !compatible {
            return Err(VmError::InvalidWasm("supertype shape mismatch"));
        }
    }
    Ok(())
}

fn check_imports(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    for import in &module.imports {
        match &import.desc {
            ImportDesc::Func(ty) | ImportDesc::Tag(ty) => {
                let ft = cx.func_type(*ty)?;
                if matches!(import.desc, ImportDesc::Tag(_)) && !ft.results.is_empty() {
                    return Err(VmError::InvalidWasm("tag type must have no results"));
                }
            }
            ImportDesc::Table(_) | ImportDesc::Memory(_) | ImportDesc::Global(_) => {}
        }
    }
    Ok(())
}

fn check_tables(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    for def in &module.tables {
        let elem = ValType::Ref(def.ty.elem);
        cx.canon_val(elem)?;
        if let Some(init) = &def.init {
            check_const_expr(cx, init, cx.canon_val(elem)?)?;
        } else if !def.ty.elem.nullable {
            return Err(VmError::InvalidWasm(
                "non-nullable table requires an initializer",
            ));
        }
        if def.ty.limits.min > u64::from(u32::MAX) && !def.ty.width.is_64() {
            return Err(VmError::InvalidWasm("table minimum over index range"));
        }
    }
    Ok(())
}

fn check_memories(module: &Module) -> Result<(), VmError> {
    for ty in &module.memories {
        let page_span = match ty.width {
            AddrWidth::A32 => 1u64 << (32 - ty.page_size_log2.min(32)),
            AddrWidth::A64 => u64::MAX,
        };
        if ty.limits.min > page_span
            || ty.limits.max.is_some_and(|max| max > page_span)
        {
            return Err(VmError::InvalidWasm("memory limits over index range"));
        }
    }
    Ok(())
}

fn check_globals(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    for def in &module.globals {
        let expected = cx.canon_val(def.ty.val)?;
        check_const_expr(cx, &def.init, expected)?;
    }
    Ok(())
}

fn check_tags(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    for &ty in &module.tags {
        let ft = cx.func_type(ty)?;
        if !ft.results.is_empty() {
            return Err(VmError::InvalidWasm("tag type must have no results"));
        }
    }
    Ok(())
}

fn check_exports(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    let mut seen = std::collections::HashSet::new();
    for export in &module.exports {
        if !seen.insert(export.name.as_str()) {
            return Err(VmError::InvalidWasm("duplicate export name"));
        }
        let space = match export.kind {
            ExternKind::Func => cx.funcs.len(),
            ExternKind::Table => cx.tables.len(),
            ExternKind::Memory => cx.memories.len(),
            ExternKind::Global => cx.globals.len(),
            ExternKind::Tag => cx.tags.len(),
        };
        if export.index as usize >= space {
            return Err(VmError::InvalidWasm("export index out of range"));
        }
    }
    Ok(())
}

fn check_start(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    let Some(start) = module.start else { return Ok(()) };
    let ty = cx
        .funcs
        .get(start as usize)
        .ok_or(VmError::InvalidWasm("start function out of range"))?;
    let ft = cx.func_type(*ty)?;
    if !ft.params.is_empty() || !ft.results.is_empty() {
        return Err(VmError::InvalidWasm("start function must be [] -> []"));
    }
    Ok(())
}

fn check_segments(module: &Module, cx: &ModuleContext<'_>) -> Result<(), VmError> {
    for elem in &module.elems {
        let declared = cx.canon_val(ValType::Ref(elem.ty))?;
        match &elem.items {
            ElemItems::Funcs(items) => {
                for &f in items {
                    if f as usize >= cx.funcs.len() {
                        return Err(VmError::InvalidWasm("element function out of range"));
                    }
                }
                let funcref = ValType::FUNCREF;
                if !cx.is_subtype_val(funcref, declared) {
                    // funcref items fit any func-hierarchy element type that
                    // admits them; stricter element types need expressions.
                    let ValType::Ref(rt) = declared else {
                        return Err(VmError::InvalidWasm("element type mismatch"));
                    };
                    if !cx.is_subtype_heap(HeapType::Func, rt.heap) {
                        return Err(VmError::InvalidWasm("element type mismatch"));
                    }
                }
            }
            ElemItems::Exprs(exprs) => {
                for expr in exprs {
                    check_const_expr(cx, expr, declared)?;
                }
            }
        }
        if let ElemMode::Active { table, offset } = &elem.mode {
            let table_ty = cx
                .tables
                .get(*table as usize)
                .ok_or(VmError::InvalidWasm("element table out of range"))?;
            if !cx.is_subtype_val(declared, cx.canon_val(ValType::Ref(table_ty.elem))?) {
                return Err(VmError::InvalidWasm("element type incompatible with table"));
            }
            check_const_expr(cx, offset, table_ty.width.index_type())?;
        }
    }

    for data in &module.datas {
        if let DataMode::Active { memory, offset } = &data.mode {
            let mem_ty = cx
                .memories
                .get(*memory as usize)
                .ok_or(VmError::InvalidWasm("data memory out of range"))?;
            check_const_expr(cx, offset, mem_ty.width.index_type())?;
        }
    }
    Ok(())
}

/// Validate a constant expression against its expected result type.
///
/// Constant expressions may read imported immutable globals, use the
/// extended integer arithmetic, and allocate GC objects.
pub fn check_const_expr(
    cx: &ModuleContext<'_>,
    expr: &ConstExpr,
    expected: ValType,
) -> Result<(), VmError> {
    let mut stack: Vec<ValType> = Vec::new();
    let pop = |stack: &mut Vec<ValType>, want: ValType, cx: &ModuleContext<'_>| {
        let got = stack
            .pop()
            .ok_or(VmError::InvalidWasm("constant expression underflow"))?;
        if !cx.is_subtype_val(got, want) {
            return Err(VmError::InvalidWasm("constant expression type mismatch"));
        }
        Ok(())
    };
    for &op in &expr.ops {
        match op {
            ConstOp::I32(_) => stack.push(ValType::I32),
            ConstOp::I64(_) => stack.push(ValType::I64),
            ConstOp::F32(_) => stack.push(ValType::F32),
            ConstOp::F64(_) => stack.push(ValType::F64),
            ConstOp::V128(_) => stack.push(ValType::V128),
            ConstOp::RefNull(heap) => {
                let heap = cx.canon_heap(heap)?;
                stack.push(ValType::Ref(RefType { nullable: true, heap }));
            }
            ConstOp::RefFunc(f) => {
                let ty = *cx
                    .funcs
                    .get(f as usize)
                    .ok_or(VmError::InvalidWasm("ref.func out of range"))?;
                if !cx.declared_funcs.get(f as usize).copied().unwrap_or(false) {
                    return Err(VmError::InvalidWasm("undeclared function reference"));
                }
                let heap = HeapType::Concrete(cx.module.global_type_id(ty).0);
                stack.push(ValType::Ref(RefType { nullable: false, heap }));
            }
            ConstOp::GlobalGet(g) => {
                let (ty, imported) = *cx
                    .globals
                    .get(g as usize)
                    .ok_or(VmError::InvalidWasm("global.get out of range"))?;
                if !imported || ty.mutable {
                    return Err(VmError::InvalidWasm(
                        "constant global.get must name an imported immutable global",
                    ));
                }
                stack.push(cx.canon_val(ty.val)?);
            }
            ConstOp::I32Add | ConstOp::I32Sub | ConstOp::I32Mul => {
                pop(&mut stack, ValType::I32, cx)?;
                pop(&mut stack, ValType::I32, cx)?;
                stack.push(ValType::I32);
            }
            ConstOp::I64Add | ConstOp::I64Sub | ConstOp::I64Mul => {
                pop(&mut stack, ValType::I64, cx)?;
                pop(&mut stack, ValType::I64, cx)?;
                stack.push(ValType::I64);
            }
            ConstOp::RefI31 => {
                pop(&mut stack, ValType::I32, cx)?;
                stack.push(ValType::Ref(RefType {
                    nullable: false,
                    heap: HeapType::I31,
                }));
            }
            ConstOp::StructNew(ty) | ConstOp::StructNewDefault(ty) => {
                let id = type_id_checked(cx, ty)?;
                let CompositeType::Struct(st) = &cx.registry.get(id).composite else {
                    return Err(VmError::InvalidWasm("struct.new of non-struct type"));
                };
                if matches!(op, ConstOp::StructNew(_)) {
                    for field in st.fields.iter().rev() {
                        pop(&mut stack, field.storage.unpacked(), cx)?;
                    }
                }
                stack.push(concrete_ref(id));
            }
            ConstOp::ArrayNew(ty) | ConstOp::ArrayNewDefault(ty) => {
                let id = type_id_checked(cx, ty)?;
                let CompositeType::Array(at) = &cx.registry.get(id).composite else {
                    return Err(VmError::InvalidWasm("array.new of non-array type"));
                };
                let elem = at.elem.storage.unpacked();
                pop(&mut stack, ValType::I32, cx)?;
                if matches!(op, ConstOp::ArrayNew(_)) {
                    pop(&mut stack, elem, cx)?;
                }
                stack.push(concrete_ref(id));
            }
            ConstOp::ArrayNewFixed(ty, n) => {
                let id = type_id_checked(cx, ty)?;
                let CompositeType::Array(at) = &cx.registry.get(id).composite else {
                    return Err(VmError::InvalidWasm("array.new of non-array type"));
                };
                let elem = at.elem.storage.unpacked();
                for _ in 0..n {
                    pop(&mut stack, elem, cx)?;
                }
                stack.push(concrete_ref(id));
            }
        }
    }
    if stack.len() != 1 {
        return Err(VmError::InvalidWasm("constant expression arity"));
    }
    let got = stack[0];
    if !cx.is_subtype_val(got, expected) {
        return Err(VmError::InvalidWasm("constant expression type mismatch"));
    }
    Ok(())
}

fn type_id_checked(cx: &ModuleContext<'_>, ty: u32) -> Result<reef_types::TypeId, VmError> {
    if ty as usize >= cx.module.type_count() {
        return Err(VmError::InvalidWasm("type index out of range"));
    }
    Ok(cx.module.global_type_id(ty))
}

fn concrete_ref(id: reef_types::TypeId) -> ValType {
    ValType::Ref(RefType { nullable: false, heap: HeapType::Concrete(id.0) })
}
