//! The immutable module representation produced by decoding.
//!
//! Nothing here is mutated after validation; execution state lives in the
//! store. Function bodies stay as byte ranges into the original image and
//! are predecoded lazily, per function, on first call.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use reef_types::{
    AddrWidth, FuncIdx, GlobalIdx, HeapType, Limits, MemIdx, RefType, TableIdx,
    TypeId, TypeIdx, ValType,
};

use crate::consts::DEFAULT_PAGE_SIZE_LOG2;

/// A decoded, validated WebAssembly module.
#[derive(Debug)]
pub struct Module {
    /// The original binary image; function bodies index into it.
    pub bytes: Arc<[u8]>,
    /// Type section, grouped into rec groups.
    pub rec_groups: Vec<RecGroup>,
    /// Flattened view: module-local type index -> (group, index in group).
    pub type_positions: Vec<(u32, u32)>,
    /// Module-local type index -> store-global type id. Filled when the
    /// module's types are registered; identity-mapped until then.
    pub type_ids: Vec<TypeId>,
    /// Imports, in declaration order.
    pub imports: Vec<Import>,
    /// Locally defined functions.
    pub funcs: Vec<FuncDef>,
    /// Locally defined tables.
    pub tables: Vec<TableDef>,
    /// Locally defined memories.
    pub memories: Vec<MemoryType>,
    /// Locally defined globals.
    pub globals: Vec<GlobalDef>,
    /// Locally defined exception tags.
    pub tags: Vec<TypeIdx>,
    /// Exports.
    pub exports: Vec<Export>,
    /// Start function.
    pub start: Option<FuncIdx>,
    /// Element segments.
    pub elems: Vec<ElemSegment>,
    /// Data segments.
    pub datas: Vec<DataSegment>,
    /// Declared data-segment count from the count section, when present.
    pub data_count: Option<u32>,
    /// Branch hints from the metadata custom section, keyed by function.
    pub branch_hints: HashMap<FuncIdx, Vec<BranchHint>>,
    /// Module name from the name custom section, used to register exports
    /// for link-time lookup.
    pub name: Option<String>,
}

impl Module {
    /// Number of imported entries of each kind, in import order.
    pub fn import_counts(&self) -> ImportCounts {
        let mut counts = ImportCounts::default();
        for import in &self.imports {
            match import.desc {
                ImportDesc::Func(_) => counts.funcs += 1,
                ImportDesc::Table(_) => counts.tables += 1,
                ImportDesc::Memory(_) => counts.memories += 1,
                ImportDesc::Global(_) => counts.globals += 1,
                ImportDesc::Tag(_) => counts.tags += 1,
            }
        }
        counts
    }

    /// The declared type index of a function, spanning imports and locals.
    pub fn func_type_idx(&self, func: FuncIdx) -> Option<TypeIdx> {
        let mut remaining = func as usize;
        for import in &self.imports {
            if let ImportDesc::Func(ty) = import.desc {
                if remaining == 0 {
                    return Some(ty);
                }
                remaining -= 1;
            }
        }
        self.funcs.get(remaining).map(|def| def.type_idx)
    }

    /// The composite type at a module-local index.
    pub fn composite(&self, ty: TypeIdx) -> Option<&CompositeType> {
        let &(group, index) = self.type_positions.get(ty as usize)?;
        Some(&self.rec_groups[group as usize].types[index as usize].composite)
    }

    /// The function type at a module-local index.
    pub fn func_type(&self, ty: TypeIdx) -> Option<&FuncType> {
        match self.composite(ty)? {
            CompositeType::Func(ft) => Some(ft),
            _ => None,
        }
    }

    /// Store-global id of a module-local type index.
    pub fn global_type_id(&self, ty: TypeIdx) -> TypeId {
        self.type_ids[ty as usize]
    }

    /// Total number of declared types.
    pub fn type_count(&self) -> usize {
        self.type_positions.len()
    }
}

/// Counts of imported entries per kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportCounts {
    /// Imported functions.
    pub funcs: usize,
    /// Imported tables.
    pub tables: usize,
    /// Imported memories.
    pub memories: usize,
    /// Imported globals.
    pub globals: usize,
    /// Imported tags.
    pub tags: usize,
}

/// A maximal group of mutually recursive type definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecGroup {
    /// Members, in declaration order.
    pub types: Vec<SubType>,
}

/// One type definition with its subtyping declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubType {
    /// Whether further subtypes are forbidden.
    pub is_final: bool,
    /// Declared supertype, as a module-local type index.
    pub supertype: Option<TypeIdx>,
    /// The composite payload.
    pub composite: CompositeType,
}

/// A composite type: function, struct, or array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompositeType {
    /// A function signature.
    Func(FuncType),
    /// A struct layout.
    Struct(StructType),
    /// An array layout.
    Array(ArrayType),
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    /// Parameter types.
    pub params: Vec<ValType>,
    /// Result types.
    pub results: Vec<ValType>,
}

/// A struct layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    /// Fields, in declaration order.
    pub fields: Vec<FieldType>,
}

/// An array layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayType {
    /// Element field.
    pub elem: FieldType,
}

/// A struct field or array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    /// Storage type.
    pub storage: StorageType,
    /// Whether writes are allowed after construction.
    pub mutable: bool,
}

/// A storage type: a value type or one of the packed widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// An unpacked value type.
    Val(ValType),
    /// 8-bit packed storage.
    I8,
    /// 16-bit packed storage.
    I16,
}

impl StorageType {
    /// The value type this storage unpacks to on the operand stack.
    pub const fn unpacked(self) -> ValType {
        match self {
            Self::Val(ty) => ty,
            Self::I8 | Self::I16 => ValType::I32,
        }
    }
}

/// One import declaration.
#[derive(Debug, Clone)]
pub struct Import {
    /// Module namespace.
    pub module: String,
    /// Entry name.
    pub name: String,
    /// What is imported.
    pub desc: ImportDesc,
}

/// Import payload per kind.
#[derive(Debug, Clone)]
pub enum ImportDesc {
    /// A function of the given type.
    Func(TypeIdx),
    /// A table.
    Table(TableType),
    /// A memory.
    Memory(MemoryType),
    /// A global.
    Global(GlobalType),
    /// An exception tag of the given function type.
    Tag(TypeIdx),
}

/// A locally defined function: its signature plus its body bytes.
#[derive(Debug, Clone)]
pub struct FuncDef {
    /// Declared type index.
    pub type_idx: TypeIdx,
    /// Declared locals, run-length as encoded.
    pub locals: Vec<(u32, ValType)>,
    /// Body byte range in [`Module::bytes`], expression only (ends at the
    /// terminating `end`).
    pub body: Range<usize>,
}

impl FuncDef {
    /// Total declared local count, excluding parameters.
    pub fn local_count(&self) -> u32 {
        self.locals.iter().map(|&(n, _)| n).sum()
    }
}

/// A table's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    /// Element reference type.
    pub elem: RefType,
    /// Size limits, in elements.
    pub limits: Limits,
    /// Index width.
    pub width: AddrWidth,
}

/// A locally defined table: its type plus the optional initializer.
#[derive(Debug, Clone)]
pub struct TableDef {
    /// The table's type.
    pub ty: TableType,
    /// Element initializer; null of the element type when absent.
    pub init: Option<ConstExpr>,
}

/// A memory's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Size limits, in pages.
    pub limits: Limits,
    /// Index width.
    pub width: AddrWidth,
    /// Whether the memory may be shared between agents.
    pub shared: bool,
    /// log2 of the page size; 16 unless the custom-page-size flag was used.
    pub page_size_log2: u8,
}

impl MemoryType {
    /// Bytes per page.
    pub const fn page_size(&self) -> u64 {
        1 << self.page_size_log2
    }
}

impl Default for MemoryType {
    fn default() -> Self {
        Self {
            limits: Limits { min: 0, max: None },
            width: AddrWidth::A32,
            shared: false,
            page_size_log2: DEFAULT_PAGE_SIZE_LOG2,
        }
    }
}

/// A global's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    /// Value type.
    pub val: ValType,
    /// Whether `global.set` is allowed.
    pub mutable: bool,
}

/// A locally defined global.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    /// The global's type.
    pub ty: GlobalType,
    /// Constant initializer.
    pub init: ConstExpr,
}

/// An export declaration.
#[derive(Debug, Clone)]
pub struct Export {
    /// Export name.
    pub name: String,
    /// Exported kind.
    pub kind: ExternKind,
    /// Module-local index within the kind's index space.
    pub index: u32,
}

/// Kinds of external (importable/exportable) entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternKind {
    /// Function.
    Func,
    /// Table.
    Table,
    /// Memory.
    Memory,
    /// Global.
    Global,
    /// Exception tag.
    Tag,
}

/// An element segment.
#[derive(Debug, Clone)]
pub struct ElemSegment {
    /// Element type of the items.
    pub ty: RefType,
    /// Placement mode.
    pub mode: ElemMode,
    /// The items.
    pub items: ElemItems,
}

/// Element segment placement.
#[derive(Debug, Clone)]
pub enum ElemMode {
    /// Copied into a table at instantiation.
    Active {
        /// Target table.
        table: TableIdx,
        /// Start offset expression.
        offset: ConstExpr,
    },
    /// Available to `table.init`.
    Passive,
    /// Only declares functions for `ref.func`.
    Declared,
}

/// Element segment payload.
#[derive(Debug, Clone)]
pub enum ElemItems {
    /// Function indices (shorthand encodings).
    Funcs(Vec<FuncIdx>),
    /// General constant expressions.
    Exprs(Vec<ConstExpr>),
}

impl ElemItems {
    /// Number of items.
    pub fn len(&self) -> usize {
        match self {
            Self::Funcs(v) => v.len(),
            Self::Exprs(v) => v.len(),
        }
    }

    /// Whether the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A data segment.
#[derive(Debug, Clone)]
pub struct DataSegment {
    /// Placement mode.
    pub mode: DataMode,
    /// Payload byte range in [`Module::bytes`].
    pub bytes: Range<usize>,
}

/// Data segment placement.
#[derive(Debug, Clone)]
pub enum DataMode {
    /// Copied into a memory at instantiation.
    Active {
        /// Target memory.
        memory: MemIdx,
        /// Start offset expression.
        offset: ConstExpr,
    },
    /// Available to `memory.init`.
    Passive,
}

/// A decoded constant expression.
///
/// Evaluated by a dedicated init-only evaluator during instantiation; the
/// full interpreter is never involved.
#[derive(Debug, Clone, Default)]
pub struct ConstExpr {
    /// Operations, in order. The expression leaves exactly one value.
    pub ops: Vec<ConstOp>,
}

/// One operation of a constant expression.
#[derive(Debug, Clone, Copy)]
pub enum ConstOp {
    /// Push an i32.
    I32(i32),
    /// Push an i64.
    I64(i64),
    /// Push an f32 by bits.
    F32(u32),
    /// Push an f64 by bits.
    F64(u64),
    /// Push a v128.
    V128(u128),
    /// Push null of the given heap type.
    RefNull(HeapType),
    /// Push a funcref.
    RefFunc(FuncIdx),
    /// Push an imported global's value.
    GlobalGet(GlobalIdx),
    /// Extended arithmetic.
    I32Add,
    /// Extended arithmetic.
    I32Sub,
    /// Extended arithmetic.
    I32Mul,
    /// Extended arithmetic.
    I64Add,
    /// Extended arithmetic.
    I64Sub,
    /// Extended arithmetic.
    I64Mul,
    /// Box the i32 on top into an i31 reference.
    RefI31,
    /// Allocate a struct from the top `n` fields.
    StructNew(TypeIdx),
    /// Allocate a defaulted struct.
    StructNewDefault(TypeIdx),
    /// Allocate an array from (value, length) on top.
    ArrayNew(TypeIdx),
    /// Allocate a defaulted array from length on top.
    ArrayNewDefault(TypeIdx),
    /// Allocate an array from the top `n` values.
    ArrayNewFixed(TypeIdx, u32),
}

/// One branch hint from the metadata section.
#[derive(Debug, Clone, Copy)]
pub struct BranchHint {
    /// Byte offset of the hinted branch within the function body.
    pub offset: u32,
    /// Whether the branch is hinted taken.
    pub likely: bool,
}

/// Typed view of an exported or imported function signature, used by the
/// embedding API's introspection calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types.
    pub params: Vec<ValType>,
    /// Result types.
    pub results: Vec<ValType>,
}

impl From<&FuncType> for Signature {
    fn from(ft: &FuncType) -> Self {
        Self {
            params: ft.params.clone(),
            results: ft.results.clone(),
        }
    }
}
