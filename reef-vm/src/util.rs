//! Raw-module assembly for tests and embedders.
//!
//! [`ModuleBuilder`] emits Wasm binaries section by section, and [`Expr`]
//! assembles function bodies opcode by opcode. Nothing here validates; that
//! is the point — tests feed both well-formed and broken images to the real
//! pipeline.

/// Value type byte codes, for readability at call sites.
pub mod ty {
    /// `i32`.
    pub const I32: u8 = 0x7F;
    /// `i64`.
    pub const I64: u8 = 0x7E;
    /// `f32`.
    pub const F32: u8 = 0x7D;
    /// `f64`.
    pub const F64: u8 = 0x7C;
    /// `v128`.
    pub const V128: u8 = 0x7B;
    /// `funcref`.
    pub const FUNCREF: u8 = 0x70;
    /// `externref`.
    pub const EXTERNREF: u8 = 0x6F;
}

/// Unsigned LEB128.
pub fn leb(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// Signed LEB128.
pub fn sleb(value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// A function body under construction. Always terminated by `end` in
/// [`Expr::finish`].
#[derive(Default, Clone)]
pub struct Expr {
    bytes: Vec<u8>,
}

impl Expr {
    /// Empty body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// `i32.const`.
    pub fn i32_const(self, v: i32) -> Self {
        let mut e = self.raw(&[0x41]);
        e.bytes.extend(sleb(i64::from(v)));
        e
    }

    /// `i64.const`.
    pub fn i64_const(self, v: i64) -> Self {
        let mut e = self.raw(&[0x42]);
        e.bytes.extend(sleb(v));
        e
    }

    /// `f64.const`.
    pub fn f64_const(self, v: f64) -> Self {
        let mut e = self.raw(&[0x44]);
        e.bytes.extend(v.to_bits().to_le_bytes());
        e
    }

    /// `local.get`.
    pub fn local_get(self, i: u32) -> Self {
        let mut e = self.raw(&[0x20]);
        e.bytes.extend(leb(u64::from(i)));
        e
    }

    /// `local.set`.
    pub fn local_set(self, i: u32) -> Self {
        let mut e = self.raw(&[0x21]);
        e.bytes.extend(leb(u64::from(i)));
        e
    }

    /// `local.tee`.
    pub fn local_tee(self, i: u32) -> Self {
        let mut e = self.raw(&[0x22]);
        e.bytes.extend(leb(u64::from(i)));
        e
    }

    /// `global.get`.
    pub fn global_get(self, i: u32) -> Self {
        let mut e = self.raw(&[0x23]);
        e.bytes.extend(leb(u64::from(i)));
        e
    }

    /// `global.set`.
    pub fn global_set(self, i: u32) -> Self {
        let mut e = self.raw(&[0x24]);
        e.bytes.extend(leb(u64::from(i)));
        e
    }

    /// `call`.
    pub fn call(self, f: u32) -> Self {
        let mut e = self.raw(&[0x10]);
        e.bytes.extend(leb(u64::from(f)));
        e
    }

    /// `call_indirect` against table 0.
    pub fn call_indirect(self, type_idx: u32) -> Self {
        let mut e = self.raw(&[0x11]);
        e.bytes.extend(leb(u64::from(type_idx)));
        e.bytes.push(0x00);
        e
    }

    /// `return_call`.
    pub fn return_call(self, f: u32) -> Self {
        let mut e = self.raw(&[0x12]);
        e.bytes.extend(leb(u64::from(f)));
        e
    }

    /// `block` with an empty or single-value type.
    pub fn block(self, block_ty: Option<u8>) -> Self {
        self.raw(&[0x02, block_ty.unwrap_or(0x40)])
    }

    /// `loop` with an empty or single-value type.
    pub fn loop_(self, block_ty: Option<u8>) -> Self {
        self.raw(&[0x03, block_ty.unwrap_or(0x40)])
    }

    /// `if` with an empty or single-value type.
    pub fn if_(self, block_ty: Option<u8>) -> Self {
        self.raw(&[0x04, block_ty.unwrap_or(0x40)])
    }

    /// `else`.
    pub fn else_(self) -> Self {
        self.raw(&[0x05])
    }

    /// `end`.
    pub fn end(self) -> Self {
        self.raw(&[0x0B])
    }

    /// `br`.
    pub fn br(self, depth: u32) -> Self {
        let mut e = self.raw(&[0x0C]);
        e.bytes.extend(leb(u64::from(depth)));
        e
    }

    /// `br_if`.
    pub fn br_if(self, depth: u32) -> Self {
        let mut e = self.raw(&[0x0D]);
        e.bytes.extend(leb(u64::from(depth)));
        e
    }

    /// `return`.
    pub fn ret(self) -> Self {
        self.raw(&[0x0F])
    }

    /// `drop`.
    pub fn drop_(self) -> Self {
        self.raw(&[0x1A])
    }

    /// A plain one-byte opcode (arithmetic etc).
    pub fn op(self, byte: u8) -> Self {
        self.raw(&[byte])
    }

    /// A 0xFC-plane opcode.
    pub fn misc(self, sub: u32) -> Self {
        let mut e = self.raw(&[0xFC]);
        e.bytes.extend(leb(u64::from(sub)));
        e
    }

    /// `memory.fill` on memory 0.
    pub fn memory_fill(self) -> Self {
        self.misc(0x0B).raw(&[0x00])
    }

    /// `i32.load` with alignment and offset on memory 0.
    pub fn i32_load(self, align: u32, offset: u64) -> Self {
        let mut e = self.raw(&[0x28]);
        e.bytes.extend(leb(u64::from(align)));
        e.bytes.extend(leb(offset));
        e
    }

    /// `i32.load8_u`.
    pub fn i32_load8_u(self, offset: u64) -> Self {
        let mut e = self.raw(&[0x2D, 0x00]);
        e.bytes.extend(leb(offset));
        e
    }

    /// `i32.store`.
    pub fn i32_store(self, align: u32, offset: u64) -> Self {
        let mut e = self.raw(&[0x36]);
        e.bytes.extend(leb(u64::from(align)));
        e.bytes.extend(leb(offset));
        e
    }

    /// `i32.store8`.
    pub fn i32_store8(self, offset: u64) -> Self {
        let mut e = self.raw(&[0x3A, 0x00]);
        e.bytes.extend(leb(offset));
        e
    }

    /// `throw`.
    pub fn throw(self, tag: u32) -> Self {
        let mut e = self.raw(&[0x08]);
        e.bytes.extend(leb(u64::from(tag)));
        e
    }

    /// `try_table` with `(kind, tag, label)` clauses; kind 2/3 ignore tag.
    pub fn try_table(self, block_ty: Option<u8>, catches: &[(u8, u32, u32)]) -> Self {
        let mut e = self.raw(&[0x1F, block_ty.unwrap_or(0x40)]);
        e.bytes.extend(leb(catches.len() as u64));
        for &(kind, tag, label) in catches {
            e.bytes.push(kind);
            if kind < 2 {
                e.bytes.extend(leb(u64::from(tag)));
            }
            e.bytes.extend(leb(u64::from(label)));
        }
        e
    }

    /// Terminate with `end` and take the bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut bytes = self.bytes;
        bytes.push(0x0B);
        bytes
    }
}

#[derive(Clone)]
struct FuncDef {
    type_idx: u32,
    locals: Vec<(u32, u8)>,
    body: Vec<u8>,
}

/// A raw Wasm binary under construction.
#[derive(Default, Clone)]
pub struct ModuleBuilder {
    types: Vec<Vec<u8>>,
    imports: Vec<Vec<u8>>,
    imported_funcs: u32,
    funcs: Vec<FuncDef>,
    tables: Vec<Vec<u8>>,
    memories: Vec<Vec<u8>>,
    tags: Vec<u32>,
    globals: Vec<Vec<u8>>,
    exports: Vec<Vec<u8>>,
    start: Option<u32>,
    elems: Vec<Vec<u8>>,
    datas: Vec<Vec<u8>>,
}

impl ModuleBuilder {
    /// Start an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function type; returns its index.
    pub fn ty(&mut self, params: &[u8], results: &[u8]) -> u32 {
        let mut entry = vec![0x60];
        entry.extend(leb(params.len() as u64));
        entry.extend_from_slice(params);
        entry.extend(leb(results.len() as u64));
        entry.extend_from_slice(results);
        self.types.push(entry);
        (self.types.len() - 1) as u32
    }

    /// Add a raw type-section entry (struct/array/rec forms).
    pub fn raw_type(&mut self, entry: Vec<u8>) -> u32 {
        self.types.push(entry);
        (self.types.len() - 1) as u32
    }

    /// Import a function; returns its function index.
    pub fn import_func(&mut self, module: &str, name: &str, type_idx: u32) -> u32 {
        let mut entry = Vec::new();
        push_name(&mut entry, module);
        push_name(&mut entry, name);
        entry.push(0x00);
        entry.extend(leb(u64::from(type_idx)));
        self.imports.push(entry);
        self.imported_funcs += 1;
        self.imported_funcs - 1
    }

    /// Add a function; returns its index (after imports).
    pub fn func(&mut self, type_idx: u32, locals: &[(u32, u8)], body: Vec<u8>) -> u32 {
        self.funcs.push(FuncDef { type_idx, locals: locals.to_vec(), body });
        self.imported_funcs + (self.funcs.len() - 1) as u32
    }

    /// Add a funcref table.
    pub fn table(&mut self, min: u64, max: Option<u64>) -> u32 {
        let mut entry = vec![ty::FUNCREF];
        push_limits(&mut entry, min, max);
        self.tables.push(entry);
        (self.tables.len() - 1) as u32
    }

    /// Add a memory.
    pub fn memory(&mut self, min: u64, max: Option<u64>) -> u32 {
        let mut entry = Vec::new();
        push_limits(&mut entry, min, max);
        self.memories.push(entry);
        (self.memories.len() - 1) as u32
    }

    /// Add an exception tag of the given function type.
    pub fn tag(&mut self, type_idx: u32) -> u32 {
        self.tags.push(type_idx);
        (self.tags.len() - 1) as u32
    }

    /// Add a mutable i32 global with the given initial value.
    pub fn global_i32(&mut self, init: i32) -> u32 {
        let mut entry = vec![ty::I32, 0x01, 0x41];
        entry.extend(sleb(i64::from(init)));
        entry.push(0x0B);
        self.globals.push(entry);
        (self.globals.len() - 1) as u32
    }

    fn export(&mut self, name: &str, kind: u8, index: u32) {
        let mut entry = Vec::new();
        push_name(&mut entry, name);
        entry.push(kind);
        entry.extend(leb(u64::from(index)));
        self.exports.push(entry);
    }

    /// Export a function.
    pub fn export_func(&mut self, name: &str, index: u32) {
        self.export(name, 0x00, index);
    }

    /// Export a table.
    pub fn export_table(&mut self, name: &str, index: u32) {
        self.export(name, 0x01, index);
    }

    /// Export a memory.
    pub fn export_memory(&mut self, name: &str, index: u32) {
        self.export(name, 0x02, index);
    }

    /// Set the start function.
    pub fn start(&mut self, index: u32) {
        self.start = Some(index);
    }

    /// Active funcref element segment in table 0.
    pub fn elem_active(&mut self, offset: i32, funcs: &[u32]) {
        let mut entry = vec![0x00, 0x41];
        entry.extend(sleb(i64::from(offset)));
        entry.push(0x0B);
        entry.extend(leb(funcs.len() as u64));
        for &f in funcs {
            entry.extend(leb(u64::from(f)));
        }
        self.elems.push(entry);
    }

    /// Active data segment in memory 0.
    pub fn data_active(&mut self, offset: i32, bytes: &[u8]) {
        let mut entry = vec![0x00, 0x41];
        entry.extend(sleb(i64::from(offset)));
        entry.push(0x0B);
        entry.extend(leb(bytes.len() as u64));
        entry.extend_from_slice(bytes);
        self.datas.push(entry);
    }

    /// Emit the binary.
    pub fn build(&self) -> Vec<u8> {
        let mut out = b"\0asm\x01\0\0\0".to_vec();

        push_section(&mut out, 1, &self.types);
        push_section(&mut out, 2, &self.imports);
        if !self.funcs.is_empty() {
            let entries: Vec<Vec<u8>> =
                self.funcs.iter().map(|f| leb(u64::from(f.type_idx))).collect();
            push_section(&mut out, 3, &entries);
        }
        push_section(&mut out, 4, &self.tables);
        push_section(&mut out, 5, &self.memories);
        if !self.tags.is_empty() {
            let entries: Vec<Vec<u8>> = self
                .tags
                .iter()
                .map(|&t| {
                    let mut e = vec![0x00];
                    e.extend(leb(u64::from(t)));
                    e
                })
                .collect();
            push_section(&mut out, 13, &entries);
        }
        push_section(&mut out, 6, &self.globals);
        push_section(&mut out, 7, &self.exports);
        if let Some(start) = self.start {
            let payload = leb(u64::from(start));
            out.push(8);
            out.extend(leb(payload.len() as u64));
            out.extend(payload);
        }
        push_section(&mut out, 9, &self.elems);
        if !self.funcs.is_empty() {
            let entries: Vec<Vec<u8>> = self
                .funcs
                .iter()
                .map(|f| {
                    let mut body = Vec::new();
                    body.extend(leb(f.locals.len() as u64));
                    for &(count, val_ty) in &f.locals {
                        body.extend(leb(u64::from(count)));
                        body.push(val_ty);
                    }
                    body.extend_from_slice(&f.body);
                    let mut entry = leb(body.len() as u64);
                    entry.extend(body);
                    entry
                })
                .collect();
            push_section(&mut out, 10, &entries);
        }
        push_section(&mut out, 11, &self.datas);
        out
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.extend(leb(name.len() as u64));
    out.extend_from_slice(name.as_bytes());
}

fn push_limits(out: &mut Vec<u8>, min: u64, max: Option<u64>) {
    match max {
        Some(max) => {
            out.push(0x01);
            out.extend(leb(min));
            out.extend(leb(max));
        }
        None => {
            out.push(0x00);
            out.extend(leb(min));
        }
    }
}

fn push_section(out: &mut Vec<u8>, id: u8, entries: &[Vec<u8>]) {
    if entries.is_empty() {
        return;
    }
    let mut payload = leb(entries.len() as u64);
    for entry in entries {
        payload.extend_from_slice(entry);
    }
    out.push(id);
    out.extend(leb(payload.len() as u64));
    out.extend(payload);
}
