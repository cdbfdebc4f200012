//! Function-body validation: the abstract operand-stack type simulator.
//!
//! The simulator mirrors the spec's validation algorithm: a value stack of
//! types, a control stack of frames, explicit polymorphic-stack tracking
//! after `unreachable`/`br`/`return`, and per-local initialization bits for
//! non-defaultable locals.

use reef_asm::{BlockTypeRepr, Op, Plane};
use reef_types::{HeapType, RefType, ValType};

use crate::decode::{Catch, Imm, InstrReader};
use crate::error::VmError;
use crate::module::{CompositeType, FieldType, FuncDef, FuncType, StorageType};

use super::ModuleContext;

const ERR_UNDERFLOW: VmError = VmError::InvalidWasm("operand stack underflow");
const ERR_TYPE: VmError = VmError::InvalidWasm("operand type mismatch");

/// One control frame.
struct CtrlFrame {
    op: Op,
    start: Vec<ValType>,
    end: Vec<ValType>,
    height: usize,
    init_height: usize,
    unreachable: bool,
}

impl CtrlFrame {
    fn label_types(&self) -> &[ValType] {
        if self.op == Op::Loop {
            &self.start
        } else {
            &self.end
        }
    }
}

/// Validator for one function body.
pub struct FuncValidator<'a> {
    cx: &'a ModuleContext<'a>,
    reader: InstrReader<'a>,
    locals: Vec<ValType>,
    local_init: Vec<bool>,
    init_log: Vec<u32>,
    stack: Vec<ValType>,
    ctrls: Vec<CtrlFrame>,
}

impl<'a> FuncValidator<'a> {
    /// Prepare validation of one function definition.
    pub fn new(cx: &'a ModuleContext<'a>, def: &'a FuncDef) -> Result<Self, VmError> {
        let ty = cx.func_type(def.type_idx)?;
        let mut locals = Vec::new();
        let mut local_init = Vec::new();
        for &param in &ty.params {
            locals.push(cx.canon_val(param)?);
            local_init.push(true);
        }
        for &(n, raw) in &def.locals {
            let canon = cx.canon_val(raw)?;
            for _ in 0..n {
                locals.push(canon);
                local_init.push(canon.is_defaultable());
            }
        }
        let results: Vec<ValType> = ty
            .results
            .iter()
            .map(|&t| cx.canon_val(t))
            .collect::<Result<_, _>>()?;

        let reader = InstrReader::new(&cx.module.bytes, def.body.clone())?;
        let mut v = Self {
            cx,
            reader,
            locals,
            local_init,
            init_log: Vec::new(),
            stack: Vec::new(),
            ctrls: Vec::new(),
        };
        v.ctrls.push(CtrlFrame {
            op: Op::Block,
            start: Vec::new(),
            end: results,
            height: 0,
            init_height: 0,
            unreachable: false,
        });
        Ok(v)
    }

    /// Validate the whole body.
    pub fn run(mut self) -> Result<(), VmError> {
        while !self.ctrls.is_empty() {
            if self.reader.done() {
                return Err(VmError::InvalidWasm("function body ended inside a block"));
            }
            let (op, imm) = self.reader.next()?;
            self.instr(op, imm)?;
            if self.ctrls.len() > crate::consts::MAX_BLOCK_DEPTH {
                return Err(VmError::InvalidWasm("block nesting too deep"));
            }
        }
        if !self.reader.done() {
            return Err(VmError::InvalidWasm("trailing bytes in function body"));
        }
        Ok(())
    }

    // Value-stack primitives.

    fn push(&mut self, ty: ValType) {
        self.stack.push(ty);
    }

    fn push_all(&mut self, types: &[ValType]) {
        self.stack.extend_from_slice(types);
    }

    /// Pop any value; `None` stands for the polymorphic bottom.
    fn pop_any(&mut self) -> Result<Option<ValType>, VmError> {
        let frame = self.ctrls.last().ok_or(ERR_UNDERFLOW)?;
        if self.stack.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(ERR_UNDERFLOW);
        }
        Ok(self.stack.pop())
    }

    fn pop_expect(&mut self, want: ValType) -> Result<(), VmError> {
        match self.pop_any()? {
            None => Ok(()),
            Some(got) if self.cx.is_subtype_val(got, want) => Ok(()),
            Some(_) => Err(ERR_TYPE),
        }
    }

    /// Pop a reference belonging to the hierarchy of `top`; returns the
    /// popped type (bottom maps to the hierarchy's null type).
    fn pop_ref_of(&mut self, top: HeapType) -> Result<RefType, VmError> {
        match self.pop_any()? {
            None => Ok(RefType { nullable: true, heap: self.cx.bottom_of(top) }),
            Some(ValType::Ref(rt))
                if self.cx.is_subtype_heap(rt.heap, top) =>
            {
                Ok(rt)
            }
            Some(_) => Err(ERR_TYPE),
        }
    }

    fn pop_all(&mut self, types: &[ValType]) -> Result<(), VmError> {
        for &ty in types.iter().rev() {
            self.pop_expect(ty)?;
        }
        Ok(())
    }

    // Control-stack primitives.

    fn push_ctrl(&mut self, op: Op, start: Vec<ValType>, end: Vec<ValType>) {
        let height = self.stack.len();
        let init_height = self.init_log.len();
        self.stack.extend_from_slice(&start);
        self.ctrls.push(CtrlFrame {
            op,
            start,
            end,
            height,
            init_height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<CtrlFrame, VmError> {
        let end = self.ctrls.last().ok_or(ERR_UNDERFLOW)?.end.clone();
        self.pop_all(&end)?;
        let frame = self.ctrls.pop().ok_or(ERR_UNDERFLOW)?;
        if self.stack.len() != frame.height {
            return Err(VmError::InvalidWasm("values left on block exit"));
        }
        // Locals initialized inside the block lose their init status.
        while self.init_log.len() > frame.init_height {
            let local = self.init_log.pop().unwrap_or_default();
            self.local_init[local as usize] = false;
        }
        Ok(frame)
    }

    fn set_unreachable(&mut self) -> Result<(), VmError> {
        let frame = self.ctrls.last_mut().ok_or(ERR_UNDERFLOW)?;
        self.stack.truncate(frame.height);
        frame.unreachable = true;
        Ok(())
    }

    fn label(&self, depth: u32) -> Result<&CtrlFrame, VmError> {
        self.ctrls
            .len()
            .checked_sub(1 + depth as usize)
            .and_then(|i| self.ctrls.get(i))
            .ok_or(VmError::InvalidWasm("branch label out of range"))
    }

    fn block_sig(&self, repr: BlockTypeRepr) -> Result<(Vec<ValType>, Vec<ValType>), VmError> {
        Ok(match repr {
            BlockTypeRepr::Empty => (Vec::new(), Vec::new()),
            BlockTypeRepr::Val(ty) => (Vec::new(), vec![self.cx.canon_val(ty)?]),
            BlockTypeRepr::Func(idx) => {
                let ft = self.cx.func_type(idx)?;
                let params = ft
                    .params
                    .iter()
                    .map(|&t| self.cx.canon_val(t))
                    .collect::<Result<_, _>>()?;
                let results = ft
                    .results
                    .iter()
                    .map(|&t| self.cx.canon_val(t))
                    .collect::<Result<_, _>>()?;
                (params, results)
            }
        })
    }

    fn func_sig(&self, type_idx: u32) -> Result<(Vec<ValType>, Vec<ValType>), VmError> {
        self.block_sig(BlockTypeRepr::Func(type_idx))
    }

    // Shared helpers for memory-shaped instructions.

    fn memory_index_type(&self, mem: u32) -> Result<ValType, VmError> {
        let ty = self
            .cx
            .memories
            .get(mem as usize)
            .ok_or(VmError::InvalidWasm("memory index out of range"))?;
        Ok(ty.width.index_type())
    }

    fn check_align(&self, align: u32, natural: u32, exact: bool) -> Result<(), VmError> {
        if exact {
            if align != natural {
                return Err(VmError::InvalidWasm("atomic alignment must be natural"));
            }
        } else if align > natural {
            return Err(VmError::InvalidWasm("alignment exceeds access size"));
        }
        Ok(())
    }

    fn load_op(
        &mut self,
        imm: &Imm,
        result: ValType,
        natural: u32,
        exact_align: bool,
    ) -> Result<(), VmError> {
        let Imm::Mem { align, mem, .. } = *imm else { return Err(ERR_TYPE) };
        self.check_align(align, natural, exact_align)?;
        let index = self.memory_index_type(mem)?;
        self.pop_expect(index)?;
        self.push(result);
        Ok(())
    }

    fn store_op(
        &mut self,
        imm: &Imm,
        value: ValType,
        natural: u32,
        exact_align: bool,
    ) -> Result<(), VmError> {
        let Imm::Mem { align, mem, .. } = *imm else { return Err(ERR_TYPE) };
        self.check_align(align, natural, exact_align)?;
        let index = self.memory_index_type(mem)?;
        self.pop_expect(value)?;
        self.pop_expect(index)?;
        Ok(())
    }

    fn binop(&mut self, ty: ValType) -> Result<(), VmError> {
        self.pop_expect(ty)?;
        self.pop_expect(ty)?;
        self.push(ty);
        Ok(())
    }

    fn relop(&mut self, ty: ValType) -> Result<(), VmError> {
        self.pop_expect(ty)?;
        self.pop_expect(ty)?;
        self.push(ValType::I32);
        Ok(())
    }

    fn unop(&mut self, ty: ValType) -> Result<(), VmError> {
        self.pop_expect(ty)?;
        self.push(ty);
        Ok(())
    }

    fn cvt(&mut self, from: ValType, to: ValType) -> Result<(), VmError> {
        self.pop_expect(from)?;
        self.push(to);
        Ok(())
    }

    fn struct_field(
        &self,
        ty: u32,
        field: u32,
    ) -> Result<(reef_types::TypeId, FieldType), VmError> {
        if ty as usize >= self.cx.module.type_count() {
            return Err(VmError::InvalidWasm("type index out of range"));
        }
        let id = self.cx.module.global_type_id(ty);
        let CompositeType::Struct(st) = &self.cx.registry.get(id).composite else {
            return Err(VmError::InvalidWasm("struct access on non-struct type"));
        };
        let field = st
            .fields
            .get(field as usize)
            .ok_or(VmError::InvalidWasm("struct field out of range"))?;
        Ok((id, *field))
    }

    fn array_elem(&self, ty: u32) -> Result<(reef_types::TypeId, FieldType), VmError> {
        if ty as usize >= self.cx.module.type_count() {
            return Err(VmError::InvalidWasm("type index out of range"));
        }
        let id = self.cx.module.global_type_id(ty);
        let CompositeType::Array(at) = &self.cx.registry.get(id).composite else {
            return Err(VmError::InvalidWasm("array access on non-array type"));
        };
        Ok((id, at.elem))
    }

    fn concrete(&self, id: reef_types::TypeId) -> ValType {
        ValType::Ref(RefType { nullable: false, heap: HeapType::Concrete(id.0) })
    }

    // The dispatcher.

    fn instr(&mut self, op: Op, imm: Imm) -> Result<(), VmError> {
        use Op::*;
        use ValType::{F32, F64, I32, I64, V128};

        match op.plane() {
            Plane::Simd => return self.simd(op, &imm),
            Plane::Atomic => return self.atomic(op, &imm),
            _ => {}
        }

        match op {
            Unreachable => self.set_unreachable()?,
            Nop => {}

            Block | Loop => {
                let Imm::Block(repr) = imm else { return Err(ERR_TYPE) };
                let (params, results) = self.block_sig(repr)?;
                self.pop_all(&params)?;
                self.push_ctrl(op, params, results);
            }
            If => {
                let Imm::Block(repr) = imm else { return Err(ERR_TYPE) };
                let (params, results) = self.block_sig(repr)?;
                self.pop_expect(I32)?;
                self.pop_all(&params)?;
                self.push_ctrl(op, params, results);
            }
            Else => {
                let frame = self.pop_ctrl()?;
                if frame.op != If {
                    return Err(VmError::InvalidWasm("else outside if"));
                }
                self.push_ctrl(Else, frame.start, frame.end);
            }
            End => {
                let frame = self.pop_ctrl()?;
                if frame.op == If && frame.start != frame.end {
                    return Err(VmError::InvalidWasm(
                        "if without else must not change types",
                    ));
                }
                if !self.ctrls.is_empty() {
                    self.push_all(&frame.end.clone());
                }
            }
            TryTable => {
                let Imm::TryTable { block, catches } = imm else { return Err(ERR_TYPE) };
                let (params, results) = self.block_sig(block)?;
                for catch in &catches {
                    self.check_catch(catch)?;
                }
                self.pop_all(&params)?;
                self.push_ctrl(TryTable, params, results);
            }
            Throw => {
                let Imm::U32(tag) = imm else { return Err(ERR_TYPE) };
                let ty = *self
                    .cx
                    .tags
                    .get(tag as usize)
                    .ok_or(VmError::InvalidWasm("tag index out of range"))?;
                let (params, _) = self.func_sig(ty)?;
                self.pop_all(&params)?;
                self.set_unreachable()?;
            }
            ThrowRef => {
                self.pop_expect(ValType::EXNREF)?;
                self.set_unreachable()?;
            }

            Br => {
                let Imm::U32(depth) = imm else { return Err(ERR_TYPE) };
                let types = self.label(depth)?.label_types().to_vec();
                self.pop_all(&types)?;
                self.set_unreachable()?;
            }
            BrIf => {
                let Imm::U32(depth) = imm else { return Err(ERR_TYPE) };
                self.pop_expect(I32)?;
                let types = self.label(depth)?.label_types().to_vec();
                self.pop_all(&types)?;
                self.push_all(&types);
            }
            BrTable => {
                let Imm::BrTable { targets, default } = imm else { return Err(ERR_TYPE) };
                self.pop_expect(I32)?;
                let default_types = self.label(default)?.label_types().to_vec();
                for &target in &targets {
                    let types = self.label(target)?.label_types().to_vec();
                    if types.len() != default_types.len() {
                        return Err(VmError::InvalidWasm("br_table arity mismatch"));
                    }
                    self.pop_all(&types)?;
                    self.push_all(&types);
                }
                self.pop_all(&default_types)?;
                self.set_unreachable()?;
            }
            BrOnNull => {
                let Imm::U32(depth) = imm else { return Err(ERR_TYPE) };
                let rt = self.pop_ref_any()?;
                let types = self.label(depth)?.label_types().to_vec();
                self.pop_all(&types)?;
                self.push_all(&types);
                self.push(ValType::Ref(rt.as_non_null()));
            }
            BrOnNonNull => {
                let Imm::U32(depth) = imm else { return Err(ERR_TYPE) };
                let rt = match self.pop_any()? {
                    None => RefType { nullable: true, heap: HeapType::None },
                    Some(ValType::Ref(rt)) => rt,
                    Some(_) => return Err(ERR_TYPE),
                };
                let mut types = self.label(depth)?.label_types().to_vec();
                let Some(last) = types.pop() else {
                    return Err(VmError::InvalidWasm("br_on_non_null label needs a ref"));
                };
                if !self
                    .cx
                    .is_subtype_val(ValType::Ref(rt.as_non_null()), last)
                {
                    return Err(ERR_TYPE);
                }
                self.pop_all(&types)?;
                self.push_all(&types);
            }
            Return => {
                let results = self.ctrls[0].end.clone();
                self.pop_all(&results)?;
                self.set_unreachable()?;
            }

            Call | ReturnCall => {
                let Imm::U32(func) = imm else { return Err(ERR_TYPE) };
                let ty = *self
                    .cx
                    .funcs
                    .get(func as usize)
                    .ok_or(VmError::InvalidWasm("call target out of range"))?;
                self.do_call(ty, op == ReturnCall)?;
            }
            CallIndirect | ReturnCallIndirect => {
                let Imm::U32x2(ty, table) = imm else { return Err(ERR_TYPE) };
                let table_ty = self
                    .cx
                    .tables
                    .get(table as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                if !self.cx.is_subtype_heap(
                    self.cx.canon_heap(table_ty.elem.heap)?,
                    HeapType::Func,
                ) {
                    return Err(VmError::InvalidWasm("call_indirect on non-func table"));
                }
                self.pop_expect(table_ty.width.index_type())?;
                self.cx.func_type(ty)?;
                self.do_call(ty, op == ReturnCallIndirect)?;
            }
            CallRef | ReturnCallRef => {
                let Imm::U32(ty) = imm else { return Err(ERR_TYPE) };
                self.cx.func_type(ty)?;
                let id = self.cx.module.global_type_id(ty);
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(id.0),
                }))?;
                self.do_call(ty, op == ReturnCallRef)?;
            }

            Drop => {
                self.pop_any()?;
            }
            Select => {
                self.pop_expect(I32)?;
                let a = self.pop_any()?;
                let b = self.pop_any()?;
                let ty = match (a, b) {
                    (None, None) => None,
                    (Some(t), None) | (None, Some(t)) => Some(t),
                    (Some(a), Some(b)) => {
                        if a.is_ref() || b.is_ref() || a != b {
                            return Err(VmError::InvalidWasm(
                                "untyped select needs matching numeric operands",
                            ));
                        }
                        Some(a)
                    }
                };
                if let Some(ty) = ty {
                    self.push(ty);
                } else {
                    // Both operands were polymorphic; so is the result. The
                    // surrounding frame is unreachable, so pushing nothing
                    // is observationally equivalent.
                }
            }
            SelectT => {
                let Imm::SelectT(types) = imm else { return Err(ERR_TYPE) };
                let ty = self.cx.canon_val(types[0])?;
                self.pop_expect(I32)?;
                self.pop_expect(ty)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }

            LocalGet => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let ty = *self
                    .locals
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("local index out of range"))?;
                if !self.local_init[idx as usize] {
                    return Err(VmError::InvalidWasm("read of uninitialized local"));
                }
                self.push(ty);
            }
            LocalSet | LocalTee => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let ty = *self
                    .locals
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("local index out of range"))?;
                self.pop_expect(ty)?;
                if !self.local_init[idx as usize] {
                    self.local_init[idx as usize] = true;
                    self.init_log.push(idx);
                }
                if op == LocalTee {
                    self.push(ty);
                }
            }
            GlobalGet => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let (ty, _) = *self
                    .cx
                    .globals
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("global index out of range"))?;
                self.push(self.cx.canon_val(ty.val)?);
            }
            GlobalSet => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let (ty, _) = *self
                    .cx
                    .globals
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("global index out of range"))?;
                if !ty.mutable {
                    return Err(VmError::InvalidWasm("global.set of immutable global"));
                }
                self.pop_expect(self.cx.canon_val(ty.val)?)?;
            }

            TableGet | TableSet => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let table = *self
                    .cx
                    .tables
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                let elem = self.cx.canon_val(ValType::Ref(table.elem))?;
                if op == TableGet {
                    self.pop_expect(table.width.index_type())?;
                    self.push(elem);
                } else {
                    self.pop_expect(elem)?;
                    self.pop_expect(table.width.index_type())?;
                }
            }

            I32Load => self.load_op(&imm, I32, 2, false)?,
            I64Load => self.load_op(&imm, I64, 3, false)?,
            F32Load => self.load_op(&imm, F32, 2, false)?,
            F64Load => self.load_op(&imm, F64, 3, false)?,
            I32Load8S | I32Load8U => self.load_op(&imm, I32, 0, false)?,
            I32Load16S | I32Load16U => self.load_op(&imm, I32, 1, false)?,
            I64Load8S | I64Load8U => self.load_op(&imm, I64, 0, false)?,
            I64Load16S | I64Load16U => self.load_op(&imm, I64, 1, false)?,
            I64Load32S | I64Load32U => self.load_op(&imm, I64, 2, false)?,
            I32Store => self.store_op(&imm, I32, 2, false)?,
            I64Store => self.store_op(&imm, I64, 3, false)?,
            F32Store => self.store_op(&imm, F32, 2, false)?,
            F64Store => self.store_op(&imm, F64, 3, false)?,
            I32Store8 => self.store_op(&imm, I32, 0, false)?,
            I32Store16 => self.store_op(&imm, I32, 1, false)?,
            I64Store8 => self.store_op(&imm, I64, 0, false)?,
            I64Store16 => self.store_op(&imm, I64, 1, false)?,
            I64Store32 => self.store_op(&imm, I64, 2, false)?,

            MemorySize => {
                let Imm::U32(mem) = imm else { return Err(ERR_TYPE) };
                let index = self.memory_index_type(mem)?;
                self.push(index);
            }
            MemoryGrow => {
                let Imm::U32(mem) = imm else { return Err(ERR_TYPE) };
                let index = self.memory_index_type(mem)?;
                self.pop_expect(index)?;
                self.push(index);
            }
            MemoryInit => {
                let Imm::U32x2(data, mem) = imm else { return Err(ERR_TYPE) };
                self.require_data_count(data)?;
                let index = self.memory_index_type(mem)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(index)?;
            }
            DataDrop => {
                let Imm::U32(data) = imm else { return Err(ERR_TYPE) };
                self.require_data_count(data)?;
            }
            MemoryCopy => {
                let Imm::U32x2(dst, src) = imm else { return Err(ERR_TYPE) };
                let dst_index = self.memory_index_type(dst)?;
                let src_index = self.memory_index_type(src)?;
                // The length is the narrower of the two index types.
                let len = if dst_index == I64 && src_index == I64 { I64 } else { I32 };
                self.pop_expect(len)?;
                self.pop_expect(src_index)?;
                self.pop_expect(dst_index)?;
            }
            MemoryFill => {
                let Imm::U32(mem) = imm else { return Err(ERR_TYPE) };
                let index = self.memory_index_type(mem)?;
                self.pop_expect(index)?;
                self.pop_expect(I32)?;
                self.pop_expect(index)?;
            }

            TableInit => {
                let Imm::U32x2(elem, table) = imm else { return Err(ERR_TYPE) };
                let table_ty = *self
                    .cx
                    .tables
                    .get(table as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                let seg = self
                    .cx
                    .module
                    .elems
                    .get(elem as usize)
                    .ok_or(VmError::InvalidWasm("element segment out of range"))?;
                let seg_ty = self.cx.canon_val(ValType::Ref(seg.ty))?;
                let dst_ty = self.cx.canon_val(ValType::Ref(table_ty.elem))?;
                if !self.cx.is_subtype_val(seg_ty, dst_ty) {
                    return Err(VmError::InvalidWasm("table.init type mismatch"));
                }
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(table_ty.width.index_type())?;
            }
            ElemDrop => {
                let Imm::U32(elem) = imm else { return Err(ERR_TYPE) };
                if elem as usize >= self.cx.module.elems.len() {
                    return Err(VmError::InvalidWasm("element segment out of range"));
                }
            }
            TableCopy => {
                let Imm::U32x2(dst, src) = imm else { return Err(ERR_TYPE) };
                let dst_ty = *self
                    .cx
                    .tables
                    .get(dst as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                let src_ty = *self
                    .cx
                    .tables
                    .get(src as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                let src_elem = self.cx.canon_val(ValType::Ref(src_ty.elem))?;
                let dst_elem = self.cx.canon_val(ValType::Ref(dst_ty.elem))?;
                if !self.cx.is_subtype_val(src_elem, dst_elem) {
                    return Err(VmError::InvalidWasm("table.copy type mismatch"));
                }
                let len = if dst_ty.width.is_64() && src_ty.width.is_64() { I64 } else { I32 };
                self.pop_expect(len)?;
                self.pop_expect(src_ty.width.index_type())?;
                self.pop_expect(dst_ty.width.index_type())?;
            }
            TableGrow => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let table = *self
                    .cx
                    .tables
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                self.pop_expect(table.width.index_type())?;
                self.pop_expect(self.cx.canon_val(ValType::Ref(table.elem))?)?;
                self.push(table.width.index_type());
            }
            TableSize => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let table = *self
                    .cx
                    .tables
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                self.push(table.width.index_type());
            }
            TableFill => {
                let Imm::U32(idx) = imm else { return Err(ERR_TYPE) };
                let table = *self
                    .cx
                    .tables
                    .get(idx as usize)
                    .ok_or(VmError::InvalidWasm("table index out of range"))?;
                self.pop_expect(table.width.index_type())?;
                self.pop_expect(self.cx.canon_val(ValType::Ref(table.elem))?)?;
                self.pop_expect(table.width.index_type())?;
            }

            I32Const => self.push(I32),
            I64Const => self.push(I64),
            F32Const => self.push(F32),
            F64Const => self.push(F64),

            I32Eqz => self.cvt(I32, I32)?,
            I64Eqz => self.cvt(I64, I32)?,
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU
            | I32GeS | I32GeU => self.relop(I32)?,
            I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU
            | I64GeS | I64GeU => self.relop(I64)?,
            F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => self.relop(F32)?,
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => self.relop(F64)?,

            I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S => self.unop(I32)?,
            I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S
            | I64Extend32S => self.unop(I64)?,
            I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU
            | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl
            | I32Rotr => self.binop(I32)?,
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU
            | I64And | I64Or | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl
            | I64Rotr => self.binop(I64)?,
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest
            | F32Sqrt => self.unop(F32)?,
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest
            | F64Sqrt => self.unop(F64)?,
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
                self.binop(F32)?
            }
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
                self.binop(F64)?
            }

            I32WrapI64 => self.cvt(I64, I32)?,
            I32TruncF32S | I32TruncF32U | I32TruncSatF32S | I32TruncSatF32U => {
                self.cvt(F32, I32)?
            }
            I32TruncF64S | I32TruncF64U | I32TruncSatF64S | I32TruncSatF64U => {
                self.cvt(F64, I32)?
            }
            I64ExtendI32S | I64ExtendI32U => self.cvt(I32, I64)?,
            I64TruncF32S | I64TruncF32U | I64TruncSatF32S | I64TruncSatF32U => {
                self.cvt(F32, I64)?
            }
            I64TruncF64S | I64TruncF64U | I64TruncSatF64S | I64TruncSatF64U => {
                self.cvt(F64, I64)?
            }
            F32ConvertI32S | F32ConvertI32U => self.cvt(I32, F32)?,
            F32ConvertI64S | F32ConvertI64U => self.cvt(I64, F32)?,
            F32DemoteF64 => self.cvt(F64, F32)?,
            F64ConvertI32S | F64ConvertI32U => self.cvt(I32, F64)?,
            F64ConvertI64S | F64ConvertI64U => self.cvt(I64, F64)?,
            F64PromoteF32 => self.cvt(F32, F64)?,
            I32ReinterpretF32 => self.cvt(F32, I32)?,
            I64ReinterpretF64 => self.cvt(F64, I64)?,
            F32ReinterpretI32 => self.cvt(I32, F32)?,
            F64ReinterpretI64 => self.cvt(I64, F64)?,

            I64Add128 | I64Sub128 => {
                self.pop_expect(I64)?;
                self.pop_expect(I64)?;
                self.pop_expect(I64)?;
                self.pop_expect(I64)?;
                self.push(I64);
                self.push(I64);
            }
            I64MulWideS | I64MulWideU => {
                self.pop_expect(I64)?;
                self.pop_expect(I64)?;
                self.push(I64);
                self.push(I64);
            }

            RefNull => {
                let Imm::Heap(heap) = imm else { return Err(ERR_TYPE) };
                let heap = self.cx.canon_heap(heap)?;
                self.push(ValType::Ref(RefType { nullable: true, heap }));
            }
            RefIsNull => {
                let _ = self.pop_ref_any()?;
                self.push(I32);
            }
            RefFunc => {
                let Imm::U32(func) = imm else { return Err(ERR_TYPE) };
                let ty = *self
                    .cx
                    .funcs
                    .get(func as usize)
                    .ok_or(VmError::InvalidWasm("ref.func out of range"))?;
                if !self.cx.declared_funcs.get(func as usize).copied().unwrap_or(false) {
                    return Err(VmError::InvalidWasm("undeclared function reference"));
                }
                let id = self.cx.module.global_type_id(ty);
                self.push(self.concrete(id));
            }
            RefEq => {
                self.pop_ref_of(HeapType::Eq)?;
                self.pop_ref_of(HeapType::Eq)?;
                self.push(I32);
            }
            RefAsNonNull => {
                let rt = self.pop_ref_any()?;
                self.push(ValType::Ref(rt.as_non_null()));
            }
            _ => return self.gc(op, &imm),
        }
        Ok(())
    }

    /// Pop a reference of any hierarchy.
    fn pop_ref_any(&mut self) -> Result<RefType, VmError> {
        match self.pop_any()? {
            None => Ok(RefType { nullable: true, heap: HeapType::None }),
            Some(ValType::Ref(rt)) => Ok(rt),
            Some(_) => Err(ERR_TYPE),
        }
    }

    fn do_call(&mut self, type_idx: u32, tail: bool) -> Result<(), VmError> {
        let (params, results) = self.func_sig(type_idx)?;
        self.pop_all(&params)?;
        if tail {
            let own = self.ctrls[0].end.clone();
            if own.len() != results.len()
                || !own
                    .iter()
                    .zip(&results)
                    .all(|(&o, &r)| self.cx.is_subtype_val(r, o))
            {
                return Err(VmError::InvalidWasm("tail-call result type mismatch"));
            }
            self.set_unreachable()?;
        } else {
            self.push_all(&results);
        }
        Ok(())
    }

    fn require_data_count(&self, index: u32) -> Result<(), VmError> {
        let count = self
            .cx
            .module
            .data_count
            .ok_or(VmError::InvalidWasm("data operations need a data count section"))?;
        if index >= count {
            return Err(VmError::InvalidWasm("data segment out of range"));
        }
        Ok(())
    }

    fn check_catch(&self, catch: &Catch) -> Result<(), VmError> {
        let (tag, label, with_ref) = match *catch {
            Catch::One { tag, label } => (Some(tag), label, false),
            Catch::OneRef { tag, label } => (Some(tag), label, true),
            Catch::All { label } => (None, label, false),
            Catch::AllRef { label } => (None, label, true),
        };
        let mut expected: Vec<ValType> = match tag {
            Some(tag) => {
                let ty = *self
                    .cx
                    .tags
                    .get(tag as usize)
                    .ok_or(VmError::InvalidWasm("tag index out of range"))?;
                let (params, _) = self.func_sig(ty)?;
                params
            }
            None => Vec::new(),
        };
        if with_ref {
            expected.push(ValType::EXNREF);
        }
        let label_types = self.label(label)?.label_types();
        if label_types.len() != expected.len()
            || !expected
                .iter()
                .zip(label_types)
                .all(|(&have, &want)| self.cx.is_subtype_val(have, want))
        {
            return Err(VmError::InvalidWasm("catch label type mismatch"));
        }
        Ok(())
    }
}

// Vector, atomic, and GC planes, grouped by operand shape.
impl FuncValidator<'_> {
    fn simd(&mut self, op: Op, imm: &Imm) -> Result<(), VmError> {
        use Op::*;
        use ValType::{F32, F64, I32, I64, V128};

        // (lane count, natural alignment) helpers per shape group.
        match op {
            V128Load | V128Store => self.vec_mem(op, imm, 4),
            V128Load8x8S | V128Load8x8U | V128Load16x4S | V128Load16x4U
            | V128Load32x2S | V128Load32x2U | V128Load64Splat | V128Load64Zero => {
                self.vec_mem(op, imm, 3)
            }
            V128Load8Splat => self.vec_mem(op, imm, 0),
            V128Load16Splat => self.vec_mem(op, imm, 1),
            V128Load32Splat | V128Load32Zero => self.vec_mem(op, imm, 2),

            V128Load8Lane | V128Store8Lane => self.vec_mem_lane(op, imm, 0, 16),
            V128Load16Lane | V128Store16Lane => self.vec_mem_lane(op, imm, 1, 8),
            V128Load32Lane | V128Store32Lane => self.vec_mem_lane(op, imm, 2, 4),
            V128Load64Lane | V128Store64Lane => self.vec_mem_lane(op, imm, 3, 2),

            V128Const => {
                self.push(V128);
                Ok(())
            }
            I8x16Shuffle => {
                let Imm::Bytes16(lanes) = imm else { return Err(ERR_TYPE) };
                if lanes.iter().any(|&l| l >= 32) {
                    return Err(VmError::InvalidWasm("shuffle lane out of range"));
                }
                self.pop_expect(V128)?;
                self.pop_expect(V128)?;
                self.push(V128);
                Ok(())
            }

            I8x16Splat | I16x8Splat | I32x4Splat => self.cvt(I32, V128),
            I64x2Splat => self.cvt(I64, V128),
            F32x4Splat => self.cvt(F32, V128),
            F64x2Splat => self.cvt(F64, V128),

            I8x16ExtractLaneS | I8x16ExtractLaneU => self.vec_extract(imm, 16, I32),
            I16x8ExtractLaneS | I16x8ExtractLaneU => self.vec_extract(imm, 8, I32),
            I32x4ExtractLane => self.vec_extract(imm, 4, I32),
            I64x2ExtractLane => self.vec_extract(imm, 2, I64),
            F32x4ExtractLane => self.vec_extract(imm, 4, F32),
            F64x2ExtractLane => self.vec_extract(imm, 2, F64),

            I8x16ReplaceLane => self.vec_replace(imm, 16, I32),
            I16x8ReplaceLane => self.vec_replace(imm, 8, I32),
            I32x4ReplaceLane => self.vec_replace(imm, 4, I32),
            I64x2ReplaceLane => self.vec_replace(imm, 2, I64),
            F32x4ReplaceLane => self.vec_replace(imm, 4, F32),
            F64x2ReplaceLane => self.vec_replace(imm, 2, F64),

            V128AnyTrue | I8x16AllTrue | I8x16Bitmask | I16x8AllTrue | I16x8Bitmask
            | I32x4AllTrue | I32x4Bitmask | I64x2AllTrue | I64x2Bitmask => {
                self.cvt(V128, I32)
            }

            I8x16Shl | I8x16ShrS | I8x16ShrU | I16x8Shl | I16x8ShrS | I16x8ShrU
            | I32x4Shl | I32x4ShrS | I32x4ShrU | I64x2Shl | I64x2ShrS | I64x2ShrU => {
                self.pop_expect(I32)?;
                self.pop_expect(V128)?;
                self.push(V128);
                Ok(())
            }

            V128Bitselect => {
                self.pop_expect(V128)?;
                self.pop_expect(V128)?;
                self.pop_expect(V128)?;
                self.push(V128);
                Ok(())
            }

            V128Not | I8x16Abs | I8x16Neg | I8x16Popcnt | I16x8Abs | I16x8Neg
            | I32x4Abs | I32x4Neg | I64x2Abs | I64x2Neg | F32x4Abs | F32x4Neg
            | F32x4Sqrt | F32x4Ceil | F32x4Floor | F32x4Trunc | F32x4Nearest
            | F64x2Abs | F64x2Neg | F64x2Sqrt | F64x2Ceil | F64x2Floor
            | F64x2Trunc | F64x2Nearest | I16x8ExtAddPairwiseI8x16S
            | I16x8ExtAddPairwiseI8x16U | I32x4ExtAddPairwiseI16x8S
            | I32x4ExtAddPairwiseI16x8U | I16x8ExtendLowI8x16S
            | I16x8ExtendHighI8x16S | I16x8ExtendLowI8x16U | I16x8ExtendHighI8x16U
            | I32x4ExtendLowI16x8S | I32x4ExtendHighI16x8S | I32x4ExtendLowI16x8U
            | I32x4ExtendHighI16x8U | I64x2ExtendLowI32x4S | I64x2ExtendHighI32x4S
            | I64x2ExtendLowI32x4U | I64x2ExtendHighI32x4U | F32x4DemoteF64x2Zero
            | F64x2PromoteLowF32x4 | I32x4TruncSatF32x4S | I32x4TruncSatF32x4U
            | F32x4ConvertI32x4S | F32x4ConvertI32x4U | I32x4TruncSatF64x2SZero
            | I32x4TruncSatF64x2UZero | F64x2ConvertLowI32x4S
            | F64x2ConvertLowI32x4U => self.cvt(V128, V128),

            // Everything else on the vector plane is v128 x v128 -> v128.
            _ => {
                self.pop_expect(V128)?;
                self.pop_expect(V128)?;
                self.push(V128);
                Ok(())
            }
        }
    }

    fn vec_mem(&mut self, op: Op, imm: &Imm, natural: u32) -> Result<(), VmError> {
        if op == Op::V128Store {
            self.store_op(imm, ValType::V128, natural, false)
        } else {
            self.load_op(imm, ValType::V128, natural, false)
        }
    }

    fn vec_mem_lane(
        &mut self,
        op: Op,
        imm: &Imm,
        natural: u32,
        lanes: u8,
    ) -> Result<(), VmError> {
        let Imm::MemLane { align, mem, lane, .. } = *imm else { return Err(ERR_TYPE) };
        if lane >= lanes {
            return Err(VmError::InvalidWasm("lane index out of range"));
        }
        self.check_align(align, natural, false)?;
        let index = self.memory_index_type(mem)?;
        self.pop_expect(ValType::V128)?;
        self.pop_expect(index)?;
        if !matches!(
            op,
            Op::V128Store8Lane | Op::V128Store16Lane | Op::V128Store32Lane
                | Op::V128Store64Lane
        ) {
            self.push(ValType::V128);
        }
        Ok(())
    }

    fn vec_extract(&mut self, imm: &Imm, lanes: u8, result: ValType) -> Result<(), VmError> {
        let Imm::Lane(lane) = *imm else { return Err(ERR_TYPE) };
        if lane >= lanes {
            return Err(VmError::InvalidWasm("lane index out of range"));
        }
        self.cvt(ValType::V128, result)
    }

    fn vec_replace(&mut self, imm: &Imm, lanes: u8, scalar: ValType) -> Result<(), VmError> {
        let Imm::Lane(lane) = *imm else { return Err(ERR_TYPE) };
        if lane >= lanes {
            return Err(VmError::InvalidWasm("lane index out of range"));
        }
        self.pop_expect(scalar)?;
        self.pop_expect(ValType::V128)?;
        self.push(ValType::V128);
        Ok(())
    }

    fn atomic(&mut self, op: Op, imm: &Imm) -> Result<(), VmError> {
        use Op::*;
        use ValType::{I32, I64};

        if op == AtomicFence {
            let Imm::Byte(flag) = *imm else { return Err(ERR_TYPE) };
            if flag != 0 {
                return Err(VmError::InvalidWasm("bad fence flag"));
            }
            return Ok(());
        }

        match op {
            MemoryAtomicNotify => {
                let Imm::Mem { align, mem, .. } = *imm else { return Err(ERR_TYPE) };
                self.check_align(align, 2, true)?;
                let index = self.memory_index_type(mem)?;
                self.pop_expect(I32)?;
                self.pop_expect(index)?;
                self.push(I32);
                return Ok(());
            }
            MemoryAtomicWait32 | MemoryAtomicWait64 => {
                let Imm::Mem { align, mem, .. } = *imm else { return Err(ERR_TYPE) };
                let (val, natural) =
                    if op == MemoryAtomicWait32 { (I32, 2) } else { (I64, 3) };
                self.check_align(align, natural, true)?;
                let index = self.memory_index_type(mem)?;
                self.pop_expect(I64)?;
                self.pop_expect(val)?;
                self.pop_expect(index)?;
                self.push(I32);
                return Ok(());
            }
            _ => {}
        }

        // Typed accesses: classify by value type, width, and kind.
        let (ty, natural, kind) = atomic_shape(op)?;
        let Imm::Mem { align, mem, .. } = *imm else { return Err(ERR_TYPE) };
        self.check_align(align, natural, true)?;
        let index = self.memory_index_type(mem)?;
        match kind {
            AtomicKind::Load => {
                self.pop_expect(index)?;
                self.push(ty);
            }
            AtomicKind::Store => {
                self.pop_expect(ty)?;
                self.pop_expect(index)?;
            }
            AtomicKind::Rmw => {
                self.pop_expect(ty)?;
                self.pop_expect(index)?;
                self.push(ty);
            }
            AtomicKind::Cmpxchg => {
                self.pop_expect(ty)?;
                self.pop_expect(ty)?;
                self.pop_expect(index)?;
                self.push(ty);
            }
        }
        Ok(())
    }

    fn gc(&mut self, op: Op, imm: &Imm) -> Result<(), VmError> {
        use Op::*;
        use ValType::I32;

        match op {
            StructNew | StructNewDefault => {
                let Imm::U32(ty) = *imm else { return Err(ERR_TYPE) };
                if ty as usize >= self.cx.module.type_count() {
                    return Err(VmError::InvalidWasm("type index out of range"));
                }
                let id = self.cx.module.global_type_id(ty);
                let CompositeType::Struct(st) = &self.cx.registry.get(id).composite
                else {
                    return Err(VmError::InvalidWasm("struct.new of non-struct type"));
                };
                if op == StructNew {
                    let fields: Vec<ValType> =
                        st.fields.iter().map(|f| f.storage.unpacked()).collect();
                    self.pop_all(&fields)?;
                } else if st.fields.iter().any(|f| !f.storage.unpacked().is_defaultable())
                {
                    return Err(VmError::InvalidWasm(
                        "struct.new_default needs defaultable fields",
                    ));
                }
                let v = self.concrete(id);
                self.push(v);
            }
            StructGet | StructGetS | StructGetU => {
                let Imm::U32x2(ty, field) = *imm else { return Err(ERR_TYPE) };
                let (id, field) = self.struct_field(ty, field)?;
                let packed = matches!(field.storage, StorageType::I8 | StorageType::I16);
                if packed != matches!(op, StructGetS | StructGetU) {
                    return Err(VmError::InvalidWasm("struct.get packing mismatch"));
                }
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(id.0),
                }))?;
                self.push(field.storage.unpacked());
            }
            StructSet => {
                let Imm::U32x2(ty, field) = *imm else { return Err(ERR_TYPE) };
                let (id, field) = self.struct_field(ty, field)?;
                if !field.mutable {
                    return Err(VmError::InvalidWasm("struct.set of immutable field"));
                }
                self.pop_expect(field.storage.unpacked())?;
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(id.0),
                }))?;
            }
            ArrayNew | ArrayNewDefault => {
                let Imm::U32(ty) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                self.pop_expect(I32)?;
                if op == ArrayNew {
                    self.pop_expect(elem.storage.unpacked())?;
                } else if !elem.storage.unpacked().is_defaultable() {
                    return Err(VmError::InvalidWasm(
                        "array.new_default needs a defaultable element",
                    ));
                }
                let v = self.concrete(id);
                self.push(v);
            }
            ArrayNewFixed => {
                let Imm::U32x2(ty, n) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                for _ in 0..n {
                    self.pop_expect(elem.storage.unpacked())?;
                }
                let v = self.concrete(id);
                self.push(v);
            }
            ArrayNewData | ArrayInitData => {
                let Imm::U32x2(ty, data) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                if !matches!(
                    elem.storage,
                    StorageType::I8
                        | StorageType::I16
                        | StorageType::Val(ValType::I32 | ValType::I64 | ValType::F32
                            | ValType::F64 | ValType::V128)
                ) {
                    return Err(VmError::InvalidWasm("array data element must be numeric"));
                }
                self.require_data_count(data)?;
                if op == ArrayNewData {
                    self.pop_expect(I32)?;
                    self.pop_expect(I32)?;
                    let v = self.concrete(id);
                    self.push(v);
                } else {
                    if !elem.mutable {
                        return Err(VmError::InvalidWasm("array.init of immutable array"));
                    }
                    self.pop_expect(I32)?;
                    self.pop_expect(I32)?;
                    self.pop_expect(I32)?;
                    self.pop_expect(ValType::Ref(RefType {
                        nullable: true,
                        heap: HeapType::Concrete(id.0),
                    }))?;
                }
            }
            ArrayNewElem | ArrayInitElem => {
                let Imm::U32x2(ty, elem_idx) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                let seg = self
                    .cx
                    .module
                    .elems
                    .get(elem_idx as usize)
                    .ok_or(VmError::InvalidWasm("element segment out of range"))?;
                let seg_ty = self.cx.canon_val(ValType::Ref(seg.ty))?;
                let StorageType::Val(dst) = elem.storage else {
                    return Err(VmError::InvalidWasm("array element must be a reference"));
                };
                if !self.cx.is_subtype_val(seg_ty, self.cx.canon_val(dst)?) {
                    return Err(VmError::InvalidWasm("array element segment mismatch"));
                }
                if op == ArrayNewElem {
                    self.pop_expect(I32)?;
                    self.pop_expect(I32)?;
                    let v = self.concrete(id);
                    self.push(v);
                } else {
                    if !elem.mutable {
                        return Err(VmError::InvalidWasm("array.init of immutable array"));
                    }
                    self.pop_expect(I32)?;
                    self.pop_expect(I32)?;
                    self.pop_expect(I32)?;
                    self.pop_expect(ValType::Ref(RefType {
                        nullable: true,
                        heap: HeapType::Concrete(id.0),
                    }))?;
                }
            }
            ArrayGet | ArrayGetS | ArrayGetU => {
                let Imm::U32(ty) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                let packed = matches!(elem.storage, StorageType::I8 | StorageType::I16);
                if packed != matches!(op, ArrayGetS | ArrayGetU) {
                    return Err(VmError::InvalidWasm("array.get packing mismatch"));
                }
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(id.0),
                }))?;
                self.push(elem.storage.unpacked());
            }
            ArraySet => {
                let Imm::U32(ty) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                if !elem.mutable {
                    return Err(VmError::InvalidWasm("array.set of immutable array"));
                }
                self.pop_expect(elem.storage.unpacked())?;
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(id.0),
                }))?;
            }
            ArrayLen => {
                self.pop_ref_of(HeapType::Array)?;
                self.push(I32);
            }
            ArrayFill => {
                let Imm::U32(ty) = *imm else { return Err(ERR_TYPE) };
                let (id, elem) = self.array_elem(ty)?;
                if !elem.mutable {
                    return Err(VmError::InvalidWasm("array.fill of immutable array"));
                }
                self.pop_expect(I32)?;
                self.pop_expect(elem.storage.unpacked())?;
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(id.0),
                }))?;
            }
            ArrayCopy => {
                let Imm::U32x2(dst, src) = *imm else { return Err(ERR_TYPE) };
                let (dst_id, dst_elem) = self.array_elem(dst)?;
                let (src_id, src_elem) = self.array_elem(src)?;
                if !dst_elem.mutable {
                    return Err(VmError::InvalidWasm("array.copy to immutable array"));
                }
                let compatible = match (src_elem.storage, dst_elem.storage) {
                    (StorageType::Val(s), StorageType::Val(d)) => {
                        self.cx.is_subtype_val(self.cx.canon_val(s)?, self.cx.canon_val(d)?)
                    }
                    (s, d) => s == d,
                };
                if !compatible {
                    return Err(VmError::InvalidWasm("array.copy element mismatch"));
                }
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(src_id.0),
                }))?;
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Concrete(dst_id.0),
                }))?;
            }
            RefTest | RefTestNull | RefCast | RefCastNull => {
                let Imm::Heap(heap) = *imm else { return Err(ERR_TYPE) };
                let heap = self.cx.canon_heap(heap)?;
                let top = heap.top();
                let input = self.pop_ref_of(match top {
                    HeapType::Any => HeapType::Any,
                    other => other,
                })?;
                let _ = input;
                match op {
                    RefTest | RefTestNull => self.push(I32),
                    _ => self.push(ValType::Ref(RefType {
                        nullable: matches!(op, RefCastNull),
                        heap,
                    })),
                }
            }
            BrOnCast | BrOnCastFail => {
                let Imm::CastPair { flags, from, to, label } = *imm else {
                    return Err(ERR_TYPE)
                };
                let from = RefType {
                    nullable: flags & 0x01 != 0,
                    heap: self.cx.canon_heap(from)?,
                };
                let to = RefType {
                    nullable: flags & 0x02 != 0,
                    heap: self.cx.canon_heap(to)?,
                };
                if !self.cx.is_subtype_heap(to.heap, from.heap) {
                    return Err(VmError::InvalidWasm("cast target not below source"));
                }
                self.pop_expect(ValType::Ref(from))?;
                // The label sees the cast side; the fallthrough keeps the rest.
                let (on_label, fallthrough) = if op == BrOnCast {
                    let diff = RefType {
                        nullable: from.nullable && !to.nullable,
                        heap: from.heap,
                    };
                    (to, diff)
                } else {
                    let diff = RefType {
                        nullable: from.nullable && !to.nullable,
                        heap: from.heap,
                    };
                    (diff, to)
                };
                let mut types = self.label(label)?.label_types().to_vec();
                let Some(last) = types.pop() else {
                    return Err(VmError::InvalidWasm("cast branch label needs a ref"));
                };
                if !self.cx.is_subtype_val(ValType::Ref(on_label), last) {
                    return Err(ERR_TYPE);
                }
                self.pop_all(&types)?;
                self.push_all(&types);
                self.push(ValType::Ref(fallthrough));
            }
            AnyConvertExtern => {
                let rt = self.pop_ref_of(HeapType::Extern)?;
                self.push(ValType::Ref(RefType { nullable: rt.nullable, heap: HeapType::Any }));
            }
            ExternConvertAny => {
                let rt = self.pop_ref_of(HeapType::Any)?;
                self.push(ValType::Ref(RefType {
                    nullable: rt.nullable,
                    heap: HeapType::Extern,
                }));
            }
            RefI31 => {
                self.pop_expect(I32)?;
                self.push(ValType::Ref(RefType { nullable: false, heap: HeapType::I31 }));
            }
            I31GetS | I31GetU => {
                self.pop_ref_of(HeapType::I31)?;
                self.push(I32);
            }
            _ => return Err(VmError::InvalidWasm("opcode not valid in function body")),
        }
        Ok(())
    }
}

/// Kind of a typed atomic access.
enum AtomicKind {
    Load,
    Store,
    Rmw,
    Cmpxchg,
}

/// (value type, natural alignment, kind) of a typed atomic op.
fn atomic_shape(op: Op) -> Result<(ValType, u32, AtomicKind), VmError> {
    use AtomicKind::*;
    use Op::*;
    use ValType::{I32, I64};

    Ok(match op {
        I32AtomicLoad => (I32, 2, Load),
        I64AtomicLoad => (I64, 3, Load),
        I32AtomicLoad8U => (I32, 0, Load),
        I32AtomicLoad16U => (I32, 1, Load),
        I64AtomicLoad8U => (I64, 0, Load),
        I64AtomicLoad16U => (I64, 1, Load),
        I64AtomicLoad32U => (I64, 2, Load),
        I32AtomicStore => (I32, 2, Store),
        I64AtomicStore => (I64, 3, Store),
        I32AtomicStore8 => (I32, 0, Store),
        I32AtomicStore16 => (I32, 1, Store),
        I64AtomicStore8 => (I64, 0, Store),
        I64AtomicStore16 => (I64, 1, Store),
        I64AtomicStore32 => (I64, 2, Store),
        I32AtomicRmwAdd | I32AtomicRmwSub | I32AtomicRmwAnd | I32AtomicRmwOr
        | I32AtomicRmwXor | I32AtomicRmwXchg => (I32, 2, Rmw),
        I64AtomicRmwAdd | I64AtomicRmwSub | I64AtomicRmwAnd | I64AtomicRmwOr
        | I64AtomicRmwXor | I64AtomicRmwXchg => (I64, 3, Rmw),
        I32AtomicRmw8AddU | I32AtomicRmw8SubU | I32AtomicRmw8AndU | I32AtomicRmw8OrU
        | I32AtomicRmw8XorU | I32AtomicRmw8XchgU => (I32, 0, Rmw),
        I32AtomicRmw16AddU | I32AtomicRmw16SubU | I32AtomicRmw16AndU
        | I32AtomicRmw16OrU | I32AtomicRmw16XorU | I32AtomicRmw16XchgU => (I32, 1, Rmw),
        I64AtomicRmw8AddU | I64AtomicRmw8SubU | I64AtomicRmw8AndU | I64AtomicRmw8OrU
        | I64AtomicRmw8XorU | I64AtomicRmw8XchgU => (I64, 0, Rmw),
        I64AtomicRmw16AddU | I64AtomicRmw16SubU | I64AtomicRmw16AndU
        | I64AtomicRmw16OrU | I64AtomicRmw16XorU | I64AtomicRmw16XchgU => (I64, 1, Rmw),
        I64AtomicRmw32AddU | I64AtomicRmw32SubU | I64AtomicRmw32AndU
        | I64AtomicRmw32OrU | I64AtomicRmw32XorU | I64AtomicRmw32XchgU => (I64, 2, Rmw),
        I32AtomicRmwCmpxchg => (I32, 2, Cmpxchg),
        I64AtomicRmwCmpxchg => (I64, 3, Cmpxchg),
        I32AtomicRmw8CmpxchgU => (I32, 0, Cmpxchg),
        I32AtomicRmw16CmpxchgU => (I32, 1, Cmpxchg),
        I64AtomicRmw8CmpxchgU => (I64, 0, Cmpxchg),
        I64AtomicRmw16CmpxchgU => (I64, 1, Cmpxchg),
        I64AtomicRmw32CmpxchgU => (I64, 2, Cmpxchg),
        _ => return Err(VmError::InvalidWasm("opcode not valid in function body")),
    })
}
