//! Section grammar.

use reef_types::ValType;

use crate::consts::{MAX_FUNC_TYPE_ARITY, MAX_STRUCT_FIELDS};
use crate::error::VmError;
use crate::module::*;
use crate::params::DecodeLimits;

use super::{expr, Reader};

pub(super) const CUSTOM: u8 = 0;
const TYPE: u8 = 1;
const IMPORT: u8 = 2;
const FUNCTION: u8 = 3;
const TABLE: u8 = 4;
const MEMORY: u8 = 5;
const GLOBAL: u8 = 6;
const EXPORT: u8 = 7;
const START: u8 = 8;
const ELEMENT: u8 = 9;
const CODE: u8 = 10;
const DATA: u8 = 11;
const DATA_COUNT: u8 = 12;
const TAG: u8 = 13;

/// Ordering rank of a non-custom section id, or `None` for unknown ids.
pub(super) fn rank(id: u8) -> Option<u8> {
    Some(match id {
        TYPE => 1,
        IMPORT => 2,
        FUNCTION => 3,
        TABLE => 4,
        MEMORY => 5,
        TAG => 6,
        GLOBAL => 7,
        EXPORT => 8,
        START => 9,
        ELEMENT => 10,
        DATA_COUNT => 11,
        CODE => 12,
        DATA => 13,
        _ => return None,
    })
}

pub(super) fn decode_section(
    id: u8,
    mut r: Reader<'_>,
    module: &mut Module,
    func_types: &mut Vec<u32>,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    match id {
        TYPE => types(&mut r, module, limits)?,
        IMPORT => imports(&mut r, module, limits)?,
        FUNCTION => {
            let count = checked_count(&mut r, limits)?;
            for _ in 0..count {
                func_types.push(r.u32_leb()?);
            }
        }
        TABLE => tables(&mut r, module, limits)?,
        MEMORY => memories(&mut r, module, limits)?,
        TAG => tags(&mut r, module, limits)?,
        GLOBAL => globals(&mut r, module, limits)?,
        EXPORT => exports(&mut r, module, limits)?,
        START => module.start = Some(r.u32_leb()?),
        ELEMENT => elements(&mut r, module, limits)?,
        DATA_COUNT => {
            let count = r.u32_leb()?;
            if count > limits.max_data_segments {
                return Err(VmError::InvalidWasm("too many data segments"));
            }
            module.data_count = Some(count);
        }
        CODE => code(&mut r, module, func_types, limits)?,
        DATA => data(&mut r, module, limits)?,
        _ => return Err(VmError::InvalidWasm("unknown section id")),
    }
    if !r.is_empty() {
        return Err(VmError::InvalidWasm("trailing bytes in section"));
    }
    Ok(())
}

fn checked_count(r: &mut Reader<'_>, limits: &DecodeLimits) -> Result<u32, VmError> {
    let count = r.u32_leb()?;
    if count > limits.max_section_items {
        return Err(VmError::InvalidWasm("section item count over limit"));
    }
    Ok(count)
}

fn types(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        let group = if r.clone().u8()? == 0x4E {
            r.u8()?;
            let len = checked_count(r, limits)?;
            let mut types = Vec::with_capacity(len as usize);
            for _ in 0..len {
                types.push(sub_type(r)?);
            }
            RecGroup { types }
        } else {
            RecGroup { types: vec![sub_type(r)?] }
        };
        let group_idx = module.rec_groups.len() as u32;
        for i in 0..group.types.len() as u32 {
            module.type_positions.push((group_idx, i));
        }
        module.rec_groups.push(group);
    }
    Ok(())
}

fn sub_type(r: &mut Reader<'_>) -> Result<SubType, VmError> {
    let lead = r.clone().u8()?;
    let (is_final, supertype) = match lead {
        0x50 | 0x4F => {
            r.u8()?;
            let count = r.u32_leb()?;
            if count > 1 {
                return Err(VmError::InvalidWasm("multiple supertypes"));
            }
            let supertype = if count == 1 { Some(r.u32_leb()?) } else { None };
            (lead == 0x4F, supertype)
        }
        _ => (true, None),
    };
    Ok(SubType { is_final, supertype, composite: composite_type(r)? })
}

fn composite_type(r: &mut Reader<'_>) -> Result<CompositeType, VmError> {
    match r.u8()? {
        0x60 => {
            let params = val_type_vec(r, MAX_FUNC_TYPE_ARITY)?;
            let results = val_type_vec(r, MAX_FUNC_TYPE_ARITY)?;
            Ok(CompositeType::Func(FuncType { params, results }))
        }
        0x5F => {
            let count = r.u32_leb()?;
            if count > MAX_STRUCT_FIELDS {
                return Err(VmError::InvalidWasm("too many struct fields"));
            }
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fields.push(field_type(r)?);
            }
            Ok(CompositeType::Struct(StructType { fields }))
        }
        0x5E => Ok(CompositeType::Array(ArrayType { elem: field_type(r)? })),
        _ => Err(VmError::InvalidWasm("unknown composite type form")),
    }
}

fn field_type(r: &mut Reader<'_>) -> Result<FieldType, VmError> {
    let storage = match r.clone().u8()? {
        0x78 => {
            r.u8()?;
            StorageType::I8
        }
        0x77 => {
            r.u8()?;
            StorageType::I16
        }
        _ => StorageType::Val(r.val_type()?),
    };
    let mutable = match r.u8()? {
        0x00 => false,
        0x01 => true,
        _ => return Err(VmError::InvalidWasm("bad mutability flag")),
    };
    Ok(FieldType { storage, mutable })
}

fn val_type_vec(r: &mut Reader<'_>, max: u32) -> Result<Vec<ValType>, VmError> {
    let count = r.u32_leb()?;
    if count > max {
        return Err(VmError::InvalidWasm("type arity over limit"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(r.val_type()?);
    }
    Ok(out)
}

fn imports(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        let module_name = r.name()?;
        let name = r.name()?;
        let desc = match r.u8()? {
            0x00 => ImportDesc::Func(r.u32_leb()?),
            0x01 => ImportDesc::Table(table_type(r)?),
            0x02 => ImportDesc::Memory(memory_type(r)?),
            0x03 => ImportDesc::Global(global_type(r)?),
            0x04 => {
                if r.u8()? != 0x00 {
                    return Err(VmError::InvalidWasm("bad tag attribute"));
                }
                ImportDesc::Tag(r.u32_leb()?)
            }
            _ => return Err(VmError::InvalidWasm("unknown import kind")),
        };
        module.imports.push(Import { module: module_name, name, desc });
    }
    Ok(())
}

fn table_type(r: &mut Reader<'_>) -> Result<TableType, VmError> {
    let elem = r.ref_type()?;
    let (limits, width, shared, page_size) = r.limits()?;
    if shared || page_size.is_some() {
        return Err(VmError::InvalidWasm("invalid table limits flags"));
    }
    Ok(TableType { elem, limits, width })
}

fn memory_type(r: &mut Reader<'_>) -> Result<MemoryType, VmError> {
    let (limits, width, shared, page_size) = r.limits()?;
    Ok(MemoryType {
        limits,
        width,
        shared,
        page_size_log2: page_size.unwrap_or(crate::consts::DEFAULT_PAGE_SIZE_LOG2),
    })
}

fn global_type(r: &mut Reader<'_>) -> Result<GlobalType, VmError> {
    let val = r.val_type()?;
    let mutable = match r.u8()? {
        0x00 => false,
        0x01 => true,
        _ => return Err(VmError::InvalidWasm("bad mutability flag")),
    };
    Ok(GlobalType { val, mutable })
}

fn tables(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        // 0x40 0x00 prefixes a table with an explicit initializer.
        let def = if r.clone().u8()? == 0x40 {
            r.u8()?;
            if r.u8()? != 0x00 {
                return Err(VmError::InvalidWasm("bad table initializer form"));
            }
            let ty = table_type(r)?;
            let init = expr::decode_const_expr(r)?;
            TableDef { ty, init: Some(init) }
        } else {
            TableDef { ty: table_type(r)?, init: None }
        };
        module.tables.push(def);
    }
    Ok(())
}

fn memories(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        module.memories.push(memory_type(r)?);
    }
    Ok(())
}

fn tags(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        if r.u8()? != 0x00 {
            return Err(VmError::InvalidWasm("bad tag attribute"));
        }
        module.tags.push(r.u32_leb()?);
    }
    Ok(())
}

fn globals(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        let ty = global_type(r)?;
        let init = expr::decode_const_expr(r)?;
        module.globals.push(GlobalDef { ty, init });
    }
    Ok(())
}

fn exports(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        let name = r.name()?;
        let kind = match r.u8()? {
            0x00 => ExternKind::Func,
            0x01 => ExternKind::Table,
            0x02 => ExternKind::Memory,
            0x03 => ExternKind::Global,
            0x04 => ExternKind::Tag,
            _ => return Err(VmError::InvalidWasm("unknown export kind")),
        };
        let index = r.u32_leb()?;
        module.exports.push(Export { name, kind, index });
    }
    Ok(())
}

fn elements(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    for _ in 0..count {
        module.elems.push(element(r)?);
    }
    Ok(())
}

fn element(r: &mut Reader<'_>) -> Result<ElemSegment, VmError> {
    use reef_types::RefType;

    let form = r.u32_leb()?;
    if form > 7 {
        return Err(VmError::InvalidWasm("unknown element segment form"));
    }
    let active = form & 0x01 == 0;
    let explicit_table = form & 0x02 != 0 && active;
    let declared = form == 3 || form == 7;
    let has_exprs = form & 0x04 != 0;

    let table = if explicit_table { r.u32_leb()? } else { 0 };
    let offset = if active { Some(expr::decode_const_expr(r)?) } else { None };

    // Forms 0 and 4 imply funcref with no elemkind/reftype byte.
    let ty = if form == 0 || form == 4 {
        RefType::FUNCREF
    } else if has_exprs {
        r.ref_type()?
    } else {
        match r.u8()? {
            0x00 => RefType::FUNCREF,
            _ => return Err(VmError::InvalidWasm("unknown element kind")),
        }
    };

    let count = r.u32_leb()?;
    let items = if has_exprs {
        let mut exprs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            exprs.push(expr::decode_const_expr(r)?);
        }
        ElemItems::Exprs(exprs)
    } else {
        let mut funcs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            funcs.push(r.u32_leb()?);
        }
        ElemItems::Funcs(funcs)
    };

    let mode = if declared {
        ElemMode::Declared
    } else if let Some(offset) = offset {
        ElemMode::Active { table, offset }
    } else {
        ElemMode::Passive
    };

    Ok(ElemSegment { ty, mode, items })
}

fn code(
    r: &mut Reader<'_>,
    module: &mut Module,
    func_types: &[u32],
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = checked_count(r, limits)?;
    if count as usize != func_types.len() {
        return Err(VmError::InvalidWasm(
            "function and code section counts disagree",
        ));
    }
    for &type_idx in func_types {
        let size = r.u32_leb()?;
        if size > limits.max_func_body_bytes {
            return Err(VmError::InvalidWasm("function body over size limit"));
        }
        let mut body = r.sub_reader(size as usize)?;

        let mut locals = Vec::new();
        let mut total: u64 = 0;
        let group_count = body.u32_leb()?;
        for _ in 0..group_count {
            let n = body.u32_leb()?;
            let ty = body.val_type()?;
            total += u64::from(n);
            if total > u64::from(limits.max_locals) {
                return Err(VmError::InvalidWasm("too many locals"));
            }
            locals.push((n, ty));
        }

        let start = body.pos();
        let end = start + body.remaining();
        if body.remaining() == 0 || module.bytes[end - 1] != 0x0B {
            return Err(VmError::InvalidWasm("function body missing end"));
        }
        module.funcs.push(FuncDef { type_idx, locals, body: start..end });
    }
    Ok(())
}

fn data(
    r: &mut Reader<'_>,
    module: &mut Module,
    limits: &DecodeLimits,
) -> Result<(), VmError> {
    let count = r.u32_leb()?;
    if count > limits.max_data_segments {
        return Err(VmError::InvalidWasm("too many data segments"));
    }
    for _ in 0..count {
        let mode = match r.u32_leb()? {
            0 => DataMode::Active { memory: 0, offset: expr::decode_const_expr(r)? },
            1 => DataMode::Passive,
            2 => {
                let memory = r.u32_leb()?;
                DataMode::Active { memory, offset: expr::decode_const_expr(r)? }
            }
            _ => return Err(VmError::InvalidWasm("unknown data segment form")),
        };
        let len = r.u32_leb()? as usize;
        let start = r.pos();
        r.skip(len)?;
        module.datas.push(DataSegment { mode, bytes: start..start + len });
    }
    Ok(())
}

/// Custom sections: the name section supplies the module name used for
/// export registration; branch-hint metadata feeds the predecoder. Unknown
/// custom sections are skipped whole.
pub(super) fn custom(mut r: Reader<'_>, module: &mut Module) -> Result<(), VmError> {
    let name = r.name()?;
    match name.as_str() {
        "name" => {
            // Only subsection 0 (module name) is of interest.
            while !r.is_empty() {
                let sub_id = r.u8()?;
                let len = r.u32_leb()? as usize;
                let mut sub = r.sub_reader(len)?;
                if sub_id == 0 {
                    module.name = Some(sub.name()?);
                }
            }
        }
        "metadata.code.branch_hint" => {
            let func_count = r.u32_leb()?;
            for _ in 0..func_count {
                let func = r.u32_leb()?;
                let hint_count = r.u32_leb()?;
                let mut hints = Vec::with_capacity(hint_count as usize);
                for _ in 0..hint_count {
                    let offset = r.u32_leb()?;
                    let size = r.u32_leb()?;
                    let value = r.u8()?;
                    if size != 1 {
                        return Err(VmError::InvalidWasm("bad branch hint size"));
                    }
                    hints.push(BranchHint { offset, likely: value == 1 });
                }
                module.branch_hints.insert(func, hints);
            }
        }
        _ => {}
    }
    Ok(())
}
