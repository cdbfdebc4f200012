//! The cross-module type registry.
//!
//! Rec groups are canonicalized and hash-consed here. The canonical form of
//! a group rewrites every concrete type reference: intra-group references
//! become relative offsets carrying a marker bit, references to earlier
//! groups become the referenced type's global id. Structurally identical
//! groups therefore compare byte-equal no matter which module declared them,
//! and interning them once gives every module the same global ids.
//!
//! Invariant: two function types are equal as `call_indirect` targets iff
//! they share a global [`TypeId`]. Subtype checks walk the supertype chain
//! by id, so cross-module type matching is O(chain length) with O(1)
//! exact matching.

use std::collections::HashMap;

use reef_types::{HeapType, RefType, TypeId, TypeIdx, ValType};

use crate::error::VmError;
use crate::module::{
    CompositeType, FieldType, FuncType, Module, RecGroup, StorageType, SubType,
};

/// Marker bit distinguishing intra-group relative references from global
/// ids inside a canonical group.
const REC_MARKER: u32 = 1 << 31;

/// One interned type.
#[derive(Debug, Clone)]
pub struct RegisteredType {
    /// Composite payload with every concrete reference resolved to a global
    /// id.
    pub composite: CompositeType,
    /// Declared supertype.
    pub supertype: Option<TypeId>,
    /// Whether subtyping below this type is forbidden.
    pub is_final: bool,
}

/// Hash-consed repository of rec groups.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    /// Canonical group -> global id of the group's first member.
    groups: HashMap<RecGroup, u32>,
    /// All interned types; `TypeId` indexes this.
    types: Vec<RegisteredType>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether nothing was interned yet.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The interned type behind an id.
    pub fn get(&self, id: TypeId) -> &RegisteredType {
        &self.types[id.index()]
    }

    /// The function signature behind an id, for call-site arity queries.
    pub fn func_type(&self, id: TypeId) -> Option<&FuncType> {
        match &self.get(id).composite {
            CompositeType::Func(ft) => Some(ft),
            _ => None,
        }
    }

    /// Whether `sub` is `sup` or a declared subtype of it.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        let mut current = sub;
        loop {
            if current == sup {
                return true;
            }
            match self.get(current).supertype {
                Some(next) => current = next,
                None => return false,
            }
        }
    }

    /// Canonicalize, dedupe and intern every rec group of a module, filling
    /// the module's local-index -> global-id map.
    pub fn register_module_types(
        &mut self,
        module: &mut Module,
    ) -> Result<(), VmError> {
        let mut ids: Vec<TypeId> = Vec::with_capacity(module.type_count());
        let mut group_start = 0u32;
        for group in &module.rec_groups {
            let len = group.types.len() as u32;
            let canonical = canonicalize_group(group, group_start, len, &ids)?;
            let first_id = match self.groups.get(&canonical) {
                Some(&first) => first,
                None => {
                    let first = self.types.len() as u32;
                    self.intern_group(&canonical, first)?;
                    self.groups.insert(canonical, first);
                    first
                }
            };
            for i in 0..len {
                ids.push(TypeId(first_id + i));
            }
            group_start += len;
        }
        module.type_ids = ids;
        Ok(())
    }

    /// Materialize the members of a canonical group with global ids.
    fn intern_group(&mut self, canonical: &RecGroup, first: u32) -> Result<(), VmError> {
        for member in &canonical.types {
            let supertype = member.supertype.map(|raw| TypeId(decode_ref(raw, first)));
            let composite = resolve_composite(&member.composite, first);
            self.types.push(RegisteredType {
                composite,
                supertype,
                is_final: member.is_final,
            });
        }
        // Supertype chains must point at non-final types of compatible shape;
        // the validator checks shape, the registry enforces finality.
        for i in 0..canonical.types.len() {
            let id = first as usize + i;
            if let Some(sup) = self.types[id].supertype {
                if self.types[sup.index()].is_final {
                    return Err(VmError::InvalidWasm("supertype is final"));
                }
            }
        }
        Ok(())
    }
}

/// Rewrite a group into canonical form.
fn canonicalize_group(
    group: &RecGroup,
    group_start: u32,
    group_len: u32,
    ids: &[TypeId],
) -> Result<RecGroup, VmError> {
    let rewrite = |idx: TypeIdx| -> Result<u32, VmError> {
        if idx >= group_start && idx < group_start + group_len {
            Ok(REC_MARKER | (idx - group_start))
        } else if (idx as usize) < ids.len() {
            Ok(ids[idx as usize].0)
        } else {
            Err(VmError::InvalidWasm("forward type reference across groups"))
        }
    };
    let mut types = Vec::with_capacity(group.types.len());
    for member in &group.types {
        let supertype = member.supertype.map(rewrite).transpose()?;
        let composite = map_composite(&member.composite, &|idx| rewrite(idx))?;
        types.push(SubType { is_final: member.is_final, supertype, composite });
    }
    Ok(RecGroup { types })
}

/// Decode a canonical reference back into a global id, given the group's
/// first id.
fn decode_ref(raw: u32, first: u32) -> u32 {
    if raw & REC_MARKER != 0 {
        first + (raw & !REC_MARKER)
    } else {
        raw
    }
}

/// Resolve a canonical composite's references into global ids.
fn resolve_composite(composite: &CompositeType, first: u32) -> CompositeType {
    map_composite(composite, &|raw| {
        Ok::<u32, VmError>(decode_ref(raw, first))
    })
    .unwrap_or_else(|_| composite.clone())
}

fn map_composite<E>(
    composite: &CompositeType,
    f: &impl Fn(u32) -> Result<u32, E>,
) -> Result<CompositeType, E> {
    Ok(match composite {
        CompositeType::Func(ft) => CompositeType::Func(FuncType {
            params: map_val_types(&ft.params, f)?,
            results: map_val_types(&ft.results, f)?,
        }),
        CompositeType::Struct(st) => {
            let mut fields = Vec::with_capacity(st.fields.len());
            for field in &st.fields {
                fields.push(map_field(field, f)?);
            }
            CompositeType::Struct(crate::module::StructType { fields })
        }
        CompositeType::Array(at) => CompositeType::Array(crate::module::ArrayType {
            elem: map_field(&at.elem, f)?,
        }),
    })
}

fn map_field<E>(
    field: &FieldType,
    f: &impl Fn(u32) -> Result<u32, E>,
) -> Result<FieldType, E> {
    let storage = match field.storage {
        StorageType::Val(ty) => StorageType::Val(map_val_type(ty, f)?),
        packed => packed,
    };
    Ok(FieldType { storage, mutable: field.mutable })
}

fn map_val_types<E>(
    types: &[ValType],
    f: &impl Fn(u32) -> Result<u32, E>,
) -> Result<Vec<ValType>, E> {
    types.iter().map(|&ty| map_val_type(ty, f)).collect()
}

fn map_val_type<E>(ty: ValType, f: &impl Fn(u32) -> Result<u32, E>) -> Result<ValType, E> {
    Ok(match ty {
        ValType::Ref(RefType { nullable, heap: HeapType::Concrete(idx) }) => {
            ValType::Ref(RefType { nullable, heap: HeapType::Concrete(f(idx)?) })
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ArrayType, StructType};

    fn func(params: Vec<ValType>, results: Vec<ValType>) -> SubType {
        SubType {
            is_final: true,
            supertype: None,
            composite: CompositeType::Func(FuncType { params, results }),
        }
    }

    fn module_with(groups: Vec<RecGroup>) -> Module {
        let mut positions = Vec::new();
        for (gi, group) in groups.iter().enumerate() {
            for i in 0..group.types.len() {
                positions.push((gi as u32, i as u32));
            }
        }
        let count = positions.len();
        Module {
            bytes: Vec::new().into(),
            rec_groups: groups,
            type_positions: positions,
            type_ids: (0..count as u32).map(TypeId).collect(),
            imports: Vec::new(),
            funcs: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            tags: Vec::new(),
            exports: Vec::new(),
            start: None,
            elems: Vec::new(),
            datas: Vec::new(),
            data_count: None,
            branch_hints: Default::default(),
            name: None,
        }
    }

    #[test]
    fn identical_groups_share_ids_across_modules() {
        let mut registry = TypeRegistry::new();
        let make = || {
            module_with(vec![RecGroup {
                types: vec![func(vec![ValType::I32, ValType::I32], vec![ValType::I32])],
            }])
        };
        let mut a = make();
        let mut b = make();
        registry.register_module_types(&mut a).unwrap();
        registry.register_module_types(&mut b).unwrap();
        assert_eq!(a.type_ids[0], b.type_ids[0]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_signatures_get_distinct_ids() {
        let mut registry = TypeRegistry::new();
        let mut m = module_with(vec![
            RecGroup { types: vec![func(vec![ValType::I32], vec![ValType::I32])] },
            RecGroup { types: vec![func(vec![ValType::I64], vec![ValType::I64])] },
        ]);
        registry.register_module_types(&mut m).unwrap();
        assert_ne!(m.type_ids[0], m.type_ids[1]);
    }

    #[test]
    fn recursive_groups_canonicalize_by_shape() {
        // (rec (struct (field (ref 0)))) twice, in separate modules, with
        // different absolute indices thanks to a leading padding type.
        let recursive_struct = |self_idx: u32| SubType {
            is_final: true,
            supertype: None,
            composite: CompositeType::Struct(StructType {
                fields: vec![FieldType {
                    storage: StorageType::Val(ValType::Ref(RefType {
                        nullable: true,
                        heap: HeapType::Concrete(self_idx),
                    })),
                    mutable: false,
                }],
            }),
        };
        let mut registry = TypeRegistry::new();

        let mut a = module_with(vec![RecGroup { types: vec![recursive_struct(0)] }]);
        let mut b = module_with(vec![
            RecGroup { types: vec![func(vec![], vec![])] },
            RecGroup { types: vec![recursive_struct(1)] },
        ]);
        registry.register_module_types(&mut a).unwrap();
        registry.register_module_types(&mut b).unwrap();
        assert_eq!(a.type_ids[0], b.type_ids[1]);
    }

    #[test]
    fn subtype_chain_walk() {
        let mut registry = TypeRegistry::new();
        let base = SubType {
            is_final: false,
            supertype: None,
            composite: CompositeType::Array(ArrayType {
                elem: FieldType { storage: StorageType::I8, mutable: true },
            }),
        };
        let derived = SubType {
            is_final: true,
            supertype: Some(0),
            composite: base.composite.clone(),
        };
        let mut m = module_with(vec![RecGroup { types: vec![base, derived] }]);
        registry.register_module_types(&mut m).unwrap();
        assert!(registry.is_subtype(m.type_ids[1], m.type_ids[0]));
        assert!(!registry.is_subtype(m.type_ids[0], m.type_ids[1]));
    }
}
