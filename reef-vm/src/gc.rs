//! The GC heap.
//!
//! An append-only slab of struct and array objects. Nothing is collected:
//! object lifetimes extend to store teardown, and object identity is the
//! heap index carried in the tagged reference word. Field cells hold the
//! same 128-bit slots the operand stack uses; packed (i8/i16) array storage
//! is masked on access rather than packed in place.

use reef_asm::TrapReason;
use reef_types::TypeId;

/// Kind of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Struct instance.
    Struct,
    /// Array instance.
    Array,
}

/// One heap object.
#[derive(Debug, Clone)]
pub struct GcObject {
    /// Global id of the object's concrete type.
    pub type_id: TypeId,
    /// Struct or array.
    pub kind: GcKind,
    /// Field cells; for arrays, one cell per element.
    pub fields: Vec<u128>,
}

/// The append-only heap.
#[derive(Debug, Default)]
pub struct GcHeap {
    objects: Vec<GcObject>,
}

impl GcHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Allocate a struct; returns its heap index.
    pub fn alloc_struct(&mut self, type_id: TypeId, fields: Vec<u128>) -> usize {
        self.push(GcObject { type_id, kind: GcKind::Struct, fields })
    }

    /// Allocate an array; returns its heap index.
    pub fn alloc_array(&mut self, type_id: TypeId, elems: Vec<u128>) -> usize {
        self.push(GcObject { type_id, kind: GcKind::Array, fields: elems })
    }

    fn push(&mut self, object: GcObject) -> usize {
        let index = self.objects.len();
        self.objects.push(object);
        index
    }

    /// The object at a heap index.
    pub fn get(&self, index: usize) -> Result<&GcObject, TrapReason> {
        self.objects.get(index).ok_or(TrapReason::NullReference)
    }

    /// Mutable object access.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut GcObject, TrapReason> {
        self.objects.get_mut(index).ok_or(TrapReason::NullReference)
    }

    /// The dynamic type of an object.
    pub fn type_of(&self, index: usize) -> Result<TypeId, TrapReason> {
        Ok(self.get(index)?.type_id)
    }

    /// Read one array element, trapping on out-of-range indices.
    pub fn array_get(&self, index: usize, elem: u64) -> Result<u128, TrapReason> {
        let object = self.get(index)?;
        object
            .fields
            .get(elem as usize)
            .copied()
            .ok_or(TrapReason::OutOfBoundsArrayAccess)
    }

    /// Write one array element, trapping on out-of-range indices.
    pub fn array_set(
        &mut self,
        index: usize,
        elem: u64,
        value: u128,
    ) -> Result<(), TrapReason> {
        let object = self.get_mut(index)?;
        match object.fields.get_mut(elem as usize) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(TrapReason::OutOfBoundsArrayAccess),
        }
    }

    /// Array length.
    pub fn array_len(&self, index: usize) -> Result<u32, TrapReason> {
        Ok(self.get(index)?.fields.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_by_index() {
        let mut heap = GcHeap::new();
        let a = heap.alloc_struct(TypeId(0), vec![1]);
        let b = heap.alloc_struct(TypeId(0), vec![1]);
        assert_ne!(a, b);
        assert_eq!(heap.get(a).unwrap().fields, heap.get(b).unwrap().fields);
    }

    #[test]
    fn array_bounds_trap() {
        let mut heap = GcHeap::new();
        let a = heap.alloc_array(TypeId(3), vec![0; 4]);
        assert_eq!(heap.array_get(a, 3).unwrap(), 0);
        assert_eq!(
            heap.array_get(a, 4),
            Err(TrapReason::OutOfBoundsArrayAccess)
        );
        assert_eq!(
            heap.array_set(a, 10, 1),
            Err(TrapReason::OutOfBoundsArrayAccess)
        );
    }
}
