//! Indexed field access.
//!
//! A [`FieldAccessor<T>`] is the ordered list of slots in a wire class that are assignable to
//! `T`. Index 0 always denotes the first such slot in declaration order, which is the only
//! contract callers rely on. [`StructureModifier`] binds an accessor to one handle.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::ProtoError;
use crate::field::{FieldKind, FieldType};
use crate::handle::WireHandle;
use crate::schema::WireClass;

/// Slots of one wire class compatible with `T`.
pub struct FieldAccessor<T> {
    slots: Arc<[usize]>,
    _target: PhantomData<fn() -> T>,
}

impl<T> Clone for FieldAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            _target: PhantomData,
        }
    }
}

impl<T: FieldType> FieldAccessor<T> {
    /// Resolve (or fetch the memoized) slot list for `class`.
    pub fn resolve(class: &WireClass) -> Self {
        Self {
            slots: class.slots_for(TypeId::of::<T>(), T::matches),
            _target: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Declared kinds of each accessible slot, in accessor order.
    pub fn kinds(&self, class: &WireClass) -> Vec<FieldKind> {
        self.slots.iter().map(|&i| class.layout()[i].kind).collect()
    }

    /// Underlying layout positions, in accessor order.
    pub fn slot_indices(&self) -> &[usize] {
        &self.slots
    }

    fn slot(&self, index: usize) -> Result<usize, ProtoError> {
        self.slots
            .get(index)
            .copied()
            .ok_or(ProtoError::IndexOutOfRange {
                index,
                size: self.slots.len(),
                target: T::NAME,
            })
    }

    pub fn read(&self, handle: &WireHandle, index: usize) -> Result<T, ProtoError> {
        let slot = self.slot(index)?;
        handle
            .slot(slot)
            .and_then(T::from_value)
            .ok_or_else(|| ProtoError::TargetIncompatible {
                class: handle.class().name().to_string(),
                slot,
                target: T::NAME,
            })
    }

    pub fn write(&self, handle: &mut WireHandle, index: usize, value: T) -> Result<(), ProtoError> {
        let slot = self.slot(index)?;
        handle.set_slot(slot, value.into_value(), T::NAME)
    }
}

/// An accessor bound to a handle, for reading and writing in place.
pub struct StructureModifier<'a, T> {
    accessor: FieldAccessor<T>,
    handle: &'a mut WireHandle,
}

impl<'a, T: FieldType> StructureModifier<'a, T> {
    pub fn new(accessor: FieldAccessor<T>, handle: &'a mut WireHandle) -> Self {
        Self { accessor, handle }
    }

    pub fn size(&self) -> usize {
        self.accessor.size()
    }

    pub fn read(&self, index: usize) -> Result<T, ProtoError> {
        self.accessor.read(&*self.handle, index)
    }

    /// Read, or `None` when the index is out of range or the slot holds no value.
    pub fn read_safely(&self, index: usize) -> Option<T> {
        self.read(index).ok()
    }

    pub fn write(&mut self, index: usize, value: T) -> Result<&mut Self, ProtoError> {
        self.accessor.write(&mut *self.handle, index, value)?;
        Ok(self)
    }

    /// Read-modify-write a single slot.
    pub fn modify(&mut self, index: usize, f: impl FnOnce(T) -> T) -> Result<&mut Self, ProtoError> {
        let value = self.read(index)?;
        self.write(index, f(value))
    }

    /// Every readable value in accessor order; null slots are skipped.
    pub fn values(&self) -> Vec<T> {
        (0..self.size()).filter_map(|i| self.read_safely(i)).collect()
    }

    pub fn kinds(&self) -> Vec<FieldKind> {
        self.accessor.kinds(self.handle.class())
    }
}
