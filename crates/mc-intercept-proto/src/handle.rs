//! Wire handles: one in-memory packet instance of a wire class.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{ProtoDecode, ProtoEncode};
use crate::error::ProtoError;
use crate::field::{decode_value, encode_value, FieldValue};
use crate::packet_type::{Direction, Phase};
use crate::schema::{Schema, WireClass};
use crate::types::VarUInt32;

/// Opaque packet instance. Slots follow the class's flattened layout.
#[derive(Debug, Clone)]
pub struct WireHandle {
    class: Arc<WireClass>,
    slots: Vec<FieldValue>,
}

impl WireHandle {
    /// Fresh instance: nullable slots start `Null`, others hold their kind's default.
    pub fn new(class: Arc<WireClass>) -> Self {
        let slots = class
            .layout()
            .iter()
            .map(|decl| {
                if decl.nullable {
                    FieldValue::Null
                } else {
                    decl.kind.default_value()
                }
            })
            .collect();
        Self { class, slots }
    }

    pub fn class(&self) -> &Arc<WireClass> {
        &self.class
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&FieldValue> {
        self.slots.get(index)
    }

    /// Replace a slot, keeping it consistent with the declared kind.
    pub(crate) fn set_slot(
        &mut self,
        index: usize,
        value: FieldValue,
        target: &'static str,
    ) -> Result<(), ProtoError> {
        let decl = self.class.layout().get(index).ok_or(ProtoError::IndexOutOfRange {
            index,
            size: self.slots.len(),
            target,
        })?;
        let fits = match value.value_type() {
            Some(t) => t == decl.kind.value_type(),
            None => decl.nullable,
        };
        if !fits {
            return Err(ProtoError::TargetIncompatible {
                class: self.class.name().to_string(),
                slot: index,
                target,
            });
        }
        self.slots[index] = value;
        Ok(())
    }

    /// Packet id followed by every slot in wire order.
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let id = self.class.packet_id().ok_or_else(|| {
            ProtoError::InvalidData(format!("{} has no packet id", self.class.name()))
        })?;
        let mut buf = BytesMut::new();
        VarUInt32(id).proto_encode(&mut buf);
        self.encode_fields(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Slots only, without the packet id.
    pub fn encode_fields(&self, buf: &mut impl BufMut) -> Result<(), ProtoError> {
        let layout = self.class.layout();
        for &index in self.class.wire_order() {
            let decl = &layout[index];
            encode_value(decl.kind, decl.nullable, &self.slots[index], buf)?;
        }
        Ok(())
    }

    /// Decode a packet body (id + fields) for the given phase and direction.
    pub fn decode(
        schema: &Schema,
        phase: Phase,
        direction: Direction,
        mut data: Bytes,
    ) -> Result<Self, ProtoError> {
        let id = VarUInt32::proto_decode(&mut data)?.0;
        let class = schema
            .class_by_id(phase, direction, id)
            .ok_or(ProtoError::UnknownPacketId {
                id,
                phase,
                direction,
            })?
            .clone();
        let layout = class.layout();
        let mut slots = vec![FieldValue::Null; layout.len()];
        for &index in class.wire_order() {
            let decl = &layout[index];
            slots[index] = decode_value(decl.kind, decl.nullable, &mut data)?;
        }
        if data.has_remaining() {
            return Err(ProtoError::InvalidData(format!(
                "{} trailing bytes after {}",
                data.remaining(),
                class.name()
            )));
        }
        Ok(Self { class, slots })
    }
}
