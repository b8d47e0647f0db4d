//! Packet container: a typed wrapper around one wire handle.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::accessor::{FieldAccessor, StructureModifier};
use crate::error::ProtoError;
use crate::field::{FieldType, FieldValue};
use crate::handle::WireHandle;
use crate::packet_type::PacketType;
use crate::schema::Schema;
use crate::types::{BlockPos, Uuid};

/// One packet in flight. Owns its handle exclusively.
pub struct PacketContainer {
    packet_type: PacketType,
    handle: WireHandle,
    views: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl PacketContainer {
    /// Allocate a fresh packet of `packet_type` from the schema.
    pub fn create(schema: &Schema, packet_type: PacketType) -> Result<Self, ProtoError> {
        let class = schema
            .class_for(packet_type)
            .ok_or(ProtoError::InstantiationFailed(packet_type))?;
        if class.packet_id().is_none() {
            return Err(ProtoError::InstantiationFailed(packet_type));
        }
        Ok(Self {
            packet_type,
            handle: WireHandle::new(class.clone()),
            views: HashMap::new(),
        })
    }

    /// Wrap a received handle. The type falls back to `Unknown` for unmapped classes.
    pub fn from_handle(handle: WireHandle) -> Self {
        Self {
            packet_type: handle.class().packet_type(),
            handle,
            views: HashMap::new(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn handle(&self) -> &WireHandle {
        &self.handle
    }

    pub fn into_handle(self) -> WireHandle {
        self.handle
    }

    /// Accessor for `T`, created on first use and cached for this container.
    pub fn accessor<T: FieldType>(&mut self) -> FieldAccessor<T> {
        let class = self.handle.class();
        self.views
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(FieldAccessor::<T>::resolve(class)))
            .downcast_ref::<FieldAccessor<T>>()
            .cloned()
            .unwrap_or_else(|| FieldAccessor::resolve(class))
    }

    /// Read/write view over every slot assignable to `T`.
    pub fn modifier<T: FieldType>(&mut self) -> StructureModifier<'_, T> {
        let accessor = self.accessor::<T>();
        StructureModifier::new(accessor, &mut self.handle)
    }

    /// Read one slot without a mutable borrow.
    pub fn read<T: FieldType>(&self, index: usize) -> Result<T, ProtoError> {
        FieldAccessor::<T>::resolve(self.handle.class()).read(&self.handle, index)
    }

    /// All readable values of type `T`, in accessor order.
    pub fn values<T: FieldType>(&self) -> Vec<T> {
        let accessor = FieldAccessor::<T>::resolve(self.handle.class());
        (0..accessor.size())
            .filter_map(|i| accessor.read(&self.handle, i).ok())
            .collect()
    }

    pub fn fields(&mut self) -> StructureModifier<'_, FieldValue> {
        self.modifier()
    }

    pub fn booleans(&mut self) -> StructureModifier<'_, bool> {
        self.modifier()
    }

    pub fn bytes(&mut self) -> StructureModifier<'_, i8> {
        self.modifier()
    }

    pub fn shorts(&mut self) -> StructureModifier<'_, i16> {
        self.modifier()
    }

    pub fn integers(&mut self) -> StructureModifier<'_, i32> {
        self.modifier()
    }

    pub fn longs(&mut self) -> StructureModifier<'_, i64> {
        self.modifier()
    }

    pub fn floats(&mut self) -> StructureModifier<'_, f32> {
        self.modifier()
    }

    pub fn doubles(&mut self) -> StructureModifier<'_, f64> {
        self.modifier()
    }

    pub fn strings(&mut self) -> StructureModifier<'_, String> {
        self.modifier()
    }

    pub fn uuids(&mut self) -> StructureModifier<'_, Uuid> {
        self.modifier()
    }

    pub fn byte_arrays(&mut self) -> StructureModifier<'_, Vec<u8>> {
        self.modifier()
    }

    pub fn short_arrays(&mut self) -> StructureModifier<'_, Vec<i16>> {
        self.modifier()
    }

    pub fn int_arrays(&mut self) -> StructureModifier<'_, Vec<i32>> {
        self.modifier()
    }

    pub fn block_positions(&mut self) -> StructureModifier<'_, BlockPos> {
        self.modifier()
    }

    /// Independent copy: fresh handle, every slot copied through the generic view.
    pub fn deep_clone(&self) -> Self {
        let mut handle = WireHandle::new(self.handle.class().clone());
        let generic = FieldAccessor::<FieldValue>::resolve(self.handle.class());
        for i in 0..generic.size() {
            if let Ok(value) = generic.read(&self.handle, i) {
                // Same class on both sides, so every slot accepts its own value.
                let _ = generic.write(&mut handle, i, value);
            }
        }
        Self {
            packet_type: self.packet_type,
            handle,
            views: HashMap::new(),
        }
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<(), ProtoError> {
        if supported {
            Ok(())
        } else {
            Err(ProtoError::WrongPacketType {
                packet_type: self.packet_type,
                operation,
            })
        }
    }

    pub fn entity_id(&self) -> Result<i32, ProtoError> {
        self.require(self.packet_type.carries_entity_id(), "entity_id")?;
        self.read(0)
    }

    pub fn set_entity_id(&mut self, id: i32) -> Result<(), ProtoError> {
        self.require(self.packet_type.carries_entity_id(), "set_entity_id")?;
        self.integers().write(0, id).map(|_| ())
    }

    pub fn message(&self) -> Result<String, ProtoError> {
        self.require(self.packet_type.carries_message(), "message")?;
        self.read(0)
    }

    pub fn set_message(&mut self, message: impl Into<String>) -> Result<(), ProtoError> {
        self.require(self.packet_type.carries_message(), "set_message")?;
        self.strings().write(0, message.into()).map(|_| ())
    }

    pub fn block_position(&self) -> Result<BlockPos, ProtoError> {
        self.require(self.packet_type.carries_block_position(), "block_position")?;
        self.read(0)
    }

    /// One-line rendering: type name then the integer and string views.
    pub fn summary(&self) -> String {
        let mut out = String::from(self.packet_type.name());
        let ints = self.values::<i32>();
        if !ints.is_empty() {
            let _ = write!(out, " ints={ints:?}");
        }
        let strings = self.values::<String>();
        if !strings.is_empty() {
            let _ = write!(out, " strings={strings:?}");
        }
        let doubles = self.values::<f64>();
        if !doubles.is_empty() {
            let _ = write!(out, " doubles={doubles:?}");
        }
        out
    }
}

impl Clone for PacketContainer {
    fn clone(&self) -> Self {
        self.deep_clone()
    }
}

impl std::fmt::Debug for PacketContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketContainer")
            .field("type", &self.packet_type)
            .field("class", &self.handle.class().name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_type::{Direction, Phase};
    use crate::schema::{ClassDef, SchemaBuilder};

    fn schema() -> Schema {
        Schema::builtin().unwrap()
    }

    #[test]
    fn create_unknown_fails() {
        let err = PacketContainer::create(&schema(), PacketType::Unknown).unwrap_err();
        assert!(matches!(err, ProtoError::InstantiationFailed(PacketType::Unknown)));
    }

    #[test]
    fn create_missing_class_fails() {
        let empty = SchemaBuilder::new(1).build().unwrap();
        assert!(PacketContainer::create(&empty, PacketType::PlayClientChat).is_err());
    }

    #[test]
    fn from_handle_infers_type_or_unknown() {
        let schema = SchemaBuilder::new(1)
            .class(ClassDef {
                name: "SomeModPacket".into(),
                parent: None,
                phase: Phase::Play,
                direction: Direction::ServerToClient,
                packet_id: Some(0x70),
                fields: vec![],
                wire: None,
            })
            .build()
            .unwrap();
        let handle = WireHandle::new(schema.class("SomeModPacket").unwrap().clone());
        assert_eq!(PacketContainer::from_handle(handle).packet_type(), PacketType::Unknown);

        let chat = PacketContainer::create(&self::schema(), PacketType::PlayServerChat).unwrap();
        let rewrapped = PacketContainer::from_handle(chat.into_handle());
        assert_eq!(rewrapped.packet_type(), PacketType::PlayServerChat);
    }

    #[test]
    fn deep_clone_is_independent() {
        let mut original = PacketContainer::create(&schema(), PacketType::PlayServerChat).unwrap();
        original.strings().write(0, "hello".into()).unwrap();

        let mut copy = original.deep_clone();
        copy.strings().write(0, "changed".into()).unwrap();
        copy.booleans().write(0, true).unwrap();

        assert_eq!(original.read::<String>(0).unwrap(), "hello");
        assert!(!original.read::<bool>(0).unwrap());
        assert_eq!(copy.read::<String>(0).unwrap(), "changed");
    }

    #[test]
    fn views_are_cached_per_container() {
        let mut packet = PacketContainer::create(&schema(), PacketType::PlayClientPosition).unwrap();
        packet.doubles().write(0, 10.0).unwrap();
        assert_eq!(packet.views.len(), 1);
        packet.doubles().write(1, 70.0).unwrap();
        assert_eq!(packet.views.len(), 1);
        assert_eq!(packet.booleans().size(), 1);
        assert_eq!(packet.views.len(), 2);
    }

    #[test]
    fn convenience_accessors_check_type() {
        let mut spawn = PacketContainer::create(&schema(), PacketType::PlayServerSpawnEntity).unwrap();
        spawn.set_entity_id(100_001).unwrap();
        assert_eq!(spawn.entity_id().unwrap(), 100_001);
        assert!(matches!(
            spawn.message(),
            Err(ProtoError::WrongPacketType { operation: "message", .. })
        ));

        let mut chat = PacketContainer::create(&schema(), PacketType::PlayClientChat).unwrap();
        chat.set_message("gg").unwrap();
        assert_eq!(chat.message().unwrap(), "gg");
        assert!(chat.entity_id().is_err());
        assert!(chat.block_position().is_err());

        let mut dig = PacketContainer::create(&schema(), PacketType::PlayClientBlockDig).unwrap();
        dig.block_positions().write(0, BlockPos::new(1, 2, 3)).unwrap();
        assert_eq!(dig.block_position().unwrap(), BlockPos::new(1, 2, 3));
    }

    #[test]
    fn relative_move_entity_id_comes_from_parent() {
        let mut packet =
            PacketContainer::create(&schema(), PacketType::PlayServerRelEntityMove).unwrap();
        packet.integers().write(0, 42).unwrap();
        packet.shorts().write(0, 4096).unwrap();
        assert_eq!(packet.entity_id().unwrap(), 42);
        assert_eq!(packet.shorts().size(), 3);
    }

    #[test]
    fn summary_lists_values() {
        let mut chat = PacketContainer::create(&schema(), PacketType::PlayClientChat).unwrap();
        chat.set_message("hi").unwrap();
        assert_eq!(chat.summary(), "PLAY_CLIENT_CHAT ints=[0] strings=[\"hi\"]");
    }
}
