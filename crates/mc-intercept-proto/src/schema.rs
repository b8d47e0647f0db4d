//! Wire schema: the load-time table of wire classes and their ordered field slots.
//!
//! A [`Schema`] describes one protocol revision. Each [`WireClass`] lists its own fields in
//! declaration order and may extend a parent class; the flattened slot layout is the class's own
//! fields followed by its ancestors'. Accessors only ever depend on that order and on the
//! declared kinds, so a new revision is a new schema file rather than a code change.
//!
//! The order on the wire is separate from the slot layout. By default ancestors' fields come
//! first; a class whose packet interleaves them names its fields in `wire` order instead.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::debug;

use crate::error::ProtoError;
use crate::field::FieldKind;
use crate::packet_type::{Direction, PacketType, Phase};

/// Built-in schema shipped with the crate.
const BUILTIN_SCHEMA: &str = include_str!("../schema/default.toml");

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
    /// Boxed slot: may hold `Null`, encoded with a presence flag.
    #[serde(default)]
    pub nullable: bool,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, kind)
        }
    }
}

/// A wire class: the shape of one packet structure.
#[derive(Debug)]
pub struct WireClass {
    name: String,
    parent: Option<Arc<WireClass>>,
    phase: Phase,
    direction: Direction,
    packet_id: Option<u32>,
    layout: Vec<FieldDecl>,
    /// Slot indices in the order they are encoded.
    wire_order: Vec<usize>,
    /// Memoized accessor slot lists, keyed by target type.
    accessors: RwLock<HashMap<TypeId, Arc<[usize]>>>,
}

impl WireClass {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<WireClass>> {
        self.parent.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// `None` for abstract classes that only exist as parents.
    pub fn packet_id(&self) -> Option<u32> {
        self.packet_id
    }

    /// Flattened slots: own fields first, then each ancestor's in turn.
    pub fn layout(&self) -> &[FieldDecl] {
        &self.layout
    }

    /// Slot indices in encoding order.
    pub fn wire_order(&self) -> &[usize] {
        &self.wire_order
    }

    /// This class followed by its ancestors.
    pub fn lineage(&self) -> impl Iterator<Item = &WireClass> {
        std::iter::successors(Some(self), |c| c.parent.as_deref())
    }

    /// Packet type for this class, trying ancestors before giving up.
    pub fn packet_type(&self) -> PacketType {
        self.lineage()
            .map(|c| PacketType::from_class(&c.name))
            .find(|t| *t != PacketType::Unknown)
            .unwrap_or(PacketType::Unknown)
    }

    /// Slot indices assignable to the target type, computed once per (class, type).
    pub(crate) fn slots_for(
        &self,
        type_id: TypeId,
        matches: impl Fn(FieldKind) -> bool,
    ) -> Arc<[usize]> {
        if let Ok(cache) = self.accessors.read() {
            if let Some(slots) = cache.get(&type_id) {
                return slots.clone();
            }
        }
        let slots: Arc<[usize]> = self
            .layout
            .iter()
            .enumerate()
            .filter(|(_, decl)| matches(decl.kind))
            .map(|(i, _)| i)
            .collect();
        match self.accessors.write() {
            Ok(mut cache) => cache.entry(type_id).or_insert(slots).clone(),
            Err(_) => slots,
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// An immutable set of wire classes for one protocol revision.
#[derive(Debug)]
pub struct Schema {
    protocol_version: i32,
    classes: HashMap<String, Arc<WireClass>>,
    by_id: HashMap<(Phase, Direction, u32), Arc<WireClass>>,
}

impl Schema {
    /// The schema embedded in the crate.
    pub fn builtin() -> Result<Self, ProtoError> {
        Self::from_toml(BUILTIN_SCHEMA)
    }

    /// Parse a schema description.
    pub fn from_toml(source: &str) -> Result<Self, ProtoError> {
        let file: SchemaFile = toml::from_str(source)?;
        let mut builder = SchemaBuilder::new(file.protocol_version);
        for class in file.class {
            builder = builder.class(ClassDef {
                name: class.name,
                parent: class.parent,
                phase: class.phase,
                direction: class.direction,
                packet_id: class.id,
                fields: class.fields,
                wire: class.wire,
            });
        }
        builder.build()
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn class(&self, name: &str) -> Option<&Arc<WireClass>> {
        self.classes.get(name)
    }

    /// Wire class carrying `packet_type`, if this revision has one.
    pub fn class_for(&self, packet_type: PacketType) -> Option<&Arc<WireClass>> {
        packet_type.class_name().and_then(|name| self.classes.get(name))
    }

    pub fn class_by_id(&self, phase: Phase, direction: Direction, id: u32) -> Option<&Arc<WireClass>> {
        self.by_id.get(&(phase, direction, id))
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<WireClass>> {
        self.classes.values()
    }
}

/// Explicit class registration, used by `from_toml` and by code that builds schemas directly.
pub struct SchemaBuilder {
    protocol_version: i32,
    defs: Vec<ClassDef>,
}

/// Definition of one class before resolution.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub parent: Option<String>,
    pub phase: Phase,
    pub direction: Direction,
    pub packet_id: Option<u32>,
    pub fields: Vec<FieldDecl>,
    /// Field names in wire order, when ancestors-first is not how the packet is laid out.
    pub wire: Option<Vec<String>>,
}

impl SchemaBuilder {
    pub fn new(protocol_version: i32) -> Self {
        Self {
            protocol_version,
            defs: Vec::new(),
        }
    }

    pub fn class(mut self, def: ClassDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Resolve parents and index classes. Parents must be declared before their children.
    pub fn build(self) -> Result<Schema, ProtoError> {
        let mut classes: HashMap<String, Arc<WireClass>> = HashMap::new();
        let mut by_id = HashMap::new();

        for def in self.defs {
            if classes.contains_key(&def.name) {
                return Err(ProtoError::InvalidSchema(format!("duplicate class {}", def.name)));
            }
            let parent = match &def.parent {
                Some(p) => Some(classes.get(p).cloned().ok_or_else(|| {
                    ProtoError::InvalidSchema(format!("{} extends undeclared {p}", def.name))
                })?),
                None => None,
            };
            let own = def.fields.len();
            let mut layout = def.fields;
            if let Some(parent) = &parent {
                layout.extend(parent.layout.iter().cloned());
            }
            let wire_order = match &def.wire {
                Some(names) => explicit_wire_order(&def.name, &layout, names)?,
                None => parent
                    .iter()
                    .flat_map(|p| p.wire_order.iter().map(move |i| i + own))
                    .chain(0..own)
                    .collect(),
            };
            if let Some(pos) = wire_order
                .iter()
                .position(|&i| layout[i].kind == FieldKind::Remaining)
            {
                if pos + 1 != wire_order.len() {
                    return Err(ProtoError::InvalidSchema(format!(
                        "{}: trailing field {} is not last on the wire",
                        def.name, layout[wire_order[pos]].name
                    )));
                }
            }
            let class = Arc::new(WireClass {
                name: def.name.clone(),
                parent,
                phase: def.phase,
                direction: def.direction,
                packet_id: def.packet_id,
                layout,
                wire_order,
                accessors: RwLock::new(HashMap::new()),
            });
            if let Some(id) = def.packet_id {
                let key = (def.phase, def.direction, id);
                if let Some(existing) = by_id.insert(key, class.clone()) {
                    return Err(ProtoError::InvalidSchema(format!(
                        "{} and {} share id 0x{id:02X}",
                        existing.name, def.name
                    )));
                }
            }
            classes.insert(def.name, class);
        }

        debug!(
            "Schema for protocol {} loaded: {} classes",
            self.protocol_version,
            classes.len()
        );
        Ok(Schema {
            protocol_version: self.protocol_version,
            classes,
            by_id,
        })
    }
}

/// Resolve field names to slot indices; every slot must appear exactly once.
fn explicit_wire_order(
    class: &str,
    layout: &[FieldDecl],
    names: &[String],
) -> Result<Vec<usize>, ProtoError> {
    let mut order = Vec::with_capacity(names.len());
    for name in names {
        let index = layout
            .iter()
            .position(|decl| &decl.name == name)
            .ok_or_else(|| ProtoError::InvalidSchema(format!("{class}: wire names unknown field {name}")))?;
        if order.contains(&index) {
            return Err(ProtoError::InvalidSchema(format!("{class}: {name} repeated in wire order")));
        }
        order.push(index);
    }
    if order.len() != layout.len() {
        return Err(ProtoError::InvalidSchema(format!(
            "{class}: wire order lists {} of {} fields",
            order.len(),
            layout.len()
        )));
    }
    Ok(order)
}

#[derive(Deserialize)]
struct SchemaFile {
    protocol_version: i32,
    #[serde(default)]
    class: Vec<ClassEntry>,
}

#[derive(Deserialize)]
struct ClassEntry {
    name: String,
    #[serde(default)]
    parent: Option<String>,
    phase: Phase,
    direction: Direction,
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    fields: Vec<FieldDecl>,
    #[serde(default)]
    wire: Option<Vec<String>>,
}
