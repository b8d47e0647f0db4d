use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mc_intercept_proto::types::angle_to_byte;
use mc_intercept_proto::{Location, PacketContainer, PacketType, Schema, Uuid};
use tracing::debug;

use crate::error::InterceptError;
use crate::host::{ConnectionId, PacketSender};

/// Synthetic ids start here, above anything a server hands out in practice.
pub const FIRST_ENTITY_ID: i32 = 100_000;

/// Moves with any axis delta of this much or more are sent as teleports.
const TELEPORT_THRESHOLD: f64 = 8.0;

/// Relative moves are in 1/4096 of a block.
const MOVE_SCALE: f64 = 4096.0;

/// Entity metadata: shared flags byte at index 0, glowing bit.
const FLAGS_INDEX: i8 = 0;
const FLAGS_SERIALIZER: i32 = 0;
const GLOWING_FLAG: i8 = 0x40;

/// Registry id of the entity type and whether it spawns through the living-entity packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityKind {
    pub type_id: i32,
    pub living: bool,
}

impl EntityKind {
    pub const fn living(type_id: i32) -> Self {
        Self {
            type_id,
            living: true,
        }
    }

    pub const fn object(type_id: i32) -> Self {
        Self {
            type_id,
            living: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeEntity {
    pub id: i32,
    pub uuid: Uuid,
    pub kind: EntityKind,
    pub location: Location,
    pub viewers: BTreeSet<ConnectionId>,
    pub glowing: bool,
}

#[derive(Default)]
struct EntityState {
    entities: HashMap<i32, FakeEntity>,
    by_viewer: HashMap<ConnectionId, BTreeSet<i32>>,
}

/// Tracks fake entities and which viewers can see them. Packets are built under the state
/// lock and sent after it is released.
pub struct FakeEntityManager {
    schema: Arc<Schema>,
    sender: Arc<dyn PacketSender>,
    next_id: AtomicI32,
    state: Mutex<EntityState>,
}

impl FakeEntityManager {
    pub fn new(schema: Arc<Schema>, sender: Arc<dyn PacketSender>) -> Self {
        Self {
            schema,
            sender,
            next_id: AtomicI32::new(FIRST_ENTITY_ID),
            state: Mutex::new(EntityState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn for every online viewer in `viewers`. Offline viewers are skipped; the entity is
    /// kept even when none remain and can be shown later.
    pub fn spawn_entity(
        &self,
        location: Location,
        kind: EntityKind,
        viewers: &[ConnectionId],
    ) -> Result<i32, InterceptError> {
        let mut entity = FakeEntity {
            id: self.allocate_id(),
            uuid: Uuid::random(),
            kind,
            location,
            viewers: BTreeSet::new(),
            glowing: false,
        };
        let packet = self.spawn_packet(&entity)?;
        let id = entity.id;
        {
            // Liveness is checked under the lock so a concurrent disconnect purge cannot miss
            // an entry added here.
            let mut state = self.state();
            for viewer in viewers {
                if self.sender.is_online(*viewer) {
                    entity.viewers.insert(*viewer);
                    state.by_viewer.entry(*viewer).or_default().insert(id);
                }
            }
            state.entities.insert(id, entity.clone());
        }
        self.send_each(entity.viewers.iter().copied(), &packet);
        debug!(
            "Spawned fake entity {id} (type {}) for {} viewers",
            kind.type_id,
            entity.viewers.len()
        );
        Ok(id)
    }

    /// Living kinds use the dedicated mob spawn where the protocol still has one; newer
    /// revisions spawn every kind through the generic packet.
    fn spawn_packet(&self, entity: &FakeEntity) -> Result<PacketContainer, InterceptError> {
        let mob_spawn = self.schema.class_for(PacketType::PlayServerSpawnEntityLiving).is_some();
        let packet_type = if entity.kind.living && mob_spawn {
            PacketType::PlayServerSpawnEntityLiving
        } else {
            PacketType::PlayServerSpawnEntity
        };
        let loc = entity.location;
        let mut packet = PacketContainer::create(&self.schema, packet_type)?;
        packet
            .integers()
            .write(0, entity.id)?
            .write(1, entity.kind.type_id)?;
        packet.uuids().write(0, entity.uuid)?;
        packet
            .doubles()
            .write(0, loc.x)?
            .write(1, loc.y)?
            .write(2, loc.z)?;
        packet
            .bytes()
            .write(0, angle_to_byte(loc.pitch))?
            .write(1, angle_to_byte(loc.yaw))?
            .write(2, angle_to_byte(loc.yaw))?;
        Ok(packet)
    }

    pub fn move_entity(&self, id: i32, location: Location) -> Result<(), InterceptError> {
        let (previous, viewers) = {
            let mut state = self.state();
            let entity = state
                .entities
                .get_mut(&id)
                .ok_or(InterceptError::UnknownEntity(id))?;
            let previous = entity.location;
            entity.location = location;
            (previous, entity.viewers.clone())
        };

        let packet = if let Some([dx, dy, dz]) = relative_move(previous, location) {
            let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerRelEntityMove)?;
            packet.set_entity_id(id)?;
            packet.shorts().write(0, dx)?.write(1, dy)?.write(2, dz)?;
            packet
        } else {
            let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerEntityTeleport)?;
            packet.set_entity_id(id)?;
            packet
                .doubles()
                .write(0, location.x)?
                .write(1, location.y)?
                .write(2, location.z)?;
            packet
                .bytes()
                .write(0, angle_to_byte(location.yaw))?
                .write(1, angle_to_byte(location.pitch))?;
            packet
        };
        self.send_each(viewers, &packet);
        Ok(())
    }

    pub fn set_glowing(&self, id: i32, glowing: bool) -> Result<(), InterceptError> {
        let viewers = {
            let mut state = self.state();
            let entity = state
                .entities
                .get_mut(&id)
                .ok_or(InterceptError::UnknownEntity(id))?;
            entity.glowing = glowing;
            entity.viewers.clone()
        };
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerEntityMetadata)?;
        packet.integers().write(0, id)?.write(1, FLAGS_SERIALIZER)?;
        packet
            .bytes()
            .write(0, FLAGS_INDEX)?
            .write(1, if glowing { GLOWING_FLAG } else { 0 })?;
        self.send_each(viewers, &packet);
        Ok(())
    }

    /// Make an existing entity visible to one more viewer.
    pub fn show_to(&self, id: i32, viewer: ConnectionId) -> Result<(), InterceptError> {
        let entity = {
            let mut state = self.state();
            let entity = state
                .entities
                .get_mut(&id)
                .ok_or(InterceptError::UnknownEntity(id))?;
            if !entity.viewers.insert(viewer) {
                return Ok(());
            }
            let entity = entity.clone();
            state.by_viewer.entry(viewer).or_default().insert(id);
            entity
        };
        let packet = self.spawn_packet(&entity)?;
        self.sender.send_packet(viewer, packet);
        if entity.glowing {
            self.set_glowing(id, true)?;
        }
        Ok(())
    }

    pub fn hide_from(&self, id: i32, viewer: ConnectionId) -> Result<(), InterceptError> {
        {
            let mut state = self.state();
            let entity = state
                .entities
                .get_mut(&id)
                .ok_or(InterceptError::UnknownEntity(id))?;
            if !entity.viewers.remove(&viewer) {
                return Ok(());
            }
            if let Some(ids) = state.by_viewer.get_mut(&viewer) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.by_viewer.remove(&viewer);
                }
            }
        }
        self.sender.send_packet(viewer, self.destroy_packet(vec![id])?);
        Ok(())
    }

    /// Destroy for every viewer and forget. Unknown ids are ignored.
    pub fn remove_entity(&self, id: i32) -> Result<(), InterceptError> {
        let removed = {
            let mut state = self.state();
            let removed = state.entities.remove(&id);
            if let Some(entity) = &removed {
                for viewer in &entity.viewers {
                    if let Some(ids) = state.by_viewer.get_mut(viewer) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            state.by_viewer.remove(viewer);
                        }
                    }
                }
            }
            removed
        };
        let Some(entity) = removed else {
            return Ok(());
        };
        let packet = self.destroy_packet(vec![id])?;
        self.send_each(entity.viewers.iter().copied(), &packet);
        Ok(())
    }

    /// Destroy everything `viewer` can see in one packet and drop the viewer's bookkeeping.
    /// Entities left without any viewer are forgotten.
    pub fn clear_player(&self, viewer: ConnectionId) -> Result<(), InterceptError> {
        let ids = {
            let mut state = self.state();
            let Some(ids) = state.by_viewer.remove(&viewer) else {
                return Ok(());
            };
            for id in &ids {
                let orphaned = state.entities.get_mut(id).is_some_and(|entity| {
                    entity.viewers.remove(&viewer);
                    entity.viewers.is_empty()
                });
                if orphaned {
                    state.entities.remove(id);
                }
            }
            ids
        };
        if ids.is_empty() || !self.sender.is_online(viewer) {
            return Ok(());
        }
        let packet = self.destroy_packet(ids.into_iter().collect())?;
        self.sender.send_packet(viewer, packet);
        Ok(())
    }

    /// Remove every fake entity from every viewer.
    pub fn clear_all(&self) -> Result<(), InterceptError> {
        let viewers: Vec<ConnectionId> = self.state().by_viewer.keys().copied().collect();
        for viewer in viewers {
            self.clear_player(viewer)?;
        }
        self.state().entities.clear();
        Ok(())
    }

    pub fn entity(&self, id: i32) -> Option<FakeEntity> {
        self.state().entities.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entities currently visible to `viewer`.
    pub fn viewer_count(&self, viewer: ConnectionId) -> usize {
        self.state().by_viewer.get(&viewer).map_or(0, |ids| ids.len())
    }

    fn destroy_packet(&self, ids: Vec<i32>) -> Result<PacketContainer, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerEntityDestroy)?;
        packet.int_arrays().write(0, ids)?;
        Ok(packet)
    }

    fn send_each(&self, viewers: impl IntoIterator<Item = ConnectionId>, packet: &PacketContainer) {
        for viewer in viewers {
            if self.sender.is_online(viewer) {
                self.sender.send_packet(viewer, packet.deep_clone());
            }
        }
    }
}

/// Per-axis deltas in 1/4096 block, or `None` when the move needs a teleport. Deltas are taken
/// between quantized positions so that a run of small moves does not drift.
fn relative_move(from: Location, to: Location) -> Option<[i16; 3]> {
    let axis = |a: f64, b: f64| {
        if (b - a).abs() >= TELEPORT_THRESHOLD {
            return None;
        }
        let delta = (b * MOVE_SCALE).round() as i64 - (a * MOVE_SCALE).round() as i64;
        i16::try_from(delta).ok()
    };
    Some([axis(from.x, to.x)?, axis(from.y, to.y)?, axis(from.z, to.z)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{schema, RecordingSender};
    use std::collections::HashSet;

    const ZOMBIE: EntityKind = EntityKind::living(124);
    const ARROW: EntityKind = EntityKind::object(4);

    fn setup() -> (FakeEntityManager, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        (FakeEntityManager::new(schema(), sender.clone()), sender)
    }

    #[test]
    fn thousand_ids_are_distinct_and_high() {
        let (manager, _) = setup();
        let ids: HashSet<i32> = (0..1000).map(|_| manager.allocate_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|&id| id >= FIRST_ENTITY_ID));
    }

    #[test]
    fn spawn_reaches_viewers_only() {
        let (manager, sender) = setup();
        let (a, b) = (Uuid::new(0, 1), Uuid::new(0, 2));
        let zombie = manager
            .spawn_entity(Location::new(1.0, 64.0, 2.0), ZOMBIE, &[a, b])
            .unwrap();
        let arrow = manager
            .spawn_entity(Location::new(0.0, 70.0, 0.0), ARROW, &[a])
            .unwrap();
        assert!(arrow > zombie);

        let sent = sender.take();
        assert_eq!(sent.len(), 3);
        // The built-in revision has no separate mob spawn.
        assert_eq!(sent[0].1.packet_type(), PacketType::PlayServerSpawnEntity);
        assert_eq!(sent[0].1.entity_id().unwrap(), zombie);
        assert_eq!(sent[0].1.read::<i32>(1).unwrap(), 124);
        assert_eq!(sent[0].1.read::<f64>(1).unwrap(), 64.0);
        assert_eq!(sent[2].0, a);
        assert_eq!(sent[2].1.packet_type(), PacketType::PlayServerSpawnEntity);
        assert_eq!(manager.viewer_count(a), 2);
        assert_eq!(manager.viewer_count(b), 1);
    }

    #[test]
    fn small_moves_are_relative_large_moves_teleport() {
        let (manager, sender) = setup();
        let viewer = Uuid::new(0, 1);
        let id = manager
            .spawn_entity(Location::new(0.0, 64.0, 0.0), ZOMBIE, &[viewer])
            .unwrap();
        sender.take();

        manager.move_entity(id, Location::new(0.5, 64.0, -1.0)).unwrap();
        manager.move_entity(id, Location::new(20.0, 64.0, -1.0)).unwrap();
        let sent = sender.take();
        assert_eq!(sent[0].1.packet_type(), PacketType::PlayServerRelEntityMove);
        assert_eq!(sent[0].1.values::<i16>(), vec![2048, 0, -4096]);
        assert_eq!(sent[0].1.entity_id().unwrap(), id);
        assert_eq!(sent[1].1.packet_type(), PacketType::PlayServerEntityTeleport);
        assert_eq!(sent[1].1.read::<f64>(0).unwrap(), 20.0);
        assert_eq!(manager.entity(id).unwrap().location.x, 20.0);

        assert!(matches!(
            manager.move_entity(1, Location::default()),
            Err(InterceptError::UnknownEntity(1))
        ));
    }

    #[test]
    fn clear_player_batches_one_destroy() {
        let (manager, sender) = setup();
        let (a, b) = (Uuid::new(0, 1), Uuid::new(0, 2));
        let first = manager.spawn_entity(Location::default(), ZOMBIE, &[a, b]).unwrap();
        let second = manager.spawn_entity(Location::default(), ARROW, &[a]).unwrap();
        sender.take();

        manager.clear_player(a).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.packet_type(), PacketType::PlayServerEntityDestroy);
        assert_eq!(sent[0].1.read::<Vec<i32>>(0).unwrap(), vec![first, second]);
        assert_eq!(manager.viewer_count(a), 0);
        assert!(!manager.entity(first).unwrap().viewers.contains(&a));
        // Nobody else could see the second one.
        assert!(manager.entity(second).is_none());
        assert_eq!(manager.len(), 1);

        // Later updates no longer reach the cleared viewer.
        manager.move_entity(first, Location::new(1.0, 0.0, 0.0)).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);

        manager.clear_player(a).unwrap();
        assert!(sender.take().is_empty());
    }

    #[test]
    fn visibility_glow_and_removal() {
        let (manager, sender) = setup();
        let (a, b) = (Uuid::new(0, 1), Uuid::new(0, 2));
        let id = manager.spawn_entity(Location::default(), ZOMBIE, &[a]).unwrap();
        manager.set_glowing(id, true).unwrap();
        sender.take();

        // New viewers get the spawn and the current glow state.
        manager.show_to(id, b).unwrap();
        let sent = sender.take();
        let types: Vec<_> = sent.iter().map(|(_, p)| p.packet_type()).collect();
        assert_eq!(types[0], PacketType::PlayServerSpawnEntity);
        assert!(types[1..].iter().all(|t| *t == PacketType::PlayServerEntityMetadata));
        assert_eq!(sent[1].1.read::<i8>(1).unwrap(), GLOWING_FLAG);

        manager.hide_from(id, a).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, a);
        assert_eq!(manager.viewer_count(a), 0);
        assert!(manager.state().by_viewer.get(&a).is_none());

        manager.remove_entity(id).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
        assert!(manager.is_empty());
        manager.remove_entity(id).unwrap();
    }

    #[test]
    fn eight_blocks_is_a_teleport() {
        let (manager, sender) = setup();
        let viewer = Uuid::new(0, 1);
        let id = manager.spawn_entity(Location::default(), ARROW, &[viewer]).unwrap();
        sender.take();

        manager.move_entity(id, Location::new(8.0, 0.0, 0.0)).unwrap();
        manager.move_entity(id, Location::new(8.0, -7.5, 0.0)).unwrap();
        let sent = sender.take();
        assert_eq!(sent[0].1.packet_type(), PacketType::PlayServerEntityTeleport);
        assert_eq!(sent[1].1.packet_type(), PacketType::PlayServerRelEntityMove);
        assert_eq!(sent[1].1.values::<i16>(), vec![0, -30720, 0]);
    }

    #[test]
    fn small_moves_do_not_drift() {
        let (manager, sender) = setup();
        let viewer = Uuid::new(0, 1);
        let id = manager.spawn_entity(Location::default(), ARROW, &[viewer]).unwrap();
        sender.take();

        for step in 1..=10 {
            manager.move_entity(id, Location::new(step as f64 * 0.1, 0.0, 0.0)).unwrap();
        }
        let total: i32 = sender
            .take()
            .iter()
            .map(|(_, p)| i32::from(p.values::<i16>()[0]))
            .sum();
        assert_eq!(total, 4096);
    }

    #[test]
    fn offline_viewers_get_no_bookkeeping() {
        let (manager, sender) = setup();
        let (online, gone) = (Uuid::new(0, 1), Uuid::new(0, 2));
        sender.set_offline(gone);
        let id = manager.spawn_entity(Location::default(), ZOMBIE, &[online, gone]).unwrap();
        assert_eq!(manager.viewer_count(gone), 0);
        assert!(!manager.entity(id).unwrap().viewers.contains(&gone));
        assert_eq!(sender.take().len(), 1);
    }
}
