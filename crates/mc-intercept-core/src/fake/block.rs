use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mc_intercept_proto::types::SectionPos;
use mc_intercept_proto::{BlockPos, PacketContainer, PacketType, Schema};
use tracing::debug;

use crate::error::InterceptError;
use crate::host::{ConnectionId, PacketSender, WorldView};

/// Per-viewer fake block states. Clearing restores what the world really holds.
pub struct FakeBlockManager {
    schema: Arc<Schema>,
    sender: Arc<dyn PacketSender>,
    world: Arc<dyn WorldView>,
    blocks: Mutex<HashMap<ConnectionId, HashMap<BlockPos, i32>>>,
}

impl FakeBlockManager {
    pub fn new(schema: Arc<Schema>, sender: Arc<dyn PacketSender>, world: Arc<dyn WorldView>) -> Self {
        Self {
            schema,
            sender,
            world,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<ConnectionId, HashMap<BlockPos, i32>>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Show `state` at `pos` to every online viewer. Offline viewers are skipped.
    pub fn set_block(&self, pos: BlockPos, state: i32, viewers: &[ConnectionId]) -> Result<(), InterceptError> {
        let packet = self.block_change(pos, state)?;
        let viewers = self.record(viewers, |fake| {
            fake.insert(pos, state);
        });
        for viewer in viewers {
            self.sender.send_packet(viewer, packet.deep_clone());
        }
        Ok(())
    }

    /// Apply `update` to the fake blocks of each online viewer and return those viewers.
    /// Liveness is checked under the lock so a concurrent disconnect purge cannot miss an
    /// entry added here.
    fn record(
        &self,
        viewers: &[ConnectionId],
        update: impl Fn(&mut HashMap<BlockPos, i32>),
    ) -> Vec<ConnectionId> {
        let mut blocks = self.blocks();
        let online: Vec<ConnectionId> = viewers
            .iter()
            .copied()
            .filter(|v| self.sender.is_online(*v))
            .collect();
        for viewer in &online {
            update(blocks.entry(*viewer).or_default());
        }
        online
    }

    /// Set many blocks at once. Blocks sharing a chunk section go out as one multi-block
    /// change; a section holding a single block uses the plain block change.
    pub fn set_blocks(
        &self,
        changes: impl IntoIterator<Item = (BlockPos, i32)>,
        viewers: &[ConnectionId],
    ) -> Result<(), InterceptError> {
        let mut sections: BTreeMap<SectionPos, Vec<(BlockPos, i32)>> = BTreeMap::new();
        for (pos, state) in changes {
            sections.entry(pos.section_pos()).or_default().push((pos, state));
        }

        let mut packets = Vec::with_capacity(sections.len());
        for (section, changes) in &sections {
            let packet = match changes.as_slice() {
                [(pos, state)] => self.block_change(*pos, *state)?,
                _ => self.section_change(*section, changes)?,
            };
            packets.push(packet);
        }

        let viewers = self.record(viewers, |fake| {
            for changes in sections.values() {
                fake.extend(changes.iter().copied());
            }
        });
        for viewer in viewers {
            for packet in &packets {
                self.sender.send_packet(viewer, packet.deep_clone());
            }
        }
        Ok(())
    }

    /// Restore every fake block `viewer` has and forget them. A second call sends nothing.
    pub fn clear_player(&self, viewer: ConnectionId) -> Result<usize, InterceptError> {
        let Some(fake) = self.blocks().remove(&viewer) else {
            return Ok(0);
        };
        self.restore(viewer, fake.into_keys())
    }

    /// Restore the fake blocks of `viewer` inside the box spanned by `a` and `b`.
    pub fn clear_region(&self, viewer: ConnectionId, a: BlockPos, b: BlockPos) -> Result<usize, InterceptError> {
        let restored: Vec<BlockPos> = {
            let mut blocks = self.blocks();
            let Some(fake) = blocks.get_mut(&viewer) else {
                return Ok(0);
            };
            let inside: Vec<BlockPos> = fake.keys().filter(|p| p.within(a, b)).copied().collect();
            for pos in &inside {
                fake.remove(pos);
            }
            if fake.is_empty() {
                blocks.remove(&viewer);
            }
            inside
        };
        self.restore(viewer, restored)
    }

    fn restore(&self, viewer: ConnectionId, positions: impl IntoIterator<Item = BlockPos>) -> Result<usize, InterceptError> {
        if !self.sender.is_online(viewer) {
            return Ok(0);
        }
        let mut restored = 0;
        for pos in positions {
            let packet = self.block_change(pos, self.world.block_state(pos))?;
            self.sender.send_packet(viewer, packet);
            restored += 1;
        }
        debug!("Restored {restored} blocks for {viewer}");
        Ok(restored)
    }

    pub fn fake_block(&self, viewer: ConnectionId, pos: BlockPos) -> Option<i32> {
        self.blocks().get(&viewer)?.get(&pos).copied()
    }

    pub fn fake_count(&self, viewer: ConnectionId) -> usize {
        self.blocks().get(&viewer).map_or(0, |b| b.len())
    }

    /// Forget every fake block without restoring. For shutdown.
    pub fn clear_all(&self) {
        self.blocks().clear();
    }

    fn block_change(&self, pos: BlockPos, state: i32) -> Result<PacketContainer, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerBlockChange)?;
        packet.block_positions().write(0, pos)?;
        packet.integers().write(0, state)?;
        Ok(packet)
    }

    fn section_change(&self, section: SectionPos, changes: &[(BlockPos, i32)]) -> Result<PacketContainer, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerMultiBlockChange)?;
        packet.longs().write(0, section.pack())?;
        packet
            .short_arrays()
            .write(0, changes.iter().map(|(p, _)| SectionPos::relative_index(*p)).collect())?;
        packet
            .int_arrays()
            .write(0, changes.iter().map(|(_, s)| *s).collect())?;
        Ok(packet)
    }
}
