//! Client-side illusions: entities and blocks that exist only in selected viewers' clients.

mod block;
mod entity;

pub use block::FakeBlockManager;
pub use entity::{EntityKind, FakeEntity, FakeEntityManager, FIRST_ENTITY_ID};
