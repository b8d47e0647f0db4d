//! Wire model for the interception layer: schema-driven packet structures, indexed field
//! access, the packet type registry and stream framing.

pub mod accessor;
pub mod codec;
pub mod compression;
pub mod container;
pub mod error;
pub mod field;
pub mod frame;
pub mod handle;
pub mod packet_type;
pub mod schema;
pub mod types;

pub use accessor::{FieldAccessor, StructureModifier};
pub use container::PacketContainer;
pub use error::ProtoError;
pub use field::{FieldKind, FieldValue};
pub use handle::WireHandle;
pub use packet_type::{Direction, PacketType, Phase};
pub use schema::Schema;
pub use types::{BlockPos, Location, Uuid};
