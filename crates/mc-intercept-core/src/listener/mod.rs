//! Packet listeners and the dispatch pipeline.

mod builder;
mod expiring;
mod group;
mod pipeline;
mod scripted;

pub use builder::{ListenerBuilder, PacketHandler};
pub use expiring::ExpiringListener;
pub use group::ListenerGroup;
pub use pipeline::{DispatchResult, ListenerPipeline};
pub use scripted::ScriptedListener;

use std::sync::Arc;

use mc_intercept_proto::{PacketContainer, PacketType};

use crate::error::ListenerError;
use crate::host::ConnectionInfo;

/// `Ok(true)` allows the packet, `Ok(false)` cancels it. Errors count as allow.
pub type ListenerResult = Result<bool, ListenerError>;

/// Dispatch order, lowest first. `Monitor` listeners observe the final outcome and cannot
/// cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ListenerPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Monitor,
}

impl ListenerPriority {
    pub const ALL: [ListenerPriority; 6] = [
        ListenerPriority::Lowest,
        ListenerPriority::Low,
        ListenerPriority::Normal,
        ListenerPriority::High,
        ListenerPriority::Highest,
        ListenerPriority::Monitor,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Observer of packets in one or both directions.
///
/// By default an empty type list means "every type" in that direction; implementations that
/// scope themselves to one side override `listens_*`. Callbacks run on I/O threads and must not
/// block.
pub trait PacketListener: Send + Sync {
    fn name(&self) -> &str {
        "anonymous"
    }

    fn priority(&self) -> ListenerPriority {
        ListenerPriority::Normal
    }

    fn sending_types(&self) -> &[PacketType] {
        &[]
    }

    fn receiving_types(&self) -> &[PacketType] {
        &[]
    }

    fn is_enabled(&self) -> bool {
        true
    }

    /// Toggle dispatch to this listener. Listeners without a switch ignore it.
    fn set_enabled(&self, _enabled: bool) {}

    /// Server to client.
    fn on_sending(&self, _conn: &ConnectionInfo, _packet: &mut PacketContainer) -> ListenerResult {
        Ok(true)
    }

    /// Client to server.
    fn on_receiving(&self, _conn: &ConnectionInfo, _packet: &mut PacketContainer) -> ListenerResult {
        Ok(true)
    }

    fn listens_sending(&self, packet_type: PacketType) -> bool {
        let types = self.sending_types();
        types.is_empty() || types.contains(&packet_type)
    }

    fn listens_receiving(&self, packet_type: PacketType) -> bool {
        let types = self.receiving_types();
        types.is_empty() || types.contains(&packet_type)
    }
}

/// Identity of a registered listener: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(usize);

impl ListenerKey {
    pub fn of(listener: &Arc<dyn PacketListener>) -> Self {
        Self::from_ptr(Arc::as_ptr(listener))
    }

    pub(crate) fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        ListenerKey(ptr as *const () as usize)
    }
}
