//! Priority-ordered listener dispatch.
//!
//! Registration and removal rebuild an immutable snapshot (buckets plus a per-type lookup
//! table) and swap it in. Dispatch only clones the current snapshot's list for the packet's
//! type, so it never contends with other dispatches and never observes a half-applied change.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use mc_intercept_proto::{Direction, PacketContainer, PacketType};
use tracing::{debug, trace};

use super::{ListenerKey, ListenerPriority, PacketListener};
use crate::error::{InterceptError, ListenerError};
use crate::host::{ConnectionInfo, ErrorSink};

type ListenerList = Arc<[Arc<dyn PacketListener>]>;

/// Outcome of running a packet through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Continue,
    Cancelled,
}

impl DispatchResult {
    pub fn is_cancelled(self) -> bool {
        self == DispatchResult::Cancelled
    }
}

#[derive(Default)]
struct Snapshot {
    buckets: [Vec<Arc<dyn PacketListener>>; 6],
    sending: HashMap<PacketType, ListenerList>,
    receiving: HashMap<PacketType, ListenerList>,
}

impl Snapshot {
    fn contains(&self, key: ListenerKey) -> bool {
        self.ordered().any(|l| ListenerKey::of(l) == key)
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn PacketListener>> {
        self.buckets.iter().flatten()
    }

    /// Recompute the per-type tables from the buckets.
    fn rebuild(buckets: [Vec<Arc<dyn PacketListener>>; 6]) -> Self {
        let mut snapshot = Snapshot {
            buckets,
            ..Default::default()
        };
        let types = PacketType::ALL.iter().copied().chain([PacketType::Unknown]);
        for packet_type in types {
            let sending: Vec<_> = snapshot
                .ordered()
                .filter(|l| l.listens_sending(packet_type))
                .cloned()
                .collect();
            if !sending.is_empty() {
                snapshot.sending.insert(packet_type, sending.into());
            }
            let receiving: Vec<_> = snapshot
                .ordered()
                .filter(|l| l.listens_receiving(packet_type))
                .cloned()
                .collect();
            if !receiving.is_empty() {
                snapshot.receiving.insert(packet_type, receiving.into());
            }
        }
        snapshot
    }
}

pub struct ListenerPipeline {
    snapshot: RwLock<Arc<Snapshot>>,
    errors: Arc<dyn ErrorSink>,
}

impl ListenerPipeline {
    pub fn new(errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            errors,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Add a listener at the end of its priority bucket.
    pub fn register(&self, listener: Arc<dyn PacketListener>) -> Result<ListenerKey, InterceptError> {
        let key = ListenerKey::of(&listener);
        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        if guard.contains(key) {
            return Err(InterceptError::DuplicateListener(listener.name().to_string()));
        }
        let mut buckets = guard.buckets.clone();
        debug!(
            "Registered listener '{}' at {:?}",
            listener.name(),
            listener.priority()
        );
        buckets[listener.priority().slot()].push(listener);
        *guard = Arc::new(Snapshot::rebuild(buckets));
        Ok(key)
    }

    /// Remove a listener. Absent listeners are ignored.
    pub fn unregister(&self, listener: &Arc<dyn PacketListener>) -> bool {
        self.unregister_key(ListenerKey::of(listener))
    }

    pub fn unregister_key(&self, key: ListenerKey) -> bool {
        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        if !guard.contains(key) {
            return false;
        }
        let mut buckets = guard.buckets.clone();
        for bucket in &mut buckets {
            bucket.retain(|l| ListenerKey::of(l) != key);
        }
        *guard = Arc::new(Snapshot::rebuild(buckets));
        true
    }

    pub fn is_registered(&self, key: ListenerKey) -> bool {
        self.current().contains(key)
    }

    /// Every listener in dispatch order.
    pub fn listeners(&self) -> Vec<Arc<dyn PacketListener>> {
        self.current().ordered().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current().ordered().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(Snapshot::default());
    }

    pub fn dispatch_sending(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> DispatchResult {
        self.dispatch(Direction::ServerToClient, conn, packet)
    }

    pub fn dispatch_receiving(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> DispatchResult {
        self.dispatch(Direction::ClientToServer, conn, packet)
    }

    /// Run every interested listener in priority order. The first listener that returns
    /// `false` cancels the packet and stops dispatch; `Monitor` listeners only see packets that
    /// survived and their verdict is ignored.
    pub fn dispatch(
        &self,
        direction: Direction,
        conn: &ConnectionInfo,
        packet: &mut PacketContainer,
    ) -> DispatchResult {
        let packet_type = packet.packet_type();
        let snapshot = self.current();
        let table = match direction {
            Direction::ServerToClient => &snapshot.sending,
            Direction::ClientToServer => &snapshot.receiving,
            Direction::Unknown => return DispatchResult::Continue,
        };
        let Some(listeners) = table.get(&packet_type) else {
            return DispatchResult::Continue;
        };

        for listener in listeners.iter() {
            if !listener.is_enabled() {
                continue;
            }
            let allow = self.invoke(listener.as_ref(), direction, conn, packet);
            if !allow && listener.priority() != ListenerPriority::Monitor {
                trace!(
                    "{} to {} cancelled by '{}'",
                    packet_type,
                    conn.name,
                    listener.name()
                );
                return DispatchResult::Cancelled;
            }
        }
        DispatchResult::Continue
    }

    fn invoke(
        &self,
        listener: &dyn PacketListener,
        direction: Direction,
        conn: &ConnectionInfo,
        packet: &mut PacketContainer,
    ) -> bool {
        let packet_type = packet.packet_type();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if direction == Direction::ServerToClient {
                listener.on_sending(conn, packet)
            } else {
                listener.on_receiving(conn, packet)
            }
        }));
        let error = match outcome {
            Ok(Ok(allow)) => return allow,
            Ok(Err(e)) => e,
            Err(payload) => ListenerError::Panicked(panic_message(payload.as_ref())),
        };
        let origin = format!("listener '{}' on {packet_type}", listener.name());
        self.errors.report(&origin, &error);
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
