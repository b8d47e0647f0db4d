//! Closure-based listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mc_intercept_proto::{PacketContainer, PacketType};

use super::{ExpiringListener, ListenerPipeline, ListenerPriority, ListenerResult, PacketListener};
use crate::error::InterceptError;
use crate::host::ConnectionInfo;
use crate::task::{Task, TaskScheduler};

/// Callback for one direction.
pub type PacketHandler =
    Arc<dyn Fn(&ConnectionInfo, &mut PacketContainer) -> ListenerResult + Send + Sync>;

type ConnectionFilter = Arc<dyn Fn(&ConnectionInfo) -> bool + Send + Sync>;

/// Fluent construction of a listener from closures.
///
/// ```ignore
/// ListenerBuilder::new("chat-mute")
///     .types(&[PacketType::PlayClientChat])
///     .on_receive(|_, _| Ok(false))
///     .expire_after(Duration::from_secs(30))
///     .register(&pipeline, tasks)?;
/// ```
pub struct ListenerBuilder {
    name: String,
    priority: ListenerPriority,
    sending: Vec<PacketType>,
    receiving: Vec<PacketType>,
    on_send: Option<PacketHandler>,
    on_receive: Option<PacketHandler>,
    filter: Option<ConnectionFilter>,
    expire_after: Option<Duration>,
    max_packets: Option<u32>,
    on_expire: Option<Task>,
    scoped: bool,
}

impl ListenerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: ListenerPriority::Normal,
            sending: Vec::new(),
            receiving: Vec::new(),
            on_send: None,
            on_receive: None,
            filter: None,
            expire_after: None,
            max_packets: None,
            on_expire: None,
            scoped: false,
        }
    }

    pub fn priority(mut self, priority: ListenerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Listen for `types`, routed to the sending or receiving side by their direction. A side
    /// that receives none of them listens to nothing.
    pub fn types(mut self, types: &[PacketType]) -> Self {
        self.scoped |= !types.is_empty();
        for &t in types {
            if t.is_client_to_server() {
                self.receiving.push(t);
            } else {
                self.sending.push(t);
            }
        }
        self
    }

    pub fn sending(mut self, types: &[PacketType]) -> Self {
        self.scoped |= !types.is_empty();
        self.sending.extend_from_slice(types);
        self
    }

    pub fn receiving(mut self, types: &[PacketType]) -> Self {
        self.scoped |= !types.is_empty();
        self.receiving.extend_from_slice(types);
        self
    }

    pub fn on_send<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionInfo, &mut PacketContainer) -> ListenerResult + Send + Sync + 'static,
    {
        self.on_send = Some(Arc::new(handler));
        self
    }

    pub fn on_receive<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionInfo, &mut PacketContainer) -> ListenerResult + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(handler));
        self
    }

    /// Only handle packets for connections matching `filter`; others are allowed untouched.
    pub fn for_connection<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.expire_after = Some(duration);
        self
    }

    pub fn expire_after_packets(mut self, count: u32) -> Self {
        self.max_packets = Some(count);
        self
    }

    pub fn on_expire<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_expire = Some(Box::new(callback));
        self
    }

    /// Build the listener. Expiry settings produce an [`ExpiringListener`] that removes itself
    /// from `pipeline` through `tasks`.
    pub fn build(
        self,
        pipeline: &Arc<ListenerPipeline>,
        tasks: Arc<dyn TaskScheduler>,
    ) -> Arc<dyn PacketListener> {
        let expiring = self.expire_after.is_some() || self.max_packets.is_some();
        let (expire_after, max_packets, on_expire) =
            (self.expire_after, self.max_packets, self.on_expire);
        let listener = FnListener {
            name: self.name,
            priority: self.priority,
            sending: self.sending,
            receiving: self.receiving,
            on_send: self.on_send,
            on_receive: self.on_receive,
            filter: self.filter,
            scoped: self.scoped,
            enabled: AtomicBool::new(true),
        };
        if !expiring {
            return Arc::new(listener);
        }
        ExpiringListener::new(
            Box::new(listener),
            expire_after,
            max_packets,
            on_expire,
            pipeline,
            tasks,
        )
    }

    /// Build and register in one step.
    pub fn register(
        self,
        pipeline: &Arc<ListenerPipeline>,
        tasks: Arc<dyn TaskScheduler>,
    ) -> Result<Arc<dyn PacketListener>, InterceptError> {
        let listener = self.build(pipeline, tasks);
        pipeline.register(listener.clone())?;
        Ok(listener)
    }
}

struct FnListener {
    name: String,
    priority: ListenerPriority,
    sending: Vec<PacketType>,
    receiving: Vec<PacketType>,
    on_send: Option<PacketHandler>,
    on_receive: Option<PacketHandler>,
    filter: Option<ConnectionFilter>,
    scoped: bool,
    enabled: AtomicBool,
}

impl FnListener {
    fn applies_to(&self, conn: &ConnectionInfo) -> bool {
        self.filter.as_ref().map_or(true, |f| f(conn))
    }

    fn matches(&self, types: &[PacketType], packet_type: PacketType) -> bool {
        if types.is_empty() {
            !self.scoped
        } else {
            types.contains(&packet_type)
        }
    }
}

impl PacketListener for FnListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> ListenerPriority {
        self.priority
    }

    fn sending_types(&self) -> &[PacketType] {
        &self.sending
    }

    fn receiving_types(&self) -> &[PacketType] {
        &self.receiving
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn listens_sending(&self, packet_type: PacketType) -> bool {
        self.on_send.is_some() && self.matches(&self.sending, packet_type)
    }

    fn listens_receiving(&self, packet_type: PacketType) -> bool {
        self.on_receive.is_some() && self.matches(&self.receiving, packet_type)
    }

    fn on_sending(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> ListenerResult {
        match &self.on_send {
            Some(handler) if self.applies_to(conn) => handler(conn, packet),
            _ => Ok(true),
        }
    }

    fn on_receiving(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> ListenerResult {
        match &self.on_receive {
            Some(handler) if self.applies_to(conn) => handler(conn, packet),
            _ => Ok(true),
        }
    }
}
