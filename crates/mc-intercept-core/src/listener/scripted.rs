//! Listener backed by a named script filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mc_intercept_proto::{PacketContainer, PacketType};
use mc_intercept_script::ScriptEngine;

use super::{ListenerPriority, ListenerResult, PacketListener};
use crate::host::ConnectionInfo;

/// Runs `filter` for every packet it listens to. A `false` result cancels; script failures are
/// returned as errors, which the pipeline reports and treats as allow.
pub struct ScriptedListener {
    name: String,
    filter: String,
    engine: Arc<ScriptEngine>,
    priority: ListenerPriority,
    sending: Vec<PacketType>,
    receiving: Vec<PacketType>,
    scoped: bool,
    enabled: AtomicBool,
}

impl ScriptedListener {
    pub fn new(filter: impl Into<String>, engine: Arc<ScriptEngine>) -> Self {
        let filter = filter.into();
        Self {
            name: format!("script:{filter}"),
            filter,
            engine,
            priority: ListenerPriority::Normal,
            sending: Vec::new(),
            receiving: Vec::new(),
            scoped: false,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn with_priority(mut self, priority: ListenerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict to `types`, split by direction. A side that receives none of them is not
    /// listened to at all.
    pub fn with_types(mut self, types: &[PacketType]) -> Self {
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

    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn matches(&self, types: &[PacketType], packet_type: PacketType) -> bool {
        if types.is_empty() {
            !self.scoped
        } else {
            types.contains(&packet_type)
        }
    }

    fn run(&self, conn: &ConnectionInfo, packet: &PacketContainer) -> ListenerResult {
        Ok(self
            .engine
            .evaluate(&self.filter, &conn.script_player(), packet)?)
    }
}

impl PacketListener for ScriptedListener {
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
        self.matches(&self.sending, packet_type)
    }

    fn listens_receiving(&self, packet_type: PacketType) -> bool {
        self.matches(&self.receiving, packet_type)
    }

    fn on_sending(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> ListenerResult {
        self.run(conn, packet)
    }

    fn on_receiving(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> ListenerResult {
        self.run(conn, packet)
    }
}
