//! Observation sinks fed by the injectors: history, packet capture, webhooks, debug logging.

pub mod history;
pub mod pcap;
pub mod webhook;

pub use history::{HistoryEntry, HistoryStore, PacketHistory};
pub use pcap::PcapExporter;
pub use webhook::WebhookSink;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use mc_intercept_proto::PacketContainer;
use tracing::{debug, info};

use crate::host::{ConnectionId, ConnectionInfo};

pub struct Diagnostics {
    debug: AtomicBool,
    history: HistoryStore,
    pcap: PcapExporter,
    webhook: RwLock<Option<Arc<WebhookSink>>>,
    /// Connections whose traffic is printed as it passes.
    dumped: RwLock<HashSet<ConnectionId>>,
}

impl Diagnostics {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            debug: AtomicBool::new(false),
            history: HistoryStore::new(history_capacity),
            pcap: PcapExporter::new(),
            webhook: RwLock::new(None),
            dumped: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Print every packet of `conn` at info level. Returns whether the setting changed.
    pub fn set_dump(&self, conn: ConnectionId, enabled: bool) -> bool {
        let mut dumped = self.dumped.write().unwrap_or_else(PoisonError::into_inner);
        if enabled {
            dumped.insert(conn)
        } else {
            dumped.remove(&conn)
        }
    }

    pub fn is_dumped(&self, conn: ConnectionId) -> bool {
        self.dumped
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&conn)
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn pcap(&self) -> &PcapExporter {
        &self.pcap
    }

    pub fn set_webhook(&self, sink: Option<Arc<WebhookSink>>) {
        if let Ok(mut webhook) = self.webhook.write() {
            *webhook = sink;
        }
    }

    pub fn webhook(&self) -> Option<Arc<WebhookSink>> {
        self.webhook.read().ok()?.clone()
    }

    /// Record a packet after dispatch. `inbound` is client to server.
    pub fn record(&self, conn: &ConnectionInfo, packet: &PacketContainer, inbound: bool, cancelled: bool) {
        let arrow = if inbound { "->" } else { "<-" };
        let status = if cancelled { " (cancelled)" } else { "" };
        if self.is_dumped(conn.id) {
            info!("[dump] {} {arrow} {}{status}", conn.name, packet.summary());
        } else if self.is_debug() {
            debug!("{} {arrow} {}{status}", conn.name, packet.summary());
        }
        self.history
            .record(conn.id, inbound, HistoryEntry::new(packet, cancelled));
        if cancelled {
            return;
        }
        self.pcap.record(conn, packet, !inbound);
        if let Some(webhook) = self.webhook() {
            webhook.log(conn, packet, !inbound);
        }
    }

    /// Drop everything held for `conn`.
    pub fn purge(&self, conn: ConnectionId) {
        self.set_dump(conn, false);
        self.history.remove(conn);
        self.pcap.detach(conn);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(history::DEFAULT_CAPACITY)
    }
}
