//! Recent packets per connection, for inspection from the console.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use mc_intercept_proto::{PacketContainer, PacketType};

use crate::host::ConnectionId;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: SystemTime,
    pub packet_type: PacketType,
    pub summary: String,
    pub cancelled: bool,
}

impl HistoryEntry {
    pub fn new(packet: &PacketContainer, cancelled: bool) -> Self {
        Self {
            timestamp: SystemTime::now(),
            packet_type: packet.packet_type(),
            summary: packet.summary(),
            cancelled,
        }
    }
}

/// Two bounded rings, oldest entries evicted first.
#[derive(Debug, Clone)]
pub struct PacketHistory {
    capacity: usize,
    incoming: VecDeque<HistoryEntry>,
    outgoing: VecDeque<HistoryEntry>,
}

impl PacketHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
        }
    }

    pub fn add_incoming(&mut self, entry: HistoryEntry) {
        push_bounded(&mut self.incoming, entry, self.capacity);
    }

    pub fn add_outgoing(&mut self, entry: HistoryEntry) {
        push_bounded(&mut self.outgoing, entry, self.capacity);
    }

    /// Up to `n` most recent inbound entries, oldest first.
    pub fn last_incoming(&self, n: usize) -> Vec<HistoryEntry> {
        tail(&self.incoming, n)
    }

    pub fn last_outgoing(&self, n: usize) -> Vec<HistoryEntry> {
        tail(&self.outgoing, n)
    }

    pub fn len(&self) -> (usize, usize) {
        (self.incoming.len(), self.outgoing.len())
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
    }
}

fn push_bounded(ring: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, capacity: usize) {
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(entry);
}

fn tail(ring: &VecDeque<HistoryEntry>, n: usize) -> Vec<HistoryEntry> {
    ring.iter().skip(ring.len().saturating_sub(n)).cloned().collect()
}

/// Histories for every connection.
pub struct HistoryStore {
    capacity: usize,
    histories: Mutex<HashMap<ConnectionId, PacketHistory>>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, conn: ConnectionId, inbound: bool, entry: HistoryEntry) {
        let Ok(mut histories) = self.histories.lock() else {
            return;
        };
        let history = histories
            .entry(conn)
            .or_insert_with(|| PacketHistory::new(self.capacity));
        if inbound {
            history.add_incoming(entry);
        } else {
            history.add_outgoing(entry);
        }
    }

    pub fn get(&self, conn: ConnectionId) -> Option<PacketHistory> {
        self.histories.lock().ok()?.get(&conn).cloned()
    }

    pub fn remove(&self, conn: ConnectionId) {
        if let Ok(mut histories) = self.histories.lock() {
            histories.remove(&conn);
        }
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.histories
            .lock()
            .map(|h| h.contains_key(&conn))
            .unwrap_or(false)
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
