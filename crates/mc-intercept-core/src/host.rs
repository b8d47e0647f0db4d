//! Seams to the host: transports, player identity, world state, error reporting.

use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use mc_intercept_proto::{BlockPos, PacketContainer, Uuid};
use mc_intercept_script::ScriptPlayer;
use tracing::error;

use crate::error::InterceptError;

/// Connections are identified by the player's UUID.
pub type ConnectionId = Uuid;

/// Identity of one connected player.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: String,
    pub address: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn script_player(&self) -> ScriptPlayer {
        ScriptPlayer {
            uuid: self.id,
            name: self.name.clone(),
            address: self.address.map(|a| a.to_string()),
        }
    }
}

/// Raw write side of a client connection. Receives complete, length-prefixed frames.
pub trait FrameTransport: Send + Sync {
    fn write_frame(&self, frame: Bytes) -> Result<(), InterceptError>;
}

/// What happened to a packet handed to a [`PacketSender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// A listener cancelled it.
    Cancelled,
    /// The connection is gone or the packet could not be written.
    Dropped,
}

/// Outbound path used by producers (fake managers, scheduler, effects).
pub trait PacketSender: Send + Sync {
    fn send_packet(&self, conn: ConnectionId, packet: PacketContainer) -> SendOutcome;
    fn is_online(&self, conn: ConnectionId) -> bool;
}

/// Who is connected.
pub trait PlayerDirectory: Send + Sync {
    fn player(&self, id: ConnectionId) -> Option<ConnectionInfo>;
    fn online(&self) -> Vec<ConnectionInfo>;
    fn find_by_name(&self, name: &str) -> Option<ConnectionInfo> {
        self.online()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Authoritative block states, used to undo fake blocks.
pub trait WorldView: Send + Sync {
    fn block_state(&self, pos: BlockPos) -> i32;
}

/// World view that reports air everywhere. Used when the host has no world access.
pub struct EmptyWorld;

impl WorldView for EmptyWorld {
    fn block_state(&self, _pos: BlockPos) -> i32 {
        0
    }
}

/// Receives failures that were contained instead of propagated.
pub trait ErrorSink: Send + Sync {
    fn report(&self, origin: &str, error: &dyn std::error::Error);
}

/// Default sink: log and move on.
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, origin: &str, error: &dyn std::error::Error) {
        error!("{origin}: {error}");
    }
}

/// Sink that keeps every report, for inspection.
#[derive(Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<String>>,
}

impl RecordingErrorSink {
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, origin: &str, error: &dyn std::error::Error) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(format!("{origin}: {error}"));
        }
    }
}
