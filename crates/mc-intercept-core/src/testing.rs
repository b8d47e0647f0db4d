//! Collaborator doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use mc_intercept_proto::{PacketContainer, Schema};

use crate::host::{ConnectionId, PacketSender, SendOutcome};

pub fn schema() -> Arc<Schema> {
    Arc::new(Schema::builtin().unwrap())
}

/// Keeps every packet it is asked to send. Connections marked offline get `Dropped`.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(ConnectionId, PacketContainer)>>,
    offline: Mutex<HashSet<ConnectionId>>,
}

impl RecordingSender {
    pub fn take(&self) -> Vec<(ConnectionId, PacketContainer)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn set_offline(&self, conn: ConnectionId) {
        self.offline.lock().unwrap().insert(conn);
    }
}

impl PacketSender for RecordingSender {
    fn send_packet(&self, conn: ConnectionId, packet: PacketContainer) -> SendOutcome {
        if !self.is_online(conn) {
            return SendOutcome::Dropped;
        }
        self.sent.lock().unwrap().push((conn, packet));
        SendOutcome::Sent
    }

    fn is_online(&self, conn: ConnectionId) -> bool {
        !self.offline.lock().unwrap().contains(&conn)
    }
}
