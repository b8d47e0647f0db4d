//! What we can tell about a client from its handshake and channel traffic.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use mc_intercept_proto::{PacketContainer, PacketType};
use tracing::{debug, warn};

use crate::host::ConnectionId;

/// Channel fragments used by known client-side cheat/recording mods.
const SUSPICIOUS_CHANNELS: &[&str] = &["wdl", "5zig", "liteloader"];

const FORGE_MARKER: &str = "\0FML";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModLoader {
    Vanilla,
    Forge,
    Fabric,
}

impl ModLoader {
    pub fn name(self) -> &'static str {
        match self {
            ModLoader::Vanilla => "Vanilla",
            ModLoader::Forge => "Forge",
            ModLoader::Fabric => "Fabric",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub protocol_version: i32,
    pub next_state: i32,
    pub mod_loader: ModLoader,
    /// Threshold announced by the server, once compression is on.
    pub compression_threshold: Option<i32>,
    pub suspicious: bool,
    pub custom_channels: BTreeSet<String>,
    pub registered_channels: BTreeSet<String>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            protocol_version: -1,
            next_state: -1,
            mod_loader: ModLoader::Vanilla,
            compression_threshold: None,
            suspicious: false,
            custom_channels: BTreeSet::new(),
            registered_channels: BTreeSet::new(),
        }
    }
}

impl ClientInfo {
    pub fn is_modded(&self) -> bool {
        self.mod_loader != ModLoader::Vanilla
    }

    pub fn version_name(&self) -> String {
        version_name(self.protocol_version)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown ({})", self.protocol_version))
    }
}

/// Release name for a protocol version.
pub fn version_name(protocol_version: i32) -> Option<&'static str> {
    Some(match protocol_version {
        766 => "1.20.5",
        765 => "1.20.4",
        764 => "1.20.2",
        763 => "1.20.1",
        762 => "1.19.4",
        761 => "1.19.3",
        760 => "1.19.2",
        759 => "1.19",
        758 => "1.18.2",
        757 => "1.18.1",
        756 => "1.17.1",
        755 => "1.17",
        754 => "1.16.5",
        340 => "1.12.2",
        47 => "1.8.9",
        _ => return None,
    })
}

#[derive(Default)]
pub struct CapabilityDetector {
    clients: Mutex<HashMap<ConnectionId, ClientInfo>>,
}

impl CapabilityDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect an inbound packet. Anything other than the handshake and custom payloads is
    /// ignored; payload data is only looked at once a handshake was seen.
    pub fn observe(&self, conn: ConnectionId, packet: &PacketContainer) {
        match packet.packet_type() {
            PacketType::HandshakeClientSetProtocol => self.observe_handshake(conn, packet),
            PacketType::PlayClientCustomPayload | PacketType::ConfigurationClientCustomPayload => {
                self.observe_payload(conn, packet)
            }
            _ => {}
        }
    }

    fn observe_handshake(&self, conn: ConnectionId, packet: &PacketContainer) {
        let ints = packet.values::<i32>();
        let host: String = packet.read(0).unwrap_or_default();
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        let info = clients.entry(conn).or_default();
        info.protocol_version = ints.first().copied().unwrap_or(-1);
        info.next_state = ints.get(1).copied().unwrap_or(-1);
        if host.contains(FORGE_MARKER) {
            info.mod_loader = ModLoader::Forge;
        } else if host.contains("fabric") {
            info.mod_loader = ModLoader::Fabric;
        }
        debug!(
            "{conn}: protocol {} ({}), next state {}, {}",
            info.protocol_version,
            info.version_name(),
            info.next_state,
            info.mod_loader.name()
        );
    }

    fn observe_payload(&self, conn: ConnectionId, packet: &PacketContainer) {
        let Ok(channel) = packet.read::<String>(0) else {
            return;
        };
        let data: Vec<u8> = packet.read(0).unwrap_or_default();
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        let Some(info) = clients.get_mut(&conn) else {
            return;
        };

        if SUSPICIOUS_CHANNELS.iter().any(|s| channel.contains(s)) && !info.suspicious {
            info.suspicious = true;
            warn!("{conn}: suspicious channel '{channel}'");
        }
        match channel.as_str() {
            "minecraft:register" | "REGISTER" => {
                for registered in String::from_utf8_lossy(&data).split('\0') {
                    if registered.is_empty() {
                        continue;
                    }
                    if SUSPICIOUS_CHANNELS.iter().any(|s| registered.contains(s)) {
                        info.suspicious = true;
                    }
                    info.registered_channels.insert(registered.to_string());
                }
            }
            "minecraft:brand" | "MC|Brand" => {
                let brand = String::from_utf8_lossy(&data).to_ascii_lowercase();
                if brand.contains("fabric") {
                    info.mod_loader = ModLoader::Fabric;
                } else if brand.contains("forge") {
                    info.mod_loader = ModLoader::Forge;
                }
            }
            _ => {}
        }
        info.custom_channels.insert(channel);
    }

    pub fn compression_enabled(&self, conn: ConnectionId, threshold: i32) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(info) = clients.get_mut(&conn) {
                info.compression_threshold = Some(threshold);
            }
        }
    }

    pub fn info(&self, conn: ConnectionId) -> Option<ClientInfo> {
        self.clients.lock().ok()?.get(&conn).cloned()
    }

    pub fn remove(&self, conn: ConnectionId) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&conn);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_intercept_proto::{Schema, Uuid};

    fn handshake(schema: &Schema, host: &str) -> PacketContainer {
        let mut p = PacketContainer::create(schema, PacketType::HandshakeClientSetProtocol).unwrap();
        p.integers().write(0, 765).unwrap().write(1, 2).unwrap();
        p.strings().write(0, host.to_string()).unwrap();
        p
    }

    fn payload(schema: &Schema, channel: &str, data: &[u8]) -> PacketContainer {
        let mut p = PacketContainer::create(schema, PacketType::PlayClientCustomPayload).unwrap();
        p.strings().write(0, channel.to_string()).unwrap();
        p.byte_arrays().write(0, data.to_vec()).unwrap();
        p
    }

    #[test]
    fn handshake_sets_version_and_loader() {
        let schema = Schema::builtin().unwrap();
        let detector = CapabilityDetector::new();
        let conn = Uuid::new(9, 9);
        detector.observe(conn, &handshake(&schema, "play.example.net\0FML\0"));

        let info = detector.info(conn).unwrap();
        assert_eq!(info.protocol_version, 765);
        assert_eq!(info.version_name(), "1.20.4");
        assert_eq!(info.next_state, 2);
        assert_eq!(info.mod_loader, ModLoader::Forge);
        assert!(info.is_modded());
    }

    #[test]
    fn register_channels_split_on_nul() {
        let schema = Schema::builtin().unwrap();
        let detector = CapabilityDetector::new();
        let conn = Uuid::new(9, 9);
        detector.observe(conn, &handshake(&schema, "localhost"));
        detector.observe(
            conn,
            &payload(&schema, "minecraft:register", b"voice:talk\0wdl:init\0"),
        );
        detector.compression_enabled(conn, 256);

        let info = detector.info(conn).unwrap();
        assert_eq!(info.mod_loader, ModLoader::Vanilla);
        assert!(info.registered_channels.contains("voice:talk"));
        assert!(info.registered_channels.contains("wdl:init"));
        assert_eq!(info.registered_channels.len(), 2);
        assert!(info.suspicious);
        assert_eq!(info.compression_threshold, Some(256));
    }

    #[test]
    fn payload_before_handshake_is_ignored() {
        let schema = Schema::builtin().unwrap();
        let detector = CapabilityDetector::new();
        let conn = Uuid::new(1, 1);
        detector.observe(conn, &payload(&schema, "minecraft:brand", b"fabric"));
        assert!(detector.info(conn).is_none());

        detector.observe(conn, &handshake(&schema, "localhost"));
        detector.observe(conn, &payload(&schema, "minecraft:brand", b"fabric"));
        assert_eq!(detector.info(conn).unwrap().mod_loader, ModLoader::Fabric);

        detector.remove(conn);
        assert!(detector.is_empty());
    }

    #[test]
    fn brand_sent_during_configuration_counts() {
        let schema = Schema::builtin().unwrap();
        let detector = CapabilityDetector::new();
        let conn = Uuid::new(2, 2);
        detector.observe(conn, &handshake(&schema, "localhost"));

        let mut brand =
            PacketContainer::create(&schema, PacketType::ConfigurationClientCustomPayload).unwrap();
        brand.strings().write(0, "minecraft:brand".into()).unwrap();
        // The brand is itself a length-prefixed string inside the payload.
        brand.byte_arrays().write(0, b"\x06fabric".to_vec()).unwrap();
        detector.observe(conn, &brand);
        assert_eq!(detector.info(conn).unwrap().mod_loader, ModLoader::Fabric);
    }

    #[test]
    fn unknown_versions_are_labelled() {
        let info = ClientInfo {
            protocol_version: 1,
            ..ClientInfo::default()
        };
        assert_eq!(info.version_name(), "Unknown (1)");
    }
}
