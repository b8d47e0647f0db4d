//! libpcap capture of intercepted packets.
//!
//! Files use the classic big-endian pcap layout with link type 147 (user-defined). Each record
//! carries one packet:
//!
//! ```text
//! u16 len + player name | u8 outgoing | u16 len + type name | i32 len + encoded packet
//! ```
//!
//! When a packet cannot be encoded the length is `-1` and the integer, string and double
//! views follow instead, each as an `i32` count plus values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use mc_intercept_proto::PacketContainer;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::InterceptError;
use crate::host::{ConnectionId, ConnectionInfo};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_SNAPLEN: u32 = 65535;
pub const PCAP_LINKTYPE_USER0: u32 = 147;

struct PcapRecord {
    timestamp: SystemTime,
    data: Vec<u8>,
}

struct Capture {
    path: PathBuf,
    tx: UnboundedSender<PcapRecord>,
    writer: JoinHandle<()>,
}

/// Per-connection capture sessions, each drained by its own writer task.
#[derive(Default)]
pub struct PcapExporter {
    captures: Mutex<HashMap<ConnectionId, Capture>>,
}

impl PcapExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path`, write the global header and start capturing `conn`. A running capture
    /// for the same connection is replaced.
    pub async fn start(&self, conn: ConnectionId, path: impl AsRef<Path>) -> Result<(), InterceptError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path).await?;
        file.write_all(&global_header()).await?;
        file.flush().await?;

        let (tx, rx) = unbounded_channel();
        let writer = tokio::spawn(write_records(file, rx, path.clone()));
        let previous = self.captures.lock().ok().and_then(|mut c| {
            c.insert(
                conn,
                Capture {
                    path: path.clone(),
                    tx,
                    writer,
                },
            )
        });
        if let Some(previous) = previous {
            debug!("Replacing capture {}", previous.path.display());
        }
        info!("Capturing {conn} to {}", path.display());
        Ok(())
    }

    /// Stop capturing and wait for queued records to reach the file.
    pub async fn stop(&self, conn: ConnectionId) -> Option<PathBuf> {
        let capture = self.captures.lock().ok()?.remove(&conn)?;
        drop(capture.tx);
        if let Err(e) = capture.writer.await {
            warn!("PCAP writer for {} ended abnormally: {e}", capture.path.display());
        }
        info!("Stopped capture {}", capture.path.display());
        Some(capture.path)
    }

    /// Stop capturing without waiting; the writer drains what is queued and exits.
    pub fn detach(&self, conn: ConnectionId) {
        if let Ok(mut captures) = self.captures.lock() {
            captures.remove(&conn);
        }
    }

    pub fn is_capturing(&self, conn: ConnectionId) -> bool {
        self.captures
            .lock()
            .map(|c| c.contains_key(&conn))
            .unwrap_or(false)
    }

    /// Queue a packet if `conn` is being captured.
    pub fn record(&self, conn: &ConnectionInfo, packet: &PacketContainer, outgoing: bool) {
        let Ok(captures) = self.captures.lock() else {
            return;
        };
        let Some(capture) = captures.get(&conn.id) else {
            return;
        };
        let record = PcapRecord {
            timestamp: SystemTime::now(),
            data: record_payload(&conn.name, outgoing, packet),
        };
        // A closed channel means the writer gave up; it already logged why.
        let _ = capture.tx.send(record);
    }
}

async fn write_records(mut file: File, mut rx: UnboundedReceiver<PcapRecord>, path: PathBuf) {
    while let Some(record) = rx.recv().await {
        let mut buf = record_header(record.timestamp, record.data.len());
        buf.extend_from_slice(&record.data);
        let result = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("PCAP write to {} failed, capture stopped: {e}", path.display());
            return;
        }
    }
}

pub fn global_header() -> [u8; 24] {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u32(PCAP_MAGIC);
    buf.put_u16(PCAP_VERSION_MAJOR);
    buf.put_u16(PCAP_VERSION_MINOR);
    buf.put_i32(0); // GMT
    buf.put_u32(0); // timestamp accuracy
    buf.put_u32(PCAP_SNAPLEN);
    buf.put_u32(PCAP_LINKTYPE_USER0);
    let mut out = [0u8; 24];
    out.copy_from_slice(&buf);
    out
}

fn record_header(timestamp: SystemTime, len: usize) -> Vec<u8> {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut buf = Vec::with_capacity(16 + len);
    buf.put_u32(since_epoch.as_secs() as u32);
    buf.put_u32(since_epoch.subsec_micros());
    buf.put_u32(len as u32);
    buf.put_u32(len as u32);
    buf
}

fn put_short_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

pub fn record_payload(player: &str, outgoing: bool, packet: &PacketContainer) -> Vec<u8> {
    let mut buf = Vec::new();
    put_short_string(&mut buf, player);
    buf.put_u8(outgoing as u8);
    put_short_string(&mut buf, packet.packet_type().name());
    match packet.handle().encode() {
        Ok(raw) => {
            buf.put_i32(raw.len() as i32);
            buf.put_slice(&raw);
        }
        Err(_) => {
            buf.put_i32(-1);
            let ints = packet.values::<i32>();
            buf.put_i32(ints.len() as i32);
            for i in ints {
                buf.put_i32(i);
            }
            let strings = packet.values::<String>();
            buf.put_i32(strings.len() as i32);
            for s in strings {
                put_short_string(&mut buf, &s);
            }
            let doubles = packet.values::<f64>();
            buf.put_i32(doubles.len() as i32);
            for d in doubles {
                buf.put_f64(d);
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_intercept_proto::{PacketType, Schema, Uuid};

    #[test]
    fn header_layout() {
        let h = global_header();
        assert_eq!(&h[0..4], &[0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(&h[4..8], &[0, 2, 0, 4]);
        assert_eq!(&h[8..16], &[0; 8]);
        assert_eq!(&h[16..20], &65535u32.to_be_bytes());
        assert_eq!(&h[20..24], &147u32.to_be_bytes());
    }

    #[test]
    fn payload_carries_name_direction_and_encoding() {
        let schema = Schema::builtin().unwrap();
        let mut chat = PacketContainer::create(&schema, PacketType::PlayClientChat).unwrap();
        chat.set_message("hi").unwrap();
        let payload = record_payload("Alex", false, &chat);

        assert_eq!(&payload[0..2], &[0, 4]);
        assert_eq!(&payload[2..6], b"Alex");
        assert_eq!(payload[6], 0);
        let type_name = b"PLAY_CLIENT_CHAT";
        assert_eq!(&payload[7..9], &(type_name.len() as u16).to_be_bytes());
        assert_eq!(&payload[9..9 + type_name.len()], type_name);

        let raw = chat.handle().encode().unwrap();
        let rest = &payload[9 + type_name.len()..];
        assert_eq!(&rest[..4], &(raw.len() as i32).to_be_bytes());
        assert_eq!(&rest[4..], &raw[..]);
    }

    #[tokio::test]
    async fn capture_writes_records_until_stopped() {
        let schema = Schema::builtin().unwrap();
        let exporter = PcapExporter::new();
        let conn = ConnectionInfo::new(Uuid::random(), "Steve");
        let path = std::env::temp_dir().join(format!("mc-intercept-{}.pcap", conn.id));

        let mut keep_alive = PacketContainer::create(&schema, PacketType::PlayServerKeepAlive).unwrap();
        keep_alive.longs().write(0, 42).unwrap();
        // Not capturing yet: dropped.
        exporter.record(&conn, &keep_alive, true);

        exporter.start(conn.id, &path).await.unwrap();
        assert!(exporter.is_capturing(conn.id));
        exporter.record(&conn, &keep_alive, true);
        exporter.record(&conn, &keep_alive, true);
        assert_eq!(exporter.stop(conn.id).await, Some(path.clone()));
        assert!(!exporter.is_capturing(conn.id));

        let bytes = tokio::fs::read(&path).await.unwrap();
        let payload_len = record_payload("Steve", true, &keep_alive).len();
        assert_eq!(bytes.len(), 24 + 2 * (16 + payload_len));
        assert_eq!(&bytes[..24], &global_header());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
