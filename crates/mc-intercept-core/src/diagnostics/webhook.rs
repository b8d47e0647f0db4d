//! Forward selected packet types to an HTTP endpoint as JSON.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mc_intercept_proto::{PacketContainer, PacketType};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::error::InterceptError;
use crate::host::ConnectionInfo;

const USER_AGENT: &str = concat!("mc-intercept/", env!("CARGO_PKG_VERSION"));
const TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebhookSink {
    url: String,
    subscriptions: RwLock<HashSet<PacketType>>,
    tx: UnboundedSender<Value>,
}

impl WebhookSink {
    /// Start the delivery task. Must be called from within a tokio runtime.
    pub fn start(url: impl Into<String>) -> Result<Self, InterceptError> {
        let url = url.into();
        let client = Client::builder()
            .timeout(TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| InterceptError::Transport(e.to_string()))?;
        let (tx, rx) = unbounded_channel();
        tokio::spawn(deliver(client, url.clone(), rx));
        Ok(Self {
            url,
            subscriptions: RwLock::new(HashSet::new()),
            tx,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subscribe(&self, packet_type: PacketType) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.insert(packet_type);
        }
    }

    pub fn unsubscribe(&self, packet_type: PacketType) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.remove(&packet_type);
        }
    }

    pub fn is_subscribed(&self, packet_type: PacketType) -> bool {
        self.subscriptions
            .read()
            .map(|s| s.contains(&packet_type))
            .unwrap_or(false)
    }

    /// Queue a packet for delivery if its type is subscribed.
    pub fn log(&self, conn: &ConnectionInfo, packet: &PacketContainer, outgoing: bool) {
        if !self.is_subscribed(packet.packet_type()) {
            return;
        }
        let _ = self.tx.send(payload(conn, packet, outgoing));
    }
}

async fn deliver(client: Client, url: String, mut rx: UnboundedReceiver<Value>) {
    while let Some(body) = rx.recv().await {
        match client.post(&url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                debug!("Webhook {url} answered {}", response.status());
            }
            Ok(_) => {}
            Err(e) => warn!("Webhook {url} failed: {e}"),
        }
    }
}

pub fn payload(conn: &ConnectionInfo, packet: &PacketContainer, outgoing: bool) -> Value {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut data = serde_json::Map::new();
    let ints = packet.values::<i32>();
    if !ints.is_empty() {
        data.insert("integers".into(), json!(ints));
    }
    let strings = packet.values::<String>();
    if !strings.is_empty() {
        data.insert("strings".into(), json!(strings));
    }
    json!({
        "player": conn.name,
        "uuid": conn.id.to_string(),
        "packet_type": packet.packet_type().name(),
        "direction": if outgoing { "OUTGOING" } else { "INCOMING" },
        "timestamp": timestamp,
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_intercept_proto::{Schema, Uuid};

    #[test]
    fn payload_shape() {
        let schema = Schema::builtin().unwrap();
        let mut chat = PacketContainer::create(&schema, PacketType::PlayClientChat).unwrap();
        chat.set_message("hello").unwrap();
        let conn = ConnectionInfo::new(Uuid::new(0, 7), "Alex");

        let value = payload(&conn, &chat, false);
        assert_eq!(value["player"], "Alex");
        assert_eq!(value["uuid"], Uuid::new(0, 7).to_string());
        assert_eq!(value["packet_type"], "PLAY_CLIENT_CHAT");
        assert_eq!(value["direction"], "INCOMING");
        assert_eq!(value["data"]["strings"][0], "hello");
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn only_subscribed_types_are_queued() {
        let sink = WebhookSink::start("http://127.0.0.1:9/hook").unwrap();
        assert!(!sink.is_subscribed(PacketType::PlayClientChat));
        sink.subscribe(PacketType::PlayClientChat);
        assert!(sink.is_subscribed(PacketType::PlayClientChat));
        sink.unsubscribe(PacketType::PlayClientChat);
        assert!(!sink.is_subscribed(PacketType::PlayClientChat));
        assert_eq!(sink.url(), "http://127.0.0.1:9/hook");
    }
}
