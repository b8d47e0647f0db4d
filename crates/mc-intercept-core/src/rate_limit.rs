//! Per-connection, per-packet-type rate limiting over fixed one-second windows.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mc_intercept_proto::PacketType;

use crate::host::ConnectionId;

pub const WINDOW: Duration = Duration::from_secs(1);

/// Limits applied when nothing else is configured.
pub const DEFAULT_LIMITS: &[(PacketType, u32)] = &[
    (PacketType::PlayClientChat, 3),
    (PacketType::PlayClientArmAnimation, 20),
    (PacketType::PlayClientPosition, 50),
    (PacketType::PlayClientPositionLook, 50),
    (PacketType::PlayClientLook, 50),
    (PacketType::PlayClientFlying, 50),
    (PacketType::PlayClientBlockDig, 30),
    (PacketType::PlayClientBlockPlace, 30),
];

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
    max: u32,
}

pub struct RateLimiter {
    defaults: Mutex<HashMap<PacketType, u32>>,
    windows: Mutex<HashMap<(ConnectionId, PacketType), Window>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_limits(DEFAULT_LIMITS.iter().copied())
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: impl IntoIterator<Item = (PacketType, u32)>) -> Self {
        Self {
            defaults: Mutex::new(limits.into_iter().filter(|(_, max)| *max > 0).collect()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Change the limit for new windows. `0` removes the limit.
    pub fn set_default_limit(&self, packet_type: PacketType, max_per_second: u32) {
        if let Ok(mut defaults) = self.defaults.lock() {
            if max_per_second == 0 {
                defaults.remove(&packet_type);
            } else {
                defaults.insert(packet_type, max_per_second);
            }
        }
    }

    pub fn default_limit(&self, packet_type: PacketType) -> Option<u32> {
        self.defaults.lock().ok()?.get(&packet_type).copied()
    }

    pub fn should_limit(&self, conn: ConnectionId, packet_type: PacketType) -> bool {
        self.should_limit_at(conn, packet_type, Instant::now())
    }

    /// [`should_limit`](Self::should_limit) against an explicit clock.
    pub fn should_limit_at(&self, conn: ConnectionId, packet_type: PacketType, now: Instant) -> bool {
        let Some(max) = self.default_limit(packet_type) else {
            return false;
        };
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        let window = windows.entry((conn, packet_type)).or_insert(Window {
            start: now,
            count: 0,
            max,
        });
        if now.saturating_duration_since(window.start) >= WINDOW {
            window.start = now;
            window.count = 1;
            return false;
        }
        if window.count < window.max {
            window.count += 1;
            return false;
        }
        true
    }

    pub fn clear_connection(&self, conn: ConnectionId) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.retain(|(id, _), _| *id != conn);
        }
    }

    /// Number of live windows held for `conn`.
    pub fn tracked(&self, conn: ConnectionId) -> usize {
        self.windows
            .lock()
            .map(|w| w.keys().filter(|(id, _)| *id == conn).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_intercept_proto::Uuid;

    #[test]
    fn chat_three_per_second_then_resets() {
        let limiter = RateLimiter::new();
        let conn = Uuid::new(1, 2);
        let t0 = Instant::now();
        let chat = PacketType::PlayClientChat;

        assert!(!limiter.should_limit_at(conn, chat, t0));
        assert!(!limiter.should_limit_at(conn, chat, t0 + Duration::from_millis(10)));
        assert!(!limiter.should_limit_at(conn, chat, t0 + Duration::from_millis(20)));
        assert!(limiter.should_limit_at(conn, chat, t0 + Duration::from_millis(30)));
        assert!(limiter.should_limit_at(conn, chat, t0 + Duration::from_millis(900)));

        // New window: counter restarts at one.
        let t1 = t0 + Duration::from_millis(1100);
        assert!(!limiter.should_limit_at(conn, chat, t1));
        assert!(!limiter.should_limit_at(conn, chat, t1 + Duration::from_millis(1)));
        assert!(!limiter.should_limit_at(conn, chat, t1 + Duration::from_millis(2)));
        assert!(limiter.should_limit_at(conn, chat, t1 + Duration::from_millis(3)));
    }

    #[test]
    fn unlisted_types_are_never_limited() {
        let limiter = RateLimiter::new();
        let conn = Uuid::new(1, 2);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(!limiter.should_limit_at(conn, PacketType::PlayClientKeepAlive, now));
        }
        assert_eq!(limiter.tracked(conn), 0);
    }

    #[test]
    fn connections_and_types_are_independent() {
        let limiter = RateLimiter::with_limits([(PacketType::PlayClientChat, 1)]);
        let (a, b) = (Uuid::new(0, 1), Uuid::new(0, 2));
        let now = Instant::now();
        assert!(!limiter.should_limit_at(a, PacketType::PlayClientChat, now));
        assert!(limiter.should_limit_at(a, PacketType::PlayClientChat, now));
        assert!(!limiter.should_limit_at(b, PacketType::PlayClientChat, now));
    }

    #[test]
    fn clear_and_override() {
        let limiter = RateLimiter::new();
        let conn = Uuid::new(3, 3);
        limiter.should_limit(conn, PacketType::PlayClientChat);
        assert_eq!(limiter.tracked(conn), 1);
        limiter.clear_connection(conn);
        assert_eq!(limiter.tracked(conn), 0);

        limiter.set_default_limit(PacketType::PlayClientChat, 0);
        assert_eq!(limiter.default_limit(PacketType::PlayClientChat), None);
        limiter.set_default_limit(PacketType::PlayClientKeepAlive, 5);
        assert_eq!(limiter.default_limit(PacketType::PlayClientKeepAlive), Some(5));
    }
}
