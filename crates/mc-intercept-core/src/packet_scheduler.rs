//! Delayed, repeating and bundled packet sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mc_intercept_proto::PacketContainer;
use tracing::trace;

use crate::error::InterceptError;
use crate::host::{ConnectionId, PacketSender, SendOutcome};
use crate::task::{TaskControl, TaskHandle, TaskScheduler};

struct QueuedPacket {
    conn: ConnectionId,
    packet: PacketContainer,
    due_tick: u64,
}

struct RepeatingSend {
    conn: ConnectionId,
    handle: TaskHandle,
    finished: Arc<AtomicBool>,
}

pub struct PacketScheduler {
    sender: Arc<dyn PacketSender>,
    tasks: Arc<dyn TaskScheduler>,
    current_tick: AtomicU64,
    queue: Mutex<Vec<QueuedPacket>>,
    repeating: Mutex<Vec<RepeatingSend>>,
    bundles: Mutex<HashMap<String, Vec<PacketContainer>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PacketScheduler {
    pub fn new(sender: Arc<dyn PacketSender>, tasks: Arc<dyn TaskScheduler>) -> Self {
        Self {
            sender,
            tasks,
            current_tick: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
            repeating: Mutex::new(Vec::new()),
            bundles: Mutex::new(HashMap::new()),
        }
    }

    /// Send after `delay_ticks` ticks (at least one).
    pub fn send_later(&self, conn: ConnectionId, packet: PacketContainer, delay_ticks: u64) {
        let due_tick = self.current_tick.load(Ordering::Acquire) + delay_ticks.max(1);
        lock(&self.queue).push(QueuedPacket {
            conn,
            packet,
            due_tick,
        });
    }

    /// Send a copy every `period_ticks`, starting after `delay_ticks`, `count` times
    /// (0 = until cancelled). Stops by itself once the connection is gone.
    pub fn send_repeating(
        &self,
        conn: ConnectionId,
        packet: PacketContainer,
        delay_ticks: u64,
        period_ticks: u64,
        count: u32,
    ) -> TaskHandle {
        let sender = self.sender.clone();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let mut sent = 0u32;
        let handle = self.tasks.run_repeating(
            delay_ticks,
            period_ticks,
            Box::new(move || {
                if !sender.is_online(conn) {
                    done.store(true, Ordering::Release);
                    return TaskControl::Stop;
                }
                sender.send_packet(conn, packet.deep_clone());
                sent += 1;
                if count > 0 && sent >= count {
                    done.store(true, Ordering::Release);
                    return TaskControl::Stop;
                }
                TaskControl::Continue
            }),
        );
        lock(&self.repeating).push(RepeatingSend {
            conn,
            handle: handle.clone(),
            finished,
        });
        handle
    }

    pub fn cancel(&self, handle: &TaskHandle) {
        handle.cancel();
        lock(&self.repeating).retain(|r| r.handle != *handle);
    }

    /// Drop queued packets and stop repeating sends for `conn`.
    pub fn cancel_all(&self, conn: ConnectionId) {
        lock(&self.queue).retain(|q| q.conn != conn);
        lock(&self.repeating).retain(|r| {
            if r.conn == conn {
                r.handle.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Advance one tick: send every queued packet that is due to a live connection.
    pub fn tick(&self) {
        let now = self.current_tick.fetch_add(1, Ordering::AcqRel) + 1;
        let due: Vec<QueuedPacket> = {
            let mut queue = lock(&self.queue);
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(|q| q.due_tick <= now);
            *queue = waiting;
            due
        };
        for queued in due {
            if !self.sender.is_online(queued.conn) {
                trace!("Dropping scheduled packet for gone connection {}", queued.conn);
                continue;
            }
            self.sender.send_packet(queued.conn, queued.packet);
        }
        lock(&self.repeating)
            .retain(|r| !r.finished.load(Ordering::Acquire) && !r.handle.is_cancelled());
    }

    pub fn queued(&self, conn: ConnectionId) -> usize {
        lock(&self.queue).iter().filter(|q| q.conn == conn).count()
    }

    pub fn repeating(&self, conn: ConnectionId) -> usize {
        lock(&self.repeating).iter().filter(|r| r.conn == conn).count()
    }

    // ─── Bundles ──────────────────────────────────────────────────────────

    /// Create or replace a named bundle.
    pub fn create_bundle(&self, name: impl Into<String>, packets: Vec<PacketContainer>) {
        lock(&self.bundles).insert(name.into(), packets);
    }

    pub fn add_to_bundle(&self, name: &str, packet: PacketContainer) -> Result<(), InterceptError> {
        lock(&self.bundles)
            .get_mut(name)
            .ok_or_else(|| InterceptError::UnknownBundle(name.to_string()))?
            .push(packet);
        Ok(())
    }

    pub fn remove_bundle(&self, name: &str) -> bool {
        lock(&self.bundles).remove(name).is_some()
    }

    pub fn bundle_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.bundles).keys().cloned().collect();
        names.sort();
        names
    }

    fn bundle_copy(&self, name: &str) -> Result<Vec<PacketContainer>, InterceptError> {
        lock(&self.bundles)
            .get(name)
            .map(|packets| packets.iter().map(PacketContainer::deep_clone).collect())
            .ok_or_else(|| InterceptError::UnknownBundle(name.to_string()))
    }

    /// Send every packet of the bundle, in order, to each viewer. Returns how many were sent.
    pub fn send_bundle(&self, name: &str, viewers: &[ConnectionId]) -> Result<usize, InterceptError> {
        let packets = self.bundle_copy(name)?;
        let mut sent = 0;
        for viewer in viewers {
            for packet in &packets {
                if self.sender.send_packet(*viewer, packet.deep_clone()) == SendOutcome::Sent {
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }

    /// Queue the bundle's current contents for `delay_ticks` from now.
    pub fn send_bundle_later(
        &self,
        name: &str,
        delay_ticks: u64,
        viewers: &[ConnectionId],
    ) -> Result<(), InterceptError> {
        let packets = self.bundle_copy(name)?;
        for viewer in viewers {
            for packet in &packets {
                self.send_later(*viewer, packet.deep_clone(), delay_ticks);
            }
        }
        Ok(())
    }

    /// Drop all queued sends and bundles and stop every repeating send.
    pub fn clear(&self) {
        lock(&self.queue).clear();
        lock(&self.bundles).clear();
        for r in lock(&self.repeating).drain(..) {
            r.handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TickScheduler;
    use crate::testing::{schema, RecordingSender};
    use mc_intercept_proto::{PacketType, Uuid};

    fn setup() -> (PacketScheduler, Arc<RecordingSender>, Arc<TickScheduler>) {
        let sender = Arc::new(RecordingSender::default());
        let ticks = Arc::new(TickScheduler::new());
        (
            PacketScheduler::new(sender.clone(), ticks.clone()),
            sender,
            ticks,
        )
    }

    fn keep_alive(id: i64) -> PacketContainer {
        let mut p = PacketContainer::create(&schema(), PacketType::PlayServerKeepAlive).unwrap();
        p.longs().write(0, id).unwrap();
        p
    }

    #[test]
    fn delayed_send_waits_for_its_tick() {
        let (scheduler, sender, _) = setup();
        let conn = Uuid::new(0, 1);
        scheduler.send_later(conn, keep_alive(1), 2);
        scheduler.tick();
        assert!(sender.take().is_empty());
        scheduler.tick();
        assert_eq!(sender.take().len(), 1);
        assert_eq!(scheduler.queued(conn), 0);
    }

    #[test]
    fn gone_connections_are_skipped_silently() {
        let (scheduler, sender, _) = setup();
        let conn = Uuid::new(0, 1);
        scheduler.send_later(conn, keep_alive(1), 1);
        sender.set_offline(conn);
        scheduler.tick();
        assert!(sender.take().is_empty());
        assert_eq!(scheduler.queued(conn), 0);
    }

    #[test]
    fn repeating_stops_after_count() {
        let (scheduler, sender, ticks) = setup();
        let conn = Uuid::new(0, 1);
        scheduler.send_repeating(conn, keep_alive(7), 1, 1, 3);
        for _ in 0..6 {
            ticks.tick();
            scheduler.tick();
        }
        let sent = sender.take();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, p)| p.read::<i64>(0).unwrap() == 7));
        assert_eq!(ticks.pending(), 0);
        assert_eq!(scheduler.repeating(conn), 0);
    }

    #[test]
    fn repeating_self_cancels_when_connection_leaves() {
        let (scheduler, sender, ticks) = setup();
        let conn = Uuid::new(0, 1);
        scheduler.send_repeating(conn, keep_alive(1), 1, 1, 0);
        ticks.tick();
        assert_eq!(sender.take().len(), 1);
        sender.set_offline(conn);
        ticks.tick();
        ticks.tick();
        assert_eq!(ticks.pending(), 0);
    }

    #[test]
    fn cancel_all_drops_queue_and_repeats() {
        let (scheduler, sender, ticks) = setup();
        let (a, b) = (Uuid::new(0, 1), Uuid::new(0, 2));
        scheduler.send_later(a, keep_alive(1), 1);
        scheduler.send_later(b, keep_alive(2), 1);
        let handle = scheduler.send_repeating(a, keep_alive(3), 1, 1, 0);
        scheduler.cancel_all(a);
        assert!(handle.is_cancelled());

        ticks.tick();
        scheduler.tick();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
    }

    #[test]
    fn bundles_keep_member_order() {
        let (scheduler, sender, _) = setup();
        let (a, b) = (Uuid::new(0, 1), Uuid::new(0, 2));
        assert!(matches!(
            scheduler.send_bundle("intro", &[a]),
            Err(InterceptError::UnknownBundle(_))
        ));

        scheduler.create_bundle("intro", vec![keep_alive(1), keep_alive(2)]);
        scheduler.add_to_bundle("intro", keep_alive(3)).unwrap();
        assert_eq!(scheduler.send_bundle("intro", &[a, b]).unwrap(), 6);
        let ids: Vec<i64> = sender
            .take()
            .iter()
            .filter(|(c, _)| *c == b)
            .map(|(_, p)| p.read::<i64>(0).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        scheduler.send_bundle_later("intro", 1, &[a]).unwrap();
        assert!(sender.take().is_empty());
        scheduler.tick();
        assert_eq!(sender.take().len(), 3);

        assert!(scheduler.remove_bundle("intro"));
        assert!(scheduler.bundle_names().is_empty());
    }
}
