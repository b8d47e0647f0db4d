//! Listeners that retire themselves after a deadline or a packet budget.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mc_intercept_proto::{PacketContainer, PacketType};
use tracing::debug;

use super::{ListenerKey, ListenerPipeline, ListenerPriority, ListenerResult, PacketListener};
use crate::host::ConnectionInfo;
use crate::task::{Task, TaskScheduler};

/// Wraps a listener with a deadline and/or a maximum number of handled packets.
///
/// The first packet that finds the listener expired is allowed without reaching the inner
/// listener. Removal from the pipeline and the `on_expire` callback then run once, on the main
/// thread, through the task scheduler.
pub struct ExpiringListener {
    inner: Box<dyn PacketListener>,
    deadline: Option<Instant>,
    max_packets: Option<u32>,
    handled: AtomicU32,
    expired: AtomicBool,
    on_expire: Mutex<Option<Task>>,
    pipeline: Weak<ListenerPipeline>,
    tasks: Arc<dyn TaskScheduler>,
    key: ListenerKey,
}

impl ExpiringListener {
    pub fn new(
        inner: Box<dyn PacketListener>,
        expire_after: Option<Duration>,
        max_packets: Option<u32>,
        on_expire: Option<Task>,
        pipeline: &Arc<ListenerPipeline>,
        tasks: Arc<dyn TaskScheduler>,
    ) -> Arc<Self> {
        let deadline = expire_after.map(|d| Instant::now() + d);
        Arc::new_cyclic(|this: &Weak<Self>| Self {
            inner,
            deadline,
            max_packets,
            handled: AtomicU32::new(0),
            expired: AtomicBool::new(false),
            on_expire: Mutex::new(on_expire),
            pipeline: Arc::downgrade(pipeline),
            tasks,
            key: ListenerKey::from_ptr(this.as_ptr()),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Packets passed to the inner listener so far.
    pub fn handled(&self) -> u32 {
        self.handled.load(Ordering::Acquire)
    }

    /// Claim a slot for one packet, or expire.
    fn admit(&self) -> bool {
        if self.is_expired() {
            return false;
        }
        let timed_out = self.deadline.is_some_and(|d| Instant::now() >= d);
        let admitted = !timed_out
            && match self.max_packets {
                Some(max) => self
                    .handled
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_ok(),
                None => {
                    self.handled.fetch_add(1, Ordering::AcqRel);
                    true
                }
            };
        if !admitted {
            self.expire();
        }
        admitted
    }

    fn expire(&self) {
        if self.expired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.on_expire.lock().ok().and_then(|mut c| c.take());
        let pipeline = self.pipeline.clone();
        let key = self.key;
        let name = self.inner.name().to_string();
        self.tasks.run_on_main(Box::new(move || {
            if let Some(pipeline) = pipeline.upgrade() {
                pipeline.unregister_key(key);
            }
            debug!("Listener '{name}' expired");
            if let Some(callback) = callback {
                callback();
            }
        }));
    }
}

impl PacketListener for ExpiringListener {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> ListenerPriority {
        self.inner.priority()
    }

    fn sending_types(&self) -> &[PacketType] {
        self.inner.sending_types()
    }

    fn receiving_types(&self) -> &[PacketType] {
        self.inner.receiving_types()
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.set_enabled(enabled);
    }

    fn listens_sending(&self, packet_type: PacketType) -> bool {
        self.inner.listens_sending(packet_type)
    }

    fn listens_receiving(&self, packet_type: PacketType) -> bool {
        self.inner.listens_receiving(packet_type)
    }

    // Only packets the inner listener wants count against the budget.
    fn on_sending(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> ListenerResult {
        if !self.inner.listens_sending(packet.packet_type()) || !self.admit() {
            return Ok(true);
        }
        self.inner.on_sending(conn, packet)
    }

    fn on_receiving(&self, conn: &ConnectionInfo, packet: &mut PacketContainer) -> ListenerResult {
        if !self.inner.listens_receiving(packet.packet_type()) || !self.admit() {
            return Ok(true);
        }
        self.inner.on_receiving(conn, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LogErrorSink;
    use crate::listener::{DispatchResult, ListenerBuilder};
    use crate::task::TickScheduler;
    use mc_intercept_proto::{Schema, Uuid};
    use std::sync::atomic::AtomicUsize;

    fn chat() -> PacketContainer {
        let schema = Schema::builtin().unwrap();
        PacketContainer::create(&schema, PacketType::PlayClientChat).unwrap()
    }

    #[test]
    fn packet_budget_expires_once_and_unregisters_on_tick() {
        let pipeline = Arc::new(ListenerPipeline::new(Arc::new(LogErrorSink)));
        let scheduler = Arc::new(TickScheduler::new());
        let handled = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicUsize::new(0));

        let (h, e) = (handled.clone(), expired.clone());
        ListenerBuilder::new("two-chats")
            .types(&[PacketType::PlayClientChat])
            .expire_after_packets(2)
            .on_receive(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            })
            .on_expire(move || {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .register(&pipeline, scheduler.clone())
            .unwrap();

        let conn = ConnectionInfo::new(Uuid::new(1, 1), "Alex");
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Cancelled);
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Cancelled);
        // Third packet finds the budget spent: allowed, removal scheduled.
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Continue);
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Continue);
        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.len(), 1);

        scheduler.tick();
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(pipeline.is_empty());

        scheduler.tick();
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_direction_does_not_spend_the_budget() {
        let pipeline = Arc::new(ListenerPipeline::new(Arc::new(LogErrorSink)));
        let scheduler = Arc::new(TickScheduler::new());
        let listener = ListenerBuilder::new("two-chats")
            .types(&[PacketType::PlayClientChat])
            .expire_after_packets(2)
            .on_receive(|_, _| Ok(false))
            .register(&pipeline, scheduler.clone())
            .unwrap();

        let schema = Schema::builtin().unwrap();
        let conn = ConnectionInfo::new(Uuid::new(1, 1), "Alex");
        for _ in 0..3 {
            let mut keep_alive =
                PacketContainer::create(&schema, PacketType::PlayServerKeepAlive).unwrap();
            assert_eq!(pipeline.dispatch_sending(&conn, &mut keep_alive), DispatchResult::Continue);
            // Direct calls for types it ignores are passed through uncounted as well.
            assert!(listener.on_sending(&conn, &mut keep_alive).unwrap());
        }
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Cancelled);
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Cancelled);
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Continue);
    }

    #[test]
    fn deadline_expiry_allows_the_packet() {
        let pipeline = Arc::new(ListenerPipeline::new(Arc::new(LogErrorSink)));
        let scheduler = Arc::new(TickScheduler::new());
        ListenerBuilder::new("instant")
            .expire_after(Duration::ZERO)
            .on_receive(|_, _| Ok(false))
            .register(&pipeline, scheduler.clone())
            .unwrap();

        let conn = ConnectionInfo::new(Uuid::new(1, 1), "Alex");
        assert_eq!(pipeline.dispatch_receiving(&conn, &mut chat()), DispatchResult::Continue);
        scheduler.tick();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn key_matches_registered_identity() {
        let pipeline = Arc::new(ListenerPipeline::new(Arc::new(LogErrorSink)));
        let scheduler: Arc<dyn TaskScheduler> = Arc::new(TickScheduler::new());
        let listener = ExpiringListener::new(
            Box::new(NamedOnly),
            None,
            Some(1),
            None,
            &pipeline,
            scheduler,
        );
        let as_dyn: Arc<dyn PacketListener> = listener.clone();
        assert_eq!(ListenerKey::of(&as_dyn), listener.key);
    }

    struct NamedOnly;

    impl PacketListener for NamedOnly {}
}
