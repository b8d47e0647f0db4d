//! Facade owning every interception service.
//!
//! A [`ProtocolManager`] is built from explicit collaborators (schema, world view, error sink)
//! and hands out the shared services. The host calls [`on_connect`](ProtocolManager::on_connect)
//! and [`on_disconnect`](ProtocolManager::on_disconnect) around each client connection and
//! [`tick`](ProtocolManager::tick) from its main loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mc_intercept_proto::{PacketContainer, PacketType, Schema};
use mc_intercept_script::{ScriptEngine, ScriptError, ScriptLimits};
use tracing::{debug, info, warn};

use crate::capability::CapabilityDetector;
use crate::diagnostics::{history, Diagnostics};
use crate::effects::PacketEffects;
use crate::error::InterceptError;
use crate::fake::{FakeBlockManager, FakeEntityManager};
use crate::host::{
    ConnectionId, ConnectionInfo, ErrorSink, FrameTransport, PacketSender, PlayerDirectory,
    SendOutcome, WorldView,
};
use crate::injector::{ConnectionInjector, InjectorRegistry, InterceptContext};
use crate::listener::{
    ListenerBuilder, ListenerGroup, ListenerPipeline, PacketListener, ScriptedListener,
};
use crate::packet_scheduler::PacketScheduler;
use crate::rate_limit::RateLimiter;
use crate::task::{TaskScheduler, TickScheduler};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Packets kept per direction per connection.
    pub history_capacity: usize,
    pub script_limits: ScriptLimits,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            history_capacity: history::DEFAULT_CAPACITY,
            script_limits: ScriptLimits::default(),
        }
    }
}

pub struct ProtocolManager {
    ctx: InterceptContext,
    scripts: Arc<ScriptEngine>,
    registry: Arc<InjectorRegistry>,
    tasks: Arc<TickScheduler>,
    entities: FakeEntityManager,
    blocks: FakeBlockManager,
    scheduler: PacketScheduler,
    effects: PacketEffects,
    groups: Mutex<HashMap<String, Arc<ListenerGroup>>>,
    filters: Mutex<HashMap<String, Arc<dyn PacketListener>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProtocolManager {
    pub fn new(
        schema: Arc<Schema>,
        world: Arc<dyn WorldView>,
        errors: Arc<dyn ErrorSink>,
        settings: &ManagerSettings,
    ) -> Result<Self, InterceptError> {
        let mut ctx = InterceptContext::new(schema.clone(), errors.clone());
        ctx.diagnostics = Arc::new(Diagnostics::new(settings.history_capacity));

        let scripts = Arc::new(ScriptEngine::new(&settings.script_limits)?);
        scripts.set_error_hook(Arc::new(move |name: &str, e: &ScriptError| {
            errors.report(&format!("script:{name}"), e);
        }));

        let registry = Arc::new(InjectorRegistry::new());
        let sender: Arc<dyn PacketSender> = registry.clone();
        let tasks = Arc::new(TickScheduler::new());

        Ok(Self {
            entities: FakeEntityManager::new(schema.clone(), sender.clone()),
            blocks: FakeBlockManager::new(schema.clone(), sender.clone(), world),
            scheduler: PacketScheduler::new(sender.clone(), tasks.clone()),
            effects: PacketEffects::new(schema, sender),
            ctx,
            scripts,
            registry,
            tasks,
            groups: Mutex::new(HashMap::new()),
            filters: Mutex::new(HashMap::new()),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.ctx.schema
    }

    pub fn context(&self) -> &InterceptContext {
        &self.ctx
    }

    pub fn pipeline(&self) -> &Arc<ListenerPipeline> {
        &self.ctx.pipeline
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.ctx.rate_limiter
    }

    pub fn capabilities(&self) -> &CapabilityDetector {
        &self.ctx.capabilities
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.ctx.diagnostics
    }

    pub fn scripts(&self) -> &Arc<ScriptEngine> {
        &self.scripts
    }

    pub fn registry(&self) -> &Arc<InjectorRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> Arc<dyn TaskScheduler> {
        self.tasks.clone()
    }

    pub fn entities(&self) -> &FakeEntityManager {
        &self.entities
    }

    pub fn blocks(&self) -> &FakeBlockManager {
        &self.blocks
    }

    pub fn scheduler(&self) -> &PacketScheduler {
        &self.scheduler
    }

    pub fn effects(&self) -> &PacketEffects {
        &self.effects
    }

    pub fn create_packet(&self, packet_type: PacketType) -> Result<PacketContainer, InterceptError> {
        Ok(PacketContainer::create(&self.ctx.schema, packet_type)?)
    }

    // ─── Connections ──────────────────────────────────────────────────────

    /// Attach an injector to a new connection. A stale injector under the same id is detached.
    pub fn on_connect(
        &self,
        info: ConnectionInfo,
        transport: Arc<dyn FrameTransport>,
    ) -> Result<Arc<ConnectionInjector>, InterceptError> {
        let injector = Arc::new(ConnectionInjector::new(info, self.ctx.clone(), transport));
        injector.inject()?;
        if let Some(previous) = self.registry.insert(injector.clone()) {
            warn!("Replacing live injector for {}", previous.id());
            previous.uninject();
        }
        info!(
            "{} connected ({})",
            injector.id(),
            injector
                .info()
                .address
                .map_or_else(|| "local".to_string(), |a| a.to_string())
        );
        Ok(injector)
    }

    /// Detach the connection's injector, then drop everything held for it. State recorded
    /// for an id that never got an injector is purged too.
    pub fn on_disconnect(&self, id: ConnectionId) {
        let injector = self.registry.get(id);
        if let Some(injector) = &injector {
            injector.uninject();
            self.registry.remove(id);
        }

        self.ctx.diagnostics.purge(id);
        self.ctx.capabilities.remove(id);
        self.ctx.rate_limiter.clear_connection(id);
        self.scheduler.cancel_all(id);
        if let Err(e) = self.entities.clear_player(id) {
            warn!("Clearing fake entities of {id}: {e}");
        }
        if let Err(e) = self.blocks.clear_player(id) {
            warn!("Clearing fake blocks of {id}: {e}");
        }
        match injector {
            Some(injector) => info!("{} disconnected", injector.info().name),
            None => debug!("Purged state of unregistered connection {id}"),
        }
    }

    pub fn online(&self) -> Vec<ConnectionInfo> {
        self.registry.online()
    }

    pub fn send_packet(&self, conn: ConnectionId, packet: PacketContainer) -> SendOutcome {
        self.registry.send_packet(conn, packet)
    }

    /// Send a copy to every injected connection. Returns how many went out.
    pub fn broadcast_packet(&self, packet: &PacketContainer) -> usize {
        self.registry
            .online()
            .iter()
            .filter(|p| self.registry.send_packet(p.id, packet.deep_clone()) == SendOutcome::Sent)
            .count()
    }

    /// One main-loop tick: scheduled tasks first, then due packets.
    pub fn tick(&self) {
        self.tasks.tick();
        self.scheduler.tick();
    }

    pub fn set_debug(&self, enabled: bool) {
        self.ctx.diagnostics.set_debug(enabled);
        info!("Packet debug {}", if enabled { "on" } else { "off" });
    }

    /// Undo fake state for every viewer, detach every connection and drop all listeners.
    pub fn shutdown(&self) {
        if let Err(e) = self.entities.clear_all() {
            warn!("Clearing fake entities: {e}");
        }
        for injector in self.registry.all() {
            if let Err(e) = self.blocks.clear_player(injector.id()) {
                warn!("Clearing fake blocks of {}: {e}", injector.id());
            }
            injector.uninject();
            self.registry.remove(injector.id());
            self.ctx.diagnostics.purge(injector.id());
            self.ctx.capabilities.remove(injector.id());
            self.ctx.rate_limiter.clear_connection(injector.id());
        }
        self.blocks.clear_all();
        self.scheduler.clear();
        for group in lock(&self.groups).drain().map(|(_, g)| g) {
            group.unregister_all();
        }
        lock(&self.filters).clear();
        self.ctx.pipeline.clear();
        info!("Interception shut down");
    }

    // ─── Listeners ────────────────────────────────────────────────────────

    /// Register a listener described by `builder`.
    pub fn listen(&self, builder: ListenerBuilder) -> Result<Arc<dyn PacketListener>, InterceptError> {
        builder.register(&self.ctx.pipeline, self.tasks())
    }

    /// Named group, created on first use.
    pub fn group(&self, name: &str) -> Arc<ListenerGroup> {
        lock(&self.groups)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ListenerGroup::new(name, self.ctx.pipeline.clone())))
            .clone()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.groups).keys().cloned().collect();
        names.sort();
        names
    }

    /// Unregister a group's listeners and forget it.
    pub fn remove_group(&self, name: &str) -> bool {
        let Some(group) = lock(&self.groups).remove(name) else {
            return false;
        };
        group.unregister_all();
        true
    }

    // ─── Filters ──────────────────────────────────────────────────────────

    /// Compile `source` as filter `name` and register it for `types` (empty = all types).
    /// Loading an existing name replaces it.
    pub fn load_filter(&self, name: &str, source: &str, types: &[PacketType]) -> Result<(), InterceptError> {
        self.scripts.compile(name, source)?;
        self.attach_filter(name, types)
    }

    /// Load every `*.lua` file in `dir` as a filter on all packet types.
    pub fn load_filter_dir(&self, dir: &Path) -> Result<usize, InterceptError> {
        let loaded = self.scripts.load_dir(dir)?;
        for name in self.scripts.names() {
            if !lock(&self.filters).contains_key(&name) {
                self.attach_filter(&name, &[])?;
            }
        }
        Ok(loaded)
    }

    fn attach_filter(&self, name: &str, types: &[PacketType]) -> Result<(), InterceptError> {
        let listener: Arc<dyn PacketListener> =
            Arc::new(ScriptedListener::new(name, self.scripts.clone()).with_types(types));
        let previous = lock(&self.filters).insert(name.to_string(), listener.clone());
        if let Some(previous) = previous {
            self.ctx.pipeline.unregister(&previous);
        }
        self.ctx.pipeline.register(listener)?;
        Ok(())
    }

    pub fn remove_filter(&self, name: &str) -> bool {
        let listener = lock(&self.filters).remove(name);
        if let Some(listener) = &listener {
            self.ctx.pipeline.unregister(listener);
        }
        self.scripts.remove(name) || listener.is_some()
    }

    pub fn filter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.filters).keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::EntityKind;
    use crate::host::{EmptyWorld, LogErrorSink};
    use crate::injector::InjectorState;
    use bytes::Bytes;
    use mc_intercept_proto::{BlockPos, Location, Uuid};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Wire {
        frames: Mutex<Vec<Bytes>>,
    }

    impl Wire {
        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl FrameTransport for Wire {
        fn write_frame(&self, frame: Bytes) -> Result<(), InterceptError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn manager() -> ProtocolManager {
        ProtocolManager::new(
            crate::testing::schema(),
            Arc::new(EmptyWorld),
            Arc::new(LogErrorSink),
            &ManagerSettings::default(),
        )
        .unwrap()
    }

    fn connect(manager: &ProtocolManager, n: u64, name: &str) -> (ConnectionId, Arc<Wire>) {
        let wire = Arc::new(Wire::default());
        let info = ConnectionInfo::new(Uuid::new(0, n), name);
        let id = info.id;
        manager.on_connect(info, wire.clone()).unwrap();
        (id, wire)
    }

    fn keep_alive(manager: &ProtocolManager, id: i64) -> PacketContainer {
        let mut p = manager.create_packet(PacketType::PlayServerKeepAlive).unwrap();
        p.longs().write(0, id).unwrap();
        p
    }

    #[tokio::test]
    async fn disconnect_purges_every_per_connection_store() {
        let manager = manager();
        let (id, _wire) = connect(&manager, 1, "Steve");

        let mut handshake = manager
            .create_packet(PacketType::HandshakeClientSetProtocol)
            .unwrap();
        handshake.integers().write(0, 765).unwrap().write(1, 2).unwrap();
        manager.capabilities().observe(id, &handshake);
        assert!(!manager.rate_limiter().should_limit(id, PacketType::PlayClientChat));
        manager
            .entities()
            .spawn_entity(Location::default(), EntityKind::living(91), &[id])
            .unwrap();
        manager.blocks().set_block(BlockPos::new(0, 64, 0), 1, &[id]).unwrap();
        manager.scheduler().send_later(id, keep_alive(&manager, 1), 5);
        let path = std::env::temp_dir().join(format!("mc-intercept-purge-{}.pcap", std::process::id()));
        manager.diagnostics().pcap().start(id, &path).await.unwrap();

        assert!(manager.diagnostics().history().contains(id));
        assert!(manager.capabilities().info(id).is_some());
        assert_eq!(manager.entities().viewer_count(id), 1);
        assert_eq!(manager.blocks().fake_count(id), 1);
        assert_eq!(manager.rate_limiter().tracked(id), 1);
        assert_eq!(manager.scheduler().queued(id), 1);
        assert!(manager.diagnostics().pcap().is_capturing(id));

        let injector = manager.registry().get(id).unwrap();
        manager.on_disconnect(id);

        assert_eq!(injector.state(), InjectorState::Detached);
        assert!(manager.registry().get(id).is_none());
        assert!(!manager.diagnostics().history().contains(id));
        assert!(manager.capabilities().info(id).is_none());
        assert_eq!(manager.entities().viewer_count(id), 0);
        assert_eq!(manager.blocks().fake_count(id), 0);
        assert_eq!(manager.rate_limiter().tracked(id), 0);
        assert_eq!(manager.scheduler().queued(id), 0);
        assert!(!manager.diagnostics().pcap().is_capturing(id));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn disconnect_without_injector_still_purges() {
        let manager = manager();
        let stray = Uuid::new(0, 99);
        assert!(!manager.rate_limiter().should_limit(stray, PacketType::PlayClientChat));
        manager.scheduler().send_later(stray, keep_alive(&manager, 1), 5);
        let mut handshake = manager
            .create_packet(PacketType::HandshakeClientSetProtocol)
            .unwrap();
        handshake.integers().write(0, 765).unwrap().write(1, 2).unwrap();
        manager.capabilities().observe(stray, &handshake);
        // Not online, so nothing is recorded for it.
        manager.blocks().set_block(BlockPos::new(0, 64, 0), 1, &[stray]).unwrap();
        assert_eq!(manager.blocks().fake_count(stray), 0);

        manager.on_disconnect(stray);
        assert_eq!(manager.rate_limiter().tracked(stray), 0);
        assert_eq!(manager.scheduler().queued(stray), 0);
        assert!(manager.capabilities().info(stray).is_none());
    }

    #[test]
    fn broadcast_reaches_every_injected_connection() {
        let manager = manager();
        let (_, alex_wire) = connect(&manager, 1, "Alex");
        let (steve, steve_wire) = connect(&manager, 2, "Steve");
        assert_eq!(manager.broadcast_packet(&keep_alive(&manager, 9)), 2);
        assert_eq!(alex_wire.count(), 1);
        assert_eq!(steve_wire.count(), 1);

        manager.on_disconnect(steve);
        assert_eq!(manager.broadcast_packet(&keep_alive(&manager, 10)), 1);
        assert_eq!(
            manager.send_packet(steve, keep_alive(&manager, 11)),
            SendOutcome::Dropped
        );
        let names: Vec<String> = manager.online().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Alex"]);
    }

    #[test]
    fn tick_drives_tasks_and_scheduled_packets() {
        let manager = manager();
        let (id, wire) = connect(&manager, 1, "Alex");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        manager.tasks().run_on_main(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        manager.scheduler().send_later(id, keep_alive(&manager, 1), 1);

        manager.tick();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(wire.count(), 1);
    }

    #[test]
    fn filters_load_replace_and_remove() {
        let manager = manager();
        let info = ConnectionInfo::new(Uuid::new(0, 1), "Alex");
        let mut chat = manager.create_packet(PacketType::PlayClientChat).unwrap();
        chat.set_message("darn").unwrap();

        manager
            .load_filter("no_darn", "packet.strings[1] ~= 'darn'", &[PacketType::PlayClientChat])
            .unwrap();
        assert!(manager
            .pipeline()
            .dispatch_receiving(&info, &mut chat.deep_clone())
            .is_cancelled());

        manager
            .load_filter("no_darn", "true", &[PacketType::PlayClientChat])
            .unwrap();
        assert_eq!(manager.pipeline().len(), 1);
        assert!(!manager
            .pipeline()
            .dispatch_receiving(&info, &mut chat.deep_clone())
            .is_cancelled());

        assert!(manager.load_filter("broken", "return (", &[]).is_err());
        assert_eq!(manager.filter_names(), vec!["no_darn"]);

        assert!(manager.remove_filter("no_darn"));
        assert!(!manager.scripts().contains("no_darn"));
        assert!(manager.pipeline().is_empty());
        assert!(!manager.remove_filter("no_darn"));
    }

    #[test]
    fn shutdown_detaches_everything() {
        let manager = manager();
        let (id, wire) = connect(&manager, 1, "Alex");
        let injector = manager.registry().get(id).unwrap();
        manager
            .entities()
            .spawn_entity(Location::default(), EntityKind::object(2), &[id])
            .unwrap();
        manager
            .listen(ListenerBuilder::new("watch").types(&[PacketType::PlayClientChat]))
            .unwrap();
        manager.group("debug");
        let before = wire.count();

        manager.shutdown();

        // One batched destroy for the fake entity went out before detaching.
        assert_eq!(wire.count(), before + 1);
        assert_eq!(injector.state(), InjectorState::Detached);
        assert!(manager.registry().is_empty());
        assert!(manager.pipeline().is_empty());
        assert!(manager.group_names().is_empty());
    }

    #[test]
    fn groups_are_shared_by_name() {
        let manager = manager();
        let a = manager.group("anticheat");
        let b = manager.group("anticheat");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.remove_group("anticheat"));
        assert!(!manager.remove_group("anticheat"));
    }
}
