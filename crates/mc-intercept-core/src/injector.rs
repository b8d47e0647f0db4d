//! Per-connection interception of the frame stream.
//!
//! A [`ConnectionInjector`] sits on one client connection. Inbound frames are decoded for the
//! current protocol phase, admitted by the rate limiter, dispatched to the listener pipeline
//! and re-encoded for forwarding. Outbound packets, whether relayed from the server or
//! produced locally, take the same pipeline on their way to the [`FrameTransport`].
//!
//! Lifecycle: `Uninjected -> Injected -> Detached`. An uninjected injector relays frames
//! untouched; a detached one refuses everything and cannot be injected again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use mc_intercept_proto::frame::{decode_frame, encode_frame, FrameConfig};
use mc_intercept_proto::{Direction, PacketContainer, PacketType, Phase, Schema, WireHandle};
use tracing::{debug, trace, warn};

use crate::capability::CapabilityDetector;
use crate::diagnostics::Diagnostics;
use crate::error::InterceptError;
use crate::host::{
    ConnectionId, ConnectionInfo, ErrorSink, FrameTransport, PacketSender, PlayerDirectory,
    SendOutcome,
};
use crate::listener::ListenerPipeline;
use crate::rate_limit::RateLimiter;

/// Longest `uninject` waits for dispatches already under way.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const UNINJECTED: u8 = 0;
const INJECTED: u8 = 1;
const DETACHED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorState {
    Uninjected,
    Injected,
    Detached,
}

/// Shared services every injector routes packets through.
#[derive(Clone)]
pub struct InterceptContext {
    pub schema: Arc<Schema>,
    pub pipeline: Arc<ListenerPipeline>,
    pub rate_limiter: Arc<RateLimiter>,
    pub capabilities: Arc<CapabilityDetector>,
    pub diagnostics: Arc<Diagnostics>,
}

impl InterceptContext {
    pub fn new(schema: Arc<Schema>, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            schema,
            pipeline: Arc::new(ListenerPipeline::new(errors)),
            rate_limiter: Arc::new(RateLimiter::new()),
            capabilities: Arc::new(CapabilityDetector::new()),
            diagnostics: Arc::new(Diagnostics::default()),
        }
    }
}

struct Codec {
    phase: Phase,
    frames: FrameConfig,
}

pub struct ConnectionInjector {
    info: RwLock<ConnectionInfo>,
    ctx: InterceptContext,
    transport: Arc<dyn FrameTransport>,
    state: AtomicU8,
    in_flight: Mutex<usize>,
    drained: Condvar,
    codec: Mutex<Codec>,
}

/// Marks one dispatch in progress; `uninject` waits for these to finish.
struct Dispatching<'a>(&'a ConnectionInjector);

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        let mut n = self.0.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.0.drained.notify_all();
        }
    }
}

impl ConnectionInjector {
    pub fn new(info: ConnectionInfo, ctx: InterceptContext, transport: Arc<dyn FrameTransport>) -> Self {
        Self {
            info: RwLock::new(info),
            ctx,
            transport,
            state: AtomicU8::new(UNINJECTED),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
            codec: Mutex::new(Codec {
                phase: Phase::Handshake,
                frames: FrameConfig::default(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info().id
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> InjectorState {
        match self.state.load(Ordering::SeqCst) {
            UNINJECTED => InjectorState::Uninjected,
            INJECTED => InjectorState::Injected,
            _ => InjectorState::Detached,
        }
    }

    pub fn is_injected(&self) -> bool {
        self.state() == InjectorState::Injected
    }

    pub fn phase(&self) -> Phase {
        self.codec().phase
    }

    /// Start decoding in `phase`, for hosts that attach to an established connection.
    pub fn set_phase(&self, phase: Phase) {
        self.codec().phase = phase;
    }

    pub fn frame_config(&self) -> FrameConfig {
        self.codec().frames.clone()
    }

    pub fn inject(&self) -> Result<(), InterceptError> {
        match self
            .state
            .compare_exchange(UNINJECTED, INJECTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                debug!("Injected {}", self.info().name);
                Ok(())
            }
            Err(INJECTED) => Ok(()),
            Err(_) => Err(InterceptError::InjectorDetached(self.id())),
        }
    }

    /// Detach for good. Returns once dispatches already in progress have finished; no packet
    /// reaches the pipeline for this connection afterwards. Safe to call repeatedly.
    pub fn uninject(&self) {
        if self.state.swap(DETACHED, Ordering::SeqCst) == DETACHED {
            return;
        }
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match self
            .drained
            .wait_timeout_while(in_flight, DRAIN_TIMEOUT, |n| *n > 0)
        {
            Ok((_, wait)) if wait.timed_out() => {
                warn!("Uninjecting {} with dispatches still running", self.id());
            }
            _ => {}
        }
        debug!("Uninjected {}", self.info().name);
    }

    fn codec(&self) -> MutexGuard<'_, Codec> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok(None)` when not injected: the caller relays without interception.
    fn enter(&self) -> Result<Option<Dispatching<'_>>, InterceptError> {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let guard = Dispatching(self);
        match self.state() {
            InjectorState::Injected => Ok(Some(guard)),
            InjectorState::Uninjected => Ok(None),
            InjectorState::Detached => Err(InterceptError::InjectorDetached(self.id())),
        }
    }

    fn frame(&self, packet: &[u8]) -> Result<Bytes, InterceptError> {
        Ok(encode_frame(packet, &self.codec().frames)?)
    }

    fn decode(&self, body: Bytes, direction: Direction) -> Result<(Bytes, Option<PacketContainer>), InterceptError> {
        let (phase, raw) = {
            let codec = self.codec();
            (codec.phase, decode_frame(body, &codec.frames)?)
        };
        match WireHandle::decode(&self.ctx.schema, phase, direction, raw.clone()) {
            Ok(handle) => Ok((raw, Some(PacketContainer::from_handle(handle)))),
            Err(e) => {
                trace!("{}: relaying undecodable {} frame: {e}", self.id(), direction.name());
                Ok((raw, None))
            }
        }
    }

    /// Process one frame body read from the client (length prefix removed). Returns the frame
    /// to forward to the server, or `None` when the packet was rate limited or cancelled.
    pub fn receive_frame(&self, body: Bytes) -> Result<Option<Bytes>, InterceptError> {
        let Some(_dispatch) = self.enter()? else {
            return Ok(Some(encode_frame(&body, &FrameConfig::default())?));
        };
        let (raw, packet) = self.decode(body, Direction::ClientToServer)?;
        let Some(mut packet) = packet else {
            return self.frame(&raw).map(Some);
        };

        self.track_inbound(&packet);
        let info = self.info();
        self.ctx.capabilities.observe(info.id, &packet);

        if self.ctx.rate_limiter.should_limit(info.id, packet.packet_type()) {
            debug!("{}: rate limited {}", info.name, packet.packet_type().name());
            self.ctx.diagnostics.record(&info, &packet, true, true);
            return Ok(None);
        }

        let cancelled = self
            .ctx
            .pipeline
            .dispatch_receiving(&info, &mut packet)
            .is_cancelled();
        self.ctx.diagnostics.record(&info, &packet, true, cancelled);
        if cancelled {
            return Ok(None);
        }
        let encoded = packet.handle().encode()?;
        self.frame(&encoded).map(Some)
    }

    /// Process one frame body read from the server and write the result to the client.
    pub fn relay_outbound(&self, body: Bytes) -> Result<SendOutcome, InterceptError> {
        let Some(_dispatch) = self.enter()? else {
            self.transport
                .write_frame(encode_frame(&body, &FrameConfig::default())?)?;
            return Ok(SendOutcome::Sent);
        };
        let (raw, packet) = self.decode(body, Direction::ServerToClient)?;
        match packet {
            Some(packet) => self.send_packet(packet),
            None => {
                self.transport.write_frame(self.frame(&raw)?)?;
                Ok(SendOutcome::Sent)
            }
        }
    }

    /// Send a packet to the client through the sending side of the pipeline.
    pub fn send_packet(&self, mut packet: PacketContainer) -> Result<SendOutcome, InterceptError> {
        let dispatch = self.enter()?;
        if dispatch.is_some() {
            let info = self.info();
            let cancelled = self
                .ctx
                .pipeline
                .dispatch_sending(&info, &mut packet)
                .is_cancelled();
            self.ctx.diagnostics.record(&info, &packet, false, cancelled);
            if cancelled {
                return Ok(SendOutcome::Cancelled);
            }
        }
        let encoded = packet.handle().encode()?;
        self.transport.write_frame(self.frame(&encoded)?)?;
        self.track_outbound(&packet);
        Ok(SendOutcome::Sent)
    }

    fn track_inbound(&self, packet: &PacketContainer) {
        match packet.packet_type() {
            PacketType::HandshakeClientSetProtocol => {
                let next = match packet.read::<i32>(1) {
                    Ok(1) => Phase::Status,
                    Ok(2) | Ok(3) => Phase::Login,
                    _ => return,
                };
                self.codec().phase = next;
            }
            PacketType::LoginClientLoginAck => self.codec().phase = Phase::Configuration,
            PacketType::ConfigurationClientFinishConfiguration => self.codec().phase = Phase::Play,
            PacketType::LoginClientStart => {
                if let Ok(name) = packet.read::<String>(0) {
                    self.info
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .name = name;
                }
            }
            _ => {}
        }
    }

    fn track_outbound(&self, packet: &PacketContainer) {
        match packet.packet_type() {
            PacketType::LoginServerSetCompression => {
                let Ok(threshold) = packet.read::<i32>(0) else {
                    return;
                };
                self.codec().frames.negotiate(threshold);
                self.ctx.capabilities.compression_enabled(self.id(), threshold);
                debug!("{}: compression threshold {threshold}", self.id());
            }
            _ => {}
        }
    }
}

/// Live injectors by connection id.
#[derive(Default)]
pub struct InjectorRegistry {
    injectors: RwLock<HashMap<ConnectionId, Arc<ConnectionInjector>>>,
}

impl InjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, injector: Arc<ConnectionInjector>) -> Option<Arc<ConnectionInjector>> {
        self.injectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(injector.id(), injector)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionInjector>> {
        self.injectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionInjector>> {
        self.injectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<ConnectionInjector>> {
        self.injectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.injectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketSender for InjectorRegistry {
    fn send_packet(&self, conn: ConnectionId, packet: PacketContainer) -> SendOutcome {
        let Some(injector) = self.get(conn) else {
            trace!("Dropping {} for gone connection {conn}", packet.packet_type().name());
            return SendOutcome::Dropped;
        };
        match injector.send_packet(packet) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Send to {conn} failed: {e}");
                SendOutcome::Dropped
            }
        }
    }

    fn is_online(&self, conn: ConnectionId) -> bool {
        self.get(conn).is_some_and(|i| i.is_injected())
    }
}

impl PlayerDirectory for InjectorRegistry {
    fn player(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.get(id).map(|i| i.info())
    }

    fn online(&self) -> Vec<ConnectionInfo> {
        let mut players: Vec<_> = self
            .all()
            .into_iter()
            .filter(|i| i.is_injected())
            .map(|i| i.info())
            .collect();
        players.sort_by(|a, b| a.name.cmp(&b.name));
        players
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LogErrorSink;
    use crate::listener::ListenerBuilder;
    use crate::task::TickScheduler;
    use bytes::BytesMut;
    use mc_intercept_proto::frame::split_frame;
    use mc_intercept_proto::Uuid;

    #[derive(Default)]
    struct Wire {
        frames: Mutex<Vec<Bytes>>,
    }

    impl Wire {
        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameTransport for Wire {
        fn write_frame(&self, frame: Bytes) -> Result<(), InterceptError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn setup() -> (Arc<ConnectionInjector>, Arc<Wire>, InterceptContext) {
        let schema = Arc::new(Schema::builtin().unwrap());
        let ctx = InterceptContext::new(schema, Arc::new(LogErrorSink));
        let wire = Arc::new(Wire::default());
        let info = ConnectionInfo::new(Uuid::new(7, 7), "unknown");
        let injector = Arc::new(ConnectionInjector::new(info, ctx.clone(), wire.clone()));
        (injector, wire, ctx)
    }

    fn create(ctx: &InterceptContext, packet_type: PacketType) -> PacketContainer {
        PacketContainer::create(&ctx.schema, packet_type).unwrap()
    }

    fn body(packet: &PacketContainer, config: &FrameConfig) -> Bytes {
        let frame = encode_frame(&packet.handle().encode().unwrap(), config).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        split_frame(&mut buf, usize::MAX).unwrap().unwrap()
    }

    fn chat(ctx: &InterceptContext, text: &str) -> PacketContainer {
        let mut p = create(ctx, PacketType::PlayClientChat);
        p.set_message(text).unwrap();
        p
    }

    #[test]
    fn login_and_configuration_track_phase_and_compression() {
        let (injector, wire, ctx) = setup();
        injector.inject().unwrap();
        let plain = FrameConfig::default();

        let mut handshake = create(&ctx, PacketType::HandshakeClientSetProtocol);
        handshake.integers().write(0, 765).unwrap().write(1, 2).unwrap();
        handshake.strings().write(0, "localhost".into()).unwrap();
        handshake.shorts().write(0, 25565).unwrap();
        let forwarded = injector.receive_frame(body(&handshake, &plain)).unwrap().unwrap();
        assert_eq!(
            forwarded,
            encode_frame(&handshake.handle().encode().unwrap(), &plain).unwrap()
        );
        assert_eq!(injector.phase(), Phase::Login);

        let mut hello = create(&ctx, PacketType::LoginClientStart);
        hello.strings().write(0, "Alex".into()).unwrap();
        assert!(injector.receive_frame(body(&hello, &plain)).unwrap().is_some());
        assert_eq!(injector.info().name, "Alex");

        let mut compression = create(&ctx, PacketType::LoginServerSetCompression);
        compression.integers().write(0, 64).unwrap();
        assert_eq!(injector.send_packet(compression).unwrap(), SendOutcome::Sent);
        assert!(injector.frame_config().compression_enabled);
        assert_eq!(
            ctx.capabilities.info(injector.id()).unwrap().compression_threshold,
            Some(64)
        );

        let mut success = create(&ctx, PacketType::LoginServerSuccess);
        success.strings().write(0, "Alex".into()).unwrap();
        injector
            .relay_outbound(body(&success, &injector.frame_config()))
            .unwrap();
        // Login only ends once the client acknowledges it.
        assert_eq!(injector.phase(), Phase::Login);

        let config = injector.frame_config();
        let ack = create(&ctx, PacketType::LoginClientLoginAck);
        assert!(injector.receive_frame(body(&ack, &config)).unwrap().is_some());
        assert_eq!(injector.phase(), Phase::Configuration);

        let finish = create(&ctx, PacketType::ConfigurationServerFinishConfiguration);
        injector.relay_outbound(body(&finish, &config)).unwrap();
        assert_eq!(injector.phase(), Phase::Configuration);

        let done = create(&ctx, PacketType::ConfigurationClientFinishConfiguration);
        assert!(injector.receive_frame(body(&done, &config)).unwrap().is_some());
        assert_eq!(injector.phase(), Phase::Play);

        // The compression packet itself went out before compression was switched on.
        let frames = wire.frames();
        assert_eq!(frames.len(), 3);
        let mut first = BytesMut::from(&frames[0][..]);
        let first = split_frame(&mut first, usize::MAX).unwrap().unwrap();
        let handle = WireHandle::decode(
            &ctx.schema,
            Phase::Login,
            Direction::ServerToClient,
            decode_frame(first, &plain).unwrap(),
        )
        .unwrap();
        assert_eq!(handle.class().packet_type(), PacketType::LoginServerSetCompression);
    }

    #[test]
    fn inbound_passes_rate_limiter_then_listeners() {
        let (injector, _wire, ctx) = setup();
        injector.inject().unwrap();
        injector.set_phase(Phase::Play);
        ListenerBuilder::new("no-spam")
            .types(&[PacketType::PlayClientChat])
            .on_receive(|_, packet| Ok(!packet.message()?.contains("spam")))
            .register(&ctx.pipeline, Arc::new(TickScheduler::new()))
            .unwrap();

        let config = injector.frame_config();
        assert!(injector.receive_frame(body(&chat(&ctx, "hi"), &config)).unwrap().is_some());
        assert!(injector.receive_frame(body(&chat(&ctx, "spam"), &config)).unwrap().is_none());
        assert!(injector.receive_frame(body(&chat(&ctx, "hi"), &config)).unwrap().is_some());
        // Fourth chat inside the same second.
        assert!(injector.receive_frame(body(&chat(&ctx, "hi"), &config)).unwrap().is_none());

        let history = ctx.diagnostics.history().get(injector.id()).unwrap();
        let cancelled: Vec<bool> = history.last_incoming(10).iter().map(|e| e.cancelled).collect();
        assert_eq!(cancelled, vec![false, true, false, true]);
    }

    #[test]
    fn outbound_cancel_skips_transport() {
        let (injector, wire, ctx) = setup();
        injector.inject().unwrap();
        ListenerBuilder::new("hush")
            .types(&[PacketType::PlayServerChat])
            .on_send(|_, _| Ok(false))
            .register(&ctx.pipeline, Arc::new(TickScheduler::new()))
            .unwrap();
        let reply = create(&ctx, PacketType::PlayServerChat);
        assert_eq!(injector.send_packet(reply).unwrap(), SendOutcome::Cancelled);
        assert!(wire.frames().is_empty());
    }

    #[test]
    fn uninjected_relays_untouched() {
        let (injector, wire, ctx) = setup();
        injector.set_phase(Phase::Play);
        ListenerBuilder::new("block-all")
            .on_receive(|_, _| Ok(false))
            .on_send(|_, _| Ok(false))
            .register(&ctx.pipeline, Arc::new(TickScheduler::new()))
            .unwrap();
        let plain = FrameConfig::default();
        let chat = chat(&ctx, "hi");
        let forwarded = injector.receive_frame(body(&chat, &plain)).unwrap().unwrap();
        assert_eq!(forwarded, encode_frame(&chat.handle().encode().unwrap(), &plain).unwrap());
        assert_eq!(
            injector.send_packet(create(&ctx, PacketType::PlayServerChat)).unwrap(),
            SendOutcome::Sent
        );
        assert_eq!(wire.frames().len(), 1);
    }

    #[test]
    fn detached_injector_refuses_reuse() {
        let (injector, _wire, ctx) = setup();
        injector.inject().unwrap();
        injector.inject().unwrap();
        injector.uninject();
        injector.uninject();
        assert_eq!(injector.state(), InjectorState::Detached);

        assert!(matches!(injector.inject(), Err(InterceptError::InjectorDetached(_))));
        let plain = FrameConfig::default();
        assert!(matches!(
            injector.receive_frame(body(&chat(&ctx, "hi"), &plain)),
            Err(InterceptError::InjectorDetached(_))
        ));
        assert!(injector
            .send_packet(create(&ctx, PacketType::PlayServerChat))
            .is_err());
    }

    #[test]
    fn registry_sends_only_to_live_connections() {
        let (injector, wire, ctx) = setup();
        let registry = InjectorRegistry::new();
        registry.insert(injector.clone());
        let id = injector.id();
        assert!(!registry.is_online(id));

        injector.inject().unwrap();
        assert!(registry.is_online(id));
        assert_eq!(registry.online().len(), 1);
        assert_eq!(
            registry.send_packet(id, create(&ctx, PacketType::PlayServerChat)),
            SendOutcome::Sent
        );

        injector.uninject();
        assert!(!registry.is_online(id));
        assert_eq!(
            registry.send_packet(id, create(&ctx, PacketType::PlayServerChat)),
            SendOutcome::Dropped
        );
        registry.remove(id);
        assert!(registry.player(id).is_none());
        assert_eq!(
            registry.send_packet(id, create(&ctx, PacketType::PlayServerChat)),
            SendOutcome::Dropped
        );
        assert_eq!(wire.frames().len(), 1);
    }
}
