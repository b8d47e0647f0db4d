//! Packet interception: per-connection injectors, the listener pipeline, rate limiting,
//! scripted filters and client-side fake state, tied together by [`ProtocolManager`].

pub mod capability;
pub mod diagnostics;
pub mod effects;
pub mod error;
pub mod fake;
pub mod host;
pub mod injector;
pub mod listener;
pub mod manager;
pub mod packet_scheduler;
pub mod rate_limit;
pub mod task;

#[cfg(test)]
mod testing;

pub use capability::{CapabilityDetector, ClientInfo, ModLoader};
pub use diagnostics::Diagnostics;
pub use effects::{PacketEffects, Particle, SoundCategory};
pub use error::{InterceptError, ListenerError};
pub use fake::{EntityKind, FakeBlockManager, FakeEntityManager};
pub use host::{
    ConnectionId, ConnectionInfo, EmptyWorld, ErrorSink, FrameTransport, LogErrorSink,
    PacketSender, PlayerDirectory, SendOutcome, WorldView,
};
pub use injector::{ConnectionInjector, InjectorRegistry, InjectorState, InterceptContext};
pub use listener::{
    ListenerBuilder, ListenerGroup, ListenerPipeline, ListenerPriority, ListenerResult,
    PacketListener,
};
pub use manager::{ManagerSettings, ProtocolManager};
pub use packet_scheduler::PacketScheduler;
pub use rate_limit::RateLimiter;
pub use task::{TaskHandle, TaskScheduler, TickScheduler};
