//! Interception-layer errors.

use mc_intercept_proto::{ProtoError, Uuid};
use mc_intercept_script::ScriptError;
use thiserror::Error;

/// Failure raised by a listener callback. Never aborts dispatch.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("{0}")]
    Failed(String),

    #[error("listener panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("listener '{listener}' failed: {source}")]
    ListenerRuntime {
        listener: String,
        #[source]
        source: ListenerError,
    },

    #[error("listener '{0}' is already registered")]
    DuplicateListener(String),

    #[error("connection {0} is gone")]
    ConnectionGone(Uuid),

    #[error("injector for {0} has been detached")]
    InjectorDetached(Uuid),

    #[error("unknown bundle '{0}'")]
    UnknownBundle(String),

    #[error("no fake entity with id {0}")]
    UnknownEntity(i32),

    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
