use thiserror::Error;

/// The distinguished error values the core and its providers agree on,
/// plus the broader semantic categories (backend transient, precondition,
/// conflict) callers branch on. One `thiserror` enum for the whole
/// domain, with `#[from]` for the errors it wraps.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("snapshot not supported by this provider")]
    SnapshotNotSupported,

    #[error("provider '{0}' is not registered")]
    ProviderNotRegistered(String),

    #[error("provider '{0}' is unhealthy: {1}")]
    ProviderUnhealthy(String, String),

    #[error("sandbox '{0}' not found")]
    SandboxNotFound(String),

    #[error("sandbox '{0}' is paused")]
    SandboxPaused(String),

    #[error("bridge is closed")]
    BridgeClosed,

    #[error("call timed out")]
    CallTimedOut,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("KVM is not available on this host")]
    KvmUnavailable,

    #[error("required capability missing: {0}")]
    CapabilityMissing(String),

    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend transient error: {0}")]
    BackendTransient(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
