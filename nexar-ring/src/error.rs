use crate::types::Rank;

pub type Result<T> = std::result::Result<T, RingError>;

/// Coarse error classes surfaced to callers as distinct result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration or argument validation failed; nothing was acquired.
    InvalidArgument,
    /// Memory or handle acquisition failed; partial state was rolled back.
    SystemError,
    /// The device layer failed in a way the library does not classify.
    UnhandledDeviceError,
    /// An internal invariant was broken. Indicates a bug, not the environment.
    InternalError,
}

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("invalid rank {rank}: device count is {n_dev}")]
    InvalidRank { rank: Rank, n_dev: usize },

    #[error("unsupported device count {n_dev}")]
    UnsupportedDeviceCount { n_dev: usize },

    #[error("rank {rank} disagrees on {field}: local={local}, remote={remote}")]
    PeerMismatch {
        rank: Rank,
        field: &'static str,
        local: usize,
        remote: usize,
    },

    #[error("buffer size mismatch for {buffer}: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("allocation of {bytes} bytes on {location} failed")]
    AllocationFailed { location: String, bytes: usize },

    #[error("opening {what} from device {from} to device {to} failed: {reason}")]
    HandleOpenFailed {
        what: &'static str,
        from: usize,
        to: usize,
        reason: String,
    },

    #[error("rendezvous {session:#x} timed out: {arrived}/{expected} ranks arrived")]
    RendezvousTimeout {
        session: u64,
        arrived: usize,
        expected: usize,
    },

    #[error("rendezvous {session:#x} aborted by a peer")]
    RendezvousAborted { session: u64 },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RingError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The result-code class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RingError::InvalidRank { .. }
            | RingError::UnsupportedDeviceCount { .. }
            | RingError::PeerMismatch { .. }
            | RingError::BufferSizeMismatch { .. }
            | RingError::InvalidConfig(_) => ErrorKind::InvalidArgument,
            RingError::AllocationFailed { .. }
            | RingError::HandleOpenFailed { .. }
            | RingError::RendezvousTimeout { .. }
            | RingError::RendezvousAborted { .. } => ErrorKind::SystemError,
            RingError::Device { .. } => ErrorKind::UnhandledDeviceError,
            RingError::Internal(_) | RingError::LockPoisoned(_) => ErrorKind::InternalError,
        }
    }
}
