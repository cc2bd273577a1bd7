//! Runtime configuration for communicator construction and the ring kernel.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `NEXAR_RING_`) or by constructing a custom `RingConfig`. The
//! configuration is passed explicitly to constructors; there is no global
//! mutable state.

use std::time::Duration;

use crate::error::{Result, RingError};
use crate::topology::TopologyId;
use crate::types::{DEFAULT_BUFFER_SIZE_BYTES, MAX_RINGS};

/// Verbosity of internal diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DebugLevel {
    /// Internal warnings are suppressed.
    None,
    /// Internal warnings are logged.
    #[default]
    Warn,
    /// Warnings plus construction details are logged.
    Info,
    /// Like `Info`, and any internal warning is fatal.
    Abort,
}

impl DebugLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Some(DebugLevel::None),
            "WARN" => Some(DebugLevel::Warn),
            "INFO" => Some(DebugLevel::Info),
            "ABORT" => Some(DebugLevel::Abort),
            _ => None,
        }
    }
}

/// Tuning parameters for the ring reduce-scatter engine.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Staging-buffer size per ring, in bytes.
    pub buffer_size: usize,

    /// Diagnostic verbosity.
    pub debug: DebugLevel,

    /// Force a specific topology table instead of detecting one.
    pub topology: Option<TopologyId>,

    /// Log a checksum of input and output buffers around each collective.
    pub print_checksums: bool,

    /// Producer workers per ring group (the signaling worker is extra).
    pub producers: usize,

    /// Upper bound on rings built per communicator.
    pub max_rings: usize,

    /// How long construction waits for all peers to rendezvous.
    pub rendezvous_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE_BYTES,
            debug: DebugLevel::Warn,
            topology: None,
            print_checksums: false,
            producers: 4,
            max_rings: MAX_RINGS,
            rendezvous_timeout: Duration::from_secs(30),
        }
    }
}

impl RingConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NEXAR_RING_BUFFSIZE`
    /// - `NEXAR_RING_DEBUG` (`NONE`, `WARN`, `INFO`, `ABORT`)
    /// - `NEXAR_RING_TOPOLOGY` (`pcie`, `cube-mesh`, `big-basin`,
    ///   `half-cube-mesh`, `fully-connected`)
    /// - `NEXAR_RING_PRINT_CHECKSUMS`
    /// - `NEXAR_RING_PRODUCERS`
    /// - `NEXAR_RING_MAX_RINGS`
    /// - `NEXAR_RING_RENDEZVOUS_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("NEXAR_RING_BUFFSIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.buffer_size = n;
        }
        if let Ok(v) = std::env::var("NEXAR_RING_DEBUG")
            && let Some(level) = DebugLevel::parse(&v)
        {
            cfg.debug = level;
        }
        if let Ok(v) = std::env::var("NEXAR_RING_TOPOLOGY") {
            match v.parse::<TopologyId>() {
                Ok(id) => cfg.topology = Some(id),
                Err(e) => cfg.warn(format_args!("ignoring NEXAR_RING_TOPOLOGY: {e}")),
            }
        }
        if let Ok(v) = std::env::var("NEXAR_RING_PRINT_CHECKSUMS") {
            cfg.print_checksums = matches!(v.as_str(), "1" | "true" | "TRUE");
        }
        if let Ok(v) = std::env::var("NEXAR_RING_PRODUCERS")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.producers = n;
        }
        if let Ok(v) = std::env::var("NEXAR_RING_MAX_RINGS")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.max_rings = n;
        }
        if let Ok(v) = std::env::var("NEXAR_RING_RENDEZVOUS_TIMEOUT_SECS")
            && let Ok(s) = v.parse::<u64>()
        {
            cfg.rendezvous_timeout = Duration::from_secs(s);
        }

        cfg
    }

    /// Reject values the planner and kernel cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.producers == 0 {
            return Err(RingError::InvalidConfig(
                "at least one producer per ring group is required".into(),
            ));
        }
        if self.max_rings == 0 || self.max_rings > MAX_RINGS {
            return Err(RingError::InvalidConfig(format!(
                "max_rings must be in 1..={MAX_RINGS}, got {}",
                self.max_rings
            )));
        }
        if self.buffer_size == 0 {
            return Err(RingError::InvalidConfig(
                "staging buffer size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Emit an internal warning, honoring the debug level.
    ///
    /// # Panics
    /// Panics when the debug level is [`DebugLevel::Abort`].
    pub fn warn(&self, args: std::fmt::Arguments<'_>) {
        if self.debug >= DebugLevel::Warn {
            tracing::warn!("{args}");
        }
        if self.debug >= DebugLevel::Abort {
            panic!("aborting on warning: {args}");
        }
    }

    /// Emit a construction detail at `info`, honoring the debug level.
    pub fn info(&self, args: std::fmt::Arguments<'_>) {
        if self.debug >= DebugLevel::Info {
            tracing::info!("{args}");
        }
    }
}
