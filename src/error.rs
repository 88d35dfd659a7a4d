//! Error types surfaced by the streaming core.

use std::fmt;

use crate::manager::ProcessorHandle;
use crate::processor::{Direction, OperatingState};

/// Failures raised by the timestamped buffer.
#[derive(thiserror::Error, Debug)]
pub enum BufferError {
    /// Backing storage for the requested geometry could not be obtained.
    #[error("could not allocate {frames} frames x {channels} channels")]
    Allocation {
        /// Requested capacity in frames.
        frames: usize,
        /// Requested channel count.
        channels: usize,
        /// Underlying mapping error, when the storage was memory mapped.
        #[source]
        source: Option<std::io::Error>,
    },
    /// A whole-buffer operation was issued before `init()`.
    #[error("buffer has not been initialised")]
    NotInitialized,
    /// The buffer geometry has no channels.
    #[error("buffer needs at least one channel")]
    ZeroChannels,
    /// A slice did not hold a whole number of frames.
    #[error("{samples} samples is not a whole number of {channels}-channel frames")]
    ChannelMismatch {
        /// Channels per frame.
        channels: usize,
        /// Samples offered.
        samples: usize,
    },
}

/// Failure reported by the isochronous transport binding.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("transport failure: {reason}")]
pub struct TransportError {
    /// Human readable cause.
    pub reason: String,
}

impl TransportError {
    /// Build a transport error from any displayable cause.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure reported by the port abstraction.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("port failure: {reason}")]
pub struct PortError {
    /// Human readable cause.
    pub reason: String,
}

impl PortError {
    /// Build a port error from any displayable cause.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Stage of the reset chain that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStage {
    /// Discarding buffer contents.
    Buffer,
    /// Resetting the port abstraction.
    Ports,
    /// Resetting the transport binding.
    Transport,
}

impl fmt::Display for ResetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetStage::Buffer => "data buffer",
            ResetStage::Ports => "ports",
            ResetStage::Transport => "isostream",
        };
        f.write_str(name)
    }
}

/// Data path a caller tried to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPath {
    /// Transport pushes received packets into the buffer.
    TransportPush,
    /// Transport pulls frames out of the buffer for transmission.
    TransportPull,
    /// Application reads received periods.
    PortRead,
    /// Application writes periods for transmission.
    PortWrite,
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPath::TransportPush => f.write_str("transport push"),
            DataPath::TransportPull => f.write_str("transport pull"),
            DataPath::PortRead => f.write_str("port read"),
            DataPath::PortWrite => f.write_str("port write"),
        }
    }
}

/// Error enumeration for stream processor lifecycle and data movement.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// `prepare()` was called without an orchestrator attached.
    #[error("not attached to a manager")]
    NotAttached,
    /// The operation is not valid in the current lifecycle state.
    #[error("cannot {op} while {state}")]
    InvalidState {
        /// Operation that was refused.
        op: &'static str,
        /// State the processor was in.
        state: OperatingState,
    },
    /// The orchestrator reported a geometry that cannot back a buffer.
    #[error("invalid stream geometry: {nb_buffers} buffers of {period} frames")]
    InvalidGeometry {
        /// Number of periods requested.
        nb_buffers: u32,
        /// Period size in frames.
        period: u32,
    },
    /// Buffer allocation or initialisation failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// One stage of `reset()` failed; later stages were not attempted.
    #[error("could not reset {stage}")]
    Reset {
        /// Stage that failed.
        stage: ResetStage,
        /// Cause reported by that stage.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The transport binding refused a lifecycle hook.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The port abstraction refused a lifecycle hook.
    #[error(transparent)]
    Ports(#[from] PortError),
    /// The processor's direction does not provide this data path.
    #[error("{direction} stream has no {path} path")]
    UnsupportedPath {
        /// Direction fixed at construction.
        direction: Direction,
        /// Path that was requested.
        path: DataPath,
    },
    /// A per-port call did not supply one slice per port.
    #[error("{got} port buffers offered for {ports} ports")]
    PortCountMismatch {
        /// Ports on the stream.
        ports: usize,
        /// Slices offered.
        got: usize,
    },
    /// A handle referenced a processor that has been removed.
    #[error("stale processor handle {0}")]
    StaleHandle(ProcessorHandle),
}

/// Configuration loading failures.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The document was not valid TOML or did not match the schema.
    #[error("could not parse streaming configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The document could not be read.
    #[error("could not read streaming configuration: {0}")]
    Io(#[from] std::io::Error),
    /// A DLL bandwidth was zero, negative or not finite.
    #[error("invalid DLL bandwidth {0} Hz")]
    InvalidBandwidth(f64),
}
