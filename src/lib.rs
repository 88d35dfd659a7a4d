#![deny(missing_docs)]

//! Synchronisation and buffering core for isochronous audio streams.
//!
//! Each [`StreamProcessor`] owns one [`TimestampedBuffer`] and one
//! [`ClockRecovery`] loop. The transport side pushes or pulls frames on every
//! packet and reports bus time; the application side reads or writes
//! periods. A [`StreamProcessorManager`] owns the processors, hands them a
//! common geometry and resolves sync sources between them by handle.

use std::sync::Once;

pub mod buffer;
pub mod clock;
pub mod config;
pub mod cycle_timer;
pub mod diagnostics;
pub mod error;
pub mod manager;
pub mod ports;
pub mod processor;
pub mod transport;
pub mod xrun;


pub use buffer::{BufferSnapshot, TimestampedBuffer};
pub use clock::{ClockRecovery, DEFAULT_DLL_BANDWIDTH_HZ};
pub use config::{DeviceId, StreamingConfig};
pub use diagnostics::{DiagnosticsContext, StreamSnapshot, Verbosity};
pub use error::{BufferError, ConfigError, PortError, ResetStage, StreamError, TransportError};
pub use manager::{Orchestrator, ProcessorHandle, SharedGeometry, StreamProcessorManager};
pub use ports::{PortList, PortManager};
pub use processor::{Direction, OperatingState, PathCapabilities, StreamProcessor};
pub use transport::{BusClock, IsoTransport, SimulatedTransport};
pub use xrun::XrunCounter;

static TRACING_INIT: Once = Once::new();

/// Install a `tracing_subscriber::fmt` subscriber, once per process. Does
/// nothing if the host application already installed one.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}
