//! Per-instance logging context and operator-facing state dumps.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::BufferSnapshot;
use crate::cycle_timer::{TICKS_PER_SECOND, ticks_to_cycles};
use crate::processor::{Direction, OperatingState};

/// Default number of history lines retained per context.
pub const DEFAULT_HISTORY_LEN: usize = 64;

/// How chatty a component is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    /// Warnings only.
    Quiet = 0,
    /// Lifecycle transitions.
    Normal = 1,
    /// Lifecycle details and dumps.
    Verbose = 2,
    /// Everything, including per-call tracing.
    VeryVerbose = 3,
}

impl Verbosity {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Verbosity::Quiet,
            1 => Verbosity::Normal,
            2 => Verbosity::Verbose,
            _ => Verbosity::VeryVerbose,
        }
    }
}

/// Logging context held by each component instance.
///
/// Children created with [`DiagnosticsContext::child`] share the verbosity
/// and history of their parent, so adjusting a processor also adjusts its
/// buffer, transport and ports.
#[derive(Clone)]
pub struct DiagnosticsContext {
    component: Arc<str>,
    level: Arc<AtomicU8>,
    history: Arc<Mutex<VecDeque<String>>>,
    history_len: usize,
}

impl DiagnosticsContext {
    /// Create a root context.
    pub fn new(component: impl Into<String>, history_len: usize) -> Self {
        let history_len = history_len.max(1);
        Self {
            component: Arc::from(component.into()),
            level: Arc::new(AtomicU8::new(Verbosity::Normal as u8)),
            history: Arc::new(Mutex::new(VecDeque::with_capacity(history_len))),
            history_len,
        }
    }

    /// Derive a named context sharing this context's verbosity and history.
    pub fn child(&self, component: &str) -> Self {
        Self {
            component: Arc::from(format!("{}/{}", self.component, component)),
            level: self.level.clone(),
            history: self.history.clone(),
            history_len: self.history_len,
        }
    }

    /// Component name used as the `component` tracing field.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Current verbosity.
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Adjust verbosity for this context and every child.
    pub fn set_verbosity(&self, level: Verbosity) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Whether messages at `level` are recorded.
    pub fn enabled(&self, level: Verbosity) -> bool {
        self.verbosity() >= level
    }

    /// Advisory condition: always recorded.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(component = %self.component, "{message}");
        self.push(format!("WARN {}: {message}", self.component));
    }

    /// Lifecycle message recorded at [`Verbosity::Normal`] and above.
    pub fn note(&self, message: impl Into<String>) {
        if !self.enabled(Verbosity::Normal) {
            return;
        }
        let message = message.into();
        info!(component = %self.component, "{message}");
        self.push(format!("{}: {message}", self.component));
    }

    /// Detail message recorded at `level` and above.
    pub fn detail(&self, level: Verbosity, message: impl FnOnce() -> String) {
        if !self.enabled(level) {
            return;
        }
        let message = message();
        debug!(component = %self.component, "{message}");
        self.push(format!("{}: {message}", self.component));
    }

    /// Pop the oldest history entry.
    pub fn pop_log(&self) -> Option<String> {
        self.history.lock().pop_front()
    }

    /// Copy of the retained history, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().iter().cloned().collect()
    }

    fn push(&self, line: String) {
        let mut guard = self.history.lock();
        guard.push_back(line);
        while guard.len() > self.history_len {
            guard.pop_front();
        }
    }
}

impl fmt::Debug for DiagnosticsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsContext")
            .field("component", &self.component)
            .field("verbosity", &self.verbosity())
            .finish()
    }
}

/// Human-readable snapshot of a stream processor.
#[derive(Clone, Debug)]
pub struct StreamSnapshot {
    /// Stream direction.
    pub direction: Direction,
    /// Isochronous port/channel the stream is bound to.
    pub port: i32,
    /// Lifecycle state.
    pub state: OperatingState,
    /// Bus time at the moment of the dump, in ticks.
    pub now_ticks: u64,
    /// Xruns since the last reset.
    pub xruns: u32,
    /// Transport-level stream active.
    pub running: bool,
    /// Data movement engaged.
    pub enabled: bool,
    /// Pending enable deadline in cycles.
    pub enable_at: Option<u64>,
    /// Periods in the buffer.
    pub nb_buffers: u32,
    /// Frames per period.
    pub period: u32,
    /// Nominal frame rate in Hz.
    pub nominal_rate_hz: u32,
    /// Frame rate recovered by this stream's own DLL.
    pub measured_rate_hz: f64,
    /// Frame rate of the sync source, when one is set and reachable.
    pub sync_rate_hz: Option<f64>,
    /// Buffer state.
    pub buffer: BufferSnapshot,
}

impl fmt::Display for StreamSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " StreamProcessor ({} port {})", self.direction, self.port)?;
        writeln!(
            f,
            "  Now                   : {:011} (cycle {})",
            self.now_ticks,
            ticks_to_cycles(self.now_ticks)
        )?;
        writeln!(f, "  State                 : {}", self.state)?;
        writeln!(f, "  Xruns                 : {}", self.xruns)?;
        writeln!(f, "  Running               : {}", yes_no(self.running))?;
        writeln!(f, "  Enabled               : {}", yes_no(self.enabled))?;
        match self.enable_at {
            Some(cycle) => writeln!(f, "   enable at            : cycle {cycle}")?,
            None => writeln!(f, "   enable at            : -")?,
        }
        writeln!(
            f,
            "  Geometry              : {} x {} frames",
            self.nb_buffers, self.period
        )?;
        match self.sync_rate_hz {
            Some(sync) => writeln!(
                f,
                "  Device framerate      : Sync: {:.3}, Buffer {:.3} (nominal {})",
                sync, self.measured_rate_hz, self.nominal_rate_hz
            )?,
            None => writeln!(
                f,
                "  Device framerate      : Sync: -, Buffer {:.3} (nominal {})",
                self.measured_rate_hz, self.nominal_rate_hz
            )?,
        }
        write!(f, "{}", self.buffer)
    }
}

/// Convert a ticks-per-frame rate into frames per second.
pub fn ticks_per_frame_to_hz(ticks_per_frame: f64) -> f64 {
    if ticks_per_frame <= 0.0 {
        return 0.0;
    }
    TICKS_PER_SECOND as f64 / ticks_per_frame
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "Yes" } else { "No" }
}
