//! Isochronous transport boundary and a simulated bus for tests and tooling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::cycle_timer::{
    CYCLE_WRAP, TICKS_PER_CYCLE, TICKS_PER_SECOND, add_ticks, ticks_to_cycles, wrap_ticks,
};
use crate::diagnostics::{DiagnosticsContext, Verbosity};
use crate::error::TransportError;

/// What the stream processor needs from the isochronous stream it rides on.
///
/// Lifecycle hooks are called from the control context; the cycle timer is
/// read from both contexts and must not block.
pub trait IsoTransport: Send + Sync {
    /// Current bus time in ticks.
    fn cycle_timer_ticks(&self) -> u64;

    /// Wrap period of the cycle counter used for enable deadlines.
    fn cycle_wrap(&self) -> u64 {
        CYCLE_WRAP
    }

    /// Allocate transport resources.
    fn init(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Bind to the finalised stream topology.
    fn prepare(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Return the binding to its post-init state.
    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// One-line description for dumps.
    fn describe(&self) -> String {
        String::from("isostream")
    }

    /// Take a logging context; it shares the owning processor's verbosity.
    fn attach_diagnostics(&mut self, _diagnostics: DiagnosticsContext) {}
}

/// Monotonic host timestamp in nanoseconds.
pub fn monotonic_timestamp_ns() -> u64 {
    static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
    let elapsed = START.elapsed();
    (elapsed.as_secs() * 1_000_000_000) + elapsed.subsec_nanos() as u64
}

fn host_ticks() -> u64 {
    let ns = monotonic_timestamp_ns() as u128;
    wrap_ticks((ns * TICKS_PER_SECOND as u128 / 1_000_000_000) as u64)
}

/// Bus time source for [`SimulatedTransport`].
#[derive(Clone, Debug)]
pub enum BusClock {
    /// Stepped explicitly by the caller.
    Manual(Arc<AtomicU64>),
    /// Derived from the host monotonic clock.
    Host,
}

impl BusClock {
    /// Manually stepped clock starting at `ticks`.
    pub fn manual(ticks: u64) -> Self {
        BusClock::Manual(Arc::new(AtomicU64::new(wrap_ticks(ticks))))
    }

    /// Clock following host time.
    pub fn host() -> Self {
        BusClock::Host
    }

    /// Current bus time in ticks.
    pub fn now_ticks(&self) -> u64 {
        match self {
            BusClock::Manual(ticks) => ticks.load(Ordering::Acquire),
            BusClock::Host => host_ticks(),
        }
    }

    /// Current bus time in cycles.
    pub fn now_cycles(&self) -> u64 {
        ticks_to_cycles(self.now_ticks())
    }

    /// Jump a manual clock to `ticks`. Host clocks ignore this.
    pub fn set_ticks(&self, ticks: u64) {
        if let BusClock::Manual(current) = self {
            current.store(wrap_ticks(ticks), Ordering::Release);
        }
    }

    /// Step a manual clock forward, returning the new time.
    pub fn advance_ticks(&self, ticks: u64) -> u64 {
        match self {
            BusClock::Manual(current) => {
                let next = add_ticks(current.load(Ordering::Acquire), ticks as i64);
                current.store(next, Ordering::Release);
                next
            }
            BusClock::Host => host_ticks(),
        }
    }

    /// Step a manual clock forward by whole cycles.
    pub fn advance_cycles(&self, cycles: u64) -> u64 {
        self.advance_ticks(cycles * TICKS_PER_CYCLE)
    }
}

/// Lifecycle hook invoked on a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// `init()`
    Init,
    /// `prepare()`
    Prepare,
    /// `reset()`
    Reset,
}

/// Shared record of hook invocations.
#[derive(Clone, Debug, Default)]
pub struct HookLog {
    calls: Arc<Mutex<Vec<Hook>>>,
}

impl HookLog {
    /// Record a call.
    pub fn record(&self, hook: Hook) {
        self.calls.lock().push(hook);
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<Hook> {
        self.calls.lock().clone()
    }

    /// How many times `hook` was invoked.
    pub fn count(&self, hook: Hook) -> usize {
        self.calls.lock().iter().filter(|&&h| h == hook).count()
    }
}

/// In-process transport binding driven by a [`BusClock`].
#[derive(Debug)]
pub struct SimulatedTransport {
    clock: BusClock,
    channel: i32,
    log: HookLog,
    diagnostics: Option<DiagnosticsContext>,
    fail_init: Option<String>,
    fail_prepare: Option<String>,
    fail_reset: Option<String>,
}

impl SimulatedTransport {
    /// Transport on iso `channel` reading time from `clock`.
    pub fn new(clock: BusClock, channel: i32) -> Self {
        Self {
            clock,
            channel,
            log: HookLog::default(),
            diagnostics: None,
            fail_init: None,
            fail_prepare: None,
            fail_reset: None,
        }
    }

    /// Make `init()` fail.
    pub fn failing_init(mut self, reason: impl Into<String>) -> Self {
        self.fail_init = Some(reason.into());
        self
    }

    /// Make `prepare()` fail.
    pub fn failing_prepare(mut self, reason: impl Into<String>) -> Self {
        self.fail_prepare = Some(reason.into());
        self
    }

    /// Make `reset()` fail.
    pub fn failing_reset(mut self, reason: impl Into<String>) -> Self {
        self.fail_reset = Some(reason.into());
        self
    }

    /// Handle on the hook record; clone it before boxing the transport.
    pub fn hook_log(&self) -> HookLog {
        self.log.clone()
    }

    /// The clock this transport reports.
    pub fn clock(&self) -> &BusClock {
        &self.clock
    }

    fn hook(&self, hook: Hook, failure: &Option<String>) -> Result<(), TransportError> {
        self.log.record(hook);
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.detail(Verbosity::Verbose, || {
                format!("{hook:?} on channel {}", self.channel)
            });
        }
        match failure {
            Some(reason) => Err(TransportError::new(reason.clone())),
            None => Ok(()),
        }
    }
}

impl IsoTransport for SimulatedTransport {
    fn cycle_timer_ticks(&self) -> u64 {
        self.clock.now_ticks()
    }

    fn init(&mut self) -> Result<(), TransportError> {
        self.hook(Hook::Init, &self.fail_init)
    }

    fn prepare(&mut self) -> Result<(), TransportError> {
        self.hook(Hook::Prepare, &self.fail_prepare)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.hook(Hook::Reset, &self.fail_reset)
    }

    fn describe(&self) -> String {
        format!("simulated isostream on channel {}", self.channel)
    }

    fn attach_diagnostics(&mut self, diagnostics: DiagnosticsContext) {
        self.diagnostics = Some(diagnostics);
    }
}
