//! Stream processor: lifecycle, enable deadline and data movement for one
//! isochronous stream.
//!
//! Control calls (`init`, `prepare`, `reset`) take `&mut self` and expect the
//! transport to be quiesced. `enable`, `disable` and the data paths take
//! `&self`; cross-context state is atomic and written by one side only.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer::TimestampedBuffer;
use crate::clock::{ClockRecovery, DEFAULT_DLL_BANDWIDTH_HZ};
use crate::cycle_timer::{signed_cycle_distance, ticks_to_cycles};
use crate::diagnostics::{
    DEFAULT_HISTORY_LEN, DiagnosticsContext, StreamSnapshot, Verbosity, ticks_per_frame_to_hz,
};
use crate::error::{BufferError, DataPath, ResetStage, StreamError};
use crate::manager::{Orchestrator, ProcessorHandle};
use crate::ports::PortManager;
use crate::transport::IsoTransport;
use crate::xrun::XrunCounter;

/// Periods allocated by `init()` before an orchestrator provides a geometry.
pub const DEFAULT_NB_BUFFERS: u32 = 2;
/// Period size used by `init()` before an orchestrator provides a geometry.
pub const DEFAULT_PERIOD_SIZE: u32 = 512;

const NO_DEADLINE: u64 = u64::MAX;

/// Which way frames flow through the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    Receive,
    /// Host to device.
    Transmit,
}

impl Direction {
    /// Data paths available in this direction.
    pub fn capabilities(self) -> PathCapabilities {
        match self {
            Direction::Receive => PathCapabilities {
                transport_push: true,
                transport_pull: false,
            },
            Direction::Transmit => PathCapabilities {
                transport_push: false,
                transport_pull: true,
            },
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Receive => f.write_str("receive"),
            Direction::Transmit => f.write_str("transmit"),
        }
    }
}

/// Data paths a processor exposes.
///
/// A pushing transport pairs with a reading port side, a pulling transport
/// with a writing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCapabilities {
    /// Transport writes received frames into the buffer.
    pub transport_push: bool,
    /// Transport reads frames out of the buffer for transmission.
    pub transport_pull: bool,
}

impl PathCapabilities {
    /// Whether `path` is available.
    pub fn supports(self, path: DataPath) -> bool {
        match path {
            DataPath::TransportPush | DataPath::PortRead => self.transport_push,
            DataPath::TransportPull | DataPath::PortWrite => self.transport_pull,
        }
    }
}

/// Lifecycle position. Running and enabled are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperatingState {
    /// Freshly built, no storage.
    Constructed,
    /// Buffer allocated with a provisional geometry.
    Initialized,
    /// Bound to the orchestrator's geometry; ready to enable.
    Prepared,
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingState::Constructed => f.write_str("constructed"),
            OperatingState::Initialized => f.write_str("initialized"),
            OperatingState::Prepared => f.write_str("prepared"),
        }
    }
}

/// One direction of one device stream.
pub struct StreamProcessor {
    direction: Direction,
    port: i32,
    nominal_rate_hz: u32,
    state: OperatingState,
    nb_buffers: u32,
    period: u32,
    transport: Box<dyn IsoTransport>,
    ports: Box<dyn PortManager>,
    manager: Option<Arc<dyn Orchestrator>>,
    buffer: TimestampedBuffer,
    clock: Mutex<ClockRecovery>,
    scratch: Mutex<Vec<f32>>,
    xruns: XrunCounter,
    running: AtomicBool,
    enabled: AtomicBool,
    enable_at: AtomicU64,
    sync_source: Option<ProcessorHandle>,
    diagnostics: DiagnosticsContext,
}

impl StreamProcessor {
    /// Build a processor for `direction` on iso `port` at `framerate` Hz.
    pub fn new(
        direction: Direction,
        port: i32,
        framerate: u32,
        mut transport: Box<dyn IsoTransport>,
        mut ports: Box<dyn PortManager>,
    ) -> Self {
        let diagnostics =
            DiagnosticsContext::new(format!("{direction}-sp{port}"), DEFAULT_HISTORY_LEN);
        transport.attach_diagnostics(diagnostics.child("transport"));
        ports.attach_diagnostics(diagnostics.child("ports"));
        let clock = ClockRecovery::new(framerate, DEFAULT_DLL_BANDWIDTH_HZ);
        let buffer = TimestampedBuffer::new(
            ports.channel_count(),
            clock.nominal_ticks_per_frame(),
            diagnostics.child("buffer"),
        );
        Self {
            direction,
            port,
            nominal_rate_hz: framerate,
            state: OperatingState::Constructed,
            nb_buffers: DEFAULT_NB_BUFFERS,
            period: DEFAULT_PERIOD_SIZE,
            transport,
            ports,
            manager: None,
            buffer,
            clock: Mutex::new(clock),
            scratch: Mutex::new(Vec::new()),
            xruns: XrunCounter::new(),
            running: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            enable_at: AtomicU64::new(NO_DEADLINE),
            sync_source: None,
            diagnostics,
        }
    }

    /// Receive-direction processor.
    pub fn receive(
        port: i32,
        framerate: u32,
        transport: Box<dyn IsoTransport>,
        ports: Box<dyn PortManager>,
    ) -> Self {
        Self::new(Direction::Receive, port, framerate, transport, ports)
    }

    /// Transmit-direction processor.
    pub fn transmit(
        port: i32,
        framerate: u32,
        transport: Box<dyn IsoTransport>,
        ports: Box<dyn PortManager>,
    ) -> Self {
        Self::new(Direction::Transmit, port, framerate, transport, ports)
    }

    /// Use `bandwidth_hz` for the clock recovery loop.
    pub fn with_dll_bandwidth(mut self, bandwidth_hz: f64) -> Self {
        self.clock.get_mut().set_bandwidth_hz(bandwidth_hz);
        self
    }

    /// Back the buffer with an anonymous memory map.
    pub fn with_mapped_storage(mut self, mapped: bool) -> Self {
        self.buffer.set_mapped_storage(mapped);
        self
    }

    /// Replace the logging context; buffer, transport and ports get children
    /// of it.
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsContext) -> Self {
        self.buffer.set_diagnostics(diagnostics.child("buffer"));
        self.transport
            .attach_diagnostics(diagnostics.child("transport"));
        self.ports.attach_diagnostics(diagnostics.child("ports"));
        self.diagnostics = diagnostics;
        self
    }

    /// Attach the orchestrator that supplies buffer geometry.
    pub fn set_manager(&mut self, manager: Arc<dyn Orchestrator>) {
        self.manager = Some(manager);
    }

    /// Detach from the orchestrator.
    pub fn clear_manager(&mut self) {
        self.manager = None;
    }

    /// Whether an orchestrator is attached.
    pub fn has_manager(&self) -> bool {
        self.manager.is_some()
    }

    /// Allocate and clear the buffer and bring up the transport binding.
    ///
    /// Before `prepare()` the buffer gets a provisional geometry; after it,
    /// the prepared geometry is kept and the state stays prepared.
    pub fn init(&mut self) -> Result<(), StreamError> {
        self.diagnostics.note(format!(
            "init {} stream on port {} at {} Hz",
            self.direction, self.port, self.nominal_rate_hz
        ));
        self.transport.init()?;
        self.configure_buffer(self.nb_buffers, self.period)?;
        if self.state == OperatingState::Constructed {
            self.state = OperatingState::Initialized;
        }
        Ok(())
    }

    /// Bind to the orchestrator's geometry and prepare ports and transport.
    pub fn prepare(&mut self) -> Result<(), StreamError> {
        if self.state == OperatingState::Constructed {
            return Err(StreamError::InvalidState {
                op: "prepare",
                state: self.state,
            });
        }
        let Some(manager) = self.manager.as_ref() else {
            self.diagnostics.warn("prepare: not attached to a manager");
            return Err(StreamError::NotAttached);
        };
        let nb_buffers = manager.nb_buffers();
        let period = manager.period_size();
        if nb_buffers == 0 || period == 0 {
            return Err(StreamError::InvalidGeometry { nb_buffers, period });
        }
        self.diagnostics.note(format!(
            "prepare: {nb_buffers} buffers of {period} frames, {} channels",
            self.ports.channel_count()
        ));

        self.configure_buffer(nb_buffers, period)?;
        self.nb_buffers = nb_buffers;
        self.period = period;
        self.ports.prepare_ports()?;
        self.transport.prepare()?;
        self.state = OperatingState::Prepared;
        Ok(())
    }

    fn configure_buffer(&mut self, nb_buffers: u32, period: u32) -> Result<(), StreamError> {
        let frames = usize::try_from(u64::from(nb_buffers) * u64::from(period))
            .map_err(|_| StreamError::InvalidGeometry { nb_buffers, period })?;
        let channels = self.ports.channel_count();
        self.buffer.set_geometry(frames, channels);
        if let Err(err) = self.buffer.init() {
            self.diagnostics
                .warn(format!("could not init data buffer: {err}"));
            return Err(err.into());
        }
        *self.scratch.get_mut() = vec![0.0; period as usize * channels];
        self.buffer
            .set_ticks_per_frame(self.clock.get_mut().ticks_per_frame());
        Ok(())
    }

    /// Discard buffered content, zero the xrun count and reset ports and
    /// transport. Stops at the first stage that fails.
    pub fn reset(&mut self) -> Result<(), StreamError> {
        self.diagnostics
            .detail(Verbosity::Verbose, || "resetting".to_string());
        self.buffer
            .reset()
            .map_err(|err| self.reset_failed(ResetStage::Buffer, err))?;
        self.xruns.reset();
        let clock = self.clock.get_mut();
        let estimate = clock.ticks_per_frame();
        clock.reset_to(estimate);
        self.ports
            .reset_ports()
            .map_err(|err| self.reset_failed(ResetStage::Ports, err))?;
        self.transport
            .reset()
            .map_err(|err| self.reset_failed(ResetStage::Transport, err))?;
        Ok(())
    }

    fn reset_failed<E>(&self, stage: ResetStage, err: E) -> StreamError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.diagnostics
            .warn(format!("could not reset {stage}: {err}"));
        StreamError::Reset {
            stage,
            source: Box::new(err),
        }
    }

    /// Arm data flow from bus cycle `at_cycles`.
    ///
    /// Never refuses: enabling a stream that is not running or not prepared,
    /// or with a deadline already past, is logged and carried out. Returns
    /// the signed distance in cycles from now to the deadline.
    pub fn enable(&self, at_cycles: u64) -> i64 {
        if !self.is_running() {
            self.diagnostics
                .warn(format!("enable at cycle {at_cycles} while not running"));
        }
        if self.state != OperatingState::Prepared {
            self.diagnostics
                .warn(format!("enable while {}", self.state));
        }
        let wrap = self.cycle_wrap();
        let now = ticks_to_cycles(self.time_now()) % wrap;
        let deadline = at_cycles % wrap;
        let distance = signed_cycle_distance(now, deadline, wrap);
        if distance < 0 {
            self.diagnostics.warn(format!(
                "enable deadline {deadline} is {} cycles in the past (now {now})",
                -distance
            ));
        }
        self.enable_at.store(deadline, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
        self.diagnostics
            .note(format!("enabled at cycle {deadline}, {distance} cycles from now"));
        distance
    }

    /// Stop data movement and clear the deadline. Idempotent.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.enable_at.store(NO_DEADLINE, Ordering::Release);
        self.diagnostics.note("disabled");
    }

    /// Log state ahead of an `enable(at_cycles)`.
    pub fn prepare_for_enable(&self, at_cycles: u64) {
        self.diagnostics.detail(Verbosity::Verbose, || {
            format!(
                "preparing to enable: now cycle {}, deadline cycle {at_cycles}",
                ticks_to_cycles(self.time_now())
            )
        });
        self.buffer.dump_info();
    }

    /// Log state ahead of a `disable()`.
    pub fn prepare_for_disable(&self) {
        self.diagnostics.detail(Verbosity::Verbose, || {
            format!(
                "preparing to disable: now cycle {}",
                ticks_to_cycles(self.time_now())
            )
        });
        self.buffer.dump_info();
    }

    /// Mark the isochronous channel as flowing or stopped. Restarting
    /// drops the clock recovery phase reference but keeps its rate.
    pub fn set_running(&self, running: bool) {
        let was_running = self.running.swap(running, Ordering::AcqRel);
        if running
            && !was_running
            && let Some(mut clock) = self.clock.try_lock()
        {
            clock.resync();
        }
    }

    /// Whether the isochronous channel is flowing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether data movement is engaged.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Pending enable deadline in cycles.
    pub fn enable_deadline(&self) -> Option<u64> {
        match self.enable_at.load(Ordering::Acquire) {
            NO_DEADLINE => None,
            cycle => Some(cycle),
        }
    }

    /// Whether bus cycle `now_cycles` is at or past the enable deadline.
    /// Always false while disabled.
    pub fn is_deadline_reached(&self, now_cycles: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.enable_deadline() {
            None => true,
            Some(deadline) => {
                let wrap = self.cycle_wrap();
                signed_cycle_distance(now_cycles % wrap, deadline, wrap) <= 0
            }
        }
    }

    fn cycle_wrap(&self) -> u64 {
        self.transport.cycle_wrap().max(1)
    }

    /// Current bus time in ticks, straight from the transport.
    pub fn time_now(&self) -> u64 {
        self.transport.cycle_timer_ticks()
    }

    /// Transport delivers received frames stamped at `timestamp`.
    ///
    /// Feeds clock recovery while running. Frames are stored only while
    /// running and enabled, and only for packets stamped at or after the
    /// enable deadline. A short write counts one xrun.
    pub fn transport_put(&self, frames: &[f32], timestamp: u64) -> Result<usize, StreamError> {
        self.check_path(DataPath::TransportPush)?;
        let count = self.frames_in(frames.len())?;
        if !self.is_running() {
            return Ok(0);
        }
        self.observe(count, timestamp);
        if !self.is_deadline_reached(ticks_to_cycles(timestamp)) {
            return Ok(0);
        }
        let written = self.buffer.write_frames(frames, Some(timestamp));
        if written < count {
            self.xruns.increment();
        }
        Ok(written)
    }

    /// Transport requests frames for a packet stamped at `timestamp`.
    ///
    /// Packets before the enable deadline, and whatever cannot be served,
    /// are silence; a short read once the deadline is reached counts one
    /// xrun.
    pub fn transport_get(&self, out: &mut [f32], timestamp: u64) -> Result<usize, StreamError> {
        self.check_path(DataPath::TransportPull)?;
        let count = self.frames_in(out.len())?;
        if !self.is_running() {
            out.fill(0.0);
            return Ok(0);
        }
        self.observe(count, timestamp);
        if !self.is_deadline_reached(ticks_to_cycles(timestamp)) {
            out.fill(0.0);
            return Ok(0);
        }
        let read = self.buffer.read_frames(out, Some(timestamp));
        if read < count {
            self.xruns.increment();
            out[read * self.buffer.channels()..].fill(0.0);
        }
        Ok(read)
    }

    /// Application side of a receive stream: pop interleaved frames.
    /// Channels of disabled ports read silence.
    pub fn port_read(&self, out: &mut [f32]) -> Result<usize, StreamError> {
        self.check_path(DataPath::PortRead)?;
        self.frames_in(out.len())?;
        let read = self.buffer.read_frames(out, None);
        self.silence_disabled_ports(&mut out[..read * self.buffer.channels()]);
        Ok(read)
    }

    /// Application side of a transmit stream: queue interleaved frames.
    /// `timestamp` is the presentation time of the last frame, if known.
    /// Channels of disabled ports are queued as silence.
    pub fn port_write(&self, frames: &[f32], timestamp: Option<u64>) -> Result<usize, StreamError> {
        self.check_path(DataPath::PortWrite)?;
        let count = self.frames_in(frames.len())?;
        let channels = self.buffer.channels();
        if (0..channels).all(|index| self.ports.port_enabled(index)) {
            return Ok(self.buffer.write_frames(frames, timestamp));
        }
        Ok(self.write_chunked(count, timestamp, |block, offset| {
            let start = offset * channels;
            let end = start + block.len();
            block.copy_from_slice(&frames[start..end]);
            self.silence_disabled_ports(block);
        }))
    }

    /// Pop frames into one slice per port, in port order. Returns frames
    /// read; `outs` must hold one slice per port.
    pub fn read_ports(&self, outs: &mut [&mut [f32]]) -> Result<usize, StreamError> {
        self.check_path(DataPath::PortRead)?;
        let channels = self.port_slices(outs.len())?;
        let count = outs.iter().map(|out| out.len()).min().unwrap_or(0);
        let mut scratch = self.scratch.lock();
        let chunk = scratch.len() / channels;
        let mut done = 0;
        while chunk > 0 && done < count {
            let block = &mut scratch[..chunk.min(count - done) * channels];
            let read = self.buffer.read_frames(block, None);
            for (index, out) in outs.iter_mut().enumerate() {
                self.ports
                    .read_port(index, &block[..read * channels], &mut out[done..done + read]);
            }
            done += read;
            if read * channels < block.len() {
                break;
            }
        }
        Ok(done)
    }

    /// Queue one slice per port, in port order. Returns frames written.
    pub fn write_ports(
        &self,
        ins: &[&[f32]],
        timestamp: Option<u64>,
    ) -> Result<usize, StreamError> {
        self.check_path(DataPath::PortWrite)?;
        let channels = self.port_slices(ins.len())?;
        let count = ins.iter().map(|samples| samples.len()).min().unwrap_or(0);
        Ok(self.write_chunked(count, timestamp, |block, offset| {
            let frames = block.len() / channels;
            for (index, samples) in ins.iter().enumerate() {
                self.ports
                    .write_port(index, &samples[offset..offset + frames], block);
            }
        }))
    }

    /// Enable or disable the port called `name`. Returns `false` if unknown.
    pub fn set_port_enabled(&mut self, name: &str, enabled: bool) -> bool {
        self.ports.set_port_enabled(name, enabled)
    }

    fn port_slices(&self, got: usize) -> Result<usize, StreamError> {
        let ports = self.buffer.channels();
        if ports == 0 || got != ports {
            return Err(StreamError::PortCountMismatch { ports, got });
        }
        Ok(ports)
    }

    fn silence_disabled_ports(&self, frames: &mut [f32]) {
        let channels = self.buffer.channels();
        for index in (0..channels).filter(|&index| !self.ports.port_enabled(index)) {
            for frame in frames.chunks_exact_mut(channels) {
                frame[index] = 0.0;
            }
        }
    }

    // Stages `count` frames through the scratch period. `fill` gets the block
    // and its frame offset; only the final block carries `timestamp`.
    fn write_chunked(
        &self,
        count: usize,
        timestamp: Option<u64>,
        mut fill: impl FnMut(&mut [f32], usize),
    ) -> usize {
        let channels = self.buffer.channels();
        let mut scratch = self.scratch.lock();
        let chunk = scratch.len() / channels.max(1);
        let mut done = 0;
        while chunk > 0 && done < count {
            let frames = chunk.min(count - done);
            let block = &mut scratch[..frames * channels];
            fill(block, done);
            let stamp = if done + frames == count { timestamp } else { None };
            let written = self.buffer.write_frames(block, stamp);
            done += written;
            if written < frames {
                break;
            }
        }
        done
    }

    fn check_path(&self, path: DataPath) -> Result<(), StreamError> {
        if self.direction.capabilities().supports(path) {
            Ok(())
        } else {
            Err(StreamError::UnsupportedPath {
                direction: self.direction,
                path,
            })
        }
    }

    fn frames_in(&self, samples: usize) -> Result<usize, StreamError> {
        let channels = self.buffer.channels();
        if channels == 0 || samples % channels != 0 {
            return Err(BufferError::ChannelMismatch { channels, samples }.into());
        }
        Ok(samples / channels)
    }

    fn observe(&self, frames: usize, timestamp: u64) {
        if frames == 0 {
            return;
        }
        // The control side only touches the loop through `&mut self`, so this
        // is uncontended; skip the update rather than wait if it ever is not.
        if let Some(mut clock) = self.clock.try_lock() {
            let tpf = clock.update(u32::try_from(frames).unwrap_or(u32::MAX), timestamp);
            self.buffer.set_ticks_per_frame(tpf);
        }
    }

    /// Seed clock recovery with a frame rate.
    pub fn set_frame_rate(&mut self, rate_hz: f64) {
        let clock = self.clock.get_mut();
        clock.set_frame_rate(rate_hz);
        self.buffer.set_ticks_per_frame(clock.ticks_per_frame());
    }

    /// Retune clock recovery.
    pub fn set_dll_bandwidth(&mut self, bandwidth_hz: f64) {
        self.clock.get_mut().set_bandwidth_hz(bandwidth_hz);
    }

    /// Clock recovery bandwidth in Hz.
    pub fn dll_bandwidth(&self) -> f64 {
        self.clock.lock().bandwidth_hz()
    }

    /// This stream's own recovered period, in ticks per frame.
    pub fn ticks_per_frame(&self) -> f64 {
        self.buffer.ticks_per_frame()
    }

    /// This stream's own recovered rate, in frames per second.
    pub fn frame_rate_hz(&self) -> f64 {
        ticks_per_frame_to_hz(self.ticks_per_frame())
    }

    /// Processor whose clock this one tracks.
    pub fn sync_source(&self) -> Option<ProcessorHandle> {
        self.sync_source
    }

    /// Track another processor's clock, or `None` for the own clock.
    /// Resolution happens through the manager's handle table.
    pub fn set_sync_source(&mut self, source: Option<ProcessorHandle>) {
        self.sync_source = source;
    }

    /// Xruns since the last reset.
    pub fn xruns(&self) -> u32 {
        self.xruns.count()
    }

    /// Zero the xrun count.
    pub fn reset_xrun_counter(&self) {
        self.xruns.reset();
    }

    /// Stream direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Isochronous port/channel.
    pub fn port(&self) -> i32 {
        self.port
    }

    /// Lifecycle state.
    pub fn state(&self) -> OperatingState {
        self.state
    }

    /// Nominal rate in Hz.
    pub fn nominal_rate_hz(&self) -> u32 {
        self.nominal_rate_hz
    }

    /// Periods in the buffer.
    pub fn nb_buffers(&self) -> u32 {
        self.nb_buffers
    }

    /// Frames per period.
    pub fn period_size(&self) -> u32 {
        self.period
    }

    /// The stream's buffer.
    pub fn buffer(&self) -> &TimestampedBuffer {
        &self.buffer
    }

    /// The stream's port set.
    pub fn ports(&self) -> &dyn PortManager {
        self.ports.as_ref()
    }

    /// The instance logging context.
    pub fn diagnostics(&self) -> &DiagnosticsContext {
        &self.diagnostics
    }

    /// Adjust verbosity for the processor, its buffer, transport and ports.
    pub fn set_verbosity(&self, level: Verbosity) {
        self.diagnostics.set_verbosity(level);
    }

    /// Snapshot of the processor's state, also logged at verbose level.
    pub fn dump_info(&self) -> StreamSnapshot {
        self.snapshot(None)
    }

    pub(crate) fn snapshot(&self, sync_rate_hz: Option<f64>) -> StreamSnapshot {
        let snapshot = StreamSnapshot {
            direction: self.direction,
            port: self.port,
            state: self.state,
            now_ticks: self.time_now(),
            xruns: self.xruns(),
            running: self.is_running(),
            enabled: self.is_enabled(),
            enable_at: self.enable_deadline(),
            nb_buffers: self.nb_buffers,
            period: self.period,
            nominal_rate_hz: self.nominal_rate_hz,
            measured_rate_hz: self.frame_rate_hz(),
            sync_rate_hz,
            buffer: self.buffer.snapshot(),
        };
        self.diagnostics.detail(Verbosity::Verbose, || {
            format!("{}\n{snapshot}", self.transport.describe())
        });
        snapshot
    }
}

impl fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("direction", &self.direction)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("running", &self.is_running())
            .field("enabled", &self.is_enabled())
            .field("xruns", &self.xruns())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle_timer::{CYCLE_WRAP, TICKS_PER_SECOND, TICKS_WRAP, cycles_to_ticks};
    use crate::manager::SharedGeometry;
    use crate::ports::PortList;
    use crate::transport::{BusClock, Hook, SimulatedTransport};

    fn processor(direction: Direction, clock: &BusClock) -> StreamProcessor {
        let mut sp = StreamProcessor::new(
            direction,
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock.clone(), 0)),
            Box::new(PortList::numbered("ch", 2)),
        );
        sp.set_manager(Arc::new(SharedGeometry::new(2, 8)));
        sp.init().unwrap();
        sp.prepare().unwrap();
        sp
    }

    #[test]
    fn receive_has_no_pull_path() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        let err = sp.transport_get(&mut [0.0; 4], 0).unwrap_err();
        assert!(matches!(
            err,
            StreamError::UnsupportedPath {
                direction: Direction::Receive,
                path: DataPath::TransportPull
            }
        ));
        assert!(sp.port_write(&[0.0; 4], None).is_err());
    }

    #[test]
    fn frames_move_only_while_running_and_enabled() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        assert_eq!(sp.transport_put(&[0.5; 8], 10_000).unwrap(), 0);

        sp.set_running(true);
        assert_eq!(sp.transport_put(&[0.5; 8], 12_048).unwrap(), 0);
        assert_eq!(sp.buffer().frame_count(), 0);

        sp.enable(0);
        assert_eq!(sp.transport_put(&[0.5; 8], 14_096).unwrap(), 4);
        let mut out = [0.0; 8];
        assert_eq!(sp.port_read(&mut out).unwrap(), 4);
        assert_eq!(out, [0.5; 8]);

        sp.disable();
        assert_eq!(sp.transport_put(&[0.5; 8], 16_144).unwrap(), 0);
    }

    #[test]
    fn overrun_counts_an_xrun() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        sp.set_running(true);
        sp.enable(0);
        // capacity is 2 x 8 frames
        assert_eq!(sp.transport_put(&[0.0; 24], 5_000).unwrap(), 12);
        assert_eq!(sp.transport_put(&[0.0; 24], 11_144).unwrap(), 4);
        assert_eq!(sp.xruns(), 1);
        sp.reset_xrun_counter();
        assert_eq!(sp.xruns(), 0);
    }

    #[test]
    fn underrun_pads_with_silence() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Transmit, &clock);
        sp.port_write(&[0.25; 4], None).unwrap();
        sp.set_running(true);
        sp.enable(0);
        let mut out = [1.0; 8];
        assert_eq!(sp.transport_get(&mut out, 2_048).unwrap(), 2);
        assert_eq!(out, [0.25, 0.25, 0.25, 0.25, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(sp.xruns(), 1);
    }

    #[test]
    fn partial_frames_are_rejected() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        let err = sp.transport_put(&[0.0; 3], 0).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Buffer(BufferError::ChannelMismatch {
                channels: 2,
                samples: 3
            })
        ));
    }

    #[test]
    fn deadline_is_observed_with_wraparound() {
        let clock = BusClock::manual(cycles_to_ticks(CYCLE_WRAP - 10));
        let sp = processor(Direction::Transmit, &clock);
        sp.set_running(true);
        assert!(!sp.is_deadline_reached(0));
        assert_eq!(sp.enable(5), 15);
        assert!(!sp.is_deadline_reached(CYCLE_WRAP - 1));
        assert!(sp.is_deadline_reached(5));
        assert!(sp.is_deadline_reached(6));
        sp.disable();
        assert_eq!(sp.enable_deadline(), None);
        assert!(!sp.is_deadline_reached(6));
    }

    #[test]
    fn enable_warns_when_not_running() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        sp.enable(100);
        assert!(sp.is_enabled());
        assert!(
            sp.diagnostics()
                .history()
                .iter()
                .any(|line| line.starts_with("WARN") && line.contains("not running"))
        );
    }

    #[test]
    fn reset_stops_at_the_failing_stage() {
        let clock = BusClock::manual(0);
        let transport = SimulatedTransport::new(clock.clone(), 0);
        let transport_log = transport.hook_log();
        let mut sp = StreamProcessor::receive(
            0,
            48_000,
            Box::new(transport),
            Box::new(PortList::numbered("ch", 2).failing_reset("port busy")),
        );
        sp.init().unwrap();
        let err = sp.reset().unwrap_err();
        assert!(matches!(
            err,
            StreamError::Reset {
                stage: ResetStage::Ports,
                ..
            }
        ));
        assert_eq!(transport_log.count(Hook::Reset), 0);
    }

    #[test]
    fn reset_before_init_names_the_buffer() {
        let clock = BusClock::manual(0);
        let mut sp = StreamProcessor::receive(
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock, 0)),
            Box::new(PortList::numbered("ch", 1)),
        );
        let err = sp.reset().unwrap_err();
        assert_eq!(err.to_string(), "could not reset data buffer");
    }

    #[test]
    fn prepare_needs_init() {
        let clock = BusClock::manual(0);
        let mut sp = StreamProcessor::receive(
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock, 0)),
            Box::new(PortList::numbered("ch", 1)),
        );
        sp.set_manager(Arc::new(SharedGeometry::new(2, 64)));
        assert!(matches!(
            sp.prepare(),
            Err(StreamError::InvalidState { op: "prepare", .. })
        ));
    }

    #[test]
    fn zero_geometry_is_refused() {
        let clock = BusClock::manual(0);
        let mut sp = StreamProcessor::receive(
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock, 0)),
            Box::new(PortList::numbered("ch", 1)),
        );
        sp.init().unwrap();
        sp.set_manager(Arc::new(SharedGeometry::new(0, 512)));
        assert!(matches!(
            sp.prepare(),
            Err(StreamError::InvalidGeometry { nb_buffers: 0, .. })
        ));
        assert_eq!(sp.state(), OperatingState::Initialized);
    }

    #[test]
    fn transport_init_failure_keeps_the_processor_constructed() {
        let clock = BusClock::manual(0);
        let mut sp = StreamProcessor::receive(
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock, 0).failing_init("no channel")),
            Box::new(PortList::numbered("ch", 2)),
        );
        let err = sp.init().unwrap_err();
        assert!(matches!(err, StreamError::Transport(ref e) if e.reason == "no channel"));
        assert_eq!(sp.state(), OperatingState::Constructed);
        assert!(!sp.buffer().is_initialized());
    }

    #[test]
    fn prepare_stops_at_failing_ports() {
        let clock = BusClock::manual(0);
        let transport = SimulatedTransport::new(clock, 0);
        let transport_log = transport.hook_log();
        let mut sp = StreamProcessor::transmit(
            0,
            48_000,
            Box::new(transport),
            Box::new(PortList::numbered("ch", 2).failing_prepare("no topology")),
        );
        sp.set_manager(Arc::new(SharedGeometry::new(2, 64)));
        sp.init().unwrap();
        assert!(matches!(sp.prepare(), Err(StreamError::Ports(_))));
        assert_eq!(sp.state(), OperatingState::Initialized);
        assert_eq!(transport_log.count(Hook::Prepare), 0);
    }

    #[test]
    fn prepare_reports_transport_failure() {
        let clock = BusClock::manual(0);
        let mut sp = StreamProcessor::transmit(
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock, 0).failing_prepare("channel busy")),
            Box::new(PortList::numbered("ch", 2)),
        );
        sp.set_manager(Arc::new(SharedGeometry::new(2, 64)));
        sp.init().unwrap();
        let err = sp.prepare().unwrap_err();
        assert!(matches!(err, StreamError::Transport(ref e) if e.reason == "channel busy"));
        assert_eq!(sp.state(), OperatingState::Initialized);
    }

    #[test]
    fn reset_reports_the_transport_stage() {
        let clock = BusClock::manual(0);
        let ports = PortList::numbered("ch", 2);
        let port_log = ports.hook_log();
        let mut sp = StreamProcessor::receive(
            0,
            48_000,
            Box::new(SimulatedTransport::new(clock, 0).failing_reset("bus reset")),
            Box::new(ports),
        );
        sp.init().unwrap();
        let err = sp.reset().unwrap_err();
        assert!(matches!(
            err,
            StreamError::Reset {
                stage: ResetStage::Transport,
                ..
            }
        ));
        assert_eq!(err.to_string(), "could not reset isostream");
        assert_eq!(port_log.count(Hook::Reset), 1);
    }

    #[test]
    fn disabled_port_reads_silence() {
        let clock = BusClock::manual(0);
        let mut sp = processor(Direction::Receive, &clock);
        assert!(sp.set_port_enabled("ch2", false));
        sp.set_running(true);
        sp.enable(0);
        sp.transport_put(&[1.0; 8], 4_096).unwrap();
        let mut out = [9.0; 8];
        assert_eq!(sp.port_read(&mut out).unwrap(), 4);
        assert_eq!(out, [1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn per_port_slices_round_trip_through_the_buffer() {
        let clock = BusClock::manual(0);
        let mut sp = processor(Direction::Transmit, &clock);
        // longer than the 8-frame scratch period
        let left: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let right = vec![-1.0; 12];
        assert_eq!(sp.write_ports(&[left.as_slice(), right.as_slice()], None).unwrap(), 12);
        assert_eq!(sp.buffer().frame_count(), 12);
        assert!(matches!(
            sp.write_ports(&[left.as_slice()], None),
            Err(StreamError::PortCountMismatch { ports: 2, got: 1 })
        ));

        assert!(sp.set_port_enabled("ch1", false));
        assert_eq!(sp.port_write(&[0.5; 8], None).unwrap(), 4);

        sp.set_running(true);
        sp.enable(0);
        let mut out = [0.0; 32];
        assert_eq!(sp.transport_get(&mut out, 16_384).unwrap(), 16);
        assert_eq!(&out[..4], &[0.0, -1.0, 1.0, -1.0]);
        assert_eq!(&out[24..], &[0.0, 0.5, 0.0, 0.5, 0.0, 0.5, 0.0, 0.5]);
    }

    #[test]
    fn read_ports_splits_channels() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        sp.set_running(true);
        sp.enable(0);
        sp.transport_put(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 4_096).unwrap();
        let (mut left, mut right) = ([0.0; 4], [0.0; 4]);
        assert_eq!(sp.read_ports(&mut [&mut left[..], &mut right[..]]).unwrap(), 3);
        assert_eq!(left, [1.0, 3.0, 5.0, 0.0]);
        assert_eq!(right, [2.0, 4.0, 6.0, 0.0]);
    }

    #[test]
    fn packets_before_the_deadline_are_not_stored() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        sp.set_running(true);
        sp.enable(10);
        assert_eq!(sp.transport_put(&[0.5; 8], cycles_to_ticks(9)).unwrap(), 0);
        assert_eq!(sp.buffer().frame_count(), 0);
        assert_eq!(sp.transport_put(&[0.5; 8], cycles_to_ticks(10)).unwrap(), 4);
        assert_eq!(sp.xruns(), 0);
    }

    #[test]
    fn transmit_before_the_deadline_is_silence() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Transmit, &clock);
        sp.port_write(&[0.25; 8], None).unwrap();
        sp.set_running(true);
        sp.enable(10);
        let mut out = [1.0; 8];
        assert_eq!(sp.transport_get(&mut out, cycles_to_ticks(9)).unwrap(), 0);
        assert_eq!(out, [0.0; 8]);
        assert_eq!(sp.buffer().frame_count(), 4);
        assert_eq!(sp.xruns(), 0);
    }

    #[test]
    fn restart_after_a_pause_keeps_the_rate() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        sp.set_running(true);
        // 8 frames at 48 kHz every 4096 ticks
        let mut ts = 0u64;
        for _ in 0..8_000 {
            ts += 4_096;
            sp.transport_put(&[0.0; 16], ts).unwrap();
        }
        assert!((sp.frame_rate_hz() - 48_000.0).abs() < 1e-6);

        sp.set_running(false);
        ts += TICKS_PER_SECOND / 2;
        sp.set_running(true);
        for _ in 0..60_000 {
            ts = (ts + 4_096) % TICKS_WRAP;
            sp.transport_put(&[0.0; 16], ts).unwrap();
        }
        assert!((sp.frame_rate_hz() - 48_000.0).abs() < 1e-3, "rate {}", sp.frame_rate_hz());
    }

    #[test]
    fn verbosity_reaches_transport_and_ports() {
        let clock = BusClock::manual(0);
        let mut sp = processor(Direction::Receive, &clock);
        sp.set_verbosity(Verbosity::Verbose);
        sp.reset().unwrap();
        let history = sp.diagnostics().history();
        assert!(history.iter().any(|line| line.starts_with("receive-sp0/transport")));
        assert!(history.iter().any(|line| line.starts_with("receive-sp0/ports")));

        while sp.diagnostics().pop_log().is_some() {}
        sp.set_verbosity(Verbosity::Quiet);
        sp.reset().unwrap();
        assert!(sp.diagnostics().history().is_empty());
    }

    #[test]
    fn clock_recovery_publishes_to_the_buffer() {
        let clock = BusClock::manual(0);
        let sp = processor(Direction::Receive, &clock);
        sp.set_running(true);
        let nominal = sp.ticks_per_frame();
        let mut ts = 0u64;
        for _ in 0..50 {
            ts += 4 * 520;
            sp.transport_put(&[0.0; 8], ts).unwrap();
        }
        assert!(sp.ticks_per_frame() > nominal);
        assert_eq!(sp.buffer().ticks_per_frame(), sp.ticks_per_frame());
    }
}
