//! Single-producer/single-consumer frame buffer with bus-time bookkeeping.
//!
//! The buffer is the only place that knows which bus time a frame belongs
//! to: the tail carries the timestamp of the last frame written, the head the
//! timestamp of the next frame to be read, and the published rate converts
//! between frame offsets and ticks.
use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::cycle_timer::{add_ticks, diff_ticks, wrap_ticks};
use crate::diagnostics::{DiagnosticsContext, Verbosity, ticks_per_frame_to_hz};
use crate::error::BufferError;

enum Backing {
    Heap(Vec<f32>),
    Mapped(MmapMut),
}

struct BufferStorage {
    base: *mut f32,
    backing: Backing,
}

impl BufferStorage {
    fn allocate(frames: usize, channels: usize, mapped: bool) -> Result<Self, BufferError> {
        let alloc_error = |source| BufferError::Allocation {
            frames,
            channels,
            source,
        };
        let samples = frames.checked_mul(channels).ok_or_else(|| alloc_error(None))?;
        if mapped && samples > 0 {
            let bytes = samples
                .checked_mul(size_of::<f32>())
                .ok_or_else(|| alloc_error(None))?;
            let mut mmap = MmapOptions::new()
                .len(bytes)
                .map_anon()
                .map_err(|err| alloc_error(Some(err)))?;
            let base = mmap.as_mut_ptr() as *mut f32;
            return Ok(Self {
                base,
                backing: Backing::Mapped(mmap),
            });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(samples)
            .map_err(|_| alloc_error(None))?;
        data.resize(samples, 0.0);
        let base = data.as_mut_ptr();
        Ok(Self {
            base,
            backing: Backing::Heap(data),
        })
    }

    fn clear(&mut self) {
        match &mut self.backing {
            Backing::Heap(data) => data.fill(0.0),
            Backing::Mapped(mmap) => mmap.fill(0),
        }
    }
}

/// Point-in-time view of a buffer, for dumps.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferSnapshot {
    /// Capacity in frames.
    pub capacity_frames: usize,
    /// Interleaved channels per frame.
    pub channels: usize,
    /// Frames waiting to be read.
    pub fill_frames: usize,
    /// Bus time of the next frame to be read.
    pub head_timestamp: u64,
    /// Bus time of the last frame written.
    pub tail_timestamp: u64,
    /// Published period estimate.
    pub ticks_per_frame: f64,
    /// Whether storage is memory mapped.
    pub mapped: bool,
    /// Whether storage has been allocated.
    pub initialized: bool,
}

impl fmt::Display for BufferSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  TimestampedBuffer:")?;
        writeln!(
            f,
            "   Fill                 : {} / {} frames x {} ch{}",
            self.fill_frames,
            self.capacity_frames,
            self.channels,
            if self.mapped { " (mapped)" } else { "" }
        )?;
        writeln!(f, "   Head timestamp       : {:011}", self.head_timestamp)?;
        writeln!(f, "   Tail timestamp       : {:011}", self.tail_timestamp)?;
        writeln!(
            f,
            "   Rate                 : {:.6} ticks/frame ({:.3} Hz)",
            self.ticks_per_frame,
            ticks_per_frame_to_hz(self.ticks_per_frame)
        )
    }
}

/// Ring of interleaved `f32` frames whose ends carry bus timestamps.
pub struct TimestampedBuffer {
    storage: Option<BufferStorage>,
    capacity_frames: usize,
    channels: usize,
    mapped: bool,
    write_index: AtomicU64,
    read_index: AtomicU64,
    head_timestamp: AtomicU64,
    tail_timestamp: AtomicU64,
    ticks_per_frame_bits: AtomicU64,
    diagnostics: DiagnosticsContext,
}

// Frame data is touched by at most one producer and one consumer, each in
// the region the indices grant it. Whole-buffer operations take `&mut self`.
unsafe impl Send for TimestampedBuffer {}
unsafe impl Sync for TimestampedBuffer {}

impl TimestampedBuffer {
    /// Unallocated buffer; call [`set_geometry`](Self::set_geometry) and
    /// [`init`](Self::init) before moving frames.
    pub fn new(channels: usize, ticks_per_frame: f64, diagnostics: DiagnosticsContext) -> Self {
        Self {
            storage: None,
            capacity_frames: 0,
            channels,
            mapped: false,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            head_timestamp: AtomicU64::new(0),
            tail_timestamp: AtomicU64::new(0),
            ticks_per_frame_bits: AtomicU64::new(ticks_per_frame.to_bits()),
            diagnostics,
        }
    }

    /// Back the buffer with an anonymous memory map instead of the heap.
    pub fn with_mapped_storage(mut self, mapped: bool) -> Self {
        self.set_mapped_storage(mapped);
        self
    }

    /// Select mapped or heap storage for the next `init()`.
    pub fn set_mapped_storage(&mut self, mapped: bool) {
        if self.mapped != mapped {
            self.storage = None;
        }
        self.mapped = mapped;
    }

    /// Replace the logging context.
    pub fn set_diagnostics(&mut self, diagnostics: DiagnosticsContext) {
        self.diagnostics = diagnostics;
    }

    /// Change capacity and channel count. Drops any storage; `init()` must
    /// follow before frames can move.
    pub fn set_geometry(&mut self, capacity_frames: usize, channels: usize) {
        if self.capacity_frames != capacity_frames || self.channels != channels {
            self.storage = None;
        }
        self.capacity_frames = capacity_frames;
        self.channels = channels;
    }

    /// Allocate and clear storage for the current geometry.
    pub fn init(&mut self) -> Result<(), BufferError> {
        if self.channels == 0 {
            return Err(BufferError::ZeroChannels);
        }
        self.storage = None;
        self.storage = Some(BufferStorage::allocate(
            self.capacity_frames,
            self.channels,
            self.mapped,
        )?);
        self.clear_positions();
        self.diagnostics.detail(Verbosity::Verbose, || {
            format!(
                "allocated {} frames x {} channels",
                self.capacity_frames, self.channels
            )
        });
        Ok(())
    }

    /// Discard all buffered content and timestamps.
    pub fn reset(&mut self) -> Result<(), BufferError> {
        let storage = self.storage.as_mut().ok_or(BufferError::NotInitialized)?;
        storage.clear();
        self.clear_positions();
        Ok(())
    }

    fn clear_positions(&mut self) {
        *self.write_index.get_mut() = 0;
        *self.read_index.get_mut() = 0;
        *self.head_timestamp.get_mut() = 0;
        *self.tail_timestamp.get_mut() = 0;
    }

    /// Whether storage has been allocated.
    pub fn is_initialized(&self) -> bool {
        self.storage.is_some()
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Interleaved channels per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames ready for reading.
    pub fn frame_count(&self) -> usize {
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        write_index
            .saturating_sub(read_index)
            .min(self.capacity_frames as u64) as usize
    }

    /// Frames that can be written without overrunning.
    pub fn space_frames(&self) -> usize {
        self.capacity_frames - self.frame_count()
    }

    /// Bus time of the next frame to be read.
    pub fn head_timestamp(&self) -> u64 {
        self.head_timestamp.load(Ordering::Acquire)
    }

    /// Bus time of the last frame written.
    pub fn tail_timestamp(&self) -> u64 {
        self.tail_timestamp.load(Ordering::Acquire)
    }

    /// Published period estimate in ticks per frame.
    pub fn ticks_per_frame(&self) -> f64 {
        f64::from_bits(self.ticks_per_frame_bits.load(Ordering::Acquire))
    }

    /// Published rate estimate in frames per tick.
    pub fn rate(&self) -> f64 {
        1.0 / self.ticks_per_frame()
    }

    /// Publish a new period estimate.
    pub fn set_ticks_per_frame(&self, ticks_per_frame: f64) {
        if ticks_per_frame.is_finite() && ticks_per_frame > 0.0 {
            self.ticks_per_frame_bits
                .store(ticks_per_frame.to_bits(), Ordering::Release);
        }
    }

    /// Bus time of the frame `offset` positions after the head.
    pub fn timestamp_of_frame(&self, offset: usize) -> u64 {
        let delta = (offset as f64 * self.ticks_per_frame()).round() as i64;
        add_ticks(self.head_timestamp(), delta)
    }

    /// Frames that will be present at bus time `at`, assuming the producer
    /// keeps delivering at the published rate. Negative when `at` lies before
    /// the head.
    pub fn frames_at(&self, at: u64) -> i64 {
        let since_tail = diff_ticks(at, self.tail_timestamp()) as f64;
        self.frame_count() as i64 + (since_tail / self.ticks_per_frame()).floor() as i64
    }

    /// Push interleaved frames, returning frames written. `timestamp` is the
    /// bus time of the last frame; when absent the tail is extrapolated at
    /// the published rate.
    pub fn write_frames(&self, frames: &[f32], timestamp: Option<u64>) -> usize {
        let Some(storage) = self.storage.as_ref() else {
            return 0;
        };
        let frames_count = frames.len() / self.channels;
        if frames_count == 0 || self.capacity_frames == 0 {
            return 0;
        }

        let capacity = self.capacity_frames as u64;
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        let used = write_index.saturating_sub(read_index).min(capacity);
        let free = capacity - used;
        if free == 0 {
            return 0;
        }
        let frames_to_write = frames_count.min(free as usize);
        let base = storage.base;

        let start_frame = (write_index % capacity) as usize;
        let first_chunk_frames = (self.capacity_frames - start_frame).min(frames_to_write);
        let first_samples = first_chunk_frames * self.channels;
        let total_samples = frames_to_write * self.channels;
        unsafe {
            ptr::copy_nonoverlapping(
                frames.as_ptr(),
                base.add(start_frame * self.channels),
                first_samples,
            );
            if total_samples > first_samples {
                ptr::copy_nonoverlapping(
                    frames.as_ptr().add(first_samples),
                    base,
                    total_samples - first_samples,
                );
            }
        }

        self.advance_tail(used, frames_to_write, frames_count, timestamp);
        self.write_index
            .store(write_index + frames_to_write as u64, Ordering::Release);
        frames_to_write
    }

    /// Push `frames` frames of silence.
    pub fn write_silence(&self, frames: usize, timestamp: Option<u64>) -> usize {
        let Some(storage) = self.storage.as_ref() else {
            return 0;
        };
        if frames == 0 || self.capacity_frames == 0 {
            return 0;
        }
        let capacity = self.capacity_frames as u64;
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        let used = write_index.saturating_sub(read_index).min(capacity);
        let frames_to_write = frames.min((capacity - used) as usize);
        let base = storage.base;
        for frame in 0..frames_to_write {
            let slot = ((write_index + frame as u64) % capacity) as usize;
            unsafe {
                ptr::write_bytes(base.add(slot * self.channels), 0, self.channels);
            }
        }
        self.advance_tail(used, frames_to_write, frames, timestamp);
        self.write_index
            .store(write_index + frames_to_write as u64, Ordering::Release);
        frames_to_write
    }

    fn advance_tail(&self, used: u64, written: usize, offered: usize, timestamp: Option<u64>) {
        if written == 0 {
            return;
        }
        let tpf = self.ticks_per_frame();
        let tail = match timestamp {
            // The stamp belongs to the last offered frame; back off if the
            // write was short.
            Some(ts) => add_ticks(ts, -(((offered - written) as f64 * tpf).round() as i64)),
            None => add_ticks(self.tail_timestamp(), (written as f64 * tpf).round() as i64),
        };
        self.tail_timestamp
            .store(wrap_ticks(tail), Ordering::Release);
        if used == 0 {
            let head = add_ticks(tail, -(((written - 1) as f64 * tpf).round() as i64));
            self.head_timestamp.store(head, Ordering::Release);
        }
    }

    /// Pop frames into `out`, returning frames read. `timestamp`, when given,
    /// is the bus time at which the first popped frame is consumed.
    pub fn read_frames(&self, out: &mut [f32], timestamp: Option<u64>) -> usize {
        let Some(storage) = self.storage.as_ref() else {
            return 0;
        };
        let requested_frames = out.len() / self.channels;
        if requested_frames == 0 || self.capacity_frames == 0 {
            return 0;
        }
        let capacity = self.capacity_frames as u64;
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        let available = write_index.saturating_sub(read_index).min(capacity);
        if available == 0 {
            return 0;
        }
        let frames_to_read = requested_frames.min(available as usize);
        let base = storage.base;

        let start_frame = (read_index % capacity) as usize;
        let first_chunk_frames = (self.capacity_frames - start_frame).min(frames_to_read);
        let first_samples = first_chunk_frames * self.channels;
        let total_samples = frames_to_read * self.channels;
        unsafe {
            ptr::copy_nonoverlapping(
                base.add(start_frame * self.channels),
                out.as_mut_ptr(),
                first_samples,
            );
            if total_samples > first_samples {
                ptr::copy_nonoverlapping(
                    base,
                    out.as_mut_ptr().add(first_samples),
                    total_samples - first_samples,
                );
            }
        }

        let tpf = self.ticks_per_frame();
        let first = timestamp.unwrap_or_else(|| self.head_timestamp());
        let head = add_ticks(first, (frames_to_read as f64 * tpf).round() as i64);
        self.head_timestamp.store(head, Ordering::Release);
        self.read_index
            .store(read_index + frames_to_read as u64, Ordering::Release);
        frames_to_read
    }

    /// Snapshot for dumps.
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            capacity_frames: self.capacity_frames,
            channels: self.channels,
            fill_frames: self.frame_count(),
            head_timestamp: self.head_timestamp(),
            tail_timestamp: self.tail_timestamp(),
            ticks_per_frame: self.ticks_per_frame(),
            mapped: self.mapped,
            initialized: self.is_initialized(),
        }
    }

    /// Log the current state at verbose level and return it.
    pub fn dump_info(&self) -> BufferSnapshot {
        let snapshot = self.snapshot();
        self.diagnostics
            .detail(Verbosity::Verbose, || snapshot.to_string());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle_timer::TICKS_WRAP;
    use proptest::prelude::*;

    fn buffer(frames: usize, channels: usize) -> TimestampedBuffer {
        let mut buffer =
            TimestampedBuffer::new(channels, 512.0, DiagnosticsContext::new("test", 8));
        buffer.set_geometry(frames, channels);
        buffer.init().expect("init");
        buffer
    }

    #[test]
    fn wraps_around_capacity() {
        let buf = buffer(4, 2);
        let input: Vec<f32> = (0..6).map(|v| v as f32).collect();
        assert_eq!(buf.write_frames(&input, Some(10_000)), 3);
        let mut out = vec![0.0; 4];
        assert_eq!(buf.read_frames(&mut out, None), 2);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);

        let more: Vec<f32> = (6..12).map(|v| v as f32).collect();
        assert_eq!(buf.write_frames(&more, None), 3);
        assert_eq!(buf.frame_count(), 4);

        let mut out = vec![0.0; 8];
        assert_eq!(buf.read_frames(&mut out, None), 4);
        assert_eq!(out, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn timestamps_follow_the_frames() {
        let buf = buffer(64, 1);
        buf.write_frames(&[0.0; 8], Some(10_000));
        assert_eq!(buf.tail_timestamp(), 10_000);
        assert_eq!(buf.head_timestamp(), 10_000 - 7 * 512);
        assert_eq!(buf.timestamp_of_frame(7), 10_000);

        let mut out = [0.0; 4];
        buf.read_frames(&mut out, None);
        assert_eq!(buf.head_timestamp(), 10_000 - 3 * 512);
        assert_eq!(buf.frames_at(10_000 + 2 * 512), 6);
    }

    #[test]
    fn head_timestamp_wraps_with_the_bus() {
        let buf = buffer(16, 1);
        buf.write_frames(&[0.0; 4], Some(100));
        assert_eq!(buf.head_timestamp(), TICKS_WRAP + 100 - 3 * 512);
    }

    #[test]
    fn short_write_backs_off_the_tail() {
        let buf = buffer(2, 1);
        assert_eq!(buf.write_frames(&[0.0; 4], Some(50_000)), 2);
        assert_eq!(buf.tail_timestamp(), 50_000 - 2 * 512);
    }

    #[test]
    fn rate_is_the_inverse_of_the_period() {
        let buf = buffer(8, 1);
        assert_eq!(buf.rate(), 1.0 / 512.0);
        buf.set_ticks_per_frame(557.27);
        assert!((buf.rate() * 557.27 - 1.0).abs() < 1e-12);
        buf.set_ticks_per_frame(0.0);
        buf.set_ticks_per_frame(f64::NAN);
        assert_eq!(buf.ticks_per_frame(), 557.27);
    }

    #[test]
    fn reset_discards_content() {
        let mut buf = buffer(8, 2);
        buf.write_frames(&[1.0; 8], Some(1));
        buf.reset().unwrap();
        assert_eq!(buf.frame_count(), 0);
        assert_eq!(buf.tail_timestamp(), 0);
    }

    #[test]
    fn reset_before_init_is_an_error() {
        let mut buf = TimestampedBuffer::new(2, 512.0, DiagnosticsContext::new("test", 8));
        assert!(matches!(buf.reset(), Err(BufferError::NotInitialized)));
        assert_eq!(buf.write_frames(&[0.0; 2], None), 0);
    }

    #[test]
    fn zero_channels_cannot_init() {
        let mut buf = TimestampedBuffer::new(0, 512.0, DiagnosticsContext::new("test", 8));
        buf.set_geometry(16, 0);
        assert!(matches!(buf.init(), Err(BufferError::ZeroChannels)));
    }

    #[test]
    fn impossible_geometry_fails_allocation() {
        let mut buf = TimestampedBuffer::new(2, 512.0, DiagnosticsContext::new("test", 8));
        buf.set_geometry(usize::MAX, 2);
        assert!(matches!(buf.init(), Err(BufferError::Allocation { .. })));
        assert!(!buf.is_initialized());
    }

    #[test]
    fn mapped_storage_moves_frames() {
        let mut buf = TimestampedBuffer::new(2, 512.0, DiagnosticsContext::new("test", 8))
            .with_mapped_storage(true);
        buf.set_geometry(32, 2);
        buf.init().unwrap();
        assert_eq!(buf.write_frames(&[0.25; 16], Some(8_192)), 8);
        let mut out = [0.0; 16];
        assert_eq!(buf.read_frames(&mut out, None), 8);
        assert!(out.iter().all(|&s| s == 0.25));
        assert!(buf.snapshot().mapped);
    }

    #[test]
    fn silence_fills_without_input() {
        let buf = buffer(8, 2);
        buf.write_frames(&[1.0; 4], Some(0));
        let mut out = [0.0; 4];
        buf.read_frames(&mut out, None);
        assert_eq!(buf.write_silence(3, None), 3);
        let mut out = [1.0; 6];
        assert_eq!(buf.read_frames(&mut out, None), 3);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    proptest! {
        #[test]
        fn capacity_matches_geometry(nb_buffers in 1usize..8, period in 1usize..2048, channels in 1usize..8) {
            let mut buf = TimestampedBuffer::new(channels, 512.0, DiagnosticsContext::new("test", 8));
            buf.set_geometry(nb_buffers * period, channels);
            buf.init().unwrap();
            buf.write_frames(&vec![0.5; period * channels], Some(1_000));
            buf.reset().unwrap();
            prop_assert_eq!(buf.capacity_frames(), nb_buffers * period);
            prop_assert_eq!(buf.frame_count(), 0);
        }
    }
}
