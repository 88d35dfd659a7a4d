//! Orchestrator boundary and the processor table that owns every stream.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::diagnostics::{DEFAULT_HISTORY_LEN, DiagnosticsContext, StreamSnapshot, Verbosity};
use crate::error::StreamError;
use crate::processor::{DEFAULT_NB_BUFFERS, DEFAULT_PERIOD_SIZE, StreamProcessor};

/// Geometry source queried by `StreamProcessor::prepare`.
pub trait Orchestrator: Send + Sync {
    /// Periods per buffer.
    fn nb_buffers(&self) -> u32;
    /// Frames per period.
    fn period_size(&self) -> u32;
}

/// Buffer geometry shared by every processor of a manager.
#[derive(Debug)]
pub struct SharedGeometry {
    nb_buffers: AtomicU32,
    period_size: AtomicU32,
}

impl SharedGeometry {
    /// Geometry of `nb_buffers` periods of `period_size` frames.
    pub fn new(nb_buffers: u32, period_size: u32) -> Self {
        Self {
            nb_buffers: AtomicU32::new(nb_buffers),
            period_size: AtomicU32::new(period_size),
        }
    }

    /// Change the geometry; processors pick it up on their next `prepare()`.
    pub fn set(&self, nb_buffers: u32, period_size: u32) {
        self.nb_buffers.store(nb_buffers, Ordering::Release);
        self.period_size.store(period_size, Ordering::Release);
    }
}

impl Default for SharedGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_NB_BUFFERS, DEFAULT_PERIOD_SIZE)
    }
}

impl Orchestrator for SharedGeometry {
    fn nb_buffers(&self) -> u32 {
        self.nb_buffers.load(Ordering::Acquire)
    }

    fn period_size(&self) -> u32 {
        self.period_size.load(Ordering::Acquire)
    }
}

/// Non-owning reference to a processor in a [`StreamProcessorManager`].
///
/// A handle outlives its processor safely: once the slot is reused or
/// emptied, lookups fail with [`StreamError::StaleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    processor: Option<StreamProcessor>,
}

/// Owns stream processors, hands them a common geometry and resolves sync
/// sources between them.
pub struct StreamProcessorManager {
    geometry: Arc<SharedGeometry>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    diagnostics: DiagnosticsContext,
}

impl StreamProcessorManager {
    /// Manager handing out `nb_buffers` periods of `period_size` frames.
    pub fn new(nb_buffers: u32, period_size: u32) -> Self {
        Self::with_geometry(Arc::new(SharedGeometry::new(nb_buffers, period_size)))
    }

    /// Manager around an existing geometry.
    pub fn with_geometry(geometry: Arc<SharedGeometry>) -> Self {
        Self {
            geometry,
            slots: Vec::new(),
            free: Vec::new(),
            diagnostics: DiagnosticsContext::new("spm", DEFAULT_HISTORY_LEN),
        }
    }

    /// Shared geometry handed to registered processors.
    pub fn geometry(&self) -> &Arc<SharedGeometry> {
        &self.geometry
    }

    /// Manager logging context.
    pub fn diagnostics(&self) -> &DiagnosticsContext {
        &self.diagnostics
    }

    /// Take ownership of `processor` and attach it to this manager.
    pub fn register(&mut self, mut processor: StreamProcessor) -> ProcessorHandle {
        processor.set_manager(self.geometry.clone());
        self.diagnostics.note(format!(
            "registered {} stream on port {}",
            processor.direction(),
            processor.port()
        ));
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.processor = Some(processor);
                ProcessorHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    processor: Some(processor),
                });
                ProcessorHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Remove a processor; handles to it become stale.
    pub fn unregister(&mut self, handle: ProcessorHandle) -> Result<StreamProcessor, StreamError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(StreamError::StaleHandle(handle))?;
        let mut processor = slot.processor.take().ok_or(StreamError::StaleHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        processor.clear_manager();
        Ok(processor)
    }

    /// Look up a processor.
    pub fn get(&self, handle: ProcessorHandle) -> Result<&StreamProcessor, StreamError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.processor.as_ref())
            .ok_or(StreamError::StaleHandle(handle))
    }

    /// Look up a processor mutably.
    pub fn get_mut(
        &mut self,
        handle: ProcessorHandle,
    ) -> Result<&mut StreamProcessor, StreamError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.processor.as_mut())
            .ok_or(StreamError::StaleHandle(handle))
    }

    /// Handles of every registered processor.
    pub fn handles(&self) -> Vec<ProcessorHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.processor.is_some())
            .map(|(index, slot)| ProcessorHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Registered processors.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.processor.is_some()).count()
    }

    /// Whether no processor is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make `target` track `source`'s clock, or its own with `None`.
    pub fn set_sync_source(
        &mut self,
        target: ProcessorHandle,
        source: Option<ProcessorHandle>,
    ) -> Result<(), StreamError> {
        if let Some(source) = source {
            self.get(source)?;
        }
        let processor = self.get_mut(target)?;
        processor.set_sync_source(source);
        processor
            .diagnostics()
            .detail(Verbosity::Verbose, || match source {
                Some(source) => format!("tracking clock of {source}"),
                None => "tracking own clock".to_string(),
            });
        Ok(())
    }

    /// Period `handle` should follow, in ticks per frame: its sync source's
    /// recovered clock when one is set, its own otherwise.
    pub fn tracked_ticks_per_frame(&self, handle: ProcessorHandle) -> Result<f64, StreamError> {
        let processor = self.get(handle)?;
        match processor.sync_source() {
            Some(source) => Ok(self.get(source)?.ticks_per_frame()),
            None => Ok(processor.ticks_per_frame()),
        }
    }

    /// Rate `handle` should follow, in frames per second.
    pub fn tracked_frame_rate(&self, handle: ProcessorHandle) -> Result<f64, StreamError> {
        let processor = self.get(handle)?;
        match processor.sync_source() {
            Some(source) => Ok(self.get(source)?.frame_rate_hz()),
            None => Ok(processor.frame_rate_hz()),
        }
    }

    /// Snapshot including the sync source's rate, when reachable.
    pub fn dump(&self, handle: ProcessorHandle) -> Result<StreamSnapshot, StreamError> {
        let processor = self.get(handle)?;
        let sync_rate = processor
            .sync_source()
            .and_then(|source| self.get(source).ok())
            .map(StreamProcessor::frame_rate_hz);
        Ok(processor.snapshot(sync_rate))
    }

    /// `init()` every processor, stopping at the first failure.
    pub fn init_all(&mut self) -> Result<(), StreamError> {
        self.for_each_mut("init", StreamProcessor::init)
    }

    /// `prepare()` every processor, stopping at the first failure.
    pub fn prepare_all(&mut self) -> Result<(), StreamError> {
        self.for_each_mut("prepare", StreamProcessor::prepare)
    }

    /// `reset()` every processor, stopping at the first failure.
    pub fn reset_all(&mut self) -> Result<(), StreamError> {
        self.for_each_mut("reset", StreamProcessor::reset)
    }

    fn for_each_mut<F>(&mut self, op: &str, mut f: F) -> Result<(), StreamError>
    where
        F: FnMut(&mut StreamProcessor) -> Result<(), StreamError>,
    {
        for processor in self.slots.iter_mut().filter_map(|s| s.processor.as_mut()) {
            if let Err(err) = f(processor) {
                self.diagnostics.warn(format!(
                    "{op} failed for {} stream on port {}: {err}",
                    processor.direction(),
                    processor.port()
                ));
                return Err(err);
            }
        }
        Ok(())
    }

    /// Enable every processor at cycle `at_cycles`; returns each distance.
    pub fn enable_all(&self, at_cycles: u64) -> Vec<(ProcessorHandle, i64)> {
        self.handles()
            .into_iter()
            .filter_map(|h| self.get(h).ok().map(|sp| (h, sp.enable(at_cycles))))
            .collect()
    }

    /// Disable every processor.
    pub fn disable_all(&self) {
        for processor in self.slots.iter().filter_map(|s| s.processor.as_ref()) {
            processor.disable();
        }
    }

    /// Adjust verbosity of the manager and every processor.
    pub fn set_verbosity(&self, level: Verbosity) {
        self.diagnostics.set_verbosity(level);
        for processor in self.slots.iter().filter_map(|s| s.processor.as_ref()) {
            processor.set_verbosity(level);
        }
    }
}

impl fmt::Debug for StreamProcessorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessorManager")
            .field("nb_buffers", &self.geometry.nb_buffers())
            .field("period_size", &self.geometry.period_size())
            .field("processors", &self.len())
            .finish()
    }
}
