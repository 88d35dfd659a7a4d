//! Port abstraction boundary: maps buffer channels to named audio ports.

use crate::diagnostics::{DiagnosticsContext, Verbosity};
use crate::error::PortError;
use crate::transport::{Hook, HookLog};

/// What the stream processor needs from its port set.
///
/// The per-port calls run on the data path and must not block.
pub trait PortManager: Send + Sync {
    /// Interleaved channels carried by the stream.
    fn channel_count(&self) -> usize;

    /// Return every port to its idle state.
    fn reset_ports(&mut self) -> Result<(), PortError>;

    /// Bind ports to the finalised topology.
    fn prepare_ports(&mut self) -> Result<(), PortError>;

    /// Whether port `index` carries audio.
    fn port_enabled(&self, index: usize) -> bool;

    /// Enable or disable the port called `name`. Returns `false` if unknown.
    fn set_port_enabled(&mut self, name: &str, enabled: bool) -> bool;

    /// Copy port `index`'s samples out of interleaved `frames` into `out`.
    /// Disabled ports read silence. Returns samples copied.
    fn read_port(&self, index: usize, frames: &[f32], out: &mut [f32]) -> usize;

    /// Copy `samples` into port `index`'s channel of interleaved `frames`.
    /// Disabled ports write silence. Returns samples copied.
    fn write_port(&self, index: usize, samples: &[f32], frames: &mut [f32]) -> usize;

    /// Take a logging context; it shares the owning processor's verbosity.
    fn attach_diagnostics(&mut self, _diagnostics: DiagnosticsContext) {}
}

/// One named audio port backed by a buffer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPort {
    /// Port name as shown to clients.
    pub name: String,
    /// Disabled ports read silence and ignore writes.
    pub enabled: bool,
}

/// Ordered set of audio ports; port `i` is interleaved channel `i`.
#[derive(Debug, Default)]
pub struct PortList {
    ports: Vec<AudioPort>,
    diagnostics: Option<DiagnosticsContext>,
    log: HookLog,
    fail_reset: Option<String>,
    fail_prepare: Option<String>,
}

impl PortList {
    /// Port list with the given names, all enabled.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ports: names
                .into_iter()
                .map(|name| AudioPort {
                    name: name.into(),
                    enabled: true,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// `count` ports named `{prefix}{n}`, numbered from 1.
    pub fn numbered(prefix: &str, count: usize) -> Self {
        Self::new((1..=count).map(|n| format!("{prefix}{n}")))
    }

    /// Make `reset_ports()` fail.
    pub fn failing_reset(mut self, reason: impl Into<String>) -> Self {
        self.fail_reset = Some(reason.into());
        self
    }

    /// Make `prepare_ports()` fail.
    pub fn failing_prepare(mut self, reason: impl Into<String>) -> Self {
        self.fail_prepare = Some(reason.into());
        self
    }

    /// Handle on the hook record; clone it before boxing the list.
    pub fn hook_log(&self) -> HookLog {
        self.log.clone()
    }

    /// Ports in channel order.
    pub fn ports(&self) -> &[AudioPort] {
        &self.ports
    }

    fn hook(&self, hook: Hook, failure: &Option<String>) -> Result<(), PortError> {
        self.log.record(hook);
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.detail(Verbosity::Verbose, || {
                format!("{hook:?} on {} ports", self.ports.len())
            });
        }
        match failure {
            Some(reason) => Err(PortError::new(reason.clone())),
            None => Ok(()),
        }
    }
}

impl PortManager for PortList {
    fn channel_count(&self) -> usize {
        self.ports.len()
    }

    fn reset_ports(&mut self) -> Result<(), PortError> {
        self.hook(Hook::Reset, &self.fail_reset)
    }

    fn prepare_ports(&mut self) -> Result<(), PortError> {
        self.hook(Hook::Prepare, &self.fail_prepare)?;
        if self.ports.is_empty() {
            return Err(PortError::new("no ports defined"));
        }
        Ok(())
    }

    fn port_enabled(&self, index: usize) -> bool {
        self.ports.get(index).is_some_and(|p| p.enabled)
    }

    fn set_port_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.ports.iter_mut().find(|p| p.name == name) {
            Some(port) => {
                port.enabled = enabled;
                true
            }
            None => false,
        }
    }

    fn read_port(&self, index: usize, frames: &[f32], out: &mut [f32]) -> usize {
        let channels = self.ports.len();
        let Some(port) = self.ports.get(index) else {
            return 0;
        };
        let count = (frames.len() / channels).min(out.len());
        if !port.enabled {
            out[..count].fill(0.0);
            return count;
        }
        for (dst, frame) in out.iter_mut().zip(frames.chunks_exact(channels)) {
            *dst = frame[index];
        }
        count
    }

    fn write_port(&self, index: usize, samples: &[f32], frames: &mut [f32]) -> usize {
        let channels = self.ports.len();
        let Some(port) = self.ports.get(index) else {
            return 0;
        };
        let count = (frames.len() / channels).min(samples.len());
        for (frame, &sample) in frames.chunks_exact_mut(channels).zip(samples) {
            frame[index] = if port.enabled { sample } else { 0.0 };
        }
        count
    }

    fn attach_diagnostics(&mut self, diagnostics: DiagnosticsContext) {
        self.diagnostics = Some(diagnostics);
    }
}
