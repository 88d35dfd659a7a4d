//! Streaming settings read from an operator-supplied TOML document.

use std::path::Path;

use serde::Deserialize;

use crate::clock::DEFAULT_DLL_BANDWIDTH_HZ;
use crate::diagnostics::{DEFAULT_HISTORY_LEN, DiagnosticsContext};
use crate::error::ConfigError;
use crate::manager::SharedGeometry;
use crate::processor::{DEFAULT_NB_BUFFERS, DEFAULT_PERIOD_SIZE, Direction, StreamProcessor};

/// Vendor/model pair selecting a `[[device]]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    /// Bus vendor identifier.
    pub vendor_id: u32,
    /// Vendor model identifier.
    pub model_id: u32,
}

/// Stream processor manager settings, `[streaming.spm]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpmSettings {
    /// Receive DLL bandwidth in Hz.
    pub recv_sp_dll_bw: f64,
    /// Transmit DLL bandwidth in Hz.
    pub xmit_sp_dll_bw: f64,
    /// Periods per buffer.
    pub nb_buffers: u32,
    /// Frames per period.
    pub period_size: u32,
    /// Back buffers with an anonymous memory map.
    pub mapped_storage: bool,
    /// Diagnostics history entries per component.
    pub history_len: usize,
}

impl Default for SpmSettings {
    fn default() -> Self {
        Self {
            recv_sp_dll_bw: DEFAULT_DLL_BANDWIDTH_HZ,
            xmit_sp_dll_bw: DEFAULT_DLL_BANDWIDTH_HZ,
            nb_buffers: DEFAULT_NB_BUFFERS,
            period_size: DEFAULT_PERIOD_SIZE,
            mapped_storage: false,
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

/// `[streaming]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    /// Manager settings.
    pub spm: SpmSettings,
}

/// Per-model overrides, one `[[device]]` entry each.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    /// Bus vendor identifier.
    pub vendor_id: u32,
    /// Vendor model identifier.
    pub model_id: u32,
    /// Receive DLL bandwidth override in Hz.
    #[serde(default)]
    pub recv_sp_dll_bw: Option<f64>,
    /// Transmit DLL bandwidth override in Hz.
    #[serde(default)]
    pub xmit_sp_dll_bw: Option<f64>,
}

impl DeviceConfig {
    fn id(&self) -> DeviceId {
        DeviceId {
            vendor_id: self.vendor_id,
            model_id: self.model_id,
        }
    }
}

/// Whole streaming configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Global settings.
    pub streaming: StreamingSection,
    /// Device overrides.
    #[serde(rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

impl StreamingConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject bandwidths that are not finite and positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let spm = &self.streaming.spm;
        let overrides = self
            .devices
            .iter()
            .flat_map(|d| [d.recv_sp_dll_bw, d.xmit_sp_dll_bw])
            .flatten();
        for bw in [spm.recv_sp_dll_bw, spm.xmit_sp_dll_bw].into_iter().chain(overrides) {
            if !(bw.is_finite() && bw > 0.0) {
                return Err(ConfigError::InvalidBandwidth(bw));
            }
        }
        Ok(())
    }

    /// Overrides for `id`, if any.
    pub fn device(&self, id: DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// DLL bandwidth for `direction`: device override, then global setting.
    pub fn dll_bandwidth(&self, direction: Direction, device: Option<DeviceId>) -> f64 {
        let spm = &self.streaming.spm;
        let global = match direction {
            Direction::Receive => spm.recv_sp_dll_bw,
            Direction::Transmit => spm.xmit_sp_dll_bw,
        };
        device
            .and_then(|id| self.device(id))
            .and_then(|d| match direction {
                Direction::Receive => d.recv_sp_dll_bw,
                Direction::Transmit => d.xmit_sp_dll_bw,
            })
            .unwrap_or(global)
    }

    /// Geometry for a new manager.
    pub fn geometry(&self) -> SharedGeometry {
        SharedGeometry::new(self.streaming.spm.nb_buffers, self.streaming.spm.period_size)
    }

    /// Root logging context sized by `history_len`.
    pub fn diagnostics(&self, component: impl Into<String>) -> DiagnosticsContext {
        DiagnosticsContext::new(component, self.streaming.spm.history_len)
    }

    /// Apply bandwidth, storage and logging settings to `processor`.
    pub fn apply(&self, processor: StreamProcessor, device: Option<DeviceId>) -> StreamProcessor {
        let bandwidth = self.dll_bandwidth(processor.direction(), device);
        let diagnostics =
            self.diagnostics(format!("{}-sp{}", processor.direction(), processor.port()));
        processor
            .with_dll_bandwidth(bandwidth)
            .with_mapped_storage(self.streaming.spm.mapped_storage)
            .with_diagnostics(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Orchestrator;

    const DOC: &str = r#"
[streaming.spm]
recv_sp_dll_bw = 0.2
xmit_sp_dll_bw = 0.3
nb_buffers = 3
period_size = 256

[[device]]
vendor_id = 0x000a35
model_id = 0x0001
recv_sp_dll_bw = 0.5
"#;

    #[test]
    fn device_overrides_global_overrides_default() {
        let config = StreamingConfig::from_toml_str(DOC).unwrap();
        let motu = DeviceId {
            vendor_id: 0x000a35,
            model_id: 1,
        };
        let other = DeviceId {
            vendor_id: 0x000a35,
            model_id: 2,
        };
        assert_eq!(config.dll_bandwidth(Direction::Receive, Some(motu)), 0.5);
        assert_eq!(config.dll_bandwidth(Direction::Transmit, Some(motu)), 0.3);
        assert_eq!(config.dll_bandwidth(Direction::Receive, Some(other)), 0.2);
        assert_eq!(
            StreamingConfig::default().dll_bandwidth(Direction::Receive, None),
            DEFAULT_DLL_BANDWIDTH_HZ
        );
        assert_eq!(config.geometry().nb_buffers(), 3);
        assert_eq!(config.streaming.spm.history_len, DEFAULT_HISTORY_LEN);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config = StreamingConfig::from_toml_str("").unwrap();
        assert_eq!(config, StreamingConfig::default());
    }

    #[test]
    fn rejects_non_positive_bandwidth() {
        let err = StreamingConfig::from_toml_str(
            "[[device]]\nvendor_id = 1\nmodel_id = 2\nxmit_sp_dll_bw = 0.0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBandwidth(bw) if bw == 0.0));
    }

    #[test]
    fn rejects_malformed_documents() {
        let err =
            StreamingConfig::from_toml_str("[streaming.spm]\nnb_buffers = \"two\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
