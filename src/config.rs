use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::composition::CompositionFile;
use crate::control::MidiActionMapping;
use crate::midi_types::{Midi2DmxMapping, MidiDeviceId, MidiMapping, MidiRouting};
use crate::remote::RemoteDevice;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(target_os = "windows")]
const DEFAULT_DMX_PORT: &str = "COM3";
#[cfg(not(target_os = "windows"))]
const DEFAULT_DMX_PORT: &str = "/dev/ttyUSB0";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_path: PathBuf,
    pub media_path: String,
    pub audio_path: String,
    pub video_path: String,
    pub midi_path: String,

    pub designer_frequency_hertz: u32,
    pub designer_master_dimmer: f64,
    /// Select the next composition once the current one stops on its own.
    pub auto_select_next: bool,

    pub midi_in_device: Option<MidiDeviceId>,
    pub midi_out_device: Option<MidiDeviceId>,
    pub midi_reconnect_delay_millis: u64,
    pub device_in_routings: Vec<MidiRouting>,
    pub remote_routings: Vec<MidiRouting>,
    pub midi_mapping: Arc<MidiMapping>,
    pub midi2dmx_mapping: Midi2DmxMapping,
    /// Live input notes that trigger control commands.
    pub midi_action_mapping: MidiActionMapping,

    pub dmx_serial_port: String,

    pub remote_devices: Vec<RemoteDevice>,
    /// `ip:port` to receive MIDI from remote devices on.
    pub remote_listen_address: Option<String>,

    pub probe_workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            media_path: "media".into(),
            audio_path: "audio".into(),
            video_path: "video".into(),
            midi_path: "midi".into(),
            designer_frequency_hertz: 40,
            designer_master_dimmer: 1.0,
            auto_select_next: false,
            midi_in_device: None,
            midi_out_device: None,
            midi_reconnect_delay_millis: 5000,
            device_in_routings: Vec::new(),
            remote_routings: Vec::new(),
            midi_mapping: Arc::new(MidiMapping::default()),
            midi2dmx_mapping: Midi2DmxMapping::default(),
            midi_action_mapping: MidiActionMapping::default(),
            dmx_serial_port: DEFAULT_DMX_PORT.into(),
            remote_devices: Vec::new(),
            remote_listen_address: None,
            probe_workers: 4,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings and links every routing mapping under the global one.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.link_mappings();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.designer_frequency_hertz == 0 || self.designer_frequency_hertz > 1000 {
            return Err(ConfigError::Invalid {
                name: "designer_frequency_hertz",
                reason: format!("{} is not within 1..=1000", self.designer_frequency_hertz),
            });
        }
        if !(0.0..=1.0).contains(&self.designer_master_dimmer) {
            return Err(ConfigError::Invalid {
                name: "designer_master_dimmer",
                reason: format!("{} is not within 0..=1", self.designer_master_dimmer),
            });
        }
        if self.probe_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "probe_workers",
                reason: "at least one worker is required".into(),
            });
        }
        Ok(())
    }

    fn link_mappings(&self) {
        for routing in self.device_in_routings.iter().chain(&self.remote_routings) {
            routing.inherit(&self.midi_mapping);
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.midi_reconnect_delay_millis)
    }

    /// Absolute location of a composition file on disk.
    pub fn media_file(&self, file: &CompositionFile) -> PathBuf {
        let kind = match file {
            CompositionFile::Audio(_) => &self.audio_path,
            CompositionFile::Video(_) => &self.video_path,
            CompositionFile::Midi(_) => &self.midi_path,
        };
        self.base_path
            .join(&self.media_path)
            .join(kind)
            .join(&file.common().name)
    }
}
