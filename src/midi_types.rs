//! MIDI signals, hierarchical mappings and routings.
//!
//! - [`MidiSignal`] - a single channel-voice event
//! - [`MidiMapping`] - ordered translation rules with parent fallback
//! - [`MidiRouting`] - a destination plus the mapping signals pass through
//! - [`Midi2DmxMapping`] - legacy note to DMX channel conversion

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MidiError {
    #[error("Empty MIDI message")]
    Empty,
    #[error("System message {0:#04x} is not a channel signal")]
    SystemMessage(u8),
    #[error("Truncated MIDI message: {0} bytes")]
    Truncated(usize),
    #[error("MIDI subsystem unavailable: {0}")]
    Unavailable(String),
    #[error("No MIDI {0} device found")]
    NoDevice(&'static str),
    #[error("MIDI connection error: {0}")]
    Connection(String),
    #[error("MIDI send error: {0}")]
    Send(String),
}

/// A single MIDI channel-voice event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiSignal {
    /// Status nibble (0x80 note off, 0x90 note on, ...)
    pub command: u8,
    /// Channel 0-15
    pub channel: u8,
    /// Note 0-127
    pub note: u8,
    /// Velocity 0-127
    pub velocity: u8,
}

impl MidiSignal {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const CONTROL_CHANGE: u8 = 0xb0;

    pub fn new(command: u8, channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            command: command & 0xf0,
            channel: channel & 0x0f,
            note: note & 0x7f,
            velocity: velocity & 0x7f,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(Self::NOTE_ON, channel, note, velocity)
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::new(Self::NOTE_OFF, channel, note, 0)
    }

    /// Decodes a raw short message. Data bytes missing from two-byte
    /// messages (program change, channel pressure) read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MidiError> {
        let status = *bytes.first().ok_or(MidiError::Empty)?;
        let command = status & 0xf0;
        if command == 0xf0 {
            return Err(MidiError::SystemMessage(status));
        }
        let expected = match command {
            0xc0 | 0xd0 => 2,
            _ => 3,
        };
        if bytes.len() < expected {
            return Err(MidiError::Truncated(bytes.len()));
        }
        Ok(Self::new(
            command,
            status & 0x0f,
            bytes[1],
            bytes.get(2).copied().unwrap_or(0),
        ))
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.command | self.channel, self.note, self.velocity]
    }

    /// Note off, or the running-status note on with velocity 0.
    pub fn is_note_off(&self) -> bool {
        self.command == Self::NOTE_OFF || (self.command == Self::NOTE_ON && self.velocity == 0)
    }

    pub fn is_note(&self) -> bool {
        self.command == Self::NOTE_ON || self.command == Self::NOTE_OFF
    }
}

/// Fields a rule matches on. `None` matches anything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiMatch {
    pub command: Option<u8>,
    pub channel: Option<u8>,
    pub note: Option<u8>,
}

impl MidiMatch {
    pub fn matches(&self, signal: &MidiSignal) -> bool {
        self.command.is_none_or(|c| c == signal.command)
            && self.channel.is_none_or(|c| c == signal.channel)
            && self.note.is_none_or(|n| n == signal.note)
    }
}

/// Replacement fields. `None` keeps the incoming value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiOverride {
    pub command: Option<u8>,
    pub channel: Option<u8>,
    pub note: Option<u8>,
    pub velocity: Option<u8>,
}

impl MidiOverride {
    pub fn apply(&self, signal: &MidiSignal) -> MidiSignal {
        MidiSignal::new(
            self.command.unwrap_or(signal.command),
            self.channel.unwrap_or(signal.channel),
            self.note.unwrap_or(signal.note),
            self.velocity.unwrap_or(signal.velocity),
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    #[serde(rename = "match", default)]
    pub matcher: MidiMatch,
    #[serde(default)]
    pub output: MidiOverride,
}

/// Ordered translation rules. The first local rule that matches wins;
/// otherwise the parent resolves; otherwise the signal passes unchanged.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MidiMapping {
    #[serde(default)]
    pub rules: Vec<MappingRule>,
    #[serde(skip)]
    parent: RwLock<Option<Arc<MidiMapping>>>,
}

impl Clone for MidiMapping {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            parent: RwLock::new(self.parent.read().clone()),
        }
    }
}

impl MidiMapping {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self {
            rules,
            parent: RwLock::new(None),
        }
    }

    pub fn set_parent(&self, parent: Option<Arc<MidiMapping>>) {
        *self.parent.write() = parent;
    }

    pub fn parent(&self) -> Option<Arc<MidiMapping>> {
        self.parent.read().clone()
    }

    pub fn resolve(&self, signal: &MidiSignal) -> MidiSignal {
        if let Some(rule) = self.rules.iter().find(|r| r.matcher.matches(signal)) {
            return rule.output.apply(signal);
        }
        match self.parent() {
            Some(parent) => parent.resolve(signal),
            None => *signal,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MidiDestination {
    OutDevice,
    Dmx,
    Remote,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Midi2DmxMappingType {
    /// Note n drives DMX channel n+1 with twice the velocity
    #[default]
    Simple,
    /// Each MIDI channel pair addresses a bank of 128 DMX channels, the odd
    /// channel of the pair covering values 128-255
    Exact,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Midi2DmxMapping {
    pub mapping_type: Midi2DmxMappingType,
}

impl Midi2DmxMapping {
    /// Converts a note signal into a (1-based DMX channel, value) pair.
    pub fn convert(&self, signal: &MidiSignal) -> Option<(u16, u8)> {
        if !signal.is_note() {
            return None;
        }
        let velocity = if signal.is_note_off() { 0 } else { signal.velocity };
        let (channel, value) = match self.mapping_type {
            Midi2DmxMappingType::Simple => {
                let value = if signal.is_note_off() {
                    0
                } else {
                    (velocity as u16 * 2).min(255) as u8
                };
                (signal.note as u16 + 1, value)
            }
            Midi2DmxMappingType::Exact => {
                let bank = (signal.channel / 2) as u16;
                let high = (signal.channel % 2) as u16 * 128;
                let value = if signal.is_note_off() {
                    0
                } else {
                    (velocity as u16 + high).min(255) as u8
                };
                (bank * 128 + signal.note as u16 + 1, value)
            }
        };
        (channel as usize <= open_dmx::DMX_CHANNELS).then_some((channel, value))
    }
}

/// One destination a MIDI source fans out to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MidiRouting {
    pub destination: MidiDestination,
    #[serde(default)]
    pub mapping: Arc<MidiMapping>,
    #[serde(default)]
    pub midi2dmx: Midi2DmxMapping,
    /// Names of remote devices for [`MidiDestination::Remote`]
    #[serde(default)]
    pub remote_devices: Vec<String>,
}

impl MidiRouting {
    pub fn new(destination: MidiDestination) -> Self {
        Self {
            destination,
            mapping: Arc::new(MidiMapping::default()),
            midi2dmx: Midi2DmxMapping::default(),
            remote_devices: Vec::new(),
        }
    }

    /// Chains this routing's mapping under `parent`.
    pub fn inherit(&self, parent: &Arc<MidiMapping>) {
        self.mapping.set_parent(Some(Arc::clone(parent)));
    }
}

/// A hardware device as stored in settings: the port index it was last
/// seen at and its name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiDeviceId {
    pub id: usize,
    pub name: String,
}
