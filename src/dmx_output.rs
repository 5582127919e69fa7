use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::dmx_types::DMX_CHANNELS;

#[derive(Error, Debug)]
pub enum DmxError {
    #[error("Could not open DMX port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("DMX interface disconnected: {0}")]
    Disconnected(String),
}

/// One DMX512 channel space. Channels are 1-based; unset channels read 0.
#[derive(Clone, Default, PartialEq, Serialize, Debug)]
pub struct Universe {
    pub uuid: String,
    channels: BTreeMap<u16, u8>,
}

impl Universe {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            channels: BTreeMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.channels.clear();
    }

    /// Writes one channel. Returns false for addresses outside 1..=512.
    pub fn set(&mut self, channel: u16, value: u8) -> bool {
        if channel == 0 || channel as usize > DMX_CHANNELS {
            return false;
        }
        self.channels.insert(channel, value);
        true
    }

    pub fn get(&self, channel: u16) -> u8 {
        self.channels.get(&channel).copied().unwrap_or(0)
    }

    pub fn channels(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.channels.iter().map(|(c, v)| (*c, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn to_frame(&self) -> [u8; DMX_CHANNELS] {
        let mut frame = [0u8; DMX_CHANNELS];
        for (channel, value) in self.channels() {
            frame[channel as usize - 1] = value;
        }
        frame
    }
}

/// Receives the computed universes once per frame.
pub trait UniverseSink: Send + Sync {
    fn send(&self, universes: &[Universe]);
}

/// A physical DMX line.
pub trait DmxDevice: Send {
    fn set_channels(&mut self, frame: [u8; DMX_CHANNELS]);
    fn check(&mut self) -> Result<(), DmxError>;
}

impl DmxDevice for open_dmx::DMXSerial {
    fn set_channels(&mut self, frame: [u8; DMX_CHANNELS]) {
        open_dmx::DMXSerial::set_channels(self, frame);
    }

    fn check(&mut self) -> Result<(), DmxError> {
        self.check_agent()
            .map_err(|e| DmxError::Disconnected(e.to_string()))
    }
}

pub fn open_serial(port: &str) -> Result<open_dmx::DMXSerial, DmxError> {
    open_dmx::DMXSerial::open(port).map_err(|e| DmxError::Open {
        port: port.to_string(),
        reason: e.to_string(),
    })
}

/// Merges every source's universes highest-takes-precedence into one frame
/// and pushes it to the DMX line.
pub struct DmxOutput {
    device: Mutex<Option<Box<dyn DmxDevice>>>,
    sources: Mutex<BTreeMap<String, Universe>>,
    connected: Mutex<bool>,
}

impl DmxOutput {
    pub fn new(device: Option<Box<dyn DmxDevice>>) -> Self {
        Self {
            device: Mutex::new(device),
            sources: Mutex::new(BTreeMap::new()),
            connected: Mutex::new(false),
        }
    }

    /// Opens the serial port, or runs without a line if it is missing.
    pub fn open(port: &str) -> Self {
        match open_serial(port) {
            Ok(serial) => {
                tracing::info!(port, "DMX interface opened");
                Self::new(Some(Box::new(serial)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Running without DMX output");
                Self::new(None)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    pub fn frame(&self) -> [u8; DMX_CHANNELS] {
        let mut frame = [0u8; DMX_CHANNELS];
        for universe in self.sources.lock().values() {
            for (channel, value) in universe.channels() {
                let slot = &mut frame[channel as usize - 1];
                *slot = (*slot).max(value);
            }
        }
        frame
    }

    fn flush(&self) {
        let frame = self.frame();
        let mut device = self.device.lock();
        let Some(device) = device.as_mut() else {
            return;
        };
        device.set_channels(frame);
        let mut connected = self.connected.lock();
        match device.check() {
            Ok(()) => {
                if !*connected {
                    tracing::info!("DMX interface connected");
                }
                *connected = true;
            }
            Err(e) => {
                if *connected {
                    tracing::error!(error = %e, "DMX interface lost");
                }
                *connected = false;
            }
        }
    }
}

impl UniverseSink for DmxOutput {
    fn send(&self, universes: &[Universe]) {
        {
            let mut sources = self.sources.lock();
            for universe in universes {
                sources.insert(universe.uuid.clone(), universe.clone());
            }
        }
        self.flush();
    }
}

/// Channel values driven directly by MIDI through a MIDI to DMX conversion,
/// kept in their own universe until overwritten.
pub struct LegacyDmxOutput {
    universe: Mutex<Universe>,
    sink: Arc<dyn UniverseSink>,
}

impl LegacyDmxOutput {
    pub const UNIVERSE_UUID: &'static str = "midi2dmx";

    pub fn new(sink: Arc<dyn UniverseSink>) -> Self {
        Self {
            universe: Mutex::new(Universe::new(Self::UNIVERSE_UUID)),
            sink,
        }
    }

    pub fn set(&self, channel: u16, value: u8) {
        let snapshot = {
            let mut universe = self.universe.lock();
            if !universe.set(channel, value) {
                tracing::debug!(channel, "MIDI to DMX channel out of range");
                return;
            }
            universe.clone()
        };
        self.sink.send(std::slice::from_ref(&snapshot));
    }

    pub fn universe(&self) -> Universe {
        self.universe.lock().clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sink that records every frame it is sent.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub frames: Mutex<Vec<Vec<Universe>>>,
    }

    impl UniverseSink for RecordingSink {
        fn send(&self, universes: &[Universe]) {
            self.frames.lock().push(universes.to_vec());
        }
    }

    struct FakeDevice {
        last: Arc<Mutex<Option<[u8; DMX_CHANNELS]>>>,
        healthy: bool,
    }

    impl DmxDevice for FakeDevice {
        fn set_channels(&mut self, frame: [u8; DMX_CHANNELS]) {
            *self.last.lock() = Some(frame);
        }

        fn check(&mut self) -> Result<(), DmxError> {
            if self.healthy {
                Ok(())
            } else {
                Err(DmxError::Disconnected("unplugged".into()))
            }
        }
    }

    #[test]
    fn universe_ignores_out_of_range_channels() {
        let mut universe = Universe::new("u");
        assert!(universe.set(1, 10));
        assert!(universe.set(512, 20));
        assert!(!universe.set(0, 30));
        assert!(!universe.set(513, 40));
        let frame = universe.to_frame();
        assert_eq!(frame[0], 10);
        assert_eq!(frame[511], 20);
        universe.reset();
        assert!(universe.is_empty());
        assert_eq!(universe.get(1), 0);
    }

    #[test]
    fn output_merges_sources_highest_wins() {
        let last = Arc::new(Mutex::new(None));
        let output = DmxOutput::new(Some(Box::new(FakeDevice {
            last: Arc::clone(&last),
            healthy: true,
        })));
        let mut a = Universe::new("a");
        a.set(1, 100);
        a.set(2, 10);
        let mut b = Universe::new("b");
        b.set(1, 50);
        b.set(2, 200);
        output.send(&[a, b]);

        let frame = (*last.lock()).unwrap();
        assert_eq!(frame[0], 100);
        assert_eq!(frame[1], 200);
        assert!(output.is_connected());
    }

    #[test]
    fn output_tracks_disconnection() {
        let output = DmxOutput::new(Some(Box::new(FakeDevice {
            last: Arc::new(Mutex::new(None)),
            healthy: false,
        })));
        output.send(&[Universe::new("a")]);
        assert!(!output.is_connected());
    }

    #[test]
    fn legacy_output_keeps_previous_channels() {
        let sink = Arc::new(RecordingSink::default());
        let legacy = LegacyDmxOutput::new(sink.clone());
        legacy.set(1, 200);
        legacy.set(3, 20);
        legacy.set(600, 1);
        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1][0].get(1), 200);
        assert_eq!(frames[1][0].get(3), 20);
    }
}
