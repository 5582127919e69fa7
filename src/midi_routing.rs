//! Fan-out of MIDI signals to typed destinations.
//!
//! Each [`MidiRouting`] turns into a handler for its destination (hardware
//! out device, MIDI to DMX conversion, or remote peers). Signals pass through
//! the routing's [`MidiMapping`](crate::midi_types::MidiMapping) before they
//! reach the handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::dmx_output::LegacyDmxOutput;
use crate::midi_types::{
    Midi2DmxMapping, MidiDestination, MidiError, MidiMapping, MidiRouting, MidiSignal,
};
use crate::notify::{MidiActivity, MidiDirection, MidiSource, NotificationSink};

/// Anything that accepts MIDI signals.
pub trait MidiReceiver: Send + Sync {
    fn send(&self, signal: &MidiSignal);
    fn close(&self) {}
}

/// A live MIDI source. Setting a receiver replaces the previous one.
pub trait MidiTransmitter: Send + Sync {
    fn set_receiver(&self, receiver: Option<Arc<dyn MidiReceiver>>);
}

/// A hardware MIDI output.
pub trait MidiOutPort: Send + Sync {
    fn send(&self, signal: &MidiSignal) -> Result<(), MidiError>;
}

/// Sends signals to named remote peers.
pub trait RemoteSender: Send + Sync {
    fn send(&self, device: &str, signal: &MidiSignal) -> Result<(), MidiError>;
}

struct OutDeviceForwarder {
    mapping: Arc<MidiMapping>,
    out: Arc<dyn MidiOutPort>,
}

impl MidiReceiver for OutDeviceForwarder {
    fn send(&self, signal: &MidiSignal) {
        let mapped = self.mapping.resolve(signal);
        if let Err(e) = self.out.send(&mapped) {
            tracing::error!(error = %e, "Could not forward MIDI signal to the out device");
        }
    }
}

struct DmxConverter {
    mapping: Arc<MidiMapping>,
    midi2dmx: Midi2DmxMapping,
    dmx: Arc<LegacyDmxOutput>,
}

impl MidiReceiver for DmxConverter {
    fn send(&self, signal: &MidiSignal) {
        let mapped = self.mapping.resolve(signal);
        if let Some((channel, value)) = self.midi2dmx.convert(&mapped) {
            self.dmx.set(channel, value);
        }
    }
}

struct RemoteForwarder {
    mapping: Arc<MidiMapping>,
    remote: Arc<dyn RemoteSender>,
    devices: Vec<String>,
}

impl MidiReceiver for RemoteForwarder {
    fn send(&self, signal: &MidiSignal) {
        let mapped = self.mapping.resolve(signal);
        for device in &self.devices {
            if let Err(e) = self.remote.send(device, &mapped) {
                tracing::error!(device = device.as_str(), error = %e, "Could not forward MIDI signal to remote device");
            }
        }
    }
}

/// Reports every signal of a live source as activity on its routing.
struct MonitorReceiver {
    destination: MidiDestination,
    notifier: Arc<dyn NotificationSink>,
    closed: AtomicBool,
}

impl MidiReceiver for MonitorReceiver {
    fn send(&self, signal: &MidiSignal) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.notifier.midi_activity(&MidiActivity {
            signal: *signal,
            direction: MidiDirection::In,
            source: Some(MidiSource::InDevice),
            destination: Some(self.destination),
        });
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Delivers a signal to each inner receiver in order.
struct FanOutReceiver {
    receivers: Vec<Arc<dyn MidiReceiver>>,
}

impl MidiReceiver for FanOutReceiver {
    fn send(&self, signal: &MidiSignal) {
        for receiver in &self.receivers {
            receiver.send(signal);
        }
    }

    fn close(&self) {
        for receiver in &self.receivers {
            receiver.close();
        }
    }
}

pub struct MidiRoutingEngine {
    out_device: Option<Arc<dyn MidiOutPort>>,
    dmx: Option<Arc<LegacyDmxOutput>>,
    remote: Option<Arc<dyn RemoteSender>>,
    notifier: Arc<dyn NotificationSink>,
    monitors: Mutex<Vec<Arc<MonitorReceiver>>>,
}

impl MidiRoutingEngine {
    pub fn new(notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            out_device: None,
            dmx: None,
            remote: None,
            notifier,
            monitors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_out_device(mut self, out: Arc<dyn MidiOutPort>) -> Self {
        self.out_device = Some(out);
        self
    }

    pub fn with_dmx(mut self, dmx: Arc<LegacyDmxOutput>) -> Self {
        self.dmx = Some(dmx);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSender>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Builds the handler for a routing, or `None` when its destination is
    /// not available on this device.
    fn handler(&self, routing: &MidiRouting) -> Option<Arc<dyn MidiReceiver>> {
        let mapping = Arc::clone(&routing.mapping);
        match routing.destination {
            MidiDestination::OutDevice => self.out_device.as_ref().map(|out| {
                Arc::new(OutDeviceForwarder {
                    mapping,
                    out: Arc::clone(out),
                }) as Arc<dyn MidiReceiver>
            }),
            MidiDestination::Dmx => self.dmx.as_ref().map(|dmx| {
                Arc::new(DmxConverter {
                    mapping,
                    midi2dmx: routing.midi2dmx.clone(),
                    dmx: Arc::clone(dmx),
                }) as Arc<dyn MidiReceiver>
            }),
            MidiDestination::Remote => self.remote.as_ref().map(|remote| {
                Arc::new(RemoteForwarder {
                    mapping,
                    remote: Arc::clone(remote),
                    devices: routing.remote_devices.clone(),
                }) as Arc<dyn MidiReceiver>
            }),
        }
    }

    /// Sends one signal through every routing. Activity is reported for each
    /// routing whether or not its destination is available.
    pub fn send_signal(&self, signal: &MidiSignal, routings: &[MidiRouting], source: MidiSource) {
        for routing in routings {
            if let Some(handler) = self.handler(routing) {
                handler.send(signal);
            }
            self.notifier.midi_activity(&MidiActivity {
                signal: *signal,
                direction: MidiDirection::Out,
                source: Some(source),
                destination: Some(routing.destination),
            });
        }
    }

    /// Wires a live source to `routings`, closing the monitors of the
    /// previous connection first.
    pub fn connect_transmitter(&self, transmitter: &dyn MidiTransmitter, routings: &[MidiRouting]) {
        self.connect_transmitter_with(transmitter, routings, &[]);
    }

    /// Like [`MidiRoutingEngine::connect_transmitter`], with `extra`
    /// receivers getting every raw signal as well.
    pub fn connect_transmitter_with(
        &self,
        transmitter: &dyn MidiTransmitter,
        routings: &[MidiRouting],
        extra: &[Arc<dyn MidiReceiver>],
    ) {
        let mut monitors = self.monitors.lock();
        for monitor in monitors.drain(..) {
            monitor.close();
        }

        let mut receivers: Vec<Arc<dyn MidiReceiver>> = extra.to_vec();
        for routing in routings {
            if let Some(handler) = self.handler(routing) {
                receivers.push(handler);
            }
            let monitor = Arc::new(MonitorReceiver {
                destination: routing.destination,
                notifier: Arc::clone(&self.notifier),
                closed: AtomicBool::new(false),
            });
            receivers.push(monitor.clone());
            monitors.push(monitor);
        }
        transmitter.set_receiver(Some(Arc::new(FanOutReceiver { receivers })));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dmx_output::tests::RecordingSink;
    use crate::midi_types::{MappingRule, MidiMatch, MidiOverride};
    use crate::notify::{ChannelNotifier, Notification};

    #[derive(Default)]
    pub(crate) struct RecordingOut {
        pub sent: Mutex<Vec<MidiSignal>>,
    }

    impl MidiOutPort for RecordingOut {
        fn send(&self, signal: &MidiSignal) -> Result<(), MidiError> {
            self.sent.lock().push(*signal);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        sent: Mutex<Vec<(String, MidiSignal)>>,
    }

    impl RemoteSender for RecordingRemote {
        fn send(&self, device: &str, signal: &MidiSignal) -> Result<(), MidiError> {
            self.sent.lock().push((device.to_string(), *signal));
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeTransmitter {
        pub receiver: Mutex<Option<Arc<dyn MidiReceiver>>>,
    }

    impl FakeTransmitter {
        pub fn emit(&self, signal: MidiSignal) {
            let receiver = self.receiver.lock().clone();
            if let Some(receiver) = receiver {
                receiver.send(&signal);
            }
        }
    }

    impl MidiTransmitter for FakeTransmitter {
        fn set_receiver(&self, receiver: Option<Arc<dyn MidiReceiver>>) {
            *self.receiver.lock() = receiver;
        }
    }

    fn transpose(by_note: u8) -> Arc<MidiMapping> {
        Arc::new(MidiMapping::new(vec![MappingRule {
            matcher: MidiMatch::default(),
            output: MidiOverride {
                note: Some(by_note),
                ..Default::default()
            },
        }]))
    }

    #[test]
    fn send_signal_reaches_every_destination() {
        let (notifier, notifications) = ChannelNotifier::new();
        let out = Arc::new(RecordingOut::default());
        let remote = Arc::new(RecordingRemote::default());
        let sink = Arc::new(RecordingSink::default());
        let dmx = Arc::new(LegacyDmxOutput::new(sink.clone()));
        let engine = MidiRoutingEngine::new(Arc::new(notifier))
            .with_out_device(out.clone())
            .with_remote(remote.clone())
            .with_dmx(dmx.clone());

        let mut to_out = MidiRouting::new(MidiDestination::OutDevice);
        to_out.mapping = transpose(42);
        let to_dmx = MidiRouting::new(MidiDestination::Dmx);
        let mut to_remote = MidiRouting::new(MidiDestination::Remote);
        to_remote.remote_devices = vec!["left".into(), "right".into()];

        let signal = MidiSignal::note_on(0, 4, 100);
        engine.send_signal(&signal, &[to_out, to_dmx, to_remote], MidiSource::MidiFile);

        assert_eq!(out.sent.lock()[0].note, 42);
        assert_eq!(dmx.universe().get(5), 200);
        assert_eq!(remote.sent.lock().len(), 2);
        assert_eq!(notifications.try_iter().count(), 3);
    }

    #[test]
    fn activity_reported_without_a_destination() {
        let (notifier, notifications) = ChannelNotifier::new();
        let engine = MidiRoutingEngine::new(Arc::new(notifier));
        let signal = MidiSignal::note_on(1, 2, 3);
        engine.send_signal(&signal, &[MidiRouting::new(MidiDestination::OutDevice)], MidiSource::MidiFile);

        match notifications.try_recv().unwrap() {
            Notification::MidiActivity(activity) => {
                assert_eq!(activity.signal, signal);
                assert_eq!(activity.direction, MidiDirection::Out);
                assert_eq!(activity.destination, Some(MidiDestination::OutDevice));
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn transmitter_delivers_and_monitors_once() {
        let (notifier, notifications) = ChannelNotifier::new();
        let out = Arc::new(RecordingOut::default());
        let engine = MidiRoutingEngine::new(Arc::new(notifier)).with_out_device(out.clone());
        let transmitter = FakeTransmitter::default();
        let routings = vec![MidiRouting::new(MidiDestination::OutDevice)];

        engine.connect_transmitter(&transmitter, &routings);
        engine.connect_transmitter(&transmitter, &routings);
        transmitter.emit(MidiSignal::note_on(0, 1, 1));

        assert_eq!(out.sent.lock().len(), 1);
        assert_eq!(notifications.try_iter().count(), 1);
    }

    #[test]
    fn reconnect_closes_old_monitors() {
        let (notifier, notifications) = ChannelNotifier::new();
        let engine = MidiRoutingEngine::new(Arc::new(notifier));
        let first = FakeTransmitter::default();
        let second = FakeTransmitter::default();
        let routings = vec![MidiRouting::new(MidiDestination::Dmx)];

        engine.connect_transmitter(&first, &routings);
        engine.connect_transmitter(&second, &routings);
        first.emit(MidiSignal::note_on(0, 1, 1));
        assert_eq!(notifications.try_iter().count(), 0);
        second.emit(MidiSignal::note_on(0, 1, 1));
        assert_eq!(notifications.try_iter().count(), 1);
    }
}
