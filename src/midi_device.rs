//! Hardware MIDI devices.
//!
//! Both directions connect through a [`Reconnector`]: a failed attempt is
//! retried after a fixed delay until a device shows up, and a successful one
//! cancels whatever retry is pending. Connection changes are published on a
//! [`DeviceBus`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;

use crate::midi_routing::{MidiOutPort, MidiReceiver, MidiTransmitter};
use crate::midi_types::{MidiDeviceId, MidiError, MidiSignal};
use crate::scheduler::{Scheduler, TaskHandle};

const CLIENT_NAME: &str = "stagehand";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum DeviceKind {
    MidiIn,
    MidiOut,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected { name: String },
    Disconnected,
}

pub trait DeviceListener: Send + Sync {
    fn device_changed(&self, kind: DeviceKind, event: &DeviceEvent);
}

/// Publish/subscribe of device connection changes. Subscribers are held
/// weakly and dropped from the bus once they are gone.
#[derive(Default)]
pub struct DeviceBus {
    subscribers: Mutex<HashMap<DeviceKind, Vec<Weak<dyn DeviceListener>>>>,
}

impl DeviceBus {
    pub fn subscribe(&self, kind: DeviceKind, listener: &Arc<dyn DeviceListener>) {
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push(Arc::downgrade(listener));
    }

    pub fn publish(&self, kind: DeviceKind, event: DeviceEvent) {
        let listeners: Vec<Arc<dyn DeviceListener>> = {
            let mut subscribers = self.subscribers.lock();
            let Some(list) = subscribers.get_mut(&kind) else {
                return;
            };
            list.retain(|l| l.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.device_changed(kind, &event);
        }
    }

    pub fn subscriber_count(&self, kind: DeviceKind) -> usize {
        self.subscribers
            .lock()
            .get(&kind)
            .map(|l| l.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

/// Picks a port for a configured device: same index and name, then same
/// name, then same index, then the first port available.
pub fn select_port(names: &[String], wanted: Option<&MidiDeviceId>) -> Option<usize> {
    if names.is_empty() {
        return None;
    }
    if let Some(wanted) = wanted {
        if names.get(wanted.id) == Some(&wanted.name) {
            return Some(wanted.id);
        }
        if let Some(index) = names.iter().position(|n| *n == wanted.name) {
            return Some(index);
        }
        if wanted.id < names.len() {
            return Some(wanted.id);
        }
    }
    Some(0)
}

/// Fixed-delay retry of a connection attempt.
pub struct Reconnector {
    name: &'static str,
    scheduler: Arc<Scheduler>,
    delay: Duration,
    pending: Mutex<Option<TaskHandle>>,
}

impl Reconnector {
    pub fn new(name: &'static str, scheduler: Arc<Scheduler>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            scheduler,
            delay,
            pending: Mutex::new(None),
        })
    }

    /// Tries `attempt` now and keeps retrying until it succeeds or
    /// [`Reconnector::cancel`] is called.
    pub fn run<F>(self: &Arc<Self>, attempt: Arc<F>)
    where
        F: Fn() -> Result<(), MidiError> + Send + Sync + 'static,
    {
        match attempt() {
            Ok(()) => self.cancel(),
            Err(e) => {
                tracing::warn!(
                    device = self.name,
                    error = %e,
                    retry_in_ms = self.delay.as_millis() as u64,
                    "MIDI device not connected"
                );
                let this = Arc::downgrade(self);
                let mut pending = self.pending.lock();
                let handle = self.scheduler.schedule_once(self.name, self.delay, move || {
                    if let Some(this) = this.upgrade() {
                        this.run(attempt);
                    }
                    Ok(())
                });
                if let Some(previous) = pending.replace(handle) {
                    previous.cancel();
                }
            }
        }
    }

    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

/// The hardware MIDI output.
pub struct MidiDeviceOut {
    wanted: Option<MidiDeviceId>,
    connection: Mutex<Option<MidiOutputConnection>>,
    reconnector: Arc<Reconnector>,
    bus: Arc<DeviceBus>,
}

impl MidiDeviceOut {
    pub fn new(
        wanted: Option<MidiDeviceId>,
        scheduler: Arc<Scheduler>,
        retry_delay: Duration,
        bus: Arc<DeviceBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            wanted,
            connection: Mutex::new(None),
            reconnector: Reconnector::new("midi-out", scheduler, retry_delay),
            bus,
        })
    }

    pub fn connect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.reconnector.run(Arc::new(move || match weak.upgrade() {
            Some(device) => device.try_connect(),
            None => Ok(()),
        }));
    }

    /// Drops the current connection and starts connecting again.
    pub fn reconnect(self: &Arc<Self>) {
        self.close();
        self.connect();
    }

    pub fn close(&self) {
        self.reconnector.cancel();
        if self.connection.lock().take().is_some() {
            self.bus.publish(DeviceKind::MidiOut, DeviceEvent::Disconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    fn try_connect(&self) -> Result<(), MidiError> {
        let output =
            MidiOutput::new(CLIENT_NAME).map_err(|e| MidiError::Unavailable(e.to_string()))?;
        let ports = output.ports();
        let names: Vec<String> = ports
            .iter()
            .map(|p| output.port_name(p).unwrap_or_default())
            .collect();
        let index = select_port(&names, self.wanted.as_ref()).ok_or(MidiError::NoDevice("out"))?;
        let connection = output
            .connect(&ports[index], "stagehand-out")
            .map_err(|e| MidiError::Connection(e.to_string()))?;
        *self.connection.lock() = Some(connection);
        tracing::info!(port = names[index].as_str(), "MIDI out device connected");
        self.bus.publish(
            DeviceKind::MidiOut,
            DeviceEvent::Connected {
                name: names[index].clone(),
            },
        );
        Ok(())
    }
}

impl MidiOutPort for MidiDeviceOut {
    fn send(&self, signal: &MidiSignal) -> Result<(), MidiError> {
        let mut connection = self.connection.lock();
        let connection = connection.as_mut().ok_or(MidiError::NoDevice("out"))?;
        connection
            .send(&signal.to_bytes())
            .map_err(|e| MidiError::Send(e.to_string()))
    }
}

/// The hardware MIDI input. Incoming channel signals go to the receiver set
/// through [`MidiTransmitter`].
pub struct MidiDeviceIn {
    wanted: Option<MidiDeviceId>,
    connection: Mutex<Option<MidiInputConnection<()>>>,
    receiver: Arc<Mutex<Option<Arc<dyn MidiReceiver>>>>,
    reconnector: Arc<Reconnector>,
    bus: Arc<DeviceBus>,
}

impl MidiDeviceIn {
    pub fn new(
        wanted: Option<MidiDeviceId>,
        scheduler: Arc<Scheduler>,
        retry_delay: Duration,
        bus: Arc<DeviceBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            wanted,
            connection: Mutex::new(None),
            receiver: Arc::new(Mutex::new(None)),
            reconnector: Reconnector::new("midi-in", scheduler, retry_delay),
            bus,
        })
    }

    pub fn connect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.reconnector.run(Arc::new(move || match weak.upgrade() {
            Some(device) => device.try_connect(),
            None => Ok(()),
        }));
    }

    pub fn reconnect(self: &Arc<Self>) {
        self.close();
        self.connect();
    }

    pub fn close(&self) {
        self.reconnector.cancel();
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
            self.bus.publish(DeviceKind::MidiIn, DeviceEvent::Disconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    fn try_connect(&self) -> Result<(), MidiError> {
        let input = MidiInput::new(CLIENT_NAME).map_err(|e| MidiError::Unavailable(e.to_string()))?;
        let ports = input.ports();
        let names: Vec<String> = ports
            .iter()
            .map(|p| input.port_name(p).unwrap_or_default())
            .collect();
        let index = select_port(&names, self.wanted.as_ref()).ok_or(MidiError::NoDevice("in"))?;
        let receiver = Arc::clone(&self.receiver);
        let connection = input
            .connect(
                &ports[index],
                "stagehand-in",
                move |_timestamp_us, data, _| match MidiSignal::from_bytes(data) {
                    Ok(signal) => {
                        let current = receiver.lock().clone();
                        if let Some(current) = current {
                            current.send(&signal);
                        }
                    }
                    Err(e) => tracing::trace!(error = %e, "Ignoring MIDI message"),
                },
                (),
            )
            .map_err(|e| MidiError::Connection(e.to_string()))?;
        *self.connection.lock() = Some(connection);
        tracing::info!(port = names[index].as_str(), "MIDI in device connected");
        self.bus.publish(
            DeviceKind::MidiIn,
            DeviceEvent::Connected {
                name: names[index].clone(),
            },
        );
        Ok(())
    }
}

impl MidiTransmitter for MidiDeviceIn {
    fn set_receiver(&self, receiver: Option<Arc<dyn MidiReceiver>>) {
        let previous = std::mem::replace(&mut *self.receiver.lock(), receiver);
        if let Some(previous) = previous {
            previous.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    fn device(id: usize, name: &str) -> MidiDeviceId {
        MidiDeviceId {
            id,
            name: name.into(),
        }
    }

    #[test]
    fn port_selection_order() {
        let ports = names(&["Through", "Launchpad", "Keystation"]);
        assert_eq!(select_port(&ports, Some(&device(1, "Launchpad"))), Some(1));
        assert_eq!(select_port(&ports, Some(&device(0, "Keystation"))), Some(2));
        assert_eq!(select_port(&ports, Some(&device(1, "Gone"))), Some(1));
        assert_eq!(select_port(&ports, Some(&device(9, "Gone"))), Some(0));
        assert_eq!(select_port(&ports, None), Some(0));
        assert_eq!(select_port(&[], None), None);
    }

    struct Counter {
        seen: Mutex<Vec<DeviceEvent>>,
    }

    impl DeviceListener for Counter {
        fn device_changed(&self, _kind: DeviceKind, event: &DeviceEvent) {
            self.seen.lock().push(event.clone());
        }
    }

    #[test]
    fn bus_delivers_by_kind_and_forgets_dropped_listeners() {
        let bus = DeviceBus::default();
        let counter = Arc::new(Counter {
            seen: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn DeviceListener> = counter.clone();
        bus.subscribe(DeviceKind::MidiIn, &listener);
        {
            let short_lived: Arc<dyn DeviceListener> = Arc::new(Counter {
                seen: Mutex::new(Vec::new()),
            });
            bus.subscribe(DeviceKind::MidiIn, &short_lived);
            assert_eq!(bus.subscriber_count(DeviceKind::MidiIn), 2);
        }
        bus.publish(DeviceKind::MidiOut, DeviceEvent::Disconnected);
        bus.publish(
            DeviceKind::MidiIn,
            DeviceEvent::Connected {
                name: "Launchpad".into(),
            },
        );
        assert_eq!(bus.subscriber_count(DeviceKind::MidiIn), 1);
        assert_eq!(
            *counter.seen.lock(),
            vec![DeviceEvent::Connected {
                name: "Launchpad".into()
            }]
        );
    }

    #[test]
    fn reconnector_retries_until_success() {
        let scheduler = Arc::new(Scheduler::new().unwrap());
        let reconnector = Reconnector::new("test", scheduler, Duration::from_millis(10));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        reconnector.run(Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MidiError::NoDevice("in"))
            } else {
                Ok(())
            }
        }));
        assert!(reconnector.is_pending());
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!reconnector.is_pending());
    }

    #[test]
    fn cancelled_reconnector_stops_retrying() {
        let scheduler = Arc::new(Scheduler::new().unwrap());
        let reconnector = Reconnector::new("test", scheduler, Duration::from_millis(20));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        reconnector.run(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MidiError::NoDevice("out"))
        }));
        reconnector.cancel();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
