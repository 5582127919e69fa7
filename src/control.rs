//! Live MIDI as show control. Notes from the input device are matched
//! against [`MidiActionMapping`] rules, and each hit runs a console command
//! locally, on named remote peers, or both.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::console::{Console, ControlCommand};
use crate::midi_device::{DeviceEvent, DeviceKind, DeviceListener};
use crate::midi_routing::{MidiReceiver, MidiRoutingEngine, MidiTransmitter};
use crate::midi_types::{MidiError, MidiMatch, MidiRouting, MidiSignal};

/// Runs commands on this machine.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &ControlCommand);
}

/// Sends commands to named remote peers.
pub trait RemoteCommandSender: Send + Sync {
    fn send_command(&self, device: &str, command: &ControlCommand) -> Result<(), MidiError>;
}

impl CommandHandler for Mutex<Console> {
    fn handle(&self, command: &ControlCommand) {
        match self.lock().execute(command) {
            Ok(reply) => tracing::info!(command = %command, reply = reply.as_str(), "Control command"),
            Err(e) => tracing::warn!(command = %command, error = %e, "Control command failed"),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MidiActionRule {
    #[serde(rename = "match", default)]
    pub when: MidiMatch,
    pub command: ControlCommand,
    #[serde(default = "default_true")]
    pub execute_locally: bool,
    #[serde(default)]
    pub remote_devices: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiActionMapping {
    pub rules: Vec<MidiActionRule>,
}

impl MidiActionMapping {
    /// Rules triggered by `signal`. Note releases never trigger.
    pub fn rules_for<'a>(&'a self, signal: &'a MidiSignal) -> impl Iterator<Item = &'a MidiActionRule> {
        let pressed = !signal.is_note_off();
        self.rules
            .iter()
            .filter(move |rule| pressed && rule.when.matches(signal))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Turns incoming MIDI into control commands.
pub struct MidiActionReceiver {
    mapping: MidiActionMapping,
    local: Option<Arc<dyn CommandHandler>>,
    remote: Option<Arc<dyn RemoteCommandSender>>,
}

impl MidiActionReceiver {
    pub fn new(
        mapping: MidiActionMapping,
        local: Option<Arc<dyn CommandHandler>>,
        remote: Option<Arc<dyn RemoteCommandSender>>,
    ) -> Self {
        Self {
            mapping,
            local,
            remote,
        }
    }
}

impl MidiReceiver for MidiActionReceiver {
    fn send(&self, signal: &MidiSignal) {
        for rule in self.mapping.rules_for(signal) {
            tracing::debug!(command = %rule.command, ?signal, "MIDI control action");
            if rule.execute_locally {
                if let Some(local) = &self.local {
                    local.handle(&rule.command);
                }
            }
            for device in &rule.remote_devices {
                let Some(remote) = &self.remote else {
                    tracing::warn!(device = device.as_str(), "No remote sender for control action");
                    continue;
                };
                if let Err(e) = remote.send_command(device, &rule.command) {
                    tracing::error!(device = device.as_str(), error = %e, "Could not forward control action");
                }
            }
        }
    }
}

/// Re-wires the input device whenever it connects: its routings plus the
/// control action receiver.
pub struct DeviceInputRouter {
    routing: Arc<MidiRoutingEngine>,
    input: Arc<dyn MidiTransmitter>,
    routings: Vec<MidiRouting>,
    actions: Option<Arc<dyn MidiReceiver>>,
}

impl DeviceInputRouter {
    pub fn new(
        routing: Arc<MidiRoutingEngine>,
        input: Arc<dyn MidiTransmitter>,
        routings: Vec<MidiRouting>,
        actions: Option<Arc<dyn MidiReceiver>>,
    ) -> Self {
        Self {
            routing,
            input,
            routings,
            actions,
        }
    }

    pub fn connect(&self) {
        let extra: Vec<Arc<dyn MidiReceiver>> = self.actions.iter().cloned().collect();
        self.routing
            .connect_transmitter_with(self.input.as_ref(), &self.routings, &extra);
    }
}

impl DeviceListener for DeviceInputRouter {
    fn device_changed(&self, kind: DeviceKind, event: &DeviceEvent) {
        if let (DeviceKind::MidiIn, DeviceEvent::Connected { name }) = (kind, event) {
            tracing::info!(device = name.as_str(), "Routing MIDI input");
            self.connect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::tests::audio;
    use crate::composition::{Catalog, Composition, CompositionFile, DurationProbe};
    use crate::director::Director;
    use crate::midi_device::DeviceBus;
    use crate::midi_routing::tests::FakeTransmitter;
    use crate::player::tests::harness;

    struct KeepDuration;

    impl DurationProbe for KeepDuration {
        fn duration_millis(&self, file: &CompositionFile) -> Option<u64> {
            Some(file.common().duration_millis)
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        sent: Mutex<Vec<(String, ControlCommand)>>,
    }

    impl RemoteCommandSender for RecordingRemote {
        fn send_command(&self, device: &str, command: &ControlCommand) -> Result<(), MidiError> {
            self.sent.lock().push((device.to_string(), command.clone()));
            Ok(())
        }
    }

    fn next_on_note(note: u8) -> MidiActionRule {
        MidiActionRule {
            when: MidiMatch {
                command: Some(MidiSignal::NOTE_ON),
                channel: None,
                note: Some(note),
            },
            command: ControlCommand::Next,
            execute_locally: true,
            remote_devices: Vec::new(),
        }
    }

    fn director() -> (Arc<Director>, crate::player::tests::Harness) {
        let h = harness();
        let catalog = Catalog::new(Arc::new(KeepDuration), 1);
        for name in ["A", "B"] {
            catalog
                .save_composition(Composition::new(name, vec![audio("a.wav", 0, 60_000)]))
                .unwrap();
        }
        (Director::new(h.context.clone(), Arc::new(catalog)), h)
    }

    fn current(director: &Director) -> Option<String> {
        director.current_player().composition().map(|c| c.name.clone())
    }

    #[test]
    fn rules_parse_from_settings_json() {
        let mapping: MidiActionMapping = serde_json::from_str(
            r#"{"rules": [{"match": {"note": 60}, "command": "Next"},
                          {"command": {"Select": {"name": "Intro"}}, "execute_locally": false,
                           "remote_devices": ["foh"]}]}"#,
        )
        .unwrap();
        assert_eq!(mapping.rules[0].when.note, Some(60));
        assert!(mapping.rules[0].execute_locally);
        assert_eq!(
            mapping.rules[1].command,
            ControlCommand::Select {
                name: "Intro".into()
            }
        );
    }

    #[test]
    fn note_on_from_the_input_device_selects_next() {
        let (director, h) = director();
        let console: Arc<dyn CommandHandler> =
            Arc::new(Mutex::new(Console::new(Arc::clone(&director), None, 1.0)));
        let actions: Arc<dyn MidiReceiver> = Arc::new(MidiActionReceiver::new(
            MidiActionMapping {
                rules: vec![next_on_note(60)],
            },
            Some(console),
            None,
        ));
        let input = Arc::new(FakeTransmitter::default());
        let router: Arc<dyn DeviceListener> = Arc::new(DeviceInputRouter::new(
            Arc::clone(&h.context.routing),
            input.clone(),
            Vec::new(),
            Some(actions),
        ));
        let bus = DeviceBus::default();
        bus.subscribe(DeviceKind::MidiIn, &router);
        bus.publish(
            DeviceKind::MidiIn,
            DeviceEvent::Connected {
                name: "pad".into(),
            },
        );

        input.emit(MidiSignal::note_on(0, 60, 100));
        assert_eq!(current(&director).as_deref(), Some("A"));
        input.emit(MidiSignal::note_off(0, 60));
        input.emit(MidiSignal::note_on(0, 61, 100));
        assert_eq!(current(&director).as_deref(), Some("A"));
        input.emit(MidiSignal::note_on(3, 60, 1));
        assert_eq!(current(&director).as_deref(), Some("B"));
    }

    #[test]
    fn remote_only_rules_leave_the_local_show_alone() {
        let (director, _h) = director();
        let console: Arc<dyn CommandHandler> =
            Arc::new(Mutex::new(Console::new(Arc::clone(&director), None, 1.0)));
        let remote = Arc::new(RecordingRemote::default());
        let mut rule = next_on_note(60);
        rule.execute_locally = false;
        rule.remote_devices = vec!["foh".into(), "monitor".into()];
        let actions = MidiActionReceiver::new(
            MidiActionMapping { rules: vec![rule] },
            Some(console),
            Some(remote.clone()),
        );

        actions.send(&MidiSignal::note_on(0, 60, 100));
        assert_eq!(current(&director), None);
        assert_eq!(
            *remote.sent.lock(),
            vec![
                ("foh".to_string(), ControlCommand::Next),
                ("monitor".to_string(), ControlCommand::Next)
            ]
        );
    }
}
