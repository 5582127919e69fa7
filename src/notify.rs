//! Outbound notifications for whatever sits on top of the engine
//! (websocket layer, console, tests).

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;

use crate::midi_types::{MidiDestination, MidiSignal};
use crate::player::PlayState;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlayerStateEvent {
    pub composition: Option<String>,
    pub state: PlayState,
    pub position_millis: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MidiDirection {
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MidiSource {
    InDevice,
    MidiFile,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MidiActivity {
    pub signal: MidiSignal,
    pub direction: MidiDirection,
    pub source: Option<MidiSource>,
    pub destination: Option<MidiDestination>,
}

pub trait NotificationSink: Send + Sync {
    fn player_state(&self, event: &PlayerStateEvent);
    fn midi_activity(&self, activity: &MidiActivity);
    fn levels(&self, _peaks: &[f32]) {}
    fn error(&self, message: &str);
}

/// Writes every notification to the log.
#[derive(Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn player_state(&self, event: &PlayerStateEvent) {
        tracing::info!(
            composition = event.composition.as_deref().unwrap_or("-"),
            state = %event.state,
            position = event.position_millis,
            "Player state"
        );
    }

    fn midi_activity(&self, activity: &MidiActivity) {
        tracing::trace!(
            direction = %activity.direction,
            source = ?activity.source,
            destination = ?activity.destination,
            signal = ?activity.signal,
            "MIDI activity"
        );
    }

    fn error(&self, message: &str) {
        tracing::error!(message, "Player error");
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    PlayerState(PlayerStateEvent),
    MidiActivity(MidiActivity),
    Levels { peaks: Vec<f32> },
    Error { message: String },
}

/// Forwards notifications over a channel.
pub struct ChannelNotifier {
    sender: Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelNotifier {
    fn player_state(&self, event: &PlayerStateEvent) {
        let _ = self.sender.send(Notification::PlayerState(event.clone()));
    }

    fn midi_activity(&self, activity: &MidiActivity) {
        let _ = self.sender.send(Notification::MidiActivity(activity.clone()));
    }

    fn levels(&self, peaks: &[f32]) {
        let _ = self.sender.send(Notification::Levels {
            peaks: peaks.to_vec(),
        });
    }

    fn error(&self, message: &str) {
        let _ = self.sender.send(Notification::Error {
            message: message.to_string(),
        });
    }
}
