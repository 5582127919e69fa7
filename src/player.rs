//! Playback of one composition as a single timeline.
//!
//! States move `STOPPED → LOADING → LOADED → PLAYING ⇄ PAUSED → STOPPING →
//! STOPPED`. All state lives behind one lock. Backend events arrive on a
//! bounded channel and a pump thread applies them under that same lock.
//! Notifications, lighting and supervisor callbacks always run after the
//! lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::backend::{Backend, BackendError, BackendEvent, EVENT_CAPACITY, Timeline, TimelineTrack};
use crate::composition::{Composition, CompositionFile};
use crate::config::Settings;
use crate::designer::{LightingDesignEngine, PlaybackClock};
use crate::midi_routing::MidiRoutingEngine;
use crate::midi_types::MidiSignal;
use crate::notify::{MidiActivity, MidiDirection, MidiSource, NotificationSink, PlayerStateEvent};
use crate::scheduler::{Scheduler, TaskHandle};

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("No media backend available")]
    NoBackend,
    #[error("Unknown composition: {0}")]
    UnknownComposition(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayState {
    Stopped,
    Loading,
    Loaded,
    Playing,
    Paused,
    Stopping,
}

/// What a player is used for. Only the current composition reports state
/// changes and drives the lighting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum PlayerRole {
    Current,
    Default,
    Sample,
}

/// Decides what happens when a player runs out of material.
pub trait PlayerSupervisor: Send + Sync {
    fn auto_stop_fired(&self, player: &Arc<CompositionPlayer>);
    fn composition_finished(&self, player: &Arc<CompositionPlayer>);
}

/// Collaborators shared by every player.
#[derive(Clone)]
pub struct PlayerContext {
    pub backend: Option<Arc<dyn Backend>>,
    pub settings: Arc<Settings>,
    pub notifier: Arc<dyn NotificationSink>,
    pub routing: Arc<MidiRoutingEngine>,
    pub scheduler: Arc<Scheduler>,
    pub designer: Option<Arc<LightingDesignEngine>>,
}

struct PlayerInner {
    composition: Option<Arc<Composition>>,
    state: PlayState,
    start_position: u64,
    timeline: Option<Box<dyn Timeline>>,
    /// Bumped whenever a timeline is created or torn down, so late events
    /// from an old timeline are ignored.
    generation: u64,
    play_requested: bool,
    auto_stop: Option<TaskHandle>,
    /// Identifies the live auto-stop task. A task that fires with an older
    /// token was cancelled or replaced and does nothing.
    auto_stop_token: u64,
    lighting_attached: bool,
}

impl PlayerInner {
    fn position(&self) -> u64 {
        if self.start_position > 0 {
            return self.start_position;
        }
        self.timeline.as_ref().map_or(0, |t| t.position_millis())
    }

    fn cancel_auto_stop(&mut self) {
        self.auto_stop_token += 1;
        if let Some(task) = self.auto_stop.take() {
            task.cancel();
        }
    }
}

enum Lighting {
    Attach,
    Resume,
    Pause,
    Seek(u64),
    Close,
}

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

pub struct CompositionPlayer {
    id: u64,
    role: PlayerRole,
    inner: Mutex<PlayerInner>,
    context: PlayerContext,
    supervisor: Weak<dyn PlayerSupervisor>,
    me: Weak<CompositionPlayer>,
}

impl PartialEq for CompositionPlayer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl CompositionPlayer {
    pub fn new(
        context: PlayerContext,
        role: PlayerRole,
        supervisor: Weak<dyn PlayerSupervisor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed),
            role,
            inner: Mutex::new(PlayerInner {
                composition: None,
                state: PlayState::Stopped,
                start_position: 0,
                timeline: None,
                generation: 0,
                play_requested: false,
                auto_stop: None,
                auto_stop_token: 0,
                lighting_attached: false,
            }),
            context,
            supervisor,
            me: me.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> PlayerRole {
        self.role
    }

    pub fn state(&self) -> PlayState {
        self.inner.lock().state
    }

    pub fn composition(&self) -> Option<Arc<Composition>> {
        self.inner.lock().composition.clone()
    }

    pub fn position_millis(&self) -> u64 {
        self.inner.lock().position()
    }

    fn snapshot(&self, inner: &PlayerInner) -> PlayerStateEvent {
        PlayerStateEvent {
            composition: inner.composition.as_ref().map(|c| c.name.clone()),
            state: inner.state,
            position_millis: inner.position(),
        }
    }

    fn publish(&self, event: Option<PlayerStateEvent>) {
        if let Some(event) = event {
            self.context.notifier.player_state(&event);
        }
    }

    /// State changes are only reported for the current composition.
    fn reports_state(&self) -> bool {
        self.role == PlayerRole::Current
    }

    fn lighting(&self, action: Option<Lighting>) {
        let (Some(action), Some(designer)) = (action, &self.context.designer) else {
            return;
        };
        match action {
            Lighting::Attach => {
                let Some(composition) = self.composition() else {
                    return;
                };
                let clock: Weak<dyn PlaybackClock> = self.me.clone();
                if designer.load_for_composition(clock, &composition.name) {
                    designer.play();
                }
            }
            Lighting::Resume => designer.play(),
            Lighting::Pause => designer.pause(),
            Lighting::Seek(millis) => designer.seek(millis),
            Lighting::Close => designer.close(),
        }
    }

    pub fn set_composition(&self, composition: Arc<Composition>) {
        let event = {
            let mut inner = self.inner.lock();
            inner.composition = Some(composition);
            self.reports_state().then(|| self.snapshot(&inner))
        };
        self.publish(event);
    }

    /// Builds the timeline of all active tracks. Does nothing unless stopped.
    pub fn load_files(&self) -> Result<(), PlayerError> {
        let (composition, generation, event) = {
            let mut inner = self.inner.lock();
            if inner.state != PlayState::Stopped {
                return Ok(());
            }
            let Some(composition) = inner.composition.clone() else {
                return Ok(());
            };
            if self.context.backend.is_none() {
                return Err(PlayerError::NoBackend);
            }
            if !composition.has_active_file() {
                return Ok(());
            }
            inner.state = PlayState::Loading;
            inner.generation += 1;
            let event = self.reports_state().then(|| self.snapshot(&inner));
            (composition, inner.generation, event)
        };
        self.publish(event);
        tracing::debug!(composition = composition.name.as_str(), "Loading composition");

        let tracks: Vec<TimelineTrack> = composition
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_active())
            .map(|(index, file)| TimelineTrack {
                index,
                file: file.clone(),
                path: self.context.settings.media_file(file),
            })
            .collect();
        let (events, inbox) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let created = match &self.context.backend {
            Some(backend) => backend.create_timeline(&tracks, events),
            None => Err(BackendError::Unavailable("backend removed".into())),
        };

        let mut timeline = match created {
            Ok(timeline) => timeline,
            Err(e) => {
                let event = {
                    let mut inner = self.inner.lock();
                    if inner.generation == generation && inner.state == PlayState::Loading {
                        inner.state = PlayState::Stopped;
                    }
                    self.reports_state().then(|| self.snapshot(&inner))
                };
                self.publish(event);
                self.context.notifier.error(&e.to_string());
                return Err(e.into());
            }
        };

        let event = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != PlayState::Loading {
                drop(inner);
                tracing::debug!(composition = composition.name.as_str(), "Stopped while loading");
                timeline.stop();
                return Ok(());
            }
            inner.timeline = Some(timeline);
            inner.state = PlayState::Loaded;
            self.reports_state().then(|| self.snapshot(&inner))
        };
        self.spawn_pump(inbox, generation);
        self.publish(event);
        tracing::debug!(composition = composition.name.as_str(), "Composition loaded");
        Ok(())
    }

    fn spawn_pump(&self, inbox: crossbeam_channel::Receiver<BackendEvent>, generation: u64) {
        let weak = self.me.clone();
        let spawned = std::thread::Builder::new()
            .name("stagehand-player-events".into())
            .spawn(move || {
                for event in inbox {
                    let Some(player) = weak.upgrade() else {
                        break;
                    };
                    player.handle_backend_event(generation, event);
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Could not start the backend event pump");
        }
    }

    pub fn play(&self) -> Result<(), PlayerError> {
        {
            let inner = self.inner.lock();
            if inner.composition.is_none() || inner.state == PlayState::Playing {
                return Ok(());
            }
        }
        self.load_files()?;

        let (event, lighting) = {
            let mut inner = self.inner.lock();
            let Some(composition) = inner.composition.clone() else {
                return Ok(());
            };
            if matches!(
                inner.state,
                PlayState::Playing | PlayState::Loading | PlayState::Stopping
            ) {
                return Ok(());
            }
            tracing::info!(composition = composition.name.as_str(), "Playing composition");
            inner.play_requested = true;
            if let Some(timeline) = inner.timeline.as_mut() {
                timeline.play()?;
                (None, None)
            } else {
                self.enter_playing(&mut inner)
            }
        };
        self.publish(event);
        self.lighting(lighting);
        Ok(())
    }

    /// Applies the transition into `PLAYING`, either directly or once the
    /// backend reports it reached playing.
    fn enter_playing(&self, inner: &mut PlayerInner) -> (Option<PlayerStateEvent>, Option<Lighting>) {
        if inner.start_position > 0 {
            let position = std::mem::take(&mut inner.start_position);
            if let Some(timeline) = inner.timeline.as_mut() {
                if let Err(e) = timeline.seek(position) {
                    tracing::error!(error = %e, "Could not apply the start position");
                }
            } else {
                inner.start_position = position;
            }
        }
        inner.state = PlayState::Playing;
        self.schedule_auto_stop(inner);
        let lighting = if self.role != PlayerRole::Current {
            None
        } else if inner.lighting_attached {
            Some(Lighting::Resume)
        } else {
            inner.lighting_attached = true;
            Some(Lighting::Attach)
        };
        (self.reports_state().then(|| self.snapshot(inner)), lighting)
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        let (event, attached) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, PlayState::Playing | PlayState::Loaded) {
                return Ok(());
            }
            if let Some(composition) = &inner.composition {
                tracing::info!(composition = composition.name.as_str(), "Pausing composition");
            }
            inner.play_requested = false;
            if let Some(timeline) = inner.timeline.as_mut() {
                timeline.pause()?;
            }
            inner.cancel_auto_stop();
            inner.state = PlayState::Paused;
            (
                self.reports_state().then(|| self.snapshot(&inner)),
                inner.lighting_attached,
            )
        };
        self.publish(event);
        self.lighting(attached.then_some(Lighting::Pause));
        Ok(())
    }

    /// Stops playback and tears the timeline down. Stopping a stopped
    /// player does nothing.
    pub fn stop(&self) {
        let (event, timeline, attached) = {
            let mut inner = self.inner.lock();
            if inner.state == PlayState::Stopped {
                return;
            }
            inner.state = PlayState::Stopping;
            inner.cancel_auto_stop();
            inner.start_position = 0;
            inner.play_requested = false;
            inner.generation += 1;
            if let Some(composition) = &inner.composition {
                tracing::info!(composition = composition.name.as_str(), "Stopping composition");
            }
            (
                self.reports_state().then(|| self.snapshot(&inner)),
                inner.timeline.take(),
                std::mem::take(&mut inner.lighting_attached),
            )
        };
        self.publish(event);
        if let Some(mut timeline) = timeline {
            timeline.stop();
        }
        self.lighting(attached.then_some(Lighting::Close));

        let event = {
            let mut inner = self.inner.lock();
            if inner.state == PlayState::Stopping {
                inner.state = PlayState::Stopped;
            }
            self.reports_state().then(|| self.snapshot(&inner))
        };
        self.publish(event);
    }

    /// Moves the playhead. Before the timeline plays the position is kept
    /// and applied once it does.
    pub fn seek(&self, position_millis: u64) -> Result<(), PlayerError> {
        let (event, attached) = {
            let mut inner = self.inner.lock();
            tracing::debug!(position = position_millis, "Seek");
            let playing = inner.state == PlayState::Playing;
            match inner.timeline.as_mut() {
                Some(timeline) => {
                    timeline.seek(position_millis)?;
                    inner.start_position = if playing { 0 } else { position_millis };
                }
                None => inner.start_position = position_millis,
            }
            if playing {
                self.schedule_auto_stop(&mut inner);
            }
            (
                (self.role != PlayerRole::Sample).then(|| self.snapshot(&inner)),
                inner.lighting_attached,
            )
        };
        self.lighting(attached.then_some(Lighting::Seek(position_millis)));
        self.publish(event);
        Ok(())
    }

    pub fn toggle_play(&self) -> Result<(), PlayerError> {
        if self.state() == PlayState::Playing {
            self.stop();
            Ok(())
        } else {
            self.play()
        }
    }

    fn schedule_auto_stop(&self, inner: &mut PlayerInner) {
        inner.cancel_auto_stop();
        let Some(composition) = &inner.composition else {
            return;
        };
        let Some(delay) = composition.auto_stop_delay(inner.position()) else {
            return;
        };
        tracing::debug!(delay, "Scheduled auto-stop");
        let token = inner.auto_stop_token;
        let weak = self.me.clone();
        inner.auto_stop = Some(self.context.scheduler.schedule_once(
            "auto-stop",
            Duration::from_millis(delay),
            move || {
                if let Some(player) = weak.upgrade() {
                    player.auto_stop_fired(token);
                }
                Ok(())
            },
        ));
    }

    fn auto_stop_fired(self: &Arc<Self>, token: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.auto_stop_token != token {
                return;
            }
            inner.auto_stop = None;
            if inner.state != PlayState::Playing {
                return;
            }
        }
        tracing::debug!("Automatically stopping the composition");
        match self.supervisor.upgrade() {
            Some(supervisor) => supervisor.auto_stop_fired(self),
            None => self.stop(),
        }
    }

    pub(crate) fn handle_backend_event(self: &Arc<Self>, generation: u64, event: BackendEvent) {
        if self.inner.lock().generation != generation {
            return;
        }
        match event {
            BackendEvent::ReachedPlaying => {
                let (event, lighting) = {
                    let mut inner = self.inner.lock();
                    if inner.generation != generation || !inner.play_requested {
                        return;
                    }
                    if inner.state == PlayState::Playing {
                        return;
                    }
                    self.enter_playing(&mut inner)
                };
                self.publish(event);
                self.lighting(lighting);
            }
            BackendEvent::EndOfStream => match self.supervisor.upgrade() {
                Some(supervisor) => supervisor.composition_finished(self),
                None => self.stop(),
            },
            BackendEvent::Error(message) => {
                tracing::error!(message = message.as_str(), "Backend error");
                self.context.notifier.error(&message);
                self.stop();
            }
            BackendEvent::Level(peaks) => self.context.notifier.levels(&peaks),
            BackendEvent::Midi { track, bytes } => self.route_midi(track, &bytes),
        }
    }

    fn route_midi(&self, track: usize, bytes: &[u8]) {
        let composition = self.inner.lock().composition.clone();
        let Some(CompositionFile::Midi(file)) = composition.as_ref().and_then(|c| c.files.get(track))
        else {
            return;
        };
        let signal = match MidiSignal::from_bytes(bytes) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::trace!(error = %e, "Skipping MIDI message");
                return;
            }
        };
        self.context
            .routing
            .send_signal(&signal, &file.routings, MidiSource::MidiFile);
        self.context.notifier.midi_activity(&MidiActivity {
            signal,
            direction: MidiDirection::In,
            source: Some(MidiSource::MidiFile),
            destination: None,
        });
    }
}

impl PlaybackClock for CompositionPlayer {
    fn is_playing(&self) -> bool {
        self.inner.lock().state == PlayState::Playing
    }

    fn timeline_position(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner.timeline.as_ref().map(|_| inner.position())
    }
}

impl Drop for CompositionPlayer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.cancel_auto_stop();
        if let Some(mut timeline) = inner.timeline.take() {
            timeline.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::tests::FakeBackend;
    use crate::composition::tests::{audio, video};
    use crate::composition::{FileCommon, MidiFile};
    use crate::dmx_output::LegacyDmxOutput;
    use crate::dmx_output::tests::RecordingSink;
    use crate::midi_types::{MidiDestination, MidiRouting};
    use crate::notify::{ChannelNotifier, Notification};
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    pub(crate) struct Harness {
        pub backend: Arc<FakeBackend>,
        pub context: PlayerContext,
        pub notifications: Receiver<Notification>,
        pub dmx: Arc<RecordingSink>,
    }

    pub(crate) fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let (notifier, notifications) = ChannelNotifier::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(notifier);
        let dmx = Arc::new(RecordingSink::default());
        let routing = MidiRoutingEngine::new(Arc::clone(&notifier))
            .with_dmx(Arc::new(LegacyDmxOutput::new(dmx.clone())));
        let context = PlayerContext {
            backend: Some(backend.clone()),
            settings: Arc::new(Settings::default()),
            notifier,
            routing: Arc::new(routing),
            scheduler: Arc::new(Scheduler::new().unwrap()),
            designer: None,
        };
        Harness {
            backend,
            context,
            notifications,
            dmx,
        }
    }

    pub(crate) fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Waits until the player plays and its notification went out.
    fn wait_playing(player: &CompositionPlayer) {
        assert!(wait_for(|| player.state() == PlayState::Playing));
        std::thread::sleep(Duration::from_millis(20));
    }

    fn states(notifications: &Receiver<Notification>) -> Vec<PlayState> {
        notifications
            .try_iter()
            .filter_map(|n| match n {
                Notification::PlayerState(event) => Some(event.state),
                _ => None,
            })
            .collect()
    }

    fn player(h: &Harness, composition: Composition) -> Arc<CompositionPlayer> {
        let no_supervisor: Weak<dyn PlayerSupervisor> = Weak::<NoSupervisor>::new();
        let player = CompositionPlayer::new(h.context.clone(), PlayerRole::Current, no_supervisor);
        player.set_composition(Arc::new(composition));
        player
    }

    struct NoSupervisor;

    impl PlayerSupervisor for NoSupervisor {
        fn auto_stop_fired(&self, _player: &Arc<CompositionPlayer>) {}
        fn composition_finished(&self, _player: &Arc<CompositionPlayer>) {}
    }

    fn intro() -> Composition {
        Composition::new("Intro", vec![audio("a.wav", 0, 5000), video("v.mp4", 1000, 3000)])
    }

    #[test]
    fn play_loads_then_plays_once_backend_is_ready() {
        let h = harness();
        let player = player(&h, intro());
        player.play().unwrap();
        wait_playing(&player);
        assert_eq!(*h.backend.tracks.lock(), vec![0, 1]);
        assert_eq!(
            states(&h.notifications),
            vec![
                PlayState::Stopped,
                PlayState::Loading,
                PlayState::Loaded,
                PlayState::Playing
            ]
        );
    }

    #[test]
    fn play_twice_is_a_no_op() {
        let h = harness();
        let player = player(&h, intro());
        player.play().unwrap();
        wait_playing(&player);
        let calls = h.backend.calls();
        let _ = states(&h.notifications);

        player.play().unwrap();
        assert_eq!(player.state(), PlayState::Playing);
        assert_eq!(h.backend.calls(), calls);
        assert_eq!(h.backend.created.load(Ordering::SeqCst), 1);
        assert!(states(&h.notifications).is_empty());
    }

    #[test]
    fn stop_while_stopped_sends_nothing() {
        let h = harness();
        let player = player(&h, intro());
        let _ = states(&h.notifications);
        player.stop();
        assert_eq!(player.state(), PlayState::Stopped);
        assert!(states(&h.notifications).is_empty());
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn seek_while_paused_resumes_from_there() {
        let h = harness();
        let player = player(&h, intro());
        player.play().unwrap();
        wait_playing(&player);
        player.pause().unwrap();
        assert_eq!(player.state(), PlayState::Paused);

        player.seek(3000).unwrap();
        assert_eq!(player.state(), PlayState::Paused);
        assert_eq!(player.position_millis(), 3000);

        player.play().unwrap();
        wait_playing(&player);
        assert_eq!(player.position_millis(), 3000);
        assert!(h.backend.calls().contains(&"seek 3000".to_string()));
    }

    #[test]
    fn stop_tears_down_the_timeline() {
        let h = harness();
        let player = player(&h, intro());
        player.play().unwrap();
        wait_playing(&player);
        let _ = states(&h.notifications);

        player.stop();
        assert_eq!(player.state(), PlayState::Stopped);
        assert_eq!(h.backend.calls().last().map(String::as_str), Some("stop"));
        assert_eq!(
            states(&h.notifications),
            vec![PlayState::Stopping, PlayState::Stopped]
        );
        assert_eq!(player.position_millis(), 0);
    }

    #[test]
    fn without_active_tracks_play_needs_no_timeline() {
        let h = harness();
        let mut muted = audio("a.wav", 0, 5000);
        muted.common_mut().active = false;
        let player = player(&h, Composition::new("Silent", vec![muted]));
        player.play().unwrap();
        assert_eq!(player.state(), PlayState::Playing);
        assert_eq!(h.backend.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backend_failure_leaves_the_player_stopped() {
        let h = harness();
        h.backend.fail.store(true, Ordering::SeqCst);
        let player = player(&h, intro());
        assert!(matches!(player.play(), Err(PlayerError::Backend(_))));
        assert_eq!(player.state(), PlayState::Stopped);
        assert!(
            h.notifications
                .try_iter()
                .any(|n| matches!(n, Notification::Error { .. }))
        );
    }

    #[test]
    fn missing_backend_is_reported() {
        let mut h = harness();
        h.context.backend = None;
        let player = player(&h, intro());
        assert!(matches!(player.play(), Err(PlayerError::NoBackend)));
    }

    #[test]
    fn backend_error_forces_a_stop() {
        let h = harness();
        let player = player(&h, intro());
        player.play().unwrap();
        wait_playing(&player);

        h.backend.emit(BackendEvent::Error("decoder crashed".into()));
        assert!(wait_for(|| player.state() == PlayState::Stopped));
        assert!(h.notifications.try_iter().any(
            |n| matches!(n, Notification::Error { message } if message == "decoder crashed")
        ));
    }

    #[test]
    fn auto_stop_stops_without_a_supervisor() {
        let h = harness();
        let player = player(&h, Composition::new("Short", vec![audio("a.wav", 0, 50)]));
        player.play().unwrap();
        wait_playing(&player);
        assert!(wait_for(|| player.state() == PlayState::Stopped));
    }

    #[test]
    fn replaced_auto_stop_task_does_nothing() {
        let h = harness();
        let player = player(&h, intro());
        player.play().unwrap();
        wait_playing(&player);
        let first = player.inner.lock().auto_stop_token;

        player.seek(1000).unwrap();
        player.auto_stop_fired(first);
        assert_eq!(player.state(), PlayState::Playing);
        assert!(player.inner.lock().auto_stop.is_some());

        player.stop();
        let last = player.inner.lock().auto_stop_token;
        player.auto_stop_fired(last);
        assert_eq!(player.state(), PlayState::Stopped);
    }

    #[test]
    fn seek_while_playing_moves_the_auto_stop_deadline() {
        let h = harness();
        let player = player(&h, Composition::new("Short", vec![audio("a.wav", 0, 300)]));
        player.play().unwrap();
        assert!(wait_for(|| player.state() == PlayState::Playing));
        std::thread::sleep(Duration::from_millis(150));

        player.seek(0).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(player.state(), PlayState::Playing);
        assert!(wait_for(|| player.state() == PlayState::Stopped));
    }

    #[test]
    fn looping_composition_keeps_playing() {
        let h = harness();
        let mut looped = audio("a.wav", 0, 20);
        looped.common_mut().looped = true;
        let player = player(&h, Composition::new("Loop", vec![looped]));
        player.play().unwrap();
        wait_playing(&player);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(player.state(), PlayState::Playing);
    }

    #[test]
    fn midi_track_events_are_routed() {
        let h = harness();
        let midi = CompositionFile::Midi(MidiFile {
            common: FileCommon {
                duration_millis: 60_000,
                ..FileCommon::named("cues.mid")
            },
            routings: vec![MidiRouting::new(MidiDestination::Dmx)],
        });
        let player = player(&h, Composition::new("Cues", vec![midi]));
        player.play().unwrap();
        wait_playing(&player);

        h.backend.emit(BackendEvent::Midi {
            track: 0,
            bytes: vec![0x90, 9, 100],
        });
        assert!(wait_for(|| {
            h.dmx
                .frames
                .lock()
                .last()
                .is_some_and(|universes| universes.iter().any(|u| u.get(10) == 200))
        }));
        assert!(h.notifications.try_iter().any(|n| matches!(
            n,
            Notification::MidiActivity(MidiActivity {
                source: Some(MidiSource::MidiFile),
                ..
            })
        )));
    }
}
