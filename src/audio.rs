use crate::backend::{Backend, BackendError, BackendEvent, Timeline, TimelineTrack};
use crate::composition::CompositionFile;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use rodio::{Decoder, DeviceSinkBuilder, Source};
use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(50);

/// Plays the audio tracks of a composition on the default output device.
///
/// Every timeline owns a thread that holds the device sink and its players,
/// so nothing device-bound crosses threads. Video and MIDI tracks are left
/// to other backends.
#[derive(Default)]
pub struct RodioBackend;

enum Command {
    Play,
    Pause,
    Seek(u64),
    Stop,
}

pub struct RodioTimeline {
    commands: Sender<Command>,
    position: Arc<AtomicU64>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Backend for RodioBackend {
    fn create_timeline(
        &self,
        tracks: &[TimelineTrack],
        events: Sender<BackendEvent>,
    ) -> Result<Box<dyn Timeline>, BackendError> {
        let tracks = tracks.to_vec();
        let (commands, inbox) = unbounded();
        let (ready, ready_rx) = bounded(1);
        let position = Arc::new(AtomicU64::new(0));
        let shared = Arc::clone(&position);

        let worker = thread::Builder::new()
            .name("stagehand-audio".into())
            .spawn(move || run_timeline(tracks, inbox, ready, events, shared))
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(RodioTimeline {
                commands,
                position,
                worker: Some(worker),
            })),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(BackendError::Unavailable("audio thread exited".into())),
        }
    }
}

impl RodioTimeline {
    fn send(&self, command: Command) -> Result<(), BackendError> {
        self.commands.send(command).map_err(|_| BackendError::Closed)
    }
}

impl Timeline for RodioTimeline {
    fn play(&mut self) -> Result<(), BackendError> {
        self.send(Command::Play)
    }

    fn pause(&mut self) -> Result<(), BackendError> {
        self.send(Command::Pause)
    }

    fn stop(&mut self) {
        let _ = self.send(Command::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn seek(&mut self, position_millis: u64) -> Result<(), BackendError> {
        self.send(Command::Seek(position_millis))
    }

    fn position_millis(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }
}

impl Drop for RodioTimeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Position for timelines without an audio player to ask.
#[derive(Default)]
struct Stopwatch {
    base: u64,
    since: Option<Instant>,
}

impl Stopwatch {
    fn millis(&self) -> u64 {
        self.base + self.since.map_or(0, |s| s.elapsed().as_millis() as u64)
    }

    fn start(&mut self) {
        self.since.get_or_insert_with(Instant::now);
    }

    fn pause(&mut self) {
        self.base = self.millis();
        self.since = None;
    }

    fn seek(&mut self, millis: u64) {
        self.base = millis;
        if self.since.is_some() {
            self.since = Some(Instant::now());
        }
    }
}

fn open_player(
    sink: &rodio::MixerDeviceSink,
    track: &TimelineTrack,
) -> Result<rodio::Player, BackendError> {
    let open_error = |reason: String| BackendError::Open {
        path: track.path.clone(),
        reason,
    };
    let file = File::open(&track.path).map_err(|e| open_error(e.to_string()))?;
    let source = Decoder::try_from(file).map_err(|e| open_error(e.to_string()))?;
    let common = track.file.common();
    let offset = Duration::from_millis(common.offset_millis);

    let player = rodio::Player::connect_new(sink.mixer());
    player.pause();
    if common.looped {
        player.append(source.buffered().repeat_infinite().delay(offset));
    } else {
        player.append(source.delay(offset));
    }
    Ok(player)
}

fn run_timeline(
    tracks: Vec<TimelineTrack>,
    inbox: Receiver<Command>,
    ready: Sender<Result<(), BackendError>>,
    events: Sender<BackendEvent>,
    position: Arc<AtomicU64>,
) {
    let mut sink = match DeviceSinkBuilder::open_default_sink() {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready.send(Err(BackendError::Device(e.to_string())));
            return;
        }
    };
    sink.log_on_drop(false);

    let mut players = Vec::new();
    for track in &tracks {
        match &track.file {
            CompositionFile::Audio(audio) => {
                if let Some(bus) = &audio.output_bus {
                    tracing::debug!(bus = bus.as_str(), "Output bus ignored, using the default device");
                }
                match open_player(&sink, track) {
                    Ok(player) => players.push(player),
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                }
            }
            CompositionFile::Video(_) | CompositionFile::Midi(_) => {
                tracing::warn!(
                    file = track.file.common().name.as_str(),
                    "Track kind not supported by the audio backend, skipping"
                );
            }
        }
    }
    let _ = ready.send(Ok(()));

    let mut stopwatch = Stopwatch::default();
    let mut playing = false;
    let mut ended = false;
    loop {
        match inbox.recv_timeout(POLL) {
            Ok(Command::Play) => {
                players.iter().for_each(|p| p.play());
                stopwatch.start();
                playing = true;
                let _ = events.send(BackendEvent::ReachedPlaying);
            }
            Ok(Command::Pause) => {
                players.iter().for_each(|p| p.pause());
                stopwatch.pause();
                playing = false;
            }
            Ok(Command::Seek(millis)) => {
                for player in &players {
                    if let Err(e) = player.try_seek(Duration::from_millis(millis)) {
                        tracing::warn!(error = %e, "Seek failed");
                    }
                }
                stopwatch.seek(millis);
                ended = false;
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => {
                players.iter().for_each(|p| p.stop());
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let millis = players
            .first()
            .map(|p| p.get_pos().as_millis() as u64)
            .unwrap_or_else(|| stopwatch.millis());
        position.store(millis, Ordering::Release);

        if playing && !ended && !players.is_empty() && players.iter().all(|p| p.empty()) {
            ended = true;
            let _ = events.send(BackendEvent::EndOfStream);
        }
    }
    tracing::debug!("Audio timeline closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_holds_position_while_paused() {
        let mut stopwatch = Stopwatch::default();
        stopwatch.seek(3000);
        assert_eq!(stopwatch.millis(), 3000);
        stopwatch.start();
        thread::sleep(Duration::from_millis(20));
        stopwatch.pause();
        let paused_at = stopwatch.millis();
        assert!(paused_at >= 3020);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stopwatch.millis(), paused_at);
    }
}
