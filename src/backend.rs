//! The media backend seam. A backend turns the active tracks of a
//! composition into one [`Timeline`] and reports what happens to it as
//! [`BackendEvent`]s over a bounded channel owned by the player.

use std::path::PathBuf;

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::composition::CompositionFile;

/// Capacity of the channel between a timeline and its player.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("No media backend available: {0}")]
    Unavailable(String),
    #[error("Could not open {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Timeline is closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
    /// The timeline actually started; seeking is possible from here on.
    ReachedPlaying,
    EndOfStream,
    Error(String),
    /// Peak level per output channel, 0..1
    Level(Vec<f32>),
    /// Raw short message decoded from the MIDI track at `track`.
    Midi { track: usize, bytes: Vec<u8> },
}

/// One active track handed to the backend, in composition order.
#[derive(Clone, Debug)]
pub struct TimelineTrack {
    /// Index of the track within the composition's file list
    pub index: usize,
    pub file: CompositionFile,
    pub path: PathBuf,
}

pub trait Timeline: Send {
    fn play(&mut self) -> Result<(), BackendError>;
    fn pause(&mut self) -> Result<(), BackendError>;
    fn stop(&mut self);
    fn seek(&mut self, position_millis: u64) -> Result<(), BackendError>;
    fn position_millis(&self) -> u64;
}

pub trait Backend: Send + Sync {
    fn create_timeline(
        &self,
        tracks: &[TimelineTrack],
        events: Sender<BackendEvent>,
    ) -> Result<Box<dyn Timeline>, BackendError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Records every timeline call and lets tests inject events.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub created: AtomicUsize,
        pub position: Arc<AtomicU64>,
        pub fail: AtomicBool,
        pub events: Mutex<Option<Sender<BackendEvent>>>,
        pub tracks: Mutex<Vec<usize>>,
    }

    impl FakeBackend {
        pub(crate) fn emit(&self, event: BackendEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                events.send(event).unwrap();
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    struct FakeTimeline {
        calls: Arc<Mutex<Vec<String>>>,
        position: Arc<AtomicU64>,
        events: Sender<BackendEvent>,
    }

    impl Timeline for FakeTimeline {
        fn play(&mut self) -> Result<(), BackendError> {
            self.calls.lock().push("play".into());
            let _ = self.events.send(BackendEvent::ReachedPlaying);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), BackendError> {
            self.calls.lock().push("pause".into());
            Ok(())
        }

        fn stop(&mut self) {
            self.calls.lock().push("stop".into());
        }

        fn seek(&mut self, position_millis: u64) -> Result<(), BackendError> {
            self.calls.lock().push(format!("seek {position_millis}"));
            self.position.store(position_millis, Ordering::SeqCst);
            Ok(())
        }

        fn position_millis(&self) -> u64 {
            self.position.load(Ordering::SeqCst)
        }
    }

    impl Backend for FakeBackend {
        fn create_timeline(
            &self,
            tracks: &[TimelineTrack],
            events: Sender<BackendEvent>,
        ) -> Result<Box<dyn Timeline>, BackendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("fake failure".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            *self.tracks.lock() = tracks.iter().map(|t| t.index).collect();
            *self.events.lock() = Some(events.clone());
            Ok(Box::new(FakeTimeline {
                calls: Arc::clone(&self.calls),
                position: Arc::clone(&self.position),
                events,
            }))
        }
    }
}
