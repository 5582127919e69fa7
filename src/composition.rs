use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lofty::prelude::AudioFile as _;
use parking_lot::RwLock;
use rodio::{Decoder, Source};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::midi_types::{MidiMapping, MidiRouting};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Could not read catalog {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not parse catalog {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Could not write catalog {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("A composition needs a name")]
    Unnamed,
    #[error("Composition not found: {0}")]
    NotFound(String),
}

/// Fields shared by every track kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCommon {
    pub name: String,
    pub active: bool,
    #[serde(rename = "loop")]
    pub looped: bool,
    pub offset_millis: u64,
    /// Probed when the composition is saved
    pub duration_millis: u64,
}

impl Default for FileCommon {
    fn default() -> Self {
        Self {
            name: String::new(),
            active: true,
            looped: false,
            offset_millis: 0,
            duration_millis: 0,
        }
    }
}

impl FileCommon {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioFile {
    #[serde(flatten)]
    pub common: FileCommon,
    #[serde(default)]
    pub output_bus: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoFile {
    #[serde(flatten)]
    pub common: FileCommon,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MidiFile {
    #[serde(flatten)]
    pub common: FileCommon,
    #[serde(default)]
    pub routings: Vec<MidiRouting>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompositionFile {
    Midi(MidiFile),
    Audio(AudioFile),
    Video(VideoFile),
}

impl CompositionFile {
    pub fn common(&self) -> &FileCommon {
        match self {
            CompositionFile::Midi(f) => &f.common,
            CompositionFile::Audio(f) => &f.common,
            CompositionFile::Video(f) => &f.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut FileCommon {
        match self {
            CompositionFile::Midi(f) => &mut f.common,
            CompositionFile::Audio(f) => &mut f.common,
            CompositionFile::Video(f) => &mut f.common,
        }
    }

    pub fn is_active(&self) -> bool {
        self.common().active
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Composition {
    pub name: String,
    pub files: Vec<CompositionFile>,
    pub midi_mapping: Arc<MidiMapping>,
    /// Played on demand next to the current composition
    pub sample: bool,
    /// Played whenever nothing else is
    pub default_composition: bool,
    pub auto_start_next: bool,
    pub duration_millis: u64,
    pub notes: String,
}

impl Composition {
    pub fn new(name: impl Into<String>, files: Vec<CompositionFile>) -> Self {
        Self {
            name: name.into(),
            files,
            ..Self::default()
        }
    }

    pub fn active_files(&self) -> impl Iterator<Item = &CompositionFile> {
        self.files.iter().filter(|f| f.is_active())
    }

    pub fn has_active_file(&self) -> bool {
        self.active_files().next().is_some()
    }

    /// Milliseconds from `position_millis` until the last active track ends.
    /// `None` when a looping track keeps the composition running forever or
    /// nothing is active.
    pub fn auto_stop_delay(&self, position_millis: u64) -> Option<u64> {
        let mut end = None;
        for file in self.active_files() {
            let common = file.common();
            if common.looped {
                return None;
            }
            let file_end = common.duration_millis + common.offset_millis;
            end = Some(end.map_or(file_end, |e: u64| e.max(file_end)));
        }
        end.map(|e| e.saturating_sub(position_millis))
    }

    /// Chains global mapping → composition mapping → MIDI track routings.
    pub fn link_mappings(&self, global: &Arc<MidiMapping>) {
        self.midi_mapping.set_parent(Some(Arc::clone(global)));
        for file in &self.files {
            if let CompositionFile::Midi(midi) = file {
                for routing in &midi.routings {
                    routing.inherit(&self.midi_mapping);
                }
            }
        }
    }

    fn is_playable(&self) -> bool {
        !self.sample && !self.default_composition
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetListEntry {
    pub name: String,
    pub duration_millis: u64,
}

/// An ordered selection of compositions for one show.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetList {
    pub name: String,
    pub entries: Vec<SetListEntry>,
    pub notes: String,
}

impl SetList {
    pub fn position(&self, composition_name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == composition_name)
    }
}

/// Measures a media file.
pub trait DurationProbe: Send + Sync {
    fn duration_millis(&self, file: &CompositionFile) -> Option<u64>;
}

/// Reads durations from the media directory: tags first, then a full decode.
pub struct MediaProbe {
    settings: Arc<Settings>,
}

impl MediaProbe {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn probe_path(path: &Path) -> Option<u64> {
        if let Ok(tagged_file) = lofty::read_from_path(path) {
            let duration = tagged_file.properties().duration();
            if !duration.is_zero() {
                return Some(duration.as_millis() as u64);
            }
        }
        let file = File::open(path).ok()?;
        let source = Decoder::try_from(file).ok()?;
        source.total_duration().map(|d| d.as_millis() as u64)
    }
}

impl DurationProbe for MediaProbe {
    fn duration_millis(&self, file: &CompositionFile) -> Option<u64> {
        Self::probe_path(&self.settings.media_file(file))
    }
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct CatalogDocument {
    compositions: Vec<Composition>,
    set_lists: Vec<SetList>,
}

/// All known compositions and set lists, kept sorted by name.
pub struct Catalog {
    compositions: RwLock<Vec<Arc<Composition>>>,
    set_lists: RwLock<Vec<SetList>>,
    probe: Arc<dyn DurationProbe>,
    probe_workers: usize,
    path: Option<PathBuf>,
}

impl Catalog {
    pub fn new(probe: Arc<dyn DurationProbe>, probe_workers: usize) -> Self {
        Self {
            compositions: RwLock::new(Vec::new()),
            set_lists: RwLock::new(Vec::new()),
            probe,
            probe_workers: probe_workers.max(1),
            path: None,
        }
    }

    /// Opens a catalog file. A missing file starts an empty catalog that is
    /// created on the first save.
    pub fn open(
        path: &Path,
        probe: Arc<dyn DurationProbe>,
        probe_workers: usize,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new(probe, probe_workers);
        catalog.path = Some(path.to_path_buf());
        let document = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Starting an empty catalog");
                CatalogDocument::default()
            }
            Err(source) => {
                return Err(CatalogError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        catalog.replace(document);
        Ok(catalog)
    }

    fn replace(&self, document: CatalogDocument) {
        let mut compositions: Vec<_> = document.compositions.into_iter().map(Arc::new).collect();
        compositions.sort_by(|a, b| a.name.cmp(&b.name));
        let mut set_lists = document.set_lists;
        set_lists.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!(
            compositions = compositions.len(),
            set_lists = set_lists.len(),
            "Catalog loaded"
        );
        *self.compositions.write() = compositions;
        *self.set_lists.write() = set_lists;
    }

    fn persist(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let document = CatalogDocument {
            compositions: self
                .compositions
                .read()
                .iter()
                .map(|c| Composition::clone(c))
                .collect(),
            set_lists: self.set_lists.read().clone(),
        };
        let text = serde_json::to_string_pretty(&document).map_err(|source| CatalogError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| CatalogError::Write {
            path: path.clone(),
            source,
        })
    }

    /// Probes every track, stores the longest duration on the composition
    /// and replaces any entry with the same name.
    pub fn save_composition(&self, mut composition: Composition) -> Result<Arc<Composition>, CatalogError> {
        if composition.name.trim().is_empty() {
            return Err(CatalogError::Unnamed);
        }
        self.probe_durations(&mut composition.files);
        composition.duration_millis = composition
            .files
            .iter()
            .map(|f| f.common().duration_millis)
            .max()
            .unwrap_or(0);

        let composition = Arc::new(composition);
        {
            let mut compositions = self.compositions.write();
            compositions.retain(|c| c.name != composition.name);
            compositions.push(Arc::clone(&composition));
            compositions.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.refresh_set_lists();
        self.persist()?;
        tracing::info!(
            composition = composition.name.as_str(),
            duration = composition.duration_millis,
            "Composition saved"
        );
        Ok(composition)
    }

    fn probe_durations(&self, files: &mut [CompositionFile]) {
        if files.is_empty() {
            return;
        }
        let (jobs, queue) = crossbeam_channel::bounded(files.len());
        let (done, results) = crossbeam_channel::unbounded();
        for (index, file) in files.iter().enumerate() {
            let _ = jobs.send((index, file.clone()));
        }
        drop(jobs);

        let probe = self.probe.as_ref();
        let workers = self.probe_workers.min(files.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let queue = queue.clone();
                let done = done.clone();
                scope.spawn(move || {
                    for (index, file) in queue {
                        let duration = probe.duration_millis(&file);
                        if duration.is_none() {
                            tracing::warn!(file = file.common().name.as_str(), "Could not read duration");
                        }
                        let _ = done.send((index, duration));
                    }
                });
            }
        });
        drop(done);

        for (index, duration) in results.try_iter() {
            if let Some(duration) = duration {
                files[index].common_mut().duration_millis = duration;
            }
        }
    }

    pub fn delete_composition(&self, name: &str) -> Result<(), CatalogError> {
        {
            let mut compositions = self.compositions.write();
            let before = compositions.len();
            compositions.retain(|c| c.name != name);
            if compositions.len() == before {
                return Err(CatalogError::NotFound(name.to_string()));
            }
        }
        self.refresh_set_lists();
        self.persist()
    }

    /// Drops deleted compositions from set lists and refreshes durations.
    fn refresh_set_lists(&self) {
        let compositions = self.compositions.read();
        for set_list in self.set_lists.write().iter_mut() {
            set_list.entries.retain_mut(|entry| {
                match compositions.iter().find(|c| c.name == entry.name) {
                    Some(composition) => {
                        entry.duration_millis = composition.duration_millis;
                        true
                    }
                    None => false,
                }
            });
        }
    }

    pub fn save_set_list(&self, set_list: SetList) -> Result<(), CatalogError> {
        {
            let mut set_lists = self.set_lists.write();
            set_lists.retain(|s| s.name != set_list.name);
            set_lists.push(set_list);
            set_lists.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.refresh_set_lists();
        self.persist()
    }

    pub fn set_list(&self, name: &str) -> Option<SetList> {
        self.set_lists.read().iter().find(|s| s.name == name).cloned()
    }

    pub fn set_lists(&self) -> Vec<SetList> {
        self.set_lists.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Composition>> {
        self.compositions
            .read()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn compositions(&self) -> Vec<Arc<Composition>> {
        self.compositions.read().clone()
    }

    pub fn default_composition(&self) -> Option<Arc<Composition>> {
        self.compositions
            .read()
            .iter()
            .find(|c| c.default_composition)
            .cloned()
    }

    /// Compositions that can be selected, in order.
    pub fn playable(&self) -> Vec<Arc<Composition>> {
        self.compositions
            .read()
            .iter()
            .filter(|c| c.is_playable())
            .cloned()
            .collect()
    }
}
