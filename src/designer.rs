//! Lighting design engine
//!
//! Every frame the engine resolves which presets are active at the current
//! position, blends their capability values and effects over the fixtures'
//! defaults, encodes the result into DMX bytes and pushes the universes to a
//! [`UniverseSink`].
//!
//! The frame computation itself is a set of pure functions over a
//! [`Project`] so it can be tested without a clock.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::dmx_output::{Universe, UniverseSink};
use crate::dmx_types::{
    CapabilityColor, CapabilityType, Fixture, FixtureCapabilityValue, FixtureChannel, Preset,
    Project, Scene, ScenePlaybackRegion,
};
use crate::effect::EffectChannel;
use crate::scheduler::{Scheduler, TaskHandle, TaskResult};

/// The timeline the engine follows while attached to a player.
pub trait PlaybackClock: Send + Sync {
    fn is_playing(&self) -> bool;
    /// Position of an audio/video timeline, when one drives the show.
    fn timeline_position(&self) -> Option<u64>;
}

/// A preset active in the current frame, with the region and scene that
/// activated it. Previewed presets have neither.
#[derive(Clone, Copy, Debug)]
pub struct ActivePreset<'a> {
    pub preset: &'a Preset,
    pub region: Option<&'a ScenePlaybackRegion>,
    pub scene: Option<&'a Scene>,
}

/// Live design editing state, used while nothing is playing.
#[derive(Clone, Default, Debug)]
pub struct Preview {
    /// Show only the selected preset instead of the selected scenes
    pub preview_preset: bool,
    pub selected_preset_uuid: Option<String>,
    pub selected_scene_uuids: Vec<String>,
}

/// A mode channel slot resolved against its template.
#[derive(Clone, Copy, Debug)]
pub struct ChannelSlot<'a> {
    /// `None` for placeholders and unknown channel names
    pub channel: Option<&'a FixtureChannel>,
    /// Fine bytes of this channel present in the mode
    pub fine_count: usize,
    /// Which fine byte this slot carries, `None` for the coarse byte
    pub fine_index: Option<usize>,
}

/// Linear blend. Full intensity replaces the existing value outright.
pub fn mix(existing: f64, incoming: f64, intensity: f64) -> f64 {
    if intensity < 1.0 {
        existing * (1.0 - intensity) + incoming * intensity
    } else {
        incoming
    }
}

/// Encodes a 0-255 value into the byte at `fine_index` of a channel with
/// `fine_count` fine bytes. Coarser bytes floor, the finest byte rounds.
pub fn dmx_value(value: f64, fine_count: usize, fine_index: Option<usize>) -> u8 {
    match fine_index {
        Some(index) => dmx_value(
            (value - value.floor()) * 255.0,
            fine_count.saturating_sub(1),
            index.checked_sub(1),
        ),
        None if fine_count > 0 => value.floor().clamp(0.0, 255.0) as u8,
        None => value.round().clamp(0.0, 255.0) as u8,
    }
}

/// Presets active at `millis`: scenes last to first, then each scene's
/// presets in reverse project order, filtered by their own windows.
pub fn presets_in_time<'a>(
    project: &'a Project,
    regions: &'a [ScenePlaybackRegion],
    millis: u64,
) -> Vec<ActivePreset<'a>> {
    let mut active = Vec::new();
    for scene in project.scenes.iter().rev() {
        for region in regions
            .iter()
            .filter(|r| r.scene_uuid == scene.uuid && r.contains(millis))
        {
            for preset in project
                .presets
                .iter()
                .rev()
                .filter(|p| scene.preset_uuids.contains(&p.uuid))
            {
                let starts = preset
                    .start_millis
                    .is_none_or(|s| region.start_millis + s <= millis);
                let ends = preset
                    .end_millis
                    .is_none_or(|e| region.start_millis + e >= millis);
                if starts && ends {
                    active.push(ActivePreset {
                        preset,
                        region: Some(region),
                        scene: Some(scene),
                    });
                }
            }
        }
    }
    active
}

/// Presets shown while editing: the selected preset alone, or every preset of
/// the selected scenes without any time filtering.
pub fn preview_presets<'a>(project: &'a Project, preview: &Preview) -> Vec<ActivePreset<'a>> {
    if preview.preview_preset {
        return preview
            .selected_preset_uuid
            .as_deref()
            .and_then(|uuid| project.preset(uuid))
            .map(|preset| ActivePreset {
                preset,
                region: None,
                scene: None,
            })
            .into_iter()
            .collect();
    }
    let mut active = Vec::new();
    for scene in project
        .scenes
        .iter()
        .rev()
        .filter(|s| preview.selected_scene_uuids.contains(&s.uuid))
    {
        for preset in project
            .presets
            .iter()
            .rev()
            .filter(|p| scene.preset_uuids.contains(&p.uuid))
        {
            active.push(ActivePreset {
                preset,
                region: None,
                scene: None,
            });
        }
    }
    active
}

/// Chase index of a fixture within a preset: its position among the
/// preset's fixtures in project order, counting ganged fixtures once.
pub fn fixture_index(project: &Project, preset: &Preset, fixture_uuid: &str) -> Option<usize> {
    let mut counted: Vec<(&str, u16)> = Vec::new();
    for fixture in project
        .fixtures
        .iter()
        .filter(|f| preset.fixture_uuids.contains(&f.uuid))
    {
        if fixture.uuid == fixture_uuid {
            return Some(counted.len());
        }
        let address = (fixture.universe_uuid.as_str(), fixture.dmx_first_channel);
        if !counted.contains(&address) {
            counted.push(address);
        }
    }
    None
}

/// Resolves a fixture's mode channels. Empty when the template or mode is missing.
pub fn fixture_channels<'a>(project: &'a Project, fixture: &Fixture) -> Vec<ChannelSlot<'a>> {
    let Some((template, mode)) = project.template_and_mode(fixture) else {
        return Vec::new();
    };
    mode.channels
        .iter()
        .map(|entry| {
            let resolved = entry.as_deref().and_then(|name| {
                template
                    .channel_for(name)
                    .map(|(_, channel)| (name, channel))
            });
            match resolved {
                Some((name, channel)) => ChannelSlot {
                    channel: Some(channel),
                    fine_count: channel
                        .fine_channel_aliases
                        .iter()
                        .filter(|alias| mode.channels.iter().any(|c| c.as_deref() == Some(alias.as_str())))
                        .count(),
                    fine_index: channel.fine_channel_aliases.iter().position(|a| a == name),
                },
                None => ChannelSlot {
                    channel: None,
                    fine_count: 0,
                    fine_index: None,
                },
            }
        })
        .collect()
}

/// How much a preset covers what lies below it, 0 to 1. Scene and preset
/// fades combine by taking the lower intensity.
pub fn fade_intensity(active: &ActivePreset<'_>, millis: u64) -> f64 {
    let (Some(region), Some(scene)) = (active.region, active.scene) else {
        return 1.0;
    };
    let t = millis as f64;
    let start = region.start_millis as f64;
    let end = region.end_millis as f64;

    let mut scene_intensity = 1.0;
    let scene_fade_out = scene.fade_out_millis as f64;
    let scene_fade_in = scene.fade_in_millis as f64;
    if scene_fade_out > 0.0 && t > end - scene_fade_out {
        scene_intensity = (end - t) / scene_fade_out;
    } else if scene_fade_in > 0.0 && t < start + scene_fade_in {
        scene_intensity = (t - start) / scene_fade_in;
    }

    let preset = active.preset;
    let mut preset_intensity = 1.0;
    let preset_fade_out = preset.fade_out_millis as f64;
    let preset_fade_in = preset.fade_in_millis as f64;
    if let Some(end_offset) = preset.end_millis {
        let preset_end = start + end_offset as f64;
        if preset_fade_out > 0.0 && t > preset_end - preset_fade_out {
            preset_intensity = (preset_end - t) / preset_fade_out;
        }
    }
    if let Some(start_offset) = preset.start_millis {
        let preset_start = start + start_offset as f64;
        if preset_fade_in > 0.0 && t < preset_start + preset_fade_in {
            preset_intensity = (t - preset_start) / preset_fade_in;
        }
    }

    f64::min(scene_intensity, preset_intensity).clamp(0.0, 1.0)
}

/// Mixes `incoming` into the slot it shares with an existing value.
fn mix_into(values: &mut Vec<FixtureCapabilityValue>, incoming: FixtureCapabilityValue, intensity: f64) {
    let existing = values.iter().position(|v| v.same_slot(&incoming));
    let previous = existing.map(|i| values[i].value).unwrap_or(0.0);
    let value = mix(previous, incoming.value, intensity).clamp(0.0, 255.0);
    if let Some(i) = existing {
        values.remove(i);
    }
    values.push(FixtureCapabilityValue::new(
        value,
        incoming.capability_type,
        incoming.color,
    ));
}

fn effect_capability(channel: EffectChannel, value: f64) -> FixtureCapabilityValue {
    let (capability_type, color) = match channel {
        EffectChannel::Dimmer => (CapabilityType::Intensity, None),
        EffectChannel::Pan => (CapabilityType::Pan, None),
        EffectChannel::Tilt => (CapabilityType::Tilt, None),
        EffectChannel::ColorRed => (CapabilityType::ColorIntensity, Some(CapabilityColor::Red)),
        EffectChannel::ColorGreen => (CapabilityType::ColorIntensity, Some(CapabilityColor::Green)),
        EffectChannel::ColorBlue => (CapabilityType::ColorIntensity, Some(CapabilityColor::Blue)),
    };
    FixtureCapabilityValue::new(value, capability_type, color)
}

fn exposes(slots: &[ChannelSlot<'_>], value: &FixtureCapabilityValue) -> bool {
    slots
        .iter()
        .filter_map(|s| s.channel)
        .any(|c| c.capability.accepts(value))
}

/// Capability values per fixture, in project fixture order. Fixtures sharing
/// a universe and first channel with an earlier one reuse its values.
pub fn fixture_property_values(
    project: &Project,
    millis: u64,
    presets: &[ActivePreset<'_>],
) -> Vec<(String, Vec<FixtureCapabilityValue>)> {
    let mut computed: Vec<(String, Vec<FixtureCapabilityValue>)> = Vec::new();

    for (i, fixture) in project.fixtures.iter().enumerate() {
        let ganged = project.fixtures[..i].iter().position(|f| {
            f.universe_uuid == fixture.universe_uuid && f.dmx_first_channel == fixture.dmx_first_channel
        });
        if let Some(first) = ganged {
            let values = computed[first].1.clone();
            computed.push((fixture.uuid.clone(), values));
            continue;
        }

        let slots = fixture_channels(project, fixture);
        let mut values = Vec::new();
        for channel in slots.iter().filter_map(|s| s.channel) {
            if let Some(default) = channel.default_capability_value() {
                let capability = channel.capability;
                mix_into(
                    &mut values,
                    FixtureCapabilityValue::new(default, capability.capability_type, capability.color),
                    1.0,
                );
            }
        }

        for active in presets {
            let Some(chase_index) = fixture_index(project, active.preset, &fixture.uuid) else {
                continue;
            };
            let intensity = fade_intensity(active, millis);

            for value in &active.preset.capability_values {
                if exposes(&slots, value) {
                    mix_into(&mut values, *value, intensity);
                }
            }
            for effect in &active.preset.effects {
                let value = effect.value(millis, chase_index);
                for channel in &effect.effect_channels {
                    let capability = effect_capability(*channel, value);
                    if exposes(&slots, &capability) {
                        mix_into(&mut values, capability, intensity);
                    }
                }
            }
        }
        computed.push((fixture.uuid.clone(), values));
    }
    computed
}

/// Resets `universes` and writes every fixture's encoded channels. Fixtures
/// whose universe is unknown land in the first universe.
pub fn write_universes(
    project: &Project,
    values: &[(String, Vec<FixtureCapabilityValue>)],
    universes: &mut [Universe],
    master_dimmer: f64,
) {
    universes.iter_mut().for_each(Universe::reset);
    if universes.is_empty() {
        return;
    }

    for (fixture_uuid, capabilities) in values {
        let Some(fixture) = project.fixture(fixture_uuid) else {
            continue;
        };
        let index = universes
            .iter()
            .position(|u| u.uuid == fixture.universe_uuid)
            .unwrap_or(0);
        let universe = &mut universes[index];

        for (offset, slot) in fixture_channels(project, fixture).iter().enumerate() {
            let Some(channel) = slot.channel else {
                continue;
            };
            let Some(capability) = capabilities
                .iter()
                .rev()
                .find(|v| channel.capability.accepts(v))
            else {
                continue;
            };
            let mut value = capability.value;
            if capability.capability_type == CapabilityType::Intensity {
                value *= master_dimmer.clamp(0.0, 1.0);
            }
            let address = fixture.dmx_first_channel as usize + offset;
            if let Ok(address) = u16::try_from(address) {
                universe.set(address, dmx_value(value, slot.fine_count, slot.fine_index));
            }
        }
    }
}

struct DesignerState {
    project: Option<Arc<Project>>,
    regions: Vec<ScenePlaybackRegion>,
    clock: Option<Weak<dyn PlaybackClock>>,
    preview: Preview,
    universes: Vec<Universe>,
    timer: Option<TaskHandle>,
    last_play: Option<Instant>,
    last_position: u64,
    master_dimmer: f64,
}

impl DesignerState {
    fn wall_position(&self) -> u64 {
        match self.last_play {
            Some(started) => self.last_position + started.elapsed().as_millis() as u64,
            None => self.last_position,
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

pub struct LightingDesignEngine {
    state: Mutex<DesignerState>,
    projects: RwLock<Vec<Arc<Project>>>,
    sink: Arc<dyn UniverseSink>,
    scheduler: Arc<Scheduler>,
    frame_period: Duration,
}

impl LightingDesignEngine {
    pub fn new(
        sink: Arc<dyn UniverseSink>,
        scheduler: Arc<Scheduler>,
        frequency_hertz: u32,
        master_dimmer: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DesignerState {
                project: None,
                regions: Vec::new(),
                clock: None,
                preview: Preview::default(),
                universes: Vec::new(),
                timer: None,
                last_play: None,
                last_position: 0,
                master_dimmer,
            }),
            projects: RwLock::new(Vec::new()),
            sink,
            scheduler,
            frame_period: Duration::from_millis(1000 / frequency_hertz.max(1) as u64),
        })
    }

    pub fn set_projects(&self, projects: Vec<Project>) {
        *self.projects.write() = projects.into_iter().map(Arc::new).collect();
    }

    /// The project lighting the named composition, if any.
    pub fn project_for_composition(&self, composition_name: &str) -> Option<Arc<Project>> {
        self.projects
            .read()
            .iter()
            .find(|p| p.composition(composition_name).is_some())
            .cloned()
    }

    pub fn current_project(&self) -> Option<Arc<Project>> {
        self.state.lock().project.clone()
    }

    /// Attaches a project and the clock of the player it follows. Returns
    /// false when no project lights the composition.
    pub fn load_for_composition(&self, clock: Weak<dyn PlaybackClock>, composition_name: &str) -> bool {
        match self.project_for_composition(composition_name) {
            Some(project) => {
                self.load(Some(clock), project, composition_name);
                true
            }
            None => false,
        }
    }

    pub fn load(
        &self,
        clock: Option<Weak<dyn PlaybackClock>>,
        project: Arc<Project>,
        composition_name: &str,
    ) {
        let mut state = self.state.lock();
        state.stop_timer();
        state.regions = project
            .composition(composition_name)
            .map(|c| c.scene_playback_regions.clone())
            .unwrap_or_default();
        let mut uuids = project.universe_uuids();
        if uuids.is_empty() {
            uuids.push(String::new());
        }
        state.universes = uuids.into_iter().map(Universe::new).collect();
        state.project = Some(project);
        state.clock = clock;
        state.last_play = None;
        state.last_position = 0;
        tracing::debug!(composition = composition_name, "Lighting project loaded");
    }

    pub fn play(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.project.is_none() {
            return;
        }
        state.last_play = Some(Instant::now());
        self.start_timer(&mut state);
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.stop_timer();
        state.last_position = state.wall_position();
        state.last_play = None;
    }

    pub fn seek(&self, position_millis: u64) {
        let mut state = self.state.lock();
        state.last_position = position_millis;
        if state.last_play.is_some() {
            state.last_play = Some(Instant::now());
        }
    }

    /// Stops the frame clock and blacks out the universes.
    pub fn close(&self) {
        let blackout = {
            let mut state = self.state.lock();
            state.stop_timer();
            state.project = None;
            state.clock = None;
            state.regions.clear();
            state.last_play = None;
            state.last_position = 0;
            state.universes.iter_mut().for_each(Universe::reset);
            std::mem::take(&mut state.universes)
        };
        if !blackout.is_empty() {
            self.sink.send(&blackout);
        }
    }

    pub fn position_millis(&self) -> u64 {
        let clock = self.state.lock().clock.clone();
        if let Some(position) = clock
            .and_then(|c| c.upgrade())
            .and_then(|c| c.timeline_position())
        {
            return position;
        }
        self.state.lock().wall_position()
    }

    pub fn set_master_dimmer(&self, value: f64) {
        self.state.lock().master_dimmer = value.clamp(0.0, 1.0);
    }

    pub fn set_preview_preset(&self, preview_preset: bool) {
        self.state.lock().preview.preview_preset = preview_preset;
    }

    pub fn set_selected_preset_uuid(&self, uuid: Option<String>) {
        self.state.lock().preview.selected_preset_uuid = uuid;
    }

    pub fn set_selected_scene_uuids(&self, uuids: Vec<String>) {
        self.state.lock().preview.selected_scene_uuids = uuids;
    }

    /// Runs the frame clock for live editing without a player.
    pub fn start_preview(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.project.is_some() {
            self.start_timer(&mut state);
        }
    }

    pub fn stop_preview(&self) {
        let clock = self.state.lock().clock.clone();
        let playing = clock
            .and_then(|c| c.upgrade())
            .is_some_and(|c| c.is_playing());
        if !playing {
            self.state.lock().stop_timer();
        }
    }

    /// Computes the universes for `millis` without pushing them.
    pub fn calculate_universes(&self, millis: u64, playing: bool) -> Vec<Universe> {
        let mut state = self.state.lock();
        Self::calculate(&mut state, millis, playing);
        state.universes.clone()
    }

    fn calculate(state: &mut DesignerState, millis: u64, playing: bool) {
        let Some(project) = state.project.clone() else {
            return;
        };
        let presets = if playing {
            presets_in_time(&project, &state.regions, millis)
        } else {
            preview_presets(&project, &state.preview)
        };
        let values = fixture_property_values(&project, millis, &presets);
        let master_dimmer = state.master_dimmer;
        write_universes(&project, &values, &mut state.universes, master_dimmer);
    }

    fn start_timer(self: &Arc<Self>, state: &mut DesignerState) {
        if state.timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        state.timer = Some(
            self.scheduler
                .schedule_periodic("lighting-frame", self.frame_period, move || {
                    match weak.upgrade() {
                        Some(engine) => engine.tick(),
                        None => Ok(()),
                    }
                }),
        );
    }

    fn tick(&self) -> TaskResult {
        // The clock belongs to a player; query it without holding our own lock.
        let clock = self.state.lock().clock.clone().and_then(|c| c.upgrade());
        let (playing, external) = match &clock {
            Some(clock) => (clock.is_playing(), clock.timeline_position()),
            None => (false, None),
        };
        let universes = {
            let mut state = self.state.lock();
            if state.timer.is_none() {
                return Ok(());
            }
            let millis = external.unwrap_or_else(|| state.wall_position());
            Self::calculate(&mut state, millis, playing);
            state.universes.clone()
        };
        self.sink.send(&universes);
        Ok(())
    }
}

impl Drop for LightingDesignEngine {
    fn drop(&mut self) {
        self.state.get_mut().stop_timer();
    }
}
