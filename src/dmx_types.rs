//! Lighting project model
//!
//! Static data the lighting design engine works from:
//!
//! ## Fixtures
//! - [`FixtureTemplate`] - A type of fixture with its available channels and modes
//! - [`FixtureMode`] - One channel layout of a template
//! - [`FixtureChannel`] - A channel's capability, default value and fine aliases
//! - [`Fixture`] - A patched fixture instance
//!
//! ## Capabilities
//! - [`CapabilityType`] - What a channel controls
//! - [`CapabilityColor`] - The color of a color-intensity channel
//! - [`FixtureCapabilityValue`] - A value for one (type, color) capability
//!
//! ## Timeline
//! - [`Preset`] - Capability values and effects for a set of fixtures
//! - [`Scene`] - An ordered group of presets with its own fades
//! - [`ScenePlaybackRegion`] - Where a scene sits on a composition timeline
//! - [`Project`] - Everything above, plus the compositions it lights

pub use open_dmx::DMX_CHANNELS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::effect::Effect;

/// Function of a fixture channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, strum::Display)]
pub enum CapabilityType {
    /// Dimmer, scaled by the master dimmer
    Intensity,
    /// One color component of an additive or subtractive mix
    ColorIntensity,
    /// Color wheel or macro slot
    ColorPreset,
    ShutterStrobe,
    /// Horizontal movement for moving heads
    Pan,
    PanContinuous,
    /// Vertical movement for moving heads
    Tilt,
    TiltContinuous,
    PanTiltSpeed,
    WheelSlot,
    WheelShake,
    WheelRotation,
    Effect,
    BeamAngle,
    Focus,
    Zoom,
    Iris,
    Frost,
    Prism,
    Rotation,
    Speed,
    Maintenance,
    Generic,
    NoFunction,
}

/// Color of a [`CapabilityType::ColorIntensity`] channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, strum::Display)]
pub enum CapabilityColor {
    Red,
    Green,
    Blue,
    Cyan,
    Magenta,
    Yellow,
    Amber,
    White,
    WarmWhite,
    ColdWhite,
    #[serde(rename = "UV")]
    Uv,
    Lime,
    Indigo,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct FixtureCapability {
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    #[serde(default)]
    pub color: Option<CapabilityColor>,
}

impl FixtureCapability {
    pub fn new(capability_type: CapabilityType, color: Option<CapabilityColor>) -> Self {
        Self {
            capability_type,
            color,
        }
    }

    /// Whether a value for this capability drives `other`. A value without a
    /// color applies to every color of its type.
    pub fn accepts(&self, value: &FixtureCapabilityValue) -> bool {
        self.capability_type == value.capability_type
            && (value.color.is_none() || value.color == self.color)
    }
}

/// A capability value in the 0-255 range. Fractions carry the precision
/// used by fine channels.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize, Debug)]
pub struct FixtureCapabilityValue {
    pub value: f64,
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    #[serde(default)]
    pub color: Option<CapabilityColor>,
}

impl FixtureCapabilityValue {
    pub fn new(value: f64, capability_type: CapabilityType, color: Option<CapabilityColor>) -> Self {
        Self {
            value,
            capability_type,
            color,
        }
    }

    /// Same blending slot: equal type, and equal color unless this value has none.
    pub fn same_slot(&self, other: &FixtureCapabilityValue) -> bool {
        self.capability_type == other.capability_type
            && (self.color.is_none() || self.color == other.color)
    }
}

/// A channel default, either a raw DMX value over the full fine range
/// (`"32768"`) or a percentage (`"50%"`).
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum DefaultValue {
    Raw(f64),
    Text(String),
}

/// A channel a template makes available to its modes.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct FixtureChannel {
    pub capability: FixtureCapability,
    #[serde(default)]
    pub default_value: Option<DefaultValue>,
    /// Names under which modes reference the finer bytes of this channel
    /// (e.g. `["Pan fine"]` for 16-bit pan)
    #[serde(default)]
    pub fine_channel_aliases: Vec<String>,
}

impl FixtureChannel {
    pub fn new(capability_type: CapabilityType, color: Option<CapabilityColor>) -> Self {
        Self {
            capability: FixtureCapability::new(capability_type, color),
            default_value: None,
            fine_channel_aliases: Vec::new(),
        }
    }

    /// The default in the 0-255 capability range. Unparsable defaults are ignored.
    pub fn default_capability_value(&self) -> Option<f64> {
        let raw = match self.default_value.as_ref()? {
            DefaultValue::Raw(v) => *v,
            DefaultValue::Text(text) => {
                let text = text.trim();
                if let Some(percent) = text.strip_suffix('%') {
                    let percent: f64 = percent.trim().parse().ok()?;
                    return Some(255.0 / 100.0 * percent);
                }
                text.parse().ok()?
            }
        };
        let max = 256f64.powi(1 + self.fine_channel_aliases.len() as i32) - 1.0;
        Some(raw / max * 255.0)
    }
}

/// One channel layout of a template. `None` entries are placeholders for
/// slots without a function; they still occupy a DMX address.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct FixtureMode {
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    pub channels: Vec<Option<String>>,
}

impl FixtureMode {
    /// The name fixtures use to select this mode: the short name when it has one.
    pub fn key(&self) -> &str {
        match self.short_name.as_deref() {
            Some(short) if !short.is_empty() => short,
            _ => &self.name,
        }
    }
}

/// A fixture type. Channels are keyed by name; modes list those names.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct FixtureTemplate {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub available_channels: BTreeMap<String, FixtureChannel>,
    #[serde(default)]
    pub modes: Vec<FixtureMode>,
}

impl FixtureTemplate {
    pub fn mode(&self, key: &str) -> Option<&FixtureMode> {
        self.modes.iter().find(|m| m.key() == key)
    }

    /// Looks up a mode entry either by channel key or by one of its fine aliases.
    pub fn channel_for(&self, mode_entry: &str) -> Option<(&str, &FixtureChannel)> {
        self.available_channels
            .iter()
            .find(|(key, channel)| {
                key.as_str() == mode_entry
                    || channel.fine_channel_aliases.iter().any(|a| a == mode_entry)
            })
            .map(|(key, channel)| (key.as_str(), channel))
    }
}

/// A patched fixture instance.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Fixture {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub template_uuid: String,
    /// Universe this fixture is patched into. Empty means the first universe.
    #[serde(default)]
    pub universe_uuid: String,
    /// First DMX channel (1-based)
    pub dmx_first_channel: u16,
    pub mode_short_name: String,
}

/// Capability values and effects applied to a set of fixtures.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Preset {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    /// Referenced fixtures. Their project order defines the chase index.
    #[serde(default)]
    pub fixture_uuids: Vec<String>,
    #[serde(default)]
    pub capability_values: Vec<FixtureCapabilityValue>,
    #[serde(default)]
    pub effects: Vec<Effect>,
    /// Start relative to the region start, `None` for the region start itself
    #[serde(default)]
    pub start_millis: Option<u64>,
    /// End relative to the region start, `None` for the region end itself
    #[serde(default)]
    pub end_millis: Option<u64>,
    #[serde(default)]
    pub fade_in_millis: u64,
    #[serde(default)]
    pub fade_out_millis: u64,
}

/// An ordered group of presets.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Scene {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub preset_uuids: Vec<String>,
    #[serde(default)]
    pub fade_in_millis: u64,
    #[serde(default)]
    pub fade_out_millis: u64,
}

/// Places a scene on a composition timeline, absolute milliseconds.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ScenePlaybackRegion {
    pub scene_uuid: String,
    pub start_millis: u64,
    pub end_millis: u64,
}

impl ScenePlaybackRegion {
    pub fn contains(&self, millis: u64) -> bool {
        self.start_millis <= millis && millis <= self.end_millis
    }
}

/// The regions of one composition lit by a project.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ProjectComposition {
    pub composition_name: String,
    #[serde(default)]
    pub scene_playback_regions: Vec<ScenePlaybackRegion>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Debug)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub fixture_templates: Vec<FixtureTemplate>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub compositions: Vec<ProjectComposition>,
}

impl Project {
    pub fn fixture(&self, uuid: &str) -> Option<&Fixture> {
        self.fixtures.iter().find(|f| f.uuid == uuid)
    }

    pub fn template(&self, uuid: &str) -> Option<&FixtureTemplate> {
        self.fixture_templates.iter().find(|t| t.uuid == uuid)
    }

    pub fn preset(&self, uuid: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.uuid == uuid)
    }

    pub fn composition(&self, name: &str) -> Option<&ProjectComposition> {
        self.compositions.iter().find(|c| c.composition_name == name)
    }

    pub fn template_and_mode(&self, fixture: &Fixture) -> Option<(&FixtureTemplate, &FixtureMode)> {
        let template = self.template(&fixture.template_uuid)?;
        let mode = template.mode(&fixture.mode_short_name)?;
        Some((template, mode))
    }

    /// Universe uuids in first-use order.
    pub fn universe_uuids(&self) -> Vec<String> {
        let mut uuids: Vec<String> = Vec::new();
        for fixture in &self.fixtures {
            if !uuids.contains(&fixture.universe_uuid) {
                uuids.push(fixture.universe_uuid.clone());
            }
        }
        uuids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_default_scales_to_255() {
        let mut channel = FixtureChannel::new(CapabilityType::Intensity, None);
        channel.default_value = Some(DefaultValue::Text("50%".into()));
        assert_eq!(channel.default_capability_value(), Some(127.5));
    }

    #[test]
    fn raw_default_uses_fine_range() {
        let mut channel = FixtureChannel::new(CapabilityType::Pan, None);
        channel.default_value = Some(DefaultValue::Raw(255.0));
        assert_eq!(channel.default_capability_value(), Some(255.0));

        channel.fine_channel_aliases = vec!["Pan fine".into()];
        channel.default_value = Some(DefaultValue::Text("65535".into()));
        assert_eq!(channel.default_capability_value(), Some(255.0));

        channel.default_value = Some(DefaultValue::Text("bogus".into()));
        assert_eq!(channel.default_capability_value(), None);
    }

    #[test]
    fn mode_selected_by_short_name_then_name() {
        let template = FixtureTemplate {
            uuid: "t".into(),
            name: "Par".into(),
            available_channels: BTreeMap::new(),
            modes: vec![
                FixtureMode {
                    name: "3 channel".into(),
                    short_name: Some("3ch".into()),
                    channels: vec![],
                },
                FixtureMode {
                    name: "Basic".into(),
                    short_name: None,
                    channels: vec![],
                },
            ],
        };
        assert_eq!(template.mode("3ch").map(|m| m.name.as_str()), Some("3 channel"));
        assert!(template.mode("3 channel").is_none());
        assert!(template.mode("Basic").is_some());
    }

    #[test]
    fn colorless_value_accepted_by_every_color() {
        let red = FixtureCapability::new(CapabilityType::ColorIntensity, Some(CapabilityColor::Red));
        let any = FixtureCapabilityValue::new(10.0, CapabilityType::ColorIntensity, None);
        let blue = FixtureCapabilityValue::new(
            10.0,
            CapabilityType::ColorIntensity,
            Some(CapabilityColor::Blue),
        );
        assert!(red.accepts(&any));
        assert!(!red.accepts(&blue));
    }

    #[test]
    fn project_parses_from_json() {
        let project: Project = serde_json::from_str(
            r#"{
                "name": "Tour",
                "fixtures": [{"uuid": "f1", "template_uuid": "t1", "dmx_first_channel": 1, "mode_short_name": "3ch"}],
                "fixture_templates": [{
                    "uuid": "t1", "name": "Par",
                    "available_channels": {
                        "Red": {"capability": {"type": "ColorIntensity", "color": "Red"}, "default_value": "0"}
                    },
                    "modes": [{"name": "3 channel", "short_name": "3ch", "channels": ["Red", null]}]
                }],
                "compositions": [{"composition_name": "Intro"}]
            }"#,
        )
        .unwrap();
        let fixture = project.fixture("f1").unwrap();
        let (_, mode) = project.template_and_mode(fixture).unwrap();
        assert_eq!(mode.channels, vec![Some("Red".to_string()), None]);
        assert_eq!(project.universe_uuids(), vec![String::new()]);
        assert!(project.composition("Intro").unwrap().scene_playback_regions.is_empty());
    }
}
