use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Capabilities an effect can drive.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum EffectChannel {
    Dimmer,
    Pan,
    Tilt,
    ColorRed,
    ColorGreen,
    ColorBlue,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CurveShape {
    #[default]
    Sine,
    Square,
    Triangle,
    Sawtooth,
}

impl CurveShape {
    /// Curve value in 0..=1 for a phase in 0..1.
    fn sample(&self, phase: f64) -> f64 {
        match self {
            CurveShape::Sine => (1.0 - (phase * TAU).cos()) / 2.0,
            CurveShape::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
            CurveShape::Triangle => 1.0 - (2.0 * phase - 1.0).abs(),
            CurveShape::Sawtooth => phase,
        }
    }
}

/// A parametric curve applied to some capabilities of a preset's fixtures.
///
/// Each fixture samples the curve shifted by `phasing_millis` times its chase
/// index, so the same effect ripples across a row of fixtures.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Effect {
    pub effect_channels: Vec<EffectChannel>,
    #[serde(default)]
    pub shape: CurveShape,
    pub period_millis: u64,
    #[serde(default)]
    pub phase_millis: u64,
    #[serde(default)]
    pub phasing_millis: u64,
    #[serde(default)]
    pub min_value: f64,
    #[serde(default = "full")]
    pub max_value: f64,
}

fn full() -> f64 {
    255.0
}

impl Effect {
    /// Value in 0..=255 at `millis` for the fixture at `chase_index`.
    pub fn value(&self, millis: u64, chase_index: usize) -> f64 {
        let low = self.min_value.clamp(0.0, 255.0);
        let high = self.max_value.clamp(0.0, 255.0);
        if self.period_millis == 0 {
            return high;
        }
        let shifted = millis
            .saturating_add(self.phase_millis)
            .saturating_add(self.phasing_millis.saturating_mul(chase_index as u64));
        let phase = (shifted % self.period_millis) as f64 / self.period_millis as f64;
        low + (high - low) * self.shape.sample(phase)
    }
}
