use crate::types::{ActuatorFrame, Channel, NUM_CHANNELS};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

// ─── Geometry sub-tables ────────────────────────────────────────────────────

/// A closed physical range in mm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Carriage position measured from the reference bolt at the nut end and
/// at the bridge end of the fingerboard (the rail is not parallel to the
/// center line, so the two differ for the outer positions).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CarriagePos {
    pub nut: f64,
    pub bridge: f64,
}

/// The three discrete positions of the string-change carriage. Each
/// position lets the bow reach a pair of adjacent strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CarriageTable {
    pub ea: CarriagePos,
    pub ad: CarriagePos,
    pub dg: CarriagePos,
}

impl CarriageTable {
    pub fn nut(&self, idx: usize) -> f64 {
        match idx {
            0 => self.ea.nut,
            1 => self.ad.nut,
            _ => self.dg.nut,
        }
    }

    /// Largest nut-end offset from the center (AD) position.
    pub fn max_nut_deviation(&self) -> f64 {
        let c = self.ad.nut;
        (self.ea.nut - c).abs().max((self.dg.nut - c).abs())
    }

    /// Largest bridge-end offset from the center position.
    pub fn max_bridge_deviation(&self) -> f64 {
        let c = self.ad.bridge;
        (self.ea.bridge - c).abs().max((self.dg.bridge - c).abs())
    }
}

/// Finger actuator setpoints in mm. `rest` is the fully retracted
/// homing position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FingerHeights {
    pub rest: f64,
    pub on: f64,
    pub off: f64,
}

/// Everything the bow planner and the kinematic transform need to know
/// about the bowing mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BowProfile {
    /// Calibrated bow angle (radians) to contact each string, E..G
    pub angles_rad: [f64; 4],
    pub angle_rest_rad: f64,
    /// Mechanical limit on |angle|; exceeding it aborts the transform
    pub angle_limit_rad: f64,
    /// Distance from the bow center point to each differential rail (mm)
    pub rail_distance_mm: f64,
    /// Bow height range per string: min = just above the string,
    /// max = full contact without distortion. Measured at angle 0.
    pub heights_mm: [Range; 4],
    pub height_rest_mm: f64,
    /// Rotor sweep travel (mm) and park position
    pub rotor_mm: Range,
    pub rotor_rest_mm: f64,
    /// Velocity bounds in bow-lengths per second
    pub min_velocity: f64,
    pub max_velocity: f64,
    /// Extra pressure applied as the left hand moves toward the bridge
    pub vertical_deviation_mm: f64,
    /// Height offset while the finger is released (open-string contact)
    pub open_string_height_offset_mm: f64,
    /// Signed distance of each string from the bow center at the bridge
    pub string_distance_bridge_mm: [f64; 4],
    /// Bridge arch height under each string
    pub bridge_curvature_mm: [f64; 4],
}

// ─── Profile ────────────────────────────────────────────────────────────────

/// The full physical-constants table for one instrument build. Loadable
/// from JSON; the defaults are the measured values of the lab violin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Open-string notes in MIDI semitones, highest first (E A D G)
    pub tuning: [f64; 4],
    /// Semitones playable above each open string
    pub range_per_string: f64,
    /// Lowest note the instrument can produce (lowest open string)
    pub lowest_note: f64,
    /// Tonic the incoming phrases are re-centered on (MIDI)
    pub tonic: f64,

    /// Audio analysis rate the contours were extracted at
    pub sample_rate: f64,
    /// Samples per control tick
    pub hop_size: usize,

    pub scale_length_mm: f64,
    pub nut_offset_mm: f64,
    pub fingerboard_length_mm: f64,
    /// Frets are clamped to this minimum so the finger never lands
    /// exactly on the nut
    pub min_fret: f64,
    /// Frets below this are treated as open-string notes
    pub open_string_fret_eps: f64,
    /// String clearance above the fingerboard at its bridge end (mm)
    pub string_height_end_mm: f64,

    pub finger_press_time_ms: f64,
    pub string_change_time_ms: f64,

    pub finger: FingerHeights,
    pub carriage: CarriageTable,
    pub bow: BowProfile,

    /// Encoder ticks per 90-degree turn, per channel
    pub encoder_ticks_per_turn: [u32; NUM_CHANNELS],
    /// Physical-unit → encoder-tick scale per channel. Derived from the
    /// encoder resolution and gear radii; override only for diagnostics.
    pub ticks_per_unit: [f64; NUM_CHANNELS],

    /// Frames per wire chunk (stop-and-wait window)
    pub chunk_frames: usize,
    /// Control/data port of the device
    pub device_port: u16,

    /// Shortest string segment the planner will keep, in ticks
    pub min_segment_ticks: usize,
    /// Length of the transition blend prepended before a phrase, in ticks
    pub transition_ticks: usize,
}

const GT2_PULLEY_RADIUS_MM: f64 = 5.05;
const FINGER_GEAR_RADIUS_MM: f64 = 12.0;
const BOW_GEAR_RADIUS_MM: f64 = 6.35;

fn ticks_per_mm(ticks_per_turn: u32, gear_radius_mm: f64) -> f64 {
    // quadrature-decoded counts over one full wheel circumference
    ticks_per_turn as f64 * 4.0 / (2.0 * PI * gear_radius_mm)
}

impl Default for Profile {
    fn default() -> Self {
        let encoder_ticks_per_turn = [2048, 1024, 1024, 1024, 1024, 1024, 1024];
        let mut ticks_per_unit = [0.0; NUM_CHANNELS];
        ticks_per_unit[Channel::Finger.index()] =
            ticks_per_mm(encoder_ticks_per_turn[0], FINGER_GEAR_RADIUS_MM);
        ticks_per_unit[Channel::StringChange.index()] =
            ticks_per_mm(encoder_ticks_per_turn[1], GT2_PULLEY_RADIUS_MM);
        ticks_per_unit[Channel::LeftHand.index()] =
            ticks_per_mm(encoder_ticks_per_turn[2], GT2_PULLEY_RADIUS_MM);
        ticks_per_unit[Channel::BowDiffLeft.index()] =
            ticks_per_mm(encoder_ticks_per_turn[3], GT2_PULLEY_RADIUS_MM);
        ticks_per_unit[Channel::BowDiffRight.index()] =
            ticks_per_mm(encoder_ticks_per_turn[4], GT2_PULLEY_RADIUS_MM);
        // the slide channel is commanded as a plain fraction of travel
        ticks_per_unit[Channel::BowSlide.index()] = 1000.0;
        ticks_per_unit[Channel::BowRotor.index()] =
            ticks_per_mm(encoder_ticks_per_turn[6], BOW_GEAR_RADIUS_MM);

        let center_line = 26.0;
        Self {
            tuning: [74.0, 69.0, 62.0, 57.0],
            range_per_string: 14.0,
            lowest_note: 57.0,
            tonic: 50.0, // D3
            sample_rate: 16000.0,
            hop_size: 160,
            scale_length_mm: 335.0,
            nut_offset_mm: 14.0,
            fingerboard_length_mm: 270.0,
            min_fret: 0.3,
            open_string_fret_eps: 0.5,
            string_height_end_mm: 7.5,
            finger_press_time_ms: 50.0,
            string_change_time_ms: 150.0,
            finger: FingerHeights {
                rest: 0.0,
                on: 19.5,
                off: 10.0,
            },
            carriage: CarriageTable {
                ea: CarriagePos {
                    nut: center_line + 5.0,
                    bridge: center_line + 14.0,
                },
                ad: CarriagePos {
                    nut: center_line,
                    bridge: center_line,
                },
                dg: CarriagePos {
                    nut: center_line - 5.5,
                    bridge: center_line - 14.0,
                },
            },
            bow: BowProfile {
                angles_rad: [
                    -22.0 * PI / 180.0,
                    -4.75 * PI / 180.0,
                    4.75 * PI / 180.0,
                    25.0 * PI / 180.0,
                ],
                angle_rest_rad: 0.0,
                angle_limit_rad: PI / 4.0,
                rail_distance_mm: 72.0,
                heights_mm: [
                    Range {
                        min: 47.0,
                        max: 50.0,
                    },
                    Range {
                        min: 57.0,
                        max: 59.5,
                    },
                    Range {
                        min: 57.0,
                        max: 59.0,
                    },
                    Range {
                        min: 47.0,
                        max: 52.0,
                    },
                ],
                height_rest_mm: 46.0,
                rotor_mm: Range {
                    min: 0.0,
                    max: 380.0,
                },
                rotor_rest_mm: 0.0,
                min_velocity: 0.15,
                max_velocity: 1.0,
                vertical_deviation_mm: 3.0,
                open_string_height_offset_mm: -0.25,
                string_distance_bridge_mm: [16.9, 5.6, -5.6, -16.9],
                bridge_curvature_mm: [2.0, 0.0, 0.0, 2.0],
            },
            encoder_ticks_per_turn,
            ticks_per_unit,
            chunk_frames: 25,
            device_port: 8888,
            min_segment_ticks: 100,
            transition_ticks: 50,
        }
    }
}

impl Profile {
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Seconds per control tick.
    pub fn tick_duration(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate
    }

    /// Milliseconds → whole control ticks.
    pub fn ms_to_ticks(&self, ms: f64) -> usize {
        (ms / (self.tick_duration() * 1000.0)).round() as usize
    }

    /// Ticks the finger needs to press or release.
    pub fn press_ticks(&self) -> usize {
        self.ms_to_ticks(self.finger_press_time_ms).max(1)
    }

    /// Ticks the carriage needs to move between adjacent positions.
    pub fn string_change_ticks(&self) -> usize {
        self.ms_to_ticks(self.string_change_time_ms).max(1)
    }

    /// The homed physical position of every actuator.
    pub fn rest_frame(&self) -> ActuatorFrame {
        let mut f = [0.0; NUM_CHANNELS];
        f[Channel::Finger.index()] = self.finger.rest;
        f[Channel::StringChange.index()] = self.carriage.ad.nut;
        f[Channel::LeftHand.index()] = 0.0;
        f[Channel::BowDiffLeft.index()] = self.bow.height_rest_mm;
        f[Channel::BowDiffRight.index()] = self.bow.angle_rest_rad;
        f[Channel::BowSlide.index()] = 0.0;
        f[Channel::BowRotor.index()] = self.bow.rotor_rest_mm;
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_tick_duration() {
        let p = Profile::default();
        assert_relative_eq!(p.tick_duration(), 0.01, epsilon = 1e-12);
        assert_eq!(p.press_ticks(), 5);
        assert_eq!(p.string_change_ticks(), 15);
    }

    #[test]
    fn test_ticks_per_unit_derivation() {
        let p = Profile::default();
        // finger: 2048 * 4 / (2π * 12.0)
        assert_relative_eq!(
            p.ticks_per_unit[Channel::Finger.index()],
            2048.0 * 4.0 / (2.0 * PI * 12.0),
            epsilon = 1e-9
        );
        assert_eq!(p.ticks_per_unit[Channel::BowSlide.index()], 1000.0);
    }

    #[test]
    fn test_carriage_deviations() {
        let p = Profile::default();
        assert_relative_eq!(p.carriage.max_nut_deviation(), 5.5);
        assert_relative_eq!(p.carriage.max_bridge_deviation(), 14.0);
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let p = Profile::default();
        let json = serde_json::to_string(&p).unwrap();
        let q: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(q.tuning, p.tuning);
        assert_eq!(q.chunk_frames, p.chunk_frames);
        assert_relative_eq!(q.bow.angle_limit_rad, p.bow.angle_limit_rad);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let q: Profile = serde_json::from_str(r#"{"chunk_frames": 10}"#).unwrap();
        assert_eq!(q.chunk_frames, 10);
        assert_eq!(q.tuning, Profile::default().tuning);
    }

    #[test]
    fn test_rest_frame_layout() {
        let p = Profile::default();
        let f = p.rest_frame();
        assert_eq!(f[Channel::Finger.index()], 0.0);
        assert_eq!(f[Channel::StringChange.index()], 26.0);
        assert_eq!(f[Channel::BowDiffLeft.index()], 46.0);
        assert_eq!(f[Channel::BowRotor.index()], 0.0);
    }
}
