use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Actuator channels ──────────────────────────────────────────────────────

/// The seven actuator channels, in wire order. The device expects every
/// frame as seven u16 values in exactly this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Finger press height (mm)
    Finger = 0,
    /// String-change carriage position (mm from reference bolt)
    StringChange = 1,
    /// Left-hand fretting position along the fingerboard (mm)
    LeftHand = 2,
    /// Left half of the bow height/angle differential pair (mm)
    BowDiffLeft = 3,
    /// Right half of the differential pair. Before the differential
    /// transform this slot carries the bow angle in radians.
    BowDiffRight = 4,
    /// Auxiliary bow-slide axis (fraction of travel)
    BowSlide = 5,
    /// Bow rotor sweep position (mm)
    BowRotor = 6,
}

pub const NUM_CHANNELS: usize = 7;

impl Channel {
    pub const ALL: [Channel; NUM_CHANNELS] = [
        Channel::Finger,
        Channel::StringChange,
        Channel::LeftHand,
        Channel::BowDiffLeft,
        Channel::BowDiffRight,
        Channel::BowSlide,
        Channel::BowRotor,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// One control tick of physical setpoints, indexed by [`Channel`].
/// Units are mm, except BowDiffRight (radians, pre-differential) and
/// BowSlide (fraction of travel).
pub type ActuatorFrame = [f64; NUM_CHANNELS];

// ─── Pitch contour ──────────────────────────────────────────────────────────

/// Per-tick pitch values in MIDI semitones. Invalid samples (silence or
/// untracked pitch) are tagged rather than carried as NaN sentinels so
/// arithmetic downstream never touches them by accident.
#[derive(Debug, Clone)]
pub struct PitchContour {
    samples: Vec<Option<f64>>,
}

impl PitchContour {
    /// Tracker output uses values near zero (or NaN/inf) for untracked
    /// ticks; anything at or below this is treated as invalid.
    pub const VALID_FLOOR: f64 = 10.0;

    pub fn from_raw(raw: &[f64]) -> Self {
        let samples = raw
            .iter()
            .map(|&p| {
                if p.is_finite() && p > Self::VALID_FLOOR {
                    Some(p)
                } else {
                    None
                }
            })
            .collect();
        Self { samples }
    }

    pub fn from_samples(samples: Vec<Option<f64>>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Option<f64>] {
        &self.samples
    }

    /// Smallest valid pitch, if any sample is valid.
    pub fn min_valid(&self) -> Option<f64> {
        self.samples
            .iter()
            .flatten()
            .cloned()
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.min(p))))
    }

    /// Shift every valid sample by `semitones`.
    pub fn shift(&mut self, semitones: f64) {
        for s in self.samples.iter_mut().flatten() {
            *s += semitones;
        }
    }
}

// ─── Planner intervals ──────────────────────────────────────────────────────

/// A contiguous tick range assigned to one open string.
/// Segments produced by the planner partition `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StringSegment {
    pub start: usize,
    /// Exclusive
    pub end: usize,
    /// Open-string id, 0 = highest (E) through 3 = lowest (G)
    pub string: usize,
    /// Highest pitch occurring inside the segment
    pub max_pitch: f64,
}

impl StringSegment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for StringSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}) string {} max {:.2}",
            self.start, self.end, self.string, self.max_pitch
        )
    }
}

/// A candidate tick at which the bow's travel direction may reverse.
/// `valid == false` marks the start of a frozen (rest) interval where
/// the bow must not move at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BowChange {
    pub tick: usize,
    pub valid: bool,
}

/// A tick range with no valid pitch. Fingering and bowing are suspended
/// across the whole range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestInterval {
    pub start: usize,
    /// Exclusive
    pub end: usize,
}

impl RestInterval {
    pub fn contains(&self, tick: usize) -> bool {
        tick >= self.start && tick < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

// ─── Bow direction ──────────────────────────────────────────────────────────

/// Travel direction of the bow rotor. Down moves toward the rotor
/// maximum, up toward the minimum. Persists across performances so
/// physical bow motion stays continuous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BowDirection {
    Down,
    Up,
}

impl BowDirection {
    pub fn flip(self) -> Self {
        match self {
            BowDirection::Down => BowDirection::Up,
            BowDirection::Up => BowDirection::Down,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            BowDirection::Down => 1.0,
            BowDirection::Up => -1.0,
        }
    }
}

// ─── Robot state ────────────────────────────────────────────────────────────

/// The boundary condition between successive performances: the physical
/// position of every actuator after the last transmitted frame, plus the
/// bow direction the last phrase ended on. Owned by the `Performer` and
/// updated exactly once per `perform` call.
#[derive(Debug, Clone, Copy)]
pub struct RobotState {
    pub position: ActuatorFrame,
    pub bow_direction: BowDirection,
}

impl RobotState {
    pub fn new(position: ActuatorFrame) -> Self {
        Self {
            position,
            // Convention is to start a performance on a down bow, so the
            // state a fresh robot reports is "last stroke was up".
            bow_direction: BowDirection::Up,
        }
    }
}

// ─── Motor command ──────────────────────────────────────────────────────────

/// A trajectory converted to unsigned encoder-tick units, ready for the
/// wire. Immutable once produced; owned by the delivery layer until sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorCommand {
    frames: Vec<[u16; NUM_CHANNELS]>,
}

impl MotorCommand {
    pub const BYTES_PER_FRAME: usize = NUM_CHANNELS * 2;

    pub fn new(frames: Vec<[u16; NUM_CHANNELS]>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[[u16; NUM_CHANNELS]] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Split into wire chunks of at most `chunk_frames` frames each,
    /// u16 little-endian per channel, no padding on the final chunk.
    pub fn chunk_bytes(&self, chunk_frames: usize) -> Vec<Vec<u8>> {
        assert!(chunk_frames > 0, "chunk size must be positive");
        self.frames
            .chunks(chunk_frames)
            .map(|frames| {
                let mut buf = vec![0u8; frames.len() * Self::BYTES_PER_FRAME];
                for (i, frame) in frames.iter().enumerate() {
                    LittleEndian::write_u16_into(
                        frame,
                        &mut buf[i * Self::BYTES_PER_FRAME..(i + 1) * Self::BYTES_PER_FRAME],
                    );
                }
                buf
            })
            .collect()
    }

    /// Decode frames from wire bytes. Trailing partial frames are dropped.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let n = buf.len() / Self::BYTES_PER_FRAME;
        let mut frames = Vec::with_capacity(n);
        for i in 0..n {
            let mut frame = [0u16; NUM_CHANNELS];
            LittleEndian::read_u16_into(
                &buf[i * Self::BYTES_PER_FRAME..(i + 1) * Self::BYTES_PER_FRAME],
                &mut frame,
            );
            frames.push(frame);
        }
        Self { frames }
    }
}
