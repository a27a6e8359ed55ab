//! Top level: preprocess a phrase, run both planners, assemble the
//! 7-channel trajectory, encode it and hand it to the device link.

use log::{debug, info};
use serde::Deserialize;

use crate::bowing::{BowOptions, BowPlanner};
use crate::config::Profile;
use crate::error::{PerformError, PlanError};
use crate::fingerboard::{FingerboardOptions, FingerboardPlanner};
use crate::kinematics;
use crate::link::TrajectorySink;
use crate::signal;
use crate::types::{
    ActuatorFrame, Channel, MotorCommand, PitchContour, RestInterval, RobotState, NUM_CHANNELS,
};

/// One phrase as delivered by the analysis front end: a pitch contour
/// (semitones, non-positive or non-finite = untracked) and an amplitude
/// envelope in `[0, 1)`, both at the control tick rate.
#[derive(Debug, Clone, Deserialize)]
pub struct Phrase {
    pub pitches: Vec<f64>,
    pub envelope: Vec<f64>,
}

/// Per-performance switches. The defaults reproduce the plainest
/// rendition: no transition blend, no compression, detector-driven bow
/// changes.
#[derive(Debug, Clone, Default)]
pub struct PerformOptions {
    /// Tonic the phrase was sung/played in (MIDI); when set, the
    /// contour is re-centered onto the instrument's configured tonic.
    pub phrase_tonic: Option<f64>,
    /// Blend from the robot's current position into the first frame.
    pub add_transition: bool,
    pub interpolate_start: bool,
    pub interpolate_end: bool,
    pub release_open_strings: bool,
    /// Precomputed bow reversal ticks, bypassing the envelope detector.
    pub bow_changes: Option<Vec<usize>>,
    /// Envelope compression factor in `[0, 1)`.
    pub amplitude_compression: f64,
    pub velocity_scaled_height: bool,
}

/// Owns the device link and the cross-performance state (position and
/// bow direction). `perform` takes `&mut self`: one performance at a
/// time, by construction.
pub struct Performer {
    profile: Profile,
    state: RobotState,
    sink: Option<Box<dyn TrajectorySink>>,
}

impl Performer {
    pub fn new(profile: Profile) -> Self {
        let state = RobotState::new(profile.rest_frame());
        Self {
            profile,
            state,
            sink: None,
        }
    }

    pub fn with_link(profile: Profile, sink: Box<dyn TrajectorySink>) -> Self {
        let mut p = Self::new(profile);
        p.sink = Some(sink);
        p
    }

    pub fn state(&self) -> &RobotState {
        &self.state
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Send the homing defaults and the HOME command.
    pub fn home(&mut self) -> Result<(), PerformError> {
        let defaults = kinematics::to_motor(&[self.profile.rest_frame()], &self.profile)?;
        let frame = defaults.frames()[0];
        if let Some(sink) = &self.sink {
            sink.home(&frame)?;
        }
        Ok(())
    }

    /// Halt the device and drop the link.
    pub fn terminate(&mut self) -> Result<(), PerformError> {
        if let Some(mut sink) = self.sink.take() {
            sink.terminate()?;
        }
        Ok(())
    }

    /// Re-read the device's actual positions into `RobotState`. Only
    /// needed when a trajectory discontinuity is suspected.
    pub fn resync(&mut self) -> Result<(), PerformError> {
        let sink = self.sink.as_ref().ok_or(crate::error::LinkError::NotConnected)?;
        let ticks = sink.current_values()?;
        let frames = kinematics::from_motor(&[ticks], &self.profile);
        self.state.position = frames[0];
        info!("state resynced from device");
        Ok(())
    }

    // ─── Preprocessing ──────────────────────────────────────────────────

    /// Octave-shift the contour up until every valid sample is at or
    /// above the lowest open string, bridge the gaps, smooth, and
    /// re-center on the configured tonic.
    fn preprocess(
        &self,
        raw_pitches: &[f64],
        options: &PerformOptions,
    ) -> Result<(Vec<f64>, Vec<RestInterval>), PlanError> {
        let mut contour = PitchContour::from_raw(raw_pitches);
        let min = contour.min_valid().ok_or(PlanError::EmptySeries)?;
        if min < self.profile.lowest_note {
            let octaves = ((self.profile.lowest_note - min) / 12.0).ceil();
            debug!("transposing up {} octave(s)", octaves);
            contour.shift(12.0 * octaves);
        }

        let (filled, rests) = signal::interpolate_gaps(contour.samples())?;
        let mut smoothed = signal::smooth_zero_phase(&filled, 0.3, true);

        if let Some(phrase_tonic) = options.phrase_tonic {
            let offset = self.profile.tonic - phrase_tonic;
            for v in smoothed.iter_mut() {
                *v += offset;
            }
        }
        Ok((smoothed, rests))
    }

    // ─── Planning ───────────────────────────────────────────────────────

    /// Produce the full physical 7-channel trajectory for a phrase,
    /// without touching the link or the persistent state.
    pub fn plan(
        &self,
        phrase: &Phrase,
        options: &PerformOptions,
    ) -> Result<(Vec<ActuatorFrame>, RobotState), PerformError> {
        if phrase.pitches.len() != phrase.envelope.len() {
            return Err(PlanError::LengthMismatch {
                left: phrase.pitches.len(),
                right: phrase.envelope.len(),
            }
            .into());
        }

        let (pitches, rests) = self.preprocess(&phrase.pitches, options)?;
        let boundaries = signal::stationary_points(&pitches, 0.1).merged();

        let fb = FingerboardPlanner::new(&self.profile);
        let fb_plan = fb.plan(
            &pitches,
            &rests,
            &boundaries,
            &FingerboardOptions {
                interpolate_start: options.interpolate_start,
                interpolate_end: options.interpolate_end,
                release_open_strings: options.release_open_strings,
            },
        )?;

        let bow = BowPlanner::new(&self.profile);
        let bow_plan = bow.plan(
            &phrase.envelope,
            &fb_plan.segments,
            &fb_plan.released,
            &rests,
            &boundaries,
            &self.state,
            &BowOptions {
                bow_changes: options.bow_changes.clone(),
                amplitude_compression: options.amplitude_compression,
                velocity_scaled_height: options.velocity_scaled_height,
                ..Default::default()
            },
        )?;

        let n = pitches.len();
        let mut frames = vec![[0.0; NUM_CHANNELS]; n];
        for t in 0..n {
            frames[t][Channel::Finger.index()] = fb_plan.finger[t];
            frames[t][Channel::StringChange.index()] = fb_plan.carriage[t];
            frames[t][Channel::LeftHand.index()] = fb_plan.left_hand[t];
            frames[t][Channel::BowDiffLeft.index()] = bow_plan.height[t];
            frames[t][Channel::BowDiffRight.index()] = bow_plan.angle[t];
            frames[t][Channel::BowRotor.index()] = bow_plan.rotor[t];
            // the slide channel is derived inside the encoder
        }

        if options.add_transition {
            frames = self.add_transition(frames);
        }

        let end_state = RobotState {
            position: *frames.last().ok_or(PlanError::EmptySeries)?,
            bow_direction: bow_plan.direction,
        };
        Ok((frames, end_state))
    }

    /// Prepend a blend from the robot's current position to the first
    /// planned frame, so back-to-back phrases stay continuous.
    fn add_transition(&self, frames: Vec<ActuatorFrame>) -> Vec<ActuatorFrame> {
        let len = self.profile.transition_ticks;
        let first = match frames.first() {
            Some(f) => *f,
            None => return frames,
        };
        let mut out = Vec::with_capacity(len + frames.len());
        let mut lead = vec![[0.0; NUM_CHANNELS]; len];
        for c in 0..NUM_CHANNELS {
            let curve = signal::parabolic_blend(self.state.position[c], first[c], len, 0.2);
            for (t, &v) in curve.iter().enumerate() {
                lead[t][c] = v;
            }
        }
        out.extend_from_slice(&lead);
        out.extend_from_slice(&frames);
        out
    }

    // ─── Performance ────────────────────────────────────────────────────

    /// Plan, encode and queue one phrase, then advance the persistent
    /// state to the end of that phrase.
    pub fn perform(
        &mut self,
        phrase: &Phrase,
        options: &PerformOptions,
    ) -> Result<MotorCommand, PerformError> {
        let (frames, end_state) = self.plan(phrase, options)?;
        let command = kinematics::to_motor(&frames, &self.profile)?;

        info!(
            "performing {} frame(s), ending {:?} bow",
            command.len(),
            end_state.bow_direction
        );
        if let Some(sink) = &self.sink {
            sink.enqueue(&command)?;
        }
        self.state = end_state;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BowDirection;
    use approx::assert_relative_eq;

    fn phrase_constant(pitch: f64, n: usize, env: f64) -> Phrase {
        Phrase {
            pitches: vec![pitch; n],
            envelope: vec![env; n],
        }
    }

    #[test]
    fn test_perform_rejects_mismatched_lengths() {
        let mut p = Performer::new(Profile::default());
        let phrase = Phrase {
            pitches: vec![62.0; 10],
            envelope: vec![0.5; 9],
        };
        assert!(p.perform(&phrase, &PerformOptions::default()).is_err());
    }

    #[test]
    fn test_perform_all_invalid_fails() {
        let mut p = Performer::new(Profile::default());
        let phrase = phrase_constant(0.0, 50, 0.0);
        assert!(p.perform(&phrase, &PerformOptions::default()).is_err());
    }

    #[test]
    fn test_preprocess_transposes_into_range() {
        let p = Performer::new(Profile::default());
        // an octave below the G string: one shift brings 45 to 57 exactly
        let (pitches, _) = p
            .preprocess(&vec![45.0; 20], &PerformOptions::default())
            .unwrap();
        assert_relative_eq!(pitches[10], 57.0, epsilon = 1e-6);
    }

    #[test]
    fn test_perform_updates_state() {
        let mut p = Performer::new(Profile::default());
        let phrase = phrase_constant(62.0, 200, 0.8);
        let before = *p.state();
        let cmd = p.perform(&phrase, &PerformOptions::default()).unwrap();
        assert_eq!(cmd.len(), 200);
        let after = p.state();
        // the bow moved, so the rotor position must have advanced
        assert!(
            (after.position[Channel::BowRotor.index()]
                - before.position[Channel::BowRotor.index()])
                .abs()
                > 1.0
        );
    }

    #[test]
    fn test_transition_prepends_frames() {
        let mut p = Performer::new(Profile::default());
        let phrase = phrase_constant(62.0, 150, 0.6);
        let opts = PerformOptions {
            add_transition: true,
            ..Default::default()
        };
        let cmd = p.perform(&phrase, &opts).unwrap();
        assert_eq!(cmd.len(), 150 + p.profile().transition_ticks);
    }

    #[test]
    fn test_bow_direction_alternates_across_phrases() {
        let mut p = Performer::new(Profile::default());
        // one uninterrupted stroke per phrase
        let phrase = phrase_constant(62.0, 120, 0.7);
        let opts = PerformOptions {
            bow_changes: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(p.state().bow_direction, BowDirection::Up);
        p.perform(&phrase, &opts).unwrap();
        assert_eq!(p.state().bow_direction, BowDirection::Down);
        p.perform(&phrase, &opts).unwrap();
        assert_eq!(p.state().bow_direction, BowDirection::Up);
    }
}
