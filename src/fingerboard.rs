//! String assignment and left-hand planning: maps a preprocessed pitch
//! contour to string segments and the left-hand, carriage and finger
//! trajectories that realize them.

use log::{debug, info};

use crate::config::Profile;
use crate::error::PlanError;
use crate::signal;
use crate::types::{RestInterval, StringSegment};

/// Which discrete carriage position serves a (current, previous) string
/// pair. Row = current string, column = previous string + 1 (column 0
/// when there is no previous segment).
const CARRIAGE_ID: [[usize; 5]; 4] = [
    [0, 0, 0, 0, 0],
    [0, 0, 0, 1, 1],
    [1, 1, 1, 1, 2],
    [2, 2, 2, 2, 2],
];

/// Per-call switches for the fingerboard planner.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerboardOptions {
    /// Blend the left hand from its first sample toward the first
    /// stationary point instead of trusting the tracker's attack.
    pub interpolate_start: bool,
    /// Same for the release tail.
    pub interpolate_end: bool,
    /// Lift the finger wherever the fret is close enough to an open
    /// string that pressing would only add noise.
    pub release_open_strings: bool,
}

/// Output of [`FingerboardPlanner::plan`]: per-tick trajectories in
/// physical units plus the segment list and release mask the bow
/// planner needs.
#[derive(Debug, Clone)]
pub struct FingerboardPlan {
    pub left_hand: Vec<f64>,
    pub carriage: Vec<f64>,
    pub finger: Vec<f64>,
    pub segments: Vec<StringSegment>,
    /// True where the finger is not pressing (segment edges, rests,
    /// open-string ticks). Drives the bow-height contact offset.
    pub released: Vec<bool>,
}

pub struct FingerboardPlanner<'a> {
    profile: &'a Profile,
}

impl<'a> FingerboardPlanner<'a> {
    pub fn new(profile: &'a Profile) -> Self {
        Self { profile }
    }

    // ─── String selection ───────────────────────────────────────────────

    /// Pick the open string for `pitch`. Candidates are strings whose
    /// open note is at most `pitch` and whose range still covers it;
    /// with a current string given, the candidate with the smallest
    /// carriage move wins. When no string's range covers the pitch the
    /// constraint is relaxed to the highest open note below it.
    pub fn select_string(
        &self,
        pitch: f64,
        current: Option<usize>,
    ) -> Result<usize, PlanError> {
        let tuning = &self.profile.tuning;
        let range = self.profile.range_per_string;

        let mut best: Option<(usize, usize)> = None; // (string, cost)
        for (i, &open) in tuning.iter().enumerate() {
            if open <= pitch && pitch < open + range {
                match current {
                    None => return Ok(i),
                    Some(cur) => {
                        let cost = cur.abs_diff(i);
                        if best.map_or(true, |(_, c)| cost < c) {
                            best = Some((i, cost));
                        }
                    }
                }
            }
        }
        if let Some((sid, _)) = best {
            return Ok(sid);
        }

        // relaxed: highest open note still below the pitch
        for (i, &open) in tuning.iter().enumerate() {
            if open <= pitch {
                return Ok(i);
            }
        }
        Err(PlanError::UnplayablePitch { pitch })
    }

    /// Like [`Self::select_string`], but used when the segmenter has
    /// decided the current string must be left: a different in-range
    /// string is preferred even when the current one still qualifies.
    fn reselect_string(&self, pitch: f64, current: usize) -> Result<usize, PlanError> {
        let tuning = &self.profile.tuning;
        let range = self.profile.range_per_string;

        let mut best: Option<(usize, usize)> = None;
        let mut current_ok = false;
        for (i, &open) in tuning.iter().enumerate() {
            if open <= pitch && pitch < open + range {
                if i == current {
                    current_ok = true;
                    continue;
                }
                let cost = current.abs_diff(i);
                if best.map_or(true, |(_, c)| cost < c) {
                    best = Some((i, cost));
                }
            }
        }
        if let Some((sid, _)) = best {
            return Ok(sid);
        }
        if current_ok {
            return Ok(current);
        }
        self.select_string(pitch, Some(current))
    }

    // ─── Segmentation ───────────────────────────────────────────────────

    /// Partition `[0, N)` into string segments, using `boundaries`
    /// (stationary points of the contour, sorted) as the only ticks at
    /// which a string change may occur.
    ///
    /// Ascending motion switches strings as soon as the segment's
    /// maximum leaves the current string's range, or a little early
    /// when the run is long; descending motion tolerates a wider
    /// margin before switching back down, so brief dips do not cause
    /// churn. Same-string neighbors are merged, and a final pass folds
    /// too-short segments into the following one when its range allows.
    pub fn string_segments(
        &self,
        pitches: &[f64],
        boundaries: &[usize],
    ) -> Result<Vec<StringSegment>, PlanError> {
        let n = pitches.len();
        if n == 0 {
            return Err(PlanError::EmptySeries);
        }
        let tuning = &self.profile.tuning;
        let range = self.profile.range_per_string;
        let min_len = self.profile.min_segment_ticks;

        let lo = pitches.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = pitches.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        // common case: the whole phrase fits on the string that can
        // play its lowest note
        let low_sid = self.select_string(lo, None)?;
        if hi - tuning[low_sid] < range {
            debug!("phrase fits on string {} (span {:.1}..{:.1})", low_sid, lo, hi);
            return Ok(vec![StringSegment {
                start: 0,
                end: n,
                string: low_sid,
                max_pitch: hi,
            }]);
        }

        let mut segments: Vec<StringSegment> = Vec::new();
        let mut sid = self.select_string(pitches[0], None)?;
        let mut open = tuning[sid];
        let mut l = 0usize;

        for &b in boundaries {
            let r = b.min(n - 1);
            if l == r {
                continue;
            }
            let span = &pitches[l..r];
            let min_p = span.iter().cloned().fold(f64::INFINITY, f64::min);
            let max_p = span.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let long = r - l > min_len;

            // a segment whose maximum leaves the current string's range
            // always forces a change, whatever the local trend
            let must_switch = max_p - open >= range;
            let switch = if pitches[r] > pitches[l] {
                // ascending: also change a little early on long runs so
                // the hand is not stranded at the top of the range
                must_switch || (max_p - open > range - 4.0 && long)
            } else {
                // descending: tolerate a wider margin before dropping
                // back down, brief dips should not cause churn
                must_switch || min_p - open < 0.0 || (min_p - open < 4.0 && long)
            };
            if switch {
                sid = self.reselect_string(min_p, sid)?;
                open = tuning[sid];
            }

            // the last boundary closes the phrase
            let r = if r == n - 1 { n } else { r };

            match segments.last_mut() {
                Some(prev) if prev.string == sid => {
                    prev.end = r;
                    prev.max_pitch = prev.max_pitch.max(max_p);
                }
                _ => segments.push(StringSegment {
                    start: l,
                    end: r,
                    string: sid,
                    max_pitch: max_p,
                }),
            }
            l = if r == n { n - 1 } else { r };
        }

        // boundaries may stop short of the end; the last segment always
        // runs through N
        match segments.last_mut() {
            Some(last) if last.end < n => {
                let tail_max = pitches[last.end..].iter().cloned().fold(last.max_pitch, f64::max);
                last.end = n;
                last.max_pitch = tail_max;
            }
            None => segments.push(StringSegment {
                start: 0,
                end: n,
                string: sid,
                max_pitch: hi,
            }),
            _ => {}
        }

        // fold segments shorter than the minimum into the next one when
        // the next string's range still covers them
        let mut i = 0;
        while i + 1 < segments.len() {
            let cur = segments[i];
            let next = segments[i + 1];
            if cur.len() < min_len
                && cur.string < next.string
                && cur.max_pitch - tuning[next.string] < range
            {
                segments[i + 1] = StringSegment {
                    start: cur.start,
                    end: next.end,
                    string: next.string,
                    max_pitch: cur.max_pitch.max(next.max_pitch),
                };
                segments.remove(i);
            } else {
                i += 1;
            }
        }

        info!("{} string segment(s)", segments.len());
        for s in &segments {
            debug!("  {}", s);
        }
        Ok(segments)
    }

    // ─── Fret geometry ──────────────────────────────────────────────────

    /// Equal-tempered fret position along the string, in mm from the
    /// carriage home. Frets are clamped to a configured minimum so the
    /// finger never lands on the nut itself.
    pub fn left_hand_position_mm(&self, fret: f64) -> f64 {
        let fret = fret.max(self.profile.min_fret);
        self.profile.scale_length_mm * (1.0 - (2.0f64).powf(-fret / 12.0))
            + self.profile.nut_offset_mm
    }

    /// Inverse of [`Self::left_hand_position_mm`], for diagnostics and
    /// for decoding device state back into pitch space.
    pub fn fret_from_position_mm(&self, pos_mm: f64) -> f64 {
        let frac = (pos_mm - self.profile.nut_offset_mm) / self.profile.scale_length_mm;
        -12.0 * (1.0 - frac).log2()
    }

    // ─── Trajectory synthesis ───────────────────────────────────────────

    /// Emit left-hand, carriage and finger trajectories for the whole
    /// phrase. `boundaries` are the contour's stationary points.
    pub fn plan(
        &self,
        pitches: &[f64],
        rests: &[RestInterval],
        boundaries: &[usize],
        options: &FingerboardOptions,
    ) -> Result<FingerboardPlan, PlanError> {
        let n = pitches.len();
        let segments = self.string_segments(pitches, boundaries)?;
        let p = self.profile;

        let mut left_hand = vec![0.0; n];
        let mut carriage = vec![0.0; n];
        let mut finger = vec![p.finger.off; n];
        let mut released = vec![true; n];

        let press_offset = 1 + p.press_ticks() / 2;
        let mut prev_sid: Option<usize> = None;
        let mut prev_carriage: Option<f64> = None;

        for seg in &segments {
            let (l, r, sid) = (seg.start, seg.end, seg.string);
            for t in l..r {
                let fret = pitches[t] - p.tuning[sid];
                left_hand[t] = self.left_hand_position_mm(fret);
            }

            // carriage holds one discrete position per segment, ramped
            // in from wherever the previous segment left it
            let pos = p.carriage.nut(CARRIAGE_ID[sid][prev_sid.map_or(0, |s| s + 1)]);
            let ramp = p.string_change_ticks().min(r - l);
            match prev_carriage {
                Some(from) => {
                    let curve = signal::parabolic_blend(from, pos, ramp, 0.2);
                    carriage[l..l + ramp].copy_from_slice(&curve);
                }
                None => {
                    for t in l..l + ramp {
                        carriage[t] = pos;
                    }
                }
            }
            for t in (l + ramp)..r {
                carriage[t] = pos;
            }

            // pressed through the middle of the segment, released at
            // the edges so a string change never drags the finger
            let on_start = l + press_offset;
            let on_end = r.saturating_sub(press_offset);
            for t in on_start..on_end {
                finger[t] = p.finger.on;
                released[t] = false;
            }

            prev_sid = Some(sid);
            prev_carriage = Some(pos);
        }

        // open-string ticks never need the finger down
        if options.release_open_strings {
            for seg in &segments {
                for t in seg.start..seg.end {
                    let fret = pitches[t] - p.tuning[seg.string];
                    if fret < p.open_string_fret_eps {
                        finger[t] = p.finger.off;
                        released[t] = true;
                    }
                }
            }
        }

        // no contact during silence
        for rest in rests {
            for t in rest.start..rest.end.min(n) {
                finger[t] = p.finger.off;
                released[t] = true;
            }
        }

        if options.interpolate_start {
            if let Some(first) = signal::nearest_stationary(boundaries, 1, 1, 0) {
                if first > 1 && first < n {
                    let curve = signal::parabolic_blend(left_hand[0], left_hand[first], first, 0.45);
                    left_hand[..first].copy_from_slice(&curve);
                }
            }
        }
        if options.interpolate_end {
            if let Some(last) = signal::nearest_stationary(boundaries, n.saturating_sub(2), -1, 0) {
                if last + 1 < n {
                    let curve =
                        signal::parabolic_blend(left_hand[last], left_hand[n - 1], n - last, 0.45);
                    left_hand[last..].copy_from_slice(&curve);
                }
            }
        }

        let left_hand = signal::smooth_zero_phase(&left_hand, 0.3, false);
        let carriage = signal::smooth_zero_phase(&carriage, 0.3, false);
        let finger = signal::smooth_zero_phase(&finger, 0.3, false);

        Ok(FingerboardPlan {
            left_hand,
            carriage,
            finger,
            segments,
            released,
        })
    }
}
