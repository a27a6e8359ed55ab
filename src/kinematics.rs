//! Physical-to-mechanical transform: deviation corrections, the bow
//! differential coupling, and the final conversion to encoder ticks.

use crate::config::Profile;
use crate::error::PlanError;
use crate::signal;
use crate::types::{ActuatorFrame, Channel, MotorCommand, NUM_CHANNELS};

/// Bow height/angle → left/right differential pair. The two carriages
/// share a belt, so a height move is common-mode and an angle move is
/// differential around the rail distance.
pub fn to_differential(
    height_mm: f64,
    angle_rad: f64,
    rail_mm: f64,
    limit_rad: f64,
) -> Result<(f64, f64), PlanError> {
    if angle_rad.abs() > limit_rad {
        return Err(PlanError::AngleLimitExceeded {
            angle: angle_rad,
            limit: limit_rad,
        });
    }
    let x = rail_mm * angle_rad.tan();
    Ok((height_mm - x, height_mm + x))
}

/// Inverse of [`to_differential`].
pub fn from_differential(left: f64, right: f64, rail_mm: f64) -> (f64, f64) {
    let height = (left + right) / 2.0;
    let angle = (((right - left) / 2.0) / rail_mm).atan();
    (height, angle)
}

/// Encode a physical trajectory for the wire: apply the deviation
/// corrections, couple the bow pair, scale every channel to encoder
/// ticks and round. Fails (without partial output) if any commanded bow
/// angle exceeds the mechanical limit; clamping the angle would
/// desynchronize the differential pair.
pub fn to_motor(frames: &[ActuatorFrame], profile: &Profile) -> Result<MotorCommand, PlanError> {
    let n = frames.len();
    let mut data = frames.to_vec();

    let fi = Channel::Finger.index();
    let sc = Channel::StringChange.index();
    let lh = Channel::LeftHand.index();
    let bl = Channel::BowDiffLeft.index();
    let br = Channel::BowDiffRight.index();
    let bs = Channel::BowSlide.index();

    // finger clearance shrinks toward the bridge: the string sits lower
    // over the fingerboard there
    for f in data.iter_mut() {
        let cent = (f[lh] / profile.fingerboard_length_mm).min(1.0);
        let dev = 1.0 - ((f[fi] - profile.finger.off) / (profile.finger.on - profile.finger.off));
        f[fi] = (f[fi] - dev * cent * profile.string_height_end_mm).max(0.0);
    }

    // the carriage rail diverges from the center line toward the
    // bridge, so the outer positions need more throw the further the
    // left hand sits
    let nut_dev = profile.carriage.max_nut_deviation();
    let bridge_dev = profile.carriage.max_bridge_deviation();
    for f in data.iter_mut() {
        let diff = f[sc] - profile.carriage.ad.nut;
        let dev = (diff / nut_dev) * bridge_dev;
        f[sc] += dev * f[lh] / profile.scale_length_mm;
    }

    // bow pressure increases slightly for higher left-hand positions
    for f in data.iter_mut() {
        f[bl] += profile.bow.vertical_deviation_mm * f[lh] / profile.scale_length_mm;
    }

    // spare slide axis trails the left hand as a fraction of scale
    let slide: Vec<f64> = data
        .iter()
        .map(|f| f[lh] / profile.scale_length_mm)
        .collect();
    let slide = signal::smooth_zero_phase(&slide, 0.3, false);
    for (f, &s) in data.iter_mut().zip(slide.iter()) {
        f[bs] = s;
    }

    // couple height/angle into the left/right pair, then smooth each
    // side independently
    let mut left = vec![0.0; n];
    let mut right = vec![0.0; n];
    for (i, f) in data.iter().enumerate() {
        let (l, r) = to_differential(
            f[bl],
            f[br],
            profile.bow.rail_distance_mm,
            profile.bow.angle_limit_rad,
        )?;
        left[i] = l;
        right[i] = r;
    }
    let left = signal::smooth_zero_phase(&left, 0.15, false);
    let right = signal::smooth_zero_phase(&right, 0.15, false);
    for (i, f) in data.iter_mut().enumerate() {
        f[bl] = left[i];
        f[br] = right[i];
    }

    let mut ticks = Vec::with_capacity(n);
    for f in &data {
        let mut frame = [0u16; NUM_CHANNELS];
        for (c, t) in frame.iter_mut().enumerate() {
            *t = (f[c] * profile.ticks_per_unit[c])
                .round()
                .clamp(0.0, f64::from(u16::MAX)) as u16;
        }
        ticks.push(frame);
    }
    Ok(MotorCommand::new(ticks))
}

/// Decode device-reported encoder ticks back into physical units,
/// undoing the differential coupling. Used to resynchronize the host's
/// position state from a `CURRENT_VALUES` reply.
pub fn from_motor(frames: &[[u16; NUM_CHANNELS]], profile: &Profile) -> Vec<ActuatorFrame> {
    let bl = Channel::BowDiffLeft.index();
    let br = Channel::BowDiffRight.index();
    frames
        .iter()
        .map(|raw| {
            let mut f = [0.0; NUM_CHANNELS];
            for c in 0..NUM_CHANNELS {
                f[c] = f64::from(raw[c]) / profile.ticks_per_unit[c];
            }
            let (h, a) = from_differential(f[bl], f[br], profile.bow.rail_distance_mm);
            f[bl] = h;
            f[br] = a;
            f
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_differential_round_trip() {
        let p = Profile::default();
        for &(h, a) in &[(50.0, 0.0), (47.5, 0.3), (59.0, -0.6), (0.0, 0.78)] {
            let (l, r) = to_differential(h, a, p.bow.rail_distance_mm, p.bow.angle_limit_rad)
                .unwrap();
            let (h2, a2) = from_differential(l, r, p.bow.rail_distance_mm);
            assert_relative_eq!(h2, h, epsilon = 1e-9);
            assert_relative_eq!(a2, a, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_differential_zero_angle_is_symmetric() {
        let (l, r) = to_differential(55.0, 0.0, 72.0, 1.0).unwrap();
        assert_relative_eq!(l, 55.0);
        assert_relative_eq!(r, 55.0);
    }

    #[test]
    fn test_differential_rejects_over_limit() {
        let p = Profile::default();
        let err = to_differential(50.0, 1.0, p.bow.rail_distance_mm, p.bow.angle_limit_rad)
            .unwrap_err();
        assert!(matches!(err, PlanError::AngleLimitExceeded { .. }));
    }

    #[test]
    fn test_to_motor_aborts_without_partial_output() {
        let p = Profile::default();
        let mut frames = vec![p.rest_frame(); 10];
        frames[7][Channel::BowDiffRight.index()] = 1.2; // past the limit
        assert!(to_motor(&frames, &p).is_err());
    }

    #[test]
    fn test_motor_round_trip_near_rest() {
        let p = Profile::default();
        let frames = vec![p.rest_frame(); 40];
        let cmd = to_motor(&frames, &p).unwrap();
        let back = from_motor(cmd.frames(), &p);
        let rest = p.rest_frame();
        let mid = &back[20];
        // quantization only: well under one encoder tick of error per
        // channel in physical units
        assert_relative_eq!(mid[Channel::BowDiffLeft.index()], rest[Channel::BowDiffLeft.index()], epsilon = 0.1);
        assert_relative_eq!(mid[Channel::BowDiffRight.index()], rest[Channel::BowDiffRight.index()], epsilon = 0.01);
        assert_relative_eq!(mid[Channel::StringChange.index()], rest[Channel::StringChange.index()], epsilon = 0.1);
        assert_relative_eq!(mid[Channel::BowRotor.index()], rest[Channel::BowRotor.index()], epsilon = 0.1);
    }

    #[test]
    fn test_finger_correction_shrinks_toward_bridge() {
        let p = Profile::default();
        let mut near_nut = p.rest_frame();
        near_nut[Channel::Finger.index()] = p.finger.off;
        near_nut[Channel::LeftHand.index()] = 0.0;
        let mut near_bridge = near_nut;
        near_bridge[Channel::LeftHand.index()] = p.fingerboard_length_mm;

        let a = to_motor(&[near_nut; 4], &p).unwrap();
        let b = to_motor(&[near_bridge; 4], &p).unwrap();
        let fi = Channel::Finger.index();
        assert!(
            b.frames()[2][fi] < a.frames()[2][fi],
            "released finger must ride lower near the bridge"
        );
    }

    #[test]
    fn test_carriage_correction_only_off_center() {
        let p = Profile::default();
        // centered carriage: correction is zero regardless of hand
        let mut f = p.rest_frame();
        f[Channel::LeftHand.index()] = 200.0;
        let cmd = to_motor(&[f; 4], &p).unwrap();
        let expect = (p.carriage.ad.nut * p.ticks_per_unit[Channel::StringChange.index()])
            .round() as u16;
        assert_eq!(cmd.frames()[2][Channel::StringChange.index()], expect);
    }

    #[test]
    fn test_slide_follows_left_hand_fraction() {
        let p = Profile::default();
        let mut f = p.rest_frame();
        f[Channel::LeftHand.index()] = p.scale_length_mm / 2.0;
        let cmd = to_motor(&vec![f; 30], &p).unwrap();
        // slide ticks = fraction * 1000
        let s = cmd.frames()[15][Channel::BowSlide.index()];
        assert!((495..=505).contains(&s), "slide {} not near 500", s);
    }
}
