//! Pure signal primitives shared by the planners: zero-phase smoothing,
//! gap bridging, parabolic-blend interpolation, stationary-point and
//! envelope-dip detection. Stateless functions over owned buffers.

use crate::error::PlanError;
use crate::types::RestInterval;

/// Values below this are treated as silence by the bridging and
/// stationary-point scans.
pub const SILENCE_EPS: f64 = 1e-2;

// ─── Smoothing ──────────────────────────────────────────────────────────────

/// Two-pass (forward, then backward) first-order exponential filter.
/// The second pass cancels the phase shift of the first, so features in
/// the output stay aligned with the input.
///
/// With `bridge_silence`, sub-threshold runs are first replaced by a
/// straight line between their neighbors so they do not drag the filter
/// state toward zero.
pub fn smooth_zero_phase(x: &[f64], alpha: f64, bridge_silence: bool) -> Vec<f64> {
    if x.is_empty() {
        return Vec::new();
    }
    let mut y = if bridge_silence {
        bridge_silent(x, SILENCE_EPS)
    } else {
        x.to_vec()
    };
    for i in 1..y.len() {
        y[i] = alpha * y[i - 1] + (1.0 - alpha) * y[i];
    }
    for i in (0..y.len() - 1).rev() {
        y[i] = alpha * y[i + 1] + (1.0 - alpha) * y[i];
    }
    y
}

/// Replace interior runs below `eps` with a straight line from the
/// preceding valid value to the next one. Causal at the edges: a leading
/// run takes the first valid value, a trailing run is left untouched.
pub fn bridge_silent(x: &[f64], eps: f64) -> Vec<f64> {
    let mut out = x.to_vec();
    let mut i = 0;
    while i < out.len() {
        if out[i] < eps {
            let mut j = i + 1;
            while j < out.len() && out[j] < eps {
                j += 1;
            }
            if j >= out.len() {
                break; // trailing silence stays silent
            }
            let start = if i > 0 { out[i - 1] } else { out[j] };
            let stop = out[j];
            let n = j - i;
            for k in 0..n {
                out[i + k] = if n > 1 {
                    start + (stop - start) * k as f64 / (n - 1) as f64
                } else {
                    start
                };
            }
            i = j;
        } else {
            i += 1;
        }
    }
    out
}

// ─── Parabolic blend ────────────────────────────────────────────────────────

/// Linear interpolation with parabolic blends: constant acceleration
/// over the first and last `blend·n` samples, constant velocity in
/// between. `curve[0] == q0` and `curve[n-1] == qf`, with a continuous
/// first derivative at the blend boundaries.
///
/// For `n < 2` the endpoints are returned directly (truncated to `n`).
pub fn parabolic_blend(q0: f64, qf: f64, n: usize, blend: f64) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![q0];
    }

    let nb = (((blend * n as f64).round() as usize).max(1)).min(n - 1);
    let a = (qf - q0) / ((nb * (n - nb)) as f64);

    // accel samples q0 + a/2·k²; the decel ramp mirrors it around qf
    let qa: Vec<f64> = (0..=nb).map(|k| q0 + 0.5 * a * ((k * k) as f64)).collect();
    let qb: Vec<f64> = qa.iter().map(|&v| qf - v + q0).collect();

    let mut curve = vec![0.0; n];
    curve[..nb].copy_from_slice(&qa[..nb]);
    for k in 0..nb {
        curve[n - 1 - k] = qb[k];
    }
    if n > 2 * nb {
        let m = n - 2 * nb;
        for k in 0..m {
            curve[nb + k] = if m > 1 {
                qa[nb] + (qb[nb] - qa[nb]) * k as f64 / (m - 1) as f64
            } else {
                qa[nb]
            };
        }
    }
    curve
}

// ─── Gap interpolation ──────────────────────────────────────────────────────

/// Fill every maximal run of invalid samples with a parabolic blend
/// between its valid neighbors. Runs touching an edge are filled flat
/// from the nearest valid value. Returns the filled series plus the
/// filled ranges (the phrase's rest intervals).
///
/// Fails with [`PlanError::EmptySeries`] when no sample is valid.
pub fn interpolate_gaps(
    samples: &[Option<f64>],
) -> Result<(Vec<f64>, Vec<RestInterval>), PlanError> {
    let n = samples.len();
    if n == 0 || samples.iter().all(|s| s.is_none()) {
        return Err(PlanError::EmptySeries);
    }

    let mut out = vec![0.0; n];
    for (i, s) in samples.iter().enumerate() {
        if let Some(v) = s {
            out[i] = *v;
        }
    }

    let mut rests = Vec::new();
    let mut i = 0;
    while i < n {
        if samples[i].is_some() {
            i += 1;
            continue;
        }
        let s = i;
        while i < n && samples[i].is_none() {
            i += 1;
        }
        let e = i; // exclusive
        rests.push(RestInterval { start: s, end: e });

        if s == 0 {
            let v = out[e];
            for t in 0..e {
                out[t] = v;
            }
        } else if e == n {
            let v = out[s - 1];
            for t in s..n {
                out[t] = v;
            }
        } else {
            // bridge from the last valid sample through the island
            let curve = parabolic_blend(out[s - 1], out[e], e - s + 1, 0.45);
            out[(s - 1)..e].copy_from_slice(&curve);
        }
    }

    Ok((out, rests))
}

// ─── Stationary points ──────────────────────────────────────────────────────

/// Local peaks, dips and silent ticks of a contour. The first and last
/// valid samples are always classified as stationary.
#[derive(Debug, Clone, Default)]
pub struct StationaryPoints {
    pub peaks: Vec<usize>,
    pub dips: Vec<usize>,
    pub silence: Vec<usize>,
}

impl StationaryPoints {
    /// Peaks and dips merged into one sorted boundary list.
    pub fn merged(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self.peaks.iter().chain(self.dips.iter()).cloned().collect();
        all.sort_unstable();
        all
    }
}

/// Scan a contour for local maxima and minima, treating runs below
/// `eps` as silence.
pub fn stationary_points(x: &[f64], eps: f64) -> StationaryPoints {
    let mut out = StationaryPoints::default();
    let n = x.len();
    if n == 0 {
        return out;
    }

    let mut idx = 0;
    while idx < n - 1 && x[idx] < eps {
        out.silence.push(idx);
        idx += 1;
    }
    let mut end_idx = n - 1;
    while end_idx > idx && x[end_idx] < eps {
        out.silence.push(end_idx);
        end_idx -= 1;
    }

    // first valid point is always stationary
    if idx < n - 1 {
        if x[idx] < x[idx + 1] {
            out.dips.push(idx);
        } else {
            out.peaks.push(idx);
        }
        idx += 1;
    }
    // as is the last
    if end_idx > idx {
        if x[end_idx] < x[end_idx - 1] {
            out.dips.push(end_idx);
        } else {
            out.peaks.push(end_idx);
        }
        end_idx -= 1;
    }

    let mut in_silence = false;
    let mut i = idx + 1;
    while i < end_idx {
        if x[i] < eps {
            if !in_silence {
                out.dips.push(i - 1);
                in_silence = true;
            }
            out.silence.push(i);
            i += 1;
            continue;
        }
        if in_silence {
            if x[i + 1] > x[i] {
                out.dips.push(i);
            } else {
                out.peaks.push(i);
            }
            in_silence = false;
            i += 1;
            continue;
        }
        if x[i + 1] <= x[i] && x[i] > x[i - 1] {
            out.peaks.push(i);
        } else if x[i + 1] > x[i] && x[i] <= x[i - 1] {
            out.dips.push(i);
        }
        i += 1;
    }

    out.peaks.sort_unstable();
    out.dips.sort_unstable();
    out.silence.sort_unstable();
    out
}

/// Nearest stationary point to `index`, at least `min_distance` ticks
/// away. `direction < 0` looks only below, `> 0` only above, `0` takes
/// the closer of the two.
pub fn nearest_stationary(
    sta: &[usize],
    index: usize,
    direction: i32,
    min_distance: usize,
) -> Option<usize> {
    if sta.is_empty() {
        return None;
    }
    let mut lower = sta[0];
    for &s in sta.iter().rev() {
        if index > s && index - s > min_distance {
            lower = s;
            break;
        }
    }
    let mut higher = sta[sta.len() - 1];
    for &s in sta {
        if s > index && s - index > min_distance {
            higher = s;
            break;
        }
    }
    Some(match direction.cmp(&0) {
        std::cmp::Ordering::Less => lower,
        std::cmp::Ordering::Greater => higher,
        std::cmp::Ordering::Equal => {
            if index.abs_diff(lower) <= index.abs_diff(higher) {
                lower
            } else {
                higher
            }
        }
    })
}

// ─── Envelope dips ──────────────────────────────────────────────────────────

/// Find candidate bow-reversal ticks: local dips of the envelope below
/// its own smoothed version. A dip run must span at least
/// `min_silence_ms` and deviate noticeably from the local mean; accepted
/// dips are then greedily thinned (smallest deviation first) until every
/// pair is at least `min_stroke_ms` apart. Dips too close to either end
/// are discarded.
pub fn pick_dips(
    e: &[f64],
    sample_rate: f64,
    hop_size: usize,
    smoothing_alpha: f64,
    min_silence_ms: f64,
    min_stroke_ms: f64,
) -> Vec<usize> {
    let n = e.len();
    if n == 0 {
        return Vec::new();
    }

    let max_e = e.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let norm: Vec<f64> = if max_e > 0.0 {
        e.iter().map(|&v| v / max_e).collect()
    } else {
        e.to_vec()
    };
    let lpf = smooth_zero_phase(&norm, smoothing_alpha, false);

    let tick = hop_size as f64 / sample_rate;
    let wait_ticks = (min_stroke_ms / 1000.0) / tick;
    let silence_ticks = (min_silence_ms / 1000.0) / tick;

    let mut dips: Vec<usize> = Vec::new();
    let mut i = 0;
    while i < n {
        let si = i;
        while i < n && norm[i] < lpf[i] {
            i += 1;
        }
        if (i - si) as f64 > silence_ticks {
            let mut min_i = si;
            for t in si..i {
                if lpf[t] < lpf[min_i] {
                    min_i = t;
                }
            }
            let mean_lpf: f64 = lpf[si..i].iter().sum::<f64>() / (i - si) as f64;
            let min_e = norm[si..i].iter().cloned().fold(f64::INFINITY, f64::min);
            if (mean_lpf - min_e).abs() > 0.1 {
                dips.push(min_i);
            }
        }
        i += 1;
    }

    // thin out until every adjacent pair satisfies the stroke spacing,
    // always sacrificing the shallowest remaining dip
    while dips.len() >= 2
        && dips
            .windows(2)
            .any(|w| ((w[1] - w[0]) as f64) < wait_ticks)
    {
        let mut drop_idx = 0;
        let mut shallowest = f64::INFINITY;
        for (k, &d) in dips.iter().enumerate() {
            let depth = lpf[d] - norm[d];
            if depth < shallowest {
                shallowest = depth;
                drop_idx = k;
            }
        }
        dips.remove(drop_idx);
    }

    if let Some(&first) = dips.first() {
        if (first as f64) < wait_ticks {
            dips.remove(0);
        }
    }
    if let Some(&last) = dips.last() {
        if ((n - last) as f64) - 1.0 < wait_ticks {
            dips.pop();
        }
    }

    dips
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // ── parabolic blend ────────────────────────────────────────────────

    #[test]
    fn test_blend_hits_endpoints() {
        for &(q0, qf, n) in &[(0.0, 1.0, 10), (5.0, -3.0, 57), (2.0, 2.0, 4), (1.0, 9.0, 100)]
        {
            let c = parabolic_blend(q0, qf, n, 0.45);
            assert_eq!(c.len(), n);
            assert_relative_eq!(c[0], q0, epsilon = 1e-9);
            assert_relative_eq!(c[n - 1], qf, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_blend_monotonic_no_overshoot() {
        let c = parabolic_blend(0.0, 1.0, 50, 0.45);
        for w in c.windows(2) {
            assert!(w[1] >= w[0] - 1e-12, "rising blend must be monotone");
        }
        assert!(c.iter().all(|&v| v >= -1e-12 && v <= 1.0 + 1e-12));
    }

    #[test]
    fn test_blend_constant_acceleration_in_ramp() {
        // second difference is constant inside the acceleration zone
        let n = 40;
        let c = parabolic_blend(0.0, 10.0, n, 0.25);
        let nb = ((0.25 * n as f64).round() as usize).max(1);
        let dd: Vec<f64> = (2..nb).map(|i| c[i] - 2.0 * c[i - 1] + c[i - 2]).collect();
        for d in &dd {
            assert_relative_eq!(*d, dd[0], epsilon = 1e-9);
        }
        assert!(dd[0] > 0.0, "rising blend accelerates");
    }

    #[test]
    fn test_blend_tiny_inputs() {
        assert!(parabolic_blend(1.0, 2.0, 0, 0.45).is_empty());
        assert_eq!(parabolic_blend(1.0, 2.0, 1, 0.45), vec![1.0]);
        let two = parabolic_blend(1.0, 2.0, 2, 0.45);
        assert_relative_eq!(two[0], 1.0);
        assert_relative_eq!(two[1], 2.0);
    }

    // ── zero-phase smoothing ───────────────────────────────────────────

    #[test]
    fn test_smooth_zero_signal_stays_zero() {
        let x = vec![0.0; 64];
        let y = smooth_zero_phase(&x, 0.3, false);
        assert!(y.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_smooth_preserves_constant() {
        let x = vec![3.5; 32];
        let y = smooth_zero_phase(&x, 0.8, false);
        for v in &y {
            assert_relative_eq!(*v, 3.5, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_smooth_reduces_step_sharpness() {
        let mut x = vec![0.0; 20];
        for v in x.iter_mut().skip(10) {
            *v = 1.0;
        }
        let y = smooth_zero_phase(&x, 0.5, false);
        let max_jump = y.windows(2).map(|w| (w[1] - w[0]).abs()).fold(0.0, f64::max);
        assert!(max_jump < 1.0, "edge must be softened, got jump {}", max_jump);
    }

    #[test]
    fn test_bridge_silent_is_causal() {
        // interior zero run bridged, trailing silence untouched
        let x = vec![0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let y = bridge_silent(&x, 0.01);
        assert_eq!(y[0], 1.0, "leading silence takes the first valid value");
        assert_eq!(&y[4..], &[0.0, 0.0, 0.0], "trailing silence stays");
    }

    #[test]
    fn test_bridge_silent_interior_run() {
        let x = vec![2.0, 0.0, 0.0, 0.0, 4.0];
        let y = bridge_silent(&x, 0.01);
        assert_relative_eq!(y[0], 2.0);
        assert_relative_eq!(y[4], 4.0);
        for w in y.windows(2) {
            assert!(w[1] >= w[0], "bridge rises monotonically");
        }
    }

    // ── gap interpolation ──────────────────────────────────────────────

    #[test]
    fn test_interpolate_single_gap_monotone() {
        let mut s: Vec<Option<f64>> = vec![Some(60.0); 20];
        for v in s.iter_mut().take(14).skip(6) {
            *v = None;
        }
        for v in s.iter_mut().skip(14) {
            *v = Some(66.0);
        }
        let (filled, rests) = interpolate_gaps(&s).unwrap();
        assert_eq!(rests, vec![RestInterval { start: 6, end: 14 }]);
        for w in filled[5..15].windows(2) {
            assert!(w[1] >= w[0] - 1e-9, "fill between 60 and 66 must rise");
        }
        assert_relative_eq!(filled[5], 60.0, epsilon = 1e-9);
    }

    #[test]
    fn test_interpolate_all_invalid_fails() {
        let s: Vec<Option<f64>> = vec![None; 8];
        assert!(matches!(
            interpolate_gaps(&s),
            Err(PlanError::EmptySeries)
        ));
        assert!(matches!(interpolate_gaps(&[]), Err(PlanError::EmptySeries)));
    }

    #[test]
    fn test_interpolate_edge_gaps_fill_flat() {
        let s = vec![None, None, Some(62.0), Some(63.0), None];
        let (filled, rests) = interpolate_gaps(&s).unwrap();
        assert_eq!(filled[0], 62.0);
        assert_eq!(filled[1], 62.0);
        assert_eq!(filled[4], 63.0);
        assert_eq!(
            rests,
            vec![
                RestInterval { start: 0, end: 2 },
                RestInterval { start: 4, end: 5 }
            ]
        );
    }

    // ── stationary points ──────────────────────────────────────────────

    #[test]
    fn test_stationary_points_triangle() {
        // rises to a peak at 5, falls to a dip at 10, rises again
        let mut x = Vec::new();
        for i in 0..=5 {
            x.push(i as f64 + 1.0);
        }
        for i in (1..=4).rev() {
            x.push(i as f64 + 1.0);
        }
        for i in 5..=8 {
            x.push(i as f64 + 1.0);
        }
        let sp = stationary_points(&x, 0.1);
        assert!(sp.peaks.contains(&5), "peaks {:?}", sp.peaks);
        assert!(sp.dips.contains(&9), "dips {:?}", sp.dips);
        // endpoints always stationary
        let merged = sp.merged();
        assert!(merged.contains(&0));
        assert!(merged.contains(&(x.len() - 1)));
    }

    #[test]
    fn test_stationary_points_silence_edges() {
        let x = vec![0.0, 0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0];
        let sp = stationary_points(&x, 0.1);
        assert!(sp.silence.contains(&0));
        assert!(sp.silence.contains(&7));
        assert!(sp.peaks.contains(&4), "peaks {:?}", sp.peaks);
    }

    #[test]
    fn test_nearest_stationary_directions() {
        let sta = vec![0, 20, 40, 60];
        assert_eq!(nearest_stationary(&sta, 35, -1, 10), Some(20));
        assert_eq!(nearest_stationary(&sta, 35, 1, 10), Some(60));
        // unconstrained direction picks the closer side
        assert_eq!(nearest_stationary(&sta, 45, 0, 0), Some(40));
        assert_eq!(nearest_stationary(&sta, 55, 0, 0), Some(60));
        assert_eq!(nearest_stationary(&[], 5, 0, 10), None);
    }

    // ── dip picking ────────────────────────────────────────────────────

    /// Envelope: loud, a deep notch, loud again.
    fn notched_envelope(n: usize, notch_at: usize, notch_w: usize) -> Vec<f64> {
        let mut e = vec![0.8; n];
        for t in notch_at..(notch_at + notch_w).min(n) {
            e[t] = 0.05;
        }
        // fade edges so the ends don't register as dips
        for t in 0..n.min(5) {
            e[t] *= t as f64 / 5.0;
        }
        e
    }

    #[test]
    fn test_pick_dips_finds_notch() {
        let e = notched_envelope(400, 200, 20);
        let dips = pick_dips(&e, 16000.0, 160, 0.8, 50.0, 80.0);
        assert!(
            dips.iter().any(|&d| (190..=230).contains(&d)),
            "notch near 200 must register, got {:?}",
            dips
        );
    }

    #[test]
    fn test_pick_dips_enforces_spacing() {
        // two notches only 3 ticks apart: at most one survives
        let mut e = vec![0.8; 400];
        for t in 200..204 {
            e[t] = 0.05;
        }
        for t in 207..211 {
            e[t] = 0.05;
        }
        let dips = pick_dips(&e, 16000.0, 160, 0.8, 10.0, 80.0);
        for w in dips.windows(2) {
            assert!(w[1] - w[0] >= 8, "spacing violated: {:?}", dips);
        }
    }

    #[test]
    fn test_pick_dips_rejects_ends() {
        let mut e = vec![0.8; 100];
        for t in 0..6 {
            e[t] = 0.01; // notch right at the start
        }
        let dips = pick_dips(&e, 16000.0, 160, 0.8, 10.0, 80.0);
        assert!(
            dips.iter().all(|&d| d >= 8),
            "dips too close to the start must be dropped: {:?}",
            dips
        );
    }

    #[test]
    fn test_pick_dips_empty_and_flat() {
        assert!(pick_dips(&[], 16000.0, 160, 0.8, 50.0, 80.0).is_empty());
        let flat = vec![0.5; 200];
        assert!(pick_dips(&flat, 16000.0, 160, 0.8, 50.0, 80.0).is_empty());
    }
}
