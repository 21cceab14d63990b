//! Per-segment aggregation primitives shared by every stage.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Span between two boundary samples, `start..=end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Max and min of `series` over each half-open interval `[b[k], b[k+1])`.
///
/// An empty interval yields the sample at its left boundary for both values.
/// NaN samples are skipped; an interval holding only NaN yields NaN.
pub fn segment_minmax(series: &[f64], boundaries: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let n = boundaries.len().saturating_sub(1);
    let mut max_out = Vec::with_capacity(n);
    let mut min_out = Vec::with_capacity(n);
    for pair in boundaries.windows(2) {
        let (lo, hi) = (pair[0], pair[1].min(series.len()));
        if lo >= hi {
            let v = series.get(lo).copied().unwrap_or(f64::NAN);
            max_out.push(v);
            min_out.push(v);
            continue;
        }
        let mut mx = f64::NAN;
        let mut mn = f64::NAN;
        for &v in &series[lo..hi] {
            if v.is_nan() {
                continue;
            }
            if mx.is_nan() || v > mx {
                mx = v;
            }
            if mn.is_nan() || v < mn {
                mn = v;
            }
        }
        max_out.push(mx);
        min_out.push(mn);
    }
    (max_out, min_out)
}

/// Time-weighted average of `series` over each segment of each class.
///
/// Zero-duration segments average to 0.
pub fn segment_average(time: &[f64], series: &[f64], classes: &[Vec<Segment>]) -> Vec<Vec<f64>> {
    classes
        .iter()
        .map(|segments| {
            segments
                .iter()
                .map(|seg| {
                    let end = seg.end.min(time.len().saturating_sub(1));
                    if seg.start >= end {
                        return 0.0;
                    }
                    let elapsed = time[end] - time[seg.start];
                    if elapsed <= 0.0 {
                        return 0.0;
                    }
                    trapezoid(&time[seg.start..=end], &series[seg.start..=end]) / elapsed
                })
                .collect()
        })
        .collect()
}

/// Increase of a cumulative quantity across each segment of each class.
///
/// Deltas above `cap` or below zero are reported as NaN.
pub fn segment_delta(
    time: &[f64],
    cumulative: &[f64],
    classes: &[Vec<Segment>],
    cap: f64,
) -> Vec<Vec<f64>> {
    classes
        .iter()
        .map(|segments| {
            segments
                .iter()
                .map(|seg| {
                    let end = seg.end.min(cumulative.len().saturating_sub(1));
                    if seg.start > end {
                        return f64::NAN;
                    }
                    let delta = cumulative[end] - cumulative[seg.start];
                    if delta > cap {
                        warn!(
                            "throughput delta {:.4} at t={:.1} exceeds cap {:.3}; marking invalid",
                            delta, time[seg.start], cap
                        );
                        f64::NAN
                    } else if delta < 0.0 {
                        warn!(
                            "negative throughput delta {:.4} at t={:.1}; marking invalid",
                            delta, time[seg.start]
                        );
                        f64::NAN
                    } else {
                        delta
                    }
                })
                .collect()
        })
        .collect()
}

pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xw, yw)| 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]))
        .sum()
}

/// Running trapezoidal integral, starting at zero.
pub fn cumulative_trapezoid(x: &[f64], y: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(x.len());
    if x.is_empty() {
        return out;
    }
    let mut total = 0.0;
    out.push(total);
    for (xw, yw) in x.windows(2).zip(y.windows(2)) {
        total += 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]);
        out.push(total);
    }
    out
}

/// Index of the value in ascending `sorted` closest to `target`.
pub fn nearest_index(sorted: &[f64], target: f64) -> Option<usize> {
    if sorted.is_empty() || target.is_nan() {
        return None;
    }
    let pos = sorted.partition_point(|&v| v < target);
    if pos == 0 {
        return Some(0);
    }
    if pos == sorted.len() {
        return Some(sorted.len() - 1);
    }
    if (sorted[pos] - target).abs() < (target - sorted[pos - 1]).abs() {
        Some(pos)
    } else {
        Some(pos - 1)
    }
}

/// Sign of `value` with a dead band of `threshold` around zero.
pub fn sign_with_threshold(value: f64, threshold: f64) -> i8 {
    if value > threshold {
        1
    } else if value < -threshold {
        -1
    } else {
        0
    }
}

/// Number of consecutive samples whose thresholded sign differs.
pub fn count_sign_changes(values: &[f64], threshold: f64) -> usize {
    values
        .windows(2)
        .filter(|w| sign_with_threshold(w[0], threshold) != sign_with_threshold(w[1], threshold))
        .count()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minmax_over_half_open_segments() {
        let series = [1.0, 5.0, 2.0, 8.0, -1.0, 3.0];
        let (mx, mn) = segment_minmax(&series, &[0, 3, 5]);
        assert_eq!(mx, vec![5.0, 8.0]);
        assert_eq!(mn, vec![1.0, -1.0]);
    }

    #[test]
    fn minmax_empty_segment_uses_left_sample() {
        let series = [1.0, 5.0, 2.0];
        let (mx, mn) = segment_minmax(&series, &[1, 1, 3]);
        assert_eq!(mx[0], 5.0);
        assert_eq!(mn[0], 5.0);
        assert_eq!(mx[1], 5.0);
        assert_eq!(mn[1], 2.0);
    }

    #[test]
    fn minmax_skips_nan() {
        let series = [f64::NAN, 2.0, f64::NAN, 4.0];
        let (mx, mn) = segment_minmax(&series, &[0, 4]);
        assert_eq!(mx[0], 4.0);
        assert_eq!(mn[0], 2.0);
        let (mx, _) = segment_minmax(&[f64::NAN, f64::NAN], &[0, 2]);
        assert!(mx[0].is_nan());
    }

    #[test]
    fn average_of_constant_is_constant() {
        let time: Vec<f64> = (0..50).map(|k| k as f64 * 1.7 + (k % 3) as f64 * 0.2).collect();
        let series = vec![2.5; 50];
        let classes = vec![
            vec![Segment::new(0, 10), Segment::new(10, 49)],
            vec![Segment::new(3, 4)],
        ];
        let avg = segment_average(&time, &series, &classes);
        for row in &avg {
            for &v in row {
                assert!((v - 2.5).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn zero_duration_average_is_zero() {
        let time = [0.0, 1.0, 1.0, 2.0];
        let series = [3.0, 3.0, 3.0, 3.0];
        let avg = segment_average(&time, &series, &[vec![Segment::new(1, 2), Segment::new(2, 2)]]);
        assert_eq!(avg[0], vec![0.0, 0.0]);
    }

    #[test]
    fn average_is_time_weighted() {
        let time = [0.0, 1.0, 11.0];
        let series = [0.0, 0.0, 10.0];
        let avg = segment_average(&time, &series, &[vec![Segment::new(0, 2)]]);
        assert!((avg[0][0] - 50.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn delta_over_cap_is_nan() {
        let time = [0.0, 1.0, 2.0, 3.0];
        let cum = [0.0, 1.0, 5.0, 5.5];
        let deltas = segment_delta(
            &time,
            &cum,
            &[vec![Segment::new(0, 1), Segment::new(1, 2), Segment::new(2, 3)]],
            3.0,
        );
        assert!((deltas[0][0] - 1.0).abs() < 1e-12);
        assert!(deltas[0][1].is_nan());
        assert!((deltas[0][2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn delta_is_within_cap_or_invalid() {
        let time: Vec<f64> = (0..20).map(|k| k as f64).collect();
        let cum: Vec<f64> = (0..20).map(|k| ((k * k) % 7) as f64).collect();
        let segs: Vec<Segment> = (0..19).map(|k| Segment::new(k, k + 1)).collect();
        for d in &segment_delta(&time, &cum, &[segs], 4.0)[0] {
            assert!(d.is_nan() || (0.0..=4.0).contains(d));
        }
    }

    #[test]
    fn cumulative_integral_matches_total() {
        let x = [0.0, 1.0, 3.0, 4.0];
        let y = [1.0, 1.0, 3.0, 3.0];
        let cum = cumulative_trapezoid(&x, &y);
        assert_eq!(cum.len(), 4);
        assert!((cum[3] - trapezoid(&x, &y)).abs() < 1e-12);
        assert!((cum[3] - 8.0).abs() < 1e-12);
    }

    #[test]
    fn nearest_index_picks_closest() {
        let v = [0.0, 10.0, 20.0];
        assert_eq!(nearest_index(&v, -5.0), Some(0));
        assert_eq!(nearest_index(&v, 14.0), Some(1));
        assert_eq!(nearest_index(&v, 16.0), Some(2));
        assert_eq!(nearest_index(&v, 99.0), Some(2));
        assert_eq!(nearest_index(&[], 1.0), None);
    }

    #[test]
    fn sign_changes_include_rest() {
        let i = [0.0, 1.0, 1.0, 0.0, -1.0, 1e-7, 1.0];
        assert_eq!(count_sign_changes(&i, 1e-5), 5);
    }
}
