//! Reversal extraction and rainflow cycle counting.
//!
//! Reversals are filtered with a hysteresis of one class width, where the
//! signal range is split into a fixed number of classes. The counter follows
//! the three-point stack method of ASTM E1049.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnKind {
    Peak,
    Valley,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurningPoint {
    pub index: usize,
    pub value: f64,
    pub kind: TurnKind,
}

/// Reversals of a signal. `terminal` is the pending extreme at the end of
/// the data; it closes the last half-cycle but starts none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reversals {
    pub points: Vec<TurningPoint>,
    pub terminal: Option<TurningPoint>,
    pub min: f64,
    pub max: f64,
    pub class_width: f64,
}

impl Reversals {
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Reversals followed by the terminal point, if any.
    pub fn all_points(&self) -> Vec<TurningPoint> {
        let mut all = self.points.clone();
        all.extend(self.terminal);
        all
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RainflowCycle {
    pub range: f64,
    pub mean: f64,
    /// 0.5 for a half cycle, 1.0 for a full cycle.
    pub count: f64,
    pub start: usize,
    pub end: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct Rainflow {
    classes: usize,
}

impl Rainflow {
    pub fn new(classes: usize) -> Self {
        Self {
            classes: classes.max(1),
        }
    }

    /// Returns `None` when the signal is empty or has no finite spread.
    pub fn reversals(&self, series: &[f64]) -> Option<Reversals> {
        let (min, max) = series
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !min.is_finite() || !max.is_finite() || max - min <= 0.0 {
            return None;
        }
        let h = (max - min) / self.classes as f64;
        let start = series.iter().position(|v| v.is_finite())?;

        let mut points = Vec::new();
        // Before the first reversal both running extremes are candidates.
        let mut lo_idx = start;
        let mut hi_idx = start;
        let mut direction: i8 = 0;
        let mut ext = start;
        for (k, &z) in series.iter().enumerate().skip(start + 1) {
            if !z.is_finite() {
                continue;
            }
            match direction {
                0 => {
                    if z < series[lo_idx] {
                        lo_idx = k;
                    }
                    if z > series[hi_idx] {
                        hi_idx = k;
                    }
                    if z - series[lo_idx] >= h {
                        points.push(turn(series, lo_idx, TurnKind::Valley));
                        direction = 1;
                        ext = k;
                    } else if series[hi_idx] - z >= h {
                        points.push(turn(series, hi_idx, TurnKind::Peak));
                        direction = -1;
                        ext = k;
                    }
                }
                1 => {
                    if z > series[ext] {
                        ext = k;
                    } else if series[ext] - z >= h {
                        points.push(turn(series, ext, TurnKind::Peak));
                        direction = -1;
                        ext = k;
                    }
                }
                _ => {
                    if z < series[ext] {
                        ext = k;
                    } else if z - series[ext] >= h {
                        points.push(turn(series, ext, TurnKind::Valley));
                        direction = 1;
                        ext = k;
                    }
                }
            }
        }
        let terminal = match direction {
            1 => Some(turn(series, ext, TurnKind::Peak)),
            -1 => Some(turn(series, ext, TurnKind::Valley)),
            _ => None,
        };
        Some(Reversals {
            points,
            terminal,
            min,
            max,
            class_width: h,
        })
    }

    /// Three-point rainflow count over an ordered reversal sequence.
    pub fn count(points: &[TurningPoint]) -> Vec<RainflowCycle> {
        let mut cycles = Vec::new();
        let mut stack: Vec<TurningPoint> = Vec::with_capacity(points.len());
        for &p in points {
            stack.push(p);
            while stack.len() >= 3 {
                let n = stack.len();
                let x = (stack[n - 1].value - stack[n - 2].value).abs();
                let y = (stack[n - 2].value - stack[n - 3].value).abs();
                if x < y {
                    break;
                }
                if n == 3 {
                    cycles.push(cycle(&stack[0], &stack[1], 0.5));
                    stack.remove(0);
                } else {
                    cycles.push(cycle(&stack[n - 3], &stack[n - 2], 1.0));
                    let last = stack[n - 1];
                    stack.truncate(n - 3);
                    stack.push(last);
                }
            }
        }
        for pair in stack.windows(2) {
            cycles.push(cycle(&pair[0], &pair[1], 0.5));
        }
        cycles
    }
}

fn turn(series: &[f64], index: usize, kind: TurnKind) -> TurningPoint {
    TurningPoint {
        index,
        value: series[index],
        kind,
    }
}

fn cycle(a: &TurningPoint, b: &TurningPoint, count: f64) -> RainflowCycle {
    RainflowCycle {
        range: (b.value - a.value).abs(),
        mean: 0.5 * (a.value + b.value),
        count,
        start: a.index,
        end: b.index,
    }
}

/// Total number of cycles, half cycles counting 0.5.
pub fn total_count(cycles: &[RainflowCycle]) -> f64 {
    cycles.iter().map(|c| c.count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(levels: &[f64], steps: usize) -> Vec<f64> {
        let mut out = vec![levels[0]];
        for w in levels.windows(2) {
            for k in 1..=steps {
                out.push(w[0] + (w[1] - w[0]) * k as f64 / steps as f64);
            }
        }
        out
    }

    #[test]
    fn reversals_of_triangle_wave() {
        let series = triangle(&[0.0, 1.0, 0.0, 1.0, 0.0], 10);
        let rev = Rainflow::new(10).reversals(&series).unwrap();
        let kinds: Vec<TurnKind> = rev.points.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![TurnKind::Valley, TurnKind::Peak, TurnKind::Valley, TurnKind::Peak]
        );
        assert_eq!(rev.points[0].index, 0);
        assert_eq!(rev.points[1].index, 10);
        assert_eq!(rev.points[2].index, 20);
        assert_eq!(rev.terminal.map(|p| p.index), Some(40));
        assert!((rev.class_width - 0.1).abs() < 1e-12);
    }

    #[test]
    fn small_wiggles_are_filtered() {
        let mut series = triangle(&[0.0, 1.0, 0.0], 20);
        series[5] += 0.05;
        series[6] -= 0.05;
        let rev = Rainflow::new(10).reversals(&series).unwrap();
        assert_eq!(rev.points.len(), 2);
    }

    #[test]
    fn flat_signal_has_no_reversals() {
        assert!(Rainflow::new(10).reversals(&[1.0; 20]).is_none());
        assert!(Rainflow::new(10).reversals(&[]).is_none());
    }

    #[test]
    fn astm_example_counts() {
        // ASTM E1049 Fig. 6 load history.
        let values = [-2.0, 1.0, -3.0, 5.0, -1.0, 3.0, -4.0, 4.0, -2.0];
        let points: Vec<TurningPoint> = values
            .iter()
            .enumerate()
            .map(|(k, &v)| TurningPoint {
                index: k,
                value: v,
                kind: if k % 2 == 0 {
                    TurnKind::Valley
                } else {
                    TurnKind::Peak
                },
            })
            .collect();
        let cycles = Rainflow::count(&points);
        let full: Vec<f64> = cycles
            .iter()
            .filter(|c| c.count == 1.0)
            .map(|c| c.range)
            .collect();
        assert_eq!(full, vec![4.0]);
        let mut halves: Vec<f64> = cycles
            .iter()
            .filter(|c| c.count == 0.5)
            .map(|c| c.range)
            .collect();
        halves.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(halves, vec![3.0, 4.0, 6.0, 8.0, 8.0, 9.0]);
        assert!((total_count(&cycles) - 4.0).abs() < 1e-12);
    }
}
