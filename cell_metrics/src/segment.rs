//! Charge/discharge boundary detection for a single cycler record.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{CycleLimits, SegmenterSettings};
use crate::rainflow::{total_count, Rainflow, TurnKind, TurningPoint};
use crate::signal::sign_with_threshold;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentationError {
    #[error("cumulative throughput has no usable range")]
    EmptyRange,
    #[error("only {0} turning points found")]
    TooFewTurningPoints(usize),
    #[error("time and current lengths differ ({time} vs {current})")]
    LengthMismatch { time: usize, current: usize },
    #[error("no charge/discharge transitions found")]
    NoTransitions,
}

/// Paired charge/discharge start indices.
///
/// `charge_start[k] < discharge_start[k]` and both lists have equal length.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundarySet {
    pub charge_start: Vec<usize>,
    pub discharge_start: Vec<usize>,
}

impl BoundarySet {
    pub fn len(&self) -> usize {
        self.charge_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charge_start.is_empty()
    }

    /// All boundaries in ascending order.
    pub fn merged(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self
            .charge_start
            .iter()
            .chain(self.discharge_start.iter())
            .copied()
            .collect();
        all.sort_unstable();
        all
    }
}

/// Role of the first reversal of the throughput signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadingTurn {
    /// First reversal is a valley: data opens with a charge.
    ValleyStart,
    /// First reversal is a peak with at least half the range below it: a
    /// full discharge follows.
    PeakStart,
    /// First reversal is a peak near the bottom of the range: the record
    /// opens mid-discharge and the reversal is ignored.
    PartialPeak,
}

impl LeadingTurn {
    pub fn classify(first: &TurningPoint, min: f64, range: f64) -> Self {
        match first.kind {
            TurnKind::Valley => LeadingTurn::ValleyStart,
            TurnKind::Peak if first.value - min > 0.5 * range => LeadingTurn::PeakStart,
            TurnKind::Peak => LeadingTurn::PartialPeak,
        }
    }

    pub fn keeps_first(&self) -> bool {
        !matches!(self, LeadingTurn::PartialPeak)
    }
}

/// Segmenter output plus diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub boundaries: BoundarySet,
    pub leading: LeadingTurn,
    pub turning_points: usize,
    pub rainflow_cycles: f64,
}

/// Candidate charge and discharge starts: samples where the thresholded
/// current sign flips relative to the last non-rest sample.
pub fn sign_transitions(current: &[f64], threshold: f64) -> (Vec<usize>, Vec<usize>) {
    let mut charge = Vec::new();
    let mut discharge = Vec::new();
    let mut last = 0i8;
    for (k, &i) in current.iter().enumerate() {
        let s = if i.is_nan() {
            0
        } else {
            sign_with_threshold(i, threshold)
        };
        if s == 0 {
            continue;
        }
        if s != last {
            if s > 0 {
                charge.push(k);
            } else {
                discharge.push(k);
            }
        }
        last = s;
    }
    (charge, discharge)
}

/// Net charge passed (Ah); sampling gaps longer than `gap_s` add nothing.
pub fn cumulative_throughput(time: &[f64], current: &[f64], gap_s: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(time.len());
    if time.is_empty() {
        return out;
    }
    let mut total = 0.0;
    out.push(total);
    for k in 1..time.len() {
        let dt = time[k] - time[k - 1];
        if dt > 0.0 && dt <= gap_s {
            let i0 = if current[k - 1].is_nan() { 0.0 } else { current[k - 1] };
            let i1 = if current[k].is_nan() { 0.0 } else { current[k] };
            total += 0.5 * (i0 + i1) * dt / 3600.0;
        }
        out.push(total);
    }
    out
}

fn snap(index: usize, next: usize, candidates: &[usize]) -> Option<usize> {
    let pos = candidates.partition_point(|&c| c < index);
    match candidates.get(pos) {
        Some(&c) if c < next => Some(c),
        _ if pos > 0 => Some(candidates[pos - 1]),
        _ => None,
    }
}

/// Detect charge/discharge starts in one record.
pub fn find_cycle_idx(
    time: &[f64],
    current: &[f64],
    limits: &CycleLimits,
    settings: &SegmenterSettings,
) -> Result<Segmentation, SegmentationError> {
    if time.len() != current.len() {
        return Err(SegmentationError::LengthMismatch {
            time: time.len(),
            current: current.len(),
        });
    }
    debug!(
        "segmenting {} samples (v_max {:.2}, v_min {:.2}, dt_min {:.0})",
        time.len(),
        limits.v_max_cycle,
        limits.v_min_cycle,
        limits.dt_min
    );

    let (charge_candidates, discharge_candidates) =
        sign_transitions(current, settings.sign_threshold_a);
    if charge_candidates.is_empty() && discharge_candidates.is_empty() {
        return Err(SegmentationError::NoTransitions);
    }

    let throughput = cumulative_throughput(time, current, settings.gap_threshold_s);
    let rainflow = Rainflow::new(settings.rainflow_classes);
    let reversals = rainflow
        .reversals(&throughput)
        .ok_or(SegmentationError::EmptyRange)?;
    let all_points = reversals.all_points();
    if all_points.len() <= 2 {
        return Err(SegmentationError::TooFewTurningPoints(all_points.len()));
    }
    let rainflow_cycles = total_count(&Rainflow::count(&all_points));

    let leading = LeadingTurn::classify(&reversals.points[0], reversals.min, reversals.range());
    let skip = usize::from(!leading.keeps_first());

    let mut charge = Vec::new();
    let mut discharge = Vec::new();
    for (n, tp) in reversals.points.iter().enumerate().skip(skip) {
        let next = all_points
            .get(n + 1)
            .map(|p| p.index)
            .unwrap_or(time.len());
        let (candidates, out) = match tp.kind {
            TurnKind::Valley => (&charge_candidates, &mut charge),
            TurnKind::Peak => (&discharge_candidates, &mut discharge),
        };
        if let Some(idx) = snap(tp.index, next, candidates) {
            out.push(idx);
        }
    }
    charge.sort_unstable();
    charge.dedup();
    discharge.sort_unstable();
    discharge.dedup();

    let boundaries = match_charge_discharge(&charge, &discharge)?;
    debug!(
        "{} turning points ({:?}), {:.1} rainflow cycles, {} paired cycles",
        all_points.len(),
        leading,
        rainflow_cycles,
        boundaries.len()
    );
    Ok(Segmentation {
        boundaries,
        leading,
        turning_points: all_points.len(),
        rainflow_cycles,
    })
}

/// Pair charge and discharge starts assuming cycling opens with a charge.
///
/// A discharge preceding the first charge is dropped, then both lists are
/// truncated to the shorter length.
pub fn match_charge_discharge(
    charge: &[usize],
    discharge: &[usize],
) -> Result<BoundarySet, SegmentationError> {
    if charge.is_empty() || discharge.is_empty() {
        return Err(SegmentationError::NoTransitions);
    }
    let mut discharge = discharge.to_vec();
    if discharge[0] < charge[0] {
        discharge.remove(0);
    }
    let n = charge.len().min(discharge.len());
    let (charge_start, discharge_start): (Vec<usize>, Vec<usize>) = charge[..n]
        .iter()
        .zip(discharge[..n].iter())
        .filter(|(c, d)| c < d)
        .map(|(&c, &d)| (c, d))
        .unzip();
    Ok(BoundarySet {
        charge_start,
        discharge_start,
    })
}
