//! Expansion-sensor (VDF) calibration and alignment to cycle boundaries.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ExpansionSettings;
use crate::metrics::CycleMetrics;
use crate::signal::{nearest_index, segment_minmax};
use crate::{Calibration, VdfRecord};

/// Values written by the expansion aligner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpansionMetrics {
    pub time_vdf: Option<f64>,
    pub min_expansion: Option<f64>,
    pub max_expansion: Option<f64>,
    pub reversible_expansion: Option<f64>,
    pub min_expansion_um: Option<f64>,
    pub max_expansion_um: Option<f64>,
    pub reversible_expansion_um: Option<f64>,
    pub drive_current: Option<f64>,
    pub expansion_stddev: Option<f64>,
    pub ref_stddev: Option<f64>,
}

/// Calibrated, time-sorted VDF samples of a cell. Missing values are NaN.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellDataVdf {
    pub time: Vec<f64>,
    pub expansion: Vec<f64>,
    pub expansion_um: Vec<f64>,
    pub expansion_ref: Vec<f64>,
    pub temperature: Vec<f64>,
    pub drive_current: Vec<f64>,
    pub expansion_stddev: Vec<f64>,
    pub ref_stddev: Vec<f64>,
    pub is_cycle_start: Vec<bool>,
    /// Index into `test_names` per sample.
    pub record: Vec<usize>,
    pub test_names: Vec<String>,
}

struct VdfRow {
    time: f64,
    expansion: f64,
    expansion_um: f64,
    expansion_ref: f64,
    temperature: f64,
    drive_current: f64,
    expansion_stddev: f64,
    ref_stddev: f64,
    record: usize,
}

/// `1000 * (ref_mm - (x2*s^2 + x1*s + c))` with `s` the scaled raw count.
pub fn calibrate_expansion(raw: f64, cal: &Calibration, settings: &ExpansionSettings) -> f64 {
    let s = raw * settings.count_scale;
    1000.0 * (settings.reference_thickness_mm - (cal.x2 * s * s + cal.x1 * s + cal.c))
}

fn process_record(
    record: &VdfRecord,
    record_idx: usize,
    settings: &ExpansionSettings,
) -> Vec<VdfRow> {
    let opt = |v: Option<f64>| v.unwrap_or(f64::NAN);
    let rows: Vec<VdfRow> = record
        .samples
        .iter()
        .filter(|s| s.expansion >= settings.min_raw_count && s.expansion <= settings.max_raw_count)
        .map(|s| {
            let temperature = match s.temperature {
                Some(t) if t >= settings.glitch_temp_low && t < settings.glitch_temp_high => {
                    f64::NAN
                }
                other => opt(other),
            };
            VdfRow {
                time: s.time,
                expansion: s.expansion,
                expansion_um: record
                    .calibration
                    .as_ref()
                    .map(|cal| calibrate_expansion(s.expansion, cal, settings))
                    .unwrap_or(f64::NAN),
                expansion_ref: opt(s.expansion_ref),
                temperature,
                drive_current: opt(s.drive_current),
                expansion_stddev: opt(s.expansion_stddev),
                ref_stddev: opt(s.ref_stddev),
                record: record_idx,
            }
        })
        .collect();
    let dropped = record.samples.len() - rows.len();
    if dropped > 0 {
        debug!(
            "{}: dropped {dropped} samples outside the raw-count band",
            record.test_name
        );
    }
    rows
}

impl CellDataVdf {
    /// Filter, calibrate and time-sort every VDF record of a cell.
    pub fn combine(records: &[VdfRecord], settings: &ExpansionSettings) -> Self {
        info!("combining {} VDF records", records.len());
        let mut rows: Vec<VdfRow> = records
            .iter()
            .enumerate()
            .flat_map(|(k, r)| process_record(r, k, settings))
            .collect();
        rows.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut out = CellDataVdf {
            test_names: records.iter().map(|r| r.test_name.clone()).collect(),
            is_cycle_start: vec![false; rows.len()],
            ..CellDataVdf::default()
        };
        for row in rows {
            out.time.push(row.time);
            out.expansion.push(row.expansion);
            out.expansion_um.push(row.expansion_um);
            out.expansion_ref.push(row.expansion_ref);
            out.temperature.push(row.temperature);
            out.drive_current.push(row.drive_current);
            out.expansion_stddev.push(row.expansion_stddev);
            out.ref_stddev.push(row.ref_stddev);
            out.record.push(row.record);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Matches between desired timestamps and a sorted sample clock.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimestampMatch {
    pub matched_times: Vec<f64>,
    pub sample_indices: Vec<usize>,
    pub desired_indices: Vec<usize>,
}

/// Nearest sample within `tolerance` for every desired time. A sample is
/// matched at most once, to its closest desired time; unmatched desired
/// times are left out.
pub fn find_matching_timestamp(desired: &[f64], times: &[f64], tolerance: f64) -> TimestampMatch {
    let mut best: Vec<Option<(usize, f64)>> = vec![None; times.len()];
    for (d, &target) in desired.iter().enumerate() {
        let Some(idx) = nearest_index(times, target) else {
            continue;
        };
        let dist = (times[idx] - target).abs();
        if dist > tolerance {
            continue;
        }
        let closer = best[idx].map_or(true, |(_, prev)| dist < prev);
        if closer {
            best[idx] = Some((d, dist));
        }
    }
    let mut pairs: Vec<(usize, usize)> = best
        .iter()
        .enumerate()
        .filter_map(|(s, m)| m.map(|(d, _)| (d, s)))
        .collect();
    pairs.sort_unstable();
    TimestampMatch {
        matched_times: pairs.iter().map(|&(_, s)| times[s]).collect(),
        sample_indices: pairs.iter().map(|&(_, s)| s).collect(),
        desired_indices: pairs.iter().map(|&(d, _)| d).collect(),
    }
}

/// Mark matched cycle starts in the VDF table and fill the expansion group
/// of the metrics rows.
pub fn align_expansion(
    vdf: &mut CellDataVdf,
    metrics: &mut CycleMetrics,
    settings: &ExpansionSettings,
) {
    if vdf.is_empty() || metrics.is_empty() {
        info!("no VDF data to align; expansion columns left empty");
        return;
    }
    let tolerance = settings.match_tolerance_s;

    let all_times: Vec<f64> = metrics.rows.iter().map(|r| r.time).collect();
    let all = find_matching_timestamp(&all_times, &vdf.time, tolerance);
    for (&row, &s) in all.desired_indices.iter().zip(&all.sample_indices) {
        metrics.rows[row].expansion.time_vdf = Some(vdf.time[s]);
    }

    let cycle_rows: Vec<usize> = metrics
        .rows
        .iter()
        .enumerate()
        .filter_map(|(k, r)| r.is_cycle_start.then_some(k))
        .collect();
    let desired: Vec<f64> = cycle_rows.iter().map(|&k| metrics.rows[k].time).collect();
    let matched = find_matching_timestamp(&desired, &vdf.time, tolerance);

    let mut pairs: Vec<(usize, usize)> = matched
        .sample_indices
        .iter()
        .zip(&matched.desired_indices)
        .map(|(&s, &d)| (s, cycle_rows[d]))
        .collect();
    pairs.sort_unstable();

    let mut bounds = Vec::with_capacity(pairs.len() + 1);
    bounds.push(0);
    bounds.extend(pairs.iter().map(|&(s, _)| s));
    let (exp_max, exp_min) = segment_minmax(&vdf.expansion, &bounds);
    let (um_max, um_min) = segment_minmax(&vdf.expansion_um, &bounds);

    let finite = |v: f64| (!v.is_nan()).then_some(v);
    for (k, &(s, row)) in pairs.iter().enumerate() {
        vdf.is_cycle_start[s] = true;
        let e = &mut metrics.rows[row].expansion;
        e.min_expansion = Some(exp_min[k]);
        e.max_expansion = Some(exp_max[k]);
        e.reversible_expansion = Some(exp_max[k] - exp_min[k]);
        e.min_expansion_um = Some(um_min[k]);
        e.max_expansion_um = Some(um_max[k]);
        e.reversible_expansion_um = Some(um_max[k] - um_min[k]);
        e.drive_current = finite(vdf.drive_current[s]);
        e.expansion_stddev = finite(vdf.expansion_stddev[s]);
        e.ref_stddev = finite(vdf.ref_stddev[s]);
    }
    info!(
        "aligned {} of {} cycle starts to VDF samples",
        pairs.len(),
        cycle_rows.len()
    );
}
