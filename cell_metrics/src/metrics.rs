//! Cell-level concatenation and the per-cycle metrics table.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{EngineConfig, ProtocolThresholds};
use crate::esoh::EsohResult;
use crate::expansion::ExpansionMetrics;
use crate::hppc::PulseResult;
use crate::segment::{find_cycle_idx, BoundarySet, SegmentationError};
use crate::signal::{
    count_sign_changes, mean, segment_average, segment_delta, segment_minmax, Segment,
};
use crate::{CycleType, TestRecord};

/// Capacity-check sub-window protocol.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    #[serde(rename = "HPPC")]
    Hppc,
    #[serde(rename = "C/20 charge")]
    C20Charge,
    #[serde(rename = "C/20 discharge")]
    C20Discharge,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Hppc => "HPPC",
            Protocol::C20Charge => "C/20 charge",
            Protocol::C20Discharge => "C/20 discharge",
        }
    }
}

/// Classify the current strictly inside `(t_start, t_end)`.
pub fn classify_protocol(
    time: &[f64],
    current: &[f64],
    t_start: f64,
    t_end: f64,
    qmax: f64,
    thresholds: &ProtocolThresholds,
    sign_threshold: f64,
) -> Option<Protocol> {
    let window: Vec<f64> = time
        .iter()
        .zip(current)
        .filter(|(t, _)| **t > t_start && **t < t_end)
        .map(|(_, &i)| i)
        .collect();
    if window.is_empty() {
        return None;
    }
    if count_sign_changes(&window, sign_threshold) > thresholds.hppc_min_sign_changes {
        return Some(Protocol::Hppc);
    }
    let duration_h = (t_end - t_start) / 3600.0;
    if duration_h <= thresholds.c20_min_duration_h {
        return None;
    }
    let i_mean = mean(&window);
    let limit = qmax / thresholds.c20_current_divisor;
    if i_mean > 0.0 && i_mean < limit {
        Some(Protocol::C20Charge)
    } else if i_mean < 0.0 && i_mean > -limit {
        Some(Protocol::C20Discharge)
    } else {
        None
    }
}

/// Segmentation and tags of one record, in record-local indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordAnnotation {
    pub boundaries: BoundarySet,
    pub capacity_check: bool,
    pub protocols: Vec<(usize, Protocol)>,
    pub error: Option<SegmentationError>,
}

pub fn annotate_record(record: &TestRecord, config: &EngineConfig) -> RecordAnnotation {
    let time = record.times();
    let current = record.currents();
    let limits = config.limits_for(record.cycle_type());
    let (boundaries, error) = match find_cycle_idx(&time, &current, &limits, &config.segmenter) {
        Ok(seg) => (seg.boundaries, None),
        Err(err) => {
            warn!("{}: no cycles detected ({err})", record.test_name);
            (BoundarySet::default(), Some(err))
        }
    };

    let capacity_check = record.is_capacity_check();
    let mut protocols = Vec::new();
    if capacity_check && !time.is_empty() {
        let merged = boundaries.merged();
        for (k, &b) in merged.iter().enumerate() {
            let t_end = merged
                .get(k + 1)
                .map(|&n| time[n])
                .unwrap_or(time[time.len() - 1]);
            if let Some(p) = classify_protocol(
                &time,
                &current,
                time[b],
                t_end,
                config.project.qmax,
                &config.protocol,
                config.segmenter.sign_threshold_a,
            ) {
                protocols.push((b, p));
            }
        }
    }
    RecordAnnotation {
        boundaries,
        capacity_check,
        protocols,
        error,
    }
}

/// Where one input record sits in the concatenated series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordSpan {
    pub test_name: String,
    pub cycle_type: CycleType,
    pub is_rpt: bool,
    pub is_format: bool,
    pub start: usize,
    /// Exclusive.
    pub end: usize,
}

impl RecordSpan {
    pub fn contains(&self, idx: usize) -> bool {
        idx >= self.start && idx < self.end
    }

    pub fn last(&self) -> usize {
        self.end.saturating_sub(1)
    }
}

/// Per-sample table of every cycler record of a cell.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CellData {
    pub time: Vec<f64>,
    pub timestamp: Vec<Option<DateTime<Utc>>>,
    pub current: Vec<f64>,
    pub voltage: Vec<f64>,
    pub temperature: Vec<f64>,
    pub aht: Vec<f64>,
    pub step_index: Vec<i64>,
    pub is_charge_start: Vec<bool>,
    pub is_discharge_start: Vec<bool>,
    pub is_capacity_check: Vec<bool>,
    pub is_cycle_start: Vec<bool>,
    pub cycle_type: Vec<Option<CycleType>>,
    pub protocol: Vec<Option<Protocol>>,
    pub test_name: Vec<Option<String>>,
    pub records: Vec<RecordSpan>,
}

impl CellData {
    /// Concatenate records with their annotations; boundary rows get tags.
    pub fn assemble(records: &[TestRecord], annotations: &[RecordAnnotation]) -> Self {
        let total: usize = records.iter().map(|r| r.samples.len()).sum();
        let mut cell = CellData {
            time: Vec::with_capacity(total),
            timestamp: Vec::with_capacity(total),
            current: Vec::with_capacity(total),
            voltage: Vec::with_capacity(total),
            temperature: Vec::with_capacity(total),
            aht: Vec::with_capacity(total),
            step_index: Vec::with_capacity(total),
            is_charge_start: vec![false; total],
            is_discharge_start: vec![false; total],
            is_capacity_check: vec![false; total],
            is_cycle_start: vec![false; total],
            cycle_type: vec![None; total],
            protocol: vec![None; total],
            test_name: vec![None; total],
            records: Vec::with_capacity(records.len()),
        };

        for (record, ann) in records.iter().zip(annotations) {
            let offset = cell.time.len();
            let t0 = record.first_time().unwrap_or(0.0);
            for s in &record.samples {
                cell.time.push(s.time);
                cell.timestamp.push(record.start_time.map(|start| {
                    start + Duration::milliseconds(((s.time - t0) * 1000.0).round() as i64)
                }));
                cell.current.push(s.current);
                cell.voltage.push(s.voltage);
                cell.temperature.push(s.temperature.unwrap_or(f64::NAN));
                cell.aht.push(s.aht);
                cell.step_index.push(s.step_index);
            }
            let cycle_type = record.cycle_type();
            for &c in &ann.boundaries.charge_start {
                let idx = offset + c;
                cell.is_charge_start[idx] = true;
                cell.is_capacity_check[idx] = ann.capacity_check;
            }
            for &d in &ann.boundaries.discharge_start {
                cell.is_discharge_start[offset + d] = true;
            }
            for b in ann.boundaries.merged() {
                let idx = offset + b;
                cell.cycle_type[idx] = Some(cycle_type);
                cell.test_name[idx] = Some(record.test_name.clone());
            }
            for &(b, p) in &ann.protocols {
                cell.protocol[offset + b] = Some(p);
            }
            cell.records.push(RecordSpan {
                test_name: record.test_name.clone(),
                cycle_type,
                is_rpt: record.is_rpt(),
                is_format: record.is_format(),
                start: offset,
                end: cell.time.len(),
            });
        }
        cell
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    fn flagged(flags: &[bool]) -> Vec<usize> {
        flags
            .iter()
            .enumerate()
            .filter_map(|(k, &f)| f.then_some(k))
            .collect()
    }

    pub fn charge_starts(&self) -> Vec<usize> {
        Self::flagged(&self.is_charge_start)
    }

    pub fn discharge_starts(&self) -> Vec<usize> {
        Self::flagged(&self.is_discharge_start)
    }

    pub fn cycle_starts(&self) -> Vec<usize> {
        Self::flagged(&self.is_cycle_start)
    }

    pub fn boundary_indices(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&k| self.is_charge_start[k] || self.is_discharge_start[k])
            .collect()
    }

    pub fn span_of(&self, idx: usize) -> Option<&RecordSpan> {
        let pos = self.records.partition_point(|r| r.end <= idx);
        self.records.get(pos).filter(|r| r.contains(idx))
    }

    /// Clear boundary flags without a counterpart across the whole cell,
    /// then mark cycle starts.
    pub fn reconcile(&mut self) {
        let charge = self.charge_starts();
        let discharge = self.discharge_starts();
        let matched = pair_across_cell(&charge, &discharge);
        let mut cleared = 0usize;
        for c in charge {
            if matched.charge_start.binary_search(&c).is_err() {
                self.is_charge_start[c] = false;
                cleared += 1;
            }
        }
        for d in discharge {
            if matched.discharge_start.binary_search(&d).is_err() {
                self.is_discharge_start[d] = false;
                cleared += 1;
            }
        }
        for k in 0..self.len() {
            if self.is_capacity_check[k] && !self.is_charge_start[k] {
                self.is_capacity_check[k] = false;
            }
            if !self.is_charge_start[k] && !self.is_discharge_start[k] {
                self.cycle_type[k] = None;
                self.protocol[k] = None;
                self.test_name[k] = None;
            }
            self.is_cycle_start[k] = self.is_charge_start[k];
        }
        if cleared > 0 {
            info!("cleared {cleared} unmatched boundaries across the cell");
        }
    }
}

/// Values written by the metrics builder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CyclerMetrics {
    pub charge_capacity: Option<f64>,
    pub discharge_capacity: Option<f64>,
    pub min_cycle_voltage: Option<f64>,
    pub max_cycle_voltage: Option<f64>,
    pub min_cycle_temperature: Option<f64>,
    pub max_cycle_temperature: Option<f64>,
    pub avg_charge_current: Option<f64>,
    pub avg_discharge_current: Option<f64>,
}

/// One charge or discharge boundary. Each stage fills only its own group:
/// `cycler` by the builder, `expansion` by the aligner, `hppc` and `esoh`
/// by the RPT summarizer. `None` means not computed, NaN means invalid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetricsRow {
    pub sample_index: usize,
    pub time: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub aht: f64,
    pub cycle_type: Option<CycleType>,
    pub protocol: Option<Protocol>,
    pub is_discharge_start: bool,
    pub is_charge_start: bool,
    pub is_capacity_check: bool,
    pub is_cycle_start: bool,
    pub test_name: String,
    pub cycler: CyclerMetrics,
    pub expansion: ExpansionMetrics,
    pub hppc: Vec<PulseResult>,
    pub esoh: Option<EsohResult>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub rows: Vec<CycleMetricsRow>,
}

impl CycleMetrics {
    pub fn build(cell: &CellData, config: &EngineConfig) -> Self {
        let boundaries = cell.boundary_indices();
        let mut rows: Vec<CycleMetricsRow> = boundaries
            .iter()
            .map(|&k| CycleMetricsRow {
                sample_index: k,
                time: cell.time[k],
                timestamp: cell.timestamp[k],
                aht: cell.aht[k],
                cycle_type: cell.cycle_type[k],
                protocol: cell.protocol[k],
                is_discharge_start: cell.is_discharge_start[k],
                is_charge_start: cell.is_charge_start[k],
                is_capacity_check: cell.is_capacity_check[k],
                is_cycle_start: cell.is_cycle_start[k],
                test_name: cell.test_name[k].clone().unwrap_or_default(),
                cycler: CyclerMetrics::default(),
                expansion: ExpansionMetrics::default(),
                hppc: Vec::new(),
                esoh: None,
            })
            .collect();
        if rows.is_empty() {
            return Self { rows };
        }

        let charge = cell.charge_starts();
        let discharge = cell.discharge_starts();
        let classes = [
            half_cycle_segments(cell, &charge, &boundaries),
            half_cycle_segments(cell, &discharge, &boundaries),
        ];
        let caps = segment_delta(&cell.time, &cell.aht, &classes, config.project.qmax);
        let avgs = segment_average(&cell.time, &cell.current, &classes);

        let cycles = cell.cycle_starts();
        let mut cycle_bounds = cycles.clone();
        cycle_bounds.push(cell.len() - 1);
        let (v_max, v_min) = segment_minmax(&cell.voltage, &cycle_bounds);
        let (t_max, t_min) = segment_minmax(&cell.temperature, &cycle_bounds);

        for row in rows.iter_mut() {
            let k = row.sample_index;
            if let Ok(n) = charge.binary_search(&k) {
                row.cycler.charge_capacity = Some(caps[0][n]);
                row.cycler.avg_charge_current = Some(avgs[0][n]);
            }
            if let Ok(n) = discharge.binary_search(&k) {
                row.cycler.discharge_capacity = Some(caps[1][n]);
                row.cycler.avg_discharge_current = Some(avgs[1][n]);
            }
            if let Ok(n) = cycles.binary_search(&k) {
                row.cycler.max_cycle_voltage = Some(v_max[n]);
                row.cycler.min_cycle_voltage = Some(v_min[n]);
                row.cycler.max_cycle_temperature = Some(t_max[n]);
                row.cycler.min_cycle_temperature = Some(t_min[n]);
            }
        }
        info!(
            "found {} samples, {} boundaries, {} cycles",
            cell.len(),
            rows.len(),
            cycles.len()
        );
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cycle_rows(&self) -> impl Iterator<Item = &CycleMetricsRow> {
        self.rows.iter().filter(|r| r.is_cycle_start)
    }

    pub fn rows_for_test<'a>(
        &'a self,
        test_name: &'a str,
    ) -> impl Iterator<Item = &'a CycleMetricsRow> + 'a {
        self.rows.iter().filter(move |r| r.test_name == test_name)
    }
}

/// Pair each charge with the first discharge after it, provided no other
/// charge comes in between.
fn pair_across_cell(charge: &[usize], discharge: &[usize]) -> BoundarySet {
    let mut set = BoundarySet::default();
    for (n, &c) in charge.iter().enumerate() {
        let pos = discharge.partition_point(|&d| d <= c);
        let Some(&d) = discharge.get(pos) else {
            break;
        };
        if charge.get(n + 1).map_or(true, |&next| d < next) {
            set.charge_start.push(c);
            set.discharge_start.push(d);
        }
    }
    set
}

/// Each start runs to the next boundary of either kind, bounded by the end
/// of its own record.
fn half_cycle_segments(cell: &CellData, starts: &[usize], boundaries: &[usize]) -> Vec<Segment> {
    starts
        .iter()
        .map(|&s| {
            let record_last = cell.span_of(s).map(|r| r.last()).unwrap_or(s);
            let pos = boundaries.partition_point(|&b| b <= s);
            let next = boundaries.get(pos).copied().unwrap_or(record_last);
            Segment::new(s, next.min(record_last))
        })
        .collect()
}
