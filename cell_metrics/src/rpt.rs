//! RPT summarizer: pulse resistances and eSOH fits for reference tests.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RptSettings};
use crate::esoh::{build_ocv_curve, esoh_est, Branch, EsohResult};
use crate::hppc::{get_rs_soc, PulseWindow};
use crate::metrics::{CellData, CycleMetrics, Protocol, RecordSpan};
use crate::CycleType;

pub fn is_rpt_span(span: &RecordSpan, settings: &RptSettings) -> bool {
    span.is_rpt
        || span.is_format
        || settings
            .markers
            .iter()
            .any(|m| span.test_name.contains(m.as_str()))
}

/// Samples of `span` with time in `[t_start, t_end]`.
fn sample_window(cell: &CellData, span: &RecordSpan, t_start: f64, t_end: f64) -> Range<usize> {
    let times = &cell.time[span.start..span.end];
    let lo = times.partition_point(|&t| t < t_start);
    let hi = times.partition_point(|&t| t <= t_end);
    span.start + lo..span.start + hi.max(lo)
}

fn branch<'a>(cell: &'a CellData, r: &Range<usize>) -> Branch<'a> {
    Branch {
        time: &cell.time[r.clone()],
        current: &cell.current[r.clone()],
        voltage: &cell.voltage[r.clone()],
    }
}

/// Counts of what the summarizer wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RptSummary {
    pub rpt_files: usize,
    pub hppc_rows: usize,
    pub esoh_fits: usize,
}

/// Walk the rows of every RPT-type record, attach pulse resistances to HPPC
/// rows and an eSOH fit to the charge row of each adjacent C/20 pair.
pub fn summarize_rpts(
    cell: &CellData,
    metrics: &mut CycleMetrics,
    config: &EngineConfig,
) -> RptSummary {
    let pad = config.rpt.window_padding_s;
    let mut summary = RptSummary::default();
    for span in cell
        .records
        .iter()
        .filter(|s| is_rpt_span(s, &config.rpt))
    {
        let rows: Vec<usize> = (0..metrics.rows.len())
            .filter(|&r| span.contains(metrics.rows[r].sample_index))
            .collect();
        if rows.is_empty() {
            continue;
        }
        summary.rpt_files += 1;
        let file_end = cell.time[span.last()];
        let windows: Vec<Range<usize>> = rows
            .iter()
            .enumerate()
            .map(|(n, &r)| {
                let t_start = metrics.rows[r].time - pad;
                let t_end = rows
                    .get(n + 1)
                    .map_or(file_end, |&next| metrics.rows[next].time + pad);
                sample_window(cell, span, t_start, t_end)
            })
            .collect();

        for (&r, w) in rows.iter().zip(&windows) {
            if metrics.rows[r].protocol != Some(Protocol::Hppc) {
                continue;
            }
            let pulses = get_rs_soc(
                PulseWindow {
                    time: &cell.time[w.clone()],
                    current: &cell.current[w.clone()],
                    voltage: &cell.voltage[w.clone()],
                    aht: &cell.aht[w.clone()],
                },
                &config.hppc,
                &config.project.pulse_currents,
            );
            if pulses.is_empty() {
                debug!("{}: no pulses in HPPC window at row {r}", span.test_name);
                continue;
            }
            metrics.rows[r].hppc = pulses;
            summary.hppc_rows += 1;
        }

        for n in 1..rows.len() {
            let (a, b) = (n - 1, n);
            let protocols = (metrics.rows[rows[a]].protocol, metrics.rows[rows[b]].protocol);
            let (charge, discharge) = match protocols {
                (Some(Protocol::C20Charge), Some(Protocol::C20Discharge)) => (a, b),
                (Some(Protocol::C20Discharge), Some(Protocol::C20Charge)) => (b, a),
                _ => continue,
            };
            if span.is_format || span.cycle_type == CycleType::Formation {
                debug!("{}: skipping eSOH for formation test", span.test_name);
                continue;
            }
            let result = match build_ocv_curve(
                branch(cell, &windows[charge]),
                branch(cell, &windows[discharge]),
                &config.esoh,
                config.project.i_c20,
            ) {
                Ok(curve) => esoh_est(&curve, &config.esoh),
                Err(e) => {
                    warn!("{}: could not build C/20 curve: {e}", span.test_name);
                    EsohResult::invalid()
                }
            };
            if result.is_valid() {
                summary.esoh_fits += 1;
            }
            metrics.rows[rows[charge]].esoh = Some(result);
        }
    }
    info!(
        "summarized {} RPT files: {} HPPC rows, {} eSOH fits",
        summary.rpt_files, summary.hppc_rows, summary.esoh_fits
    );
    summary
}
