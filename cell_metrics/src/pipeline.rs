//! Orchestrator: one cell's records in, the three output tables out.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::expansion::{align_expansion, CellDataVdf};
use crate::metrics::{annotate_record, CellData, CycleMetrics};
use crate::rpt::{summarize_rpts, RptSummary};
use crate::segment::SegmentationError;
use crate::{EngineError, TestRecord, VdfRecord};

/// Output tables of one cell.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CellOutputs {
    pub cell_data: CellData,
    pub cycle_metrics: CycleMetrics,
    pub cell_data_vdf: CellDataVdf,
    /// Records whose segmentation failed; they contribute samples but no
    /// boundaries.
    pub record_errors: Vec<(String, SegmentationError)>,
    pub rpt_summary: RptSummary,
}

/// Run every stage for one cell.
///
/// Records are ordered by their first sample time (stable, so equal start
/// times keep input order). A record that fails segmentation is logged and
/// kept without boundaries; only an invalid configuration or a cell without
/// any samples is an error.
pub fn process_cell(
    cycler: &[TestRecord],
    vdf: &[VdfRecord],
    config: &EngineConfig,
) -> Result<CellOutputs, EngineError> {
    config.validate()?;
    let mut records = cycler.to_vec();
    records.sort_by_key(|r| OrderedFloat(r.first_time().unwrap_or(f64::INFINITY)));
    if records.iter().all(|r| r.samples.is_empty()) {
        return Err(EngineError::InsufficientData);
    }
    info!("combining {} cycler records", records.len());

    let annotations: Vec<_> = records.iter().map(|r| annotate_record(r, config)).collect();
    let record_errors: Vec<(String, SegmentationError)> = records
        .iter()
        .zip(&annotations)
        .filter_map(|(r, a)| a.error.clone().map(|e| (r.test_name.clone(), e)))
        .collect();
    if !record_errors.is_empty() {
        warn!(
            "{} of {} records produced no cycles",
            record_errors.len(),
            records.len()
        );
    }

    let mut cell_data = CellData::assemble(&records, &annotations);
    cell_data.reconcile();
    let mut cycle_metrics = CycleMetrics::build(&cell_data, config);

    let mut cell_data_vdf = CellDataVdf::combine(vdf, &config.expansion);
    align_expansion(&mut cell_data_vdf, &mut cycle_metrics, &config.expansion);

    let rpt_summary = summarize_rpts(&cell_data, &mut cycle_metrics, config);

    Ok(CellOutputs {
        cell_data,
        cycle_metrics,
        cell_data_vdf,
        record_errors,
        rpt_summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Protocol;
    use crate::ocv::ElectrodeParams;
    use crate::{Calibration, CyclerSample, VdfSample};

    const R0: f64 = 0.05;
    const R1: f64 = 0.03;
    const TAU: f64 = 5.0;

    /// Piecewise-constant current profile with a first-order voltage model.
    struct RecordBuilder {
        samples: Vec<CyclerSample>,
        t: f64,
        aht: f64,
        /// Ah discharged from full.
        qs: f64,
        params: Option<ElectrodeParams>,
    }

    impl RecordBuilder {
        fn new(t0: f64, qs: f64, params: Option<ElectrodeParams>) -> Self {
            Self {
                samples: Vec::new(),
                t: t0,
                aht: 0.0,
                qs,
                params,
            }
        }

        fn seg(&mut self, current: f64, duration: f64, dt: f64) -> &mut Self {
            let n = (duration / dt).round() as usize;
            for k in 0..n {
                let t_step = k as f64 * dt;
                let ocv = self.params.map_or(3.7, |p| p.voltage(self.qs));
                let v = ocv + current * (R0 + R1 * (1.0 - (-t_step / TAU).exp()));
                self.samples.push(CyclerSample {
                    time: self.t + t_step,
                    current,
                    voltage: v,
                    temperature: Some(25.0 + 2.0 * current.abs()),
                    aht: self.aht,
                    step_index: 0,
                });
                self.aht += current.abs() * dt / 3600.0;
                self.qs -= current * dt / 3600.0;
            }
            self.t += n as f64 * dt;
            self
        }

        fn build(&self, name: &str) -> TestRecord {
            TestRecord::new(name, self.samples.clone())
        }
    }

    fn cyc_record() -> TestRecord {
        let mut b = RecordBuilder::new(0.0, 0.0, None);
        b.seg(0.0, 600.0, 10.0);
        for _ in 0..3 {
            b.seg(1.0, 3600.0, 10.0)
                .seg(0.0, 600.0, 10.0)
                .seg(-1.0, 3600.0, 10.0)
                .seg(0.0, 600.0, 10.0);
        }
        b.build("CELL01_CYC_001")
    }

    fn rpt_record(t0: f64) -> TestRecord {
        let params = ElectrodeParams::from_array([4.4, 0.84, 5.6, 0.3]);
        let mut b = RecordBuilder::new(t0, 3.54, Some(params));
        b.seg(0.0, 600.0, 10.0)
            .seg(1.0, 3.54 * 3600.0, 10.0)
            .seg(0.0, 1800.0, 10.0);
        for _ in 0..7 {
            b.seg(0.0, 300.0, 1.0)
                .seg(-1.0, 10.0, 1.0)
                .seg(0.0, 40.0, 1.0)
                .seg(0.75, 10.0, 1.0)
                .seg(0.0, 40.0, 1.0)
                .seg(-1.0, 1800.0, 1.0);
        }
        b.seg(0.0, 1800.0, 10.0)
            .seg(0.177, 72000.0, 10.0)
            .seg(0.0, 1800.0, 10.0)
            .seg(-0.177, 72000.0, 10.0)
            .seg(0.0, 600.0, 10.0);
        b.build("CELL01_RPT_001")
    }

    fn vdf_record() -> VdfRecord {
        let samples = (0..=430)
            .map(|k| {
                let t = k as f64 * 60.0;
                VdfSample {
                    time: t,
                    expansion: 1.0e6 + 1.0e4 * (t / 8400.0 * std::f64::consts::TAU).sin(),
                    expansion_ref: Some(5.0e5),
                    temperature: Some(25.0),
                    drive_current: Some(0.02),
                    expansion_stddev: Some(3.0),
                    ref_stddev: None,
                }
            })
            .collect();
        VdfRecord {
            test_name: "CELL01_VDF".into(),
            calibration: Some(Calibration {
                x1: 1.0,
                x2: 0.0,
                c: 0.0,
            }),
            samples,
        }
    }

    #[test]
    fn two_file_cell_end_to_end() {
        let cyc = cyc_record();
        let rpt = rpt_record(30_000.0);
        // Out of order on input; the orchestrator sorts by start time.
        let out = process_cell(&[rpt, cyc], &[vdf_record()], &EngineConfig::default()).unwrap();
        assert!(out.record_errors.is_empty());
        assert_eq!(out.cell_data.records[0].test_name, "CELL01_CYC_001");
        assert!(out.cycle_metrics.len() < out.cell_data.len());

        let cyc_charges: Vec<_> = out
            .cycle_metrics
            .rows_for_test("CELL01_CYC_001")
            .filter(|r| r.is_charge_start)
            .collect();
        assert_eq!(cyc_charges.len(), 3);
        for row in &cyc_charges {
            let cap = row.cycler.charge_capacity.unwrap();
            assert!((cap - 1.0).abs() < 0.01, "charge capacity {cap}");
            // Averaged over the half cycle including its trailing rest.
            let avg = row.cycler.avg_charge_current.unwrap();
            assert!(avg > 0.8 && avg < 1.0, "average current {avg}");
            assert!(row.cycler.max_cycle_voltage.unwrap() > row.cycler.min_cycle_voltage.unwrap());
            assert!(row.expansion.time_vdf.is_some());
            let e = &row.expansion;
            assert!(e.min_expansion_um.unwrap() <= e.max_expansion_um.unwrap());
            assert_eq!(e.ref_stddev, None);
        }
        let cyc_discharges = out
            .cycle_metrics
            .rows_for_test("CELL01_CYC_001")
            .filter(|r| r.is_discharge_start)
            .count();
        assert_eq!(cyc_discharges, 3);
        assert!(out.cell_data_vdf.is_cycle_start.iter().filter(|&&f| f).count() >= 3);

        let rpt_rows: Vec<_> = out.cycle_metrics.rows_for_test("CELL01_RPT_001").collect();
        let hppc: Vec<_> = rpt_rows
            .iter()
            .filter(|r| r.protocol == Some(Protocol::Hppc))
            .collect();
        assert_eq!(hppc.len(), 1);
        assert_eq!(hppc[0].hppc.len(), 14);
        for p in &hppc[0].hppc {
            assert!((p.r_s - R0).abs() < 1e-3, "R_s {}", p.r_s);
            assert!(p.r_l > p.r_s);
        }

        let fitted: Vec<_> = rpt_rows.iter().filter_map(|r| r.esoh).collect();
        assert_eq!(fitted.len(), 1);
        let esoh = fitted[0];
        assert!(esoh.is_valid());
        assert!((esoh.cap - 3.54).abs() < 0.05, "cap {}", esoh.cap);
        assert!(esoh.err_v < 0.02);
        assert_eq!(out.rpt_summary.esoh_fits, 1);
        let charge_row = rpt_rows.iter().find(|r| r.esoh.is_some()).unwrap();
        assert_eq!(charge_row.protocol, Some(Protocol::C20Charge));
    }

    #[test]
    fn record_without_cycles_is_kept() {
        let mut b = RecordBuilder::new(26_000.0, 0.0, None);
        b.seg(0.0, 600.0, 10.0);
        let rest = b.build("CELL02_CAL_001");
        let out = process_cell(&[rest, cyc_record()], &[], &EngineConfig::default()).unwrap();
        assert_eq!(out.record_errors.len(), 1);
        assert_eq!(out.record_errors[0].0, "CELL02_CAL_001");
        assert_eq!(out.cell_data.records.len(), 2);
        assert_eq!(out.cycle_metrics.cycle_rows().count(), 3);
        assert!(out.cell_data_vdf.is_empty());
        assert!(out
            .cycle_metrics
            .rows
            .iter()
            .all(|r| r.expansion.min_expansion.is_none()));

        let json = serde_json::to_value(&out).unwrap();
        let errors: Vec<(String, SegmentationError)> =
            serde_json::from_value(json["record_errors"].clone()).unwrap();
        assert_eq!(errors, out.record_errors);
        assert_eq!(json["rpt_summary"]["rpt_files"], 0);
    }

    #[test]
    fn empty_cell_is_an_error() {
        assert!(matches!(
            process_cell(&[], &[], &EngineConfig::default()),
            Err(EngineError::InsufficientData)
        ));
        let mut bad = EngineConfig::default();
        bad.project.qmax = 0.0;
        assert!(matches!(
            process_cell(&[cyc_record()], &[], &bad),
            Err(EngineError::Config(_))
        ));
    }
}
