//! Cycle detection and health-metrics engine for battery cycling data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod esoh;
pub mod expansion;
pub mod hppc;
pub mod metrics;
pub mod ocv;
pub mod pipeline;
pub mod rainflow;
pub mod rpt;
pub mod segment;
pub mod signal;
pub mod smoothing;

pub use config::{CycleLimits, EngineConfig, ProjectSettings};
pub use esoh::{esoh_est, EsohResult};
pub use expansion::{find_matching_timestamp, CellDataVdf, TimestampMatch};
pub use hppc::{get_rs_soc, PulseResult};
pub use metrics::{CellData, CycleMetrics, CycleMetricsRow, Protocol};
pub use ocv::{calc_opc, ElectrodeParams, OcvCurve};
pub use pipeline::{process_cell, CellOutputs};
pub use segment::{find_cycle_idx, match_charge_discharge, BoundarySet, SegmentationError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("insufficient data for metric computation")]
    InsufficientData,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cycle segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),
    #[error("eSOH fit failed: {0}")]
    Fit(String),
}

/// Test family a cycler record belongs to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CycleType {
    #[serde(rename = "CYC")]
    Cyc,
    #[serde(rename = "RPT")]
    Rpt,
    #[serde(rename = "Test11")]
    Test11,
    #[serde(rename = "EIS")]
    Eis,
    #[serde(rename = "CAL")]
    Cal,
    #[serde(rename = "_F")]
    Formation,
}

impl Default for CycleType {
    fn default() -> Self {
        CycleType::Cyc
    }
}

impl CycleType {
    pub const ALL: [CycleType; 6] = [
        CycleType::Cyc,
        CycleType::Rpt,
        CycleType::Test11,
        CycleType::Eis,
        CycleType::Cal,
        CycleType::Formation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleType::Cyc => "CYC",
            CycleType::Rpt => "RPT",
            CycleType::Test11 => "Test11",
            CycleType::Eis => "EIS",
            CycleType::Cal => "CAL",
            CycleType::Formation => "_F",
        }
    }

    /// First cycle type whose upper-cased label appears in `test_name`, else `CYC`.
    pub fn from_test_name(test_name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|ct| test_name.contains(&ct.as_str().to_ascii_uppercase()))
            .unwrap_or_default()
    }
}

/// One row of a cycler time series.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CyclerSample {
    pub time: f64,
    pub current: f64,
    pub voltage: f64,
    #[serde(default)]
    pub temperature: Option<f64>,
    pub aht: f64,
    #[serde(default)]
    pub step_index: i64,
}

/// One cycler test file, already normalized by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRecord {
    pub test_name: String,
    #[serde(default)]
    pub cycle_type: Option<CycleType>,
    #[serde(default)]
    pub is_rpt: Option<bool>,
    #[serde(default)]
    pub is_format: Option<bool>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub samples: Vec<CyclerSample>,
}

impl TestRecord {
    pub fn new(test_name: impl Into<String>, samples: Vec<CyclerSample>) -> Self {
        Self {
            test_name: test_name.into(),
            cycle_type: None,
            is_rpt: None,
            is_format: None,
            start_time: None,
            samples,
        }
    }

    pub fn cycle_type(&self) -> CycleType {
        self.cycle_type
            .unwrap_or_else(|| CycleType::from_test_name(&self.test_name))
    }

    pub fn is_rpt(&self) -> bool {
        self.is_rpt
            .unwrap_or_else(|| self.test_name.to_ascii_lowercase().contains("rpt"))
    }

    pub fn is_format(&self) -> bool {
        self.is_format
            .unwrap_or_else(|| self.test_name.to_ascii_lowercase().contains("_f_"))
    }

    /// RPT and formation files carry capacity-check cycles.
    pub fn is_capacity_check(&self) -> bool {
        self.is_rpt() || self.is_format()
    }

    pub fn first_time(&self) -> Option<f64> {
        self.samples.first().map(|s| s.time)
    }

    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time).collect()
    }

    pub fn currents(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.current).collect()
    }
}

/// Quadratic calibration of the expansion sensor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Calibration {
    pub x1: f64,
    pub x2: f64,
    pub c: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VdfSample {
    pub time: f64,
    /// Raw expansion count.
    pub expansion: f64,
    #[serde(default)]
    pub expansion_ref: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub drive_current: Option<f64>,
    #[serde(default)]
    pub expansion_stddev: Option<f64>,
    #[serde(default)]
    pub ref_stddev: Option<f64>,
}

/// One expansion-sensor (VDF) file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VdfRecord {
    pub test_name: String,
    #[serde(default)]
    pub calibration: Option<Calibration>,
    pub samples: Vec<VdfSample>,
}
