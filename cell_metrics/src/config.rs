use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CycleType, EngineError};

pub const DEFAULT_PROJECT: &str = "DEFAULT";

/// Names with a dedicated entry in the project registry.
pub const KNOWN_PROJECTS: [&str; 5] = [
    "DEFAULT",
    "GMJULY2022",
    "UNKNOWN_PROJECT",
    "GMFEB23",
    "UMBL2022FEB",
];

/// Per-project cell constants.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectSettings {
    pub name: String,
    /// Largest plausible per-half-cycle capacity (Ah).
    pub qmax: f64,
    /// Slow-test (C/20) reference current magnitude (A).
    pub i_c20: f64,
    pub nominal_capacity: f64,
    pub pulse_currents: Vec<f64>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self::for_project(DEFAULT_PROJECT)
    }
}

impl ProjectSettings {
    /// Registry lookup; unrecognized names resolve to the `DEFAULT` entry.
    pub fn for_project(name: &str) -> Self {
        let key = name.trim().to_ascii_uppercase();
        let (name, qmax, i_c20, nominal, pulses) = match key.as_str() {
            "GMJULY2022" => ("GMJULY2022", 3.8, 0.177, 3.5, vec![3.0, 1.5, -3.0, -1.5, -0.5]),
            "UNKNOWN_PROJECT" => (
                "UNKNOWN_PROJECT",
                3.8,
                0.177,
                3.5,
                vec![3.0, 1.5, -3.0, -1.5, -0.5],
            ),
            "GMFEB23" => ("GMFEB23", 3.8, 0.177, 3.5, vec![2.0, 1.0, 0.5, -2.0, -1.0, -0.5]),
            "UMBL2022FEB" => (
                "UMBL2022FEB",
                2.8,
                0.125,
                2.5,
                vec![2.0, 1.0, 0.5, -2.0, -1.0, -0.5],
            ),
            _ => (DEFAULT_PROJECT, 3.8, 0.177, 3.5, vec![2.0, 1.0, -2.0, -1.0, -0.5]),
        };
        Self {
            name: name.to_string(),
            qmax,
            i_c20,
            nominal_capacity: nominal,
            pulse_currents: pulses,
        }
    }

    pub fn is_known(name: &str) -> bool {
        let key = name.trim().to_ascii_uppercase();
        KNOWN_PROJECTS.iter().any(|p| *p == key)
    }
}

/// Voltage/duration/throughput limits attached to a cycle type.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct CycleLimits {
    pub v_max_cycle: f64,
    pub v_min_cycle: f64,
    pub dt_min: f64,
    pub dah_min: f64,
}

impl CycleLimits {
    pub fn for_cycle_type(cycle_type: CycleType) -> Self {
        let (v_max_cycle, v_min_cycle, dt_min, dah_min) = match cycle_type {
            CycleType::Cyc => (3.8, 3.8, 600.0, 0.1),
            CycleType::Rpt => (4.1, 3.8, 600.0, 0.1),
            CycleType::Test11 => (3.6, 3.6, 600.0, 0.1),
            CycleType::Eis => (4.1, 3.8, 600.0, 0.5),
            CycleType::Cal => (3.8, 3.8, 600.0, 0.5),
            CycleType::Formation => (3.8, 3.8, 3600.0, 0.5),
        };
        Self {
            v_max_cycle,
            v_min_cycle,
            dt_min,
            dah_min,
        }
    }
}

fn default_cycle_limits() -> BTreeMap<CycleType, CycleLimits> {
    CycleType::ALL
        .iter()
        .map(|&ct| (ct, CycleLimits::for_cycle_type(ct)))
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmenterSettings {
    /// Currents with magnitude at or below this are treated as rest (A).
    pub sign_threshold_a: f64,
    /// Sampling gaps longer than this do not contribute throughput (s).
    pub gap_threshold_s: f64,
    pub rainflow_classes: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            sign_threshold_a: 1e-5,
            gap_threshold_s: 600.0,
            rainflow_classes: 10,
        }
    }
}

/// Capacity-check sub-window classification thresholds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolThresholds {
    /// A window is HPPC when its current changes sign more often than this.
    pub hppc_min_sign_changes: usize,
    pub c20_min_duration_h: f64,
    /// Mean C/20 current must stay below `qmax / c20_current_divisor`.
    pub c20_current_divisor: f64,
}

impl Default for ProtocolThresholds {
    fn default() -> Self {
        Self {
            hppc_min_sign_changes: 10,
            c20_min_duration_h: 8.0,
            c20_current_divisor: 18.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExpansionSettings {
    pub min_raw_count: f64,
    pub max_raw_count: f64,
    /// Temperatures in `[glitch_temp_low, glitch_temp_high)` are sensor glitches.
    pub glitch_temp_low: f64,
    pub glitch_temp_high: f64,
    pub match_tolerance_s: f64,
    /// Reference thickness of the fixture (mm).
    pub reference_thickness_mm: f64,
    pub count_scale: f64,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self {
            min_raw_count: 10.0,
            max_raw_count: 1e7,
            glitch_temp_low: 200.0,
            glitch_temp_high: 250.0,
            match_tolerance_s: 10.0,
            reference_thickness_mm: 30.6,
            count_scale: 1e-6,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HppcSettings {
    /// Minimum current step that starts a pulse (A).
    pub edge_threshold_a: f64,
    /// Currents below this magnitude count as rest (A).
    pub rest_threshold_a: f64,
    /// Rest window averaged before the pulse edge (s).
    pub pre_window_s: f64,
    /// Window averaged right after the edge and at the relaxation point (s).
    pub instant_window_s: f64,
    /// Time after the edge at which the long resistance is sampled (s).
    pub relax_s: f64,
    /// Longer steps are SOC adjustments, not pulses (s).
    pub max_pulse_duration_s: f64,
    pub min_samples: usize,
}

impl Default for HppcSettings {
    fn default() -> Self {
        Self {
            edge_threshold_a: 0.1,
            rest_threshold_a: 0.02,
            pre_window_s: 5.0,
            instant_window_s: 1.0,
            relax_s: 10.0,
            max_pulse_duration_s: 60.0,
            min_samples: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EsohSettings {
    /// Start point `[Cn, x100, Cp, y100]`.
    pub x0: [f64; 4],
    pub lower: [f64; 4],
    pub upper: [f64; 4],
    /// Baseline weight.
    pub w1: f64,
    /// Weight inside the central SOC band.
    pub w2: f64,
    /// Weight around the two strongest dV/dQ peaks.
    pub w3: f64,
    /// Central band as fractions of the curve capacity.
    pub central_band: (f64, f64),
    /// Half-width of a peak neighbourhood as a fraction of capacity.
    pub peak_halfwidth: f64,
    /// Relative weight of dV/dQ residuals against voltage residuals.
    pub dvdq_weight: f64,
    pub penalty_weight: f64,
    pub rmse_v_max: f64,
    pub grid_points: usize,
    pub sg_window: usize,
    pub sg_order: usize,
    /// Fraction of `i_c20` a sample must reach to count as constant current.
    pub cc_fraction: f64,
    pub seed_grid: usize,
    pub max_iterations: usize,
}

impl Default for EsohSettings {
    fn default() -> Self {
        Self {
            x0: [4.2, 0.85, 5.5, 0.3],
            lower: [1.0, 0.0, 1.0, 0.0],
            upper: [5.0, 1.0, 6.5, 1.0],
            w1: 0.2,
            w2: 1.0,
            w3: 2.0,
            central_band: (0.1, 0.9),
            peak_halfwidth: 0.05,
            dvdq_weight: 0.1,
            penalty_weight: 10.0,
            rmse_v_max: 0.020,
            grid_points: 400,
            sg_window: 21,
            sg_order: 3,
            cc_fraction: 0.9,
            seed_grid: 4,
            max_iterations: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RptSettings {
    /// Padding added on both sides of an RPT sub-window (s).
    pub window_padding_s: f64,
    /// Test-name markers of RPT-type files.
    pub markers: Vec<String>,
}

impl Default for RptSettings {
    fn default() -> Self {
        Self {
            window_padding_s: 30.0,
            markers: ["RPT", "_F", "_Cy100", "_Cby100"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Everything the engine needs besides the records themselves.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub project: ProjectSettings,
    pub cycle_limits: BTreeMap<CycleType, CycleLimits>,
    pub segmenter: SegmenterSettings,
    pub protocol: ProtocolThresholds,
    pub expansion: ExpansionSettings,
    pub hppc: HppcSettings,
    pub esoh: EsohSettings,
    pub rpt: RptSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project: ProjectSettings::default(),
            cycle_limits: default_cycle_limits(),
            segmenter: SegmenterSettings::default(),
            protocol: ProtocolThresholds::default(),
            expansion: ExpansionSettings::default(),
            hppc: HppcSettings::default(),
            esoh: EsohSettings::default(),
            rpt: RptSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&data)
    }

    pub fn limits_for(&self, cycle_type: CycleType) -> CycleLimits {
        self.cycle_limits
            .get(&cycle_type)
            .copied()
            .unwrap_or_else(|| CycleLimits::for_cycle_type(cycle_type))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.project.qmax > 0.0) {
            return Err(EngineError::Config("qmax must be positive".into()));
        }
        if !(self.project.i_c20 > 0.0) {
            return Err(EngineError::Config("i_c20 must be positive".into()));
        }
        if self.segmenter.rainflow_classes == 0 {
            return Err(EngineError::Config("rainflow_classes must be at least 1".into()));
        }
        if self.esoh.sg_window % 2 == 0 || self.esoh.sg_window <= self.esoh.sg_order {
            return Err(EngineError::Config(
                "sg_window must be odd and larger than sg_order".into(),
            ));
        }
        for k in 0..4 {
            if self.esoh.lower[k] > self.esoh.upper[k] {
                return Err(EngineError::Config(format!("eSOH bound {k} is inverted")));
            }
        }
        Ok(())
    }
}
