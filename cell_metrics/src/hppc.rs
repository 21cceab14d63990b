//! Pulse-resistance extraction from HPPC sub-windows.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HppcSettings;
use crate::signal::mean;

/// One current pulse and the resistances derived from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseResult {
    /// Mean signed pulse current (A).
    pub current: f64,
    /// Time from the edge to the return to rest (s).
    pub duration: f64,
    /// Throughput from the start of the sub-window to the pulse edge (Ah).
    pub q: f64,
    /// Instantaneous resistance right after the edge (ohm).
    pub r_s: f64,
    /// Resistance after relaxation (ohm).
    pub r_l: f64,
    /// Closest entry of the project's pulse-current list.
    pub nominal_current: Option<f64>,
}

/// Columns of an HPPC sub-window.
#[derive(Clone, Copy, Debug)]
pub struct PulseWindow<'a> {
    pub time: &'a [f64],
    pub current: &'a [f64],
    pub voltage: &'a [f64],
    pub aht: &'a [f64],
}

impl PulseWindow<'_> {
    fn len(&self) -> usize {
        self.time
            .len()
            .min(self.current.len())
            .min(self.voltage.len())
            .min(self.aht.len())
    }

    fn averages(&self, range: std::ops::Range<usize>) -> (f64, f64) {
        (mean(&self.voltage[range.clone()]), mean(&self.current[range]))
    }
}

fn nearest_nominal(current: f64, nominal: &[f64]) -> Option<f64> {
    nominal
        .iter()
        .copied()
        .min_by_key(|a| OrderedFloat((a - current).abs()))
}

/// Detect current pulses in an HPPC sub-window and compute `R_s` and `R_l`
/// for each.
///
/// A pulse starts where the current steps by more than the edge threshold out
/// of rest, and ends at the first sample back at rest or of opposite sign;
/// a step still running at the end of the window is ignored. Steps longer
/// than `max_pulse_duration_s` are SOC adjustments and are not reported;
/// pulses with too few samples in any averaging window are skipped.
pub fn get_rs_soc(
    window: PulseWindow<'_>,
    settings: &HppcSettings,
    pulse_currents: &[f64],
) -> Vec<PulseResult> {
    let n = window.len();
    let (t, i) = (window.time, window.current);
    let rest = settings.rest_threshold_a;
    let mut pulses = Vec::new();
    if n < 2 {
        return pulses;
    }
    let q_start = window.aht[0];
    let mut k = 1;
    while k < n {
        let onset = (i[k] - i[k - 1]).abs() > settings.edge_threshold_a
            && i[k - 1].abs() < rest
            && i[k].abs() >= rest;
        if !onset {
            k += 1;
            continue;
        }
        let sign = i[k].signum();
        let t_e = t[k];
        let Some(end) = (k + 1..n).find(|&j| i[j].abs() < rest || i[j].signum() != sign) else {
            debug!("step at t={t_e} runs past the end of the window");
            break;
        };
        let t_last = t[end - 1];
        let duration = t[end] - t_e;
        if duration > settings.max_pulse_duration_s {
            k = end;
            continue;
        }

        let pre_lo = t[..k].partition_point(|&x| x < t_e - settings.pre_window_s);
        let pre = pre_lo..k;
        let inst_hi = k + t[k..end].partition_point(|&x| x < t_e + settings.instant_window_s);
        let inst = k..inst_hi;
        let target = (t_e + settings.relax_s).min(t_last);
        let relax_lo =
            k + t[k..end].partition_point(|&x| x <= target - settings.instant_window_s);
        let relax_hi = k + t[k..end].partition_point(|&x| x <= target);
        let relax = relax_lo..relax_hi;

        let min = settings.min_samples.max(1);
        if pre.len() < min || inst.len() < min || relax.len() < min {
            debug!(
                "skipping pulse at t={t_e}: {} pre, {} instant, {} relaxed samples",
                pre.len(),
                inst.len(),
                relax.len()
            );
            k = end;
            continue;
        }

        let (v_pre, i_pre) = window.averages(pre);
        let (v_inst, i_inst) = window.averages(inst);
        let (v_relax, i_relax) = window.averages(relax);
        let r_s = (v_inst - v_pre) / (i_inst - i_pre);
        let r_l = (v_relax - v_pre) / (i_relax - i_pre);
        if !r_s.is_finite() || !r_l.is_finite() {
            debug!("skipping pulse at t={t_e}: degenerate current step");
            k = end;
            continue;
        }
        let current = mean(&i[k..end]);
        pulses.push(PulseResult {
            current,
            duration,
            q: window.aht[k] - q_start,
            r_s,
            r_l,
            nominal_current: nearest_nominal(current, pulse_currents),
        });
        k = end;
    }
    debug!("found {} HPPC pulses", pulses.len());
    pulses
}

#[cfg(test)]
mod tests {
    use super::*;

    const R0: f64 = 0.05;
    const R1: f64 = 0.03;
    const TAU: f64 = 5.0;
    const OCV: f64 = 3.7;

    struct Train {
        t: Vec<f64>,
        i: Vec<f64>,
        v: Vec<f64>,
        aht: Vec<f64>,
    }

    impl Train {
        fn new() -> Self {
            Self {
                t: Vec::new(),
                i: Vec::new(),
                v: Vec::new(),
                aht: Vec::new(),
            }
        }

        /// Append `seconds` samples at 1 Hz of constant `current`.
        fn step(mut self, current: f64, seconds: usize) -> Self {
            for s in 0..seconds {
                let t = self.t.last().map_or(0.0, |x| x + 1.0);
                let prev = self.aht.last().copied().unwrap_or(0.0);
                self.t.push(t);
                self.i.push(current);
                self.v
                    .push(OCV + current * (R0 + R1 * (1.0 - (-(s as f64) / TAU).exp())));
                self.aht.push(prev + current.abs() / 3600.0);
            }
            self
        }

        fn window(&self) -> PulseWindow<'_> {
            PulseWindow {
                time: &self.t,
                current: &self.i,
                voltage: &self.v,
                aht: &self.aht,
            }
        }
    }

    #[test]
    fn discharge_and_charge_pulses() {
        let train = Train::new()
            .step(0.0, 30)
            .step(-1.0, 10)
            .step(0.0, 40)
            .step(0.75, 10)
            .step(0.0, 40);
        let pulses = get_rs_soc(
            train.window(),
            &HppcSettings::default(),
            &[2.0, 1.0, -2.0, -1.0, -0.5],
        );
        assert_eq!(pulses.len(), 2);
        for p in &pulses {
            assert!((p.r_s - R0).abs() < 1e-9);
            let expected = R0 + R1 * (1.0 - (-9.0 / TAU).exp());
            assert!((p.r_l - expected).abs() < 1e-9);
            assert!((p.duration - 10.0).abs() < 1e-12);
        }
        assert!((pulses[0].current + 1.0).abs() < 1e-12);
        assert_eq!(pulses[0].nominal_current, Some(-1.0));
        assert_eq!(pulses[1].nominal_current, Some(1.0));
        assert!(pulses[1].q > pulses[0].q);
        assert!((pulses[1].q - 10.75 / 3600.0).abs() < 1e-9);
    }

    #[test]
    fn long_steps_are_not_pulses() {
        let train = Train::new()
            .step(0.0, 30)
            .step(-1.0, 10)
            .step(0.0, 40)
            .step(-1.0, 600)
            .step(0.0, 10);
        let pulses = get_rs_soc(train.window(), &HppcSettings::default(), &[]);
        assert_eq!(pulses.len(), 1);
        assert_eq!(pulses[0].nominal_current, None);
    }

    #[test]
    fn malformed_pulse_is_skipped_others_kept() {
        let train = Train::new()
            .step(0.0, 1)
            .step(-1.0, 10)
            .step(0.0, 40)
            .step(-1.0, 10)
            .step(0.0, 10);
        let settings = HppcSettings {
            min_samples: 3,
            instant_window_s: 3.0,
            ..HppcSettings::default()
        };
        let pulses = get_rs_soc(train.window(), &settings, &[]);
        assert_eq!(pulses.len(), 1);
        assert!(pulses[0].q > 0.0);
    }

    #[test]
    fn unfinished_step_is_ignored() {
        let train = Train::new()
            .step(0.0, 30)
            .step(0.75, 10)
            .step(0.0, 40)
            .step(0.177, 30);
        let pulses = get_rs_soc(train.window(), &HppcSettings::default(), &[]);
        assert_eq!(pulses.len(), 1);
        assert!((pulses[0].current - 0.75).abs() < 1e-12);
    }

    #[test]
    fn rest_only_window_has_no_pulses() {
        let train = Train::new().step(0.0, 100);
        assert!(get_rs_soc(train.window(), &HppcSettings::default(), &[]).is_empty());
        let empty = Train::new();
        assert!(get_rs_soc(empty.window(), &HppcSettings::default(), &[]).is_empty());
    }
}
