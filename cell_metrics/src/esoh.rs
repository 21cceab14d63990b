//! Electrode state-of-health estimation from a slow charge/discharge pair.
//!
//! The two C/20 branches are reduced to one averaged voltage-vs-capacity curve
//! (`build_ocv_curve`), and the half-cell model of [`crate::ocv`] is fitted to
//! it with a bounded Levenberg–Marquardt search (`esoh_est`).

use std::cmp::Reverse;

use nalgebra::{Matrix4, Vector4};
use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EsohSettings;
use crate::ocv::{calc_opc, ElectrodeParams, OcvCurve};
use crate::signal::cumulative_trapezoid;
use crate::smoothing::{linspace, CubicSpline, SavitzkyGolay};
use crate::EngineError;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;
const STEP_TOL: f64 = 1e-10;
const COST_TOL: f64 = 1e-12;

/// Fitted electrode parameters and fit diagnostics. All fields are NaN when
/// the fit was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EsohResult {
    pub cap: f64,
    pub cn: f64,
    pub x0: f64,
    pub x100: f64,
    pub cp: f64,
    pub y0: f64,
    pub y100: f64,
    pub err_v: f64,
    pub err_dvdq: f64,
    pub peak1_err: f64,
    pub peak2_err: f64,
    pub peak_gap_err: f64,
}

impl Default for EsohResult {
    fn default() -> Self {
        Self::invalid()
    }
}

impl EsohResult {
    pub fn invalid() -> Self {
        Self {
            cap: f64::NAN,
            cn: f64::NAN,
            x0: f64::NAN,
            x100: f64::NAN,
            cp: f64::NAN,
            y0: f64::NAN,
            y100: f64::NAN,
            err_v: f64::NAN,
            err_dvdq: f64::NAN,
            peak1_err: f64::NAN,
            peak2_err: f64::NAN,
            peak_gap_err: f64::NAN,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cap.is_finite()
    }

    pub fn params(&self) -> ElectrodeParams {
        ElectrodeParams {
            cn: self.cn,
            x100: self.x100,
            cp: self.cp,
            y100: self.y100,
        }
    }
}

/// Raw samples of one slow branch.
#[derive(Clone, Copy, Debug)]
pub struct Branch<'a> {
    pub time: &'a [f64],
    pub current: &'a [f64],
    pub voltage: &'a [f64],
}

/// Constant-current part of a branch as `(q, v)` with `q` counted from the
/// fully charged end.
///
/// The CC part is the longest run of samples whose signed current reaches
/// `threshold`; `sign` is `+1.0` for a charge branch and `-1.0` for discharge.
pub fn extract_cc_branch(
    branch: Branch<'_>,
    sign: f64,
    threshold: f64,
) -> Result<(Vec<f64>, Vec<f64>), EngineError> {
    let n = branch.time.len();
    if branch.current.len() != n || branch.voltage.len() != n {
        return Err(EngineError::InvalidParameter(
            "branch columns differ in length".into(),
        ));
    }
    let mut best = (0, 0);
    let mut run_start = None;
    for k in 0..=n {
        let in_cc = k < n && sign * branch.current[k] >= threshold;
        match (in_cc, run_start) {
            (true, None) => run_start = Some(k),
            (false, Some(s)) => {
                if k - s > best.1 - best.0 {
                    best = (s, k);
                }
                run_start = None;
            }
            _ => {}
        }
    }
    let (s, e) = best;
    if e - s < 2 {
        return Err(EngineError::InsufficientData);
    }
    let time = &branch.time[s..e];
    let amps: Vec<f64> = branch.current[s..e].iter().map(|i| i.abs() / 3600.0).collect();
    let mut q = cumulative_trapezoid(time, &amps);
    let mut v = branch.voltage[s..e].to_vec();
    if sign > 0.0 {
        let total = q.last().copied().unwrap_or(0.0);
        q = q.iter().rev().map(|x| total - x).collect();
        v.reverse();
    }
    Ok(strictly_increasing(&q, &v))
}

fn strictly_increasing(q: &[f64], v: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut qo = Vec::with_capacity(q.len());
    let mut vo = Vec::with_capacity(v.len());
    for (&qq, &vv) in q.iter().zip(v) {
        if !qq.is_finite() || !vv.is_finite() {
            continue;
        }
        if qo.last().map_or(true, |&last| qq > last) {
            qo.push(qq);
            vo.push(vv);
        }
    }
    (qo, vo)
}

/// Smoothed voltage and dV/dQ of one branch on its own uniform grid.
fn smooth_branch(
    q: &[f64],
    v: &[f64],
    settings: &EsohSettings,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), EngineError> {
    let n = q.len();
    let sg = SavitzkyGolay::fitted_to(settings.sg_window, settings.sg_order, n)?;
    let q_end = q[n - 1];
    let grid = linspace(0.0, q_end, n);
    let step = q_end / (n - 1) as f64;
    if !(step > 0.0) {
        return Err(EngineError::InsufficientData);
    }
    let v_grid = CubicSpline::natural(q, v)?.eval_many(&grid);
    let v_s = sg.apply(&v_grid, step, 0)?;
    let dvdq = sg.apply(&v_grid, step, 1)?;
    Ok((grid, v_s, dvdq))
}

/// Averaged voltage-vs-capacity curve of a C/20 charge/discharge pair.
///
/// Both branches are restricted to their constant-current part, counted from
/// 100% SOC, smoothed, resampled onto a common grid and averaged, which
/// cancels the ohmic offset of the two directions.
pub fn build_ocv_curve(
    charge: Branch<'_>,
    discharge: Branch<'_>,
    settings: &EsohSettings,
    i_c20: f64,
) -> Result<OcvCurve, EngineError> {
    let threshold = settings.cc_fraction * i_c20;
    let (qc, vc) = extract_cc_branch(charge, 1.0, threshold)?;
    let (qd, vd) = extract_cc_branch(discharge, -1.0, threshold)?;
    let (gc, vc_s, dc) = smooth_branch(&qc, &vc, settings)?;
    let (gd, vd_s, dd) = smooth_branch(&qd, &vd, settings)?;
    let q_end = gc[gc.len() - 1].min(gd[gd.len() - 1]);
    debug!(
        "C/20 branches: {} charge and {} discharge CC samples, common capacity {:.4} Ah",
        qc.len(),
        qd.len(),
        q_end
    );
    if settings.grid_points < 2 || !(q_end > 0.0) {
        return Err(EngineError::InsufficientData);
    }
    let grid = linspace(0.0, q_end, settings.grid_points);
    let vc_g = CubicSpline::natural(&gc, &vc_s)?.eval_many(&grid);
    let vd_g = CubicSpline::natural(&gd, &vd_s)?.eval_many(&grid);
    let dc_g = CubicSpline::natural(&gc, &dc)?.eval_many(&grid);
    let dd_g = CubicSpline::natural(&gd, &dd)?.eval_many(&grid);
    let v: Vec<f64> = vc_g.iter().zip(&vd_g).map(|(a, b)| 0.5 * (a + b)).collect();
    let dvdq: Vec<f64> = dc_g.iter().zip(&dd_g).map(|(a, b)| 0.5 * (a + b)).collect();
    Ok(OcvCurve {
        q: Array1::from_vec(grid),
        v: Array1::from_vec(v),
        dvdq: Array1::from_vec(dvdq),
    })
}

/// Capacities of the (up to) two strongest |dV/dQ| local maxima inside
/// `central`, sorted by capacity.
fn dvdq_peaks(q: &[f64], dvdq: &[f64], central: &[bool]) -> Vec<f64> {
    let mag: Vec<f64> = dvdq.iter().map(|d| d.abs()).collect();
    let mut peaks: Vec<usize> = (1..mag.len().saturating_sub(1))
        .filter(|&k| central[k] && mag[k] > mag[k - 1] && mag[k] >= mag[k + 1])
        .collect();
    peaks.sort_by_key(|&k| Reverse(OrderedFloat(mag[k])));
    peaks.truncate(2);
    let mut out: Vec<f64> = peaks.into_iter().map(|k| q[k]).collect();
    out.sort_by(f64::total_cmp);
    out
}

struct FitProblem<'a> {
    q: &'a [f64],
    v: &'a [f64],
    dvdq: &'a [f64],
    sqrt_w: Vec<f64>,
    central: Vec<bool>,
    cap: f64,
    settings: &'a EsohSettings,
}

impl<'a> FitProblem<'a> {
    fn new(q: &'a [f64], v: &'a [f64], dvdq: &'a [f64], settings: &'a EsohSettings) -> Self {
        let cap = q[q.len() - 1];
        let (lo, hi) = settings.central_band;
        let central: Vec<bool> = q.iter().map(|&x| x >= lo * cap && x <= hi * cap).collect();
        let peaks = dvdq_peaks(q, dvdq, &central);
        let halfwidth = settings.peak_halfwidth * cap;
        let sqrt_w = q
            .iter()
            .zip(&central)
            .map(|(&x, &c)| {
                let w = if peaks.iter().any(|p| (x - p).abs() <= halfwidth) {
                    settings.w3
                } else if c {
                    settings.w2
                } else {
                    settings.w1
                };
                w.sqrt()
            })
            .collect();
        Self {
            q,
            v,
            dvdq,
            sqrt_w,
            central,
            cap,
            settings,
        }
    }

    fn residuals(&self, p: &[f64; 4]) -> Vec<f64> {
        let params = ElectrodeParams::from_array(*p);
        let mut r = Vec::with_capacity(self.q.len() * 2 + 4);
        for (k, &q) in self.q.iter().enumerate() {
            r.push(self.sqrt_w[k] * (self.v[k] - params.voltage(q)));
        }
        for (k, &q) in self.q.iter().enumerate() {
            if self.central[k] {
                r.push(self.sqrt_w[k] * self.settings.dvdq_weight * (self.dvdq[k] - params.dvdq(q)));
            }
        }
        // Stoichiometry at the discharged end must stay inside [0, 1].
        let x0 = params.x(self.cap);
        let y0 = params.y(self.cap);
        let pw = self.settings.penalty_weight;
        r.push(pw * (-x0).max(0.0));
        r.push(pw * (x0 - 1.0).max(0.0));
        r.push(pw * (-y0).max(0.0));
        r.push(pw * (y0 - 1.0).max(0.0));
        r
    }

    fn cost(&self, p: &[f64; 4]) -> f64 {
        let c: f64 = self.residuals(p).iter().map(|r| r * r).sum();
        if c.is_finite() {
            c
        } else {
            f64::INFINITY
        }
    }

    fn normal_equations(&self, p: &[f64; 4], r: &[f64]) -> (Matrix4<f64>, Vector4<f64>) {
        let upper = &self.settings.upper;
        let mut cols: Vec<Vec<f64>> = Vec::with_capacity(4);
        for j in 0..4 {
            let mut h = 1e-6 * p[j].abs().max(1e-3);
            if p[j] + h > upper[j] {
                h = -h;
            }
            let mut shifted = *p;
            shifted[j] += h;
            let rs = self.residuals(&shifted);
            cols.push(rs.iter().zip(r).map(|(a, b)| (a - b) / h).collect());
        }
        let mut jtj = Matrix4::zeros();
        let mut jtr = Vector4::zeros();
        for a in 0..4 {
            jtr[a] = cols[a].iter().zip(r).map(|(x, y)| x * y).sum();
            for b in a..4 {
                let s: f64 = cols[a].iter().zip(&cols[b]).map(|(x, y)| x * y).sum();
                jtj[(a, b)] = s;
                jtj[(b, a)] = s;
            }
        }
        (jtj, jtr)
    }

    fn clamp(&self, p: [f64; 4]) -> [f64; 4] {
        let mut out = p;
        for k in 0..4 {
            out[k] = p[k].clamp(self.settings.lower[k], self.settings.upper[k]);
        }
        out
    }

    /// Projected Levenberg–Marquardt from `start`; returns the final point
    /// and its cost. Each iteration refreshes the Jacobian and raises the
    /// damping until a step lowers the cost.
    fn levenberg_marquardt(&self, start: [f64; 4]) -> ([f64; 4], f64) {
        let mut p = self.clamp(start);
        let mut r = self.residuals(&p);
        let mut cost: f64 = r.iter().map(|x| x * x).sum();
        if !cost.is_finite() {
            return (p, f64::INFINITY);
        }
        let mut lambda = LAMBDA_INIT;
        for _ in 0..self.settings.max_iterations {
            let (jtj, jtr) = self.normal_equations(&p, &r);
            let mut accepted = None;
            while lambda < LAMBDA_MAX {
                let mut a = jtj;
                for k in 0..4 {
                    a[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
                }
                let Some(delta) = a.lu().solve(&(-jtr)) else {
                    lambda *= 10.0;
                    continue;
                };
                let trial = self.clamp([
                    p[0] + delta[0],
                    p[1] + delta[1],
                    p[2] + delta[2],
                    p[3] + delta[3],
                ]);
                let trial_r = self.residuals(&trial);
                let trial_cost: f64 = trial_r.iter().map(|x| x * x).sum();
                if trial_cost < cost {
                    let step = (0..4).map(|k| (trial[k] - p[k]).abs()).fold(0.0, f64::max);
                    let rel = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                    p = trial;
                    r = trial_r;
                    cost = trial_cost;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);
                    accepted = Some((step, rel));
                    break;
                }
                lambda *= 10.0;
            }
            match accepted {
                Some((step, rel)) if step >= STEP_TOL && rel >= COST_TOL => {}
                _ => break,
            }
        }
        (p, cost)
    }

    /// Best point of a coarse grid over the parameter box.
    fn grid_seed(&self) -> ([f64; 4], f64) {
        let s = self.settings;
        let n = s.seed_grid.max(2);
        let cn = linspace(s.lower[0] + 0.5, s.upper[0] - 0.5, n);
        let x100 = linspace(0.7, 0.95, n);
        let cp = linspace(s.lower[2] + 0.5, s.upper[2] - 0.5, n);
        let y100 = linspace(0.05, 0.5, n);
        let start = self.clamp(s.x0);
        let mut best = (start, self.cost(&start));
        for &a in &cn {
            for &b in &x100 {
                for &c in &cp {
                    for &d in &y100 {
                        let p = self.clamp([a, b, c, d]);
                        let cost = self.cost(&p);
                        if cost < best.1 {
                            best = (p, cost);
                        }
                    }
                }
            }
        }
        best
    }
}

/// Fit electrode parameters to `curve`, returning the parameters and the
/// weighted cost.
pub fn fit_electrode_params(
    curve: &OcvCurve,
    settings: &EsohSettings,
) -> Result<(ElectrodeParams, f64), EngineError> {
    if curve.len() < 8 {
        return Err(EngineError::InsufficientData);
    }
    let (Some(q), Some(v), Some(dvdq)) = (
        curve.q.as_slice(),
        curve.v.as_slice(),
        curve.dvdq.as_slice(),
    ) else {
        return Err(EngineError::Fit("curve arrays are not contiguous".into()));
    };
    if q.iter().chain(v).chain(dvdq).any(|x| !x.is_finite()) {
        return Err(EngineError::Fit("curve contains non-finite values".into()));
    }
    if !(curve.capacity() > 0.0) {
        return Err(EngineError::Fit("curve has no capacity".into()));
    }
    let problem = FitProblem::new(q, v, dvdq, settings);
    let (seed, seed_cost) = problem.grid_seed();
    debug!("eSOH grid seed {seed:?} (cost {seed_cost:.3e})");
    let from_seed = problem.levenberg_marquardt(seed);
    let from_x0 = problem.levenberg_marquardt(settings.x0);
    let (p, cost) = if from_x0.1 <= from_seed.1 {
        from_x0
    } else {
        from_seed
    };
    if !cost.is_finite() {
        return Err(EngineError::Fit("optimizer diverged".into()));
    }
    Ok((ElectrodeParams::from_array(p), cost))
}

fn rmse<I: Iterator<Item = f64>>(errors: I) -> f64 {
    let (sum, n) = errors.fold((0.0, 0usize), |(s, n), e| (s + e * e, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        (sum / n as f64).sqrt()
    }
}

/// Estimate eSOH parameters from an averaged C/20 curve.
///
/// A failed fit or a voltage RMSE above `rmse_v_max` yields
/// [`EsohResult::invalid`].
pub fn esoh_est(curve: &OcvCurve, settings: &EsohSettings) -> EsohResult {
    let (params, cost) = match fit_electrode_params(curve, settings) {
        Ok(fit) => fit,
        Err(e) => {
            warn!("eSOH fit failed: {e}");
            return EsohResult::invalid();
        }
    };
    let q = curve.q.to_vec();
    let model = calc_opc(&params, &q);
    let cap_curve = curve.capacity();
    let v_end = curve.v[curve.len() - 1];
    let cap = params
        .capacity_at_voltage(v_end, params.stoichiometric_limit())
        .unwrap_or(cap_curve);

    let (lo, hi) = settings.central_band;
    let central: Vec<bool> = q
        .iter()
        .map(|&x| x >= lo * cap_curve && x <= hi * cap_curve)
        .collect();
    let err_v = rmse(model.v.iter().zip(curve.v.iter()).map(|(m, d)| m - d));
    let err_dvdq = rmse(
        model
            .dvdq
            .iter()
            .zip(curve.dvdq.iter())
            .zip(&central)
            .filter(|(_, c)| **c)
            .map(|((m, d), _)| m - d),
    );

    let measured_dvdq = curve.dvdq.to_vec();
    let model_dvdq = model.dvdq.to_vec();
    let meas_peaks = dvdq_peaks(&q, &measured_dvdq, &central);
    let model_peaks = dvdq_peaks(&q, &model_dvdq, &central);
    let (peak1_err, peak2_err, peak_gap_err) = if meas_peaks.len() == 2 && model_peaks.len() == 2
    {
        (
            model_peaks[0] - meas_peaks[0],
            model_peaks[1] - meas_peaks[1],
            (model_peaks[1] - model_peaks[0]) - (meas_peaks[1] - meas_peaks[0]),
        )
    } else {
        (f64::NAN, f64::NAN, f64::NAN)
    };

    if !(err_v <= settings.rmse_v_max) {
        warn!(
            "eSOH fit rejected: voltage RMSE {:.1} mV above {:.1} mV",
            err_v * 1e3,
            settings.rmse_v_max * 1e3
        );
        return EsohResult::invalid();
    }
    let (x0, y0) = (params.x(cap), params.y(cap));
    if !(0.0..=1.0).contains(&x0) || !(0.0..=1.0).contains(&y0) {
        warn!("eSOH fit rejected: end stoichiometry x0={x0:.4} y0={y0:.4} outside [0, 1]");
        return EsohResult::invalid();
    }
    debug!(
        "eSOH fit cap={cap:.4} Ah cost={cost:.3e} err_v={:.2} mV",
        err_v * 1e3
    );
    EsohResult {
        cap,
        cn: params.cn,
        x0,
        x100: params.x100,
        cp: params.cp,
        y0,
        y100: params.y100,
        err_v,
        err_dvdq,
        peak1_err,
        peak2_err,
        peak_gap_err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_curve(p: [f64; 4], cap: f64, n: usize) -> OcvCurve {
        calc_opc(&ElectrodeParams::from_array(p), &linspace(0.0, cap, n))
    }

    /// Slow branch sampled every `dt` seconds from a model, with an ohmic
    /// offset and an optional trailing CV phase on charge.
    fn slow_branch(
        params: &ElectrodeParams,
        current: f64,
        q_full: f64,
        dt: f64,
        cv_tail: usize,
    ) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let duration = q_full / current.abs() * 3600.0;
        let steps = (duration / dt).round() as usize;
        let dt = duration / steps as f64;
        let (mut t, mut i, mut v) = (Vec::new(), Vec::new(), Vec::new());
        for k in 0..=steps {
            let passed = q_full * k as f64 / steps as f64;
            let discharged = if current > 0.0 { q_full - passed } else { passed };
            t.push(k as f64 * dt);
            i.push(current);
            v.push(params.voltage(discharged) + current * 0.05);
        }
        let v_top = *v.last().unwrap();
        for k in 1..=cv_tail {
            t.push((steps + k) as f64 * dt);
            i.push(current * (-(k as f64) / 5.0).exp());
            v.push(v_top);
        }
        (t, i, v)
    }

    #[test]
    fn round_trip_recovers_parameters() {
        let truth = [4.0, 0.82, 5.3, 0.28];
        let curve = model_curve(truth, 3.2, 200);
        let result = esoh_est(&curve, &EsohSettings::default());
        assert!(result.is_valid());
        let fitted = result.params().to_array();
        for k in 0..4 {
            assert!(
                (fitted[k] - truth[k]).abs() < 0.05,
                "parameter {k}: {} vs {}",
                fitted[k],
                truth[k]
            );
        }
        assert!(result.err_v < 1e-3);
        assert!((result.cap - 3.2).abs() < 0.05);
        assert!((result.x0 - (result.x100 - result.cap / result.cn)).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&result.x0) && (0.0..=1.0).contains(&result.y0));
    }

    #[test]
    fn poor_fit_is_reported_invalid() {
        let mut curve = model_curve([4.0, 0.82, 5.3, 0.28], 3.2, 200);
        curve.v = curve
            .q
            .mapv(|q| 3.7 + 0.3 * (8.0 * q).sin());
        let settings = EsohSettings {
            rmse_v_max: 1e-6,
            ..EsohSettings::default()
        };
        let result = esoh_est(&curve, &settings);
        assert!(!result.is_valid());
        assert!(result.err_v.is_nan());
        assert!(result.peak_gap_err.is_nan());
    }

    #[test]
    fn negative_end_stoichiometry_is_invalid() {
        // 3.2 Ah drains a 3.4 Ah negative electrode from x100 = 0.9 below zero.
        let curve = model_curve([3.4, 0.9, 5.3, 0.28], 3.2, 200);
        let result = esoh_est(&curve, &EsohSettings::default());
        assert!(!result.is_valid());
        assert!(result.x0.is_nan() && result.y0.is_nan());
    }

    #[test]
    fn too_short_curve_fails() {
        let curve = model_curve([4.0, 0.82, 5.3, 0.28], 3.2, 4);
        assert!(fit_electrode_params(&curve, &EsohSettings::default()).is_err());
        assert!(!esoh_est(&curve, &EsohSettings::default()).is_valid());
    }

    #[test]
    fn cc_branch_excludes_cv_tail_and_rest() {
        let params = ElectrodeParams::from_array([4.2, 0.85, 5.5, 0.3]);
        let (mut t, mut i, mut v) = slow_branch(&params, 0.177, 3.0, 60.0, 30);
        // Leading rest inside the padded window.
        t.insert(0, -60.0);
        i.insert(0, 0.0);
        let v_first = v[0];
        v.insert(0, v_first);
        let branch = Branch {
            time: &t,
            current: &i,
            voltage: &v,
        };
        let (q, vq) = extract_cc_branch(branch, 1.0, 0.9 * 0.177).unwrap();
        assert!((q[q.len() - 1] - 3.0).abs() < 1e-9);
        assert_eq!(q[0], 0.0);
        // Reversed: first point is the end of charge.
        assert!(vq[0] > vq[vq.len() - 1]);
        assert!(q.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn cc_branch_needs_samples() {
        let t = [0.0, 1.0, 2.0];
        let i = [0.0, 0.0, 0.0];
        let v = [3.7, 3.7, 3.7];
        let branch = Branch {
            time: &t,
            current: &i,
            voltage: &v,
        };
        assert!(matches!(
            extract_cc_branch(branch, -1.0, 0.1),
            Err(EngineError::InsufficientData)
        ));
    }

    #[test]
    fn averaged_curve_cancels_ohmic_offset() {
        let params = ElectrodeParams::from_array([4.2, 0.85, 5.5, 0.3]);
        let (tc, ic, vc) = slow_branch(&params, 0.177, 3.0, 60.0, 20);
        let (td, id, vd) = slow_branch(&params, -0.177, 3.0, 60.0, 0);
        let curve = build_ocv_curve(
            Branch {
                time: &tc,
                current: &ic,
                voltage: &vc,
            },
            Branch {
                time: &td,
                current: &id,
                voltage: &vd,
            },
            &EsohSettings::default(),
            0.177,
        )
        .unwrap();
        assert_eq!(curve.len(), 400);
        assert!((curve.capacity() - 3.0).abs() < 1e-6);
        for k in (20..380).step_by(20) {
            let q = curve.q[k];
            assert!((curve.v[k] - params.voltage(q)).abs() < 2e-3, "v at {q}");
            assert!((curve.dvdq[k] - params.dvdq(q)).abs() < 0.05, "dvdq at {q}");
        }
    }

    #[test]
    fn peaks_are_sorted_by_capacity() {
        let q = linspace(0.0, 1.0, 11);
        let d = [0.0, -0.1, -0.5, -0.1, -0.2, -0.9, -0.2, -0.1, -0.3, -0.1, 0.0];
        let central = vec![true; 11];
        let peaks = dvdq_peaks(&q, &d, &central);
        assert_eq!(peaks.len(), 2);
        assert!((peaks[0] - 0.2).abs() < 1e-12);
        assert!((peaks[1] - 0.5).abs() < 1e-12);
    }
}
