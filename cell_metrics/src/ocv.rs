//! Half-cell open-circuit-voltage models and the full-cell curve built from them.
//!
//! The positive electrode is a 9th-degree polynomial in lithiation `y`; the
//! graphite negative electrode is an exponential plus tanh staging fit in `x`.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Positive-electrode polynomial, highest power first.
const UP_COEFFS: [f64; 10] = [
    -2253.9364, 10756.6071, -21755.8183, 24277.2504, -16299.5659, 6728.9153, -1670.2785,
    233.2321, -18.3223, 5.3936,
];

/// Graphite staging terms `(amplitude, centre, width)`.
const UN_TANH: [(f64, f64, f64); 6] = [
    (-0.012, 0.127, 0.016),
    (-0.0118, 0.155, 0.016),
    (-0.0035, 0.220, 0.02),
    (-0.0095, 0.190, 0.013),
    (-0.0145, 0.490, 0.020),
    (-0.08, 1.03, 0.055),
];
const UN_OFFSET: f64 = 0.063;
const UN_EXP_AMP: f64 = 0.8;
const UN_EXP_RATE: f64 = 75.0;
const UN_EXP_SHIFT: f64 = 0.001;

pub fn up(y: f64) -> f64 {
    UP_COEFFS.iter().fold(0.0, |acc, &c| acc * y + c)
}

pub fn dup_dy(y: f64) -> f64 {
    let degree = UP_COEFFS.len() - 1;
    UP_COEFFS[..degree]
        .iter()
        .enumerate()
        .fold(0.0, |acc, (k, &c)| acc * y + c * (degree - k) as f64)
}

pub fn un(x: f64) -> f64 {
    let base = UN_OFFSET + UN_EXP_AMP * (-UN_EXP_RATE * (x + UN_EXP_SHIFT)).exp();
    UN_TANH
        .iter()
        .fold(base, |acc, &(a, b, w)| acc + a * ((x - b) / w).tanh())
}

pub fn dun_dx(x: f64) -> f64 {
    let base = -UN_EXP_AMP * UN_EXP_RATE * (-UN_EXP_RATE * (x + UN_EXP_SHIFT)).exp();
    UN_TANH.iter().fold(base, |acc, &(a, b, w)| {
        let sech = 1.0 / ((x - b) / w).cosh();
        acc + a / w * sech * sech
    })
}

/// Electrode capacities (Ah) and lithiation at 100% SOC.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeParams {
    pub cn: f64,
    pub x100: f64,
    pub cp: f64,
    pub y100: f64,
}

impl ElectrodeParams {
    pub fn from_array(p: [f64; 4]) -> Self {
        Self {
            cn: p[0],
            x100: p[1],
            cp: p[2],
            y100: p[3],
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.cn, self.x100, self.cp, self.y100]
    }

    /// Negative-electrode lithiation after discharging `q` Ah from full.
    pub fn x(&self, q: f64) -> f64 {
        self.x100 - q / self.cn
    }

    /// Positive-electrode lithiation after discharging `q` Ah from full.
    pub fn y(&self, q: f64) -> f64 {
        self.y100 + q / self.cp
    }

    pub fn voltage(&self, q: f64) -> f64 {
        up(self.y(q)) - un(self.x(q))
    }

    pub fn dvdq(&self, q: f64) -> f64 {
        dup_dy(self.y(q)) / self.cp + dun_dx(self.x(q)) / self.cn
    }

    /// Largest discharge before either electrode leaves `[0, 1]`.
    pub fn stoichiometric_limit(&self) -> f64 {
        (self.x100 * self.cn).min((1.0 - self.y100) * self.cp).max(0.0)
    }

    /// Discharged capacity at which the model reaches `v_target`, by bisection
    /// over `[0, q_hi]`. `None` when the target is not bracketed.
    pub fn capacity_at_voltage(&self, v_target: f64, q_hi: f64) -> Option<f64> {
        let f = |q: f64| self.voltage(q) - v_target;
        let (mut lo, mut hi) = (0.0, q_hi);
        let (f_lo, f_hi) = (f(lo), f(hi));
        if !f_lo.is_finite() || !f_hi.is_finite() || f_lo * f_hi > 0.0 {
            return None;
        }
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            if f(mid) * f_lo > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-10 {
                break;
            }
        }
        Some(0.5 * (lo + hi))
    }
}

/// Voltage and dV/dQ against discharged capacity.
#[derive(Clone, Debug, PartialEq)]
pub struct OcvCurve {
    pub q: Array1<f64>,
    pub v: Array1<f64>,
    pub dvdq: Array1<f64>,
}

impl OcvCurve {
    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn capacity(&self) -> f64 {
        self.q.last().copied().unwrap_or(0.0)
    }
}

/// Full-cell open-circuit potential on the capacity grid `q`.
pub fn calc_opc(params: &ElectrodeParams, q: &[f64]) -> OcvCurve {
    let q = Array1::from_vec(q.to_vec());
    let v = q.mapv(|qq| params.voltage(qq));
    let dvdq = q.mapv(|qq| params.dvdq(qq));
    OcvCurve { q, v, dvdq }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_electrode_is_nmc_like() {
        assert!((up(0.3) - 4.288043).abs() < 1e-5);
        assert!((up(0.9) - 3.630450).abs() < 1e-5);
    }

    #[test]
    fn graphite_plateau() {
        assert!((un(0.5) - 0.099499).abs() < 1e-5);
        assert!((un(0.8) - 0.091663).abs() < 1e-5);
        assert!(un(0.0) > 0.5);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let h = 1e-6;
        for &z in &[0.05, 0.2, 0.5, 0.75, 0.95] {
            let fd_p = (up(z + h) - up(z - h)) / (2.0 * h);
            let fd_n = (un(z + h) - un(z - h)) / (2.0 * h);
            assert!((dup_dy(z) - fd_p).abs() < 1e-4, "Up' at {z}");
            assert!((dun_dx(z) - fd_n).abs() < 1e-4, "Un' at {z}");
        }
    }

    #[test]
    fn full_cell_curve() {
        let params = ElectrodeParams::from_array([4.2, 0.85, 5.5, 0.3]);
        let curve = calc_opc(&params, &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(curve.len(), 4);
        assert!((curve.v[0] - 4.196573).abs() < 1e-5);
        assert!((curve.v[3] - 3.490537).abs() < 1e-5);
        assert!((curve.dvdq[1] + 0.275318).abs() < 1e-5);
        for w in curve.v.windows(2) {
            assert!(w[1] < w[0]);
        }
        assert_eq!(params.to_array(), [4.2, 0.85, 5.5, 0.3]);
    }

    #[test]
    fn bisection_finds_capacity() {
        let params = ElectrodeParams::from_array([4.0, 0.82, 5.3, 0.28]);
        let target = params.voltage(3.2);
        let q = params
            .capacity_at_voltage(target, params.stoichiometric_limit())
            .unwrap();
        assert!((q - 3.2).abs() < 1e-6);
        assert!(params.capacity_at_voltage(5.0, 3.0).is_none());
    }
}
