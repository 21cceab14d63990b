use nalgebra::{DMatrix, DVector};

use crate::EngineError;

pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|k| start + step * k as f64).collect()
        }
    }
}

/// Savitzky–Golay polynomial smoother on uniformly spaced samples.
///
/// Edge samples are evaluated on the polynomial fitted to the first or last
/// full window instead of being padded.
#[derive(Clone, Debug)]
pub struct SavitzkyGolay {
    window: usize,
    order: usize,
    /// `(AᵀA)⁻¹Aᵀ` for the window design matrix `A[i][j] = (i - half)^j`.
    projection: DMatrix<f64>,
}

impl SavitzkyGolay {
    pub fn new(window: usize, order: usize) -> Result<Self, EngineError> {
        if window % 2 == 0 || window <= order {
            return Err(EngineError::InvalidParameter(format!(
                "Savitzky-Golay window {window} must be odd and exceed order {order}"
            )));
        }
        let half = (window / 2) as f64;
        let a = DMatrix::from_fn(window, order + 1, |i, j| (i as f64 - half).powi(j as i32));
        let ata = a.transpose() * &a;
        let Some(inv) = ata.try_inverse() else {
            return Err(EngineError::InvalidParameter(
                "singular Savitzky-Golay normal matrix".into(),
            ));
        };
        Ok(Self {
            window,
            order,
            projection: inv * a.transpose(),
        })
    }

    /// Largest valid smoother for a series of `len` samples, shrinking the
    /// window when the series is short.
    pub fn fitted_to(window: usize, order: usize, len: usize) -> Result<Self, EngineError> {
        let mut w = window.min(len);
        if w % 2 == 0 {
            w = w.saturating_sub(1);
        }
        if w <= order {
            return Err(EngineError::InsufficientData);
        }
        Self::new(w, order)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// `deriv`-th derivative of the smoothed series, sample spacing `delta`.
    pub fn apply(&self, y: &[f64], delta: f64, deriv: usize) -> Result<Vec<f64>, EngineError> {
        let n = y.len();
        if n < self.window {
            return Err(EngineError::InsufficientData);
        }
        if deriv > self.order {
            return Ok(vec![0.0; n]);
        }
        let half = self.window / 2;
        let scale = delta.powi(deriv as i32);
        let mut out = Vec::with_capacity(n);
        let mut cached: Option<(usize, DVector<f64>)> = None;
        for k in 0..n {
            let center = k.clamp(half, n - 1 - half);
            let coeffs = match &cached {
                Some((c, v)) if *c == center => v.clone(),
                _ => {
                    let window = DVector::from_column_slice(&y[center - half..=center + half]);
                    let v = &self.projection * window;
                    cached = Some((center, v.clone()));
                    v
                }
            };
            let x = k as f64 - center as f64;
            let value: f64 = (deriv..=self.order)
                .map(|j| coeffs[j] * falling_factorial(j, deriv) * x.powi((j - deriv) as i32))
                .sum();
            out.push(value / scale);
        }
        Ok(out)
    }
}

fn falling_factorial(j: usize, d: usize) -> f64 {
    ((j - d + 1)..=j).map(|v| v as f64).product()
}

/// Natural cubic spline through strictly increasing knots.
#[derive(Clone, Debug)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots.
    m: Vec<f64>,
}

impl CubicSpline {
    pub fn natural(x: &[f64], y: &[f64]) -> Result<Self, EngineError> {
        let n = x.len();
        if n != y.len() {
            return Err(EngineError::InvalidParameter(format!(
                "spline knots ({n}) and values ({}) differ in length",
                y.len()
            )));
        }
        if n < 2 {
            return Err(EngineError::InsufficientData);
        }
        if x.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(EngineError::InvalidParameter(
                "spline knots must be strictly increasing".into(),
            ));
        }
        let mut m = vec![0.0; n];
        if n > 2 {
            let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
            let inner = n - 2;
            let mut diag = vec![0.0; inner];
            let mut rhs = vec![0.0; inner];
            for k in 0..inner {
                diag[k] = 2.0 * (h[k] + h[k + 1]);
                rhs[k] = 6.0 * ((y[k + 2] - y[k + 1]) / h[k + 1] - (y[k + 1] - y[k]) / h[k]);
            }
            // Thomas algorithm; sub- and super-diagonal entries are h[k].
            for k in 1..inner {
                let w = h[k] / diag[k - 1];
                diag[k] -= w * h[k];
                rhs[k] -= w * rhs[k - 1];
            }
            m[inner] = rhs[inner - 1] / diag[inner - 1];
            for k in (0..inner - 1).rev() {
                m[k + 1] = (rhs[k] - h[k + 1] * m[k + 2]) / diag[k];
            }
        }
        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
        })
    }

    pub fn eval(&self, xq: f64) -> f64 {
        let n = self.x.len();
        let j = self
            .x
            .partition_point(|&v| v <= xq)
            .saturating_sub(1)
            .min(n - 2);
        let h = self.x[j + 1] - self.x[j];
        let a = (self.x[j + 1] - xq) / h;
        let b = (xq - self.x[j]) / h;
        a * self.y[j]
            + b * self.y[j + 1]
            + ((a * a * a - a) * self.m[j] + (b * b * b - b) * self.m[j + 1]) * h * h / 6.0
    }

    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic(x: f64) -> f64 {
        0.5 * x * x * x - 2.0 * x * x + x - 3.0
    }

    #[test]
    fn savgol_preserves_cubic_everywhere() {
        let delta = 0.1;
        let x: Vec<f64> = (0..60).map(|k| k as f64 * delta).collect();
        let y: Vec<f64> = x.iter().map(|&v| cubic(v)).collect();
        let sg = SavitzkyGolay::new(11, 3).unwrap();
        let smooth = sg.apply(&y, delta, 0).unwrap();
        let deriv = sg.apply(&y, delta, 1).unwrap();
        for k in 0..x.len() {
            assert!((smooth[k] - y[k]).abs() < 1e-8, "value at {k}");
            let exact = 1.5 * x[k] * x[k] - 4.0 * x[k] + 1.0;
            assert!((deriv[k] - exact).abs() < 1e-6, "slope at {k}");
        }
    }

    #[test]
    fn savgol_reduces_noise() {
        let y: Vec<f64> = (0..201)
            .map(|k| 1.0 + if k % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        let smooth = SavitzkyGolay::new(21, 2).unwrap().apply(&y, 1.0, 0).unwrap();
        for v in &smooth[10..190] {
            assert!((v - 1.0).abs() < 2e-3);
        }
    }

    #[test]
    fn savgol_window_validation() {
        assert!(SavitzkyGolay::new(10, 3).is_err());
        assert!(SavitzkyGolay::new(3, 3).is_err());
        let sg = SavitzkyGolay::fitted_to(21, 3, 8).unwrap();
        assert_eq!(sg.window(), 7);
        assert!(SavitzkyGolay::fitted_to(21, 3, 3).is_err());
        assert!(SavitzkyGolay::new(5, 2).unwrap().apply(&[1.0, 2.0], 1.0, 0).is_err());
    }

    #[test]
    fn spline_reproduces_line_and_knots() {
        let x = [0.0, 0.5, 1.7, 2.0, 4.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v - 1.0).collect();
        let s = CubicSpline::natural(&x, &y).unwrap();
        for &q in &[0.0, 0.25, 1.0, 3.3, 4.0] {
            assert!((s.eval(q) - (2.0 * q - 1.0)).abs() < 1e-12);
        }
        let yk = [1.0, -2.0, 0.5, 3.0, 0.0];
        let s = CubicSpline::natural(&x, &yk).unwrap();
        for (xv, yv) in x.iter().zip(yk) {
            assert!((s.eval(*xv) - yv).abs() < 1e-12);
        }
    }

    #[test]
    fn spline_tracks_smooth_function() {
        let x = linspace(0.0, std::f64::consts::PI, 40);
        let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
        let s = CubicSpline::natural(&x, &y).unwrap();
        let probe = linspace(0.1, 3.0, 17);
        for (q, v) in probe.iter().zip(s.eval_many(&probe)) {
            assert!((v - q.sin()).abs() < 1e-4);
        }
    }

    #[test]
    fn spline_rejects_bad_knots() {
        assert!(CubicSpline::natural(&[0.0, 1.0, 1.0], &[0.0, 1.0, 2.0]).is_err());
        assert!(CubicSpline::natural(&[0.0], &[0.0]).is_err());
        let two = CubicSpline::natural(&[0.0, 2.0], &[1.0, 3.0]).unwrap();
        assert!((two.eval(1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn linspace_endpoints() {
        let v = linspace(1.0, 2.0, 5);
        assert_eq!(v.len(), 5);
        assert!((v[4] - 2.0).abs() < 1e-12);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
