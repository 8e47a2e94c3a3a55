/// Piecewise linear interpolant over strictly increasing knots.
///
/// Outside the knot range the first/last segment is extended. Evaluating
/// exactly at a knot returns the knot value unchanged.
#[derive(Clone, Debug)]
pub struct LinearInterpolant {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl LinearInterpolant {
    /// `None` when there are fewer than two knots or the knots are not strictly increasing
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Option<Self> {
        if !valid_knots(&xs, &ys) {
            return None;
        }
        Some(Self { xs, ys })
    }

    pub fn eval(&self, x: f64) -> f64 {
        let i = self.xs.partition_point(|knot| *knot < x);
        if i < self.xs.len() && self.xs[i] == x {
            return self.ys[i];
        }
        let upper = i.clamp(1, self.xs.len() - 1);
        let lower = upper - 1;
        let (x0, x1) = (self.xs[lower], self.xs[upper]);
        let (y0, y1) = (self.ys[lower], self.ys[upper]);
        y0 + (x - x0) * (y1 - y0) / (x1 - x0)
    }
}

/// Natural cubic spline (zero second derivative at both ends).
///
/// Outside the knot range the boundary segment's cubic is extended.
#[derive(Clone, Debug)]
pub struct CubicSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Second derivative at each knot
    second_derivatives: Vec<f64>,
}

impl CubicSpline {
    /// `None` when there are fewer than two knots or the knots are not strictly increasing
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Option<Self> {
        if !valid_knots(&xs, &ys) {
            return None;
        }
        let second_derivatives = natural_second_derivatives(&xs, &ys);
        Some(Self {
            xs,
            ys,
            second_derivatives,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        let upper = self
            .xs
            .partition_point(|knot| *knot < x)
            .clamp(1, self.xs.len() - 1);
        let lower = upper - 1;
        let h = self.xs[upper] - self.xs[lower];
        let a = (self.xs[upper] - x) / h;
        let b = (x - self.xs[lower]) / h;
        let m0 = self.second_derivatives[lower];
        let m1 = self.second_derivatives[upper];
        a * self.ys[lower]
            + b * self.ys[upper]
            + ((a.powi(3) - a) * m0 + (b.powi(3) - b) * m1) * h * h / 6.
    }

    pub fn min_x(&self) -> f64 {
        self.xs[0]
    }

    pub fn max_x(&self) -> f64 {
        self.xs[self.xs.len() - 1]
    }
}

fn valid_knots(xs: &[f64], ys: &[f64]) -> bool {
    xs.len() >= 2
        && xs.len() == ys.len()
        && xs.iter().chain(ys).all(|v| v.is_finite())
        && xs.windows(2).all(|w| w[1] > w[0])
}

/// Solve the tridiagonal system for the knot second derivatives (Thomas algorithm).
fn natural_second_derivatives(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let mut m = vec![0.; n];
    if n < 3 {
        return m;
    }

    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let interior = n - 2;
    let mut diag = vec![0.; interior];
    let mut upper = vec![0.; interior];
    let mut rhs = vec![0.; interior];
    for k in 0..interior {
        let i = k + 1;
        diag[k] = 2. * (h[i - 1] + h[i]);
        upper[k] = h[i];
        rhs[k] = 6. * ((ys[i + 1] - ys[i]) / h[i] - (ys[i] - ys[i - 1]) / h[i - 1]);
    }

    // forward sweep, the sub-diagonal entry of row k is h[k]
    for k in 1..interior {
        let factor = h[k] / diag[k - 1];
        diag[k] -= factor * upper[k - 1];
        rhs[k] -= factor * rhs[k - 1];
    }
    m[interior] = rhs[interior - 1] / diag[interior - 1];
    for k in (0..interior - 1).rev() {
        m[k + 1] = (rhs[k] - upper[k] * m[k + 2]) / diag[k];
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_exact_at_knots_and_extrapolates() {
        let f = LinearInterpolant::new(vec![0., 1., 3.], vec![0.1, 0.7, 1.9]).unwrap();
        assert_eq!(f.eval(0.), 0.1);
        assert_eq!(f.eval(1.), 0.7);
        assert_eq!(f.eval(3.), 1.9);
        assert_abs_diff_eq!(f.eval(2.), 1.3, epsilon = 1e-12);
        assert_abs_diff_eq!(f.eval(-1.), -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(f.eval(4.), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_invalid_knots() {
        assert!(LinearInterpolant::new(vec![0.], vec![1.]).is_none());
        assert!(LinearInterpolant::new(vec![0., 0.], vec![1., 2.]).is_none());
        assert!(CubicSpline::new(vec![1., 0.], vec![1., 2.]).is_none());
        assert!(CubicSpline::new(vec![0., 1.], vec![1.]).is_none());
    }

    #[test]
    fn test_spline_passes_through_knots() {
        let xs = vec![0., 1., 2.5, 4., 6.];
        let ys = vec![1., 3., 2., 5., 4.];
        let spline = CubicSpline::new(xs.clone(), ys.clone()).unwrap();
        for (x, y) in xs.iter().zip(&ys) {
            assert_abs_diff_eq!(spline.eval(*x), *y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_spline_reproduces_lines() {
        let xs: Vec<f64> = (0..6).map(|i| i as f64 * 2.).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3. * x - 1.).collect();
        let spline = CubicSpline::new(xs, ys).unwrap();
        assert_abs_diff_eq!(spline.eval(3.3), 8.9, epsilon = 1e-9);
        assert_abs_diff_eq!(spline.eval(12.), 35., epsilon = 1e-9);
        assert_abs_diff_eq!(spline.eval(-1.), -4., epsilon = 1e-9);
    }

    #[test]
    fn test_spline_tracks_smooth_curve() {
        let xs: Vec<f64> = (0..=40).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x.sin()).collect();
        let spline = CubicSpline::new(xs, ys).unwrap();
        for x in [0.55, 1.23, 2.01, 3.37] {
            assert_abs_diff_eq!(spline.eval(x), f64::sin(x), epsilon = 1e-4);
        }
    }
}
