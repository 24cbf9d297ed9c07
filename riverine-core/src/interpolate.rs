use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum InterpolationError {
    #[error("at least 2 points are required for interpolation")]
    InsufficientPoints,
    #[error("interpolation abscissae are not strictly increasing")]
    NotStrictlyIncreasing,
    #[error("cyclic interpolation endpoints disagree: first value {first}, last value {last}")]
    CyclicEndpointMismatch { first: f64, last: f64 },
}

/// Behaviour outside the table domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Extrapolation {
    /// Hold the boundary value.
    Constant,
    /// Continue the boundary segment's slope.
    Linear,
}

/// Piecewise-linear interpolation over strictly increasing abscissae.
///
/// Lookups remember the last bracketing segment in an atomic hint so repeated
/// evaluations at nearby abscissae stay O(1) while the table remains shareable
/// across threads.
#[derive(Debug)]
pub struct Interpolation {
    xs: Vec<f64>,
    ys: Vec<f64>,
    lower: Extrapolation,
    upper: Extrapolation,
    /// Period of a cyclic table; `None` for ordinary tables.
    period: Option<f64>,
    hint: AtomicUsize,
}

impl PartialEq for Interpolation {
    fn eq(&self, other: &Self) -> bool {
        self.xs == other.xs
            && self.ys == other.ys
            && self.lower == other.lower
            && self.upper == other.upper
            && self.period == other.period
    }
}

impl Clone for Interpolation {
    fn clone(&self) -> Self {
        Self {
            xs: self.xs.clone(),
            ys: self.ys.clone(),
            lower: self.lower,
            upper: self.upper,
            period: self.period,
            hint: AtomicUsize::new(self.hint.load(Ordering::Relaxed)),
        }
    }
}

impl Interpolation {
    pub fn new(
        xs: Vec<f64>,
        ys: Vec<f64>,
        lower: Extrapolation,
        upper: Extrapolation,
    ) -> Result<Self, InterpolationError> {
        if xs.len() < 2 || xs.len() != ys.len() {
            return Err(InterpolationError::InsufficientPoints);
        }
        if xs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(InterpolationError::NotStrictlyIncreasing);
        }
        Ok(Self {
            xs,
            ys,
            lower,
            upper,
            period: None,
            hint: AtomicUsize::new(0),
        })
    }

    /// A table evaluated modulo its span. The first and last ordinates must
    /// agree so the wrapped function is continuous.
    pub fn new_cyclic(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self, InterpolationError> {
        let mut interp = Self::new(xs, ys, Extrapolation::Constant, Extrapolation::Constant)?;
        let first = *interp.ys.first().expect("length checked above");
        let last = *interp.ys.last().expect("length checked above");
        if (first - last).abs() > 1e-12 * (1.0 + first.abs().max(last.abs())) {
            return Err(InterpolationError::CyclicEndpointMismatch { first, last });
        }
        interp.period = Some(interp.xs[interp.xs.len() - 1] - interp.xs[0]);
        Ok(interp)
    }

    /// A constant function, handy for optional forcings that default to zero.
    pub fn constant(y: f64) -> Self {
        Self {
            xs: vec![0.0, 1.0],
            ys: vec![y, y],
            lower: Extrapolation::Constant,
            upper: Extrapolation::Constant,
            period: None,
            hint: AtomicUsize::new(0),
        }
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn is_cyclic(&self) -> bool {
        self.period.is_some()
    }

    /// Breakpoint abscissae within `[0, end]`; cyclic tables repeat theirs
    /// every period.
    pub fn breakpoints_within(&self, end: f64) -> Vec<f64> {
        match self.period {
            Some(period) if period > 0.0 => {
                let mut times = Vec::new();
                let mut offset = 0.0;
                while self.xs[0] + offset <= end {
                    times.extend(self.xs.iter().map(|&x| x + offset).filter(|&x| x <= end));
                    offset += period;
                }
                times.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
                times
            }
            _ => self.xs.iter().copied().filter(|&x| x <= end).collect(),
        }
    }

    fn wrap(&self, x: f64) -> f64 {
        match self.period {
            Some(period) if period > 0.0 => {
                let x0 = self.xs[0];
                x0 + (x - x0).rem_euclid(period)
            }
            _ => x,
        }
    }

    /// Index of the segment `[xs[i], xs[i+1]]` bracketing `x`, clamped to the
    /// table. Starts from the hinted segment before falling back to binary
    /// search.
    fn segment(&self, x: f64) -> usize {
        let n = self.xs.len();
        let hint = self.hint.load(Ordering::Relaxed).min(n - 2);
        if self.xs[hint] <= x && x <= self.xs[hint + 1] {
            return hint;
        }
        let seg = match self.xs.partition_point(|&p| p <= x) {
            0 => 0,
            p if p >= n => n - 2,
            p => p - 1,
        };
        self.hint.store(seg, Ordering::Relaxed);
        seg
    }

    pub fn value(&self, x: f64) -> f64 {
        self.value_and_derivative(x).0
    }

    pub fn derivative(&self, x: f64) -> f64 {
        self.value_and_derivative(x).1
    }

    /// Value and one-sided slope at `x`. At an interior breakpoint both
    /// one-sided slopes bracket the returned slope by construction.
    pub fn value_and_derivative(&self, x: f64) -> (f64, f64) {
        let x = self.wrap(x);
        let n = self.xs.len();

        if x < self.xs[0] {
            return match self.lower {
                Extrapolation::Constant => (self.ys[0], 0.0),
                Extrapolation::Linear => {
                    let slope = (self.ys[1] - self.ys[0]) / (self.xs[1] - self.xs[0]);
                    (self.ys[0] + slope * (x - self.xs[0]), slope)
                }
            };
        }
        if x > self.xs[n - 1] {
            return match self.upper {
                Extrapolation::Constant => (self.ys[n - 1], 0.0),
                Extrapolation::Linear => {
                    let slope = (self.ys[n - 1] - self.ys[n - 2]) / (self.xs[n - 1] - self.xs[n - 2]);
                    (self.ys[n - 1] + slope * (x - self.xs[n - 1]), slope)
                }
            };
        }

        let i = self.segment(x);
        let slope = (self.ys[i + 1] - self.ys[i]) / (self.xs[i + 1] - self.xs[i]);
        (self.ys[i] + slope * (x - self.xs[i]), slope)
    }

    /// Inverse lookup for monotone non-decreasing tables. Flat segments map
    /// to their left breakpoint.
    pub fn inverse(&self, y: f64) -> f64 {
        let n = self.ys.len();
        if y <= self.ys[0] {
            return self.xs[0];
        }
        if y >= self.ys[n - 1] {
            return match self.upper {
                Extrapolation::Linear if self.ys[n - 1] > self.ys[n - 2] => {
                    let slope = (self.ys[n - 1] - self.ys[n - 2]) / (self.xs[n - 1] - self.xs[n - 2]);
                    self.xs[n - 1] + (y - self.ys[n - 1]) / slope
                }
                _ => self.xs[n - 1],
            };
        }
        let i = match self.ys.partition_point(|&p| p <= y) {
            0 => 0,
            p if p >= n => n - 2,
            p => p - 1,
        };
        if self.ys[i + 1] > self.ys[i] {
            let frac = (y - self.ys[i]) / (self.ys[i + 1] - self.ys[i]);
            self.xs[i] + frac * (self.xs[i + 1] - self.xs[i])
        } else {
            self.xs[i]
        }
    }
}

/// Monotone cubic interpolation (Fritsch–Carlson limited PCHIP), used by
/// continuous control functions. Constant extrapolation outside the domain.
#[derive(Debug, Clone)]
pub struct PchipInterpolation {
    xs: Vec<f64>,
    ys: Vec<f64>,
    slopes: Vec<f64>,
}

impl PchipInterpolation {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self, InterpolationError> {
        if xs.len() < 2 || xs.len() != ys.len() {
            return Err(InterpolationError::InsufficientPoints);
        }
        if xs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(InterpolationError::NotStrictlyIncreasing);
        }

        let n = xs.len();
        let mut deltas = Vec::with_capacity(n - 1);
        for i in 0..n - 1 {
            deltas.push((ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i]));
        }

        let mut slopes = vec![0.0; n];
        slopes[0] = deltas[0];
        slopes[n - 1] = deltas[n - 2];
        for i in 1..n - 1 {
            if deltas[i - 1] * deltas[i] > 0.0 {
                // Weighted harmonic mean keeps the interpolant monotone.
                let w1 = 2.0 * (xs[i + 1] - xs[i]) + (xs[i] - xs[i - 1]);
                let w2 = (xs[i + 1] - xs[i]) + 2.0 * (xs[i] - xs[i - 1]);
                slopes[i] = (w1 + w2) / (w1 / deltas[i - 1] + w2 / deltas[i]);
            }
        }

        Ok(Self { xs, ys, slopes })
    }

    pub fn value(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let i = match self.xs.partition_point(|&p| p <= x) {
            0 => 0,
            p if p >= n => n - 2,
            p => p - 1,
        };
        let h = self.xs[i + 1] - self.xs[i];
        let t = (x - self.xs[i]) / h;
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * self.ys[i] + h10 * h * self.slopes[i] + h01 * self.ys[i + 1] + h11 * h * self.slopes[i + 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn linear_lookup_and_extrapolation() {
        let interp = Interpolation::new(
            vec![0.0, 1.0, 3.0],
            vec![0.0, 2.0, 4.0],
            Extrapolation::Constant,
            Extrapolation::Linear,
        )
        .unwrap();

        assert_approx_eq!(f64, interp.value(0.5), 1.0);
        assert_approx_eq!(f64, interp.value(2.0), 3.0);
        // Constant below, linear above.
        assert_approx_eq!(f64, interp.value(-1.0), 0.0);
        assert_approx_eq!(f64, interp.value(5.0), 6.0);
        assert_approx_eq!(f64, interp.derivative(0.5), 2.0);
        assert_approx_eq!(f64, interp.derivative(-1.0), 0.0);
        assert_approx_eq!(f64, interp.derivative(5.0), 1.0);
    }

    #[test]
    fn breakpoint_slope_matches_segment() {
        let interp = Interpolation::new(
            vec![0.0, 1.0, 2.0],
            vec![0.0, 1.0, 3.0],
            Extrapolation::Constant,
            Extrapolation::Constant,
        )
        .unwrap();
        // One-sided slopes at the breakpoint are the segment slopes.
        let eps = 1e-9;
        assert_approx_eq!(f64, interp.derivative(1.0 - eps), 1.0);
        assert_approx_eq!(f64, interp.derivative(1.0 + eps), 2.0);
    }

    #[test]
    fn rejects_bad_tables() {
        assert_eq!(
            Interpolation::new(vec![0.0], vec![1.0], Extrapolation::Constant, Extrapolation::Constant),
            Err(InterpolationError::InsufficientPoints)
        );
        assert_eq!(
            Interpolation::new(
                vec![0.0, 0.0, 1.0],
                vec![1.0, 2.0, 3.0],
                Extrapolation::Constant,
                Extrapolation::Constant
            ),
            Err(InterpolationError::NotStrictlyIncreasing)
        );
    }

    #[test]
    fn cyclic_value_repeats_with_period() {
        let interp = Interpolation::new_cyclic(vec![0.0, 10.0, 40.0], vec![1.0, 5.0, 1.0]).unwrap();
        for t in [0.0, 3.0, 12.5, 39.0] {
            assert_approx_eq!(f64, interp.value(t), interp.value(t + 40.0));
            assert_approx_eq!(f64, interp.value(t), interp.value(t + 400.0));
        }
    }

    #[test]
    fn cyclic_requires_matching_endpoints() {
        let err = Interpolation::new_cyclic(vec![0.0, 10.0], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, InterpolationError::CyclicEndpointMismatch { .. }));
    }

    #[test]
    fn inverse_round_trip() {
        let interp = Interpolation::new(
            vec![0.0, 100.0, 300.0],
            vec![0.0, 1.0, 2.0],
            Extrapolation::Constant,
            Extrapolation::Linear,
        )
        .unwrap();
        for y in [0.0, 0.25, 1.0, 1.7, 2.0] {
            assert_approx_eq!(f64, interp.value(interp.inverse(y)), y, epsilon = 1e-12);
        }
    }

    #[test]
    fn pchip_is_monotone_and_interpolates() {
        let pchip = PchipInterpolation::new(vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 0.1, 0.9, 1.0]).unwrap();
        for (x, y) in [(0.0, 0.0), (1.0, 0.1), (2.0, 0.9), (3.0, 1.0)] {
            assert_approx_eq!(f64, pchip.value(x), y);
        }
        let mut prev = pchip.value(0.0);
        for i in 1..=300 {
            let value = pchip.value(3.0 * i as f64 / 300.0);
            assert!(value >= prev - 1e-12, "pchip must not overshoot");
            prev = value;
        }
    }
}
