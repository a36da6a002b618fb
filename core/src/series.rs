//! Piecewise-constant time-indexed count trajectories.
//!
//! A series is an ordered sequence of `(t, c)` breakpoints describing a step
//! function equal to `c` on `[t_i, t_next)`. All statistics are
//! time-weighted over the window `[t_first, t_last]`; degenerate windows
//! yield NaN rather than errors (histogram normalization excepted).

use itertools::Itertools;

use crate::error::TypedResult;
use crate::problem;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeCountSeries {
    points: Vec<(f64, f64)>,
}

impl TimeCountSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Appends a breakpoint, coalescing redundant samples.
    ///
    /// A sample at the time of the previous breakpoint replaces it; a
    /// previous breakpoint whose count equals the one before it is dropped.
    /// Times must be non-decreasing.
    pub fn append(&mut self, t: f64, c: f64) {
        if let Some(&(pt, _)) = self.points.last() {
            debug_assert!(t >= pt, "breakpoint times must be non-decreasing");
        }
        if self.points.len() <= 1 {
            if let Some(&(pt, _)) = self.points.last() {
                if pt == t {
                    self.points.pop();
                }
            }
        } else {
            let (_, ppc) = self.points[self.points.len() - 2];
            let (pt, pc) = self.points[self.points.len() - 1];
            if pt == t || pc == ppc {
                self.points.pop();
            }
        }
        self.points.push((t, c));
    }

    /// Iterates `(t_start, t_end, c)` segments; the final segment is open
    /// (`t_end = +inf`).
    fn segments(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        let tail = self.points.last().map(|&(t, c)| (t, f64::INFINITY, c));
        self.points
            .iter()
            .copied()
            .tuple_windows()
            .map(|((t, c), (nt, _))| (t, nt, c))
            .chain(tail)
    }

    /// Time-weighted n-th moment of `f(count)`.
    ///
    /// NaN when the series has fewer than two breakpoints or the window has
    /// zero width.
    pub fn moment_with(&self, n: u32, f: impl Fn(f64) -> f64) -> f64 {
        if self.points.len() < 2 {
            return f64::NAN;
        }
        let t_first = self.points[0].0;
        let t_last = self.points[self.points.len() - 1].0;
        let width = t_last - t_first;
        if width == 0.0 {
            return f64::NAN;
        }
        let mut result = 0.0;
        for ((t, c), (nt, _)) in self.points.iter().copied().tuple_windows() {
            result += f(c).powi(n as i32) * (nt - t);
        }
        result / width
    }

    pub fn moment(&self, n: u32) -> f64 {
        self.moment_with(n, |c| c)
    }

    pub fn mean(&self) -> f64 {
        self.moment(1)
    }

    /// Time-weighted mean of `f(count)`; with an indicator this is the
    /// fraction of the window spent in a set of counts.
    pub fn mean_with(&self, f: impl Fn(f64) -> f64) -> f64 {
        self.moment_with(1, f)
    }

    pub fn var(&self) -> f64 {
        let m1 = self.moment(1);
        let m2 = self.moment(2);
        m2 - m1 * m1
    }

    pub fn std(&self) -> f64 {
        self.var().sqrt()
    }

    /// Pointwise product series: the value at each instant is the product of
    /// the two inputs' values there.
    ///
    /// Both inputs are walked as interval generators; a breakpoint is
    /// emitted at the start of each overlapping interval, consecutive
    /// duplicate counts are coalesced, and the final breakpoint time is
    /// preserved so the product's window ends where the overlap ends.
    pub fn product(&self, other: &Self) -> Self {
        let mut seg_l = self.segments();
        let mut seg_r = other.segments();
        let mut l = seg_l.next();
        let mut r = seg_r.next();

        let mut points: Vec<(f64, f64)> = Vec::new();
        let mut last_mult: Option<(f64, f64)> = None;

        while let (Some((t1l, t2l, cl)), Some((t1r, t2r, cr))) = (l, r) {
            if t2l <= t1r {
                // No overlap, left is earlier.
                l = seg_l.next();
            } else if t2r <= t1l {
                // No overlap, right is earlier.
                r = seg_r.next();
            } else {
                let sample = (t1l.max(t1r), cl * cr);
                if points.last().map(|&(_, c)| c) != Some(sample.1) {
                    points.push(sample);
                }
                last_mult = Some(sample);

                if t2l < t2r {
                    l = seg_l.next();
                } else if t2r < t2l {
                    r = seg_r.next();
                } else {
                    l = seg_l.next();
                    r = seg_r.next();
                }
            }
        }

        if let (Some((lt, lc)), Some(&(ot, _))) = (last_mult, points.last()) {
            if ot != lt {
                points.push((lt, lc));
            }
        }

        Self { points }
    }

    /// `cov(X, Y) = E[XY] - E[X] E[Y]` over the overlapping window.
    pub fn cov(&self, other: &Self) -> f64 {
        let exy = self.product(other).moment(1);
        let ex = self.moment(1);
        let ey = other.moment(1);
        exy - ex * ey
    }

    /// Cumulative dwell time per integer count value, indexed `0..=max_c`.
    ///
    /// Only meaningful for integer-valued trajectories (counts are rounded
    /// to the nearest bucket).
    pub fn histogram(&self) -> Vec<f64> {
        let mut widths: Vec<f64> = vec![0.0];
        for ((t, c), (nt, _)) in self.points.iter().copied().tuple_windows() {
            debug_assert!(c >= 0.0, "histogram counts must be non-negative");
            let bucket = c.round() as usize;
            if bucket >= widths.len() {
                widths.resize(bucket + 1, 0.0);
            }
            widths[bucket] += nt - t;
        }
        widths
    }

    /// The histogram divided by the total window width.
    pub fn normalized_histogram(&self) -> TypedResult<Vec<f64>> {
        let width = match (self.points.first(), self.points.last()) {
            (Some(&(t_first, _)), Some(&(t_last, _))) => t_last - t_first,
            _ => 0.0,
        };
        if width == 0.0 {
            problem!(
                DegenerateWindow,
                "series is empty or has zero width, cannot normalize histogram"
            );
        }
        Ok(self.histogram().iter().map(|w| w / width).collect())
    }
}

impl FromIterator<(f64, f64)> for TimeCountSeries {
    fn from_iter<I: IntoIterator<Item = (f64, f64)>>(iter: I) -> Self {
        let mut series = Self::new();
        for (t, c) in iter {
            series.append(t, c);
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(points: &[(f64, f64)]) -> TimeCountSeries {
        points.iter().copied().collect()
    }

    #[test]
    fn append_is_idempotent() {
        let mut once = series(&[(0.0, 1.0), (2.0, 3.0)]);
        let mut twice = once.clone();
        once.append(5.0, 2.0);
        twice.append(5.0, 2.0);
        twice.append(5.0, 2.0);
        assert_eq!(once, twice);
    }

    #[test]
    fn redundant_sample_is_dropped_on_next_append() {
        let mut with_middle = series(&[(0.0, 1.0), (2.0, 3.0)]);
        with_middle.append(5.0, 3.0);
        with_middle.append(7.0, 0.0);

        let mut without_middle = series(&[(0.0, 1.0), (2.0, 3.0)]);
        without_middle.append(7.0, 0.0);

        assert_eq!(with_middle, without_middle);
    }

    #[test]
    fn same_time_sample_replaces_previous() {
        let mut s = series(&[(0.0, 1.0), (2.0, 3.0)]);
        s.append(2.0, 5.0);
        assert_eq!(s.points(), &[(0.0, 1.0), (2.0, 5.0)]);
    }

    #[test]
    fn moment_of_degenerate_series_is_nan() {
        assert!(series(&[]).moment(1).is_nan());
        assert!(series(&[(1.0, 2.0)]).moment(1).is_nan());
        assert!(series(&[(1.0, 2.0), (1.0, 3.0)]).moment(1).is_nan());
    }

    #[test]
    fn mean_and_var_of_simple_series() {
        // 2 on [0,3), 4 on [3,6]
        let s = series(&[(0.0, 2.0), (3.0, 4.0), (6.0, 4.0)]);
        assert_eq!(s.mean(), 3.0);
        // E[X^2] = (4*3 + 16*3)/6 = 10
        assert_eq!(s.var(), 1.0);
    }

    #[test]
    fn moment_is_additive_under_splitting() {
        let points = [(0.0, 1.0), (2.0, 4.0), (5.0, 2.0), (9.0, 0.0), (10.0, 3.0)];
        let full = series(&points);
        let m = full.moment(2);

        for split in 1..points.len() - 1 {
            let head = series(&points[..=split]);
            let tail = series(&points[split..]);
            let w_head = points[split].0 - points[0].0;
            let w_tail = points[points.len() - 1].0 - points[split].0;
            let combined =
                (head.moment(2) * w_head + tail.moment(2) * w_tail) / (w_head + w_tail);
            assert!((combined - m).abs() < 1e-12, "split at {split}");
        }
    }

    #[test]
    fn product_of_offset_series() {
        // 2 on [0,3), 4 on [3,6]  times  1 on [0,2), 5 on [2,6]
        let a = series(&[(0.0, 2.0), (3.0, 4.0), (6.0, 4.0)]);
        let b = series(&[(0.0, 1.0), (2.0, 5.0), (6.0, 5.0)]);
        let p = a.product(&b);
        assert_eq!(
            p.points(),
            &[(0.0, 2.0), (2.0, 10.0), (3.0, 20.0), (6.0, 20.0)]
        );
        assert!((p.moment(1) - 74.0 / 6.0).abs() < 1e-12);
        assert!((a.cov(&b) - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn product_is_commutative() {
        let a = series(&[(0.0, 2.0), (3.0, 4.0), (7.0, 1.0), (9.0, 1.0)]);
        let b = series(&[(1.0, 1.0), (2.0, 5.0), (8.0, 2.0), (9.0, 0.0)]);
        let ab = a.product(&b).moment(1);
        let ba = b.product(&a).moment(1);
        assert!((ab - ba).abs() < 1e-12);
    }

    #[test]
    fn covariance_of_constant_series_is_zero() {
        let a = series(&[(0.0, 5.0), (10.0, 5.0)]);
        let b = series(&[(0.0, 5.0), (10.0, 5.0)]);
        assert_eq!(a.product(&b).moment(1), 25.0);
        assert_eq!(a.cov(&b), 0.0);
    }

    #[test]
    fn histogram_accumulates_dwell_times() {
        // 0 for 3 units, 1 for 1 unit, 2 for 2 units
        let s = series(&[(0.0, 0.0), (3.0, 1.0), (4.0, 2.0), (6.0, 2.0)]);
        assert_eq!(s.histogram(), vec![3.0, 1.0, 2.0]);
        let normalized = s.normalized_histogram().unwrap();
        assert!((normalized[0] - 0.5).abs() < 1e-12);
        assert!((normalized[1] - 1.0 / 6.0).abs() < 1e-12);
        assert!((normalized[2] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn normalizing_degenerate_window_fails() {
        use crate::error::SystemError;
        assert_eq!(
            series(&[]).normalized_histogram().unwrap_err().err(),
            SystemError::DegenerateWindow
        );
        assert_eq!(
            series(&[(1.0, 2.0)])
                .normalized_histogram()
                .unwrap_err()
                .err(),
            SystemError::DegenerateWindow
        );
    }

    #[test]
    fn indicator_mean_measures_dwell_fraction() {
        let s = series(&[(0.0, 0.0), (3.0, 1.0), (4.0, 2.0), (6.0, 2.0)]);
        let p0 = s.mean_with(|c| if c == 0.0 { 1.0 } else { 0.0 });
        assert!((p0 - 0.5).abs() < 1e-12);
    }
}
