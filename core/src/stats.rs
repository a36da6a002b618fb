//! Per-stream queue statistics.
//!
//! [QueueStats] is the record a stream accumulates during a run: three
//! time-count trajectories, busy/idle period data, per-job timing samples
//! and the window counters. Degenerate statistics are NaN, never errors.

use crate::error::TypedResult;
use crate::series::TimeCountSeries;

/// An append-only sequence of f64 samples with sample statistics.
///
/// `var`/`std` use the n-1 denominator; fewer than two samples give NaN,
/// an empty array has a NaN mean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleArray(Vec<f64>);

impl SampleArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.0.push(value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn mean(&self) -> f64 {
        if self.0.is_empty() {
            return f64::NAN;
        }
        self.0.iter().sum::<f64>() / self.0.len() as f64
    }

    pub fn var(&self) -> f64 {
        if self.0.len() < 2 {
            return f64::NAN;
        }
        let mean = self.mean();
        let ss: f64 = self.0.iter().map(|x| (x - mean).powi(2)).sum();
        ss / (self.0.len() - 1) as f64
    }

    pub fn std(&self) -> f64 {
        self.var().sqrt()
    }

    /// Standard deviation of the mean.
    pub fn sdom(&self) -> f64 {
        self.std() / (self.0.len() as f64).sqrt()
    }
}

impl FromIterator<f64> for SampleArray {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Sample covariance of two equal-length arrays (n-1 denominator).
///
/// NaN when the lengths differ or fewer than two pairs exist.
pub fn sample_cov(x: &SampleArray, y: &SampleArray) -> f64 {
    if x.len() != y.len() || x.len() < 2 {
        return f64::NAN;
    }
    let mx = x.mean();
    let my = y.mean();
    let ss: f64 = x
        .as_slice()
        .iter()
        .zip(y.as_slice())
        .map(|(xi, yi)| (xi - mx) * (yi - my))
        .sum();
    ss / (x.len() - 1) as f64
}

/// Busy periods of one stream: start instant, duration and jobs served.
#[derive(Debug, Clone, Default)]
pub struct BusyPeriods {
    pub start: SampleArray,
    pub duration: SampleArray,
    pub num_jobs: SampleArray,
}

impl BusyPeriods {
    pub fn record(&mut self, start: f64, duration: f64, num_jobs: u64) {
        self.start.push(start);
        self.duration.push(duration);
        self.num_jobs.push(num_jobs as f64);
    }
}

/// Idle periods of one stream: start instant and duration.
#[derive(Debug, Clone, Default)]
pub struct IdlePeriods {
    pub start: SampleArray,
    pub duration: SampleArray,
}

impl IdlePeriods {
    pub fn record(&mut self, start: f64, duration: f64) {
        self.start.push(start);
        self.duration.push(duration);
    }
}

/// Everything one stream records inside the observation window.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub jobs_waiting: TimeCountSeries,
    pub jobs_receiving_service: TimeCountSeries,
    pub jobs_in_system: TimeCountSeries,
    pub busy_period: BusyPeriods,
    pub idle_period: IdlePeriods,
    pub job_wait_time: SampleArray,
    pub job_service_time: SampleArray,
    pub job_response_time: SampleArray,
    pub total_arrivals: u64,
    pub total_departures: u64,
    pub total_time: f64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of the window with `cond(jobs_waiting)` true.
    pub fn p_jobs_waiting(&self, cond: impl Fn(f64) -> bool) -> f64 {
        self.jobs_waiting
            .mean_with(|c| if cond(c) { 1.0 } else { 0.0 })
    }

    /// Fraction of the window with `cond(jobs_in_system)` true.
    pub fn p_jobs_in_system(&self, cond: impl Fn(f64) -> bool) -> f64 {
        self.jobs_in_system
            .mean_with(|c| if cond(c) { 1.0 } else { 0.0 })
    }

    /// Fraction of the window with an empty system.
    pub fn mean_p0(&self) -> f64 {
        self.p_jobs_in_system(|c| c == 0.0)
    }

    pub fn cov_jobs_waiting_and_receiving(&self) -> f64 {
        self.jobs_waiting.cov(&self.jobs_receiving_service)
    }

    pub fn cov_wait_and_service(&self) -> f64 {
        sample_cov(&self.job_wait_time, &self.job_service_time)
    }

    pub fn histogram_jobs_waiting(&self) -> Vec<f64> {
        self.jobs_waiting.histogram()
    }

    pub fn prob_histogram_jobs_waiting(&self) -> TypedResult<Vec<f64>> {
        self.jobs_waiting.normalized_histogram()
    }

    pub fn histogram_jobs_in_system(&self) -> Vec<f64> {
        self.jobs_in_system.histogram()
    }

    pub fn prob_histogram_jobs_in_system(&self) -> TypedResult<Vec<f64>> {
        self.jobs_in_system.normalized_histogram()
    }

    /// Count of busy periods per total jobs served, 1-based (index 0 holds
    /// the single-job periods).
    pub fn histogram_jobs_in_busy_period(&self) -> Vec<u64> {
        let mut histogram: Vec<u64> = Vec::new();
        for &n in self.busy_period.num_jobs.as_slice() {
            let n = n.round() as usize;
            if n == 0 {
                continue;
            }
            if n > histogram.len() {
                histogram.resize(n, 0);
            }
            histogram[n - 1] += 1;
        }
        histogram
    }
}

/// Element-wise mean of histograms of possibly different lengths (missing
/// tails count as zero).
pub fn mean_histogram<'a, I>(histograms: I) -> Vec<f64>
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let mut sums: Vec<f64> = Vec::new();
    let mut count = 0usize;
    for histogram in histograms {
        count += 1;
        if histogram.len() > sums.len() {
            sums.resize(histogram.len(), 0.0);
        }
        for (sum, value) in sums.iter_mut().zip(histogram) {
            *sum += value;
        }
    }
    if count == 0 {
        return sums;
    }
    sums.iter().map(|s| s / count as f64).collect()
}

/// A histogram scaled to sum to one.
pub fn norm_histogram(histogram: &[f64]) -> Vec<f64> {
    let total: f64 = histogram.iter().sum();
    histogram.iter().map(|value| value / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_array_statistics() {
        let samples: SampleArray = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter().collect();
        assert_eq!(samples.mean(), 5.0);
        assert!((samples.var() - 32.0 / 7.0).abs() < 1e-12);
        assert!((samples.sdom() - samples.std() / 8f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn degenerate_sample_arrays_are_nan() {
        let empty = SampleArray::new();
        assert!(empty.mean().is_nan());
        assert!(empty.var().is_nan());

        let single: SampleArray = [1.0].into_iter().collect();
        assert_eq!(single.mean(), 1.0);
        assert!(single.var().is_nan());
        assert!(single.sdom().is_nan());
    }

    #[test]
    fn sample_covariance() {
        let x: SampleArray = [1.0, 2.0, 3.0, 4.0].into_iter().collect();
        let y: SampleArray = [2.0, 4.0, 6.0, 8.0].into_iter().collect();
        // cov = 2 * var(x)
        assert!((sample_cov(&x, &y) - 2.0 * x.var()).abs() < 1e-12);

        let short: SampleArray = [1.0].into_iter().collect();
        assert!(sample_cov(&x, &short).is_nan());
        assert!(sample_cov(&short, &short).is_nan());
    }

    #[test]
    fn busy_period_histogram_is_one_based() {
        let mut stats = QueueStats::new();
        stats.busy_period.record(0.0, 1.0, 1);
        stats.busy_period.record(2.0, 3.0, 3);
        stats.busy_period.record(7.0, 1.5, 1);
        assert_eq!(stats.histogram_jobs_in_busy_period(), vec![2, 0, 1]);
    }

    #[test]
    fn histogram_merge_helpers() {
        let a = vec![2.0, 2.0];
        let b = vec![4.0, 0.0, 2.0];
        let mean = mean_histogram([a.as_slice(), b.as_slice()]);
        assert_eq!(mean, vec![3.0, 1.0, 1.0]);

        let normalized = norm_histogram(&mean);
        assert_eq!(normalized, vec![0.6, 0.2, 0.2]);
    }

    #[test]
    fn empty_system_probability() {
        let mut stats = QueueStats::new();
        stats.jobs_in_system.append(0.0, 0.0);
        stats.jobs_in_system.append(4.0, 2.0);
        stats.jobs_in_system.append(8.0, 2.0);
        assert!((stats.mean_p0() - 0.5).abs() < 1e-12);
    }
}
