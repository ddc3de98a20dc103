//! Aggregation of the NPV distribution into summary statistics.
//!
//! Accumulation order is fixed by the caller (worker 0's slice first, then
//! worker 1's, ...), so the same request on the same worker count
//! reproduces every statistic bit for bit regardless of how chunks were
//! stolen during the run.

use cairn_model::Statistics;

/// Index of the first non-finite value, if any. Run before any statistic;
/// a single NaN fails the run.
pub fn first_non_finite(x: &[f64]) -> Option<usize> {
    x.iter().position(|v| !v.is_finite())
}

/// Percentile by linear interpolation over an ascending-sorted slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * weight
}

/// Mean of the worst 5% tail: `k = max(1, floor(0.05 n))` smallest values.
pub fn cte95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = ((sorted.len() as f64 * 0.05) as usize).max(1);
    sorted[..k].iter().sum::<f64>() / k as f64
}

/// Full summary over the distribution. Zeroed statistics for an empty
/// distribution; the caller screens non-finite values first.
pub fn summarize(x: &[f64]) -> Statistics {
    if x.is_empty() {
        return Statistics::zeroed();
    }
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    // Population variance, not Bessel-corrected.
    let variance = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;

    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);

    Statistics {
        mean,
        std_dev: variance.sqrt(),
        p50: percentile(&sorted, 50.0),
        p75: percentile(&sorted, 75.0),
        p90: percentile(&sorted, 90.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
        cte95: cte95(&sorted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
        assert_eq!(percentile(&sorted, 50.0), 25.0);
        // rank = 0.25 * 3 = 0.75 -> 10 + 0.75 * 10
        assert_eq!(percentile(&sorted, 25.0), 17.5);
    }

    #[test]
    fn variance_is_population_form() {
        let x = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let s = summarize(&x);
        assert_eq!(s.mean, 5.0);
        // Population stddev of this classic set is exactly 2.
        assert_eq!(s.std_dev, 2.0);
    }

    #[test]
    fn cte95_takes_the_k_smallest() {
        // n = 40 -> k = 2.
        let mut x: Vec<f64> = (1..=40).map(|v| v as f64).collect();
        x.reverse();
        let mut sorted = x.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(cte95(&sorted), 1.5);

        // n = 10 -> floor(0.5) = 0, clamped to 1.
        let sorted: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(cte95(&sorted), 1.0);
    }

    #[test]
    fn empty_distribution_summarizes_to_zeroes() {
        let s = summarize(&[]);
        assert_eq!(s, Statistics::zeroed());
    }

    #[test]
    fn percentiles_are_ordered_on_spread_data() {
        let x: Vec<f64> = (0..1000).map(|i| (i as f64) * 3.7).collect();
        let s = summarize(&x);
        assert!(s.p50 < s.p75);
        assert!(s.p75 < s.p90);
        assert!(s.p90 < s.p95);
        assert!(s.p95 < s.p99);
        assert!(s.cte95 <= s.p50);
    }

    #[test]
    fn non_finite_scan_finds_the_first_offender() {
        assert_eq!(first_non_finite(&[1.0, 2.0]), None);
        assert_eq!(first_non_finite(&[1.0, f64::NAN, f64::NAN]), Some(1));
        assert_eq!(first_non_finite(&[f64::INFINITY]), Some(0));
    }
}
