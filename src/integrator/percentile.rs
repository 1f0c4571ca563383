//! Latency percentile and histogram computation (§4.3 Summary computation).
//!
//! Grounded on the reference implementation's `latencyCalculate` /
//! `calculateLatencyDistribution` in `integrate.go`, re-expressed over a
//! dense millisecond-bucket count array the way the teacher's own
//! `percentiles.rs` builds histograms from `hdrhistogram` — here the counts
//! come from the worker-reported `duration_map`/`time_buckets` rather than
//! a live `hdrhistogram::Histogram`, since the source format is already a
//! discrete ms->count table.

use std::collections::HashMap;

/// The percentiles the Summary computation reports, in the exact order
/// named by §4.3.
pub const TARGET_PERCENTILES: &[f64] = &[10.0, 25.0, 50.0, 75.0, 90.0, 95.0, 99.0, 99.9];

pub fn percentile_label(p: f64) -> String {
    if (p - p.trunc()).abs() < f64::EPSILON {
        format!("p{}", p as u64)
    } else {
        format!("p{p}")
    }
}

/// Computes, for each target percentile, the smallest ms at which
/// cumulative observation count is >= `p * num_res / 100`. A percentile
/// that is never crossed — `num_res == 0`, or `p` exceeds the last
/// observed ms — is `None` rather than a phantom zero (§9 Open Question
/// (e): preserves P6's "monotone non-decreasing in p" even at the edges,
/// since a zeroed-in entry would otherwise look like the fastest possible
/// response).
pub fn latency_distribution(
    duration_map: &HashMap<u64, u64>,
    num_res: u64,
) -> HashMap<String, Option<u64>> {
    let mut out = HashMap::with_capacity(TARGET_PERCENTILES.len());
    if num_res == 0 {
        for &p in TARGET_PERCENTILES {
            out.insert(percentile_label(p), None);
        }
        return out;
    }

    let mut ms_sorted: Vec<u64> = duration_map.keys().copied().collect();
    ms_sorted.sort_unstable();

    let mut cumulative = 0u64;
    let mut remaining_targets: Vec<(f64, u64)> = TARGET_PERCENTILES
        .iter()
        .map(|&p| (p, ((p * num_res as f64) / 100.0).ceil() as u64))
        .collect();

    for ms in ms_sorted {
        cumulative += duration_map.get(&ms).copied().unwrap_or(0);
        remaining_targets.retain(|(p, target)| {
            if cumulative >= *target {
                out.insert(percentile_label(*p), Some(ms));
                false
            } else {
                true
            }
        });
        if remaining_targets.is_empty() {
            break;
        }
    }
    for (p, _) in remaining_targets {
        out.insert(percentile_label(p), None);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
    pub mark: u64,
    pub count: u64,
    pub frequency: f64,
}

/// Partitions `[fastest, slowest]` into 10 equal-width, inclusive-endpoint
/// buckets and assigns every observed ms in `duration_map` to its bucket,
/// reporting `frequency = count/num_res` rounded to two decimals.
pub fn histogram(
    duration_map: &HashMap<u64, u64>,
    fastest: u64,
    slowest: u64,
    num_res: u64,
) -> Vec<HistogramBucket> {
    if num_res == 0 || slowest < fastest {
        return Vec::new();
    }
    let span = (slowest - fastest).max(1);
    let bucket_count = 10u64;
    let width = (span as f64 / bucket_count as f64).max(1.0);

    let mut buckets = vec![0u64; bucket_count as usize];
    for (&ms, &count) in duration_map {
        if ms < fastest || ms > slowest {
            continue;
        }
        let mut idx = (((ms - fastest) as f64) / width).floor() as usize;
        if idx >= bucket_count as usize {
            idx = bucket_count as usize - 1;
        }
        buckets[idx] += count;
    }

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, count)| {
            let mark = fastest + ((i as f64 + 1.0) * width).round() as u64;
            HistogramBucket {
                mark: mark.min(slowest),
                count,
                frequency: (count as f64 / num_res as f64 * 100.0).round() / 100.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_distribution_is_monotone_non_decreasing_p6() {
        let mut duration_map = HashMap::new();
        for ms in 1..=100u64 {
            duration_map.insert(ms, 1);
        }
        let dist = latency_distribution(&duration_map, 100);

        let mut prev = 0u64;
        for &p in TARGET_PERCENTILES {
            if let Some(Some(ms)) = dist.get(&percentile_label(p)).copied() {
                assert!(ms >= prev, "percentile {p} regressed: {ms} < {prev}");
                prev = ms;
            }
        }
    }

    #[test]
    fn zero_observations_yields_all_none() {
        let dist = latency_distribution(&HashMap::new(), 0);
        for &p in TARGET_PERCENTILES {
            assert_eq!(dist.get(&percentile_label(p)), Some(&None));
        }
    }

    #[test]
    fn p50_of_uniform_distribution_lands_near_middle() {
        let mut duration_map = HashMap::new();
        for ms in 1..=10u64 {
            duration_map.insert(ms, 10);
        }
        let dist = latency_distribution(&duration_map, 100);
        let p50 = dist.get("p50").copied().flatten().unwrap();
        assert!((4..=6).contains(&p50), "p50 was {p50}");
    }

    #[test]
    fn histogram_buckets_sum_to_total_observations() {
        let mut duration_map = HashMap::new();
        for ms in 0..=99u64 {
            duration_map.insert(ms, 2);
        }
        let buckets = histogram(&duration_map, 0, 99, 200);
        let total: u64 = buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 200);
        assert_eq!(buckets.len(), 10);
    }

    #[test]
    fn histogram_is_empty_when_no_observations() {
        assert!(histogram(&HashMap::new(), 0, 0, 0).is_empty());
    }
}
