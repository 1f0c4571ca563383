//! Constant and Linear pacers (§4.2): given elapsed time and hits-so-far,
//! decide how long to wait before the next request, or whether to stop.
//!
//! Grounded on the reference implementation's `pacer.go`, a literal
//! transliteration of vegeta's pacer math (`expected = freq * floor(e/per)`,
//! "running behind the schedule sends immediately, otherwise wait until the
//! next scheduled tick"). Kept pure and synchronous so `worker::driver` can
//! unit test the scheduling decision without spinning up real sleeps.

use std::sync::Mutex;
use std::time::Duration;

/// `next_wait` returns how long to sleep before issuing hit number `hits`
/// (0-indexed), and whether the pacer considers the run over.
pub trait Pacer: Send + Sync {
    fn next_wait(&self, elapsed: Duration, hits: u64) -> (Duration, bool);
}

/// Flat `freq` hits per `per` duration.
#[derive(Debug, Clone, Copy)]
pub struct ConstantPacer {
    pub freq: f64,
    pub per: Duration,
}

impl ConstantPacer {
    pub fn new(freq: f64, per: Duration) -> Self {
        Self { freq, per }
    }

    /// Rebases this pacer to a new frequency while preserving `per` — used
    /// by the Step-mode Rps driver when elapsed time crosses a step
    /// boundary and `Nums[k]` changes (§4.2).
    pub fn rebased(&self, freq: f64) -> Self {
        Self { freq, per: self.per }
    }
}

impl Pacer for ConstantPacer {
    fn next_wait(&self, elapsed: Duration, hits: u64) -> (Duration, bool) {
        if self.freq <= 0.0 {
            return (Duration::ZERO, true);
        }
        let per_secs = self.per.as_secs_f64();
        let e = elapsed.as_secs_f64();
        let expected = self.freq * (e / per_secs).floor();

        if (hits as f64) < expected {
            return (Duration::ZERO, false);
        }

        let interval = per_secs / self.freq;
        let next_time = (hits as f64 + 1.0) * interval;
        if !next_time.is_finite() {
            return (Duration::ZERO, true);
        }
        let wait = (next_time - e).max(0.0);
        (Duration::from_secs_f64(wait), false)
    }
}

/// Rate grows linearly from `start_at` hits/sec with slope `a` hits/sec^2.
/// `expected(t) = a*t^2/2 + start_at*t`.
#[derive(Debug, Clone, Copy)]
pub struct LinearPacer {
    pub start_at: f64,
    pub slope: f64,
}

impl LinearPacer {
    pub fn new(start_at: f64, slope: f64) -> Self {
        Self { start_at, slope }
    }

    fn expected(&self, t: f64) -> f64 {
        self.slope * t * t / 2.0 + self.start_at * t
    }

    /// Solves `expected(t) = target` for the smallest non-negative `t`.
    fn time_for(&self, target: f64) -> f64 {
        if self.slope == 0.0 {
            if self.start_at <= 0.0 {
                return f64::INFINITY;
            }
            return target / self.start_at;
        }
        let discriminant = self.start_at * self.start_at + 2.0 * self.slope * target;
        if discriminant < 0.0 {
            return f64::INFINITY;
        }
        (-self.start_at + discriminant.sqrt()) / self.slope
    }
}

impl Pacer for LinearPacer {
    fn next_wait(&self, elapsed: Duration, hits: u64) -> (Duration, bool) {
        let e = elapsed.as_secs_f64();
        let expected = self.expected(e);

        if (hits as f64) < expected {
            return (Duration::ZERO, false);
        }

        let next_time = self.time_for(hits as f64 + 1.0);
        if !next_time.is_finite() {
            return (Duration::ZERO, true);
        }
        let wait = (next_time - e).max(0.0);
        (Duration::from_secs_f64(wait), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_pacer_sends_immediately_when_behind_schedule() {
        let pacer = ConstantPacer::new(10.0, Duration::from_secs(1));
        let (wait, stop) = pacer.next_wait(Duration::from_millis(500), 2);
        assert!(!stop);
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn constant_pacer_waits_for_next_tick_when_on_schedule() {
        let pacer = ConstantPacer::new(10.0, Duration::from_secs(1));
        let (wait, stop) = pacer.next_wait(Duration::from_millis(0), 0);
        assert!(!stop);
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(100));
    }

    #[test]
    fn constant_pacer_achieves_steady_state_rate_p4() {
        let pacer = ConstantPacer::new(100.0, Duration::from_secs(1));
        let mut elapsed = Duration::ZERO;
        let mut hits = 0u64;
        while elapsed < Duration::from_secs(10) {
            let (wait, stop) = pacer.next_wait(elapsed, hits);
            assert!(!stop);
            elapsed += wait;
            hits += 1;
        }
        let rate = hits as f64 / elapsed.as_secs_f64();
        assert!((rate - 100.0).abs() / 100.0 < 0.05, "rate was {rate}");
    }

    #[test]
    fn zero_freq_pacer_stops_immediately() {
        let pacer = ConstantPacer::new(0.0, Duration::from_secs(1));
        let (_, stop) = pacer.next_wait(Duration::ZERO, 0);
        assert!(stop);
    }

    #[test]
    fn rebased_pacer_keeps_per_but_changes_freq() {
        let pacer = ConstantPacer::new(10.0, Duration::from_secs(2));
        let rebased = pacer.rebased(50.0);
        assert_eq!(rebased.per, Duration::from_secs(2));
        assert_eq!(rebased.freq, 50.0);
    }

    #[test]
    fn linear_pacer_ramps_rate_upward() {
        let pacer = LinearPacer::new(1.0, 2.0);
        let (wait_early, _) = pacer.next_wait(Duration::ZERO, 0);
        let (wait_late, _) = pacer.next_wait(Duration::from_secs(5), 20);
        assert!(wait_late <= wait_early);
    }

    #[test]
    fn linear_pacer_matches_expected_curve() {
        let pacer = LinearPacer::new(0.0, 2.0);
        // expected(t) = t^2; at t=3, expected = 9 hits.
        assert!((pacer.expected(3.0) - 9.0).abs() < 1e-9);
    }
}
