//! Pairwise clock-pair model: offset + drift estimation via an anchor
//! point and a PI controller, built from DF17 sync-point observations.

use crate::clock::Clock;

const KP: f64 = 0.05;
const KI: f64 = 0.01;
const OUTLIER_CONSECUTIVE_RESET: u32 = 5;
const HARD_STEP_THRESHOLD: f64 = 10e-6;
const CUMULATIVE_ERROR_CLAMP: f64 = 50e-6;
const VALID_ERROR_THRESHOLD: f64 = 4e-6;
/// How long (seconds, wall/monotonic) a pair may go without an accepted
/// update before `ClockTracker` prunes it.
pub const STALE_AFTER: f64 = 120.0;

/// State of one directed pair of clocks `(base, peer)`.
#[derive(Debug, Clone)]
pub struct ClockPair {
    drift_max: f64,
    drift_max_delta: f64,
    outlier_threshold: f64,

    base_ref: Option<f64>,
    peer_ref: Option<f64>,
    raw_drift: Option<f64>,

    drift: f64,
    i_drift: f64,
    cumulative_error: f64,

    recent_var_sum: f64,
    recent_sync_count: u32,
    prev_var_sum: f64,
    prev_sync_count: u32,

    outliers: u32,
    last_update: f64,
}

impl ClockPair {
    pub fn new(base: &Clock, peer: &Clock) -> ClockPair {
        let drift_max = base.max_freq_error + peer.max_freq_error;
        ClockPair {
            drift_max,
            drift_max_delta: drift_max / 10.0,
            outlier_threshold: 5.0 * (base.jitter * base.jitter + peer.jitter * peer.jitter).sqrt(),
            base_ref: None,
            peer_ref: None,
            raw_drift: None,
            drift: 0.0,
            i_drift: 0.0,
            cumulative_error: 0.0,
            recent_var_sum: 0.0,
            recent_sync_count: 0,
            prev_var_sum: 0.0,
            prev_sync_count: 0,
            outliers: 0,
            last_update: 0.0,
        }
    }

    /// Total sync points contributing to the current ~60s window.
    pub fn sync_count(&self) -> u32 {
        self.recent_sync_count + self.prev_sync_count
    }

    pub fn drift(&self) -> f64 {
        self.drift
    }

    pub fn i_drift(&self) -> f64 {
        self.i_drift
    }

    pub fn outliers(&self) -> u32 {
        self.outliers
    }

    /// Standard error of the pairing, seconds. Infinite with no data yet.
    pub fn error(&self) -> f64 {
        let count = self.sync_count();
        if count == 0 {
            return f64::INFINITY;
        }
        ((self.recent_var_sum + self.prev_var_sum) / count as f64).sqrt()
    }

    /// Is this pairing usable for clock normalization?
    pub fn valid(&self) -> bool {
        self.sync_count() >= 2 && self.error() < VALID_ERROR_THRESHOLD && self.outliers == 0
    }

    /// Has an accepted update arrived within the last `STALE_AFTER` seconds?
    pub fn is_expired(&self, now: f64) -> bool {
        now - self.last_update > STALE_AFTER
    }

    /// Guard against out-of-order/duplicate base timestamps, checked by the
    /// caller before computing propagation-adjusted intervals.
    pub fn is_new(&self, base_ts: f64) -> bool {
        match self.base_ref {
            None => true,
            Some(base_ref) => base_ts > base_ref,
        }
    }

    pub fn predict_peer(&self, base_ts: f64) -> Option<f64> {
        let (base_ref, peer_ref) = (self.base_ref?, self.peer_ref?);
        Some(peer_ref + (base_ts - base_ref) * (1.0 + self.drift))
    }

    pub fn predict_base(&self, peer_ts: f64) -> Option<f64> {
        let (base_ref, peer_ref) = (self.base_ref?, self.peer_ref?);
        Some(base_ref + (peer_ts - peer_ref) * (1.0 + self.i_drift))
    }

    /// Drop anchor and rolling sums; the drift estimate is kept since it
    /// remains a reasonable rate guess even after a hard reset.
    pub fn reset(&mut self) {
        self.base_ref = None;
        self.peer_ref = None;
        self.cumulative_error = 0.0;
        self.recent_var_sum = 0.0;
        self.recent_sync_count = 0;
        self.prev_var_sum = 0.0;
        self.prev_sync_count = 0;
        self.outliers = 0;
    }

    /// Rotate the recent accumulators into the previous bucket. Called
    /// every 30s by `ClockTracker` so the combined window is ~60s.
    pub fn periodic_update(&mut self) {
        self.prev_var_sum = self.recent_var_sum;
        self.prev_sync_count = self.recent_sync_count;
        self.recent_var_sum = 0.0;
        self.recent_sync_count = 0;
    }

    /// Feed one sync-point observation. Returns `true` if accepted.
    pub fn update(
        &mut self,
        base_ts: f64,
        peer_ts: f64,
        base_interval: f64,
        peer_interval: f64,
        now: f64,
    ) -> bool {
        if base_interval == 0.0 {
            return false;
        }

        // Step 1: candidate drift.
        let d = (peer_interval - base_interval) / base_interval;
        if d.abs() > self.drift_max {
            return false;
        }

        // Step 2: drift-jump outlier candidate.
        let mut outlier_candidate = match self.raw_drift {
            Some(raw_drift) => (d - raw_drift).abs() > self.drift_max_delta,
            None => false,
        };

        let had_prior = self.base_ref.is_some();
        let mut prediction_error = 0.0;
        let mut prediction = None;

        if had_prior {
            let base_ref = self.base_ref.unwrap();
            let peer_ref = self.peer_ref.unwrap();

            // Step 3: reject stale/past observations outright.
            if base_ts < base_ref && peer_ts < peer_ref {
                return false;
            }

            let pred = self.predict_peer(base_ts).unwrap();
            prediction_error = pred - peer_ts;
            prediction = Some(pred);

            let out_of_order = pred < peer_ref;
            if out_of_order
                || (prediction_error.abs() > self.outlier_threshold
                    && prediction_error.abs() > 5.0 * self.error())
            {
                outlier_candidate = true;
            }
        }

        // Step 4: outlier gating — reject until 5 consecutive, then accept
        // as a reset-like hard step.
        let mut accepting_after_run = false;
        if outlier_candidate {
            self.outliers += 1;
            if self.outliers < OUTLIER_CONSECUTIVE_RESET {
                return false;
            }
            accepting_after_run = true;
        }

        // Step 5: update raw drift.
        self.raw_drift = Some(match self.raw_drift {
            None => d,
            Some(raw_drift) => raw_drift + KP * (d - raw_drift),
        });

        // Step 6: update anchor.
        let hard_step =
            !had_prior || accepting_after_run || prediction_error.abs() > HARD_STEP_THRESHOLD;
        if hard_step {
            self.base_ref = Some(base_ts);
            self.peer_ref = Some(peer_ts);
        } else {
            self.base_ref = Some(base_ts);
            self.peer_ref = Some(prediction.unwrap() - 0.5 * prediction_error);
        }

        // Step 7: accumulate statistics.
        if had_prior {
            self.recent_var_sum += prediction_error * prediction_error;
            self.recent_sync_count += 1;
            if !accepting_after_run {
                self.cumulative_error = (self.cumulative_error + prediction_error)
                    .clamp(-CUMULATIVE_ERROR_CLAMP, CUMULATIVE_ERROR_CLAMP);
            }
        }

        // Step 8: recompute derived drift terms.
        let raw_drift = self.raw_drift.unwrap();
        self.drift = raw_drift - KI * self.cumulative_error;
        self.i_drift = -self.drift / (1.0 + self.drift);

        // Step 9: accepted update clears the consecutive-outlier counter.
        self.outliers = 0;
        self.last_update = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> ClockPair {
        let base = Clock::from_type("beast").unwrap();
        let peer = Clock::from_type("beast").unwrap();
        ClockPair::new(&base, &peer)
    }

    #[test]
    fn first_update_is_always_accepted() {
        let mut p = pair();
        assert!(p.update(0.0, 0.0, 1.0, 1.0, 0.0));
        assert_eq!(p.sync_count(), 0); // no prior anchor -> no prediction error yet
    }

    #[test]
    fn consistent_updates_become_valid() {
        let mut p = pair();
        for i in 0..5 {
            let t = i as f64;
            assert!(p.update(t, t, 1.0, 1.0, t));
        }
        assert!(p.sync_count() >= 2);
        assert!(p.valid(), "pairing should be valid after consistent syncs");
    }

    #[test]
    fn predict_peer_base_are_mutual_inverses() {
        let mut p = pair();
        for i in 0..5 {
            let t = i as f64;
            p.update(t, t + 0.01, 1.0, 1.0, t);
        }
        let base_ts = 4.5;
        let peer_ts = p.predict_peer(base_ts).unwrap();
        let back = p.predict_base(peer_ts).unwrap();
        assert!((back - base_ts).abs() < 1e-9);
    }

    #[test]
    fn monotonic_prediction_for_finite_drift() {
        let mut p = pair();
        for i in 0..5 {
            let t = i as f64;
            p.update(t, t, 1.0, 1.0, t);
        }
        let a = p.predict_peer(10.0).unwrap();
        let b = p.predict_peer(20.0).unwrap();
        assert!(a <= b);
    }

    #[test]
    fn single_outlier_is_rejected_not_fatal() {
        let mut p = pair();
        for i in 0..5 {
            let t = i as f64;
            assert!(p.update(t, t, 1.0, 1.0, t));
        }
        assert!(p.valid());

        // A sync point whose prediction_error is ~100us, far beyond
        // outlier_threshold for a `beast` pair (83ns jitter).
        let accepted = p.update(5.0, 5.0 + 100e-6, 1.0, 1.0, 5.0);
        assert!(!accepted);
        assert_eq!(p.outliers(), 1);
        assert!(p.valid(), "single outlier must not invalidate the pairing");
    }

    #[test]
    fn five_consecutive_outliers_force_hard_reset() {
        let mut p = pair();
        for i in 0..5 {
            let t = i as f64;
            assert!(p.update(t, t, 1.0, 1.0, t));
        }

        for i in 0..4 {
            let t = 5.0 + i as f64;
            let accepted = p.update(t, t + 100e-6, 1.0, 1.0, t);
            assert!(!accepted);
        }
        assert_eq!(p.outliers(), 4);

        // Fifth consecutive outlier is accepted as a hard step.
        let accepted = p.update(9.0, 9.0 + 100e-6, 1.0, 1.0, 9.0);
        assert!(accepted);
        assert_eq!(p.outliers(), 0);
    }

    #[test]
    fn reset_clears_anchor_but_not_drift() {
        let mut p = pair();
        for i in 0..3 {
            let t = i as f64;
            p.update(t, t, 1.0, 1.0, t);
        }
        let drift_before = p.drift();
        p.reset();
        assert!(p.predict_peer(1.0).is_none());
        assert_eq!(p.drift(), drift_before);
    }

    #[test]
    fn is_expired_after_stale_window() {
        let mut p = pair();
        p.update(0.0, 0.0, 1.0, 1.0, 0.0);
        assert!(!p.is_expired(100.0));
        assert!(p.is_expired(130.0));
    }
}
