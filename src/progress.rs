//! Local playback position interpolation.
//!
//! Servers push the position only occasionally. In between, the position is
//! extrapolated from the last authoritative value:
//!
//! ```text
//! estimate = min(position + elapsed × speed, duration)
//! ```
//!
//! Each authoritative update replaces the baseline, so estimation error never
//! accumulates across updates.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq)]
struct Baseline {
    position: Duration,
    duration: Duration,
    speed: f64,
    playing: bool,
    at: Instant,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressEstimator {
    baseline: Option<Baseline>,
}

impl ProgressEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the baseline with authoritative values observed at `at`.
    ///
    /// Negative or non-finite speeds are treated as stalled playback.
    pub fn reset(
        &mut self,
        position: Duration,
        duration: Duration,
        speed: f64,
        playing: bool,
        at: Instant,
    ) {
        let speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            0.0
        };

        self.baseline = Some(Baseline {
            position,
            duration,
            speed,
            playing,
            at,
        });
    }

    /// Forgets the baseline, for instance when the track is unknown.
    pub fn clear(&mut self) {
        self.baseline = None;
    }

    /// Whether ticking would produce an estimate: playing with a known
    /// duration.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.baseline
            .is_some_and(|baseline| baseline.playing && !baseline.duration.is_zero())
    }

    /// Estimated position at `now`, or `None` when not [active](Self::is_active).
    #[must_use]
    pub fn estimate(&self, now: Instant) -> Option<Duration> {
        let baseline = self.baseline.filter(|_| self.is_active())?;

        let elapsed = now.saturating_duration_since(baseline.at);
        let advanced = Duration::try_from_secs_f64(elapsed.as_secs_f64() * baseline.speed)
            .unwrap_or(Duration::MAX);

        Some(
            baseline
                .position
                .saturating_add(advanced)
                .min(baseline.duration),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn extrapolates_at_playback_speed() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new();
        estimator.reset(10 * SECOND, 180 * SECOND, 1.5, true, start);

        assert_eq!(estimator.estimate(start), Some(10 * SECOND));
        assert_eq!(estimator.estimate(start + 2 * SECOND), Some(13 * SECOND));
    }

    #[test]
    fn never_exceeds_duration() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new();
        estimator.reset(170 * SECOND, 180 * SECOND, 1.0, true, start);

        assert_eq!(estimator.estimate(start + 60 * SECOND), Some(180 * SECOND));
    }

    #[test]
    fn idle_without_playback_or_duration() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new();
        assert_eq!(estimator.estimate(start), None);

        estimator.reset(5 * SECOND, 180 * SECOND, 1.0, false, start);
        assert!(!estimator.is_active());
        assert_eq!(estimator.estimate(start + SECOND), None);

        estimator.reset(5 * SECOND, Duration::ZERO, 1.0, true, start);
        assert_eq!(estimator.estimate(start + SECOND), None);
    }

    #[test]
    fn reset_discards_accumulated_drift() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new();
        estimator.reset(Duration::ZERO, 180 * SECOND, 1.0, true, start);
        assert_eq!(estimator.estimate(start + 30 * SECOND), Some(30 * SECOND));

        // The server says we are behind the estimate.
        estimator.reset(20 * SECOND, 180 * SECOND, 1.0, true, start + 30 * SECOND);
        assert_eq!(estimator.estimate(start + 31 * SECOND), Some(21 * SECOND));
    }

    #[test]
    fn negative_speed_stalls() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new();
        estimator.reset(5 * SECOND, 180 * SECOND, -1.0, true, start);

        assert_eq!(estimator.estimate(start + 10 * SECOND), Some(5 * SECOND));
    }

    proptest! {
        #[test]
        fn monotonic_and_bounded(
            position_ms in 0u64..600_000,
            duration_ms in 1u64..600_000,
            speed in 0.0f64..4.0,
            mut offsets in prop::collection::vec(0u64..1_000_000, 1..20),
        ) {
            let start = Instant::now();
            let duration = Duration::from_millis(duration_ms);
            let mut estimator = ProgressEstimator::new();
            estimator.reset(Duration::from_millis(position_ms), duration, speed, true, start);

            offsets.sort_unstable();
            let mut previous = Duration::ZERO;
            for offset in offsets {
                let estimate = estimator
                    .estimate(start + Duration::from_millis(offset))
                    .unwrap();
                prop_assert!(estimate >= previous);
                prop_assert!(estimate <= duration);
                previous = estimate;
            }
        }
    }
}
