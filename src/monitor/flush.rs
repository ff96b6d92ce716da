//! Decides when buffered rows surface. Realtime mode shows every row
//! as it is made; buffered mode holds rows back on a cadence that
//! stretches as the session ages.

use crate::config::DisplayMode;

/// Buffered sessions stay quiet this long before their first flush.
const INITIAL_FLUSH_DEFER: f64 = 10.0;

/// Samples averaged into one displayed row. The epsilon keeps exact
/// ratios like 0.3/0.1 from rounding up twice.
pub fn samples_per_row(sampling_rate: f64, sampler_interval: f64) -> usize {
    ((sampling_rate / sampler_interval) - 1e-9).ceil().max(1.0) as usize
}

/// Seconds between buffered flushes at a given point in the session.
pub fn flush_interval(elapsed: f64) -> f64 {
    if elapsed <= 10.0 {
        10.0
    } else if elapsed <= 20.0 {
        2.0
    } else if elapsed <= 60.0 {
        5.0
    } else if elapsed <= 300.0 {
        10.0
    } else if elapsed <= 900.0 {
        20.0
    } else {
        30.0
    }
}

#[derive(Debug)]
pub struct FlushController {
    mode: DisplayMode,
    samples_per_row: usize,
    initial_flushed: bool,
    last_flush_elapsed: f64,
}

impl FlushController {
    pub fn new(mode: DisplayMode, sampling_rate: f64, sampler_interval: f64) -> Self {
        FlushController {
            mode,
            samples_per_row: samples_per_row(sampling_rate, sampler_interval),
            initial_flushed: false,
            last_flush_elapsed: 0.0,
        }
    }

    pub fn should_aggregate(&self, pending: usize) -> bool {
        pending >= self.samples_per_row
    }

    /// Call when rows are waiting; answers whether they surface now.
    /// `elapsed` is seconds since the current save window began.
    pub fn should_flush(&mut self, elapsed: f64) -> bool {
        match self.mode {
            DisplayMode::Realtime => true,
            DisplayMode::Buffered => {
                if !self.initial_flushed {
                    if elapsed >= INITIAL_FLUSH_DEFER {
                        self.initial_flushed = true;
                        self.last_flush_elapsed = elapsed;
                        true
                    } else {
                        false
                    }
                } else if elapsed - self.last_flush_elapsed >= flush_interval(elapsed) {
                    self.last_flush_elapsed = elapsed;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A rotation empties every buffer, so the cadence starts over.
    pub fn reset_after_rotation(&mut self) {
        self.initial_flushed = false;
        self.last_flush_elapsed = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! samples_per_row_tests {
        ($($name:ident: ($rate:expr, $interval:expr) => $expected:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    assert_eq!(
                        samples_per_row($rate, $interval),
                        $expected,
                        "rate {} interval {}",
                        $rate,
                        $interval
                    );
                }
            )*
        };
    }

    samples_per_row_tests! {
        default_rate: (1.0, 0.1) => 10,
        sub_second_rate: (0.2, 0.1) => 2,
        inexact_ratio_stays_put: (0.3, 0.1) => 3,
        coarse_probe_rounds_up: (1.0, 0.3) => 4,
        rate_equal_to_interval: (0.5, 0.5) => 1,
        fractional_rounds_up: (2.5, 1.0) => 3,
        slowest_rate: (10.0, 0.1) => 100,
        fastest_rate: (0.1, 0.1) => 1,
    }

    #[test]
    fn interval_table_stretches_with_age() {
        assert_eq!(flush_interval(5.0), 10.0);
        assert_eq!(flush_interval(15.0), 2.0);
        assert_eq!(flush_interval(45.0), 5.0);
        assert_eq!(flush_interval(200.0), 10.0);
        assert_eq!(flush_interval(899.0), 20.0);
        assert_eq!(flush_interval(2000.0), 30.0);
    }

    #[test]
    fn realtime_always_flushes() {
        let mut flush = FlushController::new(DisplayMode::Realtime, 1.0, 0.1);
        for elapsed in [0.5, 1.0, 100.0] {
            assert!(flush.should_flush(elapsed));
        }
    }

    #[test]
    fn buffered_cadence_walk() {
        let mut flush = FlushController::new(DisplayMode::Buffered, 1.0, 0.1);
        let mut points = Vec::new();
        let mut elapsed = 0.0;
        while elapsed <= 70.0 {
            if flush.should_flush(elapsed) {
                points.push(elapsed);
            }
            elapsed += 0.5;
        }
        assert_eq!(
            points,
            vec![
                10.0, 12.0, 14.0, 16.0, 18.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0,
                60.0, 70.0
            ],
            "first flush deferred to 10s, then the cadence table"
        );
    }

    #[test]
    fn rotation_restores_the_initial_deferral() {
        let mut flush = FlushController::new(DisplayMode::Buffered, 1.0, 0.1);
        assert!(flush.should_flush(10.0));
        assert!(flush.should_flush(12.0));
        flush.reset_after_rotation();
        assert!(!flush.should_flush(3.0), "quiet period applies again");
        assert!(flush.should_flush(10.5));
    }

    #[test]
    fn aggregation_threshold_tracks_samples_per_row() {
        let flush = FlushController::new(DisplayMode::Buffered, 1.0, 0.1);
        assert!(!flush.should_aggregate(9));
        assert!(flush.should_aggregate(10));
        assert!(flush.should_aggregate(11));
    }
}
