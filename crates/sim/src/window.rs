//! Trailing statistics window and anomaly scoring.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use plantwire_core::{Thresholds, WindowStats};
use serde::{Deserialize, Serialize};

/// Fixed-duration window of `(timestamp, value)` samples for one sensor.
///
/// Coverage is defined by time, not by sample count, so sensors with different
/// sampling intervals get windows of the same duration.
#[derive(Debug, Clone)]
pub struct StatWindow {
    window_secs: u64,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl StatWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            samples: VecDeque::new(),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample, evict everything at or before `at − window`, and
    /// return the recomputed statistics.
    pub fn push(&mut self, at: DateTime<Utc>, value: f64) -> WindowStats {
        self.samples.push_back((at, value));
        let cutoff = at - Duration::seconds(self.window_secs as i64);
        while let Some((ts, _)) = self.samples.front() {
            if *ts <= cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.stats(at)
    }

    /// Exact statistics over the retained samples.
    pub fn stats(&self, window_end: DateTime<Utc>) -> WindowStats {
        let count = self.samples.len();
        if count == 0 {
            return WindowStats {
                window_secs: self.window_secs,
                window_end,
                count: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                stddev: 0.0,
            };
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for (_, v) in &self.samples {
            min = min.min(*v);
            max = max.max(*v);
            sum += v;
        }
        let mean = sum / count as f64;
        let stddev = if count > 1 {
            let var = self
                .samples
                .iter()
                .map(|(_, v)| (v - mean).powi(2))
                .sum::<f64>()
                / (count as f64 - 1.0);
            var.sqrt()
        } else {
            0.0
        };

        WindowStats {
            window_secs: self.window_secs,
            window_end,
            count,
            min,
            max,
            mean,
            stddev,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Anomaly score parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyScorer {
    /// Coefficient of variation that maps to a variability score of 1.
    pub cv_ceiling: f64,
    /// Readings scoring strictly above this are flagged.
    pub cutoff: f64,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self {
            cv_ceiling: 1.0,
            cutoff: 0.5,
        }
    }
}

impl AnomalyScorer {
    /// `max(threshold component, variability component)`, in `[0, 1]`.
    pub fn score(&self, thresholds: &Thresholds, value: f64, stats: &WindowStats) -> f64 {
        self.threshold_component(thresholds, value)
            .max(self.variability_component(thresholds, stats))
    }

    pub fn is_anomaly(&self, score: f64) -> bool {
        score > self.cutoff
    }

    /// 0 inside the warning limits, 0.5 at a critical limit, 1 at twice the
    /// warning→critical band.
    pub fn threshold_component(&self, thresholds: &Thresholds, value: f64) -> f64 {
        let (excess, band) = if value > thresholds.warning_high {
            (
                value - thresholds.warning_high,
                thresholds.critical_high - thresholds.warning_high,
            )
        } else if value < thresholds.warning_low {
            (
                thresholds.warning_low - value,
                thresholds.warning_low - thresholds.critical_low,
            )
        } else {
            return 0.0;
        };

        if band <= 0.0 {
            return 1.0;
        }
        (0.5 * excess / band).clamp(0.0, 1.0)
    }

    /// Coefficient of variation scaled by `cv_ceiling`.
    ///
    /// The denominator is never smaller than the normal span, so ranges
    /// centred on zero (position offsets) don't blow up.
    pub fn variability_component(&self, thresholds: &Thresholds, stats: &WindowStats) -> f64 {
        if stats.count < 2 || self.cv_ceiling <= 0.0 {
            return 0.0;
        }
        let scale = stats.mean.abs().max(thresholds.normal_span());
        let cv = stats.stddev / scale;
        (cv / self.cv_ceiling).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantwire_core::SensorKind;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600 + secs, 0).unwrap()
    }

    #[test]
    fn evicts_by_time_not_count() {
        let mut w = StatWindow::new(300);
        for i in 0..=30 {
            w.push(t(i * 10), i as f64);
        }
        // (300, 0] excluded at the lower edge: t(10)..=t(300).
        assert_eq!(w.len(), 30);
        let stats = w.stats(t(300));
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 30.0);
    }

    #[test]
    fn single_sample_has_zero_stddev() {
        let mut w = StatWindow::new(300);
        let stats = w.push(t(0), 12.0);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.stddev, 0.0);
    }

    #[test]
    fn threshold_component_is_half_at_the_critical_limit() {
        let scorer = AnomalyScorer::default();
        let th = SensorKind::Vibration.profile().thresholds;
        assert_eq!(scorer.threshold_component(&th, th.critical_high), 0.5);
        assert_eq!(scorer.threshold_component(&th, th.normal_mid()), 0.0);
        assert!(!scorer.is_anomaly(0.5));
        assert!(scorer.is_anomaly(0.51));
    }

    fn naive(samples: &[(i64, f64)], end: i64, window: i64) -> Option<(f64, f64, f64, f64, usize)> {
        let kept: Vec<f64> = samples
            .iter()
            .filter(|(ts, _)| *ts > end - window && *ts <= end)
            .map(|(_, v)| *v)
            .collect();
        if kept.is_empty() {
            return None;
        }
        let n = kept.len() as f64;
        let mean = kept.iter().sum::<f64>() / n;
        let sd = if kept.len() > 1 {
            (kept.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let min = kept.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = kept.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some((min, max, mean, sd, kept.len()))
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn matches_naive_recomputation(
            steps in prop::collection::vec((1i64..120, -1000.0f64..1000.0), 1..80),
            window in 30u64..900,
        ) {
            let mut w = StatWindow::new(window);
            let mut ts = 0i64;
            let mut seen = Vec::new();
            for (gap, v) in steps {
                ts += gap;
                seen.push((ts, v));
                let stats = w.push(t(ts), v);
                let (min, max, mean, sd, n) = naive(&seen, ts, window as i64).unwrap();
                prop_assert_eq!(stats.count, n);
                prop_assert_eq!(stats.min, min);
                prop_assert_eq!(stats.max, max);
                prop_assert!((stats.mean - mean).abs() < 1e-9);
                prop_assert!((stats.stddev - sd).abs() < 1e-6);
            }
        }

        #[test]
        fn score_non_decreasing_beyond_threshold(d1 in 0.0f64..50.0, d2 in 0.0f64..50.0, sd in 0.0f64..5.0) {
            let scorer = AnomalyScorer::default();
            let th = SensorKind::Temperature.profile().thresholds;
            let stats = WindowStats {
                window_secs: 300,
                window_end: t(0),
                count: 30,
                min: 40.0,
                max: 70.0,
                mean: 55.0,
                stddev: sd,
            };
            let (near, far) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
            prop_assert!(
                scorer.score(&th, th.warning_high + near, &stats) <= scorer.score(&th, th.warning_high + far, &stats)
            );
            prop_assert!(
                scorer.score(&th, th.warning_low - near, &stats) <= scorer.score(&th, th.warning_low - far, &stats)
            );
        }
    }
}
