//! Confidence calibration against historical success rates.
//!
//! `w = max_weight * n / (n + k)` where `n` is the number of decisions with a
//! known outcome for the pattern key and `k` is `half_weight_samples`; the
//! result is `(1 - w) * raw + w * success_rate`, clamped to
//! `[0, max_confidence]`. `w` never reaches `max_weight`, so history never
//! fully overrides fresh reasoning.

use arbiter_core::config::CalibrationConfig;
use arbiter_core::PatternStats;

#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Weight given to history after `samples` known outcomes.
    pub fn history_weight(&self, samples: u64) -> f64 {
        if samples == 0 {
            return 0.0;
        }
        let n = samples as f64;
        let k = self.config.half_weight_samples.max(0.0);
        self.config.max_history_weight.clamp(0.0, 1.0) * n / (n + k)
    }

    pub fn calibrate(&self, raw: f64, stats: Option<&PatternStats>) -> f64 {
        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        let blended = match stats.and_then(|s| s.success_rate().map(|r| (s.outcome_count, r))) {
            Some((samples, rate)) => {
                let w = self.history_weight(samples);
                (1.0 - w) * raw + w * rate
            }
            None => raw,
        };
        blended.clamp(0.0, self.max_confidence())
    }

    pub fn max_confidence(&self) -> f64 {
        self.config.max_confidence.clamp(0.0, 1.0)
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::PatternKey;

    fn stats(outcomes: u64, successes: u64) -> PatternStats {
        let mut s = PatternStats::new(PatternKey("k".to_string()));
        for i in 0..outcomes {
            s.record_decision(0.7);
            s.record_outcome(i < successes);
        }
        s
    }

    #[test]
    fn no_history_only_caps() {
        let c = Calibrator::new(&CalibrationConfig::default());
        assert!((c.calibrate(0.6, None) - 0.6).abs() < 1e-9);
        assert!((c.calibrate(1.0, None) - 0.95).abs() < 1e-9);
        assert_eq!(c.calibrate(-0.2, None), 0.0);
        assert_eq!(c.calibrate(f64::NAN, None), 0.0);
    }

    #[test]
    fn weight_grows_toward_but_below_max() {
        let c = Calibrator::new(&CalibrationConfig::default());
        assert_eq!(c.history_weight(0), 0.0);
        assert!((c.history_weight(10) - 0.25).abs() < 1e-9);
        let w1 = c.history_weight(100);
        let w2 = c.history_weight(10_000);
        assert!(w1 < w2 && w2 < 0.5);
    }

    #[test]
    fn twenty_samples_eighteen_successes_moves_toward_point_nine() {
        let c = Calibrator::new(&CalibrationConfig::default());
        let history = stats(20, 18);
        let raw = 0.6;
        let calibrated = c.calibrate(raw, Some(&history));
        // w = 0.5 * 20/30 = 1/3; 2/3 * 0.6 + 1/3 * 0.9 = 0.7
        assert!((calibrated - 0.7).abs() < 1e-9);
        assert!((0.9 - calibrated).abs() < (0.9 - raw).abs());
        assert!(calibrated <= 0.95);
    }

    #[test]
    fn high_raw_with_good_history_still_capped() {
        let c = Calibrator::new(&CalibrationConfig::default());
        let history = stats(1000, 1000);
        assert!((c.calibrate(1.0, Some(&history)) - 0.95).abs() < 1e-9);
    }

    #[test]
    fn decisions_without_outcomes_do_not_count() {
        let c = Calibrator::new(&CalibrationConfig::default());
        let mut pending = PatternStats::new(PatternKey("k".to_string()));
        pending.record_decision(0.9);
        assert!((c.calibrate(0.6, Some(&pending)) - 0.6).abs() < 1e-9);
    }
}
