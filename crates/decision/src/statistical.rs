//! Statistical significance testing for A/B experiments
//!
//! Each challenger is compared against the control with a one-tailed
//! two-proportion z-test: only variations that convert *better* than control
//! can win. The standard normal tail is computed from the complementary error
//! function, which keeps precision for large z where `1 - cdf(z)` would
//! cancel to zero.
//!
//! Degenerate inputs (no control, empty control, arms below the minimum
//! sample size, zero standard error) are not errors: they simply mean no
//! winner yet, and [`SignificanceEngine::evaluate`] returns `None`.

use experiment_config::WinnerPolicy;
use experiment_types::{Experiment, ExperimentSettings, Variation, WinnerResult};
use serde::Serialize;
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;

/// Standard normal cumulative distribution function
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / SQRT_2)
}

/// Upper tail probability `P(Z > z)` of the standard normal
pub fn normal_sf(z: f64) -> f64 {
    0.5 * erfc(z / SQRT_2)
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Statistical test trait
pub trait StatisticalTest {
    /// One-tailed p-value, `None` when the test is undefined for the data
    fn p_value(&self) -> Option<f64>;

    /// Confidence in percent: `(1 - p) * 100`
    fn confidence(&self) -> Option<f64> {
        self.p_value().map(|p| (1.0 - p) * 100.0)
    }
}

/// Two-proportion z-test for comparing conversion rates
///
/// Group 1 is the challenger, group 2 the control. The alternative
/// hypothesis is `p1 > p2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTest {
    /// Successes in group 1
    pub successes_1: u64,
    /// Total trials in group 1
    pub trials_1: u64,
    /// Successes in group 2
    pub successes_2: u64,
    /// Total trials in group 2
    pub trials_2: u64,
}

impl ZTest {
    /// Create a new z-test
    pub fn new(successes_1: u64, trials_1: u64, successes_2: u64, trials_2: u64) -> Self {
        Self {
            successes_1,
            trials_1,
            successes_2,
            trials_2,
        }
    }

    /// Challenger versus control
    pub fn between(challenger: &Variation, control: &Variation) -> Self {
        Self::new(
            challenger.conversions,
            challenger.visitors,
            control.conversions,
            control.visitors,
        )
    }

    /// Calculate sample proportions
    pub fn proportions(&self) -> (f64, f64) {
        let p1 = if self.trials_1 > 0 {
            self.successes_1 as f64 / self.trials_1 as f64
        } else {
            0.0
        };

        let p2 = if self.trials_2 > 0 {
            self.successes_2 as f64 / self.trials_2 as f64
        } else {
            0.0
        };

        (p1, p2)
    }

    /// Calculate pooled proportion
    pub fn pooled_proportion(&self) -> f64 {
        let total_successes = self.successes_1 + self.successes_2;
        let total_trials = self.trials_1 + self.trials_2;

        if total_trials > 0 {
            total_successes as f64 / total_trials as f64
        } else {
            0.0
        }
    }

    /// Pooled standard error, `None` if either group is empty or the error is zero
    pub fn standard_error(&self) -> Option<f64> {
        if self.trials_1 == 0 || self.trials_2 == 0 {
            return None;
        }

        let p_pool = self.pooled_proportion();
        let n1 = self.trials_1 as f64;
        let n2 = self.trials_2 as f64;

        // sqrt(p_pool * (1 - p_pool) * (1/n1 + 1/n2))
        let se = (p_pool * (1.0 - p_pool) * (1.0 / n1 + 1.0 / n2)).sqrt();
        (se > 0.0).then_some(se)
    }

    /// Calculate z-statistic
    pub fn z_statistic(&self) -> Option<f64> {
        let se = self.standard_error()?;
        let (p1, p2) = self.proportions();
        Some((p1 - p2) / se)
    }
}

impl StatisticalTest for ZTest {
    fn p_value(&self) -> Option<f64> {
        self.z_statistic().map(normal_sf)
    }
}

/// Outcome of comparing one challenger with control
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub variation: String,
    pub z_score: f64,
    pub p_value: f64,
    /// Unrounded confidence in percent
    pub confidence: f64,
    /// Unrounded relative lift in percent
    pub improvement: f64,
    /// Whether `confidence` clears the experiment's bar
    pub significant: bool,
}

impl Comparison {
    fn into_result(self) -> WinnerResult {
        WinnerResult {
            winner: self.variation,
            confidence: round2(self.confidence),
            improvement: round2(self.improvement),
            declared_at: None,
        }
    }
}

/// Compare a challenger with control under the experiment settings
///
/// Returns `None` when the comparison is skipped: either arm is below the
/// minimum sample size, the challenger does not beat control, or the
/// standard error is zero.
pub fn compare(
    control: &Variation,
    challenger: &Variation,
    settings: &ExperimentSettings,
) -> Option<Comparison> {
    if challenger.visitors < settings.min_sample_size || control.visitors < settings.min_sample_size
    {
        return None;
    }

    let test = ZTest::between(challenger, control);
    let (p1, p2) = test.proportions();
    if p1 <= p2 {
        return None;
    }

    let z_score = test.z_statistic()?;
    let p_value = normal_sf(z_score);
    let confidence = (1.0 - p_value) * 100.0;
    let improvement = if p2 > 0.0 {
        (p1 - p2) / p2 * 100.0
    } else {
        100.0
    };

    Some(Comparison {
        variation: challenger.name.clone(),
        z_score,
        p_value,
        confidence,
        improvement,
        significant: confidence >= settings.min_confidence,
    })
}

/// Decides whether an experiment has a statistically significant winner
#[derive(Debug, Clone, Copy, Default)]
pub struct SignificanceEngine {
    policy: WinnerPolicy,
}

impl SignificanceEngine {
    pub fn new(policy: WinnerPolicy) -> Self {
        Self { policy }
    }

    /// All challenger comparisons that were not skipped, in declared order
    pub fn comparisons(&self, experiment: &Experiment) -> Vec<Comparison> {
        let Some(control) = experiment.control() else {
            return Vec::new();
        };
        if control.visitors == 0 {
            return Vec::new();
        }

        experiment
            .challengers()
            .filter_map(|v| compare(control, v, &experiment.settings))
            .collect()
    }

    /// Evaluate the experiment; the result is provisional (`declared_at` unset)
    pub fn evaluate(&self, experiment: &Experiment) -> Option<WinnerResult> {
        let control = experiment.control()?;
        if control.visitors == 0 {
            return None;
        }

        let mut significant = experiment
            .challengers()
            .filter_map(|v| compare(control, v, &experiment.settings))
            .filter(|c| c.significant);

        let winner = match self.policy {
            WinnerPolicy::FirstSignificant => significant.next(),
            WinnerPolicy::HighestConfidence => significant.fold(None, |best: Option<Comparison>, c| {
                match best {
                    Some(b) if b.confidence >= c.confidence => Some(b),
                    _ => Some(c),
                }
            }),
        };

        winner.map(Comparison::into_result)
    }
}
