// ========================================================================================
//
//                          Goodness-of-fit evaluation
//
// ========================================================================================
//
// Relates a score vector to an outcome vector: point R² of the implied simple linear
// fit, a paired bootstrap of that R², and a Pearson correlation t-test.
//
// R² is clamped at zero: a fit worse than the outcome mean (possible on bootstrap
// resamples) is reported as explaining no variance. The direction of association
// survives only in `correlation`.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Smallest sample count for which the t-test has positive degrees of freedom.
pub const MIN_SAMPLES: usize = 3;

/// Outcome tokens that mean "no measurement" regardless of the configured missing code.
const MISSING_OUTCOME_TOKENS: [&str; 3] = ["NA", "NAN", "."];

#[derive(Debug, Error, PartialEq)]
pub enum EvaluationError {
    #[error("at least {MIN_SAMPLES} samples are required for evaluation, found {found}")]
    InsufficientData { found: usize },
    #[error("{scores} scores but {outcomes} outcomes")]
    LengthMismatch { scores: usize, outcomes: usize },
    #[error("invalid evaluation configuration: {0}")]
    InvalidConfig(String),
    #[error("non-finite {what} at sample {index}")]
    NonFinite { what: &'static str, index: usize },
}

/// Bootstrap settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub resamples: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            resamples: 1000,
            confidence: 0.95,
            seed: 42,
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        if self.resamples == 0 {
            return Err(EvaluationError::InvalidConfig(
                "resample count must be at least 1".to_string(),
            ));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(EvaluationError::InvalidConfig(format!(
                "confidence level {} is not inside (0, 1)",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub n_samples: usize,
    pub r2: f64,
    pub r2_bootstrap: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub correlation: f64,
    /// Infinite when |correlation| is exactly 1; serialised as `null` in JSON.
    pub t_stat: f64,
    pub p_value: f64,
}

impl Display for EvaluationResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "n_samples\t{}", self.n_samples)?;
        writeln!(f, "r2\t{:.6}", self.r2)?;
        writeln!(f, "r2_bootstrap\t{:.6}", self.r2_bootstrap)?;
        writeln!(f, "r2_ci_lower\t{:.6}", self.ci_lower)?;
        writeln!(f, "r2_ci_upper\t{:.6}", self.ci_upper)?;
        writeln!(f, "correlation\t{:.6}", self.correlation)?;
        writeln!(f, "t_stat\t{:.6}", self.t_stat)?;
        writeln!(f, "p_value\t{:.6e}", self.p_value)
    }
}

/// Evaluates `scores` against `outcomes` (same length, same sample order).
pub fn evaluate(
    scores: &[f64],
    outcomes: &[f64],
    config: &EvaluationConfig,
) -> Result<EvaluationResult, EvaluationError> {
    config.validate()?;
    if scores.len() != outcomes.len() {
        return Err(EvaluationError::LengthMismatch {
            scores: scores.len(),
            outcomes: outcomes.len(),
        });
    }
    let n = scores.len();
    if n < MIN_SAMPLES {
        return Err(EvaluationError::InsufficientData { found: n });
    }
    check_finite(scores, "score")?;
    check_finite(outcomes, "outcome")?;

    let r = pearson_correlation(scores, outcomes);
    let fitted = fitted_values(scores, outcomes, r);
    let r2 = r_squared(outcomes, &fitted);

    let draws = bootstrap_r_squared(outcomes, &fitted, config.resamples, config.seed);
    let r2_bootstrap = draws.iter().sum::<f64>() / draws.len() as f64;
    let alpha = 1.0 - config.confidence;
    let ci_lower = percentile(&draws, alpha / 2.0 * 100.0);
    let ci_upper = percentile(&draws, (1.0 - alpha / 2.0) * 100.0);

    let (t_stat, p_value) = correlation_t_test(r, n);

    debug!(
        "Evaluated {n} samples: r={r:.4}, R2={r2:.4}, {} bootstrap draws",
        draws.len()
    );

    Ok(EvaluationResult {
        n_samples: n,
        r2,
        r2_bootstrap,
        ci_lower,
        ci_upper,
        correlation: r,
        t_stat,
        p_value,
    })
}

fn check_finite(values: &[f64], what: &'static str) -> Result<(), EvaluationError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(EvaluationError::NonFinite { what, index }),
        None => Ok(()),
    }
}

#[inline]
fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population (ddof = 0) standard deviation.
fn population_std(values: &[f64], mean: f64) -> f64 {
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Pearson correlation, defined as 0 when either input has zero variance.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    let (mx, my) = (mean(x), mean(y));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return 0.0;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

/// `ŷ_i = ȳ + r · (x_i − x̄) / sd_x · sd_y`, the simple linear fit of `y` on `x`.
pub fn fitted_values(x: &[f64], y: &[f64], r: f64) -> Vec<f64> {
    let (mx, my) = (mean(x), mean(y));
    let (sx, sy) = (population_std(x, mx), population_std(y, my));
    if sx == 0.0 {
        return vec![my; x.len()];
    }
    x.iter().map(|&v| my + r * (v - mx) / sx * sy).collect()
}

/// Coefficient of determination `1 − SS_res / SS_tot`, clamped at 0.
/// An outcome with zero variance scores 0.
pub fn r_squared(outcomes: &[f64], fitted: &[f64]) -> f64 {
    let m = mean(outcomes);
    let ss_tot: f64 = outcomes.iter().map(|y| (y - m).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = outcomes
        .iter()
        .zip(fitted)
        .map(|(y, f)| (y - f).powi(2))
        .sum();
    (1.0 - ss_res / ss_tot).max(0.0)
}

/// Paired bootstrap of R². One sub-seed per draw is taken from a master generator, so
/// the result depends only on `seed`, not on how rayon schedules the draws.
fn bootstrap_r_squared(outcomes: &[f64], fitted: &[f64], resamples: usize, seed: u64) -> Vec<f64> {
    let n = outcomes.len();
    let mut master = StdRng::seed_from_u64(seed);
    let seeds: Vec<u64> = (0..resamples).map(|_| master.r#gen::<u64>()).collect();

    seeds
        .par_iter()
        .map_init(
            || (Vec::<f64>::with_capacity(n), Vec::<f64>::with_capacity(n)),
            |(y_boot, f_boot), &draw_seed| {
                let mut rng = StdRng::seed_from_u64(draw_seed);
                y_boot.clear();
                f_boot.clear();
                for _ in 0..n {
                    let i = rng.gen_range(0..n);
                    y_boot.push(outcomes[i]);
                    f_boot.push(fitted[i]);
                }
                r_squared(y_boot, f_boot)
            },
        )
        .collect()
}

/// Percentile with linear interpolation between order statistics, `q` in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Two-sided t-test of a Pearson correlation with `n − 2` degrees of freedom.
/// `t` carries the sign of `r`; `|r| = 1` yields `(∞, 0)`.
fn correlation_t_test(r: f64, n: usize) -> (f64, f64) {
    if r.abs() >= 1.0 {
        return (f64::INFINITY, 0.0);
    }
    let df = (n - 2) as f64;
    let t = r * df.sqrt() / (1.0 - r * r).sqrt();
    let p = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).min(1.0),
        Err(e) => {
            warn!("Student's t reference distribution unavailable for df={df}: {e}");
            f64::NAN
        }
    };
    (t, p)
}

/// Interprets one outcome token. Placeholders (`NA`, `nan`, `.`) and the configured
/// missing code yield `Ok(None)`; any other non-numeric token is an error.
pub fn parse_outcome(token: &str, missing_code: &str) -> Result<Option<f64>, String> {
    let token = token.trim();
    if token == missing_code
        || MISSING_OUTCOME_TOKENS
            .iter()
            .any(|m| token.eq_ignore_ascii_case(m))
    {
        return Ok(None);
    }
    match token.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        Ok(_) => Err(format!("outcome '{token}' is not finite")),
        Err(_) => Err(format!("outcome '{token}' is not numeric")),
    }
}

/// Difference between two evaluated scores against the same outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct R2Comparison {
    pub candidate_r2: f64,
    pub baseline_r2: f64,
    pub delta_r2: f64,
    /// True when the candidate explains strictly more variance.
    pub candidate_better: bool,
    /// True when the two bootstrap intervals do not overlap.
    pub intervals_disjoint: bool,
}

pub fn compare_r2(candidate: &EvaluationResult, baseline: &EvaluationResult) -> R2Comparison {
    let delta_r2 = candidate.r2 - baseline.r2;
    R2Comparison {
        candidate_r2: candidate.r2,
        baseline_r2: baseline.r2,
        delta_r2,
        candidate_better: delta_r2 > 0.0,
        intervals_disjoint: candidate.ci_lower > baseline.ci_upper
            || baseline.ci_lower > candidate.ci_upper,
    }
}
