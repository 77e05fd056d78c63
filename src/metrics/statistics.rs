//! Statistical primitives
//!
//! Pure numeric helpers used by the pattern detector and the reports.
//! Undersized or empty samples never raise; every function returns a
//! defined sentinel instead.

use serde::{Deserialize, Serialize};

use crate::types::Pattern;

/// Normal-approximation interval around a sample mean
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub margin: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
}

/// Tukey fences and the values outside them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlierReport {
    pub outliers: Vec<f64>,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Population standard deviation (divides by n).
///
/// Pass `precomputed_mean` when the caller already has it to skip a pass.
pub fn standard_deviation(values: &[f64], precomputed_mean: Option<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = precomputed_mean.unwrap_or_else(|| mean(values));
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// z value for the supported confidence levels; anything else maps to 95%
fn z_score(confidence: f64) -> f64 {
    const LEVELS: &[(f64, f64)] = &[(0.90, 1.645), (0.95, 1.96), (0.99, 2.576)];
    LEVELS
        .iter()
        .find(|(level, _)| (level - confidence).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or(1.96)
}

pub fn confidence_interval(values: &[f64], confidence: f64) -> ConfidenceInterval {
    let m = mean(values);
    let margin = if values.is_empty() {
        0.0
    } else {
        let sd = standard_deviation(values, Some(m));
        z_score(confidence) * sd / (values.len() as f64).sqrt()
    };

    ConfidenceInterval {
        mean: m,
        margin,
        lower: m - margin,
        upper: m + margin,
        confidence,
    }
}

/// 1 - coefficient of variation, clamped to [0, 1].
///
/// One sample is perfectly consistent; an empty sample carries no evidence
/// and scores 0.
pub fn consistency(values: &[f64]) -> f64 {
    match values.len() {
        0 => return 0.0,
        1 => return 1.0,
        _ => {}
    }

    let m = mean(values);
    let sd = standard_deviation(values, Some(m));
    if m == 0.0 {
        return if sd == 0.0 { 1.0 } else { 0.0 };
    }

    (1.0 - sd / m.abs()).clamp(0.0, 1.0)
}

/// Severity-weighted blend of a pattern's run share and confidence
pub fn significance(pattern: &Pattern, total_runs: usize) -> f64 {
    let frequency_ratio = if total_runs == 0 {
        0.0
    } else {
        pattern.frequency as f64 / total_runs as f64
    };
    ((frequency_ratio + pattern.confidence) / 2.0) * pattern.severity.weight()
}

/// Pearson correlation coefficient; 0 whenever it is undefined
pub fn correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.is_empty() {
        return 0.0;
    }

    let mx = mean(x);
    let my = mean(y);
    let mut numerator = 0.0;
    let mut sum_dx2 = 0.0;
    let mut sum_dy2 = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        numerator += dx * dy;
        sum_dx2 += dx * dx;
        sum_dy2 += dy * dy;
    }

    let denominator = (sum_dx2 * sum_dy2).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

/// Tukey IQR outliers with 1.5x fences. Needs at least four samples.
pub fn find_outliers(values: &[f64]) -> OutlierReport {
    if values.len() < 4 {
        return OutlierReport::default();
    }

    let sorted = sorted(values);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lower_bound = q1 - 1.5 * iqr;
    let upper_bound = q3 + 1.5 * iqr;

    let outliers = values
        .iter()
        .copied()
        .filter(|v| *v < lower_bound || *v > upper_bound)
        .collect();

    OutlierReport {
        outliers,
        lower_bound,
        upper_bound,
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Linearly interpolated quantile of an already sorted, non-empty slice
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}
