//! Pattern detection
//!
//! Looks across all runs of one generation for recurring deviations from
//! the reference, recurring tool sequences and recurring parameter choices.
//! Patterns are recomputed from scratch for every generation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::statistics;
use crate::types::{DeviationPattern, Direction, Pattern, PatternKey, Run, Severity};

/// Thresholds for pattern detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Longest contiguous tool window considered a sequence
    #[serde(default = "default_max_sequence_len")]
    pub max_sequence_len: usize,
    /// Runs a sequence must appear in to be reported
    #[serde(default = "default_min_support")]
    pub min_sequence_support: usize,
    /// Runs a parameter choice must recur in to be reported
    #[serde(default = "default_min_support")]
    pub min_parameter_support: usize,
    /// Minimum consistency for a numeric parameter range to count as a choice
    #[serde(default = "default_numeric_consistency_floor")]
    pub numeric_consistency_floor: f64,
}

fn default_max_sequence_len() -> usize {
    3
}

fn default_min_support() -> usize {
    2
}

fn default_numeric_consistency_floor() -> f64 {
    0.8
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_sequence_len: default_max_sequence_len(),
            min_sequence_support: default_min_support(),
            min_parameter_support: default_min_support(),
            numeric_consistency_floor: default_numeric_consistency_floor(),
        }
    }
}

/// A pattern together with the indices of the runs that support it
struct Candidate {
    pattern: Pattern,
    support: BTreeSet<usize>,
}

pub struct PatternDetector {
    config: DetectorConfig,
}

impl PatternDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Detect patterns in the runs of a single generation.
    ///
    /// The returned collection carries no ordering guarantee.
    pub fn detect(&self, runs: &[Run]) -> Vec<Pattern> {
        if runs.is_empty() {
            return Vec::new();
        }

        let mut candidates = self.deviation_patterns(runs);
        candidates.extend(self.sequence_patterns(runs));
        candidates.extend(self.parameter_patterns(runs));

        let patterns = merge(candidates, runs.len());
        debug!(runs = runs.len(), patterns = patterns.len(), "Pattern detection complete");
        patterns
    }

    fn deviation_patterns(&self, runs: &[Run]) -> Vec<Candidate> {
        let mut buckets: BTreeMap<&str, Vec<(usize, f64)>> = BTreeMap::new();
        for (idx, run) in runs.iter().enumerate() {
            for deviation in &run.deviations {
                buckets
                    .entry(deviation.field.as_str())
                    .or_default()
                    .push((idx, deviation.deviation));
            }
        }

        buckets
            .into_iter()
            .map(|(attribute, observations)| {
                let positive = observations.iter().filter(|(_, d)| *d > 0.0).count();
                let negative = observations.iter().filter(|(_, d)| *d < 0.0).count();
                let direction = match positive.cmp(&negative) {
                    std::cmp::Ordering::Greater => Direction::Over,
                    std::cmp::Ordering::Less => Direction::Under,
                    std::cmp::Ordering::Equal => Direction::Wrong,
                };

                let magnitudes: Vec<f64> = observations.iter().map(|(_, d)| d.abs()).collect();
                let average_magnitude = statistics::mean(&magnitudes);
                let consistency = statistics::consistency(&magnitudes);
                let support: BTreeSet<usize> = observations.iter().map(|(idx, _)| *idx).collect();
                let share = support.len() as f64 / runs.len() as f64;

                let relation = match direction {
                    Direction::Over => "above",
                    Direction::Under => "below",
                    Direction::Wrong => "away from",
                };

                let pattern = Pattern {
                    key: PatternKey::VisualDeviation {
                        attribute: attribute.to_string(),
                    },
                    description: format!(
                        "'{}' lands {} the reference in {}/{} runs (avg magnitude {:.2})",
                        attribute,
                        relation,
                        support.len(),
                        runs.len(),
                        average_magnitude
                    ),
                    frequency: support.len(),
                    confidence: consistency,
                    severity: severity_from_share(share),
                    tools: Vec::new(),
                    deviation: Some(DeviationPattern {
                        attribute: attribute.to_string(),
                        direction,
                        average_magnitude,
                        consistency,
                        occurrences: observations.len(),
                    }),
                };

                Candidate { pattern, support }
            })
            .collect()
    }

    fn sequence_patterns(&self, runs: &[Run]) -> Vec<Candidate> {
        let mut sequences: BTreeMap<Vec<&str>, BTreeSet<usize>> = BTreeMap::new();

        for (idx, run) in runs.iter().enumerate() {
            let tools = run.tool_sequence();
            for len in 2..=self.config.max_sequence_len.max(2) {
                for window in tools.windows(len) {
                    sequences.entry(window.to_vec()).or_default().insert(idx);
                }
            }
        }

        sequences
            .into_iter()
            .filter(|(_, support)| support.len() >= self.config.min_sequence_support)
            .map(|(sequence, support)| {
                let frequency = support.len();
                let pattern = Pattern {
                    key: PatternKey::ToolSequence {
                        first: sequence[0].to_string(),
                        second: sequence[1].to_string(),
                    },
                    description: format!(
                        "sequence {} recurs in {}/{} runs",
                        sequence.join(" -> "),
                        frequency,
                        runs.len()
                    ),
                    frequency,
                    confidence: frequency as f64 / runs.len() as f64,
                    severity: severity_from_problem_share(runs, &support),
                    tools: unique_in_order(sequence.iter().copied()),
                    deviation: None,
                };
                Candidate { pattern, support }
            })
            .collect()
    }

    fn parameter_patterns(&self, runs: &[Run]) -> Vec<Candidate> {
        let mut observations: BTreeMap<(&str, &str), Vec<(usize, &serde_json::Value)>> = BTreeMap::new();
        for (idx, run) in runs.iter().enumerate() {
            for call in &run.tool_calls {
                for (name, value) in &call.args {
                    observations
                        .entry((call.tool.as_str(), name.as_str()))
                        .or_default()
                        .push((idx, value));
                }
            }
        }

        let mut candidates = Vec::new();
        for ((tool, parameter), values) in observations {
            let numeric: Option<Vec<f64>> = values.iter().map(|(_, v)| v.as_f64()).collect();

            let found = match numeric {
                Some(numbers) => self.numeric_choice(tool, parameter, &values, &numbers, runs.len()),
                None => self.categorical_choice(tool, parameter, &values, runs.len()),
            };

            if let Some((description, confidence, support)) = found {
                let pattern = Pattern {
                    key: PatternKey::ParameterChoice {
                        tool: tool.to_string(),
                    },
                    description,
                    frequency: support.len(),
                    confidence,
                    severity: severity_from_problem_share(runs, &support),
                    tools: vec![tool.to_string()],
                    deviation: None,
                };
                candidates.push(Candidate { pattern, support });
            }
        }
        candidates
    }

    fn numeric_choice(
        &self,
        tool: &str,
        parameter: &str,
        values: &[(usize, &serde_json::Value)],
        numbers: &[f64],
        total_runs: usize,
    ) -> Option<(String, f64, BTreeSet<usize>)> {
        let support: BTreeSet<usize> = values.iter().map(|(idx, _)| *idx).collect();
        if support.len() < self.config.min_parameter_support {
            return None;
        }

        let consistency = statistics::consistency(numbers);
        if consistency < self.config.numeric_consistency_floor {
            return None;
        }

        let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let description = format!(
            "{} sets '{}' within [{}, {}] in {}/{} runs",
            tool,
            parameter,
            min,
            max,
            support.len(),
            total_runs
        );
        Some((description, consistency, support))
    }

    fn categorical_choice(
        &self,
        tool: &str,
        parameter: &str,
        values: &[(usize, &serde_json::Value)],
        total_runs: usize,
    ) -> Option<(String, f64, BTreeSet<usize>)> {
        let mut by_value: BTreeMap<String, (usize, BTreeSet<usize>)> = BTreeMap::new();
        for (idx, value) in values {
            let entry = by_value.entry(value.to_string()).or_default();
            entry.0 += 1;
            entry.1.insert(*idx);
        }

        // Ties resolve to the lexicographically smallest value
        let (value, (count, support)) = by_value
            .into_iter()
            .fold(None::<(String, (usize, BTreeSet<usize>))>, |best, item| match best {
                Some(b) if b.1 .1.len() >= item.1 .1.len() => Some(b),
                _ => Some(item),
            })?;

        if support.len() < self.config.min_parameter_support {
            return None;
        }

        let confidence = count as f64 / values.len() as f64;
        let description = format!(
            "{} uses '{}' = {} in {}/{} runs",
            tool,
            parameter,
            value,
            support.len(),
            total_runs
        );
        Some((description, confidence, support))
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Merge candidates sharing a key into one aggregate per key
fn merge(candidates: Vec<Candidate>, total_runs: usize) -> Vec<Pattern> {
    let mut grouped: BTreeMap<PatternKey, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        grouped.entry(candidate.pattern.key.clone()).or_default().push(candidate);
    }

    grouped
        .into_values()
        .filter_map(|mut members| {
            if members.len() == 1 {
                return members.pop().map(|c| c.pattern);
            }

            let support: BTreeSet<usize> = members.iter().flat_map(|c| c.support.iter().copied()).collect();
            let severity = members.iter().map(|c| c.pattern.severity).max().unwrap_or(Severity::Low);
            let tools = unique_in_order(members.iter().flat_map(|c| c.pattern.tools.iter().map(String::as_str)));
            let description = members
                .iter()
                .map(|c| c.pattern.description.as_str())
                .collect::<Vec<_>>()
                .join("; ");

            let first = members.swap_remove(0).pattern;
            Some(Pattern {
                key: first.key,
                description,
                frequency: support.len(),
                confidence: (support.len() as f64 / total_runs as f64).clamp(0.0, 1.0),
                severity,
                tools,
                deviation: first.deviation,
            })
        })
        .collect()
}

fn severity_from_share(share: f64) -> Severity {
    if share >= 0.75 {
        Severity::High
    } else if share >= 0.4 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Severity from the share of supporting runs that failed or deviated
fn severity_from_problem_share(runs: &[Run], support: &BTreeSet<usize>) -> Severity {
    if support.is_empty() {
        return Severity::Low;
    }
    let problems = support
        .iter()
        .filter(|idx| {
            let run = &runs[**idx];
            !run.success || !run.deviations.is_empty()
        })
        .count();
    let share = problems as f64 / support.len() as f64;

    if share >= 0.5 {
        Severity::High
    } else if share > 0.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn unique_in_order<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(*item))
        .map(str::to_string)
        .collect()
}
