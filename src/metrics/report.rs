//! Textual reports
//!
//! The pattern report is what the improvement proposer reads; the stats
//! report is what `run --stats` prints for the generation log.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use super::execution::{summarize_calls, SessionSummary};
use super::statistics::{self, ConfidenceInterval};
use crate::types::{GenerationResult, Pattern};

/// Patterns ranked by significance, most significant first
pub fn rank_patterns(patterns: &[Pattern], total_runs: usize) -> Vec<(f64, &Pattern)> {
    let mut ranked: Vec<_> = patterns
        .iter()
        .map(|p| (statistics::significance(p, total_runs), p))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.key.cmp(&b.1.key)));
    ranked
}

/// Report for one generation, fed to the improvement proposer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternReport {
    pub workflow: String,
    pub generation: u32,
    pub score: f64,
    pub score_interval: ConfidenceInterval,
    pub outlier_scores: Vec<f64>,
    pub failed_runs: usize,
    pub total_runs: usize,
    pub telemetry: SessionSummary,
    pub text: String,
}

impl PatternReport {
    pub fn build(result: &GenerationResult, max_patterns: usize) -> Self {
        let scores: Vec<f64> = result.runs.iter().map(|r| r.score).collect();
        let score_interval = statistics::confidence_interval(&scores, 0.95);
        let outliers = statistics::find_outliers(&scores);
        let telemetry = summarize_calls(result.runs.iter().flat_map(|r| r.tool_calls.iter()));
        let total_runs = result.runs.len();
        let failed_runs = result.failed_runs();

        let mut text = String::with_capacity(2048);
        let _ = writeln!(text, "# Generation {} report: {}", result.generation, result.workflow);
        let _ = writeln!(text);
        let _ = writeln!(
            text,
            "Score: {:.1} (95% CI {:.1}..{:.1}) over {} runs, {} failed",
            result.score, score_interval.lower, score_interval.upper, total_runs, failed_runs
        );
        if !outliers.outliers.is_empty() {
            let _ = writeln!(text, "Outlier run scores: {:?}", outliers.outliers);
        }

        let _ = writeln!(text, "\n## Patterns (most significant first)\n");
        let ranked = rank_patterns(&result.patterns, total_runs);
        if ranked.is_empty() {
            let _ = writeln!(text, "_No recurring patterns detected._");
        }
        for (significance, pattern) in ranked.into_iter().take(max_patterns) {
            let _ = writeln!(
                text,
                "- [{}] {} (severity {}, frequency {}/{}, confidence {:.2}, significance {:.3})",
                pattern.kind(),
                pattern.description,
                pattern.severity,
                pattern.frequency,
                total_runs,
                pattern.confidence,
                significance
            );
            if !pattern.tools.is_empty() {
                let _ = writeln!(text, "  tools: {}", pattern.tools.join(", "));
            }
        }

        let errors: Vec<&str> = result.runs.iter().filter_map(|r| r.error.as_deref()).collect();
        if !errors.is_empty() {
            let _ = writeln!(text, "\n## Trial errors\n");
            for error in errors {
                let _ = writeln!(text, "- {}", crate::truncate_safe(error, 200));
            }
        }

        if telemetry.total_calls > 0 {
            let _ = writeln!(
                text,
                "\n## Telemetry\n\n{} tool calls, avg {:.0}ms",
                telemetry.total_calls, telemetry.average_execution_time_ms
            );
            for (tool, metrics) in telemetry.most_used(10) {
                let _ = writeln!(
                    text,
                    "- {}: {} calls, {:.0}% ok, avg {:.0}ms",
                    tool,
                    metrics.calls,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration_ms
                );
            }
        }

        Self {
            workflow: result.workflow.clone(),
            generation: result.generation,
            score: result.score,
            score_interval,
            outlier_scores: outliers.outliers,
            failed_runs,
            total_runs,
            telemetry,
            text,
        }
    }
}

/// Summary over a whole generation log
pub fn stats_report(results: &[GenerationResult]) -> String {
    let mut text = String::new();
    if results.is_empty() {
        let _ = writeln!(text, "No generations recorded yet.");
        return text;
    }

    let _ = writeln!(text, "{:<24} {:>4} {:>8} {:>6} {:>9}", "workflow", "gen", "score", "runs", "patterns");
    for result in results {
        let _ = writeln!(
            text,
            "{:<24} {:>4} {:>8.1} {:>6} {:>9}",
            crate::truncate_safe(&result.workflow, 24),
            result.generation,
            result.score,
            result.runs.len(),
            result.patterns.len()
        );
    }

    let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
    let generations: Vec<f64> = results.iter().map(|r| r.generation as f64).collect();
    let durations: Vec<f64> = results
        .iter()
        .map(|r| summarize_calls(r.runs.iter().flat_map(|run| run.tool_calls.iter())).average_execution_time_ms)
        .collect();
    let interval = statistics::confidence_interval(&scores, 0.95);
    let outliers = statistics::find_outliers(&scores);

    let _ = writeln!(text);
    let _ = writeln!(
        text,
        "Mean score {:.1} (median {:.1}, sd {:.1}, 95% CI {:.1}..{:.1})",
        interval.mean,
        statistics::median(&scores),
        statistics::standard_deviation(&scores, Some(interval.mean)),
        interval.lower,
        interval.upper
    );
    let _ = writeln!(text, "Score consistency {:.2}", statistics::consistency(&scores));
    let _ = writeln!(text, "Score/generation correlation {:.2}", statistics::correlation(&generations, &scores));
    let _ = writeln!(text, "Score/avg call duration correlation {:.2}", statistics::correlation(&durations, &scores));
    if !outliers.outliers.is_empty() {
        let _ = writeln!(
            text,
            "Outlier scores {:?} (fences {:.1}..{:.1})",
            outliers.outliers, outliers.lower_bound, outliers.upper_bound
        );
    }
    text
}
