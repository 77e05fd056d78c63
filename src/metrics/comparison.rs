//! Reference comparison
//!
//! Compares metrics extracted from the external application against a
//! workflow's reference metrics, field by field.

use crate::types::{Comparison, Deviation, Metrics};

/// Default absolute tolerance for numeric fields
pub const DEFAULT_TOLERANCE: f64 = 1.0;

/// Compare `actual` against `reference`.
///
/// Every reference field counts toward the score. Numeric fields match
/// within `tolerance` and carry a signed deviation; any other mismatch
/// (including a missing field) carries a zero deviation.
pub fn compare(reference: &Metrics, actual: &Metrics, tolerance: f64) -> Comparison {
    if reference.is_empty() {
        return Comparison {
            score: 100.0,
            matched: true,
            deviations: Vec::new(),
        };
    }

    let mut deviations = Vec::new();
    for (field, expected) in reference {
        let found = actual.get(field).cloned().unwrap_or(serde_json::Value::Null);

        match (expected.as_f64(), found.as_f64()) {
            (Some(e), Some(a)) => {
                let delta = a - e;
                if delta.abs() > tolerance {
                    deviations.push(Deviation {
                        field: field.clone(),
                        expected: expected.clone(),
                        actual: found,
                        deviation: delta,
                    });
                }
            }
            _ => {
                if *expected != found {
                    deviations.push(Deviation {
                        field: field.clone(),
                        expected: expected.clone(),
                        actual: found,
                        deviation: 0.0,
                    });
                }
            }
        }
    }

    let total = reference.len() as f64;
    let matched_fields = total - deviations.len() as f64;
    Comparison {
        score: 100.0 * matched_fields / total,
        matched: deviations.is_empty(),
        deviations,
    }
}
