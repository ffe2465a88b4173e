use regex::RegexBuilder;
use tracing::warn;

use super::{JudgeKind, JudgeVerdict, Rubric};

/// Deterministic rule checks: required invariants, keywords, regex
/// patterns and a minimum length. Scores the fraction of checks passed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintJudge;

impl ConstraintJudge {
    pub fn evaluate(&self, output: &str, rubric: &Rubric) -> JudgeVerdict {
        let lowered = output.to_lowercase();
        let mut passed = 0usize;
        let mut total = 0usize;

        for needle in rubric.required_invariants.iter().chain(&rubric.keywords) {
            total += 1;
            if lowered.contains(&needle.to_lowercase()) {
                passed += 1;
            }
        }

        for pattern in &rubric.patterns {
            total += 1;
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) if re.is_match(output) => passed += 1,
                Ok(_) => {}
                Err(err) => warn!(pattern = %pattern, error = %err, "skipping invalid rubric pattern"),
            }
        }

        if rubric.min_length > 0 {
            total += 1;
            if output.chars().count() >= rubric.min_length {
                passed += 1;
            }
        }

        if total == 0 {
            return JudgeVerdict::abstain(JudgeKind::Constraint);
        }
        JudgeVerdict::scored(
            JudgeKind::Constraint,
            &rubric.metric,
            passed as f64 / total as f64,
            1.0,
        )
    }
}
