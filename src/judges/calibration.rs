//! Judge calibration against a reference set with known scores. Reports
//! bias and spread per judge; never feeds back into stored scorecards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{JudgeEnsemble, Rubric};
use crate::config::ConfigError;

/// A reference output with the score a careful human gave it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCase {
    pub id: String,
    pub output: String,
    pub rubric: Rubric,
    pub expected: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeCalibration {
    /// Judge name, or `ensemble` for the combined score.
    pub judge: String,
    /// Cases the judge scored; abstentions are not counted.
    pub count: usize,
    /// Mean signed error, `score - expected`.
    pub bias: f64,
    /// Population variance of the signed error.
    pub variance: f64,
    pub mean_absolute_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub cases: usize,
    pub judges: Vec<JudgeCalibration>,
}

fn summarize(judge: &str, errors: &[f64]) -> JudgeCalibration {
    let count = errors.len();
    if count == 0 {
        return JudgeCalibration {
            judge: judge.to_string(),
            count,
            bias: 0.0,
            variance: 0.0,
            mean_absolute_error: 0.0,
        };
    }
    let n = count as f64;
    let bias = errors.iter().sum::<f64>() / n;
    JudgeCalibration {
        judge: judge.to_string(),
        count,
        bias,
        variance: errors.iter().map(|e| (e - bias).powi(2)).sum::<f64>() / n,
        mean_absolute_error: errors.iter().map(|e| e.abs()).sum::<f64>() / n,
    }
}

pub async fn calibrate(ensemble: &JudgeEnsemble, cases: &[CalibrationCase]) -> CalibrationReport {
    let judges = ensemble.judges();
    let mut per_judge: Vec<Vec<f64>> = vec![Vec::new(); judges.len()];
    let mut combined = Vec::with_capacity(cases.len());

    for case in cases {
        let verdicts = ensemble.verdicts(&case.output, &case.rubric).await;
        for (errors, verdict) in per_judge.iter_mut().zip(&verdicts) {
            if let Some(score) = verdict.score(&case.rubric.metric) {
                errors.push(score - case.expected);
            }
        }
        if let Some(score) = ensemble.combine(&verdicts).get(&case.rubric.metric) {
            combined.push(score - case.expected);
        }
    }

    let mut report: Vec<JudgeCalibration> = judges
        .iter()
        .zip(&per_judge)
        .map(|(judge, errors)| summarize(judge.kind().as_str(), errors))
        .collect();
    report.push(summarize("ensemble", &combined));
    CalibrationReport {
        cases: cases.len(),
        judges: report,
    }
}

/// Reads a reference set from YAML or JSON.
pub fn load_reference_set(path: &Path) -> Result<Vec<CalibrationCase>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cases: Vec<CalibrationCase> = serde_yaml::from_str(&raw)?;
    if let Some(case) = cases.iter().find(|c| !(0.0..=1.0).contains(&c.expected)) {
        return Err(ConfigError::Invalid(format!(
            "calibration case {} expects {}, outside [0, 1]",
            case.id, case.expected
        )));
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::judges::EnsembleConfig;

    fn case(id: &str, output: &str, expected: f64) -> CalibrationCase {
        CalibrationCase {
            id: id.to_string(),
            output: output.to_string(),
            rubric: Rubric::default().with_invariants(["retry", "timeout"]),
            expected,
        }
    }

    #[tokio::test]
    async fn reports_bias_per_judge() {
        let ensemble = JudgeEnsemble::deterministic(EnsembleConfig::default());
        let cases = vec![
            case("full", "retry on timeout", 1.0),
            case("half", "retry forever", 1.0),
        ];
        let report = calibrate(&ensemble, &cases).await;

        assert_eq!(report.cases, 2);
        let constraint = &report.judges[0];
        assert_eq!(constraint.judge, "constraint");
        assert_eq!(constraint.count, 2);
        assert!((constraint.bias + 0.25).abs() < 1e-12);
        assert!((constraint.variance - 0.0625).abs() < 1e-12);
        // the rubric has no keywords, criteria or reference: the other judges abstain
        assert_eq!(report.judges[1].count, 0);
        assert_eq!(report.judges[2].count, 0);
        assert_eq!(report.judges.last().map(|j| j.judge.as_str()), Some("ensemble"));
    }

    #[test]
    fn loads_yaml_reference_set() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "- id: a\n  output: retry with backoff\n  expected: 0.9\n  rubric:\n    required_invariants: [retry]\n"
        )
        .expect("write");
        let cases = load_reference_set(file.path()).expect("load");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].rubric.metric, "quality");
    }

    #[test]
    fn rejects_out_of_range_expectations() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, r#"[{{"id": "a", "output": "x", "expected": 3.0, "rubric": {{}}}}]"#).expect("write");
        assert!(matches!(load_reference_set(file.path()), Err(ConfigError::Invalid(_))));
    }
}
