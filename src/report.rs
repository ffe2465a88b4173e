//! Scorecard export: pretty JSON for machines, a flat CSV table for
//! spreadsheets, Markdown for people.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::scorecard::{ScenarioEntry, Scorecard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Json,
    Csv,
    Markdown,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
            ReportFormat::Markdown => "md",
        }
    }
}

pub fn render(scorecard: &Scorecard, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Json => to_json(scorecard),
        ReportFormat::Csv => Ok(to_csv(scorecard)),
        ReportFormat::Markdown => Ok(to_markdown(scorecard)),
    }
}

pub fn to_json(scorecard: &Scorecard) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(scorecard)
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// One row per scenario: `scenario_id,family,seeds`, then
/// `<metric>_median,_mean,_std,_p10` for every metric any scenario
/// reports, in name order. A metric a scenario lacks leaves its cells empty.
pub fn to_csv(scorecard: &Scorecard) -> String {
    let metrics: BTreeSet<&str> = scorecard
        .entries
        .iter()
        .flat_map(|entry| entry.metrics.keys().map(String::as_str))
        .collect();

    let mut header = vec!["scenario_id".to_string(), "family".to_string(), "seeds".to_string()];
    for metric in &metrics {
        for stat in ["median", "mean", "std", "p10"] {
            header.push(csv_field(&format!("{metric}_{stat}")));
        }
    }
    let mut out = header.join(",");
    out.push('\n');

    for entry in &scorecard.entries {
        let mut row = vec![
            csv_field(&entry.scenario_id),
            entry.family.to_string(),
            entry.seeds_run.to_string(),
        ];
        for metric in &metrics {
            match entry.metrics.get(*metric) {
                Some(stats) => row.extend(
                    [stats.median, stats.mean, stats.std, stats.p10].map(|v| format!("{v:.4}")),
                ),
                None => row.extend(std::iter::repeat(String::new()).take(4)),
            }
        }
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn cell(entry: &ScenarioEntry, metric: &str) -> String {
    entry
        .median(metric)
        .map(|v| format!("{v:.3}"))
        .unwrap_or_else(|| "n/a".to_string())
}

// writing into a String cannot fail, so `writeln!` results are ignored
pub fn to_markdown(scorecard: &Scorecard) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Gauntlet Report\n");
    let _ = writeln!(out, "**Run:** {}  ", scorecard.run_id);
    let _ = writeln!(out, "**Model:** {}  ", scorecard.model);
    let _ = writeln!(out, "**Schema version:** {}  ", scorecard.schema_version);
    let _ = writeln!(out, "**Composite score:** {:.3}\n", scorecard.composite_score);

    let _ = writeln!(out, "## Summary\n");
    let _ = writeln!(out, "| Scenario | Family | Seeds | Task success (median) | Efficiency (median) | Weighted |");
    let _ = writeln!(out, "|---|---|---|---|---|---|");
    for entry in &scorecard.entries {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {:.3} |",
            entry.scenario_id,
            entry.family,
            entry.seeds_run,
            cell(entry, "task_success"),
            cell(entry, "efficiency"),
            entry.weighted_score
        );
    }
    out.push('\n');

    let mut by_family: BTreeMap<_, Vec<&ScenarioEntry>> = BTreeMap::new();
    for entry in &scorecard.entries {
        by_family.entry(entry.family).or_default().push(entry);
    }
    for (family, entries) in by_family {
        let _ = writeln!(out, "## Family: {family}\n");
        for entry in entries {
            let terminations: Vec<String> = entry
                .terminations
                .iter()
                .map(|(reason, count)| format!("{reason}: {count}"))
                .collect();
            let _ = writeln!(out, "### {}\n", entry.scenario_id);
            let _ = writeln!(out, "Seeds: {} ({})\n", entry.seeds_run, terminations.join(", "));
            let _ = writeln!(out, "| Metric | Median | Mean | Std | P10 | P90 | Mean 95% CI |");
            let _ = writeln!(out, "|---|---|---|---|---|---|---|");
            for (name, stats) in &entry.metrics {
                let _ = writeln!(
                    out,
                    "| {name} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} | [{:.4}, {:.4}] |",
                    stats.median, stats.mean, stats.std, stats.p10, stats.p90, stats.ci_low, stats.ci_high
                );
            }
            out.push('\n');
        }
    }

    let _ = writeln!(out, "## Pareto Ranking\n");
    let _ = writeln!(out, "| Rank | Scenario | Pareto optimal | Objectives |");
    let _ = writeln!(out, "|---|---|---|---|");
    for ranked in &scorecard.pareto {
        let objectives: Vec<String> = ranked
            .objectives
            .iter()
            .map(|(metric, value)| format!("{metric}: {value:.3}"))
            .collect();
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            ranked.rank,
            ranked.scenario_id,
            if ranked.pareto_optimal { "yes" } else { "no" },
            objectives.join(", ")
        );
    }
    out.push('\n');

    let _ = writeln!(out, "## Weighted Scores\n");
    let _ = writeln!(out, "| Family | Score |");
    let _ = writeln!(out, "|---|---|");
    for (family, score) in &scorecard.family_scores {
        let _ = writeln!(out, "| {family} | {score:.3} |");
    }

    if !scorecard.failures.is_empty() {
        let _ = writeln!(out, "\n## Excluded Scenarios\n");
        let _ = writeln!(out, "| Scenario | Family | Seeds | Error |");
        let _ = writeln!(out, "|---|---|---|---|");
        for failure in &scorecard.failures {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                failure.scenario_id,
                failure.family,
                failure.seeds_run,
                failure.error.replace('|', "\\|")
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ScoringConfig,
        grading::GradedTrial,
        scenario::{MetricMap, TaskFamily, TerminationReason},
    };

    fn scorecard() -> Scorecard {
        let trials: Vec<GradedTrial> = (0..3)
            .map(|seed| GradedTrial {
                scenario_id: "constraint/json_schema".to_string(),
                family: TaskFamily::Constraint,
                seed,
                termination: TerminationReason::Success,
                metrics: MetricMap::from([
                    ("task_success".to_string(), 1.0),
                    ("efficiency".to_string(), 0.5),
                ]),
            })
            .collect();
        Scorecard::build("run-1", "mock", &trials, &ScoringConfig::default())
    }

    #[test]
    fn json_round_trips() {
        let card = scorecard();
        let json = render(&card, ReportFormat::Json).expect("json");
        let back: Scorecard = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, card);
    }

    #[test]
    fn csv_has_one_row_per_scenario() {
        let csv = render(&scorecard(), ReportFormat::Csv).expect("csv");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "scenario_id,family,seeds,efficiency_median,efficiency_mean,efficiency_std,efficiency_p10,\
             task_success_median,task_success_mean,task_success_std,task_success_p10"
        );
        assert_eq!(
            lines[1],
            "constraint/json_schema,constraint,3,0.5000,0.5000,0.0000,0.5000,1.0000,1.0000,0.0000,1.0000"
        );
    }

    #[test]
    fn csv_leaves_missing_metrics_blank_and_quotes_fields() {
        let mut card = scorecard();
        let mut other = card.entries[0].clone();
        other.scenario_id = "tool_use/a,b".to_string();
        other.metrics.remove("efficiency");
        card.entries.push(other);

        let csv = to_csv(&card);
        let row = csv.lines().nth(2).expect("second row");
        assert!(row.starts_with("\"tool_use/a,b\",constraint,3,,,,,1.0000"), "{row}");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn markdown_lists_excluded_scenarios() {
        let mut card = scorecard();
        assert!(!to_markdown(&card).contains("## Excluded Scenarios"));
        card.failures.push(crate::scorecard::ScenarioFailure {
            scenario_id: "tool_use/research_calculate".to_string(),
            family: TaskFamily::ToolUse,
            seeds_run: 2,
            error: "metric `efficiency` missing for seed 1".to_string(),
        });
        let md = to_markdown(&card);
        assert!(md.contains("## Excluded Scenarios"));
        assert!(md.contains("| tool_use/research_calculate | tool_use | 2 | metric `efficiency` missing for seed 1 |"));
    }

    #[test]
    fn markdown_has_every_section() {
        let md = to_markdown(&scorecard());
        for heading in ["# Gauntlet Report", "## Summary", "## Family: constraint", "## Pareto Ranking", "## Weighted Scores"] {
            assert!(md.contains(heading), "missing {heading}");
        }
        assert!(md.contains("| constraint/json_schema | constraint | 3 | 1.000 | 0.500 |"));
        assert!(md.contains("success: 3"));
    }
}
