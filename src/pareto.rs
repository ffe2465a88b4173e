//! Multi-objective ranking of scenarios and the weighted composite summary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

/// A metric ranked on its median across seeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub metric: String,
    #[serde(default)]
    pub direction: Direction,
}

impl Objective {
    pub fn maximize(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            direction: Direction::Maximize,
        }
    }

    pub fn minimize(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            direction: Direction::Minimize,
        }
    }

    pub fn defaults() -> Vec<Objective> {
        vec![Self::maximize("task_success"), Self::maximize("efficiency")]
    }
}

/// `a` dominates `b` when it is at least as good on every objective and
/// strictly better on one.
pub fn dominates(a: &[f64], b: &[f64], directions: &[Direction]) -> bool {
    let mut strictly_better = false;
    for ((x, y), direction) in a.iter().zip(b).zip(directions) {
        let (x, y) = match direction {
            Direction::Maximize => (*x, *y),
            Direction::Minimize => (-*x, -*y),
        };
        if x < y {
            return false;
        }
        if x > y {
            strictly_better = true;
        }
    }
    strictly_better
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoEntry {
    pub scenario_id: String,
    /// 1 for the non-dominated front, 2 for the front once it is removed, ...
    pub rank: usize,
    pub pareto_optimal: bool,
    pub objectives: BTreeMap<String, f64>,
}

/// Peels non-dominated fronts off `points` until none remain. The output
/// is sorted by rank, then by scenario id.
pub fn pareto_rank(points: &[(String, Vec<f64>)], objectives: &[Objective]) -> Vec<ParetoEntry> {
    let directions: Vec<Direction> = objectives.iter().map(|o| o.direction).collect();
    let mut ranks = vec![0usize; points.len()];
    let mut remaining: Vec<usize> = (0..points.len()).collect();
    let mut rank = 1;

    while !remaining.is_empty() {
        let front: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                !remaining
                    .iter()
                    .any(|&j| j != i && dominates(&points[j].1, &points[i].1, &directions))
            })
            .collect();
        for &i in &front {
            ranks[i] = rank;
        }
        remaining.retain(|i| !front.contains(i));
        rank += 1;
    }

    let mut entries: Vec<ParetoEntry> = points
        .iter()
        .zip(ranks)
        .map(|((id, values), rank)| ParetoEntry {
            scenario_id: id.clone(),
            rank,
            pareto_optimal: rank == 1,
            objectives: objectives
                .iter()
                .map(|o| o.metric.clone())
                .zip(values.iter().copied())
                .collect(),
        })
        .collect();
    entries.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.scenario_id.cmp(&b.scenario_id)));
    entries
}

/// Weighted mean of the metrics present in `medians`. Weights of absent
/// metrics drop out of the denominator.
pub fn weighted_score(medians: &BTreeMap<String, f64>, weights: &BTreeMap<String, f64>) -> f64 {
    let (total, weight) = weights
        .iter()
        .filter_map(|(metric, w)| medians.get(metric).map(|v| (w * v, *w)))
        .fold((0.0, 0.0), |(total, weight), (score, w)| (total + score, weight + w));
    if weight <= 0.0 {
        0.0
    } else {
        total / weight
    }
}

/// `sum(weight[family] * score[family])` over the families present, with
/// the present weights renormalized to sum to one.
pub fn composite<K: Ord>(family_scores: &BTreeMap<K, f64>, family_weights: &BTreeMap<K, f64>) -> f64 {
    let (total, weight) = family_scores
        .iter()
        .map(|(family, score)| {
            let w = family_weights.get(family).copied().unwrap_or(0.0);
            (w * score, w)
        })
        .fold((0.0, 0.0), |(total, weight), (score, w)| (total + score, weight + w));
    if weight <= 0.0 {
        0.0
    } else {
        total / weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, values: &[f64]) -> (String, Vec<f64>) {
        (id.to_string(), values.to_vec())
    }

    fn rank_of(entries: &[ParetoEntry], id: &str) -> usize {
        entries
            .iter()
            .find(|e| e.scenario_id == id)
            .map(|e| e.rank)
            .unwrap_or(usize::MAX)
    }

    #[test]
    fn trade_offs_share_the_first_front() {
        let points = vec![
            point("accurate", &[1.0, 0.5]),
            point("cheap", &[0.5, 1.0]),
            point("balanced", &[0.8, 0.8]),
            point("weak", &[0.2, 0.2]),
        ];
        let entries = pareto_rank(&points, &Objective::defaults());
        assert_eq!(rank_of(&entries, "accurate"), 1);
        assert_eq!(rank_of(&entries, "cheap"), 1);
        assert_eq!(rank_of(&entries, "balanced"), 1);
        assert!(rank_of(&entries, "weak") >= 2);
        let order: Vec<&str> = entries.iter().map(|e| e.scenario_id.as_str()).collect();
        assert_eq!(order, vec!["accurate", "balanced", "cheap", "weak"]);
    }

    #[test]
    fn equal_points_do_not_dominate_each_other() {
        assert!(!dominates(&[0.5, 0.5], &[0.5, 0.5], &[Direction::Maximize; 2]));
        let entries = pareto_rank(&[point("b", &[0.5]), point("a", &[0.5])], &[Objective::maximize("x")]);
        assert!(entries.iter().all(|e| e.rank == 1));
        assert_eq!(entries[0].scenario_id, "a");
    }

    #[test]
    fn minimize_flips_the_comparison() {
        let dirs = [Direction::Minimize];
        assert!(dominates(&[1.0], &[2.0], &dirs));
        assert!(!dominates(&[2.0], &[1.0], &dirs));
    }

    #[test]
    fn chains_produce_successive_ranks() {
        let points = vec![point("c", &[0.1]), point("a", &[0.9]), point("b", &[0.5])];
        let entries = pareto_rank(&points, &[Objective::maximize("x")]);
        let ranks: Vec<(String, usize)> = entries.into_iter().map(|e| (e.scenario_id, e.rank)).collect();
        assert_eq!(
            ranks,
            vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]
        );
    }

    #[test]
    fn weighted_score_skips_absent_metrics() {
        let medians = BTreeMap::from([("task_success".to_string(), 1.0), ("efficiency".to_string(), 0.5)]);
        let weights = BTreeMap::from([
            ("task_success".to_string(), 0.5),
            ("efficiency".to_string(), 0.2),
            ("recovery_rate".to_string(), 0.3),
        ]);
        assert!((weighted_score(&medians, &weights) - 0.6 / 0.7).abs() < 1e-12);
    }

    #[test]
    fn composite_renormalizes_over_present_families() {
        let scores = BTreeMap::from([("a", 1.0), ("b", 0.0)]);
        let weights = BTreeMap::from([("a", 0.25), ("b", 0.25), ("c", 0.5)]);
        assert!((composite(&scores, &weights) - 0.5).abs() < 1e-12);
    }
}
