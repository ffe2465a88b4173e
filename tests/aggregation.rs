use gauntlet::{
    judges::{combine_scores, EnsembleConfig, JudgeEnsemble, JudgeKind, JudgeVerdict, AGREEMENT_METRIC},
    pareto::{pareto_rank, Objective},
    stats::{MetricStats, PercentileMethod},
};

#[test]
fn pareto_front_keeps_every_trade_off() {
    let points = vec![
        ("a".to_string(), vec![1.0, 0.5]),
        ("b".to_string(), vec![0.5, 1.0]),
        ("c".to_string(), vec![0.8, 0.8]),
        ("d".to_string(), vec![0.2, 0.2]),
    ];
    let ranked = pareto_rank(&points, &Objective::defaults());
    let rank = |id: &str| ranked.iter().find(|e| e.scenario_id == id).map(|e| e.rank).expect("ranked");

    assert_eq!((rank("a"), rank("b"), rank("c")), (1, 1, 1));
    assert!(rank("d") >= 2);
    assert!(ranked.iter().filter(|e| e.pareto_optimal).count() == 3);
    assert_eq!(ranked[0].objectives["task_success"], 1.0);
}

#[test]
fn penalty_is_monotone_in_disagreement() {
    let config = EnsembleConfig::default();
    let mut previous = f64::INFINITY;
    for step in 0..=50 {
        let d = step as f64 * 0.01;
        let (combined, spread) = combine_scores(
            &[(1.0, 0.5 + d), (1.0, 0.5 - d)],
            config.disagreement_threshold,
            config.disagreement_penalty,
        );
        assert!((spread - 2.0 * d).abs() < 1e-9);
        assert!(combined <= previous + 1e-12, "combined rose at d={d}");
        assert!((0.0..=1.0).contains(&combined));
        if step == 0 {
            assert!((combined - 0.5).abs() < 1e-12);
        }
        previous = combined;
    }
}

#[test]
fn weighted_ensemble_does_not_reward_disagreement() {
    let ensemble = JudgeEnsemble::new(EnsembleConfig::default());
    let quality = |constraint: f64, rubric: f64| {
        ensemble.combine(&[
            JudgeVerdict::scored(JudgeKind::Constraint, "quality", constraint, 1.0),
            JudgeVerdict::scored(JudgeKind::Rubric, "quality", rubric, 1.0),
        ])["quality"]
    };
    let agreed = quality(0.5, 0.5);
    assert!((agreed - 0.5).abs() < 1e-12);
    let mut previous = agreed;
    for d in [0.01, 0.02, 0.05, 0.1, 0.2] {
        let split = quality(0.5 + d, 0.5 - d);
        assert!(split <= previous + 1e-12, "disagreement d={d} raised the score to {split}");
        previous = split;
    }
}

#[test]
fn ensemble_reports_agreement_alongside_the_penalized_metric() {
    let ensemble = JudgeEnsemble::new(EnsembleConfig::default());
    let metrics = ensemble.combine(&[
        JudgeVerdict::scored(JudgeKind::Constraint, "quality", 1.0, 1.0),
        JudgeVerdict::scored(JudgeKind::Rubric, "quality", 0.2, 1.0),
    ]);
    // weighted mean (0.3 * 1.0 + 0.4 * 0.2) / 0.7 is below the plain mean,
    // less 0.5 * spread 0.8
    let expected = (0.3 + 0.08) / 0.7 - 0.4;
    assert!((metrics["quality"] - expected).abs() < 1e-12);
    assert!((metrics[AGREEMENT_METRIC] - 0.2).abs() < 1e-12);
}

#[test]
fn statistics_of_zero_zero_one() {
    let stats = MetricStats::from_values(&[0.0, 0.0, 1.0], PercentileMethod::Linear).expect("stats");
    assert_eq!(stats.median, 0.0);
    assert!((stats.mean - 1.0 / 3.0).abs() < 1e-12);
    assert_eq!(stats.p10, 0.0);
    assert!((stats.p90 - 0.8).abs() < 1e-12);
    assert_eq!((stats.min, stats.max), (0.0, 1.0));
}
