//! Property tests for the request path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use tunemux::{
    BanditPolicy, CandidateGrid, ComplianceBudget, ComplianceConfig, ManualClock, MemorySink,
    MemoryStore, OptimizerConfig, ParameterOptimizer, ParameterSet, Phase, QualityFloorConfig,
    QualityGateValidator, RecommendRequest, TaskFeatures, TaskOutcome, TaskTypeConfig,
    ThompsonGaussian, ThompsonGaussianConfig, TrustRegion,
};
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

fn baseline_params() -> impl Strategy<Value = ParameterSet> {
    (0.0f64..2.0, 0.05f64..1.0, 16u32..4_000).prop_map(|(temperature, top_p, max_tokens)| {
        ParameterSet {
            temperature,
            top_p: Some(top_p),
            max_tokens,
            ..ParameterSet::default()
        }
    })
}

fn grid() -> impl Strategy<Value = CandidateGrid> {
    (
        prop::collection::vec(-0.6f64..0.6, 1..4),
        prop::collection::vec(-600i64..600, 1..4),
        prop::collection::vec(-0.3f64..0.3, 1..3),
    )
        .prop_map(|(temperature_deltas, max_tokens_deltas, top_p_deltas)| CandidateGrid {
            temperature_deltas,
            max_tokens_deltas,
            top_p_deltas,
        })
}

fn features() -> impl Strategy<Value = TaskFeatures> {
    (0u8..4, 0u32..500, 0u32..20, any::<bool>()).prop_map(
        |(risk_tier, title_length, scope_files_count, has_external_deps)| TaskFeatures {
            risk_tier,
            title_length,
            scope_files_count,
            has_external_deps,
            ..TaskFeatures::default()
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the grid proposes, the gate only lets through arms inside the trust region.
    #[test]
    fn gate_never_admits_arms_outside_the_trust_region(
        base in baseline_params(),
        g in grid(),
    ) {
        let trust = TrustRegion::default();
        let arms = g.expand(&base);
        let gate = QualityGateValidator::new(arms[0].clone(), trust, QualityFloorConfig::default());
        let budget = ComplianceBudget::new("t", ComplianceConfig::default(), t0());
        let report = gate.filter(&arms, &budget, t0(), None).expect("filter");
        prop_assert!(!report.eligible.is_empty());
        for arm in &report.eligible {
            prop_assert!(trust.contains(&base, &arm.params), "{} escaped", arm.id);
        }
        prop_assert_eq!(report.eligible.len() + report.rejected.len(), arms.len());
    }

    /// The bandit's distribution covers exactly the offered arms, every arm is positive,
    /// and the logged propensity is the served arm's probability.
    #[test]
    fn thompson_propensities_are_a_full_support_distribution(
        seed in any::<u64>(),
        f in features(),
        rewards in prop::collection::vec((0usize..9, -1.0f64..2.0), 0..40),
    ) {
        let arms = CandidateGrid::default().expand(&ParameterSet::default());
        let policy = ThompsonGaussian::new(ThompsonGaussianConfig {
            seed,
            mc_samples: 64,
            ..ThompsonGaussianConfig::default()
        });
        for (i, r) in rewards {
            policy.update(&f, &arms[i % arms.len()].id, r).expect("update");
        }
        let sel = policy.select(&f, &arms).expect("select");
        let total: f64 = sel.probs.values().sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
        prop_assert_eq!(sel.probs.len(), arms.len());
        prop_assert!(sel.probs.values().all(|p| *p > 0.0));
        prop_assert_eq!(sel.probs.get(&sel.arm.id).copied(), Some(sel.propensity));
    }

    /// Same seed, same request ids, same outcomes: same arms served.
    #[test]
    fn recommendations_are_reproducible_for_a_seed(seed in any::<u64>(), n in 5usize..40) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let served = |seed: u64| -> Vec<(String, u64)> {
            rt.block_on(async {
                let cfg = OptimizerConfig { seed, ..OptimizerConfig::default() }
                    .with_task_type("review", TaskTypeConfig::default());
                let opt = ParameterOptimizer::with_parts(
                    cfg,
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemorySink::new()),
                    Arc::new(ManualClock::new(t0())),
                )
                .expect("optimizer");
                opt.rollout()
                    .override_phase("review", Phase::General, t0())
                    .expect("override");
                let mut out = Vec::with_capacity(n);
                for i in 0..n {
                    let rec = opt.recommend(
                        RecommendRequest::new("review", TaskFeatures::default())
                            .with_request_id(Uuid::from_u128(i as u128)),
                    );
                    let outcome = TaskOutcome {
                        success: i % 4 != 0,
                        quality: (i % 10) as f64 / 10.0,
                        latency_ms: 100 + 10 * i as u64,
                        tokens_used: 500,
                        violations: vec![],
                    };
                    opt.record_outcome(rec.request_id, outcome).await.expect("record");
                    out.push((rec.arm_id, rec.propensity.to_bits()));
                }
                opt.shutdown().await.expect("shutdown");
                out
            })
        };
        prop_assert_eq!(served(seed), served(seed));
    }
}
