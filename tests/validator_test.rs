//! Parameter validation tests
//!
//! Toyota Way: Poka-Yoke (mistake proofing)
//! Invalid vectors must be rejected before any evaluator sees them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hybrid_optimizer::evaluator::{Fidelity, FnEvaluator, ObjectiveEvaluator};
use hybrid_optimizer::params::ParameterVector;
use hybrid_optimizer::runner::StageRunner;
use hybrid_optimizer::sampler::{Proposal, TrialSampler};
use hybrid_optimizer::trial::{FailureReason, Stage, TrialRecord, SENTINEL_SCORE};
use hybrid_optimizer::validator::{Check, ParameterValidator};
use hybrid_optimizer::{select_top_k, ParameterSchema};

/// Proposes a fixed list of vectors, then reports exhaustion.
struct FixedSampler {
    queue: Vec<ParameterVector>,
}

impl TrialSampler for FixedSampler {
    fn suggest(&mut self, _trial_id: u64, _history: &[TrialRecord]) -> Option<Proposal> {
        (!self.queue.is_empty()).then(|| Proposal::new(self.queue.remove(0)))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

fn counting_evaluator(calls: Arc<AtomicUsize>) -> Arc<dyn ObjectiveEvaluator> {
    Arc::new(FnEvaluator::new("counting", Fidelity::Lightweight, move |params, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(params.get_f64("a").unwrap_or(0.0))
    }))
}

// ============================================================================
// Checks
// ============================================================================

#[test]
fn test_ordering_violation_is_rejected() {
    let validator = ParameterValidator::new().ordering("a_below_b", &["a", "b"]);
    let params = ParameterVector::new().with("a", 2.0).with("b", 1.0);

    assert!(!validator.validate(&params));
    let rejection = validator.check_all(&params).unwrap_err();
    assert_eq!(rejection.check, "a_below_b");
}

#[test]
fn test_validate_is_deterministic() {
    let validator = ParameterSchema::Risk.validator();
    let params = ParameterSchema::Risk.reference_vector();
    let first = validator.validate(&params);
    for _ in 0..10 {
        assert_eq!(validator.validate(&params), first);
    }
    assert!(first, "reference vector must satisfy its own schema");
}

#[test]
fn test_first_failing_check_is_reported() {
    let validator = ParameterValidator::new()
        .range("a_range", "a", 0.0, 1.0)
        .ordering("a_below_b", &["a", "b"]);
    let params = ParameterVector::new().with("a", 5.0).with("b", 1.0);
    assert_eq!(validator.check_all(&params).unwrap_err().check, "a_range");
}

#[test]
fn test_conditional_check_only_applies_when_gate_matches() {
    let validator = ParameterValidator::new().conditional(
        "distance_when_enabled",
        "trailing.enabled",
        true,
        Check::Range {
            field: "trailing.distance".to_string(),
            min: 0.001,
            max: 0.1,
        },
    );
    let disabled = ParameterVector::new()
        .with("trailing.enabled", false)
        .with("trailing.distance", 5.0);
    let enabled = disabled.clone().with("trailing.enabled", true);

    assert!(validator.validate(&disabled));
    assert!(!validator.validate(&enabled));
}

#[test]
fn test_strategy_weights_must_sum_to_one() {
    let validator = ParameterSchema::Strategy.validator();
    let good = ParameterSchema::Strategy.reference_vector();
    let bad = good.clone().with("strategy.weights.ml", 0.5);
    assert!(validator.validate(&good));
    assert!(!validator.validate(&bad));
}

#[test]
fn test_ml_leaves_must_fit_depth() {
    let validator = ParameterSchema::MlHyperparams.validator();
    let params = ParameterSchema::MlHyperparams
        .reference_vector()
        .with("ml.lgbm.max_depth", 3_i64)
        .with("ml.lgbm.num_leaves", 64_i64);
    assert_eq!(validator.check_all(&params).unwrap_err().check, "leaves_fit_depth");
}

// ============================================================================
// Rejection inside a stage
// ============================================================================

#[test]
fn test_rejected_vector_never_reaches_evaluator() {
    let calls = Arc::new(AtomicUsize::new(0));
    let evaluator = counting_evaluator(Arc::clone(&calls));
    let validator = ParameterValidator::new().ordering("a_below_b", &["a", "b"]);
    let mut sampler = FixedSampler {
        queue: vec![ParameterVector::new().with("a", 2.0).with("b", 1.0)],
    };

    let outcome = StageRunner::new(Stage::Stage2)
        .run_stage(1, &mut sampler, &evaluator, &validator)
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let trial = &outcome.result.trials()[0];
    assert!(trial.is_rejected());
    assert!((trial.score() - SENTINEL_SCORE).abs() < f64::EPSILON);
    assert!(matches!(trial.failure(), Some(FailureReason::Rejected { .. })));
    assert_eq!(outcome.result.summary().n_rejected, 1);
}

#[test]
fn test_rejected_trials_never_promoted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let evaluator = counting_evaluator(Arc::clone(&calls));
    let validator = ParameterValidator::new().ordering("a_below_b", &["a", "b"]);
    let mut sampler = FixedSampler {
        queue: vec![
            ParameterVector::new().with("a", 9.0).with("b", 1.0),
            ParameterVector::new().with("a", 0.5).with("b", 1.0),
            ParameterVector::new().with("a", 0.2).with("b", 1.0),
        ],
    };

    let outcome = StageRunner::new(Stage::Stage2)
        .run_stage(3, &mut sampler, &evaluator, &validator)
        .unwrap();
    let candidates = select_top_k(&outcome.result, 3);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|t| !t.is_rejected()));
    assert_eq!(candidates.trial_ids(), vec![1, 2]);
}
