//! End-to-end orchestrator tests
//!
//! Toyota Way: Jidoka
//! A run that stops for any reason must resume to the same answer an
//! uninterrupted run gives, without re-running completed stages and without
//! touching their checkpoints.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hybrid_optimizer::checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
use hybrid_optimizer::evaluator::{
    EvalContext, Fidelity, FnEvaluator, ObjectiveEvaluator, SimulationEvaluator,
};
use hybrid_optimizer::outcome::{FailureReport, FinalResult};
use hybrid_optimizer::params::ParameterVector;
use hybrid_optimizer::trial::Stage;
use hybrid_optimizer::{
    CancellationToken, Error, EvaluationError, HybridOptimizer, OptimizerConfig, OptimizerState,
    ParameterSchema, StageEvaluators,
};

const SCHEMA: ParameterSchema = ParameterSchema::Risk;

fn config() -> OptimizerConfig {
    OptimizerConfig::builder()
        .phase(SCHEMA)
        .trials(40, 8, 3)
        .seed(42)
        .stage1_workers(4)
        .poll_interval(Duration::from_millis(2))
        .build()
        .unwrap()
}

/// Counts calls and optionally cancels a token after `cancel_after` calls.
struct Spy {
    inner: SimulationEvaluator,
    calls: AtomicUsize,
    cancel: Option<(usize, CancellationToken)>,
}

impl Spy {
    fn new(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: SimulationEvaluator::for_schema(SCHEMA, seed),
            calls: AtomicUsize::new(0),
            cancel: None,
        })
    }

    fn cancelling(seed: u64, after: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            inner: SimulationEvaluator::for_schema(SCHEMA, seed),
            calls: AtomicUsize::new(0),
            cancel: Some((after, token)),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObjectiveEvaluator for Spy {
    fn evaluate(&self, params: &ParameterVector, ctx: &EvalContext) -> Result<f64, EvaluationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel {
            if n >= *after {
                token.cancel();
            }
        }
        self.inner.evaluate(params, ctx)
    }

    fn fidelity(&self) -> Fidelity {
        self.inner.fidelity()
    }

    fn name(&self) -> &str {
        "spy"
    }
}

struct Spies {
    stage1: Arc<Spy>,
    stage2: Arc<Spy>,
    stage3: Arc<Spy>,
}

impl Spies {
    fn new() -> Self {
        Self {
            stage1: Spy::new(1),
            stage2: Spy::new(2),
            stage3: Spy::new(3),
        }
    }

    fn evaluators(&self) -> StageEvaluators {
        StageEvaluators::new(self.stage1.clone(), self.stage2.clone(), self.stage3.clone())
    }
}

fn same_winner(a: &FinalResult, b: &FinalResult) {
    assert_eq!(a.best_params(), b.best_params());
    assert!((a.best_value() - b.best_value()).abs() < f64::EPSILON);
    assert_eq!(a.best_lineage(), b.best_lineage());
}

fn uninterrupted() -> FinalResult {
    let spies = Spies::new();
    HybridOptimizer::new(config(), spies.evaluators(), Arc::new(MemoryCheckpointStore::new()))
        .unwrap()
        .run()
        .unwrap()
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_full_run_walks_every_state() {
    let spies = Spies::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut optimizer = HybridOptimizer::new(config(), spies.evaluators(), store.clone()).unwrap();

    let result = optimizer.run().unwrap();

    use OptimizerState::*;
    assert_eq!(
        optimizer.state_history(),
        &[
            Init,
            Stage1Running,
            Stage1Done,
            Stage2Running,
            Stage2Done,
            Stage3Running,
            Stage3Done,
            Finalized
        ]
    );
    assert_eq!(spies.stage1.calls() + result.stage_breakdown()[&Stage::Stage1].n_rejected, 40);
    assert!(spies.stage2.calls() <= 8);
    assert!(spies.stage3.calls() <= 3);

    for stage in Stage::ALL {
        assert!(store.load("risk", stage).unwrap().unwrap().is_complete());
    }
    assert_eq!(store.load_final("risk").unwrap(), Some(result));
}

#[test]
fn test_winner_comes_from_stage3() {
    let result = uninterrupted();
    let stages: Vec<Stage> = result.best_lineage().iter().map(|l| l.stage).collect();
    assert_eq!(stages, vec![Stage::Stage1, Stage::Stage2, Stage::Stage3]);
    let stage3_score = result.best_lineage()[2].score;
    assert!((stage3_score - result.best_value()).abs() < f64::EPSILON);
    assert!(ParameterSchema::Risk.validator().validate(result.best_params()));

    let diagnostics = result.diagnostics().unwrap();
    assert_eq!(diagnostics.compared_trials, result.stage_breakdown()[&Stage::Stage3].n_complete);
}

#[test]
fn test_same_seed_same_winner() {
    same_winner(&uninterrupted(), &uninterrupted());
}

#[test]
fn test_second_run_is_rejected() {
    let spies = Spies::new();
    let mut optimizer =
        HybridOptimizer::new(config(), spies.evaluators(), Arc::new(MemoryCheckpointStore::new())).unwrap();
    optimizer.run().unwrap();
    assert!(matches!(
        optimizer.run(),
        Err(Error::InvalidTransition {
            from: OptimizerState::Finalized,
            ..
        })
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = config();
    config.stage3_top_k = 50;
    let spies = Spies::new();
    assert!(matches!(
        HybridOptimizer::new(config, spies.evaluators(), Arc::new(MemoryCheckpointStore::new())),
        Err(Error::InvalidConfig(_))
    ));
}

// ============================================================================
// Cancellation and resume
// ============================================================================

#[test]
fn test_cancel_in_stage2_then_resume_matches_uninterrupted() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let token = CancellationToken::new();
    let stage2 = Spy::cancelling(2, 3, token.clone());
    let evaluators = StageEvaluators::new(Spy::new(1), stage2, Spy::new(3));

    let mut first = HybridOptimizer::new(config(), evaluators, store.clone())
        .unwrap()
        .with_cancellation(token);
    let Err(Error::Cancelled(summary)) = first.run() else {
        panic!("run should have been cancelled");
    };
    assert_eq!(first.state(), OptimizerState::Cancelled);
    assert_eq!(summary.completed_stages, vec![Stage::Stage1]);
    assert_eq!(summary.failed_stage, Some(Stage::Stage2));

    let partial = store.load("risk", Stage::Stage2).unwrap().unwrap();
    assert!(!partial.is_complete());
    assert_eq!(partial.trials().len(), 3);

    let spies = Spies::new();
    let mut second = HybridOptimizer::new(config(), spies.evaluators(), store.clone()).unwrap();
    let resumed = second.run().unwrap();

    assert_eq!(spies.stage1.calls(), 0, "completed stage must be replayed, not re-run");
    assert_eq!(spies.stage2.calls(), 5, "only the remaining candidates run");
    same_winner(&resumed, &uninterrupted());
}

#[test]
fn test_completed_run_returns_stored_result() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = HybridOptimizer::new(config(), Spies::new().evaluators(), store.clone())
        .unwrap()
        .run()
        .unwrap();

    let spies = Spies::new();
    let again = HybridOptimizer::new(config(), spies.evaluators(), store)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(again, first);
    assert_eq!(spies.stage1.calls() + spies.stage2.calls() + spies.stage3.calls(), 0);
}

#[test]
fn test_force_rerun_from_stage2_keeps_stage1() {
    let store = Arc::new(MemoryCheckpointStore::new());
    HybridOptimizer::new(config(), Spies::new().evaluators(), store.clone())
        .unwrap()
        .run()
        .unwrap();
    let stage1_before = store.load("risk", Stage::Stage1).unwrap();

    let mut config = config();
    config.force_rerun_from = Some(Stage::Stage2);
    let spies = Spies::new();
    let rerun = HybridOptimizer::new(config, spies.evaluators(), store.clone())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(spies.stage1.calls(), 0);
    assert!(spies.stage2.calls() > 0);
    assert!(spies.stage3.calls() > 0);
    assert_eq!(store.load("risk", Stage::Stage1).unwrap(), stage1_before);
    same_winner(&rerun, &uninterrupted());
}

#[test]
fn test_resume_disabled_starts_over() {
    let store = Arc::new(MemoryCheckpointStore::new());
    HybridOptimizer::new(config(), Spies::new().evaluators(), store.clone())
        .unwrap()
        .run()
        .unwrap();

    let mut config = config();
    config.resume = false;
    let spies = Spies::new();
    HybridOptimizer::new(config, spies.evaluators(), store)
        .unwrap()
        .run()
        .unwrap();
    assert!(spies.stage1.calls() > 0);
}

// ============================================================================
// Failures
// ============================================================================

/// File store whose Stage 2 checkpoint writes always fail.
struct Stage2WriteFails {
    inner: FileCheckpointStore,
}

impl CheckpointStore for Stage2WriteFails {
    fn save(&self, checkpoint: &Checkpoint) -> hybrid_optimizer::Result<()> {
        if checkpoint.stage() == Stage::Stage2 {
            return Err(Error::Persistence {
                path: self.inner.checkpoint_path(checkpoint.phase(), Stage::Stage2),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.save(checkpoint)
    }

    fn replace(&self, checkpoint: &Checkpoint) -> hybrid_optimizer::Result<()> {
        self.inner.replace(checkpoint)
    }

    fn load(&self, phase: &str, stage: Stage) -> hybrid_optimizer::Result<Option<Checkpoint>> {
        self.inner.load(phase, stage)
    }

    fn discard(&self, phase: &str, stage: Stage) -> hybrid_optimizer::Result<()> {
        self.inner.discard(phase, stage)
    }

    fn save_final(&self, result: &FinalResult) -> hybrid_optimizer::Result<()> {
        self.inner.save_final(result)
    }

    fn load_final(&self, phase: &str) -> hybrid_optimizer::Result<Option<FinalResult>> {
        self.inner.load_final(phase)
    }

    fn save_failure(&self, report: &FailureReport) -> hybrid_optimizer::Result<()> {
        self.inner.save_failure(report)
    }
}

#[test]
fn test_stage2_write_failure_leaves_stage1_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let files = FileCheckpointStore::new(dir.path());
    let failing = Arc::new(Stage2WriteFails { inner: files.clone() });

    let mut optimizer = HybridOptimizer::new(config(), Spies::new().evaluators(), failing).unwrap();
    let err = optimizer.run().unwrap_err();
    let stage1_path = files.checkpoint_path("risk", Stage::Stage1);
    let stage1_bytes = fs::read(&stage1_path).unwrap();

    let Error::StageFailed { summary, source } = err else {
        panic!("expected StageFailed");
    };
    assert!(matches!(*source, Error::Persistence { .. }));
    assert_eq!(summary.completed_stages, vec![Stage::Stage1]);
    assert_eq!(summary.failed_stage, Some(Stage::Stage2));
    assert_eq!(optimizer.state(), OptimizerState::Failed);
    assert!(!files.checkpoint_path("risk", Stage::Stage2).exists());

    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(files.failure_path("risk")).unwrap()).unwrap();
    assert_eq!(report["state"], "stage2_running");
    assert!(report["error"].as_str().unwrap().contains("disk full"));

    // A second failing attempt replays Stage 1 and must not rewrite it.
    let again = HybridOptimizer::new(
        config(),
        Spies::new().evaluators(),
        Arc::new(Stage2WriteFails { inner: files.clone() }),
    )
    .unwrap()
    .run();
    assert!(again.is_err());
    assert_eq!(fs::read(&stage1_path).unwrap(), stage1_bytes);

    // Once storage recovers, the run resumes without re-running Stage 1.
    let spies = Spies::new();
    let resumed = HybridOptimizer::new(config(), spies.evaluators(), Arc::new(files))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(spies.stage1.calls(), 0);
    assert_eq!(fs::read(&stage1_path).unwrap(), stage1_bytes);
    same_winner(&resumed, &uninterrupted());
}

#[test]
fn test_real_stage2_write_failure_on_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let files = FileCheckpointStore::new(dir.path());
    let stage1_path = files.checkpoint_path("risk", Stage::Stage1);
    let stage2_path = files.checkpoint_path("risk", Stage::Stage2);

    // Once Stage 2 starts, snapshot Stage 1 and occupy stage2.json with a
    // directory so persisting the Stage 2 checkpoint fails on disk.
    let stage1_snapshot: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let blocking_stage2: Arc<dyn ObjectiveEvaluator> = {
        let snapshot = Arc::clone(&stage1_snapshot);
        let (stage1_path, stage2_path) = (stage1_path.clone(), stage2_path.clone());
        let scorer = SimulationEvaluator::for_schema(SCHEMA, 2);
        Arc::new(FnEvaluator::new("blocking_stage2", Fidelity::Lightweight, move |params, ctx| {
            let mut snapshot = snapshot.lock().unwrap();
            if snapshot.is_none() {
                *snapshot = Some(fs::read(&stage1_path).unwrap());
                fs::create_dir_all(&stage2_path).unwrap();
            }
            scorer.evaluate(params, ctx)
        }))
    };
    let evaluators = StageEvaluators::new(Spy::new(1), blocking_stage2, Spy::new(3));

    let mut optimizer = HybridOptimizer::new(config(), evaluators, Arc::new(files.clone())).unwrap();
    let Err(Error::StageFailed { summary, source }) = optimizer.run() else {
        panic!("expected StageFailed");
    };

    assert!(matches!(*source, Error::Persistence { .. }));
    assert_eq!(summary.completed_stages, vec![Stage::Stage1]);
    assert_eq!(summary.failed_stage, Some(Stage::Stage2));
    assert_eq!(optimizer.state(), OptimizerState::Failed);
    assert!(stage2_path.is_dir(), "no checkpoint replaced the blocker");

    let before = stage1_snapshot.lock().unwrap().clone().unwrap();
    assert_eq!(fs::read(&stage1_path).unwrap(), before);
    let stage1 = files.load("risk", Stage::Stage1).unwrap().unwrap();
    assert!(stage1.is_complete());
    assert_eq!(stage1.trials().len(), 40);

    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(files.failure_path("risk")).unwrap()).unwrap();
    assert_eq!(report["state"], "stage2_running");
    assert_eq!(report["summary"]["failed_stage"], "stage2");
    assert_eq!(report["partial_trials"], 8);
    let leftovers: Vec<_> = fs::read_dir(stage2_path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
}

#[test]
fn test_stage_without_viable_trials_fails() {
    let always_fails: Arc<dyn ObjectiveEvaluator> = Arc::new(FnEvaluator::new(
        "broken_backtest",
        Fidelity::Lightweight,
        |_params, _ctx| Err(EvaluationError::InvalidData("no market data".to_string())),
    ));
    let evaluators = StageEvaluators::new(Spy::new(1), always_fails, Spy::new(3));
    let mut optimizer =
        HybridOptimizer::new(config(), evaluators, Arc::new(MemoryCheckpointStore::new())).unwrap();

    let Err(Error::StageFailed { source, .. }) = optimizer.run() else {
        panic!("expected StageFailed");
    };
    assert!(matches!(*source, Error::NoViableTrials { stage: Stage::Stage2 }));
    assert_eq!(optimizer.state(), OptimizerState::Failed);
}

#[test]
fn test_open_uses_configured_checkpoint_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.checkpoint_dir = dir.path().join("results");
    config.scratch_dir = dir.path().join("scratch");

    HybridOptimizer::open(config, Spies::new().evaluators())
        .unwrap()
        .run()
        .unwrap();
    assert!(dir.path().join("results").join("risk").join("final.json").exists());
    assert!(dir.path().join("results").join("risk").join("stage3.json").exists());
}
