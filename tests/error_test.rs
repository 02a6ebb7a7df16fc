//! Tests for error types

use std::time::Duration;

use hybrid_optimizer::outcome::RunSummary;
use hybrid_optimizer::trial::Stage;
use hybrid_optimizer::{Error, EvaluationError, OptimizerState};

#[test]
fn test_invalid_config_error() {
    let error = Error::InvalidConfig("stage3_top_k exceeds stage2_top_k".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid optimizer configuration"));
    assert!(error_str.contains("stage3_top_k"));
}

#[test]
fn test_persistence_error_mentions_path() {
    let error = Error::Persistence {
        path: "results/risk/stage2.json".into(),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("results/risk/stage2.json"));
    assert!(error_str.contains("read-only"));
}

#[test]
fn test_checkpoint_conflict_error() {
    let error = Error::CheckpointConflict {
        phase: "risk".to_string(),
        stage: Stage::Stage1,
        reason: "trial 3 would be dropped".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("risk/stage1"));
    assert!(error_str.contains("trial 3 would be dropped"));
    assert!(error_str.contains("forced re-run"));
}

#[test]
fn test_integration_error_lists_unapplied_keys() {
    let error = Error::Integration {
        reason: "write failed".to_string(),
        unapplied: vec!["risk.kelly.fraction".to_string()],
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Destination untouched"));
    assert!(error_str.contains("risk.kelly.fraction"));
}

#[test]
fn test_invalid_transition_error() {
    let error = Error::InvalidTransition {
        from: OptimizerState::Finalized,
        to: OptimizerState::Stage1Running,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Finalized"));
    assert!(error_str.contains("Stage1Running"));
}

#[test]
fn test_stage_failed_carries_summary_and_cause() {
    let summary = RunSummary::new("strategy", vec![Stage::Stage1], Some(Stage::Stage2));
    let error = Error::StageFailed {
        summary,
        source: Box::new(Error::NoViableTrials { stage: Stage::Stage2 }),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Phase 'strategy' stopped in stage2"));
    assert!(error_str.contains("Completed stages: stage1"));
    assert!(error_str.contains("resume enabled"));
    assert!(error_str.contains("No viable trials"));
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn test_cancelled_error() {
    let error = Error::Cancelled(RunSummary::new("risk", vec![], Some(Stage::Stage1)));
    let error_str = format!("{error}");
    assert!(error_str.starts_with("Run cancelled"));
    assert!(error_str.contains("Completed stages: none"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_other_error() {
    let error = Error::Other("custom error message".to_string());
    let error_str = format!("{error}");
    assert_eq!(error_str, "custom error message");
}

// ============================================================================
// EvaluationError
// ============================================================================

#[test]
fn test_evaluation_error_from_anyhow() {
    let error: EvaluationError = anyhow::anyhow!("engine crashed").context("backtest").into();
    let error_str = format!("{error}");
    assert!(error_str.contains("Engine failed"));
    assert!(error_str.contains("engine crashed"));
}

#[test]
fn test_evaluation_error_messages() {
    let error = EvaluationError::InsufficientTrades { trades: 3, required: 10 };
    assert_eq!(format!("{error}"), "Insufficient trades: 3 < 10");

    let error = EvaluationError::Timeout(Duration::from_secs(5));
    assert!(format!("{error}").contains("5s"));

    let error = EvaluationError::NonFiniteScore(f64::NAN);
    assert!(format!("{error}").contains("non-finite"));
}

#[test]
fn test_result_type_alias() {
    #[allow(clippy::unnecessary_wraps)]
    fn returns_result() -> hybrid_optimizer::Result<i32> {
        Ok(42)
    }

    let result = returns_result();
    assert!(result.is_ok());
    assert_eq!(result.unwrap(), 42);
}
