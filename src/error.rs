//! Error types for the hybrid optimizer
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Two layers:
//! - [`EvaluationError`]: trial-level faults. Always absorbed at the trial
//!   boundary and recorded as a failed trial, never propagated out of a stage.
//! - [`Error`]: stage- and run-level faults (persistence, configuration,
//!   integration) that escalate to the orchestrator or the caller.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::OptimizerState;
use crate::outcome::RunSummary;
use crate::trial::Stage;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Hybrid optimizer error types
#[derive(Error, Debug)]
pub enum Error {
    /// Optimizer configuration is inconsistent
    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),

    /// Caller passed an argument the operation cannot work with
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Checkpoint or result artifact could not be written or read
    #[error("Persistence failed for {path}: {source}\nResumability for the current stage cannot be guaranteed")]
    Persistence {
        /// Artifact path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint save would drop trials recorded by an earlier save
    #[error("Checkpoint conflict for {phase}/{stage}: {reason}\nUse a forced re-run to replace a completed stage")]
    CheckpointConflict {
        /// Phase name
        phase: String,
        /// Stage whose checkpoint conflicts
        stage: Stage,
        /// What was wrong
        reason: String,
    },

    /// Final configuration integration failed; the destination was left untouched
    #[error("Configuration integration failed: {reason}\nDestination untouched. Parameters not applied: {unapplied:?}")]
    Integration {
        /// What went wrong
        reason: String,
        /// Dotted keys that were not applied
        unapplied: Vec<String>,
    },

    /// The orchestrator was asked to move between incompatible states
    #[error("Invalid optimizer state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: OptimizerState,
        /// Requested state
        to: OptimizerState,
    },

    /// A stage produced no trial eligible for promotion
    #[error("No viable trials in {stage}: every trial failed or was rejected by the validator")]
    NoViableTrials {
        /// Stage that produced nothing usable
        stage: Stage,
    },

    /// A stage failed; earlier checkpoints are intact
    #[error("{summary}\nCause: {source}")]
    StageFailed {
        /// Structured summary with resume instruction
        summary: RunSummary,
        /// Error that stopped the stage
        #[source]
        source: Box<Error>,
    },

    /// The run was interrupted; completed trials were checkpointed
    #[error("Run cancelled\n{0}")]
    Cancelled(RunSummary),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Trial-level evaluation failure.
///
/// Caught by the stage runner and converted into a failed trial carrying the
/// sentinel score.
#[derive(Error, Debug)]
pub enum EvaluationError {
    /// External engine (backtest, model training) reported a fault
    #[error("Engine failed: {0:#}")]
    Engine(anyhow::Error),

    /// Parameters or engine output were unusable
    #[error("Invalid evaluation data: {0}")]
    InvalidData(String),

    /// Backtest produced too few trades for a trustworthy score
    #[error("Insufficient trades: {trades} < {required}")]
    InsufficientTrades {
        /// Trades executed
        trades: u64,
        /// Minimum required
        required: u64,
    },

    /// Evaluator returned NaN or infinity
    #[error("Evaluator returned a non-finite score: {0}")]
    NonFiniteScore(f64),

    /// Per-trial configuration file could not be written
    #[error("Failed to write trial configuration: {0}")]
    ConfigWrite(#[source] std::io::Error),

    /// Evaluator exceeded its time budget
    #[error("Evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// Evaluator panicked
    #[error("Evaluator panicked: {0}")]
    Panicked(String),

    /// Worker thread could not be started
    #[error("Failed to spawn evaluation worker: {0}")]
    Spawn(String),
}

impl From<anyhow::Error> for EvaluationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Engine(err)
    }
}
