//! Trial tracking schema
//!
//! ## Schema Overview
//!
//! ```text
//! StageResult (1 per stage) ──< TrialRecord (N)
//!                                    │
//!                                    └──< LineageEntry (0..2) [prior-stage scores]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use hybrid_optimizer::params::ParameterVector;
//! use hybrid_optimizer::trial::{Stage, StageResult, TrialRecord};
//!
//! let mut builder = StageResult::builder(Stage::Stage1);
//! builder.push(TrialRecord::complete(
//!     0,
//!     Stage::Stage1,
//!     ParameterVector::new().with("risk.kelly.fraction", 0.4),
//!     1.2,
//!     Duration::from_millis(3),
//! ));
//! let result = builder.build(Duration::from_millis(3));
//! assert_eq!(result.best().map(TrialRecord::trial_id), Some(0));
//! ```

mod record;
mod stage_result;

pub use record::{FailureReason, LineageEntry, Stage, TrialRecord, TrialStatus, SENTINEL_SCORE};
pub use stage_result::{rank_order, StageResult, StageResultBuilder, StageSummary};
