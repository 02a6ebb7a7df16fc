//! # Hybrid Optimizer: Staged Multi-Fidelity Parameter Search
//!
//! **Version**: 0.1.0
//!
//! Searches a strategy's parameter space in three stages of increasing cost
//! and fidelity, promoting only the top candidates of each stage to the next:
//!
//! ```text
//! Stage 1: cheap proxy, N₁ sampled trials (parallel)
//!     ↓ top K₁
//! Stage 2: lightweight backtest, K₁ trials (sequential)
//!     ↓ top K₂
//! Stage 3: full backtest, K₂ trials (sequential) → FinalResult
//!     ↓
//! ResultAggregator → destination configuration
//! ```
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Muda elimination**: expensive evaluations only see promoted candidates
//! - **Poka-Yoke safety**: invalid vectors are rejected before any evaluation
//! - **Genchi Genbutsu**: rank agreement between the proxy and the full
//!   backtest is measured, not assumed
//! - **Jidoka**: every stage is checkpointed; persistence faults stop the run
//!   without touching earlier checkpoints
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use hybrid_optimizer::checkpoint::MemoryCheckpointStore;
//! use hybrid_optimizer::evaluator::SimulationEvaluator;
//! use hybrid_optimizer::{HybridOptimizer, OptimizerConfig, ParameterSchema, StageEvaluators};
//!
//! # fn main() -> hybrid_optimizer::Result<()> {
//! let config = OptimizerConfig::builder()
//!     .phase(ParameterSchema::Strategy)
//!     .trials(40, 8, 3)
//!     .seed(7)
//!     .build()?;
//! let proxy = Arc::new(SimulationEvaluator::for_schema(ParameterSchema::Strategy, 7));
//! let evaluators = StageEvaluators::new(proxy.clone(), proxy.clone(), proxy);
//!
//! let mut optimizer = HybridOptimizer::new(config, evaluators, Arc::new(MemoryCheckpointStore::new()))?;
//! let best = optimizer.run()?;
//! println!("best {} with {:?}", best.best_value(), best.best_params());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregator;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod dotted;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod orchestrator;
pub mod outcome;
pub mod params;
pub mod runner;
pub mod sampler;
pub mod schema;
pub mod selector;
pub mod trial;
pub mod validator;

pub use aggregator::{IntegrationReport, ResultAggregator};
pub use cancel::CancellationToken;
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::OptimizerConfig;
pub use error::{Error, EvaluationError, Result};
pub use evaluator::{EvalContext, Fidelity, ObjectiveEvaluator};
pub use orchestrator::{HybridOptimizer, OptimizerState, StageEvaluators};
pub use outcome::{FinalResult, RunSummary};
pub use params::{ParamRange, ParamValue, ParameterVector, SearchSpace};
pub use runner::StageRunner;
pub use schema::ParameterSchema;
pub use selector::{select_top_k, CandidateSet};
pub use trial::{Stage, StageResult, TrialRecord};
pub use validator::ParameterValidator;
