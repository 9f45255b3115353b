//! Atomic operation pipeline
//!
//! Turns free-form directives into classified, verified, recorded and
//! reversible operations:
//! - Feature extraction and rule-based classification into a
//!   destination/consumer/semantics triple
//! - A SQLite ledger with compare-and-set status transitions
//! - Five verification layers gating every execution
//! - File, process and sandboxed script executors with backups and undo
//! - Multi-channel feedback and periodic learning metrics
//!
//! # Example
//!
//! ```ignore
//! use atomic_ops::{Config, Pipeline, SubmitRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::open(Config::load()?).await?;
//!     let response = pipeline.submit(SubmitRequest::new("show memory usage", "alice")).await?;
//!     println!("{} -> {}", response.operation_id, response.status);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod types;
pub mod error;
pub mod config;
pub mod features;
pub mod classifier;
pub mod ledger;

// Pipeline stages
pub mod verification;
pub mod execution;
pub mod feedback;
pub mod learning;
pub mod pipeline;
pub mod cli;

pub use classifier::{ClassificationOutcome, Classifier, ClassifierStrategy, RuleClassifier};
pub use config::Config;
pub use error::{FeedbackError, PipelineError, PipelineResult, UndoError};
pub use execution::{ExecutionEngine, ExecutionPlan, ExecutionRecord, ExecutorKind};
pub use features::{FeatureExtractor, FeatureRecord, RequestContext};
pub use feedback::{FeedbackCollector, FeedbackPayload, FeedbackSummary};
pub use learning::{LearningLoop, LearningMetricSnapshot, LearningRunner};
pub use ledger::Ledger;
pub use pipeline::{OperationView, Pipeline, SubmitRequest, SubmitResponse, UndoReport};
pub use types::{Classification, Consumer, Destination, Operation, OperationStatus, Semantics};
pub use verification::{VerificationEngine, VerificationReport, VerificationResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
