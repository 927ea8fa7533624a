//! Orchestration core: task store, agent registry, execution log, dependency
//! resolver and execution coordinator, bundled behind [`Orchestrator`].

pub mod coordinator;
pub mod error;
pub mod log_sink;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod slot;
pub mod task_store;
pub mod worker;

pub use coordinator::{ExecutionCoordinator, RecoveryReport, RunReport, Started};
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use registry::AcquireMode;
pub use worker::{CommandWorker, WorkOutcome, WorkRequest, Worker, WorkerError};
