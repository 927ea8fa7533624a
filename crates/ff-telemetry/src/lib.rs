//! Observability setup shared by the orchestrator binaries.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Tracing**: run and request spans carrying generated correlation ids

pub mod logging;
pub mod tracing_setup;
