//! Background daemon for the roadmap agent orchestrator.
//!
//! - Scheduling loop: interval ticks plus commands from the dashboard
//! - Patrol sweeps reporting stalled runs and progress
//! - HTTP API and status presentation for the dashboard

pub mod api_error;
pub mod daemon;
pub mod http_api;
pub mod patrol;
pub mod presentation;
pub mod shutdown;
