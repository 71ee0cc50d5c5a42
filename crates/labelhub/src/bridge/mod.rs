//! IPC bridge between the orchestrator and its child processes.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerEvent, ExperimentInit, ExperimentEvent)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
