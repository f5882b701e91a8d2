pub mod config;
pub mod demo;
mod errors;
mod processor;
mod supervisor;
mod worker;

pub use errors::WorkerError;
pub use processor::TaskProcessor;
pub use supervisor::{ConnectionState, LoopPhase, WorkerHandle, WorkerStatus};
pub use worker::{Worker, WorkerSettings, DEFAULT_POLL_INTERVAL, DEFAULT_RECONNECT_INTERVAL};
