//! Grader - sandboxed run execution engine
//!
//! Stages a test's files and a submission's files into a private working
//! directory, builds, tests, and records one terminal `Run`:
//! - `sandbox`: process-group execution under hard limits
//! - `stager`: working-directory assembly
//! - `builder` / `tester`: the pluggable build and test stages
//! - `engine`: the run state machine
//! - `pool`: bounded asynchronous execution with polling

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod pool;
pub mod reporter;
pub mod sandbox;
pub mod stager;
pub mod storage;
pub mod tester;

pub use config::GraderConfig;
pub use engine::RunEngine;
pub use models::{Run, RunRequest, RunStatus};
pub use pool::{RunHandle, WorkerPool};
