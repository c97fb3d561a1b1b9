// ABOUTME: Task runner for the hatch worker
// ABOUTME: Stage machine per task run, concurrent execution with backpressure retry, env configuration

pub mod config;
pub mod stage;
pub mod taskrun;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, EngineKind, WorkerConfig};
pub use stage::Stage;
pub use taskrun::{TaskRun, TaskRunError, TaskRunHandle};
pub use worker::{CapacityRetry, TaskDefinition, Worker, WorkerError};
