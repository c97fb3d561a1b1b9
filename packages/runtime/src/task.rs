// ABOUTME: Task identity, final outcome and the per-task context handed to engines and plugins
// ABOUTME: The task log is append-only, optionally mirrored to a file and closed exactly once

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::warn;

/// Identifies one run of one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: String,
    pub run_id: u32,
}

impl TaskInfo {
    pub fn new(task_id: impl Into<String>, run_id: u32) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
        }
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.run_id)
    }
}

/// Why a task ended without a success/failure verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionReason {
    /// The task payload was rejected.
    MalformedPayload,
    /// Infrastructure failure (image pull, backend error, plugin crash).
    InternalError,
    /// The engine had no free admission slot; the task never started.
    WorkerCapacity,
    /// The run was stopped by the host before it produced a result.
    Canceled,
}

impl fmt::Display for ExceptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExceptionReason::MalformedPayload => "malformed-payload",
            ExceptionReason::InternalError => "internal-error",
            ExceptionReason::WorkerCapacity => "worker-capacity",
            ExceptionReason::Canceled => "canceled",
        };
        f.write_str(text)
    }
}

/// The single reported result of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum TaskOutcome {
    Success,
    Failed,
    Exception(ExceptionReason),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Task log is already closed")]
    Closed,

    #[error("Task log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct LogState {
    buffer: Vec<u8>,
    file: Option<BufWriter<File>>,
    closed: bool,
}

/// Per-task state shared between the task runner, the engine and plugins.
///
/// Cloning is cheap and every clone writes to the same task log.
#[derive(Clone)]
pub struct TaskContext {
    info: TaskInfo,
    log: Arc<Mutex<LogState>>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("info", &self.info)
            .field("log_closed", &self.is_log_closed())
            .finish()
    }
}

impl TaskContext {
    /// Context whose log lives in memory only.
    pub fn new(info: TaskInfo) -> Self {
        Self {
            info,
            log: Arc::new(Mutex::new(LogState {
                buffer: Vec::new(),
                file: None,
                closed: false,
            })),
        }
    }

    /// Context whose log is also mirrored to `path`.
    pub fn with_log_file(info: TaskInfo, path: &Path) -> Result<Self, LogError> {
        let file = File::create(path)?;
        let context = Self::new(info);
        context.state().file = Some(BufWriter::new(file));
        Ok(context)
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append raw bytes to the task log. Writes after close are dropped.
    pub fn write_log(&self, data: &[u8]) {
        let mut state = self.state();
        if state.closed {
            warn!("Dropping {} bytes written to closed log of task {}", data.len(), self.info);
            return;
        }
        state.buffer.extend_from_slice(data);
        if let Some(file) = state.file.as_mut() {
            if let Err(e) = file.write_all(data) {
                warn!("Failed to mirror task log of {}: {}", self.info, e);
            }
        }
    }

    /// Append one timestamped line to the task log.
    pub fn log(&self, message: impl AsRef<str>) {
        let line = format!(
            "[hatch {}] {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            message.as_ref()
        );
        self.write_log(line.as_bytes());
    }

    /// Close the log, flushing the mirror file. Fails if already closed.
    pub fn close_log(&self) -> Result<(), LogError> {
        let mut state = self.state();
        if state.closed {
            return Err(LogError::Closed);
        }
        state.closed = true;
        if let Some(mut file) = state.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn is_log_closed(&self) -> bool {
        self.state().closed
    }

    /// Everything written to the log so far.
    pub fn log_contents(&self) -> String {
        String::from_utf8_lossy(&self.state().buffer).into_owned()
    }
}
