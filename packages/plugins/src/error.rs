// ABOUTME: Error type returned by plugin hooks
// ABOUTME: Keeps malformed-payload errors distinct so they can be reported to the task author

use hatch_runtime::MalformedPayloadError;
use hatch_sandbox::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayloadError),

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", format_multiple(.0))]
    Multiple(Vec<PluginError>),

    #[error("Plugin error: {0}")]
    Internal(String),
}

fn format_multiple(errors: &[PluginError]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} plugin errors: {}", errors.len(), messages.join("; "))
}

impl From<EngineError> for PluginError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::MalformedPayload(e) => PluginError::MalformedPayload(e),
            other => PluginError::Engine(other),
        }
    }
}

impl PluginError {
    pub fn is_malformed_payload(&self) -> bool {
        matches!(self, PluginError::MalformedPayload(_))
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// Combine the errors of plugins run side by side.
///
/// When every error is a malformed payload they become one malformed
/// payload listing all issues. Otherwise the task has an infrastructure
/// problem and the non-malformed errors win.
pub fn merge_errors(errors: Vec<PluginError>) -> Option<PluginError> {
    if errors.len() <= 1 {
        return errors.into_iter().next();
    }
    if errors.iter().all(PluginError::is_malformed_payload) {
        let malformed = errors.into_iter().filter_map(|e| match e {
            PluginError::MalformedPayload(m) => Some(m),
            _ => None,
        });
        return Some(PluginError::MalformedPayload(MalformedPayloadError::merge(malformed)));
    }

    let mut rest: Vec<PluginError> = errors
        .into_iter()
        .filter(|e| !e.is_malformed_payload())
        .collect();
    if rest.len() == 1 {
        rest.pop()
    } else {
        Some(PluginError::Multiple(rest))
    }
}
