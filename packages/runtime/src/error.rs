// ABOUTME: Error types shared by engines, plugins and the task runner
// ABOUTME: Malformed-payload issue lists, schema conflicts and resource acquisition failures

use std::fmt;
use thiserror::Error;

/// Task input did not satisfy what the engine or a plugin expects.
///
/// Carries every issue found so the whole list can be surfaced to the
/// task log at once instead of one problem per run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MalformedPayloadError {
    issues: Vec<String>,
}

impl MalformedPayloadError {
    pub fn new(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }

    pub fn from_issues(issues: Vec<String>) -> Self {
        Self { issues }
    }

    /// Join several errors into one, preserving issue order.
    pub fn merge<I>(errors: I) -> Self
    where
        I: IntoIterator<Item = MalformedPayloadError>,
    {
        let issues = errors.into_iter().flat_map(|e| e.issues).collect();
        Self { issues }
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }
}

impl fmt::Display for MalformedPayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.issues.as_slice() {
            [] => write!(f, "malformed payload"),
            [single] => write!(f, "malformed payload: {}", single),
            many => {
                write!(f, "malformed payload ({} issues)", many.len())?;
                for issue in many {
                    write!(f, "\n  - {}", issue)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MalformedPayloadError {}

/// Two payload schemas declare the same property differently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("conflicting payload schemas for property '{property}'")]
pub struct SchemaConflict {
    pub property: String,
}

/// Failure to obtain a shared resource from a [`crate::ResourceCache`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Failed to fetch resource {key}: {reason}")]
    Fetch { key: String, reason: String },

    #[error("Timeout fetching resource {key} after {seconds}s")]
    Timeout { key: String, seconds: u64 },

    #[error("Resource resolution for {key} ended without a result")]
    Abandoned { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_every_issue_in_order() {
        let merged = MalformedPayloadError::merge(vec![
            MalformedPayloadError::new("first"),
            MalformedPayloadError::from_issues(vec!["second".into(), "third".into()]),
        ]);
        assert_eq!(merged.issues(), &["first", "second", "third"]);
    }

    #[test]
    fn test_display_single_and_many() {
        let single = MalformedPayloadError::new("image is required");
        assert_eq!(single.to_string(), "malformed payload: image is required");

        let many = MalformedPayloadError::from_issues(vec!["a".into(), "b".into()]);
        let text = many.to_string();
        assert!(text.starts_with("malformed payload (2 issues)"));
        assert!(text.contains("  - a"));
        assert!(text.contains("  - b"));
    }
}
